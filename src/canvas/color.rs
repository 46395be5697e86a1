//! CSS color strings.

/// Straight (not premultiplied) RGBA with components in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const BLACK: Color = Color::rgba(0.0, 0.0, 0.0, 1.0);
    pub const TRANSPARENT: Color = Color::rgba(0.0, 0.0, 0.0, 0.0);

    pub const fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Premultiplied components after scaling alpha by `alpha`.
    pub fn premultiplied(&self, alpha: f32) -> [f32; 4] {
        let a = (self.a * alpha).clamp(0.0, 1.0);
        [self.r * a, self.g * a, self.b * a, a]
    }

    /// Serialize the way a Canvas2D context reports its styles.
    pub fn to_css(&self) -> String {
        let byte = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        if self.a >= 1.0 {
            format!("#{:02x}{:02x}{:02x}", byte(self.r), byte(self.g), byte(self.b))
        } else {
            let alpha = (self.a * 1000.0).round() / 1000.0;
            format!("rgba({}, {}, {}, {})", byte(self.r), byte(self.g), byte(self.b), alpha)
        }
    }
}

/// Parse a CSS color. Returns `None` for anything unrecognized.
pub fn parse_color(input: &str) -> Option<Color> {
    let s = input.trim().to_ascii_lowercase();
    if let Some(hex) = s.strip_prefix('#') {
        return parse_hex(hex);
    }
    if let Some((func, args)) = s.strip_suffix(')').and_then(|s| s.split_once('(')) {
        let args: Vec<&str> = args
            .split(|c: char| c == ',' || c == '/' || c.is_whitespace())
            .filter(|a| !a.is_empty())
            .collect();
        return match func.trim() {
            "rgb" | "rgba" => parse_rgb(&args),
            "hsl" | "hsla" => parse_hsl(&args),
            _ => None,
        };
    }
    named(&s)
}

fn parse_hex(hex: &str) -> Option<Color> {
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let nibble = |i: usize| u8::from_str_radix(&hex[i..i + 1], 16).ok().map(|v| v * 17);
    let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    let (r, g, b, a) = match hex.len() {
        3 => (nibble(0)?, nibble(1)?, nibble(2)?, 255),
        4 => (nibble(0)?, nibble(1)?, nibble(2)?, nibble(3)?),
        6 => (byte(0)?, byte(2)?, byte(4)?, 255),
        8 => (byte(0)?, byte(2)?, byte(4)?, byte(6)?),
        _ => return None,
    };
    Some(from_bytes(r, g, b, a))
}

fn from_bytes(r: u8, g: u8, b: u8, a: u8) -> Color {
    Color::rgba(
        f32::from(r) / 255.0,
        f32::from(g) / 255.0,
        f32::from(b) / 255.0,
        f32::from(a) / 255.0,
    )
}

/// A channel as `0..=255` or a percentage.
fn channel(arg: &str) -> Option<f32> {
    let value = match arg.strip_suffix('%') {
        Some(pct) => pct.parse::<f32>().ok()? / 100.0,
        None => arg.parse::<f32>().ok()? / 255.0,
    };
    Some(value.clamp(0.0, 1.0))
}

/// Alpha as `0..=1` or a percentage. Missing means opaque.
fn alpha(arg: Option<&&str>) -> Option<f32> {
    let Some(arg) = arg else {
        return Some(1.0);
    };
    let value = match arg.strip_suffix('%') {
        Some(pct) => pct.parse::<f32>().ok()? / 100.0,
        None => arg.parse::<f32>().ok()?,
    };
    Some(value.clamp(0.0, 1.0))
}

fn parse_rgb(args: &[&str]) -> Option<Color> {
    if args.len() != 3 && args.len() != 4 {
        return None;
    }
    Some(Color::rgba(
        channel(args[0])?,
        channel(args[1])?,
        channel(args[2])?,
        alpha(args.get(3))?,
    ))
}

fn parse_hsl(args: &[&str]) -> Option<Color> {
    if args.len() != 3 && args.len() != 4 {
        return None;
    }
    let hue = args[0].trim_end_matches("deg").parse::<f32>().ok()?;
    let saturation = args[1].strip_suffix('%')?.parse::<f32>().ok()? / 100.0;
    let lightness = args[2].strip_suffix('%')?.parse::<f32>().ok()? / 100.0;
    let (r, g, b) = hsl_to_rgb(
        hue.rem_euclid(360.0) / 360.0,
        saturation.clamp(0.0, 1.0),
        lightness.clamp(0.0, 1.0),
    );
    Some(Color::rgba(r, g, b, alpha(args.get(3))?))
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    let hue = |mut t: f32| {
        if t < 0.0 {
            t += 1.0;
        }
        if t > 1.0 {
            t -= 1.0;
        }
        if t < 1.0 / 6.0 {
            p + (q - p) * 6.0 * t
        } else if t < 0.5 {
            q
        } else if t < 2.0 / 3.0 {
            p + (q - p) * (2.0 / 3.0 - t) * 6.0
        } else {
            p
        }
    };
    (hue(h + 1.0 / 3.0), hue(h), hue(h - 1.0 / 3.0))
}

fn named(name: &str) -> Option<Color> {
    let (r, g, b) = match name {
        "transparent" => return Some(Color::TRANSPARENT),
        "black" => (0, 0, 0),
        "white" => (255, 255, 255),
        "red" => (255, 0, 0),
        "lime" => (0, 255, 0),
        "green" => (0, 128, 0),
        "blue" => (0, 0, 255),
        "yellow" => (255, 255, 0),
        "cyan" | "aqua" => (0, 255, 255),
        "magenta" | "fuchsia" => (255, 0, 255),
        "gray" | "grey" => (128, 128, 128),
        "silver" => (192, 192, 192),
        "maroon" => (128, 0, 0),
        "olive" => (128, 128, 0),
        "purple" => (128, 0, 128),
        "teal" => (0, 128, 128),
        "navy" => (0, 0, 128),
        "orange" => (255, 165, 0),
        "gold" => (255, 215, 0),
        "pink" => (255, 192, 203),
        "hotpink" => (255, 105, 180),
        "deeppink" => (255, 20, 147),
        "crimson" => (220, 20, 60),
        "coral" => (255, 127, 80),
        "tomato" => (255, 99, 71),
        "orangered" => (255, 69, 0),
        "darkorange" => (255, 140, 0),
        "violet" => (238, 130, 238),
        "indigo" => (75, 0, 130),
        "darkgray" | "darkgrey" => (169, 169, 169),
        "lightgray" | "lightgrey" => (211, 211, 211),
        "dimgray" | "dimgrey" => (105, 105, 105),
        "darkblue" => (0, 0, 139),
        "darkgreen" => (0, 100, 0),
        "darkred" => (139, 0, 0),
        "skyblue" => (135, 206, 235),
        "deepskyblue" => (0, 191, 255),
        "dodgerblue" => (30, 144, 255),
        "limegreen" => (50, 205, 50),
        "chartreuse" => (127, 255, 0),
        "springgreen" => (0, 255, 127),
        "turquoise" => (64, 224, 208),
        "khaki" => (240, 230, 140),
        "beige" => (245, 245, 220),
        "brown" => (165, 42, 42),
        "chocolate" => (210, 105, 30),
        _ => return None,
    };
    Some(from_bytes(r, g, b, 255))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(color: Color, expected: [f32; 4]) {
        let got = [color.r, color.g, color.b, color.a];
        for (g, e) in got.iter().zip(expected) {
            assert!((g - e).abs() < 1e-3, "{got:?} != {expected:?}");
        }
    }

    #[test]
    fn red_in_hex_rgb_and_rgba() {
        approx(parse_color("#FF0000").unwrap(), [1.0, 0.0, 0.0, 1.0]);
        approx(parse_color("rgb(255,0,0)").unwrap(), [1.0, 0.0, 0.0, 1.0]);
        approx(parse_color("rgba(255,0,0,0.5)").unwrap(), [1.0, 0.0, 0.0, 0.5]);
    }

    #[test]
    fn short_hex_and_hex_alpha() {
        approx(parse_color("#0f0").unwrap(), [0.0, 1.0, 0.0, 1.0]);
        approx(parse_color("#0000ff80").unwrap(), [0.0, 0.0, 1.0, 128.0 / 255.0]);
        approx(parse_color("#fff8").unwrap(), [1.0, 1.0, 1.0, 136.0 / 255.0]);
    }

    #[test]
    fn hsl_forms() {
        approx(parse_color("hsl(120, 100%, 50%)").unwrap(), [0.0, 1.0, 0.0, 1.0]);
        approx(parse_color("hsla(240, 100%, 50%, 0.25)").unwrap(), [0.0, 0.0, 1.0, 0.25]);
        approx(parse_color("hsl(0, 0%, 50%)").unwrap(), [0.5, 0.5, 0.5, 1.0]);
    }

    #[test]
    fn names_spaces_and_garbage() {
        approx(parse_color("  Orange ").unwrap(), [1.0, 165.0 / 255.0, 0.0, 1.0]);
        approx(parse_color("transparent").unwrap(), [0.0, 0.0, 0.0, 0.0]);
        approx(parse_color("rgb(255 0 0 / 50%)").unwrap(), [1.0, 0.0, 0.0, 0.5]);
        assert!(parse_color("#12").is_none());
        assert!(parse_color("#gggggg").is_none());
        assert!(parse_color("rgb(1,2)").is_none());
        assert!(parse_color("notacolor").is_none());
        assert!(parse_color("").is_none());
    }

    #[test]
    fn premultiplies_with_global_alpha() {
        let color = parse_color("rgba(255, 0, 0, 0.5)").unwrap();
        assert_eq!(color.premultiplied(0.5), [0.25, 0.0, 0.0, 0.25]);
    }

    #[test]
    fn css_serialization() {
        assert_eq!(parse_color("red").unwrap().to_css(), "#ff0000");
        assert_eq!(parse_color("rgba(0,0,255,0.5)").unwrap().to_css(), "rgba(0, 0, 255, 0.5)");
    }
}
