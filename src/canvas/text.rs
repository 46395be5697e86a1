//! CSS font strings, font lookup and CPU text rasterization.

use ab_glyph::{Font, FontRef, GlyphId, OutlineCurve, PxScale, ScaleFont};
use fontdb::{Database, Family, Query, Stretch, Style, Weight, ID};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

const DEFAULT_FONT_SIZE: f32 = 10.0;
const EM_PX: f32 = 16.0;

/// Parsed `font` shorthand, e.g. `"bold 16px 'Press Start 2P', monospace"`.
#[derive(Debug, Clone, PartialEq)]
pub struct FontSpec {
    pub italic: bool,
    pub weight: u16,
    pub size: f32,
    pub families: Vec<String>,
}

impl Default for FontSpec {
    fn default() -> Self {
        Self {
            italic: false,
            weight: 400,
            size: DEFAULT_FONT_SIZE,
            families: vec!["sans-serif".to_string()],
        }
    }
}

impl FontSpec {
    /// Parse a CSS font shorthand. Style and weight keywords must come before the size.
    pub fn parse(input: &str) -> Option<FontSpec> {
        let mut spec = FontSpec {
            families: Vec::new(),
            ..FontSpec::default()
        };
        let mut rest = input.trim();
        loop {
            let (token, remainder) = rest
                .split_once(char::is_whitespace)
                .map(|(t, r)| (t, r.trim_start()))
                .unwrap_or((rest, ""));
            if token.is_empty() {
                return None;
            }
            if let Some(size) = parse_size(token) {
                spec.size = size;
                rest = remainder;
                break;
            }
            match token.to_ascii_lowercase().as_str() {
                "normal" | "small-caps" => {}
                "italic" | "oblique" => spec.italic = true,
                "bold" | "bolder" => spec.weight = 700,
                "lighter" => spec.weight = 300,
                other => spec.weight = other.parse::<u16>().ok().filter(|w| (1..=1000).contains(w))?,
            }
            rest = remainder;
        }

        // A spaced line height: "16px / 20px sans-serif".
        if let Some(after_slash) = rest.strip_prefix('/') {
            rest = after_slash
                .trim_start()
                .split_once(char::is_whitespace)
                .map_or("", |(_, r)| r);
        }

        spec.families = rest
            .split(',')
            .map(|f| f.trim().trim_matches(|c| c == '"' || c == '\'').trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();
        if spec.families.is_empty() {
            return None;
        }
        Some(spec)
    }
}

/// Size in pixels from `12px`, `9pt`, `1.5em`, `120%`. A `/line-height` suffix is ignored.
fn parse_size(token: &str) -> Option<f32> {
    let token = token.split('/').next()?;
    let (number, factor) = if let Some(v) = token.strip_suffix("px") {
        (v, 1.0)
    } else if let Some(v) = token.strip_suffix("pt") {
        (v, 4.0 / 3.0)
    } else if let Some(v) = token.strip_suffix("rem").or_else(|| token.strip_suffix("em")) {
        (v, EM_PX)
    } else if let Some(v) = token.strip_suffix('%') {
        (v, EM_PX / 100.0)
    } else {
        return None;
    };
    let value = number.parse::<f32>().ok()? * factor;
    (value.is_finite() && value > 0.0).then_some(value)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TextAlign {
    #[default]
    Start,
    End,
    Left,
    Right,
    Center,
}

impl TextAlign {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "start" => Some(Self::Start),
            "end" => Some(Self::End),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            "center" => Some(Self::Center),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Left => "left",
            Self::Right => "right",
            Self::Center => "center",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TextBaseline {
    Top,
    Hanging,
    Middle,
    #[default]
    Alphabetic,
    Ideographic,
    Bottom,
}

impl TextBaseline {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "top" => Some(Self::Top),
            "hanging" => Some(Self::Hanging),
            "middle" => Some(Self::Middle),
            "alphabetic" => Some(Self::Alphabetic),
            "ideographic" => Some(Self::Ideographic),
            "bottom" => Some(Self::Bottom),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Top => "top",
            Self::Hanging => "hanging",
            Self::Middle => "middle",
            Self::Alphabetic => "alphabetic",
            Self::Ideographic => "ideographic",
            Self::Bottom => "bottom",
        }
    }
}

/// Horizontal metrics of a run plus the font's vertical extent. `descent` is positive below the baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TextMetrics {
    pub width: f32,
    pub ascent: f32,
    pub descent: f32,
}

/// Offset from the `(x, y)` passed to `fill_text` to the pen start on the baseline (left-to-right text).
pub fn anchor_offset(align: TextAlign, baseline: TextBaseline, metrics: &TextMetrics) -> (f32, f32) {
    let dx = match align {
        TextAlign::Start | TextAlign::Left => 0.0,
        TextAlign::End | TextAlign::Right => -metrics.width,
        TextAlign::Center => -metrics.width / 2.0,
    };
    let dy = match baseline {
        TextBaseline::Top | TextBaseline::Hanging => metrics.ascent,
        TextBaseline::Middle => (metrics.ascent - metrics.descent) / 2.0,
        TextBaseline::Alphabetic => 0.0,
        TextBaseline::Ideographic | TextBaseline::Bottom => -metrics.descent,
    };
    (dx, dy)
}

/// Font faces the canvas can draw with. A face is parsed on first use and kept by id.
pub struct FontDatabase {
    db: Database,
    loaded: Mutex<HashMap<ID, Option<LoadedFont>>>,
}

impl Default for FontDatabase {
    fn default() -> Self {
        Self::empty()
    }
}

impl FontDatabase {
    /// System fonts.
    pub fn new() -> Self {
        let mut fonts = Self::empty();
        fonts.db.load_system_fonts();
        info!("Loaded {} system fonts", fonts.db.len());
        fonts
    }

    /// A database with no faces. Text drawn with it is a no-op.
    pub fn empty() -> Self {
        Self {
            db: Database::new(),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn load_font_file(&mut self, path: &Path) -> std::io::Result<()> {
        self.db.load_font_file(path)
    }

    pub fn load_font_data(&mut self, data: Vec<u8>) {
        self.db.load_font_data(data);
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    /// Face for `spec`: a fontdb query over its families, then a plain name match, then any face.
    pub fn resolve(&self, spec: &FontSpec) -> Option<ID> {
        let families: Vec<Family> = spec.families.iter().map(|f| generic_family(f)).collect();
        let query = Query {
            families: &families,
            weight: Weight(spec.weight),
            stretch: Stretch::Normal,
            style: if spec.italic { Style::Italic } else { Style::Normal },
        };
        let named = || {
            spec.families.iter().find_map(|wanted| {
                self.db
                    .faces()
                    .find(|face| face.families.iter().any(|(name, _)| name.eq_ignore_ascii_case(wanted)))
                    .map(|face| face.id)
            })
        };
        self.db
            .query(&query)
            .or_else(named)
            .or_else(|| self.db.faces().next().map(|face| face.id))
    }

    /// Parsed face for `spec`, or `None` when no usable font exists.
    pub fn font_for(&self, spec: &FontSpec) -> Option<LoadedFont> {
        let id = self.resolve(spec)?;
        let mut loaded = self.loaded.lock().ok()?;
        loaded.entry(id).or_insert_with(|| self.parse_face(id)).clone()
    }

    fn parse_face(&self, id: ID) -> Option<LoadedFont> {
        let font = self
            .db
            .with_face_data(id, |data, index| {
                FontRef::try_from_slice_and_index(data, index).ok()?;
                Some(LoadedFont {
                    data: Arc::new(data.to_vec()),
                    index,
                })
            })
            .flatten();
        if font.is_none() {
            warn!("Font face {:?} is unreadable, skipping it", id);
        }
        font
    }
}

fn generic_family(name: &str) -> Family<'_> {
    match name.to_ascii_lowercase().as_str() {
        "serif" => Family::Serif,
        "sans-serif" | "system-ui" => Family::SansSerif,
        "monospace" => Family::Monospace,
        "cursive" => Family::Cursive,
        "fantasy" => Family::Fantasy,
        _ => Family::Name(name),
    }
}

/// Font bytes known to parse.
#[derive(Clone)]
pub struct LoadedFont {
    data: Arc<Vec<u8>>,
    index: u32,
}

impl LoadedFont {
    fn font(&self) -> Option<FontRef<'_>> {
        FontRef::try_from_slice_and_index(&self.data, self.index).ok()
    }

    pub fn measure(&self, text: &str, size: f32) -> TextMetrics {
        let Some(font) = self.font() else {
            return TextMetrics::default();
        };
        let scaled = font.as_scaled(PxScale::from(size));
        TextMetrics {
            width: layout(&scaled, text).1,
            ascent: scaled.ascent(),
            descent: -scaled.descent(),
        }
    }

    /// Rasterize `text` in white. `stroke` draws outlines of that width instead of filling.
    pub fn rasterize(&self, text: &str, size: f32, stroke: Option<f32>) -> Option<TextBitmap> {
        let font = self.font()?;
        let scaled = font.as_scaled(PxScale::from(size));
        let (glyphs, width) = layout(&scaled, text);
        let (sx, sy) = (scaled.h_scale_factor(), scaled.v_scale_factor());

        let pad = stroke.map_or(1.0, |w| w / 2.0 + 1.0);
        let mut min_x = 0.0f32;
        let mut max_x = width;
        let mut min_y = -scaled.ascent();
        let mut max_y = -scaled.descent();
        let mut path = tiny_skia::PathBuilder::new();
        for (id, pen_x) in &glyphs {
            let Some(outline) = font.outline(*id) else {
                continue;
            };
            min_x = min_x.min(pen_x + outline.bounds.min.x * sx);
            max_x = max_x.max(pen_x + outline.bounds.max.x * sx);
            min_y = min_y.min(-outline.bounds.max.y * sy);
            max_y = max_y.max(-outline.bounds.min.y * sy);
            append_outline(&mut path, &outline.curves, *pen_x, sx, sy);
        }
        let path = path.finish()?;

        let origin_x = (min_x - pad).floor();
        let origin_y = (min_y - pad).floor();
        let bitmap_width = ((max_x + pad).ceil() - origin_x).max(1.0) as u32;
        let bitmap_height = ((max_y + pad).ceil() - origin_y).max(1.0) as u32;
        let mut pixmap = tiny_skia::Pixmap::new(bitmap_width, bitmap_height)?;

        let mut paint = tiny_skia::Paint::default();
        paint.set_color_rgba8(255, 255, 255, 255);
        paint.anti_alias = true;
        let transform = tiny_skia::Transform::from_translate(-origin_x, -origin_y);
        match stroke {
            Some(line_width) => {
                let stroke = tiny_skia::Stroke {
                    width: line_width.max(0.1),
                    ..Default::default()
                };
                pixmap.stroke_path(&path, &paint, &stroke, transform, None);
            }
            None => {
                pixmap.fill_path(&path, &paint, tiny_skia::FillRule::Winding, transform, None);
            }
        }

        Some(TextBitmap {
            width: bitmap_width,
            height: bitmap_height,
            pixels: pixmap.take(),
            left: origin_x,
            top: origin_y,
        })
    }
}

/// Glyphs with their pen positions and the total advance, kerning included.
fn layout<F: Font, S: ScaleFont<F>>(scaled: &S, text: &str) -> (Vec<(GlyphId, f32)>, f32) {
    let mut glyphs = Vec::new();
    let mut pen_x = 0.0;
    let mut previous: Option<GlyphId> = None;
    for c in text.chars() {
        let id = scaled.glyph_id(c);
        if let Some(prev) = previous {
            pen_x += scaled.kern(prev, id);
        }
        glyphs.push((id, pen_x));
        pen_x += scaled.h_advance(id);
        previous = Some(id);
    }
    (glyphs, pen_x)
}

/// Font units are y-up; pixmap rows grow downwards from the baseline at y = 0.
fn append_outline(path: &mut tiny_skia::PathBuilder, curves: &[OutlineCurve], pen_x: f32, sx: f32, sy: f32) {
    let map = |p: ab_glyph::Point| (pen_x + p.x * sx, -p.y * sy);
    let mut last: Option<(f32, f32)> = None;
    for curve in curves {
        let start = match curve {
            OutlineCurve::Line(p0, _) | OutlineCurve::Quad(p0, _, _) | OutlineCurve::Cubic(p0, _, _, _) => map(*p0),
        };
        if last != Some(start) {
            if last.is_some() {
                path.close();
            }
            path.move_to(start.0, start.1);
        }
        let end = match curve {
            OutlineCurve::Line(_, p1) => {
                let p1 = map(*p1);
                path.line_to(p1.0, p1.1);
                p1
            }
            OutlineCurve::Quad(_, c, p2) => {
                let (c, p2) = (map(*c), map(*p2));
                path.quad_to(c.0, c.1, p2.0, p2.1);
                p2
            }
            OutlineCurve::Cubic(_, c1, c2, p3) => {
                let (c1, c2, p3) = (map(*c1), map(*c2), map(*p3));
                path.cubic_to(c1.0, c1.1, c2.0, c2.1, p3.0, p3.1);
                p3
            }
        };
        last = Some(end);
    }
    if last.is_some() {
        path.close();
    }
}

/// Premultiplied white coverage of a text run.
///
/// `left`/`top` place the bitmap relative to the pen start on the baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct TextBitmap {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    pub left: f32,
    pub top: f32,
}

/// DejaVu Sans Mono from `tests/fixtures`, the only face in the database.
#[cfg(test)]
pub(crate) fn fixture_fonts() -> FontDatabase {
    let mut fonts = FontDatabase::empty();
    fonts.load_font_data(include_bytes!("../../tests/fixtures/DejaVuSansMono.ttf").to_vec());
    fonts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_weight_size_and_quoted_families() {
        let spec = FontSpec::parse("bold 16px 'Press Start 2P', monospace").unwrap();
        assert_eq!(spec.weight, 700);
        assert!(!spec.italic);
        assert_eq!(spec.size, 16.0);
        assert_eq!(spec.families, vec!["Press Start 2P", "monospace"]);
    }

    #[test]
    fn parses_units_style_and_line_height() {
        let spec = FontSpec::parse("italic 600 12pt/1.2 \"Fira Code\"").unwrap();
        assert!(spec.italic);
        assert_eq!(spec.weight, 600);
        assert!((spec.size - 16.0).abs() < 1e-4);
        assert_eq!(spec.families, vec!["Fira Code"]);

        let spaced = FontSpec::parse("2em / 3em serif").unwrap();
        assert_eq!(spaced.size, 32.0);
        assert_eq!(spaced.families, vec!["serif"]);
    }

    #[test]
    fn rejects_malformed_fonts() {
        assert!(FontSpec::parse("").is_none());
        assert!(FontSpec::parse("16px").is_none());
        assert!(FontSpec::parse("monospace").is_none());
        assert!(FontSpec::parse("heavy 16px serif").is_none());
        assert!(FontSpec::parse("-4px serif").is_none());
    }

    #[test]
    fn anchors_follow_canvas_rules() {
        let metrics = TextMetrics {
            width: 100.0,
            ascent: 12.0,
            descent: 4.0,
        };
        assert_eq!(anchor_offset(TextAlign::Start, TextBaseline::Alphabetic, &metrics), (0.0, 0.0));
        assert_eq!(anchor_offset(TextAlign::Left, TextBaseline::Top, &metrics), (0.0, 12.0));
        assert_eq!(anchor_offset(TextAlign::Center, TextBaseline::Middle, &metrics), (-50.0, 4.0));
        assert_eq!(anchor_offset(TextAlign::Right, TextBaseline::Bottom, &metrics), (-100.0, -4.0));
        assert_eq!(anchor_offset(TextAlign::End, TextBaseline::Hanging, &metrics), (-100.0, 12.0));
    }

    #[test]
    fn keywords_round_trip() {
        for align in ["start", "end", "left", "right", "center"] {
            assert_eq!(TextAlign::parse(align).unwrap().as_str(), align);
        }
        for baseline in ["top", "hanging", "middle", "alphabetic", "ideographic", "bottom"] {
            assert_eq!(TextBaseline::parse(baseline).unwrap().as_str(), baseline);
        }
        assert!(TextAlign::parse("justify").is_none());
    }

    #[test]
    fn empty_database_has_no_font() {
        let fonts = FontDatabase::empty();
        assert!(fonts.is_empty());
        assert!(fonts.font_for(&FontSpec::default()).is_none());
    }

    #[test]
    fn bundled_face_resolves_by_name_and_as_fallback() {
        let fonts = fixture_fonts();
        assert_eq!(fonts.len(), 1);
        let named = FontSpec::parse("16px 'DejaVu Sans Mono'").unwrap();
        assert!(fonts.font_for(&named).is_some());
        let unknown = FontSpec::parse("bold 16px 'Press Start 2P', fantasy").unwrap();
        assert!(fonts.font_for(&unknown).is_some());
    }

    #[test]
    fn monospace_runs_measure_in_whole_advances() {
        let fonts = fixture_fonts();
        let font = fonts.font_for(&FontSpec::parse("20px monospace").unwrap()).unwrap();
        let one = font.measure("M", 20.0);
        let four = font.measure("MMMM", 20.0);
        assert!(one.width > 0.0);
        assert!((four.width - 4.0 * one.width).abs() < 1e-3);
        assert_eq!(font.measure("", 20.0).width, 0.0);

        // The px scale spans ascent to descent.
        assert!(one.ascent > one.descent && one.descent > 0.0);
        assert!((one.ascent + one.descent - 20.0).abs() < 1e-3);

        let doubled = font.measure("MMMM", 40.0);
        assert!((doubled.width - 2.0 * four.width).abs() < 1e-3);
    }

    #[test]
    fn rasterized_glyphs_cover_their_advance() {
        let fonts = fixture_fonts();
        let font = fonts.font_for(&FontSpec::default()).unwrap();
        let metrics = font.measure("HI", 24.0);
        let fill = font.rasterize("HI", 24.0, None).unwrap();

        assert_eq!(fill.pixels.len(), (fill.width * fill.height * 4) as usize);
        assert!(fill.width as f32 >= metrics.width);
        assert!(fill.left <= 0.0 && fill.top <= -metrics.ascent + 1.0);
        let covered = fill.pixels.chunks_exact(4).filter(|px| px[3] > 0).count();
        assert!(covered > 0);
        // White coverage premultiplies to gray levels equal to alpha.
        assert!(fill.pixels.chunks_exact(4).all(|px| px[0] == px[3] && px[1] == px[3] && px[2] == px[3]));

        let stroke = font.rasterize("HI", 24.0, Some(4.0)).unwrap();
        assert!(stroke.width > fill.width);
        assert!(font.rasterize(" ", 24.0, None).is_none());
    }
}
