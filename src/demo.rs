//! Attract-mode scene drawn by the binary.

use scanline::canvas::Canvas2D;
use std::f32::consts::{PI, TAU};

const SCORES: [(&str, u32); 5] = [
    ("ACE", 98_450),
    ("BOB", 76_300),
    ("CRT", 54_120),
    ("DOT", 31_990),
    ("EGA", 12_005),
];

/// Score table, tournament bracket and a spinning marquee.
pub struct AttractScene {
    font_family: String,
}

impl AttractScene {
    pub fn new(font_family: &str) -> Self {
        Self {
            font_family: font_family.to_string(),
        }
    }

    pub fn set_font_family(&mut self, font_family: &str) {
        self.font_family = font_family.to_string();
    }

    fn font(&self, weight: &str, size: f32) -> String {
        format!("{weight} {size}px '{}', monospace", self.font_family)
    }

    pub fn draw(&self, canvas: &mut Canvas2D, time: f32) {
        let (w, h) = (canvas.width() as f32, canvas.height() as f32);

        canvas.set_fill_style("#05050f");
        canvas.fill_rect(0.0, 0.0, w, h);

        let mut sky = canvas.create_linear_gradient(0.0, 0.0, 0.0, h);
        sky.add_color_stop(0.0, "rgba(40, 0, 80, 0.6)");
        sky.add_color_stop(1.0, "#000000");
        canvas.set_fill_gradient(sky);
        canvas.fill_rect(0.0, 0.0, w, h * 0.25);

        self.draw_title(canvas, w, h, time);
        self.draw_scores(canvas, w, h);
        self.draw_bracket(canvas, w, h, time);
        self.draw_marquee(canvas, w, h, time);

        if (time * 2.0).fract() < 0.5 {
            canvas.set_font(&self.font("bold", h * 0.04));
            canvas.set_text_align("center");
            canvas.set_text_baseline("bottom");
            canvas.set_fill_style("hsl(50, 100%, 60%)");
            canvas.fill_text("INSERT COIN", w / 2.0, h - 12.0);
        }
    }

    fn draw_title(&self, canvas: &mut Canvas2D, w: f32, h: f32, time: f32) {
        canvas.save();
        canvas.set_font(&self.font("bold", h * 0.08));
        canvas.set_text_align("center");
        canvas.set_text_baseline("top");
        let pulse = 0.75 + 0.25 * (time * 3.0).sin();
        canvas.set_global_alpha(pulse.clamp(0.0, 1.0));
        canvas.set_stroke_style("#ff00aa");
        canvas.set_line_width(2.0);
        canvas.stroke_text("SCANLINE", w / 2.0, h * 0.04);
        canvas.set_fill_style("#00e5ff");
        canvas.fill_text("SCANLINE", w / 2.0, h * 0.04);
        canvas.restore();
    }

    fn draw_scores(&self, canvas: &mut Canvas2D, w: f32, h: f32) {
        let left = w * 0.08;
        let top = h * 0.22;
        let row = h * 0.06;

        canvas.save();
        canvas.set_font(&self.font("normal", row * 0.6));
        canvas.set_text_baseline("middle");
        canvas.set_stroke_style("rgba(0, 229, 255, 0.5)");
        canvas.stroke_rect(left - 8.0, top - row * 0.8, w * 0.4, row * (SCORES.len() as f32 + 1.0));

        canvas.set_fill_style("#ffffff");
        canvas.set_text_align("left");
        canvas.fill_text("RANK  NAME", left, top - row * 0.3);
        for (i, (name, score)) in SCORES.iter().enumerate() {
            let y = top + row * (i as f32 + 0.7);
            canvas.set_fill_style(if i == 0 { "gold" } else { "#c0c0c0" });
            canvas.set_text_align("left");
            canvas.fill_text(&format!("{:>2}.   {}", i + 1, name), left, y);
            canvas.set_text_align("right");
            canvas.fill_text(&score.to_string(), left + w * 0.4 - 16.0, y);
        }
        canvas.restore();
    }

    /// Four seeds, two semifinals, one final.
    fn draw_bracket(&self, canvas: &mut Canvas2D, w: f32, h: f32, time: f32) {
        let x0 = w * 0.56;
        let x1 = w * 0.72;
        let x2 = w * 0.88;
        let top = h * 0.22;
        let gap = h * 0.09;

        canvas.save();
        canvas.set_stroke_style("#39ff14");
        canvas.set_line_width(2.0);
        canvas.begin_path();
        for pair in 0..2 {
            let a = top + gap * (pair * 2) as f32;
            let b = a + gap;
            let mid = (a + b) / 2.0;
            canvas.move_to(x0, a);
            canvas.line_to(x1, a);
            canvas.line_to(x1, b);
            canvas.line_to(x0, b);
            canvas.move_to(x1, mid);
            canvas.line_to(x2, mid);
        }
        let semi_a = top + gap * 0.5;
        let semi_b = top + gap * 2.5;
        canvas.move_to(x2, semi_a);
        canvas.line_to(x2, semi_b);
        canvas.stroke();

        // The winner's slot blinks between seeds.
        let champion = (time as usize / 2) % 4;
        canvas.set_font(&self.font("normal", gap * 0.3));
        canvas.set_text_align("left");
        canvas.set_text_baseline("bottom");
        canvas.set_fill_style("#39ff14");
        for (i, (name, _)) in SCORES.iter().take(4).enumerate() {
            canvas.fill_text(name, x0 + 4.0, top + gap * i as f32 - 4.0);
        }
        canvas.set_fill_style("gold");
        canvas.fill_text(SCORES[champion].0, x2 + 6.0, (semi_a + semi_b) / 2.0);
        canvas.restore();
    }

    fn draw_marquee(&self, canvas: &mut Canvas2D, w: f32, h: f32, time: f32) {
        let (cx, cy) = (w * 0.5, h * 0.8);
        let radius = h * 0.08;

        canvas.save();
        canvas.translate(cx, cy);
        canvas.rotate(time * 0.8);

        for i in 0..6 {
            let start = i as f32 * TAU / 6.0;
            canvas.set_fill_style(if i % 2 == 0 { "#ff00aa" } else { "#00e5ff" });
            canvas.begin_path();
            canvas.move_to(0.0, 0.0);
            canvas.arc(0.0, 0.0, radius, start, start + PI / 6.0, false);
            canvas.close_path();
            canvas.fill();
        }

        canvas.set_stroke_style("#ffffff");
        canvas.set_line_width(3.0);
        canvas.begin_path();
        canvas.arc(0.0, 0.0, radius * 1.2, 0.0, TAU, false);
        canvas.stroke();
        canvas.restore();
    }
}
