//! A Canvas2D-style immediate-mode drawing surface.
//!
//! [`Canvas2D`] keeps the mutable Canvas2D state machine and records what each
//! call draws as device-space [`DrawCommand`]s. A [`CanvasRenderer`] later turns
//! the batch into backend draws against whichever surface the frame is routed to.

pub mod color;
pub mod path;
mod renderer;
pub mod text;
pub mod transform;

pub use color::{parse_color, Color};
pub use path::PathBuffer;
pub use renderer::CanvasRenderer;
pub use text::{FontDatabase, FontSpec, TextAlign, TextBaseline, TextMetrics};
pub use transform::Transform;

use crate::utils::rgba_len;
use std::path::Path as FsPath;
use std::sync::Arc;
use text::anchor_offset;
use tracing::{debug, warn};

/// Raster quality floor when text or images are drawn under a shrinking transform.
const MIN_RASTER_SCALE: f32 = 0.25;

/// One batched draw, in device pixels with premultiplied colors.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawCommand {
    /// Triangle list blended source-over.
    Solid { vertices: Vec<[f32; 2]>, color: [f32; 4] },
    /// Triangle list reset to transparent black.
    Clear { vertices: Vec<[f32; 2]> },
    /// A premultiplied RGBA bitmap mapped onto a quad, multiplied by `tint`.
    Image {
        /// Top-left, top-right, bottom-right, bottom-left.
        corners: [[f32; 2]; 4],
        width: u32,
        height: u32,
        pixels: Arc<Vec<u8>>,
        tint: [f32; 4],
    },
}

/// Linear or radial gradient. Only its first color stop is ever painted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanvasGradient {
    stops: Vec<(f32, Color)>,
}

impl CanvasGradient {
    /// Offsets outside `0..=1` and unparsable colors are ignored.
    pub fn add_color_stop(&mut self, offset: f32, color: &str) {
        if !(0.0..=1.0).contains(&offset) {
            return;
        }
        if let Some(color) = parse_color(color) {
            self.stops.push((offset, color));
        }
    }

    pub fn stops(&self) -> &[(f32, Color)] {
        &self.stops
    }

    /// The color a fill with this gradient uses.
    pub fn effective_color(&self) -> Color {
        self.stops.first().map_or(Color::TRANSPARENT, |(_, c)| *c)
    }
}

/// A fill or stroke style.
#[derive(Debug, Clone, PartialEq)]
pub enum Paint {
    Color(Color),
    Gradient(CanvasGradient),
}

impl Paint {
    pub fn color(&self) -> Color {
        match self {
            Paint::Color(color) => *color,
            Paint::Gradient(gradient) => gradient.effective_color(),
        }
    }

    pub fn to_css(&self) -> String {
        self.color().to_css()
    }
}

/// A decoded image ready to draw, premultiplied.
#[derive(Debug, Clone, PartialEq)]
pub struct CanvasImage {
    pub width: u32,
    pub height: u32,
    pixels: Arc<Vec<u8>>,
}

impl CanvasImage {
    /// Wrap straight-alpha RGBA rows. Returns `None` if the buffer length does not match.
    pub fn from_rgba(width: u32, height: u32, mut rgba: Vec<u8>) -> Option<Self> {
        if width == 0 || height == 0 || rgba_len(width, height) != Some(rgba.len()) {
            return None;
        }
        for pixel in rgba.chunks_exact_mut(4) {
            let alpha = pixel[3] as u16;
            pixel[0] = ((pixel[0] as u16 * alpha + 127) / 255) as u8;
            pixel[1] = ((pixel[1] as u16 * alpha + 127) / 255) as u8;
            pixel[2] = ((pixel[2] as u16 * alpha + 127) / 255) as u8;
        }
        Some(Self {
            width,
            height,
            pixels: Arc::new(rgba),
        })
    }

    pub fn open(path: &FsPath) -> anyhow::Result<Self> {
        let img = image::open(path)?.to_rgba8();
        let (width, height) = img.dimensions();
        Self::from_rgba(width, height, img.into_raw())
            .ok_or_else(|| anyhow::anyhow!("image {:?} is empty", path))
    }
}

/// The Canvas2D state that `save`/`restore` snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawState {
    pub fill_style: Paint,
    pub stroke_style: Paint,
    pub line_width: f32,
    pub global_alpha: f32,
    pub font: String,
    pub font_spec: FontSpec,
    pub text_align: TextAlign,
    pub text_baseline: TextBaseline,
    pub transform: Transform,
}

impl Default for DrawState {
    fn default() -> Self {
        Self {
            fill_style: Paint::Color(Color::BLACK),
            stroke_style: Paint::Color(Color::BLACK),
            line_width: 1.0,
            global_alpha: 1.0,
            font: "10px sans-serif".to_string(),
            font_spec: FontSpec::default(),
            text_align: TextAlign::Start,
            text_baseline: TextBaseline::Alphabetic,
            transform: Transform::IDENTITY,
        }
    }
}

/// Canvas2D drawing contract recorded as GPU-ready commands.
pub struct Canvas2D {
    width: u32,
    height: u32,
    state: DrawState,
    stack: Vec<DrawState>,
    path: PathBuffer,
    commands: Vec<DrawCommand>,
    fonts: Arc<FontDatabase>,
}

impl Canvas2D {
    pub fn new(width: u32, height: u32, fonts: Arc<FontDatabase>) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            state: DrawState::default(),
            stack: Vec::new(),
            path: PathBuffer::new(),
            commands: Vec::new(),
            fonts,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Change the logical size. Like assigning `canvas.width`, this resets all state.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width.max(1);
        self.height = height.max(1);
        self.state = DrawState::default();
        self.stack.clear();
        self.path.clear();
        self.commands.clear();
    }

    pub fn commands(&self) -> &[DrawCommand] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<DrawCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn state(&self) -> &DrawState {
        &self.state
    }

    // ---- styles ----

    pub fn fill_style(&self) -> &Paint {
        &self.state.fill_style
    }

    /// Unparsable colors leave the style unchanged.
    pub fn set_fill_style(&mut self, color: &str) {
        if let Some(color) = parse_color(color) {
            self.state.fill_style = Paint::Color(color);
        }
    }

    pub fn set_fill_gradient(&mut self, gradient: CanvasGradient) {
        self.state.fill_style = Paint::Gradient(gradient);
    }

    pub fn stroke_style(&self) -> &Paint {
        &self.state.stroke_style
    }

    pub fn set_stroke_style(&mut self, color: &str) {
        if let Some(color) = parse_color(color) {
            self.state.stroke_style = Paint::Color(color);
        }
    }

    pub fn set_stroke_gradient(&mut self, gradient: CanvasGradient) {
        self.state.stroke_style = Paint::Gradient(gradient);
    }

    pub fn line_width(&self) -> f32 {
        self.state.line_width
    }

    pub fn set_line_width(&mut self, width: f32) {
        if width.is_finite() && width > 0.0 {
            self.state.line_width = width;
        }
    }

    pub fn global_alpha(&self) -> f32 {
        self.state.global_alpha
    }

    pub fn set_global_alpha(&mut self, alpha: f32) {
        if (0.0..=1.0).contains(&alpha) {
            self.state.global_alpha = alpha;
        }
    }

    pub fn font(&self) -> &str {
        &self.state.font
    }

    pub fn set_font(&mut self, font: &str) {
        if let Some(spec) = FontSpec::parse(font) {
            self.state.font = font.trim().to_string();
            self.state.font_spec = spec;
        }
    }

    pub fn text_align(&self) -> TextAlign {
        self.state.text_align
    }

    pub fn set_text_align(&mut self, align: &str) {
        if let Some(align) = TextAlign::parse(align) {
            self.state.text_align = align;
        }
    }

    pub fn text_baseline(&self) -> TextBaseline {
        self.state.text_baseline
    }

    pub fn set_text_baseline(&mut self, baseline: &str) {
        if let Some(baseline) = TextBaseline::parse(baseline) {
            self.state.text_baseline = baseline;
        }
    }

    pub fn create_linear_gradient(&self, _x0: f32, _y0: f32, _x1: f32, _y1: f32) -> CanvasGradient {
        CanvasGradient::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_radial_gradient(&self, _x0: f32, _y0: f32, _r0: f32, _x1: f32, _y1: f32, _r1: f32) -> CanvasGradient {
        CanvasGradient::default()
    }

    // ---- state stack and transforms ----

    pub fn save(&mut self) {
        self.stack.push(self.state.clone());
    }

    /// Pop the last saved state. Does nothing when nothing was saved.
    pub fn restore(&mut self) {
        if let Some(state) = self.stack.pop() {
            self.state = state;
        }
    }

    fn compose(&mut self, m: Transform) {
        let next = self.state.transform.multiply(&m);
        if next.is_finite() {
            self.state.transform = next;
        }
    }

    pub fn translate(&mut self, x: f32, y: f32) {
        self.compose(Transform::translation(x, y));
    }

    pub fn scale(&mut self, x: f32, y: f32) {
        self.compose(Transform::scaling(x, y));
    }

    /// Rotate clockwise by `angle` radians.
    pub fn rotate(&mut self, angle: f32) {
        self.compose(Transform::rotation(angle));
    }

    pub fn transform(&mut self, a: f32, b: f32, c: f32, d: f32, e: f32, f: f32) {
        self.compose(Transform::new(a, b, c, d, e, f));
    }

    pub fn set_transform(&mut self, a: f32, b: f32, c: f32, d: f32, e: f32, f: f32) {
        let m = Transform::new(a, b, c, d, e, f);
        if m.is_finite() {
            self.state.transform = m;
        }
    }

    pub fn reset_transform(&mut self) {
        self.state.transform = Transform::IDENTITY;
    }

    pub fn get_transform(&self) -> Transform {
        self.state.transform
    }

    // ---- rectangles ----

    fn quad(&self, x: f32, y: f32, w: f32, h: f32) -> [[f32; 2]; 4] {
        let m = &self.state.transform;
        [(x, y), (x + w, y), (x + w, y + h), (x, y + h)].map(|(px, py)| {
            let (tx, ty) = m.apply(px, py);
            [tx, ty]
        })
    }

    fn fill_color(&self) -> [f32; 4] {
        self.state.fill_style.color().premultiplied(self.state.global_alpha)
    }

    fn stroke_color(&self) -> [f32; 4] {
        self.state.stroke_style.color().premultiplied(self.state.global_alpha)
    }

    pub fn fill_rect(&mut self, x: f32, y: f32, w: f32, h: f32) {
        if !rect_is_drawable(x, y, w, h) {
            return;
        }
        let [p0, p1, p2, p3] = self.quad(x, y, w, h);
        let color = self.fill_color();
        self.push_solid(vec![p0, p1, p2, p0, p2, p3], color);
    }

    pub fn stroke_rect(&mut self, x: f32, y: f32, w: f32, h: f32) {
        if !rect_is_drawable(x, y, w, h) {
            return;
        }
        let mut outline = PathBuffer::new();
        let [p0, p1, p2, p3] = self.quad(x, y, w, h);
        outline.move_to(p0[0], p0[1]);
        for p in [p1, p2, p3] {
            outline.line_to(p[0], p[1]);
        }
        outline.close_path();
        let triangles = path::stroke_triangles(&outline, self.device_line_width());
        let color = self.stroke_color();
        self.push_solid(triangles, color);
    }

    pub fn clear_rect(&mut self, x: f32, y: f32, w: f32, h: f32) {
        if !rect_is_drawable(x, y, w, h) {
            return;
        }
        let [p0, p1, p2, p3] = self.quad(x, y, w, h);
        self.commands.push(DrawCommand::Clear {
            vertices: vec![p0, p1, p2, p0, p2, p3],
        });
    }

    fn push_solid(&mut self, vertices: Vec<[f32; 2]>, color: [f32; 4]) {
        if vertices.is_empty() || color[3] <= 0.0 {
            return;
        }
        self.commands.push(DrawCommand::Solid { vertices, color });
    }

    fn device_line_width(&self) -> f32 {
        self.state.line_width * self.state.transform.max_scale()
    }

    // ---- paths ----

    pub fn begin_path(&mut self) {
        self.path.clear();
    }

    pub fn move_to(&mut self, x: f32, y: f32) {
        if x.is_finite() && y.is_finite() {
            let (tx, ty) = self.state.transform.apply(x, y);
            self.path.move_to(tx, ty);
        }
    }

    pub fn line_to(&mut self, x: f32, y: f32) {
        if x.is_finite() && y.is_finite() {
            let (tx, ty) = self.state.transform.apply(x, y);
            self.path.line_to(tx, ty);
        }
    }

    pub fn close_path(&mut self) {
        self.path.close_path();
    }

    /// A closed rectangle subpath.
    pub fn rect(&mut self, x: f32, y: f32, w: f32, h: f32) {
        if !rect_is_drawable(x, y, w, h) {
            return;
        }
        self.move_to(x, y);
        self.line_to(x + w, y);
        self.line_to(x + w, y + h);
        self.line_to(x, y + h);
        self.close_path();
    }

    /// Arc around `(x, y)`, joined by a line from the current point if there is one.
    pub fn arc(&mut self, x: f32, y: f32, radius: f32, start: f32, end: f32, anticlockwise: bool) {
        if !(radius.is_finite() && radius >= 0.0 && start.is_finite() && end.is_finite()) {
            return;
        }
        let radius_px = radius * self.state.transform.max_scale();
        let points = path::arc_points(x, y, radius, start, end, anticlockwise, radius_px);
        let m = self.state.transform;
        for (i, (px, py)) in points.into_iter().enumerate() {
            let (tx, ty) = m.apply(px, py);
            if i == 0 && self.path.current_point().is_none() {
                self.path.move_to(tx, ty);
            } else {
                self.path.line_to(tx, ty);
            }
        }
    }

    /// Stroke the current path, then clear it.
    pub fn stroke(&mut self) {
        let triangles = path::stroke_triangles(&self.path, self.device_line_width());
        let color = self.stroke_color();
        self.push_solid(triangles, color);
        self.path.clear();
    }

    /// Fill the current path with the non-zero rule, then clear it.
    pub fn fill(&mut self) {
        match path::fill_triangles(&self.path) {
            Ok(triangles) => {
                let color = self.fill_color();
                self.push_solid(triangles, color);
            }
            Err(e) => warn!("Failed to tessellate path: {:?}", e),
        }
        self.path.clear();
    }

    // ---- text ----

    pub fn measure_text(&self, text: &str) -> TextMetrics {
        match self.fonts.font_for(&self.state.font_spec) {
            Some(font) => font.measure(text, self.state.font_spec.size),
            None => TextMetrics::default(),
        }
    }

    pub fn fill_text(&mut self, text: &str, x: f32, y: f32) {
        let tint = self.fill_color();
        self.draw_text(text, x, y, None, tint);
    }

    pub fn stroke_text(&mut self, text: &str, x: f32, y: f32) {
        let tint = self.stroke_color();
        self.draw_text(text, x, y, Some(self.state.line_width), tint);
    }

    fn draw_text(&mut self, text: &str, x: f32, y: f32, stroke: Option<f32>, tint: [f32; 4]) {
        if text.is_empty() || !x.is_finite() || !y.is_finite() || tint[3] <= 0.0 {
            return;
        }
        let spec = &self.state.font_spec;
        let Some(font) = self.fonts.font_for(spec) else {
            warn!("No font available for {:?}, skipping text", self.state.font);
            return;
        };

        let metrics = font.measure(text, spec.size);
        let (dx, dy) = anchor_offset(self.state.text_align, self.state.text_baseline, &metrics);

        // Rasterize at device scale so transformed text stays sharp.
        let raster_scale = self.state.transform.max_scale().max(MIN_RASTER_SCALE);
        let Some(bitmap) = font.rasterize(text, spec.size * raster_scale, stroke.map(|w| w * raster_scale)) else {
            debug!("Text {:?} produced no coverage", text);
            return;
        };

        let left = x + dx + bitmap.left / raster_scale;
        let top = y + dy + bitmap.top / raster_scale;
        let corners = self.quad(
            left,
            top,
            bitmap.width as f32 / raster_scale,
            bitmap.height as f32 / raster_scale,
        );
        self.commands.push(DrawCommand::Image {
            corners,
            width: bitmap.width,
            height: bitmap.height,
            pixels: Arc::new(bitmap.pixels),
            tint,
        });
    }

    // ---- images ----

    pub fn draw_image(&mut self, image: &CanvasImage, x: f32, y: f32) {
        self.draw_image_scaled(image, x, y, image.width as f32, image.height as f32);
    }

    pub fn draw_image_scaled(&mut self, image: &CanvasImage, x: f32, y: f32, w: f32, h: f32) {
        if !rect_is_drawable(x, y, w, h) || self.state.global_alpha <= 0.0 {
            return;
        }
        let alpha = self.state.global_alpha;
        let corners = self.quad(x, y, w, h);
        self.commands.push(DrawCommand::Image {
            corners,
            width: image.width,
            height: image.height,
            pixels: image.pixels.clone(),
            tint: [alpha; 4],
        });
    }
}

fn rect_is_drawable(x: f32, y: f32, w: f32, h: f32) -> bool {
    [x, y, w, h].iter().all(|v| v.is_finite()) && w != 0.0 && h != 0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    fn canvas() -> Canvas2D {
        Canvas2D::new(320, 240, Arc::new(FontDatabase::empty()))
    }

    fn solid(command: &DrawCommand) -> (&[[f32; 2]], [f32; 4]) {
        match command {
            DrawCommand::Solid { vertices, color } => (vertices, *color),
            other => panic!("expected a solid command, got {other:?}"),
        }
    }

    #[test]
    fn fill_rect_is_two_premultiplied_triangles() {
        let mut canvas = canvas();
        canvas.set_fill_style("rgba(255, 0, 0, 0.5)");
        canvas.set_global_alpha(0.5);
        canvas.fill_rect(10.0, 20.0, 30.0, 40.0);

        let (vertices, color) = solid(&canvas.commands()[0]);
        assert_eq!(vertices.len(), 6);
        assert_eq!(vertices[0], [10.0, 20.0]);
        assert_eq!(vertices[2], [40.0, 60.0]);
        assert_eq!(color, [0.25, 0.0, 0.0, 0.25]);
    }

    #[test]
    fn restore_on_empty_stack_keeps_the_transform() {
        let mut canvas = canvas();
        canvas.translate(5.0, 7.0);
        let before = canvas.get_transform();
        canvas.restore();
        canvas.restore();
        assert_eq!(canvas.get_transform(), before);
    }

    #[test]
    fn save_restore_snapshots_styles_and_transform() {
        let mut canvas = canvas();
        canvas.set_fill_style("red");
        canvas.save();
        canvas.set_fill_style("blue");
        canvas.set_line_width(4.0);
        canvas.scale(2.0, 2.0);
        canvas.restore();

        assert_eq!(canvas.fill_style().to_css(), "#ff0000");
        assert_eq!(canvas.line_width(), 1.0);
        assert_eq!(canvas.get_transform(), Transform::IDENTITY);
    }

    #[test]
    fn translate_then_rotate_moves_local_points() {
        let mut canvas = canvas();
        canvas.translate(10.0, 0.0);
        canvas.rotate(FRAC_PI_2);
        canvas.fill_rect(0.0, 0.0, 1.0, 1.0);

        let expected = Transform::translation(10.0, 0.0).multiply(&Transform::rotation(FRAC_PI_2));
        let (vertices, _) = solid(&canvas.commands()[0]);
        let (ex, ey) = expected.apply(1.0, 0.0);
        assert!((vertices[1][0] - ex).abs() < 1e-4 && (vertices[1][1] - ey).abs() < 1e-4);
        assert!((vertices[0][0] - 10.0).abs() < 1e-4 && vertices[0][1].abs() < 1e-4);
    }

    #[test]
    fn stroke_with_two_subpaths_has_no_bridge() {
        let mut canvas = canvas();
        canvas.begin_path();
        canvas.move_to(0.0, 0.0);
        canvas.line_to(10.0, 0.0);
        canvas.move_to(20.0, 0.0);
        canvas.line_to(30.0, 0.0);
        canvas.stroke();

        let (vertices, _) = solid(&canvas.commands()[0]);
        assert_eq!(vertices.len(), 12);
        assert!(vertices.iter().all(|[x, _]| *x <= 10.0 || *x >= 20.0));
        // The path was consumed.
        canvas.stroke();
        assert_eq!(canvas.commands().len(), 1);
    }

    #[test]
    fn invalid_styles_are_ignored() {
        let mut canvas = canvas();
        canvas.set_fill_style("#00ff00");
        canvas.set_fill_style("not a color");
        canvas.set_line_width(-1.0);
        canvas.set_global_alpha(2.0);
        canvas.set_font("huge");
        canvas.set_text_align("justify");

        assert_eq!(canvas.fill_style().to_css(), "#00ff00");
        assert_eq!(canvas.line_width(), 1.0);
        assert_eq!(canvas.global_alpha(), 1.0);
        assert_eq!(canvas.font(), "10px sans-serif");
        assert_eq!(canvas.text_align(), TextAlign::Start);
    }

    #[test]
    fn gradients_paint_their_first_stop() {
        let mut canvas = canvas();
        let mut gradient = canvas.create_linear_gradient(0.0, 0.0, 100.0, 0.0);
        gradient.add_color_stop(0.0, "#0000ff");
        gradient.add_color_stop(1.0, "#ff0000");
        gradient.add_color_stop(2.0, "#00ff00");
        assert_eq!(gradient.stops().len(), 2);
        canvas.set_fill_gradient(gradient);
        canvas.fill_rect(0.0, 0.0, 10.0, 10.0);

        let (_, color) = solid(&canvas.commands()[0]);
        assert_eq!(color, [0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn clear_rect_records_a_clear() {
        let mut canvas = canvas();
        canvas.clear_rect(0.0, 0.0, 320.0, 240.0);
        assert!(matches!(&canvas.commands()[0], DrawCommand::Clear { vertices } if vertices.len() == 6));
    }

    #[test]
    fn fill_closes_rect_paths() {
        let mut canvas = canvas();
        canvas.begin_path();
        canvas.rect(0.0, 0.0, 10.0, 10.0);
        canvas.fill();
        let (vertices, _) = solid(&canvas.commands()[0]);
        assert_eq!(vertices.len() % 3, 0);
        assert!(!vertices.is_empty());
    }

    #[test]
    fn arc_joins_from_the_current_point() {
        let mut canvas = canvas();
        canvas.begin_path();
        canvas.move_to(0.0, 0.0);
        canvas.arc(50.0, 0.0, 10.0, 0.0, std::f32::consts::PI, false);
        let subpaths = canvas.path.subpaths();
        assert_eq!(subpaths.len(), 1);
        assert_eq!(subpaths[0].points[0], (0.0, 0.0));
        assert!((subpaths[0].points[1].0 - 60.0).abs() < 1e-4);
    }

    #[test]
    fn text_without_fonts_is_a_no_op() {
        let mut canvas = canvas();
        canvas.set_font("bold 16px monospace");
        canvas.fill_text("HIGH SCORES", 10.0, 10.0);
        assert!(canvas.commands().is_empty());
        assert_eq!(canvas.measure_text("HIGH SCORES").width, 0.0);
    }

    /// Top-left corner of the text bitmap drawn by the last command.
    fn text_origin(canvas: &mut Canvas2D) -> [f32; 2] {
        match canvas.take_commands().pop() {
            Some(DrawCommand::Image { corners, .. }) => corners[0],
            other => panic!("expected a text image, got {other:?}"),
        }
    }

    #[test]
    fn text_is_anchored_by_align_and_baseline() {
        let mut canvas = Canvas2D::new(320, 240, Arc::new(text::fixture_fonts()));
        canvas.set_font("20px 'DejaVu Sans Mono'");
        let metrics = canvas.measure_text("SCAN");
        assert!(metrics.width > 0.0);

        let mut origin_for = |align: &str, baseline: &str| {
            canvas.set_text_align(align);
            canvas.set_text_baseline(baseline);
            canvas.fill_text("SCAN", 160.0, 120.0);
            text_origin(&mut canvas)
        };
        let left = origin_for("left", "alphabetic");
        let center = origin_for("center", "alphabetic");
        let right = origin_for("right", "alphabetic");
        let top = origin_for("left", "top");
        let bottom = origin_for("left", "bottom");

        assert!((left[0] - center[0] - metrics.width / 2.0).abs() < 1e-3);
        assert!((left[0] - right[0] - metrics.width).abs() < 1e-3);
        assert!((top[1] - left[1] - metrics.ascent).abs() < 1e-3);
        assert!((left[1] - bottom[1] - metrics.descent).abs() < 1e-3);
        // The bitmap starts at or just before the pen position.
        assert!(left[0] <= 160.0 && left[0] > 160.0 - 4.0);
    }

    #[test]
    fn stroke_text_uses_the_stroke_style() {
        let mut canvas = Canvas2D::new(320, 240, Arc::new(text::fixture_fonts()));
        canvas.set_font("bold 16px monospace");
        canvas.set_fill_style("#ff0000");
        canvas.set_stroke_style("#0000ff");
        canvas.stroke_text("P1", 10.0, 30.0);
        canvas.fill_text("P1", 10.0, 30.0);
        let tints: Vec<[f32; 4]> = canvas
            .commands()
            .iter()
            .map(|command| match command {
                DrawCommand::Image { tint, .. } => *tint,
                other => panic!("expected a text image, got {other:?}"),
            })
            .collect();
        assert_eq!(tints, vec![[0.0, 0.0, 1.0, 1.0], [1.0, 0.0, 0.0, 1.0]]);
    }

    #[test]
    fn images_are_premultiplied_and_scaled_by_global_alpha() {
        let image = CanvasImage::from_rgba(1, 1, vec![255, 255, 255, 128]).unwrap();
        let mut canvas = canvas();
        canvas.set_global_alpha(0.5);
        canvas.draw_image_scaled(&image, 0.0, 0.0, 4.0, 4.0);
        match &canvas.commands()[0] {
            DrawCommand::Image { pixels, tint, corners, .. } => {
                assert_eq!(pixels.as_slice(), &[128, 128, 128, 128]);
                assert_eq!(*tint, [0.5; 4]);
                assert_eq!(corners[2], [4.0, 4.0]);
            }
            other => panic!("expected an image, got {other:?}"),
        }
        assert!(CanvasImage::from_rgba(2, 2, vec![0; 4]).is_none());
        assert!(CanvasImage::from_rgba(u32::MAX, u32::MAX, Vec::new()).is_none());
    }
}
