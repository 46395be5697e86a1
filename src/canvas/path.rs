//! Path accumulation, stroke expansion and fill tessellation.

use lyon::math::point;
use lyon::path::Path;
use lyon::tessellation::{BuffersBuilder, FillOptions, FillTessellator, FillVertex, TessellationError, VertexBuffers};
use std::f32::consts::TAU;

/// Maximum distance between an arc and its polyline, in pixels.
const ARC_TOLERANCE: f32 = 0.25;

/// Points joined by lines. A closed subpath also joins its last point to its first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subpath {
    pub points: Vec<(f32, f32)>,
    pub closed: bool,
}

/// The current path of a canvas, in device pixels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathBuffer {
    subpaths: Vec<Subpath>,
}

impl PathBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.subpaths.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.subpaths.iter().all(|s| s.points.is_empty())
    }

    pub fn subpaths(&self) -> &[Subpath] {
        &self.subpaths
    }

    pub fn move_to(&mut self, x: f32, y: f32) {
        self.subpaths.push(Subpath {
            points: vec![(x, y)],
            closed: false,
        });
    }

    /// A line with no current point behaves like `move_to`.
    pub fn line_to(&mut self, x: f32, y: f32) {
        match self.subpaths.last_mut() {
            Some(subpath) if !subpath.closed => subpath.points.push((x, y)),
            _ => self.move_to(x, y),
        }
    }

    /// Close the current subpath and start a new one at its first point.
    pub fn close_path(&mut self) {
        let Some(subpath) = self.subpaths.last_mut() else {
            return;
        };
        if subpath.closed || subpath.points.is_empty() {
            return;
        }
        subpath.closed = true;
        let (x, y) = subpath.points[0];
        self.move_to(x, y);
    }

    pub fn current_point(&self) -> Option<(f32, f32)> {
        self.subpaths.last().and_then(|s| s.points.last().copied())
    }
}

/// Triangles covering every segment of `path` as a rectangle `width` wide.
///
/// Segments never cross a `move_to`. Joins and caps are not modeled.
pub fn stroke_triangles(path: &PathBuffer, width: f32) -> Vec<[f32; 2]> {
    let half = width / 2.0;
    let mut out = Vec::new();
    for subpath in path.subpaths() {
        let points = &subpath.points;
        for pair in points.windows(2) {
            push_segment(&mut out, pair[0], pair[1], half);
        }
        if subpath.closed && points.len() > 2 {
            push_segment(&mut out, points[points.len() - 1], points[0], half);
        }
    }
    out
}

fn push_segment(out: &mut Vec<[f32; 2]>, from: (f32, f32), to: (f32, f32), half: f32) {
    let (dx, dy) = (to.0 - from.0, to.1 - from.1);
    let length = (dx * dx + dy * dy).sqrt();
    if length <= f32::EPSILON {
        return;
    }
    let (nx, ny) = (-dy / length * half, dx / length * half);
    let p0 = [from.0 + nx, from.1 + ny];
    let p1 = [to.0 + nx, to.1 + ny];
    let p2 = [to.0 - nx, to.1 - ny];
    let p3 = [from.0 - nx, from.1 - ny];
    out.extend_from_slice(&[p0, p1, p2, p0, p2, p3]);
}

/// Non-zero fill of every subpath, each implicitly closed. Returns a triangle list.
pub fn fill_triangles(path: &PathBuffer) -> Result<Vec<[f32; 2]>, TessellationError> {
    let mut builder = Path::builder();
    let mut any = false;
    for subpath in path.subpaths().iter().filter(|s| s.points.len() > 2) {
        let (x, y) = subpath.points[0];
        builder.begin(point(x, y));
        for &(x, y) in &subpath.points[1..] {
            builder.line_to(point(x, y));
        }
        builder.end(true);
        any = true;
    }
    if !any {
        return Ok(Vec::new());
    }
    let lyon_path = builder.build();

    let mut geometry: VertexBuffers<[f32; 2], u32> = VertexBuffers::new();
    let mut tessellator = FillTessellator::new();
    tessellator.tessellate_path(
        &lyon_path,
        &FillOptions::non_zero(),
        &mut BuffersBuilder::new(&mut geometry, |vertex: FillVertex| vertex.position().to_array()),
    )?;

    Ok(geometry
        .indices
        .iter()
        .map(|&i| geometry.vertices[i as usize])
        .collect())
}

/// Points along an arc, Canvas2D sweep rules included. `radius_px` sizes the segments.
pub fn arc_points(
    cx: f32,
    cy: f32,
    radius: f32,
    start: f32,
    end: f32,
    anticlockwise: bool,
    radius_px: f32,
) -> Vec<(f32, f32)> {
    let sweep = if !anticlockwise {
        if end - start >= TAU {
            TAU
        } else {
            (end - start).rem_euclid(TAU)
        }
    } else if start - end >= TAU {
        -TAU
    } else {
        -(start - end).rem_euclid(TAU)
    };

    let step = if radius_px > ARC_TOLERANCE {
        2.0 * (1.0 - ARC_TOLERANCE / radius_px).acos()
    } else {
        TAU / 4.0
    };
    let segments = ((sweep.abs() / step).ceil() as usize).clamp(1, 512);

    (0..=segments)
        .map(|i| {
            let angle = start + sweep * i as f32 / segments as f32;
            (cx + radius * angle.cos(), cy + radius * angle.sin())
        })
        .collect()
}
