//! Affine matrices for the canvas transform stack.

/// A 2x3 affine matrix in Canvas2D order: `x' = a*x + c*y + e`, `y' = b*x + d*y + f`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub e: f32,
    pub f: f32,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Transform = Transform::new(1.0, 0.0, 0.0, 1.0, 0.0, 0.0);

    pub const fn new(a: f32, b: f32, c: f32, d: f32, e: f32, f: f32) -> Self {
        Self { a, b, c, d, e, f }
    }

    pub fn translation(x: f32, y: f32) -> Self {
        Self::new(1.0, 0.0, 0.0, 1.0, x, y)
    }

    pub fn rotation(angle: f32) -> Self {
        let (sin, cos) = angle.sin_cos();
        Self::new(cos, sin, -sin, cos, 0.0, 0.0)
    }

    pub fn scaling(x: f32, y: f32) -> Self {
        Self::new(x, 0.0, 0.0, y, 0.0, 0.0)
    }

    /// `self * other`: `other` is applied to points first.
    pub fn multiply(&self, other: &Transform) -> Transform {
        Transform {
            a: self.a * other.a + self.c * other.b,
            b: self.b * other.a + self.d * other.b,
            c: self.a * other.c + self.c * other.d,
            d: self.b * other.c + self.d * other.d,
            e: self.a * other.e + self.c * other.f + self.e,
            f: self.b * other.e + self.d * other.f + self.f,
        }
    }

    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (self.a * x + self.c * y + self.e, self.b * x + self.d * y + self.f)
    }

    pub fn is_finite(&self) -> bool {
        [self.a, self.b, self.c, self.d, self.e, self.f]
            .iter()
            .all(|v| v.is_finite())
    }

    /// Larger of the two axis scale factors. Used to size tessellation and text rasters.
    pub fn max_scale(&self) -> f32 {
        let sx = (self.a * self.a + self.b * self.b).sqrt();
        let sy = (self.c * self.c + self.d * self.d).sqrt();
        sx.max(sy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    fn close(a: (f32, f32), b: (f32, f32)) -> bool {
        (a.0 - b.0).abs() < 1e-4 && (a.1 - b.1).abs() < 1e-4
    }

    #[test]
    fn translate_then_rotate_matches_the_matrix_product() {
        let composed = Transform::IDENTITY
            .multiply(&Transform::translation(10.0, 0.0))
            .multiply(&Transform::rotation(FRAC_PI_2));

        assert!(close(composed.apply(0.0, 0.0), (10.0, 0.0)));
        // The rotation applies first, then the translation.
        assert!(close(composed.apply(1.0, 0.0), (10.0, 1.0)));
    }

    #[test]
    fn multiply_is_not_commutative() {
        let t = Transform::translation(5.0, 0.0);
        let s = Transform::scaling(2.0, 2.0);
        assert!(close(t.multiply(&s).apply(1.0, 1.0), (7.0, 2.0)));
        assert!(close(s.multiply(&t).apply(1.0, 1.0), (12.0, 2.0)));
    }

    #[test]
    fn max_scale_reads_the_axes() {
        let m = Transform::rotation(0.7).multiply(&Transform::scaling(3.0, 0.5));
        assert!((m.max_scale() - 3.0).abs() < 1e-3);
    }
}
