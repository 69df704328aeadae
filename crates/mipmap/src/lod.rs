use serde::{Deserialize, Serialize};

use crate::source::MipSize;

/// 2D affine map `x' = a*x + c*y + tx`, `y' = b*x + d*y + ty` from image pixels to the
/// output space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Affine2 {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Default for Affine2 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Affine2 {
    pub const IDENTITY: Self = Self {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        tx: 0.0,
        ty: 0.0,
    };

    pub const fn scale(scale: f32) -> Self {
        Self {
            a: scale,
            b: 0.0,
            c: 0.0,
            d: scale,
            tx: 0.0,
            ty: 0.0,
        }
    }

    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.a * x + self.c * y + self.tx,
            self.b * x + self.d * y + self.ty,
        )
    }

    /// Largest stretch the map applies to either image axis.
    pub fn max_axis_scale(&self) -> f32 {
        let x_axis = (self.a * self.a + self.b * self.b).sqrt();
        let y_axis = (self.c * self.c + self.d * self.d).sqrt();
        x_axis.max(y_axis)
    }
}

/// Picks the coarsest level that still covers one output pixel (`pixel_size` output units)
/// per texel, then keeps coarsening until the level fits `max_size`.
pub fn select_level(
    native: MipSize,
    max_level: usize,
    transform: &Affine2,
    pixel_size: f32,
    max_size: Option<u32>,
) -> usize {
    let texels_per_pixel = pixel_size / transform.max_axis_scale();
    let mut level = if !texels_per_pixel.is_finite() {
        max_level
    } else if texels_per_pixel <= 1.0 {
        0
    } else {
        (texels_per_pixel.log2().floor() as usize).min(max_level)
    };
    if let Some(max_size) = max_size {
        while level < max_level && native.at_level(level).max_dimension() > max_size {
            level += 1;
        }
    }
    level
}

#[cfg(test)]
mod tests {
    use super::*;

    const NATIVE: MipSize = MipSize::new(1024, 512);

    #[test]
    fn magnified_or_unscaled_draws_use_the_finest_level() {
        assert_eq!(select_level(NATIVE, 3, &Affine2::IDENTITY, 1.0, None), 0);
        assert_eq!(select_level(NATIVE, 3, &Affine2::scale(4.0), 1.0, None), 0);
    }

    #[test]
    fn minified_draws_pick_the_level_at_or_above_screen_density() {
        assert_eq!(select_level(NATIVE, 3, &Affine2::scale(0.5), 1.0, None), 1);
        assert_eq!(select_level(NATIVE, 3, &Affine2::scale(0.3), 1.0, None), 1);
        assert_eq!(select_level(NATIVE, 3, &Affine2::scale(0.25), 1.0, None), 2);
        assert_eq!(select_level(NATIVE, 3, &Affine2::scale(0.01), 1.0, None), 3);
        assert_eq!(select_level(NATIVE, 3, &Affine2::IDENTITY, 2.0, None), 1);
    }

    #[test]
    fn rotation_does_not_change_the_level() {
        let rotated = Affine2 {
            a: 0.0,
            b: 0.5,
            c: -0.5,
            d: 0.0,
            tx: 10.0,
            ty: -3.0,
        };
        assert_eq!(select_level(NATIVE, 3, &rotated, 1.0, None), 1);
    }

    #[test]
    fn max_size_forces_coarser_levels() {
        assert_eq!(select_level(NATIVE, 3, &Affine2::IDENTITY, 1.0, Some(300)), 2);
        assert_eq!(select_level(NATIVE, 3, &Affine2::IDENTITY, 1.0, Some(1)), 3);
    }

    #[test]
    fn degenerate_transform_falls_back_to_the_coarsest_level() {
        assert_eq!(select_level(NATIVE, 3, &Affine2::scale(0.0), 1.0, None), 3);
    }
}
