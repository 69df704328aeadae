//! Closed-form cubic Bezier math in Bernstein form.

use crate::geometry::{Point3, Rect};

/// Chords shorter than this (squared) are treated as a single point by `is_flat`.
const MIN_CHORD_LENGTH_SQUARED: f32 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CubicBezierCurve {
    pub p0: Point3,
    pub p1: Point3,
    pub p2: Point3,
    pub p3: Point3,
}

impl CubicBezierCurve {
    pub const fn new(p0: Point3, p1: Point3, p2: Point3, p3: Point3) -> Self {
        Self { p0, p1, p2, p3 }
    }

    pub fn from_points(points: [Point3; 4]) -> Self {
        Self::new(points[0], points[1], points[2], points[3])
    }

    pub fn points(&self) -> [Point3; 4] {
        [self.p0, self.p1, self.p2, self.p3]
    }

    pub fn value(&self, t: f32) -> Point3 {
        let mt = 1.0 - t;
        let b0 = mt * mt * mt;
        let b1 = 3.0 * mt * mt * t;
        let b2 = 3.0 * mt * t * t;
        let b3 = t * t * t;
        self.p0 * b0 + self.p1 * b1 + self.p2 * b2 + self.p3 * b3
    }

    /// First derivative with respect to `t` (not normalized).
    pub fn tangent(&self, t: f32) -> Point3 {
        let mt = 1.0 - t;
        let d0 = self.p1 - self.p0;
        let d1 = self.p2 - self.p1;
        let d2 = self.p3 - self.p2;
        (d0 * (mt * mt) + d1 * (2.0 * mt * t) + d2 * (t * t)) * 3.0
    }

    pub fn derivative2(&self, t: f32) -> Point3 {
        let mt = 1.0 - t;
        let e0 = self.p2 - self.p1 * 2.0 + self.p0;
        let e1 = self.p3 - self.p2 * 2.0 + self.p1;
        (e0 * mt + e1 * t) * 6.0
    }

    /// De Casteljau split at `t`. The two halves share the split point exactly.
    pub fn subdivide(&self, t: f32) -> (CubicBezierCurve, CubicBezierCurve) {
        let p01 = self.p0.lerp(self.p1, t);
        let p12 = self.p1.lerp(self.p2, t);
        let p23 = self.p2.lerp(self.p3, t);
        let p012 = p01.lerp(p12, t);
        let p123 = p12.lerp(p23, t);
        let split = p012.lerp(p123, t);
        (
            CubicBezierCurve::new(self.p0, p01, p012, split),
            CubicBezierCurve::new(split, p123, p23, self.p3),
        )
    }

    /// True when both interior control points lie within `sqrt(tolerance_squared)` of
    /// the chord `p0..p3`.
    pub fn is_flat(&self, tolerance_squared: f32) -> bool {
        let chord = self.p3 - self.p0;
        let chord_length_squared = chord.length_squared();
        if chord_length_squared < MIN_CHORD_LENGTH_SQUARED {
            return self.p0.distance_squared(self.p1) <= tolerance_squared
                && self.p0.distance_squared(self.p2) <= tolerance_squared;
        }
        let deviation_squared = |point: Point3| {
            let offset = point - self.p0;
            let along = offset.dot(chord) / chord_length_squared;
            (offset - chord * along).length_squared()
        };
        deviation_squared(self.p1) <= tolerance_squared
            && deviation_squared(self.p2) <= tolerance_squared
    }

    /// Conservative bounds: the control hull, each point inflated by its radius.
    pub fn bounds(&self) -> Rect {
        let mut rect = Rect::EMPTY;
        for point in self.points() {
            rect.include_point(point);
        }
        rect
    }

    /// Control points of the derivative curve (a quadratic).
    pub(crate) fn derivative_points(&self) -> [Point3; 3] {
        [
            (self.p1 - self.p0) * 3.0,
            (self.p2 - self.p1) * 3.0,
            (self.p3 - self.p2) * 3.0,
        ]
    }
}

/// Evaluates a Bezier curve of arbitrary degree given its control points.
pub(crate) fn evaluate_bernstein(points: &[Point3], t: f32) -> Point3 {
    let mut scratch = [Point3::ZERO; 4];
    let degree_plus_one = points.len();
    assert!(
        (1..=4).contains(&degree_plus_one),
        "bernstein evaluation supports up to cubic curves"
    );
    scratch[..degree_plus_one].copy_from_slice(points);
    for level in 1..degree_plus_one {
        for index in 0..degree_plus_one - level {
            scratch[index] = scratch[index].lerp(scratch[index + 1], t);
        }
    }
    scratch[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_curve() -> CubicBezierCurve {
        CubicBezierCurve::new(
            Point3::new(0.0, 0.0, 1.0),
            Point3::new(1.0, 3.0, 2.0),
            Point3::new(4.0, 3.0, 2.0),
            Point3::new(5.0, 0.0, 1.0),
        )
    }

    fn assert_close(left: Point3, right: Point3) {
        assert!(
            left.distance(right) < 1e-4,
            "expected {left:?} to be close to {right:?}"
        );
    }

    #[test]
    fn value_hits_end_points() {
        let curve = sample_curve();
        assert_eq!(curve.value(0.0), curve.p0);
        assert_close(curve.value(1.0), curve.p3);
        assert_close(curve.value(0.5), evaluate_bernstein(&curve.points(), 0.5));
    }

    #[test]
    fn tangent_matches_finite_difference() {
        let curve = sample_curve();
        let step = 1e-3;
        let numeric = (curve.value(0.3 + step) - curve.value(0.3 - step)) * (0.5 / step);
        let analytic = curve.tangent(0.3);
        assert!(numeric.distance(analytic) < 1e-2);
        let derivative = curve.derivative_points();
        assert_close(evaluate_bernstein(&derivative, 0.3), analytic);
    }

    #[test]
    fn derivative2_matches_finite_difference() {
        let curve = sample_curve();
        let step = 1e-2;
        let numeric = (curve.tangent(0.6 + step) - curve.tangent(0.6 - step)) * (0.5 / step);
        assert!(numeric.distance(curve.derivative2(0.6)) < 1e-2);
    }

    #[test]
    fn subdivide_preserves_the_curve() {
        let curve = sample_curve();
        let (left, right) = curve.subdivide(0.25);
        assert_eq!(left.p3, right.p0);
        assert_close(left.value(0.5), curve.value(0.125));
        assert_close(right.value(0.5), curve.value(0.625));
    }

    #[test]
    fn straight_curve_is_flat_and_bent_curve_is_not() {
        let straight = CubicBezierCurve::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
            Point3::new(3.0, 0.0, 0.0),
        );
        assert!(straight.is_flat(1e-6));
        assert!(!sample_curve().is_flat(0.25));
        assert!(sample_curve().is_flat(16.0));
    }

    #[test]
    fn zero_chord_does_not_divide_by_zero() {
        let point = Point3::new(2.0, 2.0, 1.0);
        let degenerate = CubicBezierCurve::new(point, point, point, point);
        assert!(degenerate.is_flat(0.0));
        let loop_curve = CubicBezierCurve::new(point, Point3::new(4.0, 2.0, 1.0), point, point);
        assert!(!loop_curve.is_flat(1.0));
    }
}
