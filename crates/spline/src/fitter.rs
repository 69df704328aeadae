//! Least-squares cubic Bezier fitting over a borrowed point slice.
//!
//! Schneider's algorithm in the shape popularized by paper.js: chord-length
//! parameterize, solve for the two handle lengths, refine parameters with
//! Newton-Raphson, and split at the worst point when a single cubic does not fit.
//! Positions and radii are fitted together since the radius is the third axis.

use crate::curve::{CubicBezierCurve, evaluate_bernstein};
use crate::geometry::{GEOMETRY_EPSILON, Point3};
use crate::spline::{BezierNode, BezierSpline};

const MAX_FIT_ITERATIONS: usize = 5;
const SOLVER_EPSILON: f32 = 1e-12;

/// A single-curve fit that missed the tolerance.
struct RejectedFit {
    /// Index of the worst fitted point, where the range is split.
    split: usize,
    curve: Option<CubicBezierCurve>,
    /// Parameters `curve` was generated with.
    parameters: Vec<f32>,
}

/// Fits a spline to `points`. The slice is borrowed, not copied, and must outlive
/// the fitter.
#[derive(Debug, Clone, Copy)]
pub struct BezierSplineFitter<'a> {
    points: &'a [Point3],
}

impl<'a> BezierSplineFitter<'a> {
    pub fn new(points: &'a [Point3]) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &'a [Point3] {
        self.points
    }

    /// Replaces the contents of `output` with a spline approximating the points.
    ///
    /// Every point lies within `sqrt(max_error_squared)` of the fitted curve. Tangents
    /// point away from the first point and back into the last point respectively; when
    /// omitted (or zero) they are derived from the neighbouring input points.
    pub fn fit(
        &self,
        output: &mut BezierSpline,
        max_error_squared: f32,
        left_tangent: Option<Point3>,
        right_tangent: Option<Point3>,
    ) {
        output.clear();
        let Some(&first_point) = self.points.first() else {
            return;
        };
        output.push(BezierNode::corner(first_point));
        let point_count = self.points.len();
        if point_count == 1 {
            return;
        }

        let last = point_count - 1;
        let tan1 = explicit_tangent(left_tangent)
            .unwrap_or_else(|| (self.points[1] - self.points[0]).normalized());
        let tan2 = explicit_tangent(right_tangent)
            .unwrap_or_else(|| (self.points[last - 1] - self.points[last]).normalized());

        let mut parameters = Vec::with_capacity(point_count);
        self.fit_cubic(output, &mut parameters, max_error_squared, 0, last, tan1, tan2);
    }

    pub fn fit_to_new(
        &self,
        max_error_squared: f32,
        left_tangent: Option<Point3>,
        right_tangent: Option<Point3>,
    ) -> BezierSpline {
        let mut output = BezierSpline::with_capacity(self.points.len().min(16));
        self.fit(&mut output, max_error_squared, left_tangent, right_tangent);
        output
    }

    #[allow(clippy::too_many_arguments)]
    fn fit_cubic(
        &self,
        output: &mut BezierSpline,
        parameters: &mut Vec<f32>,
        max_error_squared: f32,
        first: usize,
        last: usize,
        tan1: Point3,
        tan2: Point3,
    ) {
        let points = self.points;
        if last - first == 1 {
            let start = points[first];
            let end = points[last];
            let handle_length = start.distance(end) / 3.0;
            output.append_curve([
                start,
                start + tan1 * handle_length,
                end + tan2 * handle_length,
                end,
            ]);
            return;
        }

        chord_length_parameterize(&points[first..=last], parameters);
        let attempt =
            self.attempt_single_curve(first, last, parameters, max_error_squared, tan1, tan2);
        let rejected = match attempt {
            Ok(curve) => {
                output.append_curve(curve.points());
                return;
            }
            Err(rejected) => rejected,
        };

        let split = rejected.split;
        let tan_center = split_tangent(
            points,
            first,
            split,
            &rejected.parameters,
            rejected.curve.as_ref(),
        );
        self.fit_cubic(output, parameters, max_error_squared, first, split, tan1, tan_center);
        self.fit_cubic(output, parameters, max_error_squared, split, last, -tan_center, tan2);
    }

    /// Fits one cubic to `first..=last`, refining `parameters` in place between attempts.
    /// On failure returns the last rejected curve with the parameters it was built from.
    fn attempt_single_curve(
        &self,
        first: usize,
        last: usize,
        parameters: &mut [f32],
        max_error_squared: f32,
        tan1: Point3,
        tan2: Point3,
    ) -> Result<CubicBezierCurve, RejectedFit> {
        let mut relaxed_error = max_error_squared.max(max_error_squared * max_error_squared);
        let mut rejected = RejectedFit {
            split: first + (last - first + 1) / 2,
            curve: None,
            parameters: Vec::new(),
        };

        for _ in 0..MAX_FIT_ITERATIONS {
            let curve = self.generate_bezier(first, last, parameters, tan1, tan2);
            let (error, worst_index) = self.find_max_error(first, last, &curve, parameters);
            if error < max_error_squared {
                return Ok(curve);
            }
            rejected.split = worst_index;
            rejected.curve = Some(curve);
            rejected.parameters.clear();
            rejected.parameters.extend_from_slice(parameters);
            if error >= relaxed_error {
                break;
            }
            if !self.reparameterize(first, last, parameters, &curve) {
                break;
            }
            relaxed_error = error;
        }
        Err(rejected)
    }

    /// Solves the 2x2 least-squares system for the handle lengths along `tan1`/`tan2`.
    fn generate_bezier(
        &self,
        first: usize,
        last: usize,
        parameters: &[f32],
        tan1: Point3,
        tan2: Point3,
    ) -> CubicBezierCurve {
        let start = self.points[first];
        let end = self.points[last];

        let mut c00 = 0.0f32;
        let mut c01 = 0.0f32;
        let mut c11 = 0.0f32;
        let mut x0 = 0.0f32;
        let mut x1 = 0.0f32;
        for (offset, &u) in parameters.iter().enumerate() {
            let t = 1.0 - u;
            let b = 3.0 * u * t;
            let b0 = t * t * t;
            let b1 = b * t;
            let b2 = b * u;
            let b3 = u * u * u;
            let a1 = tan1 * b1;
            let a2 = tan2 * b2;
            let residual = self.points[first + offset] - start * (b0 + b1) - end * (b2 + b3);
            c00 += a1.dot(a1);
            c01 += a1.dot(a2);
            c11 += a2.dot(a2);
            x0 += residual.dot(a1);
            x1 += residual.dot(a2);
        }

        let segment_length = start.distance(end);
        let heuristic = segment_length / 3.0;
        let determinant = c00 * c11 - c01 * c01;
        let (mut alpha1, mut alpha2) = if determinant.abs() > SOLVER_EPSILON {
            (
                (x0 * c11 - x1 * c01) / determinant,
                (c00 * x1 - c01 * x0) / determinant,
            )
        } else {
            (heuristic, heuristic)
        };

        // Negative or vanishing handles, and handles that cross each other along the
        // chord, fall back to the Wu/Barsky one-third rule.
        let minimum_alpha = SOLVER_EPSILON * segment_length;
        if !(alpha1 >= minimum_alpha && alpha2 >= minimum_alpha) {
            alpha1 = heuristic;
            alpha2 = heuristic;
        } else {
            let chord = end - start;
            let handle1 = tan1 * alpha1;
            let handle2 = tan2 * alpha2;
            if handle1.dot(chord) - handle2.dot(chord) > segment_length * segment_length {
                alpha1 = heuristic;
                alpha2 = heuristic;
            }
        }

        CubicBezierCurve::new(start, start + tan1 * alpha1, end + tan2 * alpha2, end)
    }

    /// Largest squared distance of an interior point from its parameterized position,
    /// with the index of that point. Ties keep the middle index.
    fn find_max_error(
        &self,
        first: usize,
        last: usize,
        curve: &CubicBezierCurve,
        parameters: &[f32],
    ) -> (f32, usize) {
        let mut worst_index = first + (last - first + 1) / 2;
        let mut max_distance = 0.0f32;
        for index in first + 1..last {
            let fitted = curve.value(parameters[index - first]);
            let distance = fitted.distance_squared(self.points[index]);
            if distance > max_distance {
                max_distance = distance;
                worst_index = index;
            }
        }
        (max_distance, worst_index)
    }

    /// One Newton-Raphson step per point. Returns false when the refined parameters are
    /// no longer strictly increasing.
    fn reparameterize(
        &self,
        first: usize,
        last: usize,
        parameters: &mut [f32],
        curve: &CubicBezierCurve,
    ) -> bool {
        for index in first..=last {
            let slot = &mut parameters[index - first];
            *slot = find_root(curve, self.points[index], *slot);
        }
        parameters.windows(2).all(|pair| pair[1] > pair[0])
    }
}

fn explicit_tangent(tangent: Option<Point3>) -> Option<Point3> {
    tangent
        .map(Point3::normalized)
        .filter(|tangent| *tangent != Point3::ZERO)
}

/// Cumulative chord length mapped to `[0, 1]`. Coincident points fall back to a
/// uniform parameterization.
fn chord_length_parameterize(points: &[Point3], parameters: &mut Vec<f32>) {
    parameters.clear();
    parameters.push(0.0);
    let mut total = 0.0f32;
    for pair in points.windows(2) {
        total += pair[1].distance(pair[0]);
        parameters.push(total);
    }
    let last_index = points.len() - 1;
    if total <= GEOMETRY_EPSILON {
        for (index, parameter) in parameters.iter_mut().enumerate() {
            *parameter = index as f32 / last_index as f32;
        }
        return;
    }
    for parameter in parameters.iter_mut() {
        *parameter /= total;
    }
    parameters[last_index] = 1.0;
}

/// Newton-Raphson step for `(Q(u) - P) . Q'(u) = 0`.
pub(crate) fn find_root(curve: &CubicBezierCurve, point: Point3, u: f32) -> f32 {
    let first_derivative = curve.derivative_points();
    let second_derivative = [
        (first_derivative[1] - first_derivative[0]) * 2.0,
        (first_derivative[2] - first_derivative[1]) * 2.0,
    ];
    let offset = curve.value(u) - point;
    let velocity = evaluate_bernstein(&first_derivative, u);
    let acceleration = evaluate_bernstein(&second_derivative, u);
    let numerator = offset.dot(velocity);
    let denominator = velocity.dot(velocity) + offset.dot(acceleration);
    if denominator.abs() <= SOLVER_EPSILON || !denominator.is_finite() {
        return u;
    }
    u - numerator / denominator
}

/// Tangent at the split point, taken from the rejected curve around the split, or from
/// the neighbouring input points when the curve is degenerate there.
fn split_tangent(
    points: &[Point3],
    first: usize,
    split: usize,
    parameters: &[f32],
    curve: Option<&CubicBezierCurve>,
) -> Point3 {
    let from_curve = curve
        .map(|curve| {
            curve.value(parameters[split - 1 - first]) - curve.value(parameters[split + 1 - first])
        })
        .map(Point3::normalized)
        .filter(|tangent| *tangent != Point3::ZERO && tangent.is_finite());
    from_curve.unwrap_or_else(|| (points[split - 1] - points[split + 1]).normalized())
}
