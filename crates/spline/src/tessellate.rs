//! Adaptive flattening of splines into polylines for rendering.

use crate::curve::CubicBezierCurve;
use crate::geometry::Point3;
use crate::spline::BezierSpline;

const MAX_SUBDIVISION_DEPTH: u32 = 16;

/// Appends the polyline approximation of `spline` to `output`.
///
/// Each segment is halved until its control points deviate from the chord by at most
/// `sqrt(flatness_tolerance_squared)`. Segment start points are emitted once; the last
/// node closes the polyline. A single-node spline yields its point.
pub fn tessellate(spline: &BezierSpline, flatness_tolerance_squared: f32, output: &mut Vec<Point3>) {
    let Some(first) = spline.first() else {
        return;
    };
    output.push(first.point);
    for segment in spline.segments() {
        flatten_segment(&segment, flatness_tolerance_squared, 0, output);
    }
}

/// Tessellates only the segments starting at node `first_node`, for callers that cache
/// the stable prefix of a growing stroke.
pub fn tessellate_from(
    spline: &BezierSpline,
    first_node: usize,
    flatness_tolerance_squared: f32,
    output: &mut Vec<Point3>,
) {
    if first_node >= spline.len() {
        return;
    }
    output.push(spline.nodes()[first_node].point);
    for index in first_node..spline.segment_count() {
        flatten_segment(&spline.segment(index), flatness_tolerance_squared, 0, output);
    }
}

fn flatten_segment(
    curve: &CubicBezierCurve,
    flatness_tolerance_squared: f32,
    depth: u32,
    output: &mut Vec<Point3>,
) {
    if depth >= MAX_SUBDIVISION_DEPTH || curve.is_flat(flatness_tolerance_squared) {
        output.push(curve.p3);
        return;
    }
    let (left, right) = curve.subdivide(0.5);
    flatten_segment(&left, flatness_tolerance_squared, depth + 1, output);
    flatten_segment(&right, flatness_tolerance_squared, depth + 1, output);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spline::BezierNode;

    fn arch() -> BezierSpline {
        BezierSpline::from_nodes(vec![
            BezierNode {
                ctrl_in: Point3::new(0.0, 0.0, 1.0),
                point: Point3::new(0.0, 0.0, 1.0),
                ctrl_out: Point3::new(0.0, 40.0, 1.0),
            },
            BezierNode {
                ctrl_in: Point3::new(60.0, 40.0, 1.0),
                point: Point3::new(60.0, 0.0, 1.0),
                ctrl_out: Point3::new(60.0, 0.0, 1.0),
            },
        ])
    }

    #[test]
    fn straight_segment_emits_only_end_points() {
        let spline = BezierSpline::from_nodes(vec![
            BezierNode::corner(Point3::new(0.0, 0.0, 1.0)),
            BezierNode::corner(Point3::new(10.0, 0.0, 1.0)),
        ]);
        let mut polyline = Vec::new();
        tessellate(&spline, 0.01, &mut polyline);
        assert_eq!(
            polyline,
            vec![Point3::new(0.0, 0.0, 1.0), Point3::new(10.0, 0.0, 1.0)]
        );
    }

    #[test]
    fn tighter_tolerance_produces_more_vertices() {
        let spline = arch();
        let mut coarse = Vec::new();
        let mut fine = Vec::new();
        tessellate(&spline, 4.0, &mut coarse);
        tessellate(&spline, 0.01, &mut fine);
        assert!(fine.len() > coarse.len());
        assert_eq!(fine.first(), Some(&Point3::new(0.0, 0.0, 1.0)));
        assert_eq!(fine.last(), Some(&Point3::new(60.0, 0.0, 1.0)));
        let curve = spline.segment(0);
        for vertex in &fine {
            let nearest = (0..=200)
                .map(|step| curve.value(step as f32 / 200.0).distance(*vertex))
                .fold(f32::INFINITY, f32::min);
            assert!(nearest < 0.5);
        }
    }

    #[test]
    fn tessellate_from_skips_the_cached_prefix() {
        let mut spline = arch();
        spline.push(BezierNode::corner(Point3::new(90.0, 0.0, 1.0)));
        let mut tail = Vec::new();
        tessellate_from(&spline, 1, 0.01, &mut tail);
        assert_eq!(tail, vec![Point3::new(60.0, 0.0, 1.0), Point3::new(90.0, 0.0, 1.0)]);
        let mut nothing = Vec::new();
        tessellate_from(&spline, 5, 0.01, &mut nothing);
        assert!(nothing.is_empty());
    }
}
