use serde::{Deserialize, Serialize};

use crate::curve::CubicBezierCurve;
use crate::geometry::{Point3, Rect};

/// A point on a spline with its incoming and outgoing handles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BezierNode {
    pub ctrl_in: Point3,
    pub point: Point3,
    pub ctrl_out: Point3,
}

impl BezierNode {
    /// A node whose handles coincide with its point.
    pub const fn corner(point: Point3) -> Self {
        Self {
            ctrl_in: point,
            point,
            ctrl_out: point,
        }
    }

    fn include_in(&self, rect: &mut Rect) {
        rect.include_point(self.ctrl_in);
        rect.include_point(self.point);
        rect.include_point(self.ctrl_out);
    }
}

/// Ordered node list; `N` nodes encode `N - 1` cubic segments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BezierSpline {
    nodes: Vec<BezierNode>,
}

impl BezierSpline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
        }
    }

    pub fn from_nodes(nodes: Vec<BezierNode>) -> Self {
        Self { nodes }
    }

    pub fn nodes(&self) -> &[BezierNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn segment_count(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    pub fn push(&mut self, node: BezierNode) {
        self.nodes.push(node);
    }

    pub fn pop(&mut self) -> Option<BezierNode> {
        self.nodes.pop()
    }

    pub fn first(&self) -> Option<&BezierNode> {
        self.nodes.first()
    }

    pub fn last(&self) -> Option<&BezierNode> {
        self.nodes.last()
    }

    pub fn last_mut(&mut self) -> Option<&mut BezierNode> {
        self.nodes.last_mut()
    }

    pub fn truncate(&mut self, len: usize) {
        self.nodes.truncate(len);
    }

    pub fn extend_from_slice(&mut self, nodes: &[BezierNode]) {
        self.nodes.extend_from_slice(nodes);
    }

    pub fn into_nodes(self) -> Vec<BezierNode> {
        self.nodes
    }

    /// Segment between `nodes[index]` and `nodes[index + 1]`.
    pub fn segment(&self, index: usize) -> CubicBezierCurve {
        let start = &self.nodes[index];
        let end = &self.nodes[index + 1];
        CubicBezierCurve::new(start.point, start.ctrl_out, end.ctrl_in, end.point)
    }

    pub fn segments(&self) -> impl Iterator<Item = CubicBezierCurve> + '_ {
        self.nodes.windows(2).map(|pair| {
            CubicBezierCurve::new(pair[0].point, pair[0].ctrl_out, pair[1].ctrl_in, pair[1].point)
        })
    }

    /// Appends a fitted segment: sets the current last node's outgoing handle and adds
    /// the segment's end node.
    pub(crate) fn append_curve(&mut self, curve: [Point3; 4]) {
        let previous = self
            .nodes
            .last_mut()
            .expect("append_curve requires a start node");
        previous.ctrl_out = curve[1];
        self.nodes.push(BezierNode {
            ctrl_in: curve[2],
            point: curve[3],
            ctrl_out: curve[3],
        });
    }

    /// Bounds of all control points of `nodes[start..]`, each inflated by its radius.
    pub fn bounds_from(&self, start: usize) -> Rect {
        let mut rect = Rect::EMPTY;
        for node in self.nodes.iter().skip(start) {
            node.include_in(&mut rect);
        }
        rect
    }

    pub fn bounds(&self) -> Rect {
        self.bounds_from(0)
    }

    pub(crate) fn include_nodes_in(&self, range: std::ops::Range<usize>, rect: &mut Rect) {
        for node in &self.nodes[range] {
            node.include_in(rect);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_pair_consecutive_nodes() {
        let mut spline = BezierSpline::new();
        spline.push(BezierNode::corner(Point3::new(0.0, 0.0, 1.0)));
        spline.append_curve([
            Point3::new(0.0, 0.0, 1.0),
            Point3::new(1.0, 1.0, 1.0),
            Point3::new(2.0, 1.0, 1.0),
            Point3::new(3.0, 0.0, 1.0),
        ]);
        assert_eq!(spline.len(), 2);
        assert_eq!(spline.segment_count(), 1);
        let segment = spline.segment(0);
        assert_eq!(segment.p1, Point3::new(1.0, 1.0, 1.0));
        assert_eq!(segment.p2, Point3::new(2.0, 1.0, 1.0));
        assert_eq!(spline.segments().count(), 1);
        assert_eq!(spline.bounds(), Rect::new(-1.0, -1.0, 4.0, 2.0));
    }

    #[test]
    fn single_node_spline_has_no_segments() {
        let mut spline = BezierSpline::new();
        spline.push(BezierNode::corner(Point3::new(5.0, 5.0, 0.5)));
        assert_eq!(spline.segment_count(), 0);
        assert_eq!(spline.segments().count(), 0);
        assert_eq!(spline.bounds(), Rect::new(4.5, 4.5, 5.5, 5.5));
    }
}
