//! Incremental spline construction over a live stream of stroke samples.
//!
//! Only the tail of the spline is refitted when a sample arrives: once the spline has
//! more than two nodes, the last segment is dropped and the input points from its start
//! node onward are fitted again with the incoming tangent of that node pinned. Every
//! node before that start node is final, which lets renderers cache the stable prefix.

use serde::{Deserialize, Serialize};

use crate::fitter::BezierSplineFitter;
use crate::geometry::{Point3, Rect};
use crate::spline::{BezierNode, BezierSpline};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BezierSplineBuilderConfig {
    /// Largest radius change per unit of xy distance between consecutive samples.
    pub max_stroke_radius_rate: f32,
}

impl Default for BezierSplineBuilderConfig {
    fn default() -> Self {
        Self {
            max_stroke_radius_rate: 0.5,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BezierSplineBuilder {
    config: BezierSplineBuilderConfig,
    input_points: Vec<Point3>,
    spline: BezierSpline,
    scratch: BezierSpline,
    stable_node_count: usize,
    stable_bounds: Rect,
    mutable_bounds: Rect,
}

impl BezierSplineBuilder {
    pub fn new(config: BezierSplineBuilderConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> BezierSplineBuilderConfig {
        self.config
    }

    /// Raw samples after noise filtering and radius clamping.
    pub fn input_points(&self) -> &[Point3] {
        &self.input_points
    }

    pub fn spline(&self) -> &BezierSpline {
        &self.spline
    }

    pub fn into_spline(self) -> BezierSpline {
        self.spline
    }

    /// Number of leading nodes that later `add_point` calls will never modify.
    pub fn stable_node_count(&self) -> usize {
        self.stable_node_count
    }

    pub fn stable_bounds(&self) -> Rect {
        self.stable_bounds
    }

    /// Bounds of every emitted control point, inflated by its radius.
    pub fn bounds(&self) -> Rect {
        self.mutable_bounds
    }

    pub fn reset(&mut self) {
        self.input_points.clear();
        self.spline.clear();
        self.scratch.clear();
        self.stable_node_count = 0;
        self.stable_bounds = Rect::EMPTY;
        self.mutable_bounds = Rect::EMPTY;
    }

    /// Feeds one sample and returns the stable node count.
    ///
    /// Samples within `noise_threshold` of the second-to-last input replace the last
    /// input instead of extending the stroke. `fit_error_acc` widens the refit
    /// tolerance by `fit_error_acc * speed^2`, where speed is the distance covered by
    /// the latest sample.
    pub fn add_point(
        &mut self,
        point: Point3,
        noise_threshold: f32,
        max_fit_error_squared: f32,
        fit_error_acc: f32,
    ) -> usize {
        self.record_input(point, noise_threshold);
        self.refit(max_fit_error_squared, fit_error_acc);
        self.update_bounds();
        self.stable_node_count
    }

    fn record_input(&mut self, point: Point3, noise_threshold: f32) {
        let count = self.input_points.len();
        match count {
            0 => self.input_points.push(point),
            1 => {
                let only = self.input_points[0];
                if point.distance_xy(only) < noise_threshold {
                    self.input_points[0].z = only.z.max(point.z);
                } else {
                    let clamped = self.clamp_radius(only, point);
                    self.input_points.push(clamped);
                }
            }
            _ => {
                let reference = self.input_points[count - 2];
                if point.distance_xy(reference) < noise_threshold {
                    let last = self.input_points[count - 1];
                    let merged = Point3::new(point.x, point.y, last.z.max(point.z));
                    self.input_points[count - 1] = self.clamp_radius(reference, merged);
                } else {
                    let clamped = self.clamp_radius(self.input_points[count - 1], point);
                    self.input_points.push(clamped);
                }
            }
        }
    }

    fn clamp_radius(&self, previous: Point3, mut point: Point3) -> Point3 {
        let rate = self.config.max_stroke_radius_rate;
        if !rate.is_finite() {
            return point;
        }
        let max_delta = rate * previous.distance_xy(point);
        let delta = point.z - previous.z;
        if delta.abs() > max_delta {
            point.z = previous.z + max_delta.copysign(delta);
        }
        point
    }

    fn recent_speed_squared(&self) -> f32 {
        match self.input_points.as_slice() {
            [.., previous, last] => {
                let distance = last.distance_xy(*previous);
                distance * distance
            }
            _ => 0.0,
        }
    }

    fn refit(&mut self, max_fit_error_squared: f32, fit_error_acc: f32) {
        if self.spline.len() <= 2 {
            BezierSplineFitter::new(&self.input_points).fit(
                &mut self.spline,
                max_fit_error_squared,
                None,
                None,
            );
            return;
        }

        let tolerance = max_fit_error_squared + fit_error_acc * self.recent_speed_squared();
        self.spline.pop();
        let anchor = *self
            .spline
            .last()
            .expect("spline with more than two nodes keeps an anchor after pop");
        let Some(anchor_index) = self
            .input_points
            .iter()
            .position(|input| *input == anchor.point)
        else {
            tracing::warn!(
                target: "spline",
                "refit anchor not found among input points, refitting whole stroke"
            );
            BezierSplineFitter::new(&self.input_points).fit(
                &mut self.spline,
                max_fit_error_squared,
                None,
                None,
            );
            self.stable_node_count = 0;
            self.stable_bounds = Rect::EMPTY;
            return;
        };

        let pinned_tangent = anchor.point - anchor.ctrl_in;
        BezierSplineFitter::new(&self.input_points[anchor_index..]).fit(
            &mut self.scratch,
            tolerance,
            Some(pinned_tangent),
            None,
        );
        let refitted = self.scratch.nodes();
        let anchor_node = self
            .spline
            .last_mut()
            .expect("anchor node is still present");
        *anchor_node = BezierNode {
            ctrl_out: refitted[0].ctrl_out,
            ..anchor
        };
        self.spline.extend_from_slice(&refitted[1..]);
    }

    fn update_bounds(&mut self) {
        let node_count = self.spline.len();
        let stable = node_count.saturating_sub(2);
        if stable > self.stable_node_count {
            self.spline
                .include_nodes_in(self.stable_node_count..stable, &mut self.stable_bounds);
            self.stable_node_count = stable;
        }
        self.mutable_bounds = self
            .stable_bounds
            .union(&self.spline.bounds_from(self.stable_node_count));
    }
}
