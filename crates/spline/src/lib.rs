//! Stroke spline construction: cubic Bezier math, least-squares fitting of sampled
//! points, the incremental builder used while a stroke is being drawn, and adaptive
//! tessellation for rendering.

pub mod builder;
pub mod curve;
pub mod fitter;
pub mod geometry;
pub mod spline;
pub mod tessellate;

pub use builder::{BezierSplineBuilder, BezierSplineBuilderConfig};
pub use curve::CubicBezierCurve;
pub use fitter::BezierSplineFitter;
pub use geometry::{Point3, Rect};
pub use spline::{BezierNode, BezierSpline};
pub use tessellate::{tessellate, tessellate_from};
