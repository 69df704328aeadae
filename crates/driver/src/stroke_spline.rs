use spline::{BezierSpline, BezierSplineBuilder, BezierSplineBuilderConfig, Point3};

use crate::{DriverError, EventTimestampMicros, RawPointerInput, SplineUpdate, StrokeContext};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrokeSplineDriverConfig {
    /// Samples closer than this to the second-to-last sample replace the last one.
    pub noise_threshold: f32,
    pub max_fit_error_sqr: f32,
    /// Extra squared fit error allowed per squared unit of sample speed.
    pub fit_error_acc: f32,
    /// Radius at zero pressure.
    pub min_radius: f32,
    /// Radius at full pressure.
    pub max_radius: f32,
    pub max_stroke_radius_rate: f32,
}

impl Default for StrokeSplineDriverConfig {
    fn default() -> Self {
        Self {
            noise_threshold: 1.0,
            max_fit_error_sqr: 0.25,
            fit_error_acc: 0.0,
            min_radius: 0.5,
            max_radius: 8.0,
            max_stroke_radius_rate: BezierSplineBuilderConfig::default().max_stroke_radius_rate,
        }
    }
}

impl StrokeSplineDriverConfig {
    fn validate(&self) -> Result<(), DriverError> {
        let values = [
            self.noise_threshold,
            self.max_fit_error_sqr,
            self.fit_error_acc,
            self.min_radius,
            self.max_radius,
            self.max_stroke_radius_rate,
        ];
        if values.iter().any(|value| !value.is_finite() || *value < 0.0) {
            return Err(DriverError::InvalidConfig(
                "values must be finite and non-negative",
            ));
        }
        if self.max_fit_error_sqr == 0.0 {
            return Err(DriverError::InvalidConfig("max_fit_error_sqr must be positive"));
        }
        if self.max_radius < self.min_radius {
            return Err(DriverError::InvalidConfig("max_radius is below min_radius"));
        }
        Ok(())
    }

    /// Linear pressure to radius; missing pressure counts as full pressure.
    pub fn radius_for_pressure(&self, pressure: Option<f32>) -> f32 {
        let pressure = pressure.unwrap_or(1.0).clamp(0.0, 1.0);
        self.min_radius + (self.max_radius - self.min_radius) * pressure
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinishedStroke {
    /// Last update of the stroke; every node in it is stable.
    pub final_update: SplineUpdate,
    pub spline: BezierSpline,
}

/// Turns the pointer samples of one stroke into a live spline.
#[derive(Debug, Default)]
pub struct StrokeSplineDriver {
    context: Option<StrokeContext>,
    config: StrokeSplineDriverConfig,
    builder: BezierSplineBuilder,
    last_timestamp_micros: Option<EventTimestampMicros>,
    published_stable_node_count: usize,
    update_count: usize,
}

impl StrokeSplineDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stroke_context(&self) -> Option<StrokeContext> {
        self.context
    }

    pub fn builder(&self) -> &BezierSplineBuilder {
        &self.builder
    }

    pub fn begin_stroke(
        &mut self,
        context: StrokeContext,
        config: &StrokeSplineDriverConfig,
    ) -> Result<(), DriverError> {
        config.validate()?;
        if self.context.is_some() {
            return Err(DriverError::StrokeAlreadyActive);
        }
        self.context = Some(context);
        self.config = *config;
        self.builder = BezierSplineBuilder::new(BezierSplineBuilderConfig {
            max_stroke_radius_rate: config.max_stroke_radius_rate,
        });
        self.last_timestamp_micros = None;
        self.published_stable_node_count = 0;
        self.update_count = 0;
        tracing::trace!(
            target: "driver",
            stroke_session_id = context.stroke_session_id,
            pointer_id = context.pointer_id,
            "stroke begin"
        );
        Ok(())
    }

    pub fn feed_input(&mut self, input: RawPointerInput) -> Result<SplineUpdate, DriverError> {
        let context = self.context.ok_or(DriverError::NoActiveStroke)?;
        if !input.screen_x.is_finite()
            || !input.screen_y.is_finite()
            || input.pressure.is_some_and(|pressure| !pressure.is_finite())
        {
            return Err(DriverError::InvalidInput);
        }
        if self
            .last_timestamp_micros
            .is_some_and(|last| input.timestamp_micros < last)
        {
            return Err(DriverError::NonMonotonicTimestamp);
        }
        self.last_timestamp_micros = Some(input.timestamp_micros);

        let radius = self.config.radius_for_pressure(input.pressure);
        self.builder.add_point(
            Point3::new(input.screen_x, input.screen_y, radius),
            self.config.noise_threshold,
            self.config.max_fit_error_sqr,
            self.config.fit_error_acc,
        );
        Ok(self.publish(context, false))
    }

    pub fn end_stroke(&mut self) -> Result<FinishedStroke, DriverError> {
        let context = self.context.ok_or(DriverError::NoActiveStroke)?;
        let final_update = self.publish(context, true);
        self.context = None;
        let spline = std::mem::take(&mut self.builder).into_spline();
        tracing::trace!(
            target: "driver",
            stroke_session_id = context.stroke_session_id,
            nodes = spline.len(),
            "stroke end"
        );
        Ok(FinishedStroke {
            final_update,
            spline,
        })
    }

    fn publish(&mut self, context: StrokeContext, ends_stroke: bool) -> SplineUpdate {
        let spline = self.builder.spline();
        // A builder that had to refit the whole stroke reports fewer stable nodes than were
        // published; resend from there.
        let first_node_index = self
            .published_stable_node_count
            .min(self.builder.stable_node_count())
            .min(spline.len());
        let (stable_node_count, stable_bounds) = if ends_stroke {
            (spline.len(), self.builder.bounds())
        } else {
            (
                self.builder.stable_node_count(),
                self.builder.stable_bounds(),
            )
        };
        let update = SplineUpdate {
            stroke_session_id: context.stroke_session_id,
            pointer_id: context.pointer_id,
            first_node_index,
            tail_nodes: spline.nodes()[first_node_index..].to_vec(),
            stable_node_count,
            node_count: spline.len(),
            bounds: self.builder.bounds(),
            stable_bounds,
            starts_stroke: self.update_count == 0,
            ends_stroke,
            discontinuity_before: false,
            dropped_update_count_before: 0,
        };
        self.published_stable_node_count = stable_node_count;
        self.update_count += 1;
        update
    }
}

#[cfg(test)]
mod tests {
    use spline::BezierNode;

    use crate::{PointerDeviceKind, PointerEventPhase};

    use super::*;

    fn sample(index: usize) -> RawPointerInput {
        let step = index as f32;
        RawPointerInput {
            pointer_id: 3,
            device_kind: PointerDeviceKind::Pen,
            phase: PointerEventPhase::Move,
            timestamp_micros: index as u64 * 1000,
            screen_x: step * 2.0,
            screen_y: 20.0 * (step * 0.1).sin(),
            pressure: Some(0.5),
        }
    }

    #[test]
    fn rewound_builder_resends_from_its_stable_prefix() {
        let config = StrokeSplineDriverConfig::default();
        let context = StrokeContext {
            stroke_session_id: 9,
            pointer_id: 3,
        };
        let mut driver = StrokeSplineDriver::new();
        driver.begin_stroke(context, &config).expect("begin stroke");

        let mut mirrored: Vec<BezierNode> = Vec::new();
        for index in 0..120 {
            driver
                .feed_input(sample(index))
                .expect("feed input")
                .apply_to(&mut mirrored);
        }
        assert!(driver.published_stable_node_count > 0);

        // Same state a whole-stroke refit leaves behind: nothing stable yet.
        let mut rewound = BezierSplineBuilder::new(BezierSplineBuilderConfig {
            max_stroke_radius_rate: config.max_stroke_radius_rate,
        });
        for index in 0..3 {
            let input = sample(index);
            let radius = config.radius_for_pressure(input.pressure);
            rewound.add_point(
                Point3::new(input.screen_x, input.screen_y, radius),
                config.noise_threshold,
                config.max_fit_error_sqr,
                config.fit_error_acc,
            );
        }
        assert!(rewound.stable_node_count() < driver.published_stable_node_count);
        driver.builder = rewound;

        let update = driver.feed_input(sample(3)).expect("feed input");
        assert!(update.first_node_index <= update.stable_node_count);
        update.apply_to(&mut mirrored);
        assert_eq!(mirrored.as_slice(), driver.builder().spline().nodes());
    }
}
