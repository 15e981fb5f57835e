//! Sample count and duration planning.
//!
//! One law ties the two together:
//!
//! ```text
//! samples = floor(duration / (servo_period * period))
//! ```
//!
//! where `servo_period` is the controller's tick length in seconds and `period`
//! is the number of ticks between two gathered samples.

use tracing::info;

use super::error::{GatherError, GatherResult, GatherStep, StepContext};
use crate::comm::{CommError, PmacChannel, SERVO_PERIOD_VAR};

/// Servo period of a stock Power PMAC, in seconds.
pub const DEFAULT_SERVO_PERIOD: f64 = 0.442673749446658e-3;

/// Above 2^53 sample counts no longer convert to f64 exactly.
const EXACT_SAMPLE_LIMIT: u64 = 1 << 53;

/// Servo tick length of one controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServoClock {
    servo_period: f64,
}

impl Default for ServoClock {
    fn default() -> Self {
        Self {
            servo_period: DEFAULT_SERVO_PERIOD,
        }
    }
}

impl ServoClock {
    /// Clock with the given servo period in seconds.
    pub fn new(servo_period: f64) -> Self {
        Self { servo_period }
    }

    /// Read the servo period from the controller (`Sys.ServoPeriod`, reported in ms).
    pub fn from_device<C: PmacChannel>(channel: &mut C) -> GatherResult<Self> {
        let period_ms: f64 = channel
            .get_parsed(SERVO_PERIOD_VAR)
            .during(GatherStep::ReadServoPeriod)?;

        if !period_ms.is_finite() || period_ms <= 0.0 {
            return Err(GatherError::from_comm(
                GatherStep::ReadServoPeriod,
                CommError::InvalidResponse(format!("{SERVO_PERIOD_VAR}={period_ms}")),
            ));
        }

        let clock = Self::new(period_ms * 1e-3);
        info!("Servo period is {} s", clock.servo_period);
        Ok(clock)
    }

    /// Seconds per servo tick.
    pub fn servo_period(&self) -> f64 {
        self.servo_period
    }

    /// Samples that fit in `duration` seconds, rounded down.
    ///
    /// Negative and NaN durations give 0.
    pub fn samples_for(&self, period: u32, duration: f64) -> u64 {
        let estimate = (duration / self.sample_interval(period)).floor();
        if estimate.is_nan() || estimate < 0.0 {
            return 0;
        }

        let mut samples = estimate as u64;
        if samples >= EXACT_SAMPLE_LIMIT {
            return samples;
        }

        // Division rounding can land one off the true floor either way
        while samples > 0 && self.duration_for(period, samples) > duration {
            samples -= 1;
        }
        while self.duration_for(period, samples + 1) <= duration {
            samples += 1;
        }
        samples
    }

    /// Seconds covered by `samples` samples.
    pub fn duration_for(&self, period: u32, samples: u64) -> f64 {
        samples as f64 * self.sample_interval(period)
    }

    /// Fit a request into the device buffer.
    ///
    /// A request larger than `device_max` is cut down to `device_max` and its
    /// duration recomputed; otherwise it passes through unchanged.
    pub fn reconcile(&self, requested: u64, device_max: u64, period: u32) -> Reconciled {
        let truncated = device_max < requested;
        let samples = if truncated { device_max } else { requested };
        Reconciled {
            samples,
            duration: self.duration_for(period, samples),
            truncated,
        }
    }

    fn sample_interval(&self, period: u32) -> f64 {
        self.servo_period * f64::from(period)
    }
}

/// Outcome of [`ServoClock::reconcile`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciled {
    pub samples: u64,
    pub duration: f64,
    /// Whether the request exceeded the buffer
    pub truncated: bool,
}

impl Reconciled {
    /// A truncation that left nothing to gather.
    pub fn is_degenerate(&self) -> bool {
        self.truncated && self.samples == 0
    }
}

/// What to gather and for how long.
#[derive(Debug, Clone, PartialEq)]
pub struct GatherPlan {
    /// Gathered variables, in column order
    pub addresses: Vec<String>,
    /// Servo ticks per sample (at least 1)
    pub period: u32,
    pub samples: u64,
    /// Seconds
    pub duration: f64,
}

impl GatherPlan {
    /// Plan a run lasting `duration` seconds.
    pub fn from_duration(
        clock: &ServoClock,
        addresses: Vec<String>,
        period: u32,
        duration: f64,
    ) -> GatherResult<Self> {
        validate(&addresses, period)?;
        if !duration.is_finite() || duration < 0.0 {
            return Err(GatherError::InvalidRequest(format!(
                "Invalid gather duration: {duration}"
            )));
        }

        Ok(Self {
            samples: clock.samples_for(period, duration),
            addresses,
            period,
            duration,
        })
    }

    /// Plan a run of exactly `samples` samples.
    pub fn from_samples(
        clock: &ServoClock,
        addresses: Vec<String>,
        period: u32,
        samples: u64,
    ) -> GatherResult<Self> {
        validate(&addresses, period)?;
        Ok(Self {
            duration: clock.duration_for(period, samples),
            addresses,
            period,
            samples,
        })
    }

    /// Adopt a reconciled sample count.
    pub fn apply(&mut self, reconciled: &Reconciled) {
        self.samples = reconciled.samples;
        self.duration = reconciled.duration;
    }
}

fn validate(addresses: &[String], period: u32) -> GatherResult<()> {
    if addresses.is_empty() {
        return Err(GatherError::InvalidRequest(
            "At least one gather address is required".to_string(),
        ));
    }
    if period == 0 {
        return Err(GatherError::InvalidRequest(
            "Gather period must be at least 1 servo cycle".to_string(),
        ));
    }
    Ok(())
}
