//! Acquisition error kinds.

use thiserror::Error;

use crate::comm::CommError;

/// Protocol step an acquisition was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum GatherStep {
    ReadServoPeriod,
    Disable,
    WriteConfig,
    ApplyConfig,
    ReadCapacity,
    WriteMaxSamples,
    OpenSession,
    Arm,
    Poll,
    SendScript,
    StartProgram,
    StopProgram,
    Drain,
    Disarm,
    CloseSession,
    Upload,
    Download,
    WaitForCompletion,
}

impl GatherStep {
    /// Steps that store or apply the buffer configuration.
    fn is_config_write(self) -> bool {
        matches!(
            self,
            GatherStep::WriteConfig | GatherStep::ApplyConfig | GatherStep::WriteMaxSamples
        )
    }
}

/// Errors that end an acquisition.
///
/// Buffer overflow and malformed result rows are absorbed by replanning and row
/// skipping respectively, and cancellation is a normal outcome, so none of them
/// appear here.
#[derive(Error, Debug)]
pub enum GatherError {
    /// The controller could not store or apply the gather configuration.
    #[error("Failed to write gather configuration during {step}: {source}")]
    ConfigWriteFailed { step: GatherStep, source: CommError },

    /// A shell, variable or program command failed.
    #[error("Device command failed during {step}: {source}")]
    DeviceCommandFailed { step: GatherStep, source: CommError },

    /// A blocking wait ran past its deadline.
    #[error("Timed out during {step}: {source}")]
    Timeout { step: GatherStep, source: CommError },

    /// The acquisition request itself is unusable.
    #[error("Invalid gather request: {0}")]
    InvalidRequest(String),
}

/// Result type for acquisition operations.
pub type GatherResult<T> = Result<T, GatherError>;

impl GatherError {
    /// Classify a channel failure that happened during `step`.
    pub fn from_comm(step: GatherStep, source: CommError) -> Self {
        match source {
            CommError::Timeout => GatherError::Timeout { step, source },
            _ if step.is_config_write() => GatherError::ConfigWriteFailed { step, source },
            _ => GatherError::DeviceCommandFailed { step, source },
        }
    }

    /// The step that failed, if the error came from the device.
    pub fn step(&self) -> Option<GatherStep> {
        match self {
            GatherError::ConfigWriteFailed { step, .. }
            | GatherError::DeviceCommandFailed { step, .. }
            | GatherError::Timeout { step, .. } => Some(*step),
            GatherError::InvalidRequest(_) => None,
        }
    }
}

/// Attach the failing [`GatherStep`] to a channel result.
pub(crate) trait StepContext<T> {
    fn during(self, step: GatherStep) -> GatherResult<T>;
}

impl<T> StepContext<T> for Result<T, CommError> {
    fn during(self, step: GatherStep) -> GatherResult<T> {
        self.map_err(|e| GatherError::from_comm(step, e))
    }
}
