//! Gather acquisition.
//!
//! The Power PMAC gather buffer samples up to a few dozen controller variables
//! every `gather.Period` servo ticks. A run goes through these steps:
//!
//! 1. Plan: convert a requested duration into a sample count (or back) with
//!    [`ServoClock`] and [`GatherPlan`].
//! 2. Configure: write the statements from [`encode_settings`] to a file on the
//!    controller and execute it with `gpascii -i`.
//! 3. Reconcile: read `gather.MaxLines` and shrink the plan if the buffer is
//!    too small for the request.
//! 4. Capture: arm the buffer with `gather.enable=2` and poll `gather.Samples`.
//! 5. Retrieve: upload the buffer with `gather <file> -u`, download the file and
//!    parse it with [`parse_results`].
//!
//! [`AcquisitionController`] drives a bare run; [`ProgramRunner`] wraps the
//! capture around a motion program; [`run_tune_program`] collects the output of
//! the controller's stand-alone tuning executables.

pub mod cancel;
pub mod config;
pub mod controller;
pub mod error;
pub mod parse;
pub mod plan;
pub mod program;
pub mod settings;
pub mod tune;

#[cfg(test)]
pub(crate) mod testing;

pub use cancel::CancelToken;
pub use config::GatherConfig;
pub use controller::{Acquisition, AcquisitionController, GatherOutcome, GatherState};
pub use error::{GatherError, GatherResult, GatherStep};
pub use parse::{parse_results, ParsedDataset};
pub use plan::{GatherPlan, Reconciled, ServoClock, DEFAULT_SERVO_PERIOD};
pub use program::{CancelReason, ProgramRequest, ProgramRunner};
pub use settings::{decode_settings, encode_settings, read_device_settings, GatherSettings, SettingValue};
pub use tune::{run_tune_program, tune_columns, TUNE_RESULT_PATH};

/// Servo tick counter; gathered as the time axis of a run.
pub const SERVO_COUNT_ADDR: &str = "Sys.ServoCount.a";

/// Largest `gather.MaxSamples` the controller accepts.
pub const MAX_SAMPLES: u64 = 0x7FFF_FFFF;

/// Whether `address` is the servo tick counter (names are case-insensitive).
pub fn is_time_source(address: &str) -> bool {
    address.eq_ignore_ascii_case(SERVO_COUNT_ADDR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_source_is_case_insensitive() {
        assert!(is_time_source("Sys.ServoCount.a"));
        assert!(is_time_source("sys.servocount.A"));
        assert!(!is_time_source("Sys.ServoCount"));
    }
}
