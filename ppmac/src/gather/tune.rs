//! Stand-alone tuning executables.
//!
//! The controller ships tuning tools under `/opt/ppmac/tune` (`othertrajectory`,
//! `stepmove`, `sinesweep`, ...). Each one configures the gather buffer itself,
//! performs its move, prints `<name> finished Successfully!` and leaves the
//! gathered data in the buffer.

use std::time::Duration;

use regex::Regex;
use tracing::info;

use super::config::GatherConfig;
use super::controller::retrieve_results;
use super::error::{GatherError, GatherResult, GatherStep, StepContext};
use super::parse::ParsedDataset;
use super::plan::ServoClock;
use crate::comm::PmacChannel;

/// Line a tuning tool prints when it is done; group 1 is the tool name.
pub const TUNE_FINISHED_PATTERN: &str = r"^(.*)\s+finished Successfully!$";

/// File the tuning tools' gather data is uploaded to.
pub const TUNE_RESULT_PATH: &str = "/var/ftp/gather/othertrajectory_gather.txt";

/// Columns gathered by the tuning tools.
pub fn tune_columns() -> Vec<String> {
    ["Sys.ServoCount.a", "Desired", "Actual", "Velocity"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Run a tuning command line and retrieve what it gathered.
///
/// # Errors
///
/// Returns [`GatherError::Timeout`] if the tool does not report success within
/// `timeout`. The upload and download of its data are bounded by
/// [`GatherConfig::upload_timeout`].
pub fn run_tune_program<C: PmacChannel>(
    channel: &mut C,
    command: &str,
    result_path: &str,
    columns: &[String],
    timeout: Duration,
    config: &GatherConfig,
    clock: &ServoClock,
) -> GatherResult<ParsedDataset> {
    let finished = Regex::new(TUNE_FINISHED_PATTERN)
        .map_err(|e| GatherError::InvalidRequest(e.to_string()))?;

    channel
        .close_session()
        .during(GatherStep::CloseSession)?;
    info!("Running tune {command}");
    channel
        .shell_command(command)
        .during(GatherStep::StartProgram)?;

    let found = channel
        .wait_for(&finished, timeout)
        .during(GatherStep::WaitForCompletion)?;
    let name = found.groups.first().map(String::as_str).unwrap_or_default();
    info!("Tune finished ({name})");

    retrieve_results(
        channel,
        result_path,
        config.upload_timeout(),
        columns,
        clock,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::sim::SimulatedPmac;
    use crate::gather::testing::{Call, ScriptedChannel};
    use approx::assert_relative_eq;

    #[test]
    fn test_tune_run() {
        let mut channel = ScriptedChannel::new()
            .with_output(&[
                "Moving...",
                "UnlinkGatherThread: 1",
                "othertrajectory finished Successfully!",
            ])
            .with_file(TUNE_RESULT_PATH, &["100 1 1.1 0", "101 2 2.1 0.5", "# trailer"]);
        let clock = ServoClock::new(1e-3);

        let data = run_tune_program(
            &mut channel,
            "/opt/ppmac/tune/othertrajectory 1 0",
            TUNE_RESULT_PATH,
            &tune_columns(),
            Duration::from_secs(50),
            &GatherConfig {
                upload_timeout_secs: 120.0,
                ..GatherConfig::default()
            },
            &clock,
        )
        .unwrap();

        assert_eq!(data.len(), 2);
        assert_relative_eq!(data.rows()[1][0], 0.101, epsilon = 1e-12);
        assert_eq!(data.column("Velocity"), Some(vec![0.0, 0.5]));
        assert_eq!(
            channel.shell_commands(),
            vec![
                "/opt/ppmac/tune/othertrajectory 1 0",
                "gather /var/ftp/gather/othertrajectory_gather.txt -u",
            ]
        );
        assert_eq!(channel.position(&Call::CloseSession), Some(0));
        assert!(channel
            .deadlines
            .iter()
            .all(|(_, deadline)| *deadline == Duration::from_secs(120)));
        assert_eq!(channel.deadlines.len(), 2);
    }

    #[test]
    fn test_tune_timeout() {
        let mut pmac = SimulatedPmac::new();
        let err = run_tune_program(
            &mut pmac,
            "/opt/ppmac/tune/stepmove",
            TUNE_RESULT_PATH,
            &tune_columns(),
            Duration::from_millis(10),
            &GatherConfig::default(),
            &ServoClock::default(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            GatherError::Timeout {
                step: GatherStep::WaitForCompletion,
                ..
            }
        ));
    }
}
