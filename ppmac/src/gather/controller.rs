//! Bare gather runs.
//!
//! [`AcquisitionController`] walks the buffer through
//! `Idle -> Configuring -> Armed -> Sampling -> Draining -> Retrieving` and ends in
//! `Completed`, `Cancelled` or `Failed`. Every device interaction is a blocking
//! call; the sampling loop sleeps a fixed interval between two reads of
//! `gather.Samples` and checks the [`CancelToken`] before each read.

use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::cancel::CancelToken;
use super::config::GatherConfig;
use super::error::{GatherResult, GatherStep, StepContext};
use super::parse::{parse_results, ParsedDataset};
use super::plan::{GatherPlan, ServoClock};
use super::settings::encode_settings;
use crate::comm::PmacChannel;

/// Capture enable: `0` stops the buffer, `2` captures until `gather.MaxSamples`.
pub(crate) const ENABLE_VAR: &str = "gather.enable";
pub(crate) const SAMPLES_VAR: &str = "gather.samples";
const MAX_LINES_VAR: &str = "gather.maxlines";
const MAX_SAMPLES_VAR: &str = "gather.maxsamples";
pub(crate) const DISABLED: &str = "0";
pub(crate) const CAPTURE: &str = "2";

/// Acquisition state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum GatherState {
    Idle,
    Configuring,
    Armed,
    Sampling,
    Draining,
    Retrieving,
    Completed,
    Cancelled,
    Failed,
}

/// How a successful acquisition ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum GatherOutcome {
    /// The planned samples were captured (or the program finished).
    Completed,
    /// Cancellation was requested; the data is whatever had been captured.
    Cancelled,
}

/// Result of a finished acquisition.
#[derive(Debug, Clone)]
pub struct Acquisition {
    /// Gathered addresses, in column order
    pub addresses: Vec<String>,
    pub data: ParsedDataset,
    /// Plan that was actually executed (after any buffer truncation)
    pub plan: GatherPlan,
    /// Whether the plan was cut down to fit the buffer
    pub truncated: bool,
    pub outcome: GatherOutcome,
    /// Error lines the controller printed during the run
    pub device_errors: Vec<String>,
}

impl Acquisition {
    pub fn is_cancelled(&self) -> bool {
        self.outcome == GatherOutcome::Cancelled
    }
}

/// Current state plus every state entered so far.
#[derive(Debug, Clone)]
pub(crate) struct StateTracker {
    state: GatherState,
    history: Vec<GatherState>,
}

impl StateTracker {
    pub(crate) fn new() -> Self {
        Self {
            state: GatherState::Idle,
            history: vec![GatherState::Idle],
        }
    }

    pub(crate) fn enter(&mut self, state: GatherState) {
        debug!("Gather state {} -> {}", self.state, state);
        self.state = state;
        self.history.push(state);
    }

    pub(crate) fn state(&self) -> GatherState {
        self.state
    }

    pub(crate) fn history(&self) -> &[GatherState] {
        &self.history
    }

    /// Enter the terminal state matching `outcome`.
    pub(crate) fn finish(&mut self, outcome: GatherOutcome) {
        self.enter(match outcome {
            GatherOutcome::Completed => GatherState::Completed,
            GatherOutcome::Cancelled => GatherState::Cancelled,
        });
    }

    /// Enter `Failed` if `result` is an error.
    pub(crate) fn check<T>(&mut self, result: GatherResult<T>) -> GatherResult<T> {
        if let Err(e) = &result {
            warn!("Gather failed in state {}: {e}", self.state);
            self.enter(GatherState::Failed);
        }
        result
    }
}

/// Write the encoded settings to the controller and execute them.
pub(crate) fn apply_settings<C: PmacChannel>(
    channel: &mut C,
    config: &GatherConfig,
    addresses: &[String],
    period: u32,
    samples: u64,
) -> GatherResult<()> {
    let statements = encode_settings(addresses, period, samples)?;
    channel
        .send_file(&config.settings_path, &statements.join("\n"))
        .during(GatherStep::WriteConfig)?;
    info!("Wrote configuration to {}", config.settings_path);

    channel
        .run_script_file(&config.settings_path)
        .during(GatherStep::ApplyConfig)
}

/// Upload the buffer to `output_path`, download and parse it.
///
/// Both the upload and the download may take up to `upload_timeout`.
pub(crate) fn retrieve_results<C: PmacChannel>(
    channel: &mut C,
    output_path: &str,
    upload_timeout: Duration,
    addresses: &[String],
    clock: &ServoClock,
) -> GatherResult<ParsedDataset> {
    // -u uploads the buffer contents to the file
    channel
        .shell_command_within(&format!("gather {output_path} -u"), upload_timeout)
        .during(GatherStep::Upload)?;
    let lines = channel
        .read_file_within(output_path, upload_timeout)
        .during(GatherStep::Download)?;

    let data = parse_results(addresses, &lines, clock);
    if data.skipped() > 0 {
        warn!("Dropped {} malformed gather rows", data.skipped());
    }
    Ok(data)
}

/// Drives one bare gather run on a borrowed channel.
///
/// # Example
///
/// ```
/// use ppmac::comm::sim::SimulatedPmac;
/// use ppmac::gather::{AcquisitionController, CancelToken, GatherConfig, GatherPlan, GatherState, ServoClock};
///
/// let mut pmac = SimulatedPmac::new();
/// let clock = ServoClock::default();
/// let plan = GatherPlan::from_samples(&clock, vec!["Sys.ServoCount.a".to_string()], 1, 1000).unwrap();
///
/// let mut controller = AcquisitionController::new(&mut pmac, clock, GatherConfig::default());
/// let acquisition = controller.run(plan, &CancelToken::new()).unwrap();
///
/// assert_eq!(controller.state(), GatherState::Completed);
/// assert_eq!(acquisition.data.len(), 1000);
/// ```
pub struct AcquisitionController<'a, C: PmacChannel> {
    channel: &'a mut C,
    clock: ServoClock,
    config: GatherConfig,
    tracker: StateTracker,
}

impl<'a, C: PmacChannel> AcquisitionController<'a, C> {
    pub fn new(channel: &'a mut C, clock: ServoClock, config: GatherConfig) -> Self {
        Self {
            channel,
            clock,
            config,
            tracker: StateTracker::new(),
        }
    }

    pub fn state(&self) -> GatherState {
        self.tracker.state()
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn transitions(&self) -> &[GatherState] {
        self.tracker.history()
    }

    /// Run `plan` to completion, cancellation or failure.
    ///
    /// # Errors
    ///
    /// Any failed device step ends the run in [`GatherState::Failed`] and is
    /// returned with the step that failed. Nothing is retried.
    pub fn run(&mut self, plan: GatherPlan, cancel: &CancelToken) -> GatherResult<Acquisition> {
        let result = self.execute(plan, cancel);
        self.tracker.check(result)
    }

    fn execute(&mut self, mut plan: GatherPlan, cancel: &CancelToken) -> GatherResult<Acquisition> {
        self.tracker.enter(GatherState::Configuring);
        self.channel
            .set_variable(ENABLE_VAR, DISABLED)
            .during(GatherStep::Disable)?;
        apply_settings(
            self.channel,
            &self.config,
            &plan.addresses,
            plan.period,
            plan.samples,
        )?;

        let capacity: u64 = self
            .channel
            .get_parsed(MAX_LINES_VAR)
            .during(GatherStep::ReadCapacity)?;
        let reconciled = self.clock.reconcile(plan.samples, capacity, plan.period);
        if reconciled.truncated {
            self.channel
                .set_variable(MAX_SAMPLES_VAR, &reconciled.samples.to_string())
                .during(GatherStep::WriteMaxSamples)?;
            plan.apply(&reconciled);

            warn!(
                "Buffer not large enough; maximum count with the current addresses is {capacity}, new duration is {:.2} s",
                reconciled.duration
            );
            if reconciled.is_degenerate() {
                warn!("Gather buffer cannot hold a single sample of {} addresses", plan.addresses.len());
            }
        }
        self.tracker.enter(GatherState::Armed);

        self.channel.open_session().during(GatherStep::OpenSession)?;
        self.channel
            .set_variable(ENABLE_VAR, CAPTURE)
            .during(GatherStep::Arm)?;
        self.tracker.enter(GatherState::Sampling);
        let outcome = self.poll_samples(plan.samples, cancel)?;

        self.tracker.enter(GatherState::Draining);
        self.channel
            .set_variable(ENABLE_VAR, DISABLED)
            .during(GatherStep::Disarm)?;
        self.channel
            .close_session()
            .during(GatherStep::CloseSession)?;

        self.tracker.enter(GatherState::Retrieving);
        let data = retrieve_results(
            self.channel,
            &self.config.output_path,
            self.config.upload_timeout(),
            &plan.addresses,
            &self.clock,
        )?;
        info!("Gathered {} samples of {} addresses", data.len(), plan.addresses.len());

        self.tracker.finish(outcome);
        Ok(Acquisition {
            addresses: plan.addresses.clone(),
            data,
            truncated: reconciled.truncated,
            plan,
            outcome,
            device_errors: Vec::new(),
        })
    }

    fn poll_samples(&mut self, target: u64, cancel: &CancelToken) -> GatherResult<GatherOutcome> {
        info!("Waiting for {target} samples");
        let mut samples = 0u64;

        while samples < target {
            if cancel.is_cancelled() {
                info!("Gather cancelled after {samples} of {target} samples");
                self.channel
                    .set_variable(ENABLE_VAR, DISABLED)
                    .during(GatherStep::Disarm)?;
                return Ok(GatherOutcome::Cancelled);
            }

            samples = self
                .channel
                .get_parsed(SAMPLES_VAR)
                .during(GatherStep::Poll)?;
            debug!(
                "{samples}/{target} ({:.2}%)",
                100.0 * samples as f64 / target as f64
            );
            if samples < target {
                thread::sleep(self.config.poll_interval());
            }
        }

        Ok(GatherOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::sim::SimulatedPmac;
    use crate::comm::CommError;
    use crate::gather::error::GatherError;
    use crate::gather::testing::{Call, ScriptedChannel};
    use approx::assert_relative_eq;

    const OUTPUT: &str = "/var/ftp/gather/GatherFile.txt";

    fn fast_config() -> GatherConfig {
        GatherConfig {
            poll_interval_ms: 0,
            ..GatherConfig::default()
        }
    }

    fn addrs() -> Vec<String> {
        vec!["Sys.ServoCount.a".to_string(), "Motor[3].Pos.a".to_string()]
    }

    #[test]
    fn test_truncated_plan_completes() {
        let mut channel = ScriptedChannel::new()
            .with_values("gather.maxlines", &["10"])
            .with_values("gather.samples", &["0", "4", "10"])
            .with_file(OUTPUT, &["100 1.5", "101 1.6"]);
        let clock = ServoClock::new(1e-3);
        let plan = GatherPlan::from_samples(&clock, addrs(), 1, 20).unwrap();

        let mut controller = AcquisitionController::new(&mut channel, clock, fast_config());
        let acquisition = controller.run(plan, &CancelToken::new()).unwrap();

        assert_eq!(controller.state(), GatherState::Completed);
        assert_eq!(
            controller.transitions(),
            [
                GatherState::Idle,
                GatherState::Configuring,
                GatherState::Armed,
                GatherState::Sampling,
                GatherState::Draining,
                GatherState::Retrieving,
                GatherState::Completed,
            ]
        );
        assert!(acquisition.truncated);
        assert_eq!(acquisition.plan.samples, 10);
        assert_relative_eq!(acquisition.plan.duration, 10.0 * 1e-3);
        assert_eq!(acquisition.outcome, GatherOutcome::Completed);
        assert_eq!(acquisition.data.len(), 2);

        assert_eq!(channel.sets("gather.maxsamples"), vec!["10"]);
        assert_eq!(channel.reads("gather.samples"), 3);
        // The corrected limit is written before the buffer is armed
        let fix = channel
            .position(&Call::Set("gather.maxsamples".to_string(), "10".to_string()))
            .unwrap();
        let arm = channel
            .position(&Call::Set("gather.enable".to_string(), "2".to_string()))
            .unwrap();
        assert!(fix < arm);
    }

    #[test]
    fn test_protocol_sequence() {
        let mut channel = ScriptedChannel::new()
            .with_values("gather.maxlines", &["100000"])
            .with_values("gather.samples", &["500"])
            .with_file(OUTPUT, &["1 2"]);
        let clock = ServoClock::default();
        let plan = GatherPlan::from_samples(&clock, addrs(), 1, 500).unwrap();

        let acquisition = AcquisitionController::new(&mut channel, clock, fast_config())
            .run(plan, &CancelToken::new())
            .unwrap();
        assert!(!acquisition.truncated);

        let settings = "gather.enable=0\ngather.addr[0]=Sys.ServoCount.a\ngather.addr[1]=Motor[3].Pos.a\ngather.items=2\ngather.Period=1\ngather.enable=1\ngather.enable=0\ngather.MaxSamples=500";
        assert_eq!(
            channel.calls,
            vec![
                Call::Set("gather.enable".to_string(), "0".to_string()),
                Call::SendFile("/var/ftp/gather/GatherSetting.txt".to_string(), settings.to_string()),
                Call::Shell("gpascii -i\"/var/ftp/gather/GatherSetting.txt\"".to_string()),
                Call::Get("gather.maxlines".to_string()),
                Call::OpenSession,
                Call::Set("gather.enable".to_string(), "2".to_string()),
                Call::Get("gather.samples".to_string()),
                Call::Set("gather.enable".to_string(), "0".to_string()),
                Call::CloseSession,
                Call::Shell(format!("gather {OUTPUT} -u")),
                Call::ReadFile(OUTPUT.to_string()),
            ]
        );
        assert!(channel.sets("gather.maxsamples").is_empty());
    }

    #[test]
    fn test_upload_uses_upload_timeout() {
        let mut channel = ScriptedChannel::new()
            .with_values("gather.maxlines", &["1000"])
            .with_values("gather.samples", &["10"])
            .with_file(OUTPUT, &["1 2"]);
        let clock = ServoClock::default();
        let plan = GatherPlan::from_samples(&clock, addrs(), 1, 10).unwrap();
        let config = GatherConfig {
            upload_timeout_secs: 90.0,
            ..fast_config()
        };

        AcquisitionController::new(&mut channel, clock, config)
            .run(plan, &CancelToken::new())
            .unwrap();

        let deadline = Duration::from_secs(90);
        assert_eq!(
            channel.deadlines,
            vec![
                (format!("gather {OUTPUT} -u"), deadline),
                (OUTPUT.to_string(), deadline),
            ]
        );
    }

    #[test]
    fn test_cancel_stops_polling() {
        let cancel = CancelToken::new();
        let mut channel = ScriptedChannel::new()
            .with_values("gather.maxlines", &["100000"])
            .with_values("gather.samples", &["10", "20", "30"])
            .cancel_after("gather.samples", 2, &cancel)
            .with_file(OUTPUT, &["1 2", "3 4"]);
        let clock = ServoClock::default();
        let plan = GatherPlan::from_samples(&clock, addrs(), 1, 1000).unwrap();

        let mut controller = AcquisitionController::new(&mut channel, clock, fast_config());
        let acquisition = controller.run(plan, &cancel).unwrap();

        assert_eq!(controller.state(), GatherState::Cancelled);
        assert!(acquisition.is_cancelled());
        assert_eq!(acquisition.data.len(), 2);
        assert_eq!(channel.reads("gather.samples"), 2);
        // Disabled once on cancel and once more while draining
        assert_eq!(channel.sets("gather.enable"), vec!["0", "2", "0", "0"]);
    }

    #[test]
    fn test_apply_failure_is_config_write_failed() {
        let mut channel = ScriptedChannel::new().failing_shell("gpascii");
        let clock = ServoClock::default();
        let plan = GatherPlan::from_samples(&clock, addrs(), 1, 10).unwrap();

        let mut controller = AcquisitionController::new(&mut channel, clock, fast_config());
        let err = controller.run(plan, &CancelToken::new()).unwrap_err();

        assert_eq!(controller.state(), GatherState::Failed);
        assert!(matches!(
            err,
            GatherError::ConfigWriteFailed {
                step: GatherStep::ApplyConfig,
                source: CommError::CommandFailed { .. }
            }
        ));
    }

    #[test]
    fn test_download_failure() {
        let mut channel = ScriptedChannel::new()
            .with_values("gather.maxlines", &["100"])
            .with_values("gather.samples", &["10"]);
        let clock = ServoClock::default();
        let plan = GatherPlan::from_samples(&clock, addrs(), 1, 10).unwrap();

        let mut controller = AcquisitionController::new(&mut channel, clock, fast_config());
        let err = controller.run(plan, &CancelToken::new()).unwrap_err();

        assert_eq!(err.step(), Some(GatherStep::Download));
        assert_eq!(
            controller.transitions().last(),
            Some(&GatherState::Failed)
        );
    }

    #[test]
    fn test_degenerate_truncation_completes_empty() {
        let mut channel = ScriptedChannel::new()
            .with_values("gather.maxlines", &["0"])
            .with_values("gather.samples", &["0"])
            .with_file(OUTPUT, &[]);
        let clock = ServoClock::default();
        let plan = GatherPlan::from_samples(&clock, addrs(), 1, 10).unwrap();

        let acquisition = AcquisitionController::new(&mut channel, clock, fast_config())
            .run(plan, &CancelToken::new())
            .unwrap();

        assert!(acquisition.truncated);
        assert_eq!(acquisition.plan.samples, 0);
        assert!(acquisition.data.is_empty());
        assert_eq!(channel.reads("gather.samples"), 0);
    }

    #[test]
    fn test_simulated_run() {
        let mut pmac = SimulatedPmac::new().with_buffer_words(2000);
        let clock = ServoClock::from_device(&mut pmac).unwrap();
        let plan = GatherPlan::from_duration(&clock, addrs(), 1, 0.5).unwrap();
        assert!(plan.samples > 1000);

        let acquisition = AcquisitionController::new(&mut pmac, clock, fast_config())
            .run(plan, &CancelToken::new())
            .unwrap();

        // 2000 words hold 1000 samples of two addresses
        assert!(acquisition.truncated);
        assert_eq!(acquisition.data.len(), 1000);
        let time = acquisition.data.column("Sys.ServoCount.a").unwrap();
        assert_relative_eq!(time[1] - time[0], clock.servo_period(), max_relative = 1e-6);
        assert!(!pmac.session_open());
        assert_eq!(pmac.variable("gather.enable"), Some("0"));
    }
}
