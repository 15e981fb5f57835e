//! Gather runs bracketed by a motion program.
//!
//! [`ProgramRunner`] configures the buffer like [`AcquisitionController`], then
//! sends a motion program script over the interactive session, starts it and
//! waits for it to finish. Completion is seen either through
//! `Coord[n].ProgActive` or through `gather.enable` dropping back to 0.
//!
//! A script that never mentions `gather.enable` is wrapped in
//! `gather.enable=2` / `gather.enable=0` so the caller does not have to arm the
//! buffer itself.
//!
//! [`AcquisitionController`]: super::AcquisitionController

use std::borrow::Cow;
use std::thread;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::cancel::CancelToken;
use super::config::GatherConfig;
use super::controller::{
    apply_settings, retrieve_results, Acquisition, GatherOutcome, GatherState, StateTracker,
    CAPTURE, DISABLED, ENABLE_VAR, SAMPLES_VAR,
};
use super::error::{GatherError, GatherResult, GatherStep, StepContext};
use super::plan::{GatherPlan, ServoClock};
use super::{is_time_source, MAX_SAMPLES, SERVO_COUNT_ADDR};
use crate::comm::{is_error_line, CommError, PmacChannel, ProgramAction};

/// Passed to the cancel callback when a running program is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelReason {
    pub coord_sys: u32,
    pub program: u32,
    /// Sample count at the last poll before cancellation
    pub samples: u64,
}

/// A motion program run to gather around.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramRequest {
    /// Script text, sent line by line
    pub script: String,
    pub coord_sys: u32,
    pub program: u32,
    /// Addresses to gather; the servo counter is added if missing
    pub addresses: Vec<String>,
    /// Servo ticks per sample
    pub period: u32,
    /// Buffer limit (`gather.MaxSamples`)
    pub samples: u64,
}

impl ProgramRequest {
    pub fn new(script: &str, coord_sys: u32, program: u32, addresses: Vec<String>) -> Self {
        Self {
            script: script.to_string(),
            coord_sys,
            program,
            addresses,
            period: 1,
            samples: MAX_SAMPLES,
        }
    }

    pub fn period(mut self, period: u32) -> Self {
        self.period = period;
        self
    }

    pub fn samples(mut self, samples: u64) -> Self {
        self.samples = samples;
        self
    }
}

/// Wrap `script` with capture start/stop unless it handles the buffer itself.
fn bracket_script(script: &str) -> Cow<'_, str> {
    if script.to_lowercase().contains(ENABLE_VAR) {
        Cow::Borrowed(script)
    } else {
        Cow::Owned(format!(
            "{ENABLE_VAR}={CAPTURE}\n{script}\n{ENABLE_VAR}={DISABLED}"
        ))
    }
}

/// Put the servo counter first unless it is already gathered.
fn with_time_source(addresses: &[String]) -> Vec<String> {
    let mut addresses = addresses.to_vec();
    if !addresses.iter().any(|a| is_time_source(a)) {
        addresses.insert(0, SERVO_COUNT_ADDR.to_string());
    }
    addresses
}

type CancelCallback<'a> = Box<dyn FnMut(&CancelReason) + 'a>;

/// Runs a motion program and gathers while it executes.
///
/// # Example
///
/// ```
/// use ppmac::comm::sim::SimulatedPmac;
/// use ppmac::gather::program::ProgramRequest;
/// use ppmac::gather::{CancelToken, GatherConfig, ProgramRunner, ServoClock};
///
/// let script = "open prog 999\ngather.enable=2\nX10\ngather.enable=0\nclose";
/// let request = ProgramRequest::new(script, 1, 999, vec!["Motor[1].Pos.a".to_string()]);
///
/// let mut pmac = SimulatedPmac::new();
/// let config = GatherConfig { poll_interval_ms: 1, ..GatherConfig::default() };
/// let acquisition = ProgramRunner::new(&mut pmac, ServoClock::default(), config)
///     .run(&request, &CancelToken::new())
///     .unwrap();
///
/// assert_eq!(acquisition.addresses, ["Sys.ServoCount.a", "Motor[1].Pos.a"]);
/// assert!(!acquisition.data.is_empty());
/// ```
pub struct ProgramRunner<'a, C: PmacChannel> {
    channel: &'a mut C,
    clock: ServoClock,
    config: GatherConfig,
    check_active: bool,
    on_cancel: Option<CancelCallback<'a>>,
    tracker: StateTracker,
}

impl<'a, C: PmacChannel> ProgramRunner<'a, C> {
    pub fn new(channel: &'a mut C, clock: ServoClock, config: GatherConfig) -> Self {
        Self {
            channel,
            clock,
            config,
            check_active: false,
            on_cancel: None,
            tracker: StateTracker::new(),
        }
    }

    /// Detect completion through `Coord[n].ProgActive` instead of `gather.enable`.
    pub fn check_active(mut self, check_active: bool) -> Self {
        self.check_active = check_active;
        self
    }

    /// Call `callback` after a cancelled program has been stopped.
    pub fn on_cancel<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&CancelReason) + 'a,
    {
        self.on_cancel = Some(Box::new(callback));
        self
    }

    pub fn state(&self) -> GatherState {
        self.tracker.state()
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn transitions(&self) -> &[GatherState] {
        self.tracker.history()
    }

    /// Run the program and gather until it finishes or `cancel` fires.
    ///
    /// The returned addresses include the servo counter if it had to be added.
    /// Error lines printed by the controller are collected in
    /// [`Acquisition::device_errors`] and do not fail the run.
    pub fn run(&mut self, request: &ProgramRequest, cancel: &CancelToken) -> GatherResult<Acquisition> {
        let result = self.execute(request, cancel);
        self.tracker.check(result)
    }

    fn execute(&mut self, request: &ProgramRequest, cancel: &CancelToken) -> GatherResult<Acquisition> {
        self.tracker.enter(GatherState::Configuring);
        let script = bracket_script(&request.script);

        self.channel
            .set_variable(ENABLE_VAR, DISABLED)
            .during(GatherStep::Disable)?;

        let plan = GatherPlan::from_samples(
            &self.clock,
            with_time_source(&request.addresses),
            request.period,
            request.samples,
        )?;
        apply_settings(
            self.channel,
            &self.config,
            &plan.addresses,
            plan.period,
            plan.samples,
        )?;
        self.tracker.enter(GatherState::Armed);

        self.channel.open_session().during(GatherStep::OpenSession)?;
        for line in script.lines() {
            self.channel
                .send_line(line.trim_start())
                .during(GatherStep::SendScript)?;
        }
        self.channel
            .program(request.coord_sys, request.program, ProgramAction::Start)
            .during(GatherStep::StartProgram)?;

        self.tracker.enter(GatherState::Sampling);
        let outcome = self.wait_for_program(request, cancel)?;

        self.tracker.enter(GatherState::Draining);
        let device_errors = self.drain_errors()?;
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
        info!("Gathered {} samples during program {}", data.len(), request.program);

        self.tracker.finish(outcome);
        Ok(Acquisition {
            addresses: plan.addresses.clone(),
            data,
            plan,
            truncated: false,
            outcome,
            device_errors,
        })
    }

    fn status(&mut self, status_var: &str) -> GatherResult<i64> {
        self.channel
            .get_parsed(status_var)
            .during(GatherStep::Poll)
    }

    fn wait_for_program(
        &mut self,
        request: &ProgramRequest,
        cancel: &CancelToken,
    ) -> GatherResult<GatherOutcome> {
        let status_var = if self.check_active {
            format!("Coord[{}].ProgActive", request.coord_sys)
        } else {
            ENABLE_VAR.to_string()
        };
        let interval = self.config.poll_interval();
        let mut samples = 0u64;

        info!("Waiting for program {} to start", request.program);
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return self.stop_program(request, samples);
            }
            if self.status(&status_var)? != 0 {
                break;
            }
            if let Some(limit) = self.config.start_timeout() {
                if started.elapsed() >= limit {
                    warn!("Program {} did not start within {limit:?}", request.program);
                    return Err(GatherError::from_comm(
                        GatherStep::WaitForCompletion,
                        CommError::Timeout,
                    ));
                }
            }
            thread::sleep(interval);
        }

        loop {
            if cancel.is_cancelled() {
                return self.stop_program(request, samples);
            }
            if self.status(&status_var)? == 0 {
                break;
            }
            samples = self
                .channel
                .get_parsed(SAMPLES_VAR)
                .during(GatherStep::Poll)?;
            debug!("Working... got {samples} data points");
            thread::sleep(interval);
        }

        info!("Program {} done", request.program);
        Ok(GatherOutcome::Completed)
    }

    fn stop_program(&mut self, request: &ProgramRequest, samples: u64) -> GatherResult<GatherOutcome> {
        info!("Cancelled; stopping program {}", request.program);
        self.channel
            .program(request.coord_sys, request.program, ProgramAction::Stop)
            .during(GatherStep::StopProgram)?;

        if let Some(callback) = self.on_cancel.as_mut() {
            callback(&CancelReason {
                coord_sys: request.coord_sys,
                program: request.program,
                samples,
            });
        }
        Ok(GatherOutcome::Cancelled)
    }

    /// Collect error lines left in the session output.
    fn drain_errors(&mut self) -> GatherResult<Vec<String>> {
        let lines = match self.channel.read_timeout(self.config.drain_timeout()) {
            Ok(lines) => lines,
            Err(CommError::Timeout) => return Ok(Vec::new()),
            Err(e) => return Err(GatherError::from_comm(GatherStep::Drain, e)),
        };

        let errors: Vec<String> = lines.into_iter().filter(|l| is_error_line(l)).collect();
        for line in &errors {
            warn!("Controller reported: {line}");
        }
        Ok(errors)
    }
}
