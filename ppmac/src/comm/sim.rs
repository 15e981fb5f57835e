//! In-memory Power PMAC model.
//!
//! [`SimulatedPmac`] implements [`PmacChannel`] without any hardware. It keeps a
//! variable table, a file system and a gather buffer, and understands enough of
//! the controller's behaviour to run a full acquisition:
//!
//! - `gpascii -i"<file>"` executes the assignments in a stored file
//! - `gather.enable=2` resets `gather.samples` and starts capture; every variable
//!   read advances the buffer until `gather.MaxSamples` is reached, at which point
//!   capture stops by itself (`gather.enable` drops back to 0)
//! - `gather.maxlines` is the buffer size divided by `gather.items`
//! - `gather <file> -u` uploads the captured samples as text rows
//! - `open prog <n>` ... `close` sent over the session stores a motion program;
//!   a started program executes assignments immediately while every other
//!   statement (a move, a dwell) keeps it busy for a configurable number of reads
//!
//! Simulated time only moves on variable reads, so polling loops observe progress
//! without any real waiting.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, trace};

use super::{
    program_command, scan_for_match, split_assignment, CommError, CommResult, PmacChannel,
    ProgramAction, WaitMatch,
};
use crate::gather::SERVO_COUNT_ADDR;

/// Servo period of a stock controller, in milliseconds.
pub const DEFAULT_SERVO_PERIOD_MS: &str = "0.442673749446658";

const DEFAULT_BUFFER_WORDS: u64 = 1 << 20;
const DEFAULT_SAMPLES_PER_READ: u64 = 226;
const DEFAULT_PROGRAM_POLLS: u32 = 5;
const SERVO_COUNT_START: u64 = 1_000_000;

#[derive(Debug, Clone)]
struct RunningProgram {
    coord_sys: u32,
    program: u32,
    /// Next statement to execute
    line: usize,
    /// Reads left before the current statement finishes
    wait: u32,
}

/// Simulated controller.
///
/// # Example
///
/// ```
/// use ppmac::comm::sim::SimulatedPmac;
/// use ppmac::comm::PmacChannel;
///
/// let mut pmac = SimulatedPmac::new();
/// pmac.set_variable("gather.MaxSamples", "500").unwrap();
/// pmac.set_variable("gather.enable", "2").unwrap();
///
/// let mut samples: u64 = 0;
/// while samples < 500 {
///     samples = pmac.get_parsed("gather.samples").unwrap();
/// }
/// assert_eq!(pmac.get_variable("gather.enable").unwrap(), "0");
/// ```
#[derive(Debug, Clone)]
pub struct SimulatedPmac {
    variables: HashMap<String, String>,
    files: HashMap<String, Vec<String>>,
    programs: HashMap<u32, Vec<String>>,
    recording: Option<(u32, Vec<String>)>,
    running: Option<RunningProgram>,
    shell_outputs: Vec<(String, Vec<String>)>,
    output: VecDeque<String>,
    session_open: bool,
    buffer_words: u64,
    samples_per_read: u64,
    program_polls: u32,
    commands: Vec<String>,
    lines_sent: Vec<String>,
    program_actions: Vec<(u32, u32, ProgramAction)>,
}

impl Default for SimulatedPmac {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPmac {
    /// Idle controller with an empty gather configuration.
    pub fn new() -> Self {
        let variables = [
            ("sys.servoperiod", DEFAULT_SERVO_PERIOD_MS),
            ("gather.enable", "0"),
            ("gather.samples", "0"),
            ("gather.maxsamples", "0"),
            ("gather.items", "0"),
            ("gather.period", "1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            variables,
            files: HashMap::new(),
            programs: HashMap::new(),
            recording: None,
            running: None,
            shell_outputs: Vec::new(),
            output: VecDeque::new(),
            session_open: false,
            buffer_words: DEFAULT_BUFFER_WORDS,
            samples_per_read: DEFAULT_SAMPLES_PER_READ,
            program_polls: DEFAULT_PROGRAM_POLLS,
            commands: Vec::new(),
            lines_sent: Vec::new(),
            program_actions: Vec::new(),
        }
    }

    /// Set the servo period reported by `Sys.ServoPeriod`, in milliseconds.
    pub fn with_servo_period_ms(mut self, period_ms: f64) -> Self {
        self.variables
            .insert("sys.servoperiod".to_string(), period_ms.to_string());
        self
    }

    /// Set the gather buffer size in words (one word per item per sample).
    pub fn with_buffer_words(mut self, words: u64) -> Self {
        self.buffer_words = words;
        self
    }

    /// Set how many servo ticks pass on every variable read.
    pub fn with_samples_per_read(mut self, samples: u64) -> Self {
        self.samples_per_read = samples.max(1);
        self
    }

    /// Set how many variable reads a non-assignment program statement takes.
    pub fn with_program_polls(mut self, polls: u32) -> Self {
        self.program_polls = polls.max(1);
        self
    }

    /// Preset a controller variable.
    pub fn with_variable(mut self, name: &str, value: &str) -> Self {
        self.assign(name, value);
        self
    }

    /// Store a file on the controller.
    pub fn with_file(mut self, path: &str, lines: &[&str]) -> Self {
        self.files.insert(
            path.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        );
        self
    }

    /// Make every shell command starting with `prefix` print `lines`.
    pub fn with_shell_output(mut self, prefix: &str, lines: &[&str]) -> Self {
        self.shell_outputs.push((
            prefix.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        ));
        self
    }

    /// Queue a line of interpreter output.
    pub fn push_output(&mut self, line: &str) {
        self.output.push_back(line.to_string());
    }

    /// Current raw value of a variable, without advancing simulated time.
    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Contents of a stored file.
    pub fn file(&self, path: &str) -> Option<&[String]> {
        self.files.get(path).map(Vec::as_slice)
    }

    /// Whether the interactive session is open.
    pub fn session_open(&self) -> bool {
        self.session_open
    }

    /// Whether a motion program is executing.
    pub fn program_running(&self) -> bool {
        self.running.is_some()
    }

    /// Shell commands executed so far.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Lines sent to the interactive session so far.
    pub fn lines_sent(&self) -> &[String] {
        &self.lines_sent
    }

    /// Program start/stop requests so far.
    pub fn program_actions(&self) -> &[(u32, u32, ProgramAction)] {
        &self.program_actions
    }

    fn var_u64(&self, key: &str) -> u64 {
        self.variables
            .get(key)
            .and_then(|v| v.trim().trim_end_matches('.').parse().ok())
            .unwrap_or(0)
    }

    fn assign(&mut self, name: &str, value: &str) {
        let key = name.trim().to_lowercase();
        let value = value.trim().to_string();
        trace!("sim assign {key}={value}");

        if key == "gather.enable" && value == "2" {
            self.variables
                .insert("gather.samples".to_string(), "0".to_string());
        }
        self.variables.insert(key, value);
    }

    fn max_lines(&self) -> u64 {
        self.buffer_words / self.var_u64("gather.items").max(1)
    }

    /// Advance simulated time by one read.
    fn tick(&mut self) {
        if self.var_u64("gather.enable") == 2 {
            let period = self.var_u64("gather.period").max(1);
            let max = self.var_u64("gather.maxsamples");
            let step = (self.samples_per_read / period).max(1);
            let samples = self
                .var_u64("gather.samples")
                .saturating_add(step)
                .min(max);

            self.variables
                .insert("gather.samples".to_string(), samples.to_string());
            if samples >= max {
                debug!("sim gather buffer full at {samples} samples");
                self.variables
                    .insert("gather.enable".to_string(), "0".to_string());
            }
        }

        self.step_program();
    }

    fn step_program(&mut self) {
        let Some(mut run) = self.running.take() else {
            return;
        };
        if run.wait > 0 {
            run.wait -= 1;
            self.running = Some(run);
            return;
        }

        let body = self.programs.get(&run.program).cloned().unwrap_or_default();
        while run.line < body.len() {
            let statement = body[run.line].trim();
            run.line += 1;

            if let Some((name, value)) = split_assignment(statement) {
                self.assign(name, value);
            } else if !statement.is_empty() {
                run.wait = self.program_polls - 1;
                self.running = Some(run);
                return;
            }
        }

        debug!(
            "sim program {} finished in coordinate system {}",
            run.program, run.coord_sys
        );
    }

    fn prog_active(&self, key: &str) -> Option<bool> {
        let cs: u32 = key
            .strip_prefix("coord[")?
            .strip_suffix("].progactive")?
            .parse()
            .ok()?;
        Some(self.running.as_ref().is_some_and(|r| r.coord_sys == cs))
    }

    /// Write the captured samples to `path`, one whitespace-separated row each.
    fn upload(&mut self, path: &str) {
        let items = self.var_u64("gather.items") as usize;
        let period = self.var_u64("gather.period").max(1);
        let samples = self.var_u64("gather.samples");
        let addresses: Vec<String> = (0..items)
            .map(|i| {
                self.variables
                    .get(&format!("gather.addr[{i}]"))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect();

        let rows = (0..samples)
            .map(|k| {
                addresses
                    .iter()
                    .enumerate()
                    .map(|(col, addr)| {
                        if addr.eq_ignore_ascii_case(SERVO_COUNT_ADDR) {
                            (SERVO_COUNT_START + k * period).to_string()
                        } else {
                            format!("{:.6}", (k as f64 * 0.01 + col as f64).sin())
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect();

        debug!("sim uploaded {samples} samples of {items} items to {path}");
        self.files.insert(path.to_string(), rows);
    }

    fn run_script(&mut self, command: &str, path: &str) -> CommResult<()> {
        let Some(lines) = self.files.get(path).cloned() else {
            return Err(CommError::CommandFailed {
                command: command.to_string(),
                status: 1,
            });
        };
        for line in &lines {
            if let Some((name, value)) = split_assignment(line) {
                self.assign(name, value);
            }
        }
        Ok(())
    }
}

fn parse_open_prog(statement: &str) -> Option<u32> {
    statement
        .to_lowercase()
        .strip_prefix("open prog")?
        .trim()
        .parse()
        .ok()
}

impl PmacChannel for SimulatedPmac {
    fn read_file(&mut self, path: &str) -> CommResult<Vec<String>> {
        self.files.get(path).cloned().ok_or_else(|| {
            CommError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{path}: No such file or directory"),
            ))
        })
    }

    fn send_file(&mut self, path: &str, contents: &str) -> CommResult<()> {
        self.files
            .insert(path.to_string(), contents.lines().map(String::from).collect());
        Ok(())
    }

    fn shell_command(&mut self, command: &str) -> CommResult<()> {
        debug!("sim shell: {command}");
        self.commands.push(command.to_string());

        if let Some(rest) = command.strip_prefix("gpascii -i") {
            return self.run_script(command, rest.trim().trim_matches('"'));
        }

        let tokens: Vec<&str> = command.split_whitespace().collect();
        if let ["gather", path, "-u"] = tokens.as_slice() {
            self.upload(path);
            return Ok(());
        }

        let queued: Vec<String> = self
            .shell_outputs
            .iter()
            .filter(|(prefix, _)| command.starts_with(prefix.as_str()))
            .flat_map(|(_, lines)| lines.iter().cloned())
            .collect();
        self.output.extend(queued);
        Ok(())
    }

    fn get_variable(&mut self, name: &str) -> CommResult<String> {
        let key = name.to_lowercase();
        self.tick();

        if key == "gather.maxlines" {
            return Ok(self.max_lines().to_string());
        }
        if let Some(active) = self.prog_active(&key) {
            return Ok(u8::from(active).to_string());
        }
        self.variables
            .get(&key)
            .cloned()
            .ok_or_else(|| CommError::Device(format!("stdin:1:1: error #20: ILLEGAL CMD: {key}")))
    }

    fn set_variable(&mut self, name: &str, value: &str) -> CommResult<()> {
        self.assign(name, value);
        Ok(())
    }

    fn open_session(&mut self) -> CommResult<()> {
        self.session_open = true;
        Ok(())
    }

    fn close_session(&mut self) -> CommResult<()> {
        self.session_open = false;
        self.recording = None;
        Ok(())
    }

    fn send_line(&mut self, line: &str) -> CommResult<()> {
        if !self.session_open {
            return Err(CommError::ChannelClosed);
        }
        self.lines_sent.push(line.to_string());
        let statement = line.trim();

        if let Some((number, mut body)) = self.recording.take() {
            if statement.eq_ignore_ascii_case("close") {
                debug!("sim stored program {number} ({} lines)", body.len());
                self.programs.insert(number, body);
            } else {
                body.push(statement.to_string());
                self.recording = Some((number, body));
            }
            return Ok(());
        }

        if let Some(number) = parse_open_prog(statement) {
            self.recording = Some((number, Vec::new()));
        } else if let Some((name, value)) = split_assignment(statement) {
            self.assign(name, value);
        } else if !statement.is_empty() && !statement.eq_ignore_ascii_case("close") {
            self.output
                .push_back(format!("stdin:1:1: error #20: ILLEGAL CMD: {statement}"));
        }
        Ok(())
    }

    fn program(&mut self, coord_sys: u32, program: u32, action: ProgramAction) -> CommResult<()> {
        debug!("sim program command: {}", program_command(coord_sys, program, action));
        self.program_actions.push((coord_sys, program, action));

        match action {
            ProgramAction::Start if self.programs.contains_key(&program) => {
                self.running = Some(RunningProgram {
                    coord_sys,
                    program,
                    line: 0,
                    wait: 0,
                });
            }
            ProgramAction::Start => {
                self.output.push_back(format!(
                    "stdin:1:1: error #1: program {program} does not exist"
                ));
            }
            ProgramAction::Stop => {
                if self
                    .running
                    .as_ref()
                    .is_some_and(|r| r.coord_sys == coord_sys && r.program == program)
                {
                    self.running = None;
                }
            }
        }
        Ok(())
    }

    fn wait_for(&mut self, pattern: &Regex, _timeout: Duration) -> CommResult<WaitMatch> {
        let queued: Vec<String> = self.output.drain(..).collect();
        let mut lines = Vec::new();
        match scan_for_match(queued, pattern, &mut lines) {
            Some(groups) => Ok(WaitMatch { lines, groups }),
            None => Err(CommError::Timeout),
        }
    }

    fn read_timeout(&mut self, _timeout: Duration) -> CommResult<Vec<String>> {
        if self.output.is_empty() {
            return Err(CommError::Timeout);
        }
        Ok(self.output.drain(..).collect())
    }
}
