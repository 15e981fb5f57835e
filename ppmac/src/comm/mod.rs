//! Power PMAC device channel.
//!
//! The acquisition code never talks to a socket directly. It depends on the
//! [`PmacChannel`] capability trait, which bundles the handful of operations a
//! Power PMAC exposes to a remote host:
//!
//! - **File transfer**: [`read_file`](PmacChannel::read_file),
//!   [`send_file`](PmacChannel::send_file)
//! - **Shell execution**: [`shell_command`](PmacChannel::shell_command)
//! - **Variable access** through the `gpascii` command interpreter:
//!   [`get_variable`](PmacChannel::get_variable),
//!   [`set_variable`](PmacChannel::set_variable)
//! - **Interactive session**: [`open_session`](PmacChannel::open_session),
//!   [`send_line`](PmacChannel::send_line), [`close_session`](PmacChannel::close_session)
//! - **Motion programs**: [`program`](PmacChannel::program)
//! - **Output monitoring**: [`wait_for`](PmacChannel::wait_for),
//!   [`read_timeout`](PmacChannel::read_timeout)
//!
//! Two implementations ship with the crate: [`telnet::TelnetPmac`] for real
//! controllers and [`sim::SimulatedPmac`], an in-memory controller model.
//!
//! # Variable Syntax
//!
//! `gpascii` answers a bare variable name with `name=value`. Errors come back
//! as lines containing `error`, e.g.:
//!
//! ```text
//! stdin:1:1: error #20: ILLEGAL CMD: gather.bogus
//! ```

pub mod sim;
pub mod telnet;

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

/// Servo period variable, reported in milliseconds.
pub const SERVO_PERIOD_VAR: &str = "Sys.ServoPeriod";

/// Marker the command interpreter puts in every error line.
pub const ERROR_MARKER: &str = "error";

/// Errors that can occur while talking to a Power PMAC.
#[derive(Error, Debug)]
pub enum CommError {
    /// Low-level I/O error (socket or file failure).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to establish the connection or log in.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A blocking wait ran past its deadline.
    #[error("Timeout waiting for response")]
    Timeout,

    /// The interactive session is not open.
    #[error("Channel closed")]
    ChannelClosed,

    /// The command interpreter answered with an error line.
    #[error("Device error: {0}")]
    Device(String),

    /// A shell command exited with a non-zero status.
    #[error("Command `{command}` failed with exit status {status}")]
    CommandFailed {
        /// Command line as sent
        command: String,
        /// Shell exit status
        status: i32,
    },

    /// Response from the controller doesn't match the expected format.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Failed to parse a variable value.
    #[error("Parse error: {0}")]
    ParseError(String),
}

/// Result type for channel operations.
pub type CommResult<T> = Result<T, CommError>;

/// Motion program control action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramAction {
    /// Begin the program and run it (`&<cs>begin<prog>r`).
    Start,
    /// Abort the program (`&<cs>begin<prog>abort`).
    Stop,
}

/// Build the on-line command that starts or stops a motion program.
///
/// ```
/// use ppmac::comm::{program_command, ProgramAction};
///
/// assert_eq!(program_command(0, 999, ProgramAction::Start), "&0begin999r");
/// assert_eq!(program_command(2, 10, ProgramAction::Stop), "&2begin10abort");
/// ```
pub fn program_command(coord_sys: u32, program: u32, action: ProgramAction) -> String {
    let suffix = match action {
        ProgramAction::Start => "r",
        ProgramAction::Stop => "abort",
    };
    format!("&{coord_sys}begin{program}{suffix}")
}

/// Lines returned by a successful [`PmacChannel::wait_for`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitMatch {
    /// Every line read up to and including the matching one.
    pub lines: Vec<String>,
    /// Capture groups of the match (group 0 excluded; unmatched groups are empty).
    pub groups: Vec<String>,
}

/// Capability interface of a Power PMAC.
///
/// Every call is synchronous and may block. Implementations are owned by one
/// acquisition at a time; the acquisition types borrow them mutably for the
/// whole run.
pub trait PmacChannel {
    /// Read a remote text file, one entry per line (line terminators stripped).
    fn read_file(&mut self, path: &str) -> CommResult<Vec<String>>;

    /// Write `contents` to a remote text file, replacing it.
    fn send_file(&mut self, path: &str, contents: &str) -> CommResult<()>;

    /// Execute a command line in a remote shell.
    ///
    /// Any output the command produces is queued for
    /// [`wait_for`](Self::wait_for) and [`read_timeout`](Self::read_timeout).
    fn shell_command(&mut self, command: &str) -> CommResult<()>;

    /// Read a controller variable as its raw textual value.
    fn get_variable(&mut self, name: &str) -> CommResult<String>;

    /// Set a controller variable.
    fn set_variable(&mut self, name: &str, value: &str) -> CommResult<()>;

    /// Open the interactive command interpreter session.
    fn open_session(&mut self) -> CommResult<()>;

    /// Close the interactive command interpreter session.
    fn close_session(&mut self) -> CommResult<()>;

    /// Send one line of text to the interactive session.
    fn send_line(&mut self, line: &str) -> CommResult<()>;

    /// Start or stop a motion program in a coordinate system.
    fn program(&mut self, coord_sys: u32, program: u32, action: ProgramAction) -> CommResult<()>;

    /// Block until a line of output matches `pattern`.
    ///
    /// Returns [`CommError::Timeout`] if nothing matches within `timeout`.
    fn wait_for(&mut self, pattern: &Regex, timeout: Duration) -> CommResult<WaitMatch>;

    /// Drain pending output lines that arrive within `timeout`.
    ///
    /// Returns [`CommError::Timeout`] when no line arrives at all.
    fn read_timeout(&mut self, timeout: Duration) -> CommResult<Vec<String>>;

    /// Read a remote text file, allowing up to `timeout` for the transfer.
    ///
    /// Transports without their own deadline fall back to [`read_file`](Self::read_file).
    fn read_file_within(&mut self, path: &str, _timeout: Duration) -> CommResult<Vec<String>> {
        self.read_file(path)
    }

    /// Execute a shell command, allowing up to `timeout` for it to finish.
    ///
    /// Transports without their own deadline fall back to
    /// [`shell_command`](Self::shell_command).
    fn shell_command_within(&mut self, command: &str, _timeout: Duration) -> CommResult<()> {
        self.shell_command(command)
    }

    /// Read a controller variable and parse it into `T`.
    fn get_parsed<T>(&mut self, name: &str) -> CommResult<T>
    where
        Self: Sized,
        T: FromStr,
        T::Err: Display,
    {
        let raw = self.get_variable(name)?;
        parse_value(name, &raw)
    }

    /// Execute a `gpascii` script file that already lives on the controller.
    fn run_script_file(&mut self, path: &str) -> CommResult<()> {
        self.shell_command(&format!("gpascii -i\"{path}\""))
    }
}

/// Parse a raw variable value.
///
/// Integer variables are sometimes reported with a fractional part
/// (`gather.samples=1200.`), so integer parses fall back to an exact float.
pub fn parse_value<T>(name: &str, raw: &str) -> CommResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = raw.trim();
    match raw.parse::<T>() {
        Ok(value) => Ok(value),
        Err(e) => {
            if let Some(whole) = raw.strip_suffix('.').or_else(|| raw.strip_suffix(".0")) {
                if let Ok(value) = whole.parse::<T>() {
                    return Ok(value);
                }
            }
            Err(CommError::ParseError(format!("{name}={raw}: {e}")))
        }
    }
}

/// Split a `name=value` line into its trimmed parts.
///
/// ```
/// use ppmac::comm::split_assignment;
///
/// assert_eq!(split_assignment("Gather.Samples=120"), Some(("Gather.Samples", "120")));
/// assert_eq!(split_assignment("no assignment"), None);
/// ```
pub fn split_assignment(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, value.trim()))
}

/// Whether a line of interpreter output reports an error.
pub fn is_error_line(line: &str) -> bool {
    line.contains(ERROR_MARKER)
}

/// Housekeeping messages the controller interleaves with command output.
fn is_housekeeping_line(line: &str) -> bool {
    line.contains("// *** exit") || line.starts_with("UnlinkGatherThread:")
}

/// Scan `lines` for the first one matching `pattern`.
///
/// Housekeeping lines are dropped from the collected output. Returns the
/// collected lines and the match's capture groups, or `None` if nothing matched;
/// in that case `collected` still holds every line seen.
pub(crate) fn scan_for_match<I>(
    lines: I,
    pattern: &Regex,
    collected: &mut Vec<String>,
) -> Option<Vec<String>>
where
    I: IntoIterator<Item = String>,
{
    for line in lines {
        let line = line.trim_end().to_string();
        if is_housekeeping_line(&line) {
            continue;
        }

        let groups = pattern.captures(&line).map(|caps| {
            caps.iter()
                .skip(1)
                .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect()
        });

        collected.push(line);
        if groups.is_some() {
            return groups;
        }
    }
    None
}
