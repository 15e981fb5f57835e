//! Scripted channel stub for acquisition tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use regex::Regex;

use super::CancelToken;
use crate::comm::{
    scan_for_match, CommError, CommResult, PmacChannel, ProgramAction, WaitMatch,
};

/// One recorded channel call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ReadFile(String),
    SendFile(String, String),
    Shell(String),
    Get(String),
    Set(String, String),
    OpenSession,
    CloseSession,
    SendLine(String),
    Program(u32, u32, ProgramAction),
    WaitFor(String),
    ReadTimeout,
}

/// Channel that serves scripted variable values and records every call.
///
/// Each variable has a queue of values; reads pop the queue until one value is
/// left, which is then returned forever.
#[derive(Default)]
pub struct ScriptedChannel {
    values: HashMap<String, VecDeque<String>>,
    reads: HashMap<String, usize>,
    files: HashMap<String, Vec<String>>,
    output: VecDeque<String>,
    cancel_after: Option<(String, usize, CancelToken)>,
    failing_shell: Option<String>,
    pub calls: Vec<Call>,
    /// Deadlines passed to `shell_command_within`/`read_file_within`, by command or path
    pub deadlines: Vec<(String, Duration)>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values returned by successive reads of `name`.
    pub fn with_values(mut self, name: &str, values: &[&str]) -> Self {
        self.values.insert(
            name.to_lowercase(),
            values.iter().map(|v| v.to_string()).collect(),
        );
        self
    }

    pub fn with_file(mut self, path: &str, lines: &[&str]) -> Self {
        self.files
            .insert(path.to_string(), lines.iter().map(|l| l.to_string()).collect());
        self
    }

    /// Lines returned by the next `read_timeout`/`wait_for`.
    pub fn with_output(mut self, lines: &[&str]) -> Self {
        self.output.extend(lines.iter().map(|l| l.to_string()));
        self
    }

    /// Cancel `token` once `name` has been read `reads` times.
    pub fn cancel_after(mut self, name: &str, reads: usize, token: &CancelToken) -> Self {
        self.cancel_after = Some((name.to_lowercase(), reads, token.clone()));
        self
    }

    /// Make shell commands starting with `prefix` exit with status 1.
    pub fn failing_shell(mut self, prefix: &str) -> Self {
        self.failing_shell = Some(prefix.to_string());
        self
    }

    /// Values written to `name`, in order.
    pub fn sets(&self, name: &str) -> Vec<String> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::Set(var, value) if var.eq_ignore_ascii_case(name) => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of reads of `name`.
    pub fn reads(&self, name: &str) -> usize {
        self.reads.get(&name.to_lowercase()).copied().unwrap_or(0)
    }

    pub fn count(&self, wanted: &Call) -> usize {
        self.calls.iter().filter(|call| *call == wanted).count()
    }

    pub fn position(&self, wanted: &Call) -> Option<usize> {
        self.calls.iter().position(|call| call == wanted)
    }

    pub fn shell_commands(&self) -> Vec<&str> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::Shell(cmd) => Some(cmd.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl PmacChannel for ScriptedChannel {
    fn read_file(&mut self, path: &str) -> CommResult<Vec<String>> {
        self.calls.push(Call::ReadFile(path.to_string()));
        self.files.get(path).cloned().ok_or_else(|| {
            CommError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, path.to_string()))
        })
    }

    fn read_file_within(&mut self, path: &str, timeout: Duration) -> CommResult<Vec<String>> {
        self.deadlines.push((path.to_string(), timeout));
        self.read_file(path)
    }

    fn shell_command_within(&mut self, command: &str, timeout: Duration) -> CommResult<()> {
        self.deadlines.push((command.to_string(), timeout));
        self.shell_command(command)
    }

    fn send_file(&mut self, path: &str, contents: &str) -> CommResult<()> {
        self.calls
            .push(Call::SendFile(path.to_string(), contents.to_string()));
        Ok(())
    }

    fn shell_command(&mut self, command: &str) -> CommResult<()> {
        self.calls.push(Call::Shell(command.to_string()));
        match &self.failing_shell {
            Some(prefix) if command.starts_with(prefix.as_str()) => Err(CommError::CommandFailed {
                command: command.to_string(),
                status: 1,
            }),
            _ => Ok(()),
        }
    }

    fn get_variable(&mut self, name: &str) -> CommResult<String> {
        self.calls.push(Call::Get(name.to_string()));
        let key = name.to_lowercase();

        let reads = self.reads.entry(key.clone()).or_insert(0);
        *reads += 1;
        if let Some((var, after, token)) = &self.cancel_after {
            if *var == key && *reads >= *after {
                token.cancel();
            }
        }

        let queue = self
            .values
            .get_mut(&key)
            .ok_or_else(|| CommError::Device(format!("error #20: ILLEGAL CMD: {name}")))?;
        let value = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        value.ok_or(CommError::Timeout)
    }

    fn set_variable(&mut self, name: &str, value: &str) -> CommResult<()> {
        self.calls.push(Call::Set(name.to_string(), value.to_string()));
        Ok(())
    }

    fn open_session(&mut self) -> CommResult<()> {
        self.calls.push(Call::OpenSession);
        Ok(())
    }

    fn close_session(&mut self) -> CommResult<()> {
        self.calls.push(Call::CloseSession);
        Ok(())
    }

    fn send_line(&mut self, line: &str) -> CommResult<()> {
        self.calls.push(Call::SendLine(line.to_string()));
        Ok(())
    }

    fn program(&mut self, coord_sys: u32, program: u32, action: ProgramAction) -> CommResult<()> {
        self.calls.push(Call::Program(coord_sys, program, action));
        Ok(())
    }

    fn wait_for(&mut self, pattern: &Regex, _timeout: Duration) -> CommResult<WaitMatch> {
        self.calls.push(Call::WaitFor(pattern.as_str().to_string()));
        let queued: Vec<String> = self.output.drain(..).collect();
        let mut lines = Vec::new();
        scan_for_match(queued, pattern, &mut lines)
            .map(|groups| WaitMatch { lines, groups })
            .ok_or(CommError::Timeout)
    }

    fn read_timeout(&mut self, _timeout: Duration) -> CommResult<Vec<String>> {
        self.calls.push(Call::ReadTimeout);
        if self.output.is_empty() {
            return Err(CommError::Timeout);
        }
        Ok(self.output.drain(..).collect())
    }
}
