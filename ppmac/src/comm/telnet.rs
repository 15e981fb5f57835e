//! Telnet transport for Power PMAC controllers.
//!
//! The Power PMAC runs an embedded Linux with a telnet daemon. This transport
//! logs in twice:
//!
//! - a **shell** connection, used for file transfer and shell commands, and
//! - a **session** connection running `gpascii -2`, the controller's command
//!   interpreter, used for variable access, program control and raw script lines.
//!
//! # Shell Framing
//!
//! Shell commands are sent as `<command>; echo __PPMAC_STATUS__$?` with echo and
//! prompts disabled, so the end of a command's output is the marker line carrying
//! its exit status. Files are read with `cat` and written with a quoted heredoc.
//!
//! # Telnet Options
//!
//! The client refuses every option the server offers or requests (`WILL` is
//! answered with `DONT`, `DO` with `WONT`), which leaves a plain NVT byte stream.
//! Subnegotiations are skipped.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, info, trace};

use super::{
    is_error_line, program_command, scan_for_match, split_assignment, CommError, CommResult,
    PmacChannel, ProgramAction, WaitMatch,
};

/// Default controller address (factory setting).
pub const DEFAULT_HOST: &str = "10.0.0.98";

/// Default telnet port.
pub const DEFAULT_PORT: u16 = 23;

/// Default login user.
pub const DEFAULT_USER: &str = "root";

/// Default login password (factory setting).
pub const DEFAULT_PASSWORD: &str = "deltatau";

/// Default timeout for logins and shell commands.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for a single variable read.
const DEFAULT_VARIABLE_TIMEOUT: Duration = Duration::from_millis(200);

/// Granularity of socket reads while waiting on a deadline.
const READ_SLICE: Duration = Duration::from_millis(10);

const GPASCII_COMMAND: &str = "gpascii -2";
const GPASCII_READY: &str = "STDIN Open for ASCII Input";
const STATUS_MARKER: &str = "__PPMAC_STATUS__";
const READY_MARKER: &str = "__PPMAC_READY__";
const HEREDOC_MARKER: &str = "__PPMAC_EOF__";
const EOT: u8 = 0x04;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

/// Connection parameters for [`TelnetPmac::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Controller hostname or IP
    pub host: String,
    /// Telnet port
    pub port: u16,
    /// Login user
    pub user: String,
    /// Login password
    pub password: String,
    /// Timeout for logins, shell commands and file transfers
    pub timeout: Duration,
    /// Timeout for a single variable read
    pub variable_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            user: DEFAULT_USER.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            timeout: DEFAULT_TIMEOUT,
            variable_timeout: DEFAULT_VARIABLE_TIMEOUT,
        }
    }
}

/// One telnet connection: option refusal plus line buffering.
struct TelnetStream {
    stream: TcpStream,
    /// Undecoded bytes (an option sequence split across reads)
    raw: Vec<u8>,
    /// Decoded bytes not yet consumed as lines
    buffer: Vec<u8>,
}

impl TelnetStream {
    fn connect(options: &ConnectOptions) -> CommResult<Self> {
        let addr = format!("{}:{}", options.host, options.port);
        let stream = TcpStream::connect(&addr)
            .map_err(|e| CommError::ConnectionFailed(format!("Failed to connect to {addr}: {e}")))?;
        stream.set_write_timeout(Some(options.timeout))?;
        stream.set_read_timeout(Some(READ_SLICE))?;

        debug!("Connected to {addr} via telnet");

        Ok(Self {
            stream,
            raw: Vec::new(),
            buffer: Vec::new(),
        })
    }

    fn write_raw(&mut self, bytes: &[u8]) -> CommResult<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> CommResult<()> {
        debug!("telnet send: {:?}", line);
        let mut msg = line.as_bytes().to_vec();
        msg.extend_from_slice(b"\r\n");
        self.write_raw(&msg)
    }

    /// Read whatever arrives within one read slice. Returns whether new data arrived.
    fn fill(&mut self) -> CommResult<bool> {
        let mut chunk = [0u8; 1024];
        match self.stream.read(&mut chunk) {
            Ok(0) => Err(CommError::ChannelClosed),
            Ok(n) => {
                self.absorb(&chunk[..n])?;
                Ok(true)
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Strip telnet commands from incoming bytes, refusing every option.
    fn absorb(&mut self, data: &[u8]) -> CommResult<()> {
        self.raw.extend_from_slice(data);
        let mut replies = Vec::new();
        let mut i = 0;

        while i < self.raw.len() {
            let byte = self.raw[i];
            if byte != IAC {
                self.buffer.push(byte);
                i += 1;
                continue;
            }

            let Some(&command) = self.raw.get(i + 1) else {
                break;
            };
            match command {
                IAC => {
                    self.buffer.push(IAC);
                    i += 2;
                }
                DO | DONT | WILL | WONT => {
                    let Some(&option) = self.raw.get(i + 2) else {
                        break;
                    };
                    match command {
                        DO => replies.extend_from_slice(&[IAC, WONT, option]),
                        WILL => replies.extend_from_slice(&[IAC, DONT, option]),
                        _ => {}
                    }
                    i += 3;
                }
                SB => {
                    let end = self.raw[i + 2..]
                        .windows(2)
                        .position(|w| w == [IAC, SE]);
                    match end {
                        Some(offset) => i += 2 + offset + 2,
                        None => break,
                    }
                }
                _ => i += 2,
            }
        }

        self.raw.drain(..i);
        if !replies.is_empty() {
            self.write_raw(&replies)?;
        }
        Ok(())
    }

    /// Pop one complete line from the buffer.
    fn take_line(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|&b| b == b'\n')?;
        let bytes: Vec<u8> = self.buffer.drain(..=end).collect();
        // Controller output is Latin-1; map bytes straight to code points
        let line: String = bytes
            .iter()
            .filter(|&&b| b != b'\r' && b != b'\n' && b != 0)
            .map(|&b| b as char)
            .collect();
        trace!("telnet recv: {:?}", line);
        Some(line)
    }

    fn read_line(&mut self, deadline: Instant) -> CommResult<String> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }
            if Instant::now() >= deadline {
                return Err(CommError::Timeout);
            }
            self.fill()?;
        }
    }

    /// Wait until `needle` shows up (prompts carry no newline), then discard through it.
    fn expect(&mut self, needle: &str, deadline: Instant) -> CommResult<()> {
        loop {
            let text: String = self.buffer.iter().map(|&b| b as char).collect();
            if let Some(pos) = text.find(needle) {
                let consumed = text[..pos + needle.len()].chars().count();
                self.buffer.drain(..consumed);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CommError::Timeout);
            }
            self.fill()?;
        }
    }

    /// Discard everything received so far.
    fn sync(&mut self) -> CommResult<()> {
        while self.fill()? {}
        self.buffer.clear();
        Ok(())
    }

    /// Log in and switch the shell to a marker-friendly mode.
    fn login(&mut self, options: &ConnectOptions) -> CommResult<()> {
        let deadline = Instant::now() + options.timeout;
        let login_err = |e: CommError| match e {
            CommError::Timeout => CommError::ConnectionFailed("Login prompt timed out".to_string()),
            other => other,
        };

        self.expect("login:", deadline).map_err(login_err)?;
        self.write_line(&options.user)?;
        self.expect("assword:", deadline).map_err(login_err)?;
        self.write_line(&options.password)?;

        self.write_line(&format!("stty -echo; PS1=''; PS2=''; echo {READY_MARKER}"))?;
        loop {
            let line = self.read_line(deadline).map_err(login_err)?;
            if line.trim() == READY_MARKER {
                break;
            }
            if line.contains("Login incorrect") {
                return Err(CommError::ConnectionFailed(format!(
                    "Login rejected for user {}",
                    options.user
                )));
            }
        }
        Ok(())
    }
}

/// Quote a path for the remote shell.
fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Power PMAC reached over telnet.
///
/// # Example
///
/// ```no_run
/// use ppmac::comm::telnet::{ConnectOptions, TelnetPmac};
/// use ppmac::comm::PmacChannel;
///
/// let mut pmac = TelnetPmac::connect(&ConnectOptions {
///     host: "192.168.0.200".to_string(),
///     ..ConnectOptions::default()
/// })?;
///
/// let samples: u64 = pmac.get_parsed("gather.samples")?;
/// println!("Gather buffer holds {samples} samples");
/// # Ok::<(), ppmac::comm::CommError>(())
/// ```
pub struct TelnetPmac {
    options: ConnectOptions,
    shell: TelnetStream,
    session: Option<TelnetStream>,
    /// Shell command output not yet consumed by `wait_for`/`read_timeout`
    output: VecDeque<String>,
}

impl TelnetPmac {
    /// Connect and log in to a controller.
    ///
    /// # Errors
    ///
    /// Returns [`CommError::ConnectionFailed`] if the TCP connection cannot be
    /// established or the login is rejected.
    pub fn connect(options: &ConnectOptions) -> CommResult<Self> {
        let mut shell = TelnetStream::connect(options)?;
        shell.login(options)?;
        info!("Logged in to Power PMAC at {}", options.host);

        Ok(Self {
            options: options.clone(),
            shell,
            session: None,
            output: VecDeque::new(),
        })
    }

    /// Set the timeout for logins, shell commands and file transfers.
    pub fn set_timeout(&mut self, timeout: Duration) -> CommResult<()> {
        self.shell.stream.set_write_timeout(Some(timeout))?;
        self.options.timeout = timeout;
        Ok(())
    }

    /// Run `op` with the command timeout temporarily set to `timeout`.
    fn with_deadline<T>(
        &mut self,
        timeout: Duration,
        op: impl FnOnce(&mut Self) -> CommResult<T>,
    ) -> CommResult<T> {
        let previous = std::mem::replace(&mut self.options.timeout, timeout);
        let result = op(self);
        self.options.timeout = previous;
        result
    }

    /// Whether the `gpascii` session is open.
    pub fn session_open(&self) -> bool {
        self.session.is_some()
    }

    /// Run a shell command to completion and return its output lines.
    fn run(&mut self, command: &str, body: &[&str]) -> CommResult<Vec<String>> {
        self.shell.sync()?;
        self.shell
            .write_line(&format!("{command}; echo {STATUS_MARKER}$?"))?;
        for line in body {
            self.shell.write_line(line)?;
        }

        let deadline = Instant::now() + self.options.timeout;
        let mut output = Vec::new();
        loop {
            let line = self.shell.read_line(deadline)?;
            if let Some(status) = line.trim().strip_prefix(STATUS_MARKER) {
                let status: i32 = status.trim().parse().map_err(|_| {
                    CommError::InvalidResponse(format!("Invalid exit status: {line}"))
                })?;
                if status != 0 {
                    return Err(CommError::CommandFailed {
                        command: command.to_string(),
                        status,
                    });
                }
                return Ok(output);
            }
            output.push(line);
        }
    }

    fn session(&mut self) -> CommResult<&mut TelnetStream> {
        if self.session.is_none() {
            self.open_session()?;
        }
        self.session.as_mut().ok_or(CommError::ChannelClosed)
    }
}

impl PmacChannel for TelnetPmac {
    fn read_file(&mut self, path: &str) -> CommResult<Vec<String>> {
        let lines = self.run(&format!("cat {}", shell_quote(path)), &[])?;
        debug!("Read {} lines from {}", lines.len(), path);
        Ok(lines)
    }

    fn read_file_within(&mut self, path: &str, timeout: Duration) -> CommResult<Vec<String>> {
        self.with_deadline(timeout, |pmac| pmac.read_file(path))
    }

    fn shell_command_within(&mut self, command: &str, timeout: Duration) -> CommResult<()> {
        self.with_deadline(timeout, |pmac| pmac.shell_command(command))
    }

    fn send_file(&mut self, path: &str, contents: &str) -> CommResult<()> {
        let mut body: Vec<&str> = contents.lines().collect();
        body.push(HEREDOC_MARKER);
        let command = format!("cat > {} << '{HEREDOC_MARKER}'", shell_quote(path));
        self.run(&command, &body)?;
        debug!("Wrote {} lines to {}", body.len() - 1, path);
        Ok(())
    }

    fn shell_command(&mut self, command: &str) -> CommResult<()> {
        let lines = self.run(command, &[])?;
        self.output.extend(lines);
        Ok(())
    }

    fn get_variable(&mut self, name: &str) -> CommResult<String> {
        let name = name.to_lowercase();
        let deadline = Instant::now() + self.options.variable_timeout;
        let session = self.session()?;
        session.write_line(&name)?;

        loop {
            let line = session.read_line(deadline)?;
            if is_error_line(&line) {
                return Err(CommError::Device(line));
            }
            if let Some((var, value)) = split_assignment(&line) {
                if var.eq_ignore_ascii_case(&name) {
                    return Ok(value.to_string());
                }
            }
        }
    }

    fn set_variable(&mut self, name: &str, value: &str) -> CommResult<()> {
        let name = name.to_lowercase();
        self.session()?.write_line(&format!("{name}={value}"))?;
        // Reading back surfaces any error line the assignment produced
        self.get_variable(&name).map(|_| ())
    }

    fn open_session(&mut self) -> CommResult<()> {
        if self.session.is_some() {
            return Ok(());
        }

        let mut session = TelnetStream::connect(&self.options)?;
        session.login(&self.options)?;
        session.write_line(GPASCII_COMMAND)?;

        let deadline = Instant::now() + self.options.timeout;
        loop {
            let line = session.read_line(deadline)?;
            if line.trim_end().ends_with(GPASCII_READY) {
                break;
            }
        }

        debug!("gpascii session open");
        self.session = Some(session);
        Ok(())
    }

    fn close_session(&mut self) -> CommResult<()> {
        if let Some(mut session) = self.session.take() {
            session.sync()?;
            session.write_raw(&[EOT])?;
            debug!("gpascii session closed");
        }
        Ok(())
    }

    fn send_line(&mut self, line: &str) -> CommResult<()> {
        match self.session.as_mut() {
            Some(session) => session.write_line(line),
            None => Err(CommError::ChannelClosed),
        }
    }

    fn program(&mut self, coord_sys: u32, program: u32, action: ProgramAction) -> CommResult<()> {
        let command = program_command(coord_sys, program, action);
        self.session()?.write_line(&command)
    }

    fn wait_for(&mut self, pattern: &Regex, timeout: Duration) -> CommResult<WaitMatch> {
        let deadline = Instant::now() + timeout;
        let mut lines = Vec::new();

        let queued: Vec<String> = self.output.drain(..).collect();
        if let Some(groups) = scan_for_match(queued, pattern, &mut lines) {
            return Ok(WaitMatch { lines, groups });
        }

        let Some(session) = self.session.as_mut() else {
            return Err(CommError::Timeout);
        };
        loop {
            let line = session.read_line(deadline)?;
            if let Some(groups) = scan_for_match([line], pattern, &mut lines) {
                return Ok(WaitMatch { lines, groups });
            }
        }
    }

    fn read_timeout(&mut self, timeout: Duration) -> CommResult<Vec<String>> {
        let deadline = Instant::now() + timeout;
        let mut lines: Vec<String> = self.output.drain(..).collect();

        if let Some(session) = self.session.as_mut() {
            loop {
                match session.read_line(deadline) {
                    Ok(line) => lines.push(line),
                    Err(CommError::Timeout) => break,
                    Err(e) => return Err(e),
                }
            }
        }

        if lines.is_empty() {
            Err(CommError::Timeout)
        } else {
            Ok(lines)
        }
    }
}

impl Drop for TelnetPmac {
    fn drop(&mut self) {
        let _ = self.close_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/var/ftp/gather/GatherFile.txt"), "'/var/ftp/gather/GatherFile.txt'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_default_options() {
        let options = ConnectOptions::default();
        assert_eq!(options.host, DEFAULT_HOST);
        assert_eq!(options.port, 23);
        assert_eq!(options.user, "root");
    }

    /// Connected pair: a `TelnetStream` and the server side of its socket.
    fn stream_pair() -> (TelnetStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let options = ConnectOptions {
            host: "127.0.0.1".to_string(),
            port,
            ..ConnectOptions::default()
        };
        let client = TelnetStream::connect(&options).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_option_negotiation_is_refused() {
        let (mut client, mut server) = stream_pair();

        // IAC WILL ECHO, IAC DO SGA, then text with an escaped 0xFF
        server
            .write_all(&[IAC, WILL, 1, IAC, DO, 3, b'o', b'k', IAC, IAC, b'\r', b'\n'])
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let line = client.read_line(deadline).unwrap();
        assert_eq!(line, "ok\u{ff}");

        let mut reply = [0u8; 6];
        server.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        server.read_exact(&mut reply).unwrap();
        assert_eq!(reply, [IAC, DONT, 1, IAC, WONT, 3]);
    }

    #[test]
    fn test_subnegotiation_is_skipped() {
        let (mut client, mut server) = stream_pair();
        server
            .write_all(&[IAC, SB, 24, 1, IAC, SE, b'h', b'i', b'\n'])
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        assert_eq!(client.read_line(deadline).unwrap(), "hi");
    }

    #[test]
    fn test_expect_prompt_without_newline() {
        let (mut client, mut server) = stream_pair();
        server.write_all(b"ppmac login: ").unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        client.expect("login:", deadline).unwrap();
        assert!(!client.buffer.contains(&b':'));
    }

    /// Accept one login, then answer each shell command with exit status 0.
    fn fake_shell(listener: TcpListener, commands: usize) -> std::thread::JoinHandle<Vec<String>> {
        std::thread::spawn(move || {
            let (mut server, _) = listener.accept().unwrap();
            let mut reader = std::io::BufReader::new(server.try_clone().unwrap());
            let mut next_line = || {
                let mut line = String::new();
                std::io::BufRead::read_line(&mut reader, &mut line).unwrap();
                line.trim_end().to_string()
            };

            server.write_all(b"ppmac login: ").unwrap();
            next_line();
            server.write_all(b"Password: ").unwrap();
            next_line();
            next_line();
            server.write_all(format!("{READY_MARKER}\r\n").as_bytes()).unwrap();

            let mut received = Vec::new();
            for _ in 0..commands {
                received.push(next_line());
                server
                    .write_all(format!("{STATUS_MARKER}0\r\n").as_bytes())
                    .unwrap();
            }
            received
        })
    }

    fn connect_local(port: u16) -> TelnetPmac {
        TelnetPmac::connect(&ConnectOptions {
            host: "127.0.0.1".to_string(),
            port,
            ..ConnectOptions::default()
        })
        .unwrap()
    }

    #[test]
    fn test_shell_command_within_restores_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = fake_shell(listener, 1);
        let mut pmac = connect_local(port);

        pmac.shell_command_within("gather /var/ftp/gather/GatherFile.txt -u", Duration::from_secs(60))
            .unwrap();
        assert_eq!(pmac.options.timeout, DEFAULT_TIMEOUT);

        let received = server.join().unwrap();
        assert_eq!(
            received,
            vec![format!("gather /var/ftp/gather/GatherFile.txt -u; echo {STATUS_MARKER}$?")]
        );
    }

    #[test]
    fn test_set_timeout_rejects_zero() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = fake_shell(listener, 0);
        let mut pmac = connect_local(port);

        assert!(matches!(pmac.set_timeout(Duration::ZERO), Err(CommError::Io(_))));
        assert_eq!(pmac.options.timeout, DEFAULT_TIMEOUT);

        pmac.set_timeout(Duration::from_secs(50)).unwrap();
        assert_eq!(pmac.options.timeout, Duration::from_secs(50));
        server.join().unwrap();
    }

    #[test]
    fn test_read_line_times_out() {
        let (mut client, _server) = stream_pair();
        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(matches!(client.read_line(deadline), Err(CommError::Timeout)));
    }
}
