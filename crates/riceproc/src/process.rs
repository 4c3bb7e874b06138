//! Process engine - state machine from spawn to reaping
//!
//! A [`Process`] owns one external command invocation: it selects a pipe
//! backend, spawns the child, interleaves non-blocking I/O with status
//! polling, enforces the wall-clock and idle timeout clocks, delivers
//! signals, and reaps the child into a final exit code.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{ProcessError, Result, TimeoutKind};
use crate::exit_status::{exit_code_text, resolve_exit_code, StatusSnapshot};
use crate::input::{validate_timeout, Input};
use crate::pipes::{PipeBackend, SIGCHILD_CHANNEL, STDOUT};

#[cfg(unix)]
use crate::pipes::unix::{is_tty_supported, UnixPipes};
#[cfg(windows)]
use crate::pipes::windows::WindowsPipes;

/// Timeout granularity of the polling loop, in seconds.
pub const TIMEOUT_PRECISION: f64 = 0.2;

const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

/// Lifecycle state of a [`Process`].
///
/// The state only ever moves forward: `Ready` → `Started` → `Terminated`.
/// Restarting yields a fresh `Ready` process instead of rewinding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Created but not yet started.
    Ready,
    /// Spawned; the pipe backend owns the child's standard streams.
    Started,
    /// Reaped; the exit code is final.
    Terminated,
}

impl ProcessStatus {
    /// Lowercase string form of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Ready => "ready",
            ProcessStatus::Started => "started",
            ProcessStatus::Terminated => "terminated",
        }
    }
}

/// Which of the child's output streams produced a chunk of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output.
    Out,
    /// Standard error.
    Err,
}

impl OutputStream {
    /// String form used by callers that key on stream names.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Out => "out",
            OutputStream::Err => "err",
        }
    }
}

/// Callback invoked synchronously with each fresh chunk of child output.
pub type OutputCallback = Box<dyn FnMut(OutputStream, &[u8]) + 'static>;

/// Opaque platform spawn hints.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Windows: hide the console window of the spawned shell.
    pub suppress_errors: bool,
    /// Windows: hand the wrapped command line to `cmd.exe` verbatim.
    /// Defaults to true when unset.
    pub bypass_shell: Option<bool>,
    /// Force the sigchild exit-code workaround on or off, overriding the
    /// platform probe.
    pub sigchild_compat: Option<bool>,
}

/// Whether `waitpid` on this platform cannot be relied on for exit codes.
///
/// No supported target has that defect, so the probe reports false; the
/// workaround stays reachable through [`ProcessOptions::sigchild_compat`].
fn is_sigchild_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| false)
}

/// One external command invocation.
///
/// # Examples
/// ```no_run
/// use riceproc::Process;
///
/// # fn main() -> riceproc::Result<()> {
/// let mut process = Process::new("echo hello");
/// process.run()?;
/// assert_eq!(process.get_output()?, "hello\n");
/// # Ok(())
/// # }
/// ```
pub struct Process {
    command_line: String,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
    inherit_env: bool,
    input: Input,
    timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    options: ProcessOptions,
    tty: bool,
    pty: bool,
    output_disabled: bool,

    status: ProcessStatus,
    exit_code: Option<i32>,
    fallback_exit_code: Option<i32>,
    process_information: StatusSnapshot,
    stdout_buffer: Vec<u8>,
    stderr_buffer: Vec<u8>,
    incremental_output_offset: usize,
    incremental_error_output_offset: usize,
    start_time: Option<Instant>,
    last_output_time: Option<Instant>,
    latest_signal: Option<i32>,
    child: Option<std::process::Child>,
    pipes: Option<Box<dyn PipeBackend>>,
    callback: Option<OutputCallback>,
}

impl Process {
    /// Create a process for the given shell-ready command line.
    pub fn new(command_line: impl Into<String>) -> Self {
        Process {
            command_line: command_line.into(),
            cwd: None,
            env: HashMap::new(),
            inherit_env: true,
            input: Input::None,
            timeout: None,
            idle_timeout: None,
            options: ProcessOptions::default(),
            tty: false,
            pty: false,
            output_disabled: false,
            status: ProcessStatus::Ready,
            exit_code: None,
            fallback_exit_code: None,
            process_information: StatusSnapshot::default(),
            stdout_buffer: Vec::new(),
            stderr_buffer: Vec::new(),
            incremental_output_offset: 0,
            incremental_error_output_offset: 0,
            start_time: None,
            last_output_time: None,
            latest_signal: None,
            child: None,
            pipes: None,
            callback: None,
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Replace the command line.
    pub fn set_command_line(&mut self, command_line: impl Into<String>) -> Result<&mut Self> {
        self.ensure_not_running("set_command_line")?;
        self.command_line = command_line.into();
        Ok(self)
    }

    /// The configured command line.
    pub fn get_command_line(&self) -> &str {
        &self.command_line
    }

    /// Set the working directory the child runs in.
    pub fn set_working_directory(&mut self, cwd: impl Into<PathBuf>) -> Result<&mut Self> {
        self.ensure_not_running("set_working_directory")?;
        self.cwd = Some(cwd.into());
        Ok(self)
    }

    /// The configured working directory, if any.
    pub fn get_working_directory(&self) -> Option<&PathBuf> {
        self.cwd.as_ref()
    }

    /// Replace the user-supplied environment map. The map is copied; the
    /// caller may freely mutate theirs afterward.
    pub fn set_env(&mut self, env: HashMap<String, String>) -> Result<&mut Self> {
        self.ensure_not_running("set_env")?;
        self.env = env;
        Ok(self)
    }

    /// The user-supplied environment map.
    pub fn get_env(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// Whether the child's environment is the union of the ambient process
    /// environment and the user map (user entries win). When false only the
    /// user map is passed.
    pub fn set_inherit_env(&mut self, inherit: bool) -> Result<&mut Self> {
        self.ensure_not_running("set_inherit_env")?;
        self.inherit_env = inherit;
        Ok(self)
    }

    /// Set what gets fed to the child's standard input.
    pub fn set_input(&mut self, input: impl Into<Input>) -> Result<&mut Self> {
        if self.is_running() {
            return Err(ProcessError::Logic(
                "Input cannot be set while the process is running.".into(),
            ));
        }
        self.input = input.into();
        Ok(self)
    }

    /// Set the wall-clock timeout in seconds. `0.0` disables it.
    pub fn set_timeout(&mut self, seconds: f64) -> Result<&mut Self> {
        self.ensure_not_running("set_timeout")?;
        self.timeout = validate_timeout("set_timeout", seconds)?;
        Ok(self)
    }

    /// The wall-clock timeout in seconds, if set.
    pub fn get_timeout(&self) -> Option<f64> {
        self.timeout.map(|timeout| timeout.as_secs_f64())
    }

    /// Set the idle timeout: the longest allowed silence on both output
    /// streams, in seconds. `0.0` disables it. Requires visible output.
    pub fn set_idle_timeout(&mut self, seconds: f64) -> Result<&mut Self> {
        self.ensure_not_running("set_idle_timeout")?;
        if self.output_disabled && seconds != 0.0 {
            return Err(ProcessError::Logic(
                "An idle timeout cannot be set while the output is disabled.".into(),
            ));
        }
        self.idle_timeout = validate_timeout("set_idle_timeout", seconds)?;
        Ok(self)
    }

    /// The idle timeout in seconds, if set.
    pub fn get_idle_timeout(&self) -> Option<f64> {
        self.idle_timeout.map(|timeout| timeout.as_secs_f64())
    }

    /// Replace the platform spawn hints.
    pub fn set_options(&mut self, options: ProcessOptions) -> Result<&mut Self> {
        self.ensure_not_running("set_options")?;
        self.options = options;
        Ok(self)
    }

    /// Connect the child's standard streams to the controlling terminal.
    pub fn set_tty(&mut self, tty: bool) -> Result<&mut Self> {
        if tty && cfg!(windows) {
            return Err(ProcessError::Runtime(
                "TTY mode is not supported on Windows platforms.".into(),
            ));
        }
        #[cfg(unix)]
        if tty && !is_tty_supported() {
            return Err(ProcessError::Runtime(
                "TTY mode requires /dev/tty to be read/writable.".into(),
            ));
        }
        self.ensure_not_running("set_tty")?;
        self.tty = tty;
        Ok(self)
    }

    /// Whether TTY mode is enabled.
    pub fn is_tty(&self) -> bool {
        self.tty
    }

    /// Connect the child's standard streams to a pseudo-terminal when the
    /// platform supports one; falls back to plain pipes otherwise.
    pub fn set_pty(&mut self, pty: bool) -> Result<&mut Self> {
        self.ensure_not_running("set_pty")?;
        self.pty = pty;
        Ok(self)
    }

    /// Whether PTY mode is requested.
    pub fn is_pty(&self) -> bool {
        self.pty
    }

    /// Route the child's output to the null device instead of capturing it.
    pub fn disable_output(&mut self) -> Result<&mut Self> {
        if self.is_running() {
            return Err(ProcessError::Runtime(
                "Disabling output while the process is running is not possible.".into(),
            ));
        }
        if self.idle_timeout.is_some() {
            return Err(ProcessError::Logic(
                "Output cannot be disabled while an idle timeout is set.".into(),
            ));
        }
        self.output_disabled = true;
        Ok(self)
    }

    /// Re-enable output capture.
    pub fn enable_output(&mut self) -> Result<&mut Self> {
        if self.is_running() {
            return Err(ProcessError::Runtime(
                "Enabling output while the process is running is not possible.".into(),
            ));
        }
        self.output_disabled = false;
        Ok(self)
    }

    /// Whether output capture is disabled.
    pub fn is_output_disabled(&self) -> bool {
        self.output_disabled
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Spawn the child and return immediately.
    pub fn start(&mut self) -> Result<()> {
        self.start_impl(None)
    }

    /// Spawn the child with an output callback and return immediately.
    pub fn start_with<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(OutputStream, &[u8]) + 'static,
    {
        self.start_impl(Some(Box::new(callback)))
    }

    /// Block until the child exits, draining pipes and enforcing timeouts.
    ///
    /// Returns the exit code. Fails with [`ProcessError::Runtime`] if the
    /// child died from a signal other than the last one the caller sent.
    pub fn wait(&mut self) -> Result<i32> {
        self.wait_impl(None)
    }

    /// Like [`Process::wait`], installing an output callback first.
    pub fn wait_with<F>(&mut self, callback: F) -> Result<i32>
    where
        F: FnMut(OutputStream, &[u8]) + 'static,
    {
        self.wait_impl(Some(Box::new(callback)))
    }

    /// `start` followed by `wait`.
    pub fn run(&mut self) -> Result<i32> {
        self.start_impl(None)?;
        self.wait_impl(None)
    }

    /// Like [`Process::run`] with an output callback.
    pub fn run_with<F>(&mut self, callback: F) -> Result<i32>
    where
        F: FnMut(OutputStream, &[u8]) + 'static,
    {
        self.start_impl(Some(Box::new(callback)))?;
        self.wait_impl(None)
    }

    /// Run and fail with [`ProcessError::Failed`] on a non-zero exit.
    pub fn must_run(&mut self) -> Result<i32> {
        let code = self.run()?;
        self.check_successful(code)
    }

    /// Like [`Process::must_run`] with an output callback.
    pub fn must_run_with<F>(&mut self, callback: F) -> Result<i32>
    where
        F: FnMut(OutputStream, &[u8]) + 'static,
    {
        let code = self.run_with(callback)?;
        self.check_successful(code)
    }

    /// Stop the child: SIGTERM, a 1 ms-granularity grace wait, then the
    /// escalation signal (SIGKILL by default).
    ///
    /// Returns the exit code once the child is gone.
    pub fn stop(&mut self, grace_seconds: f64, signal: Option<i32>) -> Option<i32> {
        let deadline = Instant::now() + Duration::from_secs_f64(grace_seconds.max(0.0));
        if self.is_running() {
            debug!(pid = ?self.process_information.pid, "stopping process");
            let _ = self.do_signal(SIGTERM, false);
            while self.is_running() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            if self.is_running() {
                warn!(pid = ?self.process_information.pid, "escalating to kill signal");
                let _ = self.do_signal(signal.unwrap_or(SIGKILL), false);
            }
        }
        if self.is_running() {
            // Last resort for a child the signal path could not reach.
            if let Some(child) = self.child.as_mut() {
                let _ = child.kill();
            }
            self.close_process();
        }
        self.exit_code
    }

    /// Send a signal to the child.
    pub fn signal(&mut self, signal: i32) -> Result<()> {
        self.do_signal(signal, true).map(|_| ())
    }

    /// Clone this process back to `Ready` and start the clone.
    ///
    /// The original process is untouched; its exit code and buffers remain
    /// intact.
    pub fn restart(&mut self) -> Result<Process> {
        self.restart_impl(None)
    }

    /// Like [`Process::restart`] with an output callback for the clone.
    pub fn restart_with<F>(&mut self, callback: F) -> Result<Process>
    where
        F: FnMut(OutputStream, &[u8]) + 'static,
    {
        self.restart_impl(Some(Box::new(callback)))
    }

    /// Enforce both timeout clocks, stopping the child on expiry.
    pub fn check_timeout(&mut self) -> Result<()> {
        if self.status != ProcessStatus::Started {
            return Ok(());
        }
        if let Some(timeout) = self.timeout {
            if self.start_time.is_some_and(|start| start.elapsed() > timeout) {
                self.stop(0.0, None);
                return Err(ProcessError::TimedOut {
                    command: self.command_line.clone(),
                    kind: TimeoutKind::General,
                    seconds: timeout.as_secs_f64(),
                });
            }
        }
        if let Some(idle) = self.idle_timeout {
            if self.last_output_time.is_some_and(|last| last.elapsed() > idle) {
                self.stop(0.0, None);
                return Err(ProcessError::TimedOut {
                    command: self.command_line.clone(),
                    kind: TimeoutKind::Idle,
                    seconds: idle.as_secs_f64(),
                });
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    /// Everything the child wrote to stdout so far, lossily decoded.
    pub fn get_output(&mut self) -> Result<String> {
        self.read_pipes_for_output("get_output")?;
        Ok(String::from_utf8_lossy(&self.stdout_buffer).into_owned())
    }

    /// Everything the child wrote to stderr so far, lossily decoded.
    pub fn get_error_output(&mut self) -> Result<String> {
        self.read_pipes_for_output("get_error_output")?;
        Ok(String::from_utf8_lossy(&self.stderr_buffer).into_owned())
    }

    /// The stdout suffix produced since the previous incremental read.
    pub fn get_incremental_output(&mut self) -> Result<String> {
        self.read_pipes_for_output("get_incremental_output")?;
        let fresh = String::from_utf8_lossy(&self.stdout_buffer[self.incremental_output_offset..])
            .into_owned();
        self.incremental_output_offset = self.stdout_buffer.len();
        Ok(fresh)
    }

    /// The stderr suffix produced since the previous incremental read.
    pub fn get_incremental_error_output(&mut self) -> Result<String> {
        self.read_pipes_for_output("get_incremental_error_output")?;
        let fresh = String::from_utf8_lossy(
            &self.stderr_buffer[self.incremental_error_output_offset..],
        )
        .into_owned();
        self.incremental_error_output_offset = self.stderr_buffer.len();
        Ok(fresh)
    }

    /// Reset the stdout buffer and its incremental cursor.
    pub fn clear_output(&mut self) -> &mut Self {
        self.stdout_buffer.clear();
        self.incremental_output_offset = 0;
        self
    }

    /// Reset the stderr buffer and its incremental cursor.
    pub fn clear_error_output(&mut self) -> &mut Self {
        self.stderr_buffer.clear();
        self.incremental_error_output_offset = 0;
        self
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Whether the OS still reports the child as running.
    pub fn is_running(&mut self) -> bool {
        if self.status != ProcessStatus::Started {
            return false;
        }
        self.update_status(false);
        self.process_information.running
    }

    /// Whether `start` succeeded at least once on this instance.
    pub fn is_started(&self) -> bool {
        self.status != ProcessStatus::Ready
    }

    /// Whether the child has exited and been reaped.
    pub fn is_terminated(&mut self) -> bool {
        self.update_status(false);
        self.status == ProcessStatus::Terminated
    }

    /// Current lifecycle state, refreshed against the OS.
    pub fn get_status(&mut self) -> ProcessStatus {
        self.update_status(false);
        self.status
    }

    /// The final exit code, once terminated. `-1` means the OS could not
    /// report one.
    pub fn get_exit_code(&mut self) -> Option<i32> {
        self.update_status(false);
        self.exit_code
    }

    /// Human-readable label for the exit code.
    pub fn get_exit_code_text(&mut self) -> Option<&'static str> {
        self.get_exit_code().map(exit_code_text)
    }

    /// Whether the process terminated with exit code 0.
    pub fn is_successful(&mut self) -> bool {
        self.get_exit_code() == Some(0)
    }

    /// The child's process id while it is running.
    ///
    /// Unknowable under sigchild compatibility, where the shell wrapper
    /// owns the real child.
    pub fn get_pid(&mut self) -> Option<u32> {
        if self.sigchild_enabled() {
            return None;
        }
        if self.is_running() {
            self.process_information.pid
        } else {
            None
        }
    }

    /// The last signal the caller asked to be sent.
    pub fn get_latest_signal(&self) -> Option<i32> {
        self.latest_signal
    }

    /// When `start` stamped the run, if started.
    pub fn get_start_time(&self) -> Option<Instant> {
        self.start_time
    }

    /// When the last byte of output arrived, if started.
    pub fn get_last_output_time(&self) -> Option<Instant> {
        self.last_output_time
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn start_impl(&mut self, callback: Option<OutputCallback>) -> Result<()> {
        if self.is_running() {
            return Err(ProcessError::Runtime("Process is already running.".into()));
        }
        if self.output_disabled && callback.is_some() {
            return Err(ProcessError::Logic(
                "Output has been disabled, enable it to allow the use of a callback.".into(),
            ));
        }

        self.reset_process_data();
        self.callback = callback;
        self.start_time = Some(Instant::now());
        self.last_output_time = self.start_time;

        let source = self.input.to_source().map_err(|err| {
            warn!(error = %err, "duplicating the input source failed");
            ProcessError::Runtime("Unable to launch a new process.".into())
        })?;

        #[cfg(unix)]
        let mut pipes: Box<dyn PipeBackend> = Box::new(
            UnixPipes::new(
                self.tty,
                self.pty,
                !self.output_disabled,
                source,
                self.sigchild_enabled(),
            )
            .map_err(|err| {
                warn!(error = %err, "descriptor allocation failed");
                ProcessError::Runtime("Unable to launch a new process.".into())
            })?,
        );
        #[cfg(windows)]
        let mut pipes: Box<dyn PipeBackend> = Box::new(
            WindowsPipes::new(!self.output_disabled, source).map_err(|err| {
                warn!(error = %err, "temp file allocation failed");
                ProcessError::Runtime("Unable to launch a new process.".into())
            })?,
        );

        let (mut command, _sigchild_guard) =
            self.build_command(pipes.as_mut()).map_err(|err| {
                warn!(error = %err, "command assembly failed");
                ProcessError::Runtime("Unable to launch a new process.".into())
            })?;

        debug!(command = %self.command_line, "spawning process");
        let mut child = command.spawn().map_err(|err| {
            warn!(command = %self.command_line, error = %err, "spawn failed");
            ProcessError::Runtime("Unable to launch a new process.".into())
        })?;
        pipes.attach(&mut child);

        let pid = child.id();
        info!(pid = %pid, command = %self.command_line, "process started");
        self.process_information = StatusSnapshot::started(pid);
        self.child = Some(child);
        self.pipes = Some(pipes);
        self.status = ProcessStatus::Started;

        if self.tty {
            return Ok(());
        }
        self.update_status(false);
        self.check_timeout()
    }

    #[cfg(unix)]
    fn build_command(
        &self,
        pipes: &mut dyn PipeBackend,
    ) -> std::io::Result<(Command, Option<std::os::fd::OwnedFd>)> {
        use std::os::fd::AsRawFd;
        use std::os::unix::process::CommandExt;

        let mut command_line = self.command_line.clone();
        if self.sigchild_enabled() {
            // Echo the exit code over fd 3 so it survives an unreliable reap.
            command_line =
                format!("({command_line}) 3>/dev/null; code=$?; echo $code >&3; exit $code");
        }

        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(command_line);
        self.apply_cwd_and_env(&mut command);

        let stdio = pipes.take_stdio()?;
        command
            .stdin(stdio.stdin)
            .stdout(stdio.stdout)
            .stderr(stdio.stderr);

        let guard = stdio.sigchild_fd;
        if let Some(fd) = guard.as_ref() {
            let raw = fd.as_raw_fd();
            unsafe {
                command.pre_exec(move || {
                    if libc::dup2(raw, 3) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        Ok((command, guard))
    }

    #[cfg(windows)]
    fn build_command(&self, pipes: &mut dyn PipeBackend) -> std::io::Result<(Command, ())> {
        use std::os::windows::process::CommandExt;

        use crate::escape::escape_windows;
        use crate::pipes::STDERR;

        const CREATE_NO_WINDOW: u32 = 0x0800_0000;

        let files = pipes.get_files();
        let stdio = pipes.take_stdio()?;

        let mut command_line = self.command_line.clone();
        if let (Some(out), Some(err)) = (files.get(&STDOUT), files.get(&STDERR)) {
            command_line = format!(
                "({}) 1>{} 2>{}",
                command_line,
                escape_windows(&out.to_string_lossy()),
                escape_windows(&err.to_string_lossy()),
            );
        }

        let mut command = Command::new("cmd.exe");
        if self.options.bypass_shell.unwrap_or(true) {
            command.raw_arg(format!("/V:ON /E:ON /C \"{command_line}\""));
        } else {
            command.args(["/V:ON", "/E:ON", "/C", &command_line]);
        }
        if self.options.suppress_errors {
            command.creation_flags(CREATE_NO_WINDOW);
        }
        self.apply_cwd_and_env(&mut command);
        command
            .stdin(stdio.stdin)
            .stdout(stdio.stdout)
            .stderr(stdio.stderr);
        Ok((command, ()))
    }

    fn apply_cwd_and_env(&self, command: &mut Command) {
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        if !self.inherit_env {
            command.env_clear();
        }
        command.envs(&self.env);
    }

    fn wait_impl(&mut self, callback: Option<OutputCallback>) -> Result<i32> {
        self.require_started("wait")?;
        self.update_status(false);

        if let Some(callback) = callback {
            let readable = match self.pipes.as_ref() {
                Some(pipes) => pipes.have_read_support(),
                None => !self.output_disabled,
            };
            if !readable {
                self.stop(0.0, None);
                return Err(ProcessError::Logic(
                    "Pass the callback to the \"start\" method or call \"enable_output\" \
                     to use a callback with disabled output."
                        .into(),
                ));
            }
            self.callback = Some(callback);
        }

        loop {
            self.check_timeout()?;
            let running = self.is_running()
                && (cfg!(windows) || self.pipes.as_ref().is_some_and(|pipes| pipes.are_open()));
            // A POSIX pipe at EOF is finished for good, so it closes
            // eagerly; the Windows temp files only close once the child is
            // known to be gone.
            let closing = cfg!(unix) || !running;
            self.read_pipes(running, closing);
            if !running {
                break;
            }
        }

        while self.is_running() {
            self.check_timeout()?;
            thread::sleep(Duration::from_millis(1));
        }

        let info = self.process_information;
        if info.signaled && info.termsig != self.latest_signal {
            return Err(ProcessError::Runtime(format!(
                "The process has been signaled with signal \"{}\".",
                info.termsig.unwrap_or(0)
            )));
        }
        Ok(self.exit_code.unwrap_or(-1))
    }

    fn restart_impl(&mut self, callback: Option<OutputCallback>) -> Result<Process> {
        if self.is_running() {
            return Err(ProcessError::Runtime("Process is already running.".into()));
        }
        let mut process = self.clone_ready()?;
        process.start_impl(callback)?;
        Ok(process)
    }

    /// Deep copy of the configuration with every runtime field back at its
    /// initial value.
    fn clone_ready(&self) -> Result<Process> {
        let input = self.input.duplicate().map_err(|err| {
            ProcessError::Runtime(format!("Unable to duplicate the input source: {err}."))
        })?;
        let mut process = Process::new(self.command_line.clone());
        process.cwd = self.cwd.clone();
        process.env = self.env.clone();
        process.inherit_env = self.inherit_env;
        process.input = input;
        process.timeout = self.timeout;
        process.idle_timeout = self.idle_timeout;
        process.options = self.options.clone();
        process.tty = self.tty;
        process.pty = self.pty;
        process.output_disabled = self.output_disabled;
        Ok(process)
    }

    /// Refresh the OS status snapshot, drain the pipes once, and finalize
    /// the run when the child is first seen not running.
    fn update_status(&mut self, blocking: bool) {
        if self.status != ProcessStatus::Started {
            return;
        }
        let Some(child) = self.child.as_mut() else {
            return;
        };
        let snapshot = StatusSnapshot::query(child);
        self.process_information = snapshot;

        let running = snapshot.running;
        let closing = cfg!(unix) || !running;
        self.read_pipes(blocking && running, closing);
        if !running {
            self.close_process();
        }
    }

    /// One backend I/O step, routing fresh bytes to the buffers, the
    /// sigchild channel, and the user callback.
    fn read_pipes(&mut self, blocking: bool, closing: bool) {
        let Some(pipes) = self.pipes.as_mut() else {
            return;
        };
        let result = pipes.read_and_write(blocking, closing);
        for (key, data) in result {
            if data.is_empty() {
                continue;
            }
            if key == SIGCHILD_CHANNEL {
                if let Ok(code) = String::from_utf8_lossy(&data).trim().parse::<i32>() {
                    self.fallback_exit_code = Some(code);
                }
            } else {
                self.dispatch_output(key, &data);
            }
        }
    }

    fn dispatch_output(&mut self, key: u32, data: &[u8]) {
        let stream = if key == STDOUT {
            OutputStream::Out
        } else {
            OutputStream::Err
        };
        match stream {
            OutputStream::Out => self.stdout_buffer.extend_from_slice(data),
            OutputStream::Err => self.stderr_buffer.extend_from_slice(data),
        }
        self.last_output_time = Some(Instant::now());
        if let Some(callback) = self.callback.as_mut() {
            callback(stream, data);
        }
    }

    fn do_signal(&mut self, signal: i32, throw_on_error: bool) -> Result<bool> {
        if !self.is_running() {
            if throw_on_error {
                return Err(ProcessError::Logic(
                    "Cannot send signal on a non running process.".into(),
                ));
            }
            return Ok(false);
        }
        if self.sigchild_enabled() {
            if throw_on_error {
                return Err(ProcessError::Runtime(
                    "The process cannot be signaled while sigchild compatibility is active."
                        .into(),
                ));
            }
            return Ok(false);
        }

        let pid = self.process_information.pid.unwrap_or(0);

        #[cfg(windows)]
        {
            let status = Command::new("taskkill")
                .args(["/F", "/T", "/PID", &pid.to_string()])
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status();
            match status {
                Ok(status) if status.success() => {}
                _ => {
                    if throw_on_error {
                        return Err(ProcessError::Runtime(format!(
                            "Unable to kill the process (pid {pid})."
                        )));
                    }
                    return Ok(false);
                }
            }
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let sig = match Signal::try_from(signal) {
                Ok(sig) => sig,
                Err(_) => {
                    if throw_on_error {
                        return Err(ProcessError::Runtime(format!(
                            "Error while sending signal \"{signal}\": unknown signal."
                        )));
                    }
                    return Ok(false);
                }
            };
            if let Err(err) = kill(Pid::from_raw(pid as i32), sig) {
                warn!(pid = %pid, signal = %signal, error = %err, "signal delivery failed");
                if throw_on_error {
                    return Err(ProcessError::Runtime(format!(
                        "Error while sending signal \"{signal}\": {err}."
                    )));
                }
                return Ok(false);
            }
        }

        debug!(pid = %pid, signal = %signal, "signal sent");
        self.latest_signal = Some(signal);
        Ok(true)
    }

    /// Close the pipes, reap the child, and settle the final exit code.
    fn close_process(&mut self) -> i32 {
        if let Some(mut pipes) = self.pipes.take() {
            pipes.close();
        }
        if let Some(mut child) = self.child.take() {
            let pid = child.id();
            match child.wait() {
                Ok(status) => {
                    self.process_information = StatusSnapshot::from_exit_status(pid, status);
                }
                Err(err) => {
                    debug!(pid = %pid, error = %err, "reaping child failed");
                    self.process_information.running = false;
                }
            }
        }

        let info = self.process_information;
        let code = resolve_exit_code(
            info.exit_code,
            self.exit_code,
            self.fallback_exit_code,
            info.signaled,
            info.termsig,
        );
        self.exit_code = Some(code);
        self.status = ProcessStatus::Terminated;
        self.callback = None;
        debug!(exit_code = code, "process terminated");
        code
    }

    fn reset_process_data(&mut self) {
        self.start_time = None;
        self.last_output_time = None;
        self.exit_code = None;
        self.fallback_exit_code = None;
        self.process_information = StatusSnapshot::default();
        self.stdout_buffer.clear();
        self.stderr_buffer.clear();
        self.incremental_output_offset = 0;
        self.incremental_error_output_offset = 0;
        self.latest_signal = None;
        self.status = ProcessStatus::Ready;
        self.child = None;
        self.pipes = None;
        self.callback = None;
    }

    fn read_pipes_for_output(&mut self, caller: &str) -> Result<()> {
        if self.output_disabled {
            return Err(ProcessError::Logic(format!(
                "Output has been disabled, it cannot be read from \"{caller}\"."
            )));
        }
        self.require_started(caller)?;
        self.update_status(false);
        Ok(())
    }

    fn require_started(&self, caller: &str) -> Result<()> {
        if self.status == ProcessStatus::Ready {
            return Err(ProcessError::Logic(format!(
                "Process must be started before calling \"{caller}\"."
            )));
        }
        Ok(())
    }

    fn ensure_not_running(&mut self, caller: &str) -> Result<()> {
        if self.is_running() {
            return Err(ProcessError::Logic(format!(
                "Configuration cannot be changed while the process is running (\"{caller}\")."
            )));
        }
        Ok(())
    }

    fn check_successful(&mut self, code: i32) -> Result<i32> {
        if code == 0 {
            return Ok(code);
        }
        let (output, error_output) = if self.output_disabled {
            (String::new(), String::new())
        } else {
            (
                String::from_utf8_lossy(&self.stdout_buffer).into_owned(),
                String::from_utf8_lossy(&self.stderr_buffer).into_owned(),
            )
        };
        Err(ProcessError::Failed {
            command: self.command_line.clone(),
            exit_code: code,
            exit_code_text: exit_code_text(code),
            working_directory: self
                .cwd
                .clone()
                .or_else(|| std::env::current_dir().ok())
                .map(|dir| dir.display().to_string())
                .unwrap_or_default(),
            output,
            error_output,
        })
    }

    fn sigchild_enabled(&self) -> bool {
        cfg!(unix) && self.options.sigchild_compat.unwrap_or_else(is_sigchild_enabled)
    }
}

impl Drop for Process {
    /// Stops the child if it is still running.
    fn drop(&mut self) {
        if self.status == ProcessStatus::Started {
            self.stop(0.0, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(ProcessStatus::Ready.as_str(), "ready");
        assert_eq!(ProcessStatus::Started.as_str(), "started");
        assert_eq!(ProcessStatus::Terminated.as_str(), "terminated");
    }

    #[test]
    fn test_stream_strings() {
        assert_eq!(OutputStream::Out.as_str(), "out");
        assert_eq!(OutputStream::Err.as_str(), "err");
    }

    #[test]
    fn test_new_process_is_ready() {
        let process = Process::new("echo hello");
        assert_eq!(process.get_command_line(), "echo hello");
        assert!(!process.is_started());
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let mut process = Process::new("sleep 1");
        assert!(matches!(
            process.set_timeout(-1.0),
            Err(ProcessError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_idle_timeout_conflicts_with_disabled_output() {
        let mut process = Process::new("sleep 1");
        process.disable_output().unwrap();
        assert!(matches!(
            process.set_idle_timeout(1.0),
            Err(ProcessError::Logic(_))
        ));

        let mut process = Process::new("sleep 1");
        process.set_idle_timeout(1.0).unwrap();
        assert!(matches!(
            process.disable_output(),
            Err(ProcessError::Logic(_))
        ));
    }

    #[test]
    fn test_output_queries_require_start() {
        let mut process = Process::new("echo hello");
        assert!(matches!(
            process.get_output(),
            Err(ProcessError::Logic(_))
        ));
    }

    #[test]
    fn test_output_queries_fail_when_disabled() {
        let mut process = Process::new("echo hello");
        process.disable_output().unwrap();
        assert!(matches!(
            process.get_output(),
            Err(ProcessError::Logic(_))
        ));
    }

    #[test]
    fn test_wait_requires_start() {
        let mut process = Process::new("echo hello");
        assert!(matches!(process.wait(), Err(ProcessError::Logic(_))));
    }

    #[test]
    fn test_callback_with_disabled_output_rejected() {
        let mut process = Process::new("echo hello");
        process.disable_output().unwrap();
        assert!(matches!(
            process.start_with(|_, _| {}),
            Err(ProcessError::Logic(_))
        ));
    }

    #[test]
    fn test_signal_on_non_running_process() {
        let mut process = Process::new("echo hello");
        assert!(matches!(process.signal(15), Err(ProcessError::Logic(_))));
    }
}
