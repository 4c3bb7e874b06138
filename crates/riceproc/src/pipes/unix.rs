//! POSIX pipe backend
//!
//! Owns the parent-side descriptors for the child's standard streams and
//! performs interleaved non-blocking I/O over them with `poll(2)`.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::{Child, Stdio};
use std::sync::OnceLock;

use nix::fcntl::OFlag;
use nix::pty::openpty;
use nix::unistd::pipe2;
use tracing::warn;

use super::{PipeBackend, SpawnStdio, CHUNK_SIZE, SIGCHILD_CHANNEL, STDERR, STDOUT, WRITE_BURST};
use crate::input::InputSource;

/// Readiness timeout for a blocking step, in milliseconds.
const POLL_TIMEOUT_MS: i32 = 200;

/// True when the current process can allocate a pseudo-terminal.
///
/// Probed once and cached for the process lifetime.
pub(crate) fn is_pty_supported() -> bool {
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(|| openpty(None, None).is_ok())
}

/// True when `/dev/tty` is readable from the current process.
pub(crate) fn is_tty_supported() -> bool {
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(|| OpenOptions::new().read(true).open("/dev/tty").is_ok())
}

/// The POSIX backend: anonymous pipes, `/dev/tty`, or a pty pair.
pub(crate) struct UnixPipes {
    /// Parent write end of the child's stdin (pty master in PTY mode).
    stdin: Option<OwnedFd>,
    /// Parent read end of the child's stdout (pty master in PTY mode).
    stdout: Option<OwnedFd>,
    /// Parent read end of the child's stderr.
    stderr: Option<OwnedFd>,
    /// Read end of the sigchild exit-code channel (child fd 3).
    sigchild: Option<OwnedFd>,
    /// Child-side wiring, handed to the spawn call once.
    stdio: Option<SpawnStdio>,
    input: InputSource,
    unblocked: bool,
    read_support: bool,
}

impl UnixPipes {
    /// Allocate descriptors per the mode priority: disabled output, TTY,
    /// PTY (when supported), plain pipes.
    pub(crate) fn new(
        tty: bool,
        pty: bool,
        read_support: bool,
        input: InputSource,
        sigchild: bool,
    ) -> io::Result<Self> {
        let mut pipes = if !read_support {
            let (stdin_read, stdin_write) = pipe_pair()?;
            let null_out = OpenOptions::new().write(true).open("/dev/null")?;
            let null_err = OpenOptions::new().write(true).open("/dev/null")?;
            UnixPipes {
                stdin: Some(stdin_write),
                stdout: None,
                stderr: None,
                sigchild: None,
                stdio: Some(SpawnStdio {
                    stdin: Stdio::from(stdin_read),
                    stdout: Stdio::from(null_out),
                    stderr: Stdio::from(null_err),
                    sigchild_fd: None,
                }),
                input,
                unblocked: false,
                read_support,
            }
        } else if tty {
            let tty_in = OpenOptions::new().read(true).open("/dev/tty")?;
            let tty_out = OpenOptions::new().write(true).open("/dev/tty")?;
            let tty_err = OpenOptions::new().write(true).open("/dev/tty")?;
            UnixPipes {
                stdin: None,
                stdout: None,
                stderr: None,
                sigchild: None,
                stdio: Some(SpawnStdio {
                    stdin: Stdio::from(tty_in),
                    stdout: Stdio::from(tty_out),
                    stderr: Stdio::from(tty_err),
                    sigchild_fd: None,
                }),
                input,
                unblocked: false,
                read_support,
            }
        } else if pty && is_pty_supported() {
            let pair = openpty(None, None).map_err(io::Error::from)?;
            let slave_out = pair.slave.try_clone()?;
            let slave_err = pair.slave.try_clone()?;
            let master_write = pair.master.try_clone()?;
            UnixPipes {
                stdin: Some(master_write),
                stdout: Some(pair.master),
                stderr: None,
                sigchild: None,
                stdio: Some(SpawnStdio {
                    stdin: Stdio::from(pair.slave),
                    stdout: Stdio::from(slave_out),
                    stderr: Stdio::from(slave_err),
                    sigchild_fd: None,
                }),
                input,
                unblocked: false,
                read_support,
            }
        } else {
            let (stdin_read, stdin_write) = pipe_pair()?;
            let (stdout_read, stdout_write) = pipe_pair()?;
            let (stderr_read, stderr_write) = pipe_pair()?;
            UnixPipes {
                stdin: Some(stdin_write),
                stdout: Some(stdout_read),
                stderr: Some(stderr_read),
                sigchild: None,
                stdio: Some(SpawnStdio {
                    stdin: Stdio::from(stdin_read),
                    stdout: Stdio::from(stdout_write),
                    stderr: Stdio::from(stderr_write),
                    sigchild_fd: None,
                }),
                input,
                unblocked: false,
                read_support,
            }
        };

        if sigchild {
            let (code_read, code_write) = pipe_pair()?;
            pipes.sigchild = Some(code_read);
            if let Some(stdio) = pipes.stdio.as_mut() {
                stdio.sigchild_fd = Some(code_write);
            }
        }

        Ok(pipes)
    }

    /// Flip every handle to non-blocking mode. Applied once, on first use.
    fn unblock(&mut self) {
        if self.unblocked {
            return;
        }
        for fd in [
            self.stdin.as_ref(),
            self.stdout.as_ref(),
            self.stderr.as_ref(),
            self.sigchild.as_ref(),
        ]
        .into_iter()
        .flatten()
        {
            set_nonblocking(fd.as_raw_fd());
        }
        if let Some(stream) = &self.input.stream {
            set_nonblocking(stream.as_raw_fd());
        }
        self.unblocked = true;
    }

    /// Pull one chunk from the caller's input stream into the buffer.
    fn refill_input(&mut self) {
        let Some(stream) = self.input.stream.as_ref() else {
            return;
        };
        let mut buf = [0u8; CHUNK_SIZE];
        match read_fd(stream.as_raw_fd(), &mut buf) {
            Ok(0) => self.input.stream = None,
            Ok(n) => self.input.buffer.extend_from_slice(&buf[..n]),
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => self.input.stream = None,
        }
    }

    /// Push buffered input into the child's stdin until the buffer empties
    /// or the write would block.
    fn write_stdin(&mut self) {
        let Some(fd) = self.stdin.as_ref() else {
            return;
        };
        let raw = fd.as_raw_fd();
        let mut lost = false;
        while !self.input.buffer.is_empty() {
            let len = self.input.buffer.len().min(WRITE_BURST);
            match write_fd(raw, &self.input.buffer[..len]) {
                Ok(0) => break,
                Ok(n) => {
                    self.input.buffer.drain(..n);
                }
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::Interrupted =>
                {
                    break;
                }
                Err(_) => {
                    lost = true;
                    break;
                }
            }
        }
        if lost {
            self.stdin = None;
        }
    }
}

impl PipeBackend for UnixPipes {
    fn take_stdio(&mut self) -> io::Result<SpawnStdio> {
        self.stdio
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "descriptors already taken"))
    }

    fn get_files(&self) -> BTreeMap<u32, PathBuf> {
        BTreeMap::new()
    }

    fn attach(&mut self, _child: &mut Child) {}

    fn read_and_write(&mut self, blocking: bool, closing: bool) -> BTreeMap<u32, Vec<u8>> {
        let mut result = BTreeMap::new();
        self.unblock();

        // With nothing left to read and the input exhausted, stdin is the
        // only handle; close it so the child sees EOF instead of hanging.
        if self.stdout.is_none()
            && self.stderr.is_none()
            && self.sigchild.is_none()
            && self.input.is_drained()
        {
            self.stdin = None;
        }

        #[derive(Clone, Copy)]
        enum Slot {
            Stdout,
            Stderr,
            Sigchild,
            Input,
            Stdin,
        }

        let mut slots: Vec<Slot> = Vec::with_capacity(5);
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(5);
        let mut register = |slot: Slot, fd: RawFd, events: libc::c_short| {
            slots.push(slot);
            fds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
        };

        if let Some(fd) = &self.stdout {
            register(Slot::Stdout, fd.as_raw_fd(), libc::POLLIN);
        }
        if let Some(fd) = &self.stderr {
            register(Slot::Stderr, fd.as_raw_fd(), libc::POLLIN);
        }
        if let Some(fd) = &self.sigchild {
            register(Slot::Sigchild, fd.as_raw_fd(), libc::POLLIN);
        }
        if let Some(stream) = &self.input.stream {
            register(Slot::Input, stream.as_raw_fd(), libc::POLLIN);
        }
        if self.stdin.is_some() && !self.input.buffer.is_empty() {
            register(Slot::Stdin, self.stdin.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1), libc::POLLOUT);
        }

        if fds.is_empty() {
            return result;
        }

        let timeout = if blocking { POLL_TIMEOUT_MS } else { 0 };
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                // No-op step; state is preserved and the caller retries.
                return result;
            }
            warn!(error = %err, "poll failed, abandoning pipes");
            self.close();
            return result;
        }

        if rc > 0 {
            let error_mask = libc::POLLERR | libc::POLLNVAL;
            for (slot, pfd) in slots.iter().zip(fds.iter()) {
                if pfd.revents == 0 {
                    continue;
                }
                match slot {
                    Slot::Stdout => {
                        drain_fd(&mut self.stdout, STDOUT, closing, &mut result);
                    }
                    Slot::Stderr => {
                        drain_fd(&mut self.stderr, STDERR, closing, &mut result);
                    }
                    Slot::Sigchild => {
                        drain_fd(&mut self.sigchild, SIGCHILD_CHANNEL, closing, &mut result);
                    }
                    Slot::Input => self.refill_input(),
                    Slot::Stdin => {
                        if pfd.revents & error_mask != 0 {
                            self.stdin = None;
                        } else {
                            self.write_stdin();
                        }
                    }
                }
            }
        }

        // Source spent and buffer flushed: close stdin to signal EOF.
        if self.input.is_drained() {
            self.stdin = None;
        }

        result
    }

    fn are_open(&self) -> bool {
        self.stdin.is_some()
            || self.stdout.is_some()
            || self.stderr.is_some()
            || self.sigchild.is_some()
    }

    fn have_read_support(&self) -> bool {
        self.read_support
    }

    fn close(&mut self) {
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
        self.sigchild = None;
        self.stdio = None;
    }
}

fn pipe_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)
}

/// Drain a ready read handle in 16 KiB chunks until the kernel buffer is
/// empty. EOF closes the handle when `closing` is set; a hard read error
/// always closes it.
fn drain_fd(
    fd_slot: &mut Option<OwnedFd>,
    key: u32,
    closing: bool,
    result: &mut BTreeMap<u32, Vec<u8>>,
) {
    let Some(fd) = fd_slot.as_ref() else {
        return;
    };
    let raw = fd.as_raw_fd();
    let mut close_now = false;
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        match read_fd(raw, &mut buf) {
            Ok(0) => {
                if closing {
                    close_now = true;
                }
                break;
            }
            Ok(n) => result
                .entry(key)
                .or_insert_with(Vec::new)
                .extend_from_slice(&buf[..n]),
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                break;
            }
            Err(_) => {
                // A pty master raises EIO once the slave side is gone;
                // either way this handle is finished.
                close_now = true;
                break;
            }
        }
    }
    if close_now {
        *fd_slot = None;
    }
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_pipes_lifecycle() {
        let mut pipes =
            UnixPipes::new(false, false, true, InputSource::default(), false).unwrap();
        assert!(pipes.are_open());
        assert!(pipes.have_read_support());
        let stdio = pipes.take_stdio().unwrap();
        assert!(stdio.sigchild_fd.is_none());
        pipes.close();
        assert!(!pipes.are_open());
    }

    #[test]
    fn test_sigchild_channel_allocated() {
        let mut pipes =
            UnixPipes::new(false, false, true, InputSource::default(), true).unwrap();
        let stdio = pipes.take_stdio().unwrap();
        assert!(stdio.sigchild_fd.is_some());
        assert!(pipes.sigchild.is_some());
    }

    #[test]
    fn test_stdio_taken_once() {
        let mut pipes =
            UnixPipes::new(false, false, true, InputSource::default(), false).unwrap();
        assert!(pipes.take_stdio().is_ok());
        assert!(pipes.take_stdio().is_err());
    }

    #[test]
    fn test_disabled_output_keeps_only_stdin() {
        let mut pipes =
            UnixPipes::new(false, false, false, InputSource::default(), false).unwrap();
        assert!(pipes.stdout.is_none());
        assert!(pipes.stderr.is_none());
        assert!(pipes.stdin.is_some());
        assert!(!pipes.have_read_support());

        // One non-blocking step with no input closes stdin entirely.
        let _ = pipes.take_stdio().unwrap();
        let out = pipes.read_and_write(false, false);
        assert!(out.is_empty());
        assert!(!pipes.are_open());
    }

    #[test]
    fn test_pty_probe_is_stable() {
        assert_eq!(is_pty_supported(), is_pty_supported());
    }
}
