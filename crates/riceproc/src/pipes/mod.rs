//! Pipe backends - platform-specific ownership of the child's standard streams
//!
//! A backend owns the parent-side handles for the child's stdin, stdout, and
//! stderr, and moves bytes between them and the engine one non-blocking step
//! at a time.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Child, Stdio};

#[cfg(unix)]
pub(crate) mod unix;
#[cfg(windows)]
pub(crate) mod windows;

/// Descriptor index of the child's standard input.
pub const STDIN: u32 = 0;
/// Descriptor index of the child's standard output.
pub const STDOUT: u32 = 1;
/// Descriptor index of the child's standard error.
pub const STDERR: u32 = 2;

/// Stream key used for the sigchild exit-code fallback channel.
pub(crate) const SIGCHILD_CHANNEL: u32 = 3;

/// Bytes read from a ready handle per `read` call.
pub(crate) const CHUNK_SIZE: usize = 16 * 1024;

/// Upper bound on bytes handed to a single `write` call.
pub(crate) const WRITE_BURST: usize = 512 * 1024;

/// How the child's three standard descriptors get wired at spawn time.
pub(crate) struct SpawnStdio {
    pub stdin: Stdio,
    pub stdout: Stdio,
    pub stderr: Stdio,
    /// Write end of the sigchild fallback channel, installed as child fd 3.
    #[cfg(unix)]
    pub sigchild_fd: Option<std::os::fd::OwnedFd>,
}

/// Common contract over the POSIX and Windows pipe implementations.
///
/// While a process is started, exactly one backend instance is live and owns
/// every parent-side handle to the child's standard streams.
pub(crate) trait PipeBackend {
    /// Hand over the child-side descriptor wiring for the spawn call.
    fn take_stdio(&mut self) -> std::io::Result<SpawnStdio>;

    /// Extra files the child must be made aware of through the command line
    /// (`N>file` redirections). Only the Windows backend reports any.
    fn get_files(&self) -> BTreeMap<u32, PathBuf>;

    /// Post-spawn hook for backends that capture handles from the child.
    fn attach(&mut self, child: &mut Child);

    /// Perform one step of interleaved I/O.
    ///
    /// Returns any bytes read, keyed by stream id (1 = stdout, 2 = stderr,
    /// 3 = sigchild fallback channel). An interrupted system call yields an
    /// empty result with all state preserved; any other readiness failure
    /// marks the pipes as lost.
    fn read_and_write(&mut self, blocking: bool, closing: bool) -> BTreeMap<u32, Vec<u8>>;

    /// True while any parent-side handle to the child remains open.
    fn are_open(&self) -> bool;

    /// Whether this backend can deliver output back to the engine.
    fn have_read_support(&self) -> bool;

    /// Release every handle.
    fn close(&mut self);
}
