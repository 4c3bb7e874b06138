#![warn(missing_docs)]

//! # riceproc
//!
//! **Purpose**: Cross-platform subprocess execution
//!
//! Launches external programs, feeds them input, concurrently drains their
//! standard output and standard error, enforces runtime and idle timeouts,
//! propagates signals, captures exit status, and reports rich termination
//! information back to the caller.
//!
//! ## Features
//!
//! - **Non-blocking pipe I/O**: interleaved reads and writes over the
//!   child's standard streams with a `poll(2)` readiness loop
//! - **Two timeout clocks**: a wall-clock limit and an idle limit measured
//!   from the last byte of output
//! - **Streaming output**: buffers, incremental cursors, and a synchronous
//!   per-chunk callback
//! - **Signal handling**: signal delivery with SIGTERM→SIGKILL escalation
//!   on stop
//! - **Interactive modes**: TTY and PTY wiring on POSIX
//! - **Windows pipe-hang avoidance**: stdout/stderr transparently routed
//!   through temp files and streamed back incrementally
//!
//! ## Usage
//!
//! ```no_run
//! use riceproc::Process;
//!
//! # fn main() -> riceproc::Result<()> {
//! let mut process = Process::new("echo hello");
//! process.set_timeout(60.0)?;
//! process.must_run()?;
//! assert_eq!(process.get_output()?, "hello\n");
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod escape;
pub mod exit_status;
pub mod finder;
pub mod input;
mod pipes;
pub mod process;

pub use error::{ProcessError, Result, TimeoutKind};
pub use escape::{escape, escape_posix, escape_windows};
pub use exit_status::{exit_code_text, StatusSnapshot};
pub use finder::ExecutableFinder;
pub use input::Input;
pub use pipes::{STDERR, STDIN, STDOUT};
pub use process::{
    OutputCallback, OutputStream, Process, ProcessOptions, ProcessStatus, TIMEOUT_PRECISION,
};
