//! Error types for process execution

use thiserror::Error;

/// Which of the two timeout clocks expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Wall-clock limit measured from `start`.
    General,
    /// Elapsed time since the last byte of output on either stream.
    Idle,
}

/// Errors that can occur while configuring, running, or stopping a process
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Bad input to a setter (negative timeout, unusable input source)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Caller misuse: an operation was invoked in the wrong state
    #[error("{0}")]
    Logic(String),

    /// External or operational failure (spawn, signal delivery, platform limits)
    #[error("{0}")]
    Runtime(String),

    /// A wall-clock or idle timeout elapsed and the child was stopped
    #[error("The process \"{command}\" exceeded the timeout of {seconds} seconds.")]
    TimedOut {
        /// Command line of the process that was stopped
        command: String,
        /// Which clock expired
        kind: TimeoutKind,
        /// The configured limit, in seconds
        seconds: f64,
    },

    /// `must_run` observed a non-zero exit code
    #[error(
        "The command \"{command}\" failed.\n\nExit code: {exit_code}({exit_code_text})\n\n\
         Working directory: {working_directory}\n\nOutput:\n================\n{output}\n\n\
         Error output:\n================\n{error_output}"
    )]
    Failed {
        /// Command line of the failed process
        command: String,
        /// Final exit code
        exit_code: i32,
        /// Human-readable label for the exit code
        exit_code_text: &'static str,
        /// Working directory the process ran in
        working_directory: String,
        /// Captured standard output (empty when output was disabled)
        output: String,
        /// Captured standard error (empty when output was disabled)
        error_output: String,
    },
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;
