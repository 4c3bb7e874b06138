//! Exit status snapshots and exit-code resolution

use std::process::{Child, ExitStatus};

/// Last snapshot of OS-reported status for a child process.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusSnapshot {
    /// Whether the OS still reports the process as running.
    pub running: bool,
    /// Process id, once known.
    pub pid: Option<u32>,
    /// Raw exit code as reported by the OS, absent while running or when
    /// the process died from a signal.
    pub exit_code: Option<i32>,
    /// True when the process was terminated by a signal.
    pub signaled: bool,
    /// The terminating signal, when `signaled`.
    pub termsig: Option<i32>,
    /// Job-control stop state. `try_wait` cannot observe stops, so this
    /// stays false; the field is kept for parity with the OS status record.
    pub stopped: bool,
    /// The stop signal, when `stopped`.
    pub stopsig: Option<i32>,
}

impl StatusSnapshot {
    /// Snapshot for a process that was just spawned.
    pub(crate) fn started(pid: u32) -> Self {
        StatusSnapshot {
            running: true,
            pid: Some(pid),
            ..Default::default()
        }
    }

    /// Poll the OS for the child's current state without blocking.
    pub(crate) fn query(child: &mut Child) -> Self {
        let pid = child.id();
        match child.try_wait() {
            Ok(Some(status)) => Self::from_exit_status(pid, status),
            Ok(None) => Self::started(pid),
            Err(_) => StatusSnapshot {
                running: false,
                pid: Some(pid),
                ..Default::default()
            },
        }
    }

    /// Snapshot derived from a reaped exit status.
    pub(crate) fn from_exit_status(pid: u32, status: ExitStatus) -> Self {
        #[cfg(unix)]
        let termsig = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let termsig = None;

        StatusSnapshot {
            running: false,
            pid: Some(pid),
            exit_code: status.code(),
            signaled: termsig.is_some(),
            termsig,
            stopped: false,
            stopsig: None,
        }
    }
}

/// Compute the final exit code from everything the engine observed.
///
/// Precedence: a usable reaped code wins; otherwise any code recorded
/// earlier in the run; otherwise the sigchild fallback channel; otherwise
/// the Unix `128 + termsig` convention for signal deaths; otherwise `-1`.
pub(crate) fn resolve_exit_code(
    reaped: Option<i32>,
    last_known: Option<i32>,
    fallback: Option<i32>,
    signaled: bool,
    termsig: Option<i32>,
) -> i32 {
    let mut code = match reaped {
        Some(code) if code != -1 => code,
        _ => last_known.unwrap_or(-1),
    };
    if code == -1 {
        if let Some(fallback) = fallback {
            code = fallback;
        }
    }
    if code == -1 && signaled {
        if let Some(sig) = termsig {
            code = 128 + sig;
        }
    }
    code
}

/// Human-readable label for a process exit code.
///
/// Covers the POSIX convention (0–2, 126–143, 255). Codes 64–113 are
/// reserved for user-defined meanings and, like every other unlisted code,
/// map to `"Unknown error"`.
pub fn exit_code_text(code: i32) -> &'static str {
    match code {
        0 => "OK",
        1 => "General error",
        2 => "Misuse of shell builtins",
        126 => "Invoked command cannot execute",
        127 => "Command not found",
        128 => "Invalid exit argument",
        129 => "Hangup",
        130 => "Interrupt",
        131 => "Quit and dump core",
        132 => "Illegal instruction",
        133 => "Trace/breakpoint trap",
        134 => "Process aborted",
        135 => "Bus error: \"access to undefined portion of memory object\"",
        136 => "Floating point exception: \"erroneous arithmetic operation\"",
        137 => "Kill (terminate immediately)",
        138 => "User-defined signal 1",
        139 => "Segmentation violation",
        140 => "User-defined signal 2",
        141 => "Write to pipe with no one reading",
        142 => "Signal raised by alarm",
        143 => "Termination (request to terminate)",
        255 => "Exit status out of range",
        _ => "Unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reaped_code_wins() {
        assert_eq!(resolve_exit_code(Some(7), Some(3), Some(5), false, None), 7);
    }

    #[test]
    fn test_unusable_reaped_falls_back_to_last_known() {
        assert_eq!(resolve_exit_code(Some(-1), Some(3), None, false, None), 3);
        assert_eq!(resolve_exit_code(None, Some(3), None, false, None), 3);
    }

    #[test]
    fn test_fallback_channel() {
        assert_eq!(resolve_exit_code(None, None, Some(42), false, None), 42);
    }

    #[test]
    fn test_signal_convention() {
        assert_eq!(resolve_exit_code(None, None, None, true, Some(15)), 143);
        assert_eq!(resolve_exit_code(None, None, None, true, Some(9)), 137);
    }

    #[test]
    fn test_nothing_known() {
        assert_eq!(resolve_exit_code(None, None, None, false, None), -1);
        // Signaled but the signal itself was lost.
        assert_eq!(resolve_exit_code(None, None, None, true, None), -1);
    }

    #[test]
    fn test_exit_code_text_table() {
        assert_eq!(exit_code_text(0), "OK");
        assert_eq!(exit_code_text(1), "General error");
        assert_eq!(exit_code_text(127), "Command not found");
        assert_eq!(exit_code_text(143), "Termination (request to terminate)");
        assert_eq!(exit_code_text(64), "Unknown error");
        assert_eq!(exit_code_text(-1), "Unknown error");
        assert_eq!(exit_code_text(200), "Unknown error");
    }
}
