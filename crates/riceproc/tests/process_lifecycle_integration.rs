//! End-to-end lifecycle scenarios against real child processes
#![cfg(unix)]

use std::cell::RefCell;
use std::rc::Rc;

use riceproc::{OutputStream, Process, ProcessError, ProcessStatus};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn test_echo_captures_stdout() {
    init_tracing();
    let mut process = Process::new("echo hello");

    let code = process.run().unwrap();

    assert_eq!(code, 0);
    assert!(process.is_successful());
    assert_eq!(process.get_status(), ProcessStatus::Terminated);
    assert_eq!(process.get_output().unwrap(), "hello\n");
    assert_eq!(process.get_error_output().unwrap(), "");
}

#[test]
fn test_stderr_and_failure_exit() {
    init_tracing();
    let mut process = Process::new("echo oops >&2; exit 1");

    let code = process.run().unwrap();

    assert_eq!(code, 1);
    assert!(!process.is_successful());
    assert_eq!(process.get_exit_code(), Some(1));
    assert!(process.get_error_output().unwrap().contains("oops"));
    assert_eq!(process.get_output().unwrap(), "");
}

#[test]
fn test_input_is_fed_to_stdin() {
    init_tracing();
    let mut process = Process::new("cat");
    process.set_input("ping").unwrap();

    let code = process.run().unwrap();

    assert_eq!(code, 0);
    assert_eq!(process.get_output().unwrap(), "ping");
}

#[test]
fn test_large_output_does_not_deadlock() {
    init_tracing();
    let mut process = Process::new("head -c 2097152 /dev/zero");

    let code = process.run().unwrap();

    assert_eq!(code, 0);
    assert_eq!(process.get_output().unwrap().len(), 2 * 1024 * 1024);
}

#[test]
fn test_callback_sees_every_stdout_chunk() {
    init_tracing();
    let chunks: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&chunks);

    let mut process = Process::new("printf 'a\\nb\\nc\\n'");
    process
        .run_with(move |stream, data| {
            if stream == OutputStream::Out {
                sink.borrow_mut().extend_from_slice(data);
            }
        })
        .unwrap();

    let collected = chunks.borrow().clone();
    assert_eq!(
        String::from_utf8(collected).unwrap(),
        process.get_output().unwrap()
    );
}

#[test]
fn test_incremental_output_concatenates_to_full_output() {
    init_tracing();
    let mut process = Process::new("echo one; sleep 0.2; echo two");
    process.start().unwrap();

    let mut collected = String::new();
    while process.is_running() {
        collected.push_str(&process.get_incremental_output().unwrap());
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    collected.push_str(&process.get_incremental_output().unwrap());

    assert_eq!(collected, process.get_output().unwrap());
    assert_eq!(collected, "one\ntwo\n");
    // The cursor is exhausted now.
    assert_eq!(process.get_incremental_output().unwrap(), "");
}

#[test]
fn test_clear_output_resets_buffer_and_cursor() {
    init_tracing();
    let mut process = Process::new("echo hello");
    process.run().unwrap();

    assert_eq!(process.get_output().unwrap(), "hello\n");
    process.clear_output();
    assert_eq!(process.get_output().unwrap(), "");
    assert_eq!(process.get_incremental_output().unwrap(), "");
}

#[test]
fn test_start_while_running_is_rejected() {
    init_tracing();
    let mut process = Process::new("sleep 2");
    process.start().unwrap();

    match process.start() {
        Err(ProcessError::Runtime(message)) => {
            assert!(message.contains("already running"), "{message}");
        }
        other => panic!("expected Runtime error, got {other:?}"),
    }

    process.stop(0.5, None);
}

#[test]
fn test_signal_sent_by_caller_does_not_raise() {
    init_tracing();
    let mut process = Process::new("sleep 10");
    process.start().unwrap();

    process.signal(15).unwrap();
    let code = process.wait().unwrap();

    // SIGTERM death resolves through the 128 + termsig convention and is
    // not an error because the caller asked for that signal.
    assert_eq!(code, 143);
    assert_eq!(process.get_latest_signal(), Some(15));
}

#[test]
fn test_unexpected_signal_death_raises() {
    init_tracing();
    let mut process = Process::new("sleep 10");
    process.start().unwrap();
    let pid = process.get_pid().expect("running process has a pid");

    // Kill from outside the engine so no latest_signal is recorded.
    unsafe {
        assert_eq!(libc::kill(pid as i32, libc::SIGTERM), 0);
    }

    match process.wait() {
        Err(ProcessError::Runtime(message)) => {
            assert!(message.contains("signal"), "{message}");
            assert!(message.contains("15"), "{message}");
        }
        other => panic!("expected Runtime error, got {other:?}"),
    }
    assert_eq!(process.get_exit_code(), Some(143));
}

#[test]
fn test_must_run_failure_carries_diagnostics() {
    init_tracing();
    let mut process = Process::new("echo broken >&2; exit 3");

    match process.must_run() {
        Err(ProcessError::Failed {
            exit_code,
            exit_code_text,
            error_output,
            command,
            ..
        }) => {
            assert_eq!(exit_code, 3);
            assert_eq!(exit_code_text, "Unknown error");
            assert!(error_output.contains("broken"));
            assert!(command.contains("exit 3"));
        }
        other => panic!("expected Failed error, got {other:?}"),
    }
    assert_eq!(process.get_exit_code(), Some(3));
}

#[test]
fn test_must_run_success_passes_through() {
    init_tracing();
    let mut process = Process::new("true");
    assert_eq!(process.must_run().unwrap(), 0);
}

#[test]
fn test_restart_leaves_original_untouched() {
    init_tracing();
    let mut process = Process::new("echo first");
    process.run().unwrap();
    let original_output = process.get_output().unwrap();
    let original_code = process.get_exit_code();

    let mut clone = process.restart().unwrap();
    let code = clone.wait().unwrap();

    assert_eq!(code, 0);
    assert_eq!(clone.get_output().unwrap(), "first\n");
    assert_eq!(process.get_output().unwrap(), original_output);
    assert_eq!(process.get_exit_code(), original_code);
    assert_eq!(process.get_status(), ProcessStatus::Terminated);
}

#[test]
fn test_stop_terminates_a_stubborn_child() {
    init_tracing();
    let mut process = Process::new("sleep 30");
    process.start().unwrap();
    assert!(process.is_running());

    let code = process.stop(0.5, None);

    assert!(!process.is_running());
    assert_eq!(process.get_status(), ProcessStatus::Terminated);
    assert!(code.is_some());
}

#[test]
fn test_working_directory_applies() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut process = Process::new("pwd");
    process.set_working_directory(dir.path()).unwrap();

    process.run().unwrap();

    let output = process.get_output().unwrap();
    let reported = std::fs::canonicalize(output.trim()).unwrap();
    assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
}

#[test]
fn test_env_entries_reach_the_child() {
    init_tracing();
    let mut env = std::collections::HashMap::new();
    env.insert("RICEPROC_MARKER".to_string(), "42".to_string());

    let mut process = Process::new("echo $RICEPROC_MARKER");
    process.set_env(env).unwrap();
    process.run().unwrap();

    assert_eq!(process.get_output().unwrap(), "42\n");
}

#[test]
fn test_non_inherited_env_is_isolated() {
    init_tracing();
    let mut env = std::collections::HashMap::new();
    env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());

    let mut process = Process::new("echo ${HOME:-unset}");
    process.set_inherit_env(false).unwrap();
    process.set_env(env).unwrap();
    process.run().unwrap();

    assert_eq!(process.get_output().unwrap(), "unset\n");
}

#[test]
fn test_disabled_output_still_runs() {
    init_tracing();
    let mut process = Process::new("echo ignored");
    process.disable_output().unwrap();

    let code = process.run().unwrap();

    assert_eq!(code, 0);
    assert!(matches!(process.get_output(), Err(ProcessError::Logic(_))));
}

#[test]
fn test_sigchild_compat_recovers_exit_code() {
    init_tracing();
    let mut process = Process::new("exit 7");
    let mut options = riceproc::ProcessOptions::default();
    options.sigchild_compat = Some(true);
    process.set_options(options).unwrap();

    let code = process.run().unwrap();

    assert_eq!(code, 7);
    // The pid is unknowable behind the sigchild wrapper.
    assert_eq!(process.get_pid(), None);
}
