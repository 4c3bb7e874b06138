//! Property-based tests for argument escaping
//!
//! The round-trip property: for any argument without a NUL byte, a child
//! invoked through the escaper sees exactly that argument.

use proptest::prelude::*;

use riceproc::{escape_posix, escape_windows};

#[cfg(unix)]
#[test]
fn prop_escaped_argument_round_trips_through_a_child() {
    use riceproc::Process;

    proptest!(ProptestConfig::with_cases(24), |(
        argument in "[ -~]{0,40}"  // printable ASCII, covers quotes and metacharacters
    )| {
        let mut process = Process::new(format!("printf '%s' {}", escape_posix(&argument)));
        let code = process.run().unwrap();
        prop_assert_eq!(code, 0);
        prop_assert_eq!(process.get_output().unwrap(), argument);
    });
}

#[cfg(unix)]
#[test]
fn prop_tricky_arguments_round_trip() {
    use riceproc::Process;

    // Deterministic corner cases that have bitten shell quoting before.
    for argument in [
        "",
        "'",
        "''",
        "it's",
        "a b  c",
        "$HOME",
        "`id`",
        "a;b|c&d",
        "newline\\n",
        "quote\"quote",
        "back\\slash",
    ] {
        let mut process = Process::new(format!("printf '%s' {}", escape_posix(argument)));
        let code = process.run().unwrap();
        assert_eq!(code, 0, "argument {argument:?}");
        assert_eq!(process.get_output().unwrap(), argument, "argument {argument:?}");
    }
}

#[test]
fn prop_posix_escape_always_single_quote_wrapped() {
    proptest!(ProptestConfig::with_cases(100), |(argument in ".*")| {
        let escaped = escape_posix(&argument);
        prop_assert!(escaped.starts_with('\''));
        prop_assert!(escaped.ends_with('\''));
        // Stripping the escape frame back out recovers the argument.
        let inner = &escaped[1..escaped.len() - 1];
        prop_assert_eq!(inner.replace("'\\''", "'"), argument);
    });
}

#[test]
fn prop_windows_escape_neutralizes_percent_pairs() {
    proptest!(ProptestConfig::with_cases(100), |(name in "[A-Za-z_]{1,12}")| {
        let wrapped = format!("%{}%", name);
        let escaped = escape_windows(&wrapped);
        // Environment expansion is suppressed with the caret form.
        prop_assert!(escaped.contains("^%"));
        prop_assert!(!escaped.contains(&wrapped));
    });
}

#[test]
fn prop_windows_escape_doubles_trailing_backslashes() {
    proptest!(ProptestConfig::with_cases(100), |(stem in "[a-z]{1,10}")| {
        let escaped = escape_windows(&format!("{stem}\\"));
        prop_assert!(escaped.ends_with("\\\\\""), "{escaped}");
    });
}
