//! Argument escaping for safe insertion into a platform command line

/// Escape a single argument for the current platform's shell.
///
/// Dispatches to [`escape_posix`] or [`escape_windows`] at compile time.
///
/// # Examples
/// ```
/// use riceproc::escape;
///
/// # #[cfg(unix)]
/// assert_eq!(escape("it's"), r"'it'\''s'");
/// ```
pub fn escape(argument: &str) -> String {
    if cfg!(windows) {
        escape_windows(argument)
    } else {
        escape_posix(argument)
    }
}

/// Standard POSIX single-quote escape.
///
/// The whole argument is wrapped in single quotes; embedded single quotes
/// are closed, backslash-escaped, and reopened.
pub fn escape_posix(argument: &str) -> String {
    format!("'{}'", argument.replace('\'', "'\\''"))
}

/// Escape an argument for `cmd.exe`.
///
/// The native quoting routine strips `%` and mishandles trailing
/// backslashes, so this implements a custom quoter: the argument is split
/// preserving `"` delimiters, bare quotes become `\"`, parts fully
/// surrounded by `%` are wrapped as `^%"…"^%` to suppress environment
/// expansion, and any other part doubles a trailing backslash and forces
/// outer double quotes around the result.
pub fn escape_windows(argument: &str) -> String {
    if argument.is_empty() {
        return escape_posix(argument);
    }

    let mut escaped = String::with_capacity(argument.len() + 2);
    let mut quote = false;

    for part in split_preserving_quotes(argument) {
        if part == "\"" {
            escaped.push_str("\\\"");
        } else if is_surrounded_by(part, '%') {
            escaped.push_str("^%\"");
            escaped.push_str(&part[1..part.len() - 1]);
            escaped.push_str("\"^%");
        } else {
            escaped.push_str(part);
            if part.ends_with('\\') {
                escaped.push('\\');
            }
            quote = true;
        }
    }

    if quote {
        format!("\"{escaped}\"")
    } else {
        escaped
    }
}

/// Split on `"`, keeping each quote as its own part and dropping empties.
fn split_preserving_quotes(argument: &str) -> impl Iterator<Item = &str> {
    argument
        .split_inclusive('"')
        .flat_map(|piece| match piece.strip_suffix('"') {
            Some(rest) => [rest, "\""].into_iter(),
            None => [piece, ""].into_iter(),
        })
        .filter(|part| !part.is_empty())
}

fn is_surrounded_by(part: &str, ch: char) -> bool {
    part.len() >= 2 && part.starts_with(ch) && part.ends_with(ch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posix_plain() {
        assert_eq!(escape_posix("hello"), "'hello'");
    }

    #[test]
    fn test_posix_empty() {
        assert_eq!(escape_posix(""), "''");
    }

    #[test]
    fn test_posix_single_quote() {
        assert_eq!(escape_posix("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_windows_empty_uses_posix_form() {
        assert_eq!(escape_windows(""), "''");
    }

    #[test]
    fn test_windows_plain_is_quoted() {
        assert_eq!(escape_windows("hello world"), "\"hello world\"");
    }

    #[test]
    fn test_windows_bare_quote() {
        assert_eq!(escape_windows("a\"b"), "\"a\\\"b\"");
    }

    #[test]
    fn test_windows_env_var_is_neutralized() {
        assert_eq!(escape_windows("%PATH%"), "^%\"PATH\"^%");
    }

    #[test]
    fn test_windows_short_percent_not_wrapped() {
        // A lone "%" is not a surrounded pair and must be quoted normally.
        assert_eq!(escape_windows("%"), "\"%\"");
    }

    #[test]
    fn test_windows_double_percent_is_wrapped() {
        assert_eq!(escape_windows("%%"), "^%\"\"^%");
    }

    #[test]
    fn test_windows_trailing_backslash_doubled() {
        assert_eq!(escape_windows("dir\\"), "\"dir\\\\\"");
    }

    #[test]
    fn test_windows_mixed_parts() {
        assert_eq!(escape_windows("a\"%HOME%\"b"), "\"a\\\"^%\"HOME\"^%\\\"b\"");
    }
}
