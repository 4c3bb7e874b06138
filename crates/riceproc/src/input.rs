//! Input sources for the child's standard input

use std::fs::File;
use std::io;
use std::time::Duration;

use crate::error::{ProcessError, Result};

/// What gets fed to the child's standard input.
///
/// Callers hand over either a readable file handle, a byte string, or
/// nothing at all. Scalar values (numbers, booleans) are coerced through
/// their string form before conversion.
#[derive(Debug, Default)]
pub enum Input {
    /// No input; stdin is closed as soon as the internal buffer drains.
    #[default]
    None,
    /// A fixed byte string written to stdin, then stdin is closed.
    Bytes(Vec<u8>),
    /// A readable handle drained incrementally into stdin.
    Stream(File),
}

impl Input {
    /// True when no input was configured.
    pub fn is_none(&self) -> bool {
        matches!(self, Input::None)
    }

    /// Duplicate the input for a new run.
    ///
    /// Byte inputs are copied; stream inputs share the underlying handle
    /// (and its cursor) via `try_clone`.
    pub(crate) fn duplicate(&self) -> io::Result<Input> {
        Ok(match self {
            Input::None => Input::None,
            Input::Bytes(bytes) => Input::Bytes(bytes.clone()),
            Input::Stream(file) => Input::Stream(file.try_clone()?),
        })
    }

    /// Build the backend-facing source for one run.
    pub(crate) fn to_source(&self) -> io::Result<InputSource> {
        Ok(match self {
            Input::None => InputSource::default(),
            Input::Bytes(bytes) => InputSource {
                buffer: bytes.clone(),
                stream: None,
            },
            Input::Stream(file) => InputSource {
                buffer: Vec::new(),
                stream: Some(file.try_clone()?),
            },
        })
    }
}

impl From<&str> for Input {
    fn from(value: &str) -> Self {
        Input::Bytes(value.as_bytes().to_vec())
    }
}

impl From<String> for Input {
    fn from(value: String) -> Self {
        Input::Bytes(value.into_bytes())
    }
}

impl From<Vec<u8>> for Input {
    fn from(value: Vec<u8>) -> Self {
        Input::Bytes(value)
    }
}

impl From<&[u8]> for Input {
    fn from(value: &[u8]) -> Self {
        Input::Bytes(value.to_vec())
    }
}

impl From<File> for Input {
    fn from(value: File) -> Self {
        Input::Stream(value)
    }
}

impl<T> From<Option<T>> for Input
where
    T: Into<Input>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(Input::None, Into::into)
    }
}

/// Per-run input state owned by the pipe backend.
///
/// `buffer` holds bytes not yet written to the child; `stream` refills the
/// buffer as the readiness primitive reports it readable.
#[derive(Debug, Default)]
pub(crate) struct InputSource {
    pub(crate) buffer: Vec<u8>,
    pub(crate) stream: Option<File>,
}

impl InputSource {
    /// True once the stream (if any) hit EOF and the buffer is empty.
    pub(crate) fn is_drained(&self) -> bool {
        self.buffer.is_empty() && self.stream.is_none()
    }
}

/// Normalize an f64-seconds timeout supplied by the caller.
///
/// `0.0` clears the timeout; negative or non-finite values are rejected
/// with [`ProcessError::InvalidArgument`] citing `caller`.
pub(crate) fn validate_timeout(caller: &str, seconds: f64) -> Result<Option<Duration>> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(ProcessError::InvalidArgument(format!(
            "{caller} expects a non-negative number of seconds, got {seconds}."
        )));
    }
    if seconds == 0.0 {
        return Ok(None);
    }
    Ok(Some(Duration::from_secs_f64(seconds)))
}
