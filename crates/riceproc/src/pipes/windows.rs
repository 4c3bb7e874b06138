//! Windows pipe backend
//!
//! Reading a full stdout pipe from the parent can deadlock on Windows, so
//! stdout and stderr are redirected to temp files at the shell level (the
//! engine wraps the command line with `N>file` redirections built from
//! [`PipeBackend::get_files`]) and streamed back incrementally. Stdin
//! remains a real pipe.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Stdio};

use tempfile::NamedTempFile;
use tracing::warn;

use super::{PipeBackend, SpawnStdio, CHUNK_SIZE, STDERR, STDOUT, WRITE_BURST};
use crate::input::InputSource;

/// One redirected output stream: the owned temp file (unlinked on drop)
/// plus an independent read handle and its cursor.
struct OutputFile {
    temp: NamedTempFile,
    reader: Option<File>,
    read_bytes: u64,
}

impl OutputFile {
    fn create(prefix: &str) -> io::Result<Self> {
        let temp = tempfile::Builder::new().prefix(prefix).tempfile()?;
        let reader = File::open(temp.path())?;
        Ok(OutputFile {
            temp,
            reader: Some(reader),
            read_bytes: 0,
        })
    }

    fn path(&self) -> PathBuf {
        self.temp.path().to_path_buf()
    }

    /// Seek to the cursor, read to EOF, advance. Returns the fresh bytes.
    /// The handle closes itself on read failure, or at EOF with no new
    /// bytes while `closing` is set.
    fn drain(&mut self, closing: bool) -> Vec<u8> {
        let Some(reader) = self.reader.as_mut() else {
            return Vec::new();
        };

        let mut fresh = Vec::new();
        let mut failed = reader.seek(SeekFrom::Start(self.read_bytes)).is_err();
        if !failed {
            let mut buf = [0u8; CHUNK_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => fresh.extend_from_slice(&buf[..n]),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => {
                        failed = true;
                        break;
                    }
                }
            }
        }
        self.read_bytes += fresh.len() as u64;

        if failed || (closing && fresh.is_empty()) {
            self.reader = None;
        }
        fresh
    }

    fn is_open(&self) -> bool {
        self.reader.is_some()
    }
}

/// The Windows backend: temp-file outputs, piped stdin.
pub(crate) struct WindowsPipes {
    stdout_file: Option<OutputFile>,
    stderr_file: Option<OutputFile>,
    stdin: Option<ChildStdin>,
    input: InputSource,
    read_support: bool,
}

impl WindowsPipes {
    pub(crate) fn new(read_support: bool, input: InputSource) -> io::Result<Self> {
        let (stdout_file, stderr_file) = if read_support {
            (
                Some(OutputFile::create("riceproc-out-")?),
                Some(OutputFile::create("riceproc-err-")?),
            )
        } else {
            (None, None)
        };
        Ok(WindowsPipes {
            stdout_file,
            stderr_file,
            stdin: None,
            input,
            read_support,
        })
    }

    /// Write buffered input into the child's stdin, refilling the buffer
    /// from the caller's stream as it empties.
    fn write_stdin(&mut self) {
        if self.input.buffer.is_empty() {
            if let Some(stream) = self.input.stream.as_mut() {
                let mut buf = [0u8; CHUNK_SIZE];
                match stream.read(&mut buf) {
                    Ok(0) => self.input.stream = None,
                    Ok(n) => self.input.buffer.extend_from_slice(&buf[..n]),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(_) => self.input.stream = None,
                }
            }
        }

        let Some(stdin) = self.stdin.as_mut() else {
            return;
        };
        let mut lost = false;
        while !self.input.buffer.is_empty() {
            let len = self.input.buffer.len().min(WRITE_BURST);
            match stdin.write(&self.input.buffer[..len]) {
                Ok(0) => break,
                Ok(n) => {
                    self.input.buffer.drain(..n);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => break,
                Err(err) => {
                    if err.kind() != io::ErrorKind::BrokenPipe {
                        warn!(error = %err, "writing to child stdin failed");
                    }
                    lost = true;
                    break;
                }
            }
        }
        if lost || self.input.is_drained() {
            // Dropping the handle closes the pipe and signals EOF.
            self.stdin = None;
        }
    }
}

impl PipeBackend for WindowsPipes {
    fn take_stdio(&mut self) -> io::Result<SpawnStdio> {
        // Child descriptors 1/2 point at the null device; real output
        // arrives through the shell-level temp-file redirections.
        Ok(SpawnStdio {
            stdin: Stdio::piped(),
            stdout: Stdio::null(),
            stderr: Stdio::null(),
        })
    }

    fn get_files(&self) -> BTreeMap<u32, PathBuf> {
        let mut files = BTreeMap::new();
        if let Some(file) = &self.stdout_file {
            files.insert(STDOUT, file.path());
        }
        if let Some(file) = &self.stderr_file {
            files.insert(STDERR, file.path());
        }
        files
    }

    fn attach(&mut self, child: &mut Child) {
        self.stdin = child.stdin.take();
    }

    fn read_and_write(&mut self, _blocking: bool, closing: bool) -> BTreeMap<u32, Vec<u8>> {
        self.write_stdin();

        let mut result = BTreeMap::new();
        if let Some(file) = self.stdout_file.as_mut() {
            let fresh = file.drain(closing);
            if !fresh.is_empty() {
                result.insert(STDOUT, fresh);
            }
        }
        if let Some(file) = self.stderr_file.as_mut() {
            let fresh = file.drain(closing);
            if !fresh.is_empty() {
                result.insert(STDERR, fresh);
            }
        }
        result
    }

    fn are_open(&self) -> bool {
        self.stdin.is_some()
            || self.stdout_file.as_ref().is_some_and(OutputFile::is_open)
            || self.stderr_file.as_ref().is_some_and(OutputFile::is_open)
    }

    fn have_read_support(&self) -> bool {
        self.read_support
    }

    fn close(&mut self) {
        self.stdin = None;
        // Dropping the NamedTempFile handles unlinks the files.
        self.stdout_file = None;
        self.stderr_file = None;
    }
}
