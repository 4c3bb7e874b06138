//! Executable discovery on the search path

use std::env;
use std::path::{Path, PathBuf};

/// Locates a binary by name on `PATH` with platform-appropriate suffixes.
///
/// # Examples
/// ```
/// use riceproc::ExecutableFinder;
///
/// let finder = ExecutableFinder::new();
/// # #[cfg(unix)]
/// assert!(finder.find("sh").is_some());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ExecutableFinder {
    extra_dirs: Vec<PathBuf>,
}

impl ExecutableFinder {
    /// Create a finder that searches the `PATH` environment variable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a directory searched after the `PATH` entries.
    pub fn add_extra_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.extra_dirs.push(dir.into());
        self
    }

    /// Find `name`, returning `default` when nothing matches.
    pub fn find_with_default(&self, name: &str, default: impl Into<PathBuf>) -> PathBuf {
        self.find(name).unwrap_or_else(|| default.into())
    }

    /// Find `name` on the search path.
    ///
    /// Returns the first `<dir>/<name><suffix>` that is a regular file and,
    /// on POSIX, executable. Names that already contain a path separator
    /// are checked directly instead of searched.
    pub fn find(&self, name: &str) -> Option<PathBuf> {
        let suffixes = platform_suffixes();

        if name.contains(std::path::MAIN_SEPARATOR) {
            return suffixes
                .iter()
                .map(|suffix| PathBuf::from(format!("{name}{suffix}")))
                .find(|candidate| is_executable_file(candidate));
        }

        let path_dirs = env::var_os("PATH")
            .map(|path| env::split_paths(&path).collect::<Vec<_>>())
            .unwrap_or_default();

        for dir in path_dirs.iter().chain(self.extra_dirs.iter()) {
            for suffix in &suffixes {
                let candidate = dir.join(format!("{name}{suffix}"));
                if is_executable_file(&candidate) {
                    return Some(candidate);
                }
            }
        }

        None
    }
}

/// Suffix set tried for each candidate.
///
/// On Windows this comes from `PATHEXT`, defaulting to the classic four;
/// on POSIX only the empty suffix applies.
fn platform_suffixes() -> Vec<String> {
    if cfg!(windows) {
        match env::var("PATHEXT") {
            Ok(pathext) => pathext
                .split(';')
                .filter(|ext| !ext.is_empty())
                .map(|ext| ext.to_ascii_lowercase())
                .collect(),
            Err(_) => vec![
                ".exe".to_string(),
                ".bat".to_string(),
                ".cmd".to_string(),
                ".com".to_string(),
            ],
        }
    } else {
        vec![String::new()]
    }
}

fn is_executable_file(path: &Path) -> bool {
    let Ok(metadata) = path.metadata() else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    true
}
