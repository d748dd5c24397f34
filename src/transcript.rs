//! Plain-text transcript of the guest's serial output.
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum TranscriptError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for TranscriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranscriptError::Open { path, source } => {
                write!(f, "failed to open transcript {}: {}", path.display(), source)
            }
            TranscriptError::Write { path, source } => {
                write!(f, "failed to write transcript {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for TranscriptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TranscriptError::Open { source, .. } => Some(source),
            TranscriptError::Write { source, .. } => Some(source),
        }
    }
}

/// Open transcript of one monitoring session. The file is closed on drop.
#[derive(Debug)]
pub struct Transcript {
    path: PathBuf,
    file: File,
}

impl Transcript {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: &Path) -> Result<Self, TranscriptError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| TranscriptError::Open {
                path: path.to_path_buf(),
                source: e,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Append a chunk verbatim.
    pub fn write(&mut self, chunk: &str) -> Result<(), TranscriptError> {
        self.file
            .write_all(chunk.as_bytes())
            .map_err(|e| TranscriptError::Write {
                path: self.path.clone(),
                source: e,
            })
    }
}

/// Empty the transcript at `path` for a fresh capture.
///
/// A missing file is fine; other errors are logged and ignored.
pub fn truncate(path: &Path) {
    match OpenOptions::new().write(true).truncate(true).open(path) {
        Ok(_) => tracing::debug!(path = %path.display(), "transcript emptied"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "failed to empty transcript")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_and_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("testbot.txt");

        let mut t = Transcript::open(&path).unwrap();
        t.write("first\n").unwrap();
        drop(t);
        let mut t = Transcript::open(&path).unwrap();
        t.write("kdb:>").unwrap();
        drop(t);

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nkdb:>");
    }

    #[test]
    fn test_truncate_empties_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("testbot.txt");
        std::fs::write(&path, "old attempt\n").unwrap();

        truncate(&path);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_truncate_missing_file_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.txt");
        truncate(&path);
        assert!(!path.exists());
    }

    #[test]
    fn test_open_in_missing_dir_fails() {
        let err = Transcript::open(Path::new("/nonexistent-dir/impossible/t.txt")).unwrap_err();
        assert!(matches!(err, TranscriptError::Open { .. }));
        assert!(err.to_string().contains("failed to open transcript"));
    }
}
