//! Durable move log.
//!
//! Plain text, one `source, destination` pair per line, appended as moves
//! happen. Undo drops the last line. The file alone is enough to reverse a
//! finished session with [`reverse_all`].

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::core::fsops::move_file;

const SEPARATOR: &str = ", ";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("IO error on ledger {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Ledger {path}:{line} is not a `source, destination` pair")]
    Malformed { path: PathBuf, line: usize },

    #[error("Ledger {path}:{line} is ambiguous, a path contains \", \"")]
    Ambiguous { path: PathBuf, line: usize },

    #[error("Cannot record {path}: not valid UTF-8")]
    NonUtf8 { path: PathBuf },
}

/// One recorded move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerLine {
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl LedgerLine {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }

    /// The text line for this move. Paths must be UTF-8 to read back as
    /// the same paths.
    fn render(&self) -> Result<String, LedgerError> {
        fn text(path: &Path) -> Result<&str, LedgerError> {
            path.to_str().ok_or_else(|| LedgerError::NonUtf8 {
                path: path.to_path_buf(),
            })
        }
        Ok(format!(
            "{}{SEPARATOR}{}",
            text(&self.source)?,
            text(&self.destination)?
        ))
    }
}

/// Handle on a ledger file. Nothing is created until the first append.
#[derive(Debug, Clone)]
pub struct LedgerFile {
    path: PathBuf,
}

impl LedgerFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// All recorded moves, oldest first. A missing file reads as empty.
    pub fn read(&self) -> Result<Vec<LedgerLine>, LedgerError> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(self.io_err(err)),
        };

        let mut lines = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| self.io_err(e))?;
            if line.trim().is_empty() {
                continue;
            }
            lines.push(self.parse(&line, index + 1)?);
        }
        Ok(lines)
    }

    fn parse(&self, line: &str, number: usize) -> Result<LedgerLine, LedgerError> {
        let parts: Vec<&str> = line.split(SEPARATOR).collect();
        match parts.as_slice() {
            [source, destination] if !source.is_empty() && !destination.is_empty() => {
                Ok(LedgerLine::new(*source, *destination))
            }
            [_, _, _, ..] => Err(LedgerError::Ambiguous {
                path: self.path.clone(),
                line: number,
            }),
            _ => Err(LedgerError::Malformed {
                path: self.path.clone(),
                line: number,
            }),
        }
    }

    pub fn append(&self, line: &LedgerLine) -> Result<(), LedgerError> {
        let text = line.render()?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;
        writeln!(file, "{text}").map_err(|e| self.io_err(e))?;
        file.sync_data().map_err(|e| self.io_err(e))
    }

    /// Remove and return the most recent move.
    pub fn pop(&self) -> Result<Option<LedgerLine>, LedgerError> {
        let mut lines = self.read()?;
        let last = lines.pop();
        if last.is_some() {
            self.rewrite(&lines)?;
        }
        Ok(last)
    }

    /// Replace the file with `lines` through a temp file in the same
    /// directory, so a crash leaves either the old or the new ledger.
    fn rewrite(&self, lines: &[LedgerLine]) -> Result<(), LedgerError> {
        let mut content = String::new();
        for line in lines {
            content.push_str(&line.render()?);
            content.push('\n');
        }

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let mut temp = NamedTempFile::new_in(dir).map_err(|e| self.io_err(e))?;
        temp.write_all(content.as_bytes()).map_err(|e| self.io_err(e))?;
        temp.as_file().sync_data().map_err(|e| self.io_err(e))?;
        temp.persist(&self.path).map_err(|e| self.io_err(e.error))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReversalStatus {
    Restored,
    /// Nothing at the destination any more.
    Missing,
    Failed(String),
}

/// Outcome for one ledger line, numbered as in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reversal {
    pub index: usize,
    pub line: LedgerLine,
    pub status: ReversalStatus,
}

/// Undo a whole session: walk the ledger back to front and move every
/// destination that still exists back to its source. Lines that failed
/// stay in the ledger; restored and missing ones are dropped.
pub fn reverse_all(ledger: &LedgerFile) -> Result<Vec<Reversal>, LedgerError> {
    let lines = ledger.read()?;
    let mut reversals = Vec::with_capacity(lines.len());

    for (index, line) in lines.into_iter().enumerate().rev() {
        let status = if !line.destination.exists() {
            ReversalStatus::Missing
        } else if line.source.exists() {
            ReversalStatus::Failed(format!("{} is occupied", line.source.display()))
        } else {
            match move_file(&line.destination, &line.source) {
                Ok(()) => ReversalStatus::Restored,
                Err(err) => ReversalStatus::Failed(err.to_string()),
            }
        };
        reversals.push(Reversal {
            index,
            line,
            status,
        });
    }

    let mut remaining: Vec<LedgerLine> = reversals
        .iter()
        .filter(|r| matches!(r.status, ReversalStatus::Failed(_)))
        .map(|r| r.line.clone())
        .collect();
    remaining.reverse();
    if remaining.len() != reversals.len() {
        ledger.rewrite(&remaining)?;
    }

    Ok(reversals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_read_pop() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = LedgerFile::new(temp_dir.path().join("out/record.txt"));
        assert!(ledger.read().unwrap().is_empty());

        ledger.append(&LedgerLine::new("/p/a.jpg", "/out/a.jpg")).unwrap();
        ledger.append(&LedgerLine::new("/p/b.jpg", "/out/b.jpg")).unwrap();

        let text = fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(text, "/p/a.jpg, /out/a.jpg\n/p/b.jpg, /out/b.jpg\n");

        assert_eq!(
            ledger.pop().unwrap(),
            Some(LedgerLine::new("/p/b.jpg", "/out/b.jpg"))
        );
        assert_eq!(
            ledger.read().unwrap(),
            vec![LedgerLine::new("/p/a.jpg", "/out/a.jpg")]
        );
        ledger.pop().unwrap();
        assert_eq!(ledger.pop().unwrap(), None);
    }

    #[test]
    fn test_pop_replaces_the_file_without_leftovers() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = LedgerFile::new(temp_dir.path().join("record.txt"));
        ledger.append(&LedgerLine::new("/p/a.jpg", "/out/a.jpg")).unwrap();
        ledger.append(&LedgerLine::new("/p/b.jpg", "/out/b.jpg")).unwrap();

        ledger.pop().unwrap();
        let names: Vec<String> = fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["record.txt"]);
        assert_eq!(
            fs::read_to_string(ledger.path()).unwrap(),
            "/p/a.jpg, /out/a.jpg\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_paths_are_not_recorded() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp_dir = TempDir::new().unwrap();
        let ledger = LedgerFile::new(temp_dir.path().join("record.txt"));
        let source = Path::new("/p").join(OsStr::from_bytes(b"bad\xff.jpg"));

        let result = ledger.append(&LedgerLine::new(&source, "/out/bad.jpg"));
        assert!(matches!(result, Err(LedgerError::NonUtf8 { path }) if path == source));
        assert!(!ledger.path().exists());
    }

    #[test]
    fn test_malformed_and_ambiguous_lines() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("record.txt");
        let ledger = LedgerFile::new(&path);

        fs::write(&path, "/p/a.jpg\n").unwrap();
        assert!(matches!(ledger.read(), Err(LedgerError::Malformed { line: 1, .. })));

        fs::write(&path, "/p/a, b.jpg, /out/a, b.jpg\n").unwrap();
        assert!(matches!(ledger.read(), Err(LedgerError::Ambiguous { line: 1, .. })));
    }

    #[test]
    fn test_reverse_all_restores_back_to_front() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let out = root.join("out");
        fs::create_dir_all(&out).unwrap();

        // The same name was moved twice; reversal order matters.
        fs::write(out.join("a.jpg"), b"first").unwrap();
        fs::write(out.join("a#01.jpg"), b"second").unwrap();

        let ledger = LedgerFile::new(out.join("record.txt"));
        ledger
            .append(&LedgerLine::new(root.join("x/a.jpg"), out.join("a.jpg")))
            .unwrap();
        ledger
            .append(&LedgerLine::new(root.join("y/a.jpg"), out.join("a#01.jpg")))
            .unwrap();
        ledger
            .append(&LedgerLine::new(root.join("z/gone.jpg"), out.join("gone.jpg")))
            .unwrap();

        let reversals = reverse_all(&ledger).unwrap();
        let indices: Vec<usize> = reversals.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![2, 1, 0]);
        assert_eq!(reversals[0].status, ReversalStatus::Missing);
        assert_eq!(reversals[1].status, ReversalStatus::Restored);
        assert_eq!(reversals[2].status, ReversalStatus::Restored);

        assert_eq!(fs::read(root.join("x/a.jpg")).unwrap(), b"first");
        assert_eq!(fs::read(root.join("y/a.jpg")).unwrap(), b"second");
        assert!(ledger.read().unwrap().is_empty());
    }
}
