//! Managed-directory file operations.
//!
//! The server owns one directory of flat files. Clients may list the visible
//! files, read the last line of one, or append a line to one. Names are
//! constrained to plain entries inside the root: no traversal, no hidden
//! files, no separators.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::ServerError;

#[derive(Debug)]
pub struct FileService {
    root: PathBuf,
}

impl FileService {
    /// The root must already exist and contain at least one file; an empty
    /// server has nothing to coordinate access to.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ServerError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(ServerError::MissingRoot { path: root });
        }
        let service = Self { root };
        if service.list_files()?.is_empty() {
            return Err(ServerError::EmptyRoot {
                path: service.root,
            });
        }
        Ok(service)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Visible (non-hidden) file names, sorted for stable responses.
    pub fn list_files(&self) -> Result<Vec<String>, ServerError> {
        let entries = std::fs::read_dir(&self.root).map_err(|source| ServerError::Io {
            path: self.root.clone(),
            source,
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ServerError::Io {
                path: self.root.clone(),
                source,
            })?;
            let is_file = entry
                .file_type()
                .map(|kind| kind.is_file())
                .unwrap_or(false);
            if !is_file {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    /// Last line of the named file. An empty file reads as an empty string;
    /// a trailing newline does not count as an extra line.
    pub fn read_last_line(&self, name: &str) -> Result<String, ServerError> {
        let path = self.resolve(name)?;
        let file = File::open(&path).map_err(|source| ServerError::Io { path, source })?;
        let reader = BufReader::new(file);
        let mut last = String::new();
        for line in reader.lines() {
            last = line.map_err(|source| ServerError::Io {
                path: self.root.join(name),
                source,
            })?;
        }
        Ok(last)
    }

    /// Appends `line` plus a newline. Creates the file if a client writes to
    /// a name that does not exist yet.
    pub fn append_line(&self, name: &str, line: &str) -> Result<(), ServerError> {
        let path = self.resolve(name)?;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|source| ServerError::Io {
                path: path.clone(),
                source,
            })?;
        writeln!(file, "{line}").map_err(|source| ServerError::Io { path, source })?;
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, ServerError> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains('/')
            && !name.contains('\\');
        if !valid {
            return Err(ServerError::InvalidFileAccess {
                name: name.to_string(),
            });
        }
        Ok(self.root.join(name))
    }
}
