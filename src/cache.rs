//! Filesystem key/value cache under `content/cache`.
//!
//! Concurrent writers race; the last rename wins.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Cache {
    dir: PathBuf,
}

impl Cache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(name)
    }

    pub fn has(&self, key: &str) -> bool {
        self.path(key).is_file()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.path(key)).ok()
    }

    pub fn put(&self, key: &str, data: &str) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let target = self.path(key);
        let mut tmp = target.clone().into_os_string();
        tmp.push(format!(".tmp{}", std::process::id()));
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &target)
    }

    pub fn delete(&self, key: &str) -> io::Result<bool> {
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete every entry whose key starts with `prefix` (all entries when
    /// `None`), except `keep`. Returns how many were removed.
    pub fn flush(&self, prefix: Option<&str>, keep: Option<&str>) -> io::Result<usize> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let keep = keep.map(|k| self.path(k));
        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() || Some(&path) == keep.as_ref() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if prefix.map_or(true, |p| name.starts_with(p)) {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
