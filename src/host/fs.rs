//! OS-backed device filesystem
//!
//! Thin adapter from [`DeviceFs`] onto `std::fs` and the `glob` crate.

use crate::domain::ports::DeviceFs;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// [`DeviceFs`] over the real `/dev` and `/sys`
#[derive(Debug, Clone, Copy, Default)]
pub struct OsDeviceFs;

impl OsDeviceFs {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceFs for OsDeviceFs {
    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        fs::canonicalize(path)
    }

    fn stat(&self, path: &Path) -> io::Result<()> {
        fs::metadata(path).map(|_| ())
    }

    fn glob(&self, pattern: &str) -> io::Result<Vec<PathBuf>> {
        let paths = glob::glob(pattern)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        // Unreadable directories are skipped, as the shell would
        Ok(paths.filter_map(|p| p.ok()).collect())
    }

    fn write(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;

        let mut file = options.open(path)?;
        file.write_all(data)
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }
}
