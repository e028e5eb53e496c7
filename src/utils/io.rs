//! Local file access with every failure mapped to `internal.io_error`.

use crate::error::{Error, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

fn io_error(error: std::io::Error, operation: &str) -> Error {
    Error::internal_io(error.to_string(), Some(operation.to_string()))
}

pub fn read_file(path: &Path, operation: &str) -> Result<String> {
    fs::read_to_string(path).map_err(|e| io_error(e, operation))
}

pub fn read_bytes(path: &Path, operation: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| io_error(e, operation))
}

/// Create `path` with `content`, refusing to replace an existing file.
///
/// Returns `false` when the file was already there.
pub fn create_new(path: &Path, content: &str, operation: &str) -> Result<bool> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(io_error(e, operation)),
    };
    file.write_all(content.as_bytes())
        .map_err(|e| io_error(e, operation))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_file_reports_missing_file_as_io_error() {
        let err = read_file(Path::new("/nonexistent/caput.conf"), "read caput.conf").unwrap_err();
        assert_eq!(err.code.as_str(), "internal.io_error");
        assert_eq!(err.details["context"], "read caput.conf");
    }

    #[test]
    fn create_new_keeps_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caput.conf");

        assert!(create_new(&path, "APP_NAME=\"blog\"\n", "write").unwrap());
        assert!(!create_new(&path, "APP_NAME=\"other\"\n", "write").unwrap());
        assert_eq!(read_file(&path, "read").unwrap(), "APP_NAME=\"blog\"\n");
    }

    #[test]
    fn create_new_fails_in_missing_directory() {
        let err = create_new(Path::new("/nonexistent/dir/caput.conf"), "", "write").unwrap_err();
        assert_eq!(err.code.as_str(), "internal.io_error");
    }
}
