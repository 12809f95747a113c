use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use thiserror::Error;

const UPLOAD_PREFIX: &str = "upload-";

#[derive(Error, Debug)]
#[error("Failed to remove upload {path:?}: {source}")]
pub struct CleanupError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Raw upload stored under a unique name in the upload directory. The file is
/// removed when the value is dropped, whatever path the request took.
#[derive(Debug)]
pub struct UploadedImage {
    file: Option<NamedTempFile>,
    path: PathBuf,
}

impl UploadedImage {
    pub fn persist(upload_dir: &Path, bytes: &[u8]) -> io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix(UPLOAD_PREFIX)
            .tempfile_in(upload_dir)?;
        file.write_all(bytes)?;
        file.flush()?;

        let path = file.path().to_path_buf();
        tracing::debug!(path = ?path, size = bytes.len(), "Stored upload");

        Ok(Self {
            file: Some(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn remove(&mut self) -> Result<(), CleanupError> {
        match self.file.take() {
            Some(file) => file.close().map_err(|source| CleanupError {
                path: self.path.clone(),
                source,
            }),
            None => Ok(()),
        }
    }
}

impl Drop for UploadedImage {
    fn drop(&mut self) {
        match self.remove() {
            Ok(()) => tracing::debug!(path = ?self.path, "Removed upload"),
            Err(e) => tracing::warn!("{}", e),
        }
    }
}

pub fn ensure_upload_dir(upload_dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(upload_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_persist_and_drop() {
        let dir = TempDir::new().unwrap();

        let upload = UploadedImage::persist(dir.path(), b"payload").unwrap();
        assert_eq!(std::fs::read(upload.path()).unwrap(), b"payload");
        assert_eq!(entries(dir.path()), 1);

        let path = upload.path().to_path_buf();
        drop(upload);

        assert!(!path.exists());
        assert_eq!(entries(dir.path()), 0);
    }

    #[test]
    fn test_unique_names() {
        let dir = TempDir::new().unwrap();

        let first = UploadedImage::persist(dir.path(), b"a").unwrap();
        let second = UploadedImage::persist(dir.path(), b"b").unwrap();

        assert_ne!(first.path(), second.path());
        assert!(first
            .path()
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(UPLOAD_PREFIX)));
    }

    #[test]
    fn test_drop_after_external_removal_does_not_panic() {
        let dir = TempDir::new().unwrap();
        let upload = UploadedImage::persist(dir.path(), b"payload").unwrap();

        std::fs::remove_file(upload.path()).unwrap();

        drop(upload);
        assert_eq!(entries(dir.path()), 0);
    }

    #[test]
    fn test_persist_into_missing_dir_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing");

        assert!(UploadedImage::persist(&missing, b"payload").is_err());

        ensure_upload_dir(&missing).unwrap();
        assert!(UploadedImage::persist(&missing, b"payload").is_ok());
    }
}
