//! Per-VM directory store.
//!
//! Each VM owns `<base>/<vm id>`, holding its device definition, the request
//! snapshot, guest customization documents and usually its disk images.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument};

use crate::error::{Error, Result};

/// Default base directory for VM state.
pub const DEFAULT_DEFINITIONS_DIR: &str = "/var/lib/vmctl/vms";

/// Device definition document (libvirt domain XML).
pub const DEVICE_DOCUMENT: &str = "server.xml";

/// Request snapshot document.
pub const SNAPSHOT_DOCUMENT: &str = "server.json";

const MAX_ID_LEN: usize = 128;

/// Check that a caller-supplied identifier is safe to use as a path component.
pub fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::Validation(format!("missing '{}'", kind)));
    }
    if id.len() > MAX_ID_LEN {
        return Err(Error::Validation(format!(
            "'{}' must be at most {} characters",
            kind, MAX_ID_LEN
        )));
    }
    if id == "." || id == ".." {
        return Err(Error::Validation(format!("'{}' may not be '{}'", kind, id)));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if !id.chars().all(allowed) {
        return Err(Error::Validation(format!(
            "'{}' may only contain ASCII letters, digits, '-', '_' and '.'",
            kind
        )));
    }
    Ok(())
}

/// Filesystem store for VM directories.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    base_path: PathBuf,
}

impl DirectoryStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Directory for a VM ID. The ID is validated first.
    pub fn vm_dir(&self, vm_id: &str) -> Result<PathBuf> {
        validate_id("id", vm_id)?;
        Ok(self.base_path.join(vm_id))
    }

    /// Create `path` (and parents). Succeeds if it already is a directory.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn create_directory(&self, path: &Path) -> Result<()> {
        if self.directory_exists(path).await? {
            debug!("Directory already exists");
            return Ok(());
        }

        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o755);

        match builder.create(path).await {
            Ok(()) => {
                info!("Created directory");
                Ok(())
            }
            // Lost a race with another creator, or a file appeared meanwhile.
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
                if self.directory_exists(path).await? {
                    Ok(())
                } else {
                    Err(Error::PathConflict(path.to_path_buf()))
                }
            }
            Err(e) => Err(Error::io(
                format!("Failed to create directory '{}'", path.display()),
                e,
            )),
        }
    }

    /// Write `name` inside `dir`, replacing any previous content.
    ///
    /// The content is written to a hidden temporary file and renamed into
    /// place, so readers see either the old or the new document.
    #[instrument(skip(self, bytes), fields(dir = %dir.display(), name = %name, len = bytes.len()))]
    pub async fn write_document(&self, dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
        let target = dir.join(name);
        let temp = dir.join(format!(".{}.tmp", name));

        tokio::fs::write(&temp, bytes)
            .await
            .map_err(|e| Error::io(format!("Failed to write '{}'", temp.display()), e))?;

        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(Error::io(
                format!("Failed to replace '{}'", target.display()),
                e,
            ));
        }

        debug!("Document written");
        Ok(())
    }

    /// Read `name` from `dir`.
    pub async fn read_document(&self, dir: &Path, name: &str) -> Result<Vec<u8>> {
        let path = dir.join(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                Err(Error::NotFound(format!("document '{}'", path.display())))
            }
            Err(e) => Err(Error::io(format!("Failed to read '{}'", path.display()), e)),
        }
    }

    /// Delete `name` from `dir`. Fails with `NotFound` if it is absent.
    #[instrument(skip(self), fields(dir = %dir.display(), name = %name))]
    pub async fn delete_document(&self, dir: &Path, name: &str) -> Result<()> {
        let path = dir.join(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Document deleted");
                Ok(())
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                Err(Error::NotFound(format!("document '{}'", path.display())))
            }
            Err(e) => Err(Error::io(format!("Failed to delete '{}'", path.display()), e)),
        }
    }

    /// Whether `path` is an existing directory.
    ///
    /// * absent -> `Ok(false)`
    /// * present and a directory -> `Ok(true)`
    /// * present but not a directory -> `PathConflict`
    pub async fn directory_exists(&self, path: &Path) -> Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => Ok(true),
            Ok(_) => Err(Error::PathConflict(path.to_path_buf())),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io(
                format!("Failed to check directory status for '{}'", path.display()),
                e,
            )),
        }
    }

    /// Recursively remove `path`. Fails with `NotFound` if it is absent.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn delete_directory(&self, path: &Path) -> Result<()> {
        if !self.directory_exists(path).await? {
            return Err(Error::NotFound(format!("directory '{}'", path.display())));
        }

        tokio::fs::remove_dir_all(path)
            .await
            .map_err(|e| Error::io(format!("Failed to delete directory '{}'", path.display()), e))?;

        info!("Deleted directory");
        Ok(())
    }
}

impl Default for DirectoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_DEFINITIONS_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_id() {
        assert!(validate_id("id", "vm-1").is_ok());
        assert!(validate_id("id", "web_01.prod").is_ok());
        assert!(validate_id("id", "").is_err());
        assert!(validate_id("id", "..").is_err());
        assert!(validate_id("id", "a/b").is_err());
        assert!(validate_id("id", "vm 1").is_err());
        assert!(validate_id("id", &"x".repeat(129)).is_err());
    }

    #[test]
    fn test_vm_dir() {
        let store = DirectoryStore::new("/var/lib/vmctl/vms");
        assert_eq!(
            store.vm_dir("vm-123").unwrap(),
            PathBuf::from("/var/lib/vmctl/vms/vm-123")
        );
        assert!(matches!(store.vm_dir("../etc"), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_create_directory_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(tmp.path());
        let dir = tmp.path().join("vm-1");

        store.create_directory(&dir).await.unwrap();
        store.write_document(&dir, DEVICE_DOCUMENT, b"<domain/>").await.unwrap();
        store.create_directory(&dir).await.unwrap();

        assert!(store.directory_exists(&dir).await.unwrap());
        let content = store.read_document(&dir, DEVICE_DOCUMENT).await.unwrap();
        assert_eq!(content, b"<domain/>");
    }

    #[tokio::test]
    async fn test_create_directory_over_file_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(tmp.path());
        let path = tmp.path().join("vm-1");
        std::fs::write(&path, b"not a directory").unwrap();

        let err = store.create_directory(&path).await.unwrap_err();
        assert!(matches!(err, Error::PathConflict(_)));
        assert!(matches!(
            store.directory_exists(&path).await,
            Err(Error::PathConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_write_document_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(tmp.path());

        store.write_document(tmp.path(), "user-data", b"first").await.unwrap();
        store.write_document(tmp.path(), "user-data", b"second").await.unwrap();

        let content = std::fs::read(tmp.path().join("user-data")).unwrap();
        assert_eq!(content, b"second");
        assert!(!tmp.path().join(".user-data.tmp").exists());
    }

    #[tokio::test]
    async fn test_delete_missing_document_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(tmp.path());

        let err = store.delete_document(tmp.path(), "meta-data").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        store.write_document(tmp.path(), "meta-data", b"x").await.unwrap();
        store.delete_document(tmp.path(), "meta-data").await.unwrap();
        assert!(!tmp.path().join("meta-data").exists());
    }

    #[tokio::test]
    async fn test_delete_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(tmp.path());
        let dir = tmp.path().join("vm-1");

        assert!(matches!(
            store.delete_directory(&dir).await,
            Err(Error::NotFound(_))
        ));

        store.create_directory(&dir).await.unwrap();
        store.write_document(&dir, SNAPSHOT_DOCUMENT, b"{}").await.unwrap();
        store.delete_directory(&dir).await.unwrap();
        assert!(!store.directory_exists(&dir).await.unwrap());
    }
}
