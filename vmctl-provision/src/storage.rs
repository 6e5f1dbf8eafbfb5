//! Disk image operations via `qemu-img`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, instrument};

use crate::error::{Error, Result};
use crate::runner::CommandRunner;

/// Permission bits for VM disk images.
pub const DISK_MODE: u32 = 0o660;

/// File name of the image backing disk `disk_id`.
pub fn disk_file_name(disk_id: u64) -> String {
    format!("{}.img", disk_id)
}

/// Path of disk `disk_id` inside `dir`.
pub fn disk_path(dir: &Path, disk_id: u64) -> PathBuf {
    dir.join(disk_file_name(disk_id))
}

/// Wrapper around `qemu-img`.
pub struct DiskTool {
    runner: Arc<dyn CommandRunner>,
    program: String,
}

impl DiskTool {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            program: "qemu-img".to_string(),
        }
    }

    /// Set the virtual size of the image at `path` to `capacity_gib` GiB.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn resize(&self, path: &Path, capacity_gib: u64) -> Result<()> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(Error::NotFound(format!("disk image '{}'", path.display())));
        }

        let args = vec![
            "resize".to_string(),
            path.display().to_string(),
            format!("{}G", capacity_gib),
        ];
        self.runner.run(&self.program, &args).await?;

        info!(capacity_gib, "Disk resized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockResponse, MockRunner};

    #[tokio::test]
    async fn test_resize_arguments() {
        let tmp = tempfile::tempdir().unwrap();
        let image = disk_path(tmp.path(), 0);
        std::fs::write(&image, b"img").unwrap();

        let runner = Arc::new(MockRunner::new());
        let tool = DiskTool::new(runner.clone());
        tool.resize(&image, 20).await.unwrap();

        let calls = runner.calls_to("qemu-img", "resize");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args[1], image.display().to_string());
        assert_eq!(calls[0].args[2], "20G");
    }

    #[tokio::test]
    async fn test_resize_missing_image() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        let tool = DiskTool::new(runner.clone());

        let err = tool.resize(&tmp.path().join("7.img"), 10).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(runner.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_resize_failure_propagates() {
        let tmp = tempfile::tempdir().unwrap();
        let image = disk_path(tmp.path(), 1);
        std::fs::write(&image, b"img").unwrap();

        let runner = Arc::new(MockRunner::new());
        runner.respond("qemu-img", "resize", MockResponse::failure("shrinking not allowed"));
        let tool = DiskTool::new(runner);

        let err = tool.resize(&image, 1).await.unwrap_err();
        assert!(matches!(err, Error::ExternalCommand { .. }));
    }
}
