//! Cloud-init NoCloud customization image.
//!
//! The guest customization documents are stored as plain files in the VM
//! directory and packed into `cloud-init.iso` (volume id `cidata`), which the
//! device definition attaches as a CD-ROM. Only non-empty documents are
//! stored or packed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::error::Result;
use crate::runner::CommandRunner;

/// File name of the customization image.
pub const CLOUD_INIT_ISO: &str = "cloud-init.iso";

/// NoCloud volume label.
pub const VOLUME_ID: &str = "cidata";

/// Input used when no document is present, so the tool still emits an image.
const EMPTY_INPUT: &str = "/dev/null";

/// The four NoCloud documents, as supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudInitDocuments {
    pub meta_data: String,
    pub vendor_data: String,
    pub user_data: String,
    pub network_config: String,
}

impl CloudInitDocuments {
    /// Documents paired with their file names, in a fixed order.
    pub fn entries(&self) -> [(&'static str, &str); 4] {
        [
            ("meta-data", self.meta_data.as_str()),
            ("vendor-data", self.vendor_data.as_str()),
            ("user-data", self.user_data.as_str()),
            ("network-config", self.network_config.as_str()),
        ]
    }

    /// File names of documents with content.
    pub fn present(&self) -> Vec<&'static str> {
        self.entries()
            .into_iter()
            .filter(|(_, body)| !body.is_empty())
            .map(|(name, _)| name)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.present().is_empty()
    }
}

/// Builds the customization image with `genisoimage`.
pub struct CloudInitBuilder {
    runner: Arc<dyn CommandRunner>,
    program: String,
}

impl CloudInitBuilder {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            program: "genisoimage".to_string(),
        }
    }

    /// Pack the non-empty `documents` already written in `dir` into
    /// `dir/cloud-init.iso`.
    #[instrument(skip(self, documents), fields(dir = %dir.display()))]
    pub async fn build(&self, dir: &Path, documents: &CloudInitDocuments) -> Result<PathBuf> {
        let iso_path = dir.join(CLOUD_INIT_ISO);

        let mut args = vec![
            "-output".to_string(),
            iso_path.display().to_string(),
            "-volid".to_string(),
            VOLUME_ID.to_string(),
            "-joliet".to_string(),
            "-rock".to_string(),
        ];

        let present = documents.present();
        if present.is_empty() {
            args.push(EMPTY_INPUT.to_string());
        } else {
            args.extend(present.iter().map(|name| dir.join(name).display().to_string()));
        }

        self.runner.run(&self.program, &args).await?;

        info!(documents = present.len(), "Customization image built");
        Ok(iso_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRunner;

    #[test]
    fn test_documents_deserialize_camel_case() {
        let docs: CloudInitDocuments =
            serde_json::from_str(r##"{"userData":"#cloud-config\n","metaData":"instance-id: vm-1"}"##)
                .unwrap();
        assert_eq!(docs.user_data, "#cloud-config\n");
        assert_eq!(docs.present(), vec!["meta-data", "user-data"]);
        assert!(!docs.is_empty());
        assert!(CloudInitDocuments::default().is_empty());
    }

    #[tokio::test]
    async fn test_build_packs_present_documents() {
        let runner = Arc::new(MockRunner::new());
        let builder = CloudInitBuilder::new(runner.clone());
        let docs = CloudInitDocuments {
            user_data: "#cloud-config".to_string(),
            network_config: "version: 2".to_string(),
            ..Default::default()
        };

        let iso = builder.build(Path::new("/vms/vm-1"), &docs).await.unwrap();
        assert_eq!(iso, PathBuf::from("/vms/vm-1/cloud-init.iso"));

        let calls = runner.invocations();
        let call = &calls[0];
        assert_eq!(call.program, "genisoimage");
        assert_eq!(
            call.args,
            vec![
                "-output",
                "/vms/vm-1/cloud-init.iso",
                "-volid",
                "cidata",
                "-joliet",
                "-rock",
                "/vms/vm-1/user-data",
                "/vms/vm-1/network-config",
            ]
        );
    }

    #[tokio::test]
    async fn test_build_without_documents_uses_placeholder() {
        let runner = Arc::new(MockRunner::new());
        let builder = CloudInitBuilder::new(runner.clone());

        builder
            .build(Path::new("/vms/vm-2"), &CloudInitDocuments::default())
            .await
            .unwrap();

        let calls = runner.invocations();
        let call = &calls[0];
        assert_eq!(call.args.last().map(String::as_str), Some("/dev/null"));
    }
}
