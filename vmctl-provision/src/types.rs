//! Request and result types of the provisioning operations.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cloudinit::CloudInitDocuments;
use crate::directory::validate_id;
use crate::domain::DomainState;
use crate::error::{Error, Result};
use crate::guest::GuestInfo;
use crate::storage::disk_file_name;

/// Template image reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateSpec {
    #[serde(rename = "imageURL", alias = "imageUrl", default)]
    pub image_url: String,
}

/// Declared disk of a VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskSpec {
    pub id: u64,
    /// Size in GiB.
    pub capacity: u64,
    /// Storage directory; defaults to the VM directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl DiskSpec {
    pub fn file_name(&self) -> String {
        disk_file_name(self.id)
    }

    /// Image location, given the VM directory.
    pub fn image_path(&self, vm_dir: &Path) -> PathBuf {
        self.path
            .as_deref()
            .unwrap_or(vm_dir)
            .join(self.file_name())
    }
}

/// Create or update request.
///
/// Fields the service does not interpret are kept in `extra` so the stored
/// snapshot reproduces the caller's request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    #[serde(default)]
    pub id: String,
    /// Device definition (libvirt domain XML).
    #[serde(default)]
    pub xml_config: String,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateSpec>,
    #[serde(default)]
    pub cloud_init: CloudInitDocuments,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProvisionRequest {
    /// Template locator, if one was given.
    pub fn template_url(&self) -> Option<&str> {
        self.template
            .as_ref()
            .map(|t| t.image_url.trim())
            .filter(|url| !url.is_empty())
    }

    /// Checks shared by create and update.
    fn validate_common(&self) -> Result<()> {
        validate_id("id", &self.id)?;
        if self.xml_config.trim().is_empty() {
            return Err(Error::Validation("missing 'xmlConfig'".to_string()));
        }

        let mut seen = HashSet::new();
        for disk in &self.disks {
            if !seen.insert(disk.id) {
                return Err(Error::Validation(format!("duplicate disk id {}", disk.id)));
            }
            if disk.capacity == 0 {
                return Err(Error::Validation(format!(
                    "disk {} must have a capacity of at least 1 GiB",
                    disk.id
                )));
            }
        }
        Ok(())
    }

    pub fn validate_for_create(&self) -> Result<()> {
        self.validate_common()?;
        if self.disks.is_empty() {
            return Err(Error::Validation("at least one disk is required".to_string()));
        }
        if self.template_url().is_none() {
            return Err(Error::Validation("missing 'template.imageURL'".to_string()));
        }
        Ok(())
    }

    pub fn validate_for_update(&self) -> Result<()> {
        self.validate_common()
    }
}

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedVm {
    pub id: String,
    pub path: PathBuf,
}

/// What an update changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReport {
    pub id: String,
    /// Disks that were grown, by id.
    pub resized_disks: Vec<u64>,
    pub customization_rebuilt: bool,
}

/// Status of a VM.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmStatus {
    pub id: String,
    /// Raw `State:` value from the hypervisor.
    pub status: String,
    /// Classified `status`; gates guest agent queries. The wire shape only
    /// carries the raw string.
    #[serde(skip)]
    pub state: DomainState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_state: Option<GuestInfo>,
}

/// Standalone disk creation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskRequest {
    pub id: u64,
    /// Size in GiB.
    pub size: u64,
    /// Directory that receives `<id>.img`.
    pub path: PathBuf,
    #[serde(rename = "image_url", alias = "imageURL", default)]
    pub image_url: String,
}

impl DiskRequest {
    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::Validation("missing 'path'".to_string()));
        }
        if !self.path.is_absolute() {
            return Err(Error::Validation("'path' must be absolute".to_string()));
        }
        if self.size == 0 {
            return Err(Error::Validation("'size' must be at least 1 GiB".to_string()));
        }
        if self.image_url.trim().is_empty() {
            return Err(Error::Validation("missing 'image_url'".to_string()));
        }
        Ok(())
    }

    pub fn image_path(&self) -> PathBuf {
        self.path.join(disk_file_name(self.id))
    }
}

/// Result of a standalone disk creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedDisk {
    pub id: u64,
    pub path: PathBuf,
}

/// Generic guest command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestCommand {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_capture")]
    pub capture_output: bool,
}

fn default_capture() -> bool {
    true
}

/// Guest password reset.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct PasswordReset {
    pub user: String,
    pub password: String,
}

impl PasswordReset {
    pub fn validate(&self) -> Result<()> {
        if self.user.is_empty() || self.password.is_empty() {
            return Err(Error::Validation(
                "'user' and 'password' are required".to_string(),
            ));
        }
        if self.user.contains([':', '\n', '\r', '\0']) {
            return Err(Error::Validation(
                "'user' may not contain ':', newlines or NUL".to_string(),
            ));
        }
        if self.password.contains(['\n', '\r', '\0']) {
            return Err(Error::Validation(
                "'password' may not contain newlines or NUL".to_string(),
            ));
        }
        Ok(())
    }

    /// `chpasswd` input line.
    pub(crate) fn chpasswd_line(&self) -> String {
        format!("{}:{}\n", self.user, self.password)
    }
}

impl std::fmt::Debug for PasswordReset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordReset")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Snapshot creation request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SnapshotRequest {
    pub name: String,
    #[serde(default)]
    pub quiesce: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "id": "vm-1",
            "xmlConfig": "<domain type='kvm'><name>vm-1</name></domain>",
            "disks": [{"id": 0, "capacity": 10}],
            "template": {"imageURL": "https://images.example.com/jammy.qcow2"},
            "cloudInit": {"userData": "#cloud-config\n"},
            "owner": {"team": "platform"}
        })
    }

    #[test]
    fn test_request_keeps_unknown_fields() {
        let request: ProvisionRequest = serde_json::from_value(sample()).unwrap();
        assert_eq!(request.template_url(), Some("https://images.example.com/jammy.qcow2"));
        assert_eq!(request.extra["owner"], json!({"team": "platform"}));

        let back = serde_json::to_value(&request).unwrap();
        assert_eq!(back["owner"], json!({"team": "platform"}));
        assert_eq!(back["template"]["imageURL"], "https://images.example.com/jammy.qcow2");
        assert_eq!(back["cloudInit"]["userData"], "#cloud-config\n");
    }

    #[test]
    fn test_create_validation() {
        let request: ProvisionRequest = serde_json::from_value(sample()).unwrap();
        assert!(request.validate_for_create().is_ok());

        let mut no_disks = request.clone();
        no_disks.disks.clear();
        assert!(no_disks.validate_for_create().is_err());
        assert!(no_disks.validate_for_update().is_ok());

        let mut no_template = request.clone();
        no_template.template = None;
        assert!(no_template.validate_for_create().is_err());

        let mut bad_id = request.clone();
        bad_id.id = "../vm-1".to_string();
        assert!(matches!(bad_id.validate_for_create(), Err(Error::Validation(_))));

        let mut dup = request;
        dup.disks.push(dup.disks[0].clone());
        assert!(dup.validate_for_create().is_err());
    }

    #[test]
    fn test_disk_image_path() {
        let local = DiskSpec { id: 0, capacity: 10, path: None };
        assert_eq!(local.image_path(Path::new("/vms/vm-1")), PathBuf::from("/vms/vm-1/0.img"));

        let remote = DiskSpec { id: 3, capacity: 10, path: Some(PathBuf::from("/mnt/ssd")) };
        assert_eq!(remote.image_path(Path::new("/vms/vm-1")), PathBuf::from("/mnt/ssd/3.img"));
    }

    #[test]
    fn test_password_reset_validation() {
        let ok = PasswordReset { user: "ubuntu".into(), password: "s3cret:x".into() };
        assert!(ok.validate().is_ok());
        assert_eq!(ok.chpasswd_line(), "ubuntu:s3cret:x\n");
        assert!(!format!("{:?}", ok).contains("s3cret"));

        let colon = PasswordReset { user: "root:0".into(), password: "pw".into() };
        assert!(colon.validate().is_err());

        let newline = PasswordReset { user: "root".into(), password: "pw\nroot:pw2".into() };
        assert!(newline.validate().is_err());
    }

    #[test]
    fn test_guest_command_defaults_to_capture() {
        let cmd: GuestCommand = serde_json::from_str(r#"{"path":"/usr/bin/uptime"}"#).unwrap();
        assert!(cmd.capture_output);
        assert!(cmd.args.is_empty());
    }
}
