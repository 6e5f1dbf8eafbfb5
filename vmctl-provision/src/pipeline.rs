//! Provisioning pipeline.
//!
//! [`Provisioner`] turns boundary requests into ordered steps across the
//! directory store, the image cache, the disk and ISO tools and the domain
//! control client. A failing step aborts the operation and is reported with
//! the step's name; completed steps are not rolled back.
//!
//! Mutating operations on one VM ID are serialized. Every operation except
//! status reports its outcome to the event sink once it finishes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::cache::{Fetcher, ImageCache, DEFAULT_FRESHNESS};
use crate::cloudinit::{CloudInitBuilder, CloudInitDocuments};
use crate::directory::{
    validate_id, DirectoryStore, DEFAULT_DEFINITIONS_DIR, DEVICE_DOCUMENT, SNAPSHOT_DOCUMENT,
};
use crate::domain::{ControlOp, DomainControl, DEFAULT_GUEST_EXEC_TIMEOUT};
use crate::error::{Error, Result, StepExt};
use crate::events::{EventKind, EventSink, LifecycleEvent, NullSink};
use crate::guest::{ExecRequest, GuestExecOutput};
use crate::keyed_lock::{KeyedGuard, KeyedLocks};
use crate::runner::CommandRunner;
use crate::storage::{DiskTool, DISK_MODE};
use crate::types::{
    CreatedDisk, CreatedVm, DiskRequest, GuestCommand, PasswordReset, ProvisionRequest,
    SnapshotRequest, UpdateReport, VmStatus,
};

/// Program used for password resets inside the guest.
const CHPASSWD: &str = "chpasswd";

/// Everything needed to assemble a [`Provisioner`].
#[derive(Debug, Clone)]
pub struct ProvisionerSettings {
    pub definitions_dir: PathBuf,
    /// `None` disables the template cache.
    pub cache_dir: Option<PathBuf>,
    pub cache_freshness: Duration,
    pub connect_uri: Option<String>,
    pub guest_exec_timeout: Duration,
    /// Guest programs the generic exec operation may run.
    pub exec_allowlist: Vec<String>,
}

impl Default for ProvisionerSettings {
    fn default() -> Self {
        Self {
            definitions_dir: PathBuf::from(DEFAULT_DEFINITIONS_DIR),
            cache_dir: None,
            cache_freshness: DEFAULT_FRESHNESS,
            connect_uri: None,
            guest_exec_timeout: DEFAULT_GUEST_EXEC_TIMEOUT,
            exec_allowlist: Vec::new(),
        }
    }
}

/// Orchestrates VM provisioning, lifecycle and teardown.
pub struct Provisioner {
    store: DirectoryStore,
    cache: ImageCache,
    disks: DiskTool,
    cloud_init: CloudInitBuilder,
    control: Arc<DomainControl>,
    events: Arc<dyn EventSink>,
    exec_allowlist: HashSet<String>,
    vm_locks: KeyedLocks,
}

impl Provisioner {
    pub fn new(
        store: DirectoryStore,
        cache: ImageCache,
        runner: Arc<dyn CommandRunner>,
        control: Arc<DomainControl>,
    ) -> Self {
        Self {
            store,
            cache,
            disks: DiskTool::new(runner.clone()),
            cloud_init: CloudInitBuilder::new(runner),
            control,
            events: Arc::new(NullSink),
            exec_allowlist: HashSet::new(),
            vm_locks: KeyedLocks::new(),
        }
    }

    /// Assemble a provisioner around `runner` and `fetcher`.
    pub fn from_settings(
        settings: ProvisionerSettings,
        runner: Arc<dyn CommandRunner>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let control = DomainControl::new(runner.clone())
            .with_connect_uri(settings.connect_uri)
            .with_exec_timeout(settings.guest_exec_timeout);

        Self::new(
            DirectoryStore::new(settings.definitions_dir),
            ImageCache::new(settings.cache_dir, settings.cache_freshness, fetcher),
            runner,
            Arc::new(control),
        )
        .with_exec_allowlist(settings.exec_allowlist)
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_exec_allowlist(mut self, allowlist: impl IntoIterator<Item = String>) -> Self {
        self.exec_allowlist = allowlist.into_iter().collect();
        self
    }

    fn outcome<T>(id: &str, kind: EventKind, result: &Result<T>, message: &str) -> LifecycleEvent {
        match result {
            Ok(_) => LifecycleEvent::succeeded(id, kind, message),
            Err(e) => LifecycleEvent::failed(id, kind, e.public_message(false))
                .with_data("error", e.kind().as_str()),
        }
    }

    fn report<T>(&self, id: &str, kind: EventKind, result: &Result<T>, message: &str) {
        self.events.notify(Self::outcome(id, kind, result, message));
    }

    /// Directory of an existing VM.
    async fn existing_dir(&self, vm_id: &str) -> Result<PathBuf> {
        let dir = self.store.vm_dir(vm_id)?;
        if !self.store.directory_exists(&dir).await? {
            return Err(Error::NotFound(format!("VM '{}'", vm_id)));
        }
        Ok(dir)
    }

    /// Take the VM's lock, then confirm the VM still exists.
    ///
    /// Existence is checked under the lock so an operation queued behind a
    /// delete fails with `NotFound` instead of acting on a removed VM.
    async fn lock_existing(&self, vm_id: &str) -> Result<(PathBuf, KeyedGuard)> {
        self.store.vm_dir(vm_id)?;
        let guard = self.vm_locks.lock(vm_id).await;
        let dir = self.existing_dir(vm_id).await?;
        Ok((dir, guard))
    }

    /// Store the non-empty documents and remove the ones now empty.
    async fn sync_documents(&self, dir: &Path, documents: &CloudInitDocuments) -> Result<()> {
        for (name, body) in documents.entries() {
            if body.is_empty() {
                match self.store.delete_document(dir, name).await {
                    Ok(()) | Err(Error::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            } else {
                self.store.write_document(dir, name, body.as_bytes()).await?;
            }
        }
        Ok(())
    }

    /// Documents currently stored in `dir`.
    async fn load_documents(&self, dir: &Path) -> Result<CloudInitDocuments> {
        let mut documents = CloudInitDocuments::default();
        for (name, slot) in [
            ("meta-data", &mut documents.meta_data),
            ("vendor-data", &mut documents.vendor_data),
            ("user-data", &mut documents.user_data),
            ("network-config", &mut documents.network_config),
        ] {
            match self.store.read_document(dir, name).await {
                Ok(bytes) => *slot = String::from_utf8_lossy(&bytes).into_owned(),
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(documents)
    }

    async fn write_snapshot(&self, dir: &Path, request: &ProvisionRequest) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(request)?;
        self.store.write_document(dir, SNAPSHOT_DOCUMENT, &bytes).await
    }

    async fn read_snapshot(&self, dir: &Path) -> Result<ProvisionRequest> {
        let bytes = self.store.read_document(dir, SNAPSHOT_DOCUMENT).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    // =========================================================================
    // Create / Update / Delete
    // =========================================================================

    /// Provision a new VM and register its domain.
    #[instrument(skip(self, request), fields(vm_id = %request.id))]
    pub async fn create(&self, request: ProvisionRequest) -> Result<CreatedVm> {
        let result = self.create_steps(&request).await;
        self.report(&request.id, EventKind::Created, &result, "VM created");
        result
    }

    async fn create_steps(&self, request: &ProvisionRequest) -> Result<CreatedVm> {
        request.validate_for_create()?;
        let locator = request
            .template_url()
            .ok_or_else(|| Error::Validation("missing 'template.imageURL'".to_string()))?;
        let dir = self.store.vm_dir(&request.id)?;
        let _guard = self.vm_locks.lock(&request.id).await;

        info!(path = %dir.display(), "Creating VM");

        self.store
            .create_directory(&dir)
            .await
            .step("create VM directory")?;
        self.write_snapshot(&dir, request)
            .await
            .step("write request snapshot")?;
        self.store
            .write_document(&dir, DEVICE_DOCUMENT, request.xml_config.as_bytes())
            .await
            .step("write device definition")?;
        self.sync_documents(&dir, &request.cloud_init)
            .await
            .step("write cloud-init documents")?;
        self.cloud_init
            .build(&dir, &request.cloud_init)
            .await
            .step("build cloud-init image")?;

        let disk = &request.disks[0];
        if let Some(storage) = &disk.path {
            self.store
                .create_directory(storage)
                .await
                .step("create disk directory")?;
        }
        let image = disk.image_path(&dir);
        self.cache
            .resolve(locator, &image, DISK_MODE)
            .await
            .step("fetch template image")?;
        self.disks
            .resize(&image, disk.capacity)
            .await
            .step("resize disk")?;

        self.control
            .define(&dir.join(DEVICE_DOCUMENT))
            .await
            .step("define domain")?;

        info!("VM created");
        Ok(CreatedVm {
            id: request.id.clone(),
            path: dir,
        })
    }

    /// Apply a changed request to an existing VM.
    ///
    /// Disks only grow and recorded disks are never forgotten. The domain is
    /// not redefined; the new device definition takes effect the next time
    /// the domain is defined.
    #[instrument(skip(self, request), fields(vm_id = %vm_id))]
    pub async fn update(&self, vm_id: &str, request: ProvisionRequest) -> Result<UpdateReport> {
        let result = self.update_steps(vm_id, request).await;
        self.report(vm_id, EventKind::Updated, &result, "VM updated");
        result
    }

    async fn update_steps(&self, vm_id: &str, mut request: ProvisionRequest) -> Result<UpdateReport> {
        if request.id.is_empty() {
            request.id = vm_id.to_string();
        } else if request.id != vm_id {
            return Err(Error::Validation(format!(
                "request id '{}' does not match '{}'",
                request.id, vm_id
            )));
        }
        request.validate_for_update()?;

        let (dir, _guard) = self.lock_existing(vm_id).await?;

        let previous = self.read_snapshot(&dir).await.step("read request snapshot")?;
        let mut report = UpdateReport {
            id: vm_id.to_string(),
            ..Default::default()
        };

        // Recorded disks survive every update: an omitted disk keeps its
        // record and a disk keeps the storage path it was created in.
        for old in &previous.disks {
            if !request.disks.iter().any(|d| d.id == old.id) {
                debug!(disk_id = old.id, "Keeping recorded disk omitted from update");
                request.disks.push(old.clone());
            }
        }
        request.disks.sort_by_key(|d| d.id);

        for disk in request.disks.iter_mut() {
            let Some(old) = previous.disks.iter().find(|d| d.id == disk.id) else {
                continue;
            };
            if disk.path != old.path {
                warn!(disk_id = disk.id, "Ignoring storage path change for existing disk");
                disk.path = old.path.clone();
            }
            if disk.capacity > old.capacity {
                self.disks
                    .resize(&old.image_path(&dir), disk.capacity)
                    .await
                    .step("resize disk")?;
                report.resized_disks.push(disk.id);
            } else if disk.capacity < old.capacity {
                warn!(disk_id = disk.id, from = old.capacity, to = disk.capacity, "Ignoring disk shrink");
                disk.capacity = old.capacity;
            }
        }

        self.write_snapshot(&dir, &request)
            .await
            .step("write request snapshot")?;
        self.store
            .write_document(&dir, DEVICE_DOCUMENT, request.xml_config.as_bytes())
            .await
            .step("write device definition")?;
        self.sync_documents(&dir, &request.cloud_init)
            .await
            .step("write cloud-init documents")?;

        if request.cloud_init != previous.cloud_init {
            self.cloud_init
                .build(&dir, &request.cloud_init)
                .await
                .step("build cloud-init image")?;
            report.customization_rebuilt = true;
        }

        info!(resized = report.resized_disks.len(), "VM updated");
        Ok(report)
    }

    /// Power off, deregister and remove a VM.
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn delete(&self, vm_id: &str) -> Result<()> {
        let result = self.delete_steps(vm_id).await;
        self.report(vm_id, EventKind::Deleted, &result, "VM deleted");
        result
    }

    async fn delete_steps(&self, vm_id: &str) -> Result<()> {
        let (dir, _guard) = self.lock_existing(vm_id).await?;

        self.control.destroy(vm_id).await.step("power off domain")?;
        self.control.undefine(vm_id).await.step("undefine domain")?;
        self.store
            .delete_directory(&dir)
            .await
            .step("delete VM directory")?;

        info!("VM deleted");
        Ok(())
    }

    // =========================================================================
    // Power
    // =========================================================================

    async fn lifecycle(&self, vm_id: &str, op: ControlOp, kind: EventKind, message: &str) -> Result<()> {
        let result = async {
            let (_, _guard) = self.lock_existing(vm_id).await?;
            self.control.power(op, vm_id).await
        }
        .await;
        self.report(vm_id, kind, &result, message);
        result
    }

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn start(&self, vm_id: &str) -> Result<()> {
        self.lifecycle(vm_id, ControlOp::Start, EventKind::Started, "VM started")
            .await
    }

    /// Graceful shutdown.
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn stop(&self, vm_id: &str) -> Result<()> {
        self.lifecycle(vm_id, ControlOp::Shutdown, EventKind::Stopped, "VM shutdown requested")
            .await
    }

    /// Hard power-off.
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn power_off(&self, vm_id: &str) -> Result<()> {
        self.lifecycle(vm_id, ControlOp::Destroy, EventKind::PoweredOff, "VM powered off")
            .await
    }

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn reboot(&self, vm_id: &str) -> Result<()> {
        self.lifecycle(vm_id, ControlOp::Reboot, EventKind::Rebooted, "VM rebooted")
            .await
    }

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn reset(&self, vm_id: &str) -> Result<()> {
        self.lifecycle(vm_id, ControlOp::Reset, EventKind::Reset, "VM reset")
            .await
    }

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn pause(&self, vm_id: &str) -> Result<()> {
        self.lifecycle(vm_id, ControlOp::Suspend, EventKind::Paused, "VM paused")
            .await
    }

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn resume(&self, vm_id: &str) -> Result<()> {
        self.lifecycle(vm_id, ControlOp::Resume, EventKind::Resumed, "VM resumed")
            .await
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Current domain state, optionally with guest agent details.
    ///
    /// Guest details are only collected for a running domain whose agent
    /// answers a ping; each field is fetched independently and omitted when
    /// it fails.
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn status(&self, vm_id: &str, include_guest: bool) -> Result<VmStatus> {
        self.existing_dir(vm_id).await?;
        let status = self
            .control
            .status(vm_id)
            .await
            .step("query domain status")?;

        let remote_state = if include_guest && status.state.is_running() {
            match self.control.guest_ping(vm_id).await {
                Ok(()) => Some(self.control.guest_info(vm_id).await),
                Err(e) => {
                    debug!(error = %e, "Guest agent not available");
                    None
                }
            }
        } else {
            None
        };

        Ok(VmStatus {
            id: vm_id.to_string(),
            status: status.raw,
            state: status.state,
            remote_state,
        })
    }

    // =========================================================================
    // Guest
    // =========================================================================

    /// Run an allow-listed program in the guest.
    #[instrument(skip(self, command), fields(vm_id = %vm_id, path = %command.path))]
    pub async fn guest_exec(&self, vm_id: &str, command: GuestCommand) -> Result<GuestExecOutput> {
        let result = self.guest_exec_steps(vm_id, &command).await;
        self.report(vm_id, EventKind::GuestCommand, &result, "Guest command executed");
        result
    }

    async fn guest_exec_steps(&self, vm_id: &str, command: &GuestCommand) -> Result<GuestExecOutput> {
        if !self.exec_allowlist.contains(&command.path) {
            return Err(Error::Validation(format!(
                "guest command '{}' is not allowed",
                command.path
            )));
        }
        let request = ExecRequest::new(&command.path, &command.args, command.capture_output)?;
        let (_, _guard) = self.lock_existing(vm_id).await?;

        self.control
            .guest_exec(vm_id, &request)
            .await
            .step("run guest command")
    }

    /// Set a guest account password through `chpasswd`.
    ///
    /// Credentials travel as stdin of the guest process, never as arguments.
    #[instrument(skip(self, reset), fields(vm_id = %vm_id, user = %reset.user))]
    pub async fn reset_password(&self, vm_id: &str, reset: PasswordReset) -> Result<()> {
        let result = self.reset_password_steps(vm_id, &reset).await;
        self.report(vm_id, EventKind::PasswordReset, &result, "Password reset");
        result
    }

    async fn reset_password_steps(&self, vm_id: &str, reset: &PasswordReset) -> Result<()> {
        reset.validate()?;
        let (_, _guard) = self.lock_existing(vm_id).await?;

        let request = ExecRequest::new(CHPASSWD, &[], true)?.with_input(reset.chpasswd_line().as_bytes());
        let output = self
            .control
            .guest_exec(vm_id, &request)
            .await
            .step("reset guest password")?;

        if output.exit_code != Some(0) {
            return Err(Error::ExternalCommand {
                command: format!("guest {}", CHPASSWD),
                status: output.exit_code,
                stderr: output.stderr,
            })
            .step("reset guest password");
        }

        info!("Guest password reset");
        Ok(())
    }

    /// Store new customization documents and rebuild the customization image.
    ///
    /// Only non-empty documents are written; others keep their stored content.
    #[instrument(skip(self, documents), fields(vm_id = %vm_id))]
    pub async fn write_customization(&self, vm_id: &str, documents: CloudInitDocuments) -> Result<PathBuf> {
        let result = self.write_customization_steps(vm_id, &documents).await;
        self.report(vm_id, EventKind::CustomizationUpdated, &result, "cloud-init drive generated");
        result
    }

    async fn write_customization_steps(&self, vm_id: &str, documents: &CloudInitDocuments) -> Result<PathBuf> {
        let (dir, _guard) = self.lock_existing(vm_id).await?;

        for (name, body) in documents.entries() {
            if !body.is_empty() {
                self.store
                    .write_document(&dir, name, body.as_bytes())
                    .await
                    .step("write cloud-init documents")?;
            }
        }

        let effective = self
            .load_documents(&dir)
            .await
            .step("read cloud-init documents")?;
        let iso = self
            .cloud_init
            .build(&dir, &effective)
            .await
            .step("build cloud-init image")?;

        // Keep the stored request in line so a later update compares against
        // what is actually on disk.
        match self.read_snapshot(&dir).await {
            Ok(mut snapshot) => {
                snapshot.cloud_init = effective;
                self.write_snapshot(&dir, &snapshot)
                    .await
                    .step("write request snapshot")?;
            }
            Err(Error::NotFound(_)) => debug!("No request snapshot to refresh"),
            Err(e) => return Err(e).step("read request snapshot"),
        }

        Ok(iso)
    }

    // =========================================================================
    // Disks
    // =========================================================================

    /// Materialize a template as `<path>/<id>.img` and grow it.
    #[instrument(skip(self, request), fields(disk_id = request.id, path = %request.path.display()))]
    pub async fn create_disk(&self, request: DiskRequest) -> Result<CreatedDisk> {
        let image = request.image_path();
        let result = self.create_disk_steps(&request, &image).await;
        self.report(&image.display().to_string(), EventKind::DiskCreated, &result, "Disk created");
        result
    }

    async fn create_disk_steps(&self, request: &DiskRequest, image: &Path) -> Result<CreatedDisk> {
        request.validate()?;
        let _guard = self.vm_locks.lock(&format!("disk:{}", image.display())).await;

        self.store
            .create_directory(&request.path)
            .await
            .step("create disk directory")?;
        self.cache
            .resolve(&request.image_url, image, DISK_MODE)
            .await
            .step("fetch template image")?;
        self.disks
            .resize(image, request.size)
            .await
            .step("resize disk")?;

        info!("Disk created");
        Ok(CreatedDisk {
            id: request.id,
            path: image.to_path_buf(),
        })
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    async fn snapshot_op(
        &self,
        vm_id: &str,
        name: &str,
        op: ControlOp,
        kind: EventKind,
        quiesce: bool,
    ) -> Result<()> {
        let result = async {
            validate_id("snapshot name", name)?;
            let (_, _guard) = self.lock_existing(vm_id).await?;
            match op {
                ControlOp::SnapshotCreate => self
                    .control
                    .snapshot_create(vm_id, name, quiesce)
                    .await
                    .step("create snapshot"),
                ControlOp::SnapshotRevert => self
                    .control
                    .snapshot_revert(vm_id, name)
                    .await
                    .step("revert snapshot"),
                _ => self
                    .control
                    .snapshot_delete(vm_id, name)
                    .await
                    .step("delete snapshot"),
            }
        }
        .await;

        let verb = match op {
            ControlOp::SnapshotCreate => "created",
            ControlOp::SnapshotRevert => "reverted",
            _ => "deleted",
        };
        let message = format!("Snapshot '{}' {}", name, verb);
        self.events
            .notify(Self::outcome(vm_id, kind, &result, &message).with_data("snapshot", name));
        result
    }

    #[instrument(skip(self, request), fields(vm_id = %vm_id, snapshot = %request.name))]
    pub async fn create_snapshot(&self, vm_id: &str, request: SnapshotRequest) -> Result<()> {
        self.snapshot_op(
            vm_id,
            &request.name,
            ControlOp::SnapshotCreate,
            EventKind::SnapshotCreated,
            request.quiesce,
        )
        .await
    }

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn revert_snapshot(&self, vm_id: &str, name: &str) -> Result<()> {
        self.snapshot_op(vm_id, name, ControlOp::SnapshotRevert, EventKind::SnapshotReverted, false)
            .await
    }

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn delete_snapshot(&self, vm_id: &str, name: &str) -> Result<()> {
        self.snapshot_op(vm_id, name, ControlOp::SnapshotDelete, EventKind::SnapshotDeleted, false)
            .await
    }
}
