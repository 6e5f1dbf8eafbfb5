//! # vmctl Provision
//!
//! Single-host VM provisioning on top of `virsh`, `qemu-img` and
//! `genisoimage`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Provisioner                      │
//! │  (create, update, delete, power, status, guest ...) │
//! └──────┬───────────┬───────────┬───────────┬──────────┘
//!        ▼           ▼           ▼           ▼
//! ┌────────────┐ ┌─────────┐ ┌─────────┐ ┌───────────────┐
//! │ Directory  │ │  Image  │ │ Disk /  │ │ DomainControl │
//! │   Store    │ │  Cache  │ │ ISO     │ │    (virsh)    │
//! └────────────┘ └────┬────┘ └────┬────┘ └───────┬───────┘
//!                     ▼           └──────┬───────┘
//!                  Fetcher          CommandRunner
//! ```
//!
//! The filesystem and the hypervisor are the only state. Each VM owns
//! `<definitions dir>/<id>` holding `server.xml`, `server.json`, the
//! cloud-init documents, `cloud-init.iso` and usually its disk images.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vmctl_provision::{HttpFetcher, Provisioner, ProvisionerSettings, SystemRunner};
//!
//! let provisioner = Provisioner::from_settings(
//!     ProvisionerSettings::default(),
//!     Arc::new(SystemRunner::default()),
//!     Arc::new(HttpFetcher::new(std::time::Duration::from_secs(1800))?),
//! );
//! let created = provisioner.create(request).await?;
//! provisioner.start(&created.id).await?;
//! ```

pub mod cache;
pub mod cloudinit;
pub mod directory;
pub mod domain;
pub mod error;
pub mod events;
pub mod guest;
pub mod keyed_lock;
pub mod mock;
pub mod pipeline;
pub mod runner;
pub mod storage;
pub mod types;

pub use cache::{canonical_name, entry_name, parse_freshness, Fetcher, HttpFetcher, ImageCache};
pub use cloudinit::{CloudInitBuilder, CloudInitDocuments};
pub use directory::{validate_id, DirectoryStore};
pub use domain::{ControlOp, DomainControl, DomainState, DomainStatus, FailurePolicy};
pub use error::{Error, ErrorKind, Result};
pub use events::{EventKind, EventSink, LifecycleEvent, NullSink, RecordingSink};
pub use guest::{GuestExecOutput, GuestInfo};
pub use keyed_lock::KeyedLocks;
pub use mock::{MockFetcher, MockResponse, MockRunner};
pub use pipeline::{Provisioner, ProvisionerSettings};
pub use runner::{CommandRunner, SystemRunner};
pub use storage::DiskTool;
pub use types::*;
