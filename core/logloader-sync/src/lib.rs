//! Log synchronization engine for logloader.
//!
//! Pulls flight logs from a device into a local directory and pushes them
//! to one or more log servers, tracking every log in a [`LogRegistry`] so
//! nothing is transferred twice and permanently rejected logs are never
//! retried.
//!
//! ## Components
//!
//! - **Device link**: lists logs, transfers one log at a time, reports busy
//! - **Pause gate**: suspends all transfers while the device is busy
//! - **Download coordinator**: reconciles the device listing into the registry
//!   and downloads pending logs, most recent first
//! - **Upload coordinator**: one per destination; uploads downloaded logs and
//!   denylists logs the server refuses
//! - **Scheduler**: [`LogLoader`] runs all of the above until shutdown
//!
//! [`LogRegistry`]: logloader_registry::LogRegistry

mod blocking;
pub mod config;
pub mod destination;
pub mod device;
pub mod download;
mod error;
pub mod gate;
pub mod scheduler;
pub mod upload;

pub use config::{DeviceConfig, LoaderConfig, PolicyConfig, TimingConfig};
pub use destination::{DestinationConfig, HttpDestination, UploadDestination, UploadForm, UploadOutcome};
pub use device::{DeviceLink, MountedStorageLink, Transfer, TransferEvent, TransferReporter};
pub use download::{CycleReport, DownloadCoordinator, DownloadSettings};
pub use error::{SyncError, SyncResult};
pub use gate::{GateHandle, GateState, PauseGate};
pub use scheduler::{sleep_or_shutdown, LogLoader, Schedule};
pub use upload::{PassReport, UploadAttempt, UploadCoordinator};
