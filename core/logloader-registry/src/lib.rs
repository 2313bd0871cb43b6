//! Persistent log registry for logloader.
//!
//! Tracks one record per log ever seen on the device, the destinations each
//! log has been uploaded to, and a denylist of logs whose upload was
//! permanently rejected. Backed by a single SQLite file.
//!
//! Every operation is a single statement (or a read followed by a single
//! write) executed under the connection lock, so concurrent coordinators
//! never observe a half-applied update.

mod error;
mod registry;

pub use error::{RegistryError, RegistryResult};
pub use registry::LogRegistry;
