//! Runs registry calls off the async executor.

use crate::error::SyncResult;
use logloader_registry::{LogRegistry, RegistryResult};

/// Runs `f` against the registry on the blocking thread pool.
pub(crate) async fn with_registry<T, F>(registry: &LogRegistry, f: F) -> SyncResult<T>
where
    F: FnOnce(&LogRegistry) -> RegistryResult<T> + Send + 'static,
    T: Send + 'static,
{
    let registry = registry.clone();
    let result = tokio::task::spawn_blocking(move || f(&registry)).await?;
    Ok(result?)
}
