use std::sync::Once;

use tempfile::TempDir;

use crate::storage::{FileStore, StorageError};

static TRACING: Once = Once::new();

/// Install a tracing subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`; safe to call from every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Create a `FileStore` over a fresh temporary directory.
///
/// The directory is removed when the returned `TempDir` is dropped, so keep
/// it alive for as long as the store is used.
pub async fn new_test_store() -> Result<(TempDir, FileStore), StorageError> {
    let dir = tempfile::tempdir()?;
    let store = FileStore::open(dir.path()).await?;
    Ok((dir, store))
}
