use crate::Result;
use async_trait::async_trait;
use std::path::Path;

/// Sends one finished part file to remote storage.
///
/// Returning `Ok` means the remote copy is complete and the local file may be deleted.
#[async_trait]
pub trait PartUploader: Send + Sync {
    async fn upload_part(&self, path: &Path) -> Result<()>;
}
