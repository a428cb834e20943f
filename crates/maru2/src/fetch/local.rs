//! The `file:` fetcher.
//!
//! Local files bypass the content store entirely: the file on disk is the
//! source of truth, so caching it would only let it go stale.

use async_trait::async_trait;

use super::{Fetch, FetchError};
use crate::uses::Uses;

pub(super) struct LocalFetcher;

#[async_trait]
impl Fetch for LocalFetcher {
    async fn fetch(&self, uses: &Uses) -> Result<Vec<u8>, FetchError> {
        let Uses::File(file) = uses else {
            return Err(FetchError::UnsupportedScheme(uses.to_string()));
        };

        match tokio::fs::read(&file.path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FetchError::NotFound(uses.without_task().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
