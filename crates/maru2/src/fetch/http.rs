//! The plain `http(s):` fetcher.

use async_trait::async_trait;
use reqwest::StatusCode;

use super::{Fetch, FetchError};
use crate::uses::Uses;

pub(super) struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub(super) fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, uses: &Uses) -> Result<Vec<u8>, FetchError> {
        let Uses::Remote(remote) = uses else {
            return Err(FetchError::UnsupportedScheme(uses.to_string()));
        };

        let response = self.client.get(remote.url.clone()).send().await?;
        read_body(uses, response).await
    }
}

/// Shared status handling for every network fetcher: 200 → bytes, 404 →
/// not-found, anything else non-2xx → transport error with the status line.
/// Redirects never reach here; the client follows them (bounded).
pub(super) async fn read_body(
    uses: &Uses,
    response: reqwest::Response,
) -> Result<Vec<u8>, FetchError> {
    match response.status() {
        StatusCode::NOT_FOUND => Err(FetchError::NotFound(uses.without_task().to_string())),
        status if status.is_success() => Ok(response.bytes().await?.to_vec()),
        status => Err(FetchError::Transport {
            reference: uses.without_task().to_string(),
            status: status.to_string(),
        }),
    }
}
