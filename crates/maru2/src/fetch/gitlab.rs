//! The `pkg:gitlab` fetcher, speaking the raw-file repository API.

use async_trait::async_trait;
use url::Url;

use super::http::read_body;
use super::{Fetch, FetchError};
use crate::uses::Uses;

/// The env var consulted for a token when no alias names one.
const DEFAULT_TOKEN_ENV: &str = "GITLAB_TOKEN";

pub(super) struct GitlabFetcher {
    client: reqwest::Client,
}

impl GitlabFetcher {
    pub(super) fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetch for GitlabFetcher {
    async fn fetch(&self, uses: &Uses) -> Result<Vec<u8>, FetchError> {
        let Uses::Pkg(pkg) = uses else {
            return Err(FetchError::UnsupportedScheme(uses.to_string()));
        };

        let base = match &pkg.base_url {
            Some(base) => base.clone(),
            None => Url::parse("https://gitlab.com/")?,
        };

        // `projects/{ns}%2F{name}/repository/files/{path}/raw`; pushing
        // whole strings as single segments gets the `/`s percent-encoded
        // the way the API wants.
        let mut url = base.join("api/v4/projects/")?;
        {
            let mut segments = url
                .path_segments_mut()
                .expect("http(s) URLs always have path segments");
            segments
                .pop_if_empty()
                .push(&format!("{}/{}", pkg.namespace, pkg.name))
                .push("repository")
                .push("files")
                .push(&pkg.subpath)
                .push("raw");
        }
        url.query_pairs_mut().append_pair("ref", &pkg.version);

        let mut request = self.client.get(url);

        let token_env = pkg.token_from_env.as_deref().unwrap_or(DEFAULT_TOKEN_ENV);
        if let Ok(token) = std::env::var(token_env)
            && !token.is_empty()
        {
            request = request.header("PRIVATE-TOKEN", token);
        }

        read_body(uses, request.send().await?).await
    }
}
