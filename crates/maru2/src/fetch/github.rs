//! The `pkg:github` fetcher, speaking the contents REST API.

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use url::Url;

use super::http::read_body;
use super::{Fetch, FetchError};
use crate::uses::Uses;

const API_VERSION: &str = "2022-11-28";

/// The env var consulted for a bearer token when no alias names one.
const DEFAULT_TOKEN_ENV: &str = "GITHUB_TOKEN";

pub(super) struct GithubFetcher {
    client: reqwest::Client,
}

impl GithubFetcher {
    pub(super) fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetch for GithubFetcher {
    async fn fetch(&self, uses: &Uses) -> Result<Vec<u8>, FetchError> {
        let Uses::Pkg(pkg) = uses else {
            return Err(FetchError::UnsupportedScheme(uses.to_string()));
        };

        // Enterprise hosts (from an alias base-url) serve the API under
        // `/api/v3`; github.com serves it from a dedicated subdomain.
        let api = match &pkg.base_url {
            Some(base) => base.join("api/v3/")?,
            None => Url::parse("https://api.github.com/")?,
        };

        let mut url = api.join(&format!(
            "repos/{}/{}/contents/{}",
            pkg.namespace, pkg.name, pkg.subpath
        ))?;
        url.query_pairs_mut().append_pair("ref", &pkg.version);

        let mut request = self
            .client
            .get(url)
            .header(ACCEPT, "application/vnd.github.raw+json")
            .header("X-GitHub-Api-Version", API_VERSION);

        let token_env = pkg.token_from_env.as_deref().unwrap_or(DEFAULT_TOKEN_ENV);
        if let Ok(token) = std::env::var(token_env)
            && !token.is_empty()
        {
            request = request.bearer_auth(token);
        }

        read_body(uses, request.send().await?).await
    }
}
