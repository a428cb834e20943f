//! `builtin:fetch`: perform an HTTP request and expose the response.

use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Deserialize;

use super::{Builtin, bind, coerce_string};
use crate::engine::StepOutputs;
use crate::inputs::With;

pub(super) struct Fetch;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FetchRequest {
    #[serde(deserialize_with = "coerce_string")]
    url: String,

    #[serde(default = "default_method")]
    method: String,

    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,

    #[serde(default)]
    headers: IndexMap<String, String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[async_trait]
impl Builtin for Fetch {
    fn required(&self) -> &'static [&'static str] {
        &["url"]
    }

    fn optional(&self) -> &'static [&'static str] {
        &["method", "timeout", "headers"]
    }

    async fn execute(&self, with: &With) -> anyhow::Result<StepOutputs> {
        let request: FetchRequest = bind("fetch", with)?;

        let client = reqwest::Client::builder()
            .timeout(request.timeout.unwrap_or(crate::fetch::DEFAULT_TIMEOUT))
            .build()?;

        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())?;
        let mut req = client.request(method, &request.url);
        for (name, value) in &request.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        // Non-2xx statuses are results, not errors: workflows branch on
        // `from("id", "status")`.
        let response = req.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        Ok(IndexMap::from([
            ("status".to_string(), serde_json::Value::from(status)),
            ("body".to_string(), serde_json::Value::String(body)),
        ]))
    }
}
