//! `builtin:echo`: print a line of text.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Deserialize;

use super::{Builtin, bind, coerce_string};
use crate::engine::StepOutputs;
use crate::inputs::With;

pub(super) struct Echo;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EchoRequest {
    #[serde(deserialize_with = "coerce_string")]
    text: String,
}

#[async_trait]
impl Builtin for Echo {
    fn required(&self) -> &'static [&'static str] {
        &["text"]
    }

    async fn execute(&self, with: &With) -> anyhow::Result<StepOutputs> {
        let request: EchoRequest = bind("echo", with)?;

        anstream::println!("{}", request.text);

        Ok(IndexMap::from([(
            "text".to_string(),
            serde_json::Value::String(request.text),
        )]))
    }
}
