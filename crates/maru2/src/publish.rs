//! The publisher: close a workflow's dependency graph, then pack every
//! workflow as a layer of an OCI artifact and push it.

use std::collections::BTreeMap;

use anyhow::{Context as _, anyhow, bail};
use camino::Utf8PathBuf;
use indexmap::IndexMap;
use maru2_models::Alias;
use oci_client::Reference;
use oci_client::client::{Client, Config, ImageLayer};
use oci_client::manifest::OciImageManifest;
use oci_client::secrets::RegistryAuth;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::fetch::{FetchPolicy, Service};
use crate::store::Store;
use crate::uses::{Uses, resolve};

/// Media type of individual workflow layers.
pub const WORKFLOW_MEDIA_TYPE: &str = "application/vnd.maru2.workflow.v1+yaml";

/// Artifact type of a published workflow collection.
pub const COLLECTION_ARTIFACT_TYPE: &str = "application/vnd.maru2.collection.v1";

const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";
const EMPTY_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.empty.v1+json";

/// Publishes one or more entrypoint workflows, plus their transitive
/// dependency closure, to `destination` (e.g. `ghcr.io/acme/tasks:v1`).
pub async fn publish(
    cancel: &CancellationToken,
    entrypoints: &[String],
    destination: &str,
    aliases: IndexMap<String, Alias>,
) -> anyhow::Result<()> {
    if entrypoints.is_empty() {
        bail!("at least one entrypoint is required");
    }

    // A scratch store scoped to this publish; `always` so every dependency
    // is fetched fresh.
    let scratch = tempfile::tempdir()?;
    let root = Utf8PathBuf::from_path_buf(scratch.path().to_path_buf())
        .map_err(|_| anyhow!("temp dir is not UTF-8"))?;
    let svc = Service::new(FetchPolicy::Always, Store::open(root)?, aliases.clone())?;

    let mut locals: IndexMap<String, Vec<u8>> = IndexMap::new();
    for entrypoint in entrypoints {
        let target = resolve(None, entrypoint, &aliases)?;
        let id = target.without_task().to_string();

        let bytes = svc
            .fetch(cancel, &target)
            .await
            .with_context(|| format!("loading entrypoint {id}"))?;
        let wf = maru2_models::from_slice(&bytes).with_context(|| format!("parsing {id}"))?;
        maru2_models::validate(&wf).with_context(|| format!("validating {id}"))?;

        if matches!(target, Uses::File(_)) {
            locals.insert(id.clone(), bytes);
        }

        let crawled = svc.fetch_all(cancel, &wf, &target.without_task()).await?;
        locals.extend(crawled);
        debug!(entrypoint = %id, "dependency closure complete");
    }

    let removed = svc.with_store(|store| store.gc())?;
    debug!(removed, "scratch store collected");

    let (layers, config, manifest) =
        svc.with_store(|store| assemble_layers(store, &locals))?;

    let reference = Reference::try_from(destination)
        .with_context(|| format!("invalid destination reference `{destination}`"))?;
    let client = Client::default();

    let response = tokio::select! {
        _ = cancel.cancelled() => bail!("publish cancelled"),
        result = client.push(
            &reference,
            &layers,
            config,
            &RegistryAuth::Anonymous,
            Some(manifest),
        ) => result.with_context(|| format!("pushing to `{destination}`"))?,
    };

    info!("published {}", response.manifest_url);
    Ok(())
}

/// Builds the layer set, config, and manifest for a publish: one layer per
/// store entry (remote dependencies, in retrieval order), then one per
/// local file encountered during the crawl. Every layer carries its
/// canonical reference as the `title` annotation.
fn assemble_layers(
    store: &Store,
    locals: &IndexMap<String, Vec<u8>>,
) -> anyhow::Result<(Vec<ImageLayer>, Config, OciImageManifest)> {
    let mut layers = Vec::new();

    for (id, entry) in store.list() {
        let bytes = store
            .read(id)?
            .ok_or_else(|| anyhow!("store entry `{id}` vanished (hex {})", entry.hex))?;
        layers.push(workflow_layer(bytes, id));
    }

    for (id, bytes) in locals {
        layers.push(workflow_layer(bytes.clone(), id));
    }

    let config = Config::new(b"{}".to_vec(), EMPTY_CONFIG_MEDIA_TYPE.to_string(), None);
    let mut manifest = OciImageManifest::build(&layers, &config, None);
    manifest.artifact_type = Some(COLLECTION_ARTIFACT_TYPE.to_string());

    Ok((layers, config, manifest))
}

fn workflow_layer(bytes: Vec<u8>, title: &str) -> ImageLayer {
    ImageLayer::new(
        bytes,
        WORKFLOW_MEDIA_TYPE.to_string(),
        Some(BTreeMap::from([(
            TITLE_ANNOTATION.to_string(),
            title.to_string(),
        )])),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn title_of(layer: &ImageLayer) -> &str {
        layer
            .annotations
            .as_ref()
            .and_then(|a| a.get(TITLE_ANNOTATION))
            .map(String::as_str)
            .unwrap_or_default()
    }

    #[test]
    fn layers_carry_titles_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut store =
            Store::open(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()).unwrap();
        store
            .put("pkg:github/o/r@main#tasks.yaml", b"remote: bytes\n")
            .unwrap();

        let mut locals = IndexMap::new();
        locals.insert("file:tasks.yaml".to_string(), b"local: bytes\n".to_vec());
        locals.insert("file:dep.yaml".to_string(), b"dep: bytes\n".to_vec());

        let (layers, _config, manifest) = assemble_layers(&store, &locals).unwrap();

        assert_eq!(layers.len(), 3);
        assert_eq!(title_of(&layers[0]), "pkg:github/o/r@main#tasks.yaml");
        assert_eq!(title_of(&layers[1]), "file:tasks.yaml");
        assert_eq!(title_of(&layers[2]), "file:dep.yaml");
        assert_eq!(layers[0].data, b"remote: bytes\n");
        assert_eq!(layers[1].data, b"local: bytes\n");

        for layer in &layers {
            assert_eq!(layer.media_type, WORKFLOW_MEDIA_TYPE);
        }
        assert_eq!(
            manifest.artifact_type.as_deref(),
            Some(COLLECTION_ARTIFACT_TYPE)
        );
        assert_eq!(manifest.layers.len(), 3);
    }

    #[tokio::test]
    async fn crawl_then_assemble_preserves_dependency_bytes() {
        // An entrypoint referencing a sibling: both must end up as layers
        // with their exact bytes.
        let dir = tempfile::tempdir().unwrap();
        let entry_path = dir.path().join("tasks.yaml");
        let dep_path = dir.path().join("dep.yaml");

        let entry_bytes = format!(
            "schema-version: v1\ntasks:\n  default:\n    steps:\n      - uses: \"file:{}?task=dep\"\n",
            dep_path.display()
        );
        let dep_bytes =
            "schema-version: v1\ntasks:\n  dep:\n    steps:\n      - run: echo dep\n".to_string();
        std::fs::write(&entry_path, &entry_bytes).unwrap();
        std::fs::write(&dep_path, &dep_bytes).unwrap();

        let store_dir = tempfile::tempdir().unwrap();
        let svc = Service::new(
            FetchPolicy::Always,
            Store::open(Utf8PathBuf::from_path_buf(store_dir.path().to_path_buf()).unwrap())
                .unwrap(),
            IndexMap::new(),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let entry_ref = format!("file:{}", entry_path.display());
        let target = resolve(None, &entry_ref, &IndexMap::new()).unwrap();

        let bytes = svc.fetch(&cancel, &target).await.unwrap();
        let wf = maru2_models::from_slice(&bytes).unwrap();

        let mut locals = IndexMap::new();
        locals.insert(target.to_string(), bytes);
        let crawled = svc.fetch_all(&cancel, &wf, &target).await.unwrap();
        locals.extend(crawled);

        let (layers, _config, _manifest) =
            svc.with_store(|store| assemble_layers(store, &locals)).unwrap();

        assert_eq!(layers.len(), 2);
        assert!(title_of(&layers[0]).ends_with("tasks.yaml"));
        assert!(title_of(&layers[1]).ends_with("dep.yaml"));
        assert_eq!(layers[0].data, entry_bytes.as_bytes());
        assert_eq!(layers[1].data, dep_bytes.as_bytes());
    }
}
