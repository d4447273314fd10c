//! Building the DAG from the source image.

use std::io::Read;

use futures::FutureExt;
use futures::future::BoxFuture;
use imagemod_shared::errors::{ImageModError, ImageModResult};
use oci_client::manifest::{OciDescriptor, OciManifest};
use oci_spec::image::ImageConfiguration;

use super::{DagLayer, DagManifest, DagOciConfig};
use crate::context::ExecContext;

impl DagManifest {
    /// Load the full manifest tree of the context's source reference.
    ///
    /// Index children are fetched by descriptor. A config blob that does not
    /// decode as an OCI image config leaves the image without a config.
    pub async fn load(ctx: &ExecContext) -> ImageModResult<DagManifest> {
        tracing::info!(source = %ctx.source().whole(), "Loading image");
        let dm = load_node(ctx, None).await?;
        tracing::debug!(
            images = dm.images().len(),
            index = dm.is_index(),
            "Loaded image tree"
        );
        Ok(dm)
    }
}

fn load_node(
    ctx: &ExecContext,
    desc: Option<OciDescriptor>,
) -> BoxFuture<'_, ImageModResult<DagManifest>> {
    async move {
        let manifest = ctx.manifest_get(ctx.source(), desc.as_ref()).await?;
        let dm = match manifest {
            OciManifest::ImageIndex(index) => {
                let mut children = Vec::with_capacity(index.manifests.len());
                for entry in &index.manifests {
                    let child = OciDescriptor {
                        media_type: entry.media_type.clone(),
                        digest: entry.digest.clone(),
                        size: entry.size,
                        ..Default::default()
                    };
                    children.push(load_node(ctx, Some(child)).await?);
                }
                DagManifest::index(index, children)
            }
            OciManifest::Image(image) => {
                let config = load_config(ctx, &image.config).await?;
                let layers = image
                    .layers
                    .iter()
                    .cloned()
                    .enumerate()
                    .map(|(i, layer)| DagLayer::original(layer, i))
                    .collect();
                DagManifest::image(image, config, layers)
            }
        };
        Ok(match desc {
            Some(desc) => dm.with_descriptor(desc),
            None => dm,
        })
    }
    .boxed()
}

async fn load_config(
    ctx: &ExecContext,
    desc: &OciDescriptor,
) -> ImageModResult<Option<DagOciConfig>> {
    let mut reader = ctx.blob_get(ctx.source(), desc).await?;
    let mut body = Vec::new();
    reader.read_to_end(&mut body).map_err(|e| {
        ImageModError::Storage(format!("Failed to read config {}: {}", desc.digest, e))
    })?;

    match serde_json::from_slice::<ImageConfiguration>(&body) {
        Ok(config) => Ok(Some(DagOciConfig::new(desc.clone(), config))),
        Err(e) => {
            tracing::warn!(
                digest = %desc.digest,
                media_type = %desc.media_type,
                error = %e,
                "Config is not an OCI image config, continuing without it"
            );
            Ok(None)
        }
    }
}
