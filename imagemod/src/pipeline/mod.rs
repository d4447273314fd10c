//! Step pipeline.
//!
//! ## Architecture
//!
//! Options register [`Step`]s; each step declares the phases it takes part in.
//! A run executes the phases in a fixed order, steps within a phase in
//! registration order:
//!
//! ```text
//! 1. OCI config ──→ 2. Manifest ──→ 3. Layer files
//!    (each config)    (each node,      (each layer: begin_layer,
//!                      depth-first)     then every tar entry)
//! ```
//!
//! The first error aborts the run. Edits made by steps that already ran are
//! not rolled back.

mod layer;
mod step;

pub use step::{FileEdit, Hooks, Step};

use self::layer::rewrite_layer;

use std::io::Read;

use futures::FutureExt;
use futures::future::BoxFuture;
use imagemod_shared::constants::media_types;
use imagemod_shared::errors::{ImageModError, ImageModResult};
use tempfile::NamedTempFile;

use crate::context::ExecContext;
use crate::dag::{DagLayer, DagManifest, DagNode, RewrittenBlob};

/// Ordered step registries for one modify operation.
#[derive(Default)]
pub struct Pipeline {
    steps: Vec<Box<dyn Step>>,
    oci_config: Vec<usize>,
    manifest: Vec<usize>,
    layer_file: Vec<usize>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step to the registries named by its hooks.
    pub fn register(&mut self, step: Box<dyn Step>) {
        let idx = self.steps.len();
        let hooks = step.hooks();
        if hooks.oci_config {
            self.oci_config.push(idx);
        }
        if hooks.manifest {
            self.manifest.push(idx);
        }
        if hooks.layer_file {
            self.layer_file.push(idx);
        }
        tracing::trace!(step = step.name(), ?hooks, "Registered step");
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of steps registered for (config, manifest, layer-file).
    pub fn registry_sizes(&self) -> (usize, usize, usize) {
        (
            self.oci_config.len(),
            self.manifest.len(),
            self.layer_file.len(),
        )
    }

    /// Run every phase against `dm`.
    pub async fn run(&mut self, ctx: &ExecContext, dm: &mut DagManifest) -> ImageModResult<()> {
        if !self.oci_config.is_empty() {
            tracing::debug!(steps = self.oci_config.len(), "Running OCI config steps");
            walk_configs(&mut self.steps, &self.oci_config, ctx, dm).await?;
        }
        if !self.manifest.is_empty() {
            tracing::debug!(steps = self.manifest.len(), "Running manifest steps");
            walk_manifests(&mut self.steps, &self.manifest, ctx, dm).await?;
        }
        if !self.layer_file.is_empty() {
            tracing::debug!(steps = self.layer_file.len(), "Running layer file steps");
            walk_layers(&mut self.steps, &self.layer_file, ctx, dm).await?;
        }
        Ok(())
    }
}

fn walk_configs<'a>(
    steps: &'a mut [Box<dyn Step>],
    order: &'a [usize],
    ctx: &'a ExecContext,
    dm: &'a mut DagManifest,
) -> BoxFuture<'a, ImageModResult<()>> {
    async move {
        if let Some(config) = dm.config_mut() {
            for &idx in order {
                tracing::trace!(
                    step = steps[idx].name(),
                    config = %config.descriptor().digest,
                    "OCI config step"
                );
                steps[idx].oci_config(ctx, config).await?;
            }
        }
        for child in dm.children_mut() {
            walk_configs(&mut *steps, order, ctx, child).await?;
        }
        Ok(())
    }
    .boxed()
}

fn walk_manifests<'a>(
    steps: &'a mut [Box<dyn Step>],
    order: &'a [usize],
    ctx: &'a ExecContext,
    dm: &'a mut DagManifest,
) -> BoxFuture<'a, ImageModResult<()>> {
    async move {
        for &idx in order {
            tracing::trace!(step = steps[idx].name(), top = dm.is_top(), "Manifest step");
            steps[idx].manifest(ctx, dm).await?;
        }
        for child in dm.children_mut() {
            walk_manifests(&mut *steps, order, ctx, child).await?;
        }
        Ok(())
    }
    .boxed()
}

/// Run [`rewrite_layer`] on the blocking pool.
///
/// The steps move into the task and come back with its result; layers are
/// still rewritten one at a time.
async fn rewrite_layer_blocking(
    steps: &mut Vec<Box<dyn Step>>,
    order: &[usize],
    ctx: &ExecContext,
    layer: &DagLayer,
    blob: Box<dyn Read + Send>,
    out: NamedTempFile,
) -> ImageModResult<Option<RewrittenBlob>> {
    let mut owned = std::mem::take(steps);
    let order = order.to_vec();
    let ctx = ctx.clone();
    let layer = layer.snapshot();
    let (owned, result) = tokio::task::spawn_blocking(move || {
        let result = rewrite_layer(&mut owned, &order, &ctx, &layer, blob, out);
        (owned, result)
    })
    .await
    .map_err(|e| ImageModError::Internal(format!("Layer rewrite task failed: {}", e)))?;
    *steps = owned;
    result
}

fn walk_layers<'a>(
    steps: &'a mut Vec<Box<dyn Step>>,
    order: &'a [usize],
    ctx: &'a ExecContext,
    dm: &'a mut DagManifest,
) -> BoxFuture<'a, ImageModResult<()>> {
    async move {
        match dm.node_mut() {
            DagNode::Index { children, .. } => {
                for child in children.iter_mut() {
                    walk_layers(&mut *steps, order, ctx, child).await?;
                }
            }
            DagNode::Image { layers, .. } => {
                for layer in layers.iter_mut() {
                    if layer.is_deleted() || layer.is_added() {
                        continue;
                    }
                    let media_type = &layer.original_descriptor().media_type;
                    if !media_types::is_tar_layer(media_type) {
                        tracing::debug!(
                            digest = %layer.digest(),
                            media_type = %media_type,
                            "Skipping non-tar layer"
                        );
                        continue;
                    }
                    for &idx in order {
                        steps[idx].begin_layer(ctx, layer).await?;
                    }
                    let blob = ctx
                        .blob_get(ctx.source(), layer.original_descriptor())
                        .await?;
                    let out = ctx.temp_file()?;
                    if let Some(rewritten) =
                        rewrite_layer_blocking(steps, order, ctx, layer, blob, out).await?
                    {
                        layer.set_rewritten(rewritten);
                    }
                }
            }
        }
        Ok(())
    }
    .boxed()
}
