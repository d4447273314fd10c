//! imagemod - container image modification engine
//!
//! Loads an OCI image (or multi-platform index) into an owned DAG, runs an
//! ordered set of edits over its configs, manifests and layer archives, and
//! leaves every touched node marked so a serializer only regenerates what
//! changed.
//!
//! ```no_run
//! # async fn run() -> imagemod::ImageModResult<()> {
//! use std::sync::Arc;
//! use imagemod::{ExecContext, OciClientRegistry, registry::parse_reference};
//!
//! let ctx = ExecContext::new(
//!     Arc::new(OciClientRegistry::new()),
//!     parse_reference("docker.io/library/alpine:3.20")?,
//!     parse_reference("registry.local/alpine:repro")?,
//! );
//! let dm = imagemod::modify(
//!     &ctx,
//!     vec![
//!         imagemod::with_layer_reproducible(),
//!         imagemod::with_layer_strip_file("var/cache/apk")?,
//!     ],
//! )
//! .await?;
//! assert!(dm.modified());
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod base;
pub mod config;
pub mod context;
pub mod dag;
pub mod logging;
pub mod options;
pub mod pipeline;
pub mod registry;

pub use config::{EditSpec, ModifyConfig};
pub use context::ExecContext;
pub use dag::{Change, DagLayer, DagManifest, DagNode, DagOciConfig, RewrittenBlob};
pub use imagemod_shared::errors::{ImageModError, ImageModResult};
pub use options::{
    Opt, OptTime, with_file_tar_time, with_file_tar_time_max, with_layer_reproducible,
    with_layer_rm_created_by, with_layer_rm_index, with_layer_strip_file, with_layer_timestamp,
    with_layer_timestamp_from_label, with_layer_timestamp_max,
};
pub use pipeline::{FileEdit, Hooks, Step};
pub use registry::{MemoryRegistry, OciClientRegistry, Registry};

use pipeline::Pipeline;

/// Load the context's source image and apply `opts` to it.
pub async fn modify(ctx: &ExecContext, opts: Vec<Opt>) -> ImageModResult<DagManifest> {
    ctx.check_cancelled()?;
    let mut dm = DagManifest::load(ctx).await?;
    modify_dag(ctx, &mut dm, opts).await?;
    Ok(dm)
}

/// Apply `opts` to an already loaded DAG.
///
/// Options run in the order given. The first failing step aborts the run;
/// edits from steps that already ran stay on `dm`.
pub async fn modify_dag(
    ctx: &ExecContext,
    dm: &mut DagManifest,
    opts: Vec<Opt>,
) -> ImageModResult<()> {
    let mut pipeline = Pipeline::new();
    for opt in opts {
        tracing::debug!(option = opt.name(), "Registering option");
        opt.register(&mut pipeline);
    }

    let (configs, manifests, layer_files) = pipeline.registry_sizes();
    tracing::info!(
        source = %ctx.source().whole(),
        target = %ctx.target().whole(),
        steps = pipeline.len(),
        configs,
        manifests,
        layer_files,
        "Modifying image"
    );

    pipeline.run(ctx, dm).await.inspect_err(|e| {
        tracing::error!(source = %ctx.source().whole(), error = %e, "Image modification failed");
    })?;

    tracing::info!(
        source = %ctx.source().whole(),
        modified = dm.modified(),
        "Image modification finished"
    );
    Ok(())
}
