//! Base image layer resolution.
//!
//! Layers inherited from a base image must not be touched by content edits.
//! The set of inherited digests comes from the first N original layers of
//! every image in the DAG, from the layers of a base image reference, or both.

use std::collections::HashSet;

use futures::FutureExt;
use futures::future::BoxFuture;
use imagemod_shared::errors::ImageModResult;
use oci_client::Reference;
use oci_client::manifest::{OciDescriptor, OciManifest};

use crate::context::ExecContext;
use crate::dag::{DagManifest, DagNode};

/// Memoized set of base layer digests for one option.
#[derive(Debug, Default)]
pub struct BaseDigests {
    digests: HashSet<String>,
    base_ref: Option<Reference>,
    processed: bool,
}

impl BaseDigests {
    pub fn new(base_ref: Option<Reference>) -> Self {
        Self {
            digests: HashSet::new(),
            base_ref,
            processed: false,
        }
    }

    /// Add the first `count` original layers of every image under `dm`.
    pub fn add_count(&mut self, count: usize, dm: &DagManifest) {
        if count == 0 {
            return;
        }
        let digests = base_digests_by_count(count, dm);
        tracing::debug!(count, found = digests.len(), "Collected base layers by count");
        self.digests.extend(digests);
    }

    /// Resolve the base reference, once. Later calls are no-ops.
    pub async fn resolve(&mut self, ctx: &ExecContext) -> ImageModResult<()> {
        if self.processed {
            return Ok(());
        }
        if let Some(base_ref) = &self.base_ref {
            let digests = base_digests_by_ref(ctx, base_ref).await?;
            tracing::debug!(
                base = %base_ref.whole(),
                found = digests.len(),
                "Resolved base image layers"
            );
            self.digests.extend(digests);
        }
        self.processed = true;
        Ok(())
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.digests.contains(digest)
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

/// Digests of the first `count` original layers of every image under `dm`,
/// depth-first. Inserted layers do not count.
pub fn base_digests_by_count(count: usize, dm: &DagManifest) -> Vec<String> {
    let mut out = Vec::new();
    collect_by_count(count, dm, &mut out);
    out
}

fn collect_by_count(count: usize, dm: &DagManifest, out: &mut Vec<String>) {
    match dm.node() {
        DagNode::Index { children, .. } => {
            for child in children {
                collect_by_count(count, child, out);
            }
        }
        DagNode::Image { layers, .. } => {
            out.extend(
                layers
                    .iter()
                    .filter(|l| !l.is_added())
                    .take(count)
                    .map(|l| l.digest().to_string()),
            );
        }
    }
}

/// Every layer digest of every platform of the image at `reference`.
pub async fn base_digests_by_ref(
    ctx: &ExecContext,
    reference: &Reference,
) -> ImageModResult<HashSet<String>> {
    let mut out = HashSet::new();
    collect_by_ref(ctx, reference, None, &mut out).await?;
    Ok(out)
}

fn collect_by_ref<'a>(
    ctx: &'a ExecContext,
    reference: &'a Reference,
    desc: Option<&'a OciDescriptor>,
    out: &'a mut HashSet<String>,
) -> BoxFuture<'a, ImageModResult<()>> {
    async move {
        match ctx.manifest_get(reference, desc).await? {
            OciManifest::Image(image) => {
                out.extend(image.layers.into_iter().map(|l| l.digest));
            }
            OciManifest::ImageIndex(index) => {
                for child in &index.manifests {
                    let child_desc = OciDescriptor {
                        media_type: child.media_type.clone(),
                        digest: child.digest.clone(),
                        size: child.size,
                        ..Default::default()
                    };
                    collect_by_ref(ctx, reference, Some(&child_desc), out).await?;
                }
            }
        }
        Ok(())
    }
    .boxed()
}
