//! Layer nodes of the image DAG.

use std::fs::File;
use std::path::Path;

use imagemod_shared::errors::{ImageModError, ImageModResult};
use oci_client::manifest::OciDescriptor;
use tempfile::TempPath;

use super::Change;

/// Rewritten layer content produced by the layer-file phase.
///
/// The backing temp file lives as long as this value; the serialization stage
/// uploads it (or copies it away) before the DAG is dropped.
#[derive(Debug)]
pub struct RewrittenBlob {
    descriptor: OciDescriptor,
    diff_id: String,
    path: TempPath,
}

impl RewrittenBlob {
    pub(crate) fn new(descriptor: OciDescriptor, diff_id: String, path: TempPath) -> Self {
        Self {
            descriptor,
            diff_id,
            path,
        }
    }

    /// Descriptor of the rewritten blob (new digest and size, original media type).
    pub fn descriptor(&self) -> &OciDescriptor {
        &self.descriptor
    }

    /// Digest of the uncompressed tar stream, for the config's `rootfs.diff_ids`.
    pub fn diff_id(&self) -> &str {
        &self.diff_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the rewritten blob for reading.
    pub fn open(&self) -> ImageModResult<File> {
        File::open(&self.path).map_err(|e| {
            ImageModError::Storage(format!(
                "Failed to open rewritten blob {}: {}",
                self.descriptor.digest, e
            ))
        })
    }
}

/// One layer of a leaf image manifest.
///
/// Layer order is significant: layers apply bottom-up, index 0 first.
#[derive(Debug)]
pub struct DagLayer {
    /// Descriptor as found in the source manifest (or as inserted).
    desc: OciDescriptor,
    change: Change,
    /// Position in the source manifest; `None` for inserted layers.
    original_index: Option<usize>,
    rewritten: Option<RewrittenBlob>,
}

impl DagLayer {
    /// Layer taken from the source manifest at `index`.
    pub fn original(desc: OciDescriptor, index: usize) -> Self {
        Self {
            desc,
            change: Change::Unchanged,
            original_index: Some(index),
            rewritten: None,
        }
    }

    /// Layer inserted by a step; not counted against original positions.
    pub fn added(desc: OciDescriptor) -> Self {
        Self {
            desc,
            change: Change::Added,
            original_index: None,
            rewritten: None,
        }
    }

    /// Descriptor from the source manifest.
    pub fn original_descriptor(&self) -> &OciDescriptor {
        &self.desc
    }

    /// Descriptor to emit: the rewritten blob's when content changed.
    pub fn descriptor(&self) -> &OciDescriptor {
        match &self.rewritten {
            Some(blob) => blob.descriptor(),
            None => &self.desc,
        }
    }

    /// Digest from the source manifest; base-image membership is keyed on it.
    pub fn digest(&self) -> &str {
        &self.desc.digest
    }

    pub fn change(&self) -> Change {
        self.change
    }

    pub fn original_index(&self) -> Option<usize> {
        self.original_index
    }

    pub fn is_added(&self) -> bool {
        self.change == Change::Added
    }

    pub fn is_deleted(&self) -> bool {
        self.change == Change::Deleted
    }

    pub fn rewritten(&self) -> Option<&RewrittenBlob> {
        self.rewritten.as_ref()
    }

    /// Record a change reported by a step. See [`Change::merge`].
    pub fn mark(&mut self, change: Change) {
        self.change = self.change.merge(change);
    }

    /// Copy of the layer's descriptor and state, without any rewritten blob.
    pub(crate) fn snapshot(&self) -> Self {
        Self {
            desc: self.desc.clone(),
            change: self.change,
            original_index: self.original_index,
            rewritten: None,
        }
    }

    pub(crate) fn set_rewritten(&mut self, blob: RewrittenBlob) {
        self.mark(Change::Replaced);
        self.rewritten = Some(blob);
    }
}

/// Mark layers at the given original positions as deleted.
///
/// Positions count only layers that came from the source manifest: inserted
/// (`Added`) layers are skipped, deleted ones still occupy their slot.
pub(crate) fn delete_original_positions(
    layers: &mut [DagLayer],
    positions: &[usize],
) -> ImageModResult<()> {
    let mut remaining: Vec<usize> = positions.to_vec();
    remaining.sort_unstable();
    remaining.dedup();

    let mut original_pos = 0usize;
    for layer in layers.iter_mut() {
        if remaining.is_empty() {
            break;
        }
        if layer.is_added() {
            continue;
        }
        if let Ok(found) = remaining.binary_search(&original_pos) {
            tracing::debug!(
                digest = %layer.digest(),
                position = original_pos,
                "Marking layer deleted"
            );
            layer.mark(Change::Deleted);
            remaining.remove(found);
        }
        original_pos += 1;
    }

    if let Some(missing) = remaining.first() {
        return Err(ImageModError::NotFound(format!(
            "layer {} not found ({} original layers)",
            missing, original_pos
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_descriptor(digest: &str) -> OciDescriptor {
    OciDescriptor {
        media_type: imagemod_shared::constants::media_types::OCI_LAYER_TAR.to_string(),
        digest: digest.to_string(),
        size: 1024,
        ..Default::default()
    }
}
