//! Streaming rewrite of one layer blob through the layer-file steps.

use std::io::{self, BufReader, BufWriter, Read};

use imagemod_shared::errors::{ImageModError, ImageModResult};
use oci_client::manifest::OciDescriptor;
use tar::{Archive, Builder};
use tempfile::NamedTempFile;

use super::step::{FileEdit, Step};
use crate::archive::{Compression, DigestWriter, EntryHeader, copy_pax_global};
use crate::context::ExecContext;
use crate::dag::{Change, DagLayer, RewrittenBlob};

/// Counters for one layer pass, logged when the layer is done.
#[derive(Debug, Default)]
struct LayerStats {
    entries: usize,
    modified: usize,
    deleted: usize,
}

/// Run every entry of `blob` through the steps named by `order`.
///
/// Output is re-encoded into `out` with the blob's compression. Returns the
/// rewritten blob when any entry changed; otherwise `out` is discarded and the
/// original blob stays in use.
pub(crate) fn rewrite_layer(
    steps: &mut [Box<dyn Step>],
    order: &[usize],
    ctx: &ExecContext,
    layer: &DagLayer,
    blob: Box<dyn Read + Send>,
    out: NamedTempFile,
) -> ImageModResult<Option<RewrittenBlob>> {
    let digest = layer.digest();
    let storage = |what: &str, e: io::Error| {
        ImageModError::Storage(format!("Failed to {} layer {}: {}", what, digest, e))
    };

    let mut input = BufReader::new(blob);
    let compression = Compression::detect(&mut input).map_err(|e| storage("read", e))?;
    let decoded = compression
        .decoder(input)
        .map_err(|e| storage("decompress", e))?;
    tracing::debug!(digest = %digest, ?compression, "Rewriting layer");

    let file = out.reopen().map_err(|e| storage("open output for", e))?;
    let blob_writer = DigestWriter::new(BufWriter::new(file));
    let encoder = compression
        .encoder(blob_writer)
        .map_err(|e| storage("compress", e))?;
    let mut builder = Builder::new(DigestWriter::new(encoder));

    let mut stats = LayerStats::default();
    let mut archive = Archive::new(decoded);
    for entry in archive.entries().map_err(|e| storage("read", e))? {
        let mut entry = entry.map_err(|e| storage("read entry of", e))?;
        let header = EntryHeader::from_entry(&mut entry)?;
        if header.is_pax_global() {
            copy_pax_global(&mut builder, &mut entry)?;
            continue;
        }
        stats.entries += 1;

        let mut edit = FileEdit::unchanged(header, Box::new(&mut entry));
        let mut modified = false;
        let mut deleted = false;
        for &idx in order {
            let step = &mut steps[idx];
            let FileEdit {
                header, content, ..
            } = edit;
            edit = step.layer_file(ctx, layer, header, content)?;
            if edit.change.is_modified() {
                modified = true;
            }
            if edit.change == Change::Deleted {
                tracing::trace!(
                    digest = %digest,
                    entry = %edit.header.name,
                    step = step.name(),
                    "Dropping entry"
                );
                deleted = true;
                break;
            }
        }

        if modified {
            stats.modified += 1;
        }
        if deleted {
            stats.deleted += 1;
            continue;
        }
        edit.header.append_to(&mut builder, edit.content)?;
    }

    let diff_writer = builder.into_inner().map_err(|e| storage("finish", e))?;
    let (encoder, diff_id, _) = diff_writer.finish();
    let blob_writer = encoder.finish().map_err(|e| storage("finish", e))?;
    let (buffered, blob_digest, blob_size) = blob_writer.finish();
    buffered
        .into_inner()
        .map_err(|e| storage("flush", e.into_error()))?;

    if stats.modified == 0 {
        tracing::debug!(digest = %digest, entries = stats.entries, "Layer unchanged");
        return Ok(None);
    }

    let size = i64::try_from(blob_size).map_err(|_| {
        ImageModError::Internal(format!("rewritten layer {} too large", digest))
    })?;
    let descriptor = OciDescriptor {
        digest: blob_digest,
        size,
        urls: None,
        ..layer.original_descriptor().clone()
    };
    tracing::debug!(
        digest = %digest,
        new_digest = %descriptor.digest,
        entries = stats.entries,
        modified = stats.modified,
        deleted = stats.deleted,
        "Layer rewritten"
    );
    Ok(Some(RewrittenBlob::new(
        descriptor,
        diff_id,
        out.into_temp_path(),
    )))
}
