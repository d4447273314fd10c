//! Rewrite of a tar archive stored as a file inside a layer.

use std::io::{self, BufReader, BufWriter, Read};

use imagemod_shared::errors::{ImageModError, ImageModResult};
use tar::{Archive, Builder};
use tempfile::NamedTempFile;

use super::compression::Compression;
use super::header::{EntryHeader, copy_pax_global};
use super::time::TimeRule;
use super::tmp_reader::TmpReader;

/// Result of rewriting a nested archive.
pub struct NestedRewrite {
    /// Stream over the content to emit; its length is the new entry size.
    pub reader: TmpReader,
    pub size: u64,
    /// Whether any inner timestamp changed. When false `reader` yields the
    /// original bytes.
    pub changed: bool,
}

/// Apply `rule` to every inner entry of the archive read from `content`.
///
/// The content is first spooled into `spool`, then re-encoded into `out` with
/// the same compression. Whichever file is not handed out is removed.
pub fn rewrite_nested_times(
    content: &mut dyn Read,
    name: &str,
    rule: &TimeRule,
    mut spool: NamedTempFile,
    out: NamedTempFile,
) -> ImageModResult<NestedRewrite> {
    io::copy(content, &mut spool).map_err(|e| {
        ImageModError::Storage(format!("Failed to spool nested archive {}: {}", name, e))
    })?;

    let changed = reencode(&spool, &out, name, rule)?;

    let keep = if changed {
        drop(spool);
        out
    } else {
        drop(out);
        spool
    };
    let reader = TmpReader::from_named(keep)?;
    let size = reader.remaining();
    tracing::debug!(file = %name, changed, size, "Rewrote nested archive");
    Ok(NestedRewrite {
        reader,
        size,
        changed,
    })
}

fn reencode(
    spool: &NamedTempFile,
    out: &NamedTempFile,
    name: &str,
    rule: &TimeRule,
) -> ImageModResult<bool> {
    let storage = |what: &str, e: io::Error| {
        ImageModError::Storage(format!("Failed to {} nested archive {}: {}", what, name, e))
    };

    let input = spool.reopen().map_err(|e| storage("reopen", e))?;
    let mut input = BufReader::new(input);
    let compression = Compression::detect(&mut input).map_err(|e| storage("read", e))?;
    let decoded = compression
        .decoder(input)
        .map_err(|e| storage("decompress", e))?;

    let output = out.reopen().map_err(|e| storage("reopen", e))?;
    let encoder = compression
        .encoder(BufWriter::new(output))
        .map_err(|e| storage("compress", e))?;
    let mut builder = Builder::new(encoder);

    let mut changed = false;
    let mut archive = Archive::new(decoded);
    for entry in archive.entries().map_err(|e| storage("read", e))? {
        let mut entry = entry.map_err(|e| storage("read entry of", e))?;
        let mut header = EntryHeader::from_entry(&mut entry)?;
        if header.is_pax_global() {
            copy_pax_global(&mut builder, &mut entry)?;
            continue;
        }
        if header.apply_times(rule) {
            tracing::trace!(file = %name, entry = %header.name, "Adjusted nested entry times");
            changed = true;
        }
        header.append_to(&mut builder, &mut entry)?;
    }

    let encoder = builder.into_inner().map_err(|e| storage("finish", e))?;
    let writer = encoder.finish().map_err(|e| storage("finish", e))?;
    writer
        .into_inner()
        .map_err(|e| storage("flush", e.into_error()))?;
    Ok(changed)
}
