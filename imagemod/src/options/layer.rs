//! Layer options: ownership normalization, layer deletion, file stripping.

use std::io::Read;

use async_trait::async_trait;
use imagemod_shared::errors::{ImageModError, ImageModResult};
use regex::Regex;

use super::Opt;
use crate::archive::EntryHeader;
use crate::context::ExecContext;
use crate::dag::{Change, DagLayer, DagManifest, delete_original_positions};
use crate::pipeline::{FileEdit, Hooks, Step};

// ============================================================================
// Reproducible ownership
// ============================================================================

struct LayerReproducible;

#[async_trait]
impl Step for LayerReproducible {
    fn name(&self) -> &'static str {
        "layer_reproducible"
    }

    fn hooks(&self) -> Hooks {
        Hooks::none().layer_file()
    }

    fn layer_file<'a>(
        &mut self,
        _ctx: &ExecContext,
        _layer: &DagLayer,
        mut header: EntryHeader,
        content: Box<dyn Read + 'a>,
    ) -> ImageModResult<FileEdit<'a>> {
        if header.uname.is_empty() && header.gname.is_empty() {
            return Ok(FileEdit::unchanged(header, content));
        }
        header.uname.clear();
        header.gname.clear();
        Ok(FileEdit::replaced(header, content))
    }
}

/// Clear the user and group names of every entry. Numeric ids are kept.
pub fn with_layer_reproducible() -> Opt {
    Opt::from_step(LayerReproducible)
}

// ============================================================================
// Delete layers by history
// ============================================================================

struct LayerRmCreatedBy {
    re: Regex,
}

#[async_trait]
impl Step for LayerRmCreatedBy {
    fn name(&self) -> &'static str {
        "layer_rm_created_by"
    }

    fn hooks(&self) -> Hooks {
        Hooks::none().manifest()
    }

    async fn manifest(&mut self, _ctx: &ExecContext, dm: &mut DagManifest) -> ImageModResult<()> {
        if dm.is_index() {
            return Ok(());
        }
        let config = dm.config().ok_or_else(|| {
            ImageModError::InvalidState("remove layer by created by requires an image config".into())
        })?;
        let positions: Vec<usize> = config
            .layer_history()
            .iter()
            .enumerate()
            .filter(|(_, created_by)| self.re.is_match(created_by))
            .map(|(i, _)| i)
            .collect();
        if dm.layers().is_empty() {
            return Err(ImageModError::InvalidState("no layers found".into()));
        }
        if positions.is_empty() {
            return Err(ImageModError::NotFound(format!(
                "no layers match expression: {}",
                self.re.as_str()
            )));
        }
        tracing::debug!(pattern = %self.re.as_str(), ?positions, "Deleting layers by history");
        delete_original_positions(dm.layers_mut(), &positions)
    }
}

/// Delete every original layer whose history `created_by` matches `pattern`.
pub fn with_layer_rm_created_by(pattern: &str) -> ImageModResult<Opt> {
    if pattern.is_empty() {
        return Err(ImageModError::Config(
            "with_layer_rm_created_by requires a pattern".into(),
        ));
    }
    let re = Regex::new(pattern)
        .map_err(|e| ImageModError::Config(format!("invalid pattern {}: {}", pattern, e)))?;
    Ok(Opt::from_step(LayerRmCreatedBy { re }))
}

// ============================================================================
// Delete a layer by position
// ============================================================================

struct LayerRmIndex {
    index: usize,
}

#[async_trait]
impl Step for LayerRmIndex {
    fn name(&self) -> &'static str {
        "layer_rm_index"
    }

    fn hooks(&self) -> Hooks {
        Hooks::none().manifest()
    }

    async fn manifest(&mut self, _ctx: &ExecContext, dm: &mut DagManifest) -> ImageModResult<()> {
        if !dm.is_top() || dm.is_index() || dm.config().is_none() {
            return Err(ImageModError::InvalidState(
                "remove layer by index requires a single-platform image manifest".into(),
            ));
        }
        if dm.layers().is_empty() {
            return Err(ImageModError::InvalidState("no layers found".into()));
        }
        tracing::debug!(index = self.index, "Deleting layer by index");
        delete_original_positions(dm.layers_mut(), &[self.index])
    }
}

/// Delete the layer at original position `index` (0 is the bottom layer).
pub fn with_layer_rm_index(index: usize) -> Opt {
    Opt::from_step(LayerRmIndex { index })
}

// ============================================================================
// Strip a path from every layer
// ============================================================================

struct LayerStripFile {
    re: Regex,
}

impl LayerStripFile {
    fn new(path: &str) -> ImageModResult<Self> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Err(ImageModError::Config(
                "with_layer_strip_file requires a path".into(),
            ));
        }
        let re = Regex::new(&format!("^/?{}(/.*)?$", regex::escape(trimmed)))
            .map_err(|e| ImageModError::Config(format!("invalid path {}: {}", path, e)))?;
        Ok(Self { re })
    }

    fn matches(&self, name: &str) -> bool {
        self.re.is_match(name)
    }
}

#[async_trait]
impl Step for LayerStripFile {
    fn name(&self) -> &'static str {
        "layer_strip_file"
    }

    fn hooks(&self) -> Hooks {
        Hooks::none().layer_file()
    }

    fn layer_file<'a>(
        &mut self,
        _ctx: &ExecContext,
        _layer: &DagLayer,
        header: EntryHeader,
        content: Box<dyn Read + 'a>,
    ) -> ImageModResult<FileEdit<'a>> {
        if self.matches(&header.name) {
            return Ok(FileEdit::deleted(header, content));
        }
        Ok(FileEdit::unchanged(header, content))
    }
}

/// Remove `path` and everything beneath it from every layer.
///
/// Leading and trailing slashes are ignored on both the argument and entry names.
pub fn with_layer_strip_file(path: &str) -> ImageModResult<Opt> {
    Ok(Opt::from_step(LayerStripFile::new(path)?))
}
