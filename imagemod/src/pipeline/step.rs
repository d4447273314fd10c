//! The step contract shared by every option.

use std::io::Read;

use async_trait::async_trait;
use imagemod_shared::errors::ImageModResult;

use crate::archive::EntryHeader;
use crate::context::ExecContext;
use crate::dag::{Change, DagLayer, DagManifest, DagOciConfig};

/// Pipeline phases a step takes part in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Hooks {
    pub oci_config: bool,
    pub manifest: bool,
    pub layer_file: bool,
}

impl Hooks {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn oci_config(mut self) -> Self {
        self.oci_config = true;
        self
    }

    pub fn manifest(mut self) -> Self {
        self.manifest = true;
        self
    }

    pub fn layer_file(mut self) -> Self {
        self.layer_file = true;
        self
    }
}

/// Outcome of a layer-file step for one tar entry.
pub struct FileEdit<'a> {
    pub header: EntryHeader,
    pub content: Box<dyn Read + 'a>,
    pub change: Change,
}

impl<'a> FileEdit<'a> {
    /// Hand the entry on untouched.
    pub fn unchanged(header: EntryHeader, content: Box<dyn Read + 'a>) -> Self {
        Self {
            header,
            content,
            change: Change::Unchanged,
        }
    }

    pub fn replaced(header: EntryHeader, content: Box<dyn Read + 'a>) -> Self {
        Self {
            header,
            content,
            change: Change::Replaced,
        }
    }

    /// Drop the entry from the layer.
    pub fn deleted(header: EntryHeader, content: Box<dyn Read + 'a>) -> Self {
        Self {
            header,
            content,
            change: Change::Deleted,
        }
    }
}

/// One option's behaviour, with whatever state it carries between phases.
///
/// A step instance belongs to a single modify operation. Hooks run in this
/// order: every `oci_config`, then every `manifest`, then per layer
/// `begin_layer` followed by `layer_file` for each entry. Only the phases named
/// by [`Step::hooks`] are called.
#[async_trait]
pub trait Step: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn hooks(&self) -> Hooks;

    async fn oci_config(
        &mut self,
        _ctx: &ExecContext,
        _config: &mut DagOciConfig,
    ) -> ImageModResult<()> {
        Ok(())
    }

    async fn manifest(&mut self, _ctx: &ExecContext, _dm: &mut DagManifest) -> ImageModResult<()> {
        Ok(())
    }

    /// Called before the entries of `layer` are streamed. Registry lookups the
    /// entry hook depends on belong here.
    async fn begin_layer(&mut self, _ctx: &ExecContext, _layer: &DagLayer) -> ImageModResult<()> {
        Ok(())
    }

    /// Edit one tar entry. Returning [`Change::Deleted`] drops the entry and
    /// skips later steps for it.
    fn layer_file<'a>(
        &mut self,
        _ctx: &ExecContext,
        _layer: &DagLayer,
        header: EntryHeader,
        content: Box<dyn Read + 'a>,
    ) -> ImageModResult<FileEdit<'a>> {
        Ok(FileEdit::unchanged(header, content))
    }
}
