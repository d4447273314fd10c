//! Declarative edit configuration.
//!
//! A [`ModifyConfig`] is the serializable form of an option list, e.g.
//!
//! ```json
//! {
//!   "call_timeout_secs": 30,
//!   "edits": [
//!     { "op": "layer_reproducible" },
//!     { "op": "layer_strip_file", "path": "/var/cache" },
//!     { "op": "layer_timestamp", "time": { "from_label": "org.opencontainers.image.created" } }
//!   ]
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use imagemod_shared::errors::{ImageModError, ImageModResult};
use serde::{Deserialize, Serialize};

use crate::context::ExecContext;
use crate::options::{
    Opt, OptTime, with_file_tar_time, with_layer_reproducible, with_layer_rm_created_by,
    with_layer_rm_index, with_layer_strip_file, with_layer_timestamp,
    with_layer_timestamp_from_label,
};

/// One edit, tagged by `op`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EditSpec {
    LayerReproducible,
    LayerRmCreatedBy { pattern: String },
    LayerRmIndex { index: usize },
    LayerStripFile { path: String },
    LayerTimestamp { time: OptTime },
    LayerTimestampFromLabel { label: String },
    FileTarTime { name: String, time: OptTime },
}

impl EditSpec {
    /// Build the option, validating its arguments.
    pub fn to_opt(&self) -> ImageModResult<Opt> {
        match self {
            Self::LayerReproducible => Ok(with_layer_reproducible()),
            Self::LayerRmCreatedBy { pattern } => with_layer_rm_created_by(pattern),
            Self::LayerRmIndex { index } => Ok(with_layer_rm_index(*index)),
            Self::LayerStripFile { path } => with_layer_strip_file(path),
            Self::LayerTimestamp { time } => with_layer_timestamp(time.clone()),
            Self::LayerTimestampFromLabel { label } => with_layer_timestamp_from_label(label),
            Self::FileTarTime { name, time } => with_file_tar_time(name, time.clone()),
        }
    }
}

/// Edits plus the execution settings they run with.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyConfig {
    /// Directory for rewritten layers and spooled blobs. System temp dir when unset.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Upper bound for each registry call.
    #[serde(default)]
    pub call_timeout_secs: Option<u64>,

    #[serde(default)]
    pub edits: Vec<EditSpec>,
}

impl ModifyConfig {
    pub fn from_json(json: &str) -> ImageModResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| ImageModError::Config(format!("Failed to parse modify config: {}", e)))
    }

    /// Build every option up front, so argument errors surface before any I/O.
    ///
    /// Options carry per-run state; call this once per modify operation.
    pub fn options(&self) -> ImageModResult<Vec<Opt>> {
        self.edits
            .iter()
            .enumerate()
            .map(|(i, edit)| {
                edit.to_opt().map_err(|e| match e {
                    ImageModError::Config(msg) => {
                        ImageModError::Config(format!("edit {}: {}", i, msg))
                    }
                    other => other,
                })
            })
            .collect()
    }

    /// Carry the temp dir and call timeout over to `ctx`.
    pub fn apply_context(&self, mut ctx: ExecContext) -> ExecContext {
        if let Some(dir) = &self.temp_dir {
            ctx = ctx.with_temp_dir(dir.clone());
        }
        if let Some(secs) = self.call_timeout_secs {
            ctx = ctx.with_call_timeout(Duration::from_secs(secs));
        }
        ctx
    }
}
