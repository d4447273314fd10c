//! Execution context handed to every step of a modify operation.

use std::future::Future;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use imagemod_shared::constants::temp::FILE_PREFIX;
use imagemod_shared::errors::{ImageModError, ImageModResult};
use oci_client::Reference;
use oci_client::manifest::{OciDescriptor, OciManifest};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

use crate::registry::Registry;

/// Registry handle, references and cancellation for one modify operation.
///
/// Cancellation and the per-call timeout are observed only at registry calls.
#[derive(Clone)]
pub struct ExecContext {
    registry: Arc<dyn Registry>,
    source: Reference,
    target: Reference,
    cancel: CancellationToken,
    call_timeout: Option<Duration>,
    temp_dir: Option<PathBuf>,
}

impl ExecContext {
    pub fn new(registry: Arc<dyn Registry>, source: Reference, target: Reference) -> Self {
        Self {
            registry,
            source,
            target,
            cancel: CancellationToken::new(),
            call_timeout: None,
            temp_dir: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn source(&self) -> &Reference {
        &self.source
    }

    pub fn target(&self) -> &Reference {
        &self.target
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout
    }

    pub fn temp_dir(&self) -> Option<&Path> {
        self.temp_dir.as_deref()
    }

    pub fn check_cancelled(&self) -> ImageModResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ImageModError::Cancelled);
        }
        Ok(())
    }

    pub async fn manifest_get(
        &self,
        reference: &Reference,
        desc: Option<&OciDescriptor>,
    ) -> ImageModResult<OciManifest> {
        let what = match desc {
            Some(desc) => format!("manifest {}", desc.digest),
            None => format!("manifest {}", reference.whole()),
        };
        self.call(&what, self.registry.manifest_get(reference, desc))
            .await
    }

    pub async fn blob_get(
        &self,
        reference: &Reference,
        desc: &OciDescriptor,
    ) -> ImageModResult<Box<dyn Read + Send>> {
        let what = format!("blob {}", desc.digest);
        self.call(&what, self.registry.blob_get(reference, desc))
            .await
    }

    /// New temp file in the configured directory.
    pub fn temp_file(&self) -> ImageModResult<NamedTempFile> {
        named_temp_file(self.temp_dir())
    }

    async fn call<T>(
        &self,
        what: &str,
        fut: impl Future<Output = ImageModResult<T>>,
    ) -> ImageModResult<T> {
        self.check_cancelled()?;
        let bounded = async {
            match self.call_timeout {
                Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                    ImageModError::Network(format!("{} timed out after {:?}", what, limit))
                })?,
                None => fut.await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::debug!(call = %what, "Registry call cancelled");
                Err(ImageModError::Cancelled)
            }
            result = bounded => result,
        }
    }
}

/// Create a temp file named with the crate prefix in `dir`, or the system temp dir.
pub(crate) fn named_temp_file(dir: Option<&Path>) -> ImageModResult<NamedTempFile> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(FILE_PREFIX);
    let result = match dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    };
    result.map_err(|e| ImageModError::Storage(format!("Failed to create temp file: {}", e)))
}
