//! Registry access through `oci-client`.

use std::io::Read;
use std::path::PathBuf;

use async_trait::async_trait;
use imagemod_shared::errors::{ImageModError, ImageModResult};
use oci_client::Reference;
use oci_client::manifest::{OciDescriptor, OciManifest};
use oci_client::secrets::RegistryAuth;
use tokio::io::AsyncWriteExt;

use super::{Registry, child_reference};
use crate::archive::TmpReader;
use crate::context::named_temp_file;

/// Registry backed by a remote distribution API.
///
/// Blobs are spooled into a temp file and handed out as a [`TmpReader`], so the
/// file goes away once the caller has read it.
pub struct OciClientRegistry {
    client: oci_client::Client,
    auth: RegistryAuth,
    temp_dir: Option<PathBuf>,
}

impl OciClientRegistry {
    /// Anonymous access with the default client configuration.
    pub fn new() -> Self {
        Self::with_client(
            oci_client::Client::new(Default::default()),
            RegistryAuth::Anonymous,
        )
    }

    pub fn with_client(client: oci_client::Client, auth: RegistryAuth) -> Self {
        Self {
            client,
            auth,
            temp_dir: None,
        }
    }

    /// Directory for spooled blobs; the system temp dir when unset.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }
}

impl Default for OciClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for OciClientRegistry {
    async fn manifest_get(
        &self,
        reference: &Reference,
        desc: Option<&OciDescriptor>,
    ) -> ImageModResult<OciManifest> {
        let target = match desc {
            Some(desc) => child_reference(reference, &desc.digest),
            None => reference.clone(),
        };
        let (manifest, digest) = self
            .client
            .pull_manifest(&target, &self.auth)
            .await
            .map_err(|e| {
                ImageModError::Network(format!(
                    "failed to pull manifest {}: {e}",
                    target.whole()
                ))
            })?;
        tracing::debug!(reference = %target.whole(), digest = %digest, "Pulled manifest");
        Ok(manifest)
    }

    async fn blob_get(
        &self,
        reference: &Reference,
        desc: &OciDescriptor,
    ) -> ImageModResult<Box<dyn Read + Send>> {
        let tmp = named_temp_file(self.temp_dir.as_deref())?;
        let file = tmp.reopen().map_err(|e| {
            ImageModError::Storage(format!(
                "Failed to open spool file for blob {}: {}",
                desc.digest, e
            ))
        })?;
        let mut file = tokio::fs::File::from_std(file);

        self.client
            .pull_blob(reference, desc, &mut file)
            .await
            .map_err(|e| {
                ImageModError::Network(format!("failed to pull blob {}: {e}", desc.digest))
            })?;
        file.flush().await.map_err(|e| {
            ImageModError::Storage(format!("Failed to flush blob {}: {}", desc.digest, e))
        })?;
        drop(file);

        tracing::debug!(digest = %desc.digest, "Spooled blob");
        Ok(Box::new(TmpReader::from_named(tmp)?))
    }
}
