//! In-process registry for offline operation and tests.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use imagemod_shared::constants::media_types;
use imagemod_shared::errors::{ImageModError, ImageModResult};
use oci_client::Reference;
use oci_client::manifest::{OciDescriptor, OciManifest};

use super::Registry;
use crate::archive::sha256_digest;

#[derive(Default)]
struct Store {
    /// Manifests by digest.
    manifests: HashMap<String, OciManifest>,
    /// Manifest digest by `Reference::whole()`.
    tags: HashMap<String, String>,
    blobs: HashMap<String, Arc<[u8]>>,
}

/// Registry holding manifests and blobs in memory, keyed by digest.
#[derive(Default)]
pub struct MemoryRegistry {
    store: RwLock<Store>,
    manifest_fetches: AtomicUsize,
    blob_fetches: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a blob and return its digest.
    pub fn put_blob(&self, data: impl Into<Vec<u8>>) -> ImageModResult<String> {
        let data: Vec<u8> = data.into();
        let digest = sha256_digest(&data);
        self.write()?.blobs.insert(digest.clone(), data.into());
        Ok(digest)
    }

    /// Store a manifest under `reference` (its tag or digest) and return its descriptor.
    pub fn put_manifest(
        &self,
        reference: &Reference,
        manifest: OciManifest,
    ) -> ImageModResult<OciDescriptor> {
        let desc = self.put_child_manifest(manifest)?;
        self.write()?
            .tags
            .insert(reference.whole(), desc.digest.clone());
        Ok(desc)
    }

    /// Store a manifest reachable only by digest, such as an index child.
    pub fn put_child_manifest(&self, manifest: OciManifest) -> ImageModResult<OciDescriptor> {
        let body = serde_json::to_vec(&manifest)
            .map_err(|e| ImageModError::Internal(format!("Failed to encode manifest: {}", e)))?;
        let media_type = match &manifest {
            OciManifest::Image(m) => m
                .media_type
                .clone()
                .unwrap_or_else(|| media_types::OCI_MANIFEST.to_string()),
            OciManifest::ImageIndex(i) => i
                .media_type
                .clone()
                .unwrap_or_else(|| media_types::OCI_INDEX.to_string()),
        };
        let desc = OciDescriptor {
            media_type,
            digest: sha256_digest(&body),
            size: body.len() as i64,
            ..Default::default()
        };
        self.write()?
            .manifests
            .insert(desc.digest.clone(), manifest);
        Ok(desc)
    }

    /// Number of manifest lookups served so far.
    pub fn manifest_fetches(&self) -> usize {
        self.manifest_fetches.load(Ordering::SeqCst)
    }

    /// Number of blob lookups served so far.
    pub fn blob_fetches(&self) -> usize {
        self.blob_fetches.load(Ordering::SeqCst)
    }

    fn read(&self) -> ImageModResult<std::sync::RwLockReadGuard<'_, Store>> {
        self.store
            .read()
            .map_err(|_| ImageModError::Internal("memory registry lock poisoned".into()))
    }

    fn write(&self) -> ImageModResult<std::sync::RwLockWriteGuard<'_, Store>> {
        self.store
            .write()
            .map_err(|_| ImageModError::Internal("memory registry lock poisoned".into()))
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn manifest_get(
        &self,
        reference: &Reference,
        desc: Option<&OciDescriptor>,
    ) -> ImageModResult<OciManifest> {
        self.manifest_fetches.fetch_add(1, Ordering::SeqCst);
        let store = self.read()?;
        let digest = match (desc, reference.digest()) {
            (Some(desc), _) => Some(desc.digest.clone()),
            (None, Some(digest)) => Some(digest.to_string()),
            (None, None) => store.tags.get(&reference.whole()).cloned(),
        };
        digest
            .and_then(|d| store.manifests.get(&d).cloned())
            .ok_or_else(|| {
                ImageModError::Network(format!("manifest not found: {}", reference.whole()))
            })
    }

    async fn blob_get(
        &self,
        reference: &Reference,
        desc: &OciDescriptor,
    ) -> ImageModResult<Box<dyn Read + Send>> {
        self.blob_fetches.fetch_add(1, Ordering::SeqCst);
        let data = self.read()?.blobs.get(&desc.digest).cloned().ok_or_else(|| {
            ImageModError::Network(format!(
                "blob {} not found in {}",
                desc.digest,
                reference.repository()
            ))
        })?;
        Ok(Box::new(Cursor::new(data)))
    }
}
