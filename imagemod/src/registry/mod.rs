//! Registry collaborator seam.
//!
//! The engine only reads: manifests (by reference or by a child descriptor)
//! and blobs (layers and configs). Pushing the result is left to the caller.

mod memory;
mod oci;

pub use memory::MemoryRegistry;
pub use oci::OciClientRegistry;

use std::io::Read;

use async_trait::async_trait;
use imagemod_shared::errors::{ImageModError, ImageModResult};
use oci_client::Reference;
use oci_client::manifest::{OciDescriptor, OciManifest};

/// Source of manifests and blobs.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Fetch a manifest. With `desc`, fetch the manifest it names from the
    /// repository of `reference`; otherwise fetch `reference` itself.
    async fn manifest_get(
        &self,
        reference: &Reference,
        desc: Option<&OciDescriptor>,
    ) -> ImageModResult<OciManifest>;

    /// Open a blob of the repository of `reference` for reading.
    async fn blob_get(
        &self,
        reference: &Reference,
        desc: &OciDescriptor,
    ) -> ImageModResult<Box<dyn Read + Send>>;
}

/// Reference to `digest` within the repository of `reference`.
pub fn child_reference(reference: &Reference, digest: &str) -> Reference {
    Reference::with_digest(
        reference.registry().to_string(),
        reference.repository().to_string(),
        digest.to_string(),
    )
}

/// Parse an image reference string.
pub fn parse_reference(reference: &str) -> ImageModResult<Reference> {
    reference
        .parse()
        .map_err(|e| ImageModError::Config(format!("invalid image reference {}: {}", reference, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_reference_keeps_repository() {
        let base = parse_reference("registry.example.com/team/app:1.0").unwrap();
        let child = child_reference(&base, "sha256:abc");

        assert_eq!(child.registry(), "registry.example.com");
        assert_eq!(child.repository(), "team/app");
        assert_eq!(child.digest(), Some("sha256:abc"));
        assert_eq!(child.tag(), None);
    }

    #[test]
    fn test_parse_reference_rejects_garbage() {
        let err = parse_reference("").unwrap_err();
        assert!(err.is_config());
    }
}
