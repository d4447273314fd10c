//! Shared constants.

/// OCI and Docker media types recognised when loading and rewriting images.
pub mod media_types {
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const OCI_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";

    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

    /// Layer media types whose blobs are tar archives the layer-file phase reads.
    pub const TAR_LAYERS: &[&str] = &[
        OCI_LAYER_TAR,
        OCI_LAYER_GZIP,
        OCI_LAYER_ZSTD,
        DOCKER_LAYER_GZIP,
    ];

    /// Whether a layer with `media_type` holds a fetchable tar archive.
    pub fn is_tar_layer(media_type: &str) -> bool {
        TAR_LAYERS.contains(&media_type)
    }
}

/// Temporary file naming.
pub mod temp {
    /// Prefix for every temporary file created while rewriting content.
    pub const FILE_PREFIX: &str = "imagemod.";
}

/// Digest formatting.
pub mod digest {
    /// Algorithm prefix used for every digest this engine computes.
    pub const SHA256_PREFIX: &str = "sha256:";
}
