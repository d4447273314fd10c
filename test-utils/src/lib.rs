//! Fixtures for imagemod integration tests.
//!
//! - [`TarFixture`]: build layer archives with controlled headers
//! - [`read_entries`]: decode an archive back into comparable records
//! - [`publish_image`] / [`publish_index`]: put images into a [`MemoryRegistry`]

use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use flate2::Compression as GzLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use imagemod::archive::sha256_digest;
use imagemod::registry::parse_reference;
use imagemod::{ExecContext, MemoryRegistry};
use imagemod_shared::constants::media_types;
use imagemod_shared::errors::ImageModResult;
use oci_client::Reference;
use oci_client::manifest::{OciDescriptor, OciManifest};
use serde_json::json;
use tar::{EntryType, Header};

/// Target reference used by [`context`].
pub const TARGET_REF: &str = "registry.example.com/test/out:latest";

/// UTC time from epoch seconds.
pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

// ============================================================================
// Archives
// ============================================================================

/// Builder for GNU-format test archives. Entries are owned by `root:root`.
pub struct TarFixture {
    builder: tar::Builder<Vec<u8>>,
}

impl Default for TarFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl TarFixture {
    pub fn new() -> Self {
        Self {
            builder: tar::Builder::new(Vec::new()),
        }
    }

    fn header(entry_type: EntryType, size: u64, mtime: u64) -> Header {
        let mut header = Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_size(size);
        header.set_mtime(mtime);
        header.set_mode(if entry_type.is_dir() { 0o755 } else { 0o644 });
        header.set_uid(0);
        header.set_gid(0);
        header.set_username("root").unwrap();
        header.set_groupname("root").unwrap();
        header
    }

    pub fn file(mut self, name: &str, content: &[u8], mtime: u64) -> Self {
        let mut header = Self::header(EntryType::Regular, content.len() as u64, mtime);
        self.builder
            .append_data(&mut header, name, content)
            .unwrap();
        self
    }

    /// Regular file preceded by a PAX `atime` record.
    pub fn file_with_atime(mut self, name: &str, content: &[u8], mtime: u64, atime: u64) -> Self {
        let atime = atime.to_string();
        self.builder
            .append_pax_extensions([("atime", atime.as_bytes())])
            .unwrap();
        let mut header = Self::header(EntryType::Regular, content.len() as u64, mtime);
        self.builder
            .append_data(&mut header, name, content)
            .unwrap();
        self
    }

    /// PAX global header (`pax_global_header`, type `g`) as written by
    /// `git archive` and Go tools.
    pub fn pax_global(mut self, records: &[(&str, &str)]) -> Self {
        let mut body = Vec::new();
        for (key, value) in records {
            let text = format!(" {}={}\n", key, value);
            // The record length counts its own digits.
            let mut len = text.len() + 1;
            while len.to_string().len() + text.len() != len {
                len += 1;
            }
            body.extend_from_slice(format!("{}{}", len, text).as_bytes());
        }
        let mut header = Header::new_ustar();
        header.set_entry_type(EntryType::XGlobalHeader);
        header.set_size(body.len() as u64);
        header.set_mode(0o666);
        header.set_mtime(0);
        self.builder
            .append_data(&mut header, "pax_global_header", body.as_slice())
            .unwrap();
        self
    }

    /// Regular file whose name bytes go into the header verbatim, so absolute
    /// and `./` names survive.
    pub fn file_raw_name(mut self, name: &str, content: &[u8], mtime: u64) -> Self {
        assert!(name.len() < 100, "raw names must fit the header field");
        let mut header = Self::header(EntryType::Regular, content.len() as u64, mtime);
        header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
        header.set_cksum();
        self.builder.append(&header, content).unwrap();
        self
    }

    pub fn dir(mut self, name: &str, mtime: u64) -> Self {
        let mut header = Self::header(EntryType::Directory, 0, mtime);
        self.builder
            .append_data(&mut header, name, std::io::empty())
            .unwrap();
        self
    }

    pub fn symlink(mut self, name: &str, target: &str, mtime: u64) -> Self {
        let mut header = Self::header(EntryType::Symlink, 0, mtime);
        self.builder
            .append_link(&mut header, name, target)
            .unwrap();
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.builder.into_inner().unwrap()
    }
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), GzLevel::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn is_gzip(data: &[u8]) -> bool {
    data.starts_with(&[0x1f, 0x8b])
}

/// Uncompressed bytes of a plain or gzip archive.
pub fn decompress(data: &[u8]) -> Vec<u8> {
    if !is_gzip(data) {
        return data.to_vec();
    }
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out).unwrap();
    out
}

/// One decoded archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureEntry {
    pub name: String,
    pub entry_type: EntryType,
    pub size: u64,
    /// PAX `mtime` when present, else the header field (seconds).
    pub mtime: i64,
    /// Seconds of the PAX `atime` record, if any.
    pub atime: Option<i64>,
    pub uname: String,
    pub gname: String,
    pub content: Vec<u8>,
}

fn pax_secs(value: &str) -> Option<i64> {
    value.split('.').next()?.parse().ok()
}

/// Decode every entry of a plain or gzip archive.
pub fn read_entries(data: &[u8]) -> Vec<FixtureEntry> {
    let raw = decompress(data);
    let mut archive = tar::Archive::new(Cursor::new(raw));
    let mut entries = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let mut pax_mtime = None;
        let mut atime = None;
        let global = entry.header().entry_type().is_pax_global_extensions();
        if !global && let Some(exts) = entry.pax_extensions().unwrap() {
            for ext in exts {
                let ext = ext.unwrap();
                match (ext.key().unwrap(), ext.value().unwrap()) {
                    ("mtime", v) => pax_mtime = pax_secs(v),
                    ("atime", v) => atime = pax_secs(v),
                    _ => {}
                }
            }
        }
        let header = entry.header().clone();
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        entries.push(FixtureEntry {
            name,
            entry_type: header.entry_type(),
            size: entry.size(),
            mtime: pax_mtime.unwrap_or(header.mtime().unwrap() as i64),
            atime,
            uname: header.username().unwrap().unwrap_or_default().to_string(),
            gname: header.groupname().unwrap().unwrap_or_default().to_string(),
            content,
        });
    }
    entries
}

// ============================================================================
// Images
// ============================================================================

/// Image config JSON with one history entry per `created_by` and the given labels.
pub fn config_json(diff_ids: &[String], created_by: &[&str], labels: &[(&str, &str)]) -> Vec<u8> {
    let labels: serde_json::Map<String, serde_json::Value> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect();
    let history: Vec<_> = created_by
        .iter()
        .map(|c| json!({ "created_by": c }))
        .collect();
    serde_json::to_vec(&json!({
        "architecture": "amd64",
        "os": "linux",
        "config": { "Labels": labels },
        "rootfs": { "type": "layers", "diff_ids": diff_ids },
        "history": history,
    }))
    .unwrap()
}

/// Layers and config of an image to publish.
pub struct ImageFixture {
    pub layers: Vec<Vec<u8>>,
    pub created_by: Vec<String>,
    pub labels: Vec<(String, String)>,
    /// Raw config blob replacing the generated one.
    pub raw_config: Option<Vec<u8>>,
    /// Media types replacing the detected tar type, by layer position.
    pub media_types: Vec<(usize, String)>,
}

impl ImageFixture {
    /// One history entry per layer, `created_by` = `"layer N"`.
    pub fn new(layers: Vec<Vec<u8>>) -> Self {
        let created_by = (0..layers.len()).map(|i| format!("layer {}", i)).collect();
        Self {
            layers,
            created_by,
            labels: Vec::new(),
            raw_config: None,
            media_types: Vec::new(),
        }
    }

    pub fn created_by(mut self, created_by: &[&str]) -> Self {
        self.created_by = created_by.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.push((key.to_string(), value.to_string()));
        self
    }

    pub fn raw_config(mut self, config: &[u8]) -> Self {
        self.raw_config = Some(config.to_vec());
        self
    }

    pub fn media_type(mut self, layer: usize, media_type: &str) -> Self {
        self.media_types.push((layer, media_type.to_string()));
        self
    }
}

/// A published image.
pub struct Published {
    pub manifest: OciDescriptor,
    pub layer_digests: Vec<String>,
}

fn descriptor(media_type: &str, digest: String, size: usize) -> serde_json::Value {
    json!({ "mediaType": media_type, "digest": digest, "size": size })
}

/// Store `image` in `registry`, tagged as `reference` or reachable only by digest.
pub fn publish_image(
    registry: &MemoryRegistry,
    reference: Option<&Reference>,
    image: &ImageFixture,
) -> ImageModResult<Published> {
    let mut layer_descs = Vec::new();
    let mut layer_digests = Vec::new();
    let mut diff_ids = Vec::new();
    for (i, layer) in image.layers.iter().enumerate() {
        let detected = if is_gzip(layer) {
            media_types::OCI_LAYER_GZIP
        } else {
            media_types::OCI_LAYER_TAR
        };
        let media_type = image
            .media_types
            .iter()
            .find(|(pos, _)| *pos == i)
            .map_or(detected, |(_, mt)| mt.as_str());
        let digest = registry.put_blob(layer.clone())?;
        diff_ids.push(sha256_digest(&decompress(layer)));
        layer_descs.push(descriptor(media_type, digest.clone(), layer.len()));
        layer_digests.push(digest);
    }

    let config = match &image.raw_config {
        Some(raw) => raw.clone(),
        None => {
            let created_by: Vec<&str> = image.created_by.iter().map(String::as_str).collect();
            let labels: Vec<(&str, &str)> = image
                .labels
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            config_json(&diff_ids, &created_by, &labels)
        }
    };
    let config_len = config.len();
    let config_digest = registry.put_blob(config)?;

    let manifest: OciManifest = OciManifest::Image(
        serde_json::from_value(json!({
            "schemaVersion": 2,
            "mediaType": media_types::OCI_MANIFEST,
            "config": descriptor(media_types::OCI_CONFIG, config_digest, config_len),
            "layers": layer_descs,
        }))
        .unwrap(),
    );
    let manifest = match reference {
        Some(reference) => registry.put_manifest(reference, manifest)?,
        None => registry.put_child_manifest(manifest)?,
    };
    Ok(Published {
        manifest,
        layer_digests,
    })
}

/// Store an index over `children` (manifest descriptor, architecture) as `reference`.
pub fn publish_index(
    registry: &MemoryRegistry,
    reference: &Reference,
    children: &[(&OciDescriptor, &str)],
) -> ImageModResult<OciDescriptor> {
    let manifests: Vec<_> = children
        .iter()
        .map(|(desc, arch)| {
            json!({
                "mediaType": desc.media_type,
                "digest": desc.digest,
                "size": desc.size,
                "platform": { "architecture": arch, "os": "linux" },
            })
        })
        .collect();
    let index = OciManifest::ImageIndex(
        serde_json::from_value(json!({
            "schemaVersion": 2,
            "mediaType": media_types::OCI_INDEX,
            "manifests": manifests,
        }))
        .unwrap(),
    );
    registry.put_manifest(reference, index)
}

/// Context reading `source` from `registry` and writing to [`TARGET_REF`].
pub fn context(registry: Arc<MemoryRegistry>, source: &Reference) -> ExecContext {
    ExecContext::new(registry, source.clone(), reference(TARGET_REF))
}

pub fn reference(s: &str) -> Reference {
    parse_reference(s).unwrap()
}
