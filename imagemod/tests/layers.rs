//! Integration tests for the layer options: ownership normalization, file
//! stripping and layer deletion.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use async_trait::async_trait;
use imagemod::archive::{EntryHeader, sha256_digest};
use imagemod::{
    Change, DagLayer, DagManifest, ExecContext, FileEdit, Hooks, ImageModError, ImageModResult,
    MemoryRegistry, Opt, Step, modify, with_layer_reproducible, with_layer_rm_created_by,
    with_layer_rm_index, with_layer_strip_file,
};
use imagemod_test_utils::{
    ImageFixture, TarFixture, context, decompress, gzip, publish_image, publish_index,
    read_entries, reference,
};
use oci_client::manifest::OciDescriptor;
use proptest::prelude::*;
use tar::EntryType;

const SOURCE: &str = "registry.example.com/test/app:1";

fn rewritten_bytes(layer: &DagLayer) -> Vec<u8> {
    let blob = layer.rewritten().expect("layer was not rewritten");
    let mut data = Vec::new();
    blob.open().unwrap().read_to_end(&mut data).unwrap();
    data
}

fn single_image(image: ImageFixture) -> (Arc<MemoryRegistry>, ExecContext) {
    let registry = Arc::new(MemoryRegistry::new());
    let source = reference(SOURCE);
    publish_image(&registry, Some(&source), &image).unwrap();
    let ctx = context(registry.clone(), &source);
    (registry, ctx)
}

fn simple_layer(name: &str) -> Vec<u8> {
    TarFixture::new().file(name, name.as_bytes(), 1000).into_bytes()
}

// ============================================================================
// Reproducible ownership
// ============================================================================

#[tokio::test]
async fn test_reproducible_clears_names_and_is_idempotent() {
    let layer = TarFixture::new()
        .dir("etc/", 1000)
        .file("etc/passwd", b"root:x:0:0::/root:/bin/sh\n", 1000)
        .into_bytes();
    let (_registry, ctx) = single_image(ImageFixture::new(vec![layer]));

    let dm = modify(&ctx, vec![with_layer_reproducible()]).await.unwrap();
    assert!(dm.modified());
    let first = &dm.layers()[0];
    assert_eq!(first.change(), Change::Replaced);

    let data = rewritten_bytes(first);
    let entries = read_entries(&data);
    assert_eq!(entries.len(), 2);
    for entry in &entries {
        assert_eq!(entry.uname, "");
        assert_eq!(entry.gname, "");
        assert_eq!(entry.mtime, 1000);
    }
    assert_eq!(entries[1].content, b"root:x:0:0::/root:/bin/sh\n");

    // A second pass over the normalized layer has nothing left to do.
    let (registry, ctx) = single_image(ImageFixture::new(vec![data.clone()]));
    let dm = modify(&ctx, vec![with_layer_reproducible()]).await.unwrap();
    assert!(!dm.modified());
    assert_eq!(dm.layers()[0].change(), Change::Unchanged);
    assert!(dm.layers()[0].rewritten().is_none());
    assert_eq!(dm.layers()[0].descriptor().digest, sha256_digest(&data));
    assert_eq!(registry.blob_fetches(), 2);
}

#[tokio::test]
async fn test_rewritten_descriptor_matches_content() {
    let layer = gzip(&simple_layer("bin/app"));
    let (_registry, ctx) = single_image(ImageFixture::new(vec![layer.clone()]));

    let dm = modify(&ctx, vec![with_layer_reproducible()]).await.unwrap();
    let layer_node = &dm.layers()[0];
    let blob = layer_node.rewritten().unwrap();
    let data = rewritten_bytes(layer_node);

    assert!(data.starts_with(&[0x1f, 0x8b]), "compression not kept");
    assert_eq!(blob.descriptor().digest, sha256_digest(&data));
    assert_eq!(blob.descriptor().size, data.len() as i64);
    assert_eq!(
        blob.descriptor().media_type,
        layer_node.original_descriptor().media_type
    );
    assert_eq!(blob.diff_id(), sha256_digest(&decompress(&data)));
    assert_ne!(blob.descriptor().digest, sha256_digest(&layer));
}

#[tokio::test]
async fn test_global_pax_header_is_copied_through() {
    let layer = TarFixture::new()
        .pax_global(&[("comment", "hello!!")])
        .file("etc/motd", b"welcome\n", 1000)
        .into_bytes();
    let (_registry, ctx) = single_image(ImageFixture::new(vec![layer]));

    let dm = modify(&ctx, vec![with_layer_reproducible()]).await.unwrap();
    let entries = read_entries(&rewritten_bytes(&dm.layers()[0]));

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].entry_type, EntryType::XGlobalHeader);
    assert_eq!(entries[0].name, "pax_global_header");
    assert_eq!(entries[0].content, b"19 comment=hello!!\n");
    assert_eq!(entries[1].name, "etc/motd");
    assert_eq!(entries[1].uname, "");
    assert_eq!(entries[1].content, b"welcome\n");
}

#[tokio::test]
async fn test_non_tar_layers_are_skipped() {
    let image = ImageFixture::new(vec![simple_layer("bin/app"), b"{}".to_vec()])
        .media_type(1, "application/vnd.oci.empty.v1+json");
    let (registry, ctx) = single_image(image);

    let dm = modify(&ctx, vec![with_layer_reproducible()]).await.unwrap();

    assert_eq!(dm.layers()[0].change(), Change::Replaced);
    assert_eq!(dm.layers()[1].change(), Change::Unchanged);
    assert!(dm.layers()[1].rewritten().is_none());
    // Config and the tar layer; the empty blob is never fetched.
    assert_eq!(registry.blob_fetches(), 2);
}

/// Records the thread each layer entry is edited on.
struct RecordThread {
    seen: Arc<Mutex<Vec<ThreadId>>>,
}

#[async_trait]
impl Step for RecordThread {
    fn name(&self) -> &'static str {
        "record_thread"
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
        self.seen.lock().unwrap().push(thread::current().id());
        Ok(FileEdit::unchanged(header, content))
    }
}

#[tokio::test]
async fn test_layer_entries_are_rewritten_off_the_runtime_thread() {
    let (_registry, ctx) = single_image(ImageFixture::new(vec![simple_layer("bin/app")]));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let opts = vec![
        Opt::from_step(RecordThread { seen: seen.clone() }),
        with_layer_reproducible(),
    ];
    let dm = modify(&ctx, opts).await.unwrap();

    assert_eq!(dm.layers()[0].change(), Change::Replaced);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_ne!(seen[0], thread::current().id());
}

// ============================================================================
// File strip
// ============================================================================

#[tokio::test]
async fn test_strip_file_removes_path_and_subtree() {
    let layer = TarFixture::new()
        .file_raw_name("/etc/conf", b"abs", 1000)
        .file("etc/conf/sub.txt", b"sub", 1000)
        .file("etc/confsomething", b"keep", 1000)
        .file("etc/other", b"keep", 1000)
        .into_bytes();
    let (_registry, ctx) = single_image(ImageFixture::new(vec![gzip(&layer)]));

    let dm = modify(&ctx, vec![with_layer_strip_file("/etc/conf/").unwrap()])
        .await
        .unwrap();
    assert_eq!(dm.layers()[0].change(), Change::Replaced);

    let names: Vec<_> = read_entries(&rewritten_bytes(&dm.layers()[0]))
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, ["etc/confsomething", "etc/other"]);
}

#[tokio::test]
async fn test_strip_file_without_match_keeps_layer() {
    let (_registry, ctx) = single_image(ImageFixture::new(vec![simple_layer("usr/bin/env")]));

    let dm = modify(&ctx, vec![with_layer_strip_file("tmp").unwrap()])
        .await
        .unwrap();
    assert!(!dm.modified());
    assert!(dm.layers()[0].rewritten().is_none());
}

#[test]
fn test_strip_file_rejects_empty_path() {
    assert!(with_layer_strip_file("").unwrap_err().is_config());
    assert!(with_layer_strip_file("//").unwrap_err().is_config());
}

// ============================================================================
// Delete by index
// ============================================================================

/// Inserts an added layer at a physical slot during the manifest phase.
struct InsertLayer {
    slot: usize,
}

#[async_trait]
impl Step for InsertLayer {
    fn name(&self) -> &'static str {
        "insert_layer"
    }

    fn hooks(&self) -> Hooks {
        Hooks::none().manifest()
    }

    async fn manifest(&mut self, _ctx: &ExecContext, dm: &mut DagManifest) -> ImageModResult<()> {
        let desc = OciDescriptor {
            media_type: imagemod_shared::constants::media_types::OCI_LAYER_TAR.to_string(),
            digest: "sha256:added".to_string(),
            size: 0,
            ..Default::default()
        };
        assert!(dm.insert_layer(self.slot, DagLayer::added(desc)));
        Ok(())
    }
}

#[tokio::test]
async fn test_rm_index_skips_added_layers() {
    let layers = vec![simple_layer("l0"), simple_layer("l1"), simple_layer("l2")];
    let (registry, ctx) = single_image(ImageFixture::new(layers));

    let dm = modify(
        &ctx,
        vec![
            Opt::from_step(InsertLayer { slot: 1 }),
            with_layer_rm_index(1),
        ],
    )
    .await
    .unwrap();

    let changes: Vec<_> = dm.layers().iter().map(DagLayer::change).collect();
    assert_eq!(
        changes,
        [
            Change::Unchanged,
            Change::Added,
            Change::Deleted,
            Change::Unchanged
        ]
    );
    assert_eq!(dm.layers()[2].original_index(), Some(1));
    // Only the config blob was read; no layer-file steps were registered.
    assert_eq!(registry.blob_fetches(), 1);
}

#[tokio::test]
async fn test_rm_index_out_of_range() {
    let (_registry, ctx) = single_image(ImageFixture::new(vec![simple_layer("a")]));
    let err = modify(&ctx, vec![with_layer_rm_index(3)]).await.unwrap_err();
    assert!(matches!(err, ImageModError::NotFound(_)), "{}", err);
}

#[tokio::test]
async fn test_rm_index_rejects_index_manifest() {
    let registry = Arc::new(MemoryRegistry::new());
    let child = publish_image(&registry, None, &ImageFixture::new(vec![simple_layer("a")])).unwrap();
    let source = reference(SOURCE);
    publish_index(&registry, &source, &[(&child.manifest, "amd64")]).unwrap();

    let ctx = context(registry, &source);
    let err = modify(&ctx, vec![with_layer_rm_index(0)]).await.unwrap_err();
    assert!(matches!(err, ImageModError::InvalidState(_)), "{}", err);
}

#[tokio::test]
async fn test_rm_index_requires_config() {
    let image = ImageFixture::new(vec![simple_layer("a")]).raw_config(b"not a config");
    let (_registry, ctx) = single_image(image);
    let err = modify(&ctx, vec![with_layer_rm_index(0)]).await.unwrap_err();
    assert!(matches!(err, ImageModError::InvalidState(_)), "{}", err);
}

// ============================================================================
// Delete by history
// ============================================================================

#[tokio::test]
async fn test_rm_created_by_deletes_matching_layers() {
    let image = ImageFixture::new(vec![simple_layer("a"), simple_layer("b"), simple_layer("c")])
        .created_by(&[
            "RUN apt-get install -y curl",
            "COPY app /app",
            "RUN apt-get clean",
        ]);
    let (_registry, ctx) = single_image(image);

    let dm = modify(&ctx, vec![with_layer_rm_created_by("^RUN apt-get").unwrap()])
        .await
        .unwrap();
    let changes: Vec<_> = dm.layers().iter().map(DagLayer::change).collect();
    assert_eq!(
        changes,
        [Change::Deleted, Change::Unchanged, Change::Deleted]
    );
}

#[tokio::test]
async fn test_rm_created_by_aligns_history_with_layers() {
    let registry = Arc::new(MemoryRegistry::new());
    let source = reference(SOURCE);
    let layers = vec![simple_layer("a"), simple_layer("b")];
    let diff_ids: Vec<_> = layers.iter().map(|l| sha256_digest(l)).collect();
    let config = serde_json::to_vec(&serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "rootfs": { "type": "layers", "diff_ids": diff_ids },
        "history": [
            { "created_by": "ENV PATH=/bin", "empty_layer": true },
            { "created_by": "RUN make" },
            { "created_by": "LABEL a=b", "empty_layer": true },
            { "created_by": "COPY out /out" },
        ],
    }))
    .unwrap();
    publish_image(
        &registry,
        Some(&source),
        &ImageFixture::new(layers).raw_config(&config),
    )
    .unwrap();

    let ctx = context(registry, &source);
    let dm = modify(&ctx, vec![with_layer_rm_created_by("^COPY").unwrap()])
        .await
        .unwrap();
    assert_eq!(dm.layers()[0].change(), Change::Unchanged);
    assert_eq!(dm.layers()[1].change(), Change::Deleted);
}

#[tokio::test]
async fn test_rm_created_by_applies_to_each_platform() {
    let registry = Arc::new(MemoryRegistry::new());
    let amd = publish_image(
        &registry,
        None,
        &ImageFixture::new(vec![simple_layer("amd"), simple_layer("debug")])
            .created_by(&["ADD rootfs", "RUN install-debug-tools"]),
    )
    .unwrap();
    let arm = publish_image(
        &registry,
        None,
        &ImageFixture::new(vec![simple_layer("debug-arm"), simple_layer("arm")])
            .created_by(&["RUN install-debug-tools", "ADD rootfs"]),
    )
    .unwrap();
    let source = reference(SOURCE);
    publish_index(
        &registry,
        &source,
        &[(&amd.manifest, "amd64"), (&arm.manifest, "arm64")],
    )
    .unwrap();

    let ctx = context(registry, &source);
    let dm = modify(&ctx, vec![with_layer_rm_created_by("debug").unwrap()])
        .await
        .unwrap();
    assert!(dm.is_index());
    let children = dm.children();
    assert_eq!(children[0].layers()[1].change(), Change::Deleted);
    assert_eq!(children[0].layers()[0].change(), Change::Unchanged);
    assert_eq!(children[1].layers()[0].change(), Change::Deleted);
    assert_eq!(children[1].layers()[1].change(), Change::Unchanged);
    assert!(dm.modified());
}

#[tokio::test]
async fn test_rm_created_by_no_match() {
    let (_registry, ctx) = single_image(ImageFixture::new(vec![simple_layer("a")]));
    let err = modify(&ctx, vec![with_layer_rm_created_by("^RUN yum").unwrap()])
        .await
        .unwrap_err();
    assert!(matches!(err, ImageModError::NotFound(_)), "{}", err);
}

#[test]
fn test_rm_created_by_rejects_bad_pattern() {
    assert!(with_layer_rm_created_by("").unwrap_err().is_config());
    assert!(with_layer_rm_created_by("(unclosed").unwrap_err().is_config());
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancelled_context_aborts_before_fetching() {
    let (registry, ctx) = single_image(ImageFixture::new(vec![simple_layer("a")]));
    let token = tokio_util::sync::CancellationToken::new();
    token.cancel();
    let ctx = ctx.with_cancellation(token);

    let err = modify(&ctx, vec![with_layer_reproducible()]).await.unwrap_err();
    assert!(matches!(err, ImageModError::Cancelled));
    assert_eq!(registry.manifest_fetches(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_strip_keeps_siblings_with_shared_prefix(suffix in "[a-z]{1,8}") {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let layer = TarFixture::new()
            .file("opt/data", b"x", 1)
            .file(&format!("opt/data{}", suffix), b"y", 1)
            .file(&format!("opt/data/{}", suffix), b"z", 1)
            .into_bytes();
        let (_registry, ctx) = single_image(ImageFixture::new(vec![layer]));

        let dm = runtime
            .block_on(modify(&ctx, vec![with_layer_strip_file("opt/data").unwrap()]))
            .unwrap();
        let names: Vec<_> = read_entries(&rewritten_bytes(&dm.layers()[0]))
            .into_iter()
            .map(|e| e.name)
            .collect();
        prop_assert_eq!(names, vec![format!("opt/data{}", suffix)]);
    }
}
