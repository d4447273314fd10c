//! Manifest nodes of the image DAG.
//!
//! An index owns its child manifests; a leaf image owns its ordered layers and
//! optional config. The two shapes are mutually exclusive, so they are modelled
//! as variants of [`DagNode`] rather than inspected at runtime.

use oci_client::manifest::{OciDescriptor, OciImageIndex, OciImageManifest};

use super::{Change, DagLayer, DagOciConfig};

/// Content of a manifest node.
#[derive(Debug)]
pub enum DagNode {
    /// Multi-platform index; children in manifest-list order.
    Index {
        index: OciImageIndex,
        children: Vec<DagManifest>,
    },
    /// Single-platform image manifest.
    Image {
        manifest: OciImageManifest,
        config: Option<DagOciConfig>,
        layers: Vec<DagLayer>,
    },
}

/// One manifest of the image being modified.
#[derive(Debug)]
pub struct DagManifest {
    /// True only for the root being pushed.
    top: bool,
    /// Descriptor the manifest was fetched by; `None` for a root fetched by tag.
    desc: Option<OciDescriptor>,
    change: Change,
    node: DagNode,
}

impl DagManifest {
    /// Root node for a single-platform image.
    pub fn image(
        manifest: OciImageManifest,
        config: Option<DagOciConfig>,
        layers: Vec<DagLayer>,
    ) -> Self {
        Self {
            top: true,
            desc: None,
            change: Change::Unchanged,
            node: DagNode::Image {
                manifest,
                config,
                layers,
            },
        }
    }

    /// Root node for a multi-platform index. Children lose their `top` flag.
    pub fn index(index: OciImageIndex, children: Vec<DagManifest>) -> Self {
        let children = children
            .into_iter()
            .map(|mut child| {
                child.top = false;
                child
            })
            .collect();
        Self {
            top: true,
            desc: None,
            change: Change::Unchanged,
            node: DagNode::Index { index, children },
        }
    }

    /// Attach the descriptor the manifest was fetched by.
    pub fn with_descriptor(mut self, desc: OciDescriptor) -> Self {
        self.desc = Some(desc);
        self
    }

    pub fn is_top(&self) -> bool {
        self.top
    }

    pub fn is_index(&self) -> bool {
        matches!(self.node, DagNode::Index { .. })
    }

    pub fn descriptor(&self) -> Option<&OciDescriptor> {
        self.desc.as_ref()
    }

    pub fn node(&self) -> &DagNode {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut DagNode {
        &mut self.node
    }

    /// Change state of the manifest document itself.
    pub fn change(&self) -> Change {
        self.change
    }

    pub fn mark(&mut self, change: Change) {
        self.change = self.change.merge(change);
    }

    pub fn children(&self) -> &[DagManifest] {
        match &self.node {
            DagNode::Index { children, .. } => children,
            DagNode::Image { .. } => &[],
        }
    }

    pub fn children_mut(&mut self) -> &mut [DagManifest] {
        match &mut self.node {
            DagNode::Index { children, .. } => children,
            DagNode::Image { .. } => &mut [],
        }
    }

    /// Layers of a leaf image, bottom first. Empty for an index.
    pub fn layers(&self) -> &[DagLayer] {
        match &self.node {
            DagNode::Image { layers, .. } => layers,
            DagNode::Index { .. } => &[],
        }
    }

    pub fn layers_mut(&mut self) -> &mut [DagLayer] {
        match &mut self.node {
            DagNode::Image { layers, .. } => layers,
            DagNode::Index { .. } => &mut [],
        }
    }

    pub fn config(&self) -> Option<&DagOciConfig> {
        match &self.node {
            DagNode::Image { config, .. } => config.as_ref(),
            DagNode::Index { .. } => None,
        }
    }

    pub fn config_mut(&mut self) -> Option<&mut DagOciConfig> {
        match &mut self.node {
            DagNode::Image { config, .. } => config.as_mut(),
            DagNode::Index { .. } => None,
        }
    }

    /// Insert a layer into a leaf image at physical slot `pos`.
    ///
    /// Returns `false` (and drops nothing) when called on an index or with an
    /// out-of-range slot.
    pub fn insert_layer(&mut self, pos: usize, layer: DagLayer) -> bool {
        match &mut self.node {
            DagNode::Image { layers, .. } if pos <= layers.len() => {
                layers.insert(pos, layer);
                true
            }
            _ => false,
        }
    }

    /// Whether anything in this subtree needs regeneration.
    pub fn modified(&self) -> bool {
        if self.change.is_modified() {
            return true;
        }
        match &self.node {
            DagNode::Index { children, .. } => children.iter().any(DagManifest::modified),
            DagNode::Image { config, layers, .. } => {
                config.as_ref().is_some_and(|c| c.change().is_modified())
                    || layers.iter().any(|l| l.change().is_modified())
            }
        }
    }

    /// Leaf image nodes in depth-first order.
    pub fn images(&self) -> Vec<&DagManifest> {
        let mut out = Vec::new();
        collect_images(self, &mut out);
        out
    }
}

fn collect_images<'a>(dm: &'a DagManifest, out: &mut Vec<&'a DagManifest>) {
    match &dm.node {
        DagNode::Index { children, .. } => {
            for child in children {
                collect_images(child, out);
            }
        }
        DagNode::Image { .. } => out.push(dm),
    }
}
