//! Image config node of the DAG.

use std::collections::HashMap;

use oci_client::manifest::OciDescriptor;
use oci_spec::image::{History, ImageConfiguration};

use super::Change;

/// Decoded OCI image config owned by a leaf image node.
#[derive(Debug, Clone)]
pub struct DagOciConfig {
    desc: OciDescriptor,
    config: ImageConfiguration,
    change: Change,
}

impl DagOciConfig {
    pub fn new(desc: OciDescriptor, config: ImageConfiguration) -> Self {
        Self {
            desc,
            config,
            change: Change::Unchanged,
        }
    }

    pub fn descriptor(&self) -> &OciDescriptor {
        &self.desc
    }

    pub fn config(&self) -> &ImageConfiguration {
        &self.config
    }

    /// Replace the decoded config; the blob must be regenerated.
    pub fn set_config(&mut self, config: ImageConfiguration) {
        self.config = config;
        self.change = self.change.merge(Change::Replaced);
    }

    pub fn change(&self) -> Change {
        self.change
    }

    /// Labels from the runtime config section.
    pub fn labels(&self) -> Option<&HashMap<String, String>> {
        self.config
            .config()
            .as_ref()
            .and_then(|cfg| cfg.labels().as_ref())
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels()
            .and_then(|labels| labels.get(name))
            .map(String::as_str)
    }

    /// History entries, in config order.
    pub fn history(&self) -> &[History] {
        self.config.history().as_deref().unwrap_or_default()
    }

    /// `created_by` of every history entry that produced a layer, in layer order.
    ///
    /// Entries flagged `empty_layer` have no layer and are skipped, so index
    /// `i` of the result lines up with original layer position `i`.
    pub fn layer_history(&self) -> Vec<&str> {
        self.history()
            .iter()
            .filter(|h| !h.empty_layer().unwrap_or(false))
            .map(|h| h.created_by().as_deref().unwrap_or(""))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from_json(json: serde_json::Value) -> DagOciConfig {
        let config: ImageConfiguration = serde_json::from_value(json).unwrap();
        DagOciConfig::new(OciDescriptor::default(), config)
    }

    #[test]
    fn test_layer_history_skips_empty_layers() {
        let cfg = config_from_json(serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": {"type": "layers", "diff_ids": []},
            "history": [
                {"created_by": "/bin/sh -c #(nop) ADD file:abc in /"},
                {"created_by": "/bin/sh -c #(nop) ENV A=1", "empty_layer": true},
                {"created_by": "/bin/sh -c apk add curl"},
            ]
        }));

        assert_eq!(
            cfg.layer_history(),
            vec!["/bin/sh -c #(nop) ADD file:abc in /", "/bin/sh -c apk add curl"]
        );
        assert_eq!(cfg.history().len(), 3);
    }

    #[test]
    fn test_labels() {
        let cfg = config_from_json(serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": {"type": "layers", "diff_ids": []},
            "config": {"Labels": {"org.opencontainers.image.created": "2024-01-02T03:04:05Z"}}
        }));

        assert_eq!(
            cfg.label("org.opencontainers.image.created"),
            Some("2024-01-02T03:04:05Z")
        );
        assert_eq!(cfg.label("missing"), None);
    }

    #[test]
    fn test_set_config_marks_replaced() {
        let mut cfg = config_from_json(serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": {"type": "layers", "diff_ids": []}
        }));
        assert_eq!(cfg.change(), Change::Unchanged);

        let replacement = cfg.config().clone();
        cfg.set_config(replacement);
        assert_eq!(cfg.change(), Change::Replaced);
    }
}
