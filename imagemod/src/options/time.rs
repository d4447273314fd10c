//! Timestamp options: layer entry times and times inside a nested archive.

use std::io::Read;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imagemod_shared::errors::{ImageModError, ImageModResult};
use serde::{Deserialize, Serialize};

use super::Opt;
use crate::archive::{EntryHeader, TimeRule, rewrite_nested_times};
use crate::base::BaseDigests;
use crate::context::ExecContext;
use crate::dag::{DagLayer, DagManifest, DagOciConfig};
use crate::pipeline::{FileEdit, Hooks, Step};
use crate::registry::parse_reference;

/// Time adjustment policy.
///
/// `set` or `from_label` must provide the target time. When both are given the
/// label value has to agree with `set`. With `after`, only timestamps later
/// than the bound are changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptTime {
    pub set: Option<DateTime<Utc>>,
    /// Config label holding an RFC 3339 time.
    pub from_label: Option<String>,
    pub after: Option<DateTime<Utc>>,
    /// Image whose layers are left untouched.
    pub base_ref: Option<String>,
    /// Number of leading original layers left untouched.
    pub base_layers: usize,
}

impl OptTime {
    pub fn set(t: DateTime<Utc>) -> Self {
        Self {
            set: Some(t),
            ..Default::default()
        }
    }

    pub fn from_label(label: impl Into<String>) -> Self {
        Self {
            from_label: Some(label.into()),
            ..Default::default()
        }
    }

    /// Change only times later than `t`, setting them to `t`.
    pub fn max(t: DateTime<Utc>) -> Self {
        Self {
            set: Some(t),
            after: Some(t),
            ..Default::default()
        }
    }

    pub fn with_after(mut self, after: DateTime<Utc>) -> Self {
        self.after = Some(after);
        self
    }

    pub fn with_base_ref(mut self, base_ref: impl Into<String>) -> Self {
        self.base_ref = Some(base_ref.into());
        self
    }

    pub fn with_base_layers(mut self, count: usize) -> Self {
        self.base_layers = count;
        self
    }
}

// ============================================================================
// Shared state of the time options
// ============================================================================

/// Resolved target time plus the base layer exclusion of one time option.
#[derive(Debug)]
struct TimeTarget {
    option: &'static str,
    resolved: Option<DateTime<Utc>>,
    from_label: Option<String>,
    after: Option<DateTime<Utc>>,
    /// Use the resolved time as the `after` bound too.
    clamp: bool,
    base_layers: usize,
    base: BaseDigests,
}

impl TimeTarget {
    fn new(option: &'static str, opt: OptTime) -> ImageModResult<Self> {
        let from_label = opt.from_label.filter(|l| !l.is_empty());
        if opt.set.is_none() && from_label.is_none() {
            return Err(ImageModError::Config(format!(
                "{} requires a time to set",
                option
            )));
        }
        let base_ref = match opt.base_ref.as_deref().filter(|r| !r.is_empty()) {
            Some(r) => Some(parse_reference(r)?),
            None => None,
        };
        Ok(Self {
            option,
            resolved: opt.set,
            from_label,
            after: opt.after,
            clamp: false,
            base_layers: opt.base_layers,
            base: BaseDigests::new(base_ref),
        })
    }

    fn hooks(&self) -> Hooks {
        let mut hooks = Hooks::none().layer_file();
        if self.from_label.is_some() {
            hooks = hooks.oci_config();
        }
        if self.base_layers > 0 {
            hooks = hooks.manifest();
        }
        hooks
    }

    /// Read the label from `config`; it must agree with any time already known.
    fn apply_label(&mut self, config: &DagOciConfig) -> ImageModResult<()> {
        let Some(label) = self.from_label.as_deref() else {
            return Ok(());
        };
        let value = config
            .label(label)
            .ok_or_else(|| ImageModError::NotFound(format!("label not found: {}", label)))?;
        let parsed = DateTime::parse_from_rfc3339(value)
            .map_err(|e| {
                ImageModError::Config(format!(
                    "could not parse time {} from {}: {}",
                    value, label, e
                ))
            })?
            .with_timezone(&Utc);
        match self.resolved {
            Some(current) if current != parsed => Err(ImageModError::Conflict(format!(
                "conflicting time labels found {} and {}",
                current.to_rfc3339(),
                parsed.to_rfc3339()
            ))),
            _ => {
                tracing::debug!(label = %label, time = %parsed, "Resolved time from label");
                self.resolved = Some(parsed);
                Ok(())
            }
        }
    }

    fn add_base_layers(&mut self, dm: &DagManifest) {
        if dm.is_top() {
            self.base.add_count(self.base_layers, dm);
        }
    }

    fn rule(&self) -> ImageModResult<TimeRule> {
        let set = self.resolved.ok_or_else(|| {
            ImageModError::InvalidState(format!("{}: timestamp not available", self.option))
        })?;
        let after = if self.clamp { Some(set) } else { self.after };
        Ok(TimeRule::new(set, after))
    }

    fn is_base(&self, layer: &DagLayer) -> bool {
        self.base.contains(layer.digest())
    }
}

// ============================================================================
// Layer timestamps
// ============================================================================

struct LayerTimestamp {
    target: TimeTarget,
}

#[async_trait]
impl Step for LayerTimestamp {
    fn name(&self) -> &'static str {
        "layer_timestamp"
    }

    fn hooks(&self) -> Hooks {
        self.target.hooks()
    }

    async fn oci_config(
        &mut self,
        _ctx: &ExecContext,
        config: &mut DagOciConfig,
    ) -> ImageModResult<()> {
        self.target.apply_label(config)
    }

    async fn manifest(&mut self, _ctx: &ExecContext, dm: &mut DagManifest) -> ImageModResult<()> {
        self.target.add_base_layers(dm);
        Ok(())
    }

    async fn begin_layer(&mut self, ctx: &ExecContext, _layer: &DagLayer) -> ImageModResult<()> {
        self.target.base.resolve(ctx).await
    }

    fn layer_file<'a>(
        &mut self,
        _ctx: &ExecContext,
        layer: &DagLayer,
        mut header: EntryHeader,
        content: Box<dyn Read + 'a>,
    ) -> ImageModResult<FileEdit<'a>> {
        let rule = self.target.rule()?;
        if self.target.is_base(layer) {
            return Ok(FileEdit::unchanged(header, content));
        }
        if header.apply_times(&rule) {
            return Ok(FileEdit::replaced(header, content));
        }
        Ok(FileEdit::unchanged(header, content))
    }
}

/// Adjust the non-zero timestamps of every entry of every non-base layer.
pub fn with_layer_timestamp(opt: OptTime) -> ImageModResult<Opt> {
    let target = TimeTarget::new("with_layer_timestamp", opt)?;
    Ok(Opt::from_step(LayerTimestamp { target }))
}

/// Clamp every entry timestamp later than `t` down to `t`.
pub fn with_layer_timestamp_max(t: DateTime<Utc>) -> ImageModResult<Opt> {
    with_layer_timestamp(OptTime::max(t))
}

/// Clamp every entry timestamp later than the time in config label `label`
/// down to that time.
pub fn with_layer_timestamp_from_label(label: &str) -> ImageModResult<Opt> {
    let mut target = TimeTarget::new(
        "with_layer_timestamp_from_label",
        OptTime::from_label(label),
    )?;
    target.clamp = true;
    Ok(Opt::from_step(LayerTimestamp { target }))
}

// ============================================================================
// Timestamps inside a nested archive
// ============================================================================

struct FileTarTime {
    name: String,
    target: TimeTarget,
}

#[async_trait]
impl Step for FileTarTime {
    fn name(&self) -> &'static str {
        "file_tar_time"
    }

    fn hooks(&self) -> Hooks {
        self.target.hooks()
    }

    async fn oci_config(
        &mut self,
        _ctx: &ExecContext,
        config: &mut DagOciConfig,
    ) -> ImageModResult<()> {
        self.target.apply_label(config)
    }

    async fn manifest(&mut self, _ctx: &ExecContext, dm: &mut DagManifest) -> ImageModResult<()> {
        self.target.add_base_layers(dm);
        Ok(())
    }

    async fn begin_layer(&mut self, ctx: &ExecContext, _layer: &DagLayer) -> ImageModResult<()> {
        self.target.base.resolve(ctx).await
    }

    fn layer_file<'a>(
        &mut self,
        ctx: &ExecContext,
        layer: &DagLayer,
        mut header: EntryHeader,
        mut content: Box<dyn Read + 'a>,
    ) -> ImageModResult<FileEdit<'a>> {
        let rule = self.target.rule()?;
        if self.target.is_base(layer) || header.name.trim_start_matches('/') != self.name {
            return Ok(FileEdit::unchanged(header, content));
        }

        let rewrite = rewrite_nested_times(
            &mut content,
            &header.name,
            &rule,
            ctx.temp_file()?,
            ctx.temp_file()?,
        )?;
        header.size = rewrite.size;
        let reader: Box<dyn Read + 'a> = Box::new(rewrite.reader);
        if rewrite.changed {
            Ok(FileEdit::replaced(header, reader))
        } else {
            Ok(FileEdit::unchanged(header, reader))
        }
    }
}

/// Adjust timestamps inside the tar archive stored at `name` in each layer.
pub fn with_file_tar_time(name: &str, opt: OptTime) -> ImageModResult<Opt> {
    let trimmed = name.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(ImageModError::Config(
            "with_file_tar_time requires a file name".into(),
        ));
    }
    let target = TimeTarget::new("with_file_tar_time", opt)?;
    Ok(Opt::from_step(FileTarTime {
        name: trimmed.to_string(),
        target,
    }))
}

/// Clamp timestamps later than `t` inside the tar archive stored at `name`.
pub fn with_file_tar_time_max(name: &str, t: DateTime<Utc>) -> ImageModResult<Opt> {
    with_file_tar_time(name, OptTime::max(t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_client::manifest::OciDescriptor;
    use oci_spec::image::ImageConfiguration;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn config_with_label(value: &str) -> DagOciConfig {
        let config: ImageConfiguration = serde_json::from_value(serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": {"type": "layers", "diff_ids": []},
            "config": {"Labels": {"build.time": value}}
        }))
        .unwrap();
        DagOciConfig::new(OciDescriptor::default(), config)
    }

    #[test]
    fn test_requires_time_source() {
        let err = with_layer_timestamp(OptTime::default()).unwrap_err();
        assert!(err.is_config());

        let err = with_layer_timestamp(OptTime::from_label("")).unwrap_err();
        assert!(err.is_config());

        assert!(with_layer_timestamp(OptTime::set(ts(1))).is_ok());
        assert!(with_layer_timestamp(OptTime::from_label("build.time")).is_ok());
    }

    #[test]
    fn test_invalid_base_ref_is_config_error() {
        assert!(with_layer_timestamp(OptTime::set(ts(1)).with_base_ref("")).is_ok());

        let err = with_file_tar_time("a.tar", OptTime::set(ts(1)).with_base_ref("Bad Ref!"))
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_hooks_follow_policy() {
        let target = TimeTarget::new("t", OptTime::set(ts(1))).unwrap();
        assert_eq!(target.hooks(), Hooks::none().layer_file());

        let target = TimeTarget::new(
            "t",
            OptTime::from_label("build.time").with_base_layers(2),
        )
        .unwrap();
        assert!(target.hooks().oci_config);
        assert!(target.hooks().manifest);
        assert!(target.hooks().layer_file);
    }

    #[test]
    fn test_label_resolves_time() {
        let mut target = TimeTarget::new("t", OptTime::from_label("build.time")).unwrap();
        assert!(matches!(
            target.rule(),
            Err(ImageModError::InvalidState(_))
        ));

        target
            .apply_label(&config_with_label("2024-01-02T03:04:05Z"))
            .unwrap();
        assert_eq!(
            target.rule().unwrap().set,
            DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
                .unwrap()
                .with_timezone(&Utc)
        );
    }

    #[test]
    fn test_label_clamp_bounds_at_resolved_time() {
        let mut target = TimeTarget::new("t", OptTime::from_label("build.time")).unwrap();
        target.clamp = true;
        target
            .apply_label(&config_with_label("1970-01-01T00:16:40Z"))
            .unwrap();

        let rule = target.rule().unwrap();
        assert_eq!(rule.set, ts(1000));
        assert_eq!(rule.after, Some(ts(1000)));
        assert!(with_layer_timestamp_from_label("").unwrap_err().is_config());
    }

    #[test]
    fn test_label_conflicts_with_set() {
        let opt = OptTime {
            set: Some(ts(0)),
            from_label: Some("build.time".into()),
            ..Default::default()
        };
        let mut target = TimeTarget::new("t", opt).unwrap();
        let err = target
            .apply_label(&config_with_label("2024-01-02T03:04:05Z"))
            .unwrap_err();
        assert!(matches!(err, ImageModError::Conflict(_)));
    }

    #[test]
    fn test_label_missing_or_malformed() {
        let mut target = TimeTarget::new("t", OptTime::from_label("other")).unwrap();
        let err = target
            .apply_label(&config_with_label("2024-01-02T03:04:05Z"))
            .unwrap_err();
        assert!(matches!(err, ImageModError::NotFound(_)));

        let mut target = TimeTarget::new("t", OptTime::from_label("build.time")).unwrap();
        let err = target
            .apply_label(&config_with_label("yesterday"))
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_opt_time_from_json() {
        let opt: OptTime = serde_json::from_value(serde_json::json!({
            "set": "2024-01-02T03:04:05Z",
            "base_layers": 3
        }))
        .unwrap();
        assert_eq!(opt.base_layers, 3);
        assert!(opt.set.is_some());
        assert_eq!(opt.from_label, None);
    }

    #[test]
    fn test_file_tar_time_requires_name() {
        assert!(with_file_tar_time("/", OptTime::set(ts(1))).unwrap_err().is_config());
        assert!(with_file_tar_time_max("/opt/app.tar", ts(1)).is_ok());
    }
}
