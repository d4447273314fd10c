//! Option constructors.
//!
//! Every constructor validates its arguments immediately and returns an [`Opt`]
//! that registers one step when the operation runs. Options hold per-run state
//! (resolved times, base layer sets), so a fresh set must be built for each
//! modify operation.

mod layer;
mod time;

pub use layer::{
    with_layer_reproducible, with_layer_rm_created_by, with_layer_rm_index, with_layer_strip_file,
};
pub use time::{
    OptTime, with_file_tar_time, with_file_tar_time_max, with_layer_timestamp,
    with_layer_timestamp_from_label, with_layer_timestamp_max,
};

use std::fmt;

use crate::pipeline::{Pipeline, Step};

/// A configured edit, ready to be registered into a pipeline.
pub struct Opt {
    step: Box<dyn Step>,
}

impl Opt {
    /// Wrap a custom step.
    pub fn from_step(step: impl Step + 'static) -> Self {
        Self {
            step: Box::new(step),
        }
    }

    pub fn name(&self) -> &'static str {
        self.step.name()
    }

    pub(crate) fn register(self, pipeline: &mut Pipeline) {
        pipeline.register(self.step);
    }
}

impl fmt::Debug for Opt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Opt")
            .field("step", &self.step.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opts_register_into_their_phases() {
        let mut pipeline = Pipeline::new();
        with_layer_reproducible().register(&mut pipeline);
        with_layer_rm_index(0).register(&mut pipeline);
        with_layer_timestamp(OptTime::from_label("created").with_base_layers(1))
            .unwrap()
            .register(&mut pipeline);

        assert_eq!(pipeline.len(), 3);
        assert_eq!(pipeline.registry_sizes(), (1, 2, 2));
    }

    #[test]
    fn test_opt_debug_names_step() {
        let opt = with_layer_strip_file("tmp").unwrap();
        assert_eq!(opt.name(), "layer_strip_file");
        assert_eq!(format!("{:?}", opt), "Opt { step: \"layer_strip_file\" }");
    }
}
