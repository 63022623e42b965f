//! Node rollout: working-set selection, template building and the stage machine.

pub mod machine;
pub mod selector;
pub mod template;

pub use machine::{PassEvent, PassOutcome, StageMachine};
pub use template::{SecretBootstrapStore, TemplateBuilder};
