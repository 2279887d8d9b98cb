//! Builders for the Kubernetes objects added to an injected pod.
pub mod container;
pub mod volume;

pub use container::{ContainerBuilder, FieldPathEnvVar};
pub use volume::{VolumeBuilder, VolumeMountBuilder};
