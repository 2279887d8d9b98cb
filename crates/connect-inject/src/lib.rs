//! Compiles the sidecar containers Consul Connect injects into a workload.
//!
//! A workload opts into the service mesh with a handful of annotations. This crate reads those
//! annotations, validates the small grammars they use (health checks, upstreams, tags and the
//! metrics bind address) and turns them into an init container, which registers the workload
//! with Consul and generates the Envoy bootstrap, and a sidecar container running Envoy, which
//! deregisters the workload again before it stops.
//!
//! The whole pipeline is a pure function of the [`Pod`](k8s_openapi::api::core::v1::Pod) and
//! the process-wide [`InjectorConfig`]:
//!
//! ```
//! use connect_inject::{InjectorConfig, inject::SidecarInjection};
//! use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
//!
//! let mut pod = Pod {
//!     spec: Some(PodSpec {
//!         containers: vec![Container {
//!             name: "web".to_owned(),
//!             ..Container::default()
//!         }],
//!         ..PodSpec::default()
//!     }),
//!     ..Pod::default()
//! };
//! connect_inject::annotations::default_annotations(&mut pod);
//!
//! let injection = SidecarInjection::build(&pod, &InjectorConfig::default()).unwrap();
//! injection.apply_to(&mut pod);
//!
//! let spec = pod.spec.unwrap();
//! assert_eq!(spec.containers.len(), 2);
//! assert_eq!(spec.init_containers.unwrap().len(), 1);
//! ```

pub mod annotations;
pub mod bind_address;
pub mod builder;
pub mod checks;
pub mod cli;
pub mod config;
pub mod descriptor;
pub mod inject;
pub mod logging;
pub mod ports;
pub mod render;
pub mod tags;
pub mod upstreams;

// External re-exports
pub use k8s_openapi;

pub use crate::{annotations::WorkloadMetadata, config::InjectorConfig};
