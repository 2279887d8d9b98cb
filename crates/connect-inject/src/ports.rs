//! Resolution of port specifiers used in annotations.
//!
//! Annotations may refer to a port either by number (`8080`) or by the name of a container port
//! declared in the pod (`http`).
use std::num::ParseIntError;

use k8s_openapi::api::core::v1::{Container, Pod};
use snafu::{ResultExt, Snafu};

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("{value:?} is neither a container port name nor a port number"))]
    UnknownPort {
        source: ParseIntError,
        value: String,
    },

    #[snafu(display("port specifier {value:?} could not be resolved"))]
    Unresolvable { value: String },
}

/// Maps a port specifier to a concrete port number.
pub trait PortResolver {
    fn resolve_port(&self, value: &str) -> Result<i32, Error>;
}

/// Resolves port names against the ports declared by a set of containers.
#[derive(Clone, Copy, Debug)]
pub struct ContainerPorts<'a> {
    containers: &'a [Container],
}

impl<'a> ContainerPorts<'a> {
    pub fn new(containers: &'a [Container]) -> Self {
        Self { containers }
    }

    pub fn from_pod(pod: &'a Pod) -> Self {
        let containers = pod
            .spec
            .as_ref()
            .map_or(&[][..], |spec| spec.containers.as_slice());
        Self::new(containers)
    }
}

impl PortResolver for ContainerPorts<'_> {
    fn resolve_port(&self, value: &str) -> Result<i32, Error> {
        let named_port = self
            .containers
            .iter()
            .flat_map(|container| container.ports.iter().flatten())
            .find(|port| port.name.as_deref() == Some(value));

        match named_port {
            Some(port) => Ok(port.container_port),
            None => value.parse().context(UnknownPortSnafu { value }),
        }
    }
}

impl<F> PortResolver for F
where
    F: Fn(&str) -> Option<i32>,
{
    fn resolve_port(&self, value: &str) -> Result<i32, Error> {
        self(value).ok_or_else(|| Error::Unresolvable {
            value: value.to_owned(),
        })
    }
}
