//! The typed models the init and pre-stop scripts are rendered from.
//!
//! [`compile`] runs the whole front half of the injector: it resolves the metrics bind address,
//! parses tags, checks and upstreams and assembles them into a [`SidecarInjectionDescriptor`]
//! and the matching [`TeardownDescriptor`].
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::debug;

use crate::{
    annotations::{SERVICE, SERVICE_PORT, SERVICE_PROTOCOL, WorkloadMetadata},
    bind_address::{self, BindAddress, resolve_bind_address},
    checks::{self, HealthCheck, parse_checks},
    config::InjectorConfig,
    ports::PortResolver,
    tags::{TagSet, exclude_forwarding_tags, parse_tags},
    upstreams::{Upstream, parse_upstreams},
};

pub const CONSUL_HTTP_ADDRESS: &str = "${HOST_IP}:8500";
pub const CONSUL_HTTPS_ADDRESS: &str = "https://${HOST_IP}:8501";
pub const CONSUL_GRPC_ADDRESS: &str = "${HOST_IP}:8502";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    /// The service name is defaulted before compiling, so this indicates a bug in the caller
    /// rather than a problem with the workload.
    #[snafu(display(
        "workload has no \"consul.hashicorp.com/connect-service\" annotation, annotations must be defaulted first"
    ))]
    MissingServiceName,

    #[snafu(display("invalid Envoy Prometheus bind address"))]
    InvalidBindAddress { source: bind_address::Error },

    #[snafu(display("invalid service checks"))]
    InvalidChecks { source: checks::Error },
}

/// Everything the init container needs to register the workload and bootstrap Envoy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SidecarInjectionDescriptor {
    pub service_name: String,

    /// `0` means no local port is registered, Envoy then relies on the pod network namespace.
    pub service_port: i32,
    pub protocol: Option<String>,
    pub auth_method: Option<String>,
    pub central_config_enabled: bool,
    pub tls_enabled: bool,

    /// HTTP(S) address of the Consul agent, as seen from the pod.
    pub consul_address: String,
    pub bind_address: BindAddress,
    pub tags: TagSet,
    pub checks: Vec<HealthCheck>,
    pub upstreams: Vec<Upstream>,
}

/// Everything the pre-stop hook of the sidecar needs to deregister the workload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TeardownDescriptor {
    pub consul_address: String,
    pub tls_enabled: bool,
    pub auth_method: Option<String>,
}

/// Returns the (non-empty) service name of a workload.
pub fn service_name(metadata: &WorkloadMetadata) -> Result<&str> {
    metadata
        .get_non_empty(SERVICE)
        .context(MissingServiceNameSnafu)
}

pub fn consul_address(tls_enabled: bool) -> &'static str {
    if tls_enabled {
        CONSUL_HTTPS_ADDRESS
    } else {
        CONSUL_HTTP_ADDRESS
    }
}

impl SidecarInjectionDescriptor {
    /// Combines the already parsed parts with the remaining annotations and the injector
    /// configuration.
    pub fn assemble(
        metadata: &WorkloadMetadata,
        config: &InjectorConfig,
        bind_address: BindAddress,
        tags: TagSet,
        checks: Vec<HealthCheck>,
        upstreams: Vec<Upstream>,
        ports: &impl PortResolver,
    ) -> Result<Self> {
        let service_name = service_name(metadata)?.to_owned();

        let service_port = match metadata.get_non_empty(SERVICE_PORT) {
            Some(raw) => match ports.resolve_port(raw) {
                Ok(port) if port > 0 => port,
                Ok(port) => {
                    debug!(port, "ignoring non-positive service port");
                    0
                }
                Err(error) => {
                    debug!(
                        error = &error as &dyn std::error::Error,
                        "ignoring unresolvable service port"
                    );
                    0
                }
            },
            None => 0,
        };

        Ok(Self {
            service_name,
            service_port,
            protocol: metadata
                .get_non_empty(SERVICE_PROTOCOL)
                .map(ToOwned::to_owned),
            auth_method: config.auth_method.clone(),
            central_config_enabled: config.central_config,
            tls_enabled: config.tls_enabled(),
            consul_address: consul_address(config.tls_enabled()).to_owned(),
            bind_address,
            tags,
            checks,
            upstreams,
        })
    }

    pub fn teardown(&self) -> TeardownDescriptor {
        TeardownDescriptor {
            consul_address: self.consul_address.clone(),
            tls_enabled: self.tls_enabled,
            auth_method: self.auth_method.clone(),
        }
    }
}

/// Compiles the annotations of a workload into both descriptors.
pub fn compile(
    metadata: &WorkloadMetadata,
    config: &InjectorConfig,
    ports: &impl PortResolver,
) -> Result<(SidecarInjectionDescriptor, TeardownDescriptor)> {
    let service_name = service_name(metadata)?;

    let bind_address = resolve_bind_address(metadata, &config.default_metrics_bind_address)
        .context(InvalidBindAddressSnafu)?;
    let tags = parse_tags(metadata, exclude_forwarding_tags(metadata));
    let checks = parse_checks(metadata, service_name).context(InvalidChecksSnafu)?;
    let upstreams = parse_upstreams(metadata, ports);

    let descriptor = SidecarInjectionDescriptor::assemble(
        metadata,
        config,
        bind_address,
        tags,
        checks,
        upstreams,
        ports,
    )?;
    let teardown = descriptor.teardown();

    Ok((descriptor, teardown))
}
