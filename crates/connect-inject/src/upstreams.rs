//! Parsing of the [`SERVICE_UPSTREAMS`] annotation.
//!
//! The annotation holds a comma separated list of upstream definitions in one of two shapes:
//!
//! ```text
//! <service>:<local port>[:<datacenter>[:<tag>#<tag>...]]
//! prepared_query:<local port>:<query name>
//! ```
//!
//! The local port can be a number or the name of a container port.
//!
//! Definitions which can't be resolved to a positive local port are dropped with a warning
//! instead of failing the injection, so one bad upstream doesn't keep a workload out of the
//! mesh. This differs from health checks, where any malformed definition is an error.
use snafu::{ResultExt, Snafu, ensure};
use tracing::warn;

use crate::{
    annotations::{SERVICE_UPSTREAMS, WorkloadMetadata},
    ports::{self, PortResolver},
};

/// First field of a prepared query upstream.
pub const PREPARED_QUERY: &str = "prepared_query";

const MAX_FIELDS: usize = 4;

type Result<T, E = Error> = std::result::Result<T, E>;

/// Reasons an upstream definition is dropped.
#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("upstream definition {definition:?} has no local port"))]
    MissingLocalPort { definition: String },

    #[snafu(display("prepared query upstream {definition:?} has no query name"))]
    MissingQueryName { definition: String },

    #[snafu(display("upstream definition {definition:?} has no service name"))]
    MissingServiceName { definition: String },

    #[snafu(display("failed to resolve the local port of upstream {definition:?}"))]
    UnresolvablePort {
        source: ports::Error,
        definition: String,
    },

    #[snafu(display("local port {port} of upstream {definition:?} is not positive"))]
    NonPositivePort { port: i32, definition: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceUpstream {
    pub name: String,
    pub local_port: i32,
    pub datacenter: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedQueryUpstream {
    pub query: String,
    pub local_port: i32,
}

/// A dependency the local Envoy proxies outbound traffic to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Upstream {
    Service(ServiceUpstream),
    PreparedQuery(PreparedQueryUpstream),
}

impl Upstream {
    pub fn local_port(&self) -> i32 {
        match self {
            Self::Service(upstream) => upstream.local_port,
            Self::PreparedQuery(upstream) => upstream.local_port,
        }
    }

    /// Parses a single upstream definition.
    pub fn parse(definition: &str, ports: &impl PortResolver) -> Result<Self> {
        let fields: Vec<&str> = definition.splitn(MAX_FIELDS, ':').collect();

        match *fields.as_slice() {
            [kind, port, query, ..] if kind.trim() == PREPARED_QUERY => {
                let query = query.trim();
                ensure!(!query.is_empty(), MissingQueryNameSnafu { definition });

                Ok(Self::PreparedQuery(PreparedQueryUpstream {
                    query: query.to_owned(),
                    local_port: resolve_local_port(port, ports, definition)?,
                }))
            }
            [kind, _] if kind.trim() == PREPARED_QUERY => {
                MissingQueryNameSnafu { definition }.fail()
            }
            [name, port] => Self::service(name, port, None, None, ports, definition),
            [name, port, datacenter] => {
                Self::service(name, port, Some(datacenter), None, ports, definition)
            }
            [name, port, datacenter, tags] => Self::service(
                name,
                port,
                Some(datacenter),
                Some(tags),
                ports,
                definition,
            ),
            _ => MissingLocalPortSnafu { definition }.fail(),
        }
    }

    fn service(
        name: &str,
        port: &str,
        datacenter: Option<&str>,
        tags: Option<&str>,
        ports: &impl PortResolver,
        definition: &str,
    ) -> Result<Self> {
        let name = name.trim();
        ensure!(!name.is_empty(), MissingServiceNameSnafu { definition });

        Ok(Self::Service(ServiceUpstream {
            name: name.to_owned(),
            local_port: resolve_local_port(port, ports, definition)?,
            datacenter: datacenter
                .map(str::trim)
                .filter(|datacenter| !datacenter.is_empty())
                .map(ToOwned::to_owned),
            tags: tags
                .into_iter()
                .flat_map(|tags| tags.split('#'))
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .map(ToOwned::to_owned)
                .collect(),
        }))
    }
}

fn resolve_local_port(port: &str, ports: &impl PortResolver, definition: &str) -> Result<i32> {
    let port = ports
        .resolve_port(port.trim())
        .context(UnresolvablePortSnafu { definition })?;
    ensure!(port > 0, NonPositivePortSnafu { port, definition });
    Ok(port)
}

/// Parses all upstreams of a workload, in annotation order. Duplicates are kept.
pub fn parse_upstreams(metadata: &WorkloadMetadata, ports: &impl PortResolver) -> Vec<Upstream> {
    let Some(raw) = metadata.get_non_empty(SERVICE_UPSTREAMS) else {
        return Vec::new();
    };

    raw.split(',')
        .filter_map(|definition| match Upstream::parse(definition, ports) {
            Ok(upstream) => Some(upstream),
            Err(error) => {
                warn!(
                    error = &error as &dyn std::error::Error,
                    "dropping upstream"
                );
                None
            }
        })
        .collect()
}
