//! The address the Envoy sidecar exposes its Prometheus metrics on.
//!
//! Every workload gets the process-wide default (usually `0.0.0.0:9873`). The
//! [`ENVOY_PROMETHEUS_BIND_ADDR`] annotation can override the host, the port or both:
//!
//! - `127.0.0.1:45678` overrides both,
//! - `:45678` and `45678` only override the port,
//! - `127.0.0.1:` only overrides the host.
use std::{
    fmt::Display,
    net::{AddrParseError, IpAddr, Ipv4Addr},
    num::ParseIntError,
    ops::RangeInclusive,
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu, ensure};

use crate::annotations::{ENVOY_PROMETHEUS_BIND_ADDR, WorkloadMetadata};

pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
pub const DEFAULT_PORT: u16 = 9873;

/// Privileged ports are rejected, Envoy runs unprivileged.
const VALID_PORTS: RangeInclusive<i64> = 1024..=65535;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("bind address must contain an IP address or a port"))]
    EmptyBindAddress,

    #[snafu(display("invalid IP address {host:?}"))]
    InvalidHost {
        source: AddrParseError,
        host: String,
    },

    #[snafu(display("invalid port {port:?}"))]
    InvalidPort { source: ParseIntError, port: String },

    #[snafu(display("port {port} must be between 1024 and 65535"))]
    PortOutOfRange { port: i64 },
}

/// A fully specified bind address. It is always rendered as `host:port`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BindAddress {
    pub host: IpAddr,
    pub port: u16,
}

impl Default for BindAddress {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST,
            port: DEFAULT_PORT,
        }
    }
}

impl BindAddress {
    pub fn new(host: IpAddr, port: u16) -> Result<Self> {
        let address = Self { host, port };
        address.validate()?;
        Ok(address)
    }

    /// Checks the port range. Addresses built through [`BindAddress::new`] or parsing are
    /// always valid, but the fields are public.
    pub fn validate(&self) -> Result<()> {
        let port = i64::from(self.port);
        ensure!(VALID_PORTS.contains(&port), PortOutOfRangeSnafu { port });
        Ok(())
    }

    /// Replaces the fields set in `bind_override`, keeping the others.
    pub fn with_override(mut self, bind_override: BindAddressOverride) -> Self {
        if let Some(host) = bind_override.host {
            self.host = host;
        }
        if let Some(port) = bind_override.port {
            self.port = port;
        }
        self
    }
}

impl Display for BindAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{host}:{port}", host = self.host, port = self.port)
    }
}

/// Parses `host:port`, `host:`, `:port` or `port`, filling missing parts from
/// [`BindAddress::default`].
impl FromStr for BindAddress {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Ok(Self::default().with_override(input.parse()?))
    }
}

impl TryFrom<String> for BindAddress {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BindAddress> for String {
    fn from(value: BindAddress) -> Self {
        value.to_string()
    }
}

/// A partially specified bind address. Each present field replaces the corresponding field of
/// the default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BindAddressOverride {
    pub host: Option<IpAddr>,
    pub port: Option<u16>,
}

impl BindAddressOverride {
    /// Validates a host and a port given separately. Empty strings mean "not given", but at
    /// least one of both has to be given.
    pub fn validate(host: &str, port: &str) -> Result<Self> {
        ensure!(!host.is_empty() || !port.is_empty(), EmptyBindAddressSnafu);

        Ok(Self {
            host: (!host.is_empty()).then(|| parse_host(host)).transpose()?,
            port: (!port.is_empty()).then(|| parse_port(port)).transpose()?,
        })
    }
}

impl FromStr for BindAddressOverride {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.split_once(':') {
            // Either side may be empty here, ":" simply keeps the default
            Some((host, port)) => Ok(Self {
                host: (!host.is_empty()).then(|| parse_host(host)).transpose()?,
                port: (!port.is_empty()).then(|| parse_port(port)).transpose()?,
            }),
            None => Self::validate("", input),
        }
    }
}

fn parse_host(host: &str) -> Result<IpAddr> {
    host.parse().context(InvalidHostSnafu { host })
}

fn parse_port(port: &str) -> Result<u16> {
    let value: i64 = port.parse().context(InvalidPortSnafu { port })?;

    u16::try_from(value)
        .ok()
        .filter(|_| VALID_PORTS.contains(&value))
        .context(PortOutOfRangeSnafu { port: value })
}

/// Merges the bind address annotation of a workload into `default`.
///
/// The default itself is validated first, so a misconfigured injector fails every injection
/// instead of producing sidecars listening on a privileged port.
pub fn resolve_bind_address(
    metadata: &WorkloadMetadata,
    default: &BindAddress,
) -> Result<BindAddress> {
    default.validate()?;

    match metadata.get_non_empty(ENVOY_PROMETHEUS_BIND_ADDR) {
        Some(raw) => Ok(default.with_override(raw.parse()?)),
        None => Ok(*default),
    }
}
