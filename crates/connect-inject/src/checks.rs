//! Parsing of the [`SERVICE_CHECKS`] annotation.
//!
//! The annotation holds a comma separated list of check definitions. Each definition is a `;`
//! separated record:
//!
//! ```text
//! kind;id;name;target;interval;timeout[;method[;tls_skip_verify]]
//! ```
//!
//! `kind` is either `http` (`target` is a URL) or `tcp` (`target` is a port on the pod IP).
use snafu::{ResultExt, Snafu};
use strum::{Display, EnumString};
use tracing::warn;

use crate::annotations::{SERVICE_CHECKS, WorkloadMetadata, parse_flag};

pub const DEFAULT_METHOD: &str = "GET";

/// A definition is split into at most this many fields, the last one keeps any further `;`.
const MAX_FIELDS: usize = 8;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display(
        "malformed check definition {definition:?}: got {fields} fields, expected at least 6"
    ))]
    MalformedCheckDefinition { definition: String, fields: usize },

    #[snafu(display(
        "unsupported check kind {kind:?} in check definition {definition:?}, expected \"http\" or \"tcp\""
    ))]
    UnsupportedCheckKind {
        source: strum::ParseError,
        kind: String,
        definition: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum CheckKind {
    Http,
    Tcp,
}

/// What a check probes. The variant always matches the [`CheckKind`] of the definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckTarget {
    /// The URL requested by the agent.
    Http(String),

    /// The port connected to on the pod IP.
    Tcp(String),
}

impl CheckTarget {
    pub fn kind(&self) -> CheckKind {
        match self {
            Self::Http(_) => CheckKind::Http,
            Self::Tcp(_) => CheckKind::Tcp,
        }
    }
}

/// A health check registered on the plain service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthCheck {
    /// `<service name with spaces replaced by hyphens>-<short id>`
    pub id: String,
    pub name: String,
    pub target: CheckTarget,

    /// HTTP method, only used by HTTP checks. Empty means the agent default.
    pub method: String,
    pub interval: String,
    pub timeout: String,

    /// Only used by HTTP checks.
    pub tls_skip_verify: bool,
}

/// The optional trailing fields, selected by the number of fields of a definition.
#[derive(Debug, PartialEq, Eq)]
enum Overrides<'a> {
    None,
    Method(&'a str),
    MethodAndTlsSkipVerify {
        method: &'a str,
        tls_skip_verify: &'a str,
    },
}

/// A check definition split into its fields. All fields but `tls_skip_verify` are trimmed.
#[derive(Debug, PartialEq, Eq)]
struct CheckFields<'a> {
    kind: &'a str,
    short_id: &'a str,
    name: &'a str,
    target: &'a str,
    interval: &'a str,
    timeout: &'a str,
    overrides: Overrides<'a>,
}

impl<'a> CheckFields<'a> {
    fn split(definition: &'a str) -> Result<Self> {
        let raw: Vec<&str> = definition.splitn(MAX_FIELDS, ';').collect();
        let fields: Vec<&str> = raw.iter().copied().map(str::trim).collect();

        match *fields.as_slice() {
            [kind, short_id, name, target, interval, timeout] => Ok(Self {
                kind,
                short_id,
                name,
                target,
                interval,
                timeout,
                overrides: Overrides::None,
            }),
            [kind, short_id, name, target, interval, timeout, method] => Ok(Self {
                kind,
                short_id,
                name,
                target,
                interval,
                timeout,
                overrides: Overrides::Method(method),
            }),
            [
                kind,
                short_id,
                name,
                target,
                interval,
                timeout,
                method,
                _,
            ] => Ok(Self {
                kind,
                short_id,
                name,
                target,
                interval,
                timeout,
                overrides: Overrides::MethodAndTlsSkipVerify {
                    method,
                    tls_skip_verify: raw[MAX_FIELDS - 1],
                },
            }),
            _ => MalformedCheckDefinitionSnafu {
                definition,
                fields: fields.len(),
            }
            .fail(),
        }
    }
}

impl HealthCheck {
    /// Parses a single check definition. `service_name` is used to derive the check ID.
    pub fn parse(definition: &str, service_name: &str) -> Result<Self> {
        let fields = CheckFields::split(definition)?;

        let kind: CheckKind = fields
            .kind
            .parse()
            .context(UnsupportedCheckKindSnafu {
                kind: fields.kind,
                definition,
            })?;

        let target = match kind {
            CheckKind::Http => CheckTarget::Http(fields.target.to_owned()),
            CheckKind::Tcp => CheckTarget::Tcp(fields.target.to_owned()),
        };

        let (method, tls_skip_verify) = match fields.overrides {
            Overrides::None => (DEFAULT_METHOD, false),
            // A lone method field is taken as is, even when empty
            Overrides::Method(method) => (method, false),
            Overrides::MethodAndTlsSkipVerify {
                method,
                tls_skip_verify,
            } => {
                let method = if method.is_empty() {
                    DEFAULT_METHOD
                } else {
                    method
                };
                let tls_skip_verify = parse_flag(tls_skip_verify).unwrap_or_else(|| {
                    warn!(
                        check = definition,
                        value = tls_skip_verify,
                        "failed to parse tls_skip_verify of check, disabling it"
                    );
                    false
                });
                (method, tls_skip_verify)
            }
        };

        Ok(Self {
            id: format!(
                "{service}-{short_id}",
                service = service_name.replace(' ', "-"),
                short_id = fields.short_id
            ),
            name: fields.name.to_owned(),
            target,
            method: method.to_owned(),
            interval: fields.interval.to_owned(),
            timeout: fields.timeout.to_owned(),
            tls_skip_verify,
        })
    }
}

/// Parses all checks of a workload, in annotation order.
///
/// Unlike upstreams, a single malformed check fails the whole injection.
pub fn parse_checks(metadata: &WorkloadMetadata, service_name: &str) -> Result<Vec<HealthCheck>> {
    let Some(raw) = metadata.get_non_empty(SERVICE_CHECKS) else {
        return Ok(Vec::new());
    };

    raw.split(',')
        .map(|definition| HealthCheck::parse(definition, service_name))
        .collect()
}
