//! Command line options of the injector, every option can also be set via the environment.
//!
//! ```
//! use clap::Parser;
//! use connect_inject::{InjectorConfig, cli::InjectorOptions};
//!
//! #[derive(Parser)]
//! struct Opts {
//!     #[command(flatten)]
//!     injector: InjectorOptions,
//! }
//!
//! let opts = Opts::parse_from(["injector", "--acl-auth-method", "k8s"]);
//! let config = InjectorConfig::try_from(opts.injector).unwrap();
//! assert_eq!(config.auth_method.as_deref(), Some("k8s"));
//! ```
use clap::Args;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    bind_address::{self, BindAddress},
    config::{DEFAULT_CONSUL_IMAGE, DEFAULT_ENVOY_IMAGE, InjectorConfig, TlsSecrets},
};

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("--enable-tls requires --{option} to be set"))]
    MissingTlsSecret { option: &'static str },

    #[snafu(display("invalid default metrics bind address {address:?}"))]
    InvalidDefaultBindAddress {
        source: bind_address::Error,
        address: String,
    },
}

#[derive(Debug, PartialEq, Eq, Args)]
#[command(next_help_heading = "Injector Options")]
pub struct InjectorOptions {
    /// Image of the init container, it must provide the `consul` binary at `/bin/consul`.
    #[arg(long, env, default_value = DEFAULT_CONSUL_IMAGE)]
    pub consul_image: String,

    /// Image of the Envoy sidecar container.
    #[arg(long, env, default_value = DEFAULT_ENVOY_IMAGE)]
    pub envoy_image: String,

    /// Consul ACL auth method the workloads log in with, using their service account token.
    ///
    /// ACLs are not used if this is not set.
    #[arg(long, env)]
    pub acl_auth_method: Option<String>,

    /// Write a `service-defaults` config entry carrying the protocol of every injected service.
    #[arg(long, env)]
    pub enable_central_config: bool,

    /// Talk to the Consul agent via HTTPS on port 8501.
    ///
    /// Requires both `--tls-ca-cert-secret` and `--tls-client-cert-secret`.
    #[arg(long, env)]
    pub enable_tls: bool,

    /// Secret holding the CA certificate of the Consul agent in `tls.crt`.
    #[arg(long, env)]
    pub tls_ca_cert_secret: Option<String>,

    /// Secret holding the client certificate (`tls.crt`) and key (`tls.key`).
    #[arg(long, env)]
    pub tls_client_cert_secret: Option<String>,

    /// Envoy metrics listener used when a workload doesn't set
    /// `consul.hashicorp.com/envoy-prometheus-bind-addr`.
    #[arg(long, env, default_value_t = BindAddress::default().to_string())]
    pub default_metrics_bind_address: String,
}

impl TryFrom<InjectorOptions> for InjectorConfig {
    type Error = Error;

    fn try_from(options: InjectorOptions) -> Result<Self, Self::Error> {
        let tls = if options.enable_tls {
            Some(TlsSecrets {
                ca_cert_secret: options
                    .tls_ca_cert_secret
                    .filter(|secret| !secret.is_empty())
                    .context(MissingTlsSecretSnafu {
                        option: "tls-ca-cert-secret",
                    })?,
                client_cert_secret: options
                    .tls_client_cert_secret
                    .filter(|secret| !secret.is_empty())
                    .context(MissingTlsSecretSnafu {
                        option: "tls-client-cert-secret",
                    })?,
            })
        } else {
            None
        };

        let default_metrics_bind_address = options
            .default_metrics_bind_address
            .parse()
            .context(InvalidDefaultBindAddressSnafu {
                address: &options.default_metrics_bind_address,
            })?;

        Ok(Self {
            consul_image: options.consul_image,
            envoy_image: options.envoy_image,
            auth_method: options
                .acl_auth_method
                .filter(|auth_method| !auth_method.is_empty()),
            central_config: options.enable_central_config,
            tls,
            default_metrics_bind_address,
        })
    }
}
