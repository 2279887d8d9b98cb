use serde::{Deserialize, Deserializer, Serialize};

use crate::bind_address::BindAddress;

pub const DEFAULT_CONSUL_IMAGE: &str = "consul:1.7.1";
pub const DEFAULT_ENVOY_IMAGE: &str = "envoyproxy/envoy-alpine:v1.13.0";

/// Process-wide settings of the injector, shared by all workloads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectorConfig {
    /// Image of the init container. It needs the `consul` binary at `/bin/consul`.
    pub consul_image: String,

    /// Image of the sidecar container. It needs `envoy` on the `PATH`.
    pub envoy_image: String,

    /// Consul ACL auth method used to log in with the service account token of the workload.
    /// ACLs are not used if unset or empty.
    #[serde(default, deserialize_with = "deserialize_non_empty")]
    pub auth_method: Option<String>,

    /// Whether a `service-defaults` config entry is written for every injected service.
    pub central_config: bool,

    /// Talk to the Consul agent via HTTPS using these secrets. Plain HTTP if unset.
    pub tls: Option<TlsSecrets>,

    /// Envoy metrics listener of workloads without the bind address annotation.
    pub default_metrics_bind_address: BindAddress,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            consul_image: DEFAULT_CONSUL_IMAGE.to_owned(),
            envoy_image: DEFAULT_ENVOY_IMAGE.to_owned(),
            auth_method: None,
            central_config: false,
            tls: None,
            default_metrics_bind_address: BindAddress::default(),
        }
    }
}

impl InjectorConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }
}

fn deserialize_non_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.filter(|value| !value.is_empty()))
}

/// Names of the secrets holding the Consul CA certificate and the client certificate. Both
/// secrets are expected to use the `kubernetes.io/tls` layout (`tls.crt`, `tls.key`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSecrets {
    pub ca_cert_secret: String,
    pub client_cert_secret: String,
}
