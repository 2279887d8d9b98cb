//! The annotation surface a workload uses to configure its sidecar.
//!
//! All keys live under the `consul.hashicorp.com/` prefix. Values are plain strings; the small
//! grammars some of them use are parsed by the [`tags`](crate::tags),
//! [`checks`](crate::checks), [`upstreams`](crate::upstreams) and
//! [`bind_address`](crate::bind_address) modules.
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use tracing::warn;

/// Set to `true` on a pod to request sidecar injection.
pub const INJECT: &str = "consul.hashicorp.com/connect-inject";

/// Written back to the pod once the sidecar has been injected.
pub const INJECT_STATUS: &str = "consul.hashicorp.com/connect-inject-status";

/// The value of [`INJECT_STATUS`] after a successful injection.
pub const INJECT_STATUS_INJECTED: &str = "injected";

/// The name the workload is registered under. Defaults to the first container name.
pub const SERVICE: &str = "consul.hashicorp.com/connect-service";

/// Name or number of the container port the service listens on.
pub const SERVICE_PORT: &str = "consul.hashicorp.com/connect-service-port";

/// Protocol written into the central `service-defaults` config entry.
pub const SERVICE_PROTOCOL: &str = "consul.hashicorp.com/connect-service-protocol";

/// Comma separated list of upstream definitions, see [`crate::upstreams`].
pub const SERVICE_UPSTREAMS: &str = "consul.hashicorp.com/connect-service-upstreams";

/// Comma separated list of service tags, see [`crate::tags`].
pub const SERVICE_TAGS: &str = "consul.hashicorp.com/service-tags";

/// Comma separated list of health check definitions, see [`crate::checks`].
pub const SERVICE_CHECKS: &str = "consul.hashicorp.com/service-checks";

/// Whether `urlprefix-` tags are kept out of the sidecar proxy registration. Defaults to `true`.
pub const SKIP_FABIO_TAGS: &str = "consul.hashicorp.com/connect-skip-fabio-tags";

/// Overrides host and/or port of the Envoy Prometheus listener, see [`crate::bind_address`].
pub const ENVOY_PROMETHEUS_BIND_ADDR: &str = "consul.hashicorp.com/envoy-prometheus-bind-addr";

/// The annotations of a single workload, read-only input to the descriptor compiler.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkloadMetadata(BTreeMap<String, String>);

impl WorkloadMetadata {
    pub fn from_pod(pod: &Pod) -> Self {
        Self(pod.metadata.annotations.clone().unwrap_or_default())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns the annotation value, treating an empty value like an absent annotation.
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|value| !value.is_empty())
    }

    /// Reads a boolean annotation.
    ///
    /// Absent annotations yield `default`. Values which can't be parsed are logged and yield
    /// `default` as well, they never fail the injection.
    pub fn flag(&self, key: &str, default: bool) -> bool {
        let Some(raw) = self.get(key) else {
            return default;
        };

        parse_flag(raw).unwrap_or_else(|| {
            warn!(
                annotation = key,
                value = raw,
                default,
                "failed to parse boolean annotation, falling back to the default"
            );
            default
        })
    }
}

impl From<BTreeMap<String, String>> for WorkloadMetadata {
    fn from(annotations: BTreeMap<String, String>) -> Self {
        Self(annotations)
    }
}

impl<K, V> FromIterator<(K, V)> for WorkloadMetadata
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

/// Parses the boolean spellings accepted in annotations.
///
/// Only the exact literals `1`, `t`, `T`, `TRUE`, `true`, `True` and their `false` counterparts
/// are accepted. Whitespace is not trimmed, so `" true"` is rejected.
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Fills in the service name and port annotations from the first container of the pod.
///
/// The service name falls back to the container name when the annotation is absent or empty.
/// The port is only defaulted when the annotation is absent and the container declares at
/// least one port, preferring the port name over its number.
pub fn default_annotations(pod: &mut Pod) {
    let Some(first_container) = pod.spec.as_ref().and_then(|spec| spec.containers.first()) else {
        return;
    };

    let service_name = first_container.name.clone();
    let service_port = first_container
        .ports
        .as_ref()
        .and_then(|ports| ports.first())
        .map(|port| match &port.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => port.container_port.to_string(),
        });

    let annotations = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);

    if annotations.get(SERVICE).is_none_or(String::is_empty) {
        annotations.insert(SERVICE.to_owned(), service_name);
    }

    if let Some(service_port) = service_port {
        annotations
            .entry(SERVICE_PORT.to_owned())
            .or_insert(service_port);
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec};
    use rstest::rstest;

    use super::*;

    fn pod_with_container(container: Container) -> Pod {
        Pod {
            spec: Some(PodSpec {
                containers: vec![container],
                ..PodSpec::default()
            }),
            ..Pod::default()
        }
    }

    #[rstest]
    #[case("true", Some(true))]
    #[case("True", Some(true))]
    #[case("TRUE", Some(true))]
    #[case("1", Some(true))]
    #[case("t", Some(true))]
    #[case("T", Some(true))]
    #[case("FALSE", Some(false))]
    #[case("0", Some(false))]
    #[case("f", Some(false))]
    #[case("F", Some(false))]
    #[case(" 1 ", None)]
    #[case(" true", None)]
    #[case("TrUe", None)]
    #[case("", None)]
    #[case("yes", None)]
    fn parse_flag_spellings(#[case] input: &str, #[case] expected: Option<bool>) {
        assert_eq!(parse_flag(input), expected);
    }

    #[rstest]
    #[case(None, true)]
    #[case(Some("false"), false)]
    #[case(Some("true"), true)]
    #[case(Some("not-a-bool"), true)]
    fn flag_falls_back_to_default(#[case] value: Option<&str>, #[case] expected: bool) {
        let metadata: WorkloadMetadata = value
            .map(|value| (SKIP_FABIO_TAGS, value))
            .into_iter()
            .collect();

        assert_eq!(metadata.flag(SKIP_FABIO_TAGS, true), expected);
    }

    #[test]
    fn get_non_empty_skips_empty_values() {
        let metadata: WorkloadMetadata = [(SERVICE_TAGS, ""), (SERVICE, "web")]
            .into_iter()
            .collect();

        assert_eq!(metadata.get(SERVICE_TAGS), Some(""));
        assert_eq!(metadata.get_non_empty(SERVICE_TAGS), None);
        assert_eq!(metadata.get_non_empty(SERVICE), Some("web"));
    }

    #[test]
    fn defaults_service_name_and_named_port() {
        let mut pod = pod_with_container(Container {
            name: "web".to_owned(),
            ports: Some(vec![ContainerPort {
                name: Some("http".to_owned()),
                container_port: 8080,
                ..ContainerPort::default()
            }]),
            ..Container::default()
        });

        default_annotations(&mut pod);

        let metadata = WorkloadMetadata::from_pod(&pod);
        assert_eq!(metadata.get(SERVICE), Some("web"));
        assert_eq!(metadata.get(SERVICE_PORT), Some("http"));
    }

    #[test]
    fn defaults_unnamed_port_to_number() {
        let mut pod = pod_with_container(Container {
            name: "web".to_owned(),
            ports: Some(vec![ContainerPort {
                container_port: 8080,
                ..ContainerPort::default()
            }]),
            ..Container::default()
        });

        default_annotations(&mut pod);

        assert_eq!(
            WorkloadMetadata::from_pod(&pod).get(SERVICE_PORT),
            Some("8080")
        );
    }

    #[test]
    fn keeps_explicit_annotations() {
        let mut pod = pod_with_container(Container {
            name: "web".to_owned(),
            ports: Some(vec![ContainerPort {
                container_port: 8080,
                ..ContainerPort::default()
            }]),
            ..Container::default()
        });
        pod.metadata.annotations = Some(BTreeMap::from([
            (SERVICE.to_owned(), "frontend".to_owned()),
            (SERVICE_PORT.to_owned(), "9090".to_owned()),
        ]));

        default_annotations(&mut pod);

        let metadata = WorkloadMetadata::from_pod(&pod);
        assert_eq!(metadata.get(SERVICE), Some("frontend"));
        assert_eq!(metadata.get(SERVICE_PORT), Some("9090"));
    }

    #[test]
    fn empty_service_name_is_replaced() {
        let mut pod = pod_with_container(Container {
            name: "web".to_owned(),
            ..Container::default()
        });
        pod.metadata.annotations = Some(BTreeMap::from([(SERVICE.to_owned(), String::new())]));

        default_annotations(&mut pod);

        let metadata = WorkloadMetadata::from_pod(&pod);
        assert_eq!(metadata.get(SERVICE), Some("web"));
        assert_eq!(metadata.get(SERVICE_PORT), None);
    }
}
