use connect_inject::{
    InjectorConfig,
    annotations::{
        ENVOY_PROMETHEUS_BIND_ADDR, INJECT, SERVICE, SERVICE_CHECKS, SERVICE_PORT,
        SERVICE_PROTOCOL, SERVICE_TAGS, SERVICE_UPSTREAMS, SKIP_FABIO_TAGS, default_annotations,
    },
    checks,
    config::TlsSecrets,
    descriptor,
    inject::{self, SIDECAR_CONTAINER_NAME, SidecarInjection, requires_injection},
};
use indoc::indoc;
use k8s_openapi::{
    api::core::v1::{Container, ContainerPort, Pod, PodSpec, VolumeMount},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use rstest::rstest;

fn workload(annotations: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some("billing-7d9f8".to_owned()),
            namespace: Some("shop".to_owned()),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
                    .collect(),
            ),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "billing".to_owned(),
                image: Some("shop/billing:1.4.2".to_owned()),
                ports: Some(vec![
                    ContainerPort {
                        name: Some("http".to_owned()),
                        container_port: 8080,
                        ..ContainerPort::default()
                    },
                    ContainerPort {
                        name: Some("grpc".to_owned()),
                        container_port: 9090,
                        ..ContainerPort::default()
                    },
                ]),
                volume_mounts: Some(vec![VolumeMount {
                    name: "kube-api-access-q8zrt".to_owned(),
                    mount_path: "/var/run/secrets/kubernetes.io/serviceaccount".to_owned(),
                    read_only: Some(true),
                    ..VolumeMount::default()
                }]),
                ..Container::default()
            }],
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

fn init_script(injection: &SidecarInjection) -> &str {
    &injection
        .init_container
        .command
        .as_deref()
        .expect("init container must have a command")[2]
}

fn teardown_script(injection: &SidecarInjection) -> &str {
    &injection
        .sidecar_container
        .lifecycle
        .as_ref()
        .and_then(|lifecycle| lifecycle.pre_stop.as_ref())
        .and_then(|handler| handler.exec.as_ref())
        .and_then(|exec| exec.command.as_deref())
        .expect("sidecar must have a pre-stop hook")[2]
}

#[test]
fn injects_defaulted_workload() {
    let mut pod = workload(&[(INJECT, "true")]);
    assert!(requires_injection(&pod));

    default_annotations(&mut pod);
    let injection =
        SidecarInjection::build(&pod, &InjectorConfig::default()).expect("injection must build");

    assert_eq!(init_script(&injection), indoc! {r#"
        export CONSUL_HTTP_ADDR="${HOST_IP}:8500"
        export CONSUL_GRPC_ADDR="${HOST_IP}:8502"

        # Register the service. The HCL is stored in the volume so that
        # the preStop hook can access it to deregister the service.
        cat <<EOF >/consul/connect-inject/service.hcl
        services {
          id = "${POD_NAME}-billing-sidecar-proxy"
          name = "billing-sidecar-proxy"
          kind = "connect-proxy"
          address = "${POD_IP}"
          port = 20000

          proxy {
            destination_service_name = "billing"
            destination_service_id = "${POD_NAME}-billing"
            local_service_address = "127.0.0.1"
            local_service_port = 8080
            config {
              envoy_prometheus_bind_addr = "0.0.0.0:9873"
            }
          }

          checks {
            name = "Proxy Public Listener"
            tcp = "${POD_IP}:20000"
            interval = "10s"
            deregister_critical_service_after = "10m"
          }

          checks {
            name = "Destination Alias"
            alias_service = "billing"
          }
        }

        services {
          id = "${POD_NAME}-billing"
          name = "billing"
          address = "${POD_IP}"
          port = 8080
        }
        EOF

        /bin/consul services register \
          /consul/connect-inject/service.hcl

        # Generate the envoy bootstrap code
        /bin/consul connect envoy \
          -proxy-id="${POD_NAME}-billing-sidecar-proxy" \
          -bootstrap > /consul/connect-inject/envoy-bootstrap.yaml

        # Copy the Consul binary
        cp /bin/consul /consul/connect-inject/consul
    "#});
    assert_eq!(teardown_script(&injection), indoc! {r#"
        export CONSUL_HTTP_ADDR="${HOST_IP}:8500"
        /consul/connect-inject/consul services deregister \
          /consul/connect-inject/service.hcl
    "#});

    injection.apply_to(&mut pod);

    let spec = pod.spec.as_ref().expect("pod must have a spec");
    assert_eq!(spec.containers.len(), 2);
    assert_eq!(spec.containers[1].name, SIDECAR_CONTAINER_NAME);
    assert!(!requires_injection(&pod));
}

const FULLY_ANNOTATED_INIT_SCRIPT: &str = indoc! {r#"
    export CONSUL_HTTP_ADDR="${HOST_IP}:8500"
    export CONSUL_GRPC_ADDR="${HOST_IP}:8502"

    # Register the service. The HCL is stored in the volume so that
    # the preStop hook can access it to deregister the service.
    cat <<EOF >/consul/connect-inject/service.hcl
    services {
      id = "${POD_NAME}-billing-sidecar-proxy"
      name = "billing-sidecar-proxy"
      kind = "connect-proxy"
      address = "${POD_IP}"
      port = 20000
      tags = ["v2","canary"]

      proxy {
        destination_service_name = "billing"
        destination_service_id = "${POD_NAME}-billing"
        local_service_address = "127.0.0.1"
        local_service_port = 9090
        config {
          envoy_prometheus_bind_addr = "127.0.0.1:9873"
        }
        upstreams {
          destination_type = "service"
          destination_name = "payments"
          destination_tags = ["primary","eu"]
          local_bind_port = 8080
          datacenter = "dc2"
        }
        upstreams {
          destination_type = "prepared_query"
          destination_name = "nearest-ledger"
          local_bind_port = 7000
        }
      }

      checks {
        name = "Proxy Public Listener"
        tcp = "${POD_IP}:20000"
        interval = "10s"
        deregister_critical_service_after = "10m"
      }

      checks {
        name = "Destination Alias"
        alias_service = "billing"
      }
    }

    services {
      id = "${POD_NAME}-billing"
      name = "billing"
      address = "${POD_IP}"
      port = 9090
      tags = ["v2","urlprefix-billing.shop/","canary"]

      checks {
        id = "${POD_NAME}-billing-health"
        name = "Health"
        http = "http://localhost:8080/health"
        interval = "10s"
        timeout = "1s"
        method = "POST"
        tls_skip_verify = true
      }

      checks {
        id = "${POD_NAME}-billing-grpc"
        name = "gRPC"
        tcp = "${POD_IP}:9090"
        interval = "5s"
        timeout = "1s"
      }
    }
    EOF

    # Create the central config's service registration
    cat <<EOF >/consul/connect-inject/central-config.hcl
    kind = "service-defaults"
    name = "billing"
    protocol = "grpc"
    EOF

    /bin/consul login -method="shop-k8s" \
      -bearer-token-file="/var/run/secrets/kubernetes.io/serviceaccount/token" \
      -token-sink-file="/consul/connect-inject/acl-token" \
      -meta="pod=${POD_NAMESPACE}/${POD_NAME}"
    /bin/consul config write -cas -modify-index 0 \
      -token-file="/consul/connect-inject/acl-token" \
      /consul/connect-inject/central-config.hcl || true
    /bin/consul services register \
      -token-file="/consul/connect-inject/acl-token" \
      /consul/connect-inject/service.hcl

    # Generate the envoy bootstrap code
    /bin/consul connect envoy \
      -proxy-id="${POD_NAME}-billing-sidecar-proxy" \
      -token-file="/consul/connect-inject/acl-token" \
      -bootstrap > /consul/connect-inject/envoy-bootstrap.yaml

    # Copy the Consul binary
    cp /bin/consul /consul/connect-inject/consul
"#};

fn fully_annotated_injection() -> SidecarInjection {
    let mut pod = workload(&[
        (INJECT, "true"),
        (SERVICE, "billing"),
        (SERVICE_PORT, "grpc"),
        (SERVICE_PROTOCOL, "grpc"),
        (SERVICE_TAGS, "v2,urlprefix-billing.shop/,canary"),
        (
            SERVICE_CHECKS,
            "http;health;Health;http://localhost:8080/health;10s;1s;POST;true,tcp;grpc;gRPC;9090;5s;1s",
        ),
        (
            SERVICE_UPSTREAMS,
            "payments:http:dc2:primary#eu, prepared_query:7000:nearest-ledger, broken",
        ),
        (ENVOY_PROMETHEUS_BIND_ADDR, "127.0.0.1:"),
    ]);
    default_annotations(&mut pod);

    let config = InjectorConfig {
        auth_method: Some("shop-k8s".to_owned()),
        central_config: true,
        ..InjectorConfig::default()
    };
    SidecarInjection::build(&pod, &config).expect("injection must build")
}

#[test]
fn renders_all_annotations() {
    let injection = fully_annotated_injection();

    assert_eq!(init_script(&injection), FULLY_ANNOTATED_INIT_SCRIPT);
}

#[test]
fn logs_out_on_teardown() {
    let injection = fully_annotated_injection();

    assert_eq!(teardown_script(&injection), indoc! {r#"
        export CONSUL_HTTP_ADDR="${HOST_IP}:8500"
        /consul/connect-inject/consul services deregister \
          -token-file="/consul/connect-inject/acl-token" \
          /consul/connect-inject/service.hcl \
          && /consul/connect-inject/consul logout \
          -token-file="/consul/connect-inject/acl-token"
    "#});
}

#[test]
fn mounts_service_account_token_for_login() {
    let injection = fully_annotated_injection();

    assert_eq!(
        injection
            .init_container
            .volume_mounts
            .iter()
            .flatten()
            .map(|mount| mount.name.as_str())
            .collect::<Vec<_>>(),
        ["consul-connect-inject-data", "kube-api-access-q8zrt"]
    );
}

#[test]
fn keeps_forwarding_tags_when_not_skipped() {
    let pod = workload(&[
        (SERVICE, "billing"),
        (SERVICE_TAGS, "v2,urlprefix-billing.shop/"),
        (SKIP_FABIO_TAGS, "false"),
    ]);

    let injection =
        SidecarInjection::build(&pod, &InjectorConfig::default()).expect("injection must build");

    let script = init_script(&injection);
    assert_eq!(script.matches(r#"tags = ["v2","urlprefix-billing.shop/"]"#).count(), 2);
}

#[test]
fn tls_switches_address_and_mounts_certificates() {
    let pod = workload(&[(SERVICE, "billing")]);
    let config = InjectorConfig {
        tls: Some(TlsSecrets {
            ca_cert_secret: "consul-ca".to_owned(),
            client_cert_secret: "consul-client".to_owned(),
        }),
        ..InjectorConfig::default()
    };

    let injection = SidecarInjection::build(&pod, &config).expect("injection must build");

    for script in [init_script(&injection), teardown_script(&injection)] {
        assert!(script.starts_with("export CONSUL_HTTP_ADDR=\"https://${HOST_IP}:8501\"\n"));
        assert!(script.contains("export CONSUL_CACERT=\"/consul/tls/ca/tls.crt\"\n"));
        assert!(script.contains("export CONSUL_CLIENT_KEY=\"/consul/tls/client/tls.key\"\n"));
    }
    assert_eq!(injection.volumes.len(), 3);
    assert_eq!(
        injection
            .sidecar_container
            .volume_mounts
            .iter()
            .flatten()
            .map(|mount| mount.mount_path.as_str())
            .collect::<Vec<_>>(),
        ["/consul/connect-inject", "/consul/tls/ca", "/consul/tls/client"]
    );
}

#[rstest]
#[case::malformed_check(
    (SERVICE_CHECKS, "http;health;Health;http://localhost/"),
    |error: &inject::Error| matches!(
        error,
        inject::Error::Compile {
            source: descriptor::Error::InvalidChecks {
                source: checks::Error::MalformedCheckDefinition { .. }
            }
        }
    )
)]
#[case::unsupported_check(
    (SERVICE_CHECKS, "grpc;health;Health;9090;10s;1s"),
    |error: &inject::Error| matches!(
        error,
        inject::Error::Compile {
            source: descriptor::Error::InvalidChecks {
                source: checks::Error::UnsupportedCheckKind { .. }
            }
        }
    )
)]
#[case::privileged_bind_address(
    (ENVOY_PROMETHEUS_BIND_ADDR, ":443"),
    |error: &inject::Error| matches!(
        error,
        inject::Error::Compile {
            source: descriptor::Error::InvalidBindAddress { .. }
        }
    )
)]
fn rejects_invalid_annotations(
    #[case] annotation: (&str, &str),
    #[case] is_expected: fn(&inject::Error) -> bool,
) {
    let pod = workload(&[(SERVICE, "billing"), annotation]);

    let error = SidecarInjection::build(&pod, &InjectorConfig::default())
        .expect_err("injection must fail");

    assert!(is_expected(&error), "unexpected error: {error:?}");
}

#[test]
fn missing_service_name_is_an_error() {
    let pod = workload(&[(INJECT, "true")]);

    assert!(matches!(
        SidecarInjection::build(&pod, &InjectorConfig::default()),
        Err(inject::Error::Compile {
            source: descriptor::Error::MissingServiceName
        })
    ));
}

#[test]
fn renders_identical_scripts_for_identical_workloads() {
    let pod = workload(&[
        (SERVICE, "billing"),
        (SERVICE_UPSTREAMS, "payments:8081,ledger:8082"),
        (SERVICE_CHECKS, "tcp;port;Port;8080;10s;1s"),
    ]);
    let config = InjectorConfig::default();

    let first = SidecarInjection::build(&pod, &config).expect("injection must build");
    let second = SidecarInjection::build(&pod, &config).expect("injection must build");

    assert_eq!(first, second);
}
