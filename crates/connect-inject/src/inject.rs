//! Builds the containers and volumes injected into a workload and applies them to its pod.
use k8s_openapi::api::core::v1::{Container, EmptyDirVolumeSource, Pod, Volume, VolumeMount};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, instrument};

use crate::{
    annotations::{INJECT, INJECT_STATUS, INJECT_STATUS_INJECTED, WorkloadMetadata},
    builder::{ContainerBuilder, FieldPathEnvVar, VolumeBuilder, VolumeMountBuilder},
    config::{InjectorConfig, TlsSecrets},
    descriptor::{self, SidecarInjectionDescriptor, TeardownDescriptor},
    ports::ContainerPorts,
    render::{
        self, DATA_DIR, ENVOY_BOOTSTRAP_FILE, SERVICE_ACCOUNT_DIR, TLS_CA_DIR, TLS_CLIENT_DIR,
        render_init_script, render_teardown_script,
    },
};

pub const INIT_CONTAINER_NAME: &str = "consul-connect-inject-init";
pub const SIDECAR_CONTAINER_NAME: &str = "consul-connect-envoy-sidecar";

/// Name of the `emptyDir` volume shared by the init and the sidecar container.
pub const DATA_VOLUME_NAME: &str = "consul-connect-inject-data";
pub const TLS_CA_CERT_VOLUME_NAME: &str = "tls-ca-cert";
pub const TLS_CLIENT_CERT_VOLUME_NAME: &str = "tls-client-cert";

/// Name of the container port Envoy exposes its Prometheus metrics on.
pub const METRICS_PORT_NAME: &str = "envoy-exporter";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to compile the annotations of the workload"))]
    Compile { source: descriptor::Error },

    #[snafu(display("failed to render the init container script"))]
    RenderInitScript { source: render::Error },

    #[snafu(display("failed to render the sidecar pre-stop script"))]
    RenderTeardownScript { source: render::Error },

    #[snafu(display("no container of the workload mounts a volume at {path:?}"))]
    VolumeMountNotFound { path: String },
}

/// The objects added to a pod to run it in the service mesh.
#[derive(Clone, Debug, PartialEq)]
pub struct SidecarInjection {
    pub init_container: Container,
    pub sidecar_container: Container,
    pub volumes: Vec<Volume>,
}

impl SidecarInjection {
    /// Compiles the annotations of `pod` and builds the containers and volumes to inject.
    ///
    /// The annotations are expected to be defaulted with
    /// [`default_annotations`](crate::annotations::default_annotations) already.
    #[instrument(
        skip_all,
        fields(
            pod.name = pod.metadata.name.as_deref(),
            pod.namespace = pod.metadata.namespace.as_deref(),
        )
    )]
    pub fn build(pod: &Pod, config: &InjectorConfig) -> Result<Self> {
        let metadata = WorkloadMetadata::from_pod(pod);
        let (descriptor, teardown) =
            descriptor::compile(&metadata, config, &ContainerPorts::from_pod(pod))
                .context(CompileSnafu)?;

        let service_account_mount = match config.auth_method {
            Some(_) => Some(find_volume_mount(pod, SERVICE_ACCOUNT_DIR)?),
            None => None,
        };

        let injection = Self {
            init_container: build_init_container(config, &descriptor, service_account_mount)?,
            sidecar_container: build_sidecar_container(config, &descriptor, &teardown)?,
            volumes: build_volumes(config.tls.as_ref()),
        };

        debug!(
            service = %descriptor.service_name,
            checks = descriptor.checks.len(),
            upstreams = descriptor.upstreams.len(),
            "built sidecar injection"
        );

        Ok(injection)
    }

    /// Adds the containers and volumes to `pod` and marks it as injected.
    pub fn apply_to(self, pod: &mut Pod) {
        let spec = pod.spec.get_or_insert_with(Default::default);
        spec.init_containers
            .get_or_insert_with(Vec::new)
            .push(self.init_container);
        spec.containers.push(self.sidecar_container);
        spec.volumes
            .get_or_insert_with(Vec::new)
            .extend(self.volumes);

        pod.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(INJECT_STATUS.to_owned(), INJECT_STATUS_INJECTED.to_owned());
    }
}

/// Whether the pod opted into injection and hasn't been injected yet.
pub fn requires_injection(pod: &Pod) -> bool {
    let metadata = WorkloadMetadata::from_pod(pod);

    metadata.get(INJECT_STATUS) != Some(INJECT_STATUS_INJECTED) && metadata.flag(INJECT, false)
}

/// Returns the first volume mount of any container of the pod at `path`.
fn find_volume_mount(pod: &Pod, path: &str) -> Result<VolumeMount> {
    pod.spec
        .iter()
        .flat_map(|spec| &spec.containers)
        .flat_map(|container| container.volume_mounts.iter().flatten())
        .find(|mount| mount.mount_path == path)
        .cloned()
        .context(VolumeMountNotFoundSnafu { path })
}

fn tls_volume_mounts() -> [VolumeMount; 2] {
    [
        VolumeMountBuilder::new(TLS_CA_CERT_VOLUME_NAME, TLS_CA_DIR)
            .read_only(true)
            .build(),
        VolumeMountBuilder::new(TLS_CLIENT_CERT_VOLUME_NAME, TLS_CLIENT_DIR)
            .read_only(true)
            .build(),
    ]
}

fn shell_command(script: String) -> Vec<String> {
    vec!["/bin/sh".to_owned(), "-ec".to_owned(), script]
}

fn build_init_container(
    config: &InjectorConfig,
    descriptor: &SidecarInjectionDescriptor,
    service_account_mount: Option<VolumeMount>,
) -> Result<Container> {
    let script = render_init_script(descriptor).context(RenderInitScriptSnafu)?;

    let mut builder = ContainerBuilder::new(INIT_CONTAINER_NAME);
    builder
        .image(&config.consul_image)
        .add_env_var_from_field_path("HOST_IP", &FieldPathEnvVar::HostIp)
        .add_env_var_from_field_path("POD_IP", &FieldPathEnvVar::PodIp)
        .add_env_var_from_field_path("POD_NAME", &FieldPathEnvVar::Name)
        .add_env_var_from_field_path("POD_NAMESPACE", &FieldPathEnvVar::Namespace)
        .add_volume_mount(DATA_VOLUME_NAME, DATA_DIR)
        .add_volume_mounts(service_account_mount)
        .command(shell_command(script));

    if config.tls_enabled() {
        builder.add_volume_mounts(tls_volume_mounts());
    }

    Ok(builder.build())
}

fn build_sidecar_container(
    config: &InjectorConfig,
    descriptor: &SidecarInjectionDescriptor,
    teardown: &TeardownDescriptor,
) -> Result<Container> {
    let script = render_teardown_script(teardown).context(RenderTeardownScriptSnafu)?;

    let mut builder = ContainerBuilder::new(SIDECAR_CONTAINER_NAME);
    builder
        .image(&config.envoy_image)
        .add_container_port(METRICS_PORT_NAME, i32::from(descriptor.bind_address.port))
        .add_env_var_from_field_path("HOST_IP", &FieldPathEnvVar::HostIp)
        .add_volume_mount(DATA_VOLUME_NAME, DATA_DIR)
        .pre_stop_exec(shell_command(script))
        .command(vec![
            "envoy".to_owned(),
            "--config-path".to_owned(),
            ENVOY_BOOTSTRAP_FILE.to_owned(),
        ]);

    if config.tls_enabled() {
        builder.add_volume_mounts(tls_volume_mounts());
    }

    Ok(builder.build())
}

fn build_volumes(tls: Option<&TlsSecrets>) -> Vec<Volume> {
    let mut volumes = vec![
        VolumeBuilder::new(DATA_VOLUME_NAME)
            .empty_dir(EmptyDirVolumeSource::default())
            .build(),
    ];

    if let Some(tls) = tls {
        volumes.push(
            VolumeBuilder::new(TLS_CA_CERT_VOLUME_NAME)
                .with_secret(&tls.ca_cert_secret, false)
                .build(),
        );
        volumes.push(
            VolumeBuilder::new(TLS_CLIENT_CERT_VOLUME_NAME)
                .with_secret(&tls.client_cert_secret, false)
                .build(),
        );
    }

    volumes
}
