use super::{
    ACL_TOKEN_FILE, CENTRAL_CONFIG_FILE, CONSUL_BINARY, ENVOY_BOOTSTRAP_FILE, Result,
    SERVICE_ACCOUNT_TOKEN_FILE, SERVICE_CONFIG_FILE, ScriptBuilder, json_array, token_file_flag,
};
use crate::{
    checks::{CheckTarget, HealthCheck},
    descriptor::{CONSUL_GRPC_ADDRESS, SidecarInjectionDescriptor},
    upstreams::{PREPARED_QUERY, Upstream},
};

/// Port the Envoy public listener binds to inside the pod.
pub const PROXY_PORT: u16 = 20000;

/// The `/bin/consul` of the init container image, as opposed to the copy in [`CONSUL_BINARY`].
const IMAGE_CONSUL_BINARY: &str = "/bin/consul";

/// Renders the script run by the init container.
///
/// The script registers the proxy and the plain service with the local Consul agent, optionally
/// logs in via the ACL auth method and writes the central config entry, generates the Envoy
/// bootstrap configuration and copies the `consul` binary into the shared volume for the
/// pre-stop hook of the sidecar.
pub fn render_init_script(descriptor: &SidecarInjectionDescriptor) -> Result<String> {
    let mut script = ScriptBuilder::default();

    script.line(format_args!(
        "export CONSUL_HTTP_ADDR=\"{}\"",
        descriptor.consul_address
    ))?;
    script.line(format_args!(
        "export CONSUL_GRPC_ADDR=\"{CONSUL_GRPC_ADDRESS}\""
    ))?;
    if descriptor.tls_enabled {
        script.tls_environment()?;
    }

    script.blank()?;
    script.line("# Register the service. The HCL is stored in the volume so that")?;
    script.line("# the preStop hook can access it to deregister the service.")?;
    script.line(format_args!("cat <<EOF >{SERVICE_CONFIG_FILE}"))?;
    write_proxy_service(&mut script, descriptor)?;
    script.blank()?;
    write_plain_service(&mut script, descriptor)?;
    script.line("EOF")?;

    if descriptor.central_config_enabled {
        script.blank()?;
        script.line("# Create the central config's service registration")?;
        script.line(format_args!("cat <<EOF >{CENTRAL_CONFIG_FILE}"))?;
        script.string_attribute("kind", "service-defaults")?;
        script.string_attribute("name", &descriptor.service_name)?;
        if let Some(protocol) = &descriptor.protocol {
            script.string_attribute("protocol", protocol)?;
        }
        script.line("EOF")?;
    }

    script.blank()?;
    write_commands(&mut script, descriptor)?;

    Ok(script.finish())
}

fn write_proxy_service(
    script: &mut ScriptBuilder,
    descriptor: &SidecarInjectionDescriptor,
) -> Result<()> {
    let service = &descriptor.service_name;

    script.block("services", |script| {
        script.string_attribute("id", format_args!("${{POD_NAME}}-{service}-sidecar-proxy"))?;
        script.string_attribute("name", format_args!("{service}-sidecar-proxy"))?;
        script.string_attribute("kind", "connect-proxy")?;
        script.string_attribute("address", "${POD_IP}")?;
        script.attribute("port", PROXY_PORT)?;
        if !descriptor.tags.mesh_tags.is_empty() {
            script.attribute("tags", json_array(&descriptor.tags.mesh_tags)?)?;
        }

        script.blank()?;
        script.block("proxy", |script| {
            script.string_attribute("destination_service_name", service)?;
            script.string_attribute(
                "destination_service_id",
                format_args!("${{POD_NAME}}-{service}"),
            )?;
            if descriptor.service_port > 0 {
                script.string_attribute("local_service_address", "127.0.0.1")?;
                script.attribute("local_service_port", descriptor.service_port)?;
            }
            script.block("config", |script| {
                script.string_attribute("envoy_prometheus_bind_addr", descriptor.bind_address)
            })?;
            for upstream in &descriptor.upstreams {
                script.block("upstreams", |script| write_upstream(script, upstream))?;
            }
            Ok(())
        })?;

        script.blank()?;
        script.block("checks", |script| {
            script.string_attribute("name", "Proxy Public Listener")?;
            script.string_attribute("tcp", format_args!("${{POD_IP}}:{PROXY_PORT}"))?;
            script.string_attribute("interval", "10s")?;
            script.string_attribute("deregister_critical_service_after", "10m")
        })?;

        script.blank()?;
        script.block("checks", |script| {
            script.string_attribute("name", "Destination Alias")?;
            script.string_attribute("alias_service", service)
        })
    })
}

fn write_upstream(script: &mut ScriptBuilder, upstream: &Upstream) -> Result<()> {
    match upstream {
        Upstream::Service(upstream) => {
            script.string_attribute("destination_type", "service")?;
            script.string_attribute("destination_name", &upstream.name)?;
            if !upstream.tags.is_empty() {
                script.attribute("destination_tags", json_array(&upstream.tags)?)?;
            }
            script.attribute("local_bind_port", upstream.local_port)?;
            if let Some(datacenter) = &upstream.datacenter {
                script.string_attribute("datacenter", datacenter)?;
            }
            Ok(())
        }
        Upstream::PreparedQuery(upstream) => {
            script.string_attribute("destination_type", PREPARED_QUERY)?;
            script.string_attribute("destination_name", &upstream.query)?;
            script.attribute("local_bind_port", upstream.local_port)
        }
    }
}

fn write_plain_service(
    script: &mut ScriptBuilder,
    descriptor: &SidecarInjectionDescriptor,
) -> Result<()> {
    let service = &descriptor.service_name;

    script.block("services", |script| {
        script.string_attribute("id", format_args!("${{POD_NAME}}-{service}"))?;
        script.string_attribute("name", service)?;
        script.string_attribute("address", "${POD_IP}")?;
        script.attribute("port", descriptor.service_port)?;
        if !descriptor.tags.host_tags.is_empty() {
            script.attribute("tags", json_array(&descriptor.tags.host_tags)?)?;
        }

        for check in &descriptor.checks {
            script.blank()?;
            script.block("checks", |script| write_check(script, check))?;
        }
        Ok(())
    })
}

fn write_check(script: &mut ScriptBuilder, check: &HealthCheck) -> Result<()> {
    script.string_attribute("id", format_args!("${{POD_NAME}}-{}", check.id))?;
    script.string_attribute("name", &check.name)?;
    match &check.target {
        CheckTarget::Http(url) => script.string_attribute("http", url)?,
        CheckTarget::Tcp(port) => {
            script.string_attribute("tcp", format_args!("${{POD_IP}}:{port}"))?;
        }
    }
    script.string_attribute("interval", &check.interval)?;
    script.string_attribute("timeout", &check.timeout)?;

    if let CheckTarget::Http(_) = check.target {
        if !check.method.is_empty() {
            script.string_attribute("method", &check.method)?;
        }
        if check.tls_skip_verify {
            script.attribute("tls_skip_verify", true)?;
        }
    }
    Ok(())
}

fn write_commands(
    script: &mut ScriptBuilder,
    descriptor: &SidecarInjectionDescriptor,
) -> Result<()> {
    let service = &descriptor.service_name;
    let token_flag = descriptor.auth_method.as_ref().map(|_| token_file_flag());

    if let Some(auth_method) = &descriptor.auth_method {
        script.command([
            format!("{IMAGE_CONSUL_BINARY} login -method=\"{auth_method}\""),
            format!("-bearer-token-file=\"{SERVICE_ACCOUNT_TOKEN_FILE}\""),
            format!("-token-sink-file=\"{ACL_TOKEN_FILE}\""),
            "-meta=\"pod=${POD_NAMESPACE}/${POD_NAME}\"".to_owned(),
        ])?;
    }

    if descriptor.central_config_enabled {
        script.command(
            [format!("{IMAGE_CONSUL_BINARY} config write -cas -modify-index 0")]
                .into_iter()
                .chain(token_flag.clone())
                .chain([format!("{CENTRAL_CONFIG_FILE} || true")]),
        )?;
    }

    script.command(
        [format!("{IMAGE_CONSUL_BINARY} services register")]
            .into_iter()
            .chain(token_flag.clone())
            .chain([SERVICE_CONFIG_FILE.to_owned()]),
    )?;

    script.blank()?;
    script.line("# Generate the envoy bootstrap code")?;
    script.command(
        [
            format!("{IMAGE_CONSUL_BINARY} connect envoy"),
            format!("-proxy-id=\"${{POD_NAME}}-{service}-sidecar-proxy\""),
        ]
        .into_iter()
        .chain(token_flag)
        .chain([format!("-bootstrap > {ENVOY_BOOTSTRAP_FILE}")]),
    )?;

    script.blank()?;
    script.line("# Copy the Consul binary")?;
    script.line(format_args!("cp {IMAGE_CONSUL_BINARY} {CONSUL_BINARY}"))?;
    Ok(())
}
