use super::{CONSUL_BINARY, Result, SERVICE_CONFIG_FILE, ScriptBuilder, token_file_flag};
use crate::descriptor::TeardownDescriptor;

/// Renders the pre-stop script of the sidecar, which deregisters the workload and, with ACLs,
/// logs out again.
///
/// The sidecar image has no `consul` binary of its own, so the copy the init container left in
/// the shared volume is used.
pub fn render_teardown_script(descriptor: &TeardownDescriptor) -> Result<String> {
    let mut script = ScriptBuilder::default();

    script.line(format_args!(
        "export CONSUL_HTTP_ADDR=\"{}\"",
        descriptor.consul_address
    ))?;
    if descriptor.tls_enabled {
        script.tls_environment()?;
    }

    let mut command = vec![format!("{CONSUL_BINARY} services deregister")];
    if descriptor.auth_method.is_some() {
        command.push(token_file_flag());
    }
    command.push(SERVICE_CONFIG_FILE.to_owned());
    if descriptor.auth_method.is_some() {
        command.push(format!("&& {CONSUL_BINARY} logout"));
        command.push(token_file_flag());
    }
    script.command(command)?;

    Ok(script.finish())
}
