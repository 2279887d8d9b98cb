//! Rendering of the descriptors into the shell scripts executed by the injected containers.
//!
//! Both scripts are produced by [`ScriptBuilder`], a tiny line oriented writer. Optional
//! settings are left out entirely instead of being rendered empty, and the output only
//! depends on the descriptor, so rendering the same descriptor twice yields identical text.
use std::fmt::{self, Display, Write as _};

use const_format::concatcp;
use snafu::{ResultExt, Snafu};

mod init;
mod teardown;

pub use init::render_init_script;
pub use teardown::render_teardown_script;

/// Mount path of the volume shared by the init and the sidecar container.
pub const DATA_DIR: &str = "/consul/connect-inject";
pub const SERVICE_CONFIG_FILE: &str = concatcp!(DATA_DIR, "/service.hcl");
pub const CENTRAL_CONFIG_FILE: &str = concatcp!(DATA_DIR, "/central-config.hcl");
pub const ACL_TOKEN_FILE: &str = concatcp!(DATA_DIR, "/acl-token");
pub const ENVOY_BOOTSTRAP_FILE: &str = concatcp!(DATA_DIR, "/envoy-bootstrap.yaml");

/// The init container copies the `consul` binary here, the sidecar image doesn't ship one.
pub const CONSUL_BINARY: &str = concatcp!(DATA_DIR, "/consul");

pub const TLS_CA_DIR: &str = "/consul/tls/ca";
pub const TLS_CLIENT_DIR: &str = "/consul/tls/client";
pub const TLS_CA_CERT_FILE: &str = concatcp!(TLS_CA_DIR, "/tls.crt");
pub const TLS_CLIENT_CERT_FILE: &str = concatcp!(TLS_CLIENT_DIR, "/tls.crt");
pub const TLS_CLIENT_KEY_FILE: &str = concatcp!(TLS_CLIENT_DIR, "/tls.key");

pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
pub const SERVICE_ACCOUNT_TOKEN_FILE: &str = concatcp!(SERVICE_ACCOUNT_DIR, "/token");

const INDENT: &str = "  ";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to write script"))]
    Write { source: fmt::Error },

    #[snafu(display("failed to encode tags {tags:?} as JSON"))]
    EncodeTags {
        source: serde_json::Error,
        tags: Vec<String>,
    },
}

/// Writes indented lines, nested blocks and multi-line shell commands.
#[derive(Debug, Default)]
pub(crate) struct ScriptBuilder {
    text: String,
    indent: usize,
}

impl ScriptBuilder {
    pub fn line(&mut self, line: impl Display) -> Result<()> {
        for _ in 0..self.indent {
            self.text.push_str(INDENT);
        }
        writeln!(self.text, "{line}").context(WriteSnafu)
    }

    pub fn blank(&mut self) -> Result<()> {
        writeln!(self.text).context(WriteSnafu)
    }

    /// `key = value`
    pub fn attribute(&mut self, key: &str, value: impl Display) -> Result<()> {
        self.line(format_args!("{key} = {value}"))
    }

    /// `key = "value"`
    pub fn string_attribute(&mut self, key: &str, value: impl Display) -> Result<()> {
        self.line(format_args!("{key} = \"{value}\""))
    }

    /// `name { ... }` with the body indented one level deeper.
    pub fn block(
        &mut self,
        name: &str,
        body: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.line(format_args!("{name} {{"))?;
        self.indent += 1;
        body(self)?;
        self.indent -= 1;
        self.line("}")
    }

    /// A shell command spread over several lines. Continuation lines are indented and all but
    /// the last line end with a backslash.
    pub fn command<S>(&mut self, lines: impl IntoIterator<Item = S>) -> Result<()>
    where
        S: Display,
    {
        let mut lines = lines.into_iter().peekable();
        let mut first = true;

        while let Some(line) = lines.next() {
            let continuation = if lines.peek().is_some() { " \\" } else { "" };
            let indent = if first { "" } else { INDENT };
            self.line(format_args!("{indent}{line}{continuation}"))?;
            first = false;
        }

        Ok(())
    }

    /// Points the `consul` CLI at the client certificates mounted into the container.
    pub fn tls_environment(&mut self) -> Result<()> {
        self.line(format_args!("export CONSUL_CACERT=\"{TLS_CA_CERT_FILE}\""))?;
        self.line(format_args!(
            "export CONSUL_CLIENT_CERT=\"{TLS_CLIENT_CERT_FILE}\""
        ))?;
        self.line(format_args!(
            "export CONSUL_CLIENT_KEY=\"{TLS_CLIENT_KEY_FILE}\""
        ))
    }

    pub fn finish(self) -> String {
        self.text
    }
}

/// Encodes tags as a JSON array of strings, e.g. `["a","b"]`.
pub(crate) fn json_array(tags: &[String]) -> Result<String> {
    serde_json::to_string(tags).context(EncodeTagsSnafu { tags })
}

/// The `-token-file` flag added to every `consul` invocation when ACLs are used.
pub(crate) fn token_file_flag() -> String {
    format!("-token-file=\"{ACL_TOKEN_FILE}\"")
}
