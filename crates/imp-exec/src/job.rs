//! The job shell request: a signed token plus a shell command line,
//! carried either inline (privsep `kv` blob) or as JSON on stdin.

use std::io::Read;

use imp_kv::Kv;

use crate::error::ExecError;

/// A job shell invocation as parsed from either side of the privsep
/// channel, before the token in `j_token` has been verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInput {
    pub j_token: String,
    pub shell: String,
    pub args: Vec<String>,
}

impl JobInput {
    /// Parse from the flattened `Kv` sent over the privsep channel:
    /// `J`, `shell_path`, and an `args`-namespaced argv.
    pub fn from_kv(kv: &Kv) -> Result<JobInput, ExecError> {
        let j_token = kv.get_str("J")?.to_string();
        let shell = kv.get_str("shell_path")?.to_string();
        let args = kv.split("args").expand_argv()?;
        Ok(JobInput {
            j_token,
            shell,
            args,
        })
    }

    /// Flatten into a `Kv` suitable for sending over the privsep channel.
    pub fn to_kv(&self) -> Kv {
        let mut kv = Kv::new();
        kv.put_str("J", self.j_token.clone());
        kv.put_str("shell_path", self.shell.clone());
        let argv_kv = Kv::encode_argv(&self.args);
        kv.join(&argv_kv, "args");
        kv
    }

    /// Build from the command line (`shell` plus following args) and a
    /// signed token read as JSON from `reader`: `{"J": "<token>"}`.
    pub fn from_cmdline_and_json(
        shell: &str,
        args: &[String],
        reader: impl Read,
    ) -> Result<JobInput, ExecError> {
        let j_token = read_j_token(reader)?;
        Ok(JobInput {
            j_token,
            shell: shell.to_string(),
            args: args.to_vec(),
        })
    }
}

/// Read `{"J": "<token>"}` from `reader` and return the token string.
pub fn read_j_token(mut reader: impl Read) -> Result<String, ExecError> {
    let mut buf = String::new();
    reader
        .read_to_string(&mut buf)
        .map_err(ExecError::Io)?;
    let value: serde_json::Value =
        serde_json::from_str(&buf).map_err(|e| ExecError::InvalidJson(e.to_string()))?;
    value
        .get("J")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or(ExecError::MissingField("J"))
}
