//! Reading the job request: either from stdin directly, or from a helper
//! subcommand named by `FLUX_IMP_EXEC_HELPER`.

use std::io::Read;
use std::process::{Command, Stdio};

use crate::error::ExecError;
use crate::job::JobInput;

pub const HELPER_ENV: &str = "FLUX_IMP_EXEC_HELPER";

/// Run the helper command named by `FLUX_IMP_EXEC_HELPER`, if set, and
/// build a `JobInput` from its stdout plus `shell`/`args`. Falls back to
/// reading directly from `stdin` when the variable isn't set.
pub fn read_job_input(shell: &str, args: &[String]) -> Result<JobInput, ExecError> {
    match std::env::var(HELPER_ENV) {
        Ok(helper) if helper.is_empty() => Err(ExecError::EmptyHelperEnv),
        Ok(helper) => JobInput::from_cmdline_and_json(shell, args, run_helper(&helper)?.as_bytes()),
        Err(_) => JobInput::from_cmdline_and_json(shell, args, std::io::stdin()),
    }
}

/// Spawn `command` (no shell expansion) and return its captured stdout.
/// Fails if the command exits with a nonzero status.
fn run_helper(command: &str) -> Result<String, ExecError> {
    let output = Command::new(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .output()
        .map_err(ExecError::Io)?;

    if !output.status.success() {
        return Err(ExecError::HelperFailed {
            command: command.to_string(),
            status: output.status.code().unwrap_or(-1),
        });
    }

    String::from_utf8(output.stdout).map_err(|e| ExecError::InvalidJson(e.to_string()))
}
