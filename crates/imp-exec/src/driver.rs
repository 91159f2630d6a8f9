//! The privilege-separated exec driver itself: authorization checks,
//! token verification, fork/exec of the job shell, and exit code mapping.

use std::ffi::CString;

use imp_cgroup::CgroupInfo;
use imp_config::ExecConfig;
use imp_ident::{switch_user, ImpPasswd, PasswordDb};
use imp_log::Logger;
use imp_sign::MechEnv;

use crate::error::ExecError;
use crate::job::JobInput;
use crate::privsep::PrivsepChannel;
use crate::signals;

/// Bundles the pieces every exec entry point needs: the exec-side
/// policy, the signing environment and mechanism allow-list, and the
/// passwd backend used to resolve both the IMP's own identity and the
/// job's target user.
pub struct ExecDriver<'a> {
    pub config: &'a ExecConfig,
    pub mech_env: &'a MechEnv,
    pub allowed_types: &'a [String],
    pub passwd_db: &'a dyn PasswordDb,
}

impl<'a> ExecDriver<'a> {
    pub fn user_allowed(&self, username: &str) -> bool {
        self.config.allowed_users.iter().any(|u| u == username)
    }

    pub fn shell_allowed(&self, shell: &str) -> bool {
        self.config.allowed_shells.iter().any(|s| s == shell)
    }

    pub fn unprivileged_allowed(&self) -> bool {
        self.config.allow_unprivileged_exec
    }

    fn unwrap_job(&self, job: &JobInput) -> Result<(i64, Vec<u8>), ExecError> {
        let unwrapped =
            imp_token::unwrap(&job.j_token, self.mech_env, 0, self.allowed_types)?;
        Ok((unwrapped.userid, unwrapped.payload))
    }

    /// Privileged-side entry point. Verifies the token, resolves the
    /// target user, forks, irreversibly switches the child to that user,
    /// execs the job shell in the child, and in the parent forwards
    /// signals and waits for the child's exit, returning the exit code
    /// the calling process should itself exit with.
    pub fn exec_privileged(
        &self,
        imp_identity: &ImpPasswd,
        job: JobInput,
        privsep: &mut PrivsepChannel,
        logger: &mut dyn Logger,
    ) -> Result<i32, ExecError> {
        if !self.user_allowed(&imp_identity.name) {
            return Err(ExecError::UserNotAllowed(imp_identity.name.clone()));
        }

        let (userid, _payload) = self.unwrap_job(&job)?;
        let user_pwd = self.passwd_db.by_uid(userid as u32)?;

        if user_pwd.uid == 0 {
            return Err(ExecError::RootTargetDenied);
        }
        if !self.shell_allowed(&job.shell) {
            return Err(ExecError::ShellNotAllowed(job.shell.clone()));
        }

        // Don't act on the request until the unprivileged side confirms
        // it finished its own checks.
        privsep.wait_ready()?;

        signals::block_all()?;

        // SAFETY: fork(2); the child branch below only calls
        // async-signal-safe functions before exec'ing.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(ExecError::ForkFailed(std::io::Error::last_os_error()));
        }

        if pid == 0 {
            signals::unblock_all()?;
            switch_user(&user_pwd)?;
            exec_into_shell(&job.shell, &job.args);
        }

        signals::set_child_pid(pid);
        signals::setup_signal_forwarding()?;

        let exit_code = wait_and_map_exit_code(pid)?;

        reap_job_cgroup(logger);

        Ok(exit_code)
    }

    /// Unprivileged-side entry point. In privsep mode, validates what it
    /// can (allowed-users, allowed-shells, and the token's signature) then
    /// hands the request to the privileged side and returns 0. Outside
    /// privsep mode, execs directly only if unprivileged exec is
    /// explicitly allowed in configuration — a test/development
    /// affordance, never how a setuid install runs. The token is verified
    /// here too so a forged or unsigned job fails fast, before either a
    /// direct exec or a wasted round trip to the privileged side.
    pub fn exec_unprivileged(
        &self,
        imp_identity: &ImpPasswd,
        job: JobInput,
        privsep: Option<&mut PrivsepChannel>,
        logger: &mut dyn Logger,
    ) -> Result<i32, ExecError> {
        if !self.user_allowed(&imp_identity.name) {
            return Err(ExecError::UserNotAllowed(imp_identity.name.clone()));
        }

        self.unwrap_job(&job)?;

        if let Some(channel) = privsep {
            if !self.shell_allowed(&job.shell) {
                return Err(ExecError::ShellNotAllowed(job.shell.clone()));
            }
            channel.write_kv(&job.to_kv())?;
            channel.send_ready()?;
            return Ok(0);
        }

        if !self.unprivileged_allowed() {
            return Err(ExecError::UnprivilegedExecDisabled);
        }

        logger
            .warn("exec.unprivileged-fallback: userid switching not available")
            .ok();

        exec_into_shell(&job.shell, &job.args);
    }
}

/// chdir to `/`, then `execvp` the shell. Never returns: either the
/// process image is replaced, or this calls `process::exit`.
///
/// The original C fell through `exit_code = 127` unconditionally after
/// the EPERM/EACCES check — this `else` is the fix.
fn exec_into_shell(shell: &str, args: &[String]) -> ! {
    // SAFETY: chdir with a valid NUL-terminated path.
    let root = CString::new("/").expect("no interior NUL");
    if unsafe { libc::chdir(root.as_ptr()) } < 0 {
        std::process::exit(1);
    }

    let c_shell = match CString::new(shell) {
        Ok(s) => s,
        Err(_) => std::process::exit(127),
    };
    let c_args: Vec<CString> = args
        .iter()
        .map(|a| CString::new(a.as_str()).unwrap_or_default())
        .collect();
    let mut argv: Vec<*const libc::c_char> =
        c_args.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());

    // SAFETY: execvp with a NUL-terminated argv array of valid C strings.
    unsafe {
        libc::execvp(c_shell.as_ptr(), argv.as_ptr());
    }

    let exit_code = if matches!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::EPERM) | Some(libc::EACCES)
    ) {
        126
    } else {
        127
    };
    std::process::exit(exit_code);
}

/// Wait for `pid` to exit, retrying on `EINTR`, and map its wait status
/// to a process exit code: exited -> that code, killed by signal N ->
/// `128 + N`, otherwise -> `1`.
fn wait_and_map_exit_code(pid: i32) -> Result<i32, ExecError> {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: waitpid on a pid this process just forked.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == pid {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(ExecError::Io(err));
        }
    }

    if libc::WIFEXITED(status) {
        Ok(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        Ok(128 + libc::WTERMSIG(status))
    } else {
        Ok(1)
    }
}

/// Best-effort cleanup of any processes the job shell left behind in its
/// cgroup. Never fails the overall exec: a cgroup discovery or kill
/// failure is logged and ignored.
fn reap_job_cgroup(logger: &mut dyn Logger) {
    let info = match CgroupInfo::discover() {
        Ok(info) => info,
        Err(_) => return,
    };
    if !info.use_cgroup_kill {
        return;
    }
    if let Err(e) = info.kill(libc::SIGKILL, logger) {
        logger
            .warn(format!("cgroup.kill.failed: {e}"))
            .ok();
        return;
    }
    if let Err(e) = info.wait_for_empty(imp_cgroup::sleep_one_second, logger) {
        logger
            .warn(format!("cgroup.wait_for_empty.failed: {e}"))
            .ok();
    }
}
