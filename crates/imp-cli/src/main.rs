//! `imp` — command-line entry point for the privilege-separated exec
//! driver. Usage: `imp exec <shell-path> [arg...]`.
//!
//! When installed setuid-root, `imp exec` forks itself: the child drops
//! its effective uid back to the real caller and does the checking a
//! caller is trusted to do on its own input, then hands the validated
//! request to the still-privileged parent over a Unix socket. When not
//! setuid, it runs single-process and only proceeds if configuration
//! explicitly allows unprivileged exec (a test/development affordance).

use clap::{Parser, Subcommand};

use imp_config::ImpConfig;
use imp_exec::{ExecDriver, JobInput, PrivsepChannel};
use imp_ident::{ImpPasswd, PasswordDb, SystemPasswordDb};
use imp_log::{JsonlLogger, Logger};
use imp_sign::{MechEnv, Mechanism};

#[derive(Debug, Parser)]
#[command(name = "imp")]
#[command(about = "Privilege-separated job shell exec driver")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Verify a signed job token and exec the named job shell as its
    /// claimed user.
    Exec {
        /// Path to the job shell binary.
        shell_path: String,
        /// Arguments passed through to the job shell.
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    let mut logger = JsonlLogger::to_stderr();

    let config = match ImpConfig::load_from_env(&Mechanism::ALL_NAMES) {
        Ok(c) => c,
        Err(e) => {
            logger.error(format!("config.load.failed: {e}")).ok();
            std::process::exit(1);
        }
    };

    match cli.command {
        Command::Exec { shell_path, args } => {
            let mut full_args = Vec::with_capacity(args.len() + 1);
            full_args.push(shell_path.clone());
            full_args.extend(args);
            run_exec(&config, &shell_path, &full_args, &mut logger);
        }
    }
}

fn run_exec(config: &ImpConfig, shell_path: &str, args: &[String], logger: &mut dyn Logger) -> ! {
    let mech_env = MechEnv::from_process_env();
    let passwd_db = SystemPasswordDb;

    // SAFETY: geteuid/getuid take no arguments and cannot fail.
    let (euid, uid) = unsafe { (libc::geteuid(), libc::getuid()) };
    let is_setuid = euid == 0 && uid != 0;

    let exit_code = if is_setuid {
        run_privileged_parent(config, &mech_env, &passwd_db, shell_path, args, logger)
    } else {
        run_single_process(config, &mech_env, &passwd_db, shell_path, args, logger)
    };

    std::process::exit(exit_code);
}

fn resolve_imp_identity(db: &dyn PasswordDb, logger: &mut dyn Logger) -> ImpPasswd {
    // SAFETY: getuid takes no arguments and cannot fail.
    let real_uid = unsafe { libc::getuid() };
    match db.by_uid(real_uid) {
        Ok(pw) => pw,
        Err(e) => {
            logger.error(format!("ident.lookup.failed: {e}")).ok();
            std::process::exit(1);
        }
    }
}

fn run_single_process(
    config: &ImpConfig,
    mech_env: &MechEnv,
    passwd_db: &dyn PasswordDb,
    shell_path: &str,
    args: &[String],
    logger: &mut dyn Logger,
) -> i32 {
    let imp_identity = resolve_imp_identity(passwd_db, logger);
    let job = match imp_exec::read_job_input(shell_path, args) {
        Ok(j) => j,
        Err(e) => {
            logger.error(format!("job.read.failed: {e}")).ok();
            return 1;
        }
    };

    let driver = ExecDriver {
        config: &config.exec,
        mech_env,
        allowed_types: &config.sign.allowed_types,
        passwd_db,
    };

    match driver.exec_unprivileged(&imp_identity, job, None, logger) {
        Ok(code) => code,
        Err(e) => {
            logger.error(format!("exec.unprivileged.failed: {e}")).ok();
            1
        }
    }
}

fn run_privileged_parent(
    config: &ImpConfig,
    mech_env: &MechEnv,
    passwd_db: &dyn PasswordDb,
    shell_path: &str,
    args: &[String],
    logger: &mut dyn Logger,
) -> i32 {
    let imp_identity = resolve_imp_identity(passwd_db, logger);

    let (mut parent_end, child_end) = match PrivsepChannel::pair() {
        Ok(pair) => pair,
        Err(e) => {
            logger.error(format!("privsep.pair.failed: {e}")).ok();
            return 1;
        }
    };

    // SAFETY: fork(2); the child branch only runs code written to be
    // safe immediately after fork, before any exec.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        logger.error("privsep.fork.failed").ok();
        return 1;
    }

    if pid == 0 {
        drop(parent_end);
        run_unprivileged_child(
            config,
            mech_env,
            passwd_db,
            &imp_identity,
            shell_path,
            args,
            child_end,
        );
    }
    drop(child_end);

    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: waitpid on the pid this process just forked.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == pid {
            break;
        }
        if std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            logger.error("privsep.waitpid.failed").ok();
            return 1;
        }
    }
    if !(libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0) {
        logger.error("privsep.child.failed").ok();
        return 1;
    }

    let job = match parent_end
        .read_kv()
        .map_err(|e| e.to_string())
        .and_then(|kv| JobInput::from_kv(&kv).map_err(|e| e.to_string()))
    {
        Ok(job) => job,
        Err(e) => {
            logger.error(format!("privsep.read.failed: {e}")).ok();
            return 1;
        }
    };

    let driver = ExecDriver {
        config: &config.exec,
        mech_env,
        allowed_types: &config.sign.allowed_types,
        passwd_db,
    };

    match driver.exec_privileged(&imp_identity, job, &mut parent_end, logger) {
        Ok(code) => code,
        Err(e) => {
            logger.error(format!("exec.privileged.failed: {e}")).ok();
            1
        }
    }
}

/// Runs in the forked child, with its effective uid dropped to the real
/// caller's. Reads the job request, validates what an unprivileged
/// caller is trusted to validate, and hands it to the privileged parent.
/// Always exits the process; never returns.
fn run_unprivileged_child(
    config: &ImpConfig,
    mech_env: &MechEnv,
    passwd_db: &dyn PasswordDb,
    imp_identity: &ImpPasswd,
    shell_path: &str,
    args: &[String],
    mut channel: PrivsepChannel,
) -> ! {
    // SAFETY: getuid/seteuid take plain scalar arguments; dropping to the
    // real uid here is reversible only because this process still has
    // its real uid 0 to seteuid back from, which it never does.
    unsafe {
        let real_uid = libc::getuid();
        libc::seteuid(real_uid);
    }

    let job = match imp_exec::read_job_input(shell_path, args) {
        Ok(j) => j,
        Err(_) => std::process::exit(1),
    };

    let driver = ExecDriver {
        config: &config.exec,
        mech_env,
        allowed_types: &config.sign.allowed_types,
        passwd_db,
    };

    let mut logger = JsonlLogger::to_stderr();
    match driver.exec_unprivileged(imp_identity, job, Some(&mut channel), &mut logger) {
        Ok(code) => std::process::exit(code),
        Err(_) => std::process::exit(1),
    }
}
