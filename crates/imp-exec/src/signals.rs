//! Signal forwarding from the privileged IMP process to the job shell
//! child it forked. The handler is async-signal-safe: it only reads an
//! `AtomicI32` and calls `kill(2)`.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::ExecError;

/// Pid of the forked job shell child, or `-1` if none is running yet.
/// Read only by [`forward_to_child`], which runs as a signal handler.
static CHILD_PID: AtomicI32 = AtomicI32::new(-1);

/// Record the child pid so the signal handler knows who to forward to.
/// Must be called before signals are unblocked in the parent.
pub fn set_child_pid(pid: i32) {
    CHILD_PID.store(pid, Ordering::SeqCst);
}

extern "C" fn forward_to_child(signal: libc::c_int) {
    let pid = CHILD_PID.load(Ordering::SeqCst);
    if pid > 0 {
        // SAFETY: kill(2) with plain scalar arguments; async-signal-safe.
        unsafe {
            libc::kill(pid, signal);
        }
    }
}

/// Signals forwarded to the job shell child while the privileged IMP
/// waits on it.
const FORWARDED_SIGNALS: [libc::c_int; 8] = [
    libc::SIGTERM,
    libc::SIGINT,
    libc::SIGHUP,
    libc::SIGCONT,
    libc::SIGALRM,
    libc::SIGWINCH,
    libc::SIGTTIN,
    libc::SIGTTOU,
];

/// Install `forward_to_child` for each of [`FORWARDED_SIGNALS`], then
/// unblock exactly that set (every other signal stays blocked, since
/// `sigblock_all` was called before the fork this follows).
pub fn setup_signal_forwarding() -> Result<(), ExecError> {
    // SAFETY: sigset_t is a POD type; sigfillset/sigdelset/sigaction/
    // sigprocmask take valid pointers to it and plain scalar arguments.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = forward_to_child as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);

        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut mask);

        for &signal in &FORWARDED_SIGNALS {
            libc::sigdelset(&mut mask, signal);
            if libc::sigaction(signal, &sa, std::ptr::null_mut()) < 0 {
                return Err(ExecError::Io(std::io::Error::last_os_error()));
            }
        }

        if libc::sigprocmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut()) < 0 {
            return Err(ExecError::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Block every signal. Called before forking the job shell child so the
/// privileged parent can't be killed before it's set up forwarding.
pub fn block_all() -> Result<(), ExecError> {
    // SAFETY: sigfillset/sigprocmask with a valid local sigset_t.
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut mask);
        if libc::sigprocmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut()) < 0 {
            return Err(ExecError::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Unblock every signal. Called in the forked child immediately after
/// `fork()`, before switching identity and exec'ing the job shell.
pub fn unblock_all() -> Result<(), ExecError> {
    // SAFETY: sigemptyset/sigprocmask with a valid local sigset_t.
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        if libc::sigprocmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut()) < 0 {
            return Err(ExecError::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}
