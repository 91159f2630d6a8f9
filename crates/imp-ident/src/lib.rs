//! Passwd lookup and irreversible privilege drop.
//!
//! `PasswordDb` resolves a uid or username to an [`ImpPasswd`] entry.
//! `SystemPasswordDb` goes through glibc's NSS-aware `getpwuid_r`/
//! `getpwnam_r`; `FilePasswordDb` parses a passwd-format file directly and
//! exists only so tests don't depend on the real `/etc/passwd`.
//!
//! `switch_user` drops root for a target identity by setting supplementary
//! groups, then gid, then uid, in that order — the only order that cannot
//! leave the process able to regain a dropped privilege.

use std::ffi::{CStr, CString};
use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentError {
    #[error("user {0:?} not found")]
    UserNotFound(String),
    #[error("uid {0} not found")]
    UidNotFound(u32),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("name {0:?} contains an interior NUL byte")]
    InteriorNul(String),
    #[error("failed to switch identity: {0}")]
    SwitchFailed(String),
}

/// A resolved passwd entry, analogous to `struct passwd`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImpPasswd {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub shell: String,
}

pub trait PasswordDb {
    fn by_uid(&self, uid: u32) -> Result<ImpPasswd, IdentError>;
    fn by_name(&self, name: &str) -> Result<ImpPasswd, IdentError>;
}

/// Looks up identities through the system's NSS-configured passwd
/// database via `getpwuid_r`/`getpwnam_r`.
pub struct SystemPasswordDb;

const PWBUF_LEN: usize = 16 * 1024;

fn passwd_from_c(pw: &libc::passwd) -> Result<ImpPasswd, IdentError> {
    // SAFETY: glibc guarantees these pointers are valid, NUL-terminated C
    // strings when getpwuid_r/getpwnam_r report success.
    unsafe {
        Ok(ImpPasswd {
            name: CStr::from_ptr(pw.pw_name).to_string_lossy().into_owned(),
            uid: pw.pw_uid,
            gid: pw.pw_gid,
            home: CStr::from_ptr(pw.pw_dir).to_string_lossy().into_owned(),
            shell: CStr::from_ptr(pw.pw_shell).to_string_lossy().into_owned(),
        })
    }
}

impl PasswordDb for SystemPasswordDb {
    fn by_uid(&self, uid: u32) -> Result<ImpPasswd, IdentError> {
        let mut pw: libc::passwd = unsafe { std::mem::zeroed() };
        let mut buf = vec![0i8; PWBUF_LEN];
        let mut result: *mut libc::passwd = std::ptr::null_mut();

        // SAFETY: buf and pw are sized/zeroed scratch space owned for the
        // duration of this call; getpwuid_r writes into them and sets
        // `result` to `&mut pw` on success or leaves it null.
        let rc = unsafe {
            libc::getpwuid_r(
                uid,
                &mut pw,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result,
            )
        };
        if rc != 0 {
            return Err(IdentError::Io(io::Error::from_raw_os_error(rc)));
        }
        if result.is_null() {
            return Err(IdentError::UidNotFound(uid));
        }
        passwd_from_c(&pw)
    }

    fn by_name(&self, name: &str) -> Result<ImpPasswd, IdentError> {
        let c_name =
            CString::new(name).map_err(|_| IdentError::InteriorNul(name.to_string()))?;
        let mut pw: libc::passwd = unsafe { std::mem::zeroed() };
        let mut buf = vec![0i8; PWBUF_LEN];
        let mut result: *mut libc::passwd = std::ptr::null_mut();

        // SAFETY: same contract as by_uid, with a NUL-terminated name.
        let rc = unsafe {
            libc::getpwnam_r(
                c_name.as_ptr(),
                &mut pw,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result,
            )
        };
        if rc != 0 {
            return Err(IdentError::Io(io::Error::from_raw_os_error(rc)));
        }
        if result.is_null() {
            return Err(IdentError::UserNotFound(name.to_string()));
        }
        passwd_from_c(&pw)
    }
}

/// Parse one colon-delimited `/etc/passwd`-format line. Returns `None`
/// for comments, blank lines, or malformed entries.
fn parse_passwd_line(line: &str) -> Option<ImpPasswd> {
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() != 7 || fields[0].is_empty() {
        return None;
    }
    let uid = fields[2].parse::<u32>().ok()?;
    let gid = fields[3].parse::<u32>().ok()?;
    Some(ImpPasswd {
        name: fields[0].to_string(),
        uid,
        gid,
        home: fields[5].to_string(),
        shell: fields[6].to_string(),
    })
}

/// Looks up identities from a passwd-format file loaded into memory.
/// Test-only: production code always goes through [`SystemPasswordDb`].
pub struct FilePasswordDb {
    entries: Vec<ImpPasswd>,
}

impl FilePasswordDb {
    pub fn from_contents(contents: &str) -> Self {
        Self {
            entries: contents.lines().filter_map(parse_passwd_line).collect(),
        }
    }

    pub fn load(path: &std::path::Path) -> Result<Self, IdentError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(Self::from_contents(&contents))
    }
}

impl PasswordDb for FilePasswordDb {
    fn by_uid(&self, uid: u32) -> Result<ImpPasswd, IdentError> {
        self.entries
            .iter()
            .find(|e| e.uid == uid)
            .cloned()
            .ok_or(IdentError::UidNotFound(uid))
    }

    fn by_name(&self, name: &str) -> Result<ImpPasswd, IdentError> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .cloned()
            .ok_or_else(|| IdentError::UserNotFound(name.to_string()))
    }
}

/// Read back the real/effective/saved gid via `getresgid(2)`.
fn current_resgid() -> Result<(u32, u32, u32), IdentError> {
    let (mut rgid, mut egid, mut sgid) = (0u32, 0u32, 0u32);
    // SAFETY: three valid out-pointers to plain u32 locals.
    let rc = unsafe { libc::getresgid(&mut rgid, &mut egid, &mut sgid) };
    if rc != 0 {
        return Err(IdentError::SwitchFailed(format!(
            "getresgid: {}",
            io::Error::last_os_error()
        )));
    }
    Ok((rgid, egid, sgid))
}

/// Read back the real/effective/saved uid via `getresuid(2)`.
fn current_resuid() -> Result<(u32, u32, u32), IdentError> {
    let (mut ruid, mut euid, mut suid) = (0u32, 0u32, 0u32);
    // SAFETY: three valid out-pointers to plain u32 locals.
    let rc = unsafe { libc::getresuid(&mut ruid, &mut euid, &mut suid) };
    if rc != 0 {
        return Err(IdentError::SwitchFailed(format!(
            "getresuid: {}",
            io::Error::last_os_error()
        )));
    }
    Ok((ruid, euid, suid))
}

/// Irreversibly drop privileges to `target`: set supplementary groups,
/// then the real/effective gid, then the real/effective uid. This order
/// is the only one that can't leave the process able to climb back to a
/// higher privilege level than `target` — setting uid before gid would
/// leave the process unable to change its gid at all. After each of
/// `setgid`/`setuid` the id is read back with `getresgid`/`getresuid` to
/// confirm the change actually stuck, rather than trusting the syscall's
/// return value alone.
pub fn switch_user(target: &ImpPasswd) -> Result<(), IdentError> {
    let c_name =
        CString::new(target.name.as_str()).map_err(|_| IdentError::InteriorNul(target.name.clone()))?;

    // SAFETY: initgroups/setgid/setuid take plain scalar/C-string
    // arguments; failures are reported through errno and surfaced below.
    unsafe {
        if libc::initgroups(c_name.as_ptr(), target.gid) != 0 {
            return Err(IdentError::SwitchFailed(format!(
                "initgroups: {}",
                io::Error::last_os_error()
            )));
        }
        if libc::setgid(target.gid) != 0 {
            return Err(IdentError::SwitchFailed(format!(
                "setgid: {}",
                io::Error::last_os_error()
            )));
        }
    }
    let (rgid, egid, sgid) = current_resgid()?;
    if rgid != target.gid || egid != target.gid || sgid != target.gid {
        return Err(IdentError::SwitchFailed(format!(
            "setgid did not stick: real={rgid} effective={egid} saved={sgid}, wanted {}",
            target.gid
        )));
    }

    // SAFETY: setuid takes a plain scalar argument.
    unsafe {
        if libc::setuid(target.uid) != 0 {
            return Err(IdentError::SwitchFailed(format!(
                "setuid: {}",
                io::Error::last_os_error()
            )));
        }
    }
    let (ruid, euid, suid) = current_resuid()?;
    if ruid != target.uid || euid != target.uid || suid != target.uid {
        return Err(IdentError::SwitchFailed(format!(
            "setuid did not stick: real={ruid} effective={euid} saved={suid}, wanted {}",
            target.uid
        )));
    }

    Ok(())
}
