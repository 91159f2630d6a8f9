//! Cgroup discovery and process reaping for the job shell it forked.
//!
//! Discovers whether the running process is under a unified (cgroup2) or
//! legacy (cgroup v1 + systemd) hierarchy, locates this process's cgroup
//! path, and — when the cgroup basename looks like a job shell's cgroup —
//! signals and reaps the processes left inside it after the job exits.

use std::ffi::CString;
use std::fs;
use std::io;
use std::time::Duration;

use imp_log::Logger;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CgroupError {
    #[error("could not determine cgroup mount point and hierarchy type")]
    MountNotFound,
    #[error("could not find this process's cgroup path in /proc/self/cgroup")]
    PathNotFound,
    #[error(transparent)]
    Io(#[from] io::Error),
}

const TMPFS_MAGIC: i64 = 0x0102_1994;
const CGROUP_SUPER_MAGIC: i64 = 0x0027_e0eb;
const CGROUP2_SUPER_MAGIC: i64 = 0x6367_7270;

/// Everything known about this process's cgroup placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupInfo {
    pub mount_dir: String,
    pub path: String,
    pub unified: bool,
    pub use_cgroup_kill: bool,
}

/// `statfs(2)` the filesystem type of `path`. Returns `None` if the path
/// can't be stat'd (doesn't exist, permission denied, etc).
fn statfs_type(path: &str) -> Option<i64> {
    let c_path = CString::new(path).ok()?;
    // SAFETY: `c_path` is a valid NUL-terminated C string and `stat` is a
    // plain-old-data struct we fully initialize before reading from it.
    unsafe {
        let mut stat: libc::statfs = std::mem::zeroed();
        if libc::statfs(c_path.as_ptr(), &mut stat) == 0 {
            Some(stat.f_type as i64)
        } else {
            None
        }
    }
}

/// The four-probe discovery in `cgroup_init_mount_dir_and_type`: unified
/// cgroup2 at `/sys/fs/cgroup`, unified cgroup2 at
/// `/sys/fs/cgroup/unified`, or legacy systemd cgroup at
/// `/sys/fs/cgroup/systemd` under a tmpfs root.
fn discover_mount_dir_and_type(
    probe: impl Fn(&str) -> Option<i64>,
) -> Result<(String, bool), CgroupError> {
    let root = "/sys/fs/cgroup";
    let root_type = probe(root).ok_or(CgroupError::MountNotFound)?;
    if root_type == CGROUP2_SUPER_MAGIC {
        return Ok((root.to_string(), true));
    }

    let unified_dir = "/sys/fs/cgroup/unified";
    if let Some(t) = probe(unified_dir) {
        if t == CGROUP2_SUPER_MAGIC {
            return Ok((unified_dir.to_string(), true));
        }
    }

    if root_type == TMPFS_MAGIC {
        let systemd_dir = "/sys/fs/cgroup/systemd";
        if let Some(t) = probe(systemd_dir) {
            if t == CGROUP_SUPER_MAGIC {
                return Ok((systemd_dir.to_string(), false));
            }
        }
    }

    Err(CgroupError::MountNotFound)
}

/// Strip repeated leading `/..` segments from a relative cgroup path, as
/// seen when the cgroup is mounted from inside a container.
fn remove_leading_dotdot(mut relpath: &str) -> &str {
    while let Some(rest) = relpath.strip_prefix("/..") {
        relpath = rest;
    }
    relpath
}

/// Split one `/proc/self/cgroup` line into `(subsys, relpath)`, matching
/// the format `hierarchy-id:controller-list:path`.
fn parse_cgroup_line(line: &str) -> Option<(&str, &str)> {
    let mut parts = line.splitn(3, ':');
    let _hierarchy_id = parts.next()?;
    let subsys = parts.next()?;
    let relpath = parts.next()?;
    Some((subsys, remove_leading_dotdot(relpath)))
}

/// Find this process's cgroup relative path from the contents of
/// `/proc/self/cgroup`, given whether the hierarchy is unified.
fn find_relpath(proc_cgroup_contents: &str, unified: bool) -> Option<String> {
    for line in proc_cgroup_contents.lines() {
        let Some((subsys, relpath)) = parse_cgroup_line(line) else {
            continue;
        };
        let matches = if unified {
            subsys.is_empty()
        } else {
            subsys == "name=systemd"
        };
        if matches {
            return Some(relpath.to_string());
        }
    }
    None
}

impl CgroupInfo {
    /// Discover the current process's cgroup mount point, hierarchy type,
    /// and path. Fails if neither a unified nor a legacy systemd hierarchy
    /// can be located.
    pub fn discover() -> Result<CgroupInfo, CgroupError> {
        let contents = fs::read_to_string("/proc/self/cgroup")?;
        Self::discover_with(&contents, statfs_type)
    }

    /// Same as [`CgroupInfo::discover`] but with the `/proc/self/cgroup`
    /// contents and the statfs probe supplied directly, for testing.
    fn discover_with(
        proc_cgroup_contents: &str,
        probe: impl Fn(&str) -> Option<i64>,
    ) -> Result<CgroupInfo, CgroupError> {
        let (mount_dir, unified) = discover_mount_dir_and_type(probe)?;
        let relpath =
            find_relpath(proc_cgroup_contents, unified).ok_or(CgroupError::PathNotFound)?;
        let path = format!("{mount_dir}{relpath}");
        let use_cgroup_kill = std::path::Path::new(&path)
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("imp-shell"))
            .unwrap_or(false);
        Ok(CgroupInfo {
            mount_dir,
            path,
            unified,
            use_cgroup_kill,
        })
    }

    /// Send `sig` to every pid listed in this cgroup's `cgroup.procs`,
    /// skipping the calling process. Returns the count of pids signaled
    /// successfully, or `Err` only if every signal attempt failed. Each
    /// individual failed `kill` is logged as a warning and otherwise
    /// ignored.
    pub fn kill(&self, sig: i32, logger: &mut dyn Logger) -> Result<i32, CgroupError> {
        let procs_path = format!("{}/cgroup.procs", self.path);
        let contents = fs::read_to_string(&procs_path)?;
        let current_pid = std::process::id() as i32;

        let mut count = 0;
        let mut any_failure = false;
        for tok in contents.split_whitespace() {
            let Ok(pid) = tok.parse::<i32>() else {
                continue;
            };
            if pid == current_pid {
                continue;
            }
            // SAFETY: kill(2) with a plain pid and signal number.
            let rc = unsafe { libc::kill(pid, sig) };
            if rc < 0 {
                any_failure = true;
                logger
                    .warn(format!(
                        "cgroup.kill.failed: pid {pid} signal {sig}: {}",
                        io::Error::last_os_error()
                    ))
                    .ok();
                continue;
            }
            count += 1;
        }

        if any_failure && count == 0 {
            return Err(CgroupError::Io(io::Error::last_os_error()));
        }
        Ok(count)
    }

    /// Poll this cgroup's `cgroup.procs` with a signal-0 existence probe
    /// until empty, sleeping ~1s between polls. A no-op unless
    /// `use_cgroup_kill` is set. `interrupted` lets a caller shorten the
    /// sleep (mirroring the original's `EINTR` handling) without this
    /// crate depending on a specific signal-delivery mechanism.
    pub fn wait_for_empty(
        &self,
        mut sleep: impl FnMut() -> bool,
        logger: &mut dyn Logger,
    ) -> Result<(), CgroupError> {
        if !self.use_cgroup_kill {
            return Ok(());
        }
        loop {
            let remaining = self.kill(0, logger)?;
            if remaining == 0 {
                return Ok(());
            }
            let interrupted = sleep();
            if interrupted {
                std::thread::sleep(Duration::from_micros(2000));
            }
        }
    }
}

/// Real-time `wait_for_empty` sleep step: 1 second, reporting whether it
/// was cut short. Exposed for callers that don't need to inject a fake
/// clock.
pub fn sleep_one_second() -> bool {
    std::thread::sleep(Duration::from_secs(1));
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use imp_log::LogEntry;

    /// Collects every logged event's `event` string, for asserting a
    /// warning was actually emitted.
    struct RecordingLogger<'a>(&'a mut Vec<String>);

    impl Logger for RecordingLogger<'_> {
        fn log(&mut self, entry: LogEntry) -> io::Result<()> {
            self.0.push(entry.event);
            Ok(())
        }
    }

    #[test]
    fn remove_leading_dotdot_strips_repeats() {
        assert_eq!(remove_leading_dotdot("/../../foo/bar"), "/foo/bar");
        assert_eq!(remove_leading_dotdot("/foo/bar"), "/foo/bar");
    }

    #[test]
    fn parse_unified_line() {
        let (subsys, relpath) = parse_cgroup_line("0::/user.slice/imp-shell-1234").unwrap();
        assert_eq!(subsys, "");
        assert_eq!(relpath, "/user.slice/imp-shell-1234");
    }

    #[test]
    fn parse_legacy_systemd_line() {
        let (subsys, relpath) =
            parse_cgroup_line("1:name=systemd:/user.slice/imp-shell-5").unwrap();
        assert_eq!(subsys, "name=systemd");
        assert_eq!(relpath, "/user.slice/imp-shell-5");
    }

    #[test]
    fn find_relpath_picks_unified_entry() {
        let contents = "12:cpu,cpuacct:/user.slice\n0::/user.slice/imp-shell-9\n";
        assert_eq!(
            find_relpath(contents, true),
            Some("/user.slice/imp-shell-9".to_string())
        );
    }

    #[test]
    fn find_relpath_picks_systemd_entry_when_legacy() {
        let contents = "1:name=systemd:/user.slice/imp-shell-9\n4:cpu:/other\n";
        assert_eq!(
            find_relpath(contents, false),
            Some("/user.slice/imp-shell-9".to_string())
        );
    }

    #[test]
    fn find_relpath_none_when_no_match() {
        let contents = "4:cpu:/other\n";
        assert_eq!(find_relpath(contents, true), None);
    }

    #[test]
    fn discover_with_unified_probe() {
        let probe = |path: &str| match path {
            "/sys/fs/cgroup" => Some(CGROUP2_SUPER_MAGIC),
            _ => None,
        };
        let contents = "0::/user.slice/imp-shell-42\n";
        let info = CgroupInfo::discover_with(contents, probe).unwrap();
        assert!(info.unified);
        assert_eq!(info.mount_dir, "/sys/fs/cgroup");
        assert_eq!(info.path, "/sys/fs/cgroup/user.slice/imp-shell-42");
        assert!(info.use_cgroup_kill);
    }

    #[test]
    fn discover_with_legacy_probe() {
        let probe = |path: &str| match path {
            "/sys/fs/cgroup" => Some(TMPFS_MAGIC),
            "/sys/fs/cgroup/systemd" => Some(CGROUP_SUPER_MAGIC),
            _ => None,
        };
        let contents = "1:name=systemd:/user.slice/other-job\n";
        let info = CgroupInfo::discover_with(contents, probe).unwrap();
        assert!(!info.unified);
        assert_eq!(info.mount_dir, "/sys/fs/cgroup/systemd");
        assert!(!info.use_cgroup_kill);
    }

    #[test]
    fn discover_fails_when_no_mount_found() {
        let probe = |_: &str| None;
        let contents = "0::/user.slice\n";
        assert!(matches!(
            CgroupInfo::discover_with(contents, probe),
            Err(CgroupError::MountNotFound)
        ));
    }

    #[test]
    fn discover_fails_when_path_not_found() {
        let probe = |path: &str| match path {
            "/sys/fs/cgroup" => Some(CGROUP2_SUPER_MAGIC),
            _ => None,
        };
        let contents = "4:cpu:/other\n";
        assert!(matches!(
            CgroupInfo::discover_with(contents, probe),
            Err(CgroupError::PathNotFound)
        ));
    }

    #[test]
    fn use_cgroup_kill_false_for_non_imp_shell_path() {
        let probe = |path: &str| match path {
            "/sys/fs/cgroup" => Some(CGROUP2_SUPER_MAGIC),
            _ => None,
        };
        let contents = "0::/user.slice/other-thing\n";
        let info = CgroupInfo::discover_with(contents, probe).unwrap();
        assert!(!info.use_cgroup_kill);
    }

    #[test]
    fn kill_skips_current_pid_and_counts_others() {
        let dir = tempfile::tempdir().unwrap();
        let cgroup_path = dir.path().join("user.slice/imp-shell-1");
        fs::create_dir_all(&cgroup_path).unwrap();
        let current = std::process::id();
        // A live child of this test process: signal 0 succeeds against it.
        let child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .unwrap();
        fs::write(
            cgroup_path.join("cgroup.procs"),
            format!("{current}\n{}\n", child.id()),
        )
        .unwrap();

        let info = CgroupInfo {
            mount_dir: dir.path().to_string_lossy().to_string(),
            path: cgroup_path.to_string_lossy().to_string(),
            unified: true,
            use_cgroup_kill: true,
        };
        let mut logger = imp_log::JsonlLogger::to_stderr();
        let count = info.kill(0, &mut logger).unwrap();
        assert_eq!(count, 1);

        unsafe { libc::kill(child.id() as i32, libc::SIGKILL) };
    }

    #[test]
    fn kill_warns_on_individual_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cgroup_path = dir.path().join("user.slice/imp-shell-2");
        fs::create_dir_all(&cgroup_path).unwrap();
        let current = std::process::id();
        // A pid this far out shouldn't exist, so kill(pid, 0) fails and
        // gets logged.
        let bogus_pid = 2_000_000_000;
        fs::write(
            cgroup_path.join("cgroup.procs"),
            format!("{current}\n{bogus_pid}\n"),
        )
        .unwrap();

        let info = CgroupInfo {
            mount_dir: dir.path().to_string_lossy().to_string(),
            path: cgroup_path.to_string_lossy().to_string(),
            unified: true,
            use_cgroup_kill: true,
        };
        let mut logged = Vec::new();
        let mut logger = RecordingLogger(&mut logged);
        let result = info.kill(0, &mut logger);
        assert!(matches!(result, Err(CgroupError::Io(_))));
        assert!(logged.iter().any(|e| e.contains("cgroup.kill.failed")));
    }

    #[test]
    fn wait_for_empty_is_noop_when_kill_disabled() {
        let info = CgroupInfo {
            mount_dir: "/sys/fs/cgroup".to_string(),
            path: "/sys/fs/cgroup/does-not-exist".to_string(),
            unified: true,
            use_cgroup_kill: false,
        };
        let mut logger = imp_log::JsonlLogger::to_stderr();
        assert!(info.wait_for_empty(|| false, &mut logger).is_ok());
    }
}
