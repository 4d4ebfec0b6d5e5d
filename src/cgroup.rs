//! Cgroup tree management and process reaping.
//!
//! All container processes live in one subtree of the unified cgroup v2
//! hierarchy. The subtree is created empty at container creation and
//! drained completely on kill/delete, either through `cgroup.kill` or by
//! signalling every PID found in `cgroup.procs` across the subtree.

use crate::{
    context::Context,
    error::{Error, Result},
};
use anyhow::Context as AnyhowContext;
use nix::{
    errno::Errno,
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};
use std::{
    convert::TryFrom,
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Mount point of the unified cgroup v2 hierarchy.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Poll interval for drain loops.
pub const DRAIN_INTERVAL: Duration = Duration::from_millis(100);

/// Resolve the spec's `CgroupsPath` into a path relative to the cgroup root.
///
/// A systemd-encoded path (`slice:prefix:name`) is expanded into the
/// unified hierarchy, including the nesting encoded in dashed slice names
/// (`machine-lxc.slice` lives below `machine.slice`). An empty path
/// defaults to `lxcri/<id>`.
pub fn resolve(cgroups_path: Option<&Path>, systemd: bool, id: &str) -> Result<PathBuf> {
    let raw = match cgroups_path {
        Some(p) if !p.as_os_str().is_empty() => p.to_string_lossy().into_owned(),
        _ => return Ok(PathBuf::from("lxcri").join(id)),
    };

    if systemd && raw.contains(':') {
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() != 3 {
            return Err(Error::invalid_config(format!(
                "systemd cgroup path {:?} is not of the form slice:prefix:name",
                raw
            )));
        }
        let slice = if parts[0].is_empty() {
            "system.slice"
        } else {
            parts[0]
        };
        let scope = if parts[1].is_empty() {
            format!("{}.scope", parts[2])
        } else {
            format!("{}-{}.scope", parts[1], parts[2])
        };
        return Ok(expand_slice(slice)?.join(scope));
    }

    Ok(PathBuf::from(raw.trim_start_matches('/')))
}

/// Expand a dashed systemd slice name into its nested directories.
fn expand_slice(slice: &str) -> Result<PathBuf> {
    let name = slice.strip_suffix(".slice").ok_or_else(|| {
        Error::invalid_config(format!("cgroup parent {:?} is not a slice", slice))
    })?;
    if name.is_empty() || name.starts_with('-') || name.ends_with('-') {
        return Err(Error::invalid_config(format!(
            "invalid slice name {:?}",
            slice
        )));
    }

    let mut path = PathBuf::new();
    let parts: Vec<&str> = name.split('-').collect();
    for i in 0..parts.len() {
        path.push(format!("{}.slice", parts[..=i].join("-")));
    }
    Ok(path)
}

/// Create the container cgroup below the cgroup root and require it to be
/// empty of processes.
pub fn create(dir: &Path) -> Result<PathBuf> {
    create_in(Path::new(CGROUP_ROOT), dir)
}

fn create_in(root: &Path, dir: &Path) -> Result<PathBuf> {
    let abs = root.join(dir);
    fs::create_dir_all(&abs)
        .with_context(|| format!("create cgroup {}", abs.display()))?;
    if !read_pids(&abs)?.is_empty() {
        return Err(Error::engine(format!(
            "cgroup {} already contains processes",
            dir.display()
        )));
    }
    Ok(abs)
}

/// PIDs listed in this cgroup's own `cgroup.procs`.
fn read_pids(dir: &Path) -> Result<Vec<i32>> {
    let procs = dir.join("cgroup.procs");
    let content = match fs::read_to_string(&procs) {
        Ok(content) => content,
        // The cgroup vanished concurrently, or it is freshly created and
        // the file has not been read back yet.
        Err(e) if is_gone(&e) => return Ok(Vec::new()),
        Err(e) => {
            return Err(Error::System(
                anyhow::Error::new(e).context(format!("read {}", procs.display())),
            ))
        }
    };
    Ok(content
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect())
}

/// PIDs of the whole subtree, deepest cgroups first.
fn subtree_pids(dir: &Path) -> Result<Vec<i32>> {
    let mut pids = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if is_gone(&e) => return Ok(pids),
        Err(e) => {
            return Err(Error::System(
                anyhow::Error::new(e).context(format!("read cgroup dir {}", dir.display())),
            ))
        }
    };
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            pids.extend(subtree_pids(&entry.path())?);
        }
    }
    pids.extend(read_pids(dir)?);
    Ok(pids)
}

fn is_gone(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::NotFound || e.raw_os_error() == Some(libc::ENODEV)
}

/// Deliver `signal` once to every process currently in the subtree.
///
/// Processes spawned after the PID snapshot are not guaranteed to receive
/// the signal. Returns the number of processes signalled.
pub fn signal_all(dir: &Path, signal: Signal) -> Result<usize> {
    let mut delivered = 0;
    for pid in subtree_pids(dir)? {
        match kill(Pid::from_raw(pid), signal) {
            Ok(()) => delivered += 1,
            // The process exited between snapshot and delivery.
            Err(e) if e.as_errno() == Some(Errno::ESRCH) => {}
            Err(e) => {
                return Err(Error::System(
                    anyhow::Error::new(e).context(format!("signal pid {}", pid)),
                ))
            }
        }
    }
    Ok(delivered)
}

/// Drain the subtree: signal everything and wait until no process is left
/// or the context expires.
pub async fn drain(ctx: &Context, dir: &Path, signal: Signal) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    let kill_file = dir.join("cgroup.kill");
    if signal == Signal::SIGKILL && kill_file.exists() {
        match fs::write(&kill_file, "1") {
            Ok(()) => {}
            // The engine removed the cgroup concurrently.
            Err(e) if is_gone(&e) => return Ok(()),
            Err(e) => {
                return Err(Error::System(
                    anyhow::Error::new(e).context(format!("write {}", kill_file.display())),
                ))
            }
        }
        while !subtree_pids(dir)?.is_empty() {
            ctx.tick(DRAIN_INTERVAL, "draining cgroup").await?;
        }
        return Ok(());
    }

    loop {
        if subtree_pids(dir)?.is_empty() {
            return Ok(());
        }
        signal_all(dir, signal)?;
        ctx.tick(DRAIN_INTERVAL, "draining cgroup").await?;
    }
}

/// Remove the cgroup subtree, deepest directories first.
pub fn remove(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                remove(&entry.path())?;
            }
        }
    }
    match fs::remove_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if is_gone(&e) => Ok(()),
        Err(e) => Err(Error::System(
            anyhow::Error::new(e).context(format!("remove cgroup {}", dir.display())),
        )),
    }
}

/// Whether the monitor process is still alive.
///
/// `waitpid(WNOHANG)` answers for our own children; ECHILD means the
/// monitor was inherited from a previous runtime invocation and a plain
/// `kill(pid, 0)` probe decides.
pub fn monitor_alive(pid: i32) -> Result<bool> {
    match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => Ok(true),
        Ok(_) => Ok(false),
        Err(e) if e.as_errno() == Some(Errno::ECHILD) => match kill(Pid::from_raw(pid), None) {
            Ok(()) => Ok(true),
            Err(e) if e.as_errno() == Some(Errno::ESRCH) => Ok(false),
            Err(e) => Err(Error::System(
                anyhow::Error::new(e).context(format!("probe monitor pid {}", pid)),
            )),
        },
        Err(e) => Err(Error::System(
            anyhow::Error::new(e).context(format!("waitpid monitor {}", pid)),
        )),
    }
}

/// Parse a signal given by name (`TERM`, `SIGTERM`) or number (`15`).
pub fn parse_signal(value: &str) -> Result<Signal> {
    if let Ok(num) = i32::from_str(value) {
        return Signal::try_from(num)
            .map_err(|_| Error::invalid_config(format!("unknown signal number {}", num)));
    }

    let mut name = value.to_uppercase();
    if !name.starts_with("SIG") {
        name = format!("SIG{}", name);
    }
    let signal = match name.as_str() {
        "SIGHUP" => Signal::SIGHUP,
        "SIGINT" => Signal::SIGINT,
        "SIGQUIT" => Signal::SIGQUIT,
        "SIGILL" => Signal::SIGILL,
        "SIGTRAP" => Signal::SIGTRAP,
        "SIGABRT" => Signal::SIGABRT,
        "SIGBUS" => Signal::SIGBUS,
        "SIGFPE" => Signal::SIGFPE,
        "SIGKILL" => Signal::SIGKILL,
        "SIGUSR1" => Signal::SIGUSR1,
        "SIGSEGV" => Signal::SIGSEGV,
        "SIGUSR2" => Signal::SIGUSR2,
        "SIGPIPE" => Signal::SIGPIPE,
        "SIGALRM" => Signal::SIGALRM,
        "SIGTERM" => Signal::SIGTERM,
        "SIGCHLD" => Signal::SIGCHLD,
        "SIGCONT" => Signal::SIGCONT,
        "SIGSTOP" => Signal::SIGSTOP,
        "SIGTSTP" => Signal::SIGTSTP,
        "SIGTTIN" => Signal::SIGTTIN,
        "SIGTTOU" => Signal::SIGTTOU,
        "SIGURG" => Signal::SIGURG,
        "SIGXCPU" => Signal::SIGXCPU,
        "SIGXFSZ" => Signal::SIGXFSZ,
        "SIGVTALRM" => Signal::SIGVTALRM,
        "SIGPROF" => Signal::SIGPROF,
        "SIGWINCH" => Signal::SIGWINCH,
        "SIGIO" => Signal::SIGIO,
        "SIGPWR" => Signal::SIGPWR,
        "SIGSYS" => Signal::SIGSYS,
        _ => {
            return Err(Error::invalid_config(format!(
                "unknown signal name {:?}",
                value
            )))
        }
    };
    Ok(signal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::process::Command;

    #[test]
    fn resolve_default_path() -> Result<()> {
        assert_eq!(resolve(None, false, "c1")?, PathBuf::from("lxcri/c1"));
        assert_eq!(
            resolve(Some(Path::new("")), true, "c1")?,
            PathBuf::from("lxcri/c1")
        );
        Ok(())
    }

    #[test]
    fn resolve_raw_path() -> Result<()> {
        assert_eq!(
            resolve(Some(Path::new("/foo/bar")), false, "c1")?,
            PathBuf::from("foo/bar")
        );
        // Without the systemd flag the encoded form is taken verbatim.
        assert_eq!(
            resolve(Some(Path::new("c1.slice")), false, "c1")?,
            PathBuf::from("c1.slice")
        );
        Ok(())
    }

    #[test]
    fn resolve_systemd_path() -> Result<()> {
        assert_eq!(
            resolve(Some(Path::new("c1.slice:lxcri:foo")), true, "foo")?,
            PathBuf::from("c1.slice/lxcri-foo.scope")
        );
        assert_eq!(
            resolve(Some(Path::new("machine-lxc.slice:lxcri:c2")), true, "c2")?,
            PathBuf::from("machine.slice/machine-lxc.slice/lxcri-c2.scope")
        );
        assert_eq!(
            resolve(Some(Path::new(":lxcri:c3")), true, "c3")?,
            PathBuf::from("system.slice/lxcri-c3.scope")
        );
        assert!(resolve(Some(Path::new("a:b")), true, "c4").is_err());
        Ok(())
    }

    #[test]
    fn create_rejects_populated_cgroup() -> Result<()> {
        let root = tempfile::tempdir()?;

        let abs = create_in(root.path(), Path::new("lxcri/c1"))?;
        assert!(abs.is_dir());

        fs::write(abs.join("cgroup.procs"), "1234\n")?;
        let err = create_in(root.path(), Path::new("lxcri/c1")).unwrap_err();
        assert!(matches!(err, Error::Engine(_)));
        Ok(())
    }

    #[test]
    fn subtree_pids_deepest_first() -> Result<()> {
        let root = tempfile::tempdir()?;
        let dir = root.path().join("c1");
        fs::create_dir_all(dir.join("nested"))?;
        fs::write(dir.join("cgroup.procs"), "100\n")?;
        fs::write(dir.join("nested/cgroup.procs"), "200\n201\n")?;

        assert_eq!(subtree_pids(&dir)?, vec![200, 201, 100]);
        Ok(())
    }

    #[tokio::test]
    async fn drain_missing_cgroup_succeeds() -> Result<()> {
        let ctx = Context::new();
        drain(&ctx, Path::new("/nonexistent/cgroup/dir"), Signal::SIGKILL).await?;
        Ok(())
    }

    #[tokio::test]
    async fn drain_empty_tree_succeeds() -> Result<()> {
        let root = tempfile::tempdir()?;
        let dir = root.path().join("c1");
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("cgroup.procs"), "")?;

        let ctx = Context::with_timeout(Duration::from_secs(1));
        drain(&ctx, &dir, Signal::SIGTERM).await?;
        Ok(())
    }

    #[tokio::test]
    async fn drain_prefers_kill_file() -> Result<()> {
        let root = tempfile::tempdir()?;
        let dir = root.path().join("c1");
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("cgroup.kill"), "")?;
        fs::write(dir.join("cgroup.procs"), "")?;

        let ctx = Context::with_timeout(Duration::from_secs(1));
        drain(&ctx, &dir, Signal::SIGKILL).await?;
        assert_eq!(fs::read_to_string(dir.join("cgroup.kill"))?, "1");
        Ok(())
    }

    #[test]
    fn remove_subtree() -> Result<()> {
        let root = tempfile::tempdir()?;
        let dir = root.path().join("c1");
        fs::create_dir_all(dir.join("nested"))?;

        remove(&dir)?;
        assert!(!dir.exists());
        remove(&dir)?;
        Ok(())
    }

    #[test]
    fn monitor_alive_for_child_and_non_child() -> Result<()> {
        // A sleeping child is alive via waitpid.
        let mut child = Command::new("sleep").arg("10").spawn()?;
        assert!(monitor_alive(child.id() as i32)?);
        child.kill()?;
        child.wait()?;

        // Our own PID is not our child: ECHILD path, kill(0) says alive.
        assert!(monitor_alive(std::process::id() as i32)?);
        Ok(())
    }

    #[test]
    fn monitor_dead_after_reaping() -> Result<()> {
        let mut child = Command::new("true").spawn()?;
        let pid = child.id() as i32;
        child.wait()?;
        assert!(!monitor_alive(pid)?);
        Ok(())
    }

    #[test]
    fn parse_signal_forms() -> Result<()> {
        assert_eq!(parse_signal("SIGTERM")?, Signal::SIGTERM);
        assert_eq!(parse_signal("term")?, Signal::SIGTERM);
        assert_eq!(parse_signal("9")?, Signal::SIGKILL);
        assert_eq!(parse_signal("USR1")?, Signal::SIGUSR1);
        assert!(matches!(
            parse_signal("NOSUCHSIG"),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(parse_signal("4242"), Err(Error::InvalidConfig(_))));
        Ok(())
    }
}
