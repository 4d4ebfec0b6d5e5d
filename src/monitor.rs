//! Monitor launcher
//!
//! The monitor is a long-lived external process that supervises the
//! container init for its whole lifetime. It is started with exactly three
//! positional arguments (container id, runtime root, engine config path),
//! its working directory is the container runtime directory and its
//! environment is the curated subset captured at `Runtime::init`. Launch
//! blocks until the engine reports the init process parked on the sync
//! FIFO, or until the monitor dies.

use crate::{
    cgroup,
    container::ContainerConfig,
    context::Context,
    engine::{EngineContainer, EngineState},
    error::{Error, Result},
    runtime::Runtime,
    state::{probe_init, InitProbe},
};
use anyhow::Context as AnyhowContext;
use log::{debug, warn};
use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag},
    pty::openpty,
    sys::{
        socket::{sendmsg, ControlMessage, MsgFlags},
        uio::IoVec,
    },
    unistd::{close, dup},
};
use std::{
    fs,
    os::unix::{
        io::{AsRawFd, FromRawFd, RawFd},
        net::UnixStream,
        process::CommandExt,
    },
    path::Path,
    process::Stdio,
    time::Duration,
};
use tokio::process::{Child, Command};

/// Poll interval of the create rendezvous.
pub const RENDEZVOUS_INTERVAL: Duration = Duration::from_millis(100);

/// Message body accompanying the PTY file descriptor on the console socket.
pub const CONSOLE_MESSAGE: &[u8] = b"terminal";

/// Spawn the monitor and wait for the created rendezvous. Returns the
/// monitor PID.
pub(crate) async fn launch(
    ctx: &Context,
    rt: &Runtime,
    config: &ContainerConfig,
    rundir: &Path,
    engine: &dyn EngineContainer,
) -> Result<i32> {
    let mut cmd = Command::new(rt.monitor_bin());
    cmd.arg(config.id())
        .arg(rt.root())
        .arg(engine.config_file())
        .current_dir(rundir)
        .env_clear()
        .envs(rt.env().iter().map(|(k, v)| (k.as_str(), v.as_str())));
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let terminal = config
        .spec()
        .process()
        .as_ref()
        .and_then(|p| *p.terminal())
        .unwrap_or(false);

    // Terminal handling: a console socket receives the PTY master, a bare
    // terminal leaves the master with the monitor, otherwise the monitor
    // inherits our stdio and the engine's console replacement is off.
    let mut console_master: Option<RawFd> = None;
    if config.console_socket().is_some() || terminal {
        let pty = openpty(None, None).context("openpty")?;
        if config.console_socket().is_some() {
            // The master travels over the socket, it must not leak into
            // the monitor.
            set_cloexec(pty.master)?;
        }
        set_child_stdio(&mut cmd, pty.slave)?;
        console_master = Some(pty.master);
    } else {
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
    }

    let mut child = cmd.spawn().context("spawn monitor")?;
    let pid = match child.id() {
        Some(pid) => pid as i32,
        None => return Err(Error::engine("monitor exited before its pid was read")),
    };
    debug!("monitor for container {} has pid {}", config.id(), pid);

    if let Err(e) = rendezvous(ctx, rt, config, engine, &mut child, pid, console_master).await {
        // Never leave an orphaned monitor behind on a failed create; a
        // dropped child keeps running.
        match child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                if let Err(kill_err) = child.kill().await {
                    warn!(
                        "failed to kill monitor {} after create failure: {}",
                        pid, kill_err
                    );
                }
            }
        }
        return Err(e);
    }
    Ok(pid)
}

/// Pass the console fd, enroll the monitor and poll until the engine
/// reports the init process parked on the sync FIFO.
async fn rendezvous(
    ctx: &Context,
    rt: &Runtime,
    config: &ContainerConfig,
    engine: &dyn EngineContainer,
    child: &mut Child,
    pid: i32,
    console_master: Option<RawFd>,
) -> Result<()> {
    if let Some(master) = console_master {
        if let Some(socket) = config.console_socket() {
            let sent = send_console_fd(ctx, socket, master);
            let _ = close(master);
            sent?;
        } else {
            // The monitor inherited its own copy of the master across exec.
            let _ = close(master);
        }
    }

    enroll_monitor_cgroup(rt, pid);

    loop {
        if let Some(status) = child.try_wait().context("wait for monitor")? {
            return Err(Error::engine(format!(
                "monitor exited with {} before the container was created",
                status
            )));
        }
        if engine.state().await? == EngineState::Running {
            if let Some(init_pid) = engine.init_pid().await? {
                if probe_init(init_pid) == InitProbe::Sentinel {
                    debug!(
                        "container {} init {} is parked on the sync fifo",
                        config.id(),
                        init_pid
                    );
                    return Ok(());
                }
            }
        }
        ctx.tick(RENDEZVOUS_INTERVAL, "waiting for container creation")
            .await?;
    }
}

/// Wire the PTY slave up as the monitor's stdio.
fn set_child_stdio(cmd: &mut Command, slave: RawFd) -> Result<()> {
    let stdin = dup(slave).context("dup pty slave for stdin")?;
    let stdout = dup(slave).context("dup pty slave for stdout")?;
    let stderr = dup(slave).context("dup pty slave for stderr")?;
    unsafe {
        cmd.stdin(Stdio::from_raw_fd(stdin))
            .stdout(Stdio::from_raw_fd(stdout))
            .stderr(Stdio::from_raw_fd(stderr));
    }
    let _ = close(slave);
    Ok(())
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).context("set FD_CLOEXEC")?;
    Ok(())
}

/// Dial the console socket and pass the PTY master, honoring the context
/// deadline as the socket timeout.
fn send_console_fd(ctx: &Context, socket: &Path, master: RawFd) -> Result<()> {
    let stream = UnixStream::connect(socket)
        .with_context(|| format!("connect console socket {}", socket.display()))?;
    if let Some(remaining) = ctx.remaining() {
        if remaining.as_millis() == 0 {
            return Err(Error::Timeout("sending console fd"));
        }
        stream
            .set_write_timeout(Some(remaining))
            .context("set console socket timeout")?;
    }
    send_terminal_fd(&stream, master)
}

/// A single message with the body `"terminal"` and the file descriptor as
/// `SCM_RIGHTS` ancillary data.
pub(crate) fn send_terminal_fd(stream: &UnixStream, fd: RawFd) -> Result<()> {
    let iov = [IoVec::from_slice(CONSOLE_MESSAGE)];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg(
        stream.as_raw_fd(),
        &iov,
        &cmsg,
        MsgFlags::empty(),
        None,
    )
    .context("send console fd")?;
    Ok(())
}

/// Move the monitor into the runtime's monitor cgroup. Best effort.
fn enroll_monitor_cgroup(rt: &Runtime, pid: i32) {
    let dir = Path::new(cgroup::CGROUP_ROOT).join(rt.monitor_cgroup());
    let enrolled = fs::create_dir_all(&dir)
        .and_then(|_| fs::write(dir.join("cgroup.procs"), pid.to_string()));
    if let Err(e) = enrolled {
        warn!(
            "failed to move monitor {} into cgroup {}: {}",
            pid,
            dir.display(),
            e
        );
    }
}
