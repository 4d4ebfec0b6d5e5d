//! Per-container state and lifecycle internals.
//!
//! A `Container` owns its runtime directory, the engine handle, the
//! monitor PID and the creation timestamp. Everything needed to pick the
//! container back up in a later invocation is persisted as the runtime
//! snapshot `lxcri.json`; the OCI status itself is never stored but always
//! derived (see `state`).

use crate::{
    cgroup,
    context::Context,
    engine::EngineContainer,
    error::{Error, Result},
    oci_spec::Spec,
    state::{derive_status, probe_init, ContainerStatus, InitProbe, State, StateBuilder},
};
use anyhow::Context as AnyhowContext;
use chrono::{DateTime, Utc};
use derive_builder::Builder;
use getset::{CopyGetters, Getters, MutGetters};
use log::debug;
use nix::sys::{signal::Signal, stat::Mode};
use serde::{Deserialize, Serialize};
use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
    time::Duration,
};

/// Engine-native configuration, opaque outside the engine seam.
pub const ENGINE_CONFIG_FILE: &str = "config";
/// Snapshot of the (possibly adjusted) OCI spec.
pub const SPEC_FILE: &str = "config.json";
/// Extracted OCI hooks block, consumed by the hook binary.
pub const HOOKS_FILE: &str = "hooks.json";
/// Initial OCI state document written at create.
pub const INITIAL_STATE_FILE: &str = "state.json";
/// Runtime snapshot with monitor PID and creation time.
pub const RUNTIME_STATE_FILE: &str = "lxcri.json";
/// Named FIFO implementing the create/start barrier.
pub const SYNC_FIFO: &str = "syncfifo";
pub const SECCOMP_FILE: &str = "seccomp.conf";
pub const DEVICES_FILE: &str = "devices.txt";
pub const MASKED_FILE: &str = "masked.txt";

/// Poll interval while waiting for the init to leave the sentinel.
const START_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Builder, Debug, Deserialize, Serialize, CopyGetters, Getters, MutGetters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// Per-container creation request.
pub struct ContainerConfig {
    #[getset(get = "pub")]
    /// Unique container identifier.
    id: String,

    #[getset(get = "pub")]
    /// Path to the OCI bundle directory.
    bundle: PathBuf,

    #[getset(get = "pub", get_mut = "pub")]
    /// The fully decoded OCI spec.
    spec: Spec,

    #[getset(get_copy = "pub")]
    #[builder(default)]
    #[serde(default)]
    /// Whether `CgroupsPath` is systemd-encoded (`slice:prefix:name`).
    systemd_cgroup: bool,

    #[getset(get = "pub")]
    #[builder(default)]
    #[serde(default)]
    /// Engine log destination, defaults to `engine.log` in the runtime dir.
    log_file: Option<PathBuf>,

    #[getset(get_copy = "pub")]
    #[builder(default = "log::LevelFilter::Warn")]
    #[serde(default = "default_log_level")]
    /// Engine log level.
    log_level: log::LevelFilter,

    #[getset(get = "pub")]
    #[builder(default)]
    #[serde(default)]
    /// Unix socket receiving the PTY master of the container console.
    console_socket: Option<PathBuf>,
}

fn default_log_level() -> log::LevelFilter {
    log::LevelFilter::Warn
}

#[derive(Debug, Deserialize, Serialize, CopyGetters, Getters)]
/// Authoritative per-instance state after create.
pub struct Container {
    #[getset(get = "pub")]
    config: ContainerConfig,

    #[getset(get = "pub")]
    /// The container runtime directory below the runtime root.
    rundir: PathBuf,

    #[getset(get = "pub")]
    /// Container cgroup, relative to the cgroup root.
    cgroup_dir: PathBuf,

    #[getset(get_copy = "pub")]
    #[serde(default)]
    /// PID of the monitor process, strictly greater than 1 while the
    /// container is created, running or stopping.
    monitor_pid: Option<i32>,

    #[getset(get = "pub")]
    created_at: DateTime<Utc>,

    #[serde(skip)]
    engine: Option<Box<dyn EngineContainer>>,
}

impl Container {
    pub(crate) fn new(
        config: ContainerConfig,
        rundir: PathBuf,
        cgroup_dir: PathBuf,
        engine: Box<dyn EngineContainer>,
    ) -> Self {
        Self {
            config,
            rundir,
            cgroup_dir,
            monitor_pid: None,
            created_at: Utc::now(),
            engine: Some(engine),
        }
    }

    pub fn id(&self) -> &str {
        self.config.id()
    }

    /// Path of the sync FIFO used by the create/start handshake.
    pub fn sync_fifo(&self) -> PathBuf {
        self.rundir.join(SYNC_FIFO)
    }

    /// Absolute path of the container cgroup.
    pub fn cgroup_abs(&self) -> PathBuf {
        Path::new(cgroup::CGROUP_ROOT).join(&self.cgroup_dir)
    }

    fn engine(&self) -> Result<&dyn EngineContainer> {
        self.engine
            .as_deref()
            .ok_or_else(|| Error::engine("engine handle has been released"))
    }

    pub(crate) fn attach_engine(&mut self, engine: Box<dyn EngineContainer>) {
        self.engine = Some(engine);
    }

    pub(crate) fn set_monitor_pid(&mut self, pid: i32) {
        self.monitor_pid = Some(pid);
    }

    /// Release the engine handle. Must be called on delete; dropping the
    /// container without releasing leaks engine resources.
    pub(crate) fn release_engine(&mut self) -> Result<()> {
        if let Some(mut engine) = self.engine.take() {
            engine.release()?;
        }
        Ok(())
    }

    /// The current OCI status, derived from the engine state and the init
    /// process probe.
    pub async fn status(&self) -> Result<ContainerStatus> {
        let engine = self.engine()?;
        let engine_state = engine.state().await?;
        let init_pid = engine.init_pid().await?;
        Ok(derive_status(&engine_state, || match init_pid {
            Some(pid) => probe_init(pid),
            None => InitProbe::Gone,
        }))
    }

    /// The OCI state document.
    pub async fn state(&self) -> Result<State> {
        let status = self.status().await?;
        let pid = match status {
            ContainerStatus::Created | ContainerStatus::Running => {
                self.engine()?.init_pid().await?
            }
            _ => None,
        };
        let mut builder = StateBuilder::default()
            .id(self.config.id().clone())
            .status(status)
            .bundle(self.config.bundle().clone());
        if let Some(pid) = pid {
            builder = builder.pid(pid);
        }
        if let Some(annotations) = self.config.spec().annotations() {
            builder = builder.annotations(annotations.clone());
        }
        Ok(builder.build().context("build state document")?)
    }

    /// PID of the init process as reported by the engine.
    pub async fn init_pid(&self) -> Result<Option<i32>> {
        self.engine()?.init_pid().await
    }

    /// Unblock the init process through the sync FIFO and wait until the
    /// container left the `created` status.
    pub(crate) async fn start(&mut self, ctx: &Context) -> Result<()> {
        let status = self.status().await?;
        if status != ContainerStatus::Created {
            return Err(Error::IllegalState {
                operation: "start",
                status,
            });
        }

        open_sync_fifo(ctx, self.sync_fifo()).await?;

        loop {
            let status = self.status().await?;
            if status != ContainerStatus::Created {
                debug!("container {} started, status {}", self.id(), status);
                return Ok(());
            }
            if let Some(pid) = self.monitor_pid {
                if !cgroup::monitor_alive(pid)? {
                    return Err(Error::engine(format!(
                        "monitor {} died before the container started",
                        pid
                    )));
                }
            }
            ctx.tick(START_INTERVAL, "waiting for container start").await?;
        }
    }

    /// Deliver `signal` to every process in the container cgroup.
    pub(crate) async fn kill(&mut self, ctx: &Context, signal: Signal) -> Result<()> {
        ctx.ensure_active("killing container")?;
        let status = self.status().await?;
        if status == ContainerStatus::Stopped {
            return Err(Error::IllegalState {
                operation: "kill",
                status,
            });
        }
        let delivered = cgroup::signal_all(&self.cgroup_abs(), signal)?;
        debug!(
            "delivered {:?} to {} processes of container {}",
            signal,
            delivered,
            self.id()
        );
        Ok(())
    }

    /// Persist the runtime snapshot `lxcri.json` with exclusive-create
    /// semantics.
    pub(crate) fn persist(&self) -> Result<()> {
        write_json_exclusive(&self.rundir.join(RUNTIME_STATE_FILE), self)
    }
}

/// Create the sync FIFO, world accessible so an id-mapped init can open it.
pub(crate) fn create_sync_fifo(rundir: &Path) -> Result<()> {
    let path = rundir.join(SYNC_FIFO);
    nix::unistd::mkfifo(&path, Mode::from_bits_truncate(0o666))
        .with_context(|| format!("mkfifo {}", path.display()))?;
    Ok(())
}

/// Open the FIFO write-only and close it again. The open succeeds only
/// once the init holds the read side; the close delivers the EOF that
/// releases it. Opened non-blocking (ENXIO while no reader exists) so the
/// wait stays cancellable.
pub(crate) async fn open_sync_fifo(ctx: &Context, path: PathBuf) -> Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    loop {
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
        {
            // Dropping the file closes the write side and signals EOF.
            Ok(_file) => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                ctx.tick(START_INTERVAL, "opening sync fifo").await?;
            }
            Err(e) => {
                return Err(Error::System(anyhow::Error::new(e).context(format!(
                    "open sync fifo {}",
                    path.display()
                ))))
            }
        }
    }
}

/// Serialize `value` to `path`, failing if the file already exists.
pub(crate) fn write_json_exclusive<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("exclusively create {}", path.display()))?;
    serde_json::to_writer_pretty(file, value)
        .with_context(|| format!("serialize {}", path.display()))?;
    Ok(())
}
