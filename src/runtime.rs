//! Runtime manager
//!
//! Top level factory holding the process wide configuration. `init`
//! verifies the host preconditions exactly once; afterwards the runtime is
//! immutable and routes the OCI lifecycle verbs to per-container state.

use crate::{
    cgroup,
    container::{
        create_sync_fifo, write_json_exclusive, Container, ContainerConfig, ENGINE_CONFIG_FILE,
        HOOKS_FILE, INITIAL_STATE_FILE, RUNTIME_STATE_FILE, SPEC_FILE,
    },
    context::Context,
    devices,
    engine::{CommandEngine, Engine, MIN_ENGINE_VERSION},
    error::{Error, Precondition, Result},
    monitor,
    oci_spec::{LinuxNamespaceType, Spec},
    state::{ContainerStatus, State, StateBuilder},
    translator,
};
use anyhow::Context as AnyhowContext;
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use lazy_static::lazy_static;
use log::{info, warn};
use nix::sys::{
    signal::Signal,
    statfs::{statfs, CGROUP2_SUPER_MAGIC, PROC_SUPER_MAGIC},
};
use regex::Regex;
use std::{
    collections::HashMap,
    env,
    fs::{self, File, OpenOptions, Permissions},
    os::unix::fs::{MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
};

/// Monitor binary, supervises the container init for its lifetime.
pub const MONITOR_BIN: &str = "lxcri-start";
/// Init binary, exec'd inside the container; parks on the sync FIFO.
pub const INIT_BIN: &str = "lxcri-init";
/// Hook binary, runs the OCI hooks from the engine hook points.
pub const HOOK_BIN: &str = "lxcri-hook";

/// Shared rootfs pivot directory below the runtime root. The dot prefix
/// keeps it out of the container id namespace.
pub const ROOTFS_MOUNT_DIR: &str = ".rootfs";

/// Annotation recording the engine config path for out-of-process hooks.
pub const ENGINE_CONFIG_ANNOTATION: &str = "org.lxcri.engine.config";

/// Host environment retained for the monitor; nothing else leaks in.
const RETAINED_ENV: [&str; 3] = ["HOME", "XDG_RUNTIME_DIR", "PATH"];

lazy_static! {
    static ref CONTAINER_ID: Regex = Regex::new("^[a-z][a-z0-9_-]+$").expect("valid id regex");
}

#[derive(Builder, Clone, Copy, CopyGetters, Debug)]
#[builder(default, pattern = "owned", setter(into))]
/// Optional engine features toggled at runtime construction.
pub struct Features {
    #[getset(get_copy = "pub")]
    seccomp: bool,

    #[getset(get_copy = "pub")]
    capabilities: bool,

    #[getset(get_copy = "pub")]
    apparmor: bool,

    #[getset(get_copy = "pub")]
    cgroup_devices: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            seccomp: true,
            capabilities: true,
            apparmor: true,
            cgroup_devices: true,
        }
    }
}

#[derive(Builder, CopyGetters, Debug, Getters)]
#[builder(pattern = "owned", setter(into))]
/// Process wide runtime configuration. Initialized once via `init`, then
/// immutable for the caller's session.
pub struct Runtime {
    #[getset(get = "pub")]
    #[builder(default = "PathBuf::from(\"/run/lxcri\")")]
    /// Root directory for all container state.
    root: PathBuf,

    #[getset(get = "pub")]
    #[builder(default = "PathBuf::from(\"/usr/libexec/lxcri\")")]
    /// Directory holding the monitor, init and hook programs.
    libexec: PathBuf,

    #[getset(get = "pub")]
    #[builder(default)]
    features: Features,

    #[getset(get = "pub")]
    #[builder(default = "String::from(\"lxcri-monitor\")")]
    /// Cgroup (relative to the cgroup root) collecting monitor processes.
    monitor_cgroup: String,

    #[getset(get_copy = "pub")]
    #[builder(default)]
    /// Whether the effective UID at init was 0.
    privileged: bool,

    #[getset(get_copy = "pub")]
    #[builder(default)]
    /// Whether the caller holds CAP_MKNOD.
    can_mknod: bool,

    #[getset(get = "pub")]
    #[builder(default)]
    /// Environment subset propagated to the monitor.
    env: Vec<(String, String)>,

    #[builder(default = "Box::new(CommandEngine::default())")]
    engine: Box<dyn Engine>,
}

impl Runtime {
    /// Shared rootfs pivot directory.
    pub fn rootfs_mount(&self) -> PathBuf {
        self.root.join(ROOTFS_MOUNT_DIR)
    }

    pub fn monitor_bin(&self) -> PathBuf {
        self.libexec.join(MONITOR_BIN)
    }

    pub fn init_bin(&self) -> PathBuf {
        self.libexec.join(INIT_BIN)
    }

    pub fn hook_bin(&self) -> PathBuf {
        self.libexec.join(HOOK_BIN)
    }

    /// One-shot preflight. Verifies `/proc`, the cgroup2 root, the libexec
    /// programs and the engine version floor, then captures the privilege
    /// state and environment subset. Nothing is mutated when a check fails.
    pub async fn init(&mut self) -> Result<()> {
        check_proc()?;
        check_cgroup_root()?;
        self.check_libexec()?;

        let version = self.engine.version().await?;
        if version < MIN_ENGINE_VERSION {
            return Err(Error::precondition(
                Precondition::EngineVersion,
                format!(
                    "engine version {} is below the supported {}",
                    version, MIN_ENGINE_VERSION
                ),
            ));
        }

        fs::create_dir_all(&self.root)
            .with_context(|| format!("create runtime root {}", self.root.display()))?;
        let pivot = self.rootfs_mount();
        fs::create_dir_all(&pivot)
            .with_context(|| format!("create rootfs pivot {}", pivot.display()))?;
        fs::set_permissions(&pivot, Permissions::from_mode(0o777))
            .with_context(|| format!("chmod rootfs pivot {}", pivot.display()))?;

        self.privileged = nix::unistd::Uid::effective().is_root();
        self.can_mknod = devices::can_mknod();
        self.env = RETAINED_ENV
            .iter()
            .filter_map(|key| env::var(key).ok().map(|value| (key.to_string(), value)))
            .collect();

        info!(
            "runtime initialized: root {}, engine {}, privileged {}",
            self.root.display(),
            version,
            self.privileged
        );
        Ok(())
    }

    fn check_libexec(&self) -> Result<()> {
        for bin in [self.monitor_bin(), self.init_bin(), self.hook_bin()].iter() {
            let meta = fs::metadata(bin).map_err(|e| {
                Error::precondition(
                    Precondition::LibexecProgram,
                    format!("{}: {}", bin.display(), e),
                )
            })?;
            if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
                return Err(Error::precondition(
                    Precondition::LibexecProgram,
                    format!("{} is not an executable file", bin.display()),
                ));
            }
        }
        Ok(())
    }

    /// Create a container from `config` and wait for the created
    /// rendezvous. Partial progress on failure is cleaned up with
    /// `delete(id, force=true)`.
    pub async fn create(&self, ctx: &Context, mut config: ContainerConfig) -> Result<Container> {
        ctx.ensure_active("creating container")?;
        self.validate(&mut config)?;

        // Materialize the runtime directory.
        let rundir = self.root.join(config.id());
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create runtime root {}", self.root.display()))?;
        fs::create_dir(&rundir).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                Error::invalid_config(format!("container {} already exists", config.id()))
            } else {
                Error::System(
                    anyhow::Error::new(e)
                        .context(format!("create runtime dir {}", rundir.display())),
                )
            }
        })?;
        // 0777 so unprivileged id mappings can traverse the directory.
        fs::set_permissions(&rundir, Permissions::from_mode(0o777))
            .with_context(|| format!("chmod runtime dir {}", rundir.display()))?;
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(rundir.join(ENGINE_CONFIG_FILE))
            .with_context(|| format!("create engine config in {}", rundir.display()))?;
        create_sync_fifo(&rundir)?;

        let mut engine_container = self.engine.container(config.id(), &self.root, &rundir)?;

        // Record the engine config location for out-of-process hooks.
        config
            .spec_mut()
            .annotations_mut()
            .get_or_insert_with(HashMap::new)
            .insert(
                ENGINE_CONFIG_ANNOTATION.to_string(),
                engine_container.config_file().display().to_string(),
            );

        let translation = translator::translate(self, &mut config, &rundir)?;
        cgroup::create(&translation.cgroup_dir)?;
        engine_container.apply(&translation.items)?;
        engine_container.save()?;

        // Persist the bundle artifacts with exclusive-create semantics.
        write_json_exclusive(&rundir.join(SPEC_FILE), config.spec())?;
        write_json_exclusive(&rundir.join(HOOKS_FILE), config.spec().hooks())?;
        let initial = StateBuilder::default()
            .id(config.id().clone())
            .status(ContainerStatus::Creating)
            .bundle(config.bundle().clone())
            .build()
            .context("build initial state")?;
        write_json_exclusive(&rundir.join(INITIAL_STATE_FILE), &initial)?;

        let monitor_pid =
            monitor::launch(ctx, self, &config, &rundir, engine_container.as_ref()).await?;

        let mut container = Container::new(config, rundir, translation.cgroup_dir, engine_container);
        container.set_monitor_pid(monitor_pid);
        container.persist()?;
        info!("created container {}", container.id());
        Ok(container)
    }

    /// Release the init process of a created container.
    pub async fn start(&self, ctx: &Context, container: &mut Container) -> Result<()> {
        container.start(ctx).await?;
        info!("started container {}", container.id());
        Ok(())
    }

    /// Signal every process in the container's cgroup.
    pub async fn kill(
        &self,
        ctx: &Context,
        container: &mut Container,
        signal: Signal,
    ) -> Result<()> {
        container.kill(ctx, signal).await
    }

    /// Remove the container. Unknown ids are absorbed (any orphaned
    /// runtime directory is cleaned up); a non-stopped container requires
    /// `force`, in which case the cgroup is SIGKILLed and drained.
    pub async fn delete(&self, ctx: &Context, id: &str, force: bool) -> Result<()> {
        let mut container = match self.load(id) {
            Ok(container) => container,
            Err(Error::NotExist(_)) => {
                let rundir = self.root.join(id);
                if rundir.exists() {
                    // A failed create may have left a populated cgroup
                    // behind, entirely outside the runtime directory.
                    self.reap_orphan_cgroup(ctx, id, &rundir).await;
                    fs::remove_dir_all(&rundir).with_context(|| {
                        format!("remove orphaned runtime dir {}", rundir.display())
                    })?;
                    info!("removed orphaned runtime dir of container {}", id);
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let status = match container.status().await {
            Ok(status) => status,
            Err(e) => {
                warn!("cannot determine status of container {}: {}", id, e);
                ContainerStatus::Stopped
            }
        };
        if status != ContainerStatus::Stopped {
            if !force {
                return Err(Error::IllegalState {
                    operation: "delete",
                    status,
                });
            }
            if let Err(e) = cgroup::drain(ctx, &container.cgroup_abs(), Signal::SIGKILL).await {
                warn!("draining cgroup of container {} failed: {}", id, e);
            }
        }
        if let Err(e) = cgroup::remove(&container.cgroup_abs()) {
            warn!("removing cgroup of container {} failed: {}", id, e);
        }
        if let Err(e) = container.release_engine() {
            warn!("releasing engine handle of container {} failed: {}", id, e);
        }
        match fs::remove_dir_all(container.rundir()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::System(anyhow::Error::new(e).context(format!(
                    "remove runtime dir {}",
                    container.rundir().display()
                ))))
            }
        }
        info!("deleted container {}", id);
        Ok(())
    }

    /// Drain and remove the cgroup of a container whose create failed
    /// before the runtime snapshot was persisted. The cgroup path is
    /// recomputed from the spec snapshot written during create; errors are
    /// logged so the cleanup stays idempotent.
    async fn reap_orphan_cgroup(&self, ctx: &Context, id: &str, rundir: &Path) {
        let spec_file = rundir.join(SPEC_FILE);
        if !spec_file.is_file() {
            return;
        }
        let spec = match Spec::load(&spec_file) {
            Ok(spec) => spec,
            Err(e) => {
                warn!("cannot reload spec of orphaned container {}: {:#}", id, e);
                return;
            }
        };
        let cgroups_path = spec
            .linux()
            .as_ref()
            .and_then(|l| l.cgroups_path().as_ref())
            .map(PathBuf::as_path);
        // A systemd-encoded path always carries its slice:prefix:name colons.
        let systemd = cgroups_path
            .map(|p| p.to_string_lossy().contains(':'))
            .unwrap_or(false);
        let dir = match cgroup::resolve(cgroups_path, systemd, id) {
            Ok(dir) => Path::new(cgroup::CGROUP_ROOT).join(dir),
            Err(e) => {
                warn!("cannot resolve cgroup of orphaned container {}: {}", id, e);
                return;
            }
        };
        if let Err(e) = cgroup::drain(ctx, &dir, Signal::SIGKILL).await {
            warn!("draining cgroup of orphaned container {} failed: {}", id, e);
        }
        if let Err(e) = cgroup::remove(&dir) {
            warn!("removing cgroup of orphaned container {} failed: {}", id, e);
        }
    }

    /// Reconstruct a container from its persisted runtime snapshot.
    pub fn load(&self, id: &str) -> Result<Container> {
        let rundir = self.root.join(id);
        let snapshot = rundir.join(RUNTIME_STATE_FILE);
        if !snapshot.is_file() {
            return Err(Error::NotExist(id.to_string()));
        }
        let file = File::open(&snapshot)
            .with_context(|| format!("open runtime snapshot {}", snapshot.display()))?;
        let mut container: Container = serde_json::from_reader(file)
            .with_context(|| format!("deserialize runtime snapshot {}", snapshot.display()))?;
        container.attach_engine(self.engine.container(id, &self.root, &rundir)?);
        Ok(container)
    }

    /// The OCI state document of the container `id`.
    pub async fn state(&self, id: &str) -> Result<State> {
        self.load(id)?.state().await
    }

    /// IDs of all containers below the runtime root.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::System(anyhow::Error::new(e).context(format!(
                    "read runtime root {}",
                    self.root.display()
                ))))
            }
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.context("read runtime root entry")?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Reject malformed requests before anything is materialized.
    pub(crate) fn validate(&self, config: &mut ContainerConfig) -> Result<()> {
        if config.id().is_empty() {
            return Err(Error::invalid_config("empty container id"));
        }
        if !CONTAINER_ID.is_match(config.id()) {
            return Err(Error::invalid_config(format!(
                "container id {:?} does not match {}",
                config.id(),
                CONTAINER_ID.as_str()
            )));
        }

        let id = config.id().clone();
        let spec = config.spec_mut();
        match spec.root() {
            Some(root) if !root.path().as_os_str().is_empty() => {}
            _ => return Err(Error::invalid_config("spec has no root path")),
        }

        {
            let process = spec
                .process_mut()
                .as_mut()
                .ok_or_else(|| Error::invalid_config("spec has no process"))?;
            if process.args().as_ref().map_or(true, Vec::is_empty) {
                return Err(Error::invalid_config("spec process has no args"));
            }
            if process.cwd().is_empty() {
                *process.cwd_mut() = "/".to_string();
            }
        }

        let namespaces = spec
            .linux()
            .as_ref()
            .and_then(|l| l.namespaces().as_ref());

        let mount_ns = namespaces.and_then(|list| {
            list.iter()
                .find(|ns| matches!(ns.typ(), LinuxNamespaceType::Mount))
        });
        match mount_ns {
            None => {
                return Err(Error::invalid_config(
                    "spec must create or join a mount namespace distinct from the host",
                ))
            }
            Some(ns) => {
                if let Some(path) = ns.path() {
                    if is_host_namespace(path, LinuxNamespaceType::Mount)? {
                        return Err(Error::invalid_config(
                            "sharing the host mount namespace is not allowed",
                        ));
                    }
                }
            }
        }

        let pid_ns = namespaces.and_then(|list| {
            list.iter()
                .find(|ns| matches!(ns.typ(), LinuxNamespaceType::Pid))
        });
        match pid_ns {
            None => info!("container {} shares the host pid namespace", id),
            Some(ns) => {
                if let Some(path) = ns.path() {
                    if is_host_namespace(path, LinuxNamespaceType::Pid)? {
                        info!("container {} joins the host pid namespace", id);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Whether `path` names the same namespace the runtime itself runs in.
fn is_host_namespace(path: &Path, typ: LinuxNamespaceType) -> Result<bool> {
    let own = format!("/proc/self/ns/{}", typ.proc_name());
    let host = fs::metadata(&own).with_context(|| format!("stat {}", own))?;
    let target = fs::metadata(path)
        .with_context(|| format!("stat namespace path {}", path.display()))?;
    Ok(host.ino() == target.ino() && host.dev() == target.dev())
}

fn check_proc() -> Result<()> {
    let fs_stat = statfs("/proc").map_err(|e| {
        Error::precondition(Precondition::ProcFilesystem, format!("statfs /proc: {}", e))
    })?;
    if fs_stat.filesystem_type() != PROC_SUPER_MAGIC {
        return Err(Error::precondition(
            Precondition::ProcFilesystem,
            "/proc is not a proc filesystem",
        ));
    }
    Ok(())
}

fn check_cgroup_root() -> Result<()> {
    let fs_stat = statfs(cgroup::CGROUP_ROOT).map_err(|e| {
        Error::precondition(
            Precondition::CgroupRoot,
            format!("statfs {}: {}", cgroup::CGROUP_ROOT, e),
        )
    })?;
    if fs_stat.filesystem_type() != CGROUP2_SUPER_MAGIC {
        return Err(Error::precondition(
            Precondition::CgroupRoot,
            format!("{} is not a cgroup2 hierarchy", cgroup::CGROUP_ROOT),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        container::ContainerConfigBuilder,
        engine::{ConfigItem, EngineContainer, EngineState, Version},
        oci_spec::{
            LinuxBuilder, LinuxNamespace, LinuxNamespaceBuilder, ProcessBuilder, RootBuilder,
            Spec, SpecBuilder,
        },
    };
    use anyhow::Result;
    use async_trait::async_trait;
    use std::path::PathBuf;

    #[derive(Clone, Debug)]
    struct StubEngine;

    #[derive(Clone, Debug)]
    struct StubContainer {
        config_file: PathBuf,
    }

    #[async_trait]
    impl Engine for StubEngine {
        async fn version(&self) -> crate::error::Result<Version> {
            Ok(MIN_ENGINE_VERSION)
        }
        fn container(
            &self,
            _id: &str,
            _root: &Path,
            rundir: &Path,
        ) -> crate::error::Result<Box<dyn EngineContainer>> {
            Ok(Box::new(StubContainer {
                config_file: rundir.join(ENGINE_CONFIG_FILE),
            }))
        }
    }

    #[async_trait]
    impl EngineContainer for StubContainer {
        fn config_file(&self) -> &Path {
            &self.config_file
        }
        fn apply(&mut self, _items: &[ConfigItem]) -> crate::error::Result<()> {
            Ok(())
        }
        fn save(&self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn state(&self) -> crate::error::Result<EngineState> {
            Ok(EngineState::Stopped)
        }
        async fn init_pid(&self) -> crate::error::Result<Option<i32>> {
            Ok(None)
        }
        fn release(&mut self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn test_runtime(root: PathBuf) -> Result<Runtime> {
        Ok(RuntimeBuilder::default()
            .root(root)
            .libexec("/usr/libexec/lxcri")
            .privileged(true)
            .can_mknod(true)
            .engine(Box::new(StubEngine) as Box<dyn Engine>)
            .build()?)
    }

    fn valid_spec() -> Result<Spec> {
        Ok(SpecBuilder::default()
            .root(RootBuilder::default().path("/var/lib/c1/rootfs").build()?)
            .process(
                ProcessBuilder::default()
                    .args(vec!["/sleep".to_string(), "3".to_string()])
                    .build()?,
            )
            .linux(
                LinuxBuilder::default()
                    .namespaces(vec![LinuxNamespace::new(LinuxNamespaceType::Mount)])
                    .build()?,
            )
            .build()?)
    }

    fn config_for(spec: Spec) -> Result<ContainerConfig> {
        Ok(ContainerConfigBuilder::default()
            .id("c1")
            .bundle("/var/lib/c1")
            .spec(spec)
            .build()?)
    }

    #[test]
    fn validate_defaults_cwd() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let rt = test_runtime(dir.path().to_path_buf())?;
        let mut config = config_for(valid_spec()?)?;

        rt.validate(&mut config)?;
        assert_eq!(
            config.spec().process().as_ref().unwrap().cwd(),
            "/"
        );
        Ok(())
    }

    #[test]
    fn validate_rejects_bad_ids() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let rt = test_runtime(dir.path().to_path_buf())?;

        for id in ["", "1leading-digit", "UPPER", "x", "has space"].iter() {
            let mut config = ContainerConfigBuilder::default()
                .id(*id)
                .bundle("/var/lib/c1")
                .spec(valid_spec()?)
                .build()?;
            assert!(
                matches!(rt.validate(&mut config), Err(Error::InvalidConfig(_))),
                "id {:?} must be rejected",
                id
            );
        }
        Ok(())
    }

    #[test]
    fn validate_rejects_missing_pieces() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let rt = test_runtime(dir.path().to_path_buf())?;

        // No root path.
        let spec = SpecBuilder::default()
            .process(
                ProcessBuilder::default()
                    .args(vec!["/sleep".to_string()])
                    .build()?,
            )
            .build()?;
        assert!(matches!(
            rt.validate(&mut config_for(spec)?),
            Err(Error::InvalidConfig(_))
        ));

        // No process args.
        let spec = SpecBuilder::default()
            .root(RootBuilder::default().path("/r").build()?)
            .process(ProcessBuilder::default().build()?)
            .build()?;
        assert!(matches!(
            rt.validate(&mut config_for(spec)?),
            Err(Error::InvalidConfig(_))
        ));
        Ok(())
    }

    #[test]
    fn validate_rejects_empty_namespaces() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let rt = test_runtime(dir.path().to_path_buf())?;
        let spec = SpecBuilder::default()
            .root(RootBuilder::default().path("/r").build()?)
            .process(
                ProcessBuilder::default()
                    .args(vec!["/sleep".to_string()])
                    .build()?,
            )
            .linux(LinuxBuilder::default().namespaces(Vec::new()).build()?)
            .build()?;

        assert!(matches!(
            rt.validate(&mut config_for(spec)?),
            Err(Error::InvalidConfig(_))
        ));
        Ok(())
    }

    #[test]
    fn validate_rejects_host_mount_namespace() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let rt = test_runtime(dir.path().to_path_buf())?;
        let spec = SpecBuilder::default()
            .root(RootBuilder::default().path("/r").build()?)
            .process(
                ProcessBuilder::default()
                    .args(vec!["/sleep".to_string()])
                    .build()?,
            )
            .linux(
                LinuxBuilder::default()
                    .namespaces(vec![LinuxNamespaceBuilder::default()
                        .typ(LinuxNamespaceType::Mount)
                        .path("/proc/self/ns/mnt")
                        .build()?])
                    .build()?,
            )
            .build()?;

        assert!(matches!(
            rt.validate(&mut config_for(spec)?),
            Err(Error::InvalidConfig(_))
        ));
        Ok(())
    }

    #[test]
    fn validate_allows_host_pid_namespace() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let rt = test_runtime(dir.path().to_path_buf())?;
        let spec = SpecBuilder::default()
            .root(RootBuilder::default().path("/r").build()?)
            .process(
                ProcessBuilder::default()
                    .args(vec!["/sleep".to_string()])
                    .build()?,
            )
            .linux(
                LinuxBuilder::default()
                    .namespaces(vec![
                        LinuxNamespace::new(LinuxNamespaceType::Mount),
                        LinuxNamespaceBuilder::default()
                            .typ(LinuxNamespaceType::Pid)
                            .path("/proc/self/ns/pid")
                            .build()?,
                    ])
                    .build()?,
            )
            .build()?;

        rt.validate(&mut config_for(spec)?)?;
        Ok(())
    }

    #[tokio::test]
    async fn create_invalid_spec_leaves_no_rundir() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let rt = test_runtime(dir.path().join("run"))?;

        // Empty namespace list: shares the host mount namespace.
        let spec = SpecBuilder::default()
            .root(RootBuilder::default().path("/r").build()?)
            .process(
                ProcessBuilder::default()
                    .args(vec!["/sleep".to_string()])
                    .build()?,
            )
            .linux(LinuxBuilder::default().namespaces(Vec::new()).build()?)
            .build()?;

        let err = rt
            .create(&Context::new(), config_for(spec)?)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(!dir.path().join("run/c1").exists());
        Ok(())
    }

    #[tokio::test]
    async fn delete_unknown_id_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let rt = test_runtime(dir.path().join("run"))?;

        rt.delete(&Context::new(), "nosuch", false).await?;
        rt.delete(&Context::new(), "nosuch", true).await?;
        Ok(())
    }

    #[tokio::test]
    async fn delete_cleans_orphaned_rundir() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("run");
        let rt = test_runtime(root.clone())?;

        // A failed create can leave a directory without lxcri.json behind,
        // but with the spec snapshot already persisted.
        let orphan = root.join("cfailed");
        fs::create_dir_all(&orphan)?;
        fs::write(orphan.join(ENGINE_CONFIG_FILE), "")?;
        valid_spec()?.save(&orphan.join(SPEC_FILE))?;

        rt.delete(&Context::new(), "cfailed", false).await?;
        assert!(!orphan.exists());
        Ok(())
    }

    #[tokio::test]
    async fn delete_loaded_container_twice() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("run");
        let rt = test_runtime(root.clone())?;

        // Fabricate a stopped container on disk.
        let rundir = root.join("c1");
        fs::create_dir_all(&rundir)?;
        let engine = rt.engine.container("c1", &root, &rundir)?;
        let container = Container::new(
            config_for(valid_spec()?)?,
            rundir.clone(),
            PathBuf::from("lxcri/c1"),
            engine,
        );
        container.persist()?;

        rt.delete(&Context::new(), "c1", false).await?;
        assert!(!rundir.exists());
        rt.delete(&Context::new(), "c1", false).await?;
        Ok(())
    }

    #[tokio::test]
    async fn load_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("run");
        let rt = test_runtime(root.clone())?;

        let rundir = root.join("c1");
        fs::create_dir_all(&rundir)?;
        let engine = rt.engine.container("c1", &root, &rundir)?;
        let mut container = Container::new(
            config_for(valid_spec()?)?,
            rundir,
            PathBuf::from("lxcri/c1"),
            engine,
        );
        container.set_monitor_pid(77);
        container.persist()?;

        let loaded = rt.load("c1")?;
        assert_eq!(loaded.id(), "c1");
        assert_eq!(loaded.monitor_pid(), Some(77));
        assert_eq!(loaded.status().await?, ContainerStatus::Stopped);
        Ok(())
    }

    #[test]
    fn load_unknown_is_not_exist() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let rt = test_runtime(dir.path().join("run"))?;
        assert!(matches!(rt.load("ghost"), Err(Error::NotExist(_))));
        Ok(())
    }

    #[test]
    fn list_skips_internal_entries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("run");
        let rt = test_runtime(root.clone())?;

        fs::create_dir_all(root.join("c1"))?;
        fs::create_dir_all(root.join("c2"))?;
        fs::create_dir_all(root.join(ROOTFS_MOUNT_DIR))?;
        fs::write(root.join("stray.txt"), "")?;

        assert_eq!(rt.list()?, vec!["c1".to_string(), "c2".to_string()]);
        Ok(())
    }

    #[test]
    fn libexec_check_requires_executables() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let libexec = dir.path().join("libexec");
        fs::create_dir_all(&libexec)?;
        let rt = RuntimeBuilder::default()
            .root(dir.path().join("run"))
            .libexec(libexec.clone())
            .engine(Box::new(StubEngine) as Box<dyn Engine>)
            .build()?;

        // Missing binaries.
        assert!(matches!(
            rt.check_libexec(),
            Err(Error::PreconditionFailed {
                kind: Precondition::LibexecProgram,
                ..
            })
        ));

        // Present but not executable.
        for bin in [MONITOR_BIN, INIT_BIN, HOOK_BIN].iter() {
            fs::write(libexec.join(bin), "#!/bin/sh\n")?;
        }
        assert!(rt.check_libexec().is_err());

        for bin in [MONITOR_BIN, INIT_BIN, HOOK_BIN].iter() {
            fs::set_permissions(libexec.join(bin), Permissions::from_mode(0o755))?;
        }
        rt.check_libexec()?;
        Ok(())
    }
}
