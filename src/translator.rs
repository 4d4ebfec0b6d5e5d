//! Spec translation
//!
//! One pass over the OCI spec produces the ordered record of engine config
//! items plus the side files (`seccomp.conf`, `devices.txt`, `masked.txt`)
//! the engine hook consumes. The engine's stringly-typed surface is
//! confined to this module; everything is emitted in a single sweep so the
//! translation is testable without a live engine.

use crate::{
    cgroup,
    container::{ContainerConfig, DEVICES_FILE, MASKED_FILE, SECCOMP_FILE},
    devices,
    engine::ConfigItem,
    error::{Error, Result},
    oci_spec::{LinuxNamespace, LinuxNamespaceType, Spec},
    runtime::Runtime,
    seccomp,
    state::INIT_SENTINEL,
};
use anyhow::Context;
use log::{info, warn};
use nix::sched::{setns, CloneFlags};
use std::{
    collections::HashSet,
    fs::{self, File},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
};

/// Result of the translation pass.
#[derive(Debug)]
pub struct Translation {
    /// Engine config items in emission order.
    pub items: Vec<ConfigItem>,

    /// Container cgroup, relative to the cgroup root.
    pub cgroup_dir: PathBuf,
}

/// Translate the container spec into engine configuration.
///
/// The spec is adjusted in place where translation demands it (default
/// devices, the device bind-mount fallback, an automatic user namespace),
/// so the `config.json` snapshot persisted afterwards reflects what the
/// engine was actually told.
pub fn translate(rt: &Runtime, config: &mut ContainerConfig, rundir: &Path) -> Result<Translation> {
    let mut items = Vec::new();

    rootfs_items(rt, config.spec(), &mut items)?;
    namespace_items(rt, config.spec_mut(), &mut items)?;
    hostname_items(config.spec(), &mut items)?;
    process_items(rt, config.spec(), rundir, &mut items)?;
    device_items(rt, config.spec_mut(), rundir, &mut items)?;
    masked_paths_file(config.spec(), rundir)?;
    readonly_items(rt, config.spec(), &mut items);
    hook_items(rt, config.spec(), &mut items);
    let cgroup_dir = cgroup_items(config, &mut items)?;
    sysctl_items(config.spec(), &mut items);
    rlimit_items(config.spec(), &mut items)?;
    mount_items(rt, config.spec(), &mut items)?;
    runtime_items(rt, config, rundir, &mut items);

    Ok(Translation { items, cgroup_dir })
}

fn rootfs_items(rt: &Runtime, spec: &Spec, items: &mut Vec<ConfigItem>) -> Result<()> {
    let root = spec
        .root()
        .as_ref()
        .ok_or_else(|| Error::invalid_config("spec has no root"))?;

    items.push(ConfigItem::new(
        "rootfs.path",
        root.path().display().to_string(),
    ));
    items.push(ConfigItem::new(
        "rootfs.mount",
        rt.rootfs_mount().display().to_string(),
    ));
    items.push(ConfigItem::new("rootfs.managed", "0"));
    items.push(ConfigItem::new("ephemeral", "0"));

    let mut options = Vec::new();
    if let Some(propagation) = spec
        .linux()
        .as_ref()
        .and_then(|l| l.rootfs_propagation().as_ref())
    {
        options.push(propagation.clone());
    }
    if root.readonly() == &Some(true) {
        options.push("ro".to_string());
    }
    items.push(ConfigItem::new("rootfs.options", options.join(",")));
    Ok(())
}

fn namespace_items(rt: &Runtime, spec: &mut Spec, items: &mut Vec<ConfigItem>) -> Result<()> {
    let linux = spec.linux_mut().get_or_insert_with(Default::default);
    let namespaces = linux.namespaces_mut().get_or_insert_with(Vec::new);

    if !rt.privileged()
        && !namespaces
            .iter()
            .any(|ns| matches!(ns.typ(), LinuxNamespaceType::User))
    {
        warn!("unprivileged runtime: adding user namespace to the spec");
        namespaces.push(LinuxNamespace::new(LinuxNamespaceType::User));
    }

    let mut cloned = Vec::new();
    for ns in namespaces.iter() {
        let name = ns.typ().proc_name();
        match ns.path() {
            Some(path) => {
                if matches!(ns.typ(), LinuxNamespaceType::Pid) {
                    info!("container joins pid namespace at {}", path.display());
                }
                items.push(ConfigItem::new(
                    format!("namespace.share.{}", name),
                    path.display().to_string(),
                ));
            }
            None => cloned.push(name),
        }
    }
    if !cloned.is_empty() {
        items.push(ConfigItem::new("namespace.clone", cloned.join(" ")));
    }

    if let Some(mappings) = linux.uid_mappings() {
        for m in mappings {
            items.push(ConfigItem::new(
                "idmap",
                format!("u {} {} {}", m.container_id(), m.host_id(), m.size()),
            ));
        }
    }
    if let Some(mappings) = linux.gid_mappings() {
        for m in mappings {
            items.push(ConfigItem::new(
                "idmap",
                format!("g {} {} {}", m.container_id(), m.host_id(), m.size()),
            ));
        }
    }
    Ok(())
}

fn hostname_items(spec: &Spec, items: &mut Vec<ConfigItem>) -> Result<()> {
    let hostname = match spec.hostname() {
        Some(hostname) => hostname,
        None => return Ok(()),
    };
    items.push(ConfigItem::new("uts.name", hostname.clone()));

    // A joined UTS namespace is configured live, the engine only applies
    // `uts.name` to namespaces it creates itself.
    let uts_path = spec
        .linux()
        .as_ref()
        .and_then(|l| l.namespaces().as_ref())
        .and_then(|list| {
            list.iter()
                .find(|ns| matches!(ns.typ(), LinuxNamespaceType::Uts))
                .and_then(|ns| ns.path().clone())
        });
    if let Some(path) = uts_path {
        set_hostname_in_ns(&path, hostname)?;
    }
    Ok(())
}

/// Set the hostname inside the UTS namespace at `path`. Runs on a scratch
/// thread because `setns` moves the calling thread into the namespace.
fn set_hostname_in_ns(path: &Path, hostname: &str) -> Result<()> {
    let file = File::open(path)
        .with_context(|| format!("open uts namespace {}", path.display()))?;
    let hostname = hostname.to_string();
    let ns_path = path.to_path_buf();

    std::thread::spawn(move || -> anyhow::Result<()> {
        setns(file.as_raw_fd(), CloneFlags::CLONE_NEWUTS)
            .with_context(|| format!("join uts namespace {}", ns_path.display()))?;
        nix::unistd::sethostname(&hostname).context("sethostname")?;
        Ok(())
    })
    .join()
    .map_err(|_| Error::engine("sethostname thread panicked"))??;
    Ok(())
}

fn process_items(
    rt: &Runtime,
    spec: &Spec,
    rundir: &Path,
    items: &mut Vec<ConfigItem>,
) -> Result<()> {
    let process = spec
        .process()
        .as_ref()
        .ok_or_else(|| Error::invalid_config("spec has no process"))?;

    if let Some(oom_score_adj) = process.oom_score_adj() {
        items.push(ConfigItem::new(
            "proc.oom_score_adj",
            oom_score_adj.to_string(),
        ));
    }

    if process.no_new_privileges() == &Some(true) {
        items.push(ConfigItem::new("no_new_privs", "1"));
    }

    if rt.features().apparmor() {
        let profile = process
            .apparmor_profile()
            .as_deref()
            .unwrap_or("unconfined");
        items.push(ConfigItem::new("apparmor.profile", profile));
    } else if process.apparmor_profile().is_some() {
        warn!("apparmor feature is disabled, ignoring apparmor profile");
    }

    if rt.features().capabilities() {
        let keep = process
            .capabilities()
            .as_ref()
            .and_then(|c| c.permitted().as_ref())
            .map(|caps| {
                caps.iter()
                    .map(|c| {
                        c.to_lowercase()
                            .trim_start_matches("cap_")
                            .to_string()
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        let value = if keep.is_empty() {
            "none".to_string()
        } else {
            keep
        };
        items.push(ConfigItem::new("cap.keep", value));
    } else {
        warn!("capabilities feature is disabled, not restricting capabilities");
    }

    if let Some(seccomp_spec) = spec.linux().as_ref().and_then(|l| l.seccomp().as_ref()) {
        if !rt.features().seccomp() {
            warn!("seccomp feature is disabled, ignoring seccomp configuration");
        } else if seccomp::has_rules(seccomp_spec) {
            let profile = rundir.join(SECCOMP_FILE);
            seccomp::write_profile(seccomp_spec, &profile)?;
            items.push(ConfigItem::new(
                "seccomp.profile",
                profile.display().to_string(),
            ));
        }
    }
    Ok(())
}

fn device_items(
    rt: &Runtime,
    spec: &mut Spec,
    rundir: &Path,
    items: &mut Vec<ConfigItem>,
) -> Result<()> {
    items.push(ConfigItem::new("autodev", "0"));

    devices::ensure_default_devices(spec)?;

    if rt.features().cgroup_devices() {
        items.extend(devices::cgroup_items(spec));
    } else {
        warn!("cgroup device controller feature is disabled");
    }

    if rt.can_mknod() {
        devices::write_device_list(spec, &rundir.join(DEVICES_FILE))?;
    } else {
        devices::bind_mount_fallback(spec)?;
    }
    Ok(())
}

fn masked_paths_file(spec: &Spec, rundir: &Path) -> Result<()> {
    let masked = match spec.linux().as_ref().and_then(|l| l.masked_paths().as_ref()) {
        Some(masked) if !masked.is_empty() => masked,
        _ => return Ok(()),
    };
    let mut out = String::new();
    for path in masked {
        out.push_str(path);
        out.push('\n');
    }
    let path = rundir.join(MASKED_FILE);
    fs::write(&path, out)
        .with_context(|| format!("write masked paths {}", path.display()))?;
    Ok(())
}

fn readonly_items(rt: &Runtime, spec: &Spec, items: &mut Vec<ConfigItem>) {
    if let Some(paths) = spec.linux().as_ref().and_then(|l| l.readonly_paths().as_ref()) {
        for path in paths {
            items.push(ConfigItem::new(
                "mount.entry",
                format!(
                    "{}{} {} bind bind,ro,optional",
                    rt.rootfs_mount().display(),
                    path,
                    path.trim_start_matches('/'),
                ),
            ));
        }
    }
}

fn hook_items(rt: &Runtime, spec: &Spec, items: &mut Vec<ConfigItem>) {
    let hooks = match spec.hooks() {
        Some(hooks) if !hooks.is_empty() => hooks,
        _ => return,
    };
    let hook_bin = rt.hook_bin().display().to_string();
    let mut registered = false;

    fn present<T>(hooks: &Option<Vec<T>>) -> bool {
        hooks.as_ref().map_or(false, |h| !h.is_empty())
    }

    if present(hooks.prestart()) || present(hooks.create_runtime()) {
        items.push(ConfigItem::new("hook.pre-mount", hook_bin.clone()));
        registered = true;
    }
    if present(hooks.create_container()) {
        items.push(ConfigItem::new("hook.mount", hook_bin.clone()));
        registered = true;
    }
    if present(hooks.start_container()) {
        items.push(ConfigItem::new("hook.start", hook_bin));
        registered = true;
    }
    if registered {
        items.push(ConfigItem::new("hook.version", "1"));
    }
}

fn cgroup_items(config: &ContainerConfig, items: &mut Vec<ConfigItem>) -> Result<PathBuf> {
    let spec = config.spec();
    let linux = spec.linux().as_ref();
    let dir = cgroup::resolve(
        linux
            .and_then(|l| l.cgroups_path().as_ref())
            .map(PathBuf::as_path),
        config.systemd_cgroup(),
        config.id(),
    )?;
    items.push(ConfigItem::new("cgroup.dir", dir.display().to_string()));

    let resources = match linux.and_then(|l| l.resources().as_ref()) {
        Some(resources) => resources,
        None => return Ok(dir),
    };

    if let Some(memory) = resources.memory() {
        if let Some(limit) = memory.limit() {
            items.push(ConfigItem::new("cgroup2.memory.max", max_or(limit)));
        }
        if let Some(reservation) = memory.reservation() {
            items.push(ConfigItem::new("cgroup2.memory.low", max_or(reservation)));
        }
        if let Some(swap) = memory.swap() {
            // OCI swap is memory+swap; the v2 file accounts swap alone.
            let value = match (swap, memory.limit()) {
                (s, _) if s < 0 => "max".to_string(),
                (s, Some(limit)) if limit > 0 => (s - limit).to_string(),
                (s, _) => s.to_string(),
            };
            items.push(ConfigItem::new("cgroup2.memory.swap.max", value));
        }
    }

    if let Some(cpu) = resources.cpu() {
        if cpu.quota().is_some() || cpu.period().is_some() {
            let period = cpu.period().unwrap_or(100_000);
            let quota = match cpu.quota() {
                Some(quota) if quota > 0 => quota.to_string(),
                _ => "max".to_string(),
            };
            items.push(ConfigItem::new(
                "cgroup2.cpu.max",
                format!("{} {}", quota, period),
            ));
        }
        if let Some(shares) = cpu.shares() {
            items.push(ConfigItem::new(
                "cgroup2.cpu.weight",
                cpu_shares_to_weight(shares).to_string(),
            ));
        }
        if let Some(cpus) = cpu.cpus() {
            items.push(ConfigItem::new("cgroup2.cpuset.cpus", cpus.clone()));
        }
        if let Some(mems) = cpu.mems() {
            items.push(ConfigItem::new("cgroup2.cpuset.mems", mems.clone()));
        }
    }

    if let Some(pids) = resources.pids() {
        items.push(ConfigItem::new("cgroup2.pids.max", max_or(pids.limit())));
    }

    if let Some(block_io) = resources.block_io() {
        if let Some(weight) = block_io.weight() {
            items.push(ConfigItem::new("cgroup2.io.weight", weight.to_string()));
        }
        let throttles = [
            ("rbps", block_io.throttle_read_bps_device()),
            ("wbps", block_io.throttle_write_bps_device()),
            ("riops", block_io.throttle_read_iops_device()),
            ("wiops", block_io.throttle_write_iops_device()),
        ];
        for (kind, devices) in throttles.iter() {
            if let Some(devices) = devices {
                for device in devices.iter() {
                    items.push(ConfigItem::new(
                        "cgroup2.io.max",
                        format!(
                            "{}:{} {}={}",
                            device.major(),
                            device.minor(),
                            kind,
                            device.rate()
                        ),
                    ));
                }
            }
        }
    }

    if let Some(hugepages) = resources.hugepage_limits() {
        for hugepage in hugepages {
            items.push(ConfigItem::new(
                format!("cgroup2.hugetlb.{}.max", hugepage.page_size()),
                hugepage.limit().to_string(),
            ));
        }
    }

    if let Some(unified) = resources.unified() {
        let mut keys: Vec<&String> = unified.keys().collect();
        keys.sort();
        for key in keys {
            items.push(ConfigItem::new(
                format!("cgroup2.{}", key),
                unified[key].clone(),
            ));
        }
    }
    Ok(dir)
}

fn max_or(value: i64) -> String {
    if value < 0 {
        "max".to_string()
    } else {
        value.to_string()
    }
}

/// Convert OCI cpu shares [2..262144] to a cgroup v2 weight [1..10000].
fn cpu_shares_to_weight(shares: u64) -> u64 {
    let shares = shares.max(2).min(262_144);
    1 + ((shares - 2) * 9_999) / 262_142
}

fn sysctl_items(spec: &Spec, items: &mut Vec<ConfigItem>) {
    if let Some(sysctl) = spec.linux().as_ref().and_then(|l| l.sysctl().as_ref()) {
        let mut keys: Vec<&String> = sysctl.keys().collect();
        keys.sort();
        for key in keys {
            items.push(ConfigItem::new(
                format!("sysctl.{}", key),
                sysctl[key].clone(),
            ));
        }
    }
}

fn rlimit_items(spec: &Spec, items: &mut Vec<ConfigItem>) -> Result<()> {
    let rlimits = match spec.process().as_ref().and_then(|p| p.rlimits().as_ref()) {
        Some(rlimits) => rlimits,
        None => return Ok(()),
    };
    let mut seen = HashSet::new();
    for rlimit in rlimits {
        let name = rlimit
            .typ()
            .to_lowercase()
            .trim_start_matches("rlimit_")
            .to_string();
        if !seen.insert(name.clone()) {
            return Err(Error::invalid_config(format!(
                "duplicate rlimit {}",
                rlimit.typ()
            )));
        }
        items.push(ConfigItem::new(
            format!("prlimit.{}", name),
            format!("{}:{}", rlimit.soft(), rlimit.hard()),
        ));
    }
    Ok(())
}

fn mount_items(rt: &Runtime, spec: &Spec, items: &mut Vec<ConfigItem>) -> Result<()> {
    // The shared pivot directory must exist before the engine's mount phase.
    fs::create_dir_all(rt.rootfs_mount()).with_context(|| {
        format!("create rootfs pivot directory {}", rt.rootfs_mount().display())
    })?;

    if let Some(mounts) = spec.mounts() {
        for mount in mounts {
            let source = mount
                .source()
                .as_ref()
                .map(|s| s.display().to_string())
                .unwrap_or_else(|| "none".to_string());
            let typ = mount.typ().as_deref().unwrap_or("none");
            let options = mount
                .options()
                .as_ref()
                .filter(|o| !o.is_empty())
                .map(|o| o.join(","))
                .unwrap_or_else(|| "defaults".to_string());
            items.push(ConfigItem::new(
                "mount.entry",
                format!(
                    "{} {} {} {}",
                    source,
                    mount
                        .destination()
                        .display()
                        .to_string()
                        .trim_start_matches('/'),
                    typ,
                    options,
                ),
            ));
        }
    }
    Ok(())
}

fn runtime_items(
    rt: &Runtime,
    config: &ContainerConfig,
    rundir: &Path,
    items: &mut Vec<ConfigItem>,
) {
    // The init binary and the sync FIFO are reached through a bind mount of
    // the runtime directory at /.lxcri inside the container.
    items.push(ConfigItem::new("init.cmd", INIT_SENTINEL));
    items.push(ConfigItem::new(
        "mount.entry",
        format!("{} .lxcri none bind,create=dir", rundir.display()),
    ));

    let log_file = config
        .log_file()
        .clone()
        .unwrap_or_else(|| rundir.join("engine.log"));
    items.push(ConfigItem::new("log.file", log_file.display().to_string()));
    items.push(ConfigItem::new(
        "log.level",
        engine_log_level(config.log_level()),
    ));

    let terminal = config
        .spec()
        .process()
        .as_ref()
        .and_then(|p| *p.terminal())
        .unwrap_or(false);
    if !terminal && config.console_socket().is_none() {
        items.push(ConfigItem::new("console.path", "none"));
    }
}

fn engine_log_level(level: log::LevelFilter) -> &'static str {
    match level {
        log::LevelFilter::Off => "FATAL",
        log::LevelFilter::Error => "ERROR",
        log::LevelFilter::Warn => "WARN",
        log::LevelFilter::Info => "INFO",
        log::LevelFilter::Debug => "DEBUG",
        log::LevelFilter::Trace => "TRACE",
    }
}
