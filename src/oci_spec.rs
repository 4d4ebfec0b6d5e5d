//! OCI runtime spec

use anyhow::{Context, Result};
use derive_builder::Builder;
use getset::{CopyGetters, Getters, MutGetters};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::File,
    path::{Path, PathBuf},
};

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, Getters, MutGetters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Spec is the base configuration for the container.
pub struct Spec {
    #[getset(get = "pub")]
    #[serde(rename = "ociVersion")]
    /// Version of the Open Container Initiative Runtime Specification with which the bundle
    /// complies.
    version: String,

    #[getset(get = "pub", get_mut = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Process configures the container process.
    process: Option<Process>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Root configures the container's root filesystem.
    root: Option<Root>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Hostname configures the container's hostname.
    hostname: Option<String>,

    #[getset(get = "pub", get_mut = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Mounts configures additional mounts (on top of Root).
    mounts: Option<Vec<Mount>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Hooks configures callbacks for container lifecycle events.
    hooks: Option<Hooks>,

    #[getset(get = "pub", get_mut = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Annotations contains arbitrary metadata for the container.
    annotations: Option<HashMap<String, String>>,

    #[getset(get = "pub", get_mut = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Linux is platform-specific configuration for Linux based containers.
    linux: Option<Linux>,
}

impl Default for Spec {
    fn default() -> Self {
        Self {
            version: "1.0.2".into(),
            process: None,
            root: None,
            hostname: None,
            mounts: None,
            hooks: None,
            annotations: None,
            linux: None,
        }
    }
}

impl Spec {
    /// Load a new spec from the provided file `Path`
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open file {}", path.display()))?;
        serde_json::from_reader(file)
            .with_context(|| format!("deserialize OCI spec from file {}", path.display()))
    }

    /// Save the loaded spec into the provided file `Path`
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut file =
            File::create(path).with_context(|| format!("create file {}", path.display()))?;
        serde_json::to_writer(&mut file, self)
            .with_context(|| format!("serialize OCI spec to file {}", path.display()))
    }
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, Getters, MutGetters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Process contains information to start a specific application inside the container.
pub struct Process {
    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Terminal creates an interactive terminal for the container.
    terminal: Option<bool>,

    /// User specifies user information for the process.
    #[getset(get = "pub")]
    user: User,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Args specifies the binary and arguments for the application to execute.
    args: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Env populates the process environment for the process.
    env: Option<Vec<String>>,

    #[getset(get = "pub", get_mut = "pub")]
    #[serde(default)]
    /// Cwd is the current working directory for the process and must be relative to the
    /// container's root.
    cwd: String,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Capabilities are Linux capabilities that are kept for the process.
    capabilities: Option<LinuxCapabilities>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Rlimits specifies rlimit options to apply to the process.
    rlimits: Option<Vec<POSIXRlimit>>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "noNewPrivileges"
    )]
    /// NoNewPrivileges controls whether additional privileges could be gained by processes in the
    /// container.
    no_new_privileges: Option<bool>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "apparmorProfile"
    )]
    /// ApparmorProfile specifies the apparmor profile for the container.
    apparmor_profile: Option<String>,

    #[getset(get = "pub")]
    #[serde(skip_serializing_if = "Option::is_none", rename = "oomScoreAdj")]
    /// Specify an oom_score_adj for the container.
    oom_score_adj: Option<i32>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxCapabilities specifies the list of allowed capabilities that are kept for a process.
/// http://man7.org/linux/man-pages/man7/capabilities.7.html
pub struct LinuxCapabilities {
    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Bounding is the set of capabilities checked by the kernel.
    bounding: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Effective is the set of capabilities checked by the kernel.
    effective: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Inheritable is the capabilities preserved across execve.
    inheritable: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Permitted is the limiting superset for effective capabilities.
    permitted: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Ambient is the ambient set of capabilities that are kept.
    ambient: Option<Vec<String>>,
}

/// User specifies specific user (and group) information for the container process.
#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, CopyGetters, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
pub struct User {
    #[getset(get_copy = "pub")]
    #[serde(default)]
    /// UID is the user id.
    uid: u32,

    #[getset(get_copy = "pub")]
    #[serde(default)]
    /// GID is the group id.
    gid: u32,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "additionalGids"
    )]
    /// AdditionalGids are additional group ids set for the container's process.
    additional_gids: Option<Vec<u32>>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// Root contains information about the container's root filesystem on the host.
pub struct Root {
    #[getset(get = "pub")]
    /// Path is the absolute path to the container's root filesystem.
    path: PathBuf,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    /// Readonly makes the root filesystem for the container readonly before the process is
    /// executed.
    readonly: Option<bool>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Clone, Builder, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// Mount specifies a mount for a container.
pub struct Mount {
    #[getset(get = "pub")]
    /// Destination is the absolute path where the mount will be placed in the container.
    destination: PathBuf,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    #[builder(default)]
    /// Type specifies the mount kind.
    typ: Option<String>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    /// Source specifies the source path of the mount.
    source: Option<PathBuf>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    /// Options are fstab style mount options.
    options: Option<Vec<String>>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// Hook specifies a command that is run at a particular event in the lifecycle of a container.
pub struct Hook {
    #[getset(get = "pub")]
    path: PathBuf,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    args: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    env: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    timeout: Option<i64>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Hooks specifies a command that is run in the container at a particular event in the lifecycle
/// (setup and teardown) of a container.
pub struct Hooks {
    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Prestart is Deprecated. Prestart is a list of hooks to be run before the container process
    /// is executed. It is called in the Runtime Namespace.
    prestart: Option<Vec<Hook>>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "createRuntime"
    )]
    /// CreateRuntime is a list of hooks to be run after the container has been created but before
    /// pivot_root or any equivalent operation has been called. It is called in the Runtime
    /// Namespace.
    create_runtime: Option<Vec<Hook>>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "createContainer"
    )]
    /// CreateContainer is a list of hooks to be run after the container has been created but
    /// before pivot_root or any equivalent operation has been called. It is called in the
    /// Container Namespace.
    create_container: Option<Vec<Hook>>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "startContainer"
    )]
    /// StartContainer is a list of hooks to be run after the start operation is called but before
    /// the container process is started. It is called in the Container Namespace.
    start_container: Option<Vec<Hook>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Poststart is a list of hooks to be run after the container process is started. It is called
    /// in the Runtime Namespace.
    poststart: Option<Vec<Hook>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Poststop is a list of hooks to be run after the container process exits. It is called in
    /// the Runtime Namespace.
    poststop: Option<Vec<Hook>>,
}

impl Hooks {
    /// Whether any hook list of this block is non-empty.
    pub fn is_empty(&self) -> bool {
        fn none_or_empty(hooks: &Option<Vec<Hook>>) -> bool {
            hooks.as_ref().map_or(true, Vec::is_empty)
        }
        none_or_empty(&self.prestart)
            && none_or_empty(&self.create_runtime)
            && none_or_empty(&self.create_container)
            && none_or_empty(&self.start_container)
            && none_or_empty(&self.poststart)
            && none_or_empty(&self.poststop)
    }
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, Getters, MutGetters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Linux contains platform-specific configuration for Linux based containers.
pub struct Linux {
    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "uidMappings"
    )]
    /// UIDMappings specifies user mappings for supporting user namespaces.
    uid_mappings: Option<Vec<LinuxIDMapping>>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "gidMappings"
    )]
    /// GIDMappings specifies group mappings for supporting user namespaces.
    gid_mappings: Option<Vec<LinuxIDMapping>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Sysctl are a set of key value pairs that are set for the container on start.
    sysctl: Option<HashMap<String, String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Resources contain cgroup information for handling resource constraints for the container.
    resources: Option<LinuxResources>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "cgroupsPath"
    )]
    /// CgroupsPath specifies the path to cgroups that are created and/or joined by the container.
    /// The path is expected to be relative to the cgroups mountpoint. If resources are specified,
    /// the cgroups at CgroupsPath will be updated based on resources.
    cgroups_path: Option<PathBuf>,

    #[getset(get = "pub", get_mut = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Namespaces contains the namespaces that are created and/or joined by the container.
    namespaces: Option<Vec<LinuxNamespace>>,

    #[getset(get = "pub", get_mut = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Devices are a list of device nodes that are created for the container.
    devices: Option<Vec<LinuxDevice>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Seccomp specifies the seccomp security settings for the container.
    seccomp: Option<LinuxSeccomp>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "rootfsPropagation"
    )]
    /// RootfsPropagation is the rootfs mount propagation mode for the container.
    rootfs_propagation: Option<String>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "maskedPaths"
    )]
    /// MaskedPaths masks over the provided paths inside the container.
    masked_paths: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "readonlyPaths"
    )]
    /// ReadonlyPaths sets the provided paths as RO inside the container.
    readonly_paths: Option<Vec<String>>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, CopyGetters, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// LinuxNamespace is the configuration for a Linux namespace.
pub struct LinuxNamespace {
    #[getset(get_copy = "pub")]
    #[serde(rename = "type")]
    /// Type is the type of namespace.
    typ: LinuxNamespaceType,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    /// Path is a path to an existing namespace persisted on disk that can be joined and is of the
    /// same type
    path: Option<PathBuf>,
}

impl LinuxNamespace {
    /// A namespace of `typ` that is created rather than joined.
    pub fn new(typ: LinuxNamespaceType) -> Self {
        Self { typ, path: None }
    }
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Clone, Copy, Hash)]
pub enum LinuxNamespaceType {
    #[serde(rename = "pid")]
    /// For isolating process IDs.
    Pid,

    #[serde(rename = "network")]
    /// For isolating network devices, stacks, ports, etc..
    Network,

    #[serde(rename = "mount")]
    /// For isolating mount points.
    Mount,

    #[serde(rename = "ipc")]
    /// For isolating System V IPC, POSIX message queues.
    Ipc,

    #[serde(rename = "uts")]
    /// For isolating hostname and NIS domain name.
    Uts,

    #[serde(rename = "user")]
    /// For isolating user and group IDs.
    User,

    #[serde(rename = "cgroup")]
    /// For isolating cgroup hierarchies.
    Cgroup,
}

impl LinuxNamespaceType {
    /// Short kernel name of the namespace, as used below `/proc/<pid>/ns`.
    pub fn proc_name(self) -> &'static str {
        match self {
            LinuxNamespaceType::Pid => "pid",
            LinuxNamespaceType::Network => "net",
            LinuxNamespaceType::Mount => "mnt",
            LinuxNamespaceType::Ipc => "ipc",
            LinuxNamespaceType::Uts => "uts",
            LinuxNamespaceType::User => "user",
            LinuxNamespaceType::Cgroup => "cgroup",
        }
    }
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, CopyGetters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// LinuxIDMapping specifies UID/GID mappings.
pub struct LinuxIDMapping {
    #[getset(get_copy = "pub")]
    #[serde(rename = "containerID")]
    /// ContainerID is the starting UID/GID in the container.
    container_id: u32,

    #[getset(get_copy = "pub")]
    #[serde(rename = "hostID")]
    /// HostID is the starting UID/GID on the host to be mapped to `container_id`.
    host_id: u32,

    #[getset(get_copy = "pub")]
    /// Size is the number of IDs to be mapped.
    size: u32,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, CopyGetters, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// POSIXRlimit type and restrictions.
pub struct POSIXRlimit {
    #[getset(get = "pub")]
    #[serde(rename = "type")]
    /// Type of the rlimit to set.
    typ: String,

    #[getset(get_copy = "pub")]
    /// Hard is the hard limit for the specified type.
    hard: u64,

    #[getset(get_copy = "pub")]
    /// Soft is the soft limit for the specified type.
    soft: u64,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, CopyGetters, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// LinuxHugepageLimit structure corresponds to limiting kernel hugepages.
pub struct LinuxHugepageLimit {
    #[getset(get = "pub")]
    #[serde(rename = "pageSize")]
    /// Pagesize is the hugepage size.
    /// Format: "<size><unit-prefix>B' (e.g. 64KB, 2MB, 1GB, etc.)
    page_size: String,

    #[getset(get_copy = "pub")]
    /// Limit is the limit of "hugepagesize" hugetlb usage.
    limit: i64,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, CopyGetters)]
#[builder(pattern = "owned", setter(into, strip_option))]
pub struct LinuxThrottleDevice {
    #[getset(get_copy = "pub")]
    /// Major is the device's major number.
    major: i64,

    #[getset(get_copy = "pub")]
    /// Minor is the device's minor number.
    minor: i64,

    #[getset(get_copy = "pub")]
    /// Rate is the IO rate limit per cgroup per device.
    rate: u64,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, CopyGetters, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxBlockIO for Linux cgroup 'io' resource management.
pub struct LinuxBlockIO {
    #[getset(get_copy = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Specifies per cgroup weight.
    weight: Option<u16>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "throttleReadBpsDevice"
    )]
    /// IO read rate limit per cgroup per device, bytes per second.
    throttle_read_bps_device: Option<Vec<LinuxThrottleDevice>>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "throttleWriteBpsDevice"
    )]
    /// IO write rate limit per cgroup per device, bytes per second.
    throttle_write_bps_device: Option<Vec<LinuxThrottleDevice>>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "throttleReadIOPSDevice"
    )]
    /// IO read rate limit per cgroup per device, IO per second.
    throttle_read_iops_device: Option<Vec<LinuxThrottleDevice>>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "throttleWriteIOPSDevice"
    )]
    /// IO write rate limit per cgroup per device, IO per second.
    throttle_write_iops_device: Option<Vec<LinuxThrottleDevice>>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, CopyGetters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxMemory for Linux cgroup 'memory' resource management.
pub struct LinuxMemory {
    #[getset(get_copy = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Memory limit (in bytes).
    limit: Option<i64>,

    #[getset(get_copy = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Memory reservation or soft_limit (in bytes).
    reservation: Option<i64>,

    #[getset(get_copy = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Total memory limit (memory + swap).
    swap: Option<i64>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, CopyGetters, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxCPU for Linux cgroup 'cpu' resource management.
pub struct LinuxCPU {
    #[getset(get_copy = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// CPU shares (relative weight (ratio) vs. other cgroups with cpu shares).
    shares: Option<u64>,

    #[getset(get_copy = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// CPU hardcap limit (in usecs). Allowed cpu time in a given period.
    quota: Option<i64>,

    #[getset(get_copy = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// CPU period to be used for hardcapping (in usecs).
    period: Option<u64>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// CPUs to use within the cpuset. Default is to use any CPU available.
    cpus: Option<String>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// List of memory nodes in the cpuset. Default is to use any available memory node.
    mems: Option<String>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, CopyGetters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// LinuxPids for Linux cgroup 'pids' resource management (Linux 4.3).
pub struct LinuxPids {
    #[getset(get_copy = "pub")]
    /// Maximum number of PIDs. Default is "no limit".
    limit: i64,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxResources has container runtime resource constraints.
pub struct LinuxResources {
    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Devices configures the device allowlist.
    devices: Option<Vec<LinuxDeviceCgroup>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Memory restriction configuration.
    memory: Option<LinuxMemory>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// CPU resource restriction configuration.
    cpu: Option<LinuxCPU>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Task resource restriction configuration.
    pids: Option<LinuxPids>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "blockIO")]
    /// BlockIO restriction configuration.
    block_io: Option<LinuxBlockIO>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "hugepageLimits"
    )]
    /// Hugetlb limit (in bytes).
    hugepage_limits: Option<Vec<LinuxHugepageLimit>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Unified resources.
    unified: Option<HashMap<String, String>>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Clone, Builder, CopyGetters, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// LinuxDevice represents the mknod information for a Linux special device file.
pub struct LinuxDevice {
    #[getset(get = "pub")]
    /// Path to the device.
    path: PathBuf,

    #[getset(get = "pub")]
    #[serde(rename = "type")]
    /// Device type, block, char, etc..
    typ: String,

    #[getset(get_copy = "pub")]
    /// Major is the device's major number.
    major: i64,

    #[getset(get_copy = "pub")]
    /// Minor is the device's minor number.
    minor: i64,

    #[getset(get_copy = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "fileMode")]
    #[builder(default)]
    /// FileMode permission bits for the device.
    file_mode: Option<u32>,

    #[getset(get_copy = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    /// UID of the device.
    uid: Option<u32>,

    #[getset(get_copy = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    /// Gid of the device.
    gid: Option<u32>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Clone, Builder, CopyGetters, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxDeviceCgroup represents a device rule for the devices specified to the device controller.
pub struct LinuxDeviceCgroup {
    #[getset(get_copy = "pub")]
    /// Allow or deny.
    allow: bool,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    /// Device type, block, char, etc..
    typ: Option<String>,

    #[getset(get_copy = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Major is the device's major number.
    major: Option<i64>,

    #[getset(get_copy = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Minor is the device's minor number.
    minor: Option<i64>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Cgroup access permissions format, rwm.
    access: Option<String>,
}

impl Default for LinuxDeviceCgroup {
    fn default() -> Self {
        Self {
            allow: false,
            typ: None,
            major: None,
            minor: None,
            access: None,
        }
    }
}

#[derive(Default, PartialEq, Eq, Serialize, Deserialize, Debug, Builder, CopyGetters, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxSeccomp represents syscall restrictions.
pub struct LinuxSeccomp {
    #[getset(get_copy = "pub")]
    #[serde(rename = "defaultAction")]
    default_action: LinuxSeccompAction,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    architectures: Option<Vec<Arch>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    syscalls: Option<Vec<LinuxSyscall>>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Clone, Copy)]
pub enum LinuxSeccompAction {
    #[serde(rename = "SCMP_ACT_KILL")]
    Kill,

    #[serde(rename = "SCMP_ACT_KILL_PROCESS")]
    KillProcess,

    #[serde(rename = "SCMP_ACT_TRAP")]
    Trap,

    #[serde(rename = "SCMP_ACT_ERRNO")]
    Errno,

    #[serde(rename = "SCMP_ACT_TRACE")]
    Trace,

    #[serde(rename = "SCMP_ACT_ALLOW")]
    Allow,

    #[serde(rename = "SCMP_ACT_LOG")]
    Log,
}

impl Default for LinuxSeccompAction {
    fn default() -> Self {
        LinuxSeccompAction::Allow
    }
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Clone, Copy)]
pub enum Arch {
    #[serde(rename = "SCMP_ARCH_X86")]
    X86,

    #[serde(rename = "SCMP_ARCH_X86_64")]
    X86_64,

    #[serde(rename = "SCMP_ARCH_X32")]
    X32,

    #[serde(rename = "SCMP_ARCH_ARM")]
    ARM,

    #[serde(rename = "SCMP_ARCH_AARCH64")]
    AARCH64,

    #[serde(rename = "SCMP_ARCH_MIPS")]
    MIPS,

    #[serde(rename = "SCMP_ARCH_MIPS64")]
    MIPS64,

    #[serde(rename = "SCMP_ARCH_MIPSEL")]
    MIPSEL,

    #[serde(rename = "SCMP_ARCH_MIPSEL64")]
    MIPSEL64,

    #[serde(rename = "SCMP_ARCH_PPC")]
    PPC,

    #[serde(rename = "SCMP_ARCH_PPC64")]
    PPC64,

    #[serde(rename = "SCMP_ARCH_PPC64LE")]
    PPC64LE,

    #[serde(rename = "SCMP_ARCH_S390")]
    S390,

    #[serde(rename = "SCMP_ARCH_S390X")]
    S390X,

    #[serde(rename = "SCMP_ARCH_RISCV64")]
    RISCV64,
}

#[derive(Default, PartialEq, Eq, Serialize, Deserialize, Debug, Builder, CopyGetters, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxSyscall is used to match a syscall in seccomp.
pub struct LinuxSyscall {
    #[getset(get = "pub")]
    names: Vec<String>,

    #[getset(get_copy = "pub")]
    action: LinuxSeccompAction,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<Vec<LinuxSeccompArg>>,
}

#[derive(Default, PartialEq, Eq, Serialize, Deserialize, Debug, Clone, Builder, CopyGetters, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxSeccompArg used for matching specific syscall arguments in seccomp.
pub struct LinuxSeccompArg {
    #[getset(get_copy = "pub")]
    index: usize,

    #[getset(get_copy = "pub")]
    value: u64,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "valueTwo")]
    value_two: Option<u64>,

    #[getset(get_copy = "pub")]
    op: LinuxSeccompOperator,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Clone, Copy)]
/// The seccomp operator to be used for args.
pub enum LinuxSeccompOperator {
    #[serde(rename = "SCMP_CMP_NE")]
    /// Refers to the SCMP_CMP_NE operator
    NotEqual,

    #[serde(rename = "SCMP_CMP_LT")]
    /// Refers to the SCMP_CMP_LT operator
    LessThan,

    #[serde(rename = "SCMP_CMP_LE")]
    /// Refers to the SCMP_CMP_LE operator
    LessEqual,

    #[serde(rename = "SCMP_CMP_EQ")]
    /// Refers to the SCMP_CMP_EQ operator
    EqualTo,

    #[serde(rename = "SCMP_CMP_GE")]
    /// Refers to the SCMP_CMP_GE operator
    GreaterEqual,

    #[serde(rename = "SCMP_CMP_GT")]
    /// Refers to the SCMP_CMP_GT operator
    GreaterThan,

    #[serde(rename = "SCMP_CMP_MASKED_EQ")]
    /// Refers to the SCMP_CMP_MASKED_EQ operator
    MaskedEqual,
}

impl LinuxSeccompOperator {
    /// The wire name of the operator in seccomp profiles.
    pub fn as_scmp_str(self) -> &'static str {
        match self {
            LinuxSeccompOperator::NotEqual => "SCMP_CMP_NE",
            LinuxSeccompOperator::LessThan => "SCMP_CMP_LT",
            LinuxSeccompOperator::LessEqual => "SCMP_CMP_LE",
            LinuxSeccompOperator::EqualTo => "SCMP_CMP_EQ",
            LinuxSeccompOperator::GreaterEqual => "SCMP_CMP_GE",
            LinuxSeccompOperator::GreaterThan => "SCMP_CMP_GT",
            LinuxSeccompOperator::MaskedEqual => "SCMP_CMP_MASKED_EQ",
        }
    }
}

impl Default for LinuxSeccompOperator {
    fn default() -> Self {
        LinuxSeccompOperator::EqualTo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn load_and_save_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");

        let spec = SpecBuilder::default()
            .root(RootBuilder::default().path("/var/lib/c1/rootfs").build()?)
            .process(
                ProcessBuilder::default()
                    .args(vec!["/sleep".to_string(), "3".to_string()])
                    .cwd("/")
                    .build()?,
            )
            .build()?;
        spec.save(&path)?;

        let loaded = Spec::load(&path)?;
        assert_eq!(loaded, spec);
        assert_eq!(loaded.version(), "1.0.2");
        Ok(())
    }

    #[test]
    fn deserialize_oci_field_names() -> Result<()> {
        let json = r#"{
            "ociVersion": "1.0.2",
            "process": {
                "user": {"uid": 1000, "gid": 1000},
                "args": ["/bin/true"],
                "cwd": "/",
                "noNewPrivileges": true,
                "oomScoreAdj": 100
            },
            "root": {"path": "rootfs", "readonly": true},
            "linux": {
                "namespaces": [
                    {"type": "mount"},
                    {"type": "uts"},
                    {"type": "pid", "path": "/proc/1/ns/pid"}
                ],
                "uidMappings": [{"containerID": 0, "hostID": 20000, "size": 65536}],
                "maskedPaths": ["/proc/kcore"]
            }
        }"#;

        let spec: Spec = serde_json::from_str(json)?;
        let process = spec.process().as_ref().unwrap();
        assert_eq!(process.user().uid(), 1000);
        assert_eq!(process.no_new_privileges(), &Some(true));
        assert_eq!(process.oom_score_adj(), &Some(100));

        let linux = spec.linux().as_ref().unwrap();
        let namespaces = linux.namespaces().as_ref().unwrap();
        assert_eq!(namespaces.len(), 3);
        assert!(namespaces[2].path().is_some());
        assert_eq!(
            linux.uid_mappings().as_ref().unwrap()[0].host_id(),
            20000
        );
        Ok(())
    }

    #[test]
    fn namespace_proc_names() {
        assert_eq!(LinuxNamespaceType::Mount.proc_name(), "mnt");
        assert_eq!(LinuxNamespaceType::Network.proc_name(), "net");
        assert_eq!(LinuxNamespaceType::Uts.proc_name(), "uts");
    }

    #[test]
    fn hooks_emptiness() -> Result<()> {
        assert!(Hooks::default().is_empty());
        let hooks = HooksBuilder::default()
            .prestart(vec![HookBuilder::default().path("/bin/hook").build()?])
            .build()?;
        assert!(!hooks.is_empty());
        Ok(())
    }
}
