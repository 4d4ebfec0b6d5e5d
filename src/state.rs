//! Container status derivation and the OCI state document.
//!
//! The OCI status is never stored; it is always computed from the engine
//! state plus a probe of the init process. The init binary keeps its
//! sentinel argv[0] until the sync FIFO releases it, which is what tells a
//! `created` container apart from a `running` one.

use crate::engine::EngineState;
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::PathBuf};
use strum::{AsRefStr, Display};

/// OCI runtime spec version reported in state documents.
pub const OCI_VERSION: &str = "1.0.2";

/// The init process argv[0] until it has exec'ed the user process.
pub const INIT_SENTINEL: &str = "/.lxcri/lxcri-init";

#[derive(
    AsRefStr, Clone, Copy, Debug, Display, Deserialize, Eq, PartialEq, Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
/// OCI container status.
pub enum ContainerStatus {
    Creating,
    Created,
    Running,
    Stopped,
    /// The engine reported a state this runtime cannot map.
    Error,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// Result of probing the init process through `/proc/<pid>/cmdline`.
pub enum InitProbe {
    /// argv[0] is still the init sentinel, the user process has not started.
    Sentinel,
    /// argv[0] changed, the init has exec'ed the user process.
    Execed,
    /// The cmdline cannot be read, the process has died.
    Gone,
}

/// Probe the init process `pid`.
pub fn probe_init(pid: i32) -> InitProbe {
    match fs::read(format!("/proc/{}/cmdline", pid)) {
        Ok(cmdline) => {
            let argv0 = cmdline.split(|b| *b == 0).next().unwrap_or_default();
            if argv0 == INIT_SENTINEL.as_bytes() {
                InitProbe::Sentinel
            } else {
                InitProbe::Execed
            }
        }
        // ENOENT or ESRCH: the process has died.
        Err(_) => InitProbe::Gone,
    }
}

/// Map the engine state plus an init probe to the OCI status.
///
/// The probe closure is only invoked when the engine reports the container
/// as running or later.
pub fn derive_status<F>(engine: &EngineState, probe: F) -> ContainerStatus
where
    F: FnOnce() -> InitProbe,
{
    match engine {
        EngineState::Stopped => ContainerStatus::Stopped,
        EngineState::Starting => ContainerStatus::Creating,
        EngineState::Running
        | EngineState::Stopping
        | EngineState::Aborting
        | EngineState::Freezing
        | EngineState::Frozen
        | EngineState::Thawed => match probe() {
            InitProbe::Sentinel => ContainerStatus::Created,
            InitProbe::Execed => ContainerStatus::Running,
            InitProbe::Gone => ContainerStatus::Stopped,
        },
        EngineState::Unknown(_) => ContainerStatus::Error,
    }
}

#[derive(
    Builder, Clone, Debug, Deserialize, Eq, CopyGetters, Getters, PartialEq, Serialize,
)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// State holds information about the runtime state of the container.
pub struct State {
    #[getset(get = "pub")]
    #[serde(rename = "ociVersion")]
    #[builder(default = "OCI_VERSION.to_string()")]
    /// Version of the Open Container Initiative Runtime Specification.
    version: String,

    #[getset(get = "pub")]
    /// ID is the container ID.
    id: String,

    #[getset(get_copy = "pub")]
    /// Status is the runtime status of the container.
    status: ContainerStatus,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    /// Pid is the process ID of the container init process.
    pid: Option<i32>,

    #[getset(get = "pub")]
    /// Bundle is the path to the container's bundle directory.
    bundle: PathBuf,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    /// Annotations are key values associated with the container.
    annotations: Option<HashMap<String, String>>,
}
