//! lxcri is an OCI conformant container runtime on top of a low-level
//! Linux container engine. It translates an OCI bundle into engine
//! configuration, drives the two-phase create/start handshake through a
//! sync FIFO together with an out-of-process monitor, derives the OCI
//! status from observable signals, and tears containers down by draining
//! their cgroup.

pub mod cgroup;
pub mod container;
pub mod context;
pub mod devices;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod oci_spec;
pub mod runtime;
pub mod seccomp;
pub mod state;
pub mod translator;

pub use container::{Container, ContainerConfig, ContainerConfigBuilder};
pub use context::Context;
pub use error::{chain, Error, Result};
pub use runtime::{Features, FeaturesBuilder, Runtime, RuntimeBuilder};
pub use state::{ContainerStatus, State};
