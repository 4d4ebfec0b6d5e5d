//! Error handling helpers and primitives.

use crate::state::ContainerStatus;
use strum::{AsRefStr, Display};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(AsRefStr, Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "kebab_case")]
/// Host preconditions verified once by `Runtime::init`.
pub enum Precondition {
    /// `/proc` is not a `proc` filesystem.
    ProcFilesystem,

    /// The cgroup root is not a unified `cgroup2` hierarchy.
    CgroupRoot,

    /// A libexec program is missing or not executable.
    LibexecProgram,

    /// The engine library is older than the supported floor.
    EngineVersion,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("host precondition failed ({kind}): {message}")]
    PreconditionFailed {
        kind: Precondition,
        message: String,
    },

    #[error("container {0} does not exist")]
    NotExist(String),

    #[error("cannot {operation} container in status {status}")]
    IllegalState {
        operation: &'static str,
        status: ContainerStatus,
    },

    #[error("engine failure: {0}")]
    Engine(String),

    #[error("deadline exceeded while {0}")]
    Timeout(&'static str),

    #[error(transparent)]
    System(#[from] anyhow::Error),
}

impl Error {
    pub fn invalid_config<T: Into<String>>(message: T) -> Self {
        Error::InvalidConfig(message.into())
    }

    pub fn precondition<T: Into<String>>(kind: Precondition, message: T) -> Self {
        Error::PreconditionFailed {
            kind,
            message: message.into(),
        }
    }

    pub fn engine<T: Into<String>>(message: T) -> Self {
        Error::Engine(message.into())
    }

    /// CLI exit code for this error: invalid arguments are `2`, everything
    /// else is a runtime error `1`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidConfig(_) => 2,
            _ => 1,
        }
    }
}

/// Chain creates a string from an error stack.
pub fn chain(res: anyhow::Error) -> String {
    res.chain()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}
