//! Interface to the low-level container engine.
//!
//! The engine is the library that actually creates namespaces, applies
//! cgroup limits, mounts the rootfs and spawns the container init. This
//! runtime only ever talks to it through two narrow seams: a typed record
//! of configuration items written to the engine-native config file, and a
//! state/pid query. The query goes through the engine's `lxc-info` tool so
//! the whole surface stays mockable in tests.

use crate::error::{Error, Result};
use anyhow::Context;
use async_trait::async_trait;
use derive_builder::Builder;
use dyn_clone::{clone_trait_object, DynClone};
use getset::{Getters, Setters};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug},
    fs,
    path::{Path, PathBuf},
    process::Output,
    str::FromStr,
};
use tokio::process::Command;

/// Engine versions below this floor are rejected by `Runtime::init`.
pub const MIN_ENGINE_VERSION: Version = Version {
    major: 4,
    minor: 0,
    patch: 5,
};

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
/// Engine library version, ordered by (major, minor, patch).
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        fn component(part: Option<&str>) -> u32 {
            // Tolerate distribution suffixes like "12-0ubuntu1".
            part.unwrap_or("0")
                .chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>()
                .parse()
                .unwrap_or(0)
        }

        let mut parts = s.trim().splitn(3, '.');
        let major = parts
            .next()
            .filter(|p| p.chars().next().map_or(false, |c| c.is_ascii_digit()))
            .ok_or_else(|| Error::engine(format!("unparsable engine version {:?}", s)))?
            .chars()
            .take_while(char::is_ascii_digit)
            .collect::<String>()
            .parse()
            .map_err(|_| Error::engine(format!("unparsable engine version {:?}", s)))?;

        Ok(Version {
            major,
            minor: component(parts.next()),
            patch: component(parts.next()),
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
/// A single key/value setting for the engine, e.g. `rootfs.path`.
pub struct ConfigItem {
    key: String,
    value: String,
}

impl ConfigItem {
    pub fn new<K: Into<String>, V: Into<String>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for ConfigItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.key, self.value)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
/// Container state as reported by the engine.
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Aborting,
    Freezing,
    Frozen,
    Thawed,
    /// Any state string this runtime does not know.
    Unknown(String),
}

impl From<&str> for EngineState {
    fn from(s: &str) -> Self {
        match s.trim() {
            "STOPPED" => EngineState::Stopped,
            "STARTING" => EngineState::Starting,
            "RUNNING" => EngineState::Running,
            "STOPPING" => EngineState::Stopping,
            "ABORTING" => EngineState::Aborting,
            "FREEZING" => EngineState::Freezing,
            "FROZEN" => EngineState::Frozen,
            "THAWED" => EngineState::Thawed,
            other => EngineState::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Stopped => write!(f, "STOPPED"),
            EngineState::Starting => write!(f, "STARTING"),
            EngineState::Running => write!(f, "RUNNING"),
            EngineState::Stopping => write!(f, "STOPPING"),
            EngineState::Aborting => write!(f, "ABORTING"),
            EngineState::Freezing => write!(f, "FREEZING"),
            EngineState::Frozen => write!(f, "FROZEN"),
            EngineState::Thawed => write!(f, "THAWED"),
            EngineState::Unknown(s) => write!(f, "{}", s),
        }
    }
}

#[async_trait]
/// Factory for engine container handles.
pub trait Engine: Debug + DynClone + Send + Sync {
    /// Version of the engine library on this host.
    async fn version(&self) -> Result<Version>;

    /// A handle for the container `id` whose engine config lives in `rundir`.
    /// `root` is the engine's container search path, i.e. the runtime root.
    fn container(&self, id: &str, root: &Path, rundir: &Path) -> Result<Box<dyn EngineContainer>>;
}

clone_trait_object!(Engine);

#[async_trait]
/// Per-container engine handle.
///
/// The handle is owned by the `Container` for the whole lifecycle and must
/// be released explicitly on delete; there is no implicit finalizer.
pub trait EngineContainer: Debug + Send + Sync {
    /// Path of the engine-native config file.
    fn config_file(&self) -> &Path;

    /// Stage configuration items in order. Every item must be accepted.
    fn apply(&mut self, items: &[ConfigItem]) -> Result<()>;

    /// Write the staged configuration to the engine-native config file.
    fn save(&self) -> Result<()>;

    /// Current engine state of the container.
    async fn state(&self) -> Result<EngineState>;

    /// PID of the container init process, if any.
    async fn init_pid(&self) -> Result<Option<i32>>;

    /// Release the engine resources held by this handle.
    fn release(&mut self) -> Result<()>;
}

#[derive(Clone, Default, Debug)]
/// DefaultExecCommand is a wrapper which can be used to execute the engine
/// query tool in a standard way.
struct DefaultExecCommand;

impl ExecCommand for DefaultExecCommand {}

#[async_trait]
trait ExecCommand: Debug + DynClone + Send + Sync {
    /// Run a command and return its `Output`.
    async fn run_output(&self, binary: &Path, args: &[String]) -> Result<Output> {
        Ok(Command::new(binary)
            .args(args)
            .output()
            .await
            .context("run engine query tool")?)
    }
}

clone_trait_object!(ExecCommand);

#[derive(Builder, Clone, Debug, Getters, Setters)]
#[builder(pattern = "owned", setter(into))]
/// Engine implementation backed by the engine's command line query tool.
pub struct CommandEngine {
    #[getset(get, set)]
    #[builder(private, default = "Box::new(DefaultExecCommand)")]
    /// The executor for engine queries.
    exec: Box<dyn ExecCommand>,

    #[get]
    #[builder(default = "PathBuf::from(\"lxc-info\")")]
    /// Path to the engine query binary.
    binary: PathBuf,
}

impl Default for CommandEngine {
    fn default() -> Self {
        Self {
            exec: Box::new(DefaultExecCommand),
            binary: PathBuf::from("lxc-info"),
        }
    }
}

#[async_trait]
impl Engine for CommandEngine {
    async fn version(&self) -> Result<Version> {
        let output = self
            .exec
            .run_output(&self.binary, &["--version".to_string()])
            .await?;
        if !output.status.success() {
            return Err(Error::engine(format!(
                "engine version query failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        // The tool prints a single line ending in the version number.
        stdout
            .split_whitespace()
            .last()
            .unwrap_or("")
            .parse()
    }

    fn container(&self, id: &str, root: &Path, rundir: &Path) -> Result<Box<dyn EngineContainer>> {
        Ok(Box::new(CommandContainer {
            exec: self.exec.clone(),
            binary: self.binary.clone(),
            id: id.to_string(),
            root: root.to_path_buf(),
            config_file: rundir.join(crate::container::ENGINE_CONFIG_FILE),
            staged: Vec::new(),
        }))
    }
}

#[derive(Clone, Debug)]
struct CommandContainer {
    exec: Box<dyn ExecCommand>,
    binary: PathBuf,
    id: String,
    root: PathBuf,
    config_file: PathBuf,
    staged: Vec<ConfigItem>,
}

impl CommandContainer {
    fn query_args(&self, selector: &str) -> Vec<String> {
        vec![
            "-P".to_string(),
            self.root.display().to_string(),
            "-n".to_string(),
            self.id.clone(),
            selector.to_string(),
        ]
    }
}

#[async_trait]
impl EngineContainer for CommandContainer {
    fn config_file(&self) -> &Path {
        &self.config_file
    }

    fn apply(&mut self, items: &[ConfigItem]) -> Result<()> {
        for item in items {
            if item.key().is_empty() {
                return Err(Error::engine(format!(
                    "refusing config item with empty key (value {:?})",
                    item.value()
                )));
            }
            self.staged.push(item.clone());
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let mut rendered = String::new();
        for item in &self.staged {
            rendered.push_str(&item.to_string());
            rendered.push('\n');
        }
        fs::write(&self.config_file, rendered).with_context(|| {
            format!("write engine config {}", self.config_file.display())
        })?;
        Ok(())
    }

    async fn state(&self) -> Result<EngineState> {
        let output = self
            .exec
            .run_output(&self.binary, &self.query_args("-sH"))
            .await?;
        if !output.status.success() {
            // A defined but never started container has no engine state yet.
            return Ok(EngineState::Stopped);
        }
        Ok(EngineState::from(
            String::from_utf8_lossy(&output.stdout).as_ref(),
        ))
    }

    async fn init_pid(&self) -> Result<Option<i32>> {
        let output = self
            .exec
            .run_output(&self.binary, &self.query_args("-pH"))
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let pid = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<i32>()
            .unwrap_or(-1);
        Ok(if pid > 0 { Some(pid) } else { None })
    }

    fn release(&mut self) -> Result<()> {
        self.staged.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::{os::unix::process::ExitStatusExt, process::ExitStatus};

    #[derive(Clone, Debug)]
    struct MockExecCommand(Output);

    #[async_trait]
    impl ExecCommand for MockExecCommand {
        async fn run_output(&self, _binary: &Path, _args: &[String]) -> super::Result<Output> {
            Ok(self.0.clone())
        }
    }

    fn engine_with_stdout(stdout: &str) -> CommandEngine {
        let mut engine = CommandEngine::default();
        engine.set_exec(Box::new(MockExecCommand(Output {
            status: ExitStatus::from_raw(0),
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        })));
        engine
    }

    #[test]
    fn version_ordering() -> Result<()> {
        assert!(Version::from_str("4.0.5")? >= MIN_ENGINE_VERSION);
        assert!(Version::from_str("4.1.0")? >= MIN_ENGINE_VERSION);
        assert!(Version::from_str("5.0.0-rc1")? >= MIN_ENGINE_VERSION);
        assert!(Version::from_str("4.0.4")? < MIN_ENGINE_VERSION);
        assert!(Version::from_str("3.2.9")? < MIN_ENGINE_VERSION);
        assert!(Version::from_str("garbage").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn version_takes_last_token() -> Result<()> {
        let engine = engine_with_stdout("lxc-info version 4.0.12\n");
        assert_eq!(
            engine.version().await?,
            Version {
                major: 4,
                minor: 0,
                patch: 12
            }
        );
        Ok(())
    }

    #[test]
    fn engine_state_parsing() {
        assert_eq!(EngineState::from("RUNNING\n"), EngineState::Running);
        assert_eq!(EngineState::from("STOPPED"), EngineState::Stopped);
        assert_eq!(
            EngineState::from("SOMETHING"),
            EngineState::Unknown("SOMETHING".to_string())
        );
        assert_eq!(EngineState::Frozen.to_string(), "FROZEN");
    }

    #[tokio::test]
    async fn container_state_query() -> Result<()> {
        let engine = engine_with_stdout("FROZEN\n");
        let dir = tempfile::tempdir()?;
        let container = engine.container("c1", dir.path(), &dir.path().join("c1"))?;
        assert_eq!(container.state().await?, EngineState::Frozen);
        Ok(())
    }

    #[tokio::test]
    async fn container_init_pid_query() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let engine = engine_with_stdout("1234\n");
        let container = engine.container("c1", dir.path(), &dir.path().join("c1"))?;
        assert_eq!(container.init_pid().await?, Some(1234));

        let engine = engine_with_stdout("-1\n");
        let container = engine.container("c1", dir.path(), &dir.path().join("c1"))?;
        assert_eq!(container.init_pid().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn config_is_written_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let rundir = dir.path().join("c1");
        std::fs::create_dir(&rundir)?;

        let engine = CommandEngine::default();
        let mut container = engine.container("c1", dir.path(), &rundir)?;
        container.apply(&[
            ConfigItem::new("rootfs.path", "/var/lib/c1/rootfs"),
            ConfigItem::new("rootfs.managed", "0"),
        ])?;
        container.save()?;

        let written = std::fs::read_to_string(container.config_file())?;
        assert_eq!(
            written,
            "rootfs.path = /var/lib/c1/rootfs\nrootfs.managed = 0\n"
        );
        Ok(())
    }

    #[test]
    fn empty_key_is_refused() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = CommandEngine::default();
        let mut container = engine.container("c1", dir.path(), &dir.path().join("c1"))?;
        assert!(container.apply(&[ConfigItem::new("", "x")]).is_err());
        Ok(())
    }
}
