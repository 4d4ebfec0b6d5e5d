//! OCI runtime command line: `create`, `start`, `kill`, `delete`, `state`
//! and `list`. Exit codes: 0 on success, 1 on runtime errors, 2 on invalid
//! arguments.

use clap::{crate_name, Parser, Subcommand};
use log::{error, warn};
use lxcri::{
    cgroup::parse_signal,
    chain,
    oci_spec::Spec,
    Container, ContainerConfigBuilder, Context, Error, FeaturesBuilder, Result, RuntimeBuilder,
};
use std::{env, path::PathBuf, process::exit, time::Duration};

#[derive(Parser)]
#[clap(
    name = "lxcri",
    version,
    about = "OCI container runtime on top of a low-level Linux container engine"
)]
struct Cli {
    #[clap(
        long,
        global(true),
        default_value("/run/lxcri"),
        env("LXCRI_ROOT"),
        value_name("DIR")
    )]
    /// Root directory for container runtime state
    root: PathBuf,

    #[clap(
        long,
        global(true),
        default_value("/usr/libexec/lxcri"),
        env("LXCRI_LIBEXEC"),
        value_name("DIR")
    )]
    /// Directory of the monitor, init and hook programs
    libexec: PathBuf,

    #[clap(
        long,
        global(true),
        default_value("info"),
        env("LXCRI_LOG_LEVEL"),
        value_name("LEVEL")
    )]
    /// The logging level of the runtime and the engine (trace..off)
    log_level: log::LevelFilter,

    #[clap(long, global(true), env("LXCRI_LOG_FILE"), value_name("FILE"))]
    /// Engine log destination, defaults to engine.log in the runtime dir
    log_file: Option<PathBuf>,

    #[clap(
        long,
        global(true),
        default_value("lxcri-monitor"),
        env("LXCRI_MONITOR_CGROUP"),
        value_name("CGROUP")
    )]
    /// Cgroup that collects the monitor processes
    monitor_cgroup: String,

    #[clap(long, global(true))]
    /// Interpret cgroupsPath as a systemd encoded slice:prefix:name
    systemd_cgroup: bool,

    #[clap(long, global(true))]
    /// Do not apply seccomp profiles
    disable_seccomp: bool,

    #[clap(long, global(true))]
    /// Do not restrict capabilities
    disable_capabilities: bool,

    #[clap(long, global(true))]
    /// Do not apply apparmor profiles
    disable_apparmor: bool,

    #[clap(long, global(true))]
    /// Do not configure the device cgroup controller
    disable_cgroup_devices: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a container from an OCI bundle
    Create {
        /// Container identifier
        id: String,

        #[clap(long, default_value("."), value_name("DIR"))]
        /// Path to the OCI bundle
        bundle: PathBuf,

        #[clap(long, value_name("SOCKET"))]
        /// Unix socket that receives the console PTY master
        console_socket: Option<PathBuf>,

        #[clap(long, value_name("FILE"))]
        /// Write the container init PID to this file
        pid_file: Option<PathBuf>,

        #[clap(long, default_value("60"), value_name("SECONDS"))]
        /// Abort creation after this deadline
        timeout: u64,
    },

    /// Execute the user defined process in a created container
    Start {
        /// Container identifier
        id: String,

        #[clap(long, default_value("30"), value_name("SECONDS"))]
        /// Abort starting after this deadline
        timeout: u64,
    },

    /// Send a signal to all processes in the container cgroup
    Kill {
        /// Container identifier
        id: String,

        #[clap(default_value("SIGTERM"))]
        /// Signal name (TERM, SIGTERM) or number (15)
        signal: String,
    },

    /// Delete a container and its runtime directory
    Delete {
        /// Container identifier
        id: String,

        #[clap(long)]
        /// SIGKILL and drain the cgroup if the container is not stopped
        force: bool,

        #[clap(long, default_value("10"), value_name("SECONDS"))]
        /// Abort cgroup draining after this deadline
        timeout: u64,
    },

    /// Output the OCI state of a container
    State {
        /// Container identifier
        id: String,
    },

    /// List the containers below the runtime root
    List,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(e) = run(cli).await {
        let code = e.exit_code();
        error!("{}", chain(e.into()));
        exit(code);
    }
}

/// Initialize the logger and set the verbosity to the provided level.
fn init_logging(cli: &Cli) {
    env::set_var(
        "RUST_LOG",
        format!("{}={}", crate_name!(), cli.log_level),
    );
    let _ = env_logger::try_init();
}

async fn run(cli: Cli) -> Result<()> {
    let features = FeaturesBuilder::default()
        .seccomp(!cli.disable_seccomp)
        .capabilities(!cli.disable_capabilities)
        .apparmor(!cli.disable_apparmor)
        .cgroup_devices(!cli.disable_cgroup_devices)
        .build()
        .map_err(|e| Error::invalid_config(e.to_string()))?;

    let mut runtime = RuntimeBuilder::default()
        .root(cli.root.clone())
        .libexec(cli.libexec.clone())
        .features(features)
        .monitor_cgroup(cli.monitor_cgroup.clone())
        .build()
        .map_err(|e| Error::invalid_config(e.to_string()))?;
    runtime.init().await?;

    match cli.command {
        Command::Create {
            id,
            bundle,
            console_socket,
            pid_file,
            timeout,
        } => {
            let spec = Spec::load(&bundle.join("config.json"))?;
            let mut builder = ContainerConfigBuilder::default()
                .id(id.clone())
                .bundle(bundle)
                .spec(spec)
                .systemd_cgroup(cli.systemd_cgroup)
                .log_level(cli.log_level);
            if let Some(log_file) = cli.log_file.clone() {
                builder = builder.log_file(log_file);
            }
            if let Some(console_socket) = console_socket {
                builder = builder.console_socket(console_socket);
            }
            let config = builder
                .build()
                .map_err(|e| Error::invalid_config(e.to_string()))?;

            let ctx = Context::with_timeout(Duration::from_secs(timeout));
            match runtime.create(&ctx, config).await {
                Ok(container) => {
                    if let Some(pid_file) = pid_file {
                        write_pid_file(&container, &pid_file).await?;
                    }
                    Ok(())
                }
                Err(e) => {
                    // Partial progress is always cleanable by a forced delete.
                    let cleanup = Context::with_timeout(Duration::from_secs(10));
                    if let Err(cleanup_err) = runtime.delete(&cleanup, &id, true).await {
                        warn!(
                            "cleanup of failed container {} failed too: {}",
                            id, cleanup_err
                        );
                    }
                    Err(e)
                }
            }
        }

        Command::Start { id, timeout } => {
            let mut container = runtime.load(&id)?;
            let ctx = Context::with_timeout(Duration::from_secs(timeout));
            runtime.start(&ctx, &mut container).await
        }

        Command::Kill { id, signal } => {
            let signal = parse_signal(&signal)?;
            let mut container = runtime.load(&id)?;
            runtime.kill(&Context::new(), &mut container, signal).await
        }

        Command::Delete { id, force, timeout } => {
            let ctx = Context::with_timeout(Duration::from_secs(timeout));
            runtime.delete(&ctx, &id, force).await
        }

        Command::State { id } => {
            let state = runtime.state(&id).await?;
            let rendered = serde_json::to_string_pretty(&state)
                .map_err(|e| Error::System(anyhow::Error::new(e).context("serialize state")))?;
            println!("{}", rendered);
            Ok(())
        }

        Command::List => {
            for id in runtime.list()? {
                println!("{}", id);
            }
            Ok(())
        }
    }
}

async fn write_pid_file(container: &Container, path: &PathBuf) -> Result<()> {
    let pid = container
        .init_pid()
        .await?
        .ok_or_else(|| Error::engine("created container has no init pid"))?;
    std::fs::write(path, pid.to_string()).map_err(|e| {
        Error::System(anyhow::Error::new(e).context(format!("write pid file {}", path.display())))
    })?;
    Ok(())
}
