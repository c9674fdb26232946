//! idlesync-sim: drive several session instances against one shared store.
//!
//! ## Subcommands
//!
//! - `simulate`: Runs N instances on a simulated clock and prints every
//!   session event as a JSON line
//! - `inspect`: Dumps the records persisted in a state directory
//! - `check-config`: Validates a TOML config patch

mod check_config;
mod error;
mod inspect;
mod logging;
mod simulate;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use idlesync_core::protocol::SyncMode;

use crate::simulate::InstanceAt;

#[derive(Parser)]
#[command(name = "idlesync-sim")]
#[command(about = "Session idle-timeout sync simulator")]
#[command(version)]
struct Cli {
    /// Also write logs to a daily-rotated file in this directory
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Leader,
    Distributed,
}

impl From<ModeArg> for SyncMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Leader => SyncMode::Leader,
            ModeArg::Distributed => SyncMode::Distributed,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run instances on a simulated clock and print events as JSON lines
    Simulate {
        /// Number of instances (named tab-1 .. tab-N)
        #[arg(long, default_value_t = 2)]
        instances: usize,

        #[arg(long, value_enum, default_value_t = ModeArg::Leader)]
        mode: ModeArg,

        /// Simulated milliseconds per step
        #[arg(long, default_value_t = 250)]
        step: u64,

        /// Total simulated milliseconds
        #[arg(long, default_value_t = 300_000)]
        duration: u64,

        /// Simulated start time in epoch milliseconds
        #[arg(long, default_value_t = 0)]
        start_at: i64,

        /// User activity on an instance, e.g. tab-2@1500
        #[arg(long, value_name = "INSTANCE@MS")]
        activity: Vec<InstanceAt>,

        /// Manual extend on an instance
        #[arg(long, value_name = "INSTANCE@MS")]
        extend: Vec<InstanceAt>,

        /// Immediate expiry on an instance
        #[arg(long, value_name = "INSTANCE@MS")]
        expire: Vec<InstanceAt>,

        /// Stop ticking an instance without closing it (frozen tab)
        #[arg(long, value_name = "INSTANCE@MS")]
        freeze: Vec<InstanceAt>,

        /// Shut an instance down (closed tab)
        #[arg(long, value_name = "INSTANCE@MS")]
        shutdown: Vec<InstanceAt>,

        /// Disable the broadcast channel so messages ride on storage events
        #[arg(long)]
        no_broadcast: bool,

        /// Persist to files in this directory instead of memory
        #[arg(long, value_name = "DIR")]
        state_dir: Option<PathBuf>,

        /// TOML config patch (camelCase keys)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Print the records persisted in a state directory
    Inspect {
        /// Defaults to the platform data directory
        #[arg(long, value_name = "DIR")]
        state_dir: Option<PathBuf>,

        #[arg(long, default_value = idlesync_core::protocol::DEFAULT_STORAGE_KEY_PREFIX)]
        prefix: String,
    },

    /// Validate a TOML config patch and print the effective config
    CheckConfig {
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Exit non-zero when any field was rejected
        #[arg(long)]
        strict: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    let _logging_guard = logging::init(cli.log_dir.as_deref());

    let result = match cli.command {
        Commands::Simulate {
            instances,
            mode,
            step,
            duration,
            start_at,
            activity,
            extend,
            expire,
            freeze,
            shutdown,
            no_broadcast,
            state_dir,
            config,
        } => simulate::run(simulate::SimulateOptions {
            instances,
            mode: mode.into(),
            step_ms: step,
            duration_ms: duration,
            start_at,
            script: simulate::Script {
                activity,
                extend,
                expire,
                freeze,
                shutdown,
            },
            broadcast: !no_broadcast,
            state_dir,
            config,
        }),
        Commands::Inspect { state_dir, prefix } => inspect::run(state_dir, &prefix),
        Commands::CheckConfig { path, strict } => check_config::run(&path, strict),
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "idlesync-sim failed");
        std::process::exit(1);
    }
}
