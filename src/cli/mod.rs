//! CLI argument parsing and command dispatch

mod commands;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use swarm_core::Profile;

pub use commands::dispatch;

#[derive(Parser, Debug)]
#[command(name = "swarm")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Coordinate workers and aggregate their stats
    Master(MasterArgs),
    /// Run users on behalf of a master
    Worker(WorkerArgs),
    /// Run users in this process
    Local(LocalArgs),
}

#[derive(Args, Debug)]
pub struct MasterArgs {
    /// Address to listen on for workers
    #[arg(long, env = "SWARM_BIND", default_value = "0.0.0.0:5557")]
    pub bind: SocketAddr,

    /// Token workers must present
    #[arg(long, env = "SWARM_TOKEN")]
    pub token: Option<String>,

    /// Start once this many workers are connected
    #[arg(long, default_value_t = 1)]
    pub expect_workers: usize,

    /// Seconds to wait for the expected workers before starting anyway
    #[arg(long, default_value_t = 120)]
    pub expect_workers_max_wait: u64,

    #[command(flatten)]
    pub profile: ProfileArgs,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Master address
    #[arg(long, env = "SWARM_MASTER", default_value = "127.0.0.1:5557")]
    pub master: SocketAddr,

    /// Token presented to the master
    #[arg(long, env = "SWARM_TOKEN")]
    pub token: Option<String>,

    /// Node id; generated when absent
    #[arg(long, env = "SWARM_NODE_ID")]
    pub node_id: Option<String>,

    /// Stay up after the master quits and wait for it to return
    #[arg(long)]
    pub ignore_quit: bool,
}

#[derive(Args, Debug)]
pub struct LocalArgs {
    #[command(flatten)]
    pub profile: ProfileArgs,

    #[command(flatten)]
    pub output: OutputArgs,
}

/// Run profile, from a file and/or flags (flags win)
#[derive(Args, Debug, Default)]
pub struct ProfileArgs {
    /// JSON profile file
    #[arg(long)]
    pub profile: Option<PathBuf>,

    /// Target number of users
    #[arg(short = 'c', long)]
    pub spawn_count: Option<i64>,

    /// Users started per second
    #[arg(short = 'r', long)]
    pub spawn_rate: Option<f64>,

    /// Stop after this many seconds
    #[arg(short = 't', long)]
    pub run_time: Option<i64>,

    /// Cap on requests per second
    #[arg(long)]
    pub max_rps: Option<i64>,

    /// Stop after this many task invocations in total
    #[arg(long)]
    pub loop_count: Option<i64>,

    /// Ramp the request cap up: "N" or "N/<duration>"
    #[arg(long)]
    pub request_increase_rate: Option<String>,

    /// JSON task definitions; the built-in demo tasks when absent
    #[arg(long)]
    pub tasks: Option<PathBuf>,
}

impl ProfileArgs {
    /// Build the profile: file first, then flag overrides
    pub fn resolve(&self) -> Result<Profile> {
        let mut profile = match &self.profile {
            Some(path) => Profile::from_file(path)
                .with_context(|| format!("failed to load profile {}", path.display()))?,
            None => Profile::default(),
        };
        if let Some(spawn_count) = self.spawn_count {
            profile.spawn_count = spawn_count;
        }
        if let Some(spawn_rate) = self.spawn_rate {
            profile.spawn_rate = spawn_rate;
        }
        if let Some(run_time) = self.run_time {
            profile.run_time = run_time;
        }
        if let Some(max_rps) = self.max_rps {
            profile.max_rps = max_rps;
        }
        if let Some(loop_count) = self.loop_count {
            profile.loop_count = loop_count;
        }
        if let Some(rate) = &self.request_increase_rate {
            profile.request_increase_rate = rate.clone();
        }
        profile.validate().context("invalid profile")?;
        Ok(profile)
    }
}

#[derive(Args, Debug, Default)]
pub struct OutputArgs {
    /// Append every report to this JSON-lines file
    #[arg(long)]
    pub json_output: Option<PathBuf>,

    /// Do not print report tables
    #[arg(long)]
    pub no_console: bool,
}
