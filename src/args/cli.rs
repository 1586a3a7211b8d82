use clap::{Parser, ValueEnum};
use std::time::Duration;

use super::parsers::parse_duration_arg;

/// How tokens are released inside each second when an RPS ceiling is set.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum HatchType {
    /// The full per-second allowance is released at the start of the second.
    Asap,
    /// The allowance is released in ten even slices across the second.
    Smooth,
}

#[derive(Debug, Parser, Clone)]
#[clap(
    version,
    about = "Load-generation worker: hatches weighted virtual users on command from a master and reports aggregated request statistics upstream."
)]
pub struct WorkerArgs {
    /// Host or IP address of the master
    #[arg(long = "master-host", default_value = "127.0.0.1")]
    pub master_host: String,

    /// Port the master listens on
    #[arg(long = "master-port", default_value_t = 5557)]
    pub master_port: u16,

    /// Max requests per second across all virtual users (0 disables the limit)
    #[arg(long = "max-rps", default_value_t = 0)]
    pub max_rps: i64,

    /// Warm-up ramp for the RPS ceiling: 'N' (per second) or 'N/duration'; '-1' disables
    #[arg(long = "request-increase-rate", default_value = "-1")]
    pub request_increase_rate: String,

    /// Token release pattern within each second
    #[arg(long = "hatch-type", default_value = "asap", ignore_case = true)]
    pub hatch_type: HatchType,

    /// Run the named tasks once inline (comma-separated) without connecting to the master
    #[arg(long = "run-tasks", default_value = "")]
    pub run_tasks: String,

    /// Write periodic memory samples to this path
    #[arg(long = "mem-profile")]
    pub mem_profile: Option<String>,

    /// How long to sample memory (supports ms/s/m/h)
    #[arg(long = "mem-profile-duration", default_value = "30s", value_parser = parse_duration_arg)]
    pub mem_profile_duration: Duration,

    /// Write periodic CPU-time samples to this path
    #[arg(long = "cpu-profile")]
    pub cpu_profile: Option<String>,

    /// How long to sample CPU time (supports ms/s/m/h)
    #[arg(long = "cpu-profile-duration", default_value = "30s", value_parser = parse_duration_arg)]
    pub cpu_profile_duration: Duration,
}

impl Default for WorkerArgs {
    fn default() -> Self {
        Self {
            master_host: "127.0.0.1".to_owned(),
            master_port: 5557,
            max_rps: 0,
            request_increase_rate: "-1".to_owned(),
            hatch_type: HatchType::Asap,
            run_tasks: String::new(),
            mem_profile: None,
            mem_profile_duration: Duration::from_secs(30),
            cpu_profile: None,
            cpu_profile_duration: Duration::from_secs(30),
        }
    }
}
