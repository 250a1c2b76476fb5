//! Run profile and node configuration

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SwarmError, SwarmResult};
use crate::rate_limiter::parse_ramp_up_rate;

/// Interval between worker heartbeats
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Heartbeats a worker may miss before the master marks it missing
pub const HEARTBEAT_LIVENESS: i32 = 3;

/// Interval of the master's aggregate state machine
pub const STATE_MACHINE_INTERVAL: Duration = Duration::from_secs(1);

/// Deadline for the register and sign-out calls
pub const CONTROL_RPC_TIMEOUT: Duration = Duration::from_secs(1);

/// Deadline for the task-discovery poller to hand over a payload
pub const TASK_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive send failures after which a worker considers itself missing
pub const MAX_SEND_FAILURES: u32 = 3;

/// Value of `request_increase_rate` that disables ramp-up rate limiting
pub const RAMP_UP_DISABLED: &str = "-1";

/// Serializable run configuration
///
/// A profile is the single unit of configuration sent from master to
/// worker. It is cloned for every worker, never shared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Profile {
    /// Target number of concurrent users
    pub spawn_count: i64,

    /// Users started per second while ramping
    pub spawn_rate: f64,

    /// Run duration in seconds; zero or negative runs until stopped
    pub run_time: i64,

    /// Requests per second cap; zero or negative is unbounded
    pub max_rps: i64,

    /// Total task invocations across all users; zero or negative is unbounded
    pub loop_count: i64,

    /// Ramp-up rate for the request limiter, `"N"` or `"N/<duration>"`;
    /// `"-1"` disables ramp-up
    pub request_increase_rate: String,

    /// Skip the console table output
    pub disable_console_output: bool,

    /// Hint for task factories: disable response compression
    pub disable_compression: bool,

    /// Hint for task factories: disable connection reuse
    pub disable_keepalive: bool,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            spawn_count: 1,
            spawn_rate: 1.0,
            run_time: 0,
            max_rps: -1,
            loop_count: -1,
            request_increase_rate: RAMP_UP_DISABLED.to_string(),
            disable_console_output: false,
            disable_compression: false,
            disable_keepalive: false,
        }
    }
}

impl Profile {
    /// Create a profile with the given spawn count and rate
    pub fn new(spawn_count: i64, spawn_rate: f64) -> Self {
        Self {
            spawn_count,
            spawn_rate,
            ..Default::default()
        }
    }

    /// Load a profile from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> SwarmResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let profile: Profile = serde_json::from_str(&raw)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Set the run time in seconds
    pub fn with_run_time(mut self, seconds: i64) -> Self {
        self.run_time = seconds;
        self
    }

    /// Set the requests-per-second cap
    pub fn with_max_rps(mut self, max_rps: i64) -> Self {
        self.max_rps = max_rps;
        self
    }

    /// Set the total loop count
    pub fn with_loop_count(mut self, loop_count: i64) -> Self {
        self.loop_count = loop_count;
        self
    }

    /// Set the request ramp-up rate
    pub fn with_request_increase_rate(mut self, rate: impl Into<String>) -> Self {
        self.request_increase_rate = rate.into();
        self
    }

    /// Run duration, if bounded
    pub fn run_time(&self) -> Option<Duration> {
        (self.run_time > 0).then(|| Duration::from_secs(self.run_time as u64))
    }

    /// Requests-per-second cap, if bounded
    pub fn max_rps(&self) -> Option<i64> {
        (self.max_rps > 0).then_some(self.max_rps)
    }

    /// Total loop count, if bounded
    pub fn loop_count(&self) -> Option<i64> {
        (self.loop_count > 0).then_some(self.loop_count)
    }

    /// Whether request ramp-up limiting is configured
    pub fn ramp_up_enabled(&self) -> bool {
        self.request_increase_rate != RAMP_UP_DISABLED
    }

    /// Validate the profile
    pub fn validate(&self) -> SwarmResult<()> {
        if self.spawn_count <= 0 {
            return Err(SwarmError::config("spawn count must be at least 1"));
        }
        if self.spawn_rate.is_nan() || self.spawn_rate <= 0.0 {
            return Err(SwarmError::config("spawn rate must be positive"));
        }
        if self.ramp_up_enabled() {
            parse_ramp_up_rate(&self.request_increase_rate)?;
        }
        Ok(())
    }

    /// Split this profile into one profile per worker
    ///
    /// Spawn count, max RPS and loop count are divided with the remainder
    /// spread over the last workers; the spawn rate is divided evenly and
    /// floored at 1 so the aggregate ramp matches the request. Bounded
    /// limits never split below 1, since 0 would mean unbounded; the sum is
    /// exact only while the limit is at least `workers`, which the master
    /// checks before it distributes a profile.
    pub fn split(&self, workers: usize) -> Vec<Profile> {
        if workers == 0 {
            return Vec::new();
        }
        let spawn_counts = split_integer(self.spawn_count, workers);
        let max_rps = split_limit(self.max_rps, workers);
        let loop_counts = split_limit(self.loop_count, workers);
        let spawn_rate = (self.spawn_rate / workers as f64).max(1.0);

        (0..workers)
            .map(|i| Profile {
                spawn_count: spawn_counts[i],
                spawn_rate,
                max_rps: max_rps[i],
                loop_count: loop_counts[i],
                ..self.clone()
            })
            .collect()
    }
}

/// Split `total` into `parts` integers that differ by at most one
///
/// The remainder goes to the last entries: `split_integer(10, 3)` is
/// `[3, 3, 4]`.
pub fn split_integer(total: i64, parts: usize) -> Vec<i64> {
    if parts == 0 {
        return Vec::new();
    }
    let n = parts as i64;
    let quotient = total.div_euclid(n);
    let remainder = total.rem_euclid(n) as usize;
    let mut out = vec![quotient; parts - remainder];
    out.extend(std::iter::repeat(quotient + 1).take(remainder));
    out
}

fn split_limit(total: i64, parts: usize) -> Vec<i64> {
    if total <= 0 {
        return vec![total; parts];
    }
    split_integer(total, parts)
        .into_iter()
        .map(|v| v.max(1))
        .collect()
}

/// Master node configuration
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Address the control server listens on
    pub bind: SocketAddr,

    /// Bearer token workers must present
    pub token: Option<String>,

    /// Start automatically once this many workers are connected
    pub expect_workers: Option<usize>,

    /// Longest wait for `expect_workers` before starting with what is there
    pub expect_workers_max_wait: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5557)),
            token: None,
            expect_workers: None,
            expect_workers_max_wait: Duration::from_secs(120),
        }
    }
}

/// Worker node configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Master control server address
    pub master: SocketAddr,

    /// Bearer token presented to the master
    pub token: Option<String>,

    /// Node identifier; generated from hostname and a UUID when absent
    pub node_id: Option<String>,

    /// Keep running after a `quit` from the master and wait for it to return
    pub ignore_quit: bool,
}

impl WorkerConfig {
    /// Create a worker config pointing at `master`
    pub fn new(master: SocketAddr) -> Self {
        Self {
            master,
            token: None,
            node_id: None,
            ignore_quit: false,
        }
    }

    /// Set the bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the node identifier
    pub fn with_node_id(mut self, id: impl Into<String>) -> Self {
        self.node_id = Some(id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profile() {
        let profile = Profile::default();
        assert_eq!(profile.spawn_count, 1);
        assert_eq!(profile.max_rps(), None);
        assert_eq!(profile.loop_count(), None);
        assert_eq!(profile.run_time(), None);
        assert!(!profile.ramp_up_enabled());
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn test_profile_validation() {
        assert!(Profile::new(0, 1.0).validate().is_err());
        assert!(Profile::new(1, 0.0).validate().is_err());
        assert!(Profile::new(1, f64::NAN).validate().is_err());
        assert!(Profile::new(1, 1.0)
            .with_request_increase_rate("10/oops")
            .validate()
            .is_err());
        assert!(Profile::new(1, 1.0)
            .with_request_increase_rate("10/200ms")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_profile_kebab_case_json() {
        let profile = Profile::new(10, 2.0).with_max_rps(100);
        let json = serde_json::to_string(&profile).unwrap();
        assert!(json.contains("\"spawn-count\":10"));
        assert!(json.contains("\"max-rps\":100"));
        assert!(json.contains("\"request-increase-rate\":\"-1\""));

        let parsed: Profile = serde_json::from_str(r#"{"spawn-count": 3}"#).unwrap();
        assert_eq!(parsed.spawn_count, 3);
        assert_eq!(parsed.spawn_rate, 1.0);
    }

    #[test]
    fn test_split_integer() {
        assert_eq!(split_integer(10, 2), vec![5, 5]);
        assert_eq!(split_integer(10, 3), vec![3, 3, 4]);
        assert_eq!(split_integer(2, 4), vec![0, 0, 1, 1]);
        assert!(split_integer(5, 0).is_empty());
    }

    #[test]
    fn test_profile_split() {
        let profile = Profile::new(10, 5.0).with_max_rps(7).with_loop_count(4);
        let parts = profile.split(2);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].spawn_count, 5);
        assert_eq!(parts[1].spawn_count, 5);
        assert_eq!(parts[0].spawn_rate, 2.5);
        assert_eq!(parts[0].max_rps + parts[1].max_rps, 7);
        assert_eq!(parts[0].loop_count + parts[1].loop_count, 4);
    }

    #[test]
    fn test_profile_split_keeps_unbounded_and_floors_rate() {
        let profile = Profile::new(3, 2.0);
        let parts = profile.split(3);
        assert!(parts.iter().all(|p| p.max_rps == -1 && p.loop_count == -1));
        assert!(parts.iter().all(|p| p.spawn_rate == 1.0));
    }

    #[test]
    fn test_profile_split_preserves_bounded_totals() {
        let parts = Profile::new(3, 3.0).with_loop_count(7).with_max_rps(5).split(3);
        assert_eq!(parts.iter().map(|p| p.loop_count).sum::<i64>(), 7);
        assert_eq!(parts.iter().map(|p| p.max_rps).sum::<i64>(), 5);
        assert!(parts.iter().all(|p| p.loop_count >= 2 && p.max_rps >= 1));
    }

    #[test]
    fn test_profile_split_never_zero_limit() {
        let parts = Profile::new(4, 4.0).with_max_rps(1).split(2);
        assert_eq!(parts[0].max_rps, 1);
        assert_eq!(parts[1].max_rps, 1);
    }
}
