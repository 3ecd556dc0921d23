//! ML settings: parsing from node settings and the dynamic capacity surface.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use mlnode_reconcile::{DeploymentMode, Eligibility, NodeSettings};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

/// Feature flag for the whole process.
pub const ML_ENABLED: &str = "ml.enabled";
/// Whether this node runs ML jobs. Defaults to [`ML_ENABLED`].
pub const NODE_ML: &str = "node.ml";
/// Whether to launch the native analytics process.
pub const AUTODETECT_PROCESS: &str = "ml.autodetect_process";
pub const MAX_OPEN_JOBS: &str = "ml.max_open_jobs";
pub const CONCURRENT_JOB_ALLOCATIONS: &str = "ml.node_concurrent_job_allocations";
pub const MAX_MODEL_MEMORY_LIMIT: &str = "ml.max_model_memory_limit";
pub const MAX_MACHINE_MEMORY_PERCENT: &str = "ml.max_machine_memory_percent";
pub const DELAYED_NODE_LEFT_TIMEOUT: &str = "index.unassigned.node_left.delayed_timeout";
pub const CLIENT_TYPE: &str = "client.type";
pub const NODE_MODE: &str = "node.mode";

const DEFAULT_MAX_OPEN_JOBS: u32 = 20;
const DEFAULT_CONCURRENT_JOB_ALLOCATIONS: u32 = 2;
const DEFAULT_MAX_MACHINE_MEMORY_PERCENT: u32 = 30;
const MIN_MACHINE_MEMORY_PERCENT: u32 = 5;
const MAX_MACHINE_MEMORY_PERCENT_BOUND: u32 = 90;
const DEFAULT_DELAYED_NODE_LEFT_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors parsing or updating settings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("failed to parse value [{value}] for setting [{key}]: expected true or false")]
    InvalidBool { key: &'static str, value: String },

    #[error("failed to parse value [{value}] for setting [{key}]: expected an integer")]
    InvalidNumber { key: &'static str, value: String },

    #[error("failed to parse value [{value}] for setting [{key}] as a byte size")]
    InvalidByteSize { key: &'static str, value: String },

    #[error("failed to parse value [{value}] for setting [{key}] as a time value")]
    InvalidTimeValue { key: &'static str, value: String },

    #[error("unknown value [{value}] for setting [{key}]")]
    UnknownValue { key: &'static str, value: String },

    #[error("value [{value}] for setting [{key}] must be between {min} and {max}")]
    OutOfRange {
        key: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("setting [{0}] cannot be updated at runtime")]
    NotDynamic(&'static str),
}

// =============================================================================
// Byte sizes and time values
// =============================================================================

/// A size in bytes, written like `512mb` or `1gb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ByteSize(u64);

impl ByteSize {
    pub const ZERO: ByteSize = ByteSize(0);

    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn from_mb(mb: u64) -> Self {
        Self(mb * 1024 * 1024)
    }

    pub const fn bytes(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl FromStr for ByteSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let split = lower
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(lower.len());
        let (digits, unit) = lower.split_at(split);
        let value: u64 = digits.parse().map_err(|_| s.to_string())?;
        let multiplier: u64 = match unit.trim() {
            "" | "b" => 1,
            "k" | "kb" => 1 << 10,
            "m" | "mb" => 1 << 20,
            "g" | "gb" => 1 << 30,
            "t" | "tb" => 1 << 40,
            _ => return Err(s.to_string()),
        };
        value
            .checked_mul(multiplier)
            .map(ByteSize)
            .ok_or_else(|| s.to_string())
    }
}

impl TryFrom<String> for ByteSize {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ByteSize> for String {
    fn from(value: ByteSize) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(u64, &str); 4] = [(1 << 40, "tb"), (1 << 30, "gb"), (1 << 20, "mb"), (1 << 10, "kb")];
        for (size, unit) in UNITS {
            if self.0 >= size && self.0 % size == 0 {
                return write!(f, "{}{unit}", self.0 / size);
            }
        }
        write!(f, "{}b", self.0)
    }
}

/// Parse a time value like `1m`, `30s` or `500ms`.
pub fn parse_time_value(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let millis = match unit {
        "ms" => value,
        "s" => value.checked_mul(1_000)?,
        "m" => value.checked_mul(60_000)?,
        "h" => value.checked_mul(3_600_000)?,
        "d" => value.checked_mul(86_400_000)?,
        _ => return None,
    };
    Some(Duration::from_millis(millis))
}

// =============================================================================
// Parsed settings
// =============================================================================

/// Job capacity bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCapacityConfig {
    /// Jobs that may be opening on one node at the same time.
    pub max_concurrent_job_allocations: u32,
    /// Jobs that may be open on one node. Fixed at node start.
    pub max_open_jobs_per_node: u32,
    /// Largest model memory limit a job may declare; zero means unbounded.
    pub max_model_memory_limit: ByteSize,
    /// Share of machine memory that jobs may use.
    pub max_machine_memory_percent: u32,
}

impl Default for JobCapacityConfig {
    fn default() -> Self {
        Self {
            max_concurrent_job_allocations: DEFAULT_CONCURRENT_JOB_ALLOCATIONS,
            max_open_jobs_per_node: DEFAULT_MAX_OPEN_JOBS,
            max_model_memory_limit: ByteSize::ZERO,
            max_machine_memory_percent: DEFAULT_MAX_MACHINE_MEMORY_PERCENT,
        }
    }
}

impl JobCapacityConfig {
    pub fn from_settings(settings: &NodeSettings) -> Result<Self, SettingsError> {
        let config = Self {
            max_concurrent_job_allocations: get_u32(
                settings,
                CONCURRENT_JOB_ALLOCATIONS,
                DEFAULT_CONCURRENT_JOB_ALLOCATIONS,
            )?,
            max_open_jobs_per_node: get_u32(settings, MAX_OPEN_JOBS, DEFAULT_MAX_OPEN_JOBS)?,
            max_model_memory_limit: get_byte_size(settings, MAX_MODEL_MEMORY_LIMIT, ByteSize::ZERO)?,
            max_machine_memory_percent: get_u32(
                settings,
                MAX_MACHINE_MEMORY_PERCENT,
                DEFAULT_MAX_MACHINE_MEMORY_PERCENT,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_open_jobs_per_node < 1 {
            return Err(SettingsError::OutOfRange {
                key: MAX_OPEN_JOBS,
                value: i64::from(self.max_open_jobs_per_node),
                min: 1,
                max: i64::from(u32::MAX),
            });
        }
        if !(MIN_MACHINE_MEMORY_PERCENT..=MAX_MACHINE_MEMORY_PERCENT_BOUND)
            .contains(&self.max_machine_memory_percent)
        {
            return Err(SettingsError::OutOfRange {
                key: MAX_MACHINE_MEMORY_PERCENT,
                value: i64::from(self.max_machine_memory_percent),
                min: i64::from(MIN_MACHINE_MEMORY_PERCENT),
                max: i64::from(MAX_MACHINE_MEMORY_PERCENT_BOUND),
            });
        }
        Ok(())
    }
}

/// Everything ML reads from node settings at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MlSettings {
    pub ml_enabled: bool,
    pub node_ml: bool,
    pub autodetect_process: bool,
    pub mode: DeploymentMode,
    pub delayed_node_left_timeout: Duration,
    pub capacity: JobCapacityConfig,
}

impl MlSettings {
    pub fn from_settings(settings: &NodeSettings) -> Result<Self, SettingsError> {
        let ml_enabled = get_bool(settings, ML_ENABLED, true)?;
        let delayed_node_left_timeout = match settings.get(DELAYED_NODE_LEFT_TIMEOUT) {
            Some(raw) => parse_time_value(raw).ok_or_else(|| SettingsError::InvalidTimeValue {
                key: DELAYED_NODE_LEFT_TIMEOUT,
                value: raw.to_string(),
            })?,
            None => DEFAULT_DELAYED_NODE_LEFT_TIMEOUT,
        };

        Ok(Self {
            ml_enabled,
            node_ml: get_bool(settings, NODE_ML, ml_enabled)?,
            autodetect_process: get_bool(settings, AUTODETECT_PROCESS, true)?,
            mode: deployment_mode(settings)?,
            delayed_node_left_timeout,
            capacity: JobCapacityConfig::from_settings(settings)?,
        })
    }

    pub fn eligibility(&self) -> Eligibility {
        Eligibility::decide(self.ml_enabled, self.node_ml, self.mode)
    }
}

fn deployment_mode(settings: &NodeSettings) -> Result<DeploymentMode, SettingsError> {
    match settings.get(CLIENT_TYPE).unwrap_or("node") {
        "node" => {}
        "transport" => return Ok(DeploymentMode::TransportClient),
        other => {
            return Err(SettingsError::UnknownValue {
                key: CLIENT_TYPE,
                value: other.to_string(),
            })
        }
    }
    match settings.get(NODE_MODE).unwrap_or("default") {
        "default" => Ok(DeploymentMode::Node),
        "gateway" => Ok(DeploymentMode::Gateway),
        "gateway_client" => Ok(DeploymentMode::GatewayClient),
        other => Err(SettingsError::UnknownValue {
            key: NODE_MODE,
            value: other.to_string(),
        }),
    }
}

fn get_bool(settings: &NodeSettings, key: &'static str, default: bool) -> Result<bool, SettingsError> {
    match settings.get(key) {
        None => Ok(default),
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        Some(other) => Err(SettingsError::InvalidBool {
            key,
            value: other.to_string(),
        }),
    }
}

fn get_u32(settings: &NodeSettings, key: &'static str, default: u32) -> Result<u32, SettingsError> {
    match settings.get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| SettingsError::InvalidNumber {
            key,
            value: raw.to_string(),
        }),
    }
}

fn get_byte_size(
    settings: &NodeSettings,
    key: &'static str,
    default: ByteSize,
) -> Result<ByteSize, SettingsError> {
    match settings.get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| SettingsError::InvalidByteSize {
            key,
            value: raw.to_string(),
        }),
    }
}

// =============================================================================
// Dynamic settings
// =============================================================================

/// A runtime change to the cluster-dynamic capacity settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapacityUpdate {
    pub max_concurrent_job_allocations: Option<u32>,
    pub max_open_jobs_per_node: Option<u32>,
    pub max_model_memory_limit: Option<ByteSize>,
    pub max_machine_memory_percent: Option<u32>,
}

/// Process-wide job capacity settings with change notification.
///
/// Readers hold a [`watch::Receiver`] and always see the latest value;
/// updates are validated as a whole before anything is published.
#[derive(Debug, Clone)]
pub struct DynamicSettings {
    tx: Arc<watch::Sender<JobCapacityConfig>>,
}

impl DynamicSettings {
    pub fn new(initial: JobCapacityConfig) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> JobCapacityConfig {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobCapacityConfig> {
        self.tx.subscribe()
    }

    /// Apply an update. The per-node open job bound sizes the worker pools
    /// and cannot change after startup.
    pub fn apply(&self, update: CapacityUpdate) -> Result<JobCapacityConfig, SettingsError> {
        let current = self.current();
        if update
            .max_open_jobs_per_node
            .is_some_and(|v| v != current.max_open_jobs_per_node)
        {
            return Err(SettingsError::NotDynamic(MAX_OPEN_JOBS));
        }

        let next = JobCapacityConfig {
            max_concurrent_job_allocations: update
                .max_concurrent_job_allocations
                .unwrap_or(current.max_concurrent_job_allocations),
            max_open_jobs_per_node: current.max_open_jobs_per_node,
            max_model_memory_limit: update
                .max_model_memory_limit
                .unwrap_or(current.max_model_memory_limit),
            max_machine_memory_percent: update
                .max_machine_memory_percent
                .unwrap_or(current.max_machine_memory_percent),
        };
        next.validate()?;

        if next != current {
            info!(?next, "Job capacity settings updated");
            self.tx.send_replace(next);
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlnode_reconcile::DisabledReason;
    use rstest::rstest;

    fn settings(pairs: &[(&str, &str)]) -> NodeSettings {
        pairs.iter().copied().collect()
    }

    #[rstest]
    #[case("0", 0)]
    #[case("1024", 1024)]
    #[case("512b", 512)]
    #[case("2kb", 2048)]
    #[case("512mb", 512 * 1024 * 1024)]
    #[case("1GB", 1024 * 1024 * 1024)]
    #[case("3g", 3 * 1024 * 1024 * 1024)]
    fn test_byte_size_parse(#[case] raw: &str, #[case] bytes: u64) {
        assert_eq!(raw.parse::<ByteSize>().unwrap().bytes(), bytes);
    }

    #[rstest]
    #[case("")]
    #[case("mb")]
    #[case("12 parsecs")]
    #[case("-5mb")]
    fn test_byte_size_rejects(#[case] raw: &str) {
        assert!(raw.parse::<ByteSize>().is_err());
    }

    #[test]
    fn test_byte_size_display() {
        assert_eq!(ByteSize::from_mb(1024).to_string(), "1gb");
        assert_eq!(ByteSize::from_mb(100).to_string(), "100mb");
        assert_eq!(ByteSize::from_bytes(1500).to_string(), "1500b");
    }

    #[test]
    fn test_parse_time_value() {
        assert_eq!(parse_time_value("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_time_value("0ms"), Some(Duration::ZERO));
        assert_eq!(parse_time_value("45s"), Some(Duration::from_secs(45)));
        assert_eq!(parse_time_value("1x"), None);
        assert_eq!(parse_time_value("10"), None);
    }

    #[test]
    fn test_defaults() {
        let ml = MlSettings::from_settings(&NodeSettings::new()).unwrap();
        assert!(ml.ml_enabled && ml.node_ml && ml.autodetect_process);
        assert_eq!(ml.mode, DeploymentMode::Node);
        assert_eq!(ml.delayed_node_left_timeout, Duration::from_secs(60));
        assert_eq!(ml.capacity, JobCapacityConfig::default());
        assert_eq!(ml.eligibility(), Eligibility::Enabled);
    }

    #[test]
    fn test_node_role_defaults_to_feature_flag() {
        let ml = MlSettings::from_settings(&settings(&[(ML_ENABLED, "false")])).unwrap();
        assert!(!ml.node_ml);
        assert_eq!(
            ml.eligibility(),
            Eligibility::Disabled(DisabledReason::FeatureDisabled)
        );

        let ml = MlSettings::from_settings(&settings(&[(NODE_ML, "false")])).unwrap();
        assert_eq!(
            ml.eligibility(),
            Eligibility::Disabled(DisabledReason::NodeRoleDisabled)
        );
    }

    #[rstest]
    #[case(&[(CLIENT_TYPE, "transport")], DeploymentMode::TransportClient)]
    #[case(&[(NODE_MODE, "gateway")], DeploymentMode::Gateway)]
    #[case(&[(NODE_MODE, "gateway_client")], DeploymentMode::GatewayClient)]
    #[case(&[(CLIENT_TYPE, "node"), (NODE_MODE, "default")], DeploymentMode::Node)]
    fn test_deployment_mode(#[case] pairs: &[(&str, &str)], #[case] expected: DeploymentMode) {
        let ml = MlSettings::from_settings(&settings(pairs)).unwrap();
        assert_eq!(ml.mode, expected);
    }

    #[rstest]
    #[case(ML_ENABLED, "yes")]
    #[case(MAX_OPEN_JOBS, "twenty")]
    #[case(MAX_OPEN_JOBS, "0")]
    #[case(MAX_MACHINE_MEMORY_PERCENT, "4")]
    #[case(MAX_MACHINE_MEMORY_PERCENT, "91")]
    #[case(MAX_MODEL_MEMORY_LIMIT, "lots")]
    #[case(DELAYED_NODE_LEFT_TIMEOUT, "soon")]
    #[case(NODE_MODE, "tribe")]
    fn test_invalid_settings(#[case] key: &str, #[case] value: &str) {
        assert!(MlSettings::from_settings(&settings(&[(key, value)])).is_err());
    }

    #[test]
    fn test_machine_memory_percent_bounds_inclusive() {
        for percent in ["5", "90"] {
            let cfg = JobCapacityConfig::from_settings(&settings(&[(
                MAX_MACHINE_MEMORY_PERCENT,
                percent,
            )]))
            .unwrap();
            assert_eq!(cfg.max_machine_memory_percent.to_string(), percent);
        }
    }

    #[tokio::test]
    async fn test_dynamic_update_notifies() {
        let dynamic = DynamicSettings::new(JobCapacityConfig::default());
        let mut rx = dynamic.subscribe();

        let updated = dynamic
            .apply(CapacityUpdate {
                max_machine_memory_percent: Some(50),
                max_model_memory_limit: Some(ByteSize::from_mb(2048)),
                ..Default::default()
            })
            .unwrap();

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), updated);
        assert_eq!(updated.max_machine_memory_percent, 50);
        assert_eq!(updated.max_concurrent_job_allocations, 2);
    }

    #[test]
    fn test_dynamic_update_is_atomic() {
        let dynamic = DynamicSettings::new(JobCapacityConfig::default());
        let err = dynamic
            .apply(CapacityUpdate {
                max_concurrent_job_allocations: Some(8),
                max_machine_memory_percent: Some(99),
                ..Default::default()
            })
            .unwrap_err();

        assert!(matches!(err, SettingsError::OutOfRange { .. }));
        assert_eq!(dynamic.current(), JobCapacityConfig::default());
    }

    #[test]
    fn test_max_open_jobs_not_dynamic() {
        let dynamic = DynamicSettings::new(JobCapacityConfig::default());
        let err = dynamic
            .apply(CapacityUpdate {
                max_open_jobs_per_node: Some(50),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err, SettingsError::NotDynamic(MAX_OPEN_JOBS));
    }
}
