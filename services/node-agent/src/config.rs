//! Configuration for the ML node service.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use mlnode_id::NodeId;
use mlnode_reconcile::NodeSettings;

const DEFAULT_TEMPLATE_CHECK_INTERVAL_SECS: u64 = 30;

/// Process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Human-readable node name, used in audit messages.
    pub node_name: String,

    /// Installation directory; native binaries live under `modules/ml`.
    pub home: PathBuf,

    /// Data directory for local state.
    pub data_dir: PathBuf,

    /// Node settings file (TOML). No file means all defaults.
    pub settings_file: Option<PathBuf>,

    /// Log level used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Seconds between periodic template upgrade passes.
    pub template_check_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Node ID can be provided or auto-generated
        let node_id = match std::env::var("MLNODE_NODE_ID") {
            Ok(raw) => raw.parse().context("invalid MLNODE_NODE_ID")?,
            Err(_) => NodeId::new(),
        };

        let node_name = std::env::var("MLNODE_NODE_NAME").unwrap_or_else(|_| node_id.to_string());

        let home = std::env::var("MLNODE_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/usr/share/mlnode"));

        let data_dir = std::env::var("MLNODE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/mlnode"));

        let settings_file = std::env::var("MLNODE_SETTINGS_FILE").ok().map(PathBuf::from);

        let log_level = std::env::var("MLNODE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let template_check_interval_secs = match std::env::var("MLNODE_TEMPLATE_CHECK_INTERVAL") {
            Ok(raw) => parse_check_interval(&raw).context("invalid MLNODE_TEMPLATE_CHECK_INTERVAL")?,
            Err(_) => DEFAULT_TEMPLATE_CHECK_INTERVAL_SECS,
        };

        Ok(Self {
            node_id,
            node_name,
            home,
            data_dir,
            settings_file,
            log_level,
            template_check_interval_secs,
        })
    }

    pub fn template_check_interval(&self) -> Duration {
        Duration::from_secs(self.template_check_interval_secs)
    }

    /// Path of the durable template store.
    pub fn template_store_path(&self) -> PathBuf {
        self.data_dir.join("templates.db")
    }

    /// Directory the results writer appends to.
    pub fn results_dir(&self) -> PathBuf {
        self.data_dir.join("results")
    }

    /// Read the node settings file, if one is configured.
    pub fn load_node_settings(&self) -> Result<NodeSettings> {
        match &self.settings_file {
            Some(path) => load_settings_file(path),
            None => Ok(NodeSettings::new()),
        }
    }
}

/// Parse a template check interval in whole seconds. Zero is rejected.
fn parse_check_interval(raw: &str) -> Result<u64> {
    let secs: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("[{raw}] is not a number of seconds"))?;
    anyhow::ensure!(secs > 0, "interval must be at least one second");
    Ok(secs)
}

/// Read and flatten a TOML settings file.
pub fn load_settings_file(path: &Path) -> Result<NodeSettings> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file {}", path.display()))?;
    parse_settings(&contents).with_context(|| format!("invalid settings file {}", path.display()))
}

/// Parse TOML settings into dotted keys.
///
/// Nested tables and dotted keys are equivalent: `[node.attr.ml] enabled =
/// "true"` and `"node.attr.ml.enabled" = "true"` both yield
/// `node.attr.ml.enabled`. Scalars keep their textual form; arrays are
/// joined with commas.
pub fn parse_settings(contents: &str) -> Result<NodeSettings> {
    let value: toml::Value = toml::from_str(contents).context("invalid settings TOML")?;
    let mut settings = NodeSettings::new();
    flatten("", &value, &mut settings);
    Ok(settings)
}

fn flatten(prefix: &str, value: &toml::Value, out: &mut NodeSettings) {
    match value {
        toml::Value::Table(table) => {
            for (key, child) in table {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&path, child, out);
            }
        }
        other => {
            out.insert(prefix, scalar_text(other));
        }
    }
}

fn scalar_text(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Array(items) => items.iter().map(scalar_text).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}
