//! Template data model.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::version::Version;

/// Translog durability of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    Request,
    Async,
}

/// Index-level settings carried by a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSettings {
    pub number_of_shards: u32,
    /// Delay before shards of a departed node are reallocated.
    pub delayed_node_left_timeout: Duration,
    pub translog_durability: Option<Durability>,
    /// Fields searched when a query names none.
    pub default_field: Vec<String>,
}

impl TemplateSettings {
    /// Single shard, no special durability or default field.
    pub fn single_shard(delayed_node_left_timeout: Duration) -> Self {
        Self {
            number_of_shards: 1,
            delayed_node_left_timeout,
            translog_durability: None,
            default_field: Vec::new(),
        }
    }

    /// Flat dotted-key settings object.
    pub fn to_json(&self) -> Value {
        let mut settings = Map::new();
        settings.insert(
            "index.number_of_shards".to_string(),
            json!(self.number_of_shards),
        );
        settings.insert(
            "index.unassigned.node_left.delayed_timeout".to_string(),
            json!(format_time_value(self.delayed_node_left_timeout)),
        );
        if let Some(durability) = self.translog_durability {
            settings.insert("index.translog.durability".to_string(), json!(durability));
        }
        if !self.default_field.is_empty() {
            settings.insert(
                "index.query.default_field".to_string(),
                json!(self.default_field),
            );
        }
        Value::Object(settings)
    }
}

/// Mapping document for one document type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeMapping {
    pub doc_type: String,
    pub body: Value,
}

/// A fully built index template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexTemplateSpec {
    pub name: String,
    pub patterns: Vec<String>,
    pub settings: TemplateSettings,
    pub mapping: TypeMapping,
    /// Numeric id of the software version that built this template.
    pub version: u32,
}

impl IndexTemplateSpec {
    /// Template body as submitted to the store.
    pub fn to_json(&self) -> Value {
        let mut mappings = Map::new();
        mappings.insert(self.mapping.doc_type.clone(), self.mapping.body.clone());
        json!({
            "index_patterns": self.patterns,
            "settings": self.settings.to_json(),
            "mappings": mappings,
            "version": self.version,
        })
    }
}

/// Inputs shared by every template built during one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateContext {
    /// Whether the native analytics process is enabled on this node.
    pub native_process: bool,
    /// The node's configured reallocation delay.
    pub delayed_node_left_timeout: Duration,
    pub version: Version,
}

impl TemplateContext {
    pub fn new(native_process: bool, delayed_node_left_timeout: Duration) -> Self {
        Self {
            native_process,
            delayed_node_left_timeout,
            version: Version::CURRENT,
        }
    }

    /// Reallocation delay for ML indices: zero when no native process runs,
    /// otherwise the node's configured delay.
    pub fn effective_delayed_timeout(&self) -> Duration {
        if self.native_process {
            self.delayed_node_left_timeout
        } else {
            Duration::ZERO
        }
    }
}

/// Render a duration in the largest whole unit: `1m`, `30s`, `0ms`.
pub(crate) fn format_time_value(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        "0ms".to_string()
    } else if millis % 3_600_000 == 0 {
        format!("{}h", millis / 3_600_000)
    } else if millis % 60_000 == 0 {
        format!("{}m", millis / 60_000)
    } else if millis % 1_000 == 0 {
        format!("{}s", millis / 1_000)
    } else {
        format!("{millis}ms")
    }
}
