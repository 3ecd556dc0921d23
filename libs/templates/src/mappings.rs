//! Template families and their mappings.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::TemplateError;
use crate::spec::{Durability, IndexTemplateSpec, TemplateContext, TemplateSettings, TypeMapping};

/// Audit notifications index.
pub const NOTIFICATIONS_INDEX: &str = ".ml-notifications";

/// Internal metadata index.
pub const META_INDEX: &str = ".ml-meta";

/// Model state index.
pub const STATE_INDEX: &str = ".ml-state";

/// Prefix of every results index; the shared index is `.ml-anomalies-shared`.
pub const RESULTS_INDEX_PREFIX: &str = ".ml-anomalies-";

/// Catch-all field that results fields are copied into.
pub const ALL_FIELD_VALUES: &str = "all_field_values";

const DOC_TYPE: &str = "doc";
const AUDIT_DOC_TYPE: &str = "audit_message";

/// The four template families ML maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TemplateFamily {
    Notifications,
    Meta,
    State,
    Results,
}

impl TemplateFamily {
    pub const ALL: [TemplateFamily; 4] = [
        TemplateFamily::Notifications,
        TemplateFamily::Meta,
        TemplateFamily::State,
        TemplateFamily::Results,
    ];

    /// Template name.
    pub fn template_name(&self) -> &'static str {
        match self {
            TemplateFamily::Notifications => NOTIFICATIONS_INDEX,
            TemplateFamily::Meta => META_INDEX,
            TemplateFamily::State => STATE_INDEX,
            TemplateFamily::Results => RESULTS_INDEX_PREFIX,
        }
    }

    /// Index patterns the template applies to.
    pub fn patterns(&self) -> Vec<String> {
        match self {
            TemplateFamily::Results => vec![format!("{RESULTS_INDEX_PREFIX}*")],
            other => vec![other.template_name().to_string()],
        }
    }

    /// Whether failing to install this family should be reported as an error
    /// rather than a warning. Jobs cannot persist without state and results.
    pub fn is_critical(&self) -> bool {
        matches!(self, TemplateFamily::State | TemplateFamily::Results)
    }

    /// Build the template for the given context.
    pub fn build(&self, ctx: &TemplateContext) -> Result<IndexTemplateSpec, TemplateError> {
        let mut settings = TemplateSettings::single_shard(ctx.effective_delayed_timeout());
        let mapping = match self {
            TemplateFamily::Notifications => notifications_mapping(),
            TemplateFamily::Meta => meta_mapping(),
            TemplateFamily::State => {
                settings.translog_durability = Some(Durability::Async);
                state_mapping()
            }
            TemplateFamily::Results => {
                settings.translog_durability = Some(Durability::Async);
                settings.default_field = vec![ALL_FIELD_VALUES.to_string()];
                results_mapping()
            }
        }
        .map_err(|source| TemplateError::Mapping {
            template: self.template_name(),
            source,
        })?;

        Ok(IndexTemplateSpec {
            name: self.template_name().to_string(),
            patterns: self.patterns(),
            settings,
            mapping,
            version: ctx.version.id(),
        })
    }
}

impl std::fmt::Display for TemplateFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.template_name())
    }
}

// =============================================================================
// Mapping documents
// =============================================================================

#[derive(Debug, Serialize)]
struct Field {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    copy_to: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    properties: Option<Properties>,
}

type Properties = BTreeMap<&'static str, Field>;

impl Field {
    fn of(kind: &'static str) -> Self {
        Self {
            kind: Some(kind),
            copy_to: None,
            enabled: None,
            properties: None,
        }
    }

    fn keyword() -> Self {
        Self::of("keyword")
    }

    fn searchable_keyword() -> Self {
        Self {
            copy_to: Some(ALL_FIELD_VALUES),
            ..Self::keyword()
        }
    }

    fn object(properties: Properties) -> Self {
        Self {
            kind: None,
            copy_to: None,
            enabled: None,
            properties: Some(properties),
        }
    }
}

#[derive(Debug, Serialize)]
struct MappingBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    dynamic: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    properties: Option<Properties>,
}

fn mapping(doc_type: &str, body: MappingBody) -> Result<TypeMapping, serde_json::Error> {
    Ok(TypeMapping {
        doc_type: doc_type.to_string(),
        body: serde_json::to_value(body)?,
    })
}

fn notifications_mapping() -> Result<TypeMapping, serde_json::Error> {
    let properties = Properties::from([
        ("job_id", Field::keyword()),
        ("level", Field::keyword()),
        ("message", Field::of("text")),
        ("timestamp", Field::of("date")),
        ("node_name", Field::keyword()),
    ]);
    mapping(
        AUDIT_DOC_TYPE,
        MappingBody {
            dynamic: None,
            enabled: None,
            properties: Some(properties),
        },
    )
}

fn meta_mapping() -> Result<TypeMapping, serde_json::Error> {
    let properties = Properties::from([
        ("type", Field::keyword()),
        ("filter_id", Field::keyword()),
        ("items", Field::keyword()),
        ("calendar_id", Field::keyword()),
        ("job_ids", Field::keyword()),
        ("description", Field::of("text")),
    ]);
    mapping(
        DOC_TYPE,
        MappingBody {
            dynamic: None,
            enabled: None,
            properties: Some(properties),
        },
    )
}

fn state_mapping() -> Result<TypeMapping, serde_json::Error> {
    // State documents are opaque blobs.
    mapping(
        DOC_TYPE,
        MappingBody {
            dynamic: None,
            enabled: Some(false),
            properties: None,
        },
    )
}

fn results_mapping() -> Result<TypeMapping, serde_json::Error> {
    let bucket_influencer = Properties::from([
        ("influencer_field_name", Field::keyword()),
        ("anomaly_score", Field::of("double")),
        ("probability", Field::of("double")),
    ]);
    let properties = Properties::from([
        ("job_id", Field::searchable_keyword()),
        ("result_type", Field::keyword()),
        ("timestamp", Field::of("date")),
        ("bucket_span", Field::of("long")),
        ("is_interim", Field::of("boolean")),
        ("anomaly_score", Field::of("double")),
        ("initial_anomaly_score", Field::of("double")),
        ("record_score", Field::of("double")),
        ("probability", Field::of("double")),
        ("by_field_value", Field::searchable_keyword()),
        ("partition_field_value", Field::searchable_keyword()),
        ("over_field_value", Field::searchable_keyword()),
        ("influencer_field_value", Field::searchable_keyword()),
        ("bucket_influencers", Field::object(bucket_influencer)),
        ("processed_record_count", Field::of("long")),
        ("input_bytes", Field::of("long")),
        ("input_record_count", Field::of("long")),
        ("latest_record_timestamp", Field::of("date")),
        (ALL_FIELD_VALUES, Field::of("text")),
    ]);
    mapping(
        DOC_TYPE,
        MappingBody {
            dynamic: Some(true),
            enabled: None,
            properties: Some(properties),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;
    use rstest::rstest;
    use std::time::Duration;

    fn ctx(native_process: bool) -> TemplateContext {
        TemplateContext::new(native_process, Duration::from_secs(60))
    }

    #[rstest]
    #[case(TemplateFamily::Notifications, ".ml-notifications", ".ml-notifications")]
    #[case(TemplateFamily::Meta, ".ml-meta", ".ml-meta")]
    #[case(TemplateFamily::State, ".ml-state", ".ml-state")]
    #[case(TemplateFamily::Results, ".ml-anomalies-", ".ml-anomalies-*")]
    fn test_names_and_patterns(
        #[case] family: TemplateFamily,
        #[case] name: &str,
        #[case] pattern: &str,
    ) {
        let template = family.build(&ctx(true)).unwrap();
        assert_eq!(template.name, name);
        assert_eq!(template.patterns, vec![pattern.to_string()]);
        assert_eq!(template.settings.number_of_shards, 1);
        assert_eq!(template.version, Version::CURRENT.id());
    }

    #[test]
    fn test_durability_only_on_state_and_results() {
        for family in TemplateFamily::ALL {
            let template = family.build(&ctx(true)).unwrap();
            let expected = family.is_critical().then_some(Durability::Async);
            assert_eq!(template.settings.translog_durability, expected, "{family}");
        }
    }

    #[test]
    fn test_results_default_field() {
        let template = TemplateFamily::Results.build(&ctx(true)).unwrap();
        assert_eq!(template.settings.default_field, vec![ALL_FIELD_VALUES]);

        let body = &template.mapping.body;
        assert_eq!(body["properties"]["job_id"]["copy_to"], ALL_FIELD_VALUES);
        assert_eq!(body["properties"][ALL_FIELD_VALUES]["type"], "text");
    }

    #[test]
    fn test_notifications_doc_type() {
        let template = TemplateFamily::Notifications.build(&ctx(true)).unwrap();
        assert_eq!(template.mapping.doc_type, "audit_message");
        assert_eq!(template.mapping.body["properties"]["level"]["type"], "keyword");
    }

    #[test]
    fn test_state_mapping_is_disabled() {
        let template = TemplateFamily::State.build(&ctx(true)).unwrap();
        assert_eq!(template.mapping.body["enabled"], false);
    }

    #[test]
    fn test_delayed_timeout_follows_native_process() {
        for family in TemplateFamily::ALL {
            let with = family.build(&ctx(true)).unwrap();
            let without = family.build(&ctx(false)).unwrap();
            assert_eq!(with.settings.delayed_node_left_timeout, Duration::from_secs(60));
            assert_eq!(without.settings.delayed_node_left_timeout, Duration::ZERO);
        }
    }

    #[test]
    fn test_template_json_shape() {
        let json = TemplateFamily::Meta.build(&ctx(false)).unwrap().to_json();
        assert_eq!(json["index_patterns"][0], ".ml-meta");
        assert_eq!(json["settings"]["index.unassigned.node_left.delayed_timeout"], "0ms");
        assert!(json["mappings"]["doc"]["properties"].is_object());
        assert_eq!(json["version"], Version::CURRENT.id());
    }
}
