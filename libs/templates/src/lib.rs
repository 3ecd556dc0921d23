//! # mlnode-templates
//!
//! Index templates for the indices ML writes to:
//!
//! | Family | Template name | Index pattern |
//! |---|---|---|
//! | notifications | `.ml-notifications` | `.ml-notifications` |
//! | internal metadata | `.ml-meta` | `.ml-meta` |
//! | job state | `.ml-state` | `.ml-state` |
//! | job results | `.ml-anomalies-` | `.ml-anomalies-*` |
//!
//! Templates carry the id of the software version that built them. A
//! template is (re)installed only when it is missing or older than the
//! running version, so repeated upgrade passes are no-ops. Writers to these
//! indices wait on [`all_templates_installed`] first.

mod bootstrap;
mod error;
mod mappings;
mod spec;
mod sqlite;
mod store;
mod version;

pub use bootstrap::{all_templates_installed, InstallOutcome, TemplateBootstrapper, UpgradeReport};
pub use error::{StoreError, TemplateError};
pub use mappings::{
    TemplateFamily, ALL_FIELD_VALUES, META_INDEX, NOTIFICATIONS_INDEX, RESULTS_INDEX_PREFIX,
    STATE_INDEX,
};
pub use spec::{Durability, IndexTemplateSpec, TemplateContext, TemplateSettings, TypeMapping};
pub use sqlite::SqliteTemplateStore;
pub use store::{InMemoryTemplateStore, InstalledTemplate, TemplateStore};
pub use version::Version;
