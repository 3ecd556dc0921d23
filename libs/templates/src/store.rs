//! Template store abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::Value;

use crate::error::StoreError;
use crate::spec::IndexTemplateSpec;

/// What the store currently holds under a template name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstalledTemplate {
    Missing,
    /// Present; `version` is `None` for templates written without a stamp.
    Present { version: Option<u32> },
}

impl InstalledTemplate {
    /// Whether this template satisfies the given version id.
    pub fn is_current(&self, version: u32) -> bool {
        matches!(self, InstalledTemplate::Present { version: Some(v) } if *v >= version)
    }
}

/// Where index templates live.
///
/// `compare_and_put` is the only write: it stores the template only if the
/// current entry still matches `expected`, so concurrent installers on
/// different nodes cannot overwrite each other with stale reads.
pub trait TemplateStore: Send + Sync {
    /// Look up a template by name.
    fn installed(&self, name: &str) -> Result<InstalledTemplate, StoreError>;

    /// Store `template` if the entry under its name still equals `expected`.
    /// Returns `false` if another writer got there first.
    fn compare_and_put(
        &self,
        template: &IndexTemplateSpec,
        expected: InstalledTemplate,
    ) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone)]
struct StoredTemplate {
    version: Option<u32>,
    body: Value,
}

/// Process-local template store.
#[derive(Debug, Default)]
pub struct InMemoryTemplateStore {
    templates: Mutex<HashMap<String, StoredTemplate>>,
    writes: AtomicUsize,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a template as if written by another version.
    pub fn seed(&self, name: &str, version: Option<u32>) {
        if let Ok(mut templates) = self.templates.lock() {
            templates.insert(
                name.to_string(),
                StoredTemplate {
                    version,
                    body: Value::Null,
                },
            );
        }
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Stored body of a template.
    pub fn body(&self, name: &str) -> Option<Value> {
        let templates = self.templates.lock().ok()?;
        templates.get(name).map(|t| t.body.clone())
    }
}

impl TemplateStore for InMemoryTemplateStore {
    fn installed(&self, name: &str) -> Result<InstalledTemplate, StoreError> {
        let templates = self.templates.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(match templates.get(name) {
            Some(t) => InstalledTemplate::Present { version: t.version },
            None => InstalledTemplate::Missing,
        })
    }

    fn compare_and_put(
        &self,
        template: &IndexTemplateSpec,
        expected: InstalledTemplate,
    ) -> Result<bool, StoreError> {
        let mut templates = self.templates.lock().map_err(|_| StoreError::Poisoned)?;
        let current = match templates.get(&template.name) {
            Some(t) => InstalledTemplate::Present { version: t.version },
            None => InstalledTemplate::Missing,
        };
        if current != expected {
            return Ok(false);
        }

        templates.insert(
            template.name.clone(),
            StoredTemplate {
                version: Some(template.version),
                body: template.to_json(),
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mappings::TemplateFamily;
    use crate::spec::TemplateContext;
    use std::time::Duration;

    fn meta_template() -> IndexTemplateSpec {
        TemplateFamily::Meta
            .build(&TemplateContext::new(true, Duration::from_secs(60)))
            .unwrap()
    }

    #[test]
    fn test_is_current() {
        assert!(!InstalledTemplate::Missing.is_current(10));
        assert!(!InstalledTemplate::Present { version: None }.is_current(10));
        assert!(!InstalledTemplate::Present { version: Some(9) }.is_current(10));
        assert!(InstalledTemplate::Present { version: Some(10) }.is_current(10));
        assert!(InstalledTemplate::Present { version: Some(11) }.is_current(10));
    }

    #[test]
    fn test_compare_and_put() {
        let store = InMemoryTemplateStore::new();
        let template = meta_template();

        assert_eq!(store.installed(".ml-meta").unwrap(), InstalledTemplate::Missing);
        assert!(store
            .compare_and_put(&template, InstalledTemplate::Missing)
            .unwrap());
        assert_eq!(
            store.installed(".ml-meta").unwrap(),
            InstalledTemplate::Present {
                version: Some(template.version)
            }
        );

        // A stale expectation loses.
        assert!(!store
            .compare_and_put(&template, InstalledTemplate::Missing)
            .unwrap());
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.body(".ml-meta").unwrap()["version"], template.version);
    }
}
