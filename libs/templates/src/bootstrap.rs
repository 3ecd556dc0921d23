//! Idempotent template installation.

use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::error::TemplateError;
use crate::mappings::TemplateFamily;
use crate::spec::TemplateContext;
use crate::store::{InstalledTemplate, TemplateStore};
use crate::version::Version;

/// Result of one family in an upgrade pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Template was written over `previous`.
    Installed { previous: InstalledTemplate },
    /// Template was already current.
    UpToDate,
    /// Another writer changed the template between read and write.
    Conflict,
    Failed(String),
}

/// Outcomes of one upgrade pass, in [`TemplateFamily::ALL`] order.
#[derive(Debug, Clone, Default)]
pub struct UpgradeReport {
    pub outcomes: Vec<(TemplateFamily, InstallOutcome)>,
}

impl UpgradeReport {
    pub fn installed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, InstallOutcome::Installed { .. }))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, InstallOutcome::Failed(_)))
            .count()
    }

    /// Outcome recorded for `family`, if the pass ran.
    pub fn outcome(&self, family: TemplateFamily) -> Option<&InstallOutcome> {
        self.outcomes
            .iter()
            .find(|(f, _)| *f == family)
            .map(|(_, o)| o)
    }
}

/// Installs or upgrades the ML templates.
///
/// Passes are serialized: a pass triggered while another is running waits
/// for it and then finds everything up to date.
pub struct TemplateBootstrapper {
    context: TemplateContext,
    store: Arc<dyn TemplateStore>,
    pass_lock: Mutex<()>,
}

impl TemplateBootstrapper {
    pub fn new(context: TemplateContext, store: Arc<dyn TemplateStore>) -> Self {
        Self {
            context,
            store,
            pass_lock: Mutex::new(()),
        }
    }

    pub fn context(&self) -> &TemplateContext {
        &self.context
    }

    pub fn store(&self) -> &Arc<dyn TemplateStore> {
        &self.store
    }

    /// Bring every template up to the running version.
    ///
    /// Each family is handled independently; a failure in one is logged and
    /// does not stop the others.
    pub fn run_upgrade_pass(&self) -> UpgradeReport {
        let _guard = match self.pass_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut report = UpgradeReport::default();
        for family in TemplateFamily::ALL {
            let outcome = match self.install(family) {
                Ok(outcome) => outcome,
                Err(e) => {
                    if family.is_critical() {
                        error!(template = %family, error = %e, "Error installing template");
                    } else {
                        warn!(template = %family, error = %e, "Error installing template");
                    }
                    InstallOutcome::Failed(e.to_string())
                }
            };
            report.outcomes.push((family, outcome));
        }

        if report.installed_count() > 0 {
            info!(
                installed = report.installed_count(),
                failed = report.failed_count(),
                version = %self.context.version,
                "Template upgrade pass finished"
            );
        }
        report
    }

    fn install(&self, family: TemplateFamily) -> Result<InstallOutcome, TemplateError> {
        let template = family.build(&self.context)?;
        let installed = self.store.installed(&template.name)?;

        if installed.is_current(template.version) {
            debug!(template = %family, "Template up to date");
            return Ok(InstallOutcome::UpToDate);
        }

        if self.store.compare_and_put(&template, installed)? {
            info!(template = %family, previous = ?installed, version = template.version, "Template installed");
            Ok(InstallOutcome::Installed {
                previous: installed,
            })
        } else {
            debug!(template = %family, "Template changed concurrently");
            Ok(InstallOutcome::Conflict)
        }
    }

    /// See [`all_templates_installed`].
    pub fn all_templates_installed(&self) -> bool {
        all_templates_installed(self.store.as_ref(), self.context.version)
    }
}

/// Whether every ML template is present at `version` or newer.
///
/// A store error counts as not installed.
pub fn all_templates_installed(store: &dyn TemplateStore, version: Version) -> bool {
    TemplateFamily::ALL.iter().all(|family| {
        store
            .installed(family.template_name())
            .map(|installed| installed.is_current(version.id()))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::spec::IndexTemplateSpec;
    use crate::store::InMemoryTemplateStore;
    use std::time::Duration;

    fn bootstrapper(store: Arc<InMemoryTemplateStore>) -> TemplateBootstrapper {
        TemplateBootstrapper::new(TemplateContext::new(true, Duration::from_secs(60)), store)
    }

    #[test]
    fn test_first_pass_installs_everything() {
        let store = Arc::new(InMemoryTemplateStore::new());
        let bootstrapper = bootstrapper(store.clone());

        assert!(!bootstrapper.all_templates_installed());
        let report = bootstrapper.run_upgrade_pass();

        assert_eq!(report.installed_count(), 4);
        assert_eq!(report.failed_count(), 0);
        assert!(bootstrapper.all_templates_installed());
    }

    #[test]
    fn test_second_pass_is_noop() {
        let store = Arc::new(InMemoryTemplateStore::new());
        let bootstrapper = bootstrapper(store.clone());

        bootstrapper.run_upgrade_pass();
        let report = bootstrapper.run_upgrade_pass();

        assert_eq!(report.installed_count(), 0);
        assert!(report
            .outcomes
            .iter()
            .all(|(_, o)| *o == InstallOutcome::UpToDate));
        assert_eq!(store.write_count(), 4);
    }

    #[test]
    fn test_stale_and_unversioned_templates_replaced() {
        let store = Arc::new(InMemoryTemplateStore::new());
        let current = Version::CURRENT.id();
        store.seed(".ml-meta", None);
        store.seed(".ml-state", Some(current - 100));
        store.seed(".ml-notifications", Some(current));
        store.seed(".ml-anomalies-", Some(current + 100));

        let report = bootstrapper(store.clone()).run_upgrade_pass();

        assert_eq!(
            report.outcome(TemplateFamily::Meta),
            Some(&InstallOutcome::Installed {
                previous: InstalledTemplate::Present { version: None }
            })
        );
        assert!(matches!(
            report.outcome(TemplateFamily::State),
            Some(InstallOutcome::Installed { .. })
        ));
        assert_eq!(
            report.outcome(TemplateFamily::Notifications),
            Some(&InstallOutcome::UpToDate)
        );
        assert_eq!(
            report.outcome(TemplateFamily::Results),
            Some(&InstallOutcome::UpToDate)
        );
        assert_eq!(store.write_count(), 2);
    }

    #[test]
    fn test_concurrent_passes_install_once() {
        let store = Arc::new(InMemoryTemplateStore::new());
        let bootstrapper = Arc::new(bootstrapper(store.clone()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let b = bootstrapper.clone();
                std::thread::spawn(move || b.run_upgrade_pass())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.write_count(), 4);
    }

    /// Store that fails reads for one template name.
    struct FlakyStore {
        inner: InMemoryTemplateStore,
        broken: &'static str,
    }

    impl TemplateStore for FlakyStore {
        fn installed(&self, name: &str) -> Result<InstalledTemplate, StoreError> {
            if name == self.broken {
                return Err(StoreError::Unavailable("shard not allocated".to_string()));
            }
            self.inner.installed(name)
        }

        fn compare_and_put(
            &self,
            template: &IndexTemplateSpec,
            expected: InstalledTemplate,
        ) -> Result<bool, StoreError> {
            self.inner.compare_and_put(template, expected)
        }
    }

    #[test]
    fn test_failure_does_not_stop_other_families() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryTemplateStore::new(),
            broken: ".ml-state",
        });
        let bootstrapper =
            TemplateBootstrapper::new(TemplateContext::new(false, Duration::ZERO), store.clone());

        let report = bootstrapper.run_upgrade_pass();

        assert_eq!(report.installed_count(), 3);
        assert!(matches!(
            report.outcome(TemplateFamily::State),
            Some(InstallOutcome::Failed(_))
        ));
        assert!(!bootstrapper.all_templates_installed());
    }

    /// Store where another writer always wins.
    struct RacingStore;

    impl TemplateStore for RacingStore {
        fn installed(&self, _name: &str) -> Result<InstalledTemplate, StoreError> {
            Ok(InstalledTemplate::Missing)
        }

        fn compare_and_put(
            &self,
            _template: &IndexTemplateSpec,
            _expected: InstalledTemplate,
        ) -> Result<bool, StoreError> {
            Ok(false)
        }
    }

    #[test]
    fn test_lost_race_reported_as_conflict() {
        let bootstrapper = TemplateBootstrapper::new(
            TemplateContext::new(true, Duration::ZERO),
            Arc::new(RacingStore),
        );
        let report = bootstrapper.run_upgrade_pass();
        assert!(report
            .outcomes
            .iter()
            .all(|(_, o)| *o == InstallOutcome::Conflict));
    }
}
