//! ML node service library.
//!
//! A node decides once at startup whether it takes part in machine
//! learning, advertises its job capacity as node attributes, keeps the ML
//! index templates installed and, when enabled, runs the persistent tasks
//! (open job, start datafeed) the coordination layer assigns to it.
//!
//! ## Architecture
//!
//! ```text
//! MlNode
//! ├── NodeAttributeReconciler      (published attributes)
//! ├── DynamicSettings              (job capacity, watch channel)
//! ├── TemplateUpgradeWorker        (template bootstrap passes)
//! ├── MlAssembly
//! │   ├── Auditor
//! │   ├── JobManager
//! │   ├── AnalyticsProcessManager  (autodetect + utility pools)
//! │   └── DatafeedManager          (datafeed pool)
//! └── PersistentTasksNodeService   (open-job, start-datafeed)
//! ```
//!
//! ## Modules
//!
//! - `settings`: ML settings, byte sizes and the dynamic capacity settings
//! - `pools`: bounded worker pools sized from `ml.max_open_jobs`
//! - `process`: native and no-op analytics process factories
//! - `persistent`: persistent task service, executors and placement

pub mod audit;
pub mod config;
pub mod datafeed;
pub mod error;
pub mod facade;
pub mod jobs;
pub mod node;
pub mod persistent;
pub mod pools;
pub mod process;
pub mod process_manager;
pub mod settings;
pub mod storage;
pub mod template_worker;

pub use error::MlError;
pub use facade::{AssemblyInputs, MlAssembly, MlComponents};
pub use node::{MlNode, NodeBootstrap};
pub use settings::{ByteSize, DynamicSettings, JobCapacityConfig, MlSettings};
