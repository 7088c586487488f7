pub mod claim;
pub mod config;
pub mod failure;
pub mod metrics;
pub mod pipeline;
pub mod publish;
pub mod scheduler;
pub mod storage;
pub mod testing;
pub mod work_item;

pub use claim::{ClaimCoordinator, ClaimError, LeaseRegistry};
pub use config::{
    load_config, load_config_from_str, load_cookie, validate_config, Config, ConfigError,
    LogFormat, SanitizedConfig,
};
pub use failure::{
    build_notifier, create_notification_system, AttemptFailure, Disposition, ErrorClass,
    FailureRouter, NotificationHandle, Notifier, RetryConfig,
};
pub use pipeline::{
    CommandTool, ImageMetadata, ImageTool, PipelineError, PipelineExecutor, PipelineResult,
    ProcessingConfig, Stage,
};
pub use publish::{PublishError, ResultPublisher};
pub use scheduler::{
    ClientOutcome, CycleReport, ItemWorker, Scheduler, SchedulerConfig, SchedulerError,
    SchedulerStatus,
};
pub use storage::{FsObjectStore, HatracStore, ObjectStore, StorageBackend, StorageConfig};
pub use work_item::{
    CatalogBackend, CatalogConfig, ErmrestWorkSource, ProcessingStatus, Rid, SqliteWorkSource,
    WorkItem, WorkSource, WorkSourceError,
};
