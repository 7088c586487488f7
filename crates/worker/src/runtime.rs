//! Wiring of configured components into a scheduler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::Url;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use imaging_core::failure::NotificationHandle;
use imaging_core::{
    build_notifier, create_notification_system, load_cookie, CatalogBackend, ClaimCoordinator,
    CommandTool, Config, ErmrestWorkSource, FailureRouter, FsObjectStore, HatracStore, ImageTool,
    ItemWorker, ObjectStore, PipelineExecutor, ResultPublisher, Scheduler, SqliteWorkSource,
    StorageBackend, WorkSource,
};

/// How long to wait for queued notifications on exit.
const NOTIFY_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A fully wired worker.
pub struct Runtime {
    pub scheduler: Arc<Scheduler>,
    pub tool: Arc<dyn ImageTool>,
    notifications: NotificationHandle,
    dispatcher: JoinHandle<()>,
}

impl Runtime {
    /// Build every component named by `config`.
    ///
    /// Must be called inside a Tokio runtime: the notification dispatcher
    /// is spawned here.
    pub fn build(config: &Config) -> Result<Self> {
        let cookie = load_credentials(config)?;

        let source = build_work_source(config, cookie.clone())?;
        info!("Work source: {} ({})", source.name(), config.catalog.base_uri);

        let store = build_object_store(config, cookie)?;
        info!("Object store: {}", store.name());

        let tool: Arc<dyn ImageTool> = Arc::new(
            CommandTool::new(&config.processing).context("Invalid tool configuration")?,
        );

        let worker_id = config.scheduler.resolved_worker_id();
        info!("Worker id: {}", worker_id);

        let notifier = build_notifier(&config.notify).context("Failed to create notifier")?;
        let (notifications, dispatcher) =
            create_notification_system(notifier, config.notify.buffer_size);
        let dispatcher = tokio::spawn(dispatcher.run());

        let coordinator = Arc::new(ClaimCoordinator::new(
            source,
            worker_id.clone(),
            config.scheduler.lease_timeout(),
        ));
        let executor = Arc::new(PipelineExecutor::new(
            config.processing.clone(),
            Arc::clone(&tool),
            Arc::clone(&store),
        ));
        let publisher = Arc::new(ResultPublisher::new(
            store,
            Arc::clone(&coordinator),
            config.storage.path_template.clone(),
            config.retry.clone(),
        ));
        let router = Arc::new(
            FailureRouter::new(config.retry.clone(), worker_id)
                .with_notifier(notifications.clone()),
        );

        let worker = ItemWorker::new(coordinator, executor, publisher, router);
        let scheduler = Arc::new(Scheduler::new(config.scheduler.clone(), worker));

        Ok(Self {
            scheduler,
            tool,
            notifications,
            dispatcher,
        })
    }

    /// Drop every notification sender and wait for queued deliveries.
    ///
    /// Other holders of the scheduler must be dropped first, or the wait
    /// ends at the timeout.
    pub async fn finish(self) {
        let Self {
            scheduler,
            tool,
            notifications,
            dispatcher,
        } = self;
        drop(scheduler);
        drop(tool);
        drop(notifications);

        if tokio::time::timeout(NOTIFY_DRAIN_TIMEOUT, dispatcher)
            .await
            .is_err()
        {
            warn!("Notification dispatcher did not drain in time");
        }
    }
}

fn load_credentials(config: &Config) -> Result<Option<String>> {
    let Some(path) = &config.catalog.credentials_file else {
        return Ok(None);
    };
    let host = match &config.catalog.server_name {
        Some(name) => Some(name.clone()),
        None => Some(host_of(&parse_base_uri(&config.catalog.base_uri)?)),
    };
    let cookie = load_cookie(path, host.as_deref())
        .with_context(|| format!("Failed to load credentials from {:?}", path))?;
    info!("Loaded credentials for {}", host.as_deref().unwrap_or("catalog"));
    Ok(Some(cookie))
}

fn build_work_source(config: &Config, cookie: Option<String>) -> Result<Arc<dyn WorkSource>> {
    Ok(match config.catalog.backend {
        CatalogBackend::Ermrest => Arc::new(
            ErmrestWorkSource::new(config.catalog.clone(), cookie)
                .context("Failed to create catalog client")?,
        ),
        CatalogBackend::Sqlite => Arc::new(
            SqliteWorkSource::new(&config.catalog.db_path).with_context(|| {
                format!("Failed to open work database {:?}", config.catalog.db_path)
            })?,
        ),
    })
}

fn build_object_store(config: &Config, cookie: Option<String>) -> Result<Arc<dyn ObjectStore>> {
    Ok(match config.storage.backend {
        StorageBackend::Hatrac => {
            let base_url = match &config.storage.base_url {
                Some(url) => url.clone(),
                None => origin_of(&parse_base_uri(&config.catalog.base_uri)?),
            };
            Arc::new(
                HatracStore::new(
                    base_url,
                    cookie,
                    Duration::from_secs(config.storage.transfer_timeout_secs),
                )
                .context("Failed to create object store client")?,
            )
        }
        StorageBackend::Filesystem => Arc::new(FsObjectStore::new(config.storage.root.clone())),
    })
}

fn parse_base_uri(uri: &str) -> Result<Url> {
    let url =
        Url::parse(uri).with_context(|| format!("catalog.base_uri {:?} is not a valid URL", uri))?;
    if url.host_str().is_none() {
        return Err(anyhow!("catalog.base_uri {:?} has no host", uri));
    }
    Ok(url)
}

/// `scheme://host[:port]`, without credentials, path or query.
fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Host name as keyed in credential files; IPv6 literals lose their brackets.
fn host_of(url: &Url) -> String {
    url.host_str()
        .unwrap_or_default()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use imaging_core::load_config_from_str;
    use tempfile::TempDir;

    fn origin_and_host(uri: &str) -> (String, String) {
        let url = parse_base_uri(uri).unwrap();
        (origin_of(&url), host_of(&url))
    }

    #[test]
    fn test_origin_and_host() {
        assert_eq!(
            origin_and_host("https://imaging.example.org:8443/ermrest/catalog/1"),
            (
                "https://imaging.example.org:8443".to_string(),
                "imaging.example.org".to_string()
            )
        );
        assert_eq!(
            origin_and_host("https://imaging.example.org:443/ermrest"),
            (
                "https://imaging.example.org".to_string(),
                "imaging.example.org".to_string()
            )
        );
    }

    #[test]
    fn test_origin_drops_credentials_and_query() {
        let (origin, host) = origin_and_host("https://user:pw@imaging.example.org/ermrest?x=1");
        assert_eq!(origin, "https://imaging.example.org");
        assert_eq!(host, "imaging.example.org");

        let (origin, _) = origin_and_host("https://imaging.example.org?x=1");
        assert_eq!(origin, "https://imaging.example.org");
    }

    #[test]
    fn test_ipv6_host() {
        let (origin, host) = origin_and_host("https://[::1]:8443/ermrest");
        assert_eq!(origin, "https://[::1]:8443");
        assert_eq!(host, "::1");
    }

    #[test]
    fn test_invalid_base_uri() {
        assert!(parse_base_uri("not a uri").is_err());
        assert!(parse_base_uri("").is_err());
        assert!(parse_base_uri("data:text/plain,catalog").is_err());
    }

    #[tokio::test]
    async fn test_build_sqlite_filesystem_runtime() {
        let dir = TempDir::new().unwrap();
        let toml = format!(
            r#"
[catalog]
backend = "sqlite"
db_path = "{db}"

[storage]
backend = "filesystem"
root = "{root}"

[processing]
processing_dir = "{scratch}"

[scheduler]
worker_id = "worker-test"
"#,
            db = dir.path().join("work.db").display(),
            root = dir.path().join("objects").display(),
            scratch = dir.path().join("scratch").display(),
        );
        let config = load_config_from_str(&toml).unwrap();

        let runtime = Runtime::build(&config).unwrap();
        let status = runtime.scheduler.status().await;
        assert_eq!(status.worker_id, "worker-test");
        assert!(!status.running);
        runtime.finish().await;
    }

    #[tokio::test]
    async fn test_build_fails_on_missing_credentials() {
        let config = load_config_from_str(
            r#"
[catalog]
base_uri = "https://imaging.example.org/ermrest/catalog/1"
credentials_file = "/nonexistent/credential.json"
"#,
        )
        .unwrap();
        assert!(Runtime::build(&config).is_err());
    }
}
