//! Cadence server: shared state for the HTTP layer and the process run loop

use cadence_core::ratelimit::{BucketStore, LocalBucketStore, PolicySet, RateLimiter};
use cadence_core::tasks::{self, HandlerRegistry, InMemoryTaskStore, QueueStats, TaskStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{ServerConfig, StoreBackend};
use crate::error::ServerResult;

/// Main server implementation
///
/// Everything the request handlers need is constructed once here and injected;
/// no store is chosen or created while serving requests.
#[derive(Clone)]
pub struct CadenceServer {
    /// Configuration
    pub config: ServerConfig,

    limiter: Arc<RateLimiter>,

    policies: Arc<PolicySet>,

    tasks: Arc<dyn TaskStore>,

    registry: Arc<HandlerRegistry>,
}

impl std::fmt::Debug for CadenceServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CadenceServer")
            .field("config", &self.config)
            .field("bucket_store", &self.limiter.store().backend())
            .field("task_store", &self.tasks.backend())
            .field("registry", &self.registry)
            .finish()
    }
}

impl CadenceServer {
    /// Create a server from already built parts
    pub fn new(
        config: ServerConfig,
        limiter: Arc<RateLimiter>,
        policies: PolicySet,
        tasks: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            config,
            limiter,
            policies: Arc::new(policies),
            tasks,
            registry,
        }
    }

    /// Create a server with the stores selected by the configuration
    pub fn from_config(config: ServerConfig, registry: HandlerRegistry) -> ServerResult<Self> {
        let policies = config.policy_set()?;
        let (buckets, tasks) = create_stores(&config)?;
        let limiter = Arc::new(RateLimiter::new(buckets));

        Ok(Self::new(config, limiter, policies, tasks, Arc::new(registry)))
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    pub fn tasks(&self) -> &Arc<dyn TaskStore> {
        &self.tasks
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Health of the bucket store
    pub async fn check_bucket_store_health(&self) -> ServerResult<bool> {
        Ok(self.limiter.store().health_check().await?)
    }

    /// Health of the task store
    pub async fn check_task_store_health(&self) -> ServerResult<bool> {
        Ok(self.tasks.health_check().await?)
    }

    /// Current queue occupancy
    pub async fn queue_stats(&self) -> ServerResult<QueueStats> {
        Ok(self.tasks.stats().await?)
    }

    /// Serve HTTP and run the workers until Ctrl-C
    pub async fn run(self) -> ServerResult<()> {
        info!("Starting Cadence server");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let workers = tasks::spawn_workers(
            self.config.worker.concurrency,
            Arc::clone(&self.tasks),
            Arc::clone(&self.registry),
            self.config.worker_config(),
            shutdown_rx,
        );
        let sweeper = self
            .limiter
            .spawn_maintenance(self.config.sweep_interval(), self.config.bucket_ttl());
        let purger = tasks::spawn_purge_loop(Arc::clone(&self.tasks), self.config.sweep_interval());
        let lease = self.config.task_lease();
        let recovery = tasks::spawn_recovery_loop(
            Arc::clone(&self.tasks),
            self.config.sweep_interval().min(lease),
            lease,
        );

        let listener = TcpListener::bind((self.config.bind_address.as_str(), self.config.port)).await?;
        info!("Listening on {}", listener.local_addr()?);

        let app = crate::api::build_router(Arc::new(self));
        let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal())
            .await;

        info!("Shutting down, waiting for workers to finish their current task");
        sweeper.abort();
        purger.abort();
        recovery.abort();
        if shutdown_tx.send(true).is_err() {
            warn!("No task workers were running");
        }
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Task worker ended abnormally: {}", e);
            }
        }

        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Build the bucket and task stores for the configured backend
pub fn create_stores(config: &ServerConfig) -> ServerResult<(Arc<dyn BucketStore>, Arc<dyn TaskStore>)> {
    match config.store_backend()? {
        StoreBackend::Local => {
            info!("Using local bucket and task stores");
            let buckets: Arc<dyn BucketStore> = Arc::new(LocalBucketStore::new());
            let tasks: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::with_retention(config.task_retention()));
            Ok((buckets, tasks))
        }
        StoreBackend::Redis(url) => create_redis_stores(config, &url),
    }
}

#[cfg(feature = "redis")]
fn create_redis_stores(
    config: &ServerConfig,
    url: &str,
) -> ServerResult<(Arc<dyn BucketStore>, Arc<dyn TaskStore>)> {
    use cadence_core::ratelimit::RedisBucketStore;
    use cadence_core::redis_pool::RedisPool;
    use cadence_core::tasks::RedisTaskStore;

    info!("Using Redis bucket and task stores");
    let pool = RedisPool::new(url)?;
    let key_ttl_ms = config.rate_limit.bucket_ttl_secs.saturating_mul(1000);

    let buckets: Arc<dyn BucketStore> = Arc::new(RedisBucketStore::new(pool.clone(), key_ttl_ms));
    let tasks: Arc<dyn TaskStore> = Arc::new(RedisTaskStore::with_retention(pool, config.task_retention()));
    Ok((buckets, tasks))
}

#[cfg(not(feature = "redis"))]
fn create_redis_stores(
    _config: &ServerConfig,
    url: &str,
) -> ServerResult<(Arc<dyn BucketStore>, Arc<dyn TaskStore>)> {
    Err(crate::error::ServerError::ConfigError(format!(
        "Shared store {} requested but this build has no Redis support",
        url
    )))
}
