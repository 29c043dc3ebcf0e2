use std::future::Future;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, Connection, PgPool};
use tokio::sync::RwLock;

use crate::config::StoreConfig;
use crate::models::api::ListParams;
use crate::models::job::ClassificationRequest;
use crate::services::retry::{self, RetryError, RetryPolicy};

pub mod queries;

use queries::{Page, Transition};

/// Database used to create the target database when it does not exist yet.
const MAINTENANCE_DB: &str = "postgres";

/// Resilient handle on the request store.
///
/// Holds a lazily (re)opened pool. Connection-level failures close the pool
/// so the next caller reconnects under the retry policy.
pub struct StoreManager {
    config: StoreConfig,
    policy: RetryPolicy,
    pool: RwLock<Option<PgPool>>,
}

impl StoreManager {
    pub fn new(config: StoreConfig) -> Self {
        let policy = config.retry_policy();
        Self {
            config,
            policy,
            pool: RwLock::new(None),
        }
    }

    fn connect_options(&self, database: &str) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .username(&self.config.user)
            .password(&self.config.password)
            .database(database)
    }

    /// Establish the pool if it is absent or closed. Idempotent.
    pub async fn connect(&self) -> Result<PgPool, StoreError> {
        if let Some(pool) = self.pool.read().await.as_ref() {
            if !pool.is_closed() {
                return Ok(pool.clone());
            }
        }

        let mut guard = self.pool.write().await;
        if let Some(pool) = guard.as_ref() {
            if !pool.is_closed() {
                return Ok(pool.clone());
            }
            tracing::info!("No active PostgreSQL connection, reconnecting");
        }

        let pool = self
            .policy
            .run("postgres", is_connection_error, || async {
                self.ensure_database().await?;
                PgPoolOptions::new()
                    .max_connections(20)
                    .min_connections(1)
                    .acquire_timeout(Duration::from_secs(10))
                    .idle_timeout(Duration::from_secs(600))
                    .max_lifetime(Duration::from_secs(1800))
                    .connect_with(self.connect_options(&self.config.name))
                    .await
            })
            .await
            .map_err(|e| match e {
                RetryError::Exhausted { attempts, last } => StoreError::ConnectExhausted {
                    attempts,
                    source: last,
                },
                RetryError::Fatal(e) => StoreError::Connect(e),
            })?;

        run_migrations(&pool).await?;
        tracing::info!(database = %self.config.name, "Successfully connected to PostgreSQL");

        *guard = Some(pool.clone());
        Ok(pool)
    }

    /// Create the target database through the maintenance database if it is missing.
    async fn ensure_database(&self) -> Result<(), sqlx::Error> {
        let mut conn = self
            .connect_options(MAINTENANCE_DB)
            .connect()
            .await?;

        let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM pg_database WHERE datname = $1")
            .bind(&self.config.name)
            .fetch_optional(&mut conn)
            .await?;

        if exists.is_none() {
            tracing::info!(database = %self.config.name, "Target database missing, creating it");
            let statement = format!("CREATE DATABASE {}", quote_ident(&self.config.name));
            sqlx::query(&statement).execute(&mut conn).await?;
        }

        conn.close().await
    }

    /// Current pool, reconnecting on demand.
    pub async fn pool(&self) -> Result<PgPool, StoreError> {
        self.connect().await
    }

    /// Drop the current pool so the next call reconnects.
    async fn invalidate(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
        }
    }

    /// Run one statement. A connection-level failure reconnects and runs the
    /// statement exactly once more; statement errors are returned as-is.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: Fn(PgPool) -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        retry::rerun_once(
            "postgres",
            move |fresh| async move {
                if fresh {
                    self.invalidate().await;
                }
                self.pool().await
            },
            op,
            is_connection_error,
            StoreError::Query,
        )
        .await
        .inspect_err(|e| {
            if let StoreError::Query(e) = e {
                tracing::error!(error = %e, "Database error");
            }
        })
    }

    pub async fn close(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
            tracing::info!("PostgreSQL connection closed");
        }
    }

    pub async fn insert_pending(&self) -> Result<ClassificationRequest, StoreError> {
        self.execute(|pool| async move { queries::insert_pending(&pool).await })
            .await
    }

    pub async fn get(&self, id: i64) -> Result<Option<ClassificationRequest>, StoreError> {
        self.execute(|pool| async move { queries::get_request(&pool, id).await })
            .await
    }

    pub async fn mark_processed(
        &self,
        id: i64,
        label: &str,
        confidence: f64,
    ) -> Result<Transition, StoreError> {
        self.execute(|pool| async move { queries::mark_processed(&pool, id, label, confidence).await })
            .await
    }

    pub async fn mark_failed(&self, id: i64, reason: &str) -> Result<Transition, StoreError> {
        self.execute(|pool| async move { queries::mark_failed(&pool, id, reason).await })
            .await
    }

    pub async fn list(&self, params: &ListParams) -> Result<Page, StoreError> {
        self.execute(|pool| async move { queries::list_requests(&pool, params).await })
            .await
    }

    /// Connectivity check used by readiness.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.execute(|pool| async move { sqlx::query("SELECT 1").execute(&pool).await.map(|_| ()) })
            .await
    }
}

/// Run embedded database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Errors that mean the connection, not the statement, is at fault.
pub fn is_connection_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        // Class 08 is "connection exception"; 57P01 is admin shutdown.
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| code.starts_with("08") || code == "57P01"),
        _ => false,
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Could not connect to PostgreSQL after {attempts} attempts: {source}")]
    ConnectExhausted { attempts: u32, source: sqlx::Error },

    #[error("Failed to connect to PostgreSQL: {0}")]
    Connect(sqlx::Error),

    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Database error: {0}")]
    Query(sqlx::Error),
}
