//! Database connection pool, migrations, and health check.
//!
//! The Postgres store is what lets several API processes enqueue while one
//! or more worker processes consume.

pub mod jobs;

use crate::error::Result;
use crate::store::QueueSettings;
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};

/// Channel notified inside the enqueue transaction.
pub const JOB_READY_CHANNEL: &str = "job_ready";

/// Database handle. Owns the connection pool and the queue policy.
pub struct Db {
    pool: PgPool,
    settings: QueueSettings,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self {
            pool,
            settings: QueueSettings::default(),
        })
    }

    /// Replace the queue policy (retry delay, lease, default attempts).
    pub fn with_settings(mut self, settings: QueueSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Round-trip a `SELECT 1`.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Open a listener subscribed to new-job notifications.
    pub async fn job_listener(&self) -> Result<PgListener> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(JOB_READY_CHANNEL).await?;
        Ok(listener)
    }
}
