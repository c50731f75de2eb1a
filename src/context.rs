//! Shared handle passed to every engine: the storage pool, the loaded
//! configuration, and the job tracker built on the same pool.

use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::jobs::JobTracker;

#[derive(Debug, Clone)]
pub struct Context {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
    pub jobs: JobTracker,
}

impl Context {
    pub fn new(pool: SqlitePool, config: Config) -> Self {
        Self {
            jobs: JobTracker::new(pool.clone()),
            pool,
            config: Arc::new(config),
        }
    }

    /// Opens the configured database. The schema must already exist
    /// (`bulk init`).
    pub async fn connect(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        Ok(Self::new(pool, config.clone()))
    }
}
