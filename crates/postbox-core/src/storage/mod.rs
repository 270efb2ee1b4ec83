//! Database access layer implementing the repository pattern for the two
//! event tables.
//!
//! The repositories translate between the [`crate::models::Event`] domain
//! record and the `publisher_events` / `consumer_events` schemas. All
//! database access goes through these repositories; SQL outside this module
//! is forbidden so that the lifecycle invariants stay enforced in one place.

use std::sync::Arc;

use sqlx::PgPool;

pub mod inbox;
pub mod outbox;

use crate::{error::Result, time::Clock};

/// Container for the outbox and inbox repositories sharing one pool.
#[derive(Clone)]
pub struct Storage {
    /// Publisher-side repository over `publisher_events`.
    pub outbox: Arc<outbox::Repository>,

    /// Consumer-side repository over `consumer_events`.
    pub inbox: Arc<inbox::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    ///
    /// Both repositories share the pool and the clock used for row
    /// timestamps.
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        let pool = Arc::new(pool);

        Self {
            outbox: Arc::new(outbox::Repository::new(pool.clone(), clock.clone())),
            inbox: Arc::new(inbox::Repository::new(pool.clone(), clock)),
            pool,
        }
    }

    /// Returns the shared database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns error if the connection is unusable.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&*self.pool).await?;
        Ok(())
    }
}
