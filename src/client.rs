//! Client facade: holds the database handle, sets up the schema once, and
//! hands out producers and consumers bound to that handle.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::consumer::{Consumer, ConsumerOptions};
use crate::db::{QueueDb, ensure_schema};
use crate::error::QueueResult;
use crate::producer::{Producer, ProducerOptions};

#[derive(Debug, Clone)]
pub struct Client {
    db: QueueDb,
}

impl Client {
    /// Create a client over an existing database handle, making sure the
    /// queue schema exists.
    pub async fn new(db: impl Into<QueueDb>) -> QueueResult<Client> {
        let db = db.into();
        debug!(dialect = %db.dialect(), "creating new client");
        ensure_schema(&db).await?;
        debug!("client created");
        Ok(Client { db })
    }

    /// Connect to `url` with the named dialect (`"mysql"`, `"postgres"`,
    /// `"pg"`, `"pgx"`) and create a client.
    pub async fn connect(dialect: &str, url: &str) -> QueueResult<Client> {
        Client::new(QueueDb::connect(dialect, url).await?).await
    }

    /// Spawn a producer bound to this client's database handle.
    ///
    /// Fails only if the handle cannot be reached. The cancellation token
    /// is the producer's sole shutdown path.
    pub async fn producer(
        &self,
        cancel: CancellationToken,
        options: ProducerOptions,
    ) -> QueueResult<Producer> {
        Producer::new(cancel, self.db.clone(), options).await
    }

    /// Spawn a consumer invoking `process` for every claimed message.
    ///
    /// `process` must be reentrant across workers and idempotent under
    /// at-least-once delivery.
    pub async fn consumer<F>(
        &self,
        cancel: CancellationToken,
        process: F,
        options: ConsumerOptions,
    ) -> QueueResult<Consumer>
    where
        F: Fn(&[u8]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Consumer::new(cancel, self.db.clone(), Arc::new(process), options).await
    }
}
