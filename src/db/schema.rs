//! Idempotent creation of the `message` table and its `ready_at` index.

use tracing::debug;

use crate::db::dialect::Dialect;
use crate::db::store::QueueDb;
use crate::error::{QueueError, QueueResult};

const MYSQL_SCHEMA: &[&str] = &["CREATE TABLE IF NOT EXISTS message (
    id BIGINT AUTO_INCREMENT PRIMARY KEY,
    payload BLOB NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    ready_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    retries INT NOT NULL DEFAULT 0,
    INDEX message_ready_at (ready_at ASC)
)"];

// Postgres has no inline index clause; the index is a separate statement.
const POSTGRES_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS message (
    id BIGSERIAL PRIMARY KEY,
    payload BYTEA NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    ready_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    retries INT NOT NULL DEFAULT 0
)",
    "CREATE INDEX IF NOT EXISTS message_ready_at ON message (ready_at ASC)",
];

pub(crate) fn statements(dialect: Dialect) -> &'static [&'static str] {
    match dialect {
        Dialect::MySql => MYSQL_SCHEMA,
        Dialect::Postgres => POSTGRES_SCHEMA,
    }
}

/// Create the queue schema if it doesn't exist yet.
///
/// Runs every statement inside one transaction and only uses
/// `IF NOT EXISTS` DDL, so concurrent calls from multiple processes are
/// safe.
pub(crate) async fn ensure_schema(db: &QueueDb) -> QueueResult<()> {
    debug!(dialect = %db.dialect(), "creating schema");
    db.exec_schema(statements(db.dialect()))
        .await
        .map_err(QueueError::Schema)?;
    debug!("schema created");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mysql_schema_uses_inline_index_and_blob() {
        let stmts = statements(Dialect::MySql);
        assert_eq!(stmts.len(), 1);
        assert!(stmts[0].contains("CREATE TABLE IF NOT EXISTS message"));
        assert!(stmts[0].contains("BIGINT AUTO_INCREMENT"));
        assert!(stmts[0].contains("payload BLOB NOT NULL"));
        assert!(stmts[0].contains("INDEX message_ready_at (ready_at ASC)"));
    }

    #[test]
    fn postgres_schema_uses_separate_index_and_bytea() {
        let stmts = statements(Dialect::Postgres);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("BIGSERIAL PRIMARY KEY"));
        assert!(stmts[0].contains("payload BYTEA NOT NULL"));
        assert!(stmts[1].starts_with("CREATE INDEX IF NOT EXISTS message_ready_at"));
    }

    #[test]
    fn every_statement_is_idempotent() {
        for dialect in [Dialect::MySql, Dialect::Postgres] {
            for stmt in statements(dialect) {
                assert!(stmt.contains("IF NOT EXISTS"), "not idempotent: {stmt}");
            }
        }
    }
}
