use std::fmt;
use std::str::FromStr;

use crate::error::QueueError;

/// SQL dialect family the queue is bound to.
///
/// The engines speak canonical `?`-placeholder SQL; the dialect only decides
/// the DDL text and how placeholders are rebound before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Postgres,
}

impl FromStr for Dialect {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mysql" => Ok(Dialect::MySql),
            "postgres" | "pg" | "pgx" => Ok(Dialect::Postgres),
            other => Err(QueueError::UnsupportedDialect(other.to_string())),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::MySql => f.write_str("mysql"),
            Dialect::Postgres => f.write_str("postgres"),
        }
    }
}

impl Dialect {
    /// Rewrite a canonical `?`-placeholder query into the dialect's native
    /// placeholder style.
    ///
    /// MySQL already uses `?`; Postgres gets `$1..$n` in left-to-right order.
    /// Queries built by this crate never contain `?` inside literals, so a
    /// plain scan is enough.
    pub fn rebind(&self, query: &str) -> String {
        match self {
            Dialect::MySql => query.to_string(),
            Dialect::Postgres => {
                let mut out = String::with_capacity(query.len() + 8);
                let mut n = 0usize;
                for ch in query.chars() {
                    if ch == '?' {
                        n += 1;
                        out.push('$');
                        out.push_str(&n.to_string());
                    } else {
                        out.push(ch);
                    }
                }
                out
            }
        }
    }
}

/// Comma-separated `?` list for `IN (...)` expansion, one placeholder per
/// element. Rebind afterwards for Postgres.
pub(crate) fn placeholder_list(len: usize) -> String {
    let mut out = String::with_capacity(len * 3);
    for i in 0..len {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('?');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_dialects_and_aliases() {
        assert_eq!("mysql".parse::<Dialect>().unwrap(), Dialect::MySql);
        assert_eq!("postgres".parse::<Dialect>().unwrap(), Dialect::Postgres);
        assert_eq!("pg".parse::<Dialect>().unwrap(), Dialect::Postgres);
        assert_eq!("pgx".parse::<Dialect>().unwrap(), Dialect::Postgres);
    }

    #[test]
    fn rejects_unknown_dialect() {
        let err = "sqlite3".parse::<Dialect>().unwrap_err();
        assert!(matches!(err, QueueError::UnsupportedDialect(name) if name == "sqlite3"));
    }

    #[test]
    fn rebind_is_identity_for_mysql() {
        let q = "UPDATE message SET retries = ?, ready_at = ? WHERE id = ?";
        assert_eq!(Dialect::MySql.rebind(q), q);
    }

    #[test]
    fn rebind_numbers_placeholders_for_postgres() {
        let q = "UPDATE message SET retries = ?, ready_at = ? WHERE id = ?";
        assert_eq!(
            Dialect::Postgres.rebind(q),
            "UPDATE message SET retries = $1, ready_at = $2 WHERE id = $3"
        );
    }

    #[test]
    fn rebind_handles_more_than_nine_placeholders() {
        let q = format!("DELETE FROM message WHERE id IN ({})", placeholder_list(12));
        let rebound = Dialect::Postgres.rebind(&q);
        assert!(rebound.ends_with("$10, $11, $12)"));
    }

    #[test]
    fn placeholder_list_expands() {
        assert_eq!(placeholder_list(1), "?");
        assert_eq!(placeholder_list(3), "?, ?, ?");
        assert_eq!(placeholder_list(0), "");
    }
}
