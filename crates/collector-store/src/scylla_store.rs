//! `ColumnStore` backed by the `scylla` driver.
//!
//! Grounded on `other_examples`' `CassandraEventFacade` for the shape ("wrap
//! a driver handle in an `Arc`, expose typed insert methods implementing a
//! facade trait") — the concrete `CassandraProvider` type there is private to
//! its crate, so this implementation talks to `scylla::Session` directly.
//! `StoreRow`'s row-key/column-name tuples are joined with `:` into a single
//! partition/clustering key pair, since the wide-column schema itself
//! (spec.md §6) is reproduced at the caller (`writer::StoreWriter`), not
//! re-derived here.

use async_trait::async_trait;
use collector_core::error::{CollectorError, Result};
use scylla::query::Query;
use scylla::statement::Consistency as ScyllaConsistency;
use scylla::{Session, SessionBuilder};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::writer::{ColumnStore, Consistency, StoreRow};

fn to_scylla_consistency(c: Consistency) -> ScyllaConsistency {
    match c {
        Consistency::One => ScyllaConsistency::One,
        Consistency::Quorum => ScyllaConsistency::Quorum,
    }
}

pub struct ScyllaStore {
    session: Arc<Session>,
    keyspace: String,
}

impl ScyllaStore {
    pub async fn connect(
        endpoints: &[String],
        user: Option<&str>,
        password: Option<&str>,
        keyspace: &str,
    ) -> Result<Self> {
        let mut builder = SessionBuilder::new();
        for node in endpoints {
            builder = builder.known_node(node);
        }
        if let (Some(user), Some(password)) = (user, password) {
            builder = builder.user(user, password);
        }
        let session = builder
            .build()
            .await
            .map_err(|e| CollectorError::Configuration(format!("scylla connect failed: {e}")))?;
        session
            .query_unpaged(
                format!(
                    "CREATE KEYSPACE IF NOT EXISTS {keyspace} WITH REPLICATION = \
                     {{'class': 'SimpleStrategy', 'replication_factor': 1}}"
                ),
                (),
            )
            .await
            .map_err(|e| CollectorError::Fatal(format!("keyspace create failed: {e}")))?;
        session
            .use_keyspace(keyspace, false)
            .await
            .map_err(|e| CollectorError::Fatal(format!("use_keyspace failed: {e}")))?;
        Ok(Self {
            session: Arc::new(session),
            keyspace: keyspace.to_string(),
        })
    }

    fn table_ident(&self, table: &str) -> String {
        format!("{}.{}", self.keyspace, table.to_lowercase())
    }
}

#[async_trait]
impl ColumnStore for ScyllaStore {
    async fn create_tables(&self) -> Result<()> {
        for table in crate::schema::tables::ALL {
            self.use_column_family(table).await?;
        }
        Ok(())
    }

    /// Idempotent `CREATE TABLE IF NOT EXISTS`; every table is collapsed to a
    /// `(row_key, column_name) -> value` wide row, matching the abstract
    /// `StoreRow` shape the writer deals in.
    async fn use_column_family(&self, table: &str) -> Result<()> {
        let ident = self.table_ident(table);
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {ident} \
             (row_key text, column_name text, value text, PRIMARY KEY (row_key, column_name))"
        );
        self.session
            .query_unpaged(ddl, ())
            .await
            .map_err(|e| CollectorError::Fatal(format!("create table {table} failed: {e}")))?;
        Ok(())
    }

    async fn insert_row(&self, row: StoreRow, consistency: Consistency) -> Result<()> {
        let ident = self.table_ident(row.column_family);
        let row_key = row.row_key.join(":");
        let column_name = row.column_name.join(":");
        let cql = if row.ttl_seconds > 0 {
            format!(
                "INSERT INTO {ident} (row_key, column_name, value) VALUES (?, ?, ?) \
                 USING TTL {}",
                row.ttl_seconds
            )
        } else {
            format!("INSERT INTO {ident} (row_key, column_name, value) VALUES (?, ?, ?)")
        };
        let mut query = Query::new(cql);
        query.set_consistency(to_scylla_consistency(consistency));
        self.session
            .query_unpaged(query, (row_key, column_name, row.value))
            .await
            .map_err(|e| {
                warn!(table = row.column_family, error = %e, "scylla insert failed");
                CollectorError::Transient("scylla insert failed")
            })?;
        Ok(())
    }

    async fn get_row(&self, table: &str, row_key: &[String]) -> Result<Option<Vec<u8>>> {
        let ident = self.table_ident(table);
        let key = row_key.join(":");
        let query = format!("SELECT value FROM {ident} WHERE row_key = ? LIMIT 1");
        let result = self
            .session
            .query_unpaged(query, (key,))
            .await
            .map_err(|e| {
                warn!(table, error = %e, "scylla read failed");
                CollectorError::Transient("scylla read failed")
            })?;
        let rows = result
            .into_rows_result()
            .map_err(|_| CollectorError::Transient("scylla decode failed"))?;
        for row in rows
            .rows::<(String,)>()
            .map_err(|_| CollectorError::Transient("scylla row decode failed"))?
        {
            let (value,) = row.map_err(|_| CollectorError::Transient("scylla row read failed"))?;
            debug!(table, "get_row hit");
            return Ok(Some(value.into_bytes()));
        }
        Ok(None)
    }
}
