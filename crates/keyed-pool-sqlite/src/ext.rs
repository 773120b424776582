//! Common statement shapes as pool operations.

use keyed_pool::{
    BoxError, KeyedPool, Pending, PoolConfig, PoolError, TransactionOutcome, TransactionStep,
    run_steps,
};
use rusqlite::types::{FromSql, Value};
use rusqlite::{Connection, OptionalExtension, params_from_iter};

use crate::config::SqliteConfig;
use crate::connector::SqliteConnector;

pub type SqlitePool = KeyedPool<SqliteConnector>;

/// A step of a SQLite transaction.
pub type SqliteStep = TransactionStep<Connection>;

/// Open `pool.pool_size` connections to the database in `sqlite`.
pub fn open(sqlite: SqliteConfig, pool: PoolConfig) -> Result<SqlitePool, PoolError> {
    tracing::info!(
        path = %sqlite.path.display(),
        pool_size = pool.pool_size,
        read_only = sqlite.read_only,
        "Opening SQLite pool"
    );
    KeyedPool::new(SqliteConnector::new(sqlite), pool)
}

/// Statement helpers on a [`SqlitePool`]. Each call is one queued operation.
pub trait SqlitePoolExt {
    /// Run one statement; resolves to the number of rows changed.
    fn execute(&self, sql: impl Into<String>, params: Vec<Value>) -> Pending<usize>;

    /// Run several `;`-separated statements without parameters.
    fn execute_batch(&self, sql: impl Into<String>) -> Pending<()>;

    /// First column of the first row, or `None` if no row matched.
    fn query_scalar<T>(&self, sql: impl Into<String>, params: Vec<Value>) -> Pending<Option<T>>
    where
        T: FromSql + Send + 'static;

    fn query_rows(&self, sql: impl Into<String>, params: Vec<Value>) -> Pending<Vec<Vec<Value>>>;

    /// `CREATE TABLE IF NOT EXISTS` with the given column definitions.
    fn create_table_if_missing(&self, table: &str, columns: &[&str]) -> Pending<()>;

    /// Run `steps` inside one database transaction on one connection.
    ///
    /// Commits if every step succeeds. Otherwise (a panicking step included)
    /// the steps' rollback hooks run, then the database transaction is rolled
    /// back.
    fn run_in_transaction(&self, steps: Vec<SqliteStep>) -> Pending<TransactionOutcome>;
}

impl SqlitePoolExt for SqlitePool {
    fn execute(&self, sql: impl Into<String>, params: Vec<Value>) -> Pending<usize> {
        let sql = sql.into();
        self.submit(move |conn| Ok(conn.execute(&sql, params_from_iter(params))?))
    }

    fn execute_batch(&self, sql: impl Into<String>) -> Pending<()> {
        let sql = sql.into();
        self.submit(move |conn| Ok(conn.execute_batch(&sql)?))
    }

    fn query_scalar<T>(&self, sql: impl Into<String>, params: Vec<Value>) -> Pending<Option<T>>
    where
        T: FromSql + Send + 'static,
    {
        let sql = sql.into();
        self.submit(move |conn| {
            let value = conn
                .query_row(&sql, params_from_iter(params), |row| row.get::<_, T>(0))
                .optional()?;
            Ok(value)
        })
    }

    fn query_rows(&self, sql: impl Into<String>, params: Vec<Value>) -> Pending<Vec<Vec<Value>>> {
        let sql = sql.into();
        self.submit(move |conn| read_rows(conn, &sql, params))
    }

    fn create_table_if_missing(&self, table: &str, columns: &[&str]) -> Pending<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_identifier(table),
            columns.join(", ")
        );
        self.execute_batch(sql)
    }

    fn run_in_transaction(&self, steps: Vec<SqliteStep>) -> Pending<TransactionOutcome> {
        let begin = self.factory().config().begin_statement();
        self.submit(move |conn| in_transaction(conn, begin, steps))
    }
}

fn read_rows(conn: &Connection, sql: &str, params: Vec<Value>) -> Result<Vec<Vec<Value>>, BoxError> {
    let mut stmt = conn.prepare(sql)?;
    let columns = stmt.column_count();
    let rows = stmt
        .query_map(params_from_iter(params), |row| {
            (0..columns)
                .map(|i| row.get::<_, Value>(i))
                .collect::<rusqlite::Result<Vec<_>>>()
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn in_transaction(
    conn: &mut Connection,
    begin: &str,
    steps: Vec<SqliteStep>,
) -> Result<TransactionOutcome, BoxError> {
    // An earlier operation that panicked mid-transaction can leave one open.
    if !conn.is_autocommit() {
        tracing::warn!("Connection has an abandoned transaction, rolling it back");
        conn.execute_batch("ROLLBACK")?;
    }

    conn.execute_batch(begin)?;
    let outcome = run_steps(conn, steps);

    if outcome.is_committed() {
        if let Err(e) = conn.execute_batch("COMMIT") {
            rollback_quietly(conn);
            return Err(e.into());
        }
    } else {
        rollback_quietly(conn);
    }
    Ok(outcome)
}

fn rollback_quietly(conn: &Connection) {
    if conn.is_autocommit() {
        return;
    }
    if let Err(e) = conn.execute_batch("ROLLBACK") {
        tracing::warn!(error = %e, "Failed to roll back transaction");
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
