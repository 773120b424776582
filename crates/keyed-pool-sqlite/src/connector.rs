//! Opens and closes one SQLite connection per pool slot.

use keyed_pool::{BoxError, ResourceFactory, SlotId};
use rusqlite::{Connection, OpenFlags};

use crate::config::SqliteConfig;

/// [`ResourceFactory`] producing SQLite connections.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    config: SqliteConfig,
}

impl SqliteConnector {
    pub fn new(config: SqliteConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    fn open(&self) -> rusqlite::Result<Connection> {
        // Each connection is only touched by one operation at a time.
        let flags = if self.config.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
        };
        let connection = Connection::open_with_flags(&self.config.path, flags)?;
        self.apply_pragmas(&connection)?;
        Ok(connection)
    }

    fn apply_pragmas(&self, connection: &Connection) -> rusqlite::Result<()> {
        connection.busy_timeout(self.config.busy_timeout())?;
        let foreign_keys = if self.config.foreign_keys { "ON" } else { "OFF" };
        connection.execute_batch(&format!("PRAGMA foreign_keys = {foreign_keys};"))?;
        if !self.config.read_only {
            connection.execute_batch(&format!(
                "PRAGMA journal_mode = {};",
                self.config.journal_mode.pragma_value()
            ))?;
        }
        Ok(())
    }
}

impl ResourceFactory for SqliteConnector {
    type Handle = Connection;

    fn create(&self, slot: SlotId) -> Result<Connection, BoxError> {
        let connection = self.open()?;
        tracing::debug!(%slot, path = %self.config.path.display(), "Opened SQLite connection");
        Ok(connection)
    }

    fn dispose(&self, slot: SlotId, connection: Connection) -> Result<(), BoxError> {
        connection.close().map_err(|(_, e)| e)?;
        tracing::debug!(%slot, "Closed SQLite connection");
        Ok(())
    }
}
