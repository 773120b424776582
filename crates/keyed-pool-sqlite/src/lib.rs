//! SQLite connections served through a [`keyed_pool::KeyedPool`].
//!
//! Each slot owns one `rusqlite::Connection`. Statements submitted through
//! [`SqlitePoolExt`] run on blocking workers, one at a time per connection.

mod config;
mod connector;
mod ext;

pub use config::{JournalMode, SqliteConfig};
pub use connector::SqliteConnector;
pub use ext::{SqlitePool, SqlitePoolExt, SqliteStep, open};

pub use rusqlite::types::Value;
