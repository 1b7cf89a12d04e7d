//! Asynchronous MySQL client driver.
//!
//! This crate speaks the MySQL client/server protocol directly over
//! asupersync's TCP primitives. It provides:
//!
//! - Packet framing with sequence numbers
//! - Authentication (mysql_native_password, caching_sha2_password,
//!   sha256_password, mysql_clear_password over TLS)
//! - Optional TLS via rustls (`tls` feature)
//! - Text and binary query protocols, prepared statements
//! - DB-API style cursors with tuple and dict rows
//!
//! # Example
//!
//! ```rust,ignore
//! use asyncmy::{MySqlConfig, MySqlConnection, Value};
//!
//! let config = MySqlConfig::new()
//!     .host("localhost")
//!     .user("root")
//!     .database("mydb");
//!
//! let mut conn = MySqlConnection::connect(&cx, config).await?;
//! let mut cur = conn.cursor();
//! cur.execute(&cx, "SELECT name FROM users WHERE id = %s", &[Value::Int(7)]).await?;
//! let row = cur.fetchone(&cx).await?;
//! ```

pub mod async_connection;
pub mod auth;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod protocol;
pub mod tls;
pub mod types;

mod stream;

#[cfg(test)]
mod mock;

pub use async_connection::{MySqlConnection, QueryResult, SharedMySqlConnection};
pub use config::{MySqlConfig, ResultMode, SslMode, TlsConfig};
pub use connection::ConnectionState;
pub use cursor::{ColumnDescription, Cursor, DictCursor, DictFormat, DictRow, RowFormat, TupleFormat};
pub use protocol::PreparedStatement;
pub use types::{ColumnDef, FieldType, ProtocolMode};

pub use asyncmy_core::{
    ColumnInfo, ConnectionError, ConnectionErrorKind, Cx, Date, DateTime, Error, FromValue,
    Outcome, QueryError, QueryErrorKind, Result, Row, Time, Value,
};
