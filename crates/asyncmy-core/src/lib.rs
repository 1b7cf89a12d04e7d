//! Core types for the asyncmy MySQL driver.
//!
//! This crate holds the pieces that do not touch a socket:
//!
//! - `Error` taxonomy shared by the codec, the connection and cursors
//! - `Value`, the dynamically typed SQL value used for parameters and results
//! - `Date`, `Time` and `DateTime` with MySQL text formatting
//! - `Row` with positional and by-name access
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod error;
pub mod row;
pub mod temporal;
pub mod value;

pub use error::{
    BusyError, ConfigError, ConnectionError, ConnectionErrorKind, Error, ProtocolError,
    QueryError, QueryErrorKind, Result, TypeError, UnsupportedTypeError,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use temporal::{Date, DateTime, Time};
pub use value::Value;
