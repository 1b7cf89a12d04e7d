//! DB-API style cursors.
//!
//! A [`Cursor`] borrows a connection mutably for its whole life, so at most
//! one cursor can drive a connection at a time. Rows are decoded once and
//! handed to a [`RowFormat`], which decides how a row looks to the caller:
//! a positional [`Row`] for [`Cursor`], a name-keyed [`DictRow`] for
//! [`DictCursor`].
//!
//! ```ignore
//! let mut cur = conn.cursor();
//! cur.execute(&cx, "SELECT id, name FROM users WHERE id = %s", &[Value::Int(1)]).await;
//! let row = cur.fetchone(&cx).await;
//! ```

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::ser::{Serialize, SerializeMap, Serializer};

use asupersync::time::Elapsed;
use asupersync::{Cx, Outcome};
use asyncmy_core::error::ConnectionErrorKind;
use asyncmy_core::{ColumnInfo, Error, Row, Value};

use crate::async_connection::{
    MySqlConnection, QueryResult, try_outcome, try_result, with_timeout,
};
use crate::config::ResultMode;
use crate::connection::{ConnectionState, connection_error};
use crate::types::{ColumnDef, FieldType, bind_params, interpolate_params};

/// Upper bound for statements built by the bulk INSERT rewrite.
pub const DEFAULT_MAX_STMT_LENGTH: usize = 1_024_000;

/// Matches `INSERT ... VALUES (%s, ...)` with an optional
/// `ON DUPLICATE KEY UPDATE` tail.
const INSERT_VALUES_PATTERN: &str = r"(?is)^\s*((?:INSERT|REPLACE)\b.+\bVALUES?\s*)(\(\s*%s\s*(?:,\s*%s\s*)*\))(\s*(?:ON\s+DUPLICATE.*)?);?\s*\z";

fn insert_values_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| match Regex::new(INSERT_VALUES_PATTERN) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(error = %e, "invalid bulk insert pattern; executemany runs row by row");
            None
        }
    })
    .as_ref()
}

/// How a decoded row is presented to the caller.
pub trait RowFormat {
    type Output;

    fn present(columns: &Arc<ColumnInfo>, values: Vec<Value>) -> Self::Output;
}

/// Rows as positional [`Row`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct TupleFormat;

impl RowFormat for TupleFormat {
    type Output = Row;

    fn present(columns: &Arc<ColumnInfo>, values: Vec<Value>) -> Row {
        Row::with_columns(Arc::clone(columns), values)
    }
}

/// Rows as [`DictRow`]s keyed by column name.
#[derive(Debug, Clone, Copy, Default)]
pub struct DictFormat;

impl RowFormat for DictFormat {
    type Output = DictRow;

    fn present(columns: &Arc<ColumnInfo>, values: Vec<Value>) -> DictRow {
        DictRow::from_columns(columns.names(), values)
    }
}

/// A row keyed by column name, in column order.
///
/// When a result has two columns with the same name, the entry sits at the
/// first column's position and holds the last column's value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DictRow {
    entries: Vec<(String, Value)>,
}

impl DictRow {
    fn from_columns(names: &[String], values: Vec<Value>) -> Self {
        let mut entries: Vec<(String, Value)> = Vec::with_capacity(values.len());
        for (name, value) in names.iter().zip(values) {
            match entries.iter_mut().find(|(k, _)| k == name) {
                Some(entry) => entry.1 = value,
                None => entries.push((name.clone(), value)),
            }
        }
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<(String, Value)> {
        self.entries
    }
}

impl Serialize for DictRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// One entry of [`Cursor::description`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescription {
    pub name: String,
    /// Protocol type code
    pub type_code: u8,
    pub field_type: FieldType,
    /// Declared column length
    pub internal_size: u32,
    /// Decimal digits
    pub scale: u8,
    pub null_ok: bool,
}

impl From<&ColumnDef> for ColumnDescription {
    fn from(def: &ColumnDef) -> Self {
        Self {
            name: def.name.clone(),
            type_code: def.column_type.code(),
            field_type: def.column_type,
            internal_size: def.column_length,
            scale: def.decimals,
            null_ok: !def.is_not_null(),
        }
    }
}

/// Cursor over one connection.
pub struct Cursor<'c, F: RowFormat = TupleFormat> {
    conn: &'c mut MySqlConnection,
    mode: ResultMode,
    rows: VecDeque<Vec<Value>>,
    /// Rows of the current result are still on the wire
    streaming: bool,
    columns: Option<Arc<Vec<ColumnDef>>>,
    column_info: Option<Arc<ColumnInfo>>,
    rowcount: i64,
    lastrowid: u64,
    warning_count: u16,
    rownumber: usize,
    arraysize: usize,
    max_stmt_length: usize,
    closed: bool,
    _format: PhantomData<F>,
}

/// Cursor returning [`DictRow`]s.
pub type DictCursor<'c> = Cursor<'c, DictFormat>;

impl<F: RowFormat> std::fmt::Debug for Cursor<'_, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("mode", &self.mode)
            .field("rowcount", &self.rowcount)
            .field("rownumber", &self.rownumber)
            .field("buffered", &self.rows.len())
            .field("streaming", &self.streaming)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<'c, F: RowFormat> Cursor<'c, F> {
    pub fn new(conn: &'c mut MySqlConnection) -> Self {
        let mode = conn.config().result_mode;
        Self {
            conn,
            mode,
            rows: VecDeque::new(),
            streaming: false,
            columns: None,
            column_info: None,
            rowcount: -1,
            lastrowid: 0,
            warning_count: 0,
            rownumber: 0,
            arraysize: 1,
            max_stmt_length: DEFAULT_MAX_STMT_LENGTH,
            closed: false,
            _format: PhantomData,
        }
    }

    /// Override the connection's configured result mode for this cursor.
    pub fn with_result_mode(mut self, mode: ResultMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn result_mode(&self) -> ResultMode {
        self.mode
    }

    /// Default batch size of [`fetchmany`](Self::fetchmany).
    pub fn arraysize(&self) -> usize {
        self.arraysize
    }

    pub fn set_arraysize(&mut self, size: usize) {
        self.arraysize = size.max(1);
    }

    pub fn max_stmt_length(&self) -> usize {
        self.max_stmt_length
    }

    pub fn set_max_stmt_length(&mut self, len: usize) {
        self.max_stmt_length = len;
    }

    /// Rows affected by the last statement, or rows in the current result
    /// set. -1 while unknown (before any execute, or mid-stream).
    pub fn rowcount(&self) -> i64 {
        self.rowcount
    }

    /// AUTO_INCREMENT id generated by the last statement.
    pub fn lastrowid(&self) -> u64 {
        self.lastrowid
    }

    pub fn warning_count(&self) -> u16 {
        self.warning_count
    }

    /// Rows fetched from the current result set so far.
    pub fn rownumber(&self) -> usize {
        self.rownumber
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Column metadata of the current result set; `None` after a statement
    /// without one.
    pub fn description(&self) -> Option<Vec<ColumnDescription>> {
        self.columns
            .as_ref()
            .map(|cols| cols.iter().map(ColumnDescription::from).collect())
    }

    pub fn connection(&mut self) -> &mut MySqlConnection {
        self.conn
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.conn.state() == ConnectionState::Closed {
            return Err(connection_error(
                ConnectionErrorKind::Closed,
                "connection is closed",
            ));
        }
        if self.closed {
            return Err(connection_error(
                ConnectionErrorKind::Closed,
                "cursor is closed",
            ));
        }
        Ok(())
    }

    fn reset_result(&mut self) {
        self.rows.clear();
        self.streaming = false;
        self.columns = None;
        self.column_info = None;
        self.rowcount = -1;
        self.rownumber = 0;
        self.warning_count = 0;
    }

    fn settle<T>(&mut self, result: Result<Outcome<T, Error>, Elapsed>) -> Outcome<T, Error> {
        match result {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!("cursor command timed out; closing connection");
                self.conn.abort();
                self.reset_result();
                Outcome::Err(Error::Timeout)
            }
        }
    }

    /// Run a statement with `%s` placeholders bound to `params`.
    ///
    /// Returns the affected-row count for statements without a result set.
    /// For a result set, returns the number of rows read: all of them in
    /// buffered mode, 0 in streaming mode.
    #[tracing::instrument(level = "debug", skip(self, cx, params))]
    pub async fn execute(&mut self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<u64, Error> {
        let limit = self.conn.config().command_timeout;
        self.execute_with_timeout(cx, sql, params, limit).await
    }

    /// [`execute`](Self::execute) with an explicit limit. Expiry closes the
    /// connection.
    pub async fn execute_with_timeout(
        &mut self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
        limit: Option<Duration>,
    ) -> Outcome<u64, Error> {
        try_result!(self.check_open());
        let sql = try_result!(interpolate_params(
            sql,
            params,
            self.conn.no_backslash_escapes()
        ));
        let result = with_timeout(cx, limit, self.run(cx, &sql)).await;
        self.settle(result)
    }

    async fn run(&mut self, cx: &Cx, sql: &str) -> Outcome<u64, Error> {
        self.reset_result();
        let result = try_outcome!(self.conn.run_query(cx, sql).await);
        self.load(cx, result).await
    }

    async fn load(&mut self, cx: &Cx, result: QueryResult) -> Outcome<u64, Error> {
        match result {
            QueryResult::Done(ok) => {
                self.rowcount = clamp_count(ok.affected_rows);
                self.lastrowid = ok.last_insert_id;
                self.warning_count = ok.warnings;
                Outcome::Ok(ok.affected_rows)
            }
            QueryResult::Rows(columns) => {
                self.column_info = Some(Arc::new(ColumnInfo::new(
                    columns.iter().map(|c| c.name.clone()).collect(),
                )));
                self.columns = Some(columns);
                match self.mode {
                    ResultMode::Streaming => {
                        self.streaming = true;
                        Outcome::Ok(0)
                    }
                    ResultMode::Buffered => {
                        while let Some(values) = try_outcome!(self.conn.fetch_row(cx).await) {
                            self.rows.push_back(values);
                        }
                        self.warning_count = self.conn.warning_count();
                        let count = self.rows.len() as u64;
                        self.rowcount = clamp_count(count);
                        Outcome::Ok(count)
                    }
                }
            }
        }
    }

    /// Run a statement once per parameter row and return the summed counts.
    ///
    /// `INSERT`/`REPLACE ... VALUES (%s, ...)` is sent as multi-row inserts
    /// instead, each at most [`max_stmt_length`](Self::max_stmt_length)
    /// bytes unless a single row is longer. No transaction is opened.
    #[tracing::instrument(level = "debug", skip(self, cx, rows), fields(rows = rows.len()))]
    pub async fn executemany(
        &mut self,
        cx: &Cx,
        sql: &str,
        rows: &[Vec<Value>],
    ) -> Outcome<u64, Error> {
        try_result!(self.check_open());
        if rows.is_empty() {
            return Outcome::Ok(0);
        }
        let limit = self.conn.config().command_timeout;
        let result = with_timeout(cx, limit, self.run_many(cx, sql, rows)).await;
        let total = try_outcome!(self.settle(result));
        self.rowcount = clamp_count(total);
        Outcome::Ok(total)
    }

    async fn run_many(&mut self, cx: &Cx, sql: &str, rows: &[Vec<Value>]) -> Outcome<u64, Error> {
        let nbe = self.conn.no_backslash_escapes();
        if let Some(caps) = insert_values_regex().and_then(|re| re.captures(sql)) {
            let prefix = caps.get(1).map_or("", |m| m.as_str());
            let values = caps.get(2).map_or("", |m| m.as_str());
            let postfix = caps.get(3).map_or("", |m| m.as_str()).trim_end();
            return self.run_bulk(cx, prefix, values, postfix, rows, nbe).await;
        }

        let mut total = 0u64;
        for params in rows {
            let statement = try_result!(bind_params(sql, params, nbe));
            total += try_outcome!(self.run(cx, &statement).await);
        }
        Outcome::Ok(total)
    }

    async fn run_bulk(
        &mut self,
        cx: &Cx,
        prefix: &str,
        values: &str,
        postfix: &str,
        rows: &[Vec<Value>],
        nbe: bool,
    ) -> Outcome<u64, Error> {
        let mut total = 0u64;
        let mut statement = String::from(prefix);
        let mut batched = 0usize;
        for params in rows {
            let tuple = try_result!(bind_params(values, params, nbe));
            if batched > 0 && statement.len() + tuple.len() + postfix.len() + 1 > self.max_stmt_length {
                statement.push_str(postfix);
                tracing::trace!(rows = batched, len = statement.len(), "bulk insert batch");
                total += try_outcome!(self.run(cx, &statement).await);
                statement = String::from(prefix);
                batched = 0;
            }
            if batched > 0 {
                statement.push(',');
            }
            statement.push_str(&tuple);
            batched += 1;
        }
        statement.push_str(postfix);
        tracing::trace!(rows = batched, len = statement.len(), "bulk insert batch");
        total += try_outcome!(self.run(cx, &statement).await);
        Outcome::Ok(total)
    }

    async fn next_values(&mut self, cx: &Cx) -> Outcome<Option<Vec<Value>>, Error> {
        try_result!(self.check_open());
        if let Some(values) = self.rows.pop_front() {
            self.rownumber += 1;
            return Outcome::Ok(Some(values));
        }
        if !self.streaming {
            return Outcome::Ok(None);
        }
        match try_outcome!(self.conn.next_row(cx).await) {
            Some(values) => {
                self.rownumber += 1;
                Outcome::Ok(Some(values))
            }
            None => {
                self.streaming = false;
                self.rowcount = clamp_count(self.rownumber as u64);
                self.warning_count = self.conn.warning_count();
                Outcome::Ok(None)
            }
        }
    }

    fn present(&self, values: Vec<Value>) -> F::Output {
        match &self.column_info {
            Some(info) => F::present(info, values),
            None => F::present(&Arc::new(ColumnInfo::new(Vec::new())), values),
        }
    }

    /// Next row, or `None` once the result set is exhausted.
    pub async fn fetchone(&mut self, cx: &Cx) -> Outcome<Option<F::Output>, Error> {
        let values = try_outcome!(self.next_values(cx).await);
        Outcome::Ok(values.map(|v| self.present(v)))
    }

    /// Up to `size` rows (default [`arraysize`](Self::arraysize)).
    pub async fn fetchmany(&mut self, cx: &Cx, size: Option<usize>) -> Outcome<Vec<F::Output>, Error> {
        let size = size.unwrap_or(self.arraysize);
        let mut out = Vec::with_capacity(size.min(1024));
        while out.len() < size {
            match try_outcome!(self.next_values(cx).await) {
                Some(values) => out.push(self.present(values)),
                None => break,
            }
        }
        Outcome::Ok(out)
    }

    /// Every remaining row; empty once the result set is exhausted.
    pub async fn fetchall(&mut self, cx: &Cx) -> Outcome<Vec<F::Output>, Error> {
        let mut out = Vec::with_capacity(self.rows.len());
        while let Some(values) = try_outcome!(self.next_values(cx).await) {
            out.push(self.present(values));
        }
        Outcome::Ok(out)
    }

    /// Move to the next result set of a multi-statement response.
    /// Returns `false` when there is none.
    pub async fn nextset(&mut self, cx: &Cx) -> Outcome<bool, Error> {
        try_result!(self.check_open());
        self.reset_result();
        let Some(result) = try_outcome!(self.conn.next_result(cx).await) else {
            return Outcome::Ok(false);
        };
        let limit = self.conn.config().command_timeout;
        let loaded = with_timeout(cx, limit, self.load(cx, result)).await;
        try_outcome!(self.settle(loaded));
        Outcome::Ok(true)
    }

    /// Discard buffered rows and drain whatever is left on the wire.
    /// Calling it again is a no-op.
    pub async fn close(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.closed {
            return Outcome::Ok(());
        }
        self.closed = true;
        self.rows.clear();
        self.streaming = false;
        if self.conn.is_usable() && self.conn.has_pending_result() {
            tracing::trace!("draining unread results on cursor close");
            return self.conn.drain(cx).await;
        }
        Outcome::Ok(())
    }
}

fn clamp_count(count: u64) -> i64 {
    i64::try_from(count).unwrap_or_else(|_| {
        tracing::warn!(count, "row count exceeds i64::MAX; clamping");
        i64::MAX
    })
}

impl MySqlConnection {
    /// A tuple cursor on this connection.
    pub fn cursor(&mut self) -> Cursor<'_> {
        Cursor::new(self)
    }

    /// A dict cursor on this connection.
    pub fn dict_cursor(&mut self) -> DictCursor<'_> {
        Cursor::new(self)
    }

    /// Run `f` with a fresh cursor, then close it, draining any results `f`
    /// left unread. An error from `f` takes precedence over one from the
    /// drain.
    pub async fn with_cursor<T, Func>(&mut self, cx: &Cx, f: Func) -> Outcome<T, Error>
    where
        Func: AsyncFnOnce(&mut Cursor<'_>) -> Outcome<T, Error>,
    {
        let mut cursor = self.cursor();
        let outcome = f(&mut cursor).await;
        scoped(outcome, cursor.close(cx).await)
    }

    /// [`with_cursor`](Self::with_cursor) for a dict cursor.
    pub async fn with_dict_cursor<T, Func>(&mut self, cx: &Cx, f: Func) -> Outcome<T, Error>
    where
        Func: AsyncFnOnce(&mut DictCursor<'_>) -> Outcome<T, Error>,
    {
        let mut cursor = self.dict_cursor();
        let outcome = f(&mut cursor).await;
        scoped(outcome, cursor.close(cx).await)
    }
}

fn scoped<T>(outcome: Outcome<T, Error>, closed: Outcome<(), Error>) -> Outcome<T, Error> {
    match outcome {
        Outcome::Ok(v) => match closed {
            Outcome::Ok(()) => Outcome::Ok(v),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        },
        failure => failure,
    }
}
