//! Async MySQL connection.
//!
//! [`MySqlConnection`] owns the socket and drives the half-duplex protocol:
//! one command at a time, with its whole response read (or drained) before
//! the next command is written. Result sets are pulled row by row with
//! [`MySqlConnection::next_row`]; the cursor layer builds on that.
//!
//! Every packet read and write first checks the `Cx` for cancellation. A
//! cancelled or timed-out command closes the connection, since the server
//! may still be streaming its response.

// The Error type is intentionally large to carry full context
#![allow(clippy::result_large_err)]

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use asupersync::net::TcpStream;
use asupersync::time::{self, Elapsed};
use asupersync::sync::Mutex;
use asupersync::{Cx, Outcome};

use asyncmy_core::error::{BusyError, ConnectionErrorKind, QueryError, QueryErrorKind};
use asyncmy_core::{ColumnInfo, Error, Row, Value};

use crate::auth::{self, AuthPlugin, caching_sha2};
use crate::config::MySqlConfig;
use crate::connection::{
    AuthSwitchRequest, ConnectionState, HandshakeResponse, ServerHandshake, auth_error,
    connection_error, validate_savepoint_name,
};
use crate::protocol::codec::{decode_row_terminator, frame_count, protocol_error};
use crate::protocol::{
    Command, OkPacket, Packet, PacketReader, PreparedStatement, build_stmt_close,
    build_stmt_execute, build_stmt_prepare, build_stmt_reset, capabilities, decode_packet, frame,
    is_row_terminator, parse_stmt_prepare_ok, server_status, try_unframe,
};
use crate::stream::MySqlStream;
use crate::tls;
use crate::types::{
    ColumnDef, ProtocolMode, decode_binary_row, decode_text_row, escape_string,
    interpolate_params, literal,
};

/// Unwrap `Outcome::Ok`, returning every other variant to the caller.
macro_rules! try_outcome {
    ($e:expr) => {
        match $e {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    };
}

/// Unwrap a `Result` inside a fn returning `Outcome`.
macro_rules! try_result {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Outcome::Err(e),
        }
    };
}

/// Run `$fut` under `$limit`, closing the connection when it expires.
macro_rules! timed {
    ($cx:expr, $conn:ident, $limit:expr, $fut:expr) => {{
        let limit = $limit;
        let result = with_timeout($cx, limit, $fut).await;
        $conn.settle(result)
    }};
}

/// Drive `fut` until it finishes or `limit` passes on the runtime clock.
pub(crate) async fn with_timeout<F: Future>(
    cx: &Cx,
    limit: Option<Duration>,
    fut: F,
) -> Result<F::Output, Elapsed> {
    let Some(limit) = limit else {
        return Ok(fut.await);
    };
    let now = cx
        .timer_driver()
        .map_or_else(time::wall_now, |driver| driver.now());
    time::timeout(now, limit, fut).await
}

pub(crate) use try_outcome;
pub(crate) use try_result;

/// First response to a command.
#[derive(Debug, Clone)]
pub enum QueryResult {
    /// The statement produced no result set
    Done(OkPacket),
    /// A result set; its rows are pulled with [`MySqlConnection::next_row`]
    Rows(Arc<Vec<ColumnDef>>),
}

impl QueryResult {
    pub fn columns(&self) -> Option<&Arc<Vec<ColumnDef>>> {
        match self {
            QueryResult::Rows(columns) => Some(columns),
            QueryResult::Done(_) => None,
        }
    }
}

/// What is left of the current response on the wire.
#[derive(Debug, Clone)]
enum Pending {
    Idle,
    Rows {
        columns: Arc<Vec<ColumnDef>>,
        mode: ProtocolMode,
    },
    /// The last OK carried SERVER_MORE_RESULTS_EXISTS
    NextResult { mode: ProtocolMode },
}

/// Async MySQL connection.
pub struct MySqlConnection {
    stream: MySqlStream,
    state: ConnectionState,
    config: MySqlConfig,
    server: Option<ServerHandshake>,
    /// Negotiated capabilities
    client_caps: u32,
    sequence_id: u8,
    read_buf: Vec<u8>,
    read_pos: usize,
    pending: Pending,
    /// Set while a socket read or write is awaited. Still set on entry to a
    /// command means the previous command's future was dropped mid-flight.
    io_in_progress: bool,
    status_flags: u16,
    last_ok: OkPacket,
}

impl std::fmt::Debug for MySqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("state", &self.state)
            .field("connection_id", &self.connection_id())
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("database", &self.config.database)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl MySqlConnection {
    fn new(stream: MySqlStream, config: MySqlConfig) -> Self {
        Self {
            stream,
            state: ConnectionState::Connecting,
            config,
            server: None,
            client_caps: 0,
            sequence_id: 0,
            read_buf: Vec::with_capacity(8192),
            read_pos: 0,
            pending: Pending::Idle,
            io_in_progress: false,
            status_flags: 0,
            last_ok: OkPacket::default(),
        }
    }

    /// Open a connection: TCP connect, server greeting, optional TLS
    /// upgrade, authentication and session setup.
    #[tracing::instrument(level = "debug", skip(cx, config), fields(host = %config.host, port = config.port))]
    pub async fn connect(cx: &Cx, config: MySqlConfig) -> Outcome<Self, Error> {
        try_result!(tls::validate_tls_config(
            config.ssl_mode,
            &config.tls_config
        ));

        let addr = config.socket_addr();
        let socket_addr = try_result!(resolve(&addr));
        let stream = match TcpStream::connect_timeout(socket_addr, config.connect_timeout).await {
            Ok(s) => s,
            Err(e) => {
                let kind = if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    ConnectionErrorKind::Refused
                } else {
                    ConnectionErrorKind::Connect
                };
                return Outcome::Err(Error::Connection(asyncmy_core::ConnectionError {
                    kind,
                    message: format!("failed to connect to {}: {}", addr, e),
                    source: Some(Box::new(e)),
                }));
            }
        };
        stream.set_nodelay(true).ok();

        Self::establish(cx, MySqlStream::Plain(stream), config).await
    }

    /// Run the handshake over an already-open stream.
    pub(crate) async fn establish(
        cx: &Cx,
        stream: MySqlStream,
        config: MySqlConfig,
    ) -> Outcome<Self, Error> {
        let mut conn = Self::new(stream, config);
        let outcome = timed!(cx, conn, Some(conn.config.connect_timeout), conn.handshake(cx));
        match outcome {
            Outcome::Ok(()) => Outcome::Ok(conn),
            Outcome::Err(e) => {
                conn.shutdown();
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    // ==================== Accessors ====================

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Cheap health check: open, and not left mid-packet by a dropped future.
    pub fn is_usable(&self) -> bool {
        matches!(self.state, ConnectionState::Ready | ConnectionState::Busy) && !self.io_in_progress
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    pub fn connection_id(&self) -> u32 {
        self.server.as_ref().map_or(0, |s| s.connection_id)
    }

    pub fn server_version(&self) -> Option<&str> {
        self.server.as_ref().map(|s| s.server_version.as_str())
    }

    pub fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    /// Affected rows reported by the last completed statement.
    pub fn affected_rows(&self) -> u64 {
        self.last_ok.affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_ok.last_insert_id
    }

    pub fn warning_count(&self) -> u16 {
        self.last_ok.warnings
    }

    pub fn status_flags(&self) -> u16 {
        self.status_flags
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_IN_TRANS != 0
    }

    /// Server-side autocommit, as last reported in a status flag.
    pub fn autocommit_enabled(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_AUTOCOMMIT != 0
    }

    /// NO_BACKSLASH_ESCAPES is in the session's sql_mode.
    pub fn no_backslash_escapes(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_NO_BACKSLASH_ESCAPES != 0
    }

    /// Rows or further result sets of the last command are still unread.
    pub fn has_pending_result(&self) -> bool {
        !matches!(self.pending, Pending::Idle)
    }

    /// Escape a string for the current session's sql_mode (no quotes added).
    pub fn escape_string(&self, s: &str) -> String {
        escape_string(s, self.no_backslash_escapes())
    }

    /// Render a value as an SQL literal for the current session.
    pub fn literal(&self, value: &Value) -> Result<String, Error> {
        literal(value, self.no_backslash_escapes())
    }

    fn deprecate_eof(&self) -> bool {
        self.client_caps & capabilities::CLIENT_DEPRECATE_EOF != 0
    }

    // ==================== Handshake ====================

    async fn handshake(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let payload = try_outcome!(self.read_packet(cx).await);
        let server = try_result!(ServerHandshake::parse(&payload));
        tracing::debug!(
            server_version = %server.server_version,
            connection_id = server.connection_id,
            plugin = %server.auth_plugin,
            "server greeting"
        );

        self.state = try_result!(self.state.transition(ConnectionState::Authenticating));
        self.status_flags = server.status_flags;
        self.client_caps = self.config.capability_flags(server.capabilities);

        if try_result!(tls::should_upgrade(self.config.ssl_mode, server.capabilities)) {
            try_outcome!(self.start_tls(cx).await);
        }

        let password = self.config.password.clone().unwrap_or_default();
        let plugin = AuthPlugin::from_name(&server.auth_plugin).unwrap_or_else(|| {
            tracing::debug!(
                plugin = %server.auth_plugin,
                "unknown auth plugin in greeting; answering with mysql_native_password"
            );
            AuthPlugin::NativePassword
        });
        let auth_response =
            try_result!(self.first_auth_response(plugin, &password, &server.auth_data));

        let response = HandshakeResponse {
            client_caps: self.client_caps,
            max_packet_size: self.config.max_packet_size,
            charset: self.config.charset,
            user: &self.config.user,
            auth_response: &auth_response,
            database: self.config.database.as_deref(),
            auth_plugin: plugin.name(),
            attributes: &self.config.attributes,
        }
        .build();
        try_outcome!(self.write_packet(cx, &response).await);

        let seed = server.auth_data.clone();
        self.server = Some(server);
        try_outcome!(self.authenticate(cx, plugin, seed, &password).await);

        self.state = try_result!(self.state.transition(ConnectionState::Ready));
        self.setup_session(cx).await
    }

    #[cfg(feature = "tls")]
    async fn start_tls(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.client_caps |= capabilities::CLIENT_SSL;
        let request = tls::build_ssl_request(
            self.client_caps,
            self.config.max_packet_size,
            self.config.charset,
        );
        try_outcome!(self.write_packet(cx, &request).await);

        let plain = std::mem::replace(&mut self.stream, MySqlStream::Closed);
        self.stream = try_result!(
            plain
                .upgrade(
                    &self.config.host,
                    self.config.ssl_mode,
                    &self.config.tls_config
                )
                .await
        );
        Outcome::Ok(())
    }

    #[cfg(not(feature = "tls"))]
    async fn start_tls(&mut self, _cx: &Cx) -> Outcome<(), Error> {
        Outcome::Err(tls::tls_error(
            "TLS requested but asyncmy was built without the `tls` feature",
        ))
    }

    async fn authenticate(
        &mut self,
        cx: &Cx,
        mut plugin: AuthPlugin,
        mut seed: Vec<u8>,
        password: &str,
    ) -> Outcome<(), Error> {
        loop {
            let payload = try_outcome!(self.read_packet(cx).await);
            match payload.first() {
                Some(0x00) => {
                    let ok = PacketReader::new(&payload)
                        .parse_ok_packet()
                        .unwrap_or_default();
                    self.status_flags = ok.status_flags;
                    tracing::debug!(plugin = plugin.name(), "authenticated");
                    return Outcome::Ok(());
                }
                Some(0xFF) => {
                    let message = match PacketReader::new(&payload).parse_err_packet() {
                        Some(e) => format!("access denied ({}): {}", e.error_code, e.error_message),
                        None => "authentication failed".to_string(),
                    };
                    return Outcome::Err(auth_error(message));
                }
                Some(0xFE) => {
                    let switch = try_result!(AuthSwitchRequest::parse(&payload));
                    let Some(next) = AuthPlugin::from_name(&switch.plugin) else {
                        return Outcome::Err(auth_error(format!(
                            "unsupported authentication plugin '{}'",
                            switch.plugin
                        )));
                    };
                    tracing::debug!(from = plugin.name(), to = next.name(), "auth switch");
                    plugin = next;
                    seed = switch.data;
                    let response =
                        try_result!(self.first_auth_response(plugin, password, &seed));
                    try_outcome!(self.write_packet(cx, &response).await);
                }
                Some(0x01) => {
                    try_outcome!(
                        self.auth_more_data(cx, plugin, &seed, password, &payload[1..])
                            .await
                    );
                }
                other => {
                    return Outcome::Err(protocol_error(format!(
                        "unexpected packet during authentication (tag {:?})",
                        other
                    )));
                }
            }
        }
    }

    async fn auth_more_data(
        &mut self,
        cx: &Cx,
        plugin: AuthPlugin,
        seed: &[u8],
        password: &str,
        data: &[u8],
    ) -> Outcome<(), Error> {
        match (plugin, data.first()) {
            (AuthPlugin::CachingSha2, Some(&caching_sha2::FAST_AUTH_SUCCESS)) => {
                tracing::trace!("caching_sha2_password fast auth success");
                Outcome::Ok(())
            }
            (AuthPlugin::CachingSha2, Some(&caching_sha2::PERFORM_FULL_AUTH)) => {
                if self.stream.is_tls() {
                    tracing::trace!("caching_sha2_password full auth over TLS");
                    return self.write_packet(cx, &auth::clear_password(password)).await;
                }
                let key = match self.config.server_public_key.clone() {
                    Some(key) => key,
                    None => {
                        tracing::trace!("requesting server public key");
                        try_outcome!(
                            self.write_packet(cx, &[caching_sha2::REQUEST_PUBLIC_KEY])
                                .await
                        );
                        let packet = try_outcome!(self.read_packet(cx).await);
                        match packet.split_first() {
                            Some((&0x01, pem)) => pem.to_vec(),
                            _ => {
                                return Outcome::Err(auth_error(
                                    "server did not send its RSA public key",
                                ));
                            }
                        }
                    }
                };
                let use_oaep = self
                    .server
                    .as_ref()
                    .is_none_or(|s| s.version_at_least(8, 0, 5));
                self.send_rsa_password(cx, password, seed, &key, use_oaep)
                    .await
            }
            // The server answered the key request of the initial response.
            (AuthPlugin::Sha256, _) => {
                self.send_rsa_password(cx, password, seed, data, true)
                    .await
            }
            _ => Outcome::Err(protocol_error(format!(
                "unexpected auth more-data packet for {}",
                plugin.name()
            ))),
        }
    }

    /// First response for `plugin`. A configured server key lets
    /// `sha256_password` encrypt at once instead of requesting the key.
    fn first_auth_response(
        &self,
        plugin: AuthPlugin,
        password: &str,
        seed: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let secure = self.stream.is_tls();
        if let (AuthPlugin::Sha256, false, Some(key)) =
            (plugin, secure, self.config.server_public_key.as_deref())
        {
            if !password.is_empty() {
                tracing::trace!("sha256_password with configured server key");
                return auth::sha256_password_rsa(password, seed, key, true).map_err(auth_error);
            }
        }
        plugin
            .initial_response(password, seed, secure)
            .ok_or_else(|| auth_error(format!("{} requires a TLS connection", plugin.name())))
    }

    async fn send_rsa_password(
        &mut self,
        cx: &Cx,
        password: &str,
        seed: &[u8],
        public_key: &[u8],
        use_oaep: bool,
    ) -> Outcome<(), Error> {
        let cipher = match auth::sha256_password_rsa(password, seed, public_key, use_oaep) {
            Ok(c) => c,
            Err(message) => return Outcome::Err(auth_error(message)),
        };
        self.write_packet(cx, &cipher).await
    }

    async fn setup_session(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Some(mode) = self.config.sql_mode.clone() {
            let value = try_result!(self.literal(&Value::Text(mode)));
            try_outcome!(self.simple(cx, &format!("SET sql_mode = {}", value)).await);
        }
        if let Some(init) = self.config.init_command.clone() {
            try_outcome!(self.simple(cx, &init).await);
        }
        if let Some(enabled) = self.config.autocommit {
            try_outcome!(self.simple(cx, autocommit_sql(enabled)).await);
        }
        Outcome::Ok(())
    }

    // ==================== Packet I/O ====================

    async fn write_packet(&mut self, cx: &Cx, payload: &[u8]) -> Outcome<(), Error> {
        if let Some(reason) = cx.cancel_reason() {
            self.shutdown();
            return Outcome::Cancelled(reason);
        }

        let bytes = frame(payload, self.sequence_id);
        tracing::trace!(len = payload.len(), seq = self.sequence_id, "send packet");
        self.sequence_id = self
            .sequence_id
            .wrapping_add(frame_count(payload.len()) as u8);

        self.io_in_progress = true;
        let result = match self.stream.write_all(&bytes).await {
            Ok(()) => self.stream.flush().await,
            Err(e) => Err(e),
        };
        self.io_in_progress = false;

        if let Err(e) = result {
            self.shutdown();
            return Outcome::Err(io_failure("write to", e));
        }
        Outcome::Ok(())
    }

    async fn read_packet(&mut self, cx: &Cx) -> Outcome<Vec<u8>, Error> {
        if let Some(reason) = cx.cancel_reason() {
            self.shutdown();
            return Outcome::Cancelled(reason);
        }

        loop {
            match try_unframe(&self.read_buf[self.read_pos..], self.sequence_id) {
                Ok(Some(frame)) => {
                    self.read_pos += frame.consumed;
                    if self.read_pos == self.read_buf.len() {
                        self.read_buf.clear();
                        self.read_pos = 0;
                    }
                    tracing::trace!(len = frame.payload.len(), seq = frame.seq, "recv packet");
                    self.sequence_id = frame.next_seq;
                    return Outcome::Ok(frame.payload);
                }
                Ok(None) => {}
                Err(e) => return self.fail(e),
            }

            if self.read_pos > 0 {
                self.read_buf.drain(..self.read_pos);
                self.read_pos = 0;
            }

            let mut chunk = [0u8; 8192];
            self.io_in_progress = true;
            let read = self.stream.read_some(&mut chunk).await;
            self.io_in_progress = false;

            match read {
                Ok(0) => {
                    self.shutdown();
                    return Outcome::Err(connection_error(
                        ConnectionErrorKind::Disconnected,
                        "connection closed by server",
                    ));
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    self.shutdown();
                    return Outcome::Err(io_failure("read from", e));
                }
            }
        }
    }

    /// Drop the socket without telling the server.
    fn shutdown(&mut self) {
        if self.state != ConnectionState::Closed {
            tracing::debug!(state = ?self.state, "closing connection");
        }
        self.stream = MySqlStream::Closed;
        self.state = ConnectionState::Closed;
        self.pending = Pending::Idle;
        self.read_buf.clear();
        self.read_pos = 0;
        self.io_in_progress = false;
    }

    fn fail<T>(&mut self, e: Error) -> Outcome<T, Error> {
        self.shutdown();
        Outcome::Err(e)
    }

    fn settle<T>(&mut self, result: Result<Outcome<T, Error>, Elapsed>) -> Outcome<T, Error> {
        match result {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!("command timed out; closing connection");
                self.shutdown();
                Outcome::Err(Error::Timeout)
            }
        }
    }

    // ==================== Command cycle ====================

    async fn begin_command(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.io_in_progress {
            tracing::warn!("previous command was abandoned mid-flight; closing connection");
            self.shutdown();
            return Outcome::Err(connection_error(
                ConnectionErrorKind::Disconnected,
                "previous command was interrupted; the connection was closed",
            ));
        }
        match self.state {
            ConnectionState::Ready => {}
            ConnectionState::Busy => {
                tracing::warn!("previous result was not fully read; draining it");
                match self.drain_untimed(cx).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e @ Error::Query(_)) => {
                        tracing::warn!(error = %e, "error while draining previous result");
                    }
                    other => return other,
                }
            }
            ConnectionState::Closed => return Outcome::Err(closed_error()),
            ConnectionState::Connecting | ConnectionState::Authenticating => {
                return Outcome::Err(protocol_error("connection is not established"));
            }
        }
        self.state = try_result!(self.state.transition(ConnectionState::Busy));
        self.sequence_id = 0;
        Outcome::Ok(())
    }

    fn become_ready(&mut self) {
        self.pending = Pending::Idle;
        if self.state == ConnectionState::Busy {
            tracing::trace!("connection state Busy -> Ready");
            self.state = ConnectionState::Ready;
        }
    }

    fn finish_statement(&mut self, ok: &OkPacket, mode: ProtocolMode) {
        self.status_flags = ok.status_flags;
        self.last_ok = ok.clone();
        if ok.more_results() {
            self.pending = Pending::NextResult { mode };
        } else {
            self.become_ready();
        }
    }

    fn finish_error(&mut self) {
        self.become_ready();
    }

    /// Write a command and read the first response packet(s).
    async fn dispatch(
        &mut self,
        cx: &Cx,
        payload: &[u8],
        mode: ProtocolMode,
    ) -> Outcome<QueryResult, Error> {
        try_outcome!(self.begin_command(cx).await);
        try_outcome!(self.write_packet(cx, payload).await);
        let result = try_outcome!(self.read_result(cx, mode).await);
        self.checked(cx, result).await
    }

    async fn read_result(&mut self, cx: &Cx, mode: ProtocolMode) -> Outcome<QueryResult, Error> {
        loop {
            let payload = try_outcome!(self.read_packet(cx).await);
            let packet = match decode_packet(&payload) {
                Ok(p) => p,
                Err(e) => return self.fail(e),
            };
            match packet {
                Packet::Ok(ok) => {
                    self.finish_statement(&ok, mode);
                    return Outcome::Ok(QueryResult::Done(ok));
                }
                Packet::Err(err) => {
                    self.finish_error();
                    return Outcome::Err(Error::Query(err.into_query_error()));
                }
                Packet::Eof(_) => {
                    return self.fail(protocol_error("unexpected EOF packet as command response"));
                }
                Packet::LocalInfile(file) => {
                    tracing::warn!(file = %file, "refusing LOCAL INFILE request");
                    try_outcome!(self.write_packet(cx, &[]).await);
                }
                Packet::ResultSetHeader { column_count } => {
                    let Ok(count) = usize::try_from(column_count) else {
                        return self.fail(protocol_error("column count out of range"));
                    };
                    let columns = try_outcome!(self.read_definitions(cx, count).await);
                    let columns = Arc::new(columns);
                    self.pending = Pending::Rows {
                        columns: Arc::clone(&columns),
                        mode,
                    };
                    return Outcome::Ok(QueryResult::Rows(columns));
                }
            }
        }
    }

    async fn read_definitions(&mut self, cx: &Cx, count: usize) -> Outcome<Vec<ColumnDef>, Error> {
        let mut defs = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let payload = try_outcome!(self.read_packet(cx).await);
            match ColumnDef::parse(&payload) {
                Ok(def) => defs.push(def),
                Err(e) => return self.fail(e),
            }
        }
        if count > 0 && !self.deprecate_eof() {
            let payload = try_outcome!(self.read_packet(cx).await);
            if !is_row_terminator(&payload, false) {
                return self.fail(protocol_error("expected EOF after column definitions"));
            }
        }
        Outcome::Ok(defs)
    }

    /// Reject result sets with undecodable columns, after draining them.
    async fn checked(&mut self, cx: &Cx, result: QueryResult) -> Outcome<QueryResult, Error> {
        if let QueryResult::Rows(columns) = &result {
            if let Some(e) = columns.iter().find_map(|c| c.check_supported().err()) {
                tracing::warn!(error = %e, "draining result set with an unsupported column type");
                try_outcome!(self.drain_untimed(cx).await);
                return Outcome::Err(e);
            }
        }
        Outcome::Ok(result)
    }

    /// Next raw row of the current result set; `None` at its end.
    async fn read_row_packet(&mut self, cx: &Cx) -> Outcome<Option<Vec<u8>>, Error> {
        let Pending::Rows { mode, .. } = self.pending else {
            return Outcome::Ok(None);
        };
        let payload = try_outcome!(self.read_packet(cx).await);
        if payload.first() == Some(&0xFF) {
            let Some(err) = PacketReader::new(&payload).parse_err_packet() else {
                return self.fail(protocol_error("malformed ERR packet in result set"));
            };
            self.finish_error();
            return Outcome::Err(Error::Query(err.into_query_error()));
        }
        let deprecate_eof = self.deprecate_eof();
        if is_row_terminator(&payload, deprecate_eof) {
            let ok = match decode_row_terminator(&payload, deprecate_eof) {
                Ok(ok) => ok,
                Err(e) => return self.fail(e),
            };
            self.finish_statement(&ok, mode);
            return Outcome::Ok(None);
        }
        Outcome::Ok(Some(payload))
    }

    pub(crate) async fn fetch_row(&mut self, cx: &Cx) -> Outcome<Option<Vec<Value>>, Error> {
        let Pending::Rows { columns, mode } = &self.pending else {
            return Outcome::Ok(None);
        };
        let (columns, mode) = (Arc::clone(columns), *mode);
        let Some(payload) = try_outcome!(self.read_row_packet(cx).await) else {
            return Outcome::Ok(None);
        };
        let decoded = match mode {
            ProtocolMode::Text => decode_text_row(&payload, &columns),
            ProtocolMode::Binary => decode_binary_row(&payload, &columns),
        };
        match decoded {
            Ok(values) => Outcome::Ok(Some(values)),
            Err(e @ Error::Protocol(_)) => self.fail(e),
            Err(e) => Outcome::Err(e),
        }
    }

    pub(crate) async fn advance_result(&mut self, cx: &Cx) -> Outcome<Option<QueryResult>, Error> {
        if matches!(self.pending, Pending::Rows { .. }) {
            while try_outcome!(self.read_row_packet(cx).await).is_some() {}
        }
        let Pending::NextResult { mode } = self.pending else {
            return Outcome::Ok(None);
        };
        self.pending = Pending::Idle;
        let result = try_outcome!(self.read_result(cx, mode).await);
        Outcome::Ok(Some(result))
    }

    pub(crate) async fn drain_untimed(&mut self, cx: &Cx) -> Outcome<(), Error> {
        while !matches!(self.pending, Pending::Idle) {
            try_outcome!(self.advance_result(cx).await);
        }
        Outcome::Ok(())
    }

    pub(crate) async fn run_query(&mut self, cx: &Cx, sql: &str) -> Outcome<QueryResult, Error> {
        tracing::debug!(sql = %sql, "query");
        match self
            .dispatch(cx, &Command::Query.payload(sql.as_bytes()), ProtocolMode::Text)
            .await
        {
            Outcome::Err(Error::Query(e)) => Outcome::Err(Error::Query(e.with_sql(sql))),
            other => other,
        }
    }

    /// Run a statement and drain whatever it returns.
    async fn simple(&mut self, cx: &Cx, sql: &str) -> Outcome<OkPacket, Error> {
        try_outcome!(self.run_query(cx, sql).await);
        try_outcome!(self.drain_untimed(cx).await);
        Outcome::Ok(self.last_ok.clone())
    }

    /// Close the connection after a timeout, cancellation or fatal error
    /// observed above this layer.
    pub(crate) fn abort(&mut self) {
        self.shutdown();
    }

    // ==================== Public commands ====================

    /// Send a raw command payload (command byte plus body) and read the
    /// first response. Result-set rows are left on the wire.
    pub async fn send_command(&mut self, cx: &Cx, payload: &[u8]) -> Outcome<QueryResult, Error> {
        timed!(
            cx,
            self,
            self.config.command_timeout,
            self.dispatch(cx, payload, ProtocolMode::Text)
        )
    }

    /// Run SQL text with COM_QUERY.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn query(&mut self, cx: &Cx, sql: &str) -> Outcome<QueryResult, Error> {
        timed!(cx, self, self.config.command_timeout, self.run_query(cx, sql))
    }

    /// [`query`](Self::query) with an explicit limit instead of the
    /// configured `command_timeout`.
    pub async fn query_with_timeout(
        &mut self,
        cx: &Cx,
        sql: &str,
        limit: Option<Duration>,
    ) -> Outcome<QueryResult, Error> {
        timed!(cx, self, limit, self.run_query(cx, sql))
    }

    /// Substitute `%s` placeholders and run the statement.
    pub async fn query_with_params(
        &mut self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<QueryResult, Error> {
        let sql = try_result!(interpolate_params(sql, params, self.no_backslash_escapes()));
        timed!(cx, self, self.config.command_timeout, self.run_query(cx, &sql))
    }

    /// Run a statement and collect the rows of its first result set.
    /// Later result sets are drained.
    #[tracing::instrument(level = "debug", skip(self, cx, params))]
    pub async fn query_all(
        &mut self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Vec<Row>, Error> {
        let sql = try_result!(interpolate_params(sql, params, self.no_backslash_escapes()));
        timed!(
            cx,
            self,
            self.config.command_timeout,
            self.query_all_untimed(cx, &sql)
        )
    }

    async fn query_all_untimed(&mut self, cx: &Cx, sql: &str) -> Outcome<Vec<Row>, Error> {
        let result = try_outcome!(self.run_query(cx, sql).await);
        let mut rows = Vec::new();
        if let QueryResult::Rows(columns) = result {
            let info = Arc::new(ColumnInfo::new(
                columns.iter().map(|c| c.name.clone()).collect(),
            ));
            while let Some(values) = try_outcome!(self.fetch_row(cx).await) {
                rows.push(Row::with_columns(Arc::clone(&info), values));
            }
        }
        try_outcome!(self.drain_untimed(cx).await);
        Outcome::Ok(rows)
    }

    /// Run a statement for its effect; returns the affected-row count of
    /// the last statement. Result sets are drained.
    #[tracing::instrument(level = "debug", skip(self, cx, params))]
    pub async fn execute(&mut self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<u64, Error> {
        let sql = try_result!(interpolate_params(sql, params, self.no_backslash_escapes()));
        let ok = timed!(cx, self, self.config.command_timeout, self.simple(cx, &sql));
        let ok = try_outcome!(ok);
        Outcome::Ok(ok.affected_rows)
    }

    /// Next row of the current result set, `None` once it is exhausted.
    pub async fn next_row(&mut self, cx: &Cx) -> Outcome<Option<Vec<Value>>, Error> {
        timed!(cx, self, self.config.command_timeout, self.fetch_row(cx))
    }

    /// Skip the rest of the current result set and read the next one, if
    /// the server announced more.
    pub async fn next_result(&mut self, cx: &Cx) -> Outcome<Option<QueryResult>, Error> {
        let limit = self.config.command_timeout;
        let result = try_outcome!(timed!(cx, self, limit, self.advance_result(cx)));
        match result {
            Some(result) => {
                let result = try_outcome!(timed!(cx, self, limit, self.checked(cx, result)));
                Outcome::Ok(Some(result))
            }
            None => Outcome::Ok(None),
        }
    }

    /// Read and discard everything left of the current response.
    pub async fn drain(&mut self, cx: &Cx) -> Outcome<(), Error> {
        timed!(cx, self, self.config.command_timeout, self.drain_untimed(cx))
    }

    pub async fn ping(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let payload = Command::Ping.payload(&[]);
        let result = try_outcome!(timed!(
            cx,
            self,
            self.config.command_timeout,
            self.dispatch(cx, &payload, ProtocolMode::Text)
        ));
        match result {
            QueryResult::Done(_) => Outcome::Ok(()),
            QueryResult::Rows(_) => self.fail(protocol_error("unexpected result set for COM_PING")),
        }
    }

    /// Change the default database (COM_INIT_DB).
    pub async fn select_db(&mut self, cx: &Cx, database: &str) -> Outcome<(), Error> {
        let payload = Command::InitDb.payload(database.as_bytes());
        let result = try_outcome!(timed!(
            cx,
            self,
            self.config.command_timeout,
            self.dispatch(cx, &payload, ProtocolMode::Text)
        ));
        match result {
            QueryResult::Done(_) => {
                self.config.database = Some(database.to_string());
                Outcome::Ok(())
            }
            QueryResult::Rows(_) => {
                self.fail(protocol_error("unexpected result set for COM_INIT_DB"))
            }
        }
    }

    async fn run_simple(&mut self, cx: &Cx, sql: &str) -> Outcome<(), Error> {
        try_outcome!(timed!(cx, self, self.config.command_timeout, self.simple(cx, sql)));
        Outcome::Ok(())
    }

    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.run_simple(cx, "BEGIN").await
    }

    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.run_simple(cx, "COMMIT").await
    }

    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.run_simple(cx, "ROLLBACK").await
    }

    pub async fn autocommit(&mut self, cx: &Cx, enabled: bool) -> Outcome<(), Error> {
        self.run_simple(cx, autocommit_sql(enabled)).await
    }

    pub async fn savepoint(&mut self, cx: &Cx, name: &str) -> Outcome<(), Error> {
        try_result!(validate_savepoint_name(name));
        self.run_simple(cx, &format!("SAVEPOINT {}", name)).await
    }

    pub async fn rollback_to(&mut self, cx: &Cx, name: &str) -> Outcome<(), Error> {
        try_result!(validate_savepoint_name(name));
        self.run_simple(cx, &format!("ROLLBACK TO SAVEPOINT {}", name))
            .await
    }

    pub async fn release_savepoint(&mut self, cx: &Cx, name: &str) -> Outcome<(), Error> {
        try_result!(validate_savepoint_name(name));
        self.run_simple(cx, &format!("RELEASE SAVEPOINT {}", name))
            .await
    }

    // ==================== Prepared statements ====================

    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn prepare(&mut self, cx: &Cx, sql: &str) -> Outcome<PreparedStatement, Error> {
        timed!(cx, self, self.config.command_timeout, self.prepare_untimed(cx, sql))
    }

    async fn prepare_untimed(&mut self, cx: &Cx, sql: &str) -> Outcome<PreparedStatement, Error> {
        try_outcome!(self.begin_command(cx).await);
        try_outcome!(self.write_packet(cx, &build_stmt_prepare(sql)).await);

        let payload = try_outcome!(self.read_packet(cx).await);
        if payload.first() == Some(&0xFF) {
            let Some(err) = PacketReader::new(&payload).parse_err_packet() else {
                return self.fail(protocol_error("malformed ERR packet"));
            };
            self.finish_error();
            return Outcome::Err(Error::Query(err.into_query_error().with_sql(sql)));
        }
        let header = match parse_stmt_prepare_ok(&payload) {
            Ok(h) => h,
            Err(e) => return self.fail(e),
        };
        let params = try_outcome!(
            self.read_definitions(cx, usize::from(header.num_params))
                .await
        );
        let columns = try_outcome!(
            self.read_definitions(cx, usize::from(header.num_columns))
                .await
        );
        self.become_ready();

        tracing::debug!(
            statement_id = header.statement_id,
            params = header.num_params,
            columns = header.num_columns,
            "statement prepared"
        );
        Outcome::Ok(PreparedStatement::new(
            header.statement_id,
            sql.to_string(),
            params,
            columns,
        ))
    }

    /// Execute a prepared statement. Rows come back in the binary protocol.
    #[tracing::instrument(level = "debug", skip(self, cx, stmt, params), fields(statement_id = stmt.statement_id))]
    pub async fn execute_prepared(
        &mut self,
        cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> Outcome<QueryResult, Error> {
        if params.len() != stmt.param_count() {
            return Outcome::Err(Error::Query(QueryError {
                kind: QueryErrorKind::Parameter,
                code: None,
                sqlstate: None,
                message: format!(
                    "statement expects {} parameters, got {}",
                    stmt.param_count(),
                    params.len()
                ),
                sql: Some(stmt.sql.clone()),
                source: None,
            }));
        }
        let payload = try_result!(build_stmt_execute(stmt.statement_id, params));
        let outcome = timed!(
            cx,
            self,
            self.config.command_timeout,
            self.dispatch(cx, &payload, ProtocolMode::Binary)
        );
        match outcome {
            Outcome::Err(Error::Query(e)) => Outcome::Err(Error::Query(e.with_sql(&stmt.sql))),
            other => other,
        }
    }

    /// Deallocate a statement on the server. The server does not answer.
    pub async fn close_statement(&mut self, cx: &Cx, stmt: &PreparedStatement) -> Outcome<(), Error> {
        timed!(
            cx,
            self,
            self.config.command_timeout,
            self.close_statement_untimed(cx, stmt.statement_id)
        )
    }

    async fn close_statement_untimed(&mut self, cx: &Cx, statement_id: u32) -> Outcome<(), Error> {
        try_outcome!(self.begin_command(cx).await);
        try_outcome!(self.write_packet(cx, &build_stmt_close(statement_id)).await);
        self.become_ready();
        Outcome::Ok(())
    }

    /// Reset a statement's server-side state (COM_STMT_RESET).
    pub async fn reset_statement(&mut self, cx: &Cx, stmt: &PreparedStatement) -> Outcome<(), Error> {
        let payload = build_stmt_reset(stmt.statement_id);
        try_outcome!(timed!(
            cx,
            self,
            self.config.command_timeout,
            self.dispatch(cx, &payload, ProtocolMode::Text)
        ));
        Outcome::Ok(())
    }

    /// Send COM_QUIT (best effort) and drop the socket. Idempotent.
    pub async fn close(&mut self, cx: &Cx) -> Result<(), Error> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        if !self.io_in_progress && cx.cancel_reason().is_none() {
            let quit = frame(&Command::Quit.payload(&[]), 0);
            let stream = &mut self.stream;
            let _ = with_timeout(cx, Some(self.config.connect_timeout), async {
                stream.write_all(&quit).await?;
                stream.flush().await
            })
            .await;
        }
        self.shutdown();
        Ok(())
    }
}

fn autocommit_sql(enabled: bool) -> &'static str {
    if enabled {
        "SET AUTOCOMMIT = 1"
    } else {
        "SET AUTOCOMMIT = 0"
    }
}

fn resolve(addr: &str) -> Result<SocketAddr, Error> {
    if let Ok(socket_addr) = addr.parse() {
        return Ok(socket_addr);
    }
    addr.to_socket_addrs()
        .map_err(|e| {
            connection_error(
                ConnectionErrorKind::Connect,
                format!("failed to resolve {}: {}", addr, e),
            )
        })?
        .next()
        .ok_or_else(|| {
            connection_error(
                ConnectionErrorKind::Connect,
                format!("no addresses found for {}", addr),
            )
        })
}

fn io_failure(direction: &str, e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Error::Timeout,
        _ => Error::Connection(asyncmy_core::ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: format!("failed to {} server: {}", direction, e),
            source: Some(Box::new(e)),
        }),
    }
}

fn closed_error() -> Error {
    connection_error(ConnectionErrorKind::Closed, "connection is closed")
}

// ==================== Shared connection wrapper ====================

/// A cloneable handle to one connection.
///
/// Commands from different clones are serialized by an async mutex. A
/// caller that arrives while another command is in flight gets
/// `Error::Busy` instead of queueing behind it.
pub struct SharedMySqlConnection {
    inner: Arc<Mutex<MySqlConnection>>,
    busy: Arc<AtomicBool>,
}

struct BusyClaim<'a>(&'a AtomicBool);

impl Drop for BusyClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SharedMySqlConnection {
    pub fn new(conn: MySqlConnection) -> Self {
        Self {
            inner: Arc::new(Mutex::new(conn)),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn connect(cx: &Cx, config: MySqlConfig) -> Outcome<Self, Error> {
        match MySqlConnection::connect(cx, config).await {
            Outcome::Ok(conn) => Outcome::Ok(Self::new(conn)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(c) => Outcome::Cancelled(c),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// The underlying mutex. Locking it directly waits instead of failing
    /// fast.
    pub fn inner(&self) -> &Arc<Mutex<MySqlConnection>> {
        &self.inner
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn claim(&self) -> Result<BusyClaim<'_>, Error> {
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(Error::Busy(BusyError {
                message: "another command is in flight on this connection".to_string(),
            }));
        }
        Ok(BusyClaim(&self.busy))
    }

    pub async fn query(&self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<Vec<Row>, Error> {
        let _claim = try_result!(self.claim());
        let Ok(mut conn) = self.inner.lock(cx).await else {
            return Outcome::Err(lock_error());
        };
        conn.query_all(cx, sql, params).await
    }

    pub async fn execute(&self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<u64, Error> {
        let _claim = try_result!(self.claim());
        let Ok(mut conn) = self.inner.lock(cx).await else {
            return Outcome::Err(lock_error());
        };
        conn.execute(cx, sql, params).await
    }

    pub async fn ping(&self, cx: &Cx) -> Outcome<(), Error> {
        let _claim = try_result!(self.claim());
        let Ok(mut conn) = self.inner.lock(cx).await else {
            return Outcome::Err(lock_error());
        };
        conn.ping(cx).await
    }

    pub async fn close(&self, cx: &Cx) -> Result<(), Error> {
        let _claim = self.claim()?;
        let Ok(mut conn) = self.inner.lock(cx).await else {
            return Err(lock_error());
        };
        conn.close(cx).await
    }
}

fn lock_error() -> Error {
    connection_error(
        ConnectionErrorKind::Disconnected,
        "failed to acquire connection lock",
    )
}

impl Clone for SharedMySqlConnection {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            busy: Arc::clone(&self.busy),
        }
    }
}

impl std::fmt::Debug for SharedMySqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMySqlConnection")
            .field("inner", &"Arc<Mutex<MySqlConnection>>")
            .field("busy", &self.is_busy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{
        MockServer, SCRAMBLE, column_def, eof_ok, err, err_packet, ok, ok_packet, result_set, run,
        text_row,
    };
    use crate::protocol::PacketWriter;
    use crate::types::FieldType;
    use std::task::Poll;

    const AUTOCOMMIT: u16 = server_status::SERVER_STATUS_AUTOCOMMIT;
    const MORE: u16 = server_status::SERVER_MORE_RESULTS_EXISTS | AUTOCOMMIT;

    fn auth_response_of(handshake_response: &[u8]) -> Vec<u8> {
        let mut reader = PacketReader::new(handshake_response);
        reader.skip(32);
        reader.read_null_string();
        reader.read_lenenc_bytes().unwrap().to_vec()
    }

    #[test]
    fn test_connect_native_password() {
        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            server.accept("mysql_native_password");
            let config = MySqlConfig::new()
                .user("app")
                .password("secret")
                .database("shop");
            let conn = ok(server.connect(&cx, config).await);

            assert_eq!(conn.state(), ConnectionState::Ready);
            assert_eq!(conn.connection_id(), 42);
            assert_eq!(conn.server_version(), Some("8.0.36"));
            assert!(conn.autocommit_enabled());

            let frames = server.stream.written_frames();
            assert_eq!(frames.len(), 1);
            let (seq, response) = &frames[0];
            assert_eq!(*seq, 1);
            assert_eq!(
                auth_response_of(response),
                auth::mysql_native_password("secret", &SCRAMBLE)
            );
            let text = String::from_utf8_lossy(response);
            assert!(text.contains("app\0"));
            assert!(text.contains("shop\0"));
            assert!(text.contains("mysql_native_password\0"));
        });
    }

    #[test]
    fn test_connect_caching_sha2_fast_path() {
        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            server.stream.push_packet(
                &crate::mock::greeting(crate::mock::SERVER_CAPS, "caching_sha2_password", &SCRAMBLE),
                0,
            );
            server.reply_from(2, &[vec![0x01, 0x03], ok_packet(0, 0, AUTOCOMMIT)]);

            let config = MySqlConfig::new().user("root").password("pw");
            let conn = ok(server.connect(&cx, config).await);
            assert!(conn.is_ready());

            let frames = server.stream.written_frames();
            assert_eq!(
                auth_response_of(&frames[0].1),
                auth::caching_sha2_password("pw", &SCRAMBLE)
            );
        });
    }

    #[test]
    fn test_connect_caching_sha2_full_auth_requests_key() {
        use rand::rngs::OsRng;
        use rsa::RsaPrivateKey;
        use rsa::pkcs8::{EncodePublicKey, LineEnding};

        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();

        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            server.stream.push_packet(
                &crate::mock::greeting(crate::mock::SERVER_CAPS, "caching_sha2_password", &SCRAMBLE),
                0,
            );
            let mut key_packet = vec![0x01];
            key_packet.extend_from_slice(pem.as_bytes());
            server.reply_from(2, &[vec![0x01, 0x04]]);
            server.reply_from(4, &[key_packet]);
            server.reply_from(6, &[ok_packet(0, 0, AUTOCOMMIT)]);

            let config = MySqlConfig::new().user("root").password("pw");
            let conn = ok(server.connect(&cx, config).await);
            assert!(conn.is_ready());

            let frames = server.stream.written_frames();
            assert_eq!(frames.len(), 3);
            assert_eq!(frames[1], (3, vec![caching_sha2::REQUEST_PUBLIC_KEY]));
            let (seq, cipher) = &frames[2];
            assert_eq!(*seq, 5);
            let plain = private
                .decrypt(rsa::Oaep::new::<sha1::Sha1>(), cipher)
                .unwrap();
            assert_eq!(plain, auth::xor_password_with_seed("pw", &SCRAMBLE));
        });
    }

    #[test]
    fn test_connect_sha256_uses_configured_key() {
        use rand::rngs::OsRng;
        use rsa::RsaPrivateKey;
        use rsa::pkcs8::{EncodePublicKey, LineEnding};

        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();

        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            server.stream.push_packet(
                &crate::mock::greeting(crate::mock::SERVER_CAPS, "sha256_password", &SCRAMBLE),
                0,
            );
            server.reply_from(2, &[ok_packet(0, 0, AUTOCOMMIT)]);

            let config = MySqlConfig::new()
                .user("root")
                .password("pw")
                .server_public_key(pem.as_bytes());
            let conn = ok(server.connect(&cx, config).await);
            assert!(conn.is_ready());

            let frames = server.stream.written_frames();
            assert_eq!(frames.len(), 1);
            let cipher = auth_response_of(&frames[0].1);
            assert_ne!(cipher, vec![1]);
            let plain = private
                .decrypt(rsa::Oaep::new::<sha1::Sha1>(), &cipher)
                .unwrap();
            assert_eq!(plain, auth::xor_password_with_seed("pw", &SCRAMBLE));
        });
    }

    #[test]
    fn test_connect_auth_switch() {
        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            server.stream.push_packet(
                &crate::mock::greeting(crate::mock::SERVER_CAPS, "caching_sha2_password", &SCRAMBLE),
                0,
            );
            let new_seed = *b"ZYXWVUTSRQPONMLKJIHG";
            let mut switch = vec![0xFE];
            switch.extend_from_slice(b"mysql_native_password\0");
            switch.extend_from_slice(&new_seed);
            switch.push(0);
            server.reply_from(2, &[switch]);
            server.reply_from(4, &[ok_packet(0, 0, AUTOCOMMIT)]);

            let config = MySqlConfig::new().user("root").password("pw");
            let conn = ok(server.connect(&cx, config).await);
            assert!(conn.is_ready());

            let frames = server.stream.written_frames();
            assert_eq!(
                frames[1],
                (3, auth::mysql_native_password("pw", &new_seed))
            );
        });
    }

    #[test]
    fn test_connect_rejected() {
        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            server.stream.push_packet(
                &crate::mock::greeting(crate::mock::SERVER_CAPS, "mysql_native_password", &SCRAMBLE),
                0,
            );
            server.reply_from(
                2,
                &[err_packet(1045, "28000", "Access denied for user 'root'")],
            );
            let e = err(server.connect(&cx, MySqlConfig::new().password("bad")).await);
            assert!(e.is_authentication_error());
            assert!(e.to_string().contains("Access denied"));
        });
    }

    #[test]
    fn test_clear_password_needs_tls() {
        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            server.stream.push_packet(
                &crate::mock::greeting(crate::mock::SERVER_CAPS, "mysql_clear_password", &SCRAMBLE),
                0,
            );
            let e = err(server.connect(&cx, MySqlConfig::new().password("pw")).await);
            assert!(e.is_authentication_error());
        });
    }

    #[test]
    fn test_session_setup_statements() {
        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            server.accept("mysql_native_password");
            server.reply(&[ok_packet(0, 0, AUTOCOMMIT)]);
            server.reply(&[ok_packet(0, 0, AUTOCOMMIT)]);
            server.reply(&[ok_packet(0, 0, 0)]);

            let config = MySqlConfig::new()
                .sql_mode("TRADITIONAL")
                .init_command("SET NAMES utf8mb4")
                .autocommit(false);
            let conn = ok(server.connect(&cx, config).await);
            assert!(!conn.autocommit_enabled());
            assert_eq!(
                server.queries(),
                vec![
                    "SET sql_mode = 'TRADITIONAL'".to_string(),
                    "SET NAMES utf8mb4".to_string(),
                    "SET AUTOCOMMIT = 0".to_string(),
                ]
            );
        });
    }

    #[test]
    fn test_query_ok_packet() {
        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            let mut conn = server.connected(&cx).await;
            server.reply(&[ok_packet(3, 17, AUTOCOMMIT)]);

            let result = ok(conn.query(&cx, "UPDATE t SET a = 1").await);
            let QueryResult::Done(packet) = result else {
                panic!("expected OK");
            };
            assert_eq!(packet.affected_rows, 3);
            assert_eq!(conn.last_insert_id(), 17);
            assert!(conn.is_ready());
            assert_eq!(server.queries(), vec!["UPDATE t SET a = 1".to_string()]);
            assert_eq!(server.commands()[0].0, 0);
        });
    }

    #[test]
    fn test_query_result_set_rows() {
        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            let mut conn = server.connected(&cx).await;
            server.reply(&result_set(
                &[("id", FieldType::LongLong), ("name", FieldType::VarString)],
                &[vec![Some("1"), Some("a")], vec![Some("2"), None]],
                AUTOCOMMIT,
            ));

            let result = ok(conn.query(&cx, "SELECT id, name FROM t").await);
            let columns = result.columns().unwrap();
            assert_eq!(columns.len(), 2);
            assert_eq!(conn.state(), ConnectionState::Busy);

            assert_eq!(
                ok(conn.next_row(&cx).await),
                Some(vec![Value::BigInt(1), Value::Text("a".to_string())])
            );
            assert_eq!(
                ok(conn.next_row(&cx).await),
                Some(vec![Value::BigInt(2), Value::Null])
            );
            assert_eq!(ok(conn.next_row(&cx).await), None);
            assert!(conn.is_ready());
            assert_eq!(ok(conn.next_row(&cx).await), None);
        });
    }

    #[test]
    fn test_server_error_keeps_connection_usable() {
        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            let mut conn = server.connected(&cx).await;
            server.reply(&[err_packet(1146, "42S02", "Table 'test.nope' doesn't exist")]);
            server.reply(&[ok_packet(0, 0, AUTOCOMMIT)]);

            let e = err(conn.query(&cx, "SELECT * FROM nope").await);
            match &e {
                Error::Query(q) => {
                    assert_eq!(q.code, Some(1146));
                    assert_eq!(q.sqlstate.as_deref(), Some("42S02"));
                    assert_eq!(q.kind, QueryErrorKind::NotFound);
                    assert_eq!(q.sql.as_deref(), Some("SELECT * FROM nope"));
                }
                other => panic!("unexpected: {other:?}"),
            }
            assert!(conn.is_ready());
            ok(conn.ping(&cx).await);
        });
    }

    #[test]
    fn test_multi_result_response() {
        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            let mut conn = server.connected(&cx).await;
            let mut packets = vec![ok_packet(1, 0, MORE)];
            packets.extend(result_set(
                &[("x", FieldType::Long)],
                &[vec![Some("5")]],
                AUTOCOMMIT,
            ));
            server.reply(&packets);

            let first = ok(conn.query(&cx, "INSERT INTO t VALUES (1); SELECT 5").await);
            assert!(matches!(first, QueryResult::Done(_)));
            assert!(conn.has_pending_result());
            assert_eq!(conn.state(), ConnectionState::Busy);

            let second = ok(conn.next_result(&cx).await).unwrap();
            assert!(second.columns().is_some());
            assert_eq!(ok(conn.next_row(&cx).await), Some(vec![Value::Int(5)]));
            assert_eq!(ok(conn.next_row(&cx).await), None);
            assert!(ok(conn.next_result(&cx).await).is_none());
            assert!(conn.is_ready());
        });
    }

    #[test]
    fn test_undrained_result_is_drained_before_next_command() {
        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            let mut conn = server.connected(&cx).await;
            server.reply(&result_set(
                &[("n", FieldType::Long)],
                &[vec![Some("1")], vec![Some("2")], vec![Some("3")]],
                AUTOCOMMIT,
            ));
            server.reply(&[ok_packet(0, 0, AUTOCOMMIT)]);

            ok(conn.query(&cx, "SELECT n FROM t").await);
            assert_eq!(ok(conn.next_row(&cx).await), Some(vec![Value::Int(1)]));
            ok(conn.query(&cx, "DO 1").await);
            assert!(conn.is_ready());
            assert_eq!(server.stream.pending_bytes(), 0);
            assert_eq!(server.queries().len(), 2);
        });
    }

    #[test]
    fn test_unsupported_column_is_drained() {
        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            let mut conn = server.connected(&cx).await;
            let mut header = PacketWriter::new();
            header.write_lenenc_int(1);
            server.reply(&[
                header.into_bytes(),
                column_def("v", FieldType::Unsupported(0xF2), 0),
                text_row(&[Some("zzz")]),
                eof_ok(AUTOCOMMIT, 0),
            ]);
            server.reply(&[ok_packet(0, 0, AUTOCOMMIT)]);

            let e = err(conn.query(&cx, "SELECT v FROM vectors").await);
            assert!(matches!(e, Error::UnsupportedType(ref u) if u.type_code == 0xF2));
            assert!(conn.is_ready());
            ok(conn.ping(&cx).await);
        });
    }

    #[test]
    fn test_local_infile_is_refused() {
        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            let mut conn = server.connected(&cx).await;
            let mut request = vec![0xFB];
            request.extend_from_slice(b"/etc/passwd");
            server.reply(&[request]);
            server.reply_from(3, &[ok_packet(0, 0, AUTOCOMMIT)]);

            let result = ok(conn
                .query(&cx, "LOAD DATA LOCAL INFILE '/etc/passwd' INTO TABLE t")
                .await);
            assert!(matches!(result, QueryResult::Done(ref p) if p.affected_rows == 0));
            let commands = server.commands();
            assert_eq!(commands[1], (2, Vec::new()));
        });
    }

    #[test]
    fn test_timeout_closes_connection() {
        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            let mut conn = server.connected(&cx).await;
            let e = err(conn
                .query_with_timeout(&cx, "SELECT SLEEP(10)", Some(Duration::from_millis(30)))
                .await);
            assert!(matches!(e, Error::Timeout));
            assert_eq!(conn.state(), ConnectionState::Closed);
            assert!(!conn.is_usable());

            let e = err(conn.ping(&cx).await);
            assert!(matches!(
                e,
                Error::Connection(ref c) if c.kind == ConnectionErrorKind::Closed
            ));
        });
    }

    #[test]
    fn test_with_timeout_uses_runtime_clock() {
        let cx = Cx::for_testing();
        run(async {
            let done = with_timeout(&cx, Some(Duration::from_millis(5)), async { 7 }).await;
            assert_eq!(done.ok(), Some(7));

            let unbounded = with_timeout(&cx, None, async { "done" }).await;
            assert_eq!(unbounded.ok(), Some("done"));

            let started = std::time::Instant::now();
            let stuck = with_timeout(
                &cx,
                Some(Duration::from_millis(20)),
                std::future::pending::<()>(),
            )
            .await;
            assert!(stuck.is_err());
            assert!(started.elapsed() >= Duration::from_millis(20));
        });
    }

    #[test]
    fn test_cancelled_command_closes_connection() {
        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            let mut conn = server.connected(&cx).await;
            server.stream.clear_written();
            cx.cancel_with(asupersync::CancelKind::User, Some("caller gave up"));

            let outcome = conn.query(&cx, "SELECT 1").await;
            assert!(matches!(outcome, Outcome::Cancelled(_)));
            assert_eq!(conn.state(), ConnectionState::Closed);
            assert!(!conn.is_usable());
            assert!(server.stream.written_frames().is_empty());
        });
    }

    #[test]
    fn test_server_hangup_is_disconnect() {
        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            let mut conn = server.connected(&cx).await;
            server.stream.set_eof_when_empty(true);
            let e = err(conn.query(&cx, "SELECT 1").await);
            assert!(e.is_connection_error());
            assert_eq!(conn.state(), ConnectionState::Closed);
        });
    }

    #[test]
    fn test_sequence_mismatch_is_protocol_error() {
        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            let mut conn = server.connected(&cx).await;
            server.reply_from(5, &[ok_packet(0, 0, AUTOCOMMIT)]);
            let e = err(conn.query(&cx, "DO 1").await);
            assert!(matches!(e, Error::Protocol(_)));
            assert_eq!(conn.state(), ConnectionState::Closed);
        });
    }

    #[test]
    fn test_prepared_statement_cycle() {
        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            let mut conn = server.connected(&cx).await;

            let mut prepare_ok = vec![0x00];
            prepare_ok.extend_from_slice(&7u32.to_le_bytes());
            prepare_ok.extend_from_slice(&1u16.to_le_bytes());
            prepare_ok.extend_from_slice(&1u16.to_le_bytes());
            prepare_ok.extend_from_slice(&[0, 0, 0]);
            server.reply(&[
                prepare_ok,
                column_def("?", FieldType::LongLong, 0),
                column_def("id", FieldType::LongLong, 0),
            ]);

            let stmt = ok(conn.prepare(&cx, "SELECT id FROM t WHERE id = ?").await);
            assert_eq!(stmt.statement_id, 7);
            assert_eq!(stmt.param_count(), 1);
            assert_eq!(stmt.column_count(), 1);
            assert!(conn.is_ready());

            let mut header = PacketWriter::new();
            header.write_lenenc_int(1);
            let mut row = vec![0x00, 0x00];
            row.extend_from_slice(&9i64.to_le_bytes());
            server.reply(&[
                header.into_bytes(),
                column_def("id", FieldType::LongLong, 0),
                row,
                eof_ok(AUTOCOMMIT, 0),
            ]);
            let result = ok(conn.execute_prepared(&cx, &stmt, &[Value::BigInt(9)]).await);
            assert!(result.columns().is_some());
            assert_eq!(ok(conn.next_row(&cx).await), Some(vec![Value::BigInt(9)]));
            assert_eq!(ok(conn.next_row(&cx).await), None);

            let e = err(conn.execute_prepared(&cx, &stmt, &[]).await);
            assert!(matches!(e, Error::Query(ref q) if q.kind == QueryErrorKind::Parameter));

            ok(conn.close_statement(&cx, &stmt).await);
            assert!(conn.is_ready());
            let commands = server.commands();
            assert_eq!(commands.last(), Some(&(0, vec![0x19, 7, 0, 0, 0])));
        });
    }

    #[test]
    fn test_transactions_and_savepoints() {
        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            let mut conn = server.connected(&cx).await;
            let in_trans = server_status::SERVER_STATUS_IN_TRANS | AUTOCOMMIT;
            server.reply(&[ok_packet(0, 0, in_trans)]);
            server.reply(&[ok_packet(0, 0, in_trans)]);
            server.reply(&[ok_packet(0, 0, in_trans)]);
            server.reply(&[ok_packet(0, 0, AUTOCOMMIT)]);

            ok(conn.begin(&cx).await);
            assert!(conn.in_transaction());
            ok(conn.savepoint(&cx, "sp_1").await);
            ok(conn.rollback_to(&cx, "sp_1").await);
            ok(conn.commit(&cx).await);
            assert!(!conn.in_transaction());

            let e = err(conn.savepoint(&cx, "bad name").await);
            assert!(matches!(e, Error::Query(_)));
            assert_eq!(
                server.queries(),
                vec![
                    "BEGIN".to_string(),
                    "SAVEPOINT sp_1".to_string(),
                    "ROLLBACK TO SAVEPOINT sp_1".to_string(),
                    "COMMIT".to_string(),
                ]
            );
        });
    }

    #[test]
    fn test_select_db_and_escaping() {
        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            let mut conn = server.connected(&cx).await;
            server.reply(&[ok_packet(
                0,
                0,
                AUTOCOMMIT | server_status::SERVER_STATUS_NO_BACKSLASH_ESCAPES,
            )]);
            ok(conn.select_db(&cx, "other").await);
            assert_eq!(conn.config().database.as_deref(), Some("other"));
            assert_eq!(server.commands()[0], (0, b"\x02other".to_vec()));

            assert!(conn.no_backslash_escapes());
            assert_eq!(conn.escape_string("it's"), "it''s");
            assert_eq!(
                conn.literal(&Value::Text("a\\b".to_string())).unwrap(),
                "'a\\b'"
            );
        });
    }

    #[test]
    fn test_close_is_idempotent() {
        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            let mut conn = server.connected(&cx).await;
            conn.close(&cx).await.unwrap();
            conn.close(&cx).await.unwrap();
            assert_eq!(conn.state(), ConnectionState::Closed);
            assert_eq!(server.commands(), vec![(0, vec![0x01])]);
        });
    }

    #[test]
    fn test_shared_connection_rejects_concurrent_caller() {
        let cx = Cx::for_testing();
        run(async {
            let server = MockServer::new();
            let conn = server.connected(&cx).await;
            let shared = SharedMySqlConnection::new(conn);
            let other = shared.clone();

            {
                let mut stalled = std::pin::pin!(shared.query(&cx, "SELECT SLEEP(10)", &[]));
                let pending =
                    std::future::poll_fn(|c| Poll::Ready(stalled.as_mut().poll(c).is_pending()))
                        .await;
                assert!(pending);
                assert!(other.is_busy());

                let e = err(other.ping(&cx).await);
                assert!(matches!(e, Error::Busy(_)));
            }

            // The stalled query was dropped mid-read.
            assert!(!other.is_busy());
            let e = err(other.ping(&cx).await);
            assert!(matches!(
                e,
                Error::Connection(ref c) if c.kind == ConnectionErrorKind::Disconnected
            ));
        });
    }
}
