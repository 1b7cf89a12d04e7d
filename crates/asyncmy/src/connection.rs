//! Connection state machine and the handshake packets.
//!
//! The I/O driving these lives in [`crate::async_connection`].

use asyncmy_core::error::{ConnectionError, ConnectionErrorKind, QueryError, QueryErrorKind};
use asyncmy_core::{Error, Result};

use crate::auth;
use crate::protocol::codec::protocol_error;
use crate::protocol::{PacketReader, PacketWriter, capabilities, charset};

/// Connection state in the protocol state machine.
///
/// ```text
/// Connecting -> Authenticating -> Ready <-> Busy
///      |              |             |        |
///      +--------------+-------------+--------+--> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP established, waiting for the server greeting
    Connecting,
    /// Handshake response sent, auth exchange in progress
    Authenticating,
    /// Idle, ready for a command
    Ready,
    /// A command is in flight or its response is not fully read
    Busy,
    Closed,
}

impl ConnectionState {
    pub const fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::{Authenticating, Busy, Closed, Connecting, Ready};
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Authenticating, Ready)
                | (Ready, Busy)
                | (Busy, Ready)
                | (_, Closed)
        )
    }

    /// Checked transition.
    pub fn transition(self, next: ConnectionState) -> Result<ConnectionState> {
        if self.can_transition_to(next) {
            tracing::trace!(from = ?self, to = ?next, "connection state");
            Ok(next)
        } else {
            Err(protocol_error(format!(
                "invalid connection state transition {:?} -> {:?}",
                self, next
            )))
        }
    }
}

/// The server greeting (Protocol::HandshakeV10).
#[derive(Debug, Clone)]
pub struct ServerHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Server capability flags
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    /// Plugin the server expects for the first auth response
    pub auth_plugin: String,
    /// Scramble, without the trailing NUL
    pub auth_data: Vec<u8>,
}

impl ServerHandshake {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);

        if reader.peek() == Some(0xFF) {
            let message = reader
                .parse_err_packet()
                .map_or_else(|| "server refused the connection".to_string(), |e| {
                    format!("server refused the connection ({}): {}", e.error_code, e.error_message)
                });
            return Err(connection_error(ConnectionErrorKind::Connect, message));
        }

        let protocol_version = reader
            .read_u8()
            .ok_or_else(|| protocol_error("missing protocol version"))?;
        if protocol_version != 10 {
            return Err(protocol_error(format!(
                "unsupported protocol version: {}",
                protocol_version
            )));
        }

        let server_version = reader.read_null_string();
        let connection_id = reader
            .read_u32_le()
            .ok_or_else(|| protocol_error("missing connection id"))?;
        let auth_data_1 = reader
            .read_bytes(8)
            .ok_or_else(|| protocol_error("missing auth data"))?;
        reader.skip(1);

        let caps_lower = reader
            .read_u16_le()
            .ok_or_else(|| protocol_error("missing capability flags"))?;
        let charset_val = reader.read_u8().unwrap_or(charset::UTF8MB4_GENERAL_CI);
        let status_flags = reader.read_u16_le().unwrap_or(0);
        let caps_upper = reader.read_u16_le().unwrap_or(0);
        let capabilities_val = u32::from(caps_lower) | (u32::from(caps_upper) << 16);

        let auth_data_len = if capabilities_val & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            reader.read_u8().unwrap_or(0) as usize
        } else {
            0
        };
        reader.skip(10);

        let mut auth_data = auth_data_1.to_vec();
        if capabilities_val & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            let len2 = auth_data_len.saturating_sub(8).max(13);
            let data2 = reader
                .read_bytes(len2.min(reader.remaining()))
                .unwrap_or_default();
            let data2 = data2.strip_suffix(&[0]).unwrap_or(data2);
            auth_data.extend_from_slice(data2);
        }

        let auth_plugin = if capabilities_val & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            reader.read_null_string()
        } else {
            String::new()
        };
        let auth_plugin = if auth_plugin.is_empty() {
            auth::plugins::MYSQL_NATIVE_PASSWORD.to_string()
        } else {
            auth_plugin
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            capabilities: capabilities_val,
            charset: charset_val,
            status_flags,
            auth_plugin,
            auth_data,
        })
    }

    pub const fn supports(&self, flag: u32) -> bool {
        self.capabilities & flag != 0
    }

    /// Compare the leading `major.minor.patch` of the server version.
    /// Suffixes such as `-MariaDB` or `-log` are ignored.
    pub fn version_at_least(&self, major: u32, minor: u32, patch: u32) -> bool {
        let mut parts = self.server_version.split(['.', '-']).map(|part| {
            part.chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>()
                .parse::<u32>()
                .unwrap_or(0)
        });
        let version = (
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
        );
        version >= (major, minor, patch)
    }
}

/// Protocol::HandshakeResponse41.
#[derive(Debug, Clone)]
pub struct HandshakeResponse<'a> {
    pub client_caps: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
    pub attributes: &'a [(String, String)],
}

impl HandshakeResponse<'_> {
    pub fn build(&self) -> Vec<u8> {
        let caps = self.client_caps;
        let mut writer = PacketWriter::with_capacity(128);
        writer.write_u32_le(caps);
        writer.write_u32_le(self.max_packet_size);
        writer.write_u8(self.charset);
        writer.write_zeros(23);
        writer.write_null_string(self.user);

        if caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            writer.write_lenenc_bytes(self.auth_response);
        } else if caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            writer.write_u8(self.auth_response.len().min(255) as u8);
            writer.write_bytes(&self.auth_response[..self.auth_response.len().min(255)]);
        } else {
            writer.write_bytes(self.auth_response);
            writer.write_u8(0);
        }

        if caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            writer.write_null_string(self.database.unwrap_or(""));
        }
        if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(self.auth_plugin);
        }
        if caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
            let mut attrs = PacketWriter::new();
            for (key, value) in self.attributes {
                attrs.write_lenenc_string(key);
                attrs.write_lenenc_string(value);
            }
            writer.write_lenenc_bytes(attrs.as_bytes());
        }
        writer.into_bytes()
    }
}

/// Auth switch request (tag 0xFE during authentication).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    /// New scramble, without the trailing NUL
    pub data: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        if reader.read_u8() != Some(0xFE) {
            return Err(protocol_error("not an auth switch request"));
        }
        let plugin = reader.read_null_string();
        if plugin.is_empty() {
            return Err(protocol_error("auth switch request without a plugin name"));
        }
        let rest = reader.read_rest();
        let data = rest.strip_suffix(&[0]).unwrap_or(rest).to_vec();
        Ok(Self { plugin, data })
    }
}

/// Check a savepoint name before it is spliced into SQL.
///
/// Identifiers must be 1 to 64 characters, start with a letter or
/// underscore and contain only letters, digits, `_` or `$`.
pub fn validate_savepoint_name(name: &str) -> Result<()> {
    let invalid = |message: String| {
        Error::Query(QueryError {
            kind: QueryErrorKind::Parameter,
            code: None,
            sqlstate: None,
            message,
            sql: None,
            source: None,
        })
    };
    let Some(first) = name.chars().next() else {
        return Err(invalid("savepoint name cannot be empty".to_string()));
    };
    if name.len() > 64 {
        return Err(invalid(
            "savepoint name exceeds maximum length of 64 characters".to_string(),
        ));
    }
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(invalid(
            "savepoint name must start with a letter or underscore".to_string(),
        ));
    }
    if let Some(c) = name
        .chars()
        .find(|&c| !c.is_ascii_alphanumeric() && c != '_' && c != '$')
    {
        return Err(invalid(format!(
            "savepoint name contains invalid character: '{}'",
            c
        )));
    }
    Ok(())
}

pub(crate) fn connection_error(kind: ConnectionErrorKind, message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind,
        message: message.into(),
        source: None,
    })
}

pub(crate) fn auth_error(message: impl Into<String>) -> Error {
    connection_error(ConnectionErrorKind::Authentication, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{SCRAMBLE, greeting};

    #[test]
    fn test_state_transitions() {
        use ConnectionState::*;
        assert!(Connecting.can_transition_to(Authenticating));
        assert!(Authenticating.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Busy));
        assert!(Busy.can_transition_to(Ready));
        assert!(Busy.can_transition_to(Closed));
        assert!(Closed.can_transition_to(Closed));

        assert!(!Connecting.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Authenticating));
        assert!(!Closed.can_transition_to(Ready));
        assert!(Busy.transition(Busy).is_err());
        assert_eq!(Ready.transition(Busy).unwrap(), Busy);
    }

    #[test]
    fn test_parse_greeting() {
        let caps = capabilities::DEFAULT_CLIENT_FLAGS | capabilities::CLIENT_SSL;
        let payload = greeting(caps, "caching_sha2_password", &SCRAMBLE);
        let hs = ServerHandshake::parse(&payload).unwrap();
        assert_eq!(hs.protocol_version, 10);
        assert_eq!(hs.server_version, "8.0.36");
        assert_eq!(hs.connection_id, 42);
        assert_eq!(hs.capabilities, caps);
        assert!(hs.supports(capabilities::CLIENT_SSL));
        assert_eq!(hs.auth_plugin, "caching_sha2_password");
        assert_eq!(hs.auth_data, SCRAMBLE.to_vec());
        assert_eq!(hs.status_flags, 0x0002);
        assert!(hs.version_at_least(8, 0, 5));
        assert!(!hs.version_at_least(8, 1, 0));

        let old = ServerHandshake {
            server_version: "5.7.44-log".to_string(),
            ..hs
        };
        assert!(old.version_at_least(5, 7, 0));
        assert!(!old.version_at_least(8, 0, 5));
    }

    #[test]
    fn test_parse_greeting_errors() {
        assert!(matches!(
            ServerHandshake::parse(&[9, b'x', 0]),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(ServerHandshake::parse(&[]), Err(Error::Protocol(_))));
        assert!(ServerHandshake::parse(&[10, b'5', 0, 1, 0]).is_err());

        let mut refused = vec![0xFF, 0x10, 0x04, b'#'];
        refused.extend_from_slice(b"08004Too many connections");
        match ServerHandshake::parse(&refused) {
            Err(Error::Connection(e)) => {
                assert_eq!(e.kind, ConnectionErrorKind::Connect);
                assert!(e.message.contains("Too many connections"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_build_handshake_response() {
        let attrs = vec![("_client_name".to_string(), "asyncmy-rs".to_string())];
        let caps = capabilities::DEFAULT_CLIENT_FLAGS
            | capabilities::CLIENT_CONNECT_WITH_DB
            | capabilities::CLIENT_CONNECT_ATTRS;
        let response = HandshakeResponse {
            client_caps: caps,
            max_packet_size: 16 * 1024 * 1024,
            charset: charset::UTF8MB4_GENERAL_CI,
            user: "root",
            auth_response: &[1, 2, 3],
            database: Some("test"),
            auth_plugin: "mysql_native_password",
            attributes: &attrs,
        }
        .build();

        let mut reader = PacketReader::new(&response);
        assert_eq!(reader.read_u32_le(), Some(caps));
        assert_eq!(reader.read_u32_le(), Some(16 * 1024 * 1024));
        assert_eq!(reader.read_u8(), Some(charset::UTF8MB4_GENERAL_CI));
        reader.skip(23);
        assert_eq!(reader.read_null_string(), "root");
        assert_eq!(reader.read_lenenc_bytes(), Some(&[1u8, 2, 3][..]));
        assert_eq!(reader.read_null_string(), "test");
        assert_eq!(reader.read_null_string(), "mysql_native_password");
        let attrs_block = reader.read_lenenc_bytes().unwrap();
        let mut attrs_reader = PacketReader::new(attrs_block);
        assert_eq!(attrs_reader.read_lenenc_string().as_deref(), Some("_client_name"));
        assert_eq!(attrs_reader.read_lenenc_string().as_deref(), Some("asyncmy-rs"));
        assert!(reader.is_empty());
    }

    #[test]
    fn test_parse_auth_switch() {
        let mut payload = vec![0xFE];
        payload.extend_from_slice(b"mysql_native_password\0");
        payload.extend_from_slice(&SCRAMBLE);
        payload.push(0);
        let switch = AuthSwitchRequest::parse(&payload).unwrap();
        assert_eq!(switch.plugin, "mysql_native_password");
        assert_eq!(switch.data, SCRAMBLE.to_vec());

        assert!(AuthSwitchRequest::parse(&[0xFE]).is_err());
        assert!(AuthSwitchRequest::parse(&[0x00]).is_err());
    }

    #[test]
    fn test_validate_savepoint_name() {
        assert!(validate_savepoint_name("sp1").is_ok());
        assert!(validate_savepoint_name("_private").is_ok());
        assert!(validate_savepoint_name("a$b").is_ok());
        assert!(validate_savepoint_name(&"a".repeat(64)).is_ok());

        assert!(validate_savepoint_name("").is_err());
        assert!(validate_savepoint_name("1abc").is_err());
        assert!(validate_savepoint_name("sp; DROP TABLE x").is_err());
        assert!(validate_savepoint_name("sp`1").is_err());
        assert!(validate_savepoint_name(&"a".repeat(65)).is_err());
    }
}
