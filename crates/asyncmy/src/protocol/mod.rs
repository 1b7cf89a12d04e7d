//! MySQL wire protocol implementation.
//!
//! MySQL packets have a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence number
//!
//! Maximum frame payload is 2^24 - 1 (16MB - 1). Larger payloads
//! are split into multiple frames; see [`codec`].

pub mod codec;
pub mod prepared;
pub mod reader;
pub mod writer;

pub use codec::{Frame, Packet, decode_packet, frame, is_row_terminator, try_unframe, unframe};
pub use prepared::{
    PreparedStatement, StmtPrepareOk, build_stmt_close, build_stmt_execute, build_stmt_prepare,
    build_stmt_reset, parse_stmt_prepare_ok,
};
pub use reader::PacketReader;
pub use writer::PacketWriter;

/// Maximum payload size for a single MySQL frame (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// Capability bits negotiated during the handshake.
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Default client capabilities for modern MySQL connections.
    pub const DEFAULT_CLIENT_FLAGS: u32 = CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_TRANSACTIONS
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_DEPRECATE_EOF;
}

/// MySQL command codes (COM_xxx) issued by this driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Quit connection
    Quit = 0x01,
    /// Switch database
    InitDb = 0x02,
    /// Text protocol query
    Query = 0x03,
    /// Ping server
    Ping = 0x0e,
    /// Prepare statement
    StmtPrepare = 0x16,
    /// Execute prepared statement
    StmtExecute = 0x17,
    /// Close prepared statement
    StmtClose = 0x19,
    /// Reset prepared statement
    StmtReset = 0x1a,
}

impl Command {
    /// Does the server answer this command with at least one packet?
    pub const fn expects_response(self) -> bool {
        !matches!(self, Command::Quit | Command::StmtClose)
    }

    /// Build a command payload: the command byte followed by `body`.
    pub fn payload(self, body: &[u8]) -> Vec<u8> {
        let mut writer = PacketWriter::with_capacity(1 + body.len());
        writer.write_u8(self as u8);
        writer.write_bytes(body);
        writer.into_bytes()
    }
}

/// Bits of the status word carried by OK and EOF packets.
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_NO_BACKSLASH_ESCAPES: u16 = 0x0200;
}

/// Handshake character set ids.
pub mod charset {
    pub const LATIN1_SWEDISH_CI: u8 = 8;
    pub const UTF8_GENERAL_CI: u8 = 33;
    pub const UTF8MB4_GENERAL_CI: u8 = 45;
    pub const BINARY: u8 = 63;
    pub const UTF8MB4_0900_AI_CI: u8 = 255;

    /// Charset requested in the handshake response.
    ///
    /// 45 is understood by every server from 5.5 on; 8.0 servers map it to
    /// their own default collation on `SET NAMES`.
    pub const DEFAULT_CHARSET: u8 = UTF8MB4_GENERAL_CI;

    /// Look up a handshake charset id by its name.
    pub fn by_name(name: &str) -> Option<u8> {
        match name.to_ascii_lowercase().as_str() {
            "latin1" => Some(LATIN1_SWEDISH_CI),
            "utf8" | "utf8mb3" => Some(UTF8_GENERAL_CI),
            "utf8mb4" => Some(UTF8MB4_GENERAL_CI),
            "binary" => Some(BINARY),
            _ => None,
        }
    }
}

/// A MySQL frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    /// Parse a frame header from 4 bytes.
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        let payload_length =
            u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16);
        Self {
            payload_length,
            sequence_id: bytes[3],
        }
    }

    /// Encode the header to 4 bytes.
    pub fn to_bytes(self) -> [u8; 4] {
        let len = self.payload_length.to_le_bytes();
        [len[0], len[1], len[2], self.sequence_id]
    }
}

/// Parsed OK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    /// Number of affected rows
    pub affected_rows: u64,
    /// Last insert ID
    pub last_insert_id: u64,
    /// Server status flags
    pub status_flags: u16,
    /// Number of warnings
    pub warnings: u16,
    /// Info string (if any)
    pub info: String,
}

impl OkPacket {
    /// Does another result set follow this one?
    pub const fn more_results(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }

    /// Is a transaction open on the server after this statement?
    pub const fn in_transaction(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_IN_TRANS != 0
    }
}

/// Parsed ERR packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    /// Error code
    pub error_code: u16,
    /// SQL state (5 characters, empty on pre-4.1 servers)
    pub sql_state: String,
    /// Error message
    pub error_message: String,
}

impl ErrPacket {
    /// Convert into the driver's query error, keeping code and message verbatim.
    pub fn into_query_error(self) -> asyncmy_core::QueryError {
        let sqlstate = (!self.sql_state.is_empty()).then_some(self.sql_state);
        asyncmy_core::QueryError::from_server(self.error_code, sqlstate, self.error_message)
    }
}

/// Parsed EOF packet (replaced by OK when CLIENT_DEPRECATE_EOF is negotiated).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EofPacket {
    /// Number of warnings
    pub warnings: u16,
    /// Server status flags
    pub status_flags: u16,
}

impl From<EofPacket> for OkPacket {
    fn from(eof: EofPacket) -> Self {
        OkPacket {
            status_flags: eof.status_flags,
            warnings: eof.warnings,
            ..OkPacket::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_header_layout() {
        let header = PacketHeader {
            payload_length: 0x0012_3456,
            sequence_id: 7,
        };
        assert_eq!(header.to_bytes(), [0x56, 0x34, 0x12, 7]);
        assert_eq!(PacketHeader::from_bytes([0x56, 0x34, 0x12, 7]), header);
    }

    #[test]
    fn test_packet_header_max_size() {
        let header = PacketHeader {
            payload_length: MAX_PACKET_SIZE as u32,
            sequence_id: 255,
        };
        assert_eq!(header.to_bytes(), [0xFF, 0xFF, 0xFF, 255]);
    }

    #[test]
    fn test_command_payload() {
        assert_eq!(Command::Query.payload(b"SELECT 1"), b"\x03SELECT 1".to_vec());
        assert_eq!(Command::Ping.payload(&[]), vec![0x0e]);
        assert!(!Command::Quit.expects_response());
        assert!(Command::StmtExecute.expects_response());
    }

    #[test]
    fn test_err_packet_to_query_error() {
        let err = ErrPacket {
            error_code: 1146,
            sql_state: "42S02".to_string(),
            error_message: "Table 'test.nope' doesn't exist".to_string(),
        }
        .into_query_error();
        assert_eq!(err.code, Some(1146));
        assert_eq!(err.sqlstate.as_deref(), Some("42S02"));
        assert_eq!(err.kind, asyncmy_core::QueryErrorKind::NotFound);

        let bare = ErrPacket {
            error_code: 1040,
            sql_state: String::new(),
            error_message: "Too many connections".to_string(),
        }
        .into_query_error();
        assert_eq!(bare.sqlstate, None);
    }

    #[test]
    fn test_charset_lookup() {
        assert_eq!(charset::by_name("UTF8MB4"), Some(charset::UTF8MB4_GENERAL_CI));
        assert_eq!(charset::by_name("klingon"), None);
    }

    #[test]
    fn test_ok_status_helpers() {
        let ok = OkPacket {
            status_flags: server_status::SERVER_MORE_RESULTS_EXISTS
                | server_status::SERVER_STATUS_IN_TRANS,
            ..OkPacket::default()
        };
        assert!(ok.more_results());
        assert!(ok.in_transaction());
    }
}
