//! Canned server packets for connection and cursor tests.

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};

use asyncmy_core::Error;

use crate::async_connection::MySqlConnection;
use crate::config::MySqlConfig;
use crate::protocol::{PacketWriter, capabilities, charset, server_status};
use crate::stream::{MySqlStream, ScriptedStream};
use crate::types::FieldType;

pub(crate) const SCRAMBLE: [u8; 20] = *b"abcdefghijklmnopqrst";

pub(crate) const SERVER_CAPS: u32 = capabilities::DEFAULT_CLIENT_FLAGS
    | capabilities::CLIENT_CONNECT_WITH_DB
    | capabilities::CLIENT_CONNECT_ATTRS
    | capabilities::CLIENT_LOCAL_FILES
    | capabilities::CLIENT_FOUND_ROWS;

/// Unwrap an `Outcome` in tests.
pub(crate) fn ok<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(_) => panic!("unexpected cancellation"),
        Outcome::Panicked(_) => panic!("unexpected panic"),
    }
}

/// The error of a failed `Outcome`.
pub(crate) fn err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error, got Ok"),
        Outcome::Cancelled(_) => panic!("expected an error, got cancellation"),
        Outcome::Panicked(_) => panic!("expected an error, got panic"),
    }
}

pub(crate) fn run<F: std::future::Future>(fut: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create runtime");
    rt.block_on(fut)
}

/// Server greeting announcing `plugin`.
pub(crate) fn greeting(capabilities: u32, plugin: &str, scramble: &[u8; 20]) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(10);
    w.write_null_string("8.0.36");
    w.write_u32_le(42);
    w.write_bytes(&scramble[..8]);
    w.write_u8(0);
    w.write_u16_le((capabilities & 0xFFFF) as u16);
    w.write_u8(charset::UTF8MB4_0900_AI_CI);
    w.write_u16_le(server_status::SERVER_STATUS_AUTOCOMMIT);
    w.write_u16_le((capabilities >> 16) as u16);
    w.write_u8(21);
    w.write_zeros(10);
    w.write_bytes(&scramble[8..]);
    w.write_u8(0);
    w.write_null_string(plugin);
    w.into_bytes()
}

pub(crate) fn ok_packet(affected_rows: u64, last_insert_id: u64, status: u16) -> Vec<u8> {
    ok_packet_with(0x00, affected_rows, last_insert_id, status, 0)
}

/// Row terminator under CLIENT_DEPRECATE_EOF.
pub(crate) fn eof_ok(status: u16, warnings: u16) -> Vec<u8> {
    ok_packet_with(0xFE, 0, 0, status, warnings)
}

fn ok_packet_with(tag: u8, affected: u64, last_id: u64, status: u16, warnings: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(tag);
    w.write_lenenc_int(affected);
    w.write_lenenc_int(last_id);
    w.write_u16_le(status);
    w.write_u16_le(warnings);
    w.into_bytes()
}

pub(crate) fn err_packet(code: u16, sqlstate: &str, message: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0xFF);
    w.write_u16_le(code);
    w.write_u8(b'#');
    w.write_bytes(sqlstate.as_bytes());
    w.write_bytes(message.as_bytes());
    w.into_bytes()
}

pub(crate) fn column_def(name: &str, field_type: FieldType, flags: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_lenenc_string("def");
    w.write_lenenc_string("test");
    w.write_lenenc_string("t");
    w.write_lenenc_string("t");
    w.write_lenenc_string(name);
    w.write_lenenc_string(name);
    w.write_lenenc_int(0x0c);
    w.write_u16_le(u16::from(charset::UTF8MB4_GENERAL_CI));
    w.write_u32_le(11);
    w.write_u8(field_type.code());
    w.write_u16_le(flags);
    w.write_u8(0);
    w.write_zeros(2);
    w.into_bytes()
}

pub(crate) fn text_row(values: &[Option<&str>]) -> Vec<u8> {
    let mut w = PacketWriter::new();
    for value in values {
        match value {
            Some(v) => w.write_lenenc_string(v),
            None => w.write_u8(0xFB),
        }
    }
    w.into_bytes()
}

/// Packets of a text result set: header, definitions, rows, terminator.
pub(crate) fn result_set(
    columns: &[(&str, FieldType)],
    rows: &[Vec<Option<&str>>],
    status: u16,
) -> Vec<Vec<u8>> {
    let mut packets = Vec::with_capacity(columns.len() + rows.len() + 2);
    let mut header = PacketWriter::new();
    header.write_lenenc_int(columns.len() as u64);
    packets.push(header.into_bytes());
    for (name, field_type) in columns {
        packets.push(column_def(name, *field_type, 0));
    }
    for row in rows {
        packets.push(text_row(row));
    }
    packets.push(eof_ok(status, 0));
    packets
}

/// Scripted server side of one connection.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockServer {
    pub(crate) stream: ScriptedStream,
}

impl MockServer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Greeting plus an immediate auth OK.
    pub(crate) fn accept(&self, plugin: &str) -> &Self {
        self.stream
            .push_packet(&greeting(SERVER_CAPS, plugin, &SCRAMBLE), 0);
        self.stream
            .push_packet(&ok_packet(0, 0, server_status::SERVER_STATUS_AUTOCOMMIT), 2);
        self
    }

    /// Queue a command response; sequence numbers start at 1.
    pub(crate) fn reply(&self, packets: &[Vec<u8>]) -> &Self {
        self.reply_from(1, packets)
    }

    pub(crate) fn reply_from(&self, first_seq: u8, packets: &[Vec<u8>]) -> &Self {
        let mut seq = first_seq;
        for packet in packets {
            self.stream.push_packet(packet, seq);
            seq = seq.wrapping_add(1);
        }
        self
    }

    /// Client packets after the handshake, as `(seq, payload)`.
    pub(crate) fn commands(&self) -> Vec<(u8, Vec<u8>)> {
        self.stream.written_frames().into_iter().skip(1).collect()
    }

    /// Text of every COM_QUERY the client sent.
    pub(crate) fn queries(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|(seq, payload)| *seq == 0 && payload.first() == Some(&0x03))
            .map(|(_, payload)| String::from_utf8_lossy(&payload[1..]).into_owned())
            .collect()
    }

    pub(crate) async fn connect(&self, cx: &Cx, config: MySqlConfig) -> Outcome<MySqlConnection, Error> {
        MySqlConnection::establish(cx, MySqlStream::Scripted(self.stream.clone()), config).await
    }

    /// A connection that went through the handshake.
    pub(crate) async fn connected(&self, cx: &Cx) -> MySqlConnection {
        self.accept("mysql_native_password");
        ok(self.connect(cx, MySqlConfig::new().user("root")).await)
    }
}
