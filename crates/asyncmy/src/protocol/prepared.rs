//! Prepared statement (binary protocol) packets.
//!
//! 1. COM_STMT_PREPARE: the server answers with a PREPARE_OK header, then the
//!    parameter definitions and the result column definitions.
//! 2. COM_STMT_EXECUTE: statement id plus typed parameters. The answer is an
//!    OK/ERR packet or a result set with binary rows.
//! 3. COM_STMT_CLOSE: no answer.
//!
//! Builders here return command payloads; framing happens in the connection.

use asyncmy_core::{Result, Value};

use super::codec::protocol_error;
use super::{Command, PacketReader, PacketWriter};
use crate::types::{ColumnDef, encode_binary_param};

/// Response header of COM_STMT_PREPARE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    /// Server-assigned statement id
    pub statement_id: u32,
    /// Result columns (0 for statements without a result set)
    pub num_columns: u16,
    /// Number of `?` placeholders
    pub num_params: u16,
    pub warnings: u16,
}

/// A statement prepared on one connection.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub statement_id: u32,
    pub sql: String,
    /// Parameter definitions as reported by the server
    pub params: Vec<ColumnDef>,
    /// Result column definitions
    pub columns: Vec<ColumnDef>,
}

impl PreparedStatement {
    pub fn new(statement_id: u32, sql: String, params: Vec<ColumnDef>, columns: Vec<ColumnDef>) -> Self {
        Self {
            statement_id,
            sql,
            params,
            columns,
        }
    }

    #[must_use]
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

/// COM_STMT_PREPARE payload.
pub fn build_stmt_prepare(sql: &str) -> Vec<u8> {
    Command::StmtPrepare.payload(sql.as_bytes())
}

/// COM_STMT_EXECUTE payload.
///
/// Layout: command, statement id, flags (no cursor), iteration count 1, then
/// when there are parameters: the NULL bitmap, new-params-bound = 1, a
/// (type, flags) pair per parameter and the non-NULL values in order.
pub fn build_stmt_execute(statement_id: u32, params: &[Value]) -> Result<Vec<u8>> {
    let encoded = params
        .iter()
        .map(encode_binary_param)
        .collect::<Result<Vec<_>>>()?;

    let mut writer = PacketWriter::with_capacity(
        16 + encoded.iter().map(|p| p.bytes.len() + 2).sum::<usize>(),
    );
    writer.write_u8(Command::StmtExecute as u8);
    writer.write_u32_le(statement_id);
    writer.write_u8(0x00);
    writer.write_u32_le(1);

    if !encoded.is_empty() {
        let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
        for (i, param) in params.iter().enumerate() {
            if param.is_null() {
                null_bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        writer.write_bytes(&null_bitmap);
        writer.write_u8(1);

        for param in &encoded {
            writer.write_u8(param.field_type.code());
            writer.write_u8(if param.unsigned { 0x80 } else { 0x00 });
        }
        for param in &encoded {
            writer.write_bytes(&param.bytes);
        }
    }

    Ok(writer.into_bytes())
}

/// COM_STMT_CLOSE payload.
pub fn build_stmt_close(statement_id: u32) -> Vec<u8> {
    Command::StmtClose.payload(&statement_id.to_le_bytes())
}

/// COM_STMT_RESET payload.
pub fn build_stmt_reset(statement_id: u32) -> Vec<u8> {
    Command::StmtReset.payload(&statement_id.to_le_bytes())
}

/// Parse the PREPARE_OK header.
///
/// Status 0x00, statement id (4), columns (2), params (2), filler (1),
/// warnings (2).
pub fn parse_stmt_prepare_ok(data: &[u8]) -> Result<StmtPrepareOk> {
    let malformed = || protocol_error("malformed COM_STMT_PREPARE response");
    let mut reader = PacketReader::new(data);
    if reader.read_u8() != Some(0x00) {
        return Err(malformed());
    }
    let statement_id = reader.read_u32_le().ok_or_else(malformed)?;
    let num_columns = reader.read_u16_le().ok_or_else(malformed)?;
    let num_params = reader.read_u16_le().ok_or_else(malformed)?;
    reader.skip(1);
    let warnings = reader.read_u16_le().unwrap_or(0);

    Ok(StmtPrepareOk {
        statement_id,
        num_columns,
        num_params,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;

    #[test]
    fn test_prepare_and_close_payloads() {
        assert_eq!(build_stmt_prepare("SELECT ?"), b"\x16SELECT ?".to_vec());
        assert_eq!(build_stmt_close(7), vec![0x19, 7, 0, 0, 0]);
        assert_eq!(build_stmt_reset(0x0102), vec![0x1a, 2, 1, 0, 0]);
    }

    #[test]
    fn test_execute_without_params() {
        let payload = build_stmt_execute(1, &[]).unwrap();
        assert_eq!(payload, vec![0x17, 1, 0, 0, 0, 0x00, 1, 0, 0, 0]);
    }

    #[test]
    fn test_execute_with_null_and_values() {
        let payload = build_stmt_execute(
            3,
            &[Value::Int(42), Value::Null, Value::Text("ab".to_string())],
        )
        .unwrap();
        let mut expected = vec![0x17, 3, 0, 0, 0, 0x00, 1, 0, 0, 0];
        expected.push(0b0000_0010);
        expected.push(1);
        expected.extend_from_slice(&[FieldType::Tiny.code(), 0]);
        expected.extend_from_slice(&[FieldType::Null.code(), 0]);
        expected.extend_from_slice(&[FieldType::VarString.code(), 0]);
        expected.push(42);
        expected.extend_from_slice(&[2, b'a', b'b']);
        assert_eq!(payload, expected);
    }

    #[test]
    fn test_execute_unsigned_flag() {
        let payload = build_stmt_execute(1, &[Value::UBigInt(u64::MAX)]).unwrap();
        // bitmap, bound flag, then type and flags
        assert_eq!(&payload[10..14], &[0, 1, FieldType::LongLong.code(), 0x80]);
    }

    #[test]
    fn test_execute_rejects_nan() {
        assert!(build_stmt_execute(1, &[Value::Double(f64::NAN)]).is_err());
    }

    #[test]
    fn test_parse_prepare_ok() {
        let data = [0x00, 0x05, 0, 0, 0, 0x02, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00];
        let ok = parse_stmt_prepare_ok(&data).unwrap();
        assert_eq!(ok.statement_id, 5);
        assert_eq!(ok.num_columns, 2);
        assert_eq!(ok.num_params, 1);
        assert_eq!(ok.warnings, 0);

        assert!(parse_stmt_prepare_ok(&[0xFF, 1, 2]).is_err());
        assert!(parse_stmt_prepare_ok(&[0x00, 1]).is_err());
    }
}
