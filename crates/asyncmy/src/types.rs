//! MySQL type system and value conversion.
//!
//! This module provides:
//! - `FieldType`, one variant per `MYSQL_TYPE_*` code plus `Unsupported`
//! - `DecodeKind`, the decode table keyed by field type
//! - Row decoding for the text and binary result set encodings
//! - Parameter encoding: SQL literals for the text protocol and typed
//!   values for `COM_STMT_EXECUTE`
//! - `%s` parameter interpolation
//!
//! NULL never reaches the per-value decoders: text rows mark it with `0xFB`
//! and binary rows with the null bitmap, both handled by the row decoders.

use asyncmy_core::error::{QueryError, QueryErrorKind, TypeError, UnsupportedTypeError};
use asyncmy_core::{Date, DateTime, Error, Result, Time, Value};

use crate::protocol::codec::protocol_error;
use crate::protocol::{PacketReader, PacketWriter, charset};

/// MySQL field type codes.
///
/// These are the `MYSQL_TYPE_*` constants from the MySQL C API. Codes with
/// no mapping become `Unsupported` and fail on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Decimal,
    Tiny,
    Short,
    Long,
    Float,
    Double,
    Null,
    Timestamp,
    LongLong,
    Int24,
    Date,
    Time,
    DateTime,
    Year,
    NewDate,
    VarChar,
    Bit,
    Timestamp2,
    DateTime2,
    Time2,
    Json,
    NewDecimal,
    Enum,
    Set,
    TinyBlob,
    MediumBlob,
    LongBlob,
    Blob,
    VarString,
    String,
    Geometry,
    /// A type code this driver has no mapping for
    Unsupported(u8),
}

impl FieldType {
    /// Parse a field type from its wire code.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0x11 => FieldType::Timestamp2,
            0x12 => FieldType::DateTime2,
            0x13 => FieldType::Time2,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFE => FieldType::String,
            0xFF => FieldType::Geometry,
            other => FieldType::Unsupported(other),
        }
    }

    /// The wire code of this type.
    pub const fn code(self) -> u8 {
        match self {
            FieldType::Decimal => 0x00,
            FieldType::Tiny => 0x01,
            FieldType::Short => 0x02,
            FieldType::Long => 0x03,
            FieldType::Float => 0x04,
            FieldType::Double => 0x05,
            FieldType::Null => 0x06,
            FieldType::Timestamp => 0x07,
            FieldType::LongLong => 0x08,
            FieldType::Int24 => 0x09,
            FieldType::Date => 0x0A,
            FieldType::Time => 0x0B,
            FieldType::DateTime => 0x0C,
            FieldType::Year => 0x0D,
            FieldType::NewDate => 0x0E,
            FieldType::VarChar => 0x0F,
            FieldType::Bit => 0x10,
            FieldType::Timestamp2 => 0x11,
            FieldType::DateTime2 => 0x12,
            FieldType::Time2 => 0x13,
            FieldType::Json => 0xF5,
            FieldType::NewDecimal => 0xF6,
            FieldType::Enum => 0xF7,
            FieldType::Set => 0xF8,
            FieldType::TinyBlob => 0xF9,
            FieldType::MediumBlob => 0xFA,
            FieldType::LongBlob => 0xFB,
            FieldType::Blob => 0xFC,
            FieldType::VarString => 0xFD,
            FieldType::String => 0xFE,
            FieldType::Geometry => 0xFF,
            FieldType::Unsupported(code) => code,
        }
    }

    /// Check if this is an integer type.
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    /// Check if this is a date/time type.
    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
                | FieldType::NewDate
                | FieldType::Timestamp2
                | FieldType::DateTime2
                | FieldType::Time2
        )
    }

    /// Get the type name as a string.
    pub const fn name(self) -> &'static str {
        match self {
            FieldType::Decimal | FieldType::NewDecimal => "DECIMAL",
            FieldType::Tiny => "TINYINT",
            FieldType::Short => "SMALLINT",
            FieldType::Long => "INT",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Null => "NULL",
            FieldType::Timestamp | FieldType::Timestamp2 => "TIMESTAMP",
            FieldType::LongLong => "BIGINT",
            FieldType::Int24 => "MEDIUMINT",
            FieldType::Date | FieldType::NewDate => "DATE",
            FieldType::Time | FieldType::Time2 => "TIME",
            FieldType::DateTime | FieldType::DateTime2 => "DATETIME",
            FieldType::Year => "YEAR",
            FieldType::VarChar | FieldType::VarString => "VARCHAR",
            FieldType::Bit => "BIT",
            FieldType::Json => "JSON",
            FieldType::Enum => "ENUM",
            FieldType::Set => "SET",
            FieldType::TinyBlob => "TINYBLOB",
            FieldType::MediumBlob => "MEDIUMBLOB",
            FieldType::LongBlob => "LONGBLOB",
            FieldType::Blob => "BLOB",
            FieldType::String => "CHAR",
            FieldType::Geometry => "GEOMETRY",
            FieldType::Unsupported(_) => "UNSUPPORTED",
        }
    }

    /// Look up how values of this type are decoded.
    pub const fn decode_kind(self) -> DecodeKind {
        match self {
            FieldType::Null => DecodeKind::Null,
            FieldType::Tiny => DecodeKind::Int { width: 1 },
            FieldType::Short => DecodeKind::Int { width: 2 },
            FieldType::Int24 => DecodeKind::Int { width: 3 },
            FieldType::Long => DecodeKind::Int { width: 4 },
            FieldType::LongLong => DecodeKind::Int { width: 8 },
            FieldType::Year => DecodeKind::Year,
            FieldType::Float => DecodeKind::Float,
            FieldType::Double => DecodeKind::Double,
            FieldType::Decimal | FieldType::NewDecimal => DecodeKind::Decimal,
            FieldType::Date | FieldType::NewDate => DecodeKind::Date,
            FieldType::Time | FieldType::Time2 => DecodeKind::Time,
            FieldType::DateTime
            | FieldType::DateTime2
            | FieldType::Timestamp
            | FieldType::Timestamp2 => DecodeKind::DateTime,
            FieldType::Json => DecodeKind::Json,
            FieldType::Bit | FieldType::Geometry => DecodeKind::Bytes,
            FieldType::VarChar
            | FieldType::VarString
            | FieldType::String
            | FieldType::Enum
            | FieldType::Set
            | FieldType::TinyBlob
            | FieldType::MediumBlob
            | FieldType::LongBlob
            | FieldType::Blob => DecodeKind::String,
            FieldType::Unsupported(code) => DecodeKind::Unsupported(code),
        }
    }
}

/// Decode table entry: one decoder per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeKind {
    Null,
    /// Integer of the given declared width in bytes (INT24 is 3)
    Int { width: u8 },
    Year,
    Float,
    Double,
    Decimal,
    Date,
    Time,
    DateTime,
    Json,
    /// Always raw bytes (BIT, GEOMETRY)
    Bytes,
    /// Text unless the column uses the binary charset
    String,
    Unsupported(u8),
}

/// Which result set / parameter encoding is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolMode {
    /// Human-readable encoding used by COM_QUERY
    Text,
    /// Type-tagged encoding used by prepared statements
    Binary,
}

/// Column flags in result set metadata.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
    pub const NO_DEFAULT_VALUE: u16 = 4096;
    pub const ON_UPDATE_NOW: u16 = 8192;
    pub const NUM: u16 = 32768;
}

/// Column definition from a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Schema (database) name
    pub schema: String,
    /// Table name (or alias)
    pub table: String,
    /// Original table name
    pub org_table: String,
    /// Column name (or alias)
    pub name: String,
    /// Original column name
    pub org_name: String,
    /// Character set number
    pub charset: u16,
    /// Column length
    pub column_length: u32,
    /// Column type
    pub column_type: FieldType,
    /// Column flags
    pub flags: u16,
    /// Number of decimals
    pub decimals: u8,
}

impl ColumnDef {
    /// A synthetic column, used for prepared-statement parameters and tests.
    pub fn synthetic(name: impl Into<String>, column_type: FieldType, flags: u16) -> Self {
        Self {
            schema: String::new(),
            table: String::new(),
            org_table: String::new(),
            name: name.into(),
            org_name: String::new(),
            charset: u16::from(charset::UTF8MB4_GENERAL_CI),
            column_length: 0,
            column_type,
            flags,
            decimals: 0,
        }
    }

    /// Parse a column definition packet (protocol 4.1).
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let truncated = || protocol_error("truncated column definition packet");
        let mut reader = PacketReader::new(payload);
        let _catalog = reader.read_lenenc_bytes().ok_or_else(truncated)?;
        let schema = reader.read_lenenc_string().ok_or_else(truncated)?;
        let table = reader.read_lenenc_string().ok_or_else(truncated)?;
        let org_table = reader.read_lenenc_string().ok_or_else(truncated)?;
        let name = reader.read_lenenc_string().ok_or_else(truncated)?;
        let org_name = reader.read_lenenc_string().ok_or_else(truncated)?;
        // Length of the fixed-size block that follows (always 0x0c).
        let _fixed_len = reader.read_lenenc_int().ok_or_else(truncated)?;
        let charset = reader.read_u16_le().ok_or_else(truncated)?;
        let column_length = reader.read_u32_le().ok_or_else(truncated)?;
        let column_type = FieldType::from_code(reader.read_u8().ok_or_else(truncated)?);
        let flags = reader.read_u16_le().ok_or_else(truncated)?;
        let decimals = reader.read_u8().ok_or_else(truncated)?;

        Ok(Self {
            schema,
            table,
            org_table,
            name,
            org_name,
            charset,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }

    /// Check if the column is NOT NULL.
    pub const fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    /// Check if the column is a primary key.
    pub const fn is_primary_key(&self) -> bool {
        self.flags & column_flags::PRIMARY_KEY != 0
    }

    /// Check if the column is unsigned.
    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    /// Check if the column is auto-increment.
    pub const fn is_auto_increment(&self) -> bool {
        self.flags & column_flags::AUTO_INCREMENT != 0
    }

    /// Does the column hold bytes rather than characters?
    pub fn is_binary_charset(&self) -> bool {
        self.charset == u16::from(charset::BINARY)
    }

    /// Fail early if values of this column cannot be decoded.
    pub fn check_supported(&self) -> Result<()> {
        match self.column_type {
            FieldType::Unsupported(code) => Err(unsupported(code, self)),
            _ => Ok(()),
        }
    }
}

fn unsupported(type_code: u8, column: &ColumnDef) -> Error {
    Error::UnsupportedType(UnsupportedTypeError {
        type_code,
        column: Some(column.name.clone()),
    })
}

fn bad_value(expected: &'static str, raw: &[u8], column: &ColumnDef) -> Error {
    Error::Type(TypeError {
        expected,
        actual: format!("'{}'", String::from_utf8_lossy(raw)),
        column: Some(column.name.clone()),
        rust_type: None,
    })
}

fn signed_value(v: i64, width: u8) -> Option<Value> {
    match width {
        1 => i8::try_from(v).ok().map(Value::TinyInt),
        2 => i16::try_from(v).ok().map(Value::SmallInt),
        3 | 4 => i32::try_from(v).ok().map(Value::Int),
        _ => Some(Value::BigInt(v)),
    }
}

/// Unsigned columns widen to the next signed variant so no value wraps.
fn unsigned_value(v: u64, width: u8) -> Option<Value> {
    match width {
        1 => u8::try_from(v).ok().map(|v| Value::SmallInt(i16::from(v))),
        2 => u16::try_from(v).ok().map(|v| Value::Int(i32::from(v))),
        3 | 4 => u32::try_from(v).ok().map(|v| Value::BigInt(i64::from(v))),
        _ => Some(Value::UBigInt(v)),
    }
}

fn text_string(raw: &[u8], column: &ColumnDef) -> Value {
    if column.is_binary_charset() {
        return Value::Bytes(raw.to_vec());
    }
    match std::str::from_utf8(raw) {
        Ok(s) => Value::Text(s.to_string()),
        Err(_) => Value::Bytes(raw.to_vec()),
    }
}

fn json_value(raw: &[u8]) -> Value {
    serde_json::from_slice(raw).map_or_else(
        |_| Value::Text(String::from_utf8_lossy(raw).into_owned()),
        Value::Json,
    )
}

/// Decode one non-NULL column value.
///
/// In text mode `raw` is the field's character data. In binary mode `raw`
/// is the field exactly as it appears in a binary row, including the length
/// prefix of variable-length types, and must be consumed completely.
pub fn decode_value(raw: &[u8], column: &ColumnDef, mode: ProtocolMode) -> Result<Value> {
    match mode {
        ProtocolMode::Text => decode_text_value(raw, column),
        ProtocolMode::Binary => {
            let mut reader = PacketReader::new(raw);
            let value = decode_binary_field(&mut reader, column)?;
            if reader.is_empty() {
                Ok(value)
            } else {
                Err(bad_value("binary value of declared width", raw, column))
            }
        }
    }
}

fn decode_text_value(raw: &[u8], column: &ColumnDef) -> Result<Value> {
    let text = || std::str::from_utf8(raw).map_err(|_| bad_value("ASCII digits", raw, column));
    match column.column_type.decode_kind() {
        DecodeKind::Null => Ok(Value::Null),
        DecodeKind::Int { width } => {
            let s = text()?;
            let value = if column.is_unsigned() {
                s.parse::<u64>().ok().and_then(|v| unsigned_value(v, width))
            } else {
                s.parse::<i64>().ok().and_then(|v| signed_value(v, width))
            };
            value.ok_or_else(|| bad_value("integer", raw, column))
        }
        DecodeKind::Year => text()?
            .parse::<i16>()
            .map(Value::SmallInt)
            .map_err(|_| bad_value("YEAR", raw, column)),
        DecodeKind::Float => text()?
            .parse::<f32>()
            .map(Value::Float)
            .map_err(|_| bad_value("FLOAT", raw, column)),
        DecodeKind::Double => text()?
            .parse::<f64>()
            .map(Value::Double)
            .map_err(|_| bad_value("DOUBLE", raw, column)),
        DecodeKind::Decimal => Ok(Value::Decimal(text()?.to_string())),
        // Out-of-range temporals (e.g. "2024-02-30" under ALLOW_INVALID_DATES)
        // are kept as text rather than guessed at.
        DecodeKind::Date => {
            let s = text()?;
            Ok(s.parse::<Date>()
                .map_or_else(|_| Value::Text(s.to_string()), Value::Date))
        }
        DecodeKind::Time => {
            let s = text()?;
            Ok(s.parse::<Time>()
                .map_or_else(|_| Value::Text(s.to_string()), Value::Time))
        }
        DecodeKind::DateTime => {
            let s = text()?;
            Ok(s.parse::<DateTime>()
                .map_or_else(|_| Value::Text(s.to_string()), Value::DateTime))
        }
        DecodeKind::Json => Ok(json_value(raw)),
        DecodeKind::Bytes => Ok(Value::Bytes(raw.to_vec())),
        DecodeKind::String => Ok(text_string(raw, column)),
        DecodeKind::Unsupported(code) => Err(unsupported(code, column)),
    }
}

/// Decode one non-NULL field of a binary row, advancing `reader` past it.
pub fn decode_binary_field(reader: &mut PacketReader<'_>, column: &ColumnDef) -> Result<Value> {
    let truncated = || protocol_error(format!("truncated binary value for column '{}'", column.name));
    match column.column_type.decode_kind() {
        DecodeKind::Null => Ok(Value::Null),
        DecodeKind::Int { width } => {
            let unsigned = column.is_unsigned();
            let value = match width {
                1 => {
                    let b = reader.read_u8().ok_or_else(truncated)?;
                    if unsigned {
                        unsigned_value(u64::from(b), 1)
                    } else {
                        signed_value(i64::from(b as i8), 1)
                    }
                }
                2 => {
                    let v = reader.read_u16_le().ok_or_else(truncated)?;
                    if unsigned {
                        unsigned_value(u64::from(v), 2)
                    } else {
                        signed_value(i64::from(v as i16), 2)
                    }
                }
                // MEDIUMINT travels as 4 bytes in binary rows.
                3 | 4 => {
                    let v = reader.read_u32_le().ok_or_else(truncated)?;
                    if unsigned {
                        unsigned_value(u64::from(v), width)
                    } else {
                        signed_value(i64::from(v as i32), width)
                    }
                }
                _ => {
                    let v = reader.read_u64_le().ok_or_else(truncated)?;
                    if unsigned {
                        unsigned_value(v, 8)
                    } else {
                        signed_value(v as i64, 8)
                    }
                }
            };
            value.ok_or_else(|| protocol_error("integer out of range for declared width"))
        }
        DecodeKind::Year => reader
            .read_u16_le()
            .map(|v| Value::SmallInt(v as i16))
            .ok_or_else(truncated),
        DecodeKind::Float => reader
            .read_u32_le()
            .map(|bits| Value::Float(f32::from_bits(bits)))
            .ok_or_else(truncated),
        DecodeKind::Double => reader
            .read_u64_le()
            .map(|bits| Value::Double(f64::from_bits(bits)))
            .ok_or_else(truncated),
        DecodeKind::Date => {
            let raw = reader.read_lenenc_bytes().ok_or_else(truncated)?;
            decode_binary_date(raw, column).map(|dt| Value::Date(dt.date()))
        }
        DecodeKind::DateTime => {
            let raw = reader.read_lenenc_bytes().ok_or_else(truncated)?;
            decode_binary_date(raw, column).map(Value::DateTime)
        }
        DecodeKind::Time => {
            let raw = reader.read_lenenc_bytes().ok_or_else(truncated)?;
            decode_binary_time(raw, column).map(Value::Time)
        }
        DecodeKind::Decimal | DecodeKind::Json | DecodeKind::Bytes | DecodeKind::String => {
            let raw = reader.read_lenenc_bytes().ok_or_else(truncated)?;
            decode_text_value(raw, column)
        }
        DecodeKind::Unsupported(code) => Err(unsupported(code, column)),
    }
}

/// Binary DATE/DATETIME: length 0, 4, 7 or 11.
fn decode_binary_date(raw: &[u8], column: &ColumnDef) -> Result<DateTime> {
    let mut r = PacketReader::new(raw);
    let mut dt = DateTime::new(0, 0, 0, 0, 0, 0);
    if !matches!(raw.len(), 0 | 4 | 7 | 11) {
        return Err(bad_value("binary DATETIME of length 0, 4, 7 or 11", raw, column));
    }
    if raw.len() >= 4 {
        dt.year = r.read_u16_le().unwrap_or(0);
        dt.month = r.read_u8().unwrap_or(0);
        dt.day = r.read_u8().unwrap_or(0);
    }
    if raw.len() >= 7 {
        dt.hour = r.read_u8().unwrap_or(0);
        dt.minute = r.read_u8().unwrap_or(0);
        dt.second = r.read_u8().unwrap_or(0);
    }
    if raw.len() == 11 {
        dt.microsecond = r.read_u32_le().unwrap_or(0);
    }
    Ok(dt)
}

/// TIME spans at most 838:59:59, i.e. 34 whole days plus hours.
const MAX_TIME_DAYS: u32 = 34;

/// Binary TIME: length 0, 8 or 12 (sign, days, h, m, s, [micros]).
fn decode_binary_time(raw: &[u8], column: &ColumnDef) -> Result<Time> {
    let mut r = PacketReader::new(raw);
    let mut time = Time::new(0, 0, 0);
    if !matches!(raw.len(), 0 | 8 | 12) {
        return Err(bad_value("binary TIME of length 0, 8 or 12", raw, column));
    }
    if raw.len() >= 8 {
        time.negative = r.read_u8().unwrap_or(0) != 0;
        let days = r.read_u32_le().unwrap_or(0);
        let hours = r.read_u8().unwrap_or(0);
        time.hours = days
            .checked_mul(24)
            .and_then(|h| h.checked_add(u32::from(hours)))
            .filter(|_| days <= MAX_TIME_DAYS)
            .ok_or_else(|| bad_value("binary TIME within +/-838 hours", raw, column))?;
        time.minutes = r.read_u8().unwrap_or(0);
        time.seconds = r.read_u8().unwrap_or(0);
    }
    if raw.len() == 12 {
        time.microseconds = r.read_u32_le().unwrap_or(0);
    }
    Ok(time)
}

/// Decode a text-protocol row.
pub fn decode_text_row(payload: &[u8], columns: &[ColumnDef]) -> Result<Vec<Value>> {
    let mut reader = PacketReader::new(payload);
    let mut values = Vec::with_capacity(columns.len());
    for column in columns {
        if reader.peek() == Some(0xFB) {
            reader.skip(1);
            values.push(Value::Null);
            continue;
        }
        let raw = reader
            .read_lenenc_bytes()
            .ok_or_else(|| protocol_error(format!("truncated text row at column '{}'", column.name)))?;
        values.push(decode_text_value(raw, column)?);
    }
    if !reader.is_empty() {
        return Err(protocol_error(format!(
            "text row has {} trailing bytes after {} columns",
            reader.remaining(),
            columns.len()
        )));
    }
    Ok(values)
}

/// Decode a binary-protocol row (header byte 0x00, null bitmap with offset 2).
pub fn decode_binary_row(payload: &[u8], columns: &[ColumnDef]) -> Result<Vec<Value>> {
    let mut reader = PacketReader::new(payload);
    if reader.read_u8() != Some(0x00) {
        return Err(protocol_error("binary row does not start with 0x00"));
    }
    let bitmap_len = (columns.len() + 7 + 2) / 8;
    let bitmap = reader
        .read_bytes(bitmap_len)
        .ok_or_else(|| protocol_error("truncated binary row null bitmap"))?;

    let mut values = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(Value::Null);
        } else {
            values.push(decode_binary_field(&mut reader, column)?);
        }
    }
    if !reader.is_empty() {
        return Err(protocol_error("binary row has trailing bytes"));
    }
    Ok(values)
}

// === Parameter encoding ===

/// A parameter encoded for one of the two protocols.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodedParam {
    /// A complete SQL literal, safe to splice into statement text
    Literal(String),
    /// A typed value for COM_STMT_EXECUTE
    Binary(BinaryParam),
}

/// Type tag and wire bytes of one binary-protocol parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryParam {
    pub field_type: FieldType,
    pub unsigned: bool,
    /// Value bytes; empty for NULL, which is carried by the null bitmap
    pub bytes: Vec<u8>,
}

/// Encode a parameter for the given protocol.
///
/// Text literals assume the server honours backslash escapes; use
/// [`literal`] with the connection's escaping mode when that may be off.
pub fn encode_param(value: &Value, mode: ProtocolMode) -> Result<EncodedParam> {
    match mode {
        ProtocolMode::Text => literal(value, false).map(EncodedParam::Literal),
        ProtocolMode::Binary => encode_binary_param(value).map(EncodedParam::Binary),
    }
}

fn non_finite(v: f64) -> Error {
    Error::Type(TypeError {
        expected: "finite floating point number",
        actual: v.to_string(),
        column: None,
        rust_type: None,
    })
}

/// Does `s` look like a plain fixed-point number (sign, digits, point)?
///
/// Exponents are refused: MySQL reads `1e0` as DOUBLE, not DECIMAL.
fn is_decimal_literal(s: &str) -> bool {
    let body = s.strip_prefix(['-', '+']).unwrap_or(s);
    let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));
    let digits = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
    (!int_part.is_empty() || !frac_part.is_empty()) && digits(int_part) && digits(frac_part)
}

fn checked_decimal(s: &str) -> Result<&str> {
    if is_decimal_literal(s) {
        Ok(s)
    } else {
        Err(Error::Type(TypeError {
            expected: "decimal number",
            actual: format!("'{}'", s),
            column: None,
            rust_type: None,
        }))
    }
}

/// Escape a string for use inside a quoted MySQL literal.
///
/// With `no_backslash_escapes` (the server's NO_BACKSLASH_ESCAPES mode)
/// only quotes are doubled.
pub fn escape_string(s: &str, no_backslash_escapes: bool) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for ch in s.chars() {
        if no_backslash_escapes {
            if ch == '\'' {
                out.push_str("''");
            } else {
                out.push(ch);
            }
            continue;
        }
        match ch {
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x1a' => out.push_str("\\Z"),
            _ => out.push(ch),
        }
    }
    out
}

fn quoted(s: &str, no_backslash_escapes: bool) -> String {
    format!("'{}'", escape_string(s, no_backslash_escapes))
}

/// Render a value as a SQL literal for the text protocol.
pub fn literal(value: &Value, no_backslash_escapes: bool) -> Result<String> {
    Ok(match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::TinyInt(i) => i.to_string(),
        Value::SmallInt(i) => i.to_string(),
        Value::Int(i) => i.to_string(),
        Value::BigInt(i) => i.to_string(),
        Value::UBigInt(i) => i.to_string(),
        // Exponent form keeps the literal a DOUBLE on the server side.
        Value::Float(f) if f.is_finite() => format!("{:e}", f),
        Value::Double(f) if f.is_finite() => format!("{:e}", f),
        Value::Float(f) => return Err(non_finite(f64::from(*f))),
        Value::Double(f) => return Err(non_finite(*f)),
        Value::Decimal(s) => checked_decimal(s)?.to_string(),
        Value::Text(s) => quoted(s, no_backslash_escapes),
        Value::Bytes(b) => {
            let mut out = String::with_capacity(b.len() * 2 + 3);
            out.push_str("X'");
            for byte in b {
                out.push_str(&format!("{byte:02X}"));
            }
            out.push('\'');
            out
        }
        Value::Date(d) => format!("'{}'", d),
        Value::Time(t) => format!("'{}'", t),
        Value::DateTime(dt) => format!("'{}'", dt),
        Value::Json(j) => quoted(&j.to_string(), no_backslash_escapes),
    })
}

fn narrow_signed(v: i64) -> (FieldType, Vec<u8>) {
    if let Ok(v) = i8::try_from(v) {
        (FieldType::Tiny, v.to_le_bytes().to_vec())
    } else if let Ok(v) = i16::try_from(v) {
        (FieldType::Short, v.to_le_bytes().to_vec())
    } else if let Ok(v) = i32::try_from(v) {
        (FieldType::Long, v.to_le_bytes().to_vec())
    } else {
        (FieldType::LongLong, v.to_le_bytes().to_vec())
    }
}

fn narrow_unsigned(v: u64) -> (FieldType, Vec<u8>) {
    if let Ok(v) = u8::try_from(v) {
        (FieldType::Tiny, vec![v])
    } else if let Ok(v) = u16::try_from(v) {
        (FieldType::Short, v.to_le_bytes().to_vec())
    } else if let Ok(v) = u32::try_from(v) {
        (FieldType::Long, v.to_le_bytes().to_vec())
    } else {
        (FieldType::LongLong, v.to_le_bytes().to_vec())
    }
}

fn lenenc(data: &[u8]) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(data.len() + 9);
    writer.write_lenenc_bytes(data);
    writer.into_bytes()
}

fn binary_datetime(dt: &DateTime) -> Vec<u8> {
    let mut w = PacketWriter::with_capacity(12);
    let has_date = dt.year != 0 || dt.month != 0 || dt.day != 0;
    let has_time = dt.hour != 0 || dt.minute != 0 || dt.second != 0;
    let len: u8 = if dt.microsecond != 0 {
        11
    } else if has_time {
        7
    } else if has_date {
        4
    } else {
        0
    };
    w.write_u8(len);
    if len >= 4 {
        w.write_u16_le(dt.year);
        w.write_u8(dt.month);
        w.write_u8(dt.day);
    }
    if len >= 7 {
        w.write_u8(dt.hour);
        w.write_u8(dt.minute);
        w.write_u8(dt.second);
    }
    if len == 11 {
        w.write_u32_le(dt.microsecond);
    }
    w.into_bytes()
}

fn binary_time(t: &Time) -> Vec<u8> {
    let mut w = PacketWriter::with_capacity(13);
    if t.total_micros() == 0 {
        w.write_u8(0);
        return w.into_bytes();
    }
    w.write_u8(if t.microseconds != 0 { 12 } else { 8 });
    w.write_u8(u8::from(t.negative));
    w.write_u32_le(t.hours / 24);
    w.write_u8((t.hours % 24) as u8);
    w.write_u8(t.minutes);
    w.write_u8(t.seconds);
    if t.microseconds != 0 {
        w.write_u32_le(t.microseconds);
    }
    w.into_bytes()
}

/// Encode a parameter for COM_STMT_EXECUTE, picking the narrowest integer type.
pub fn encode_binary_param(value: &Value) -> Result<BinaryParam> {
    let signed = |(field_type, bytes): (FieldType, Vec<u8>)| BinaryParam {
        field_type,
        unsigned: false,
        bytes,
    };
    Ok(match value {
        Value::Null => signed((FieldType::Null, Vec::new())),
        Value::Bool(b) => signed((FieldType::Tiny, vec![u8::from(*b)])),
        Value::TinyInt(v) => signed(narrow_signed(i64::from(*v))),
        Value::SmallInt(v) => signed(narrow_signed(i64::from(*v))),
        Value::Int(v) => signed(narrow_signed(i64::from(*v))),
        Value::BigInt(v) => signed(narrow_signed(*v)),
        Value::UBigInt(v) => {
            let (field_type, bytes) = narrow_unsigned(*v);
            BinaryParam {
                field_type,
                unsigned: true,
                bytes,
            }
        }
        Value::Float(f) if f.is_finite() => signed((FieldType::Float, f.to_le_bytes().to_vec())),
        Value::Double(f) if f.is_finite() => {
            signed((FieldType::Double, f.to_le_bytes().to_vec()))
        }
        Value::Float(f) => return Err(non_finite(f64::from(*f))),
        Value::Double(f) => return Err(non_finite(*f)),
        Value::Decimal(s) => signed((FieldType::NewDecimal, lenenc(checked_decimal(s)?.as_bytes()))),
        Value::Text(s) => signed((FieldType::VarString, lenenc(s.as_bytes()))),
        Value::Bytes(b) => signed((FieldType::Blob, lenenc(b))),
        Value::Json(j) => signed((FieldType::VarString, lenenc(j.to_string().as_bytes()))),
        Value::Date(d) => signed((FieldType::Date, binary_datetime(&d.and_midnight()))),
        Value::Time(t) => signed((FieldType::Time, binary_time(t))),
        Value::DateTime(dt) => signed((FieldType::DateTime, binary_datetime(dt))),
    })
}

// === Parameter interpolation ===

fn parameter_error(message: String, sql: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Parameter,
        code: None,
        sqlstate: None,
        message,
        sql: Some(sql.to_string()),
        source: None,
    })
}

/// Substitute positional `%s` placeholders with SQL literals.
///
/// `%%` stands for a literal `%`. Any other `%` sequence, or a placeholder
/// count that differs from `params.len()`, is a `Parameter` query error.
/// With no parameters the statement is sent verbatim, so `%` needs no
/// escaping in parameterless statements.
pub fn interpolate_params(
    sql: &str,
    params: &[Value],
    no_backslash_escapes: bool,
) -> Result<String> {
    if params.is_empty() {
        return Ok(sql.to_string());
    }
    bind_params(sql, params, no_backslash_escapes)
}

/// Substitute `params` into `sql` even when `params` is empty.
///
/// Used for `executemany` rows, where an empty row against a statement
/// with placeholders is a `Parameter` error rather than a verbatim send.
pub fn bind_params(sql: &str, params: &[Value], no_backslash_escapes: bool) -> Result<String> {
    let mut out = String::with_capacity(sql.len() + params.len() * 16);
    let mut next = params.iter();
    let mut used = 0usize;
    let mut chars = sql.char_indices();
    while let Some((i, ch)) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some((_, '%')) => out.push('%'),
            Some((_, 's')) => {
                let value = next.next().ok_or_else(|| {
                    parameter_error(
                        format!("not enough parameters for statement ({} given)", params.len()),
                        sql,
                    )
                })?;
                out.push_str(&literal(value, no_backslash_escapes)?);
                used += 1;
            }
            Some((_, other)) => {
                return Err(parameter_error(
                    format!("unsupported placeholder '%{}' at offset {}", other, i),
                    sql,
                ));
            }
            None => {
                return Err(parameter_error("incomplete placeholder at end of statement".to_string(), sql));
            }
        }
    }
    if used != params.len() {
        return Err(parameter_error(
            format!(
                "statement has {} placeholders but {} parameters were given",
                used,
                params.len()
            ),
            sql,
        ));
    }
    Ok(out)
}
