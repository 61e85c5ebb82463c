//! # Column Codec Registry
//!
//! A fixed table mapping every exportable column to a deterministic,
//! fixed-width binary encoding. Column names are resolved to [`Column`]
//! variants once, when a [`ColumnSpec`] is parsed, so the hot encoding loop
//! dispatches on an enum instead of looking names up per row.
//!
//! ## Widths
//!
//! | column         | encoding                         | width |
//! |----------------|----------------------------------|-------|
//! | `userident`    | 40 hex chars decoded to raw bytes | 20 B |
//! | `levelversion` | low 8 bits                       | 1 B   |
//! | `practice`     | 0 / 1                            | 1 B   |
//! | `x`, `y`       | IEEE-754 `f32`, little-endian    | 4 B   |
//! | `percentage`   | low 16 bits, little-endian       | 2 B   |
//!
//! Every row of a given spec therefore has the same width, which is how a
//! reader finds row boundaries in the delimiter-free binary format.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, BytesMut};

use crate::core::error::ExportError;

/// Number of raw bytes in a decoded user identifier.
pub const IDENT_BYTES: usize = 20;

/// A single row, one [`Value`] per column of the active [`ColumnSpec`].
pub type Row = Vec<Value>;

/// # Field Value
///
/// A typed scalar as produced by a row source. Text exports render it with
/// `Display`; binary exports hand it to the column's codec.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A 40 character hexadecimal identifier.
    Ident(String),
    /// An unsigned integer.
    UInt(u64),
    /// A signed integer.
    Int(i64),
    /// A boolean flag.
    Bool(bool),
    /// A 32-bit float.
    Float(f32),
}

impl Value {
    /// Short name of the value's kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Ident(_) => "identifier",
            Value::UInt(_) => "unsigned integer",
            Value::Int(_) => "integer",
            Value::Bool(_) => "boolean",
            Value::Float(_) => "float",
        }
    }
}

impl fmt::Display for Value {
    /// Plain-text rendering used by CSV exports. Floats use the shortest
    /// representation that round-trips, so `100.0` renders as `100`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Ident(s) => f.write_str(s),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Bool(b) => f.write_str(if *b { "1" } else { "0" }),
            Value::Float(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Ident(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Ident(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(value)
    }
}

impl From<u8> for Value {
    fn from(value: u8) -> Self {
        Value::UInt(u64::from(value))
    }
}

impl From<u16> for Value {
    fn from(value: u16) -> Self {
        Value::UInt(u64::from(value))
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::UInt(value)
    }
}

impl From<i16> for Value {
    fn from(value: i16) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

/// # Column
///
/// Every column the export surface knows how to encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    /// 20-byte player identifier, transported as hex.
    UserIdent,
    /// Edit revision of the level.
    LevelVersion,
    /// Whether the death happened in practice mode.
    Practice,
    /// Horizontal position.
    X,
    /// Vertical position.
    Y,
    /// Progress through the level.
    Percentage,
}

impl Column {
    /// All columns, in the order the analysis export uses them.
    pub const ALL: [Column; 6] = [
        Column::UserIdent,
        Column::LevelVersion,
        Column::Practice,
        Column::X,
        Column::Y,
        Column::Percentage,
    ];

    /// Wire name of the column.
    pub fn name(self) -> &'static str {
        match self {
            Column::UserIdent => "userident",
            Column::LevelVersion => "levelversion",
            Column::Practice => "practice",
            Column::X => "x",
            Column::Y => "y",
            Column::Percentage => "percentage",
        }
    }

    /// Resolves a column name.
    ///
    /// # Errors
    /// Returns [`ExportError::UnknownColumn`] for names outside the table.
    pub fn parse(name: &str) -> Result<Self, ExportError> {
        let name = name.trim();
        Column::ALL
            .into_iter()
            .find(|column| column.name() == name)
            .ok_or_else(|| ExportError::UnknownColumn(name.to_string()))
    }

    /// Fixed binary width of the column in bytes.
    pub fn width(self) -> usize {
        match self {
            Column::UserIdent => IDENT_BYTES,
            Column::LevelVersion | Column::Practice => 1,
            Column::X | Column::Y => 4,
            Column::Percentage => 2,
        }
    }

    /// Appends the fixed-width encoding of `value` to `out`.
    ///
    /// Integer columns keep the low bits of the value; range clamping is the
    /// producer's job. On error nothing is written.
    ///
    /// # Errors
    /// [`ExportError::TypeMismatch`] when the value kind does not fit the
    /// column, [`ExportError::InvalidIdentifier`] for malformed hex.
    pub fn encode(self, value: &Value, out: &mut BytesMut) -> Result<(), ExportError> {
        match self {
            Column::UserIdent => {
                let Value::Ident(ident) = value else {
                    return Err(self.mismatch(value));
                };
                let mut raw = [0u8; IDENT_BYTES];
                hex::decode_to_slice(ident, &mut raw)
                    .map_err(|_| ExportError::InvalidIdentifier(ident.clone()))?;
                out.put_slice(&raw);
            }
            Column::LevelVersion | Column::Practice => out.put_u8(self.integer(value)? as u8),
            Column::X | Column::Y => out.put_f32_le(self.float(value)?),
            Column::Percentage => out.put_u16_le(self.integer(value)? as u16),
        }
        Ok(())
    }

    fn integer(self, value: &Value) -> Result<u64, ExportError> {
        match value {
            Value::UInt(v) => Ok(*v),
            // Two's complement keeps the low bits intact.
            Value::Int(v) => Ok(*v as u64),
            Value::Bool(b) => Ok(u64::from(*b)),
            _ => Err(self.mismatch(value)),
        }
    }

    fn float(self, value: &Value) -> Result<f32, ExportError> {
        match value {
            Value::Float(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f32),
            Value::UInt(v) => Ok(*v as f32),
            _ => Err(self.mismatch(value)),
        }
    }

    fn mismatch(self, value: &Value) -> ExportError {
        ExportError::TypeMismatch {
            column: self,
            found: value.kind(),
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Column {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Column::parse(s)
    }
}

/// # Column Spec
///
/// An ordered list of columns, resolved up front. Row fields must follow the
/// same order and count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    columns: Vec<Column>,
}

impl ColumnSpec {
    /// Builds a spec from already resolved columns.
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// Parses a comma separated list such as `"x,y,percentage"`.
    ///
    /// # Errors
    /// Returns [`ExportError::UnknownColumn`] for the first unrecognised name.
    pub fn parse(list: &str) -> Result<Self, ExportError> {
        let columns = list
            .split(',')
            .map(Column::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { columns })
    }

    /// The resolved columns.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the spec has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Width in bytes of one binary row.
    pub fn row_width(&self) -> usize {
        self.columns.iter().map(|c| c.width()).sum()
    }

    /// The CSV header line (no newline).
    pub fn header(&self) -> String {
        self.to_string()
    }

    /// Appends one binary row to `out`.
    ///
    /// Either the whole row is written or, on error, `out` is left exactly as
    /// it was.
    ///
    /// # Errors
    /// [`ExportError::Arity`] or any codec error.
    pub fn encode_row(&self, row: &[Value], out: &mut BytesMut) -> Result<(), ExportError> {
        self.check_arity(row)?;
        let start = out.len();
        for (column, value) in self.columns.iter().zip(row) {
            if let Err(err) = column.encode(value, out) {
                out.truncate(start);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Appends one CSV line (without line terminator) to `out`.
    ///
    /// # Errors
    /// [`ExportError::Arity`].
    pub fn render_row(&self, row: &[Value], out: &mut BytesMut) -> Result<(), ExportError> {
        self.check_arity(row)?;
        let line = row
            .iter()
            .map(|value| value.to_string())
            .collect::<Vec<_>>()
            .join(",");
        out.put_slice(line.as_bytes());
        Ok(())
    }

    fn check_arity(&self, row: &[Value]) -> Result<(), ExportError> {
        if row.len() != self.columns.len() {
            return Err(ExportError::Arity {
                expected: self.columns.len(),
                found: row.len(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for ColumnSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(column.name())?;
        }
        Ok(())
    }
}

impl FromStr for ColumnSpec {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ColumnSpec::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENT: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_parse_resolves_names_in_order() {
        let spec = ColumnSpec::parse("x,y,percentage").unwrap();
        assert_eq!(spec.columns(), &[Column::X, Column::Y, Column::Percentage]);
        assert_eq!(spec.header(), "x,y,percentage");
        assert_eq!(spec.row_width(), 10);
    }

    #[test]
    fn test_unknown_column_is_an_error() {
        let err = ColumnSpec::parse("x,coins").unwrap_err();
        assert!(matches!(err, ExportError::UnknownColumn(name) if name == "coins"));
    }

    #[test]
    fn test_full_analysis_row_width() {
        let spec = ColumnSpec::parse("userident,levelversion,practice,x,y,percentage").unwrap();
        assert_eq!(spec.row_width(), 20 + 1 + 1 + 4 + 4 + 2);
    }

    #[test]
    fn test_identifier_decodes_hex() {
        let mut out = BytesMut::new();
        Column::UserIdent.encode(&Value::from(IDENT), &mut out).unwrap();
        assert_eq!(out.len(), IDENT_BYTES);
        assert_eq!(&out[..3], &[0x01, 0x23, 0x45]);
    }

    #[test]
    fn test_malformed_identifier_writes_nothing() {
        let mut out = BytesMut::new();
        let err = Column::UserIdent.encode(&Value::from("abc"), &mut out).unwrap_err();
        assert!(matches!(err, ExportError::InvalidIdentifier(_)));
        assert!(out.is_empty());
    }

    #[test]
    fn test_small_integers_keep_low_bits() {
        let mut out = BytesMut::new();
        Column::LevelVersion.encode(&Value::UInt(258), &mut out).unwrap();
        Column::Practice.encode(&Value::Bool(true), &mut out).unwrap();
        Column::Percentage.encode(&Value::Int(37), &mut out).unwrap();
        assert_eq!(&out[..], &[2, 1, 37, 0]);
    }

    #[test]
    fn test_floats_are_little_endian_f32() {
        let mut out = BytesMut::new();
        Column::X.encode(&Value::Float(100.0), &mut out).unwrap();
        assert_eq!(&out[..], &100.0f32.to_le_bytes());
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let mut out = BytesMut::new();
        let err = Column::X.encode(&Value::from(IDENT), &mut out).unwrap_err();
        assert!(matches!(err, ExportError::TypeMismatch { column: Column::X, .. }));
    }

    #[test]
    fn test_encode_row_rolls_back_partial_rows() {
        let spec = ColumnSpec::parse("x,userident").unwrap();
        let mut out = BytesMut::from(&[1u8][..]);
        let row = vec![Value::Float(1.0), Value::from("zz")];
        assert!(spec.encode_row(&row, &mut out).is_err());
        assert_eq!(&out[..], &[1u8]);
    }

    #[test]
    fn test_arity_mismatch_is_reported() {
        let spec = ColumnSpec::parse("x,y").unwrap();
        let mut out = BytesMut::new();
        let err = spec.render_row(&[Value::Float(1.0)], &mut out).unwrap_err();
        assert!(matches!(err, ExportError::Arity { expected: 2, found: 1 }));
    }

    #[test]
    fn test_text_rendering_matches_plain_numbers() {
        let spec = ColumnSpec::parse("x,y,percentage,practice").unwrap();
        let mut out = BytesMut::new();
        let row = vec![100.0f32.into(), 2.5f32.into(), 37u64.into(), false.into()];
        spec.render_row(&row, &mut out).unwrap();
        assert_eq!(&out[..], b"100,2.5,37,0");
    }
}
