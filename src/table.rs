//! A tagged-column table, used both for procedure results and for the
//! statistics snapshots produced by the [`Distributor`](crate::Distributor).

use std::fmt;

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

/// The type of a table column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ColumnType {
    /// An 8-bit signed integer.
    TinyInt,
    /// A 32-bit signed integer.
    Integer,
    /// A 64-bit signed integer.
    BigInt,
    /// A 64-bit float.
    Float,
    /// A UTF-8 string.
    String,
    /// An opaque byte array.
    VarBinary,
    /// Microseconds since the epoch.
    Timestamp,
}

impl ColumnType {
    fn code(self) -> u8 {
        match self {
            ColumnType::TinyInt => 1,
            ColumnType::Integer => 2,
            ColumnType::BigInt => 3,
            ColumnType::Float => 4,
            ColumnType::String => 5,
            ColumnType::VarBinary => 6,
            ColumnType::Timestamp => 7,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            1 => ColumnType::TinyInt,
            2 => ColumnType::Integer,
            3 => ColumnType::BigInt,
            4 => ColumnType::Float,
            5 => ColumnType::String,
            6 => ColumnType::VarBinary,
            7 => ColumnType::Timestamp,
            other => {
                return Err(Error::invalid_response(format!(
                    "invalid column type code: {}",
                    other
                )))
            }
        })
    }
}

/// A single table column: a name and a type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    name: String,
    column_type: ColumnType,
}

impl Column {
    /// Creates a new column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }

    /// The column's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The column's type.
    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }
}

/// A single table cell or invocation parameter.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Value {
    /// A null cell.
    Null,
    /// An 8-bit signed integer.
    TinyInt(i8),
    /// A 32-bit signed integer.
    Integer(i32),
    /// A 64-bit signed integer.
    BigInt(i64),
    /// A 64-bit float.
    Float(f64),
    /// A UTF-8 string.
    Str(String),
    /// An opaque byte array.
    VarBinary(Vec<u8>),
    /// Microseconds since the epoch.
    Timestamp(i64),
}

impl Value {
    fn matches(&self, column_type: ColumnType) -> bool {
        matches!(
            (self, column_type),
            (Value::Null, _)
                | (Value::TinyInt(_), ColumnType::TinyInt)
                | (Value::Integer(_), ColumnType::Integer)
                | (Value::BigInt(_), ColumnType::BigInt)
                | (Value::Float(_), ColumnType::Float)
                | (Value::Str(_), ColumnType::String)
                | (Value::VarBinary(_), ColumnType::VarBinary)
                | (Value::Timestamp(_), ColumnType::Timestamp)
        )
    }

    /// Returns the contained 64-bit integer, if this value holds one.
    pub fn as_bigint(&self) -> Option<i64> {
        match self {
            Value::BigInt(v) | Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the contained string, if this value holds one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn write_to(&self, buf: &mut impl BufMut) {
        match self {
            Value::Null => buf.put_u8(0),
            Value::TinyInt(v) => {
                buf.put_u8(ColumnType::TinyInt.code());
                buf.put_i8(*v);
            }
            Value::Integer(v) => {
                buf.put_u8(ColumnType::Integer.code());
                buf.put_i32(*v);
            }
            Value::BigInt(v) => {
                buf.put_u8(ColumnType::BigInt.code());
                buf.put_i64(*v);
            }
            Value::Float(v) => {
                buf.put_u8(ColumnType::Float.code());
                buf.put_f64(*v);
            }
            Value::Str(s) => {
                buf.put_u8(ColumnType::String.code());
                put_bytes(buf, s.as_bytes());
            }
            Value::VarBinary(b) => {
                buf.put_u8(ColumnType::VarBinary.code());
                put_bytes(buf, b);
            }
            Value::Timestamp(v) => {
                buf.put_u8(ColumnType::Timestamp.code());
                buf.put_i64(*v);
            }
        }
    }

    pub(crate) fn read_from(buf: &mut impl Buf) -> Result<Self> {
        let tag = read_u8(buf)?;
        if tag == 0 {
            return Ok(Value::Null);
        }
        Ok(match ColumnType::from_code(tag)? {
            ColumnType::TinyInt => Value::TinyInt(read_exact(buf, 1)?.get_i8()),
            ColumnType::Integer => Value::Integer(read_exact(buf, 4)?.get_i32()),
            ColumnType::BigInt => Value::BigInt(read_exact(buf, 8)?.get_i64()),
            ColumnType::Float => Value::Float(read_exact(buf, 8)?.get_f64()),
            ColumnType::String => Value::Str(read_string(buf)?),
            ColumnType::VarBinary => Value::VarBinary(read_bytes(buf)?),
            ColumnType::Timestamp => Value::Timestamp(read_exact(buf, 8)?.get_i64()),
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::TinyInt(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::BigInt(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{}", s),
            Value::VarBinary(b) => write!(f, "<{} bytes>", b.len()),
            Value::Timestamp(v) => write!(f, "{}", v),
        }
    }
}

/// An ordered collection of typed columns and rows.
///
/// Rows are type-checked against the schema on append; any cell may be
/// [`Value::Null`].
#[derive(Clone, Debug, PartialEq)]
pub struct Table {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    /// Creates an empty table with the given schema.
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// The table's schema, in column order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Number of rows in the table.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Returns the rows in insertion order.
    pub fn rows(&self) -> impl Iterator<Item = &[Value]> {
        self.rows.iter().map(|r| r.as_slice())
    }

    /// Returns the cell at `(row, column)`, if present.
    pub fn get(&self, row: usize, column: usize) -> Option<&Value> {
        self.rows.get(row).and_then(|r| r.get(column))
    }

    /// Returns the cell in the named column of the given row.
    pub fn get_by_name(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c.name == column)?;
        self.get(row, idx)
    }

    /// Appends a row the caller already built in schema order. Used by the
    /// statistics assembly, whose schemas are fixed.
    pub(crate) fn push_row_unchecked(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    /// Appends a row, validating its arity and cell types against the schema.
    pub fn add_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::invalid_argument(format!(
                "row has {} values but the table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        for (value, column) in row.iter().zip(&self.columns) {
            if !value.matches(column.column_type) {
                return Err(Error::invalid_argument(format!(
                    "value {:?} does not match column \"{}\" of type {:?}",
                    value, column.name, column.column_type
                )));
            }
        }
        self.rows.push(row);
        Ok(())
    }

    pub(crate) fn write_to(&self, buf: &mut impl BufMut) -> Result<()> {
        let column_count = u16::try_from(self.columns.len())
            .map_err(|_| Error::invalid_argument("too many columns"))?;
        buf.put_u16(column_count);
        for column in &self.columns {
            buf.put_u8(column.column_type.code());
            put_bytes(buf, column.name.as_bytes());
        }
        let row_count = u32::try_from(self.rows.len())
            .map_err(|_| Error::invalid_argument("too many rows"))?;
        buf.put_u32(row_count);
        for row in &self.rows {
            for value in row {
                value.write_to(buf);
            }
        }
        Ok(())
    }

    pub(crate) fn read_from(buf: &mut impl Buf) -> Result<Self> {
        let column_count = read_exact(buf, 2)?.get_u16() as usize;
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let column_type = ColumnType::from_code(read_u8(buf)?)?;
            let name = read_string(buf)?;
            columns.push(Column { name, column_type });
        }
        let row_count = read_exact(buf, 4)?.get_u32() as usize;
        let mut table = Table::new(columns);
        for _ in 0..row_count {
            let mut row = Vec::with_capacity(column_count);
            for _ in 0..column_count {
                row.push(Value::read_from(buf)?);
            }
            table.add_row(row).map_err(|e| {
                Error::invalid_response(format!("row does not match table schema: {}", e))
            })?;
        }
        Ok(table)
    }
}

pub(crate) fn put_bytes(buf: &mut impl BufMut, bytes: &[u8]) {
    debug_assert!(bytes.len() <= u32::MAX as usize);
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

pub(crate) fn read_u8(buf: &mut impl Buf) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(Error::invalid_response("unexpected end of frame"));
    }
    Ok(buf.get_u8())
}

/// Checks that `len` bytes are available before handing the buffer back.
pub(crate) fn read_exact<B: Buf>(buf: &mut B, len: usize) -> Result<&mut B> {
    if buf.remaining() < len {
        return Err(Error::invalid_response("unexpected end of frame"));
    }
    Ok(buf)
}

pub(crate) fn read_bytes(buf: &mut impl Buf) -> Result<Vec<u8>> {
    let len = read_exact(buf, 4)?.get_u32() as usize;
    if buf.remaining() < len {
        return Err(Error::invalid_response("unexpected end of frame"));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}

pub(crate) fn read_string(buf: &mut impl Buf) -> Result<String> {
    let bytes = read_bytes(buf)?;
    String::from_utf8(bytes)
        .map_err(|e| Error::invalid_response(format!("invalid utf-8 in frame: {}", e)))
}
