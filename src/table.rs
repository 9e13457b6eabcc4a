//! In-memory tables returned by feature functions and stored in the cache.

use std::collections::{HashMap, HashSet};
use std::io::Write;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const LEFT_SUFFIX: &str = "_x";
const RIGHT_SUFFIX: &str = "_y";

/// A single scalar cell or parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(#[serde(with = "float_cell")] f64),
    Str(String),
    Date(NaiveDate),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Type-tagged text used for hashing join keys.
    fn key_repr(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(v) => format!("b:{v}"),
            Self::Int(v) => format!("i:{v}"),
            Self::Float(v) => format!("f:{}", v.to_bits()),
            Self::Str(v) => format!("s:{v}"),
            Self::Date(v) => format!("d:{v}"),
        }
    }

    fn display_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(v) => v.to_string(),
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Str(v) => v.clone(),
            Self::Date(v) => v.format("%Y-%m-%d").to_string(),
        }
    }
}

/// JSON has no literal for NaN or the infinities, so those are written as the
/// strings `"NaN"`, `"inf"` and `"-inf"`. Finite values stay plain numbers.
mod float_cell {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_infinite() {
            serializer.serialize_str(if *value > 0.0 { "inf" } else { "-inf" })
        } else {
            serializer.serialize_f64(*value)
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("invalid float cell '{other}'"))),
            },
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("missing column '{column}'")]
    MissingColumn { column: String },
    #[error("duplicate column '{column}'")]
    DuplicateColumn { column: String },
    #[error("row {row} has {found} cells, expected {expected}")]
    RowWidth {
        row: usize,
        found: usize,
        expected: usize,
    },
    #[error("CSV export failed: {0}")]
    Csv(String),
}

impl From<csv::Error> for TableError {
    fn from(err: csv::Error) -> Self {
        Self::Csv(err.to_string())
    }
}

/// Column-named rows of scalar cells.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawTable")]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

/// Decoded blob before the shape checks of [`Table::new`].
#[derive(Deserialize)]
struct RawTable {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl TryFrom<RawTable> for Table {
    type Error = TableError;

    fn try_from(raw: RawTable) -> Result<Self, Self::Error> {
        Self::new(raw.columns, raw.rows)
    }
}

/// Borrowed view of one table row, addressed by column name.
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    columns: &'a [String],
    cells: &'a [Value],
}

impl<'a> RowView<'a> {
    pub fn get(&self, column: &str) -> Option<&'a Value> {
        self.columns
            .iter()
            .position(|name| name == column)
            .map(|idx| &self.cells[idx])
    }

    pub fn cells(&self) -> &'a [Value] {
        self.cells
    }
}

impl Table {
    pub fn new<S: Into<String>>(
        columns: impl IntoIterator<Item = S>,
        rows: Vec<Vec<Value>>,
    ) -> Result<Self, TableError> {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(TableError::DuplicateColumn {
                    column: column.clone(),
                });
            }
        }
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(TableError::RowWidth {
                    row: idx,
                    found: row.len(),
                    expected: columns.len(),
                });
            }
        }
        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|name| name == column)
    }

    pub fn column_index(&self, column: &str) -> Result<usize, TableError> {
        self.columns
            .iter()
            .position(|name| name == column)
            .ok_or_else(|| TableError::MissingColumn {
                column: column.to_string(),
            })
    }

    pub fn row(&self, idx: usize) -> Option<RowView<'_>> {
        self.rows.get(idx).map(|cells| RowView {
            columns: &self.columns,
            cells,
        })
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = RowView<'_>> {
        self.rows.iter().map(|cells| RowView {
            columns: &self.columns,
            cells,
        })
    }

    /// Cell values of one column, top to bottom.
    pub fn column_values(&self, column: &str) -> Result<Vec<&Value>, TableError> {
        let idx = self.column_index(column)?;
        Ok(self.rows.iter().map(|row| &row[idx]).collect())
    }

    /// Keeps only `columns`, in the given order.
    pub fn project<S: AsRef<str>>(&self, columns: &[S]) -> Result<Self, TableError> {
        let indices = columns
            .iter()
            .map(|column| self.column_index(column.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let names = columns.iter().map(|c| c.as_ref().to_string());
        let rows = self
            .rows
            .iter()
            .map(|row| indices.iter().map(|idx| row[*idx].clone()).collect())
            .collect();
        Self::new(names, rows)
    }

    /// Renames every column for which `rename` returns `Some`.
    pub fn rename_columns(
        mut self,
        mut rename: impl FnMut(&str) -> Option<String>,
    ) -> Result<Self, TableError> {
        let renamed: Vec<String> = self
            .columns
            .iter()
            .map(|name| rename(name).unwrap_or_else(|| name.clone()))
            .collect();
        let rows = std::mem::take(&mut self.rows);
        Self::new(renamed, rows)
    }

    /// Removes `column` if present; absent columns are ignored.
    pub fn drop_column(mut self, column: &str) -> Self {
        if let Some(idx) = self.columns.iter().position(|name| name == column) {
            self.columns.remove(idx);
            for row in &mut self.rows {
                row.remove(idx);
            }
        }
        self
    }

    /// Sets `column` to `value` on every row, replacing an existing column of that name.
    pub fn with_constant_column(self, column: &str, value: Value) -> Self {
        let mut out = self.drop_column(column);
        out.columns.push(column.to_string());
        for row in &mut out.rows {
            row.push(value.clone());
        }
        out
    }

    pub fn filter_rows(&self, mut keep: impl FnMut(&RowView<'_>) -> bool) -> Self {
        let rows = self
            .iter_rows()
            .filter(|row| keep(row))
            .map(|row| row.cells.to_vec())
            .collect();
        Self {
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Inner join on `on`: only keys present on both sides survive. Left row
    /// order is kept and duplicate keys yield every matching pair. Non-key
    /// columns present on both sides get `_x` / `_y` suffixes.
    pub fn inner_join(&self, right: &Table, on: &str) -> Result<Self, TableError> {
        let left_key = self.column_index(on)?;
        let right_key = right.column_index(on)?;

        let mut right_by_key: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, row) in right.rows.iter().enumerate() {
            right_by_key
                .entry(row[right_key].key_repr())
                .or_default()
                .push(idx);
        }

        let left_names: HashSet<&str> = self.columns.iter().map(String::as_str).collect();
        let right_names: HashSet<&str> = right.columns.iter().map(String::as_str).collect();

        let mut columns: Vec<String> = self
            .columns
            .iter()
            .map(|name| {
                if name != on && right_names.contains(name.as_str()) {
                    format!("{name}{LEFT_SUFFIX}")
                } else {
                    name.clone()
                }
            })
            .collect();
        let right_keep: Vec<usize> = (0..right.columns.len())
            .filter(|idx| *idx != right_key)
            .collect();
        for idx in &right_keep {
            let name = &right.columns[*idx];
            if left_names.contains(name.as_str()) {
                columns.push(format!("{name}{RIGHT_SUFFIX}"));
            } else {
                columns.push(name.clone());
            }
        }

        let mut rows = Vec::new();
        for left_row in &self.rows {
            let Some(matches) = right_by_key.get(&left_row[left_key].key_repr()) else {
                continue;
            };
            for right_idx in matches {
                let right_row = &right.rows[*right_idx];
                let mut joined = left_row.clone();
                joined.extend(right_keep.iter().map(|idx| right_row[*idx].clone()));
                rows.push(joined);
            }
        }

        Self::new(columns, rows)
    }

    /// Stacks tables vertically. Columns are aligned by name in first-seen
    /// order; cells missing from a table are null.
    pub fn concat(tables: Vec<Table>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for table in &tables {
            for name in &table.columns {
                if !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
        }

        let mut rows = Vec::new();
        for table in tables {
            let mapping: Vec<Option<usize>> = columns
                .iter()
                .map(|name| table.columns.iter().position(|c| c == name))
                .collect();
            for row in table.rows {
                rows.push(
                    mapping
                        .iter()
                        .map(|idx| idx.map(|i| row[i].clone()).unwrap_or(Value::Null))
                        .collect(),
                );
            }
        }

        Self { columns, rows }
    }

    /// Moves `index` columns out of the table into a row index.
    pub fn set_index<S: AsRef<str>>(self, index: &[S]) -> Result<IndexedTable, TableError> {
        let index_idx = index
            .iter()
            .map(|column| self.column_index(column.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let value_idx: Vec<usize> = (0..self.columns.len())
            .filter(|idx| !index_idx.contains(idx))
            .collect();

        let index_names = index.iter().map(|c| c.as_ref().to_string()).collect();
        let value_names = value_idx.iter().map(|i| self.columns[*i].clone());
        let mut keys = Vec::with_capacity(self.rows.len());
        let mut values = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            keys.push(index_idx.iter().map(|i| row[*i].clone()).collect());
            values.push(value_idx.iter().map(|i| row[*i].clone()).collect());
        }

        Ok(IndexedTable {
            index_names,
            index: keys,
            table: Table::new(value_names, values)?,
        })
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), TableError> {
        let mut out = csv::Writer::from_writer(writer);
        out.write_record(&self.columns)?;
        for row in &self.rows {
            out.write_record(row.iter().map(Value::display_text))?;
        }
        out.flush().map_err(|err| TableError::Csv(err.to_string()))?;
        Ok(())
    }
}

/// A table whose rows are labelled by one or more index columns.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedTable {
    index_names: Vec<String>,
    index: Vec<Vec<Value>>,
    table: Table,
}

impl IndexedTable {
    pub fn index_names(&self) -> &[String] {
        &self.index_names
    }

    pub fn index(&self) -> &[Vec<Value>] {
        &self.index
    }

    /// Non-index columns.
    pub fn columns(&self) -> &[String] {
        self.table.columns()
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Position of the first row whose index equals `key`.
    pub fn locate(&self, key: &[Value]) -> Option<usize> {
        self.index.iter().position(|row| row.as_slice() == key)
    }

    pub fn get(&self, key: &[Value], column: &str) -> Option<&Value> {
        let row = self.locate(key)?;
        self.table.row(row)?.get(column)
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), TableError> {
        let mut out = csv::Writer::from_writer(writer);
        out.write_record(self.index_names.iter().chain(self.table.columns.iter()))?;
        for (key, row) in self.index.iter().zip(&self.table.rows) {
            out.write_record(key.iter().chain(row.iter()).map(Value::display_text))?;
        }
        out.flush().map_err(|err| TableError::Csv(err.to_string()))?;
        Ok(())
    }
}
