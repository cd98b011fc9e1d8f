//! Lightweight value/row/batch types shared by the planner and the runtime.
//!
//! `RowBatch` is the columnar form produced by scans; `Row` is the row form
//! consumed by most operators. Conversions between the two are explicit plan
//! nodes, never implicit.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::schema::DataType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
}

/// One row in row-oriented form; positions follow the producing schema.
pub type Row = Vec<Scalar>;

impl Scalar {
    /// `None` for `Null`, which is typeless until coerced.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Scalar::Null => None,
            Scalar::Bool(_) => Some(DataType::Boolean),
            Scalar::I32(_) => Some(DataType::Int32),
            Scalar::I64(_) => Some(DataType::Int64),
            Scalar::F64(_) => Some(DataType::Float64),
            Scalar::Str(_) => Some(DataType::Utf8),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::I32(v) => Some(*v as i64),
            Scalar::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::I32(v) => Some(*v as f64),
            Scalar::I64(v) => Some(*v as f64),
            Scalar::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// Parse a textual cell into the requested type. Empty text is `Null`.
    pub fn parse_as(text: &str, data_type: DataType) -> Result<Scalar, String> {
        if text.is_empty() {
            return Ok(Scalar::Null);
        }
        let bad = |_| format!("cannot parse '{}' as {}", text, data_type.simple_name());
        Ok(match data_type {
            DataType::Boolean => Scalar::Bool(text.parse::<bool>().map_err(|_| {
                format!("cannot parse '{}' as {}", text, data_type.simple_name())
            })?),
            DataType::Int32 => Scalar::I32(text.parse::<i32>().map_err(bad)?),
            DataType::Int64 => Scalar::I64(text.parse::<i64>().map_err(bad)?),
            DataType::Float64 => Scalar::F64(text.parse::<f64>().map_err(|_| {
                format!("cannot parse '{}' as {}", text, data_type.simple_name())
            })?),
            DataType::Utf8 => Scalar::Str(text.to_string()),
        })
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => write!(f, "null"),
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::I32(v) => write!(f, "{v}"),
            Scalar::I64(v) => write!(f, "{v}"),
            Scalar::F64(v) => write!(f, "{v}"),
            Scalar::Str(s) => write!(f, "{s}"),
        }
    }
}

/// Total order used for sorting and grouping: nulls first, numerics compared
/// by value across widths, NaN last, mixed types by type rank.
pub fn scalar_cmp(a: &Scalar, b: &Scalar) -> Ordering {
    use Scalar::*;
    match (a, b) {
        (Null, Null) => Ordering::Equal,
        (Null, _) => Ordering::Less,
        (_, Null) => Ordering::Greater,
        (Bool(x), Bool(y)) => x.cmp(y),
        (Str(x), Str(y)) => x.cmp(y),
        (I32(_) | I64(_), I32(_) | I64(_)) => a.as_i64().cmp(&b.as_i64()),
        (I32(_) | I64(_) | F64(_), I32(_) | I64(_) | F64(_)) => {
            let (x, y) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            match (x.is_nan(), y.is_nan()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                _ => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            }
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Compare two scalar tuples lexicographically.
pub fn scalar_tuple_cmp(a: &[Scalar], b: &[Scalar]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match scalar_cmp(x, y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

fn type_rank(s: &Scalar) -> u8 {
    match s {
        Scalar::Null => 0,
        Scalar::Bool(_) => 1,
        Scalar::I32(_) | Scalar::I64(_) | Scalar::F64(_) => 2,
        Scalar::Str(_) => 3,
    }
}

/// Stable hash of a key tuple. Integers hash by value regardless of width so
/// an `int` key and a `bigint` key land in the same partition.
pub fn hash_scalars(values: &[Scalar]) -> u64 {
    let mut hasher = blake3::Hasher::new();
    for v in values {
        hasher.update(&[type_rank(v)]);
        match v {
            Scalar::Null => {}
            Scalar::Bool(b) => {
                hasher.update(&[*b as u8]);
            }
            Scalar::I32(_) | Scalar::I64(_) => {
                hasher.update(&v.as_i64().unwrap_or_default().to_le_bytes());
            }
            Scalar::F64(f) => {
                hasher.update(&f.to_bits().to_le_bytes());
            }
            Scalar::Str(s) => {
                hasher.update(s.as_bytes());
            }
        }
    }
    let out = hasher.finalize();
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&out.as_bytes()[0..8]);
    u64::from_le_bytes(buf)
}

/// Minimal column representation for the columnar path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: Vec<Scalar>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<Scalar>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Columnar batch: every column has the same length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowBatch {
    pub columns: Vec<Column>,
}

impl RowBatch {
    pub fn num_rows(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }

    /// Build a batch from rows laid out according to `names`.
    pub fn from_rows(names: &[String], rows: &[Row]) -> Result<RowBatch, String> {
        let mut columns: Vec<Column> = names
            .iter()
            .map(|n| Column::new(n.clone(), Vec::with_capacity(rows.len())))
            .collect();
        for (ri, row) in rows.iter().enumerate() {
            if row.len() != names.len() {
                return Err(format!(
                    "row {} has {} values, expected {}",
                    ri,
                    row.len(),
                    names.len()
                ));
            }
            for (col, v) in columns.iter_mut().zip(row.iter()) {
                col.values.push(v.clone());
            }
        }
        Ok(RowBatch { columns })
    }

    /// Transpose back into row form.
    pub fn to_rows(&self) -> Vec<Row> {
        (0..self.num_rows())
            .map(|r| self.columns.iter().map(|c| c.values[r].clone()).collect())
            .collect()
    }

    /// Sort rows by the specified columns (in order).
    pub fn sort_by_columns(&mut self, sort_keys: &[String]) -> Result<(), String> {
        let key_indices = self.key_indices(sort_keys)?;
        let mut rows = self.to_rows();
        sort_rows(&mut rows, &key_indices);
        let names: Vec<String> = self.columns.iter().map(|c| c.name.clone()).collect();
        *self = RowBatch::from_rows(&names, &rows)?;
        Ok(())
    }

    fn key_indices(&self, keys: &[String]) -> Result<Vec<usize>, String> {
        keys.iter()
            .map(|key| {
                self.columns
                    .iter()
                    .position(|c| &c.name == key)
                    .ok_or_else(|| format!("key column '{}' not found", key))
            })
            .collect()
    }
}

/// Stable sort of rows by the key positions.
pub fn sort_rows(rows: &mut [Row], key_indices: &[usize]) {
    rows.sort_by(|a, b| {
        for &k in key_indices {
            match scalar_cmp(&a[k], &b[k]) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    });
}

/// Partition index for each row, by hashing the key positions.
pub fn hash_partition_rows(rows: Vec<Row>, key_indices: &[usize], n: usize) -> Vec<Vec<Row>> {
    let n = n.max(1);
    let mut out: Vec<Vec<Row>> = (0..n).map(|_| Vec::new()).collect();
    for row in rows {
        let key: Vec<Scalar> = key_indices.iter().map(|&k| row[k].clone()).collect();
        let p = (hash_scalars(&key) % n as u64) as usize;
        out[p].push(row);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_roundtrip_through_batch() {
        let names = vec!["a".to_string(), "b".to_string()];
        let rows = vec![
            vec![Scalar::I32(1), Scalar::Str("x".into())],
            vec![Scalar::I32(2), Scalar::Null],
        ];
        let batch = RowBatch::from_rows(&names, &rows).expect("batch");
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.to_rows(), rows);
    }

    #[test]
    fn ragged_rows_rejected() {
        let names = vec!["a".to_string()];
        let rows = vec![vec![Scalar::I32(1), Scalar::I32(2)]];
        assert!(RowBatch::from_rows(&names, &rows).is_err());
    }

    #[test]
    fn numeric_compare_across_widths() {
        assert_eq!(scalar_cmp(&Scalar::I32(3), &Scalar::I64(3)), Ordering::Equal);
        assert_eq!(scalar_cmp(&Scalar::I32(2), &Scalar::F64(2.5)), Ordering::Less);
        assert_eq!(scalar_cmp(&Scalar::Null, &Scalar::I32(0)), Ordering::Less);
    }

    #[test]
    fn int_widths_hash_alike() {
        assert_eq!(
            hash_scalars(&[Scalar::I32(7)]),
            hash_scalars(&[Scalar::I64(7)])
        );
    }

    #[test]
    fn hash_partitioning_keeps_equal_keys_together() {
        let rows: Vec<Row> = (0..20).map(|i| vec![Scalar::I64(i % 3)]).collect();
        let parts = hash_partition_rows(rows, &[0], 4);
        for part in &parts {
            for row in part {
                let same = parts
                    .iter()
                    .filter(|p| p.iter().any(|r| r[0] == row[0]))
                    .count();
                assert_eq!(same, 1);
            }
        }
        assert_eq!(parts.iter().map(|p| p.len()).sum::<usize>(), 20);
    }

    #[test]
    fn parse_as_handles_empty_and_types() {
        assert_eq!(Scalar::parse_as("", DataType::Int32), Ok(Scalar::Null));
        assert_eq!(Scalar::parse_as("12", DataType::Int64), Ok(Scalar::I64(12)));
        assert!(Scalar::parse_as("x", DataType::Int32).is_err());
    }
}
