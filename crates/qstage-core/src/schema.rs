//! Logical schema types. Pure data; no Arrow dependency here.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    Float64,
    Utf8,
}

impl DataType {
    /// SQL-ish short name used in rendered schemas (`a: int`).
    pub fn simple_name(&self) -> &'static str {
        match self {
            DataType::Boolean => "boolean",
            DataType::Int32 => "int",
            DataType::Int64 => "bigint",
            DataType::Float64 => "double",
            DataType::Utf8 => "string",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Int32 | DataType::Int64 | DataType::Float64)
    }

    /// Average encoded width, used by the stats estimator.
    pub fn byte_width(&self) -> u64 {
        match self {
            DataType::Boolean => 1,
            DataType::Int32 => 4,
            DataType::Int64 | DataType::Float64 => 8,
            DataType::Utf8 => 32,
        }
    }

    /// Common type for a binary numeric operation, if one exists.
    pub fn widen(a: DataType, b: DataType) -> Option<DataType> {
        use DataType::*;
        match (a, b) {
            (x, y) if x == y => Some(x),
            (Int32, Int64) | (Int64, Int32) => Some(Int64),
            (Float64, Int32 | Int64) | (Int32 | Int64, Float64) => Some(Float64),
            _ => None,
        }
    }

    /// Parse the type names accepted by the DSL and CSV loader.
    pub fn parse(s: &str) -> Option<DataType> {
        match s {
            "Boolean" | "bool" | "boolean" => Some(DataType::Boolean),
            "Int32" | "i32" | "int" => Some(DataType::Int32),
            "Int64" | "i64" | "bigint" => Some(DataType::Int64),
            "Float64" | "f64" | "double" => Some(DataType::Float64),
            "Utf8" | "string" | "str" => Some(DataType::Utf8),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.data_type.simple_name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self { fields: vec![] }
    }

    pub fn field(&self, idx: usize) -> Option<&Field> {
        self.fields.get(idx)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Join output: left fields followed by right fields. Right-side names
    /// that collide with the left get a `_right` suffix, matching
    /// `RowBatch::concat`.
    pub fn merge(left: &Schema, right: &Schema, right_nullable: bool) -> Schema {
        let mut fields = left.fields.clone();
        for f in &right.fields {
            let mut nf = f.clone();
            if left.index_of(&f.name).is_some() {
                nf.name = format!("{}_right", f.name);
            }
            nf.nullable |= right_nullable;
            fields.push(nf);
        }
        Schema { fields }
    }

    /// Estimated bytes per row.
    pub fn row_width(&self) -> u64 {
        self.fields
            .iter()
            .map(|f| f.data_type.byte_width())
            .sum::<u64>()
            .max(1)
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{field}")?;
        }
        Ok(())
    }
}
