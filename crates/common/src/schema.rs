use arrow::datatypes::{DataType, Field, Schema as ArrowSchema, SchemaRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Column types understood by every operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Type {
    Int,
    Long,
    Float,
    Double,
    String,
    Boolean,
    Date,
    Blob,
}

impl Type {
    pub fn to_arrow(self) -> DataType {
        match self {
            Type::Int => DataType::Int32,
            Type::Long => DataType::Int64,
            Type::Float => DataType::Float32,
            Type::Double => DataType::Float64,
            Type::String => DataType::Utf8,
            Type::Boolean => DataType::Boolean,
            Type::Date => DataType::Date64,
            Type::Blob => DataType::Binary,
        }
    }

    pub fn from_arrow(data_type: &DataType) -> Result<Self> {
        match data_type {
            DataType::Int32 => Ok(Type::Int),
            DataType::Int64 => Ok(Type::Long),
            DataType::Float32 => Ok(Type::Float),
            DataType::Float64 => Ok(Type::Double),
            DataType::Utf8 => Ok(Type::String),
            DataType::Boolean => Ok(Type::Boolean),
            DataType::Date64 => Ok(Type::Date),
            DataType::Binary => Ok(Type::Blob),
            other => Err(Error::NotSupported(format!("column type {other}"))),
        }
    }
}

/// Ordered list of `(name, type)` pairs. Immutable; clones share storage.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Schema {
    columns: Arc<Vec<(String, Type)>>,
}

impl Schema {
    pub fn new(columns: Vec<(String, Type)>) -> Self {
        Self {
            columns: Arc::new(columns),
        }
    }

    pub fn of(columns: &[(&str, Type)]) -> Self {
        Self::new(
            columns
                .iter()
                .map(|(name, ty)| (name.to_string(), *ty))
                .collect(),
        )
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[(String, Type)] {
        &self.columns
    }

    pub fn column_name(&self, idx: usize) -> Option<&str> {
        self.columns.get(idx).map(|(name, _)| name.as_str())
    }

    pub fn column_type(&self, idx: usize) -> Option<Type> {
        self.columns.get(idx).map(|(_, ty)| *ty)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|(n, _)| n == name)
    }

    /// Keeps only the listed columns, in the listed order.
    pub fn project(&self, indices: &[usize]) -> Result<Schema> {
        let mut columns = Vec::with_capacity(indices.len());
        for &idx in indices {
            let col = self.columns.get(idx).ok_or_else(|| {
                Error::plan(format!("column index {idx} out of range for {self}"))
            })?;
            columns.push(col.clone());
        }
        Ok(Schema::new(columns))
    }

    pub fn to_arrow(&self) -> SchemaRef {
        let fields: Vec<Field> = self
            .columns
            .iter()
            .map(|(name, ty)| Field::new(name, ty.to_arrow(), true))
            .collect();
        Arc::new(ArrowSchema::new(fields))
    }

    pub fn from_arrow(schema: &ArrowSchema) -> Result<Self> {
        let columns = schema
            .fields()
            .iter()
            .map(|f| Ok((f.name().clone(), Type::from_arrow(f.data_type())?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Schema::new(columns))
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, (name, ty)) in self.columns.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}:{ty:?}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_equality() {
        let a = Schema::of(&[("x", Type::Int), ("y", Type::String)]);
        let b = Schema::new(vec![("x".into(), Type::Int), ("y".into(), Type::String)]);
        let c = Schema::of(&[("y", Type::String), ("x", Type::Int)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn arrow_round_trip() {
        let schema = Schema::of(&[
            ("i", Type::Int),
            ("l", Type::Long),
            ("f", Type::Float),
            ("d", Type::Double),
            ("s", Type::String),
            ("b", Type::Boolean),
            ("t", Type::Date),
            ("o", Type::Blob),
        ]);
        let back = Schema::from_arrow(&schema.to_arrow()).unwrap();
        assert_eq!(schema, back);
    }

    #[test]
    fn project_reorders_and_checks_bounds() {
        let schema = Schema::of(&[("a", Type::Int), ("b", Type::Long)]);
        assert_eq!(schema.project(&[1, 0]).unwrap(), Schema::of(&[("b", Type::Long), ("a", Type::Int)]));
        assert!(schema.project(&[2]).unwrap_err().is_client_error());
    }
}
