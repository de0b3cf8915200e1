//! Row predicates used by `Filter`.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, Scalar, StringArray,
};
use arrow::compute::kernels::cmp;
use arrow::compute::{and, cast, not, or};
use serde::{Deserialize, Serialize};
use tessel_common::{Error, Result, Schema, TupleBatch, Type};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Literal {
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
    Boolean(bool),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Predicate {
    Compare {
        column: usize,
        op: CmpOp,
        value: Literal,
    },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
}

impl Literal {
    fn to_array(&self) -> ArrayRef {
        match self {
            Literal::Int(v) => Arc::new(Int32Array::from(vec![*v])),
            Literal::Long(v) => Arc::new(Int64Array::from(vec![*v])),
            Literal::Double(v) => Arc::new(Float64Array::from(vec![*v])),
            Literal::String(v) => Arc::new(StringArray::from(vec![v.as_str()])),
            Literal::Boolean(v) => Arc::new(BooleanArray::from(vec![*v])),
        }
    }

    fn compatible_with(&self, ty: Type) -> bool {
        match self {
            Literal::Int(_) | Literal::Long(_) | Literal::Double(_) => matches!(
                ty,
                Type::Int | Type::Long | Type::Float | Type::Double
            ),
            Literal::String(_) => ty == Type::String,
            Literal::Boolean(_) => ty == Type::Boolean,
        }
    }
}

impl Predicate {
    pub fn compare(column: usize, op: CmpOp, value: Literal) -> Self {
        Predicate::Compare { column, op, value }
    }

    /// Checks column references and literal types against `schema`.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        match self {
            Predicate::Compare { column, value, .. } => {
                let ty = schema.column_type(*column).ok_or_else(|| {
                    Error::plan(format!(
                        "predicate references column {column} of {schema}"
                    ))
                })?;
                if !value.compatible_with(ty) {
                    return Err(Error::plan(format!(
                        "cannot compare column {column} of type {ty:?} with {value:?}"
                    )));
                }
                Ok(())
            }
            Predicate::And(l, r) | Predicate::Or(l, r) => {
                l.validate(schema)?;
                r.validate(schema)
            }
            Predicate::Not(p) => p.validate(schema),
        }
    }

    pub fn evaluate(&self, batch: &TupleBatch) -> Result<BooleanArray> {
        match self {
            Predicate::Compare { column, op, value } => {
                if *column >= batch.num_columns() {
                    return Err(Error::execution(format!("no column {column} in batch")));
                }
                let lhs = batch.column(*column);
                let mut literal = value.to_array();
                if literal.data_type() != lhs.data_type() {
                    literal = cast(&literal, lhs.data_type())?;
                }
                let rhs = Scalar::new(literal);
                let mask = match op {
                    CmpOp::Eq => cmp::eq(lhs, &rhs)?,
                    CmpOp::NotEq => cmp::neq(lhs, &rhs)?,
                    CmpOp::Lt => cmp::lt(lhs, &rhs)?,
                    CmpOp::LtEq => cmp::lt_eq(lhs, &rhs)?,
                    CmpOp::Gt => cmp::gt(lhs, &rhs)?,
                    CmpOp::GtEq => cmp::gt_eq(lhs, &rhs)?,
                };
                Ok(mask)
            }
            Predicate::And(l, r) => Ok(and(&l.evaluate(batch)?, &r.evaluate(batch)?)?),
            Predicate::Or(l, r) => Ok(or(&l.evaluate(batch)?, &r.evaluate(batch)?)?),
            Predicate::Not(p) => Ok(not(&p.evaluate(batch)?)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> TupleBatch {
        let schema = Schema::of(&[("x", Type::Int), ("name", Type::String)]);
        TupleBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![1, 5, 10])),
                Arc::new(StringArray::from(vec!["a", "b", "c"])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn literal_is_cast_to_column_type() {
        let p = Predicate::compare(0, CmpOp::Gt, Literal::Long(4));
        let mask = p.evaluate(&batch()).unwrap();
        assert_eq!(mask, BooleanArray::from(vec![false, true, true]));
    }

    #[test]
    fn boolean_combinators() {
        let p = Predicate::And(
            Box::new(Predicate::compare(0, CmpOp::GtEq, Literal::Int(5))),
            Box::new(Predicate::Not(Box::new(Predicate::compare(
                1,
                CmpOp::Eq,
                Literal::String("c".into()),
            )))),
        );
        let mask = p.evaluate(&batch()).unwrap();
        assert_eq!(mask, BooleanArray::from(vec![false, true, false]));
    }

    #[test]
    fn validation_rejects_bad_columns_and_types() {
        let schema = batch().schema().clone();
        assert!(Predicate::compare(7, CmpOp::Eq, Literal::Int(1))
            .validate(&schema)
            .unwrap_err()
            .is_client_error());
        assert!(Predicate::compare(1, CmpOp::Eq, Literal::Int(1))
            .validate(&schema)
            .is_err());
    }
}
