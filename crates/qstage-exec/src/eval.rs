//! Expression evaluation.
//!
//! Physical expressions are first bound against an input schema: columns
//! become positions and planned subqueries become their (already computed)
//! values. Binding is where subqueries run; evaluating a bound expression is
//! pure and per row.

use std::cmp::Ordering;
use std::sync::Arc;

use qstage_core::expr::BinaryOp;
use qstage_core::id::SubqueryId;
use qstage_core::physical::PhysExpr;
use qstage_core::schema::Schema;
use qstage_core::types::{scalar_cmp, Row, Scalar};

use crate::error::{ExecError, ExecResult};

/// Rows produced by a subquery, shared by every reference to it.
pub type SubqueryRows = Arc<Vec<Row>>;

#[derive(Debug, Clone, PartialEq)]
pub enum BoundExpr {
    Column(usize),
    Literal(Scalar),
    Binary {
        left: Box<BoundExpr>,
        op: BinaryOp,
        right: Box<BoundExpr>,
    },
    Not(Box<BoundExpr>),
    /// Membership in a sorted set of values.
    InSet {
        value: Box<BoundExpr>,
        set: Arc<Vec<Scalar>>,
        has_null: bool,
    },
}

/// Bind `expr` against `schema`. `subquery` returns the rows of a planned
/// subquery by id.
pub fn bind(
    expr: &PhysExpr,
    schema: &Schema,
    subquery: &mut dyn FnMut(SubqueryId) -> ExecResult<SubqueryRows>,
) -> ExecResult<BoundExpr> {
    Ok(match expr {
        PhysExpr::Column { name } => BoundExpr::Column(
            schema
                .index_of(name)
                .ok_or_else(|| ExecError::MissingColumn(name.clone()))?,
        ),
        PhysExpr::Literal(v) => BoundExpr::Literal(v.clone()),
        PhysExpr::Binary { left, op, right } => BoundExpr::Binary {
            left: Box::new(bind(left, schema, subquery)?),
            op: *op,
            right: Box::new(bind(right, schema, subquery)?),
        },
        PhysExpr::Not(e) => BoundExpr::Not(Box::new(bind(e, schema, subquery)?)),
        PhysExpr::Alias { expr, .. } => bind(expr, schema, subquery)?,
        PhysExpr::Subquery(s) => BoundExpr::Literal(scalar_value(s.id, &subquery(s.id)?)?),
        PhysExpr::ReusedSubquery { id, .. } => BoundExpr::Literal(scalar_value(*id, &subquery(*id)?)?),
        PhysExpr::InSubquery { value, subquery: sq } => {
            let id = match sq.as_ref() {
                PhysExpr::Subquery(s) => s.id,
                PhysExpr::ReusedSubquery { id, .. } => *id,
                other => {
                    return Err(ExecError::Invalid(format!(
                        "IN expects a planned subquery, got {other}"
                    )))
                }
            };
            let rows = subquery(id)?;
            let mut set: Vec<Scalar> = rows
                .iter()
                .map(|r| r.first().cloned().unwrap_or(Scalar::Null))
                .collect();
            let has_null = set.iter().any(Scalar::is_null);
            set.retain(|v| !v.is_null());
            set.sort_by(scalar_cmp);
            set.dedup_by(|a, b| scalar_cmp(a, b) == Ordering::Equal);
            BoundExpr::InSet {
                value: Box::new(bind(value, schema, subquery)?),
                set: Arc::new(set),
                has_null,
            }
        }
        PhysExpr::ScalarSubqueryPlan(_) | PhysExpr::DynamicPruning { .. } => {
            return Err(ExecError::Invalid(format!(
                "unplanned expression reached execution: {expr}"
            )))
        }
    })
}

// Zero rows is null; more than one is an error.
fn scalar_value(id: SubqueryId, rows: &[Row]) -> ExecResult<Scalar> {
    match rows {
        [] => Ok(Scalar::Null),
        [row] => Ok(row.first().cloned().unwrap_or(Scalar::Null)),
        _ => Err(ExecError::SubqueryCardinality { id: id.to_string() }),
    }
}

impl BoundExpr {
    pub fn eval(&self, row: &[Scalar]) -> ExecResult<Scalar> {
        match self {
            BoundExpr::Column(i) => row
                .get(*i)
                .cloned()
                .ok_or_else(|| ExecError::Invalid(format!("row has no column {i}"))),
            BoundExpr::Literal(v) => Ok(v.clone()),
            BoundExpr::Binary { left, op, right } => {
                let l = left.eval(row)?;
                let r = right.eval(row)?;
                op.apply(&l, &r).map_err(ExecError::Eval)
            }
            BoundExpr::Not(e) => match e.eval(row)? {
                Scalar::Null => Ok(Scalar::Null),
                Scalar::Bool(b) => Ok(Scalar::Bool(!b)),
                other => Err(ExecError::Eval(format!("NOT applied to non-boolean {other}"))),
            },
            BoundExpr::InSet {
                value,
                set,
                has_null,
            } => {
                let v = value.eval(row)?;
                if v.is_null() {
                    return Ok(Scalar::Null);
                }
                if set.binary_search_by(|x| scalar_cmp(x, &v)).is_ok() {
                    Ok(Scalar::Bool(true))
                } else if *has_null {
                    Ok(Scalar::Null)
                } else {
                    Ok(Scalar::Bool(false))
                }
            }
        }
    }

    /// Predicate semantics: only `true` passes.
    pub fn passes(&self, row: &[Scalar]) -> ExecResult<bool> {
        Ok(matches!(self.eval(row)?, Scalar::Bool(true)))
    }
}
