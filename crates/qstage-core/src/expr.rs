//! Logical expressions and aggregate descriptors.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::logical::LogicalPlan;
use crate::schema::{DataType, Schema};
use crate::types::{scalar_cmp, Scalar};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Plus,
    Minus,
    Multiply,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn is_arithmetic(&self) -> bool {
        matches!(self, BinaryOp::Plus | BinaryOp::Minus | BinaryOp::Multiply)
    }

    /// Evaluate on two values. Nulls propagate except through three-valued
    /// `AND`/`OR`.
    pub fn apply(&self, l: &Scalar, r: &Scalar) -> Result<Scalar, String> {
        match self {
            BinaryOp::And => Ok(match (l.as_bool(), r.as_bool()) {
                (Some(false), _) | (_, Some(false)) => Scalar::Bool(false),
                (Some(true), Some(true)) => Scalar::Bool(true),
                _ => Scalar::Null,
            }),
            BinaryOp::Or => Ok(match (l.as_bool(), r.as_bool()) {
                (Some(true), _) | (_, Some(true)) => Scalar::Bool(true),
                (Some(false), Some(false)) => Scalar::Bool(false),
                _ => Scalar::Null,
            }),
            _ if l.is_null() || r.is_null() => Ok(Scalar::Null),
            op if op.is_comparison() => {
                let comparable = matches!(
                    (l, r),
                    (Scalar::Bool(_), Scalar::Bool(_)) | (Scalar::Str(_), Scalar::Str(_))
                ) || (l.as_f64().is_some() && r.as_f64().is_some());
                if !comparable {
                    return Err(format!("cannot compare {l} and {r}"));
                }
                let ord = scalar_cmp(l, r);
                Ok(Scalar::Bool(match op {
                    BinaryOp::Eq => ord.is_eq(),
                    BinaryOp::NotEq => ord.is_ne(),
                    BinaryOp::Lt => ord.is_lt(),
                    BinaryOp::LtEq => ord.is_le(),
                    BinaryOp::Gt => ord.is_gt(),
                    _ => ord.is_ge(),
                }))
            }
            op => arithmetic(*op, l, r),
        }
    }
}

fn arithmetic(op: BinaryOp, l: &Scalar, r: &Scalar) -> Result<Scalar, String> {
    let overflow = || format!("integer overflow in ({l} {} {r})", op.symbol());
    match (l, r) {
        (Scalar::I32(a), Scalar::I32(b)) => {
            let v = match op {
                BinaryOp::Plus => a.checked_add(*b),
                BinaryOp::Minus => a.checked_sub(*b),
                _ => a.checked_mul(*b),
            };
            v.map(Scalar::I32).ok_or_else(overflow)
        }
        (Scalar::I32(_) | Scalar::I64(_), Scalar::I32(_) | Scalar::I64(_)) => {
            let (a, b) = (l.as_i64().unwrap_or_default(), r.as_i64().unwrap_or_default());
            let v = match op {
                BinaryOp::Plus => a.checked_add(b),
                BinaryOp::Minus => a.checked_sub(b),
                _ => a.checked_mul(b),
            };
            v.map(Scalar::I64).ok_or_else(overflow)
        }
        _ => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => Ok(Scalar::F64(match op {
                BinaryOp::Plus => a + b,
                BinaryOp::Minus => a - b,
                _ => a * b,
            })),
            _ => Err(format!(
                "arithmetic on non-numeric values ({l} {} {r})",
                op.symbol()
            )),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Column reference as written by the user; the analyzer resolves it.
    UnresolvedColumn(String),
    /// Column reference bound to a type by the analyzer.
    Column {
        name: String,
        data_type: DataType,
        nullable: bool,
    },
    Literal(Scalar),
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    Alias {
        expr: Box<Expr>,
        name: String,
    },
    /// Uncorrelated subquery producing one column and at most one row.
    ScalarSubquery(Box<LogicalPlan>),
    /// Runtime filter `key IN (SELECT build_key FROM build)`, inserted by
    /// partition pruning and planned by the preparation chain.
    DynamicPruning {
        key: Box<Expr>,
        build: Box<LogicalPlan>,
        build_key: String,
    },
}

impl Expr {
    pub fn col(name: impl Into<String>) -> Expr {
        Expr::UnresolvedColumn(name.into())
    }

    pub fn lit(v: Scalar) -> Expr {
        Expr::Literal(v)
    }

    pub fn binary(left: Expr, op: BinaryOp, right: Expr) -> Expr {
        Expr::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn alias(self, name: impl Into<String>) -> Expr {
        Expr::Alias {
            expr: Box::new(self),
            name: name.into(),
        }
    }

    pub fn gt(self, other: Expr) -> Expr {
        Expr::binary(self, BinaryOp::Gt, other)
    }

    pub fn eq(self, other: Expr) -> Expr {
        Expr::binary(self, BinaryOp::Eq, other)
    }

    pub fn and(self, other: Expr) -> Expr {
        Expr::binary(self, BinaryOp::And, other)
    }

    pub fn is_resolved(&self) -> bool {
        match self {
            Expr::UnresolvedColumn(_) => false,
            Expr::Column { .. } | Expr::Literal(_) => true,
            Expr::Binary { left, right, .. } => left.is_resolved() && right.is_resolved(),
            Expr::Not(e) | Expr::Alias { expr: e, .. } => e.is_resolved(),
            Expr::ScalarSubquery(plan) => plan.is_resolved(),
            Expr::DynamicPruning { key, build, .. } => key.is_resolved() && build.is_resolved(),
        }
    }

    /// Name of the output column this expression produces in a projection.
    pub fn output_name(&self) -> String {
        match self {
            Expr::UnresolvedColumn(n) | Expr::Column { name: n, .. } => n.clone(),
            Expr::Alias { name, .. } => name.clone(),
            other => other.to_string(),
        }
    }

    /// Result type of a resolved expression.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Expr::UnresolvedColumn(_) => None,
            Expr::Column { data_type, .. } => Some(*data_type),
            Expr::Literal(v) => v.data_type(),
            Expr::Binary { left, op, right } => {
                if op.is_comparison() || op.is_logical() {
                    Some(DataType::Boolean)
                } else {
                    DataType::widen(left.data_type()?, right.data_type()?)
                }
            }
            Expr::Not(_) | Expr::DynamicPruning { .. } => Some(DataType::Boolean),
            Expr::Alias { expr, .. } => expr.data_type(),
            Expr::ScalarSubquery(plan) => plan
                .schema()
                .ok()
                .and_then(|s| s.fields.first().map(|f| f.data_type)),
        }
    }

    pub fn nullable(&self) -> bool {
        match self {
            Expr::Column { nullable, .. } => *nullable,
            Expr::Literal(v) => v.is_null(),
            Expr::Binary { left, right, .. } => left.nullable() || right.nullable(),
            Expr::Not(e) | Expr::Alias { expr: e, .. } => e.nullable(),
            Expr::ScalarSubquery(_) => true,
            Expr::UnresolvedColumn(_) | Expr::DynamicPruning { .. } => false,
        }
    }

    /// Column names referenced by this expression (not inside subqueries).
    pub fn referenced_columns(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut Vec<String>) {
        match self {
            Expr::UnresolvedColumn(n) | Expr::Column { name: n, .. } => {
                if !out.contains(n) {
                    out.push(n.clone());
                }
            }
            Expr::Literal(_) | Expr::ScalarSubquery(_) => {}
            Expr::Binary { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Expr::Not(e) | Expr::Alias { expr: e, .. } => e.collect_columns(out),
            Expr::DynamicPruning { key, .. } => key.collect_columns(out),
        }
    }

    pub fn contains_subquery(&self) -> bool {
        match self {
            Expr::ScalarSubquery(_) | Expr::DynamicPruning { .. } => true,
            Expr::Binary { left, right, .. } => left.contains_subquery() || right.contains_subquery(),
            Expr::Not(e) | Expr::Alias { expr: e, .. } => e.contains_subquery(),
            _ => false,
        }
    }

    /// Subquery plans carried by this expression, in traversal order.
    pub fn subquery_plans(&self) -> Vec<&LogicalPlan> {
        match self {
            Expr::ScalarSubquery(plan) => vec![plan.as_ref()],
            Expr::DynamicPruning { build, .. } => vec![build.as_ref()],
            Expr::Binary { left, right, .. } => {
                let mut v = left.subquery_plans();
                v.extend(right.subquery_plans());
                v
            }
            Expr::Not(e) | Expr::Alias { expr: e, .. } => e.subquery_plans(),
            _ => vec![],
        }
    }

    /// Split a predicate into its top-level AND conjuncts.
    pub fn conjuncts(self) -> Vec<Expr> {
        match self {
            Expr::Binary {
                left,
                op: BinaryOp::And,
                right,
            } => {
                let mut v = left.conjuncts();
                v.extend(right.conjuncts());
                v
            }
            other => vec![other],
        }
    }

    /// Rebuild a predicate from conjuncts; `None` when the list is empty.
    pub fn and_all(exprs: Vec<Expr>) -> Option<Expr> {
        exprs.into_iter().reduce(|a, b| a.and(b))
    }

    /// Bottom-up rewrite; `f` sees each node after its children.
    pub fn transform_up(self, f: &mut impl FnMut(Expr) -> Expr) -> Expr {
        let rebuilt = match self {
            Expr::Binary { left, op, right } => Expr::Binary {
                left: Box::new(left.transform_up(f)),
                op,
                right: Box::new(right.transform_up(f)),
            },
            Expr::Not(e) => Expr::Not(Box::new(e.transform_up(f))),
            Expr::Alias { expr, name } => Expr::Alias {
                expr: Box::new(expr.transform_up(f)),
                name,
            },
            Expr::DynamicPruning {
                key,
                build,
                build_key,
            } => Expr::DynamicPruning {
                key: Box::new(key.transform_up(f)),
                build,
                build_key,
            },
            leaf => leaf,
        };
        f(rebuilt)
    }

    /// Fallible bottom-up rewrite used by the analyzer.
    pub fn try_transform_up<E>(
        self,
        f: &mut impl FnMut(Expr) -> Result<Expr, E>,
    ) -> Result<Expr, E> {
        let rebuilt = match self {
            Expr::Binary { left, op, right } => Expr::Binary {
                left: Box::new(left.try_transform_up(f)?),
                op,
                right: Box::new(right.try_transform_up(f)?),
            },
            Expr::Not(e) => Expr::Not(Box::new(e.try_transform_up(f)?)),
            Expr::Alias { expr, name } => Expr::Alias {
                expr: Box::new(expr.try_transform_up(f)?),
                name,
            },
            Expr::DynamicPruning {
                key,
                build,
                build_key,
            } => Expr::DynamicPruning {
                key: Box::new(key.try_transform_up(f)?),
                build,
                build_key,
            },
            leaf => leaf,
        };
        f(rebuilt)
    }

    /// Strip a top-level alias.
    pub fn unalias(&self) -> &Expr {
        match self {
            Expr::Alias { expr, .. } => expr.unalias(),
            other => other,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::UnresolvedColumn(n) => write!(f, "'{n}"),
            Expr::Column { name, .. } => write!(f, "{name}"),
            Expr::Literal(Scalar::Str(s)) => write!(f, "'{s}'"),
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Binary { left, op, right } => write!(f, "({left} {} {right})", op.symbol()),
            Expr::Not(e) => write!(f, "NOT {e}"),
            Expr::Alias { expr, name } => write!(f, "{expr} AS {name}"),
            Expr::ScalarSubquery(_) => write!(f, "scalar-subquery"),
            Expr::DynamicPruning { key, build_key, .. } => {
                write!(f, "dynamicpruning({key} IN {build_key})")
            }
        }
    }
}

/// Simplified aggregations (one input column each, `Count` counts rows).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Aggregation {
    Count,
    Sum(String),
    Avg(String),
    Min(String),
    Max(String),
}

impl Aggregation {
    pub fn input_column(&self) -> Option<&str> {
        match self {
            Aggregation::Count => None,
            Aggregation::Sum(c) | Aggregation::Avg(c) | Aggregation::Min(c) | Aggregation::Max(c) => {
                Some(c)
            }
        }
    }

    pub fn function_name(&self) -> &'static str {
        match self {
            Aggregation::Count => "count",
            Aggregation::Sum(_) => "sum",
            Aggregation::Avg(_) => "avg",
            Aggregation::Min(_) => "min",
            Aggregation::Max(_) => "max",
        }
    }

    /// Output type given the input schema; `Err` carries an analysis message.
    pub fn result_type(&self, input: &Schema) -> Result<DataType, String> {
        let Some(col) = self.input_column() else {
            return Ok(DataType::Int64);
        };
        let field = input.field_by_name(col).ok_or_else(|| {
            format!(
                "cannot resolve '{}' given input columns: [{}]",
                col,
                input.names().join(", ")
            )
        })?;
        match self {
            Aggregation::Count => Ok(DataType::Int64),
            Aggregation::Min(_) | Aggregation::Max(_) => Ok(field.data_type),
            Aggregation::Sum(_) | Aggregation::Avg(_) if !field.data_type.is_numeric() => Err(format!(
                "function {} requires numeric input, got {} for column '{}'",
                self.function_name(),
                field.data_type.simple_name(),
                col
            )),
            Aggregation::Sum(_) => Ok(if field.data_type == DataType::Float64 {
                DataType::Float64
            } else {
                DataType::Int64
            }),
            Aggregation::Avg(_) => Ok(DataType::Float64),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.input_column() {
            None => write!(f, "count(1)"),
            Some(c) => write!(f, "{}({})", self.function_name(), c),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateExpr {
    pub func: Aggregation,
    pub alias: String,
}

impl AggregateExpr {
    pub fn new(func: Aggregation, alias: impl Into<String>) -> Self {
        Self {
            func,
            alias: alias.into(),
        }
    }
}

impl fmt::Display for AggregateExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} AS {}", self.func, self.alias)
    }
}
