//! Default analyzer: binds relations against the catalog and column
//! references against child schemas, then type-checks.

use std::sync::Arc;
use std::time::Instant;

use qstage_core::catalog::Catalog;
use qstage_core::error::{Error, Result};
use qstage_core::expr::{BinaryOp, Expr};
use qstage_core::logical::LogicalPlan;
use qstage_core::schema::{DataType, Schema};
use qstage_core::tracker::PlanTracker;

use crate::traits::Analyzer;

pub struct CatalogAnalyzer {
    catalog: Arc<Catalog>,
}

impl CatalogAnalyzer {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    fn resolve_plan(&self, plan: LogicalPlan) -> Result<LogicalPlan> {
        let plan = plan.map_children(|c| self.resolve_plan(c))?;
        match plan {
            LogicalPlan::UnresolvedRelation { name } => {
                let table = self
                    .catalog
                    .table(&name)
                    .ok_or_else(|| Error::Analysis(format!("Table or view not found: {name}")))?;
                Ok(LogicalPlan::Relation {
                    table: table.name.clone(),
                    schema: table.schema.clone(),
                    partition_column: table.partition_column.clone(),
                    streaming: table.streaming,
                })
            }
            LogicalPlan::Filter { input, predicate } => {
                let schema = input.schema()?;
                let predicate = self.resolve_expr(predicate, &schema)?;
                match predicate.data_type() {
                    Some(DataType::Boolean) | None => {}
                    Some(other) => {
                        return Err(Error::Analysis(format!(
                            "filter expression '{predicate}' of type {} is not a boolean",
                            other.simple_name()
                        )))
                    }
                }
                Ok(LogicalPlan::Filter { input, predicate })
            }
            LogicalPlan::Project { input, exprs } => {
                let schema = input.schema()?;
                let exprs = exprs
                    .into_iter()
                    .map(|e| self.resolve_expr(e, &schema))
                    .collect::<Result<Vec<_>>>()?;
                if let Some(e) = exprs.iter().find(|e| e.data_type().is_none()) {
                    return Err(Error::Analysis(format!(
                        "cannot infer the type of '{e}' in projection"
                    )));
                }
                Ok(LogicalPlan::Project { input, exprs })
            }
            LogicalPlan::Join {
                left,
                right,
                on,
                join_type,
            } => {
                let (ls, rs) = (left.schema()?, right.schema()?);
                if on.is_empty() {
                    return Err(Error::Analysis(
                        "join condition is missing; only equi-joins are supported".into(),
                    ));
                }
                for (l, r) in &on {
                    let lf = field_type(&ls, l)?;
                    let rf = field_type(&rs, r)?;
                    if !comparable(lf, rf) {
                        return Err(Error::Analysis(format!(
                            "join keys '{l}' ({}) and '{r}' ({}) have incompatible types",
                            lf.simple_name(),
                            rf.simple_name()
                        )));
                    }
                }
                Ok(LogicalPlan::Join {
                    left,
                    right,
                    on,
                    join_type,
                })
            }
            LogicalPlan::Aggregate {
                input,
                group_by,
                aggs,
            } => {
                let schema = input.schema()?;
                for g in &group_by {
                    field_type(&schema, g)?;
                }
                for a in &aggs {
                    a.func.result_type(&schema).map_err(Error::Analysis)?;
                }
                Ok(LogicalPlan::Aggregate {
                    input,
                    group_by,
                    aggs,
                })
            }
            LogicalPlan::Sort { input, order_by } => {
                let schema = input.schema()?;
                for c in &order_by {
                    field_type(&schema, c)?;
                }
                Ok(LogicalPlan::Sort { input, order_by })
            }
            other => Ok(other),
        }
    }

    fn resolve_expr(&self, expr: Expr, schema: &Schema) -> Result<Expr> {
        expr.try_transform_up(&mut |e| match e {
            Expr::UnresolvedColumn(name) => {
                let f = schema.field_by_name(&name).ok_or_else(|| unresolved(&name, schema))?;
                Ok(Expr::Column {
                    name,
                    data_type: f.data_type,
                    nullable: f.nullable,
                })
            }
            Expr::Column { ref name, .. } => {
                schema.field_by_name(name).ok_or_else(|| unresolved(name, schema))?;
                Ok(e)
            }
            Expr::Binary { left, op, right } => {
                check_binary(&left, op, &right)?;
                Ok(Expr::Binary { left, op, right })
            }
            Expr::Not(inner) => match inner.data_type() {
                Some(DataType::Boolean) | None => Ok(Expr::Not(inner)),
                Some(other) => Err(Error::Analysis(format!(
                    "NOT requires a boolean, got {} in '{inner}'",
                    other.simple_name()
                ))),
            },
            Expr::ScalarSubquery(plan) => {
                let plan = self.resolve_subquery(*plan)?;
                let width = plan.schema()?.len();
                if width != 1 {
                    return Err(Error::Analysis(format!(
                        "Scalar subquery must return only one column, but got {width}"
                    )));
                }
                Ok(Expr::ScalarSubquery(Box::new(plan)))
            }
            Expr::DynamicPruning {
                key,
                build,
                build_key,
            } => {
                let build = self.resolve_subquery(*build)?;
                field_type(&build.schema()?, &build_key)?;
                Ok(Expr::DynamicPruning {
                    key,
                    build: Box::new(build),
                    build_key,
                })
            }
            other => Ok(other),
        })
    }

    fn resolve_subquery(&self, plan: LogicalPlan) -> Result<LogicalPlan> {
        let plan = self.resolve_plan(plan)?;
        ensure_resolved(&plan)?;
        Ok(plan)
    }
}

impl Analyzer for CatalogAnalyzer {
    fn analyze(&self, plan: &LogicalPlan, tracker: &PlanTracker) -> Result<LogicalPlan> {
        let start = Instant::now();
        let resolved = self.resolve_plan(plan.clone())?;
        ensure_resolved(&resolved)?;
        tracker.record_rule("ResolveReferences", start.elapsed(), &resolved != plan);
        tracing::debug!(nodes = resolved.node_count(), "plan analyzed");
        Ok(resolved)
    }
}

fn ensure_resolved(plan: &LogicalPlan) -> Result<()> {
    if plan.is_resolved() {
        // Schema derivation also validates aggregate and join shapes.
        plan.schema().map(|_| ())
    } else {
        Err(Error::Analysis(format!(
            "unresolved plan found:\n{}",
            plan.tree_string(usize::MAX)
        )))
    }
}

fn unresolved(name: &str, schema: &Schema) -> Error {
    Error::Analysis(format!(
        "cannot resolve '{name}' given input columns: [{}]",
        schema.names().join(", ")
    ))
}

fn field_type(schema: &Schema, name: &str) -> Result<DataType> {
    schema
        .field_by_name(name)
        .map(|f| f.data_type)
        .ok_or_else(|| unresolved(name, schema))
}

fn comparable(a: DataType, b: DataType) -> bool {
    a == b || DataType::widen(a, b).is_some()
}

fn check_binary(left: &Expr, op: BinaryOp, right: &Expr) -> Result<()> {
    // Untyped null literals combine with anything.
    let (Some(lt), Some(rt)) = (left.data_type(), right.data_type()) else {
        return Ok(());
    };
    let ok = if op.is_logical() {
        lt == DataType::Boolean && rt == DataType::Boolean
    } else if op.is_arithmetic() {
        lt.is_numeric() && rt.is_numeric()
    } else {
        comparable(lt, rt)
    };
    if ok {
        Ok(())
    } else {
        Err(Error::Analysis(format!(
            "cannot resolve '({left} {} {right})' due to data type mismatch: {} and {}",
            op.symbol(),
            lt.simple_name(),
            rt.simple_name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qstage_core::catalog::TableDef;
    use qstage_core::expr::{AggregateExpr, Aggregation};
    use qstage_core::schema::Field;
    use qstage_core::types::Scalar;

    fn analyzer() -> CatalogAnalyzer {
        let catalog = Arc::new(Catalog::new());
        let schema = Schema::new(vec![
            Field::new("a", DataType::Int32, false),
            Field::new("s", DataType::Utf8, true),
        ]);
        catalog.register(TableDef::from_rows("t", schema, vec![], None, 1).expect("table"));
        CatalogAnalyzer::new(catalog)
    }

    #[test]
    fn resolves_filter_and_project() {
        let plan = LogicalPlan::table("t")
            .filter(Expr::col("a").gt(Expr::lit(Scalar::I32(1))))
            .project(vec![Expr::col("a")]);
        let out = analyzer().analyze(&plan, &PlanTracker::new()).expect("analyzed");
        assert!(out.is_resolved());
        assert_eq!(out.schema().expect("schema").to_string(), "a: int");
    }

    #[test]
    fn missing_table_and_column() {
        let tracker = PlanTracker::new();
        let err = analyzer()
            .analyze(&LogicalPlan::table("nope"), &tracker)
            .expect_err("missing table");
        assert_eq!(err, Error::Analysis("Table or view not found: nope".into()));

        let err = analyzer()
            .analyze(&LogicalPlan::table("t").project(vec![Expr::col("x")]), &tracker)
            .expect_err("missing column");
        assert!(err.to_string().contains("cannot resolve 'x' given input columns: [a, s]"));
    }

    #[test]
    fn type_mismatch_rejected() {
        let plan = LogicalPlan::table("t").filter(Expr::col("s").gt(Expr::lit(Scalar::I32(1))));
        let err = analyzer()
            .analyze(&plan, &PlanTracker::new())
            .expect_err("mismatch");
        assert!(matches!(err, Error::Analysis(m) if m.contains("data type mismatch")));

        let plan = LogicalPlan::table("t").filter(Expr::col("a"));
        assert!(analyzer().analyze(&plan, &PlanTracker::new()).is_err());
    }

    #[test]
    fn aggregate_requires_numeric_sum() {
        let plan = LogicalPlan::table("t").aggregate(
            vec!["a".into()],
            vec![AggregateExpr::new(Aggregation::Sum("s".into()), "total")],
        );
        assert!(analyzer().analyze(&plan, &PlanTracker::new()).is_err());
    }

    #[test]
    fn scalar_subquery_must_be_single_column() {
        let sub = LogicalPlan::table("t");
        let plan = LogicalPlan::table("t")
            .filter(Expr::col("a").gt(Expr::ScalarSubquery(Box::new(sub))));
        let err = analyzer()
            .analyze(&plan, &PlanTracker::new())
            .expect_err("two columns");
        assert!(err.to_string().contains("only one column"));

        let sub = LogicalPlan::table("t").aggregate(
            vec![],
            vec![AggregateExpr::new(Aggregation::Max("a".into()), "m")],
        );
        let plan = LogicalPlan::table("t")
            .filter(Expr::col("a").eq(Expr::ScalarSubquery(Box::new(sub))));
        assert!(analyzer().analyze(&plan, &PlanTracker::new()).is_ok());
    }

    #[test]
    fn analysis_records_rule() {
        let tracker = PlanTracker::new();
        analyzer()
            .analyze(&LogicalPlan::table("t"), &tracker)
            .expect("analyzed");
        assert_eq!(tracker.rules()["ResolveReferences"].invocations, 1);
    }
}
