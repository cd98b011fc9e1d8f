use qstage_core::types::Row;

use crate::error::ExecResult;
use crate::eval::BoundExpr;

/// One step of a filter/project chain.
#[derive(Debug, Clone)]
pub enum RowStep {
    Filter(BoundExpr),
    Project(Vec<BoundExpr>),
}

pub fn filter(rows: Vec<Row>, predicate: &BoundExpr) -> ExecResult<Vec<Row>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        if predicate.passes(&row)? {
            out.push(row);
        }
    }
    Ok(out)
}

pub fn project(rows: Vec<Row>, exprs: &[BoundExpr]) -> ExecResult<Vec<Row>> {
    rows.iter().map(|row| project_row(row, exprs)).collect()
}

fn project_row(row: &[qstage_core::types::Scalar], exprs: &[BoundExpr]) -> ExecResult<Row> {
    exprs.iter().map(|e| e.eval(row)).collect()
}

/// Run every step over each row in a single pass. `steps` are in execution
/// order (innermost operator first).
pub fn run_chain(rows: Vec<Row>, steps: &[RowStep]) -> ExecResult<Vec<Row>> {
    let mut out = Vec::with_capacity(rows.len());
    'rows: for row in rows {
        let mut cur = row;
        for step in steps {
            match step {
                RowStep::Filter(p) => {
                    if !p.passes(&cur)? {
                        continue 'rows;
                    }
                }
                RowStep::Project(exprs) => cur = project_row(&cur, exprs)?,
            }
        }
        out.push(cur);
    }
    Ok(out)
}
