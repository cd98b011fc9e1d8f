//! Sort-based grouping aggregation over one partition.

use std::cmp::Ordering;

use qstage_core::expr::Aggregation;
use qstage_core::types::{scalar_cmp, Row, Scalar};

use crate::error::{ExecError, ExecResult};
use crate::operators::sort::sort_partition;

/// An aggregate with its input column position resolved.
#[derive(Debug, Clone)]
pub struct BoundAggregate {
    pub func: Aggregation,
    pub input: Option<usize>,
    /// `sum` over a double column sums as double.
    pub float_input: bool,
}

#[derive(Debug)]
enum Acc {
    Count(i64),
    SumInt(Option<i64>),
    SumFloat(Option<f64>),
    Avg { sum: f64, n: u64 },
    Min(Option<Scalar>),
    Max(Option<Scalar>),
}

impl Acc {
    fn new(func: &Aggregation, float_input: bool) -> Acc {
        match func {
            Aggregation::Count => Acc::Count(0),
            Aggregation::Sum(_) if float_input => Acc::SumFloat(None),
            Aggregation::Sum(_) => Acc::SumInt(None),
            Aggregation::Avg(_) => Acc::Avg { sum: 0.0, n: 0 },
            Aggregation::Min(_) => Acc::Min(None),
            Aggregation::Max(_) => Acc::Max(None),
        }
    }

    fn update(&mut self, v: Option<&Scalar>) -> ExecResult<()> {
        if let Acc::Count(c) = self {
            *c += 1;
            return Ok(());
        }
        let Some(v) = v.filter(|v| !v.is_null()) else {
            return Ok(());
        };
        match self {
            Acc::Count(_) => {}
            Acc::SumInt(s) => {
                let x = v
                    .as_i64()
                    .ok_or_else(|| ExecError::Eval(format!("sum over non-integer {v}")))?;
                *s = Some(
                    s.unwrap_or(0)
                        .checked_add(x)
                        .ok_or_else(|| ExecError::Eval("integer overflow in sum".into()))?,
                );
            }
            Acc::SumFloat(s) => {
                let x = v
                    .as_f64()
                    .ok_or_else(|| ExecError::Eval(format!("sum over non-numeric {v}")))?;
                *s = Some(s.unwrap_or(0.0) + x);
            }
            Acc::Avg { sum, n } => {
                *sum += v
                    .as_f64()
                    .ok_or_else(|| ExecError::Eval(format!("avg over non-numeric {v}")))?;
                *n += 1;
            }
            Acc::Min(m) => {
                if m.as_ref().map_or(true, |cur| scalar_cmp(v, cur) == Ordering::Less) {
                    *m = Some(v.clone());
                }
            }
            Acc::Max(m) => {
                if m.as_ref().map_or(true, |cur| scalar_cmp(v, cur) == Ordering::Greater) {
                    *m = Some(v.clone());
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> Scalar {
        match self {
            Acc::Count(c) => Scalar::I64(c),
            Acc::SumInt(s) => s.map(Scalar::I64).unwrap_or(Scalar::Null),
            Acc::SumFloat(s) => s.map(Scalar::F64).unwrap_or(Scalar::Null),
            Acc::Avg { n: 0, .. } => Scalar::Null,
            Acc::Avg { sum, n } => Scalar::F64(sum / n as f64),
            Acc::Min(m) | Acc::Max(m) => m.unwrap_or(Scalar::Null),
        }
    }
}

/// Group `rows` by `group_idx` and evaluate `aggs` per group. Output rows are
/// group keys followed by aggregate values, ordered by key. With no grouping
/// columns exactly one row is produced, even for empty input.
pub fn aggregate(
    rows: Vec<Row>,
    group_idx: &[usize],
    aggs: &[BoundAggregate],
) -> ExecResult<Vec<Row>> {
    let new_accs = || -> Vec<Acc> {
        aggs.iter()
            .map(|a| Acc::new(&a.func, a.float_input))
            .collect()
    };

    if group_idx.is_empty() {
        let mut accs = new_accs();
        for row in &rows {
            feed(&mut accs, aggs, row)?;
        }
        return Ok(vec![accs.into_iter().map(Acc::finish).collect()]);
    }

    let rows = sort_partition(rows, group_idx);
    let mut out = Vec::new();
    let mut current: Option<(Row, Vec<Acc>)> = None;
    for row in rows {
        let key: Row = group_idx.iter().map(|&i| row[i].clone()).collect();
        let same = current
            .as_ref()
            .is_some_and(|(k, _)| k.iter().zip(&key).all(|(a, b)| scalar_cmp(a, b) == Ordering::Equal));
        if !same {
            if let Some((k, accs)) = current.take() {
                out.push(finish_group(k, accs));
            }
            current = Some((key, new_accs()));
        }
        if let Some((_, accs)) = current.as_mut() {
            feed(accs, aggs, &row)?;
        }
    }
    if let Some((k, accs)) = current {
        out.push(finish_group(k, accs));
    }
    Ok(out)
}

fn feed(accs: &mut [Acc], aggs: &[BoundAggregate], row: &[Scalar]) -> ExecResult<()> {
    for (acc, agg) in accs.iter_mut().zip(aggs) {
        acc.update(agg.input.and_then(|i| row.get(i)))?;
    }
    Ok(())
}

fn finish_group(mut key: Row, accs: Vec<Acc>) -> Row {
    key.extend(accs.into_iter().map(Acc::finish));
    key
}
