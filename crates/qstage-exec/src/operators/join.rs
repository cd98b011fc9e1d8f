//! Sort-merge join over one pair of co-partitioned inputs.
//!
//! Precondition: both sides are sorted on their join keys (the plan inserts
//! the sorts). Unsorted input is reported rather than silently mis-joined.

use std::cmp::Ordering;

use qstage_core::logical::JoinType;
use qstage_core::types::{scalar_tuple_cmp, Row, Scalar};

use crate::error::{ExecError, ExecResult};

fn key(row: &[Scalar], idx: &[usize]) -> Vec<Scalar> {
    idx.iter().map(|&i| row[i].clone()).collect()
}

fn cmp_keys(a: &[Scalar], b: &[Scalar]) -> Ordering {
    scalar_tuple_cmp(a, b)
}

fn check_sorted(rows: &[Row], idx: &[usize], side: &str) -> ExecResult<()> {
    for w in rows.windows(2) {
        if cmp_keys(&key(&w[0], idx), &key(&w[1], idx)) == Ordering::Greater {
            return Err(ExecError::Invalid(format!(
                "SortMergeJoin {side} input is not sorted on its join keys"
            )));
        }
    }
    Ok(())
}

/// Length of the run of rows starting at `start` sharing `k`.
fn run_len(rows: &[Row], start: usize, idx: &[usize], k: &[Scalar]) -> usize {
    rows[start..]
        .iter()
        .take_while(|r| cmp_keys(&key(r, idx), k) == Ordering::Equal)
        .count()
}

pub fn sort_merge_join(
    left: &[Row],
    right: &[Row],
    left_idx: &[usize],
    right_idx: &[usize],
    join_type: JoinType,
    right_width: usize,
) -> ExecResult<Vec<Row>> {
    check_sorted(left, left_idx, "left")?;
    check_sorted(right, right_idx, "right")?;

    let pad = |l: &Row| -> Row {
        let mut out = l.clone();
        out.extend(std::iter::repeat(Scalar::Null).take(right_width));
        out
    };

    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < left.len() {
        let lk = key(&left[i], left_idx);
        let l_run = run_len(left, i, left_idx, &lk);
        // Null keys never match.
        if lk.iter().any(Scalar::is_null) {
            if join_type == JoinType::Left {
                out.extend(left[i..i + l_run].iter().map(pad));
            }
            i += l_run;
            continue;
        }
        while j < right.len() && cmp_keys(&key(&right[j], right_idx), &lk) == Ordering::Less {
            j += 1;
        }
        let r_run = if j < right.len() {
            run_len(right, j, right_idx, &lk)
        } else {
            0
        };
        if r_run == 0 {
            if join_type == JoinType::Left {
                out.extend(left[i..i + l_run].iter().map(pad));
            }
        } else {
            for l in &left[i..i + l_run] {
                for r in &right[j..j + r_run] {
                    let mut row = l.clone();
                    row.extend(r.iter().cloned());
                    out.push(row);
                }
            }
        }
        i += l_run;
    }
    Ok(out)
}
