//! Data movement between partitionings.

use qstage_core::physical::Partitioning;
use qstage_core::schema::Schema;
use qstage_core::types::{hash_partition_rows, Row};

use crate::error::{ExecError, ExecResult};

pub fn key_indices(schema: &Schema, keys: &[String]) -> ExecResult<Vec<usize>> {
    keys.iter()
        .map(|k| schema.index_of(k).ok_or_else(|| ExecError::MissingColumn(k.clone())))
        .collect()
}

/// Repartition all input rows. Row order within an output partition
/// follows input partition order.
pub fn shuffle(parts: Vec<Vec<Row>>, partitioning: &Partitioning, schema: &Schema) -> ExecResult<Vec<Vec<Row>>> {
    let all: Vec<Row> = parts.into_iter().flatten().collect();
    match partitioning {
        Partitioning::Single => Ok(vec![all]),
        Partitioning::Hash { keys, n } => {
            let idx = key_indices(schema, keys)?;
            Ok(hash_partition_rows(all, &idx, *n))
        }
        Partitioning::Unknown => Err(ExecError::Invalid(
            "exchange with unknown partitioning".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qstage_core::schema::{DataType, Field};
    use qstage_core::types::Scalar;

    #[test]
    fn equal_keys_land_together() {
        let schema = Schema::new(vec![Field::new("k", DataType::Int64, false)]);
        let parts = vec![
            (0..10).map(|i| vec![Scalar::I64(i % 4)]).collect(),
            (0..10).map(|i| vec![Scalar::I64(i % 4)]).collect(),
        ];
        let out = shuffle(
            parts,
            &Partitioning::Hash {
                keys: vec!["k".into()],
                n: 3,
            },
            &schema,
        )
        .expect("shuffle");
        assert_eq!(out.len(), 3);
        assert_eq!(out.iter().map(Vec::len).sum::<usize>(), 20);
        for k in 0..4 {
            let holders = out
                .iter()
                .filter(|p| p.iter().any(|r| r[0] == Scalar::I64(k)))
                .count();
            assert_eq!(holders, 1);
        }
    }

    #[test]
    fn single_gathers_everything() {
        let schema = Schema::new(vec![Field::new("k", DataType::Int64, false)]);
        let out = shuffle(
            vec![vec![vec![Scalar::I64(1)]], vec![vec![Scalar::I64(2)]]],
            &Partitioning::Single,
            &schema,
        )
        .expect("shuffle");
        assert_eq!(out, vec![vec![vec![Scalar::I64(1)], vec![Scalar::I64(2)]]]);
    }
}
