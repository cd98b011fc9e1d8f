use qstage_core::types::{sort_rows, Row};

/// Stable in-partition sort on the key positions.
pub fn sort_partition(mut rows: Vec<Row>, key_indices: &[usize]) -> Vec<Row> {
    sort_rows(&mut rows, key_indices);
    rows
}

/// First `n` rows across partitions, in partition order.
pub fn limit(parts: Vec<Vec<Row>>, n: usize) -> Vec<Row> {
    parts.into_iter().flatten().take(n).collect()
}
