//! Row-level operator kernels. Each works on one partition's rows (or on a
//! set of partitions for data movement) and knows nothing about plan trees.

pub mod aggregate;
pub mod basic;
pub mod exchange;
pub mod join;
pub mod scan;
pub mod sort;
