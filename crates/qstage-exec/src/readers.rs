//! CSV sources and sinks.
//!
//! Files must carry a header row. Columns are matched to the declared schema
//! by name, so the file may order them differently or carry extras.

use std::io::Write;
use std::path::Path;

use qstage_core::catalog::TableDef;
use qstage_core::schema::Schema;
use qstage_core::types::{Row, Scalar};

use crate::error::{ExecError, ExecResult};

/// Load `path` into a table named `name` with the declared `schema`.
pub fn load_csv_table(
    name: &str,
    path: impl AsRef<Path>,
    schema: Schema,
    partition_column: Option<String>,
    num_partitions: usize,
) -> ExecResult<TableDef> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let positions = schema
        .fields
        .iter()
        .map(|f| {
            headers.iter().position(|h| h == f.name).ok_or_else(|| {
                ExecError::Invalid(format!(
                    "{}: column '{}' missing from header",
                    path.display(),
                    f.name
                ))
            })
        })
        .collect::<ExecResult<Vec<_>>>()?;

    let mut rows: Vec<Row> = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let mut row = Vec::with_capacity(positions.len());
        for (field, &pos) in schema.fields.iter().zip(&positions) {
            let text = record.get(pos).unwrap_or("");
            let value = Scalar::parse_as(text, field.data_type).map_err(|e| {
                ExecError::Invalid(format!("{}:{}: {e}", path.display(), line + 2))
            })?;
            if value.is_null() && !field.nullable {
                return Err(ExecError::Invalid(format!(
                    "{}:{}: null in non-nullable column '{}'",
                    path.display(),
                    line + 2,
                    field.name
                )));
            }
            row.push(value);
        }
        rows.push(row);
    }

    TableDef::from_rows(name, schema, rows, partition_column, num_partitions)
        .map_err(|e| ExecError::Invalid(e.to_string()))
}

/// Write `rows` as CSV with a header row. Nulls are empty cells.
pub fn write_csv<W: Write>(out: W, schema: &Schema, rows: &[Row]) -> ExecResult<()> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(schema.names())?;
    for row in rows {
        writer.write_record(row.iter().map(|v| match v {
            Scalar::Null => String::new(),
            other => other.to_string(),
        }))?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qstage_core::schema::{DataType, Field};
    use std::fs;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("a", DataType::Int32, false),
            Field::new("s", DataType::Utf8, true),
        ])
    }

    #[test]
    fn loads_by_header_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.csv");
        fs::write(&path, "s,extra,a\nx,1,10\n,2,20\n").expect("write");
        let t = load_csv_table("t", &path, schema(), None, 1).expect("load");
        let rows = t.partitions[0].batch.to_rows();
        assert_eq!(
            rows,
            vec![
                vec![Scalar::I32(10), Scalar::Str("x".into())],
                vec![Scalar::I32(20), Scalar::Null],
            ]
        );
    }

    #[test]
    fn reports_bad_cells_with_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.csv");
        fs::write(&path, "a,s\n1,x\nnope,y\n").expect("write");
        let err = load_csv_table("t", &path, schema(), None, 1).unwrap_err();
        assert!(err.to_string().contains(":3:"), "{err}");
    }

    #[test]
    fn missing_header_column_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.csv");
        fs::write(&path, "s\nx\n").expect("write");
        assert!(load_csv_table("t", &path, schema(), None, 1).is_err());
    }

    #[test]
    fn writes_header_and_empty_nulls() {
        let mut buf = Vec::new();
        write_csv(
            &mut buf,
            &schema(),
            &[vec![Scalar::I32(1), Scalar::Null], vec![Scalar::I32(2), Scalar::Str("b".into())]],
        )
        .expect("write");
        assert_eq!(String::from_utf8(buf).expect("utf8"), "a,s\n1,\n2,b\n");
    }
}
