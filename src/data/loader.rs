use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use arrow::array::{
    Array, AsArray, BooleanArray, Float32Array, Float64Array, Int32Array, Int64Array,
    StringArray,
};
use arrow::datatypes::DataType;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value as JsonValue;

use super::model::{ConditionValue, EventTable};
use super::writer::{CONDITION_ROLE, ROLE_KEY};

// ---------------------------------------------------------------------------
// Public entry-point
// ---------------------------------------------------------------------------

/// Load an event table from a file.  Dispatch by extension.
///
/// Numeric columns become channels; anything else becomes a condition
/// column.
///
/// Supported formats:
/// * `.parquet` – one column per channel/condition (recommended)
/// * `.json`    – `[{ "FITC-A": 12.5, "PE-A": 3.1, "well": "A1" }, ...]`
/// * `.csv`     – header row with column names, one event per row
pub fn load_file(path: &Path) -> Result<EventTable> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let table = match ext.as_str() {
        "parquet" | "pq" => load_parquet(path),
        "json" => load_json(path),
        "csv" => load_csv(path),
        other => bail!("Unsupported file extension: .{other}"),
    }
    .with_context(|| format!("loading {}", path.display()))?;

    log::info!(
        "loaded {} events x {} channels from {}",
        table.len(),
        table.channel_names().len(),
        path.display()
    );
    Ok(table)
}

// ---------------------------------------------------------------------------
// Column assembly shared by the row-oriented formats
// ---------------------------------------------------------------------------

/// Turn row-major cells into typed columns: a column whose every cell is a
/// number is a channel, otherwise a condition.
fn assemble(names: Vec<String>, mut cells: Vec<Vec<ConditionValue>>) -> Result<EventTable> {
    let mut table = EventTable::new();
    for (name, column) in names.into_iter().zip(cells.drain(..)) {
        let any_number = column.iter().any(|v| !matches!(v, ConditionValue::Null));
        let numeric: Option<Vec<f64>> = column.iter().map(as_number).collect();
        match numeric {
            Some(values) if any_number => table.insert_channel(name, values)?,
            _ => table.insert_condition(name, column)?,
        }
    }
    Ok(table)
}

/// Numeric cell value; empty cells read as NaN.
fn as_number(v: &ConditionValue) -> Option<f64> {
    match v {
        ConditionValue::Float(f) => Some(*f),
        ConditionValue::Integer(i) => Some(*i as f64),
        ConditionValue::Null => Some(f64::NAN),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// JSON loader
// ---------------------------------------------------------------------------

/// Expected JSON schema (records-oriented, the default `df.to_json(orient='records')`):
///
/// ```json
/// [
///   { "FITC-A": 1023.5, "PE-A": 88.0, "well": "A1" },
///   ...
/// ]
/// ```
fn load_json(path: &Path) -> Result<EventTable> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    let root: JsonValue = serde_json::from_str(&text).context("parsing JSON")?;

    let records = root
        .as_array()
        .context("Expected top-level JSON array")?;

    let mut names: Vec<String> = Vec::new();
    let mut index: BTreeMap<String, usize> = BTreeMap::new();
    let mut cells: Vec<Vec<ConditionValue>> = Vec::new();

    for (i, rec) in records.iter().enumerate() {
        let obj = rec
            .as_object()
            .with_context(|| format!("Row {i} is not a JSON object"))?;

        for (key, val) in obj {
            let col = *index.entry(key.clone()).or_insert_with(|| {
                names.push(key.clone());
                cells.push(vec![ConditionValue::Null; i]);
                names.len() - 1
            });
            cells[col].push(json_to_value(val));
        }
        // keys missing from this record
        for column in &mut cells {
            if column.len() < i + 1 {
                column.push(ConditionValue::Null);
            }
        }
    }

    assemble(names, cells)
}

fn json_to_value(val: &JsonValue) -> ConditionValue {
    match val {
        JsonValue::String(s) => ConditionValue::String(s.clone()),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                ConditionValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                ConditionValue::Float(f)
            } else {
                ConditionValue::String(n.to_string())
            }
        }
        JsonValue::Bool(b) => ConditionValue::Bool(*b),
        JsonValue::Null => ConditionValue::Null,
        other => ConditionValue::String(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// CSV loader
// ---------------------------------------------------------------------------

/// CSV layout:  header row with column names, one event per row.
fn load_csv(path: &Path) -> Result<EventTable> {
    let mut reader = csv::Reader::from_path(path).context("opening CSV")?;
    let headers: Vec<String> = reader
        .headers()
        .context("reading CSV headers")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut cells: Vec<Vec<ConditionValue>> = vec![Vec::new(); headers.len()];

    for (row_no, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("CSV row {row_no}"))?;
        if record.len() != headers.len() {
            bail!(
                "CSV row {row_no}: {} fields but {} columns",
                record.len(),
                headers.len()
            );
        }
        for (col_idx, value) in record.iter().enumerate() {
            cells[col_idx].push(guess_value_type(value.trim()));
        }
    }

    assemble(headers, cells)
}

fn guess_value_type(s: &str) -> ConditionValue {
    if s.is_empty() {
        return ConditionValue::Null;
    }
    if let Ok(i) = s.parse::<i64>() {
        return ConditionValue::Integer(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        return ConditionValue::Float(f);
    }
    if s == "true" || s == "false" {
        return ConditionValue::Bool(s == "true");
    }
    ConditionValue::String(s.to_string())
}

// ---------------------------------------------------------------------------
// Parquet loader
// ---------------------------------------------------------------------------

/// Load a Parquet file of events.
///
/// Float32/Float64/Int32/Int64 columns are channels (nulls read as NaN and
/// are later dropped by the mesh-domain filter) unless their field metadata
/// marks them as conditions; Utf8 and Boolean columns are conditions.
///
/// Works with files written by both **Pandas** (`df.to_parquet()`) and
/// **Polars** (`df.write_parquet()`).
fn load_parquet(path: &Path) -> Result<EventTable> {
    let file = std::fs::File::open(path).context("opening parquet file")?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .context("reading parquet metadata")?;
    let reader = builder.build().context("building parquet reader")?;

    let mut names: Vec<String> = Vec::new();
    let mut numeric: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    let mut conditions: BTreeMap<String, Vec<ConditionValue>> = BTreeMap::new();

    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;
        let schema = batch.schema();

        for (col_idx, field) in schema.fields().iter().enumerate() {
            let name = field.name().clone();
            let col = batch.column(col_idx);
            if !names.contains(&name) {
                names.push(name.clone());
            }
            let is_condition = field.metadata().get(ROLE_KEY).map(String::as_str)
                == Some(CONDITION_ROLE);
            if let Some(values) = extract_f64_column(col).filter(|_| !is_condition) {
                numeric.entry(name).or_default().extend(values);
            } else {
                conditions
                    .entry(name)
                    .or_default()
                    .extend((0..col.len()).map(|row| extract_condition_value(col, row)));
            }
        }
    }

    let mut table = EventTable::new();
    for name in names {
        if let Some(values) = numeric.remove(&name) {
            table.insert_channel(name, values)?;
        } else if let Some(values) = conditions.remove(&name) {
            table.insert_condition(name, values)?;
        }
    }
    Ok(table)
}

// -- Parquet / Arrow helpers --

/// Read a numeric column as `f64`, or `None` for non-numeric types.
fn extract_f64_column(col: &Arc<dyn Array>) -> Option<Vec<f64>> {
    let values = match col.data_type() {
        DataType::Float64 => col
            .as_any()
            .downcast_ref::<Float64Array>()?
            .iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect(),
        DataType::Float32 => col
            .as_any()
            .downcast_ref::<Float32Array>()?
            .iter()
            .map(|v| v.map(f64::from).unwrap_or(f64::NAN))
            .collect(),
        DataType::Int32 => col
            .as_any()
            .downcast_ref::<Int32Array>()?
            .iter()
            .map(|v| v.map(f64::from).unwrap_or(f64::NAN))
            .collect(),
        DataType::Int64 => col
            .as_any()
            .downcast_ref::<Int64Array>()?
            .iter()
            .map(|v| v.map(|i| i as f64).unwrap_or(f64::NAN))
            .collect(),
        _ => return None,
    };
    Some(values)
}

/// Extract a single condition value from an Arrow column at a given row.
fn extract_condition_value(col: &Arc<dyn Array>, row: usize) -> ConditionValue {
    if col.is_null(row) {
        return ConditionValue::Null;
    }
    match col.data_type() {
        DataType::Utf8 => match col.as_any().downcast_ref::<StringArray>() {
            Some(s) => ConditionValue::String(s.value(row).to_string()),
            None => ConditionValue::Null,
        },
        DataType::LargeUtf8 => {
            ConditionValue::String(col.as_string::<i64>().value(row).to_string())
        }
        DataType::Boolean => match col.as_any().downcast_ref::<BooleanArray>() {
            Some(b) => ConditionValue::Bool(b.value(row)),
            None => ConditionValue::Null,
        },
        DataType::Int64 => match col.as_any().downcast_ref::<Int64Array>() {
            Some(a) => ConditionValue::Integer(a.value(row)),
            None => ConditionValue::Null,
        },
        DataType::Int32 => match col.as_any().downcast_ref::<Int32Array>() {
            Some(a) => ConditionValue::Integer(i64::from(a.value(row))),
            None => ConditionValue::Null,
        },
        DataType::Float64 => match col.as_any().downcast_ref::<Float64Array>() {
            Some(a) => ConditionValue::Float(a.value(row)),
            None => ConditionValue::Null,
        },
        DataType::Float32 => match col.as_any().downcast_ref::<Float32Array>() {
            Some(a) => ConditionValue::Float(f64::from(a.value(row))),
            None => ConditionValue::Null,
        },
        other => ConditionValue::String(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_columns_become_channels() {
        let table = assemble(
            vec!["FITC-A".into(), "well".into()],
            vec![
                vec![ConditionValue::Float(1.5), ConditionValue::Integer(2)],
                vec![
                    ConditionValue::String("A1".into()),
                    ConditionValue::Integer(3),
                ],
            ],
        )
        .unwrap();
        assert_eq!(table.channel("FITC-A"), Some(&[1.5, 2.0][..]));
        assert_eq!(table.condition_names(), ["well"]);
    }

    #[test]
    fn guesses_cell_types() {
        assert_eq!(guess_value_type(""), ConditionValue::Null);
        assert_eq!(guess_value_type("-12"), ConditionValue::Integer(-12));
        assert_eq!(guess_value_type("1e3"), ConditionValue::Float(1000.0));
        assert_eq!(guess_value_type("true"), ConditionValue::Bool(true));
        assert_eq!(
            guess_value_type("Dox"),
            ConditionValue::String("Dox".into())
        );
    }
}
