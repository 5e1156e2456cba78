use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use serde_json::{Map, Number, Value as JsonValue};

use super::model::{ConditionValue, EventTable};

/// Parquet field metadata marking a column as a condition, so numeric
/// conditions do not come back as channels.
pub(super) const ROLE_KEY: &str = "role";
pub(super) const CONDITION_ROLE: &str = "condition";

/// Write an event table to a file.  Dispatch by extension, mirroring
/// [`super::loader::load_file`]. Channels come first, then conditions.
pub fn write_file(table: &EventTable, path: &Path) -> Result<()> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "parquet" | "pq" => write_parquet(table, path),
        "json" => write_json(table, path),
        "csv" => write_csv(table, path),
        other => bail!("Unsupported file extension: .{other}"),
    }
    .with_context(|| format!("writing {}", path.display()))?;

    log::info!("wrote {} events to {}", table.len(), path.display());
    Ok(())
}

fn column_names(table: &EventTable) -> Vec<&str> {
    table
        .channel_names()
        .iter()
        .chain(table.condition_names())
        .map(String::as_str)
        .collect()
}

fn write_csv(table: &EventTable, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).context("creating CSV")?;
    writer.write_record(column_names(table))?;

    let mut record: Vec<String> = Vec::new();
    for row in 0..table.len() {
        record.clear();
        for name in table.channel_names() {
            let v = table.channel(name).map(|c| c[row]).unwrap_or(f64::NAN);
            record.push(v.to_string());
        }
        for name in table.condition_names() {
            let v = table
                .condition(name)
                .map(|c| c[row].to_string())
                .unwrap_or_default();
            record.push(v);
        }
        writer.write_record(&record)?;
    }
    writer.flush().context("flushing CSV")?;
    Ok(())
}

fn write_json(table: &EventTable, path: &Path) -> Result<()> {
    let records: Vec<JsonValue> = (0..table.len())
        .map(|row| {
            let mut obj = Map::new();
            for name in table.channel_names() {
                let v = table.channel(name).map(|c| c[row]).unwrap_or(f64::NAN);
                let cell = Number::from_f64(v).map_or(JsonValue::Null, JsonValue::Number);
                obj.insert(name.clone(), cell);
            }
            for name in table.condition_names() {
                let cell = table
                    .condition(name)
                    .map_or(JsonValue::Null, |c| value_to_json(&c[row]));
                obj.insert(name.clone(), cell);
            }
            JsonValue::Object(obj)
        })
        .collect();

    let file = std::fs::File::create(path).context("creating JSON file")?;
    serde_json::to_writer(std::io::BufWriter::new(file), &records).context("encoding JSON")?;
    Ok(())
}

fn value_to_json(v: &ConditionValue) -> JsonValue {
    match v {
        ConditionValue::String(s) => JsonValue::String(s.clone()),
        ConditionValue::Integer(i) => JsonValue::from(*i),
        ConditionValue::Float(f) => Number::from_f64(*f).map_or(JsonValue::Null, JsonValue::Number),
        ConditionValue::Bool(b) => JsonValue::Bool(*b),
        ConditionValue::Null => JsonValue::Null,
    }
}

/// Channels as non-null Float64; conditions as nullable columns of their
/// own type, tagged with [`CONDITION_ROLE`].
fn write_parquet(table: &EventTable, path: &Path) -> Result<()> {
    let mut fields = Vec::new();
    let mut arrays: Vec<ArrayRef> = Vec::new();

    for name in table.channel_names() {
        let values = table.channel(name).unwrap_or_default().to_vec();
        fields.push(Field::new(name, DataType::Float64, false));
        arrays.push(Arc::new(Float64Array::from(values)));
    }
    for name in table.condition_names() {
        let (data_type, array) = condition_array(table.condition(name).unwrap_or_default());
        let role = HashMap::from([(ROLE_KEY.to_string(), CONDITION_ROLE.to_string())]);
        fields.push(Field::new(name, data_type, true).with_metadata(role));
        arrays.push(array);
    }

    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(schema.clone(), arrays).context("building record batch")?;

    let file = std::fs::File::create(path).context("creating parquet file")?;
    let mut writer = ArrowWriter::try_new(file, schema, None).context("creating parquet writer")?;
    writer.write(&batch).context("writing record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(())
}

/// Int64, Float64 or Boolean when every non-null cell fits that type
/// (integers widen to floats), Utf8 otherwise.
fn condition_array(values: &[ConditionValue]) -> (DataType, ArrayRef) {
    let present = || values.iter().filter(|v| !matches!(v, ConditionValue::Null));
    let any_present = present().next().is_some();

    if any_present && present().all(|v| matches!(v, ConditionValue::Integer(_))) {
        let column: Int64Array = values
            .iter()
            .map(|v| match v {
                ConditionValue::Integer(i) => Some(*i),
                _ => None,
            })
            .collect();
        return (DataType::Int64, Arc::new(column));
    }
    if any_present && present().all(|v| v.as_f64().is_some()) {
        let column: Float64Array = values.iter().map(ConditionValue::as_f64).collect();
        return (DataType::Float64, Arc::new(column));
    }
    if any_present && present().all(|v| matches!(v, ConditionValue::Bool(_))) {
        let column: BooleanArray = values
            .iter()
            .map(|v| match v {
                ConditionValue::Bool(b) => Some(*b),
                _ => None,
            })
            .collect();
        return (DataType::Boolean, Arc::new(column));
    }
    let column: StringArray = values
        .iter()
        .map(|v| match v {
            ConditionValue::Null => None,
            other => Some(other.to_string()),
        })
        .collect();
    (DataType::Utf8, Arc::new(column))
}

#[cfg(test)]
mod tests {
    use arrow::array::Array;

    use super::*;

    #[test]
    fn condition_columns_keep_their_type() {
        let ints = [ConditionValue::Integer(1), ConditionValue::Null];
        assert_eq!(condition_array(&ints).0, DataType::Int64);

        let mixed = [ConditionValue::Integer(1), ConditionValue::Float(0.5)];
        assert_eq!(condition_array(&mixed).0, DataType::Float64);

        let flags = [ConditionValue::Bool(true), ConditionValue::Null];
        assert_eq!(condition_array(&flags).0, DataType::Boolean);

        let text = [ConditionValue::String("A1".into()), ConditionValue::Integer(2)];
        let (data_type, array) = condition_array(&text);
        assert_eq!(data_type, DataType::Utf8);
        assert_eq!(array.len(), 2);

        assert_eq!(condition_array(&[ConditionValue::Null]).0, DataType::Utf8);
    }
}
