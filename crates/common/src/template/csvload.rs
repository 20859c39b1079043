//! CSV loading for `file_csv` and `parse_csv`
//!
//! In the typed form the first row carries column names and the second
//! row the column types. Columns with an empty name or the `skip` type
//! are dropped, rows starting with `#` are comments, and `<T>,array`
//! types parse the cell as a one-line comma-separated CSV of `T`.

use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};

/// Parse CSV with a typed header pair into a list of row objects.
pub fn parse_typed(bytes: &[u8], delimiter: u8) -> Result<Value> {
    let records = read_records(bytes, delimiter)?;
    if records.len() < 2 {
        return Err(Error::template(
            "typed CSV needs a name row and a type row",
        ));
    }
    let names = &records[0];
    let types = &records[1];

    let mut rows = Vec::new();
    for record in &records[2..] {
        let mut row = Map::new();
        for (i, name) in names.iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            let ty = types.get(i).map(String::as_str).unwrap_or("string");
            if ty == "skip" {
                continue;
            }
            let cell = record.get(i).map(String::as_str).unwrap_or("");
            row.insert(name.clone(), parse_cell(cell, ty)?);
        }
        rows.push(Value::Object(row));
    }
    Ok(Value::Array(rows))
}

/// Parse CSV with a plain name header; all values stay strings.
pub fn parse_untyped(bytes: &[u8], delimiter: u8) -> Result<Value> {
    let records = read_records(bytes, delimiter)?;
    if records.is_empty() {
        return Ok(Value::Array(Vec::new()));
    }
    let names = &records[0];

    let mut rows = Vec::new();
    for record in &records[1..] {
        let mut row = Map::new();
        for (i, name) in names.iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            let cell = record.get(i).cloned().unwrap_or_default();
            row.insert(name.clone(), Value::String(cell));
        }
        rows.push(Value::Object(row));
    }
    Ok(Value::Array(rows))
}

fn read_records(bytes: &[u8], delimiter: u8) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .from_reader(bytes);

    let mut records = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| Error::template(format!("CSV parse error: {}", e)))?;
        records.push(record.iter().map(str::to_string).collect());
    }
    Ok(records)
}

fn parse_cell(cell: &str, ty: &str) -> Result<Value> {
    if let Some(elem_ty) = ty.strip_suffix(",array") {
        if cell.is_empty() {
            return Ok(Value::Array(Vec::new()));
        }
        let cells = read_records(cell.as_bytes(), b',')?;
        let first = cells.into_iter().next().unwrap_or_default();
        let mut items = Vec::with_capacity(first.len());
        for c in first {
            items.push(parse_scalar(&c, elem_ty)?);
        }
        return Ok(Value::Array(items));
    }
    parse_scalar(cell, ty)
}

fn parse_scalar(cell: &str, ty: &str) -> Result<Value> {
    if cell.is_empty() && ty != "string" {
        return Ok(Value::Null);
    }
    match ty {
        "string" => Ok(Value::String(cell.to_string())),
        "int" | "int64" => cell
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| Error::template(format!("'{}' is not an int", cell))),
        "float64" => cell
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| Error::template(format!("'{}' is not a float64", cell))),
        "bool" => match cell {
            "true" | "TRUE" | "1" => Ok(Value::Bool(true)),
            "false" | "FALSE" | "0" => Ok(Value::Bool(false)),
            _ => Err(Error::template(format!("'{}' is not a bool", cell))),
        },
        "json" => serde_json::from_str(cell)
            .map_err(|e| Error::template(format!("bad json cell '{}': {}", cell, e))),
        other => Err(Error::template(format!("unknown CSV column type '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_csv() {
        let csv = "\
id,name,price,tags,ignored,
int64,string,float64,\"string,array\",skip,string
1,apple,1.5,\"red,green\",x,y
# a comment row
2,pear,2.25,,x,y
";
        let rows = parse_typed(csv.as_bytes(), b',').unwrap();
        assert_eq!(
            rows,
            json!([
                {"id": 1, "name": "apple", "price": 1.5, "tags": ["red", "green"]},
                {"id": 2, "name": "pear", "price": 2.25, "tags": []},
            ])
        );
    }

    #[test]
    fn test_untyped_csv() {
        let csv = "a;b\n1;x\n2;y\n";
        let rows = parse_untyped(csv.as_bytes(), b';').unwrap();
        assert_eq!(rows, json!([{"a": "1", "b": "x"}, {"a": "2", "b": "y"}]));
    }

    #[test]
    fn test_empty_typed_cell_is_null() {
        let csv = "n\nint64\n\n5\n";
        let rows = parse_typed(csv.as_bytes(), b',').unwrap();
        // blank line is skipped by the CSV reader, so only the real row remains
        assert_eq!(rows, json!([{"n": 5}]));
    }

    #[test]
    fn test_bad_int_cell() {
        let csv = "n\nint\nnope\n";
        assert!(parse_typed(csv.as_bytes(), b',').is_err());
    }
}
