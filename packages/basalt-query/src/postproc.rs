//! Post-processing operators applied after the broker merge.

use serde_json::{json, Value as Json};

use basalt_core::{BasaltError, Result};

/// A named operator transforming rendered result rows. Specs come from the
/// `postProcessing` context entry: `{"type": <name>, ...config}`.
pub trait PostProcessor: Send + Sync {
    fn process(&self, spec: &Json, rows: Vec<Json>) -> Result<Vec<Json>>;
}

/// Zip two array-valued fields into a map field.
pub struct ArrayToMap;

impl PostProcessor for ArrayToMap {
    fn process(&self, spec: &Json, rows: Vec<Json>) -> Result<Vec<Json>> {
        let key_column = str_field(spec, "keyColumn")?;
        let value_column = str_field(spec, "valueColumn")?;
        let output = spec
            .get("outputColumn")
            .and_then(Json::as_str)
            .unwrap_or("map")
            .to_string();
        rows.into_iter()
            .map(|mut row| {
                if let Some(payload) = payload_mut(&mut row) {
                    let keys = payload
                        .get(&key_column)
                        .and_then(Json::as_array)
                        .cloned()
                        .unwrap_or_default();
                    let values = payload
                        .get(&value_column)
                        .and_then(Json::as_array)
                        .cloned()
                        .unwrap_or_default();
                    let map: serde_json::Map<String, Json> = keys
                        .into_iter()
                        .zip(values)
                        .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v)))
                        .collect();
                    payload.insert(output.clone(), Json::Object(map));
                }
                Ok(row)
            })
            .collect()
    }
}

/// Collapse the row stream into a single list-valued row.
pub struct RowToList;

impl PostProcessor for RowToList {
    fn process(&self, _spec: &Json, rows: Vec<Json>) -> Result<Vec<Json>> {
        Ok(vec![json!({ "result": rows })])
    }
}

/// Keep the k rows with the largest (or smallest) value in one field; used
/// for top-k selection over covariance matrices and similar wide outputs.
pub struct TopK;

impl PostProcessor for TopK {
    fn process(&self, spec: &Json, mut rows: Vec<Json>) -> Result<Vec<Json>> {
        let column = str_field(spec, "column")?;
        let k = spec.get("k").and_then(Json::as_u64).unwrap_or(10) as usize;
        let ascending = spec
            .get("ascending")
            .and_then(Json::as_bool)
            .unwrap_or(false);
        rows.sort_by(|a, b| {
            let va = field_value(a, &column);
            let vb = field_value(b, &column);
            let ord = va
                .partial_cmp(&vb)
                .unwrap_or(std::cmp::Ordering::Equal);
            if ascending {
                ord
            } else {
                ord.reverse()
            }
        });
        rows.truncate(k);
        Ok(rows)
    }
}

fn str_field(spec: &Json, key: &str) -> Result<String> {
    spec.get(key)
        .and_then(Json::as_str)
        .map(|s| s.to_string())
        .ok_or_else(|| {
            BasaltError::IllegalArgument(format!("post-processor requires {key}"))
        })
}

/// The mutable row payload: `event` for group-by rows, `result` otherwise,
/// falling back to the row object itself.
fn payload_mut(row: &mut Json) -> Option<&mut serde_json::Map<String, Json>> {
    if row.get("event").map(|e| e.is_object()).unwrap_or(false) {
        return row.get_mut("event").and_then(Json::as_object_mut);
    }
    if row.get("result").map(|r| r.is_object()).unwrap_or(false) {
        return row.get_mut("result").and_then(Json::as_object_mut);
    }
    row.as_object_mut()
}

fn field_value(row: &Json, column: &str) -> f64 {
    for root in ["event", "result"] {
        if let Some(v) = row.get(root).and_then(|p| p.get(column)).and_then(Json::as_f64) {
            return v;
        }
    }
    row.get(column).and_then(Json::as_f64).unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_to_map() {
        let spec = json!({"type": "arrayToMap", "keyColumn": "ks", "valueColumn": "vs"});
        let rows = vec![json!({"result": {"ks": ["a", "b"], "vs": [1, 2]}})];
        let out = ArrayToMap.process(&spec, rows).unwrap();
        assert_eq!(out[0]["result"]["map"], json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_top_k() {
        let spec = json!({"type": "topK", "column": "score", "k": 2});
        let rows = vec![
            json!({"result": {"score": 1.0}}),
            json!({"result": {"score": 9.0}}),
            json!({"result": {"score": 5.0}}),
        ];
        let out = TopK.process(&spec, rows).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["result"]["score"], json!(9.0));
    }
}
