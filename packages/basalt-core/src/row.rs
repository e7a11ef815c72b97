//! Timestamped record used for ingestion input and intermediate results.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::{BasaltError, Result};
use crate::value::{parse_numeric, Scalar};

/// A timestamped record: epoch-millis plus named fields.
///
/// Typed accessors apply the engine coercion rules: numbers cast, strings
/// parse tolerantly, anything unparseable is a `ParseFailure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub timestamp: i64,
    pub event: HashMap<String, Json>,
}

impl Row {
    pub fn new(timestamp: i64, event: HashMap<String, Json>) -> Row {
        Row { timestamp, event }
    }

    /// Build a row from a JSON event object; `timestamp_field` holds either
    /// epoch millis or an RFC 3339 string.
    pub fn from_json(event: Json, timestamp_field: &str) -> Result<Row> {
        let mut map = match event {
            Json::Object(m) => m.into_iter().collect::<HashMap<_, _>>(),
            other => {
                return Err(BasaltError::ParseFailure(format!(
                    "event is not an object: {other}"
                )))
            }
        };
        let ts_value = map
            .remove(timestamp_field)
            .ok_or_else(|| BasaltError::ParseFailure(format!("missing {timestamp_field}")))?;
        let timestamp = match &ts_value {
            Json::Number(n) => n
                .as_i64()
                .ok_or_else(|| BasaltError::ParseFailure(ts_value.to_string()))?,
            Json::String(s) => crate::time::parse_timestamp(s)?,
            other => return Err(BasaltError::ParseFailure(other.to_string())),
        };
        Ok(Row::new(timestamp, map))
    }

    pub fn raw(&self, name: &str) -> Option<&Json> {
        self.event.get(name)
    }

    pub fn double(&self, name: &str) -> Result<Option<f64>> {
        match self.event.get(name) {
            None | Some(Json::Null) => Ok(None),
            Some(Json::Number(n)) => Ok(n.as_f64()),
            Some(Json::String(s)) => Ok(parse_numeric(s)?.as_double()),
            Some(other) => Err(BasaltError::ParseFailure(other.to_string())),
        }
    }

    pub fn float(&self, name: &str) -> Result<Option<f32>> {
        Ok(self.double(name)?.map(|v| v as f32))
    }

    pub fn long(&self, name: &str) -> Result<Option<i64>> {
        match self.event.get(name) {
            None | Some(Json::Null) => Ok(None),
            Some(Json::Number(n)) => Ok(n
                .as_i64()
                .or_else(|| n.as_f64().map(|v| v as i64))),
            Some(Json::String(s)) => Ok(parse_numeric(s)?.as_long()),
            Some(other) => Err(BasaltError::ParseFailure(other.to_string())),
        }
    }

    /// Multi-value dimension read: scalars become single-element lists, array
    /// fields keep original input order and are never deduplicated here.
    pub fn string_list(&self, name: &str) -> Vec<String> {
        match self.event.get(name) {
            None | Some(Json::Null) => Vec::new(),
            Some(Json::Array(items)) => items.iter().map(json_to_dim_string).collect(),
            Some(other) => vec![json_to_dim_string(other)],
        }
    }

    pub fn scalar(&self, name: &str) -> Scalar {
        match self.event.get(name) {
            None => Scalar::Null,
            Some(v) => Scalar::from_json(v),
        }
    }
}

fn json_to_dim_string(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row() -> Row {
        Row::from_json(
            json!({
                "timestamp": "2020-01-01T00:00:10Z",
                "country": "jp",
                "tags": ["a", "b", "a"],
                "bytes": "1,024",
                "score": 2.5
            }),
            "timestamp",
        )
        .unwrap()
    }

    #[test]
    fn test_timestamp_and_coercion() {
        let r = row();
        assert_eq!(r.timestamp, 1_577_836_810_000);
        assert_eq!(r.long("bytes").unwrap(), Some(1024));
        assert_eq!(r.double("score").unwrap(), Some(2.5));
        assert_eq!(r.double("missing").unwrap(), None);
    }

    #[test]
    fn test_multi_value_keeps_order_and_duplicates() {
        let r = row();
        assert_eq!(r.string_list("tags"), vec!["a", "b", "a"]);
        assert_eq!(r.string_list("country"), vec!["jp"]);
    }

    #[test]
    fn test_unparseable_is_parse_failure() {
        let r = Row::new(0, [("v".to_string(), json!("12x"))].into_iter().collect());
        assert!(matches!(r.double("v"), Err(BasaltError::ParseFailure(_))));
    }
}
