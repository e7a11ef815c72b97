//! Result forwarding: write the result sequence to a sink URI instead of
//! returning rows; the caller surfaces the returned metadata map as the
//! query's single result row.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use serde_json::{json, Value as Json};

use basalt_core::{BasaltError, Result, Sequence};

use crate::context::QueryContext;

/// The magic path element replaced by a freshly-created local temp dir.
const LOCAL_TEMP: &str = "$localTemp$";

#[derive(Debug, Clone)]
pub struct ForwardSpec {
    pub url: String,
    pub context: HashMap<String, Json>,
}

impl ForwardSpec {
    pub fn from_context(ctx: &QueryContext) -> Option<ForwardSpec> {
        ctx.forward_url().map(|url| ForwardSpec {
            url,
            context: ctx.forward_context(),
        })
    }

    fn str_opt(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Json::as_str)
    }

    fn bool_opt(&self, key: &str) -> bool {
        self.context.get(key).and_then(Json::as_bool).unwrap_or(false)
    }
}

struct CountingWriter<W: Write> {
    inner: W,
    bytes: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Drain the sequence into the sink selected by the URI scheme. Returns
/// `{rowCount, typeString, data: {uri -> byteCount}}`; `rowCount` equals the
/// rows accepted by the accumulator.
pub fn forward_results(
    spec: &ForwardSpec,
    rows: Sequence<Json>,
    node_name: &str,
) -> Result<Json> {
    let (scheme, rest) = spec
        .url
        .split_once("://")
        .ok_or_else(|| BasaltError::IllegalArgument(format!("bad forward URL: {}", spec.url)))?;

    match scheme {
        "null" => {
            let mut count = 0u64;
            for row in rows {
                row?;
                count += 1;
            }
            Ok(json!({
                "rowCount": count,
                "typeString": "",
                "data": { spec.url.clone(): 0 }
            }))
        }
        "file" => forward_to_file(spec, rest, rows, node_name),
        "hdfs" | "s3" => Err(BasaltError::IllegalArgument(format!(
            "no {scheme} sink handler configured on this node"
        ))),
        other => Err(BasaltError::IllegalArgument(format!(
            "unknown forward scheme: {other}"
        ))),
    }
}

fn forward_to_file(
    spec: &ForwardSpec,
    rest: &str,
    rows: Sequence<Json>,
    node_name: &str,
) -> Result<Json> {
    // `file://host/path` keeps its host in the reported URI; a hostless
    // `file:///path` is rewritten with the local node name
    let (host, path) = match rest.strip_prefix('/') {
        Some(path) => (node_name.to_string(), format!("/{path}")),
        None => {
            let (host, path) = rest
                .split_once('/')
                .ok_or_else(|| BasaltError::IllegalArgument(format!("bad file URL: {}", spec.url)))?;
            (host.to_string(), format!("/{path}"))
        }
    };

    let mut path = if path.contains(LOCAL_TEMP) {
        let temp = std::env::temp_dir().join(format!("basalt-forward-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&temp)?;
        path.replace(LOCAL_TEMP, &temp.to_string_lossy())
    } else {
        path
    };
    if spec.bool_opt("localPostProcessing") {
        // per-worker suffix avoids collisions when every node writes
        path = format!("{path}.{node_name}");
    }

    if let Some(parent) = PathBuf::from(&path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(&path)?;
    let mut writer = CountingWriter {
        inner: std::io::BufWriter::new(file),
        bytes: 0,
    };

    let format = spec.str_opt("format").unwrap_or("json").to_string();
    let (row_count, type_string) = match format.as_str() {
        "json" => write_json(spec, rows, &mut writer)?,
        "csv" => write_delimited(spec, rows, &mut writer, b',')?,
        "tsv" => write_delimited(spec, rows, &mut writer, b'\t')?,
        "excel" | "orc" | "index" => {
            return Err(BasaltError::IllegalArgument(format!(
                "forward format {format} is not supported on this node"
            )))
        }
        other => {
            return Err(BasaltError::IllegalArgument(format!(
                "unknown forward format: {other}"
            )))
        }
    };
    writer.flush()?;

    let uri = format!("file://{host}{path}");
    Ok(json!({
        "rowCount": row_count,
        "typeString": type_string,
        "data": { uri: writer.bytes }
    }))
}

fn write_json(
    spec: &ForwardSpec,
    rows: Sequence<Json>,
    writer: &mut impl Write,
) -> Result<(u64, String)> {
    let wrap_as_list = spec.bool_opt("wrapAsList");
    let mut count = 0u64;
    let mut type_string = String::new();
    if wrap_as_list {
        writer.write_all(b"[")?;
    }
    for row in rows {
        let row = row?;
        if count == 0 {
            type_string = derive_type_string(&row);
        } else if wrap_as_list {
            writer.write_all(b",")?;
        } else {
            writer.write_all(b"\n")?;
        }
        serde_json::to_writer(&mut *writer, &row)?;
        count += 1;
    }
    if wrap_as_list {
        writer.write_all(b"]")?;
    } else if count > 0 {
        writer.write_all(b"\n")?;
    }
    Ok((count, type_string))
}

fn write_delimited(
    spec: &ForwardSpec,
    rows: Sequence<Json>,
    writer: &mut impl Write,
    delimiter: u8,
) -> Result<(u64, String)> {
    let null_value = spec.str_opt("nullValue").unwrap_or("").to_string();
    let with_header = spec.bool_opt("withHeader");
    let explicit_columns: Option<Vec<String>> = spec
        .context
        .get("columns")
        .and_then(Json::as_array)
        .map(|cols| {
            cols.iter()
                .filter_map(Json::as_str)
                .map(|s| s.to_string())
                .collect()
        });

    let mut csv_writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(writer);
    let mut columns = explicit_columns;
    let mut count = 0u64;
    for row in rows {
        let row = row?;
        let flat = flatten_row(&row);
        if columns.is_none() {
            let mut names: Vec<String> = flat.keys().cloned().collect();
            names.sort();
            columns = Some(names);
        }
        let cols = columns.as_ref().expect("columns set");
        if count == 0 && with_header {
            csv_writer
                .write_record(cols)
                .map_err(|e| BasaltError::Internal(format!("csv write: {e}")))?;
        }
        let record: Vec<String> = cols
            .iter()
            .map(|c| match flat.get(c) {
                None | Some(Json::Null) => null_value.clone(),
                Some(Json::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            })
            .collect();
        csv_writer
            .write_record(&record)
            .map_err(|e| BasaltError::Internal(format!("csv write: {e}")))?;
        count += 1;
    }
    csv_writer
        .flush()
        .map_err(|e| BasaltError::Internal(format!("csv flush: {e}")))?;
    let type_string = columns.map(|c| c.join(",")).unwrap_or_default();
    Ok((count, type_string))
}

/// Merge the row's payload object (`result` or `event`) with its scalars.
fn flatten_row(row: &Json) -> serde_json::Map<String, Json> {
    let mut out = serde_json::Map::new();
    if let Some(obj) = row.as_object() {
        for (k, v) in obj {
            match v {
                Json::Object(inner) if k == "result" || k == "event" => {
                    for (ik, iv) in inner {
                        out.insert(ik.clone(), iv.clone());
                    }
                }
                other => {
                    out.insert(k.clone(), other.clone());
                }
            }
        }
    }
    out
}

fn derive_type_string(row: &Json) -> String {
    let flat = flatten_row(row);
    let mut names: Vec<String> = flat.keys().cloned().collect();
    names.sort();
    names.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Sequence<Json> {
        Sequence::from_vec(vec![
            json!({"timestamp": "2020-01-01T00:00:00Z", "result": {"c": 2}}),
            json!({"timestamp": "2020-01-01T00:01:00Z", "result": {"c": 1}}),
        ])
    }

    /// Spec scenario S5: file-forwarded JSON list with row count and byte
    /// count keyed by URI.
    #[test]
    fn test_forward_json_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let url = format!("file://{}", path.display());
        let spec = ForwardSpec {
            url: url.clone(),
            context: [("wrapAsList".to_string(), json!(true))].into_iter().collect(),
        };
        let meta = forward_results(&spec, rows(), "node-1").unwrap();
        assert_eq!(meta["rowCount"], json!(2));

        let written = std::fs::read_to_string(&path).unwrap();
        let parsed: Json = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);

        let reported_uri = format!("file://node-1{}", path.display());
        let bytes = meta["data"][&reported_uri].as_u64().unwrap();
        assert_eq!(bytes, written.len() as u64);
    }

    #[test]
    fn test_forward_csv_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let spec = ForwardSpec {
            url: format!("file://{}", path.display()),
            context: [
                ("format".to_string(), json!("csv")),
                ("withHeader".to_string(), json!(true)),
            ]
            .into_iter()
            .collect(),
        };
        let meta = forward_results(&spec, rows(), "node-1").unwrap();
        assert_eq!(meta["rowCount"], json!(2));
        let written = std::fs::read_to_string(&path).unwrap();
        let mut lines = written.lines();
        assert_eq!(lines.next(), Some("c,timestamp"));
        assert_eq!(lines.next(), Some("2,2020-01-01T00:00:00Z"));
    }

    #[test]
    fn test_local_temp_replacement() {
        let spec = ForwardSpec {
            url: format!("file:///{LOCAL_TEMP}/out.json"),
            context: HashMap::new(),
        };
        let meta = forward_results(&spec, rows(), "node-1").unwrap();
        assert_eq!(meta["rowCount"], json!(2));
        let data = meta["data"].as_object().unwrap();
        let uri = data.keys().next().unwrap();
        assert!(!uri.contains(LOCAL_TEMP));
    }

    #[test]
    fn test_null_sink_discards() {
        let spec = ForwardSpec {
            url: "null://".to_string(),
            context: HashMap::new(),
        };
        let meta = forward_results(&spec, rows(), "node-1").unwrap();
        assert_eq!(meta["rowCount"], json!(2));
    }

    #[test]
    fn test_unsupported_formats_named() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ForwardSpec {
            url: format!("file://{}/out.xlsx", dir.path().display()),
            context: [("format".to_string(), json!("excel"))].into_iter().collect(),
        };
        assert!(matches!(
            forward_results(&spec, rows(), "node-1"),
            Err(BasaltError::IllegalArgument(_))
        ));
    }
}
