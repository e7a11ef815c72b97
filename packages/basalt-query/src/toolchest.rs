//! Per-kind merge and render behavior.
//!
//! `merge_items` combines sorted partial streams (from segments or remote
//! nodes) with the aggregation binary fn mutating the left row in place at
//! each aggregator's fixed column offset. `render` turns merged internal
//! items into the client-facing JSON rows.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use serde_json::{json, Value as Json};

use basalt_agg::{AggState, AggregatorSpec, PostAggregatorSpec};
use basalt_core::{format_timestamp, BasaltError, Result, Scalar};
use basalt_expr::NumericBinding;

use crate::query::Query;
use crate::result::{CompactRow, ResultItem, SearchHit, SelectBatch};

/// Ordering of merged rows: time (query direction), then grouping values.
pub fn result_ordering(descending: bool, num_dims: usize) -> impl Fn(&CompactRow, &CompactRow) -> Ordering {
    move |a, b| {
        let ta = a.timestamp();
        let tb = b.timestamp();
        let time = if descending { tb.cmp(&ta) } else { ta.cmp(&tb) };
        time.then_with(|| a.dims(num_dims).cmp(&b.dims(num_dims)))
    }
}

/// Merge sorted partial result streams into one.
pub fn merge_items(query: &Query, inputs: Vec<Vec<ResultItem>>) -> Result<Vec<ResultItem>> {
    match query {
        Query::Timeseries(_) | Query::TopN(_) | Query::GroupBy(_) => merge_rows(query, inputs),
        Query::Select(q) => merge_select(q, inputs),
        Query::Search(_) => merge_search(inputs),
        Query::SegmentMetadata(_) => Ok(inputs.into_iter().flatten().collect()),
    }
}

fn merge_rows(query: &Query, inputs: Vec<Vec<ResultItem>>) -> Result<Vec<ResultItem>> {
    let num_dims = query.dimensions().len();
    let specs = query.aggregations();
    let ordering = result_ordering(query.descending(), num_dims);

    // pass-through for bySegment blocks
    let mut passthrough = Vec::new();
    let mut streams: Vec<std::vec::IntoIter<ResultItem>> = Vec::new();
    for input in inputs {
        let (rows, other): (Vec<_>, Vec<_>) = input
            .into_iter()
            .partition(|i| matches!(i, ResultItem::Row(_)));
        passthrough.extend(other);
        streams.push(rows.into_iter());
    }

    // bounded k-way merge over the sorted inputs
    let mut heads: Vec<Option<CompactRow>> = streams
        .iter_mut()
        .map(|s| s.next().and_then(ResultItem::into_row))
        .collect();
    let mut out: Vec<CompactRow> = Vec::new();
    loop {
        let mut best: Option<usize> = None;
        for (i, head) in heads.iter().enumerate() {
            let Some(row) = head else { continue };
            best = match best {
                None => Some(i),
                Some(j) => {
                    let current = heads[j].as_ref().expect("non-empty head");
                    if ordering(row, current) == Ordering::Less {
                        Some(i)
                    } else {
                        Some(j)
                    }
                }
            };
        }
        let Some(i) = best else { break };
        let row = heads[i].take().expect("selected head");
        heads[i] = streams[i].next().and_then(ResultItem::into_row);

        match out.last_mut() {
            Some(last) if last.group_key(num_dims) == row.group_key(num_dims) => {
                combine_into(last, row, specs, num_dims)?;
            }
            _ => out.push(row),
        }
    }

    let mut items: Vec<ResultItem> = out.into_iter().map(ResultItem::Row).collect();
    items.extend(passthrough);
    Ok(items)
}

/// The aggregation binary fn: fold `right` into `left` at each aggregator's
/// fixed offset, avoiding row reallocation in the merge loop.
fn combine_into(
    left: &mut CompactRow,
    mut right: CompactRow,
    specs: &[AggregatorSpec],
    num_dims: usize,
) -> Result<()> {
    for (i, spec) in specs.iter().enumerate() {
        let a = std::mem::replace(left.agg_mut(num_dims, i), AggState::Null);
        let b = std::mem::replace(right.agg_mut(num_dims, i), AggState::Null);
        *left.agg_mut(num_dims, i) = spec.combine(a, b)?;
    }
    Ok(())
}

fn merge_select(
    q: &crate::query::SelectQuery,
    inputs: Vec<Vec<ResultItem>>,
) -> Result<Vec<ResultItem>> {
    let mut merged = SelectBatch::default();
    for item in inputs.into_iter().flatten() {
        match item {
            ResultItem::Select(batch) => {
                for (segment, offset) in batch.paging_identifiers {
                    let entry = merged.paging_identifiers.entry(segment).or_insert(0);
                    *entry = (*entry).max(offset);
                }
                merged.events.extend(batch.events);
            }
            other => return Ok(vec![other]),
        }
    }
    if q.descending {
        merged.events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    } else {
        merged.events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    }
    merged.events.truncate(q.paging.threshold);
    Ok(vec![ResultItem::Select(merged)])
}

fn merge_search(inputs: Vec<Vec<ResultItem>>) -> Result<Vec<ResultItem>> {
    let mut counts: BTreeMap<(i64, String, String), u64> = BTreeMap::new();
    let mut passthrough = Vec::new();
    for item in inputs.into_iter().flatten() {
        match item {
            ResultItem::Search(hit) => {
                *counts
                    .entry((hit.timestamp, hit.dimension, hit.value))
                    .or_insert(0) += hit.count;
            }
            other => passthrough.push(other),
        }
    }
    let mut out: Vec<ResultItem> = counts
        .into_iter()
        .map(|((timestamp, dimension, value), count)| {
            ResultItem::Search(SearchHit {
                timestamp,
                dimension,
                value,
                count,
            })
        })
        .collect();
    out.extend(passthrough);
    Ok(out)
}

// ---- rendering ----

fn state_json(spec: &AggregatorSpec, state: &AggState, finalize: bool) -> Json {
    if finalize {
        spec.finalize_json(state)
    } else {
        match state {
            AggState::Null => Json::Null,
            AggState::Long(v) => json!(v),
            AggState::Double(v) => json!(v),
            AggState::Float(v) => json!(v),
            AggState::Value(v) => v.to_json(),
            other => Scalar::Complex {
                name: spec.intermediate_type().type_name(),
                data: other.to_bytes().unwrap_or_default(),
            }
            .to_json(),
        }
    }
}

fn metric_map(
    row: &CompactRow,
    specs: &[AggregatorSpec],
    post: &[PostAggregatorSpec],
    num_dims: usize,
    finalize: bool,
) -> Result<serde_json::Map<String, Json>> {
    let mut states: HashMap<String, AggState> = HashMap::new();
    for (i, spec) in specs.iter().enumerate() {
        states.insert(spec.output_name().to_string(), row.agg(num_dims, i).clone());
    }
    let mut out = serde_json::Map::new();
    for (i, spec) in specs.iter().enumerate() {
        out.insert(
            spec.output_name().to_string(),
            state_json(spec, row.agg(num_dims, i), finalize),
        );
    }
    for p in post {
        out.insert(p.output_name().to_string(), p.compute(&states)?.to_json());
    }
    Ok(out)
}

struct EventBinding<'a>(&'a serde_json::Map<String, Json>);

impl NumericBinding for EventBinding<'_> {
    fn get(&self, name: &str) -> Scalar {
        self.0.get(name).map(Scalar::from_json).unwrap_or(Scalar::Null)
    }
}

/// Render merged items into client-facing JSON rows.
pub fn render(query: &Query, items: Vec<ResultItem>) -> Result<Vec<Json>> {
    if items
        .iter()
        .any(|i| matches!(i, ResultItem::BySegment { .. }))
    {
        return items
            .into_iter()
            .map(|i| render_passthrough(query, i))
            .collect();
    }
    let finalize = query.context().finalize();
    match query {
        Query::Timeseries(q) => items
            .into_iter()
            .map(|item| {
                let row = expect_row(item)?;
                let result = metric_map(&row, &q.aggregations, &q.post_aggregations, 0, finalize)?;
                Ok(json!({
                    "timestamp": format_timestamp(row.timestamp()),
                    "result": result,
                }))
            })
            .collect(),
        Query::TopN(q) => {
            let mut buckets: BTreeMap<i64, Vec<Json>> = BTreeMap::new();
            let mut entries: BTreeMap<i64, Vec<(f64, Json)>> = BTreeMap::new();
            for item in items {
                let row = expect_row(item)?;
                let mut event =
                    metric_map(&row, &q.aggregations, &q.post_aggregations, 1, finalize)?;
                event.insert(q.dimension.clone(), json!(row.dims(1)[0]));
                let sort_key = event
                    .get(&q.metric)
                    .and_then(Json::as_f64)
                    .unwrap_or(f64::NEG_INFINITY);
                entries
                    .entry(row.timestamp())
                    .or_default()
                    .push((sort_key, Json::Object(event)));
            }
            for (ts, mut rows) in entries {
                rows.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
                buckets.insert(
                    ts,
                    rows.into_iter()
                        .take(q.threshold)
                        .map(|(_, e)| e)
                        .collect(),
                );
            }
            Ok(buckets
                .into_iter()
                .map(|(ts, rows)| {
                    json!({
                        "timestamp": format_timestamp(ts),
                        "result": rows,
                    })
                })
                .collect())
        }
        Query::GroupBy(q) => {
            let having = q
                .having
                .as_ref()
                .map(|h| basalt_expr::parse(h))
                .transpose()?;
            let mut out = Vec::new();
            for item in items {
                let row = expect_row(item)?;
                let num_dims = q.dimensions.len();
                let mut event =
                    metric_map(&row, &q.aggregations, &q.post_aggregations, num_dims, finalize)?;
                for (dim, value) in q.dimensions.iter().zip(row.dims(num_dims)) {
                    event.insert(dim.clone(), json!(value));
                }
                if let Some(h) = &having {
                    if !h.eval(&EventBinding(&event))?.truthy() {
                        continue;
                    }
                }
                out.push(json!({
                    "version": "v1",
                    "timestamp": format_timestamp(row.timestamp()),
                    "event": event,
                }));
                if let Some(limit) = q.limit {
                    if out.len() >= limit {
                        break;
                    }
                }
            }
            Ok(out)
        }
        Query::Select(_) => items
            .into_iter()
            .map(|item| match item {
                ResultItem::Select(batch) => {
                    let ts = batch.events.first().map(|e| e.timestamp).unwrap_or(0);
                    Ok(json!({
                        "timestamp": format_timestamp(ts),
                        "result": batch,
                    }))
                }
                other => render_passthrough(query, other),
            })
            .collect(),
        Query::Search(_) => {
            let mut buckets: BTreeMap<i64, Vec<Json>> = BTreeMap::new();
            for item in items {
                match item {
                    ResultItem::Search(hit) => {
                        buckets.entry(hit.timestamp).or_default().push(json!({
                            "dimension": hit.dimension,
                            "value": hit.value,
                            "count": hit.count,
                        }));
                    }
                    other => return Ok(vec![render_passthrough(query, other)?]),
                }
            }
            Ok(buckets
                .into_iter()
                .map(|(ts, hits)| {
                    json!({
                        "timestamp": format_timestamp(ts),
                        "result": hits,
                    })
                })
                .collect())
        }
        Query::SegmentMetadata(_) => items
            .into_iter()
            .map(|item| match item {
                ResultItem::Metadata(analysis) => {
                    serde_json::to_value(analysis).map_err(Into::into)
                }
                other => render_passthrough(query, other),
            })
            .collect(),
    }
}

fn expect_row(item: ResultItem) -> Result<CompactRow> {
    item.into_row()
        .ok_or_else(|| BasaltError::Internal("expected a compact row".into()))
}

/// bySegment envelopes render their inner block with the same query.
fn render_passthrough(query: &Query, item: ResultItem) -> Result<Json> {
    match item {
        ResultItem::BySegment {
            segment_id,
            interval,
            results,
        } => {
            let inner = render(query, results)?;
            Ok(json!({
                "timestamp": format_timestamp(interval.start),
                "result": {
                    "segment": segment_id,
                    "interval": interval.to_string(),
                    "results": inner,
                }
            }))
        }
        other => Err(BasaltError::Internal(format!(
            "unexpected item for this query kind: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn timeseries_query() -> Query {
        serde_json::from_value(json!({
            "queryType": "timeseries",
            "dataSource": "events",
            "intervals": ["2020-01-01/P1D"],
            "granularity": "MINUTE",
            "aggregations": [{"type": "count", "name": "c"}]
        }))
        .unwrap()
    }

    #[test]
    fn test_merge_combines_equal_buckets() {
        let q = timeseries_query();
        let a = vec![ResultItem::Row(CompactRow::new(0, vec![], vec![AggState::Long(2)]))];
        let b = vec![
            ResultItem::Row(CompactRow::new(0, vec![], vec![AggState::Long(3)])),
            ResultItem::Row(CompactRow::new(60_000, vec![], vec![AggState::Long(1)])),
        ];
        let merged = merge_items(&q, vec![a, b]).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].as_row().unwrap().agg(0, 0), &AggState::Long(5));
        assert_eq!(merged[1].as_row().unwrap().agg(0, 0), &AggState::Long(1));
    }

    #[test]
    fn test_render_timeseries_shape() {
        let q = timeseries_query();
        let items = vec![ResultItem::Row(CompactRow::new(
            1_577_836_800_000,
            vec![],
            vec![AggState::Long(2)],
        ))];
        let rows = render(&q, items).unwrap();
        assert_eq!(
            rows[0],
            json!({"timestamp": "2020-01-01T00:00:00Z", "result": {"c": 2}})
        );
    }

    #[test]
    fn test_merge_rows_keeps_sort_order() {
        let q = timeseries_query();
        let a = vec![
            ResultItem::Row(CompactRow::new(60_000, vec![], vec![AggState::Long(1)])),
            ResultItem::Row(CompactRow::new(180_000, vec![], vec![AggState::Long(1)])),
        ];
        let b = vec![ResultItem::Row(CompactRow::new(
            120_000,
            vec![],
            vec![AggState::Long(1)],
        ))];
        let merged = merge_items(&q, vec![a, b]).unwrap();
        let times: Vec<i64> = merged
            .iter()
            .map(|i| i.as_row().unwrap().timestamp())
            .collect();
        assert_eq!(times, vec![60_000, 120_000, 180_000]);
    }
}
