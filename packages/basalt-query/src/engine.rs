//! Per-segment execution: a cursor walk per granularity bucket feeding
//! aggregators, one engine per query kind.

use std::collections::BTreeMap;
use std::sync::Arc;

use basalt_agg::{AggState, Aggregator, AggregatorSpec};
use basalt_core::{
    BasaltError, ColumnSelectorFactory, DimensionSelector, DoubleColumnSelector,
    FloatColumnSelector, LongColumnSelector, ObjectColumnSelector, QueryCancel, Result, Scalar,
    ValueDesc, TIME_COLUMN,
};
use basalt_storage::{Cursor, ScanSpec, StorageAdapter, VirtualColumns};

use crate::query::Query;
use crate::result::{
    CompactRow, ResultItem, SearchHit, SegmentAnalysis, SelectBatch, SelectEvent,
};

/// Run one query against one adapter (one segment or the incremental index).
/// `segment_label` names the segment in paging identifiers and metadata.
pub fn run_engine(
    query: &Query,
    adapter: &dyn StorageAdapter,
    segment_label: &str,
    cancel: QueryCancel,
) -> Result<Vec<ResultItem>> {
    let virtuals = Arc::new(VirtualColumns::compile(query.virtual_column_specs())?);
    match query {
        Query::Timeseries(q) => timeseries(q, adapter, virtuals, cancel),
        Query::TopN(q) => topn(q, adapter, virtuals, cancel),
        Query::GroupBy(q) => groupby(q, adapter, virtuals, cancel),
        Query::Select(q) => select(q, adapter, virtuals, segment_label, cancel),
        Query::Search(q) => search(q, adapter, virtuals, cancel),
        Query::SegmentMetadata(q) => metadata(q, adapter, segment_label),
    }
}

/// Bridges a cursor to the selector-factory seam aggregator factories bind
/// against.
struct CursorFactory<'a>(&'a dyn Cursor);

impl ColumnSelectorFactory for CursorFactory<'_> {
    fn dimension_selector(&self, name: &str) -> Result<Box<dyn DimensionSelector>> {
        self.0.dimension_selector(name)
    }

    fn float_selector(&self, name: &str) -> Result<Box<dyn FloatColumnSelector>> {
        self.0.float_selector(name)
    }

    fn long_selector(&self, name: &str) -> Result<Box<dyn LongColumnSelector>> {
        self.0.long_selector(name)
    }

    fn double_selector(&self, name: &str) -> Result<Box<dyn DoubleColumnSelector>> {
        self.0.double_selector(name)
    }

    fn object_selector(&self, name: &str) -> Result<Box<dyn ObjectColumnSelector>> {
        self.0.object_selector(name)
    }

    fn column_type(&self, name: &str) -> Option<ValueDesc> {
        self.0.column_type(name)
    }
}

fn create_aggs(
    specs: &[AggregatorSpec],
    cursor: &dyn Cursor,
) -> Result<Vec<Box<dyn Aggregator>>> {
    let factory = CursorFactory(cursor);
    specs.iter().map(|s| s.create(&factory)).collect()
}

fn drain_states(aggs: Vec<Box<dyn Aggregator>>) -> Vec<AggState> {
    aggs.into_iter()
        .map(|mut a| {
            let state = a.get();
            a.close();
            state
        })
        .collect()
}

/// Current grouping values of a column, resolving virtual columns.
fn grouping_values(
    cursor: &dyn Cursor,
    virtuals: &VirtualColumns,
    name: &str,
) -> Result<Vec<String>> {
    if cursor.has_column(name) {
        let mut values = cursor.dim_values(name);
        if values.is_empty() {
            values.push(String::new());
        }
        return Ok(values);
    }
    Ok(match virtuals.resolve(cursor, name)? {
        Scalar::Null => vec![String::new()],
        Scalar::Array(items) => items
            .into_iter()
            .map(|v| match v {
                Scalar::String(s) => s,
                other => other.to_json().to_string(),
            })
            .collect(),
        Scalar::String(s) => vec![s],
        other => vec![other.to_json().to_string()],
    })
}

fn scan_spec(
    filter: Option<basalt_storage::DimFilter>,
    interval: basalt_core::Interval,
    virtuals: &Arc<VirtualColumns>,
    granularity: basalt_core::Granularity,
    descending: bool,
    cancel: &QueryCancel,
) -> ScanSpec {
    ScanSpec {
        filter,
        interval,
        virtual_columns: Arc::clone(virtuals),
        granularity,
        descending,
        cancel: cancel.clone(),
    }
}

fn timeseries(
    q: &crate::query::TimeseriesQuery,
    adapter: &dyn StorageAdapter,
    virtuals: Arc<VirtualColumns>,
    cancel: QueryCancel,
) -> Result<Vec<ResultItem>> {
    let mut out = Vec::new();
    for interval in &q.intervals {
        let cursors = adapter.make_cursors(scan_spec(
            q.filter.clone(),
            *interval,
            &virtuals,
            q.granularity,
            q.descending,
            &cancel,
        ))?;
        for cursor in cursors {
            let mut cursor = cursor?;
            if cursor.is_done() {
                // empty buckets are skipped, not zero-filled
                continue;
            }
            let mut aggs = create_aggs(&q.aggregations, cursor.as_ref())?;
            while !cursor.is_done() {
                for agg in aggs.iter_mut() {
                    agg.aggregate()?;
                }
                cursor.advance()?;
            }
            out.push(ResultItem::Row(CompactRow::new(
                cursor.time(),
                Vec::new(),
                drain_states(aggs),
            )));
        }
    }
    Ok(out)
}

/// Per-value aggregation; the threshold cut happens after the broker merge,
/// so each segment reports every group it saw.
fn topn(
    q: &crate::query::TopNQuery,
    adapter: &dyn StorageAdapter,
    virtuals: Arc<VirtualColumns>,
    cancel: QueryCancel,
) -> Result<Vec<ResultItem>> {
    let mut out = Vec::new();
    for interval in &q.intervals {
        let cursors = adapter.make_cursors(scan_spec(
            q.filter.clone(),
            *interval,
            &virtuals,
            q.granularity,
            false,
            &cancel,
        ))?;
        for cursor in cursors {
            let mut cursor = cursor?;
            let mut groups: BTreeMap<String, Vec<Box<dyn Aggregator>>> = BTreeMap::new();
            while !cursor.is_done() {
                for value in grouping_values(cursor.as_ref(), &virtuals, &q.dimension)? {
                    if !groups.contains_key(&value) {
                        let aggs = create_aggs(&q.aggregations, cursor.as_ref())?;
                        groups.insert(value.clone(), aggs);
                    }
                    for agg in groups.get_mut(&value).expect("just inserted").iter_mut() {
                        agg.aggregate()?;
                    }
                }
                cursor.advance()?;
            }
            let ts = cursor.time();
            for (value, aggs) in groups {
                out.push(ResultItem::Row(CompactRow::new(
                    ts,
                    vec![value],
                    drain_states(aggs),
                )));
            }
        }
    }
    Ok(out)
}

const MAX_GROUP_COMBINATIONS: usize = 1024;

fn groupby(
    q: &crate::query::GroupByQuery,
    adapter: &dyn StorageAdapter,
    virtuals: Arc<VirtualColumns>,
    cancel: QueryCancel,
) -> Result<Vec<ResultItem>> {
    let mut out = Vec::new();
    for interval in &q.intervals {
        let cursors = adapter.make_cursors(scan_spec(
            q.filter.clone(),
            *interval,
            &virtuals,
            q.granularity,
            false,
            &cancel,
        ))?;
        for cursor in cursors {
            let mut cursor = cursor?;
            let mut groups: BTreeMap<Vec<String>, Vec<Box<dyn Aggregator>>> = BTreeMap::new();
            while !cursor.is_done() {
                // multi-value dimensions explode into the cartesian product
                let mut combos: Vec<Vec<String>> = vec![Vec::new()];
                for dim in &q.dimensions {
                    let values = grouping_values(cursor.as_ref(), &virtuals, dim)?;
                    let mut next =
                        Vec::with_capacity(combos.len().saturating_mul(values.len()));
                    for combo in &combos {
                        for v in &values {
                            let mut c = combo.clone();
                            c.push(v.clone());
                            next.push(c);
                        }
                    }
                    if next.len() > MAX_GROUP_COMBINATIONS {
                        return Err(BasaltError::ResourceExhausted(format!(
                            "group-by row explodes into more than {MAX_GROUP_COMBINATIONS} combinations"
                        )));
                    }
                    combos = next;
                }
                for combo in combos {
                    if !groups.contains_key(&combo) {
                        let aggs = create_aggs(&q.aggregations, cursor.as_ref())?;
                        groups.insert(combo.clone(), aggs);
                    }
                    for agg in groups.get_mut(&combo).expect("just inserted").iter_mut() {
                        agg.aggregate()?;
                    }
                }
                cursor.advance()?;
            }
            let ts = cursor.time();
            for (dims, aggs) in groups {
                out.push(ResultItem::Row(CompactRow::new(ts, dims, drain_states(aggs))));
            }
        }
    }
    Ok(out)
}

fn select(
    q: &crate::query::SelectQuery,
    adapter: &dyn StorageAdapter,
    virtuals: Arc<VirtualColumns>,
    segment_label: &str,
    cancel: QueryCancel,
) -> Result<Vec<ResultItem>> {
    let skip = q
        .paging
        .identifiers
        .get(segment_label)
        .copied()
        .unwrap_or(0);
    let dims = if q.dimensions.is_empty() {
        adapter.dimension_names()
    } else {
        q.dimensions.clone()
    };
    let metrics: Vec<String> = if q.metrics.is_empty() {
        adapter
            .metric_specs()
            .iter()
            .map(|m| m.output_name().to_string())
            .collect()
    } else {
        q.metrics.clone()
    };

    let mut batch = SelectBatch::default();
    let mut offset = 0u64;
    'outer: for interval in &q.intervals {
        let cursors = adapter.make_cursors(scan_spec(
            q.filter.clone(),
            *interval,
            &virtuals,
            q.granularity,
            q.descending,
            &cancel,
        ))?;
        for cursor in cursors {
            let mut cursor = cursor?;
            while !cursor.is_done() {
                if offset >= skip {
                    let mut event = std::collections::HashMap::new();
                    for d in &dims {
                        let values = grouping_values(cursor.as_ref(), &virtuals, d)?;
                        let json = if values.len() == 1 {
                            serde_json::json!(values[0])
                        } else {
                            serde_json::json!(values)
                        };
                        event.insert(d.clone(), json);
                    }
                    for m in &metrics {
                        event.insert(m.clone(), cursor.scalar(m).to_json());
                    }
                    batch.events.push(SelectEvent {
                        segment_id: segment_label.to_string(),
                        offset,
                        timestamp: cursor.timestamp(),
                        event,
                    });
                    if batch.events.len() >= q.paging.threshold {
                        offset += 1;
                        break 'outer;
                    }
                }
                offset += 1;
                cursor.advance()?;
            }
        }
    }
    batch
        .paging_identifiers
        .insert(segment_label.to_string(), offset);
    Ok(vec![ResultItem::Select(batch)])
}

fn search(
    q: &crate::query::SearchQuery,
    adapter: &dyn StorageAdapter,
    virtuals: Arc<VirtualColumns>,
    cancel: QueryCancel,
) -> Result<Vec<ResultItem>> {
    let needle = q.query.to_lowercase();
    let dims = if q.search_dimensions.is_empty() {
        adapter.dimension_names()
    } else {
        q.search_dimensions.clone()
    };
    let mut hits: BTreeMap<(i64, String, String), u64> = BTreeMap::new();
    for interval in &q.intervals {
        let cursors = adapter.make_cursors(scan_spec(
            q.filter.clone(),
            *interval,
            &virtuals,
            q.granularity,
            false,
            &cancel,
        ))?;
        for cursor in cursors {
            let mut cursor = cursor?;
            let ts = cursor.time();
            while !cursor.is_done() {
                for dim in &dims {
                    for value in grouping_values(cursor.as_ref(), &virtuals, dim)? {
                        if value.to_lowercase().contains(&needle) {
                            *hits.entry((ts, dim.clone(), value)).or_insert(0) += 1;
                        }
                    }
                }
                cursor.advance()?;
            }
        }
    }
    Ok(hits
        .into_iter()
        .take(q.limit)
        .map(|((timestamp, dimension, value), count)| {
            ResultItem::Search(SearchHit {
                timestamp,
                dimension,
                value,
                count,
            })
        })
        .collect())
}

fn metadata(
    q: &crate::query::SegmentMetadataQuery,
    adapter: &dyn StorageAdapter,
    segment_label: &str,
) -> Result<Vec<ResultItem>> {
    let wants = |analysis: &str| {
        q.analysis_types.is_empty() || q.analysis_types.iter().any(|a| a == analysis)
    };
    let mut columns = std::collections::HashMap::new();
    let mut names = vec![TIME_COLUMN.to_string()];
    names.extend(adapter.dimension_names());
    names.extend(
        adapter
            .metric_specs()
            .iter()
            .map(|m| m.output_name().to_string()),
    );
    let mut total_size = 0u64;
    for name in names {
        let analysis = if name == TIME_COLUMN {
            basalt_storage::ColumnAnalysis {
                value_type: ValueDesc::Long,
                size: adapter.num_rows() * 8,
                cardinality: None,
                min_value: None,
                max_value: None,
                null_count: 0,
                error_message: None,
            }
        } else {
            match adapter.column_analysis(&name) {
                Ok(a) => a,
                Err(e) => basalt_storage::ColumnAnalysis {
                    value_type: ValueDesc::String,
                    size: 0,
                    cardinality: None,
                    min_value: None,
                    max_value: None,
                    null_count: 0,
                    error_message: Some(e.to_string()),
                },
            }
        };
        total_size += analysis.size;
        columns.insert(name, analysis);
    }
    Ok(vec![ResultItem::Metadata(SegmentAnalysis {
        id: segment_label.to_string(),
        interval: adapter.data_interval(),
        columns,
        aggregators: wants("aggregators").then(|| adapter.metric_specs()),
        query_granularity: wants("queryGranularity").then(|| adapter.query_granularity()),
        rollup: adapter.rollup(),
        num_rows: adapter.num_rows(),
        ingested_rows: adapter.ingested_rows(),
        last_access_time: None,
        size: total_size,
    })])
}
