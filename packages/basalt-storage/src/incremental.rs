//! Append-only in-memory index for recent (unpersisted) data.
//!
//! Rows are keyed by `(granularity-truncated timestamp, dim id vectors)`;
//! equal keys roll up into one aggregator slot. Single writer, many readers:
//! `add` takes the write lock, cursors snapshot matching rows under the read
//! lock and read metric state through short read locks afterwards.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use basalt_agg::{AggState, Aggregator, AggregatorSpec, BufferAggregator};
use basalt_core::{
    BasaltError, ColumnSelectorFactory, DimensionSelector, DoubleColumnSelector,
    FloatColumnSelector, Granularity, IndexedInts, LongColumnSelector, ObjectColumnSelector,
    Result, Row, Scalar, ValueDesc, TIME_COLUMN,
};

use crate::dictionary::DimDict;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSchema {
    pub dimensions: Vec<String>,
    pub metrics: Vec<AggregatorSpec>,
    #[serde(default = "default_granularity")]
    pub granularity: Granularity,
    #[serde(default = "default_true")]
    pub rollup: bool,
    #[serde(rename = "maxRowCount", default = "default_max_rows")]
    pub max_row_count: usize,
    /// Keep aggregator state in a slab of fixed-size cells instead of boxed
    /// objects; falls back to heap when a metric family has no buffer form.
    #[serde(rename = "offHeap", default)]
    pub off_heap: bool,
}

fn default_granularity() -> Granularity {
    Granularity::None
}

fn default_true() -> bool {
    true
}

fn default_max_rows() -> usize {
    500_000
}

/// Rollup key: truncated timestamp plus sorted dim id vectors. `dedup` keeps
/// keys distinct when rollup is off.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexKey {
    pub timestamp: i64,
    pub dims: Vec<IndexedInts>,
    pub dedup: u64,
}

pub(crate) struct RowSlot {
    pub key: IndexKey,
    /// Empty in off-heap mode.
    pub aggs: Vec<Box<dyn Aggregator>>,
}

pub(crate) struct BufferState {
    pub slab: Vec<u8>,
    pub aggs: Vec<Box<dyn BufferAggregator>>,
    /// Offset of each metric's span within a cell.
    pub offsets: Vec<usize>,
    pub cell: usize,
}

pub(crate) struct Inner {
    pub dicts: Vec<DimDict>,
    pub facts: BTreeMap<IndexKey, usize>,
    pub rows: Vec<RowSlot>,
    pub buffer: Option<BufferState>,
    pub min_time: i64,
    pub max_time: i64,
}

/// The row currently being ingested; selectors bound at aggregator creation
/// read through this slot.
struct BoundRow {
    row: Row,
    bucket_ts: i64,
}

type CurrentRow = Arc<RwLock<Option<BoundRow>>>;

pub struct IncrementalIndex {
    schema: IndexSchema,
    inner: RwLock<Inner>,
    current: CurrentRow,
    ingested: AtomicU64,
    max_ingested_event_time: AtomicI64,
}

impl IncrementalIndex {
    pub fn new(schema: IndexSchema) -> Result<IncrementalIndex> {
        for spec in &schema.metrics {
            // fail fast on malformed expression aggregators and friends
            let _ = spec.output_name();
        }
        let current: CurrentRow = Arc::new(RwLock::new(None));
        let factory = RowBindingFactory {
            current: Arc::clone(&current),
        };

        let buffer = if schema.off_heap {
            let mut aggs = Vec::with_capacity(schema.metrics.len());
            let mut offsets = Vec::with_capacity(schema.metrics.len());
            let mut cell = 0usize;
            let mut all_supported = true;
            for spec in &schema.metrics {
                match spec.create_buffer(&factory)? {
                    Some(agg) => {
                        offsets.push(cell);
                        cell += spec.max_intermediate_size();
                        aggs.push(agg);
                    }
                    None => {
                        all_supported = false;
                        break;
                    }
                }
            }
            if all_supported {
                Some(BufferState {
                    slab: Vec::new(),
                    aggs,
                    offsets,
                    cell: cell.max(1),
                })
            } else {
                tracing::debug!("off-heap disabled: a metric family has no buffer form");
                None
            }
        } else {
            None
        };

        Ok(IncrementalIndex {
            inner: RwLock::new(Inner {
                dicts: schema.dimensions.iter().map(|_| DimDict::new()).collect(),
                facts: BTreeMap::new(),
                rows: Vec::new(),
                buffer,
                min_time: i64::MAX,
                max_time: i64::MIN,
            }),
            schema,
            current,
            ingested: AtomicU64::new(0),
            max_ingested_event_time: AtomicI64::new(i64::MIN),
        })
    }

    pub fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    /// Ingest one row; returns the (new or merged) row number. Fails with
    /// `ResourceExhausted` once the row limit would be exceeded, leaving all
    /// prior state intact.
    pub fn add(&self, row: Row) -> Result<usize> {
        let event_ts = row.timestamp;
        let bucket_ts = self.schema.granularity.truncate(event_ts);

        let mut inner = self.inner.write();

        let mut dims = Vec::with_capacity(self.schema.dimensions.len());
        for (i, dim) in self.schema.dimensions.iter().enumerate() {
            let mut values = row.string_list(dim);
            if values.is_empty() {
                // absent dimension keys as the empty string so bitmap unions
                // stay complete
                values.push(String::new());
            }
            let mut ids: IndexedInts = values
                .iter()
                .map(|v| inner.dicts[i].id_of(v))
                .collect::<SmallVec<[i32; 4]>>();
            ids.sort_unstable();
            dims.push(ids);
        }

        let dedup = if self.schema.rollup {
            0
        } else {
            inner.rows.len() as u64 + 1
        };
        let key = IndexKey {
            timestamp: bucket_ts,
            dims,
            dedup,
        };

        let row_num = match inner.facts.get(&key).copied() {
            Some(n) => n,
            None => {
                if inner.rows.len() >= self.schema.max_row_count {
                    return Err(BasaltError::ResourceExhausted(format!(
                        "incremental index row limit {} reached",
                        self.schema.max_row_count
                    )));
                }
                let n = inner.rows.len();
                let factory = RowBindingFactory {
                    current: Arc::clone(&self.current),
                };
                let aggs = if inner.buffer.is_some() {
                    Vec::new()
                } else {
                    let mut aggs = Vec::with_capacity(self.schema.metrics.len());
                    for spec in &self.schema.metrics {
                        aggs.push(spec.create(&factory)?);
                    }
                    aggs
                };
                inner.facts.insert(key.clone(), n);
                inner.rows.push(RowSlot { key, aggs });
                if let Some(buffer) = &mut inner.buffer {
                    let needed = (n + 1) * buffer.cell;
                    if buffer.slab.len() < needed {
                        buffer.slab.resize(needed, 0);
                    }
                    for (i, agg) in buffer.aggs.iter().enumerate() {
                        agg.init(&mut buffer.slab, n * buffer.cell + buffer.offsets[i]);
                    }
                }
                n
            }
        };

        *self.current.write() = Some(BoundRow { row, bucket_ts });

        if inner.buffer.is_some() {
            let buffer = inner.buffer.as_mut().expect("checked above");
            let base = row_num * buffer.cell;
            for (i, agg) in buffer.aggs.iter_mut().enumerate() {
                let pos = base + buffer.offsets[i];
                agg.aggregate(&mut buffer.slab, pos)?;
            }
        } else {
            for agg in inner.rows[row_num].aggs.iter_mut() {
                agg.aggregate()?;
            }
        }

        inner.min_time = inner.min_time.min(bucket_ts);
        inner.max_time = inner.max_time.max(bucket_ts);
        self.ingested.fetch_add(1, Ordering::Relaxed);
        self.max_ingested_event_time
            .fetch_max(event_ts, Ordering::Relaxed);
        Ok(row_num)
    }

    /// Snapshot of `(bucket timestamp, row number)` entries whose timestamp
    /// lies in `[start, end)`, ascending unless `descending`.
    pub fn range(&self, start: i64, end: i64, descending: bool) -> Vec<(i64, usize)> {
        let inner = self.inner.read();
        let lower = IndexKey {
            timestamp: start,
            dims: Vec::new(),
            dedup: 0,
        };
        let upper = IndexKey {
            timestamp: end,
            dims: Vec::new(),
            dedup: 0,
        };
        let mut out: Vec<(i64, usize)> = inner
            .facts
            .range(lower..upper)
            .map(|(k, n)| (k.timestamp, *n))
            .collect();
        if descending {
            out.reverse();
        }
        out
    }

    pub fn metric_value(&self, row_num: usize, metric: usize) -> AggState {
        let inner = self.inner.read();
        match &inner.buffer {
            Some(buffer) => {
                let pos = row_num * buffer.cell + buffer.offsets[metric];
                buffer.aggs[metric].get(&buffer.slab, pos)
            }
            None => inner
                .rows
                .get(row_num)
                .and_then(|slot| slot.aggs.get(metric))
                .map(|agg| agg.get())
                .unwrap_or(AggState::Null),
        }
    }

    pub fn metric_float(&self, row_num: usize, metric: usize) -> Option<f32> {
        self.metric_value(row_num, metric)
            .as_double()
            .map(|v| v as f32)
    }

    pub fn metric_long(&self, row_num: usize, metric: usize) -> Option<i64> {
        self.metric_value(row_num, metric).as_long()
    }

    pub fn metric_double(&self, row_num: usize, metric: usize) -> Option<f64> {
        self.metric_value(row_num, metric).as_double()
    }

    pub fn size(&self) -> usize {
        self.inner.read().rows.len()
    }

    pub fn ingested_rows(&self) -> u64 {
        self.ingested.load(Ordering::Relaxed)
    }

    pub fn min_time(&self) -> Option<i64> {
        let t = self.inner.read().min_time;
        (t != i64::MAX).then_some(t)
    }

    pub fn max_time(&self) -> Option<i64> {
        let t = self.inner.read().max_time;
        (t != i64::MIN).then_some(t)
    }

    pub fn max_ingested_event_time(&self) -> Option<i64> {
        let t = self.max_ingested_event_time.load(Ordering::Relaxed);
        (t != i64::MIN).then_some(t)
    }

    pub fn dimension_index(&self, name: &str) -> Option<usize> {
        self.schema.dimensions.iter().position(|d| d == name)
    }

    pub fn metric_index(&self, name: &str) -> Option<usize> {
        self.schema
            .metrics
            .iter()
            .position(|m| m.output_name() == name)
    }

    pub fn dimension_cardinality(&self, name: &str) -> Option<usize> {
        let idx = self.dimension_index(name)?;
        Some(self.inner.read().dicts[idx].len())
    }

    pub(crate) fn read_inner(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read()
    }
}

// ---- ingestion-time selector binding ----

struct RowBindingFactory {
    current: CurrentRow,
}

struct BoundLong {
    current: CurrentRow,
    name: String,
}

impl LongColumnSelector for BoundLong {
    fn get_long(&self) -> Result<Option<i64>> {
        let guard = self.current.read();
        let Some(bound) = guard.as_ref() else {
            return Ok(None);
        };
        if self.name == TIME_COLUMN {
            return Ok(Some(bound.bucket_ts));
        }
        bound.row.long(&self.name)
    }
}

struct BoundDouble {
    current: CurrentRow,
    name: String,
}

impl DoubleColumnSelector for BoundDouble {
    fn get_double(&self) -> Result<Option<f64>> {
        let guard = self.current.read();
        let Some(bound) = guard.as_ref() else {
            return Ok(None);
        };
        if self.name == TIME_COLUMN {
            return Ok(Some(bound.bucket_ts as f64));
        }
        bound.row.double(&self.name)
    }
}

struct BoundFloat {
    current: CurrentRow,
    name: String,
}

impl FloatColumnSelector for BoundFloat {
    fn get_float(&self) -> Result<Option<f32>> {
        let guard = self.current.read();
        let Some(bound) = guard.as_ref() else {
            return Ok(None);
        };
        bound.row.float(&self.name)
    }
}

struct BoundObject {
    current: CurrentRow,
    name: String,
}

impl ObjectColumnSelector for BoundObject {
    fn value_desc(&self) -> ValueDesc {
        ValueDesc::String
    }

    fn get_object(&self) -> Result<Scalar> {
        let guard = self.current.read();
        let Some(bound) = guard.as_ref() else {
            return Ok(Scalar::Null);
        };
        if self.name == TIME_COLUMN {
            return Ok(Scalar::Long(bound.bucket_ts));
        }
        Ok(bound.row.scalar(&self.name))
    }
}

impl ColumnSelectorFactory for RowBindingFactory {
    fn dimension_selector(&self, name: &str) -> Result<Box<dyn DimensionSelector>> {
        Err(BasaltError::IllegalArgument(format!(
            "dimension selector for {name} is not available during ingestion"
        )))
    }

    fn float_selector(&self, name: &str) -> Result<Box<dyn FloatColumnSelector>> {
        Ok(Box::new(BoundFloat {
            current: Arc::clone(&self.current),
            name: name.to_string(),
        }))
    }

    fn long_selector(&self, name: &str) -> Result<Box<dyn LongColumnSelector>> {
        Ok(Box::new(BoundLong {
            current: Arc::clone(&self.current),
            name: name.to_string(),
        }))
    }

    fn double_selector(&self, name: &str) -> Result<Box<dyn DoubleColumnSelector>> {
        Ok(Box::new(BoundDouble {
            current: Arc::clone(&self.current),
            name: name.to_string(),
        }))
    }

    fn object_selector(&self, name: &str) -> Result<Box<dyn ObjectColumnSelector>> {
        Ok(Box::new(BoundObject {
            current: Arc::clone(&self.current),
            name: name.to_string(),
        }))
    }

    fn column_type(&self, name: &str) -> Option<ValueDesc> {
        (name == TIME_COLUMN).then_some(ValueDesc::Long)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(granularity: Granularity, max_rows: usize) -> IndexSchema {
        IndexSchema {
            dimensions: vec!["k".into()],
            metrics: vec![
                serde_json::from_value(json!({"type":"count","name":"c"})).unwrap(),
                serde_json::from_value(
                    json!({"type":"doubleSum","name":"total","fieldName":"v"}),
                )
                .unwrap(),
            ],
            granularity,
            rollup: true,
            max_row_count: max_rows,
            off_heap: false,
        }
    }

    fn row(ts: i64, k: &str, v: f64) -> Row {
        Row::new(
            ts,
            [
                ("k".to_string(), json!(k)),
                ("v".to_string(), json!(v)),
            ]
            .into_iter()
            .collect(),
        )
    }

    #[test]
    fn test_rollup_merges_equal_keys() {
        let index = IncrementalIndex::new(schema(Granularity::Minute, 100)).unwrap();
        let a = index.add(row(60_010, "x", 1.0)).unwrap();
        let b = index.add(row(60_020, "x", 2.0)).unwrap();
        assert_eq!(a, b);
        assert_eq!(index.size(), 1);
        assert_eq!(index.ingested_rows(), 2);
        assert_eq!(index.metric_long(a, 0), Some(2));
        assert_eq!(index.metric_double(a, 1), Some(3.0));
    }

    #[test]
    fn test_distinct_keys_get_new_slots() {
        let index = IncrementalIndex::new(schema(Granularity::Minute, 100)).unwrap();
        index.add(row(0, "x", 1.0)).unwrap();
        index.add(row(0, "y", 1.0)).unwrap();
        index.add(row(120_000, "x", 1.0)).unwrap();
        assert_eq!(index.size(), 3);
        assert_eq!(index.min_time(), Some(0));
        assert_eq!(index.max_time(), Some(120_000));
        assert_eq!(index.max_ingested_event_time(), Some(120_000));
    }

    #[test]
    fn test_row_limit_preserves_prior_state() {
        let index = IncrementalIndex::new(schema(Granularity::None, 2)).unwrap();
        index.add(row(1, "a", 1.0)).unwrap();
        index.add(row(2, "b", 1.0)).unwrap();
        let err = index.add(row(3, "c", 1.0)).unwrap_err();
        assert!(matches!(err, BasaltError::ResourceExhausted(_)));
        // rollup onto an existing key still works at the limit
        index.add(row(1, "a", 5.0)).unwrap();
        assert_eq!(index.size(), 2);
        assert_eq!(index.metric_double(0, 1), Some(6.0));
    }

    #[test]
    fn test_range_snapshot() {
        let index = IncrementalIndex::new(schema(Granularity::Minute, 100)).unwrap();
        index.add(row(10, "a", 1.0)).unwrap();
        index.add(row(65_000, "a", 1.0)).unwrap();
        index.add(row(125_000, "a", 1.0)).unwrap();
        let hits = index.range(0, 120_000, false);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 0);
        assert_eq!(hits[1].0, 60_000);
        let rev = index.range(0, i64::MAX, true);
        assert_eq!(rev[0].0, 120_000);
    }

    #[test]
    fn test_off_heap_matches_on_heap() {
        let mut s = schema(Granularity::Minute, 100);
        s.off_heap = true;
        let off = IncrementalIndex::new(s).unwrap();
        let on = IncrementalIndex::new(schema(Granularity::Minute, 100)).unwrap();
        for i in 0..50 {
            let r = row(i * 1_000, if i % 2 == 0 { "a" } else { "b" }, i as f64);
            off.add(r.clone()).unwrap();
            on.add(r).unwrap();
        }
        assert_eq!(off.size(), on.size());
        for n in 0..off.size() {
            assert_eq!(off.metric_long(n, 0), on.metric_long(n, 0));
            assert_eq!(off.metric_double(n, 1), on.metric_double(n, 1));
        }
    }

    #[test]
    fn test_multi_value_dimension_sorted_ids() {
        let index = IncrementalIndex::new(schema(Granularity::None, 100)).unwrap();
        let r = Row::new(
            0,
            [("k".to_string(), json!(["b", "a", "b"]))].into_iter().collect(),
        );
        index.add(r).unwrap();
        let inner = index.read_inner();
        let key = &inner.rows[0].key;
        // ids sorted, duplicates kept
        assert_eq!(key.dims[0].len(), 3);
        let mut sorted = key.dims[0].to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, key.dims[0].to_vec());
    }
}
