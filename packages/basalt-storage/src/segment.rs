//! Immutable column-oriented segment, built by persisting an incremental
//! index. Dictionaries come out sorted, every value id carries a roaring
//! posting list, and metric columns hold partial aggregate state (primitive
//! or complex via the registered serde).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use basalt_agg::{AggState, AggregatorSpec, ComplexRegistry};
use basalt_core::{BasaltError, Granularity, IndexedInts, Interval, Result, ValueDesc};

use crate::filter::BitmapSource;
use crate::incremental::IncrementalIndex;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentId {
    #[serde(rename = "dataSource")]
    pub datasource: String,
    pub interval: Interval,
    pub version: String,
    #[serde(default)]
    pub shard: u32,
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.datasource, self.interval, self.version, self.shard
        )
    }
}

pub struct DimColumn {
    /// Sorted dictionary.
    pub dict: Vec<String>,
    /// Per-row sorted ids into the sorted dictionary.
    pub rows: Vec<IndexedInts>,
    /// Per-id posting list; unions over all ids cover every row.
    pub bitmaps: Vec<RoaringBitmap>,
    pub multi_value: bool,
}

pub enum MetricColumn {
    Long {
        values: Vec<i64>,
        nulls: RoaringBitmap,
    },
    Double {
        values: Vec<f64>,
        nulls: RoaringBitmap,
    },
    Float {
        values: Vec<f32>,
        nulls: RoaringBitmap,
    },
    Complex {
        name: String,
        values: Vec<Vec<u8>>,
    },
}

pub struct Segment {
    pub id: SegmentId,
    dim_names: Vec<String>,
    dims: Vec<DimColumn>,
    metric_specs: Vec<AggregatorSpec>,
    metrics: Vec<MetricColumn>,
    timestamps: Vec<i64>,
    granularity: Granularity,
    rollup: bool,
    ingested_rows: u64,
    registry: Arc<ComplexRegistry>,
    last_access: AtomicI64,
}

impl Segment {
    /// Persist handoff: freeze an incremental index into an immutable
    /// segment. Row order is the index key order (time, then dims).
    pub fn from_incremental(
        index: &IncrementalIndex,
        id: SegmentId,
        registry: Arc<ComplexRegistry>,
    ) -> Result<Segment> {
        let schema = index.schema().clone();
        let inner = index.read_inner();

        let ordered: Vec<usize> = inner.facts.values().copied().collect();
        let num_rows = ordered.len();

        let mut dims = Vec::with_capacity(schema.dimensions.len());
        for (d, _) in schema.dimensions.iter().enumerate() {
            let old_dict = &inner.dicts[d];
            let sorted_old_ids = old_dict.sorted_ids();
            let mut remap = vec![0i32; old_dict.len()];
            let mut dict = Vec::with_capacity(old_dict.len());
            for (new_id, old_id) in sorted_old_ids.iter().enumerate() {
                remap[*old_id as usize] = new_id as i32;
                dict.push(
                    old_dict
                        .name_of(*old_id)
                        .expect("sorted id in range")
                        .to_string(),
                );
            }
            let mut bitmaps = vec![RoaringBitmap::new(); dict.len()];
            let mut rows = Vec::with_capacity(num_rows);
            let mut multi_value = false;
            for (row_idx, old_row) in ordered.iter().enumerate() {
                let key = &inner.rows[*old_row].key;
                let mut ids: IndexedInts =
                    key.dims[d].iter().map(|id| remap[*id as usize]).collect();
                ids.sort_unstable();
                multi_value |= ids.len() > 1;
                for id in &ids {
                    bitmaps[*id as usize].insert(row_idx as u32);
                }
                rows.push(ids);
            }
            dims.push(DimColumn {
                dict,
                rows,
                bitmaps,
                multi_value,
            });
        }

        let timestamps: Vec<i64> = ordered
            .iter()
            .map(|old_row| inner.rows[*old_row].key.timestamp)
            .collect();

        drop(inner);

        let mut metrics = Vec::with_capacity(schema.metrics.len());
        for (m, spec) in schema.metrics.iter().enumerate() {
            let column = match spec.intermediate_type() {
                ValueDesc::Long => {
                    let mut values = Vec::with_capacity(num_rows);
                    let mut nulls = RoaringBitmap::new();
                    for (row_idx, old_row) in ordered.iter().enumerate() {
                        match index.metric_value(*old_row, m) {
                            AggState::Null => {
                                nulls.insert(row_idx as u32);
                                values.push(0);
                            }
                            state => values.push(state.as_long().unwrap_or(0)),
                        }
                    }
                    MetricColumn::Long { values, nulls }
                }
                ValueDesc::Double => {
                    let mut values = Vec::with_capacity(num_rows);
                    let mut nulls = RoaringBitmap::new();
                    for (row_idx, old_row) in ordered.iter().enumerate() {
                        match index.metric_value(*old_row, m) {
                            AggState::Null => {
                                nulls.insert(row_idx as u32);
                                values.push(0.0);
                            }
                            state => values.push(state.as_double().unwrap_or(0.0)),
                        }
                    }
                    MetricColumn::Double { values, nulls }
                }
                ValueDesc::Float => {
                    let mut values = Vec::with_capacity(num_rows);
                    let mut nulls = RoaringBitmap::new();
                    for (row_idx, old_row) in ordered.iter().enumerate() {
                        match index.metric_value(*old_row, m) {
                            AggState::Null => {
                                nulls.insert(row_idx as u32);
                                values.push(0.0);
                            }
                            state => {
                                values.push(state.as_double().unwrap_or(0.0) as f32)
                            }
                        }
                    }
                    MetricColumn::Float { values, nulls }
                }
                desc => {
                    let name = desc
                        .complex_name()
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| desc.type_name());
                    let serde = registry.get(&name).ok().cloned();
                    let mut values = Vec::with_capacity(num_rows);
                    for old_row in &ordered {
                        let state = index.metric_value(*old_row, m);
                        let bytes = match &serde {
                            Some(s) => s.serialize(&state)?,
                            None => state.to_bytes()?,
                        };
                        values.push(bytes);
                    }
                    MetricColumn::Complex { name, values }
                }
            };
            metrics.push(column);
        }

        Ok(Segment {
            id,
            dim_names: schema.dimensions.clone(),
            dims,
            metric_specs: schema.metrics.clone(),
            metrics,
            timestamps,
            granularity: schema.granularity,
            rollup: schema.rollup,
            ingested_rows: index.ingested_rows(),
            registry,
            last_access: AtomicI64::new(0),
        })
    }

    pub fn num_rows(&self) -> u32 {
        self.timestamps.len() as u32
    }

    /// Rows are in key order, so the timestamp vector is sorted ascending.
    pub fn min_time(&self) -> Option<i64> {
        self.timestamps.first().copied()
    }

    pub fn max_time(&self) -> Option<i64> {
        self.timestamps.last().copied()
    }

    pub fn timestamp(&self, row: u32) -> i64 {
        self.timestamps[row as usize]
    }

    /// Half-open row-id range whose timestamps lie in `[start, end)`.
    pub(crate) fn row_range(&self, start: i64, end: i64) -> (u32, u32) {
        let lo = self.timestamps.partition_point(|t| *t < start) as u32;
        let hi = self.timestamps.partition_point(|t| *t < end) as u32;
        (lo, hi)
    }

    pub fn dim_names(&self) -> &[String] {
        &self.dim_names
    }

    pub fn metric_specs(&self) -> &[AggregatorSpec] {
        &self.metric_specs
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn rollup(&self) -> bool {
        self.rollup
    }

    pub fn ingested_rows(&self) -> u64 {
        self.ingested_rows
    }

    pub fn touch(&self, now_ms: i64) {
        self.last_access.fetch_max(now_ms, Ordering::Relaxed);
    }

    pub fn last_access(&self) -> i64 {
        self.last_access.load(Ordering::Relaxed)
    }

    pub fn dim_index(&self, name: &str) -> Option<usize> {
        self.dim_names.iter().position(|d| d == name)
    }

    pub fn metric_index(&self, name: &str) -> Option<usize> {
        self.metric_specs
            .iter()
            .position(|m| m.output_name() == name)
    }

    pub(crate) fn dim_column(&self, idx: usize) -> &DimColumn {
        &self.dims[idx]
    }

    pub(crate) fn metric_column(&self, idx: usize) -> &MetricColumn {
        &self.metrics[idx]
    }

    pub fn column_type(&self, name: &str) -> Option<ValueDesc> {
        if name == basalt_core::TIME_COLUMN {
            return Some(ValueDesc::Long);
        }
        if self.dim_index(name).is_some() {
            return Some(ValueDesc::Dimension);
        }
        self.metric_index(name)
            .map(|i| self.metric_specs[i].intermediate_type())
    }

    /// Partial aggregate state of one metric cell.
    pub fn metric_state(&self, row: u32, metric: usize) -> Result<AggState> {
        Ok(match &self.metrics[metric] {
            MetricColumn::Long { values, nulls } => {
                if nulls.contains(row) {
                    AggState::Null
                } else {
                    AggState::Long(values[row as usize])
                }
            }
            MetricColumn::Double { values, nulls } => {
                if nulls.contains(row) {
                    AggState::Null
                } else {
                    AggState::Double(values[row as usize])
                }
            }
            MetricColumn::Float { values, nulls } => {
                if nulls.contains(row) {
                    AggState::Null
                } else {
                    AggState::Float(values[row as usize])
                }
            }
            MetricColumn::Complex { name, values } => {
                let bytes = &values[row as usize];
                match self.registry.get(name) {
                    Ok(serde) => serde.deserialize(bytes)?,
                    Err(_) => AggState::from_bytes(bytes)?,
                }
            }
        })
    }

    /// Per-column metadata for segment-metadata queries.
    pub fn column_analysis(&self, name: &str) -> Result<ColumnAnalysis> {
        if let Some(d) = self.dim_index(name) {
            let col = &self.dims[d];
            let null_id = col.dict.iter().position(|v| v.is_empty());
            let null_count = null_id
                .map(|id| col.bitmaps[id].len() as u64)
                .unwrap_or(0);
            let size: usize = col.dict.iter().map(|v| v.len()).sum::<usize>()
                + col.rows.iter().map(|r| r.len() * 4).sum::<usize>();
            return Ok(ColumnAnalysis {
                value_type: ValueDesc::Dimension,
                size: size as u64,
                cardinality: Some(col.dict.len() as u64),
                min_value: col.dict.iter().find(|v| !v.is_empty()).cloned(),
                max_value: col.dict.last().cloned(),
                null_count,
                error_message: None,
            });
        }
        if let Some(m) = self.metric_index(name) {
            let (size, nulls) = match &self.metrics[m] {
                MetricColumn::Long { values, nulls } => (values.len() * 8, nulls.len()),
                MetricColumn::Double { values, nulls } => (values.len() * 8, nulls.len()),
                MetricColumn::Float { values, nulls } => (values.len() * 4, nulls.len()),
                MetricColumn::Complex { values, .. } => {
                    (values.iter().map(|v| v.len()).sum::<usize>(), 0)
                }
            };
            return Ok(ColumnAnalysis {
                value_type: self.metric_specs[m].intermediate_type(),
                size: size as u64,
                cardinality: None,
                min_value: None,
                max_value: None,
                null_count: nulls,
                error_message: None,
            });
        }
        Err(BasaltError::IllegalArgument(format!(
            "unknown column: {name}"
        )))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnAnalysis {
    #[serde(rename = "type")]
    pub value_type: ValueDesc,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cardinality: Option<u64>,
    #[serde(rename = "minValue", skip_serializing_if = "Option::is_none")]
    pub min_value: Option<String>,
    #[serde(rename = "maxValue", skip_serializing_if = "Option::is_none")]
    pub max_value: Option<String>,
    #[serde(rename = "nullCount")]
    pub null_count: u64,
    #[serde(rename = "errorMessage", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl BitmapSource for Segment {
    fn num_rows(&self) -> u32 {
        self.num_rows()
    }

    fn dict_values(&self, column: &str) -> Option<&[String]> {
        self.dim_index(column)
            .map(|d| self.dims[d].dict.as_slice())
    }

    fn bitmap_for_id(&self, column: &str, id: usize) -> Option<&RoaringBitmap> {
        let d = self.dim_index(column)?;
        self.dims[d].bitmaps.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incremental::IndexSchema;
    use basalt_core::{Granularity, Row};
    use serde_json::json;

    fn build_segment() -> Segment {
        let schema = IndexSchema {
            dimensions: vec!["k".into()],
            metrics: vec![
                serde_json::from_value(json!({"type":"count","name":"c"})).unwrap(),
                serde_json::from_value(
                    json!({"type":"hyperUnique","name":"uniq","fieldName":"user"}),
                )
                .unwrap(),
            ],
            granularity: Granularity::Minute,
            rollup: true,
            max_row_count: 1000,
            off_heap: false,
        };
        let index = IncrementalIndex::new(schema).unwrap();
        for (ts, k, user) in [
            (10_000, "b", "u1"),
            (20_000, "a", "u2"),
            (70_000, "a", "u1"),
        ] {
            index
                .add(Row::new(
                    ts,
                    [
                        ("k".to_string(), json!(k)),
                        ("user".to_string(), json!(user)),
                    ]
                    .into_iter()
                    .collect(),
                ))
                .unwrap();
        }
        Segment::from_incremental(
            &index,
            SegmentId {
                datasource: "events".into(),
                interval: Interval::new(0, 120_000),
                version: "v1".into(),
                shard: 0,
            },
            Arc::new(ComplexRegistry::with_builtins()),
        )
        .unwrap()
    }

    #[test]
    fn test_sorted_dictionary_and_bitmaps() {
        let seg = build_segment();
        let dict = seg.dict_values("k").unwrap();
        assert_eq!(dict, &["a".to_string(), "b".to_string()]);
        // union of bitmaps covers every row
        let mut union = RoaringBitmap::new();
        for id in 0..dict.len() {
            union |= seg.bitmap_for_id("k", id).unwrap();
        }
        assert_eq!(union.len(), seg.num_rows() as u64);
    }

    #[test]
    fn test_rows_in_time_order() {
        let seg = build_segment();
        assert_eq!(seg.num_rows(), 3);
        assert_eq!(seg.min_time(), Some(0));
        assert_eq!(seg.max_time(), Some(60_000));
    }

    #[test]
    fn test_complex_metric_round_trip() {
        let seg = build_segment();
        let m = seg.metric_index("uniq").unwrap();
        let state = seg.metric_state(0, m).unwrap();
        match state {
            AggState::Hll(h) => assert!(h.estimate() >= 1.0),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_column_analysis() {
        let seg = build_segment();
        let a = seg.column_analysis("k").unwrap();
        assert_eq!(a.cardinality, Some(2));
        assert_eq!(a.null_count, 0);
        assert_eq!(a.min_value.as_deref(), Some("a"));
    }
}
