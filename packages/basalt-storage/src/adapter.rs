//! One reading surface over incremental indexes and immutable segments.

use std::sync::Arc;

use basalt_agg::AggregatorSpec;
use basalt_core::{
    Granularity, Interval, QueryCancel, Result, Sequence, ValueDesc,
};

use crate::cursor::{
    Cursor, IncrementalCursor, IncrementalRowReader, SegmentCursor, SegmentRowReader,
};
use crate::filter::{DimFilter, FilterContext, RowMatcher};
use crate::incremental::IncrementalIndex;
use crate::segment::{ColumnAnalysis, Segment};
use crate::virtual_columns::VirtualColumns;

/// Everything a cursor build needs.
pub struct ScanSpec {
    pub filter: Option<DimFilter>,
    pub interval: Interval,
    pub virtual_columns: Arc<VirtualColumns>,
    pub granularity: Granularity,
    pub descending: bool,
    pub cancel: QueryCancel,
}

impl ScanSpec {
    pub fn all_time(cancel: QueryCancel) -> ScanSpec {
        ScanSpec {
            filter: None,
            interval: Interval::ETERNITY,
            virtual_columns: Arc::new(VirtualColumns::empty()),
            granularity: Granularity::All,
            descending: false,
            cancel,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnCapabilities {
    pub desc: ValueDesc,
    pub dictionary_encoded: bool,
    pub has_bitmap_index: bool,
    pub multi_value: bool,
    pub cardinality: Option<usize>,
}

pub trait StorageAdapter: Send + Sync {
    /// Lazy sequence of cursors, one per granularity bucket intersecting the
    /// data interval.
    fn make_cursors(&self, spec: ScanSpec) -> Result<Sequence<Box<dyn Cursor>>>;

    fn column_capabilities(&self, name: &str) -> Option<ColumnCapabilities>;

    fn column_type(&self, name: &str) -> Option<ValueDesc>;

    fn dimension_names(&self) -> Vec<String>;

    fn metric_specs(&self) -> Vec<AggregatorSpec>;

    fn dimension_cardinality(&self, name: &str) -> Option<usize>;

    fn num_rows(&self) -> u64;

    fn min_time(&self) -> Option<i64>;

    fn max_time(&self) -> Option<i64>;

    fn data_interval(&self) -> Option<Interval> {
        match (self.min_time(), self.max_time()) {
            (Some(min), Some(max)) => Some(Interval::new(min, max + 1)),
            _ => None,
        }
    }

    fn column_analysis(&self, name: &str) -> Result<ColumnAnalysis>;

    fn ingested_rows(&self) -> u64;

    fn query_granularity(&self) -> Granularity;

    fn rollup(&self) -> bool;
}

/// Shared cursor-build scaffolding: clip the interval, compile the filter,
/// walk buckets.
fn prepare(
    filter: &Option<DimFilter>,
    interval: Interval,
    data: Option<Interval>,
    ctx: &FilterContext,
) -> Result<Option<(Interval, Option<roaring::RoaringBitmap>, Option<RowMatcher>)>> {
    let Some(data) = data else {
        return Ok(None);
    };
    let Some(clipped) = interval.overlap(&data) else {
        return Ok(None);
    };
    let (bitmap, matcher) = match filter {
        Some(f) => {
            f.validate()?;
            let compiled = f.optimize().to_cnf().compile(ctx);
            let matcher = match (&compiled.exact, &compiled.residual) {
                (false, Some(residual)) => Some(residual.matcher()?),
                _ => None,
            };
            (compiled.bitmap, matcher)
        }
        None => (None, None),
    };
    Ok(Some((clipped, bitmap, matcher)))
}

// ---- immutable segment ----

pub struct SegmentAdapter {
    segment: Arc<Segment>,
}

impl SegmentAdapter {
    pub fn new(segment: Arc<Segment>) -> SegmentAdapter {
        SegmentAdapter { segment }
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }
}

impl StorageAdapter for SegmentAdapter {
    fn make_cursors(&self, spec: ScanSpec) -> Result<Sequence<Box<dyn Cursor>>> {
        let ctx = FilterContext {
            source: Some(self.segment.as_ref()),
            num_rows: self.segment.num_rows(),
        };
        let Some((clipped, bitmap, matcher)) =
            prepare(&spec.filter, spec.interval, self.data_interval(), &ctx)?
        else {
            return Ok(Sequence::empty());
        };

        let buckets = spec.granularity.buckets(clipped, spec.descending);
        let segment = Arc::clone(&self.segment);
        let virtuals = Arc::clone(&spec.virtual_columns);
        let cancel = spec.cancel.clone();
        let descending = spec.descending;
        let matcher = matcher.map(Arc::new);
        let bitmap = bitmap.map(Arc::new);

        Ok(Sequence::new(buckets.into_iter().map(
            move |bucket| -> Result<Box<dyn Cursor>> {
                cancel.check()?;
                let scan = bucket.overlap(&clipped).unwrap_or(bucket);
                let (lo, hi) = segment.row_range(scan.start, scan.end);
                let mut rows = Vec::new();
                for row in lo..hi {
                    if row % 4096 == 0 {
                        cancel.check()?;
                    }
                    if let Some(b) = &bitmap {
                        if !b.contains(row) {
                            continue;
                        }
                    }
                    if let Some(m) = &matcher {
                        let reader = SegmentRowReader {
                            segment: &segment,
                            row,
                        };
                        if !(m.as_ref())(&reader, &virtuals)? {
                            continue;
                        }
                    }
                    rows.push(row);
                }
                if descending {
                    rows.reverse();
                }
                Ok(Box::new(SegmentCursor::new(
                    Arc::clone(&segment),
                    Arc::clone(&virtuals),
                    rows,
                    bucket.start,
                    cancel.clone(),
                )) as Box<dyn Cursor>)
            },
        )))
    }

    fn column_capabilities(&self, name: &str) -> Option<ColumnCapabilities> {
        if let Some(d) = self.segment.dim_index(name) {
            let col = self.segment.dim_column(d);
            return Some(ColumnCapabilities {
                desc: ValueDesc::Dimension,
                dictionary_encoded: true,
                has_bitmap_index: true,
                multi_value: col.multi_value,
                cardinality: Some(col.dict.len()),
            });
        }
        self.segment.column_type(name).map(|desc| ColumnCapabilities {
            desc,
            dictionary_encoded: false,
            has_bitmap_index: false,
            multi_value: false,
            cardinality: None,
        })
    }

    fn column_type(&self, name: &str) -> Option<ValueDesc> {
        self.segment.column_type(name)
    }

    fn dimension_names(&self) -> Vec<String> {
        self.segment.dim_names().to_vec()
    }

    fn metric_specs(&self) -> Vec<AggregatorSpec> {
        self.segment.metric_specs().to_vec()
    }

    fn dimension_cardinality(&self, name: &str) -> Option<usize> {
        self.segment
            .dim_index(name)
            .map(|d| self.segment.dim_column(d).dict.len())
    }

    fn num_rows(&self) -> u64 {
        self.segment.num_rows() as u64
    }

    fn min_time(&self) -> Option<i64> {
        self.segment.min_time()
    }

    fn max_time(&self) -> Option<i64> {
        self.segment.max_time()
    }

    fn column_analysis(&self, name: &str) -> Result<ColumnAnalysis> {
        self.segment.column_analysis(name)
    }

    fn ingested_rows(&self) -> u64 {
        self.segment.ingested_rows()
    }

    fn query_granularity(&self) -> Granularity {
        self.segment.granularity()
    }

    fn rollup(&self) -> bool {
        self.segment.rollup()
    }
}

// ---- incremental index ----

pub struct IncrementalAdapter {
    index: Arc<IncrementalIndex>,
}

impl IncrementalAdapter {
    pub fn new(index: Arc<IncrementalIndex>) -> IncrementalAdapter {
        IncrementalAdapter { index }
    }

    pub fn index(&self) -> &Arc<IncrementalIndex> {
        &self.index
    }
}

impl StorageAdapter for IncrementalAdapter {
    fn make_cursors(&self, spec: ScanSpec) -> Result<Sequence<Box<dyn Cursor>>> {
        let ctx = FilterContext {
            source: None,
            num_rows: self.index.size() as u32,
        };
        let Some((clipped, bitmap, matcher)) =
            prepare(&spec.filter, spec.interval, self.data_interval(), &ctx)?
        else {
            return Ok(Sequence::empty());
        };

        let buckets = spec.granularity.buckets(clipped, spec.descending);
        let index = Arc::clone(&self.index);
        let virtuals = Arc::clone(&spec.virtual_columns);
        let cancel = spec.cancel.clone();
        let descending = spec.descending;
        let matcher = matcher.map(Arc::new);
        let bitmap = bitmap.map(Arc::new);

        Ok(Sequence::new(buckets.into_iter().map(
            move |bucket| -> Result<Box<dyn Cursor>> {
                cancel.check()?;
                let scan = bucket.overlap(&clipped).unwrap_or(bucket);
                let mut rows = Vec::new();
                for (i, (_, row)) in index
                    .range(scan.start, scan.end, descending)
                    .into_iter()
                    .enumerate()
                {
                    if i % 4096 == 0 {
                        cancel.check()?;
                    }
                    if let Some(b) = &bitmap {
                        if !b.contains(row as u32) {
                            continue;
                        }
                    }
                    if let Some(m) = &matcher {
                        let reader = IncrementalRowReader { index: &index, row };
                        if !(m.as_ref())(&reader, &virtuals)? {
                            continue;
                        }
                    }
                    rows.push(row);
                }
                Ok(Box::new(IncrementalCursor::new(
                    Arc::clone(&index),
                    Arc::clone(&virtuals),
                    rows,
                    bucket.start,
                    cancel.clone(),
                )) as Box<dyn Cursor>)
            },
        )))
    }

    fn column_capabilities(&self, name: &str) -> Option<ColumnCapabilities> {
        if self.index.dimension_index(name).is_some() {
            return Some(ColumnCapabilities {
                desc: ValueDesc::Dimension,
                dictionary_encoded: true,
                has_bitmap_index: false,
                multi_value: false,
                cardinality: self.index.dimension_cardinality(name),
            });
        }
        self.column_type(name).map(|desc| ColumnCapabilities {
            desc,
            dictionary_encoded: false,
            has_bitmap_index: false,
            multi_value: false,
            cardinality: None,
        })
    }

    fn column_type(&self, name: &str) -> Option<ValueDesc> {
        if name == basalt_core::TIME_COLUMN {
            return Some(ValueDesc::Long);
        }
        if self.index.dimension_index(name).is_some() {
            return Some(ValueDesc::Dimension);
        }
        self.index
            .metric_index(name)
            .map(|m| self.index.schema().metrics[m].intermediate_type())
    }

    fn dimension_names(&self) -> Vec<String> {
        self.index.schema().dimensions.clone()
    }

    fn metric_specs(&self) -> Vec<AggregatorSpec> {
        self.index.schema().metrics.clone()
    }

    fn dimension_cardinality(&self, name: &str) -> Option<usize> {
        self.index.dimension_cardinality(name)
    }

    fn num_rows(&self) -> u64 {
        self.index.size() as u64
    }

    fn min_time(&self) -> Option<i64> {
        self.index.min_time()
    }

    fn max_time(&self) -> Option<i64> {
        self.index.max_time()
    }

    fn column_analysis(&self, name: &str) -> Result<ColumnAnalysis> {
        let desc = self.column_type(name).ok_or_else(|| {
            basalt_core::BasaltError::IllegalArgument(format!("unknown column: {name}"))
        })?;
        Ok(ColumnAnalysis {
            value_type: desc,
            size: 0,
            cardinality: self
                .index
                .dimension_cardinality(name)
                .map(|c| c as u64),
            min_value: None,
            max_value: None,
            null_count: 0,
            error_message: None,
        })
    }

    fn ingested_rows(&self) -> u64 {
        self.index.ingested_rows()
    }

    fn query_granularity(&self) -> Granularity {
        self.index.schema().granularity
    }

    fn rollup(&self) -> bool {
        self.index.schema().rollup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incremental::IndexSchema;
    use crate::segment::SegmentId;
    use basalt_agg::ComplexRegistry;
    use basalt_core::Row;
    use serde_json::json;

    fn index_with_rows() -> Arc<IncrementalIndex> {
        let schema = IndexSchema {
            dimensions: vec!["k".into()],
            metrics: vec![
                serde_json::from_value(json!({"type":"count","name":"c"})).unwrap(),
            ],
            granularity: Granularity::None,
            rollup: true,
            max_row_count: 1000,
            off_heap: false,
        };
        let index = IncrementalIndex::new(schema).unwrap();
        for (i, k) in ["a", "b", "c", "d"].iter().enumerate() {
            index
                .add(Row::new(
                    i as i64 * 10_000,
                    [("k".to_string(), json!(k))].into_iter().collect(),
                ))
                .unwrap();
        }
        Arc::new(index)
    }

    fn count_rows(adapter: &dyn StorageAdapter, filter: Option<DimFilter>) -> usize {
        let mut spec = ScanSpec::all_time(QueryCancel::new());
        spec.filter = filter;
        let mut total = 0;
        for cursor in adapter.make_cursors(spec).unwrap() {
            let mut cursor = cursor.unwrap();
            while !cursor.is_done() {
                total += 1;
                cursor.advance().unwrap();
            }
        }
        total
    }

    #[test]
    fn test_cnf_filter_bitmap_over_segment() {
        // spec scenario S2: and(or(k=a, k=b), not(k=c)) matches rows {0, 1}
        let index = index_with_rows();
        let segment = Arc::new(
            Segment::from_incremental(
                &index,
                SegmentId {
                    datasource: "t".into(),
                    interval: Interval::new(0, 40_000),
                    version: "v1".into(),
                    shard: 0,
                },
                Arc::new(ComplexRegistry::with_builtins()),
            )
            .unwrap(),
        );
        let filter = DimFilter::and(vec![
            DimFilter::or(vec![
                DimFilter::selector("k", "a"),
                DimFilter::selector("k", "b"),
            ]),
            DimFilter::not(DimFilter::selector("k", "c")),
        ]);
        let ctx = FilterContext {
            source: Some(segment.as_ref()),
            num_rows: segment.num_rows(),
        };
        let compiled = filter.optimize().to_cnf().compile(&ctx);
        assert!(compiled.exact);
        let bitmap = compiled.bitmap.unwrap();
        assert_eq!(bitmap.iter().collect::<Vec<u32>>(), vec![0, 1]);

        let adapter = SegmentAdapter::new(segment);
        assert_eq!(count_rows(&adapter, Some(filter)), 2);
    }

    #[test]
    fn test_incremental_and_segment_agree() {
        let index = index_with_rows();
        let filter = DimFilter::or(vec![
            DimFilter::selector("k", "a"),
            DimFilter::selector("k", "d"),
        ]);
        let inc = IncrementalAdapter::new(Arc::clone(&index));
        let segment = Arc::new(
            Segment::from_incremental(
                &index,
                SegmentId {
                    datasource: "t".into(),
                    interval: Interval::new(0, 40_000),
                    version: "v1".into(),
                    shard: 0,
                },
                Arc::new(ComplexRegistry::with_builtins()),
            )
            .unwrap(),
        );
        let seg = SegmentAdapter::new(segment);
        assert_eq!(
            count_rows(&inc, Some(filter.clone())),
            count_rows(&seg, Some(filter))
        );
    }

    #[test]
    fn test_empty_interval_returns_empty_sequence() {
        let index = index_with_rows();
        let adapter = IncrementalAdapter::new(index);
        let mut spec = ScanSpec::all_time(QueryCancel::new());
        spec.interval = Interval::new(500_000, 600_000);
        let cursors: Vec<_> = adapter.make_cursors(spec).unwrap().collect();
        assert!(cursors.is_empty());
    }

    #[test]
    fn test_cancellation_observed_on_advance() {
        let index = index_with_rows();
        let adapter = IncrementalAdapter::new(index);
        let cancel = QueryCancel::new();
        let spec = ScanSpec::all_time(cancel.clone());
        let mut cursors = adapter.make_cursors(spec).unwrap();
        let mut cursor = cursors.next().unwrap().unwrap();
        cancel.cancel();
        let err = cursor.advance().unwrap_err();
        assert!(matches!(err, basalt_core::BasaltError::Cancelled(_)));
    }

    #[test]
    fn test_expression_filter_is_residual() {
        let index = index_with_rows();
        let adapter = IncrementalAdapter::new(index);
        let filter = DimFilter::Expression {
            expression: "k == 'b' || k == 'c'".into(),
        };
        assert_eq!(count_rows(&adapter, Some(filter)), 2);
    }
}
