//! Cursors: per-bucket row iterators handing out typed selectors.
//!
//! Two implementations share the contract: [`SegmentCursor`] walks an
//! immutable segment in row order (bitmap-filtered), [`IncrementalCursor`]
//! walks a snapshot of the in-memory index in ingestion order. Both observe
//! the query cancellation flag on every advance.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use basalt_agg::AggState;
use basalt_core::{
    BasaltError, ColumnSelectorFactory, DimensionSelector, DoubleColumnSelector,
    FloatColumnSelector, IndexedInts, LongColumnSelector, ObjectColumnSelector, QueryCancel,
    Result, Scalar, ValueDesc, TIME_COLUMN,
};

use crate::incremental::IncrementalIndex;
use crate::segment::{MetricColumn, Segment};
use crate::virtual_columns::VirtualColumns;

/// Read surface for residual filters and engines that need the current row
/// as plain values.
pub trait RowReader {
    fn has_column(&self, name: &str) -> bool;
    /// Current values of a dimension column, dictionary-decoded.
    fn dim_values(&self, name: &str) -> Vec<String>;
    fn scalar(&self, name: &str) -> Scalar;
    fn timestamp(&self) -> i64;
}

pub trait Cursor: ColumnSelectorFactory + RowReader + Send {
    /// Bucket start time of this cursor.
    fn time(&self) -> i64;
    fn advance(&mut self) -> Result<()>;
    fn is_done(&self) -> bool;
    fn reset(&mut self);
}

// ---- closure-backed selectors shared by both cursor kinds ----

pub(crate) struct FnObject {
    pub desc: ValueDesc,
    pub f: Box<dyn Fn() -> Result<Scalar> + Send + Sync>,
}

impl ObjectColumnSelector for FnObject {
    fn value_desc(&self) -> ValueDesc {
        self.desc.clone()
    }

    fn get_object(&self) -> Result<Scalar> {
        (self.f)()
    }
}

pub(crate) struct FnDouble(pub Box<dyn Fn() -> Result<Option<f64>> + Send + Sync>);

impl DoubleColumnSelector for FnDouble {
    fn get_double(&self) -> Result<Option<f64>> {
        (self.0)()
    }
}

pub(crate) struct FnLong(pub Box<dyn Fn() -> Result<Option<i64>> + Send + Sync>);

impl LongColumnSelector for FnLong {
    fn get_long(&self) -> Result<Option<i64>> {
        (self.0)()
    }
}

pub(crate) struct FnFloat(pub Box<dyn Fn() -> Result<Option<f32>> + Send + Sync>);

impl FloatColumnSelector for FnFloat {
    fn get_float(&self) -> Result<Option<f32>> {
        (self.0)()
    }
}

fn state_scalar(state: AggState, desc: &ValueDesc) -> Result<Scalar> {
    Ok(match state {
        AggState::Null => Scalar::Null,
        AggState::Long(v) => Scalar::Long(v),
        AggState::Double(v) => Scalar::Double(v),
        AggState::Float(v) => Scalar::Float(v),
        other => Scalar::Complex {
            name: desc
                .complex_name()
                .map(|n| n.to_string())
                .unwrap_or_else(|| desc.type_name()),
            data: other.to_bytes()?,
        },
    })
}

// ---- segment cursor ----

pub struct SegmentCursor {
    segment: Arc<Segment>,
    virtuals: Arc<VirtualColumns>,
    rows: Arc<Vec<u32>>,
    pos: Arc<AtomicUsize>,
    bucket_start: i64,
    cancel: QueryCancel,
}

impl SegmentCursor {
    pub(crate) fn new(
        segment: Arc<Segment>,
        virtuals: Arc<VirtualColumns>,
        rows: Vec<u32>,
        bucket_start: i64,
        cancel: QueryCancel,
    ) -> SegmentCursor {
        SegmentCursor {
            segment,
            virtuals,
            rows: Arc::new(rows),
            pos: Arc::new(AtomicUsize::new(0)),
            bucket_start,
            cancel,
        }
    }

    fn current_row(&self) -> Option<u32> {
        let p = self.pos.load(Ordering::Relaxed);
        self.rows.get(p).copied()
    }
}

/// Positions a reader at one fixed segment row; used while evaluating
/// residual filters during cursor construction.
pub(crate) struct SegmentRowReader<'a> {
    pub segment: &'a Segment,
    pub row: u32,
}

fn segment_dim_values(segment: &Segment, row: u32, dim: usize) -> Vec<String> {
    let col = segment.dim_column(dim);
    col.rows[row as usize]
        .iter()
        .filter_map(|id| col.dict.get(*id as usize).cloned())
        .collect()
}

fn segment_scalar(segment: &Segment, row: u32, name: &str) -> Scalar {
    if name == TIME_COLUMN {
        return Scalar::Long(segment.timestamp(row));
    }
    if let Some(d) = segment.dim_index(name) {
        let mut values = segment_dim_values(segment, row, d);
        return match values.len() {
            0 => Scalar::Null,
            1 => Scalar::String(values.pop().expect("one value")),
            _ => Scalar::Array(values.into_iter().map(Scalar::String).collect()),
        };
    }
    if let Some(m) = segment.metric_index(name) {
        if let MetricColumn::Complex { name: type_name, values } = segment.metric_column(m) {
            return Scalar::Complex {
                name: type_name.clone(),
                data: values[row as usize].clone(),
            };
        }
        return match segment.metric_state(row, m) {
            Ok(AggState::Long(v)) => Scalar::Long(v),
            Ok(AggState::Double(v)) => Scalar::Double(v),
            Ok(AggState::Float(v)) => Scalar::Float(v),
            _ => Scalar::Null,
        };
    }
    Scalar::Null
}

impl RowReader for SegmentRowReader<'_> {
    fn has_column(&self, name: &str) -> bool {
        name == TIME_COLUMN
            || self.segment.dim_index(name).is_some()
            || self.segment.metric_index(name).is_some()
    }

    fn dim_values(&self, name: &str) -> Vec<String> {
        match self.segment.dim_index(name) {
            Some(d) => segment_dim_values(self.segment, self.row, d),
            None => match segment_scalar(self.segment, self.row, name) {
                Scalar::Null => vec![String::new()],
                Scalar::String(s) => vec![s],
                other => vec![other.to_json().to_string()],
            },
        }
    }

    fn scalar(&self, name: &str) -> Scalar {
        segment_scalar(self.segment, self.row, name)
    }

    fn timestamp(&self) -> i64 {
        self.segment.timestamp(self.row)
    }
}

impl RowReader for SegmentCursor {
    fn has_column(&self, name: &str) -> bool {
        name == TIME_COLUMN
            || self.segment.dim_index(name).is_some()
            || self.segment.metric_index(name).is_some()
    }

    fn dim_values(&self, name: &str) -> Vec<String> {
        match self.current_row() {
            Some(row) => SegmentRowReader {
                segment: &self.segment,
                row,
            }
            .dim_values(name),
            None => Vec::new(),
        }
    }

    fn scalar(&self, name: &str) -> Scalar {
        match self.current_row() {
            Some(row) => segment_scalar(&self.segment, row, name),
            None => Scalar::Null,
        }
    }

    fn timestamp(&self) -> i64 {
        self.current_row()
            .map(|row| self.segment.timestamp(row))
            .unwrap_or(self.bucket_start)
    }
}

struct SegmentDimSelector {
    segment: Arc<Segment>,
    dim: usize,
    rows: Arc<Vec<u32>>,
    pos: Arc<AtomicUsize>,
}

impl DimensionSelector for SegmentDimSelector {
    fn row(&self) -> IndexedInts {
        let p = self.pos.load(Ordering::Relaxed);
        match self.rows.get(p) {
            Some(row) => self.segment.dim_column(self.dim).rows[*row as usize].clone(),
            None => IndexedInts::new(),
        }
    }

    fn lookup_name(&self, id: i32) -> Option<String> {
        self.segment
            .dim_column(self.dim)
            .dict
            .get(id as usize)
            .cloned()
    }

    fn lookup_id(&self, name: &str) -> Option<i32> {
        let dict = &self.segment.dim_column(self.dim).dict;
        dict.binary_search_by(|v| v.as_str().cmp(name))
            .ok()
            .map(|i| i as i32)
    }

    fn cardinality(&self) -> usize {
        self.segment.dim_column(self.dim).dict.len()
    }
}

impl ColumnSelectorFactory for SegmentCursor {
    fn dimension_selector(&self, name: &str) -> Result<Box<dyn DimensionSelector>> {
        let Some(dim) = self.segment.dim_index(name) else {
            return Err(BasaltError::IllegalArgument(format!(
                "{name} is not a dictionary-encoded dimension"
            )));
        };
        Ok(Box::new(SegmentDimSelector {
            segment: Arc::clone(&self.segment),
            dim,
            rows: Arc::clone(&self.rows),
            pos: Arc::clone(&self.pos),
        }))
    }

    fn float_selector(&self, name: &str) -> Result<Box<dyn FloatColumnSelector>> {
        let inner = self.double_selector(name)?;
        Ok(Box::new(FnFloat(Box::new(move || {
            Ok(inner.get_double()?.map(|v| v as f32))
        }))))
    }

    fn long_selector(&self, name: &str) -> Result<Box<dyn LongColumnSelector>> {
        let object = self.object_selector(name)?;
        Ok(Box::new(FnLong(Box::new(move || {
            Ok(object.get_object()?.as_long())
        }))))
    }

    fn double_selector(&self, name: &str) -> Result<Box<dyn DoubleColumnSelector>> {
        let object = self.object_selector(name)?;
        Ok(Box::new(FnDouble(Box::new(move || {
            Ok(object.get_object()?.as_double())
        }))))
    }

    fn object_selector(&self, name: &str) -> Result<Box<dyn ObjectColumnSelector>> {
        let desc = self
            .column_type(name)
            .unwrap_or(ValueDesc::String);
        if !self.has_column(name) && !self.virtuals.contains(name) {
            return Err(BasaltError::IllegalArgument(format!(
                "unknown column: {name}"
            )));
        }
        let segment = Arc::clone(&self.segment);
        let virtuals = Arc::clone(&self.virtuals);
        let rows = Arc::clone(&self.rows);
        let pos = Arc::clone(&self.pos);
        let name = name.to_string();
        let is_base = self.has_column(&name);
        Ok(Box::new(FnObject {
            desc,
            f: Box::new(move || {
                let p = pos.load(Ordering::Relaxed);
                let Some(row) = rows.get(p).copied() else {
                    return Ok(Scalar::Null);
                };
                if is_base {
                    Ok(segment_scalar(&segment, row, &name))
                } else {
                    let reader = SegmentRowReader {
                        segment: &segment,
                        row,
                    };
                    virtuals.resolve(&reader, &name)
                }
            }),
        }))
    }

    fn column_type(&self, name: &str) -> Option<ValueDesc> {
        self.segment
            .column_type(name)
            .or_else(|| self.virtuals.output_type(name))
    }
}

impl Cursor for SegmentCursor {
    fn time(&self) -> i64 {
        self.bucket_start
    }

    fn advance(&mut self) -> Result<()> {
        self.cancel.check()?;
        self.pos.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.pos.load(Ordering::Relaxed) >= self.rows.len()
    }

    fn reset(&mut self) {
        self.pos.store(0, Ordering::Relaxed);
    }
}

// ---- incremental cursor ----

pub struct IncrementalCursor {
    index: Arc<IncrementalIndex>,
    virtuals: Arc<VirtualColumns>,
    rows: Arc<Vec<usize>>,
    pos: Arc<AtomicUsize>,
    bucket_start: i64,
    cancel: QueryCancel,
}

impl IncrementalCursor {
    pub(crate) fn new(
        index: Arc<IncrementalIndex>,
        virtuals: Arc<VirtualColumns>,
        rows: Vec<usize>,
        bucket_start: i64,
        cancel: QueryCancel,
    ) -> IncrementalCursor {
        IncrementalCursor {
            index,
            virtuals,
            rows: Arc::new(rows),
            pos: Arc::new(AtomicUsize::new(0)),
            bucket_start,
            cancel,
        }
    }

    fn current_row(&self) -> Option<usize> {
        self.rows.get(self.pos.load(Ordering::Relaxed)).copied()
    }
}

/// Reader over one fixed incremental-index row.
pub(crate) struct IncrementalRowReader<'a> {
    pub index: &'a IncrementalIndex,
    pub row: usize,
}

fn incremental_dim_values(index: &IncrementalIndex, row: usize, dim: usize) -> Vec<String> {
    let inner = index.read_inner();
    let Some(slot) = inner.rows.get(row) else {
        return Vec::new();
    };
    slot.key.dims[dim]
        .iter()
        .filter_map(|id| inner.dicts[dim].name_of(*id).map(|s| s.to_string()))
        .collect()
}

fn incremental_scalar(index: &IncrementalIndex, row: usize, name: &str) -> Scalar {
    if name == TIME_COLUMN {
        let inner = index.read_inner();
        return inner
            .rows
            .get(row)
            .map(|slot| Scalar::Long(slot.key.timestamp))
            .unwrap_or(Scalar::Null);
    }
    if let Some(d) = index.dimension_index(name) {
        let mut values = incremental_dim_values(index, row, d);
        return match values.len() {
            0 => Scalar::Null,
            1 => Scalar::String(values.pop().expect("one value")),
            _ => Scalar::Array(values.into_iter().map(Scalar::String).collect()),
        };
    }
    if let Some(m) = index.metric_index(name) {
        let desc = index.schema().metrics[m].intermediate_type();
        return state_scalar(index.metric_value(row, m), &desc).unwrap_or(Scalar::Null);
    }
    Scalar::Null
}

impl RowReader for IncrementalRowReader<'_> {
    fn has_column(&self, name: &str) -> bool {
        name == TIME_COLUMN
            || self.index.dimension_index(name).is_some()
            || self.index.metric_index(name).is_some()
    }

    fn dim_values(&self, name: &str) -> Vec<String> {
        match self.index.dimension_index(name) {
            Some(d) => incremental_dim_values(self.index, self.row, d),
            None => match incremental_scalar(self.index, self.row, name) {
                Scalar::Null => vec![String::new()],
                Scalar::String(s) => vec![s],
                other => vec![other.to_json().to_string()],
            },
        }
    }

    fn scalar(&self, name: &str) -> Scalar {
        incremental_scalar(self.index, self.row, name)
    }

    fn timestamp(&self) -> i64 {
        match incremental_scalar(self.index, self.row, TIME_COLUMN) {
            Scalar::Long(ts) => ts,
            _ => 0,
        }
    }
}

impl RowReader for IncrementalCursor {
    fn has_column(&self, name: &str) -> bool {
        name == TIME_COLUMN
            || self.index.dimension_index(name).is_some()
            || self.index.metric_index(name).is_some()
    }

    fn dim_values(&self, name: &str) -> Vec<String> {
        match self.current_row() {
            Some(row) => IncrementalRowReader {
                index: &self.index,
                row,
            }
            .dim_values(name),
            None => Vec::new(),
        }
    }

    fn scalar(&self, name: &str) -> Scalar {
        match self.current_row() {
            Some(row) => incremental_scalar(&self.index, row, name),
            None => Scalar::Null,
        }
    }

    fn timestamp(&self) -> i64 {
        match self.current_row() {
            Some(row) => IncrementalRowReader {
                index: &self.index,
                row,
            }
            .timestamp(),
            None => self.bucket_start,
        }
    }
}

struct IncrementalDimSelector {
    index: Arc<IncrementalIndex>,
    dim: usize,
    rows: Arc<Vec<usize>>,
    pos: Arc<AtomicUsize>,
}

impl DimensionSelector for IncrementalDimSelector {
    fn row(&self) -> IndexedInts {
        let p = self.pos.load(Ordering::Relaxed);
        let Some(row) = self.rows.get(p) else {
            return IndexedInts::new();
        };
        let inner = self.index.read_inner();
        inner
            .rows
            .get(*row)
            .map(|slot| slot.key.dims[self.dim].clone())
            .unwrap_or_default()
    }

    fn lookup_name(&self, id: i32) -> Option<String> {
        let inner = self.index.read_inner();
        inner.dicts[self.dim].name_of(id).map(|s| s.to_string())
    }

    fn lookup_id(&self, name: &str) -> Option<i32> {
        let inner = self.index.read_inner();
        inner.dicts[self.dim].get_id(name)
    }

    fn cardinality(&self) -> usize {
        self.index.read_inner().dicts[self.dim].len()
    }
}

impl ColumnSelectorFactory for IncrementalCursor {
    fn dimension_selector(&self, name: &str) -> Result<Box<dyn DimensionSelector>> {
        let Some(dim) = self.index.dimension_index(name) else {
            return Err(BasaltError::IllegalArgument(format!(
                "{name} is not a dictionary-encoded dimension"
            )));
        };
        Ok(Box::new(IncrementalDimSelector {
            index: Arc::clone(&self.index),
            dim,
            rows: Arc::clone(&self.rows),
            pos: Arc::clone(&self.pos),
        }))
    }

    fn float_selector(&self, name: &str) -> Result<Box<dyn FloatColumnSelector>> {
        let inner = self.double_selector(name)?;
        Ok(Box::new(FnFloat(Box::new(move || {
            Ok(inner.get_double()?.map(|v| v as f32))
        }))))
    }

    fn long_selector(&self, name: &str) -> Result<Box<dyn LongColumnSelector>> {
        let object = self.object_selector(name)?;
        Ok(Box::new(FnLong(Box::new(move || {
            Ok(object.get_object()?.as_long())
        }))))
    }

    fn double_selector(&self, name: &str) -> Result<Box<dyn DoubleColumnSelector>> {
        let object = self.object_selector(name)?;
        Ok(Box::new(FnDouble(Box::new(move || {
            Ok(object.get_object()?.as_double())
        }))))
    }

    fn object_selector(&self, name: &str) -> Result<Box<dyn ObjectColumnSelector>> {
        if !self.has_column(name) && !self.virtuals.contains(name) {
            return Err(BasaltError::IllegalArgument(format!(
                "unknown column: {name}"
            )));
        }
        let desc = self.column_type(name).unwrap_or(ValueDesc::String);
        let index = Arc::clone(&self.index);
        let virtuals = Arc::clone(&self.virtuals);
        let rows = Arc::clone(&self.rows);
        let pos = Arc::clone(&self.pos);
        let name = name.to_string();
        let is_base = self.has_column(&name);
        Ok(Box::new(FnObject {
            desc,
            f: Box::new(move || {
                let p = pos.load(Ordering::Relaxed);
                let Some(row) = rows.get(p).copied() else {
                    return Ok(Scalar::Null);
                };
                if is_base {
                    Ok(incremental_scalar(&index, row, &name))
                } else {
                    let reader = IncrementalRowReader { index: &index, row };
                    virtuals.resolve(&reader, &name)
                }
            }),
        }))
    }

    fn column_type(&self, name: &str) -> Option<ValueDesc> {
        if name == TIME_COLUMN {
            return Some(ValueDesc::Long);
        }
        if self.index.dimension_index(name).is_some() {
            return Some(ValueDesc::Dimension);
        }
        if let Some(m) = self.index.metric_index(name) {
            return Some(self.index.schema().metrics[m].intermediate_type());
        }
        self.virtuals.output_type(name)
    }
}

impl Cursor for IncrementalCursor {
    fn time(&self) -> i64 {
        self.bucket_start
    }

    fn advance(&mut self) -> Result<()> {
        self.cancel.check()?;
        self.pos.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.pos.load(Ordering::Relaxed) >= self.rows.len()
    }

    fn reset(&mut self) {
        self.pos.store(0, Ordering::Relaxed);
    }
}
