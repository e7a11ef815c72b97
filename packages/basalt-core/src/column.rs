//! Column read surface shared by the storage plane and the aggregators.
//!
//! Cursors hand out typed selectors bound to their current position;
//! aggregator factories bind against a [`ColumnSelectorFactory`] without
//! knowing whether the backing store is an incremental index, an immutable
//! segment, or a raw ingestion row.

use smallvec::SmallVec;

use crate::error::Result;
use crate::value::{Scalar, ValueDesc};

/// Ordered dictionary ids of the current row; multi-valued dimensions carry
/// one id per value in input order.
pub type IndexedInts = SmallVec<[i32; 4]>;

pub trait DimensionSelector: Send + Sync {
    fn row(&self) -> IndexedInts;
    fn lookup_name(&self, id: i32) -> Option<String>;
    fn lookup_id(&self, name: &str) -> Option<i32>;
    fn cardinality(&self) -> usize;

    /// Current row rendered as strings; the common read path for residual
    /// filters and group-by keys.
    fn values(&self) -> Vec<String> {
        self.row()
            .iter()
            .filter_map(|id| self.lookup_name(*id))
            .collect()
    }
}

pub trait FloatColumnSelector: Send + Sync {
    fn get_float(&self) -> Result<Option<f32>>;
}

pub trait LongColumnSelector: Send + Sync {
    fn get_long(&self) -> Result<Option<i64>>;
}

pub trait DoubleColumnSelector: Send + Sync {
    fn get_double(&self) -> Result<Option<f64>>;
}

pub trait ObjectColumnSelector: Send + Sync {
    fn value_desc(&self) -> ValueDesc;
    fn get_object(&self) -> Result<Scalar>;
}

/// Creates selectors bound to the caller's current-row notion.
pub trait ColumnSelectorFactory {
    fn dimension_selector(&self, name: &str) -> Result<Box<dyn DimensionSelector>>;
    fn float_selector(&self, name: &str) -> Result<Box<dyn FloatColumnSelector>>;
    fn long_selector(&self, name: &str) -> Result<Box<dyn LongColumnSelector>>;
    fn double_selector(&self, name: &str) -> Result<Box<dyn DoubleColumnSelector>>;
    fn object_selector(&self, name: &str) -> Result<Box<dyn ObjectColumnSelector>>;
    fn column_type(&self, name: &str) -> Option<ValueDesc>;
}
