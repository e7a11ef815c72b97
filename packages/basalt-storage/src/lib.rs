//! Basalt storage plane.
//!
//! Two row stores share one read surface: the append-only in-memory
//! incremental index that receives freshly ingested rows, and the immutable
//! column-oriented segment it persists into. Queries see both through
//! [`StorageAdapter`]: filters compile to bitmap/residual pairs, cursors walk
//! granularity buckets handing out typed column selectors.

mod adapter;
mod cursor;
mod dictionary;
mod filter;
mod incremental;
mod segment;
mod virtual_columns;

pub use adapter::{
    ColumnCapabilities, IncrementalAdapter, ScanSpec, SegmentAdapter, StorageAdapter,
};
pub use cursor::{Cursor, IncrementalCursor, RowReader, SegmentCursor};
pub use dictionary::DimDict;
pub use filter::{
    BitmapSource, CompiledFilter, DimFilter, FilterContext, RowMatcher, SpatialOp, StringRange,
};
pub use incremental::{IncrementalIndex, IndexKey, IndexSchema};
pub use segment::{ColumnAnalysis, Segment, SegmentId};
pub use virtual_columns::{VirtualColumnSpec, VirtualColumns};
