//! Basalt core - shared vocabulary of the engine
//!
//! Everything here is deliberately dependency-light: the value model,
//! the row abstraction, time math (intervals and granularities), the
//! engine-wide error kinds, and the closeable sequence used to stream
//! results between crates.

mod cancel;
mod column;
mod error;
mod row;
mod sequence;
mod time;
mod value;

pub use cancel::QueryCancel;
pub use column::{
    ColumnSelectorFactory, DimensionSelector, DoubleColumnSelector, FloatColumnSelector,
    IndexedInts, LongColumnSelector, ObjectColumnSelector,
};
pub use error::{BasaltError, Result, WireError};
pub use row::Row;
pub use sequence::Sequence;
pub use time::{format_timestamp, parse_timestamp, Granularity, Interval};
pub use value::{compare_scalars, parse_numeric, Scalar, ValueDesc, ValueKind};

/// Reserved name of the time column on every cursor.
pub const TIME_COLUMN: &str = "__time";
