//! Basalt aggregator protocol.
//!
//! Partial aggregates live either in-heap (boxed [`Aggregator`]) or off-heap
//! (a fixed-size span written through a [`BufferAggregator`]). Factories are
//! the serde-tagged [`AggregatorSpec`] variants; each declares its output
//! name, the columns it reads, the result type, a byte budget for the buffer
//! form, an associative combiner, and an idempotent finalizer.

mod fold;
mod histogram;
mod postagg;
mod registry;
mod simple;
mod sketch;
mod spec;
mod state;
mod stats;

pub use postagg::PostAggregatorSpec;
pub use registry::{ComplexRegistry, ComplexSerde};
pub use sketch::hll::HllCollector;
pub use sketch::theta::ThetaSketch;
pub use spec::AggregatorSpec;
pub use state::AggState;

use basalt_core::Result;

/// In-heap partial aggregate bound to its input selectors at creation.
pub trait Aggregator: Send + Sync {
    /// Read the bound columns at the current cursor position and fold them
    /// into the state.
    fn aggregate(&mut self) -> Result<()>;

    fn get(&self) -> AggState;

    fn reset(&mut self);

    fn close(&mut self) {}

    fn get_float(&self) -> Result<f32> {
        unsupported("float")
    }

    fn get_long(&self) -> Result<i64> {
        unsupported("long")
    }

    fn get_double(&self) -> Result<f64> {
        unsupported("double")
    }
}

fn unsupported<T>(kind: &str) -> Result<T> {
    Err(basalt_core::BasaltError::IllegalArgument(format!(
        "{kind} accessor not supported by this aggregator"
    )))
}

/// Off-heap partial aggregate: state is a span at `(buf, pos)` of at most
/// `max_intermediate_size()` bytes. The engine guarantees exclusive access
/// to each slot during an update and never hands a span past the declared
/// size.
pub trait BufferAggregator: Send + Sync {
    fn init(&self, buf: &mut [u8], pos: usize);

    fn aggregate(&mut self, buf: &mut [u8], pos: usize) -> Result<()>;

    fn get(&self, buf: &[u8], pos: usize) -> AggState;

    fn get_float(&self, buf: &[u8], pos: usize) -> Result<f32> {
        let _ = (buf, pos);
        unsupported("float")
    }

    fn get_long(&self, buf: &[u8], pos: usize) -> Result<i64> {
        let _ = (buf, pos);
        unsupported("long")
    }

    fn get_double(&self, buf: &[u8], pos: usize) -> Result<f64> {
        let _ = (buf, pos);
        unsupported("double")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_core::Scalar;

    #[test]
    fn test_spec_round_trip() {
        let json = r#"{"type":"doubleSum","name":"total","fieldName":"price"}"#;
        let spec: AggregatorSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.output_name(), "total");
        assert_eq!(spec.field_names(), vec!["price".to_string()]);
        let back = serde_json::to_value(&spec).unwrap();
        assert_eq!(back["type"], "doubleSum");
    }

    #[test]
    fn test_count_combine() {
        let spec: AggregatorSpec =
            serde_json::from_str(r#"{"type":"count","name":"c"}"#).unwrap();
        let merged = spec
            .combine(AggState::Long(2), AggState::Long(3))
            .unwrap();
        assert_eq!(spec.finalize(&merged), Scalar::Long(5));
    }
}
