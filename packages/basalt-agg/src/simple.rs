//! Count, sum, min and max in both aggregator forms.

use basalt_core::{
    DoubleColumnSelector, FloatColumnSelector, LongColumnSelector, Result,
};

use crate::state::AggState;
use crate::{Aggregator, BufferAggregator};

// ---- on-heap ----

pub struct CountAgg {
    count: i64,
}

impl CountAgg {
    pub fn new() -> CountAgg {
        CountAgg { count: 0 }
    }
}

impl Aggregator for CountAgg {
    fn aggregate(&mut self) -> Result<()> {
        self.count += 1;
        Ok(())
    }

    fn get(&self) -> AggState {
        AggState::Long(self.count)
    }

    fn reset(&mut self) {
        self.count = 0;
    }

    fn get_long(&self) -> Result<i64> {
        Ok(self.count)
    }

    fn get_double(&self) -> Result<f64> {
        Ok(self.count as f64)
    }

    fn get_float(&self) -> Result<f32> {
        Ok(self.count as f32)
    }
}

/// Fold of an optional accumulator over non-null doubles. Sum starts from
/// the first value; min/max skip nulls by construction.
pub struct DoubleFoldAgg {
    selector: Box<dyn DoubleColumnSelector>,
    fold: fn(f64, f64) -> f64,
    /// State when no input arrived: 0 for sums, null for min/max.
    empty: AggState,
    acc: Option<f64>,
}

impl DoubleFoldAgg {
    pub fn new(
        selector: Box<dyn DoubleColumnSelector>,
        fold: fn(f64, f64) -> f64,
        empty: AggState,
    ) -> DoubleFoldAgg {
        DoubleFoldAgg {
            selector,
            fold,
            empty,
            acc: None,
        }
    }
}

impl Aggregator for DoubleFoldAgg {
    fn aggregate(&mut self) -> Result<()> {
        if let Some(v) = self.selector.get_double()? {
            self.acc = Some(match self.acc {
                Some(acc) => (self.fold)(acc, v),
                None => v,
            });
        }
        Ok(())
    }

    fn get(&self) -> AggState {
        match self.acc {
            Some(v) => AggState::Double(v),
            None => self.empty.clone(),
        }
    }

    fn reset(&mut self) {
        self.acc = None;
    }

    fn get_double(&self) -> Result<f64> {
        Ok(self.acc.unwrap_or(0.0))
    }

    fn get_float(&self) -> Result<f32> {
        Ok(self.acc.unwrap_or(0.0) as f32)
    }

    fn get_long(&self) -> Result<i64> {
        Ok(self.acc.unwrap_or(0.0) as i64)
    }
}

pub struct LongFoldAgg {
    selector: Box<dyn LongColumnSelector>,
    fold: fn(i64, i64) -> i64,
    empty: AggState,
    acc: Option<i64>,
}

impl LongFoldAgg {
    pub fn new(
        selector: Box<dyn LongColumnSelector>,
        fold: fn(i64, i64) -> i64,
        empty: AggState,
    ) -> LongFoldAgg {
        LongFoldAgg {
            selector,
            fold,
            empty,
            acc: None,
        }
    }
}

impl Aggregator for LongFoldAgg {
    fn aggregate(&mut self) -> Result<()> {
        if let Some(v) = self.selector.get_long()? {
            self.acc = Some(match self.acc {
                Some(acc) => (self.fold)(acc, v),
                None => v,
            });
        }
        Ok(())
    }

    fn get(&self) -> AggState {
        match self.acc {
            Some(v) => AggState::Long(v),
            None => self.empty.clone(),
        }
    }

    fn reset(&mut self) {
        self.acc = None;
    }

    fn get_long(&self) -> Result<i64> {
        Ok(self.acc.unwrap_or(0))
    }

    fn get_double(&self) -> Result<f64> {
        Ok(self.acc.unwrap_or(0) as f64)
    }

    fn get_float(&self) -> Result<f32> {
        Ok(self.acc.unwrap_or(0) as f32)
    }
}

pub struct FloatFoldAgg {
    selector: Box<dyn FloatColumnSelector>,
    fold: fn(f32, f32) -> f32,
    empty: AggState,
    acc: Option<f32>,
}

impl FloatFoldAgg {
    pub fn new(
        selector: Box<dyn FloatColumnSelector>,
        fold: fn(f32, f32) -> f32,
        empty: AggState,
    ) -> FloatFoldAgg {
        FloatFoldAgg {
            selector,
            fold,
            empty,
            acc: None,
        }
    }
}

impl Aggregator for FloatFoldAgg {
    fn aggregate(&mut self) -> Result<()> {
        if let Some(v) = self.selector.get_float()? {
            self.acc = Some(match self.acc {
                Some(acc) => (self.fold)(acc, v),
                None => v,
            });
        }
        Ok(())
    }

    fn get(&self) -> AggState {
        match self.acc {
            Some(v) => AggState::Float(v),
            None => self.empty.clone(),
        }
    }

    fn reset(&mut self) {
        self.acc = None;
    }

    fn get_float(&self) -> Result<f32> {
        Ok(self.acc.unwrap_or(0.0))
    }

    fn get_double(&self) -> Result<f64> {
        Ok(self.acc.unwrap_or(0.0) as f64)
    }

    fn get_long(&self) -> Result<i64> {
        Ok(self.acc.unwrap_or(0.0) as i64)
    }
}

// ---- buffer forms ----
//
// Layouts are little-endian. Count: [i64]. Folds: [flag u8][value], flag 0
// means no input seen yet.

pub(crate) fn read_i64(buf: &[u8], pos: usize) -> i64 {
    i64::from_le_bytes(buf[pos..pos + 8].try_into().expect("8-byte span"))
}

pub(crate) fn write_i64(buf: &mut [u8], pos: usize, v: i64) {
    buf[pos..pos + 8].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn read_f64(buf: &[u8], pos: usize) -> f64 {
    f64::from_le_bytes(buf[pos..pos + 8].try_into().expect("8-byte span"))
}

pub(crate) fn write_f64(buf: &mut [u8], pos: usize, v: f64) {
    buf[pos..pos + 8].copy_from_slice(&v.to_le_bytes());
}

pub struct CountBufferAgg;

impl BufferAggregator for CountBufferAgg {
    fn init(&self, buf: &mut [u8], pos: usize) {
        write_i64(buf, pos, 0);
    }

    fn aggregate(&mut self, buf: &mut [u8], pos: usize) -> Result<()> {
        write_i64(buf, pos, read_i64(buf, pos) + 1);
        Ok(())
    }

    fn get(&self, buf: &[u8], pos: usize) -> AggState {
        AggState::Long(read_i64(buf, pos))
    }

    fn get_long(&self, buf: &[u8], pos: usize) -> Result<i64> {
        Ok(read_i64(buf, pos))
    }

    fn get_double(&self, buf: &[u8], pos: usize) -> Result<f64> {
        Ok(read_i64(buf, pos) as f64)
    }
}

pub struct DoubleFoldBufferAgg {
    selector: Box<dyn DoubleColumnSelector>,
    fold: fn(f64, f64) -> f64,
    empty: AggState,
}

impl DoubleFoldBufferAgg {
    pub fn new(
        selector: Box<dyn DoubleColumnSelector>,
        fold: fn(f64, f64) -> f64,
        empty: AggState,
    ) -> DoubleFoldBufferAgg {
        DoubleFoldBufferAgg {
            selector,
            fold,
            empty,
        }
    }

    pub const SIZE: usize = 9;
}

impl BufferAggregator for DoubleFoldBufferAgg {
    fn init(&self, buf: &mut [u8], pos: usize) {
        buf[pos] = 0;
        write_f64(buf, pos + 1, 0.0);
    }

    fn aggregate(&mut self, buf: &mut [u8], pos: usize) -> Result<()> {
        if let Some(v) = self.selector.get_double()? {
            if buf[pos] == 0 {
                buf[pos] = 1;
                write_f64(buf, pos + 1, v);
            } else {
                let acc = read_f64(buf, pos + 1);
                write_f64(buf, pos + 1, (self.fold)(acc, v));
            }
        }
        Ok(())
    }

    fn get(&self, buf: &[u8], pos: usize) -> AggState {
        if buf[pos] == 0 {
            self.empty.clone()
        } else {
            AggState::Double(read_f64(buf, pos + 1))
        }
    }

    fn get_double(&self, buf: &[u8], pos: usize) -> Result<f64> {
        Ok(if buf[pos] == 0 {
            0.0
        } else {
            read_f64(buf, pos + 1)
        })
    }
}

pub struct LongFoldBufferAgg {
    selector: Box<dyn LongColumnSelector>,
    fold: fn(i64, i64) -> i64,
    empty: AggState,
}

impl LongFoldBufferAgg {
    pub fn new(
        selector: Box<dyn LongColumnSelector>,
        fold: fn(i64, i64) -> i64,
        empty: AggState,
    ) -> LongFoldBufferAgg {
        LongFoldBufferAgg {
            selector,
            fold,
            empty,
        }
    }

    pub const SIZE: usize = 9;
}

impl BufferAggregator for LongFoldBufferAgg {
    fn init(&self, buf: &mut [u8], pos: usize) {
        buf[pos] = 0;
        write_i64(buf, pos + 1, 0);
    }

    fn aggregate(&mut self, buf: &mut [u8], pos: usize) -> Result<()> {
        if let Some(v) = self.selector.get_long()? {
            if buf[pos] == 0 {
                buf[pos] = 1;
                write_i64(buf, pos + 1, v);
            } else {
                let acc = read_i64(buf, pos + 1);
                write_i64(buf, pos + 1, (self.fold)(acc, v));
            }
        }
        Ok(())
    }

    fn get(&self, buf: &[u8], pos: usize) -> AggState {
        if buf[pos] == 0 {
            self.empty.clone()
        } else {
            AggState::Long(read_i64(buf, pos + 1))
        }
    }

    fn get_long(&self, buf: &[u8], pos: usize) -> Result<i64> {
        Ok(if buf[pos] == 0 {
            0
        } else {
            read_i64(buf, pos + 1)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedDouble(Option<f64>);

    impl DoubleColumnSelector for FixedDouble {
        fn get_double(&self) -> Result<Option<f64>> {
            Ok(self.0)
        }
    }

    #[test]
    fn test_double_sum_skips_null() {
        let mut agg =
            DoubleFoldAgg::new(Box::new(FixedDouble(Some(2.5))), |a, b| a + b, AggState::Double(0.0));
        agg.aggregate().unwrap();
        agg.aggregate().unwrap();
        assert_eq!(agg.get(), AggState::Double(5.0));

        let mut empty =
            DoubleFoldAgg::new(Box::new(FixedDouble(None)), |a, b| a + b, AggState::Double(0.0));
        empty.aggregate().unwrap();
        assert_eq!(empty.get(), AggState::Double(0.0));
    }

    #[test]
    fn test_min_empty_is_null() {
        let agg = DoubleFoldAgg::new(Box::new(FixedDouble(None)), f64::min, AggState::Null);
        assert_eq!(agg.get(), AggState::Null);
    }

    #[test]
    fn test_buffer_count_slot() {
        let mut buf = vec![0u8; 16];
        let mut agg = CountBufferAgg;
        agg.init(&mut buf, 4);
        agg.aggregate(&mut buf, 4).unwrap();
        agg.aggregate(&mut buf, 4).unwrap();
        assert_eq!(agg.get(&buf, 4), AggState::Long(2));
    }

    #[test]
    fn test_buffer_fold_flag() {
        let mut buf = vec![0u8; 9];
        let mut agg = DoubleFoldBufferAgg::new(
            Box::new(FixedDouble(Some(3.0))),
            f64::max,
            AggState::Null,
        );
        agg.init(&mut buf, 0);
        assert_eq!(agg.get(&buf, 0), AggState::Null);
        agg.aggregate(&mut buf, 0).unwrap();
        assert_eq!(agg.get(&buf, 0), AggState::Double(3.0));
    }
}
