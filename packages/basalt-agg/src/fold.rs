//! On-heap aggregators for the stateful families: a generic single-input
//! fold plus the two-input and ordered variants.

use basalt_core::{
    BasaltError, DoubleColumnSelector, LongColumnSelector, ObjectColumnSelector, Result, Scalar,
};
use basalt_expr::{Expr, NumericBinding};

use crate::state::AggState;
use crate::Aggregator;

/// Single-input family: the update fn folds one scalar into the state.
/// Configuration lives inside the initial state (histogram limits, sketch
/// sizes), so the fn pointer stays capture-free.
pub struct StateFoldAgg {
    selector: Box<dyn ObjectColumnSelector>,
    init: AggState,
    state: AggState,
    update: fn(&mut AggState, Scalar),
}

impl StateFoldAgg {
    pub fn new(
        selector: Box<dyn ObjectColumnSelector>,
        init: AggState,
        update: fn(&mut AggState, Scalar),
    ) -> StateFoldAgg {
        StateFoldAgg {
            selector,
            state: init.clone(),
            init,
            update,
        }
    }
}

impl Aggregator for StateFoldAgg {
    fn aggregate(&mut self) -> Result<()> {
        let value = self.selector.get_object()?;
        (self.update)(&mut self.state, value);
        Ok(())
    }

    fn get(&self) -> AggState {
        self.state.clone()
    }

    fn reset(&mut self) {
        self.state = self.init.clone();
    }

    fn get_double(&self) -> Result<f64> {
        self.state
            .as_double()
            .ok_or_else(|| BasaltError::IllegalArgument("state has no numeric view".into()))
    }
}

/// Two-input numeric family (covariance / pearson).
pub struct PairFoldAgg {
    x: Box<dyn DoubleColumnSelector>,
    y: Box<dyn DoubleColumnSelector>,
    state: AggState,
}

impl PairFoldAgg {
    pub fn new(x: Box<dyn DoubleColumnSelector>, y: Box<dyn DoubleColumnSelector>) -> PairFoldAgg {
        PairFoldAgg {
            x,
            y,
            state: AggState::Covariance(Default::default()),
        }
    }
}

impl Aggregator for PairFoldAgg {
    fn aggregate(&mut self) -> Result<()> {
        let (Some(x), Some(y)) = (self.x.get_double()?, self.y.get_double()?) else {
            return Ok(());
        };
        if let AggState::Covariance(state) = &mut self.state {
            state.add(x, y);
        }
        Ok(())
    }

    fn get(&self) -> AggState {
        self.state.clone()
    }

    fn reset(&mut self) {
        self.state = AggState::Covariance(Default::default());
    }
}

#[derive(Clone, Copy, PartialEq)]
pub enum RelayMode {
    First,
    Last,
}

/// Verbatim first/last value, ordered by the row time column.
pub struct RelayAgg {
    mode: RelayMode,
    time: Box<dyn LongColumnSelector>,
    value: Box<dyn ObjectColumnSelector>,
    state: AggState,
}

impl RelayAgg {
    pub fn new(
        mode: RelayMode,
        time: Box<dyn LongColumnSelector>,
        value: Box<dyn ObjectColumnSelector>,
    ) -> RelayAgg {
        RelayAgg {
            mode,
            time,
            value,
            state: AggState::Null,
        }
    }
}

impl Aggregator for RelayAgg {
    fn aggregate(&mut self) -> Result<()> {
        let ts = self.time.get_long()?.unwrap_or(0);
        let value = self.value.get_object()?;
        let replace = match &self.state {
            AggState::Null => true,
            AggState::Relay { timestamp, .. } => match self.mode {
                RelayMode::First => ts < *timestamp,
                RelayMode::Last => ts >= *timestamp,
            },
            _ => true,
        };
        if replace {
            self.state = AggState::Relay {
                timestamp: ts,
                value,
            };
        }
        Ok(())
    }

    fn get(&self) -> AggState {
        self.state.clone()
    }

    fn reset(&mut self) {
        self.state = AggState::Null;
    }
}

/// Buffer form of variance: `[count i64][mean f64][m2 f64]`, 24 bytes.
pub struct VarianceBufferAgg {
    selector: Box<dyn DoubleColumnSelector>,
}

impl VarianceBufferAgg {
    pub fn new(selector: Box<dyn DoubleColumnSelector>) -> VarianceBufferAgg {
        VarianceBufferAgg { selector }
    }

    pub const SIZE: usize = 24;

    fn read(buf: &[u8], pos: usize) -> crate::stats::VarianceState {
        crate::stats::VarianceState {
            count: crate::simple::read_i64(buf, pos),
            mean: crate::simple::read_f64(buf, pos + 8),
            m2: crate::simple::read_f64(buf, pos + 16),
        }
    }

    fn write(buf: &mut [u8], pos: usize, state: &crate::stats::VarianceState) {
        crate::simple::write_i64(buf, pos, state.count);
        crate::simple::write_f64(buf, pos + 8, state.mean);
        crate::simple::write_f64(buf, pos + 16, state.m2);
    }
}

impl crate::BufferAggregator for VarianceBufferAgg {
    fn init(&self, buf: &mut [u8], pos: usize) {
        Self::write(buf, pos, &Default::default());
    }

    fn aggregate(&mut self, buf: &mut [u8], pos: usize) -> Result<()> {
        if let Some(v) = self.selector.get_double()? {
            let mut state = Self::read(buf, pos);
            state.add(v);
            Self::write(buf, pos, &state);
        }
        Ok(())
    }

    fn get(&self, buf: &[u8], pos: usize) -> AggState {
        AggState::Variance(Self::read(buf, pos))
    }

    fn get_double(&self, buf: &[u8], pos: usize) -> Result<f64> {
        Ok(Self::read(buf, pos).variance_population())
    }
}

/// Expression-language aggregation: the update expression sees every bound
/// column plus the accumulator under `__acc`.
pub struct ExprAgg {
    expr: Expr,
    inputs: Vec<(String, Box<dyn ObjectColumnSelector>)>,
    state: AggState,
}

pub const ACCUMULATOR_NAME: &str = "__acc";

impl ExprAgg {
    pub fn new(expr: Expr, inputs: Vec<(String, Box<dyn ObjectColumnSelector>)>) -> ExprAgg {
        ExprAgg {
            expr,
            inputs,
            state: AggState::Null,
        }
    }
}

struct ExprAggBinding<'a> {
    inputs: &'a [(String, Box<dyn ObjectColumnSelector>)],
    acc: Scalar,
}

impl NumericBinding for ExprAggBinding<'_> {
    fn get(&self, name: &str) -> Scalar {
        if name == ACCUMULATOR_NAME {
            return self.acc.clone();
        }
        self.inputs
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, sel)| sel.get_object().ok())
            .unwrap_or(Scalar::Null)
    }
}

impl Aggregator for ExprAgg {
    fn aggregate(&mut self) -> Result<()> {
        let acc = match &self.state {
            AggState::Value(v) => v.clone(),
            _ => Scalar::Null,
        };
        let binding = ExprAggBinding {
            inputs: &self.inputs,
            acc,
        };
        let next = self.expr.eval(&binding)?;
        self.state = AggState::Value(next);
        Ok(())
    }

    fn get(&self) -> AggState {
        self.state.clone()
    }

    fn reset(&mut self) {
        self.state = AggState::Null;
    }
}
