//! Basalt expression language.
//!
//! A pure-function language used wherever computed columns and predicates
//! appear: virtual columns, expression filters, having clauses, and
//! post-aggregation arithmetic. Expressions compile once (constant folding
//! happens at parse time, function constants at factory time) and evaluate
//! against a [`NumericBinding`] mapping names to values.

mod builtins;
pub mod geom;
mod lexer;
mod parser;

use std::collections::BTreeSet;
use std::sync::Arc;

use basalt_core::{BasaltError, Result, Scalar, ValueDesc};

pub use parser::parse;

/// Value source for evaluation: name → current value.
pub trait NumericBinding {
    fn get(&self, name: &str) -> Scalar;
}

impl NumericBinding for std::collections::HashMap<String, Scalar> {
    fn get(&self, name: &str) -> Scalar {
        self.get(name).cloned().unwrap_or(Scalar::Null)
    }
}

/// Type source so inference can run without a row.
pub trait TypeBinding {
    fn type_of(&self, name: &str) -> Option<ValueDesc>;
}

/// A compiled builtin: validated arity, folded constants, ready to apply.
pub trait Function: Send + Sync {
    fn apply(&self, args: &[Scalar]) -> Result<Scalar>;
    fn output_type(&self, arg_types: &[Option<ValueDesc>]) -> Option<ValueDesc>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Minus,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

/// Compiled expression tree.
#[derive(Clone)]
pub enum Expr {
    Literal(Scalar),
    Identifier(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        name: String,
        function: Arc<dyn Function>,
        args: Vec<Expr>,
    },
}

impl std::fmt::Debug for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{v:?}"),
            Expr::Identifier(name) => write!(f, "{name}"),
            Expr::Unary { op, operand } => write!(f, "({op:?} {operand:?})"),
            Expr::Binary { op, left, right } => write!(f, "({left:?} {op:?} {right:?})"),
            Expr::Call { name, args, .. } => write!(f, "{name}({args:?})"),
        }
    }
}

impl Expr {
    /// Column names this expression reads; used for schema validation and
    /// filter dependency discovery.
    pub fn required_bindings(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_bindings(&mut out);
        out
    }

    fn collect_bindings(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Identifier(name) => {
                out.insert(name.clone());
            }
            Expr::Unary { operand, .. } => operand.collect_bindings(out),
            Expr::Binary { left, right, .. } => {
                left.collect_bindings(out);
                right.collect_bindings(out);
            }
            Expr::Call { args, .. } => {
                for a in args {
                    a.collect_bindings(out);
                }
            }
        }
    }

    pub fn is_constant(&self) -> bool {
        self.required_bindings().is_empty()
    }

    pub fn eval(&self, binding: &dyn NumericBinding) -> Result<Scalar> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Identifier(name) => Ok(binding.get(name)),
            Expr::Unary { op, operand } => {
                let v = operand.eval(binding)?;
                eval_unary(*op, v)
            }
            Expr::Binary { op, left, right } => {
                // && and || short-circuit; null comparisons are false
                match op {
                    BinaryOp::And => {
                        let l = left.eval(binding)?;
                        if !l.truthy() {
                            return Ok(Scalar::bool(false));
                        }
                        Ok(Scalar::bool(right.eval(binding)?.truthy()))
                    }
                    BinaryOp::Or => {
                        let l = left.eval(binding)?;
                        if l.truthy() {
                            return Ok(Scalar::bool(true));
                        }
                        Ok(Scalar::bool(right.eval(binding)?.truthy()))
                    }
                    _ => {
                        let l = left.eval(binding)?;
                        let r = right.eval(binding)?;
                        eval_binary(*op, l, r)
                    }
                }
            }
            Expr::Call {
                function, args, ..
            } => {
                let mut values = Vec::with_capacity(args.len());
                for a in args {
                    values.push(a.eval(binding)?);
                }
                function.apply(&values)
            }
        }
    }

    /// Static type of the expression result, when derivable.
    pub fn infer_type(&self, binding: &dyn TypeBinding) -> Option<ValueDesc> {
        match self {
            Expr::Literal(Scalar::Long(_)) => Some(ValueDesc::Long),
            Expr::Literal(Scalar::Double(_)) => Some(ValueDesc::Double),
            Expr::Literal(Scalar::Float(_)) => Some(ValueDesc::Float),
            Expr::Literal(Scalar::String(_)) => Some(ValueDesc::String),
            Expr::Literal(_) => None,
            Expr::Identifier(name) => binding.type_of(name),
            Expr::Unary { op, operand } => match op {
                UnaryOp::Not => Some(ValueDesc::Long),
                UnaryOp::Minus => operand.infer_type(binding),
            },
            Expr::Binary { op, left, right } => match op {
                BinaryOp::And
                | BinaryOp::Or
                | BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge
                | BinaryOp::Eq
                | BinaryOp::Ne => Some(ValueDesc::Long),
                _ => {
                    let lt = left.infer_type(binding)?;
                    let rt = right.infer_type(binding)?;
                    if lt == ValueDesc::Long && rt == ValueDesc::Long {
                        Some(ValueDesc::Long)
                    } else if lt.is_numeric() && rt.is_numeric() {
                        Some(ValueDesc::Double)
                    } else {
                        Some(ValueDesc::String)
                    }
                }
            },
            Expr::Call { function, args, .. } => {
                let arg_types: Vec<_> = args.iter().map(|a| a.infer_type(binding)).collect();
                function.output_type(&arg_types)
            }
        }
    }
}

fn eval_unary(op: UnaryOp, v: Scalar) -> Result<Scalar> {
    match op {
        UnaryOp::Not => Ok(Scalar::bool(!v.truthy())),
        UnaryOp::Minus => match v {
            Scalar::Long(x) => Ok(Scalar::Long(-x)),
            Scalar::Double(x) => Ok(Scalar::Double(-x)),
            Scalar::Float(x) => Ok(Scalar::Float(-x)),
            Scalar::Null => Ok(Scalar::Null),
            other => Err(BasaltError::IllegalArgument(format!(
                "cannot negate {other:?}"
            ))),
        },
    }
}

fn eval_binary(op: BinaryOp, l: Scalar, r: Scalar) -> Result<Scalar> {
    use BinaryOp::*;
    if l.is_null() || r.is_null() {
        // null propagates; comparisons with null are false in boolean context
        return Ok(match op {
            Lt | Le | Gt | Ge | Eq | Ne => Scalar::bool(false),
            _ => Scalar::Null,
        });
    }
    match op {
        Add => {
            if let (Scalar::String(a), Scalar::String(b)) = (&l, &r) {
                return Ok(Scalar::String(format!("{a}{b}")));
            }
            arith(l, r, |a, b| a + b, i64::checked_add)
        }
        Sub => arith(l, r, |a, b| a - b, i64::checked_sub),
        Mul => arith(l, r, |a, b| a * b, i64::checked_mul),
        Div => {
            let (a, b) = doubles(&l, &r)?;
            if matches!((&l, &r), (Scalar::Long(_), Scalar::Long(_))) {
                let (x, y) = (l.as_long().unwrap_or(0), r.as_long().unwrap_or(0));
                if y == 0 {
                    return Err(BasaltError::IllegalArgument("division by zero".into()));
                }
                return Ok(Scalar::Long(x / y));
            }
            Ok(Scalar::Double(a / b))
        }
        Mod => {
            let (a, b) = doubles(&l, &r)?;
            if b == 0.0 {
                return Err(BasaltError::IllegalArgument("division by zero".into()));
            }
            if matches!((&l, &r), (Scalar::Long(_), Scalar::Long(_))) {
                return Ok(Scalar::Long(
                    l.as_long().unwrap_or(0) % r.as_long().unwrap_or(1),
                ));
            }
            Ok(Scalar::Double(a % b))
        }
        Lt | Le | Gt | Ge | Eq | Ne => {
            let ord = basalt_core::compare_scalars(&l, &r);
            let v = match op {
                Lt => ord == std::cmp::Ordering::Less,
                Le => ord != std::cmp::Ordering::Greater,
                Gt => ord == std::cmp::Ordering::Greater,
                Ge => ord != std::cmp::Ordering::Less,
                Eq => l.numeric_eq(&r),
                Ne => !l.numeric_eq(&r),
                _ => unreachable!(),
            };
            Ok(Scalar::bool(v))
        }
        And | Or => unreachable!("short-circuited in eval"),
    }
}

fn arith(
    l: Scalar,
    r: Scalar,
    fd: impl Fn(f64, f64) -> f64,
    fl: impl Fn(i64, i64) -> Option<i64>,
) -> Result<Scalar> {
    if let (Scalar::Long(a), Scalar::Long(b)) = (&l, &r) {
        if let Some(v) = fl(*a, *b) {
            return Ok(Scalar::Long(v));
        }
    }
    let (a, b) = doubles(&l, &r)?;
    Ok(Scalar::Double(fd(a, b)))
}

fn doubles(l: &Scalar, r: &Scalar) -> Result<(f64, f64)> {
    match (l.as_double(), r.as_double()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(BasaltError::IllegalArgument(format!(
            "numeric operands required: {l:?}, {r:?}"
        ))),
    }
}
