//! Builtin function library.
//!
//! `create` is the factory the parser calls for every function token: it
//! validates arity, folds constant arguments (compiling regexes, parsing IP
//! ranges and shapes once), and returns the compiled form.

mod geo;
mod shapes;
mod timefn;

use std::net::Ipv4Addr;
use std::sync::Arc;

use basalt_core::{compare_scalars, BasaltError, Result, Scalar, ValueDesc};
use regex::Regex;

use crate::{Expr, Function};

pub fn create(name: &str, args: &[Expr]) -> Result<Arc<dyn Function>> {
    match name {
        // null predicates
        "isNull" => simple(name, args, 1..=1, bool_out(), |v| {
            Ok(Scalar::bool(v[0].is_null()))
        }),
        "isNotNull" => simple(name, args, 1..=1, bool_out(), |v| {
            Ok(Scalar::bool(!v[0].is_null()))
        }),

        // textual predicates
        "like" => {
            expect_arity(name, args, 2..=2)?;
            let pattern = const_str(name, args, 1)?;
            let re = like_to_regex(&pattern)?;
            Ok(Arc::new(RegexPredicate { re }))
        }
        "match" => {
            expect_arity(name, args, 2..=2)?;
            let pattern = const_str(name, args, 1)?;
            let re = Regex::new(&pattern)
                .map_err(|e| BasaltError::IllegalArgument(format!("bad regex: {e}")))?;
            Ok(Arc::new(RegexPredicate { re }))
        }
        "startsWith" => string_pair(name, args, |s, p| s.starts_with(p)),
        "startsWithIgnoreCase" => string_pair(name, args, |s, p| {
            s.to_lowercase().starts_with(&p.to_lowercase())
        }),
        "endsWith" => string_pair(name, args, |s, p| s.ends_with(p)),
        "endsWithIgnoreCase" => string_pair(name, args, |s, p| {
            s.to_lowercase().ends_with(&p.to_lowercase())
        }),
        "contains" => string_pair(name, args, |s, p| s.contains(p)),

        // set / range
        "in" => {
            if args.len() < 2 {
                return Err(BasaltError::IllegalArgument(
                    "in requires a value and at least one candidate".into(),
                ));
            }
            let set: Vec<Scalar> = args[1..]
                .iter()
                .map(|a| const_scalar(name, a))
                .collect::<Result<_>>()?;
            Ok(Arc::new(InSet { set }))
        }
        "between" => {
            expect_arity(name, args, 3..=3)?;
            let lower = const_scalar(name, &args[1])?;
            let upper = const_scalar(name, &args[2])?;
            Ok(Arc::new(Between { lower, upper }))
        }
        "ipv4_in" => {
            expect_arity(name, args, 2..=3)?;
            let range = if args.len() == 2 {
                Ipv4Range::from_cidr(&const_str(name, args, 1)?)?
            } else {
                Ipv4Range::from_bounds(
                    &const_str(name, args, 1)?,
                    &const_str(name, args, 2)?,
                )?
            };
            Ok(Arc::new(range))
        }

        // math
        "abs" => math1(name, args, f64::abs),
        "ceil" => math1(name, args, f64::ceil),
        "floor" => math1(name, args, f64::floor),
        "round" => math1(name, args, f64::round),
        "sqrt" => math1(name, args, f64::sqrt),
        "exp" => math1(name, args, f64::exp),
        "ln" => math1(name, args, f64::ln),
        "log10" => math1(name, args, f64::log10),
        "sin" => math1(name, args, f64::sin),
        "cos" => math1(name, args, f64::cos),
        "tan" => math1(name, args, f64::tan),
        "pow" => simple(name, args, 2..=2, Some(ValueDesc::Double), |v| {
            match (v[0].as_double(), v[1].as_double()) {
                (Some(a), Some(b)) => Ok(Scalar::Double(a.powf(b))),
                _ => Ok(Scalar::Null),
            }
        }),
        "factorial" => simple(name, args, 1..=1, Some(ValueDesc::Long), |v| {
            match v[0].as_long() {
                Some(n) if n >= 0 => {
                    let mut acc = 1i64;
                    for i in 2..=n {
                        acc = match acc.checked_mul(i) {
                            Some(x) => x,
                            None => return Ok(Scalar::Null),
                        };
                    }
                    Ok(Scalar::Long(acc))
                }
                _ => Ok(Scalar::Null),
            }
        }),
        "fuzzyCompare" => simple(name, args, 3..=3, Some(ValueDesc::Long), |v| {
            match (v[0].as_double(), v[1].as_double(), v[2].as_double()) {
                (Some(a), Some(b), Some(eps)) => {
                    let v = if (a - b).abs() <= eps.abs() {
                        0
                    } else if a < b {
                        -1
                    } else {
                        1
                    };
                    Ok(Scalar::Long(v))
                }
                _ => Ok(Scalar::Null),
            }
        }),

        // time extraction
        "epoch" | "second" | "minute" | "hour" | "day" | "dow" | "doy" | "week" | "month"
        | "quarter" | "year" => timefn::create(name, args),

        // geospatial
        "to_geohash" | "geohash_to_center" | "geohash_to_boundary" | "to_h3"
        | "to_h3_address" | "h3_to_center" | "h3_to_boundary" => geo::create(name, args),

        // shape predicates
        "shape_intersects" | "shape_contains" | "shape_covers" | "shape_coveredBy"
        | "shape_equals" | "shape_overlaps" => shapes::create(name, args),

        other => Err(BasaltError::IllegalArgument(format!(
            "unknown function: {other}"
        ))),
    }
}

// ---- helpers shared by the submodules ----

pub(crate) fn expect_arity(
    name: &str,
    args: &[Expr],
    range: std::ops::RangeInclusive<usize>,
) -> Result<()> {
    if range.contains(&args.len()) {
        Ok(())
    } else {
        Err(BasaltError::IllegalArgument(format!(
            "{name} expects {}..{} arguments, got {}",
            range.start(),
            range.end(),
            args.len()
        )))
    }
}

pub(crate) fn const_scalar(name: &str, arg: &Expr) -> Result<Scalar> {
    match arg {
        Expr::Literal(v) => Ok(v.clone()),
        _ => Err(BasaltError::IllegalArgument(format!(
            "{name} requires constant arguments"
        ))),
    }
}

pub(crate) fn const_str(name: &str, args: &[Expr], idx: usize) -> Result<String> {
    match const_scalar(name, &args[idx])? {
        Scalar::String(s) => Ok(s),
        other => Err(BasaltError::IllegalArgument(format!(
            "{name} argument {idx} must be a constant string, got {other:?}"
        ))),
    }
}

pub(crate) fn const_long(name: &str, args: &[Expr], idx: usize) -> Result<Option<i64>> {
    if idx >= args.len() {
        return Ok(None);
    }
    Ok(Some(const_scalar(name, &args[idx])?.as_long().ok_or_else(
        || BasaltError::IllegalArgument(format!("{name} argument {idx} must be a constant long")),
    )?))
}

fn bool_out() -> Option<ValueDesc> {
    Some(ValueDesc::Long)
}

pub(crate) struct SimpleFn {
    out: Option<ValueDesc>,
    f: Box<dyn Fn(&[Scalar]) -> Result<Scalar> + Send + Sync>,
}

impl Function for SimpleFn {
    fn apply(&self, args: &[Scalar]) -> Result<Scalar> {
        (self.f)(args)
    }

    fn output_type(&self, _arg_types: &[Option<ValueDesc>]) -> Option<ValueDesc> {
        self.out.clone()
    }
}

pub(crate) fn simple(
    name: &str,
    args: &[Expr],
    arity: std::ops::RangeInclusive<usize>,
    out: Option<ValueDesc>,
    f: impl Fn(&[Scalar]) -> Result<Scalar> + Send + Sync + 'static,
) -> Result<Arc<dyn Function>> {
    expect_arity(name, args, arity)?;
    Ok(Arc::new(SimpleFn {
        out,
        f: Box::new(f),
    }))
}

fn math1(name: &str, args: &[Expr], f: fn(f64) -> f64) -> Result<Arc<dyn Function>> {
    simple(name, args, 1..=1, Some(ValueDesc::Double), move |v| {
        Ok(match v[0].as_double() {
            Some(x) => Scalar::Double(f(x)),
            None => Scalar::Null,
        })
    })
}

fn string_pair(
    name: &str,
    args: &[Expr],
    f: impl Fn(&str, &str) -> bool + Send + Sync + 'static,
) -> Result<Arc<dyn Function>> {
    simple(name, args, 2..=2, bool_out(), move |v| {
        match (v[0].as_str(), v[1].as_str()) {
            (Some(s), Some(p)) => Ok(Scalar::bool(f(s, p))),
            _ => Ok(Scalar::bool(false)),
        }
    })
}

fn like_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::with_capacity(pattern.len() + 4);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            c if "\\.^$|?*+()[]{}".contains(c) => {
                re.push('\\');
                re.push(c);
            }
            c => re.push(c),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| BasaltError::IllegalArgument(format!("bad like pattern: {e}")))
}

struct RegexPredicate {
    re: Regex,
}

impl Function for RegexPredicate {
    fn apply(&self, args: &[Scalar]) -> Result<Scalar> {
        Ok(match args[0].as_str() {
            Some(s) => Scalar::bool(self.re.is_match(s)),
            None => Scalar::bool(false),
        })
    }

    fn output_type(&self, _: &[Option<ValueDesc>]) -> Option<ValueDesc> {
        Some(ValueDesc::Long)
    }
}

struct InSet {
    set: Vec<Scalar>,
}

impl Function for InSet {
    fn apply(&self, args: &[Scalar]) -> Result<Scalar> {
        Ok(Scalar::bool(
            self.set.iter().any(|v| v.numeric_eq(&args[0])),
        ))
    }

    fn output_type(&self, _: &[Option<ValueDesc>]) -> Option<ValueDesc> {
        Some(ValueDesc::Long)
    }
}

struct Between {
    lower: Scalar,
    upper: Scalar,
}

impl Function for Between {
    fn apply(&self, args: &[Scalar]) -> Result<Scalar> {
        if args[0].is_null() {
            return Ok(Scalar::bool(false));
        }
        // inclusive on both ends; an empty range matches nothing
        let ge_lower = compare_scalars(&args[0], &self.lower) != std::cmp::Ordering::Less;
        let le_upper = compare_scalars(&args[0], &self.upper) != std::cmp::Ordering::Greater;
        Ok(Scalar::bool(ge_lower && le_upper))
    }

    fn output_type(&self, _: &[Option<ValueDesc>]) -> Option<ValueDesc> {
        Some(ValueDesc::Long)
    }
}

struct Ipv4Range {
    start: u32,
    end: u32,
}

impl Ipv4Range {
    fn from_cidr(spec: &str) -> Result<Ipv4Range> {
        if let Some((base, bits)) = spec.split_once('/') {
            let addr: Ipv4Addr = base
                .parse()
                .map_err(|_| BasaltError::IllegalArgument(format!("bad CIDR: {spec}")))?;
            let bits: u32 = bits
                .parse()
                .map_err(|_| BasaltError::IllegalArgument(format!("bad CIDR: {spec}")))?;
            if bits > 32 {
                return Err(BasaltError::IllegalArgument(format!("bad CIDR: {spec}")));
            }
            let base = u32::from(addr);
            let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
            Ok(Ipv4Range {
                start: base & mask,
                end: base | !mask,
            })
        } else {
            let addr: Ipv4Addr = spec
                .parse()
                .map_err(|_| BasaltError::IllegalArgument(format!("bad address: {spec}")))?;
            let v = u32::from(addr);
            Ok(Ipv4Range { start: v, end: v })
        }
    }

    fn from_bounds(start: &str, end: &str) -> Result<Ipv4Range> {
        let s: Ipv4Addr = start
            .parse()
            .map_err(|_| BasaltError::IllegalArgument(format!("bad address: {start}")))?;
        let e: Ipv4Addr = end
            .parse()
            .map_err(|_| BasaltError::IllegalArgument(format!("bad address: {end}")))?;
        Ok(Ipv4Range {
            start: u32::from(s),
            end: u32::from(e),
        })
    }
}

impl Function for Ipv4Range {
    fn apply(&self, args: &[Scalar]) -> Result<Scalar> {
        // non-IPv4 input matches false, never raises
        let Some(s) = args[0].as_str() else {
            return Ok(Scalar::bool(false));
        };
        match s.parse::<Ipv4Addr>() {
            Ok(addr) => {
                let v = u32::from(addr);
                Ok(Scalar::bool(v >= self.start && v <= self.end))
            }
            Err(_) => Ok(Scalar::bool(false)),
        }
    }

    fn output_type(&self, _: &[Option<ValueDesc>]) -> Option<ValueDesc> {
        Some(ValueDesc::Long)
    }
}

#[cfg(test)]
mod tests {
    use crate::parse;
    use basalt_core::Scalar;
    use std::collections::HashMap;

    fn eval(expr: &str, pairs: &[(&str, Scalar)]) -> Scalar {
        let binding: HashMap<String, Scalar> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        parse(expr).unwrap().eval(&binding).unwrap()
    }

    #[test]
    fn test_like_and_regex() {
        assert_eq!(
            eval("like(x, 'ab%')", &[("x", Scalar::String("abcd".into()))]),
            Scalar::bool(true)
        );
        assert_eq!(
            eval("match(x, '^[0-9]+$')", &[("x", Scalar::String("123".into()))]),
            Scalar::bool(true)
        );
    }

    #[test]
    fn test_in_and_between() {
        assert_eq!(
            eval("in(x, 'a', 'b')", &[("x", Scalar::String("b".into()))]),
            Scalar::bool(true)
        );
        assert_eq!(
            eval("between(x, 2, 4)", &[("x", Scalar::Long(4))]),
            Scalar::bool(true)
        );
        // empty range yields false for all inputs
        assert_eq!(
            eval("between(x, 4, 2)", &[("x", Scalar::Long(3))]),
            Scalar::bool(false)
        );
    }

    #[test]
    fn test_ipv4_in() {
        assert_eq!(
            eval(
                "ipv4_in(ip, '10.0.0.0/8')",
                &[("ip", Scalar::String("10.1.2.3".into()))]
            ),
            Scalar::bool(true)
        );
        assert_eq!(
            eval(
                "ipv4_in(ip, '10.0.0.0', '10.0.0.255')",
                &[("ip", Scalar::String("10.0.1.0".into()))]
            ),
            Scalar::bool(false)
        );
        // non-IPv4 strings match false, never raise
        assert_eq!(
            eval(
                "ipv4_in(ip, '10.0.0.0/8')",
                &[("ip", Scalar::String("not-an-ip".into()))]
            ),
            Scalar::bool(false)
        );
    }

    #[test]
    fn test_factorial_and_fuzzy() {
        assert_eq!(eval("factorial(x)", &[("x", Scalar::Long(5))]), Scalar::Long(120));
        assert_eq!(
            eval("fuzzyCompare(x, 1.0000001, 0.001)", &[("x", Scalar::Double(1.0))]),
            Scalar::Long(0)
        );
    }
}
