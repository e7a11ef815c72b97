//! Filter algebra: the serde-facing `DimFilter` tree, boolean-shape
//! optimization, CNF conversion, bitmap extraction and residual matchers.

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use basalt_core::{BasaltError, Result, Scalar};
use basalt_expr::geom::Geometry;
use basalt_expr::NumericBinding;

use crate::cursor::RowReader;
use crate::virtual_columns::VirtualColumns;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DimFilter {
    #[serde(rename = "selector")]
    Selector { dimension: String, value: String },
    #[serde(rename = "in")]
    In {
        dimension: String,
        values: Vec<String>,
    },
    #[serde(rename = "bound")]
    Bound {
        dimension: String,
        #[serde(default)]
        lower: Option<String>,
        #[serde(default)]
        upper: Option<String>,
        #[serde(rename = "lowerStrict", default)]
        lower_strict: bool,
        #[serde(rename = "upperStrict", default)]
        upper_strict: bool,
        /// Compare as doubles instead of lexicographically.
        #[serde(default)]
        numeric: bool,
    },
    #[serde(rename = "regex")]
    Regex { dimension: String, pattern: String },
    #[serde(rename = "not")]
    Not { field: Box<DimFilter> },
    #[serde(rename = "and")]
    And { fields: Vec<DimFilter> },
    #[serde(rename = "or")]
    Or { fields: Vec<DimFilter> },
    #[serde(rename = "expression")]
    Expression { expression: String },
    #[serde(rename = "spatial")]
    Spatial {
        dimension: String,
        shape: String,
        #[serde(default = "default_spatial_op")]
        op: SpatialOp,
    },
    #[serde(rename = "none")]
    None,
    #[serde(rename = "all")]
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SpatialOp {
    Intersects,
    Contains,
    Covers,
    CoveredBy,
    Equals,
    Overlaps,
}

fn default_spatial_op() -> SpatialOp {
    SpatialOp::CoveredBy
}

/// Closed/open string range used by the range-list conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct StringRange {
    pub lower: Option<String>,
    pub upper: Option<String>,
    pub lower_strict: bool,
    pub upper_strict: bool,
}

impl StringRange {
    fn is_point(&self) -> bool {
        !self.lower_strict
            && !self.upper_strict
            && self.lower.is_some()
            && self.lower == self.upper
    }
}

/// Bitmap extraction surface offered by immutable segments. The incremental
/// index offers none, so every filter over it runs as a residual matcher.
pub trait BitmapSource {
    fn num_rows(&self) -> u32;
    /// Sorted dictionary of a dimension column, if the column has one.
    fn dict_values(&self, column: &str) -> Option<&[String]>;
    fn bitmap_for_id(&self, column: &str, id: usize) -> Option<&RoaringBitmap>;
}

pub struct FilterContext<'a> {
    pub source: Option<&'a dyn BitmapSource>,
    pub num_rows: u32,
}

/// Outcome of bitmap compilation: `exact` means the bitmap is the precise
/// answer; otherwise candidates must additionally pass the residual matcher.
pub struct CompiledFilter {
    pub bitmap: Option<RoaringBitmap>,
    pub exact: bool,
    pub residual: Option<DimFilter>,
}

impl CompiledFilter {
    fn exact(bitmap: RoaringBitmap) -> CompiledFilter {
        CompiledFilter {
            bitmap: Some(bitmap),
            exact: true,
            residual: None,
        }
    }

    fn residual(filter: DimFilter) -> CompiledFilter {
        CompiledFilter {
            bitmap: None,
            exact: false,
            residual: Some(filter),
        }
    }
}

pub type RowMatcher = Box<dyn Fn(&dyn RowReader, &VirtualColumns) -> Result<bool> + Send + Sync>;

impl DimFilter {
    pub fn and(fields: Vec<DimFilter>) -> DimFilter {
        DimFilter::And { fields }
    }

    pub fn or(fields: Vec<DimFilter>) -> DimFilter {
        DimFilter::Or { fields }
    }

    pub fn not(field: DimFilter) -> DimFilter {
        DimFilter::Not {
            field: Box::new(field),
        }
    }

    pub fn selector(dimension: &str, value: &str) -> DimFilter {
        DimFilter::Selector {
            dimension: dimension.to_string(),
            value: value.to_string(),
        }
    }

    /// Narrowest filter equivalent to a list of ranges on one string
    /// dimension: pure points collapse to a single `in`, everything else
    /// becomes a disjunction of bounds.
    pub fn from_ranges(dimension: &str, ranges: &[StringRange]) -> Result<DimFilter> {
        if ranges.is_empty() {
            return Err(BasaltError::IllegalArgument(
                "empty range list".into(),
            ));
        }
        let mut points: Vec<String> = Vec::new();
        let mut bounds: Vec<DimFilter> = Vec::new();
        for r in ranges {
            if r.is_point() {
                let v = r.lower.clone().expect("point has a value");
                if !points.contains(&v) {
                    points.push(v);
                }
            } else {
                bounds.push(DimFilter::Bound {
                    dimension: dimension.to_string(),
                    lower: r.lower.clone(),
                    upper: r.upper.clone(),
                    lower_strict: r.lower_strict,
                    upper_strict: r.upper_strict,
                    numeric: false,
                });
            }
        }
        if bounds.is_empty() {
            return Ok(DimFilter::In {
                dimension: dimension.to_string(),
                values: points,
            });
        }
        if !points.is_empty() {
            bounds.insert(
                0,
                DimFilter::In {
                    dimension: dimension.to_string(),
                    values: points,
                },
            );
        }
        Ok(if bounds.len() == 1 {
            bounds.pop().expect("one bound")
        } else {
            DimFilter::Or { fields: bounds }
        })
    }

    /// Construction-time validation; `in` with zero candidates is an error.
    pub fn validate(&self) -> Result<()> {
        match self {
            DimFilter::In { values, .. } if values.is_empty() => Err(
                BasaltError::IllegalArgument("in filter requires at least one value".into()),
            ),
            DimFilter::Regex { pattern, .. } => {
                regex::Regex::new(pattern)
                    .map_err(|e| BasaltError::IllegalArgument(format!("bad regex: {e}")))?;
                Ok(())
            }
            DimFilter::Expression { expression } => {
                basalt_expr::parse(expression).map(|_| ())
            }
            DimFilter::Spatial { shape, .. } => Geometry::parse(shape).map(|_| ()),
            DimFilter::Not { field } => field.validate(),
            DimFilter::And { fields } | DimFilter::Or { fields } => {
                fields.iter().try_for_each(|f| f.validate())
            }
            _ => Ok(()),
        }
    }

    /// Simplify boolean shape: flatten nested and/or, drop `all` inside
    /// `and`, short-circuit `none`, collapse single-child nodes, tighten
    /// stacked numeric bounds on the same dimension.
    pub fn optimize(&self) -> DimFilter {
        match self {
            DimFilter::Not { field } => match field.optimize() {
                DimFilter::Not { field: inner } => *inner,
                DimFilter::All => DimFilter::None,
                DimFilter::None => DimFilter::All,
                inner => DimFilter::not(inner),
            },
            DimFilter::And { fields } => {
                let mut flat = Vec::new();
                for f in fields {
                    match f.optimize() {
                        DimFilter::All => {}
                        DimFilter::None => return DimFilter::None,
                        DimFilter::And { fields: inner } => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                merge_bounds(&mut flat);
                match flat.len() {
                    0 => DimFilter::All,
                    1 => flat.pop().expect("one child"),
                    _ => DimFilter::And { fields: flat },
                }
            }
            DimFilter::Or { fields } => {
                let mut flat = Vec::new();
                for f in fields {
                    match f.optimize() {
                        DimFilter::None => {}
                        DimFilter::All => return DimFilter::All,
                        DimFilter::Or { fields: inner } => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                match flat.len() {
                    0 => DimFilter::None,
                    1 => flat.pop().expect("one child"),
                    _ => DimFilter::Or { fields: flat },
                }
            }
            other => other.clone(),
        }
    }

    /// Conjunctive normal form; applied before bitmap extraction to maximize
    /// pushdown. Distribution is capped so pathological trees fall back to
    /// their original shape.
    pub fn to_cnf(&self) -> DimFilter {
        let nnf = push_not(self, false);
        distribute(&nnf, 0).unwrap_or(nnf)
    }

    /// Compile against a filter context.
    pub fn compile(&self, ctx: &FilterContext) -> CompiledFilter {
        match self {
            DimFilter::All => CompiledFilter::exact(full_bitmap(ctx.num_rows)),
            DimFilter::None => CompiledFilter::exact(RoaringBitmap::new()),
            DimFilter::Selector { dimension, value } => {
                leaf_bitmap(ctx, dimension, |v| v == value, self)
            }
            DimFilter::In { dimension, values } => {
                leaf_bitmap(ctx, dimension, |v| values.iter().any(|c| c == v), self)
            }
            DimFilter::Bound {
                dimension,
                lower,
                upper,
                lower_strict,
                upper_strict,
                numeric,
            } => leaf_bitmap(
                ctx,
                dimension,
                |v| {
                    bound_matches(
                        v,
                        lower.as_deref(),
                        upper.as_deref(),
                        *lower_strict,
                        *upper_strict,
                        *numeric,
                    )
                },
                self,
            ),
            DimFilter::Regex { dimension, pattern } => match regex::Regex::new(pattern) {
                Ok(re) => leaf_bitmap(ctx, dimension, |v| re.is_match(v), self),
                Err(_) => CompiledFilter::residual(self.clone()),
            },
            DimFilter::Expression { .. } | DimFilter::Spatial { .. } => {
                CompiledFilter::residual(self.clone())
            }
            DimFilter::And { fields } => {
                let mut bitmap: Option<RoaringBitmap> = Option::None;
                let mut exact = true;
                let mut residuals = Vec::new();
                for f in fields {
                    let child = f.compile(ctx);
                    if let Some(b) = child.bitmap {
                        bitmap = Some(match bitmap {
                            Some(acc) => acc & b,
                            Option::None => b,
                        });
                    }
                    if !child.exact {
                        exact = false;
                        if let Some(r) = child.residual {
                            residuals.push(r);
                        }
                    }
                }
                CompiledFilter {
                    bitmap,
                    exact,
                    residual: match residuals.len() {
                        0 => Option::None,
                        1 => Some(residuals.pop().expect("one residual")),
                        _ => Some(DimFilter::And { fields: residuals }),
                    },
                }
            }
            DimFilter::Or { fields } => {
                let mut bitmap = RoaringBitmap::new();
                let mut exact = true;
                for f in fields {
                    let child = f.compile(ctx);
                    match child.bitmap {
                        Some(b) => bitmap |= b,
                        // a child with no bitmap poisons the whole union
                        Option::None => return CompiledFilter::residual(self.clone()),
                    }
                    exact &= child.exact;
                }
                if exact {
                    CompiledFilter::exact(bitmap)
                } else {
                    // union of supersets: keep it for pruning, re-match rows
                    CompiledFilter {
                        bitmap: Some(bitmap),
                        exact: false,
                        residual: Some(self.clone()),
                    }
                }
            }
            DimFilter::Not { field } => {
                let child = field.compile(ctx);
                match (child.bitmap, child.exact) {
                    (Some(b), true) => {
                        let mut full = full_bitmap(ctx.num_rows);
                        full -= b;
                        CompiledFilter::exact(full)
                    }
                    _ => CompiledFilter::residual(self.clone()),
                }
            }
        }
    }

    /// Residual matcher: evaluates the filter per row through the reader,
    /// with regexes, expressions and shapes compiled once.
    pub fn matcher(&self) -> Result<RowMatcher> {
        Ok(match self {
            DimFilter::All => Box::new(|_, _| Ok(true)),
            DimFilter::None => Box::new(|_, _| Ok(false)),
            DimFilter::Selector { dimension, value } => {
                let (dimension, value) = (dimension.clone(), value.clone());
                Box::new(move |reader, virtuals| {
                    Ok(column_values(reader, virtuals, &dimension)?
                        .iter()
                        .any(|v| *v == value))
                })
            }
            DimFilter::In { dimension, values } => {
                let (dimension, values) = (dimension.clone(), values.clone());
                Box::new(move |reader, virtuals| {
                    Ok(column_values(reader, virtuals, &dimension)?
                        .iter()
                        .any(|v| values.contains(v)))
                })
            }
            DimFilter::Bound {
                dimension,
                lower,
                upper,
                lower_strict,
                upper_strict,
                numeric,
            } => {
                let dimension = dimension.clone();
                let (lower, upper) = (lower.clone(), upper.clone());
                let (ls, us, num) = (*lower_strict, *upper_strict, *numeric);
                Box::new(move |reader, virtuals| {
                    Ok(column_values(reader, virtuals, &dimension)?.iter().any(
                        |v| bound_matches(v, lower.as_deref(), upper.as_deref(), ls, us, num),
                    ))
                })
            }
            DimFilter::Regex { dimension, pattern } => {
                let dimension = dimension.clone();
                let re = regex::Regex::new(pattern)
                    .map_err(|e| BasaltError::IllegalArgument(format!("bad regex: {e}")))?;
                Box::new(move |reader, virtuals| {
                    Ok(column_values(reader, virtuals, &dimension)?
                        .iter()
                        .any(|v| re.is_match(v)))
                })
            }
            DimFilter::Expression { expression } => {
                let expr = basalt_expr::parse(expression)?;
                Box::new(move |reader, virtuals| {
                    let binding = ReaderBinding { reader, virtuals };
                    Ok(expr.eval(&binding)?.truthy())
                })
            }
            DimFilter::Spatial {
                dimension,
                shape,
                op,
            } => {
                let dimension = dimension.clone();
                let shape = Geometry::parse(shape)?;
                let op = *op;
                Box::new(move |reader, virtuals| {
                    for v in column_values(reader, virtuals, &dimension)? {
                        if let Some(point) = parse_coordinate(&v) {
                            let hit = match op {
                                SpatialOp::Equals => {
                                    shape.geo_equals(&Geometry::Point(point))
                                }
                                _ => shape.contains_point(point),
                            };
                            if hit {
                                return Ok(true);
                            }
                        }
                    }
                    Ok(false)
                })
            }
            DimFilter::Not { field } => {
                let inner = field.matcher()?;
                Box::new(move |reader, virtuals| Ok(!inner(reader, virtuals)?))
            }
            DimFilter::And { fields } => {
                let inner: Vec<RowMatcher> =
                    fields.iter().map(|f| f.matcher()).collect::<Result<_>>()?;
                Box::new(move |reader, virtuals| {
                    for m in &inner {
                        if !m(reader, virtuals)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                })
            }
            DimFilter::Or { fields } => {
                let inner: Vec<RowMatcher> =
                    fields.iter().map(|f| f.matcher()).collect::<Result<_>>()?;
                Box::new(move |reader, virtuals| {
                    for m in &inner {
                        if m(reader, virtuals)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                })
            }
        })
    }
}

struct ReaderBinding<'a> {
    reader: &'a dyn RowReader,
    virtuals: &'a VirtualColumns,
}

impl NumericBinding for ReaderBinding<'_> {
    fn get(&self, name: &str) -> Scalar {
        self.virtuals
            .resolve(self.reader, name)
            .unwrap_or(Scalar::Null)
    }
}

fn column_values(
    reader: &dyn RowReader,
    virtuals: &VirtualColumns,
    column: &str,
) -> Result<Vec<String>> {
    if reader.has_column(column) {
        return Ok(reader.dim_values(column));
    }
    match virtuals.resolve(reader, column)? {
        Scalar::Null => Ok(vec![String::new()]),
        Scalar::Array(items) => Ok(items
            .into_iter()
            .map(|v| match v {
                Scalar::String(s) => s,
                other => other.to_json().to_string(),
            })
            .collect()),
        Scalar::String(s) => Ok(vec![s]),
        other => Ok(vec![other.to_json().to_string()]),
    }
}

/// `"x,y"` dimension encoding used by spatial dimensions.
fn parse_coordinate(v: &str) -> Option<(f64, f64)> {
    let (a, b) = v.split_once(',')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

fn bound_matches(
    v: &str,
    lower: Option<&str>,
    upper: Option<&str>,
    lower_strict: bool,
    upper_strict: bool,
    numeric: bool,
) -> bool {
    use std::cmp::Ordering;
    let cmp = |a: &str, b: &str| -> Option<Ordering> {
        if numeric {
            let (x, y): (f64, f64) = (a.parse().ok()?, b.parse().ok()?);
            x.partial_cmp(&y)
        } else {
            Some(a.cmp(b))
        }
    };
    if let Some(lo) = lower {
        match cmp(v, lo) {
            Some(Ordering::Greater) => {}
            Some(Ordering::Equal) if !lower_strict => {}
            _ => return false,
        }
    }
    if let Some(hi) = upper {
        match cmp(v, hi) {
            Some(Ordering::Less) => {}
            Some(Ordering::Equal) if !upper_strict => {}
            _ => return false,
        }
    }
    true
}

fn full_bitmap(num_rows: u32) -> RoaringBitmap {
    let mut b = RoaringBitmap::new();
    b.insert_range(0..num_rows);
    b
}

fn leaf_bitmap(
    ctx: &FilterContext,
    dimension: &str,
    predicate: impl Fn(&str) -> bool,
    original: &DimFilter,
) -> CompiledFilter {
    let Some(source) = ctx.source else {
        return CompiledFilter::residual(original.clone());
    };
    let Some(values) = source.dict_values(dimension) else {
        // not a dictionary column here; fall back to the row matcher
        return CompiledFilter::residual(original.clone());
    };
    let mut bitmap = RoaringBitmap::new();
    for (id, value) in values.iter().enumerate() {
        if predicate(value) {
            if let Some(b) = source.bitmap_for_id(dimension, id) {
                bitmap |= b;
            }
        }
    }
    CompiledFilter::exact(bitmap)
}

/// Negation-normal form.
fn push_not(filter: &DimFilter, negate: bool) -> DimFilter {
    match filter {
        DimFilter::Not { field } => push_not(field, !negate),
        DimFilter::And { fields } => {
            let children: Vec<DimFilter> = fields.iter().map(|f| push_not(f, negate)).collect();
            if negate {
                DimFilter::Or { fields: children }
            } else {
                DimFilter::And { fields: children }
            }
        }
        DimFilter::Or { fields } => {
            let children: Vec<DimFilter> = fields.iter().map(|f| push_not(f, negate)).collect();
            if negate {
                DimFilter::And { fields: children }
            } else {
                DimFilter::Or { fields: children }
            }
        }
        DimFilter::All if negate => DimFilter::None,
        DimFilter::None if negate => DimFilter::All,
        leaf => {
            if negate {
                DimFilter::not(leaf.clone())
            } else {
                leaf.clone()
            }
        }
    }
}

const CNF_CLAUSE_CAP: usize = 64;

/// Distribute OR over AND; `None` when the clause count would explode.
fn distribute(filter: &DimFilter, depth: usize) -> Option<DimFilter> {
    if depth > 16 {
        return Option::None;
    }
    match filter {
        DimFilter::And { fields } => {
            let mut clauses = Vec::new();
            for f in fields {
                match distribute(f, depth + 1)? {
                    DimFilter::And { fields: inner } => clauses.extend(inner),
                    other => clauses.push(other),
                }
            }
            Some(DimFilter::And { fields: clauses })
        }
        DimFilter::Or { fields } => {
            // cross-product of child clause sets
            let mut product: Vec<Vec<DimFilter>> = vec![Vec::new()];
            for f in fields {
                let child = distribute(f, depth + 1)?;
                let child_clauses = match child {
                    DimFilter::And { fields: inner } => inner,
                    other => vec![other],
                };
                let mut next = Vec::new();
                for existing in &product {
                    for clause in &child_clauses {
                        let mut combined = existing.clone();
                        combined.push(clause.clone());
                        next.push(combined);
                    }
                }
                if next.len() > CNF_CLAUSE_CAP {
                    return Option::None;
                }
                product = next;
            }
            let clauses: Vec<DimFilter> = product
                .into_iter()
                .map(|disjuncts| {
                    if disjuncts.len() == 1 {
                        disjuncts.into_iter().next().expect("one disjunct")
                    } else {
                        DimFilter::Or { fields: disjuncts }
                    }
                })
                .collect();
            Some(if clauses.len() == 1 {
                clauses.into_iter().next().expect("one clause")
            } else {
                DimFilter::And { fields: clauses }
            })
        }
        other => Some(other.clone()),
    }
}

/// Tighten stacked numeric bounds on the same dimension inside an `and`.
fn merge_bounds(fields: &mut Vec<DimFilter>) {
    let mut merged: Vec<DimFilter> = Vec::new();
    'outer: for f in fields.drain(..) {
        if let DimFilter::Bound {
            dimension,
            lower,
            upper,
            lower_strict,
            upper_strict,
            numeric: true,
        } = &f
        {
            for existing in merged.iter_mut() {
                if let DimFilter::Bound {
                    dimension: ed,
                    lower: el,
                    upper: eu,
                    lower_strict: els,
                    upper_strict: eus,
                    numeric: true,
                } = existing
                {
                    if ed == dimension {
                        let (nl, nls) = tighter_lower(el.take(), *els, lower.clone(), *lower_strict);
                        let (nu, nus) = tighter_upper(eu.take(), *eus, upper.clone(), *upper_strict);
                        *el = nl;
                        *els = nls;
                        *eu = nu;
                        *eus = nus;
                        continue 'outer;
                    }
                }
            }
        }
        merged.push(f);
    }
    *fields = merged;
}

fn tighter_lower(
    a: Option<String>,
    a_strict: bool,
    b: Option<String>,
    b_strict: bool,
) -> (Option<String>, bool) {
    match (a, b) {
        (Some(x), Some(y)) => {
            let (xv, yv) = (x.parse::<f64>().ok(), y.parse::<f64>().ok());
            match (xv, yv) {
                (Some(xn), Some(yn)) if yn > xn => (Some(y), b_strict),
                (Some(xn), Some(yn)) if (yn - xn).abs() < f64::EPSILON => {
                    (Some(x), a_strict || b_strict)
                }
                _ => (Some(x), a_strict),
            }
        }
        (Some(x), None) => (Some(x), a_strict),
        (None, y) => (y, b_strict),
    }
}

fn tighter_upper(
    a: Option<String>,
    a_strict: bool,
    b: Option<String>,
    b_strict: bool,
) -> (Option<String>, bool) {
    match (a, b) {
        (Some(x), Some(y)) => {
            let (xv, yv) = (x.parse::<f64>().ok(), y.parse::<f64>().ok());
            match (xv, yv) {
                (Some(xn), Some(yn)) if yn < xn => (Some(y), b_strict),
                (Some(xn), Some(yn)) if (yn - xn).abs() < f64::EPSILON => {
                    (Some(x), a_strict || b_strict)
                }
                _ => (Some(x), a_strict),
            }
        }
        (Some(x), None) => (Some(x), a_strict),
        (None, y) => (y, b_strict),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optimize_flattens_and_short_circuits() {
        let f = DimFilter::and(vec![
            DimFilter::All,
            DimFilter::and(vec![
                DimFilter::selector("k", "a"),
                DimFilter::selector("j", "b"),
            ]),
        ]);
        match f.optimize() {
            DimFilter::And { fields } => assert_eq!(fields.len(), 2),
            other => panic!("unexpected: {other:?}"),
        }

        let f = DimFilter::and(vec![DimFilter::None, DimFilter::selector("k", "a")]);
        assert_eq!(f.optimize(), DimFilter::None);

        let f = DimFilter::and(vec![DimFilter::selector("k", "a")]);
        assert_eq!(f.optimize(), DimFilter::selector("k", "a"));
    }

    #[test]
    fn test_cnf_distributes_or_over_and() {
        // or(a, and(b, c)) -> and(or(a,b), or(a,c))
        let f = DimFilter::or(vec![
            DimFilter::selector("k", "a"),
            DimFilter::and(vec![
                DimFilter::selector("k", "b"),
                DimFilter::selector("k", "c"),
            ]),
        ]);
        match f.to_cnf() {
            DimFilter::And { fields } => {
                assert_eq!(fields.len(), 2);
                assert!(matches!(fields[0], DimFilter::Or { .. }));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_cnf_pushes_not_inward() {
        let f = DimFilter::not(DimFilter::or(vec![
            DimFilter::selector("k", "a"),
            DimFilter::selector("k", "b"),
        ]));
        match f.to_cnf() {
            DimFilter::And { fields } => {
                assert!(fields.iter().all(|f| matches!(f, DimFilter::Not { .. })));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_in_zero_values_fails_validation() {
        let f = DimFilter::In {
            dimension: "k".into(),
            values: vec![],
        };
        assert!(matches!(
            f.validate(),
            Err(BasaltError::IllegalArgument(_))
        ));
    }

    #[test]
    fn test_range_list_collapses_points_to_in() {
        let ranges = vec![
            StringRange {
                lower: Some("a".into()),
                upper: Some("a".into()),
                lower_strict: false,
                upper_strict: false,
            },
            StringRange {
                lower: Some("b".into()),
                upper: Some("b".into()),
                lower_strict: false,
                upper_strict: false,
            },
        ];
        match DimFilter::from_ranges("k", &ranges).unwrap() {
            DimFilter::In { values, .. } => assert_eq!(values, vec!["a", "b"]),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_merge_numeric_bounds() {
        let f = DimFilter::and(vec![
            DimFilter::Bound {
                dimension: "v".into(),
                lower: Some("1".into()),
                upper: Some("100".into()),
                lower_strict: false,
                upper_strict: false,
                numeric: true,
            },
            DimFilter::Bound {
                dimension: "v".into(),
                lower: Some("10".into()),
                upper: Some("50".into()),
                lower_strict: true,
                upper_strict: false,
                numeric: true,
            },
        ]);
        match f.optimize() {
            DimFilter::Bound { lower, upper, lower_strict, .. } => {
                assert_eq!(lower.as_deref(), Some("10"));
                assert_eq!(upper.as_deref(), Some("50"));
                assert!(lower_strict);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_bound_matches_numeric_and_lexicographic() {
        assert!(bound_matches("9", Some("10"), None, false, false, false)); // lexicographic
        assert!(!bound_matches("9", Some("10"), None, false, false, true)); // numeric
        assert!(bound_matches("10", Some("10"), None, false, false, true));
        assert!(!bound_matches("10", Some("10"), None, true, false, true));
    }
}
