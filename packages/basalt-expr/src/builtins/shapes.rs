//! Shape predicates over WKT / GeoJSON geometry.

use std::sync::Arc;

use basalt_core::{BasaltError, Result, Scalar, ValueDesc};

use crate::geom::Geometry;
use crate::{Expr, Function};

pub fn create(name: &str, args: &[Expr]) -> Result<Arc<dyn Function>> {
    super::expect_arity(name, args, 2..=2)?;
    let op = match name {
        "shape_intersects" => ShapeOp::Intersects,
        "shape_contains" => ShapeOp::Contains,
        "shape_covers" => ShapeOp::Covers,
        "shape_coveredBy" => ShapeOp::CoveredBy,
        "shape_equals" => ShapeOp::Equals,
        "shape_overlaps" => ShapeOp::Overlaps,
        other => {
            return Err(BasaltError::IllegalArgument(format!(
                "unknown function: {other}"
            )))
        }
    };
    // constant shapes parse once at factory time
    let left = precompiled(&args[0])?;
    let right = precompiled(&args[1])?;
    Ok(Arc::new(ShapePredicate { op, left, right }))
}

#[derive(Clone, Copy)]
enum ShapeOp {
    Intersects,
    Contains,
    Covers,
    CoveredBy,
    Equals,
    Overlaps,
}

fn precompiled(arg: &Expr) -> Result<Option<Geometry>> {
    match arg {
        Expr::Literal(Scalar::String(s)) => Geometry::parse(s).map(Some),
        _ => Ok(None),
    }
}

struct ShapePredicate {
    op: ShapeOp,
    left: Option<Geometry>,
    right: Option<Geometry>,
}

impl ShapePredicate {
    fn resolve(fixed: &Option<Geometry>, value: &Scalar) -> Option<Geometry> {
        if let Some(g) = fixed {
            return Some(g.clone());
        }
        value.as_str().and_then(|s| Geometry::parse(s).ok())
    }
}

impl Function for ShapePredicate {
    fn apply(&self, args: &[Scalar]) -> Result<Scalar> {
        let (Some(a), Some(b)) = (
            Self::resolve(&self.left, &args[0]),
            Self::resolve(&self.right, &args[1]),
        ) else {
            return Ok(Scalar::bool(false));
        };
        let out = match self.op {
            ShapeOp::Intersects => a.intersects(&b),
            // contains is covers minus shared boundary; the planar model
            // treats them alike
            ShapeOp::Contains | ShapeOp::Covers => a.covers(&b),
            ShapeOp::CoveredBy => b.covers(&a),
            ShapeOp::Equals => a.geo_equals(&b),
            ShapeOp::Overlaps => a.overlaps(&b),
        };
        Ok(Scalar::bool(out))
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

    #[test]
    fn test_constant_shapes_fold() {
        let e = parse(
            "shape_intersects('POLYGON((0 0, 10 0, 10 10, 0 10))', 'POINT(5 5)')",
        )
        .unwrap();
        let binding: HashMap<String, Scalar> = HashMap::new();
        assert_eq!(e.eval(&binding).unwrap(), Scalar::bool(true));
    }

    #[test]
    fn test_column_shape() {
        let e = parse("shape_coveredBy(g, 'POLYGON((0 0, 10 0, 10 10, 0 10))')").unwrap();
        let binding: HashMap<String, Scalar> = [(
            "g".to_string(),
            Scalar::String("POLYGON((2 2, 3 2, 3 3, 2 3))".into()),
        )]
        .into_iter()
        .collect();
        assert_eq!(e.eval(&binding).unwrap(), Scalar::bool(true));
        let binding: HashMap<String, Scalar> =
            [("g".to_string(), Scalar::String("not-a-shape".into()))]
                .into_iter()
                .collect();
        assert_eq!(e.eval(&binding).unwrap(), Scalar::bool(false));
    }
}
