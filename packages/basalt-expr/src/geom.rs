//! Minimal planar geometry for shape predicates and spatial filters.
//!
//! Supports the WKT subset the engine accepts (POINT, LINESTRING, POLYGON,
//! MULTIPOLYGON) plus GeoJSON geometry objects. Predicates are boundary
//! inclusive for `covers`/`coveredBy` and exclusive of pure containment for
//! `overlaps`.

use basalt_core::{BasaltError, Result};
use serde_json::Value as Json;

pub type Point = (f64, f64);

/// A ring is a closed sequence of points; the closing point may be omitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    pub exterior: Vec<Point>,
    pub holes: Vec<Vec<Point>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Point),
    LineString(Vec<Point>),
    Polygon(Polygon),
    MultiPolygon(Vec<Polygon>),
}

impl Geometry {
    /// Parse WKT or a GeoJSON geometry object.
    pub fn parse(text: &str) -> Result<Geometry> {
        let trimmed = text.trim();
        if trimmed.starts_with('{') {
            let json: Json = serde_json::from_str(trimmed)
                .map_err(|_| BasaltError::ParseFailure(text.to_string()))?;
            return from_geojson(&json).ok_or_else(|| BasaltError::ParseFailure(text.to_string()));
        }
        parse_wkt(trimmed)
    }

    pub fn polygons(&self) -> Vec<&Polygon> {
        match self {
            Geometry::Polygon(p) => vec![p],
            Geometry::MultiPolygon(ps) => ps.iter().collect(),
            _ => Vec::new(),
        }
    }

    pub fn points(&self) -> Vec<Point> {
        match self {
            Geometry::Point(p) => vec![*p],
            Geometry::LineString(ps) => ps.clone(),
            Geometry::Polygon(p) => p.exterior.clone(),
            Geometry::MultiPolygon(ps) => ps.iter().flat_map(|p| p.exterior.clone()).collect(),
        }
    }

    fn edges(&self) -> Vec<(Point, Point)> {
        match self {
            Geometry::Point(_) => Vec::new(),
            Geometry::LineString(ps) => line_edges(ps, false),
            Geometry::Polygon(p) => polygon_edges(p),
            Geometry::MultiPolygon(ps) => ps.iter().flat_map(polygon_edges).collect(),
        }
    }

    pub fn contains_point(&self, pt: Point) -> bool {
        match self {
            Geometry::Point(p) => approx_eq_point(*p, pt),
            Geometry::LineString(ps) => line_edges(ps, false)
                .iter()
                .any(|(a, b)| point_on_segment(pt, *a, *b)),
            Geometry::Polygon(p) => polygon_contains(p, pt),
            Geometry::MultiPolygon(ps) => ps.iter().any(|p| polygon_contains(p, pt)),
        }
    }

    pub fn intersects(&self, other: &Geometry) -> bool {
        if self.points().iter().any(|p| other.contains_point(*p))
            || other.points().iter().any(|p| self.contains_point(*p))
        {
            return true;
        }
        let mine = self.edges();
        let theirs = other.edges();
        mine.iter()
            .any(|(a, b)| theirs.iter().any(|(c, d)| segments_cross(*a, *b, *c, *d)))
    }

    /// Boundary-inclusive containment of every vertex of `other`, with no
    /// edge of `other` crossing out.
    pub fn covers(&self, other: &Geometry) -> bool {
        let vertices = other.points();
        if vertices.is_empty() {
            return false;
        }
        if !vertices.iter().all(|p| self.contains_point(*p)) {
            return false;
        }
        let mine = self.edges();
        !other
            .edges()
            .iter()
            .any(|(a, b)| mine.iter().any(|(c, d)| segments_cross_strict(*a, *b, *c, *d)))
    }

    pub fn geo_equals(&self, other: &Geometry) -> bool {
        normalize(self) == normalize(other)
    }

    pub fn overlaps(&self, other: &Geometry) -> bool {
        self.intersects(other) && !self.covers(other) && !other.covers(self)
    }
}

fn normalize(g: &Geometry) -> Vec<(i64, i64)> {
    let mut pts: Vec<(i64, i64)> = g
        .points()
        .into_iter()
        .map(|(x, y)| ((x * 1e9) as i64, (y * 1e9) as i64))
        .collect();
    pts.sort_unstable();
    pts.dedup();
    pts
}

fn line_edges(ps: &[Point], close: bool) -> Vec<(Point, Point)> {
    let mut out: Vec<(Point, Point)> = ps.windows(2).map(|w| (w[0], w[1])).collect();
    if close && ps.len() > 2 && ps.first() != ps.last() {
        out.push((*ps.last().unwrap(), ps[0]));
    }
    out
}

fn polygon_edges(p: &Polygon) -> Vec<(Point, Point)> {
    let mut out = line_edges(&p.exterior, true);
    for hole in &p.holes {
        out.extend(line_edges(hole, true));
    }
    out
}

fn polygon_contains(poly: &Polygon, pt: Point) -> bool {
    if !ring_contains(&poly.exterior, pt) {
        return false;
    }
    for hole in &poly.holes {
        if ring_contains(hole, pt)
            && !line_edges(hole, true)
                .iter()
                .any(|(a, b)| point_on_segment(pt, *a, *b))
        {
            return false;
        }
    }
    true
}

/// Ray cast with boundary points counting as inside.
fn ring_contains(ring: &[Point], pt: Point) -> bool {
    let edges = line_edges(ring, true);
    if edges.iter().any(|(a, b)| point_on_segment(pt, *a, *b)) {
        return true;
    }
    let (px, py) = pt;
    let mut inside = false;
    for ((x1, y1), (x2, y2)) in edges {
        if (y1 > py) != (y2 > py) {
            let xin = x1 + (py - y1) / (y2 - y1) * (x2 - x1);
            if px < xin {
                inside = !inside;
            }
        }
    }
    inside
}

const EPS: f64 = 1e-12;

fn approx_eq_point(a: Point, b: Point) -> bool {
    (a.0 - b.0).abs() < EPS && (a.1 - b.1).abs() < EPS
}

fn cross(o: Point, a: Point, b: Point) -> f64 {
    (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
}

fn point_on_segment(p: Point, a: Point, b: Point) -> bool {
    if cross(a, b, p).abs() > EPS {
        return false;
    }
    p.0 >= a.0.min(b.0) - EPS
        && p.0 <= a.0.max(b.0) + EPS
        && p.1 >= a.1.min(b.1) - EPS
        && p.1 <= a.1.max(b.1) + EPS
}

/// Proper or touching intersection.
fn segments_cross(a: Point, b: Point, c: Point, d: Point) -> bool {
    let d1 = cross(c, d, a);
    let d2 = cross(c, d, b);
    let d3 = cross(a, b, c);
    let d4 = cross(a, b, d);
    if ((d1 > EPS && d2 < -EPS) || (d1 < -EPS && d2 > EPS))
        && ((d3 > EPS && d4 < -EPS) || (d3 < -EPS && d4 > EPS))
    {
        return true;
    }
    point_on_segment(a, c, d)
        || point_on_segment(b, c, d)
        || point_on_segment(c, a, b)
        || point_on_segment(d, a, b)
}

/// Proper crossing only; shared endpoints and collinear touches don't count.
fn segments_cross_strict(a: Point, b: Point, c: Point, d: Point) -> bool {
    let d1 = cross(c, d, a);
    let d2 = cross(c, d, b);
    let d3 = cross(a, b, c);
    let d4 = cross(a, b, d);
    ((d1 > EPS && d2 < -EPS) || (d1 < -EPS && d2 > EPS))
        && ((d3 > EPS && d4 < -EPS) || (d3 < -EPS && d4 > EPS))
}

// ---- WKT ----

fn parse_wkt(text: &str) -> Result<Geometry> {
    let upper = text.to_ascii_uppercase();
    let fail = || BasaltError::ParseFailure(text.to_string());
    if let Some(body) = tagged_body(&upper, text, "POINT") {
        let pts = parse_point_list(&body)?;
        return pts.first().copied().map(Geometry::Point).ok_or_else(fail);
    }
    if let Some(body) = tagged_body(&upper, text, "LINESTRING") {
        return Ok(Geometry::LineString(parse_point_list(&body)?));
    }
    if let Some(body) = tagged_body(&upper, text, "POLYGON") {
        return Ok(Geometry::Polygon(parse_polygon_body(&body)?));
    }
    if let Some(body) = tagged_body(&upper, text, "MULTIPOLYGON") {
        let mut polys = Vec::new();
        for part in split_groups(&body)? {
            polys.push(parse_polygon_body(&part)?);
        }
        return Ok(Geometry::MultiPolygon(polys));
    }
    Err(fail())
}

fn tagged_body(upper: &str, original: &str, tag: &str) -> Option<String> {
    if !upper.trim_start().starts_with(tag) {
        return None;
    }
    let open = original.find('(')?;
    let close = original.rfind(')')?;
    if close <= open {
        return None;
    }
    Some(original[open + 1..close].to_string())
}

fn parse_point_list(body: &str) -> Result<Vec<Point>> {
    body.split(',')
        .map(|pair| {
            let mut parts = pair.split_whitespace();
            let x: f64 = parts
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| BasaltError::ParseFailure(pair.to_string()))?;
            let y: f64 = parts
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| BasaltError::ParseFailure(pair.to_string()))?;
            Ok((x, y))
        })
        .collect()
}

/// Splits `(...),(...)` at depth zero.
fn split_groups(body: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in body.chars() {
        match c {
            '(' => {
                if depth > 0 {
                    current.push(c);
                }
                depth += 1;
            }
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| BasaltError::ParseFailure(body.to_string()))?;
                if depth > 0 {
                    current.push(c);
                } else {
                    out.push(std::mem::take(&mut current));
                }
            }
            ',' if depth == 0 => {}
            _ => {
                if depth > 0 {
                    current.push(c);
                }
            }
        }
    }
    Ok(out)
}

fn parse_polygon_body(body: &str) -> Result<Polygon> {
    let rings = split_groups(body)?;
    if rings.is_empty() {
        // single-ring polygon without inner parens
        return Ok(Polygon {
            exterior: parse_point_list(body)?,
            holes: Vec::new(),
        });
    }
    let mut iter = rings.into_iter();
    let exterior = parse_point_list(&iter.next().unwrap())?;
    let holes = iter
        .map(|r| parse_point_list(&r))
        .collect::<Result<Vec<_>>>()?;
    Ok(Polygon { exterior, holes })
}

// ---- GeoJSON ----

fn from_geojson(json: &Json) -> Option<Geometry> {
    let kind = json.get("type")?.as_str()?;
    let coords = json.get("coordinates")?;
    match kind {
        "Point" => Some(Geometry::Point(json_point(coords)?)),
        "LineString" => Some(Geometry::LineString(json_points(coords)?)),
        "Polygon" => Some(Geometry::Polygon(json_polygon(coords)?)),
        "MultiPolygon" => {
            let polys = coords
                .as_array()?
                .iter()
                .map(json_polygon)
                .collect::<Option<Vec<_>>>()?;
            Some(Geometry::MultiPolygon(polys))
        }
        _ => None,
    }
}

fn json_point(v: &Json) -> Option<Point> {
    let arr = v.as_array()?;
    Some((arr.first()?.as_f64()?, arr.get(1)?.as_f64()?))
}

fn json_points(v: &Json) -> Option<Vec<Point>> {
    v.as_array()?.iter().map(json_point).collect()
}

fn json_polygon(v: &Json) -> Option<Polygon> {
    let rings = v.as_array()?;
    let mut iter = rings.iter();
    let exterior = json_points(iter.next()?)?;
    let holes = iter.map(json_points).collect::<Option<Vec<_>>>()?;
    Some(Polygon { exterior, holes })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_square() -> Geometry {
        Geometry::parse("POLYGON((0 0, 10 0, 10 10, 0 10, 0 0))").unwrap()
    }

    #[test]
    fn test_wkt_point_in_polygon() {
        let sq = unit_square();
        assert!(sq.contains_point((5.0, 5.0)));
        assert!(sq.contains_point((0.0, 5.0))); // boundary inclusive
        assert!(!sq.contains_point((15.0, 5.0)));
    }

    #[test]
    fn test_polygon_hole() {
        let donut =
            Geometry::parse("POLYGON((0 0, 10 0, 10 10, 0 10, 0 0), (4 4, 6 4, 6 6, 4 6, 4 4))")
                .unwrap();
        assert!(donut.contains_point((1.0, 1.0)));
        assert!(!donut.contains_point((5.0, 5.0)));
    }

    #[test]
    fn test_covers_and_overlaps() {
        let sq = unit_square();
        let inner = Geometry::parse("POLYGON((2 2, 4 2, 4 4, 2 4, 2 2))").unwrap();
        let shifted = Geometry::parse("POLYGON((8 8, 14 8, 14 14, 8 14, 8 8))").unwrap();
        assert!(sq.covers(&inner));
        assert!(!inner.covers(&sq));
        assert!(sq.overlaps(&shifted));
        assert!(!sq.overlaps(&inner));
    }

    #[test]
    fn test_geojson_parse() {
        let g = Geometry::parse(r#"{"type":"Point","coordinates":[1.5, 2.5]}"#).unwrap();
        assert_eq!(g, Geometry::Point((1.5, 2.5)));
    }

    #[test]
    fn test_disjoint_does_not_intersect() {
        let sq = unit_square();
        let far = Geometry::parse("POLYGON((20 20, 30 20, 30 30, 20 30, 20 20))").unwrap();
        assert!(!sq.intersects(&far));
    }
}
