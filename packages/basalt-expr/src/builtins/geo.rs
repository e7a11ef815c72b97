//! Geohash and H3 cell builtins.

use std::sync::Arc;

use basalt_core::{BasaltError, Result, Scalar, ValueDesc};
use h3o::{CellIndex, LatLng, Resolution};

use crate::{Expr, Function};

use super::{const_long, simple};

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

pub fn create(name: &str, args: &[Expr]) -> Result<Arc<dyn Function>> {
    match name {
        "to_geohash" => {
            super::expect_arity(name, args, 2..=3)?;
            let precision = const_long(name, args, 2)?.unwrap_or(12).clamp(1, 12) as usize;
            simple(name, args, 2..=3, Some(ValueDesc::String), move |v| {
                match (v[0].as_double(), v[1].as_double()) {
                    (Some(lat), Some(lon)) => Ok(Scalar::String(encode(lat, lon, precision))),
                    _ => Ok(Scalar::Null),
                }
            })
        }
        "geohash_to_center" => simple(name, args, 1..=1, None, |v| {
            let Some(hash) = v[0].as_str() else {
                return Ok(Scalar::Null);
            };
            let (lat0, lat1, lon0, lon1) = decode_bbox(hash)?;
            Ok(lat_lon((lat0 + lat1) / 2.0, (lon0 + lon1) / 2.0))
        }),
        "geohash_to_boundary" => simple(name, args, 1..=1, None, |v| {
            let Some(hash) = v[0].as_str() else {
                return Ok(Scalar::Null);
            };
            let (lat0, lat1, lon0, lon1) = decode_bbox(hash)?;
            Ok(Scalar::Array(vec![
                lat_lon(lat0, lon0),
                lat_lon(lat0, lon1),
                lat_lon(lat1, lon1),
                lat_lon(lat1, lon0),
            ]))
        }),
        "to_h3" | "to_h3_address" => {
            super::expect_arity(name, args, 3..=3)?;
            let as_address = name == "to_h3_address";
            let out = if as_address {
                ValueDesc::String
            } else {
                ValueDesc::Long
            };
            simple(name, args, 3..=3, Some(out), move |v| {
                let (Some(lat), Some(lon), Some(res)) =
                    (v[0].as_double(), v[1].as_double(), v[2].as_long())
                else {
                    return Ok(Scalar::Null);
                };
                let resolution = Resolution::try_from(res as u8)
                    .map_err(|_| BasaltError::IllegalArgument(format!("bad h3 resolution: {res}")))?;
                let Ok(ll) = LatLng::new(lat, lon) else {
                    return Ok(Scalar::Null);
                };
                let cell = ll.to_cell(resolution);
                Ok(if as_address {
                    Scalar::String(cell.to_string())
                } else {
                    Scalar::Long(u64::from(cell) as i64)
                })
            })
        }
        "h3_to_center" => simple(name, args, 1..=1, None, |v| {
            let Some(cell) = parse_cell(&v[0]) else {
                return Ok(Scalar::Null);
            };
            let center = LatLng::from(cell);
            Ok(lat_lon(center.lat(), center.lng()))
        }),
        "h3_to_boundary" => simple(name, args, 1..=1, None, |v| {
            let Some(cell) = parse_cell(&v[0]) else {
                return Ok(Scalar::Null);
            };
            let boundary = cell.boundary();
            Ok(Scalar::Array(
                boundary.iter().map(|ll| lat_lon(ll.lat(), ll.lng())).collect(),
            ))
        }),
        other => Err(BasaltError::IllegalArgument(format!(
            "unknown function: {other}"
        ))),
    }
}

fn lat_lon(lat: f64, lon: f64) -> Scalar {
    Scalar::Array(vec![Scalar::Double(lat), Scalar::Double(lon)])
}

fn parse_cell(v: &Scalar) -> Option<CellIndex> {
    match v {
        Scalar::Long(raw) => CellIndex::try_from(*raw as u64).ok(),
        Scalar::String(s) => s.parse::<CellIndex>().ok(),
        _ => None,
    }
}

/// Standard geohash: interleave longitude-first bisection bits, 5 bits per
/// base32 character.
fn encode(lat: f64, lon: f64, precision: usize) -> String {
    let mut lat_range = (-90.0f64, 90.0f64);
    let mut lon_range = (-180.0f64, 180.0f64);
    let mut even = true;
    let mut bits = 0usize;
    let mut current = 0u8;
    let mut out = String::with_capacity(precision);

    while out.len() < precision {
        let bit = if even {
            let mid = (lon_range.0 + lon_range.1) / 2.0;
            if lon >= mid {
                lon_range.0 = mid;
                1
            } else {
                lon_range.1 = mid;
                0
            }
        } else {
            let mid = (lat_range.0 + lat_range.1) / 2.0;
            if lat >= mid {
                lat_range.0 = mid;
                1
            } else {
                lat_range.1 = mid;
                0
            }
        };
        current = (current << 1) | bit;
        bits += 1;
        even = !even;
        if bits == 5 {
            out.push(BASE32[current as usize] as char);
            bits = 0;
            current = 0;
        }
    }
    out
}

/// Returns `(lat_min, lat_max, lon_min, lon_max)`.
fn decode_bbox(hash: &str) -> Result<(f64, f64, f64, f64)> {
    let mut lat_range = (-90.0f64, 90.0f64);
    let mut lon_range = (-180.0f64, 180.0f64);
    let mut even = true;
    for c in hash.bytes() {
        let idx = BASE32
            .iter()
            .position(|b| *b == c.to_ascii_lowercase())
            .ok_or_else(|| BasaltError::ParseFailure(format!("bad geohash: {hash}")))?
            as u8;
        for shift in (0..5).rev() {
            let bit = (idx >> shift) & 1;
            if even {
                let mid = (lon_range.0 + lon_range.1) / 2.0;
                if bit == 1 {
                    lon_range.0 = mid;
                } else {
                    lon_range.1 = mid;
                }
            } else {
                let mid = (lat_range.0 + lat_range.1) / 2.0;
                if bit == 1 {
                    lat_range.0 = mid;
                } else {
                    lat_range.1 = mid;
                }
            }
            even = !even;
        }
    }
    Ok((lat_range.0, lat_range.1, lon_range.0, lon_range.1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;
    use std::collections::HashMap;

    #[test]
    fn test_geohash_known_value() {
        // well-known reference point
        assert_eq!(encode(57.64911, 10.40744, 11), "u4pruydqqvj");
    }

    #[test]
    fn test_geohash_round_trip_center() {
        let h = encode(35.6895, 139.6917, 9);
        let (lat0, lat1, lon0, lon1) = decode_bbox(&h).unwrap();
        assert!((((lat0 + lat1) / 2.0) - 35.6895).abs() < 1e-3);
        assert!((((lon0 + lon1) / 2.0) - 139.6917).abs() < 1e-3);
    }

    #[test]
    fn test_h3_address_and_center() {
        let binding: HashMap<String, Scalar> = [
            ("lat".to_string(), Scalar::Double(37.7752)),
            ("lon".to_string(), Scalar::Double(-122.4186)),
        ]
        .into_iter()
        .collect();
        let addr = parse("to_h3_address(lat, lon, 9)")
            .unwrap()
            .eval(&binding)
            .unwrap();
        let Scalar::String(addr) = addr else {
            panic!("expected address string");
        };
        let center_binding: HashMap<String, Scalar> =
            [("c".to_string(), Scalar::String(addr))].into_iter().collect();
        let center = parse("h3_to_center(c)").unwrap().eval(&center_binding).unwrap();
        match center {
            Scalar::Array(items) => {
                let lat = items[0].as_double().unwrap();
                assert!((lat - 37.7752).abs() < 0.01);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
