//! Logical value kinds, type descriptors and coercion rules.

use std::cmp::Ordering;
use std::fmt;

use ordered_float::OrderedFloat;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{BasaltError, Result};

/// Logical scalar kind of a column or expression result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValueKind {
    Float,
    Long,
    Double,
    String,
    Complex,
}

/// Full type descriptor: scalar kind plus composite shapes.
///
/// Serialized as the type string used on the wire, e.g. `"double"`,
/// `"dimension.string"`, `"array.long"`, `"hyperUnique"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueDesc {
    Float,
    Long,
    Double,
    String,
    /// Dictionary-encoded string dimension.
    Dimension,
    Array(Box<ValueDesc>),
    /// Named complex metric; the name selects the serde strategy.
    Complex(String),
}

impl ValueDesc {
    pub fn parse(s: &str) -> ValueDesc {
        match s {
            "float" => ValueDesc::Float,
            "long" => ValueDesc::Long,
            "double" => ValueDesc::Double,
            "string" => ValueDesc::String,
            "dimension.string" => ValueDesc::Dimension,
            other => {
                if let Some(elem) = other.strip_prefix("array.") {
                    ValueDesc::Array(Box::new(ValueDesc::parse(elem)))
                } else {
                    ValueDesc::Complex(other.to_string())
                }
            }
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            ValueDesc::Float => "float".to_string(),
            ValueDesc::Long => "long".to_string(),
            ValueDesc::Double => "double".to_string(),
            ValueDesc::String => "string".to_string(),
            ValueDesc::Dimension => "dimension.string".to_string(),
            ValueDesc::Array(elem) => format!("array.{}", elem.type_name()),
            ValueDesc::Complex(name) => name.clone(),
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            ValueDesc::Float => ValueKind::Float,
            ValueDesc::Long => ValueKind::Long,
            ValueDesc::Double => ValueKind::Double,
            ValueDesc::String | ValueDesc::Dimension => ValueKind::String,
            ValueDesc::Array(_) | ValueDesc::Complex(_) => ValueKind::Complex,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ValueDesc::Float | ValueDesc::Long | ValueDesc::Double)
    }

    pub fn is_complex(&self) -> bool {
        matches!(self, ValueDesc::Complex(_))
    }

    pub fn complex_name(&self) -> Option<&str> {
        match self {
            ValueDesc::Complex(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for ValueDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

impl Serialize for ValueDesc {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.type_name())
    }
}

impl<'de> Deserialize<'de> for ValueDesc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Err(D::Error::custom("empty type string"));
        }
        Ok(ValueDesc::parse(&s))
    }
}

/// A single engine value. Complex values carry their serde name plus the
/// serialized state bytes; live aggregate state never travels as a Scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Null,
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),
    Array(Vec<Scalar>),
    Complex { name: String, data: Vec<u8> },
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Scalar::Float(v) => Some(*v as f64),
            Scalar::Long(v) => Some(*v as f64),
            Scalar::Double(v) => Some(*v),
            Scalar::String(s) => match parse_numeric(s) {
                Ok(v) => v.as_double(),
                Err(_) => None,
            },
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Scalar::Long(v) => Some(*v),
            Scalar::Float(v) => Some(*v as i64),
            Scalar::Double(v) => Some(*v as i64),
            Scalar::String(s) => match parse_numeric(s) {
                Ok(v) => v.as_long(),
                Err(_) => None,
            },
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::String(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean context: null and zero are false, everything else true.
    pub fn truthy(&self) -> bool {
        match self {
            Scalar::Null => false,
            Scalar::Long(v) => *v != 0,
            Scalar::Float(v) => *v != 0.0,
            Scalar::Double(v) => *v != 0.0,
            Scalar::String(s) => !s.is_empty(),
            Scalar::Array(items) => !items.is_empty(),
            Scalar::Complex { .. } => true,
        }
    }

    pub fn bool(v: bool) -> Scalar {
        Scalar::Long(if v { 1 } else { 0 })
    }

    /// Equality across kinds coerces both sides to double. All-digit strings
    /// count as numeric, so `"42" == 42` holds; longs beyond 2^53 can lose
    /// precision under this rule.
    pub fn numeric_eq(&self, other: &Scalar) -> bool {
        match (self.as_double(), other.as_double()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Scalar::Null => serde_json::Value::Null,
            Scalar::Float(v) => serde_json::json!(*v),
            Scalar::Long(v) => serde_json::json!(*v),
            Scalar::Double(v) => serde_json::json!(*v),
            Scalar::String(s) => serde_json::Value::String(s.clone()),
            Scalar::Array(items) => {
                serde_json::Value::Array(items.iter().map(Scalar::to_json).collect())
            }
            Scalar::Complex { data, .. } => {
                use base64::{engine::general_purpose::STANDARD, Engine as _};
                serde_json::Value::String(STANDARD.encode(data))
            }
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Scalar {
        match value {
            serde_json::Value::Null => Scalar::Null,
            serde_json::Value::Bool(b) => Scalar::bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Scalar::Long(v)
                } else {
                    Scalar::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Scalar::String(s.clone()),
            serde_json::Value::Array(items) => {
                Scalar::Array(items.iter().map(Scalar::from_json).collect())
            }
            other => Scalar::String(other.to_string()),
        }
    }
}

/// Total-order comparison over scalars: null first, numerics via total float
/// order (NaN last, -0 == +0), strings lexicographic.
pub fn compare_scalars(a: &Scalar, b: &Scalar) -> Ordering {
    match (a, b) {
        (Scalar::Null, Scalar::Null) => Ordering::Equal,
        (Scalar::Null, _) => Ordering::Less,
        (_, Scalar::Null) => Ordering::Greater,
        (Scalar::Long(x), Scalar::Long(y)) => x.cmp(y),
        (Scalar::String(x), Scalar::String(y)) => {
            if let (Some(nx), Some(ny)) = (numeric_view(a), numeric_view(b)) {
                OrderedFloat(nx).cmp(&OrderedFloat(ny))
            } else {
                x.cmp(y)
            }
        }
        (Scalar::Array(x), Scalar::Array(y)) => {
            for (ax, bx) in x.iter().zip(y.iter()) {
                let ord = compare_scalars(ax, bx);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => match (numeric_view(a), numeric_view(b)) {
            (Some(x), Some(y)) => OrderedFloat(x).cmp(&OrderedFloat(y)),
            _ => a.to_json().to_string().cmp(&b.to_json().to_string()),
        },
    }
}

fn numeric_view(v: &Scalar) -> Option<f64> {
    match v {
        Scalar::Float(x) => Some(*x as f64),
        Scalar::Long(x) => Some(*x as f64),
        Scalar::Double(x) => Some(*x),
        Scalar::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
            s.parse::<f64>().ok()
        }
        _ => None,
    }
}

/// Tolerant numeric parse used everywhere a string must become a number:
/// a leading `+` is stripped, thousands commas are stripped, all-digit input
/// goes through integer parsing first, anything else through decimal parsing.
/// Unparseable non-empty input is a `ParseFailure` carrying the original.
pub fn parse_numeric(raw: &str) -> Result<Scalar> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Scalar::Null);
    }
    let stripped = trimmed.strip_prefix('+').unwrap_or(trimmed);
    let cleaned: String = if stripped.contains(',') {
        stripped.chars().filter(|c| *c != ',').collect()
    } else {
        stripped.to_string()
    };
    let digits_only = {
        let body = cleaned.strip_prefix('-').unwrap_or(&cleaned);
        !body.is_empty() && body.bytes().all(|b| b.is_ascii_digit())
    };
    if digits_only {
        if let Ok(v) = cleaned.parse::<i64>() {
            return Ok(Scalar::Long(v));
        }
    }
    cleaned
        .parse::<f64>()
        .map(Scalar::Double)
        .map_err(|_| BasaltError::ParseFailure(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_numeric_forms() {
        assert_eq!(parse_numeric("42").unwrap(), Scalar::Long(42));
        assert_eq!(parse_numeric("+42").unwrap(), Scalar::Long(42));
        assert_eq!(parse_numeric("1,234,567").unwrap(), Scalar::Long(1_234_567));
        assert_eq!(parse_numeric("-17").unwrap(), Scalar::Long(-17));
        assert_eq!(parse_numeric("3.5").unwrap(), Scalar::Double(3.5));
        assert_eq!(parse_numeric("  ").unwrap(), Scalar::Null);
        assert!(matches!(
            parse_numeric("12abc"),
            Err(BasaltError::ParseFailure(v)) if v == "12abc"
        ));
    }

    #[test]
    fn test_ordering_nan_last_and_negative_zero() {
        let nan = Scalar::Double(f64::NAN);
        let one = Scalar::Double(1.0);
        assert_eq!(compare_scalars(&one, &nan), Ordering::Less);
        assert_eq!(
            compare_scalars(&Scalar::Double(-0.0), &Scalar::Double(0.0)),
            Ordering::Equal
        );
        assert_eq!(compare_scalars(&Scalar::Null, &one), Ordering::Less);
    }

    #[test]
    fn test_numeric_eq_quirk() {
        assert!(Scalar::String("42".into()).numeric_eq(&Scalar::Long(42)));
        assert!(!Scalar::String("x42".into()).numeric_eq(&Scalar::Long(42)));
    }

    #[test]
    fn test_value_desc_round_trip() {
        for name in ["double", "dimension.string", "array.long", "hyperUnique"] {
            assert_eq!(ValueDesc::parse(name).type_name(), name);
        }
        assert!(ValueDesc::parse("thetaSketch").is_complex());
        assert_eq!(ValueDesc::parse("array.double").kind(), ValueKind::Complex);
    }
}
