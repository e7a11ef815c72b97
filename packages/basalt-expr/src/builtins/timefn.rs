//! Time extraction over epoch-millis inputs.

use std::sync::Arc;

use basalt_core::{Result, Scalar, ValueDesc};
use chrono::{Datelike, TimeZone, Timelike, Utc};

use crate::{Expr, Function};

use super::simple;

pub fn create(name: &str, args: &[Expr]) -> Result<Arc<dyn Function>> {
    let field = name.to_string();
    simple(name, args, 1..=1, Some(ValueDesc::Long), move |v| {
        let Some(ms) = v[0].as_long() else {
            return Ok(Scalar::Null);
        };
        let Some(dt) = Utc.timestamp_millis_opt(ms).single() else {
            return Ok(Scalar::Null);
        };
        let out = match field.as_str() {
            "epoch" => ms.div_euclid(1000),
            "second" => dt.second() as i64,
            "minute" => dt.minute() as i64,
            "hour" => dt.hour() as i64,
            "day" => dt.day() as i64,
            // 1 = Monday .. 7 = Sunday
            "dow" => dt.weekday().number_from_monday() as i64,
            "doy" => dt.ordinal() as i64,
            "week" => dt.iso_week().week() as i64,
            "month" => dt.month() as i64,
            "quarter" => ((dt.month() - 1) / 3 + 1) as i64,
            "year" => dt.year() as i64,
            _ => return Ok(Scalar::Null),
        };
        Ok(Scalar::Long(out))
    })
}

#[cfg(test)]
mod tests {
    use crate::parse;
    use basalt_core::{parse_timestamp, Scalar};
    use std::collections::HashMap;

    #[test]
    fn test_extractions() {
        let ts = parse_timestamp("2020-05-15T13:45:30Z").unwrap();
        let binding: HashMap<String, Scalar> =
            [("t".to_string(), Scalar::Long(ts))].into_iter().collect();
        let cases = [
            ("hour(t)", 13),
            ("minute(t)", 45),
            ("day(t)", 15),
            ("month(t)", 5),
            ("quarter(t)", 2),
            ("year(t)", 2020),
            ("dow(t)", 5), // friday
        ];
        for (expr, want) in cases {
            assert_eq!(
                parse(expr).unwrap().eval(&binding).unwrap(),
                Scalar::Long(want),
                "{expr}"
            );
        }
    }
}
