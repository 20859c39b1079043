//! Number equality ladder
//!
//! JSON numbers keep their exact literal (serde_json
//! `arbitrary_precision`). Equality tries int64 first, then float64,
//! and falls back to comparing the literals whenever a representation
//! overflows its range.

use serde_json::Number;

/// Compare two JSON numbers for semantic equality.
pub fn number_eq(a: &Number, b: &Number) -> bool {
    let sa = a.to_string();
    let sb = b.to_string();

    if int_like(&sa) && int_like(&sb) {
        return match (sa.parse::<i64>(), sb.parse::<i64>()) {
            (Ok(x), Ok(y)) => x == y,
            // At least one integer literal overflows i64
            _ => sa == sb,
        };
    }

    match (sa.parse::<f64>(), sb.parse::<f64>()) {
        (Ok(x), Ok(y)) if x.is_finite() && y.is_finite() => x == y,
        _ => sa == sb,
    }
}

fn int_like(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn num(s: &str) -> Number {
        match serde_json::from_str::<Value>(s).unwrap() {
            Value::Number(n) => n,
            other => panic!("not a number: {}", other),
        }
    }

    #[test]
    fn test_int_equality() {
        assert!(number_eq(&num("42"), &num("42")));
        assert!(!number_eq(&num("42"), &num("43")));
    }

    #[test]
    fn test_exponent_equals_expanded() {
        assert!(number_eq(&num("1e10"), &num("10000000000")));
        assert!(number_eq(&num("1.5e2"), &num("150")));
    }

    #[test]
    fn test_overflowing_ints_compare_by_literal() {
        assert!(number_eq(
            &num("-9223372036854775808"),
            &num("-9223372036854775808")
        ));
        // Both round to the same f64, but the literals differ
        assert!(!number_eq(
            &num("-9223372036854775808"),
            &num("-9223372036854775809")
        ));
    }

    #[test]
    fn test_int_float_mix() {
        assert!(number_eq(&num("2"), &num("2.0")));
        assert!(!number_eq(&num("2"), &num("2.1")));
    }
}
