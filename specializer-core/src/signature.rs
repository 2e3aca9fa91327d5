//! Canonical type signatures for argument tuples
//!
//! A signature is the comma-joined list of per-argument tags. It is the key
//! under which the profiler groups timings and the registry files variants.

use crate::value::Value;

/// Wildcard tag matching any signature
pub const GENERIC: &str = "generic";

/// Number of leading array elements inspected when tagging a sequence
const ARRAY_SCAN_LIMIT: usize = 10;

const INT32_MIN: f64 = i32::MIN as f64;
const INT32_MAX: f64 = i32::MAX as f64;

/// Signature detection over runtime values
pub struct TypeSignature;

impl TypeSignature {
    /// Tag a single value
    pub fn detect(value: &Value) -> String {
        match value {
            Value::Null => "null".to_string(),
            Value::Undefined => "undefined".to_string(),
            Value::Bool(_) => "bool".to_string(),
            Value::Int(n) => integer_tag(*n).to_string(),
            Value::Float(x) => float_tag(*x).to_string(),
            Value::String(_) => "string".to_string(),
            Value::Function(_) => "function".to_string(),
            Value::TypedArray(arr) => arr.tag().to_string(),
            Value::Array(items) => array_tag(items),
            Value::Object(_) => "object".to_string(),
            Value::Opaque(_) => "unknown".to_string(),
        }
    }

    /// Tag every argument and join with commas. An empty tuple yields `""`.
    pub fn build(args: &[Value]) -> String {
        args.iter()
            .map(Self::detect)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Equal strings match, and `generic` matches anything
    pub fn matches(a: &str, b: &str) -> bool {
        a == b || a == GENERIC || b == GENERIC
    }

    /// Whether a signature is the generic fallback
    pub fn is_generic(signature: &str) -> bool {
        signature == GENERIC
    }
}

fn integer_tag(n: i64) -> &'static str {
    if n >= i32::MIN as i64 && n <= i32::MAX as i64 {
        "int32"
    } else {
        "int64"
    }
}

fn float_tag(x: f64) -> &'static str {
    // Integral finite floats tag as integers, whatever their magnitude.
    if x.is_finite() && x.fract() == 0.0 {
        if (INT32_MIN..=INT32_MAX).contains(&x) {
            "int32"
        } else {
            "int64"
        }
    } else {
        "float64"
    }
}

fn array_tag(items: &[Value]) -> String {
    let first = match items.first() {
        Some(first) => TypeSignature::detect(first),
        None => return "array_empty".to_string(),
    };

    let homogeneous = items
        .iter()
        .take(ARRAY_SCAN_LIMIT)
        .skip(1)
        .all(|item| TypeSignature::detect(item) == first);

    if homogeneous {
        format!("array_{}", first)
    } else {
        "array_mixed".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{callable, TypedArray};
    use std::collections::BTreeMap;

    #[test]
    fn test_scalar_tags() {
        assert_eq!(TypeSignature::detect(&Value::Null), "null");
        assert_eq!(TypeSignature::detect(&Value::Undefined), "undefined");
        assert_eq!(TypeSignature::detect(&Value::Bool(false)), "bool");
        assert_eq!(TypeSignature::detect(&Value::from("x")), "string");
        assert_eq!(TypeSignature::detect(&Value::Opaque("Symbol".into())), "unknown");
        assert_eq!(
            TypeSignature::detect(&Value::Function(callable(|_| Ok(Value::Null)))),
            "function"
        );
        assert_eq!(TypeSignature::detect(&Value::Object(BTreeMap::new())), "object");
    }

    #[test]
    fn test_integer_ranges() {
        assert_eq!(TypeSignature::detect(&Value::Int(i32::MAX as i64)), "int32");
        assert_eq!(TypeSignature::detect(&Value::Int(i32::MIN as i64)), "int32");
        assert_eq!(TypeSignature::detect(&Value::Int(i32::MAX as i64 + 1)), "int64");
        assert_eq!(TypeSignature::detect(&Value::Int(i32::MIN as i64 - 1)), "int64");
    }

    #[test]
    fn test_float_tags() {
        assert_eq!(TypeSignature::detect(&Value::Float(2.5)), "float64");
        assert_eq!(TypeSignature::detect(&Value::Float(3.0)), "int32");
        assert_eq!(TypeSignature::detect(&Value::Float(4_294_967_296.0)), "int64");
        assert_eq!(TypeSignature::detect(&Value::Float(1e20)), "int64");
        assert_eq!(TypeSignature::detect(&Value::Float(-(2f64.powi(60)))), "int64");
        assert_eq!(TypeSignature::detect(&Value::Float(f64::NAN)), "float64");
        assert_eq!(TypeSignature::detect(&Value::Float(f64::INFINITY)), "float64");
    }

    #[test]
    fn test_array_tags() {
        assert_eq!(TypeSignature::detect(&Value::array(vec![])), "array_empty");
        assert_eq!(
            TypeSignature::detect(&Value::array(vec![Value::Int(1), Value::Int(2)])),
            "array_int32"
        );
        assert_eq!(
            TypeSignature::detect(&Value::array(vec![Value::Int(1), Value::from("a")])),
            "array_mixed"
        );
        assert_eq!(
            TypeSignature::detect(&Value::array(vec![Value::array(vec![Value::Bool(true)])])),
            "array_array_bool"
        );
    }

    #[test]
    fn test_array_scan_stops_after_ten() {
        let mut items: Vec<Value> = (0..10).map(Value::Int).collect();
        items.push(Value::from("late"));
        assert_eq!(TypeSignature::detect(&Value::Array(items)), "array_int32");
    }

    #[test]
    fn test_typed_arrays() {
        let arr = TypedArray::Uint8(vec![1, 2, 3]);
        assert_eq!(TypeSignature::detect(&Value::TypedArray(arr)), "uint8array");
    }

    #[test]
    fn test_empty_tuple() {
        let sig = TypeSignature::build(&[]);
        assert_eq!(sig, "");
        assert!(TypeSignature::matches(&sig, ""));
        assert!(TypeSignature::matches(&sig, GENERIC));
        assert!(!TypeSignature::matches(&sig, "int32"));
    }

    #[test]
    fn test_generic_matches_anything() {
        assert!(TypeSignature::matches(GENERIC, "int32,string"));
        assert!(TypeSignature::matches("float64", GENERIC));
        assert!(!TypeSignature::matches("int32", "int64"));
    }
}
