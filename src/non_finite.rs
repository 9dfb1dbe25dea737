//! Serde adapters that keep NaN and infinities intact in JSON.
//!
//! `serde_json` writes non-finite floats as `null` and cannot read them back.
//! These adapters write them as the strings `"NaN"`, `"inf"` and `"-inf"`;
//! finite values stay plain numbers. Use with `#[serde(with = "...")]`.

use std::fmt;

use serde::de::{self, Deserializer, Unexpected, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy)]
struct Float(f64);

impl Serialize for Float {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let value = self.0;
        if value.is_finite() {
            serializer.serialize_f64(value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value > 0.0 {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }
}

struct FloatVisitor;

impl Visitor<'_> for FloatVisitor {
    type Value = Float;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a number or one of \"NaN\", \"inf\", \"-inf\"")
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Float, E> {
        Ok(Float(v))
    }

    #[allow(clippy::cast_precision_loss)]
    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Float, E> {
        Ok(Float(v as f64))
    }

    #[allow(clippy::cast_precision_loss)]
    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Float, E> {
        Ok(Float(v as f64))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Float, E> {
        match v {
            "NaN" | "nan" => Ok(Float(f64::NAN)),
            "inf" | "+inf" | "Infinity" => Ok(Float(f64::INFINITY)),
            "-inf" | "-Infinity" => Ok(Float(f64::NEG_INFINITY)),
            _ => Err(E::invalid_value(Unexpected::Str(v), &self)),
        }
    }
}

impl<'de> Deserialize<'de> for Float {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(FloatVisitor)
    }
}

struct Slice<'a>(&'a [f64]);

impl Serialize for Slice<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(self.0.iter().map(|v| Float(*v)))
    }
}

fn unwrap_all(values: Vec<Float>) -> Vec<f64> {
    values.into_iter().map(|f| f.0).collect()
}

/// `f64`.
pub(crate) mod scalar {
    use super::{Deserialize, Deserializer, Float, Serialize, Serializer};

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub(crate) fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        Float(*value).serialize(serializer)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Float::deserialize(deserializer).map(|f| f.0)
    }
}

/// `Option<f64>`.
pub(crate) mod option {
    use super::{Deserialize, Deserializer, Float, Serialize, Serializer};

    #[allow(clippy::ref_option)]
    pub(crate) fn serialize<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        value.map(Float).serialize(serializer)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        Option::<Float>::deserialize(deserializer).map(|v| v.map(|f| f.0))
    }
}

/// `Vec<f64>`.
pub(crate) mod seq {
    use super::{unwrap_all, Deserialize, Deserializer, Float, Serialize, Serializer, Slice};

    #[allow(clippy::ptr_arg)]
    pub(crate) fn serialize<S: Serializer>(values: &Vec<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        Slice(values).serialize(serializer)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        Vec::<Float>::deserialize(deserializer).map(unwrap_all)
    }
}

/// `Vec<Vec<f64>>`.
pub(crate) mod rows {
    use super::{unwrap_all, Deserialize, Deserializer, Float, Serializer, Slice};

    #[allow(clippy::ptr_arg)]
    pub(crate) fn serialize<S: Serializer>(rows: &Vec<Vec<f64>>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(rows.iter().map(|row| Slice(row)))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<f64>>, D::Error> {
        Vec::<Vec<Float>>::deserialize(deserializer).map(|rows| rows.into_iter().map(unwrap_all).collect())
    }
}

/// `Vec<(String, f64)>`.
pub(crate) mod named {
    use super::{Deserialize, Deserializer, Float, Serializer};

    #[allow(clippy::ptr_arg)]
    pub(crate) fn serialize<S: Serializer>(values: &Vec<(String, f64)>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|(name, v)| (name, Float(*v))))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, f64)>, D::Error> {
        Vec::<(String, Float)>::deserialize(deserializer)
            .map(|values| values.into_iter().map(|(name, f)| (name, f.0)).collect())
    }
}

/// `Vec<(String, Vec<f64>)>`.
pub(crate) mod columns {
    use super::{unwrap_all, Deserialize, Deserializer, Float, Serializer, Slice};

    #[allow(clippy::ptr_arg)]
    pub(crate) fn serialize<S: Serializer>(
        columns: &Vec<(String, Vec<f64>)>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(columns.iter().map(|(name, samples)| (name, Slice(samples))))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, Vec<f64>)>, D::Error> {
        Vec::<(String, Vec<Float>)>::deserialize(deserializer)
            .map(|columns| columns.into_iter().map(|(name, v)| (name, unwrap_all(v))).collect())
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Sample {
        #[serde(with = "super::scalar")]
        x: f64,
        #[serde(with = "super::option", default)]
        t: Option<f64>,
        #[serde(with = "super::seq")]
        xs: Vec<f64>,
        #[serde(with = "super::rows")]
        grid: Vec<Vec<f64>>,
        #[serde(with = "super::named")]
        bindings: Vec<(String, f64)>,
        #[serde(with = "super::columns")]
        columns: Vec<(String, Vec<f64>)>,
    }

    #[test]
    fn non_finite_values_survive_json() {
        let sample = Sample {
            x: f64::NAN,
            t: Some(f64::NEG_INFINITY),
            xs: vec![1.5, f64::INFINITY],
            grid: vec![vec![f64::NAN], vec![2.0]],
            bindings: vec![("E".to_string(), f64::INFINITY)],
            columns: vec![("y".to_string(), vec![0.0, f64::NAN])],
        };
        let json = serde_json::to_string(&sample).unwrap();
        assert!(!json.contains("null"));

        let back: Sample = serde_json::from_str(&json).unwrap();
        assert!(back.x.is_nan());
        assert_eq!(back.t, Some(f64::NEG_INFINITY));
        assert_eq!(back.xs, vec![1.5, f64::INFINITY]);
        assert!(back.grid[0][0].is_nan());
        assert_eq!(back.grid[1], vec![2.0]);
        assert_eq!(back.bindings, vec![("E".to_string(), f64::INFINITY)]);
        assert!(back.columns[0].1[1].is_nan());
    }

    #[test]
    fn finite_values_stay_numbers() {
        let json = r#"{"x":3,"xs":[0.5],"grid":[],"bindings":[["F",30000.0]],"columns":[]}"#;
        let sample: Sample = serde_json::from_str(json).unwrap();
        assert_eq!(sample.x, 3.0);
        assert_eq!(sample.t, None);
        assert_eq!(serde_json::to_value(&sample).unwrap()["xs"], serde_json::json!([0.5]));
    }

    #[test]
    fn unknown_string_is_rejected() {
        let json = r#"{"x":"big","xs":[],"grid":[],"bindings":[],"columns":[]}"#;
        let err = serde_json::from_str::<Sample>(json).unwrap_err();
        assert!(err.to_string().contains("NaN"));
    }
}
