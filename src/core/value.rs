//! ER-003: Decoded data model: numbers, text, arrays, records.
//!
//! Numbers keep the integer/float distinction of the wire format: integer
//! slots decode to `Number::Int`, float slots to `Number::Float`. Arrays are
//! either sparse (index → value, indices as written in the recipe) or dense
//! (positions after index-shift calibration).

use super::error::{EngineError, Result};
use indexmap::IndexMap;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Ordered name → value mapping; one per section.
pub type Record = IndexMap<String, Value>;

/// A numeric slot value.
#[derive(Debug, Clone, Copy)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }

    pub fn is_int(self) -> bool {
        matches!(self, Number::Int(_))
    }

    /// Integer value if the number is an integer or an integral float.
    pub fn as_exact_int(self) -> Option<i64> {
        match self {
            Number::Int(i) => Some(i),
            Number::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Some(f as i64),
            Number::Float(_) => None,
        }
    }

    pub fn is_zero(self) -> bool {
        self.as_f64() == 0.0
    }

    pub fn add(self, rhs: Number) -> Number {
        match (self, rhs) {
            (Number::Int(a), Number::Int(b)) => match a.checked_add(b) {
                Some(v) => Number::Int(v),
                None => Number::Float(a as f64 + b as f64),
            },
            (a, b) => Number::Float(a.as_f64() + b.as_f64()),
        }
    }

    pub fn sub(self, rhs: Number) -> Number {
        self.add(rhs.neg())
    }

    pub fn mul(self, rhs: Number) -> Number {
        match (self, rhs) {
            (Number::Int(a), Number::Int(b)) => match a.checked_mul(b) {
                Some(v) => Number::Int(v),
                None => Number::Float(a as f64 * b as f64),
            },
            (a, b) => Number::Float(a.as_f64() * b.as_f64()),
        }
    }

    pub fn neg(self) -> Number {
        match self {
            Number::Int(i) => match i.checked_neg() {
                Some(v) => Number::Int(v),
                None => Number::Float(-(i as f64)),
            },
            Number::Float(f) => Number::Float(-f),
        }
    }

    /// Division. An integer quotient of two integers must be exact when
    /// `strict_int` is set; otherwise it is promoted to a float.
    pub fn div(self, rhs: Number, strict_int: bool) -> Result<Number> {
        if rhs.is_zero() {
            return Err(EngineError::DivisionByZero(format!("{} / {}", self, rhs)));
        }
        match (self, rhs) {
            (Number::Int(a), Number::Int(b)) => {
                if a.checked_rem(b) == Some(0) {
                    Ok(a.checked_div(b).map_or(Number::Float(a as f64 / b as f64), Number::Int))
                } else if strict_int {
                    Err(EngineError::InvalidInteger(format!("{} / {}", a, b)))
                } else {
                    Ok(Number::Float(a as f64 / b as f64))
                }
            }
            (a, b) => Ok(Number::Float(a.as_f64() / b.as_f64())),
        }
    }

    /// Modulo with the sign of the divisor.
    pub fn rem(self, rhs: Number) -> Result<Number> {
        if rhs.is_zero() {
            return Err(EngineError::DivisionByZero(format!("{} % {}", self, rhs)));
        }
        match (self, rhs) {
            (Number::Int(a), Number::Int(b)) => Ok(Number::Int(match a.checked_rem(b) {
                Some(r) if r != 0 && (r < 0) != (b < 0) => r + b,
                Some(r) => r,
                // i64::MIN % -1
                None => 0,
            })),
            (a, b) => {
                let (a, b) = (a.as_f64(), b.as_f64());
                Ok(Number::Float(a - b * (a / b).floor()))
            }
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Number) -> bool {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a == b,
            (a, b) => a.as_f64() == b.as_f64(),
        }
    }
}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Number) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a.partial_cmp(b),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int(i) => write!(f, "{}", i),
            Number::Float(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<i64> for Number {
    fn from(v: i64) -> Self {
        Number::Int(v)
    }
}

impl From<f64> for Number {
    fn from(v: f64) -> Self {
        Number::Float(v)
    }
}

/// Storage layout for arrays created while decoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayMode {
    /// Index → value maps keyed by the indices the recipe uses.
    #[default]
    Sparse,
    /// Sequences; indices are shifted so the first observed index is 0.
    Dense,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Array {
    Sparse(BTreeMap<i64, Value>),
    Dense(Vec<Value>),
}

impl Array {
    pub fn new(mode: ArrayMode) -> Array {
        match mode {
            ArrayMode::Sparse => Array::Sparse(BTreeMap::new()),
            ArrayMode::Dense => Array::Dense(Vec::new()),
        }
    }

    pub fn is_dense(&self) -> bool {
        matches!(self, Array::Dense(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Array::Sparse(m) => m.len(),
            Array::Dense(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at a storage key (raw index for sparse, position for dense).
    pub fn get(&self, key: i64) -> Option<&Value> {
        match self {
            Array::Sparse(m) => m.get(&key),
            Array::Dense(v) => usize::try_from(key).ok().and_then(|k| v.get(k)),
        }
    }

    pub fn get_mut(&mut self, key: i64) -> Option<&mut Value> {
        match self {
            Array::Sparse(m) => m.get_mut(&key),
            Array::Dense(v) => usize::try_from(key).ok().and_then(move |k| v.get_mut(k)),
        }
    }

    /// Store a value. Dense arrays accept overwrites and appends at
    /// position == length only.
    pub fn set(&mut self, key: i64, value: Value) -> bool {
        match self {
            Array::Sparse(m) => {
                m.insert(key, value);
                true
            }
            Array::Dense(v) => match usize::try_from(key) {
                Ok(k) if k < v.len() => {
                    v[k] = value;
                    true
                }
                Ok(k) if k == v.len() => {
                    v.push(value);
                    true
                }
                _ => false,
            },
        }
    }

    /// Element at `key`, inserted from `make` if absent. `None` if a dense
    /// array cannot grow to `key`.
    pub fn get_or_insert_with(
        &mut self,
        key: i64,
        make: impl FnOnce() -> Value,
    ) -> Option<&mut Value> {
        match self {
            Array::Sparse(m) => Some(m.entry(key).or_insert_with(make)),
            Array::Dense(v) => {
                let k = usize::try_from(key).ok()?;
                if k == v.len() {
                    v.push(make());
                }
                v.get_mut(k)
            }
        }
    }

    /// Elements in storage order.
    pub fn values(&self) -> Box<dyn Iterator<Item = &Value> + '_> {
        match self {
            Array::Sparse(m) => Box::new(m.values()),
            Array::Dense(v) => Box::new(v.iter()),
        }
    }

    /// Storage keys with their elements, in storage order.
    pub fn entries(&self) -> Box<dyn Iterator<Item = (i64, &Value)> + '_> {
        match self {
            Array::Sparse(m) => Box::new(m.iter().map(|(k, v)| (*k, v))),
            Array::Dense(v) => Box::new(v.iter().enumerate().map(|(k, v)| (k as i64, v))),
        }
    }

    /// All elements as numbers, or `None` if any element is not numeric.
    pub fn numbers(&self) -> Option<Vec<Number>> {
        self.values().map(Value::as_number).collect()
    }
}

/// A decoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(Number),
    Text(String),
    Array(Array),
    Record(Record),
}

impl Default for Value {
    fn default() -> Self {
        Value::Record(Record::new())
    }
}

impl Value {
    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    /// Dense array of numbers.
    pub fn sequence(values: Vec<Number>) -> Value {
        Value::Array(Array::Dense(values.into_iter().map(Value::Number).collect()))
    }

    /// Short type name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Text(_) => "text",
            Value::Array(_) => "array",
            Value::Record(_) => "record",
        }
    }

    /// Convert JSON input for encoding. Objects whose keys are all integers
    /// become sparse arrays; JSON arrays become dense arrays.
    pub fn from_json(json: serde_json::Value) -> Result<Value> {
        use serde::de::Error as _;
        match json {
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Number(Number::Int(i)))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Number(Number::Float(f)))
                } else {
                    Err(serde_json::Error::custom(format!("number {} out of range", n)).into())
                }
            }
            serde_json::Value::String(s) => Ok(Value::Text(s)),
            serde_json::Value::Array(items) => {
                let values = items
                    .into_iter()
                    .map(Value::from_json)
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::Array(Array::Dense(values)))
            }
            serde_json::Value::Object(map) => {
                let int_keys = !map.is_empty() && map.keys().all(|k| k.parse::<i64>().is_ok());
                if int_keys {
                    let mut sparse = BTreeMap::new();
                    for (k, v) in map {
                        let key = k
                            .parse::<i64>()
                            .map_err(|e| serde_json::Error::custom(e.to_string()))?;
                        sparse.insert(key, Value::from_json(v)?);
                    }
                    Ok(Value::Array(Array::Sparse(sparse)))
                } else {
                    let mut record = Record::new();
                    for (k, v) in map {
                        record.insert(k, Value::from_json(v)?);
                    }
                    Ok(Value::Record(record))
                }
            }
            other => Err(serde_json::Error::custom(format!("unsupported JSON value {}", other)).into()),
        }
    }
}

impl From<Number> for Value {
    fn from(n: Number) -> Self {
        Value::Number(n)
    }
}

impl Serialize for Number {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Number::Int(i) => serializer.serialize_i64(*i),
            Number::Float(f) => serializer.serialize_f64(*f),
        }
    }
}

impl Serialize for Array {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Array::Sparse(m) => {
                let mut map = serializer.serialize_map(Some(m.len()))?;
                for (k, v) in m {
                    map.serialize_entry(&k.to_string(), v)?;
                }
                map.end()
            }
            Array::Dense(v) => {
                let mut seq = serializer.serialize_seq(Some(v.len()))?;
                for item in v {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Number(n) => n.serialize(serializer),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Array(a) => a.serialize(serializer),
            Value::Record(r) => r.serialize(serializer),
        }
    }
}
