//! Logged values, the source-wide type lock and subscriber callbacks

use crate::error::{DataError, TransportError};
use crate::transport::EntryId;
use ciborium::value::Value as CborValue;
use parking_lot::Mutex;
use std::fmt;

/// A value stored in a data stream: numbers and strings only
#[derive(Debug, Clone, PartialEq)]
pub enum LogValue {
    Number(f64),
    Text(String),
}

impl LogValue {
    pub fn data_type(&self) -> DataType {
        match self {
            LogValue::Number(_) => DataType::Number,
            LogValue::Text(_) => DataType::String,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            LogValue::Number(n) => Some(*n),
            LogValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            LogValue::Text(s) => Some(s),
            LogValue::Number(_) => None,
        }
    }

    /// CBOR payload; whole numbers are written as integers
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        let value = match self {
            LogValue::Number(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => {
                CborValue::Integer((*n as i64).into())
            }
            LogValue::Number(n) => CborValue::Float(*n),
            LogValue::Text(s) => CborValue::Text(s.clone()),
        };
        let mut buf = Vec::with_capacity(16);
        ciborium::ser::into_writer(&value, &mut buf)
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<LogValue, TransportError> {
        let value: CborValue =
            ciborium::de::from_reader(data).map_err(|e| TransportError::Codec(e.to_string()))?;
        match value {
            CborValue::Integer(i) => Ok(LogValue::Number(i128::from(i) as f64)),
            CborValue::Float(f) => Ok(LogValue::Number(f)),
            CborValue::Text(s) => Ok(LogValue::Text(s)),
            other => Err(TransportError::Codec(format!("unsupported log value {:?}", other))),
        }
    }
}

impl From<f64> for LogValue {
    fn from(n: f64) -> Self {
        LogValue::Number(n)
    }
}

impl From<i64> for LogValue {
    fn from(n: i64) -> Self {
        LogValue::Number(n as f64)
    }
}

impl From<i32> for LogValue {
    fn from(n: i32) -> Self {
        LogValue::Number(f64::from(n))
    }
}

impl From<&str> for LogValue {
    fn from(s: &str) -> Self {
        LogValue::Text(s.to_string())
    }
}

impl From<String> for LogValue {
    fn from(s: String) -> Self {
        LogValue::Text(s)
    }
}

impl TryFrom<serde_json::Value> for LogValue {
    type Error = DataError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        match value {
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(LogValue::Number)
                .ok_or_else(|| DataError::UnsupportedValue(n.to_string())),
            serde_json::Value::String(s) => Ok(LogValue::Text(s)),
            other => Err(DataError::UnsupportedValue(other.to_string())),
        }
    }
}

impl fmt::Display for LogValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogValue::Number(n) => write!(f, "{}", n),
            LogValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Number,
    String,
}

impl DataType {
    pub fn name(self) -> &'static str {
        match self {
            DataType::Number => "number",
            DataType::String => "string",
        }
    }
}

/// First write wins; shared by a data source and all of its streams
#[derive(Debug, Default)]
pub struct TypeLock {
    locked: Mutex<Option<DataType>>,
}

impl TypeLock {
    pub fn get(&self) -> Option<DataType> {
        *self.locked.lock()
    }

    pub fn check_or_lock(&self, actual: DataType) -> Result<(), DataError> {
        let mut locked = self.locked.lock();
        match *locked {
            Some(expected) if expected != actual => Err(DataError::TypeMismatch {
                expected: expected.name(),
                actual: actual.name(),
            }),
            Some(_) => Ok(()),
            None => {
                *locked = Some(actual);
                Ok(())
            }
        }
    }
}

/// One cached entry of a data stream
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub value: LogValue,
    /// Milliseconds since the epoch
    pub timestamp: u64,
    pub id: EntryId,
}

/// Subscriber callback, invoked once per newly cached entry in log order
pub trait Notify: Send + Sync {
    fn notify(&self, key: &str, point: &DataPoint);
}

/// Adapter for plain closures
pub struct FnNotify<F>(pub F);

impl<F> Notify for FnNotify<F>
where
    F: Fn(&str, &DataPoint) + Send + Sync,
{
    fn notify(&self, key: &str, point: &DataPoint) {
        (self.0)(key, point)
    }
}
