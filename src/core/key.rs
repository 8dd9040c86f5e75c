// Primary-key values and extraction from JSON records.
//
// Keys are totally ordered: integer keys sort before text keys, integers
// numerically, text lexicographically. That is the ascending order every
// traversal and `get_all` call observes.
use std::fmt;

use serde_json::Value;

use crate::core::error::{Error, ErrorKind};

pub const DEFAULT_KEY_FIELD: &str = "id";

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Key {
    Int(i64),
    Text(String),
}

impl Key {
    /// Accepts the key types records actually carry: JSON integers and strings.
    pub fn from_value(value: &Value) -> Result<Self, Error> {
        match value {
            Value::Number(number) => number.as_i64().map(Key::Int).ok_or_else(|| {
                Error::new(ErrorKind::Usage)
                    .with_message("primary key numbers must be integers")
            }),
            Value::String(text) => Ok(Key::Text(text.clone())),
            other => Err(Error::new(ErrorKind::Usage).with_message(format!(
                "unsupported primary key type: {}",
                type_name(other)
            ))),
        }
    }

    /// CLI key arguments: a decimal integer if it parses, text otherwise.
    pub fn parse(text: &str) -> Self {
        text.parse::<i64>()
            .map(Key::Int)
            .unwrap_or_else(|_| Key::Text(text.to_string()))
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Int(int) => Value::from(*int),
            Key::Text(text) => Value::from(text.clone()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(int) => write!(f, "{int}"),
            Key::Text(text) => write!(f, "{text}"),
        }
    }
}

/// Looks up the table's primary-key field in a record.
pub fn extract(record: &Value, key_field: &str) -> Result<Key, Error> {
    let Some(object) = record.as_object() else {
        return Err(Error::new(ErrorKind::Usage).with_message("record must be a JSON object"));
    };
    let Some(value) = object.get(key_field) else {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("record is missing primary-key field `{key_field}`")));
    };
    Key::from_value(value)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
