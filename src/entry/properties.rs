use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{self, IgnoredAny, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Map key marking a UUID in the stored form: `{"$uuid": "..."}`
pub const UUID_TAG: &str = "$uuid";
/// Map key marking a timestamp in the stored form: `{"$timestamp": "..."}`
pub const TIMESTAMP_TAG: &str = "$timestamp";

/// A single structured property value
///
/// Only scalars are representable. Nested structures reach the store as
/// their string form (see `From<serde_json::Value>`).
///
/// Null, booleans, numbers and strings are stored as plain JSON. UUIDs and
/// timestamps are wrapped in a one-key map so they never collide with a
/// string that merely looks like one.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    String(String),
}

impl PropertyValue {
    /// Capture an arbitrary value through its `Display` form
    pub fn display(value: impl fmt::Display) -> Self {
        PropertyValue::String(value.to_string())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Null => f.write_str("null"),
            PropertyValue::Bool(v) => write!(f, "{v}"),
            PropertyValue::Integer(v) => write!(f, "{v}"),
            PropertyValue::Float(v) => write!(f, "{v}"),
            PropertyValue::Uuid(v) => write!(f, "{v}"),
            PropertyValue::Timestamp(v) => f.write_str(&v.to_rfc3339()),
            PropertyValue::String(v) => f.write_str(v),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Integer(value.into())
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Integer(value)
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        PropertyValue::Integer(value.into())
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(value: DateTime<Utc>) -> Self {
        PropertyValue::Timestamp(value)
    }
}

impl From<Uuid> for PropertyValue {
    fn from(value: Uuid) -> Self {
        PropertyValue::Uuid(value)
    }
}

impl<T: Into<PropertyValue>> From<Option<T>> for PropertyValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(PropertyValue::Null, Into::into)
    }
}

impl From<serde_json::Value> for PropertyValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => PropertyValue::Null,
            Value::Bool(v) => PropertyValue::Bool(v),
            Value::Number(n) => match n.as_i64() {
                Some(i) => PropertyValue::Integer(i),
                None => n
                    .as_f64()
                    .map_or_else(|| PropertyValue::String(n.to_string()), PropertyValue::Float),
            },
            Value::String(s) => PropertyValue::String(s),
            nested @ (Value::Array(_) | Value::Object(_)) => PropertyValue::String(nested.to_string()),
        }
    }
}

impl Serialize for PropertyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PropertyValue::Null => serializer.serialize_unit(),
            PropertyValue::Bool(v) => serializer.serialize_bool(*v),
            PropertyValue::Integer(v) => serializer.serialize_i64(*v),
            PropertyValue::Float(v) => serializer.serialize_f64(*v),
            PropertyValue::String(v) => serializer.serialize_str(v),
            PropertyValue::Uuid(v) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(UUID_TAG, v)?;
                map.end()
            }
            PropertyValue::Timestamp(v) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(TIMESTAMP_TAG, v)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for PropertyValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PropertyValueVisitor;

        impl<'de> Visitor<'de> for PropertyValueVisitor {
            type Value = PropertyValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a scalar property value")
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(PropertyValue::Null)
            }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(PropertyValue::Null)
            }

            fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
                PropertyValue::deserialize(deserializer)
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
                Ok(PropertyValue::Bool(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(PropertyValue::Integer(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(i64::try_from(v).map_or(PropertyValue::Float(v as f64), PropertyValue::Integer))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                Ok(PropertyValue::Float(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(PropertyValue::String(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
                Ok(PropertyValue::String(v))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let Some(tag) = access.next_key::<String>()? else {
                    return Err(de::Error::invalid_length(0, &self));
                };
                let value = match tag.as_str() {
                    UUID_TAG => PropertyValue::Uuid(access.next_value()?),
                    TIMESTAMP_TAG => PropertyValue::Timestamp(access.next_value()?),
                    other => {
                        return Err(de::Error::unknown_field(other, &[UUID_TAG, TIMESTAMP_TAG]));
                    }
                };
                if access.next_key::<IgnoredAny>()?.is_some() {
                    return Err(de::Error::invalid_length(2, &self));
                }
                Ok(value)
            }
        }

        deserializer.deserialize_any(PropertyValueVisitor)
    }
}

fn keys_match(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}

/// Property map with case-insensitive keys
///
/// Insertion order is preserved. Once a key is present, later inserts of the
/// same key (in any casing) are ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    entries: Vec<(String, PropertyValue)>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a property, returning `false` if the key was already present
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> bool {
        let key = key.into();
        if self.contains_key(&key) {
            return false;
        }
        self.entries.push((key, value.into()));
        true
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.entries
            .iter()
            .find(|(existing, _)| keys_match(existing, key))
            .map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K, V> FromIterator<(K, V)> for Properties
where
    K: Into<String>,
    V: Into<PropertyValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut properties = Properties::new();
        for (key, value) in iter {
            properties.insert(key, value);
        }
        properties
    }
}

impl IntoIterator for Properties {
    type Item = (String, PropertyValue);
    type IntoIter = std::vec::IntoIter<(String, PropertyValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl Serialize for Properties {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Properties {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PropertiesVisitor;

        impl<'de> Visitor<'de> for PropertiesVisitor {
            type Value = Properties;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of property names to scalar values")
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
                Ok(Properties::new())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut properties = Properties::new();
                while let Some((key, value)) = access.next_entry::<String, PropertyValue>()? {
                    properties.insert(key, value);
                }
                Ok(properties)
            }
        }

        deserializer.deserialize_any(PropertiesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_case_insensitive_first_wins() {
        let mut props = Properties::new();
        assert!(props.insert("UserId", 1));
        assert!(!props.insert("userid", 2));
        assert!(!props.insert("USERID", 3));

        assert_eq!(props.len(), 1);
        assert_eq!(props.get("uSeRiD"), Some(&PropertyValue::Integer(1)));
        assert_eq!(props.iter().next().unwrap().0, "UserId");
    }

    #[test]
    fn test_deserialize_duplicate_keys_keeps_first() {
        let props: Properties =
            serde_json::from_str(r#"{"Name":"first","NAME":"second","count":3}"#).unwrap();
        assert_eq!(props.len(), 2);
        assert_eq!(props.get("name"), Some(&PropertyValue::from("first")));
        assert_eq!(props.get("Count"), Some(&PropertyValue::Integer(3)));
    }

    #[test]
    fn test_scalar_types_survive_json() {
        let id = Uuid::new_v4();
        let at = DateTime::parse_from_rfc3339("2024-03-01T10:00:00.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        let props: Properties = [
            ("flag", PropertyValue::Bool(true)),
            ("n", PropertyValue::Integer(-7)),
            ("ratio", PropertyValue::Float(0.5)),
            ("id", PropertyValue::Uuid(id)),
            ("at", PropertyValue::Timestamp(at)),
            ("text", PropertyValue::from("hello")),
            ("missing", PropertyValue::Null),
        ]
        .into_iter()
        .collect();

        let json = serde_json::to_string(&props).unwrap();
        let back: Properties = serde_json::from_str(&json).unwrap();
        assert_eq!(back, props);
    }

    #[test]
    fn test_lookalike_strings_stay_strings() {
        let props: Properties = [
            ("id", PropertyValue::from("123e4567-e89b-12d3-a456-426614174000")),
            ("at", PropertyValue::from("2024-01-01T00:00:00Z")),
        ]
        .into_iter()
        .collect();

        let json = serde_json::to_string(&props).unwrap();
        assert_eq!(
            json,
            r#"{"id":"123e4567-e89b-12d3-a456-426614174000","at":"2024-01-01T00:00:00Z"}"#
        );
        let back: Properties = serde_json::from_str(&json).unwrap();
        assert_eq!(back, props);
    }

    #[test]
    fn test_typed_values_are_tagged() {
        let id = Uuid::nil();
        let json = serde_json::to_string(&PropertyValue::Uuid(id)).unwrap();
        assert_eq!(json, r#"{"$uuid":"00000000-0000-0000-0000-000000000000"}"#);
        assert_eq!(
            serde_json::from_str::<PropertyValue>(&json).unwrap(),
            PropertyValue::Uuid(id)
        );

        assert!(serde_json::from_str::<PropertyValue>(r#"{"other":"x"}"#).is_err());
        assert!(serde_json::from_str::<PropertyValue>(r#"{"$uuid":"not-a-uuid"}"#).is_err());
    }

    #[test]
    fn test_nested_json_becomes_string() {
        let value = PropertyValue::from(serde_json::json!({"a": [1, 2]}));
        assert_eq!(value, PropertyValue::String(r#"{"a":[1,2]}"#.to_string()));
    }

    #[test]
    fn test_null_map_reads_as_empty() {
        let props: Properties = serde_json::from_str("null").unwrap();
        assert!(props.is_empty());
    }
}
