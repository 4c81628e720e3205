//! Dynamic configuration tree
//!
//! Every configuration layer (built-in defaults, the config file, command
//! line overrides) is first read into a `ConfigValue` so the layers can be
//! merged before anything is typed.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

/// A node of the untyped configuration tree
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConfigValue {
    /// Absent value. Inside a sequence it marks a position with no element.
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Sequence(Vec<ConfigValue>),
    Mapping(BTreeMap<String, ConfigValue>),
}

impl ConfigValue {
    pub fn mapping() -> Self {
        ConfigValue::Mapping(BTreeMap::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ConfigValue::Null)
    }

    /// Mappings and sequences merge recursively; scalars are replaced
    pub fn is_mergeable(&self) -> bool {
        matches!(self, ConfigValue::Mapping(_) | ConfigValue::Sequence(_))
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        match self {
            ConfigValue::Mapping(map) => map.get(key),
            ConfigValue::Sequence(seq) => key.parse::<usize>().ok().and_then(|i| seq.get(i)),
            _ => None,
        }
    }

    /// Look up a dot-delimited path such as `targets.0.url`
    pub fn pointer(&self, path: &str) -> Option<&ConfigValue> {
        path.split('.').try_fold(self, |node, key| node.get(key))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Build the nested structure a dot-delimited key path describes.
    ///
    /// Numeric segments produce sequences, so `targets.0.url` becomes
    /// `{targets: [{url: value}]}` and `a.2` becomes `{a: [null, null, value]}`.
    pub fn from_path(path: &str, value: ConfigValue) -> Self {
        path.rsplit('.').fold(value, |inner, segment| {
            match segment.parse::<usize>() {
                Ok(index) => {
                    let mut seq = vec![ConfigValue::Null; index];
                    seq.push(inner);
                    ConfigValue::Sequence(seq)
                }
                Err(_) => {
                    let mut map = BTreeMap::new();
                    map.insert(segment.to_string(), inner);
                    ConfigValue::Mapping(map)
                }
            }
        })
    }

    /// Deep-merge `other` on top of `self`, returning the combined tree.
    ///
    /// Mappings merge key by key. Sequences merge by position: a hole in
    /// `other` keeps the earlier element, a mergeable element is merged into
    /// the earlier one at that index, and a scalar is appended only when the
    /// earlier sequence does not already contain it. In every other case the
    /// later value wins.
    pub fn merge(self, other: ConfigValue) -> ConfigValue {
        match (self, other) {
            (ConfigValue::Mapping(mut base), ConfigValue::Mapping(overlay)) => {
                for (key, value) in overlay {
                    let merged = match base.remove(&key) {
                        Some(existing) if value.is_mergeable() => existing.merge(value),
                        _ => value,
                    };
                    base.insert(key, merged);
                }
                ConfigValue::Mapping(base)
            }
            (ConfigValue::Sequence(base), ConfigValue::Sequence(overlay)) => {
                ConfigValue::Sequence(merge_sequences(base, overlay))
            }
            (_, other) => other,
        }
    }
}

fn merge_sequences(base: Vec<ConfigValue>, overlay: Vec<ConfigValue>) -> Vec<ConfigValue> {
    let mut result = base.clone();

    for (index, item) in overlay.into_iter().enumerate() {
        if item.is_null() {
            continue;
        }

        if index >= result.len() {
            result.resize(index, ConfigValue::Null);
            result.push(item);
        } else if result[index].is_null() {
            result[index] = item;
        } else if item.is_mergeable() {
            let earlier = std::mem::take(&mut result[index]);
            result[index] = earlier.merge(item);
        } else if !base.contains(&item) {
            result.push(item);
        }
    }

    result
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::String(s.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(s: String) -> Self {
        ConfigValue::String(s)
    }
}

impl From<bool> for ConfigValue {
    fn from(b: bool) -> Self {
        ConfigValue::Bool(b)
    }
}

impl From<i64> for ConfigValue {
    fn from(i: i64) -> Self {
        ConfigValue::Integer(i)
    }
}

impl From<Vec<ConfigValue>> for ConfigValue {
    fn from(seq: Vec<ConfigValue>) -> Self {
        ConfigValue::Sequence(seq)
    }
}

impl From<BTreeMap<String, ConfigValue>> for ConfigValue {
    fn from(map: BTreeMap<String, ConfigValue>) -> Self {
        ConfigValue::Mapping(map)
    }
}

/// Conversion into the `config` crate's value type. Nulls carry no setting:
/// they are dropped from mappings and sequences alike.
impl From<ConfigValue> for config::Value {
    fn from(value: ConfigValue) -> Self {
        let kind = match value {
            ConfigValue::Null => config::ValueKind::Nil,
            ConfigValue::Bool(b) => config::ValueKind::Boolean(b),
            ConfigValue::Integer(i) => config::ValueKind::I64(i),
            ConfigValue::Float(f) => config::ValueKind::Float(f),
            ConfigValue::String(s) => config::ValueKind::String(s),
            ConfigValue::Sequence(seq) => config::ValueKind::Array(
                seq.into_iter()
                    .filter(|v| !v.is_null())
                    .map(config::Value::from)
                    .collect(),
            ),
            ConfigValue::Mapping(map) => config::ValueKind::Table(
                map.into_iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k, config::Value::from(v)))
                    .collect(),
            ),
        };
        config::Value::new(None, kind)
    }
}

impl Serialize for ConfigValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ConfigValue::Null => serializer.serialize_unit(),
            ConfigValue::Bool(b) => serializer.serialize_bool(*b),
            ConfigValue::Integer(i) => serializer.serialize_i64(*i),
            ConfigValue::Float(f) => serializer.serialize_f64(*f),
            ConfigValue::String(s) => serializer.serialize_str(s),
            ConfigValue::Sequence(seq) => {
                let mut out = serializer.serialize_seq(Some(seq.len()))?;
                for item in seq {
                    out.serialize_element(item)?;
                }
                out.end()
            }
            ConfigValue::Mapping(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    out.serialize_entry(k, v)?;
                }
                out.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ConfigValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ConfigValueVisitor)
    }
}

struct ConfigValueVisitor;

impl<'de> Visitor<'de> for ConfigValueVisitor {
    type Value = ConfigValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any configuration value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
        Ok(ConfigValue::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        Ok(ConfigValue::Integer(v))
    }

    fn visit_i128<E: de::Error>(self, v: i128) -> Result<Self::Value, E> {
        i64::try_from(v)
            .map(ConfigValue::Integer)
            .map_err(|_| E::custom(format!("integer {} out of range", v)))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        i64::try_from(v)
            .map(ConfigValue::Integer)
            .map_err(|_| E::custom(format!("integer {} out of range", v)))
    }

    fn visit_u128<E: de::Error>(self, v: u128) -> Result<Self::Value, E> {
        i64::try_from(v)
            .map(ConfigValue::Integer)
            .map_err(|_| E::custom(format!("integer {} out of range", v)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        Ok(ConfigValue::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        Ok(ConfigValue::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
        Ok(ConfigValue::String(v))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(ConfigValue::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(ConfigValue::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_any(self)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut seq = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some(item) = access.next_element()? {
            seq.push(item);
        }
        Ok(ConfigValue::Sequence(seq))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut map = BTreeMap::new();
        while let Some((key, value)) = access.next_entry::<String, ConfigValue>()? {
            map.insert(key, value);
        }
        Ok(ConfigValue::Mapping(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn map(entries: Vec<(&str, ConfigValue)>) -> ConfigValue {
        ConfigValue::Mapping(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    fn seq(items: Vec<ConfigValue>) -> ConfigValue {
        ConfigValue::Sequence(items)
    }

    #[test]
    fn test_from_path_nests_mappings_and_sequences() {
        let value = ConfigValue::from_path("targets.0.url", "mqtt://x".into());
        assert_eq!(
            value,
            map(vec![(
                "targets",
                seq(vec![map(vec![("url", "mqtt://x".into())])])
            )])
        );
    }

    #[test]
    fn test_from_path_pads_with_holes() {
        let value = ConfigValue::from_path("a.2", "v".into());
        assert_eq!(
            value,
            map(vec![(
                "a",
                seq(vec![ConfigValue::Null, ConfigValue::Null, "v".into()])
            )])
        );
    }

    #[test]
    fn test_merge_scalar_later_wins() {
        let base = map(vec![("a", "1".into()), ("b", "2".into())]);
        let overlay = map(vec![("b", "3".into())]);
        assert_eq!(
            base.merge(overlay),
            map(vec![("a", "1".into()), ("b", "3".into())])
        );
    }

    #[test]
    fn test_merge_sequence_index_aligned() {
        let base = map(vec![("targets", seq(vec![map(vec![("url", "a".into())])]))]);
        let overlay = map(vec![(
            "targets",
            seq(vec![map(vec![]), map(vec![("url", "b".into())])]),
        )]);
        assert_eq!(
            base.merge(overlay),
            map(vec![(
                "targets",
                seq(vec![
                    map(vec![("url", "a".into())]),
                    map(vec![("url", "b".into())])
                ])
            )])
        );
    }

    #[test]
    fn test_merge_sequence_hole_keeps_earlier_element() {
        let base = seq(vec![map(vec![("path", "/a".into())]), map(vec![])]);
        let overlay = seq(vec![ConfigValue::Null, map(vec![("on_close", "reopen".into())])]);
        assert_eq!(
            base.merge(overlay),
            seq(vec![
                map(vec![("path", "/a".into())]),
                map(vec![("on_close", "reopen".into())])
            ])
        );
    }

    #[test]
    fn test_merge_sequence_scalars_appended_once() {
        let base = seq(vec!["x".into(), "y".into()]);
        let overlay = seq(vec!["y".into(), "z".into()]);
        assert_eq!(
            base.merge(overlay),
            seq(vec!["x".into(), "y".into(), "z".into()])
        );
    }

    #[test]
    fn test_merge_type_mismatch_later_wins() {
        let base = map(vec![("a", seq(vec!["x".into()]))]);
        let overlay = map(vec![("a", "scalar".into())]);
        assert_eq!(base.merge(overlay), map(vec![("a", "scalar".into())]));
    }

    #[test]
    fn test_merge_is_deterministic() {
        let base = map(vec![("sources", seq(vec![map(vec![])]))]);
        let overlay = ConfigValue::from_path("sources.0.path", "/tmp/fifo".into());
        let first = base.clone().merge(overlay.clone());
        let second = base.merge(overlay);
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_pointer_lookup() {
        let value = ConfigValue::from_path("targets.1.options.username", "u".into());
        assert_eq!(
            value.pointer("targets.1.options.username").and_then(|v| v.as_str()),
            Some("u")
        );
        assert!(value.pointer("targets.0.url").is_none());
    }

    #[test]
    fn test_nulls_dropped_when_converted() {
        let value = map(vec![
            ("a", ConfigValue::Null),
            ("b", seq(vec![ConfigValue::Null, "x".into()])),
        ]);
        let converted = config::Value::from(value);
        let table = converted.into_table().unwrap();
        assert!(!table.contains_key("a"));
        assert_eq!(table["b"].clone().into_array().unwrap().len(), 1);
    }
}
