//! Key names used by earlier pimper releases
//!
//! Older configuration files spell keys in camelCase (`topicSeparator`,
//! `onClose`, `statusTopic`, ...), name the FIFO `file` and give MQTT
//! timeouts in milliseconds. Each layer is rewritten to the current
//! snake_case names before merging so both spellings land on one key.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::ConfigValue;

const ROOT_KEYS: &[(&str, &str)] = &[("topicseparator", "topic_separator")];

const SOURCE_KEYS: &[(&str, &str)] = &[
    ("file", "path"),
    ("topicseparator", "topic_separator"),
    ("onclose", "on_close"),
];

const TARGET_KEYS: &[(&str, &str)] = &[
    ("statustopic", "status_topic"),
    ("cafile", "ca_file"),
    ("connectionoptions", "options"),
];

const OPTION_KEYS: &[(&str, &str)] = &[
    ("clientid", "client_id"),
    ("keepalive", "keep_alive"),
    ("clean", "clean_start"),
    ("protocolversion", "protocol_version"),
    ("reconnectperiod", "reconnect_period"),
    ("connecttimeout", "connect_timeout"),
];

/// Durations that were plain millisecond counts; a bare number is still
/// read that way
const MILLISECOND_KEYS: &[&str] = &["reconnect_period", "connect_timeout"];

/// Rewrite legacy key names in one configuration layer
pub fn normalize(value: ConfigValue) -> ConfigValue {
    let mut root = match value {
        ConfigValue::Mapping(root) => root,
        other => return other,
    };
    rename_keys(&mut root, ROOT_KEYS, "");

    if let Some(ConfigValue::Sequence(sources)) = root.get_mut("sources") {
        for (i, source) in sources.iter_mut().enumerate() {
            if let ConfigValue::Mapping(map) = source {
                rename_keys(map, SOURCE_KEYS, &format!("sources.{}.", i));
            }
        }
    }

    if let Some(ConfigValue::Sequence(targets)) = root.get_mut("targets") {
        for (i, target) in targets.iter_mut().enumerate() {
            let ConfigValue::Mapping(map) = target else {
                continue;
            };
            let prefix = format!("targets.{}.", i);
            rename_keys(map, TARGET_KEYS, &prefix);
            if let Some(ConfigValue::Mapping(options)) = map.get_mut("options") {
                rename_keys(options, OPTION_KEYS, &format!("{}options.", prefix));
                for key in MILLISECOND_KEYS {
                    if let Some(value) = options.get_mut(*key) {
                        if let Some(ms) = as_millis(value) {
                            *value = ConfigValue::String(format!("{}ms", ms));
                        }
                    }
                }
            }
        }
    }

    ConfigValue::Mapping(root)
}

/// A bare number, also as a command line string
fn as_millis(value: &ConfigValue) -> Option<u64> {
    match value {
        ConfigValue::Integer(ms) => u64::try_from(*ms).ok(),
        ConfigValue::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn rename_keys(map: &mut BTreeMap<String, ConfigValue>, table: &[(&str, &str)], prefix: &str) {
    let legacy: Vec<(String, &str)> = map
        .keys()
        .filter_map(|key| {
            let lower = key.to_ascii_lowercase();
            let &(_, new) = table.iter().find(|(old, _)| *old == lower)?;
            (key.as_str() != new).then(|| (key.clone(), new))
        })
        .collect();

    for (old, new) in legacy {
        let Some(value) = map.remove(&old) else {
            continue;
        };
        if map.contains_key(new) {
            warn!("Both {}{} and {}{} are set, using {}{}", prefix, old, prefix, new, prefix, new);
            continue;
        }
        debug!("Reading {}{} as {}{}", prefix, old, prefix, new);
        map.insert(new.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tree(json: &str) -> ConfigValue {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_camel_case_keys_are_renamed() {
        let normalized = normalize(tree(
            r#"{
                "topicSeparator": "|",
                "sources": [{"file": "/run/a", "onClose": "reopen"}],
                "targets": [{
                    "url": "mqtt://broker",
                    "statusTopic": "x/status",
                    "caFile": "/etc/ca.pem",
                    "options": {"clientId": "c1", "keepalive": 10, "reconnectPeriod": 2500}
                }]
            }"#,
        ));

        assert_eq!(
            normalized,
            tree(
                r#"{
                    "topic_separator": "|",
                    "sources": [{"path": "/run/a", "on_close": "reopen"}],
                    "targets": [{
                        "url": "mqtt://broker",
                        "status_topic": "x/status",
                        "ca_file": "/etc/ca.pem",
                        "options": {"client_id": "c1", "keep_alive": 10, "reconnect_period": "2500ms"}
                    }]
                }"#
            )
        );
    }

    #[test]
    fn test_current_key_wins_over_legacy_one() {
        let normalized = normalize(tree(
            r#"{"sources": [{"file": "/old", "path": "/new"}]}"#,
        ));
        assert_eq!(normalized, tree(r#"{"sources": [{"path": "/new"}]}"#));
    }

    #[test]
    fn test_lowercased_legacy_keys_are_recognised() {
        let normalized = normalize(tree(r#"{"targets": [{"statustopic": ""}]}"#));
        assert_eq!(normalized, tree(r#"{"targets": [{"status_topic": ""}]}"#));
    }

    #[test]
    fn test_numeric_override_string_is_milliseconds() {
        let normalized = normalize(tree(
            r#"{"targets": [{"options": {"reconnectPeriod": "250"}}]}"#,
        ));
        assert_eq!(
            normalized,
            tree(r#"{"targets": [{"options": {"reconnect_period": "250ms"}}]}"#)
        );
    }

    #[test]
    fn test_humantime_strings_are_left_alone() {
        let normalized = normalize(tree(
            r#"{"targets": [{"options": {"connect_timeout": "5s"}}]}"#,
        ));
        assert_eq!(
            normalized,
            tree(r#"{"targets": [{"options": {"connect_timeout": "5s"}}]}"#)
        );
    }
}
