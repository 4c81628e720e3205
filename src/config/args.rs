//! Command line overrides
//!
//! Each positional argument is either `key.path=value` or a bare value
//! (typically a broker URL) assigned to the first target's URL.

use url::Url;

use super::ConfigValue;

/// Key path a bare argument is assigned to
pub const DEFAULT_ARG_KEY: &str = "targets.0.url";

/// Separator between key path and value
pub const ARG_SEPARATOR: char = '=';

/// How an argument was interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideKind {
    /// `key.path=value`
    KeyPath,
    /// A valid absolute URL, assigned to the default key
    BareUrl,
    /// Neither of the above; still assigned to the default key
    Unqualified,
}

/// One parsed command line override
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Override {
    pub key: String,
    pub value: String,
    pub kind: OverrideKind,
    /// Argument exactly as given
    pub raw: String,
}

impl Override {
    pub fn parse(arg: &str) -> Self {
        let kind = match arg.find(ARG_SEPARATOR) {
            _ if Url::parse(arg).is_ok() => OverrideKind::BareUrl,
            Some(index) if index > 0 => OverrideKind::KeyPath,
            _ => OverrideKind::Unqualified,
        };

        let (key, value) = match (kind, arg.split_once(ARG_SEPARATOR)) {
            (OverrideKind::KeyPath, Some((key, value))) => (key.to_string(), value.to_string()),
            _ => (DEFAULT_ARG_KEY.to_string(), arg.to_string()),
        };

        Self {
            key,
            value,
            kind,
            raw: arg.to_string(),
        }
    }

    /// The nested fragment this override describes
    pub fn to_value(&self) -> ConfigValue {
        ConfigValue::from_path(&self.key, ConfigValue::String(self.value.clone()))
    }
}

pub fn parse_overrides<S: AsRef<str>>(args: &[S]) -> Vec<Override> {
    args.iter().map(|a| Override::parse(a.as_ref())).collect()
}

/// Merge every override, in order, into one configuration fragment
pub fn overrides_to_value(overrides: &[Override]) -> ConfigValue {
    overrides
        .iter()
        .fold(ConfigValue::mapping(), |acc, o| acc.merge(o.to_value()))
}
