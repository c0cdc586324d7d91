use serde::de::{self, Deserializer};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

/// An ordered overlay of environment variables applied on top of the
/// inherited process environment.
///
/// Keys are kept in lexicographic order so the rendered `KEY=VALUE` list is
/// deterministic across runs. Setting a key that already exists replaces its
/// value, which gives "last write wins" semantics when overlays are layered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
    /// Creates a new empty environment overlay.
    ///
    /// # Returns
    /// * `Self` - A new empty Environment instance
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Sets an environment variable in this overlay.
    ///
    /// # Arguments
    /// * `key` - The environment variable name
    /// * `value` - The environment variable value
    ///
    /// # Examples
    /// ```
    /// use testbed::Environment;
    ///
    /// let mut env = Environment::new();
    /// env.set("SERVICE_LOGS_DIR", "/tmp/logs");
    /// assert_eq!(env.get("SERVICE_LOGS_DIR").map(String::as_str), Some("/tmp/logs"));
    /// ```
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder form of [`Environment::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Layers another overlay on top of this one.
    ///
    /// Variables in `other` overwrite variables with the same name in `self`.
    ///
    /// # Arguments
    /// * `other` - The overlay to merge into this one
    ///
    /// # Examples
    /// ```
    /// use testbed::Environment;
    ///
    /// let mut base = Environment::new().with("IMAGE", "nginx:1.25");
    /// base.extend(Environment::new().with("IMAGE", "nginx:1.27"));
    /// assert_eq!(base.get("IMAGE").map(String::as_str), Some("nginx:1.27"));
    /// ```
    pub fn extend(&mut self, other: Environment) {
        self.0.extend(other.0);
    }

    /// Gets the value of an environment variable.
    ///
    /// # Arguments
    /// * `key` - The environment variable name to look up
    ///
    /// # Returns
    /// * `Option<&String>` - The environment variable value, if present
    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }

    /// Iterates over the variables in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Renders the overlay as `KEY=VALUE` strings in key order.
    ///
    /// # Returns
    /// * `Vec<String>` - One entry per variable
    pub fn to_pairs(&self) -> Vec<String> {
        self.0.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    /// Parses `KEY=VALUE` strings into an overlay.
    ///
    /// Entries without `=` are treated as a key with an empty value. Later
    /// duplicates replace earlier ones.
    ///
    /// # Arguments
    /// * `pairs` - The strings to parse
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut env = Self::new();
        for pair in pairs {
            let pair = pair.as_ref();
            match pair.split_once('=') {
                Some((key, value)) => env.set(key, value),
                None => env.set(pair, ""),
            }
        }
        env
    }

    /// Returns true if the overlay contains no variables.
    ///
    /// # Returns
    /// * `bool` - True if empty, false otherwise
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of variables.
    ///
    /// # Returns
    /// * `usize` - The number of environment variables
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Consumes this overlay and returns the underlying map.
    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl From<BTreeMap<String, String>> for Environment {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_pairs().join(", "))
    }
}

/// Renders a YAML scalar the way a shell would see it.
pub(crate) fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::Null => Some(String::new()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

// Compose files and variant definitions write environments either as a
// mapping or as a list of `KEY=VALUE` strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum MapOrList {
    Map(BTreeMap<String, serde_yaml::Value>),
    List(Vec<String>),
}

impl<'de> Deserialize<'de> for Environment {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<MapOrList>::deserialize(deserializer)? {
            None => Ok(Self::new()),
            Some(MapOrList::List(pairs)) => Ok(Self::from_pairs(pairs)),
            Some(MapOrList::Map(map)) => {
                let mut env = Self::new();
                for (key, value) in map {
                    let value = scalar_to_string(&value).ok_or_else(|| {
                        de::Error::custom(format!("environment variable {key} must be a scalar"))
                    })?;
                    env.set(key, value);
                }
                Ok(env)
            }
        }
    }
}
