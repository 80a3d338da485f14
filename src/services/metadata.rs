use crate::domain::ContainerConfig;
use std::collections::{BTreeMap, BTreeSet};

const SERVICE_PREFIX: &str = "SERVICE_";

/// `SERVICE_*` metadata resolved for one exposed port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    values: BTreeMap<String, String>,
    from_port: BTreeSet<String>,
}

impl Metadata {
    /// Value of a key, treating empty strings as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Whether the key was set through a `SERVICE_<port>_<key>` entry.
    pub fn is_port_scoped(&self, key: &str) -> bool {
        self.from_port.contains(key)
    }

    /// Drops the reserved keys and returns what remains as service attributes.
    pub fn into_attrs(mut self) -> BTreeMap<String, String> {
        for key in ["id", "tags", "name"] {
            self.values.remove(key);
        }
        self.values
    }

    fn insert(&mut self, key: String, value: String) {
        if self.from_port.contains(&key) {
            return;
        }
        self.values.insert(key, value);
    }

    fn insert_scoped(&mut self, key: String, value: String) {
        self.from_port.insert(key.clone());
        self.values.insert(key, value);
    }
}

/// Collects `SERVICE_<KEY>` and `SERVICE_<PORT>_<KEY>` entries from env and labels.
///
/// Keys are lower-cased after the prefix. A port-scoped key only applies when
/// its port matches `port`, and once set it shadows later unscoped entries
/// for the same key.
pub fn service_metadata(config: &ContainerConfig, port: &str) -> Metadata {
    let env = config
        .env
        .iter()
        .filter_map(|entry| entry.split_once('='));
    let labels = config
        .labels
        .iter()
        .map(|(key, value)| (key.as_str(), value.as_str()));

    let mut metadata = Metadata::default();
    for (key, value) in env.chain(labels) {
        let Some(key) = key.strip_prefix(SERVICE_PREFIX) else {
            continue;
        };
        let key = key.to_lowercase();

        match key.split_once('_') {
            Some((scope, scoped_key)) if scope.parse::<u32>().is_ok() => {
                if scope == port {
                    metadata.insert_scoped(scoped_key.to_string(), value.to_string());
                }
            }
            _ => metadata.insert(key, value.to_string()),
        }
    }
    metadata
}

/// Concatenates tag sources in order, splitting each on unescaped commas.
///
/// `\,` yields a literal comma; empty entries are dropped.
pub fn combine_tags<'a>(parts: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    parts.into_iter().flat_map(split_escaped_commas).collect()
}

fn split_escaped_commas(input: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&',') => {
                current.push(',');
                chars.next();
            }
            ',' => {
                if !current.is_empty() {
                    tags.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tags.push(current);
    }
    tags
}
