//! Service keys and host key derivation

use std::fmt;

/// Identifies one watched service inside a registry.
///
/// For Nacos the group is the service group. Consul has no groups, so the
/// group holds the service tags joined with `-`; the datacenter comes from
/// the client that owns the subscription.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    group: String,
    name: String,
}

impl ServiceKey {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.name)
    }
}

/// Build a DNS compatible host name from its segments.
///
/// Segments are joined with `.`; empty segments and repeated dots collapse,
/// underscores become hyphens and the result is lower-cased.
pub fn host_key<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    let joined = segments.into_iter().collect::<Vec<_>>().join(".");
    joined
        .split('.')
        .filter(|label| !label.is_empty())
        .collect::<Vec<_>>()
        .join(".")
        .replace('_', "-")
        .to_lowercase()
}
