use std::collections::btree_map;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Header recording the instant an entry was created, when the creator did
/// not supply one.
pub const LAST_MODIFIED: &str = "last-modified";

/// Header carrying the requested entry lifetime on the remote cache API.
pub const TIME_TO_LIVE: &str = "time-to-live";

/// Headers that describe the HTTP transfer rather than the cached object.
/// They are stripped before headers are stored with an entry.
const TRANSPORT: &[&str] = &[
    "content-length",
    "date",
    "accept-encoding",
    "user-agent",
    "transfer-encoding",
    TIME_TO_LIVE,
];

/// A multi-valued, case-insensitive header map, with the same semantics as
/// HTTP headers. Stored with every cache entry.
///
/// Names are normalized to lowercase on insertion, so lookups are
/// case-insensitive and the serialized form is canonical.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, Vec<String>>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value under the given name.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0
            .entry(name.to_lowercase())
            .or_default()
            .push(value.into());
    }

    /// Replace all values under the given name.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_lowercase(), vec![value.into()]);
    }

    /// The first value under the given name, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(&name.to_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.0
            .get(&name.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.0.remove(&name.to_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Vec<String>)> {
        self.0.iter().map(|(name, values)| (name.as_str(), values))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Remove transfer-level headers that must not be cached with an entry.
    pub fn strip_transport(&mut self) {
        for name in TRANSPORT {
            self.0.remove(*name);
        }
    }

    /// Set `Last-Modified` to the given instant unless the creator already
    /// supplied one.
    pub fn ensure_last_modified(&mut self, now: DateTime<Utc>) {
        if !self.contains(LAST_MODIFIED) {
            self.set(LAST_MODIFIED, http_date(now));
        }
    }

    /// Whether every `(name, value)` pair of `other` is present in `self`.
    pub fn contains_all(&self, other: &Headers) -> bool {
        other.iter().all(|(name, values)| {
            let mine = self.get_all(name);
            values.iter().all(|v| mine.contains(v))
        })
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(&name, value);
        }
        headers
    }
}

impl IntoIterator for Headers {
    type Item = (String, Vec<String>);
    type IntoIter = btree_map::IntoIter<String, Vec<String>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Format an instant as an HTTP-date, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse an HTTP-date.
pub fn parse_http_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
