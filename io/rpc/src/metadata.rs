//! Request and response metadata (headers and trailers).

use crate::status::Status;
use http::header::{HeaderMap, HeaderName, HeaderValue};

/// An ordered, case-insensitive, multi-value header set.
///
/// Names are normalized to lowercase ASCII. Iteration follows the order in
/// which each name was first inserted; values for one name keep their
/// insertion order.
///
/// Two sets are equal when they hold the same names and, for every name,
/// the same sequence of values. The relative order of different names does
/// not participate in equality.
#[derive(Debug, Clone, Default)]
pub struct HeaderSet {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderSet {
    /// Create an empty header set.
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(key))
    }

    /// Append a value for a key, keeping any existing values.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into().to_ascii_lowercase();
        let value = value.into();

        match self.position(&key) {
            Some(idx) => self.entries[idx].1.push(value),
            None => self.entries.push((key, vec![value])),
        }
    }

    /// Replace every value of a key with a single value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.set_all(key, vec![value.into()]);
    }

    /// Replace every value of a key with the given values.
    ///
    /// A key that already exists keeps its position.
    pub fn set_all(&mut self, key: impl Into<String>, values: Vec<String>) {
        let key = key.into().to_ascii_lowercase();

        match self.position(&key) {
            Some(idx) => self.entries[idx].1 = values,
            None => self.entries.push((key, values)),
        }
    }

    /// Get the first value for a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.position(key)
            .and_then(|idx| self.entries[idx].1.first())
            .map(|s| s.as_str())
    }

    /// Get all values for a key.
    pub fn get_all(&self, key: &str) -> Option<&[String]> {
        self.position(key).map(|idx| self.entries[idx].1.as_slice())
    }

    /// Check if a key exists.
    pub fn contains_key(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    /// Remove all values for a key.
    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.position(key).map(|idx| self.entries.remove(idx).1)
    }

    /// Iterate over every (key, value) pair in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(k, values)| values.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    /// Iterate over keys with all of their values.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Iterate over distinct keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Append every entry of `other` to this set.
    pub fn extend(&mut self, other: &HeaderSet) {
        for (key, value) in other.iter() {
            self.append(key, value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of values, counting duplicates.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|(_, v)| v.len()).sum()
    }

    /// Copy an `http::HeaderMap`. Values that are not visible ASCII are
    /// decoded lossily.
    pub fn from_header_map(map: &HeaderMap) -> Self {
        let mut set = HeaderSet::new();
        for (name, value) in map {
            set.append(
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            );
        }
        set
    }

    /// Convert into an `http::HeaderMap`.
    pub fn to_header_map(&self) -> Result<HeaderMap, Status> {
        let mut map = HeaderMap::with_capacity(self.entries.len());
        self.write_into(&mut map)?;
        Ok(map)
    }

    /// Append every entry into an existing `http::HeaderMap`.
    pub fn write_into(&self, map: &mut HeaderMap) -> Result<(), Status> {
        for (key, value) in self.iter() {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| Status::internal(format!("invalid header name: {key}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| Status::internal(format!("invalid value for header {key}")))?;
            map.append(name, value);
        }
        Ok(())
    }
}

impl PartialEq for HeaderSet {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .all(|(key, values)| other.get_all(key) == Some(values.as_slice()))
    }
}

impl Eq for HeaderSet {}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderSet {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut set = HeaderSet::new();
        for (key, value) in iter {
            set.append(key, value);
        }
        set
    }
}
