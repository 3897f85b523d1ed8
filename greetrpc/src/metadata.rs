use serde::{Deserialize, Serialize};

/// Ordered key-value multimap sent once when a call is opened.
///
/// Keys are stored in ASCII lowercase. Insertion order is kept, and a key may
/// appear more than once.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Metadata(Vec<(String, String)>);

impl Metadata {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let mut key = key.into();
        key.make_ascii_lowercase();
        self.0.push((key, value.into()));
    }

    /// Returns the first value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).next()
    }

    pub fn get_all<'a, 'k>(&'a self, key: &'k str) -> impl Iterator<Item = &'a str> + use<'a, 'k> {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Self::new();
        for (key, value) in iter {
            metadata.append(key, value);
        }
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_multimap() {
        let mut metadata = Metadata::new();
        metadata.append("X-Client", "go-grpc-demo");
        metadata.append("x-trace", "a");
        metadata.append("x-trace", "b");

        assert_eq!(metadata.len(), 3);
        assert_eq!(metadata.get("x-client"), Some("go-grpc-demo"));
        assert_eq!(metadata.get_all("X-TRACE").collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(metadata.get("missing"), None);

        let keys: Vec<_> = metadata.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["x-client", "x-trace", "x-trace"]);
    }

    #[test]
    fn test_metadata_serde() {
        let metadata: Metadata = [("a", "1"), ("b", "2")].into_iter().collect();
        let json = serde_json::to_string(&metadata).unwrap();
        assert_eq!(json, r#"[["a","1"],["b","2"]]"#);
        assert_eq!(serde_json::from_str::<Metadata>(&json).unwrap(), metadata);
    }
}
