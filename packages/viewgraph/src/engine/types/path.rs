use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;

/// Dotted attribute path relative to a plan root, e.g. `documents.owner.name`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AttributePath(pub Vec<SmolStr>);

impl AttributePath {
    pub fn new(s: &str) -> Self {
        if s.is_empty() {
            AttributePath(vec![])
        } else {
            AttributePath(s.split('.').map(SmolStr::new).collect())
        }
    }

    pub fn root() -> Self {
        AttributePath(vec![])
    }

    pub fn child(&self, segment: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(SmolStr::new(segment));
        AttributePath(segments)
    }

    /// Appends every segment of `other`.
    pub fn join(&self, other: &AttributePath) -> Self {
        let mut segments = self.0.clone();
        segments.extend(other.0.iter().cloned());
        AttributePath(segments)
    }

    pub fn starts_with(&self, prefix: &AttributePath) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    pub fn last(&self) -> Option<&SmolStr> {
        self.0.last()
    }

    pub fn as_str(&self) -> String {
        self.0
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[SmolStr] {
        &self.0
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<root>")
        } else {
            f.write_str(&self.as_str())
        }
    }
}

impl Serialize for AttributePath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for AttributePath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Ok(AttributePath::new(&s))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_path_new_empty() {
        assert_eq!(AttributePath::new(""), AttributePath::root());
    }

    #[test]
    fn test_path_new_nested() {
        let path = AttributePath::new("documents.owner.name");
        let res: Vec<SmolStr> = vec!["documents", "owner", "name"]
            .into_iter()
            .map(SmolStr::new)
            .collect();
        assert_eq!(path, AttributePath(res));
    }

    #[test]
    fn test_path_child_and_join() {
        let base = AttributePath::new("documents");
        assert_eq!(base.child("owner").as_str(), "documents.owner");
        assert_eq!(
            base.join(&AttributePath::new("owner.name")).as_str(),
            "documents.owner.name"
        );
    }

    #[test]
    fn test_path_starts_with() {
        let path = AttributePath::new("documents.owner.name");
        assert!(path.starts_with(&AttributePath::new("documents")));
        assert!(path.starts_with(&AttributePath::root()));
        assert!(!path.starts_with(&AttributePath::new("owner")));
        assert!(!AttributePath::new("documents").starts_with(&path));
    }

    #[test]
    fn test_path_display_root() {
        assert_eq!(AttributePath::root().to_string(), "<root>");
        assert_eq!(AttributePath::new("a.b").to_string(), "a.b");
    }

    #[test]
    fn test_path_serialize_deserialize() {
        let path = AttributePath::new("payload.record.id");
        let json_str = serde_json::to_string(&path).unwrap();
        assert_eq!(json_str, "\"payload.record.id\"");

        let restored: AttributePath = serde_json::from_str(&json_str).unwrap();
        assert_eq!(restored.segments().len(), 3);
        assert_eq!(restored.segments()[2], "id");
    }
}
