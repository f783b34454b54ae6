//! Query keys.
//!
//! A [`QueryKey`] is an ordered sequence of primitive [`KeyPart`]s that names one
//! cached resource request, e.g. `["prototypes", "m1"]` or `["models", "mine", <token>]`.
//! Equality is part-by-part, so two keys built from the same logical request at
//! different call sites are always equal, and keys built from different requests
//! never are.
//!
//! Invalidation works on prefixes: [`QueryKey::starts_with`] reports whether a key
//! lives under another one.
//!
//! Parts appended with [`QueryKey::secret`] take part in equality like any other,
//! but the `Display` form masks them so keys can be logged. Use
//! [`QueryKey::canonical`] for the full identity.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// One component of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    /// A missing optional component.
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            // JSON string escaping keeps `"a,b"` and `["a","b"]` apart.
            Self::Str(s) => match serde_json::to_string(s) {
                Ok(quoted) => f.write_str(&quoted),
                Err(_) => write!(f, "{s:?}"),
            },
        }
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&String> for KeyPart {
    fn from(value: &String) -> Self {
        Self::Str(value.clone())
    }
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for KeyPart {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for KeyPart {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for KeyPart {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T: Into<KeyPart>> From<Option<T>> for KeyPart {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Canonical identifier for a cached resource request.
///
/// Equality, ordering and hashing look at the parts only.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<KeyPart>", into = "Vec<KeyPart>")]
pub struct QueryKey {
    parts: Vec<KeyPart>,
    /// Bit `i` set when part `i` is masked in `Display`.
    secret_parts: u64,
}

impl QueryKey {
    /// Creates a key from its parts.
    pub fn new<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<KeyPart>,
    {
        Self {
            parts: parts.into_iter().map(Into::into).collect(),
            secret_parts: 0,
        }
    }

    /// Appends a part, builder style.
    #[must_use]
    pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
        self.parts.push(part.into());
        self
    }

    /// Appends a part that is masked when the key is displayed, such as an access token.
    #[must_use]
    pub fn secret(mut self, part: impl Into<KeyPart>) -> Self {
        let part = part.into();
        if part != KeyPart::Null && self.parts.len() < 64 {
            self.secret_parts |= 1 << self.parts.len();
        }
        self.parts.push(part);
        self
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Returns `true` if `prefix` matches the leading parts of this key.
    ///
    /// The empty key is a prefix of every key.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.parts.starts_with(&prefix.parts)
    }

    /// The canonical string form, a JSON-like array such as `["model","m1"]`.
    ///
    /// Secret parts are included.
    pub fn canonical(&self) -> String {
        self.render(false)
    }

    fn is_secret(&self, index: usize) -> bool {
        index < 64 && self.secret_parts & (1 << index) != 0
    }

    fn render(&self, mask: bool) -> String {
        let parts: Vec<String> = self
            .parts
            .iter()
            .enumerate()
            .map(|(i, part)| {
                if mask && self.is_secret(i) {
                    "\"***\"".to_string()
                } else {
                    part.to_string()
                }
            })
            .collect();
        format!("[{}]", parts.join(","))
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.parts == other.parts
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.parts.hash(state);
    }
}

impl PartialOrd for QueryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parts.cmp(&other.parts)
    }
}

impl From<Vec<KeyPart>> for QueryKey {
    fn from(parts: Vec<KeyPart>) -> Self {
        Self::new(parts)
    }
}

impl From<QueryKey> for Vec<KeyPart> {
    fn from(key: QueryKey) -> Self {
        key.parts
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({self})")
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(true))
    }
}

/// Builds a [`QueryKey`] from a list of parts.
///
/// ```
/// use studio_cache::query_key;
///
/// let key = query_key!["prototypes", "m1", 2_i64];
/// assert_eq!(key.canonical(), r#"["prototypes","m1",2]"#);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($part:expr),* $(,)?) => {
        $crate::key::QueryKey::default()$(.with($part))*
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_parts_are_equal() {
        let a = QueryKey::new(["model", "m1"]);
        let b = query_key!["model", "m1"];
        assert_eq!(a, b);
        assert_eq!(a.canonical(), r#"["model","m1"]"#);
    }

    #[test]
    fn test_part_types_do_not_alias() {
        let text = query_key!["feedbacks", "p1", "1"];
        let number = query_key!["feedbacks", "p1", 1_i64];
        assert_ne!(text, number);
        assert_ne!(text.canonical(), number.canonical());
    }

    #[test]
    fn test_separators_inside_parts_do_not_alias() {
        let joined = query_key!["a,b"];
        let split = query_key!["a", "b"];
        assert_ne!(joined.canonical(), split.canonical());
    }

    #[test]
    fn test_none_becomes_null() {
        let key = query_key!["user", "self", None::<String>];
        assert_eq!(key.parts()[2], KeyPart::Null);
        assert_eq!(key.canonical(), r#"["user","self",null]"#);
    }

    #[test]
    fn test_prefix_matching() {
        let key = query_key!["children", "p1", 3_i64];
        assert!(key.starts_with(&query_key!["children", "p1"]));
        assert!(key.starts_with(&query_key!["children"]));
        assert!(key.starts_with(&QueryKey::default()));
        assert!(!key.starts_with(&query_key!["children", "p2"]));
        assert!(!query_key!["children"].starts_with(&key));
    }

    #[test]
    fn test_secret_parts_are_masked_in_display_only() {
        let key = query_key!["user", "self"].secret("tok-123");
        assert_eq!(key.to_string(), r#"["user","self","***"]"#);
        assert_eq!(key.canonical(), r#"["user","self","tok-123"]"#);
        assert_eq!(key, query_key!["user", "self", "tok-123"]);
        assert_ne!(key, query_key!["user", "self"].secret("tok-456"));
    }

    #[test]
    fn test_absent_secret_displays_as_null() {
        let key = query_key!["models", "mine"].secret(None::<String>);
        assert_eq!(key.to_string(), r#"["models","mine",null]"#);
    }

    #[test]
    fn test_unsuffixed_integer_literals_are_ints() {
        assert_eq!(query_key!["apis", "m1", 1], query_key!["apis", "m1", 1_i64]);
    }

    #[test]
    fn test_serde_round_trip_is_plain_array() {
        let key = query_key!["model", 7_i64, true];
        let json = serde_json::to_string(&key).expect("serialize key");
        assert_eq!(json, r#"["model",7,true]"#);
    }
}
