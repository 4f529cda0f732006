//! Query keys and their canonical encoding.
//!
//! A [`QueryKey`] is an ordered list of JSON segments such as
//! `["bookings", {"status": "New Bookings"}]`. Keys are compared through their
//! canonical encoding: segment order matters, but the property order of object
//! segments does not, since properties are sorted before encoding.
//!
//! ```
//! use quarry::{QueryKey, query_key};
//!
//! let a = query_key!["bookings", {"status": "New Bookings", "page": 1}];
//! let b = query_key!["bookings", {"page": 1, "status": "New Bookings"}];
//! assert_eq!(a, b);
//! assert!(a.starts_with(&QueryKey::from("bookings")));
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde_json::Value;

/// A structured, immutable cache key.
#[derive(Clone)]
pub struct QueryKey {
    segments: Arc<[Value]>,
    encoded: Arc<str>,
}

impl QueryKey {
    /// Creates a key from its segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Value>,
    {
        let segments: Arc<[Value]> = segments.into_iter().map(Into::into).collect();
        let encoded = encode(&segments).into();
        Self { segments, encoded }
    }

    /// The empty key. Every key starts with it.
    #[must_use]
    pub fn root() -> Self {
        Self::new(Vec::<Value>::new())
    }

    /// Returns a new key with `segment` appended.
    #[must_use]
    pub fn with(&self, segment: impl Into<Value>) -> Self {
        let mut segments = self.segments.to_vec();
        segments.push(segment.into());
        Self::new(segments)
    }

    /// The segments of this key, in order.
    pub fn segments(&self) -> &[Value] {
        &self.segments
    }

    /// The canonical string encoding used for cache lookup.
    pub fn encode(&self) -> &str {
        &self.encoded
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns `true` for the root key.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns `true` if the leading segments of this key equal `prefix`.
    pub fn starts_with(&self, prefix: &Self) -> bool {
        self.segments.starts_with(&prefix.segments)
    }
}

fn encode(segments: &[Value]) -> String {
    let mut out = String::new();
    write_array(segments, &mut out);
    out
}

fn write_array(items: &[Value], out: &mut String) {
    out.push('[');
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_canonical(item, out);
    }
    out.push(']');
}

// Object properties are sorted explicitly so the encoding does not depend on
// serde_json's map ordering feature.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut properties: Vec<_> = map.iter().collect();
            properties.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));

            out.push('{');
            for (i, (name, value)) in properties.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => write_array(items, out),
        scalar => out.push_str(&scalar.to_string()),
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.encoded.hash(state);
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({})", self.encoded)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl From<&str> for QueryKey {
    fn from(segment: &str) -> Self {
        Self::new([segment])
    }
}

impl From<String> for QueryKey {
    fn from(segment: String) -> Self {
        Self::new([segment])
    }
}

impl<S: Into<Value>, const N: usize> From<[S; N]> for QueryKey {
    fn from(segments: [S; N]) -> Self {
        Self::new(segments)
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(segments: Vec<Value>) -> Self {
        Self::new(segments)
    }
}

impl From<&QueryKey> for QueryKey {
    fn from(key: &QueryKey) -> Self {
        key.clone()
    }
}

/// Builds a [`QueryKey`] from JSON-literal segments.
///
/// Each segment accepts anything [`serde_json::json!`] accepts as a single
/// token tree: string, number and boolean literals, `null`, object literals and
/// identifiers of serializable values. Wrap negative numbers in parentheses.
///
/// ```
/// use quarry::query_key;
///
/// let booking_id = "b-42";
/// let key = query_key!["singleBooking", booking_id];
/// assert_eq!(key.encode(), r#"["singleBooking","b-42"]"#);
/// ```
///
/// # Panics
///
/// Panics if an identifier segment cannot be represented as JSON, such as a
/// map with non-string keys. Build such keys with [`QueryKey::new`] from
/// already converted [`Value`]s instead.
#[macro_export]
macro_rules! query_key {
    () => {
        $crate::QueryKey::root()
    };
    ($($segment:tt),+ $(,)?) => {
        $crate::QueryKey::new([$($crate::__private::json!($segment)),+])
    };
}
