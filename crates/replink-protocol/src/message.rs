//! The frame payload: a string-keyed dictionary of string values.

use std::collections::{btree_map, BTreeMap, HashMap};

/// Well-known keys carried by requests and responses.
pub mod fields {
    pub const OP: &str = "op";
    pub const ID: &str = "id";
    pub const SESSION: &str = "session";
    pub const CODE: &str = "code";
    pub const VALUE: &str = "value";
    pub const ERR: &str = "err";
    pub const EX: &str = "ex";
    pub const OUT: &str = "out";
    pub const NEW_SESSION: &str = "new-session";
    pub const STATUS: &str = "status";
    pub const OPS: &str = "ops";
}

/// One decoded or to-be-encoded frame.
///
/// Keys are unique and kept in ascending byte order, which is exactly the
/// order the encoder writes them in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    fields: BTreeMap<String, String>,
}

impl Message {
    /// Creates an empty message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Inserts a field, returning the previous value if the key was present.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.fields.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.fields.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates fields in ascending key order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.fields.iter()
    }

    pub fn op(&self) -> Option<&str> {
        self.get(fields::OP)
    }

    pub fn id(&self) -> Option<&str> {
        self.get(fields::ID)
    }

    pub fn session(&self) -> Option<&str> {
        self.get(fields::SESSION)
    }

    pub fn value(&self) -> Option<&str> {
        self.get(fields::VALUE)
    }

    pub fn err(&self) -> Option<&str> {
        self.get(fields::ERR)
    }

    pub fn ex(&self) -> Option<&str> {
        self.get(fields::EX)
    }

    /// Captured standard output; may arrive without any request id.
    pub fn out(&self) -> Option<&str> {
        self.get(fields::OUT)
    }

    /// Session token, present only on the reply to the initial clone.
    pub fn new_session(&self) -> Option<&str> {
        self.get(fields::NEW_SESSION)
    }

    pub fn status(&self) -> Option<&str> {
        self.get(fields::STATUS)
    }

    /// True when the frame settles the request it answers.
    ///
    /// The agent may send several frames under one id: captured `out` first,
    /// then `value` or `err`, then `status`. Output-only frames do not settle
    /// anything.
    pub fn settles_request(&self) -> bool {
        [fields::VALUE, fields::ERR, fields::EX, fields::STATUS]
            .iter()
            .any(|key| self.contains_key(key))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Message {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl From<BTreeMap<String, String>> for Message {
    fn from(fields: BTreeMap<String, String>) -> Self {
        Self { fields }
    }
}

impl From<HashMap<String, String>> for Message {
    fn from(map: HashMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

impl From<Message> for BTreeMap<String, String> {
    fn from(message: Message) -> Self {
        message.fields
    }
}

impl IntoIterator for Message {
    type Item = (String, String);
    type IntoIter = btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl<'a> IntoIterator for &'a Message {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}
