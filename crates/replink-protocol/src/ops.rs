//! Operation names and typed request builders.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::message::{fields, Message};

/// Operations understood by the dev-runtime agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Clone,
    Describe,
    /// Stateful evaluation in the remote session.
    Eval,
    /// Legacy one-shot Java evaluation.
    JavaEval,
    /// Recompile and redefine a class in the target process.
    ClassReload,
    BindSpring,
    ListBeans,
    Snapshots,
    SnapshotSave,
    SnapshotLoad,
    SnapshotListSimple,
    SnapshotDelete,
    SnapshotPin,
    SnapshotSaveJson,
    SnapshotMaterialize,
    SnapshotInfo,
    ResetSession,
}

impl Op {
    pub const ALL: [Op; 17] = [
        Op::Clone,
        Op::Describe,
        Op::Eval,
        Op::JavaEval,
        Op::ClassReload,
        Op::BindSpring,
        Op::ListBeans,
        Op::Snapshots,
        Op::SnapshotSave,
        Op::SnapshotLoad,
        Op::SnapshotListSimple,
        Op::SnapshotDelete,
        Op::SnapshotPin,
        Op::SnapshotSaveJson,
        Op::SnapshotMaterialize,
        Op::SnapshotInfo,
        Op::ResetSession,
    ];

    /// Wire name of the operation.
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Clone => "clone",
            Op::Describe => "describe",
            Op::Eval => "eval",
            Op::JavaEval => "java-eval",
            Op::ClassReload => "class-reload",
            Op::BindSpring => "bind-spring",
            Op::ListBeans => "list-beans",
            Op::Snapshots => "snapshots",
            Op::SnapshotSave => "snapshot-save",
            Op::SnapshotLoad => "snapshot-load",
            Op::SnapshotListSimple => "snapshot-list-simple",
            Op::SnapshotDelete => "snapshot-delete",
            Op::SnapshotPin => "snapshot-pin",
            Op::SnapshotSaveJson => "snapshot-save-json",
            Op::SnapshotMaterialize => "snapshot-materialize",
            Op::SnapshotInfo => "snapshot-info",
            Op::ResetSession => "reset-session",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Op {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Op::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| format!("unknown op: {s}"))
    }
}

/// Generates a fresh request id.
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Splits the `ops` value of a describe reply into operation names.
///
/// Agents list them comma- or whitespace-separated.
pub fn advertised_ops(value: &str) -> Vec<&str> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// An operation plus its op-specific fields, before id and session are bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub op: Op,
    pub fields: Message,
}

impl Request {
    /// Creates a request with no op-specific fields.
    #[must_use]
    pub fn new(op: Op) -> Self {
        Self {
            op,
            fields: Message::new(),
        }
    }

    /// Builder-style field insert.
    #[must_use]
    pub fn field(mut self, key: &str, value: impl Into<String>) -> Self {
        self.fields.insert(key, value);
        self
    }

    /// Inserts the field only when `value` is present and not blank.
    #[must_use]
    pub fn optional_field(self, key: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.trim().is_empty() => self.field(key, v),
            _ => self,
        }
    }

    pub fn clone_session() -> Self {
        Self::new(Op::Clone)
    }

    pub fn describe() -> Self {
        Self::new(Op::Describe)
    }

    /// Evaluation request using the given op (`Eval` or `JavaEval`).
    pub fn evaluate(op: Op, code: &str) -> Self {
        Self::new(op).field(fields::CODE, code)
    }

    pub fn class_reload(code: &str) -> Self {
        Self::new(Op::ClassReload).field(fields::CODE, code)
    }

    pub fn bind_spring(expr: Option<&str>) -> Self {
        Self::new(Op::BindSpring).optional_field("expr", expr)
    }

    pub fn list_beans() -> Self {
        Self::new(Op::ListBeans)
    }

    pub fn snapshots() -> Self {
        Self::new(Op::Snapshots)
    }

    pub fn snapshot_save(name: &str, expr: &str) -> Self {
        Self::new(Op::SnapshotSave)
            .field("name", name)
            .field("expr", expr)
    }

    pub fn snapshot_load(name: &str, var: Option<&str>) -> Self {
        Self::new(Op::SnapshotLoad)
            .field("name", name)
            .optional_field("var", var)
    }

    pub fn snapshot_list_simple() -> Self {
        Self::new(Op::SnapshotListSimple)
    }

    pub fn snapshot_delete(name: &str) -> Self {
        Self::new(Op::SnapshotDelete).field("name", name)
    }

    pub fn snapshot_pin(name: &str, expr: &str) -> Self {
        Self::new(Op::SnapshotPin)
            .field("name", name)
            .field("expr", expr)
    }

    pub fn snapshot_save_json(name: &str, expr: &str) -> Self {
        Self::new(Op::SnapshotSaveJson)
            .field("name", name)
            .field("expr", expr)
    }

    pub fn snapshot_materialize(name: &str, type_fqn: &str, target: Option<&str>) -> Self {
        Self::new(Op::SnapshotMaterialize)
            .field("name", name)
            .field("type", type_fqn)
            .optional_field("target", target)
    }

    pub fn snapshot_info(name: &str) -> Self {
        Self::new(Op::SnapshotInfo).field("name", name)
    }

    pub fn reset_session() -> Self {
        Self::new(Op::ResetSession)
    }

    /// Binds id and session, producing the wire message.
    ///
    /// `op`, `id` and `session` always win over same-named op fields.
    pub fn into_message(self, id: &str, session: &str) -> Message {
        let mut message = self.fields;
        message.insert(fields::OP, self.op.as_str());
        message.insert(fields::ID, id);
        message.insert(fields::SESSION, session);
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encode;

    #[test]
    fn test_op_names_round_trip_through_from_str() {
        for op in Op::ALL {
            assert_eq!(op.as_str().parse::<Op>(), Ok(op));
        }
        assert!("no-such-op".parse::<Op>().is_err());
    }

    #[test]
    fn test_into_message_binds_envelope_fields() {
        let message = Request::evaluate(Op::Eval, "1 + 1").into_message("42", "");
        assert_eq!(message.op(), Some("eval"));
        assert_eq!(message.id(), Some("42"));
        assert_eq!(message.session(), Some(""));
        assert_eq!(message.get("code"), Some("1 + 1"));
    }

    #[test]
    fn test_optional_fields_omitted_when_blank() {
        let without = Request::bind_spring(None).into_message("1", "s");
        let blank = Request::snapshot_load("snap", Some("  ")).into_message("2", "s");
        let with = Request::snapshot_materialize("snap", "com.acme.Order", Some("order"))
            .into_message("3", "s");

        assert!(!without.contains_key("expr"));
        assert!(!blank.contains_key("var"));
        assert_eq!(with.get("type"), Some("com.acme.Order"));
        assert_eq!(with.get("target"), Some("order"));
    }

    #[test]
    fn test_request_encodes_with_sorted_keys() {
        let message = Request::snapshot_delete("old").into_message("9", "abc");
        assert_eq!(
            encode(&message),
            b"d2:id1:94:name3:old2:op15:snapshot-delete7:session3:abce".to_vec()
        );
    }

    #[test]
    fn test_new_request_ids_are_distinct() {
        let ids: std::collections::HashSet<String> = (0..256).map(|_| new_request_id()).collect();
        assert_eq!(ids.len(), 256);
    }

    #[test]
    fn test_advertised_ops_accepts_commas_and_spaces() {
        assert_eq!(
            advertised_ops("clone,describe, eval java-eval"),
            vec!["clone", "describe", "eval", "java-eval"]
        );
        assert!(advertised_ops("").is_empty());
    }
}
