//! Canonical session event types.
//!
//! Every captured signal becomes one [`SessionEvent`]: a session-relative
//! timestamp plus an [`EventKind`] payload. The wire form is a flat JSON
//! object discriminated by `"kind"`; structural mutations carry a list of
//! [`MutationOp`] discriminated by `"op"`.
//!
//! Forward-compatible: unknown `"kind"` / `"op"` tags (and malformed known
//! payloads) deserialize into `Unknown { .. }` instead of failing and keep
//! their payload. Digests are not checked against this re-encoding; see
//! [`crate::chunk`].

use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::SerializationError;

/// One captured signal, stamped relative to the session start.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionEvent {
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl SessionEvent {
    pub fn new(timestamp_ms: u64, kind: EventKind) -> Self {
        Self { timestamp_ms, kind }
    }

    pub fn snapshot(timestamp_ms: u64, keyframe: Keyframe) -> Self {
        Self::new(timestamp_ms, EventKind::Snapshot { keyframe })
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self.kind, EventKind::Snapshot { .. })
    }
}

impl<'de> Deserialize<'de> for SessionEvent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut raw = Value::deserialize(deserializer)?;
        let object = raw
            .as_object_mut()
            .ok_or_else(|| D::Error::custom("session event must be a JSON object"))?;
        let timestamp_ms = object
            .shift_remove("timestampMs")
            .and_then(|value| value.as_u64())
            .ok_or_else(|| D::Error::missing_field("timestampMs"))?;
        let kind = EventKind::deserialize(raw).map_err(D::Error::custom)?;
        Ok(Self { timestamp_ms, kind })
    }
}

// ─── EventKind ─────────────────────────────────────────────────────

/// Closed set of captured signal payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Pointer {
        x: f64,
        y: f64,
    },
    Click {
        x: f64,
        y: f64,
        target: Option<ClickTarget>,
    },
    Scroll {
        x: f64,
        y: f64,
    },
    Mutation {
        ops: Vec<MutationOp>,
    },
    Route {
        path: String,
    },
    Snapshot {
        keyframe: Keyframe,
    },
    /// A kind this build does not understand. `data` holds the remaining
    /// fields in their original order.
    Unknown {
        kind: String,
        data: Value,
    },
}

impl EventKind {
    /// Wire tag of this variant.
    pub fn name(&self) -> &str {
        match self {
            Self::Pointer { .. } => "pointer",
            Self::Click { .. } => "click",
            Self::Scroll { .. } => "scroll",
            Self::Mutation { .. } => "mutation",
            Self::Route { .. } => "route",
            Self::Snapshot { .. } => "snapshot",
            Self::Unknown { kind, .. } => kind,
        }
    }
}

/// Descriptor of the element a click landed on.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickTarget {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub class_list: Vec<String>,
}

/// Full point-in-time reconstruction payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keyframe {
    pub doctype: String,
    pub markup: String,
    #[serde(default)]
    pub style_rules: Vec<String>,
    pub viewport: Viewport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum EventKindRef<'a> {
    Pointer {
        x: f64,
        y: f64,
    },
    Click {
        x: f64,
        y: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<&'a ClickTarget>,
    },
    Scroll {
        x: f64,
        y: f64,
    },
    Mutation {
        ops: &'a [MutationOp],
    },
    Route {
        path: &'a str,
    },
    Snapshot {
        keyframe: &'a Keyframe,
    },
}

impl Serialize for EventKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let wire = match self {
            Self::Pointer { x, y } => EventKindRef::Pointer { x: *x, y: *y },
            Self::Click { x, y, target } => EventKindRef::Click {
                x: *x,
                y: *y,
                target: target.as_ref(),
            },
            Self::Scroll { x, y } => EventKindRef::Scroll { x: *x, y: *y },
            Self::Mutation { ops } => EventKindRef::Mutation { ops },
            Self::Route { path } => EventKindRef::Route { path },
            Self::Snapshot { keyframe } => EventKindRef::Snapshot { keyframe },
            Self::Unknown { kind, data } => {
                return serialize_foreign("kind", kind, data, serializer);
            }
        };
        wire.serialize(serializer)
    }
}

// ─── Forward-compatible deserializer ───────────────────────────────

/// Mirrors EventKind's known variants but derives Deserialize.
#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum EventKindKnown {
    Pointer {
        x: f64,
        y: f64,
    },
    Click {
        x: f64,
        y: f64,
        #[serde(default)]
        target: Option<ClickTarget>,
    },
    Scroll {
        x: f64,
        y: f64,
    },
    Mutation {
        #[serde(default)]
        ops: Vec<MutationOp>,
    },
    Route {
        path: String,
    },
    Snapshot {
        keyframe: Keyframe,
    },
}

impl From<EventKindKnown> for EventKind {
    fn from(known: EventKindKnown) -> Self {
        match known {
            EventKindKnown::Pointer { x, y } => Self::Pointer { x, y },
            EventKindKnown::Click { x, y, target } => Self::Click { x, y, target },
            EventKindKnown::Scroll { x, y } => Self::Scroll { x, y },
            EventKindKnown::Mutation { ops } => Self::Mutation { ops },
            EventKindKnown::Route { path } => Self::Route { path },
            EventKindKnown::Snapshot { keyframe } => Self::Snapshot { keyframe },
        }
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        match serde_json::from_value::<EventKindKnown>(raw.clone()) {
            Ok(known) => Ok(known.into()),
            Err(_) => {
                let (kind, data) = split_foreign("kind", raw);
                Ok(Self::Unknown { kind, data })
            }
        }
    }
}

// ─── Mutation ops ──────────────────────────────────────────────────

/// One structural change observed on the surface.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOp {
    StructureChange {
        parent_path: String,
        added: Vec<NodeDescriptor>,
        removed: Vec<NodeDescriptor>,
    },
    AttributeChange {
        path: String,
        name: String,
        old_value: Option<String>,
        new_value: Option<String>,
    },
    TextChange {
        path: String,
        old_value: Option<String>,
        new_value: Option<String>,
    },
    /// Stand-in for an op that could not be encoded at capture time.
    Error {
        reason: String,
    },
    Unknown {
        op: String,
        data: Value,
    },
}

impl MutationOp {
    /// Keep an encodable op, or replace a failed one with the `error`
    /// placeholder so the surrounding batch survives.
    pub fn or_placeholder(result: Result<Self, SerializationError>) -> Self {
        result.unwrap_or_else(|err| Self::Error {
            reason: err.to_string(),
        })
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Minimal node form: enough to rebuild structure, not styling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeDescriptor {
    Element {
        tag: String,
        #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
        attributes: IndexMap<String, String>,
    },
    Text {
        content: String,
    },
    #[serde(other)]
    Other,
}

impl NodeDescriptor {
    pub fn element(tag: impl Into<String>) -> Self {
        Self::Element {
            tag: tag.into(),
            attributes: IndexMap::new(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    /// Builder: add an attribute (no-op on non-element descriptors).
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let Self::Element { attributes, .. } = &mut self {
            attributes.insert(name.into(), value.into());
        }
        self
    }
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum MutationOpRef<'a> {
    StructureChange {
        parent_path: &'a str,
        added: &'a [NodeDescriptor],
        removed: &'a [NodeDescriptor],
    },
    AttributeChange {
        path: &'a str,
        name: &'a str,
        old_value: Option<&'a str>,
        new_value: Option<&'a str>,
    },
    TextChange {
        path: &'a str,
        old_value: Option<&'a str>,
        new_value: Option<&'a str>,
    },
    Error {
        reason: &'a str,
    },
}

impl Serialize for MutationOp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let wire = match self {
            Self::StructureChange {
                parent_path,
                added,
                removed,
            } => MutationOpRef::StructureChange {
                parent_path,
                added,
                removed,
            },
            Self::AttributeChange {
                path,
                name,
                old_value,
                new_value,
            } => MutationOpRef::AttributeChange {
                path,
                name,
                old_value: old_value.as_deref(),
                new_value: new_value.as_deref(),
            },
            Self::TextChange {
                path,
                old_value,
                new_value,
            } => MutationOpRef::TextChange {
                path,
                old_value: old_value.as_deref(),
                new_value: new_value.as_deref(),
            },
            Self::Error { reason } => MutationOpRef::Error { reason },
            Self::Unknown { op, data } => return serialize_foreign("op", op, data, serializer),
        };
        wire.serialize(serializer)
    }
}

#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum MutationOpKnown {
    StructureChange {
        parent_path: String,
        #[serde(default)]
        added: Vec<NodeDescriptor>,
        #[serde(default)]
        removed: Vec<NodeDescriptor>,
    },
    AttributeChange {
        path: String,
        name: String,
        #[serde(default)]
        old_value: Option<String>,
        #[serde(default)]
        new_value: Option<String>,
    },
    TextChange {
        path: String,
        #[serde(default)]
        old_value: Option<String>,
        #[serde(default)]
        new_value: Option<String>,
    },
    Error {
        reason: String,
    },
}

impl From<MutationOpKnown> for MutationOp {
    fn from(known: MutationOpKnown) -> Self {
        match known {
            MutationOpKnown::StructureChange {
                parent_path,
                added,
                removed,
            } => Self::StructureChange {
                parent_path,
                added,
                removed,
            },
            MutationOpKnown::AttributeChange {
                path,
                name,
                old_value,
                new_value,
            } => Self::AttributeChange {
                path,
                name,
                old_value,
                new_value,
            },
            MutationOpKnown::TextChange {
                path,
                old_value,
                new_value,
            } => Self::TextChange {
                path,
                old_value,
                new_value,
            },
            MutationOpKnown::Error { reason } => Self::Error { reason },
        }
    }
}

impl<'de> Deserialize<'de> for MutationOp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        match serde_json::from_value::<MutationOpKnown>(raw.clone()) {
            Ok(known) => Ok(known.into()),
            Err(_) => {
                let (op, data) = split_foreign("op", raw);
                Ok(Self::Unknown { op, data })
            }
        }
    }
}

// ─── Foreign-variant helpers ───────────────────────────────────────

/// Pull the discriminator out of a raw object, keeping field order.
fn split_foreign(tag_field: &str, raw: Value) -> (String, Value) {
    match raw {
        Value::Object(mut object) => {
            let tag = match object.shift_remove(tag_field) {
                Some(Value::String(tag)) => tag,
                _ => "unknown".to_owned(),
            };
            (tag, Value::Object(object))
        }
        other => ("unknown".to_owned(), other),
    }
}

/// Inverse of [`split_foreign`]: discriminator first, then the original
/// fields in their original order.
fn serialize_foreign<S>(tag_field: &str, tag: &str, data: &Value, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut object = Map::new();
    object.insert(tag_field.to_owned(), Value::String(tag.to_owned()));
    match data {
        Value::Object(fields) => {
            for (key, value) in fields {
                object.insert(key.clone(), value.clone());
            }
        }
        Value::Null => {}
        other => {
            object.insert("data".to_owned(), other.clone());
        }
    }
    object.serialize(serializer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyframe() -> Keyframe {
        Keyframe {
            doctype: "<!DOCTYPE html>".into(),
            markup: "<html><body><main></main></body></html>".into(),
            style_rules: vec!["body { margin: 0; }".into()],
            viewport: Viewport {
                width: 1280,
                height: 720,
            },
        }
    }

    #[test]
    fn pointer_event_wire_shape() {
        let event = SessionEvent::new(150, EventKind::Pointer { x: 10.0, y: 20.5 });
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"timestampMs":150,"kind":"pointer","x":10.0,"y":20.5}"#);
        let back: SessionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn click_target_uses_camel_case_and_skips_empty_fields() {
        let event = SessionEvent::new(
            7,
            EventKind::Click {
                x: 1.0,
                y: 2.0,
                target: Some(ClickTarget {
                    tag: "BUTTON".into(),
                    id: None,
                    class_list: vec!["primary".into(), "wide".into()],
                }),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["target"]["classList"][1], "wide");
        assert!(json["target"].get("id").is_none());
    }

    #[test]
    fn integer_coordinates_are_accepted() {
        let json = r#"{"timestampMs":3,"kind":"scroll","x":0,"y":480}"#;
        let event: SessionEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, EventKind::Scroll { x: 0.0, y: 480.0 });
    }

    #[test]
    fn snapshot_event_carries_keyframe() {
        let event = SessionEvent::snapshot(0, keyframe());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "snapshot");
        assert_eq!(json["keyframe"]["viewport"]["width"], 1280);
        assert_eq!(json["keyframe"]["styleRules"][0], "body { margin: 0; }");
        let back: SessionEvent = serde_json::from_value(json).unwrap();
        assert!(back.is_snapshot());
    }

    #[test]
    fn unknown_kind_becomes_unknown_and_reserializes_identically() {
        let json = r#"{"timestampMs":42,"kind":"focus","selector":"input#email","zeta":1,"alpha":2}"#;
        let event: SessionEvent = serde_json::from_str(json).unwrap();
        match &event.kind {
            EventKind::Unknown { kind, data } => {
                assert_eq!(kind, "focus");
                assert_eq!(data["selector"], "input#email");
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
        assert_eq!(serde_json::to_string(&event).unwrap(), json);
    }

    #[test]
    fn malformed_known_kind_degrades_to_unknown() {
        let json = r#"{"timestampMs":1,"kind":"route"}"#;
        let event: SessionEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event.kind, EventKind::Unknown { ref kind, .. } if kind == "route"));
    }

    #[test]
    fn missing_timestamp_is_rejected() {
        let err = serde_json::from_str::<SessionEvent>(r#"{"kind":"route","path":"/"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("timestampMs"));
    }

    #[test]
    fn mutation_ops_roundtrip_with_camel_case_fields() {
        let ops = vec![
            MutationOp::StructureChange {
                parent_path: "main > ul#items".into(),
                added: vec![
                    NodeDescriptor::element("LI").with_attribute("class", "item"),
                    NodeDescriptor::text("hello"),
                ],
                removed: vec![],
            },
            MutationOp::AttributeChange {
                path: "main > button#go".into(),
                name: "disabled".into(),
                old_value: None,
                new_value: Some("true".into()),
            },
            MutationOp::TextChange {
                path: "main > p".into(),
                old_value: Some("a".into()),
                new_value: Some("b".into()),
            },
        ];
        let event = SessionEvent::new(9, EventKind::Mutation { ops: ops.clone() });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["ops"][0]["op"], "structureChange");
        assert_eq!(json["ops"][0]["parentPath"], "main > ul#items");
        assert_eq!(json["ops"][0]["added"][0]["type"], "element");
        assert_eq!(json["ops"][1]["newValue"], "true");
        assert!(json["ops"][1]["oldValue"].is_null());
        let back: SessionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind, EventKind::Mutation { ops });
    }

    #[test]
    fn unknown_op_and_node_types_decode_without_failing() {
        let json = r#"{"op":"shadowAttach","host":"div#x"}"#;
        let op: MutationOp = serde_json::from_str(json).unwrap();
        assert!(matches!(op, MutationOp::Unknown { ref op, .. } if op == "shadowAttach"));
        assert_eq!(serde_json::to_string(&op).unwrap(), json);

        let node: NodeDescriptor = serde_json::from_str(r#"{"type":"comment"}"#).unwrap();
        assert_eq!(node, NodeDescriptor::Other);
    }

    #[test]
    fn failed_op_is_replaced_by_placeholder() {
        let op = MutationOp::or_placeholder(Err(SerializationError::new(
            "mutation op",
            "detached node",
        )));
        assert!(op.is_placeholder());
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "error");
        assert!(json["reason"].as_str().unwrap().contains("detached node"));
    }
}
