//! Builders for the small flow topologies most engine tests use.
//!
//! Every builder puts the nodes on a single tab `"0"` and ends the chain in
//! a `console-json` node, which is what writes frames to the engine's
//! stdout.

use serde_json::{Map, Value, json};

pub const TAB_ID: &str = "0";
/// Id given to the node under test by [`single_node_flow`].
pub const SUBJECT_NODE_ID: &str = "1";
pub const CONSOLE_JSON_TYPE: &str = "console-json";

fn tab() -> Value {
    json!({ "id": TAB_ID, "type": "tab" })
}

fn console_json(id: &str) -> Value {
    json!({ "id": id, "type": CONSOLE_JSON_TYPE, "z": TAB_ID })
}

/// Copy `node`, give it an id and a tab, and wire it to `next` unless it
/// already declares its own wires.
fn place(node: &Value, id: &str, next: &str) -> Value {
    let mut obj = node.as_object().cloned().unwrap_or_default();
    obj.insert("id".into(), json!(id));
    obj.insert("z".into(), json!(TAB_ID));
    obj.entry("wires").or_insert_with(|| json!([[next]]));
    Value::Object(obj)
}

/// `tab -> node "1" -> console-json "2"`.
pub fn single_node_flow(node: &Value) -> Value {
    json!([tab(), place(node, SUBJECT_NODE_ID, "2"), console_json("2")])
}

/// Payload settings for the `inject` node in [`inject_node_flow`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InjectSpec {
    /// `payloadType`, e.g. `"num"`, `"str"`, `"json"`, `"env"`.
    pub payload_type: Option<String>,
    /// Stored as a string, the way the editor saves it.
    pub payload: Option<Value>,
    /// Fire once on start.
    pub once: bool,
    pub topic: Option<String>,
}

impl InjectSpec {
    pub fn payload(payload_type: impl Into<String>, payload: Value) -> Self {
        Self {
            payload_type: Some(payload_type.into()),
            payload: Some(payload),
            ..Self::default()
        }
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }
}

/// `tab -> inject "1" -> node "2" -> console-json "3"`.
pub fn inject_node_flow(spec: &InjectSpec, node: &Value) -> Value {
    let mut props = Vec::new();
    let mut inject = Map::new();
    inject.insert("id".into(), json!("1"));
    inject.insert("type".into(), json!("inject"));
    inject.insert("z".into(), json!(TAB_ID));
    inject.insert("name".into(), json!(""));
    // "0" seconds: never repeat.
    inject.insert("repeat".into(), json!("0"));
    inject.insert("crontab".into(), json!(""));
    inject.insert("once".into(), json!(spec.once));
    inject.insert("onceDelay".into(), json!(0));
    inject.insert("topic".into(), json!(spec.topic));
    inject.insert("wires".into(), json!([["2"]]));

    if let Some(payload) = &spec.payload {
        props.push(json!({ "p": "payload" }));
        let text = match payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        inject.insert("payload".into(), json!(text));
        inject.insert("payloadType".into(), json!(spec.payload_type));
    }
    if spec.topic.is_some() {
        props.push(json!({ "p": "topic", "vt": "str" }));
    }
    inject.insert("props".into(), Value::Array(props));

    json!([
        tab(),
        Value::Object(inject),
        place(node, "2", "3"),
        console_json("3"),
    ])
}
