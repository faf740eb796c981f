use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub const OBJECT_TYPE_BINDING: &str = "binding";
pub const OBJECT_TYPE_FUNC: &str = "func";
pub const OBJECT_TYPE_REF: &str = "ref";

/// A property value as received from the remote side. References are
/// recognised once, at decode time, by their `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum PropValue {
    Literal(Value),
    Binding(BindingRef),
    Func(FuncRef),
    Handle(HandleRef),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingRef {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuncRef {
    pub event_types: Vec<String>,
    pub keys: Vec<String>,
    pub prevent_default: bool,
    pub stop_propagation: bool,
    /// Non-empty for handlers the remote registered on a panel-wide event.
    pub global_event: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleRef {
    pub id: String,
    pub track_position: bool,
}

impl From<Value> for PropValue {
    fn from(value: Value) -> Self {
        let Value::Object(map) = value else {
            return PropValue::Literal(value);
        };

        match map.get("type").and_then(Value::as_str) {
            Some(OBJECT_TYPE_BINDING) => PropValue::Binding(BindingRef {
                name: str_field(&map, "bind"),
            }),
            Some(OBJECT_TYPE_FUNC) => PropValue::Func(FuncRef {
                event_types: str_list_field(&map, "eventtypes"),
                keys: str_list_field(&map, "keys"),
                prevent_default: bool_field(&map, "preventdefault"),
                stop_propagation: bool_field(&map, "stoppropagation"),
                global_event: str_field(&map, "globalevent"),
            }),
            Some(OBJECT_TYPE_REF) => PropValue::Handle(HandleRef {
                id: str_field(&map, "refid"),
                track_position: bool_field(&map, "trackposition"),
            }),
            _ => PropValue::Literal(Value::Object(map)),
        }
    }
}

impl From<PropValue> for Value {
    fn from(value: PropValue) -> Self {
        match value {
            PropValue::Literal(value) => value,
            PropValue::Binding(binding) => json!({ "type": OBJECT_TYPE_BINDING, "bind": binding.name }),
            PropValue::Func(func) => {
                let mut map = Map::new();
                map.insert("type".to_string(), json!(OBJECT_TYPE_FUNC));
                if !func.event_types.is_empty() {
                    map.insert("eventtypes".to_string(), json!(func.event_types));
                }
                if !func.keys.is_empty() {
                    map.insert("keys".to_string(), json!(func.keys));
                }
                if func.prevent_default {
                    map.insert("preventdefault".to_string(), json!(true));
                }
                if func.stop_propagation {
                    map.insert("stoppropagation".to_string(), json!(true));
                }
                if !func.global_event.is_empty() {
                    map.insert("globalevent".to_string(), json!(func.global_event));
                }
                Value::Object(map)
            }
            PropValue::Handle(handle) => {
                let mut map = Map::new();
                map.insert("type".to_string(), json!(OBJECT_TYPE_REF));
                map.insert("refid".to_string(), json!(handle.id));
                if handle.track_position {
                    map.insert("trackposition".to_string(), json!(true));
                }
                Value::Object(map)
            }
        }
    }
}

impl FuncRef {
    /// Whether this handler should fire for `event_type` raised on prop `prop_key`.
    /// Without explicit event types the prop key decides (`onClick` fires on `click`).
    pub fn fires_on(&self, prop_key: &str, event_type: &str) -> bool {
        if self.event_types.is_empty() {
            return event_type_for_prop(prop_key).is_some_and(|derived| derived == event_type);
        }

        self.event_types.iter().any(|ty| ty == event_type)
    }

    /// An empty key filter accepts every key.
    pub fn accepts_key(&self, key: Option<&str>) -> bool {
        if self.keys.is_empty() {
            return true;
        }

        key.is_some_and(|key| self.keys.iter().any(|wanted| wanted == key))
    }
}

/// `onKeyDown` -> `keydown`. Returns `None` for keys that are not handler props.
pub fn event_type_for_prop(prop_key: &str) -> Option<String> {
    let rest = prop_key.strip_prefix("on")?;
    if !rest.starts_with(|ch: char| ch.is_ascii_uppercase()) {
        return None;
    }

    Some(rest.to_ascii_lowercase())
}

fn str_field(map: &Map<String, Value>, key: &str) -> String {
    map.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn bool_field(map: &Map<String, Value>, key: &str) -> bool {
    map.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn str_list_field(map: &Map<String, Value>, key: &str) -> Vec<String> {
    map.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
