//! Expected-shape hints and the post-repair normalization pass.
//!
//! The repair layers only know about JSON syntax. What the consumer
//! actually expects (an array of objects, an object holding a list under a
//! known key, enum-valued fields, fields that must never be left empty) is
//! described by a [`ShapeHints`] value supplied by the caller.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Expected JSON root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootKind {
    /// Anything that parses.
    #[default]
    Any,
    /// A JSON object.
    Object,
    /// A JSON array of any elements.
    Array,
    /// A JSON array whose elements are all objects.
    ObjectArray,
}

/// What the consumer of a repaired value expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapeHints {
    /// Expected root.
    pub root: RootKind,
    /// For object roots, the key holding the main list of items.
    pub list_key: Option<String>,
    /// Discriminator key of the minimal wrapper item.
    pub kind_key: String,
    /// Discriminator value of the minimal wrapper item.
    pub default_kind: String,
    /// Key under which the wrapper item holds a bare string list.
    pub content_key: String,
    /// Enum-valued fields and their legal values. The first value is the
    /// default when no legal value can be recognised.
    pub enum_fields: BTreeMap<String, Vec<String>>,
    /// Root-object fields backfilled when missing or null.
    pub defaults: BTreeMap<String, Value>,
    /// Item fields backfilled on every object in the main list.
    pub item_defaults: BTreeMap<String, Value>,
    /// Value returned when repair is abandoned. Derived from `root` when
    /// absent.
    pub fallback: Option<Value>,
}

impl Default for ShapeHints {
    fn default() -> Self {
        Self {
            root: RootKind::Any,
            list_key: None,
            kind_key: "type".into(),
            default_kind: "text".into(),
            content_key: "content".into(),
            enum_fields: BTreeMap::new(),
            defaults: BTreeMap::new(),
            item_defaults: BTreeMap::new(),
            fallback: None,
        }
    }
}

impl ShapeHints {
    /// Accepts any well-formed JSON.
    pub fn any() -> Self {
        Self::default()
    }

    /// Expects an object.
    pub fn object() -> Self {
        Self {
            root: RootKind::Object,
            ..Self::default()
        }
    }

    /// Expects an array of objects.
    pub fn object_array() -> Self {
        Self {
            root: RootKind::ObjectArray,
            ..Self::default()
        }
    }

    /// Expects an object whose main list of objects lives under `key`.
    pub fn object_with_list(key: impl Into<String>) -> Self {
        Self {
            root: RootKind::Object,
            list_key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Declares an enum-valued field.
    pub fn with_enum<I, S>(mut self, field: impl Into<String>, legal: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_fields
            .insert(field.into(), legal.into_iter().map(Into::into).collect());
        self
    }

    /// Declares a root-level default.
    pub fn with_default(mut self, field: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(field.into(), value);
        self
    }

    /// Declares a default for every item of the main list.
    pub fn with_item_default(mut self, field: impl Into<String>, value: Value) -> Self {
        self.item_defaults.insert(field.into(), value);
        self
    }

    /// Overrides the fallback value.
    pub fn with_fallback(mut self, fallback: Value) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Derives hints from a JSON schema: root type, the first array-of-object
    /// property as the list key, string enums, and declared defaults.
    pub fn from_schema(schema: &Value) -> Self {
        let mut hints = Self::default();
        match schema.get("type").and_then(Value::as_str) {
            Some("object") => hints.root = RootKind::Object,
            Some("array") => {
                hints.root = if item_type(schema.get("items")) == Some("object") {
                    RootKind::ObjectArray
                } else {
                    RootKind::Array
                };
            }
            _ => {}
        }

        let mut collect_enums = |node: &Value| {
            if let Some(props) = node.get("properties").and_then(Value::as_object) {
                for (name, prop) in props {
                    if let Some(values) = prop.get("enum").and_then(Value::as_array) {
                        let legal: Vec<String> = values
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect();
                        if !legal.is_empty() {
                            hints.enum_fields.insert(name.clone(), legal);
                        }
                    }
                }
            }
        };

        collect_enums(schema);
        if let Some(items) = schema.get("items") {
            collect_enums(items);
        }
        if let Some(props) = schema.get("properties").and_then(Value::as_object) {
            for prop in props.values() {
                if let Some(items) = prop.get("items") {
                    collect_enums(items);
                }
            }
        }

        if let Some(props) = schema.get("properties").and_then(Value::as_object) {
            for (name, prop) in props {
                if let Some(default) = prop.get("default") {
                    hints.defaults.insert(name.clone(), default.clone());
                }
                if hints.list_key.is_none()
                    && prop.get("type").and_then(Value::as_str) == Some("array")
                    && item_type(prop.get("items")) == Some("object")
                {
                    hints.list_key = Some(name.clone());
                }
            }
        }
        hints
    }

    /// `true` when a parsed value already has the expected shape.
    pub fn accepts(&self, value: &Value) -> bool {
        match self.root {
            RootKind::Any => true,
            RootKind::Array => value.is_array(),
            RootKind::ObjectArray => is_object_list(value),
            RootKind::Object => {
                let Some(obj) = value.as_object() else {
                    return false;
                };
                match self.list_key.as_deref().and_then(|key| obj.get(key)) {
                    None | Some(Value::Null) => true,
                    Some(list) => is_object_list(list),
                }
            }
        }
    }

    /// `true` when the consumer expects objects where a bare string list
    /// would be drift.
    pub fn expects_objects(&self) -> bool {
        matches!(self.root, RootKind::Object | RootKind::ObjectArray)
    }

    /// The minimal wrapper item around a bare list of strings.
    pub fn wrapper_item(&self, strings: Vec<Value>) -> Value {
        let mut item = Map::new();
        item.insert(self.kind_key.clone(), Value::String(self.default_kind.clone()));
        item.insert(self.content_key.clone(), Value::Array(strings));
        Value::Object(item)
    }

    /// Wraps a bare string list into the expected root.
    pub fn wrap_strings(&self, strings: Vec<Value>) -> Value {
        let item = self.wrapper_item(strings);
        match (self.root, self.list_key.as_deref()) {
            (RootKind::Object, Some(key)) => {
                let mut root = Map::new();
                root.insert(key.to_string(), Value::Array(vec![item]));
                Value::Object(root)
            }
            (RootKind::Object, None) => item,
            _ => Value::Array(vec![item]),
        }
    }

    /// Reshapes a well-formed value of the wrong shape. Returns `None` when
    /// no reasonable coercion exists.
    pub fn coerce(&self, value: Value) -> Option<Value> {
        if self.accepts(&value) {
            return Some(value);
        }
        let coerced = match (self.root, value) {
            (RootKind::Array | RootKind::ObjectArray, Value::Object(mut obj)) => {
                let list = self
                    .list_key
                    .as_deref()
                    .and_then(|key| obj.remove(key))
                    .filter(Value::is_array)
                    .or_else(|| single_array_field(&obj));
                match list {
                    Some(list) => self.coerce_list(list),
                    None => Value::Array(vec![Value::Object(obj)]),
                }
            }
            (RootKind::ObjectArray, list @ Value::Array(_)) => self.coerce_list(list),
            (RootKind::Object, Value::Array(items)) => match self.list_key.as_deref() {
                Some(key) => {
                    let mut root = Map::new();
                    root.insert(key.to_string(), self.coerce_list(Value::Array(items)));
                    Value::Object(root)
                }
                None if items.len() == 1 && items[0].is_object() => {
                    items.into_iter().next()?
                }
                None => return None,
            },
            (RootKind::Object, Value::Object(mut obj)) => {
                let key = self.list_key.as_deref()?;
                let list = obj.remove(key)?;
                obj.insert(key.to_string(), self.coerce_list(list));
                Value::Object(obj)
            }
            _ => return None,
        };
        self.accepts(&coerced).then_some(coerced)
    }

    fn coerce_list(&self, list: Value) -> Value {
        match list {
            Value::Array(items) if !items.is_empty() && items.iter().all(Value::is_string) => {
                Value::Array(vec![self.wrapper_item(items)])
            }
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(s) => self.wrapper_item(vec![Value::String(s)]),
                        other => other,
                    })
                    .collect(),
            ),
            other => other,
        }
    }

    /// Backfills defaults on the root object and on every object of the
    /// main list. Missing and null fields are both filled.
    pub fn normalize(&self, mut value: Value) -> Value {
        if let Value::Object(obj) = &mut value {
            fill_defaults(obj, &self.defaults);
        }
        if !self.item_defaults.is_empty() {
            if let Some(items) = self.main_list_mut(&mut value) {
                for item in items {
                    if let Value::Object(obj) = item {
                        fill_defaults(obj, &self.item_defaults);
                    }
                }
            }
        }
        value
    }

    /// Replaces illegal enum values anywhere in `value` with a best guess.
    /// Returns the number of replacements made.
    pub fn correct_enums(&self, value: &mut Value) -> usize {
        if self.enum_fields.is_empty() {
            return 0;
        }
        let mut fixed = 0;
        match value {
            Value::Object(obj) => {
                for (key, field) in obj {
                    if let (Some(legal), Value::String(current)) =
                        (self.enum_fields.get(key), &mut *field)
                    {
                        if let Some(guess) = best_enum_guess(current, legal) {
                            *current = guess;
                            fixed += 1;
                        }
                        continue;
                    }
                    fixed += self.correct_enums(field);
                }
            }
            Value::Array(items) => {
                for item in items {
                    fixed += self.correct_enums(item);
                }
            }
            _ => {}
        }
        fixed
    }

    /// The minimal valid value returned when repair is abandoned.
    pub fn fallback_value(&self) -> Value {
        if let Some(fallback) = &self.fallback {
            return fallback.clone();
        }
        let base = match (self.root, self.list_key.as_deref()) {
            (RootKind::Object, Some(key)) => {
                let mut root = Map::new();
                root.insert(key.to_string(), Value::Array(Vec::new()));
                Value::Object(root)
            }
            (RootKind::Object | RootKind::Any, _) => Value::Object(Map::new()),
            (RootKind::Array | RootKind::ObjectArray, _) => Value::Array(Vec::new()),
        };
        self.normalize(base)
    }

    fn main_list_mut<'a>(&self, value: &'a mut Value) -> Option<&'a mut Vec<Value>> {
        match value {
            Value::Array(items) => Some(items),
            Value::Object(obj) => obj
                .get_mut(self.list_key.as_deref()?)
                .and_then(Value::as_array_mut),
            _ => None,
        }
    }
}

fn item_type(items: Option<&Value>) -> Option<&str> {
    items?.get("type")?.as_str()
}

fn is_object_list(value: &Value) -> bool {
    value
        .as_array()
        .is_some_and(|items| items.iter().all(Value::is_object))
}

fn single_array_field(obj: &Map<String, Value>) -> Option<Value> {
    let mut arrays = obj.values().filter(|v| v.is_array());
    let first = arrays.next()?;
    arrays.next().is_none().then(|| first.clone())
}

fn fill_defaults(obj: &mut Map<String, Value>, defaults: &BTreeMap<String, Value>) {
    for (key, default) in defaults {
        let slot = obj.entry(key.clone()).or_insert(Value::Null);
        if slot.is_null() {
            *slot = default.clone();
        }
    }
}

/// Picks a legal value for an illegal enum string: the longest legal value
/// it contains, else the first legal value when the string is over-long.
fn best_enum_guess(current: &str, legal: &[String]) -> Option<String> {
    if legal.iter().any(|l| l == current) {
        return None;
    }
    let lowered = current.to_ascii_lowercase();
    let contained = legal
        .iter()
        .filter(|l| !l.is_empty() && lowered.contains(&l.to_ascii_lowercase()))
        .max_by_key(|l| l.len());
    if let Some(found) = contained {
        return Some(found.clone());
    }
    let longest = legal.iter().map(String::len).max().unwrap_or(0);
    if current.len() > longest {
        legal.first().cloned()
    } else {
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accepts_by_root() {
        assert!(ShapeHints::any().accepts(&json!("x")));
        assert!(ShapeHints::object().accepts(&json!({})));
        assert!(!ShapeHints::object().accepts(&json!([])));
        assert!(ShapeHints::object_array().accepts(&json!([{"a": 1}])));
        assert!(!ShapeHints::object_array().accepts(&json!(["a"])));
        let hints = ShapeHints::object_with_list("slides");
        assert!(hints.accepts(&json!({"title": "t"})));
        assert!(!hints.accepts(&json!({"slides": ["a", "b"]})));
    }

    #[test]
    fn test_wrap_strings_per_root() {
        let strings = vec![json!("x"), json!("y")];
        assert_eq!(
            ShapeHints::object_array().wrap_strings(strings.clone()),
            json!([{"type": "text", "content": ["x", "y"]}])
        );
        assert_eq!(
            ShapeHints::object_with_list("blocks").wrap_strings(strings),
            json!({"blocks": [{"type": "text", "content": ["x", "y"]}]})
        );
    }

    #[test]
    fn test_coerce_object_to_list() {
        let hints = ShapeHints::object_array();
        let out = hints.coerce(json!({"items": [{"a": 1}], "count": 1})).unwrap();
        assert_eq!(out, json!([{"a": 1}]));
    }

    #[test]
    fn test_coerce_list_into_object() {
        let hints = ShapeHints::object_with_list("slides");
        let out = hints.coerce(json!([{"title": "a"}])).unwrap();
        assert_eq!(out, json!({"slides": [{"title": "a"}]}));
        let out = hints.coerce(json!({"slides": ["a", "b"]})).unwrap();
        assert_eq!(out, json!({"slides": [{"type": "text", "content": ["a", "b"]}]}));
    }

    #[test]
    fn test_normalize_backfills_missing_and_null() {
        let hints = ShapeHints::object_with_list("slides")
            .with_default("title", json!("Untitled"))
            .with_item_default("layout", json!("default"));
        let out = hints.normalize(json!({"title": null, "slides": [{"layout": "hero"}, {}]}));
        assert_eq!(out["title"], "Untitled");
        assert_eq!(out["slides"][0]["layout"], "hero");
        assert_eq!(out["slides"][1]["layout"], "default");
    }

    #[test]
    fn test_correct_enums() {
        let hints = ShapeHints::object_array().with_enum("type", ["text", "text-block", "chart"]);
        let mut value = json!([
            {"type": "text-blocktext-blocktext"},
            {"type": "chart"},
            {"type": "zzzzzzzzzzzzzzzzzzzzzzzz"},
            {"type": "map"}
        ]);
        assert_eq!(hints.correct_enums(&mut value), 2);
        assert_eq!(value[0]["type"], "text-block");
        assert_eq!(value[1]["type"], "chart");
        assert_eq!(value[2]["type"], "text");
        assert_eq!(value[3]["type"], "map");
    }

    #[test]
    fn test_fallback_values() {
        assert_eq!(ShapeHints::object_array().fallback_value(), json!([]));
        assert_eq!(
            ShapeHints::object_with_list("slides")
                .with_default("title", json!(""))
                .fallback_value(),
            json!({"slides": [], "title": ""})
        );
        assert_eq!(
            ShapeHints::object().with_fallback(json!({"ok": false})).fallback_value(),
            json!({"ok": false})
        );
    }

    #[test]
    fn test_from_schema() {
        let schema = json!({
            "type": "object",
            "properties": {
                "title": {"type": "string", "default": "Untitled"},
                "slides": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {"layout": {"type": "string", "enum": ["hero", "split"]}}
                    }
                }
            }
        });
        let hints = ShapeHints::from_schema(&schema);
        assert_eq!(hints.root, RootKind::Object);
        assert_eq!(hints.list_key.as_deref(), Some("slides"));
        assert_eq!(hints.enum_fields["layout"], vec!["hero", "split"]);
        assert_eq!(hints.defaults["title"], "Untitled");
    }
}
