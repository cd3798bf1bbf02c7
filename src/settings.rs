//! The settings value model.
//!
//! Project settings are an insertion-ordered map from [`SettingsKey`] to
//! [`Value`]. How two values merge when a plan's override tree is flattened
//! depends on the value's shape: scalars replace, lists append, maps update
//! key-wise with the later write winning, and sets union. The `libraries`
//! list is the one special case, handled where flattening runs: re-referenced
//! entries move to the end so link order stays correct.

use crate::tool::ToolId;
use indexmap::{IndexMap, IndexSet};
use std::fmt;

/// A single scalar setting value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Scalar {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => b.fmt(f),
            Self::Int(i) => i.fmt(f),
            Self::Str(s) => s.fmt(f),
        }
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}
impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}
impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}
impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}
impl From<&std::path::Path> for Scalar {
    fn from(value: &std::path::Path) -> Self {
        Self::Str(value.to_string_lossy().into_owned())
    }
}

/// A setting value.
///
/// The shape decides the merge behavior during flattening: scalar = replace,
/// list = append, map = key-wise update, set = union.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Scalar(Scalar),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
    Set(IndexSet<Scalar>),
}

impl Value {
    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Self::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_scalar().and_then(Scalar::as_str)
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&IndexSet<Scalar>> {
        match self {
            Self::Set(s) => Some(s),
            _ => None,
        }
    }

    /// Merge `incoming` into `current` according to the value-shape rules.
    ///
    /// Scalars are not handled here: whether a scalar replaces an existing
    /// value depends on scope bookkeeping owned by the flattener.
    pub fn merged(current: Option<&Value>, incoming: &Value) -> Value {
        match incoming {
            Value::List(incoming_items) => {
                let mut items =
                    current.and_then(Value::as_list).cloned().unwrap_or_default();
                items.extend(incoming_items.iter().cloned());
                Value::List(items)
            }
            Value::Map(incoming_map) => {
                let mut map = current.and_then(Value::as_map).cloned().unwrap_or_default();
                for (k, v) in incoming_map {
                    map.insert(k.clone(), v.clone());
                }
                Value::Map(map)
            }
            Value::Set(incoming_set) => {
                let mut set = current.and_then(Value::as_set).cloned().unwrap_or_default();
                for item in incoming_set {
                    set.insert(item.clone());
                }
                Value::Set(set)
            }
            Value::Scalar(_) => incoming.clone(),
        }
    }

    /// The subtract-then-union merge used for library lists: entries present
    /// in `incoming` are removed from `current` first, so a re-reference
    /// moves the entry to the end of the list.
    pub fn merged_libraries(current: Option<&Value>, incoming: &Value) -> Value {
        let mut set = current.and_then(Value::as_set).cloned().unwrap_or_default();
        if let Value::Set(incoming_set) = incoming {
            for item in incoming_set {
                set.shift_remove(item);
            }
            for item in incoming_set {
                set.insert(item.clone());
            }
        }
        Value::Set(set)
    }
}

impl From<Scalar> for Value {
    fn from(value: Scalar) -> Self {
        Self::Scalar(value)
    }
}
impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Scalar(value.into())
    }
}
impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Scalar(value.into())
    }
}
impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Scalar(value.into())
    }
}
impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Scalar(value.into())
    }
}
impl From<&std::path::Path> for Value {
    fn from(value: &std::path::Path) -> Self {
        Self::Scalar(value.into())
    }
}

/// A settings key, optionally namespaced to the tool that owns it.
///
/// Two tools may use the same short name without colliding: the tool's
/// [`ToolId`] participates in key identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SettingsKey {
    pub tool: Option<ToolId>,
    pub name: String,
}

impl SettingsKey {
    pub fn global(name: impl Into<String>) -> Self {
        Self { tool: None, name: name.into() }
    }

    pub fn scoped(tool: ToolId, name: impl Into<String>) -> Self {
        Self { tool: Some(tool), name: name.into() }
    }
}

impl From<&str> for SettingsKey {
    fn from(name: &str) -> Self {
        Self::global(name)
    }
}

impl From<String> for SettingsKey {
    fn from(name: String) -> Self {
        Self::global(name)
    }
}

impl From<(ToolId, &str)> for SettingsKey {
    fn from((tool, name): (ToolId, &str)) -> Self {
        Self::scoped(tool, name)
    }
}

impl fmt::Display for SettingsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tool {
            Some(tool) => write!(f, "{tool:?}!{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A finalized settings snapshot for one concrete project.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Settings(pub IndexMap<SettingsKey, Value>);

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: impl Into<SettingsKey>) -> Option<&Value> {
        self.0.get(&key.into())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_set(&self, name: &str) -> Option<&IndexSet<Scalar>> {
        self.get(name).and_then(Value::as_set)
    }

    pub fn get_list(&self, name: &str) -> Option<&Vec<Value>> {
        self.get(name).and_then(Value::as_list)
    }

    /// All values readable by the given tool: its own scoped keys with the
    /// namespace stripped.
    pub fn for_tool(&self, tool: ToolId) -> impl Iterator<Item = (&str, &Value)> {
        self.0
            .iter()
            .filter(move |(k, _)| k.tool == Some(tool))
            .map(|(k, v)| (k.name.as_str(), v))
    }

    pub fn get_for_tool(&self, tool: ToolId, name: &str) -> Option<&Value> {
        self.0.get(&SettingsKey::scoped(tool, name))
    }

    pub fn insert(&mut self, key: impl Into<SettingsKey>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: impl Into<SettingsKey>) -> Option<Value> {
        self.0.shift_remove(&key.into())
    }

    pub fn contains(&self, key: impl Into<SettingsKey>) -> bool {
        self.0.contains_key(&key.into())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SettingsKey, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn set_of(items: &[&str]) -> Value {
        Value::Set(items.iter().map(|s| Scalar::from(*s)).collect())
    }

    #[test]
    fn lists_append_on_merge() {
        let current = Value::List(vec![Value::from(1), Value::from(2)]);
        let incoming = Value::List(vec![Value::from(3)]);
        let merged = Value::merged(Some(&current), &incoming);
        assert_eq!(
            merged,
            Value::List(vec![Value::from(1), Value::from(2), Value::from(3)])
        );
    }

    #[test]
    fn maps_update_with_later_writes_winning() {
        let mut current = IndexMap::new();
        current.insert("a".to_string(), Value::from(1));
        current.insert("b".to_string(), Value::from(2));
        let mut incoming = IndexMap::new();
        incoming.insert("b".to_string(), Value::from(20));
        incoming.insert("c".to_string(), Value::from(3));

        let merged = Value::merged(Some(&Value::Map(current)), &Value::Map(incoming));
        let map = merged.as_map().unwrap();
        assert_eq!(map.get("a"), Some(&Value::from(1)));
        assert_eq!(map.get("b"), Some(&Value::from(20)));
        assert_eq!(map.get("c"), Some(&Value::from(3)));
    }

    #[test]
    fn sets_union_preserving_first_insertion_order() {
        let merged = Value::merged(Some(&set_of(&["x", "y"])), &set_of(&["y", "z"]));
        let items: Vec<_> =
            merged.as_set().unwrap().iter().map(|s| s.to_string()).collect();
        assert_eq!(items, vec!["x", "y", "z"]);
    }

    #[test]
    fn library_rereference_moves_to_end() {
        let merged =
            Value::merged_libraries(Some(&set_of(&["a", "b", "c"])), &set_of(&["a"]));
        let items: Vec<_> =
            merged.as_set().unwrap().iter().map(|s| s.to_string()).collect();
        assert_eq!(items, vec!["b", "c", "a"]);
    }

    #[test]
    fn tool_scoped_keys_do_not_collide() {
        let a = ToolId::of::<u8>();
        let b = ToolId::of::<u16>();
        let mut settings = Settings::new();
        settings.insert(SettingsKey::scoped(a, "flags"), Value::from("for-a"));
        settings.insert(SettingsKey::scoped(b, "flags"), Value::from("for-b"));
        settings.insert("flags", Value::from("global"));

        assert_eq!(settings.get_for_tool(a, "flags").unwrap().as_str(), Some("for-a"));
        assert_eq!(settings.get_for_tool(b, "flags").unwrap().as_str(), Some("for-b"));
        assert_eq!(settings.get_str("flags"), Some("global"));
    }
}
