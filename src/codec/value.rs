//! Value model
//!
//! Lists and maps are reference-counted so that two positions in a value
//! can hold the same sub-value, and a sub-value can contain itself.
//! Cyclic values are never freed; that is the cost of `Rc` cycles and is
//! acceptable for the values a cache round-trips.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

/// Shared, mutable sequence
pub type List = Rc<RefCell<Vec<Value>>>;

/// Shared, mutable map that keeps its keys in insertion order
pub type Map = Rc<RefCell<Vec<(String, Value)>>>;

/// A cached value
///
/// Cloning a `List` or `Map` clones the handle, not the contents.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(List),
    Map(Map),
}

impl Value {
    // =========================================================================
    // Construction
    // =========================================================================

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    /// Build a map; a repeated key keeps its first position and last value
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        let map = Value::empty_map();
        for (key, value) in entries {
            map.insert(key, value);
        }
        map
    }

    pub fn empty_list() -> Self {
        Value::list(Vec::new())
    }

    pub fn empty_map() -> Self {
        Value::Map(Rc::new(RefCell::new(Vec::new())))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&List> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Element `index` of a list (a handle, for composites)
    pub fn at(&self, index: usize) -> Option<Value> {
        self.as_list()?.borrow().get(index).cloned()
    }

    /// Value under `key` of a map (a handle, for composites)
    pub fn get(&self, key: &str) -> Option<Value> {
        self.as_map()?
            .borrow()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Number of elements of a list or entries of a map
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::List(list) => Some(list.borrow().len()),
            Value::Map(map) => Some(map.borrow().len()),
            _ => None,
        }
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Append to a list; no-op on other variants
    pub fn push(&self, item: Value) {
        if let Value::List(list) = self {
            list.borrow_mut().push(item);
        }
    }

    /// Insert or replace a map entry; no-op on other variants
    pub fn insert<K: Into<String>>(&self, key: K, value: Value) {
        if let Value::Map(map) = self {
            let key = key.into();
            let mut entries = map.borrow_mut();
            match entries.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = value,
                None => entries.push((key, value)),
            }
        }
    }

    // =========================================================================
    // Identity
    // =========================================================================

    /// Address of the shared contents of a composite
    pub fn identity(&self) -> Option<*const ()> {
        match self {
            Value::List(list) => Some(Rc::as_ptr(list) as *const ()),
            Value::Map(map) => Some(Rc::as_ptr(map) as *const ()),
            _ => None,
        }
    }

    /// Whether both are handles to the same composite
    pub fn same(&self, other: &Value) -> bool {
        match (self.identity(), other.identity()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    // =========================================================================
    // JSON Bridge
    // =========================================================================

    /// Render as JSON; a reference back to an enclosing composite becomes
    /// the string `"[Circular]"`, other shared sub-values are repeated
    pub fn to_json(&self) -> serde_json::Value {
        let mut stack = Vec::new();
        self.to_json_inner(&mut stack)
    }

    fn to_json_inner(&self, stack: &mut Vec<*const ()>) -> serde_json::Value {
        use serde_json::Value as Json;

        if let Some(id) = self.identity() {
            if stack.contains(&id) {
                return Json::String("[Circular]".to_string());
            }
            stack.push(id);
        }
        let json = match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => Json::String(s.clone()),
            Value::List(list) => Json::Array(
                list.borrow()
                    .iter()
                    .map(|item| item.to_json_inner(stack))
                    .collect(),
            ),
            Value::Map(map) => Json::Object(
                map.borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json_inner(stack)))
                    .collect(),
            ),
        };
        if self.identity().is_some() {
            stack.pop();
        }
        json
    }

    pub fn from_json(json: &serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::list(items.iter().map(Value::from_json).collect()),
            Json::Object(entries) => {
                Value::map(entries.iter().map(|(k, v)| (k.clone(), Value::from_json(v))))
            }
        }
    }
}

/// Integral numbers render without a fraction
fn number_to_json(n: f64) -> serde_json::Value {
    const EXACT: f64 = 9_007_199_254_740_992.0; // 2^53
    if n.fract() == 0.0 && n.abs() < EXACT {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

// =============================================================================
// Equality
// =============================================================================

/// Structural equality that terminates on cycles
///
/// A pair of composites already under comparison is assumed equal, so two
/// cycles with the same shape compare equal.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        let mut visiting = HashSet::new();
        structural_eq(self, other, &mut visiting)
    }
}

fn structural_eq(
    a: &Value,
    b: &Value,
    visiting: &mut HashSet<(*const (), *const ())>,
) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            if Rc::ptr_eq(x, y) || !enter(a, b, visiting) {
                return true;
            }
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter()
                    .zip(y.iter())
                    .all(|(i, j)| structural_eq(i, j, visiting))
        }
        (Value::Map(x), Value::Map(y)) => {
            if Rc::ptr_eq(x, y) || !enter(a, b, visiting) {
                return true;
            }
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter()
                    .zip(y.iter())
                    .all(|((ka, va), (kb, vb))| ka == kb && structural_eq(va, vb, visiting))
        }
        _ => false,
    }
}

/// Record the pair; `false` if it was already being compared
fn enter(a: &Value, b: &Value, visiting: &mut HashSet<(*const (), *const ())>) -> bool {
    match (a.identity(), b.identity()) {
        (Some(x), Some(y)) => visiting.insert((x, y)),
        _ => true,
    }
}

// =============================================================================
// Debug
// =============================================================================

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stack = RefCell::new(Vec::new());
        fmt::Debug::fmt(&Tracked { value: self, stack: &stack }, f)
    }
}

/// Debug view that prints `[Circular]` on re-entering an enclosing composite
struct Tracked<'a> {
    value: &'a Value,
    stack: &'a RefCell<Vec<*const ()>>,
}

impl fmt::Debug for Tracked<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.value.identity();
        if let Some(id) = id {
            if self.stack.borrow().contains(&id) {
                return f.write_str("[Circular]");
            }
            self.stack.borrow_mut().push(id);
        }

        let result = match self.value {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{:?}", s),
            Value::List(list) => f
                .debug_list()
                .entries(list.borrow().iter().map(|item| Tracked {
                    value: item,
                    stack: self.stack,
                }))
                .finish(),
            Value::Map(map) => f
                .debug_map()
                .entries(map.borrow().iter().map(|(k, v)| {
                    (
                        k,
                        Tracked {
                            value: v,
                            stack: self.stack,
                        },
                    )
                }))
                .finish(),
        };

        if id.is_some() {
            self.stack.borrow_mut().pop();
        }
        result
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::list(items)
    }
}

impl From<&serde_json::Value> for Value {
    fn from(json: &serde_json::Value) -> Self {
        Value::from_json(json)
    }
}
