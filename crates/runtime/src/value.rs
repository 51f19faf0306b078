//! Tagged runtime values
//!
//! Pure data: a value never points back into VM state. Aggregates
//! (lists, dicts, class instances) sit behind `Rc` for O(1) cloning;
//! each VM instance owns its register file and shares nothing across
//! threads, so `Rc` suffices.
//!
//! The unified optional/error `T?E` is the `Okay` / `Error` pair: a
//! one-byte discriminant choosing success or failure, with the payload
//! behind a pointer. Failure payloads come from a process-lifetime
//! [`ErrorPool`] of fixed size, so the failing path allocates nothing
//! once the pool is warm.

use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Closure: a function symbol plus its captured environment
#[derive(Debug, Clone, PartialEq)]
pub struct Closure {
    pub function: String,
    pub captures: Vec<Value>,
}

/// Class instance: class id into the module's layouts plus field slots
/// in declaration order
#[derive(Debug, PartialEq)]
pub struct InstanceData {
    pub class: u32,
    pub fields: Vec<Value>,
}

/// A failure payload with its origin context
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorValue {
    pub kind: String,
    pub payload: Value,
    /// Function names active when the error was constructed
    pub context: Vec<String>,
}

/// Hashable subset of `Value` usable as dict keys. Floats are excluded
/// (NaN breaks equality), as are aggregates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapKey {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl Hash for MapKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            MapKey::Int(n) => n.hash(state),
            MapKey::Str(s) => s.hash(state),
            MapKey::Bool(b) => b.hash(state),
        }
    }
}

impl MapKey {
    pub fn from_value(value: &Value) -> Option<MapKey> {
        match value {
            Value::Int(n) => Some(MapKey::Int(*n)),
            Value::Str(s) => Some(MapKey::Str(s.as_ref().clone())),
            Value::Bool(b) => Some(MapKey::Bool(*b)),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            MapKey::Int(n) => Value::Int(*n),
            MapKey::Str(s) => Value::Str(Rc::new(s.clone())),
            MapKey::Bool(b) => Value::Bool(*b),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(Rc<String>),
    List(Rc<RefCell<Vec<Value>>>),
    Dict(Rc<RefCell<HashMap<MapKey, Value>>>),
    /// Half-open integer range with step
    Range {
        start: i64,
        end: i64,
        step: i64,
    },
    Function(Rc<Closure>),
    Instance(Rc<RefCell<InstanceData>>),
    /// Success side of `T?E`
    Okay(Rc<Value>),
    /// Failure side of `T?E`
    Error(Rc<ErrorValue>),
}

impl Value {
    pub fn str(text: impl Into<String>) -> Value {
        Value::Str(Rc::new(text.into()))
    }

    pub fn list(values: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(values)))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::Int(n) => *n != 0,
            _ => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "nil",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Range { .. } => "range",
            Value::Function(_) => "function",
            Value::Instance(_) => "instance",
            Value::Okay(_) => "ok",
            Value::Error(_) => "error",
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "nil"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => {
                if x.fract() == 0.0 && x.is_finite() {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            Value::Bool(b) => write!(f, "{}", b),
            Value::Str(s) => write!(f, "{}", s),
            Value::List(items) => {
                let items = items.borrow();
                write!(f, "[")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Dict(entries) => {
                let entries = entries.borrow();
                write!(f, "{{")?;
                for (index, (key, value)) in entries.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key.to_value(), value)?;
                }
                write!(f, "}}")
            }
            Value::Range { start, end, .. } => write!(f, "{}..{}", start, end),
            Value::Function(closure) => write!(f, "<fn {}>", closure.function),
            Value::Instance(instance) => {
                write!(f, "<instance #{}>", instance.borrow().class)
            }
            Value::Okay(inner) => write!(f, "Ok({})", inner),
            Value::Error(error) => write!(f, "Err({})", error.kind),
        }
    }
}

/// Process-lifetime pool of error payloads, fixed size.
///
/// Reuses slots whose `Rc` is no longer shared, so steady-state error
/// construction stops allocating. Overflow falls back to a fresh
/// allocation; the pool never grows.
#[derive(Debug)]
pub struct ErrorPool {
    slots: Vec<Rc<ErrorValue>>,
    capacity: usize,
    /// Fresh allocations that could not reuse a slot
    pub overflow_count: usize,
}

pub const DEFAULT_POOL_CAPACITY: usize = 64;

impl ErrorPool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ErrorPool {
            slots: Vec::with_capacity(capacity),
            capacity,
            overflow_count: 0,
        }
    }

    pub fn alloc(
        &mut self,
        kind: impl Into<String>,
        payload: Value,
        context: Vec<String>,
    ) -> Rc<ErrorValue> {
        let fresh = ErrorValue {
            kind: kind.into(),
            payload,
            context,
        };
        // Reuse the first slot nothing else is holding
        for slot in &mut self.slots {
            if let Some(slot_value) = Rc::get_mut(slot) {
                *slot_value = fresh;
                return slot.clone();
            }
        }
        let rc = Rc::new(fresh);
        if self.slots.len() < self.capacity {
            self.slots.push(rc.clone());
        } else {
            self.overflow_count += 1;
        }
        rc
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for ErrorPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_forms() {
        assert_eq!(Value::Int(42).to_string(), "42");
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        assert_eq!(Value::str("hi").to_string(), "hi");
        assert_eq!(Value::Null.to_string(), "nil");
        assert_eq!(
            Value::list(vec![Value::Int(1), Value::Int(2)]).to_string(),
            "[1, 2]"
        );
    }

    #[test]
    fn test_okay_error_tags() {
        let ok = Value::Okay(Rc::new(Value::Int(1)));
        assert!(!ok.is_error());
        let mut pool = ErrorPool::new();
        let err = Value::Error(pool.alloc("error", Value::Null, vec![]));
        assert!(err.is_error());
    }

    #[test]
    fn test_map_key_rejects_floats() {
        assert!(MapKey::from_value(&Value::Float(1.0)).is_none());
        assert!(MapKey::from_value(&Value::Int(1)).is_some());
    }

    #[test]
    fn test_pool_reuses_released_slots() {
        let mut pool = ErrorPool::with_capacity(4);
        let first = pool.alloc("error", Value::Null, vec![]);
        drop(first);
        // The slot is free again: the second allocation reuses it
        let _second = pool.alloc("error", Value::Int(1), vec![]);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.overflow_count, 0);
    }

    #[test]
    fn test_pool_fixed_capacity() {
        let mut pool = ErrorPool::with_capacity(2);
        let held: Vec<_> = (0..5)
            .map(|i| pool.alloc("error", Value::Int(i), vec![]))
            .collect();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.overflow_count, 3);
        drop(held);
    }
}
