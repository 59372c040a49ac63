use anyhow::Result;
use rustc_hash::FxHashMap;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::engine::Activation;

/// A value flowing through a parse: returned by rules, carried in the
/// context slot, accumulated in frame items, or emitted to the result sink.
/// Absence is `Option<Value>::None`, never a null variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Num(f64),
    List(Vec<Value>),
    /// Insertion-ordered key/value pairs; serialized as a JSON object.
    Record(Vec<(String, Value)>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Str(s) => serializer.serialize_str(s),
            Value::Num(n) => {
                // whole numbers render without a trailing .0
                if n.fract() == 0.0 && n.is_finite() && n.abs() <= i64::MAX as f64 {
                    serializer.serialize_i64(*n as i64)
                } else {
                    serializer.serialize_f64(*n)
                }
            }
            Value::List(items) => items.serialize(serializer),
            Value::Record(pairs) => {
                let mut map = serializer.serialize_map(Some(pairs.len()))?;
                for (k, v) in pairs {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

/// A transition function: invoked by the engine with a view of the active
/// frame and the current character, returns the control primitive to apply.
pub type TransitionFn = fn(&mut Activation) -> Result<Op>;

/// The closed set of control primitives a transition can request.
///
/// Consuming ops make the driver advance to a new character before the next
/// dispatch; epsilon ops re-dispatch against the same character. Targets are
/// names resolved against the grammar table when the op is applied; an
/// unknown name is an `InvalidTransition` error.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Set the active frame's transition; the next character enters it.
    Next(&'static str),
    /// Set the active frame's transition and re-dispatch on the same character.
    Jump(&'static str),
    /// Push a fresh frame for `callee`; if `return_to` is given, the current
    /// frame resumes there once the callee returns and a new character arrives.
    Call {
        callee: &'static str,
        return_to: Option<&'static str>,
    },
    /// Same stack manipulation as `Call`, but the callee is dispatched
    /// immediately against the current character.
    CallNow {
        callee: &'static str,
        return_to: Option<&'static str>,
    },
    /// Pop the active frame, resolving a return value for the caller.
    Return(Option<Value>),
    /// Same as `Return`, then the caller is dispatched on the same character.
    ReturnNow(Option<Value>),
}

impl Op {
    pub fn is_epsilon(&self) -> bool {
        matches!(self, Op::Jump(_) | Op::CallNow { .. } | Op::ReturnNow(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Op::Next(_) => "NEXT",
            Op::Jump(_) => "GOTO",
            Op::Call { .. } => "CALL",
            Op::CallNow { .. } => "CALLNOW",
            Op::Return(_) => "RETURN",
            Op::ReturnNow(_) => "RETURNNOW",
        }
    }
}

/// A grammar: a table of named transition functions plus the designated
/// entry transition. Engines hold grammars behind `Arc`, so one grammar can
/// drive any number of parses.
#[derive(Debug)]
pub struct Grammar {
    entry: &'static str,
    table: FxHashMap<&'static str, TransitionFn>,
}

impl Grammar {
    pub fn new(entry: &'static str) -> Self {
        Grammar {
            entry,
            table: FxHashMap::default(),
        }
    }

    pub fn transition(mut self, name: &'static str, func: TransitionFn) -> Self {
        self.table.insert(name, func);
        self
    }

    pub fn entry(&self) -> &'static str {
        self.entry
    }

    pub fn lookup(&self, name: &str) -> Option<TransitionFn> {
        self.table.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_serialization() {
        let v = Value::List(vec![
            Value::Num(42.0),
            Value::Num(1.5),
            Value::Str("x".to_string()),
            Value::Record(vec![
                ("b".to_string(), Value::Num(2.0)),
                ("a".to_string(), Value::Num(1.0)),
            ]),
        ]);
        assert_eq!(
            serde_json::to_string(&v).unwrap(),
            r#"[42,1.5,"x",{"b":2,"a":1}]"#
        );
    }

    #[test]
    fn op_classification() {
        assert!(!Op::Next("a").is_epsilon());
        assert!(Op::Jump("a").is_epsilon());
        assert!(!Op::Call { callee: "a", return_to: None }.is_epsilon());
        assert!(Op::CallNow { callee: "a", return_to: None }.is_epsilon());
        assert!(!Op::Return(None).is_epsilon());
        assert!(Op::ReturnNow(None).is_epsilon());
    }
}
