use std::{cell::RefCell, rc::Rc, sync::Arc};

use anyhow::Result;
use charstack_parser::{Activation, Engine, Grammar, Logger, Op, TraceEngine, Value};
use lazy_static::lazy_static;

// ---------------------------------------------------------------------------
// RPN arithmetic grammar.
//
// Expressions are space-separated; an expression is either a number or
// `+ <expr> <expr>`. Every top-level expression is emitted to the result
// sink as soon as it completes, so "+ 42 7 + 27 17" yields 49 and then 44.
// ---------------------------------------------------------------------------

fn parse_start(a: &mut Activation) -> Result<Op> {
    if a.at_end() {
        Ok(Op::ReturnNow(None))
    } else {
        Ok(Op::CallNow {
            callee: "parse_value",
            return_to: Some("emit_result"),
        })
    }
}

fn emit_result(a: &mut Activation) -> Result<Op> {
    if let Some(v) = a.returned().cloned() {
        a.emit(v);
    }
    Ok(Op::Jump("parse_next"))
}

fn parse_next(a: &mut Activation) -> Result<Op> {
    match a.current() {
        None => Ok(Op::ReturnNow(None)),
        Some(' ') => Ok(Op::Next("parse_start")),
        Some(_) => Err(a.error("expected space or end of expression")),
    }
}

fn parse_value(a: &mut Activation) -> Result<Op> {
    match a.current() {
        Some('+') | Some('-') => Ok(Op::Jump("parse_op")),
        Some(c) if c.is_ascii_digit() => Ok(Op::Jump("parse_number")),
        _ => Ok(Op::ReturnNow(None)),
    }
}

fn parse_op(a: &mut Activation) -> Result<Op> {
    if a.current() == Some('+') {
        Ok(Op::Call {
            callee: "parse_pair",
            return_to: Some("compute_add"),
        })
    } else {
        Err(a.error("expected a valid operator"))
    }
}

fn compute_add(a: &mut Activation) -> Result<Op> {
    let sum = match a.returned() {
        Some(Value::List(items)) => items.iter().filter_map(Value::as_f64).sum(),
        _ => return Err(a.error("operator expected an operand list")),
    };
    Ok(Op::ReturnNow(Some(Value::Num(sum))))
}

fn parse_pair(a: &mut Activation) -> Result<Op> {
    if a.current() == Some(' ') {
        Ok(Op::Call {
            callee: "parse_value",
            return_to: Some("pair_sep"),
        })
    } else {
        Err(a.error("expected an operand separator"))
    }
}

fn pair_sep(a: &mut Activation) -> Result<Op> {
    if a.current() == Some(' ') {
        if let Some(v) = a.returned().cloned() {
            a.push_item(v);
        }
        Ok(Op::Call {
            callee: "parse_value",
            return_to: Some("pair_result"),
        })
    } else {
        Err(a.error("expected space between operands"))
    }
}

fn pair_result(a: &mut Activation) -> Result<Op> {
    if let Some(v) = a.returned().cloned() {
        a.push_item(v);
    }
    Ok(Op::ReturnNow(Some(Value::List(a.take_items()))))
}

fn parse_number(a: &mut Activation) -> Result<Op> {
    match a.current() {
        Some(c) if c.is_ascii_digit() => {
            a.consume()?;
            Ok(Op::Next("parse_number"))
        }
        _ => {
            let text = a.take_buffer();
            let n: f64 = text
                .parse()
                .map_err(|_| a.error(format!("invalid number {text:?}")))?;
            Ok(Op::ReturnNow(Some(Value::Num(n))))
        }
    }
}

// ---------------------------------------------------------------------------
// Key/value record grammar.
//
// One `key=value` pair per line. Pairs accumulate into a record carried in
// the context slot of the entry frame; nothing is emitted, so the record
// surfaces as the finish() value through return resolution. A duplicate key
// overwrites the earlier value.
// ---------------------------------------------------------------------------

fn parse_record(a: &mut Activation) -> Result<Op> {
    if a.at_end() {
        Ok(Op::ReturnNow(None))
    } else {
        Ok(Op::CallNow {
            callee: "pair_key",
            return_to: Some("store_pair"),
        })
    }
}

fn pair_key(a: &mut Activation) -> Result<Op> {
    match a.current() {
        None => Err(a.error("unterminated pair")),
        Some('\n') => Err(a.error("missing '=' in pair")),
        Some('=') => {
            if a.buffer().is_empty() {
                return Err(a.error("empty key"));
            }
            let key = Value::Str(a.take_buffer());
            a.push_item(key);
            Ok(Op::Next("pair_value"))
        }
        Some(_) => {
            a.consume()?;
            Ok(Op::Next("pair_key"))
        }
    }
}

fn pair_value(a: &mut Activation) -> Result<Op> {
    match a.current() {
        None | Some('\n') => {
            let value = Value::Str(a.take_buffer());
            a.push_item(value);
            Ok(Op::ReturnNow(Some(Value::List(a.take_items()))))
        }
        Some(_) => {
            a.consume()?;
            Ok(Op::Next("pair_value"))
        }
    }
}

fn store_pair(a: &mut Activation) -> Result<Op> {
    let (key, value) = match a.returned() {
        Some(Value::List(kv)) if kv.len() == 2 => (kv[0].clone(), kv[1].clone()),
        _ => return Err(a.error("malformed pair")),
    };
    let key = match key {
        Value::Str(s) => s,
        _ => return Err(a.error("non-string key")),
    };
    let mut fields = match a.take_context() {
        Some(Value::Record(fields)) => fields,
        _ => Vec::new(),
    };
    match fields.iter_mut().find(|(k, _)| *k == key) {
        Some(slot) => slot.1 = value,
        None => fields.push((key, value)),
    }
    a.set_context(Value::Record(fields));
    match a.current() {
        None => Ok(Op::Jump("parse_record")),
        Some('\n') => Ok(Op::Next("parse_record")),
        Some(_) => Err(a.error("expected newline after pair")),
    }
}

lazy_static! {
    pub static ref ARITH: Arc<Grammar> = Arc::new(
        Grammar::new("parse_start")
            .transition("parse_start", parse_start)
            .transition("emit_result", emit_result)
            .transition("parse_next", parse_next)
            .transition("parse_value", parse_value)
            .transition("parse_op", parse_op)
            .transition("compute_add", compute_add)
            .transition("parse_pair", parse_pair)
            .transition("pair_sep", pair_sep)
            .transition("pair_result", pair_result)
            .transition("parse_number", parse_number)
    );
    pub static ref KEYVAL: Arc<Grammar> = Arc::new(
        Grammar::new("parse_record")
            .transition("parse_record", parse_record)
            .transition("pair_key", pair_key)
            .transition("pair_value", pair_value)
            .transition("store_pair", store_pair)
    );
}

/// Parse the whole text in one chunk and return the finish() value.
pub fn parse_one(grammar: &Arc<Grammar>, text: &str) -> Result<Option<Value>> {
    let mut engine = Engine::new(grammar.clone())?;
    engine.extend(text)?;
    engine.finish()
}

/// Parse the whole text and collect every value given to the result sink.
pub fn parse_all(grammar: &Arc<Grammar>, text: &str) -> Result<Vec<Value>> {
    let mut engine = Engine::new(grammar.clone())?;
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    engine.on_result(move |v| sink.borrow_mut().push(v.clone()));
    engine.extend(text)?;
    engine.finish()?;
    let out = std::mem::take(&mut *seen.borrow_mut());
    Ok(out)
}

/// Like [`parse_one`], but through the trace overlay; returns the result
/// together with the captured trace.
pub fn parse_one_traced(grammar: &Arc<Grammar>, text: &str) -> Result<(Option<Value>, String)> {
    let engine = Engine::new(grammar.clone())?;
    let mut traced = TraceEngine::new(engine, Logger::new(2, 0));
    traced.extend(text)?;
    let result = traced.finish()?;
    let logs = traced.logger.get_and_clear_logs();
    Ok((result, logs))
}

/// Like [`parse_all`], but through the trace overlay.
pub fn parse_all_traced(grammar: &Arc<Grammar>, text: &str) -> Result<(Vec<Value>, String)> {
    let engine = Engine::new(grammar.clone())?;
    let mut traced = TraceEngine::new(engine, Logger::new(2, 0));
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    traced.on_result(move |v| sink.borrow_mut().push(v.clone()));
    traced.extend(text)?;
    traced.finish()?;
    let logs = traced.logger.get_and_clear_logs();
    let out = std::mem::take(&mut *seen.borrow_mut());
    Ok((out, logs))
}
