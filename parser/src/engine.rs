use std::sync::Arc;

use anyhow::Result;
use instant::Instant;
use serde::{Deserialize, Serialize};

use crate::{
    api::{Grammar, Op, TransitionFn, Value},
    cursor::Cursor,
    error::GrammarError,
};

const DEBUG: bool = true;

macro_rules! debug {
    ($($arg:tt)*) => {
        if cfg!(feature = "logging") && DEBUG {
            eprintln!($($arg)*);
        }
    }
}

const DONE_NAME: &str = "done";

/// What the active frame runs next: the sentinel installed at construction
/// (parsing is complete) or a table-resolved transition.
#[derive(Clone, Copy, Debug)]
enum Target {
    Done,
    Named {
        name: &'static str,
        func: TransitionFn,
    },
}

impl Target {
    fn name(&self) -> &'static str {
        match self {
            Target::Done => DONE_NAME,
            Target::Named { name, .. } => name,
        }
    }
}

/// One level of the explicit call stack.
#[derive(Debug)]
struct Frame {
    transition: Target,
    buffer: String,
    items: Vec<Value>,
    returned: Option<Value>,
}

impl Frame {
    fn new(transition: Target) -> Self {
        Frame {
            transition,
            buffer: String::new(),
            items: Vec::new(),
            returned: None,
        }
    }
}

#[derive(Default)]
struct ResultSink {
    observers: Vec<Box<dyn FnMut(&Value)>>,
    last: Option<Value>,
}

impl std::fmt::Debug for ResultSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSink")
            .field("observers", &self.observers.len())
            .field("last", &self.last)
            .finish()
    }
}

impl ResultSink {
    fn emit(&mut self, value: Value) {
        for obs in self.observers.iter_mut() {
            obs(&value);
        }
        self.last = Some(value);
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct EngineStats {
    pub chars: usize,
    pub transitions: usize,
    pub max_depth: usize,
    pub compute_time_us: u64,
}

/// What a single driver step did; consumed by the trace overlay.
#[derive(Debug, Clone)]
pub struct OpReport {
    /// Name of the transition that ran.
    pub transition: &'static str,
    /// NEXT, GOTO, CALL, CALLNOW, RETURN, RETURNNOW, or DONE for the sentinel.
    pub kind: &'static str,
    pub target: Option<&'static str>,
    pub return_to: Option<&'static str>,
}

/// The view of the engine handed to a transition function: the current
/// character, the active frame's buffer/items/returned slots, the context
/// slot, and the result sink.
pub struct Activation<'a> {
    frame: &'a mut Frame,
    ctx: &'a mut Option<Value>,
    sink: &'a mut ResultSink,
    current: Option<char>,
    line: usize,
    col: usize,
    pos: usize,
}

impl Activation<'_> {
    /// The current character; `None` once the end of the stream is reached.
    pub fn current(&self) -> Option<char> {
        self.current
    }

    pub fn at_end(&self) -> bool {
        self.current.is_none()
    }

    /// The value most recently returned into this frame by a nested call.
    /// Persists across activations of the same frame until overwritten.
    pub fn returned(&self) -> Option<&Value> {
        self.frame.returned.as_ref()
    }

    /// Append the current character to the frame's buffer.
    pub fn consume(&mut self) -> Result<()> {
        match self.current {
            Some(c) => {
                self.frame.buffer.push(c);
                Ok(())
            }
            None => Err(GrammarError::unexpected_end(self.line, self.col, self.pos).into()),
        }
    }

    /// Append an arbitrary character to the frame's buffer, e.g. the
    /// decoded form of an escape sequence.
    pub fn consume_char(&mut self, c: char) {
        self.frame.buffer.push(c);
    }

    pub fn buffer(&self) -> &str {
        &self.frame.buffer
    }

    /// Return the frame's buffer, leaving it empty.
    pub fn take_buffer(&mut self) -> String {
        std::mem::take(&mut self.frame.buffer)
    }

    pub fn push_item(&mut self, value: Value) {
        self.frame.items.push(value);
    }

    pub fn take_items(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.frame.items)
    }

    pub fn context(&self) -> Option<&Value> {
        self.ctx.as_ref()
    }

    pub fn take_context(&mut self) -> Option<Value> {
        self.ctx.take()
    }

    pub fn set_context(&mut self, value: Value) {
        *self.ctx = Some(value);
    }

    /// Emit an intermediate result to the sink.
    pub fn emit(&mut self, value: Value) {
        self.sink.emit(value);
    }

    /// A domain error decorated with the position of the current character.
    pub fn error(&self, message: impl Into<String>) -> anyhow::Error {
        GrammarError::grammar(message, self.line, self.col, self.pos).into()
    }

    pub fn line(&self) -> usize {
        self.line
    }

    pub fn col(&self) -> usize {
        self.col
    }

    pub fn pos(&self) -> usize {
        self.pos
    }
}

/// The state-machine driver: owns the frame stack, the parallel context
/// stack, the cursor, and the result sink.
///
/// Lifecycle: construct once per parse, `extend()` zero or more times,
/// `finish()` exactly once. The lower-level step API (`feed`,
/// `prepare_step`, `dispatch_step`, `begin_finish`, `end_finish`) drives
/// the same machinery one transition at a time and exists for wrappers
/// like [`crate::TraceEngine`].
#[derive(Debug)]
pub struct Engine {
    grammar: Arc<Grammar>,
    frames: Vec<Frame>,
    ctx: Option<Value>,
    ctx_stack: Vec<Option<Value>>,
    cursor: Cursor,
    sink: ResultSink,
    need_advance: bool,
    spent: bool,
    stats: EngineStats,
}

impl Engine {
    pub fn new(grammar: Arc<Grammar>) -> Result<Self> {
        let entry = grammar.entry();
        let func = match grammar.lookup(entry) {
            Some(func) => func,
            None => return Err(GrammarError::missing_entry(entry).into()),
        };
        let frames = vec![
            Frame::new(Target::Done),
            Frame::new(Target::Named { name: entry, func }),
        ];
        let stats = EngineStats {
            max_depth: frames.len(),
            ..EngineStats::default()
        };
        Ok(Engine {
            grammar,
            frames,
            ctx: None,
            ctx_stack: vec![None],
            cursor: Cursor::new(),
            sink: ResultSink::default(),
            need_advance: true,
            spent: false,
            stats,
        })
    }

    /// Append a chunk and drive the frame stack until the appended text is
    /// exhausted; the parse then suspends until the next chunk. An empty
    /// chunk is a no-op.
    pub fn extend(&mut self, chunk: &str) -> Result<()> {
        if chunk.is_empty() {
            return self.check_live();
        }
        self.feed(chunk)?;
        while self.prepare_step() {
            self.dispatch_step()?;
        }
        Ok(())
    }

    /// Switch the cursor to end-of-stream, drive to the fixed point, and
    /// assert the stack has unwound. The result is the most recent value
    /// given to the sink, or the sentinel frame's resolved return value if
    /// nothing was emitted.
    pub fn finish(&mut self) -> Result<Option<Value>> {
        self.begin_finish()?;
        loop {
            let before = self.active_name();
            self.prepare_step();
            self.dispatch_step()?;
            if self.active_name() == before {
                break;
            }
        }
        self.end_finish()
    }

    pub fn on_result(&mut self, observer: impl FnMut(&Value) + 'static) {
        self.sink.observers.push(Box::new(observer));
    }

    pub fn last_result(&self) -> Option<&Value> {
        self.sink.last.as_ref()
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    // -- step API --------------------------------------------------------

    /// Append a chunk without driving.
    pub fn feed(&mut self, chunk: &str) -> Result<()> {
        self.check_live()?;
        self.cursor.push_chunk(chunk);
        Ok(())
    }

    /// Advance the cursor if the previous op consumed its character.
    /// Returns false when no character is buffered yet; the pending advance
    /// is kept for the next chunk.
    pub fn prepare_step(&mut self) -> bool {
        if !self.need_advance {
            return true;
        }
        if !self.cursor.advance() {
            return false;
        }
        self.need_advance = false;
        if self.cursor.current().is_some() {
            self.stats.chars += 1;
        }
        true
    }

    /// Run the active frame's transition once against the current character
    /// and apply the op it returns.
    pub fn dispatch_step(&mut self) -> Result<OpReport> {
        let t0 = Instant::now();
        let active = self.active().transition;
        let report = match active {
            Target::Done => {
                if self.cursor.current().is_some() {
                    return Err(GrammarError::grammar(
                        "unexpected input after the grammar completed",
                        self.cursor.line(),
                        self.cursor.col(),
                        self.cursor.pos(),
                    )
                    .into());
                }
                OpReport {
                    transition: DONE_NAME,
                    kind: "DONE",
                    target: None,
                    return_to: None,
                }
            }
            Target::Named { name, func } => {
                debug!("run {} at {:?}", name, self.cursor.current());
                self.stats.transitions += 1;
                let op = {
                    let mut act = self.activation();
                    func(&mut act)
                }
                .map_err(|e| self.decorate(e))?;
                let (target, return_to) = match &op {
                    Op::Next(n) | Op::Jump(n) => (Some(*n), None),
                    Op::Call { callee, return_to } | Op::CallNow { callee, return_to } => {
                        (Some(*callee), *return_to)
                    }
                    Op::Return(_) | Op::ReturnNow(_) => (None, None),
                };
                let report = OpReport {
                    transition: name,
                    kind: op.kind(),
                    target,
                    return_to,
                };
                self.need_advance = !op.is_epsilon();
                self.apply(op)?;
                report
            }
        };
        self.stats.compute_time_us += t0.elapsed().as_micros() as u64;
        Ok(report)
    }

    /// Switch the cursor permanently to the END sentinel.
    pub fn begin_finish(&mut self) -> Result<()> {
        self.check_live()?;
        self.cursor.finish();
        Ok(())
    }

    /// Check the stack has unwound to the sentinel frame and yield the
    /// parse result. The engine is spent afterwards.
    pub fn end_finish(&mut self) -> Result<Option<Value>> {
        self.spent = true;
        if self.frames.len() != 1 {
            return Err(GrammarError::unterminated_stack(
                self.frames.len() - 1,
                self.cursor.line(),
                self.cursor.col(),
                self.cursor.pos(),
            )
            .into());
        }
        let fallback = self.active_mut().returned.take();
        Ok(self.sink.last.clone().or(fallback))
    }

    // -- introspection ---------------------------------------------------

    /// Names on the logical call stack, outermost first (the sentinel is
    /// reported as "done").
    pub fn stack_names(&self) -> Vec<&'static str> {
        self.frames.iter().map(|f| f.transition.name()).collect()
    }

    pub fn active_name(&self) -> &'static str {
        self.active().transition.name()
    }

    /// The value waiting to be handed to the active transition.
    pub fn pending_return(&self) -> Option<&Value> {
        self.active().returned.as_ref()
    }

    pub fn current_char(&self) -> Option<char> {
        self.cursor.current()
    }

    pub fn is_done(&self) -> bool {
        matches!(self.active().transition, Target::Done)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn line(&self) -> usize {
        self.cursor.line()
    }

    pub fn col(&self) -> usize {
        self.cursor.col()
    }

    pub fn pos(&self) -> usize {
        self.cursor.pos()
    }

    // -- internals -------------------------------------------------------

    fn active(&self) -> &Frame {
        self.frames.last().unwrap()
    }

    fn active_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().unwrap()
    }

    fn activation(&mut self) -> Activation<'_> {
        let current = self.cursor.current();
        let (line, col, pos) = (self.cursor.line(), self.cursor.col(), self.cursor.pos());
        Activation {
            frame: self.frames.last_mut().unwrap(),
            ctx: &mut self.ctx,
            sink: &mut self.sink,
            current,
            line,
            col,
            pos,
        }
    }

    fn apply(&mut self, op: Op) -> Result<()> {
        match op {
            Op::Next(name) | Op::Jump(name) => {
                let target = self.resolve(name)?;
                self.active_mut().transition = target;
            }
            Op::Call { callee, return_to } | Op::CallNow { callee, return_to } => {
                if let Some(name) = return_to {
                    let target = self.resolve(name)?;
                    self.active_mut().transition = target;
                }
                let target = self.resolve(callee)?;
                self.ctx_stack.push(self.ctx.take());
                self.frames.push(Frame::new(target));
                self.stats.max_depth = self.stats.max_depth.max(self.frames.len());
            }
            Op::Return(value) | Op::ReturnNow(value) => {
                let mut popped = self.frames.pop().unwrap();
                let resolved = value
                    .or_else(|| self.ctx.take())
                    .or_else(|| {
                        if popped.buffer.is_empty() {
                            None
                        } else {
                            Some(Value::Str(std::mem::take(&mut popped.buffer)))
                        }
                    })
                    .or(popped.returned);
                debug!("  return {:?}", resolved);
                self.ctx = self.ctx_stack.pop().unwrap();
                self.active_mut().returned = resolved;
            }
        }
        Ok(())
    }

    fn resolve(&self, name: &'static str) -> Result<Target> {
        match self.grammar.lookup(name) {
            Some(func) => Ok(Target::Named { name, func }),
            None => Err(GrammarError::invalid_transition(
                name,
                self.cursor.line(),
                self.cursor.col(),
                self.cursor.pos(),
            )
            .into()),
        }
    }

    fn check_live(&self) -> Result<()> {
        if self.spent {
            return Err(GrammarError::spent(
                self.cursor.line(),
                self.cursor.col(),
                self.cursor.pos(),
            )
            .into());
        }
        Ok(())
    }

    fn decorate(&self, err: anyhow::Error) -> anyhow::Error {
        if err.downcast_ref::<GrammarError>().is_some() {
            return err;
        }
        GrammarError::grammar(
            format!("{err:#}"),
            self.cursor.line(),
            self.cursor.col(),
            self.cursor.pos(),
        )
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn kind_of(err: &anyhow::Error) -> ErrorKind {
        err.downcast_ref::<GrammarError>().unwrap().kind
    }

    fn const_grammar() -> Arc<Grammar> {
        fn entry(_a: &mut Activation) -> Result<Op> {
            Ok(Op::ReturnNow(Some(Value::Num(23.0))))
        }
        Arc::new(Grammar::new("entry").transition("entry", entry))
    }

    #[test]
    fn empty_parse_returns_constant() {
        let mut eng = Engine::new(const_grammar()).unwrap();
        assert_eq!(eng.finish().unwrap(), Some(Value::Num(23.0)));
    }

    #[test]
    fn missing_entry_point() {
        let err = Engine::new(Arc::new(Grammar::new("entry"))).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::MissingEntry);
    }

    #[test]
    fn invalid_transition_target() {
        fn entry(_a: &mut Activation) -> Result<Op> {
            Ok(Op::Next("nope"))
        }
        let g = Arc::new(Grammar::new("entry").transition("entry", entry));
        let mut eng = Engine::new(g).unwrap();
        let err = eng.extend("x").unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::InvalidTransition);
    }

    #[test]
    fn consume_at_end_of_stream() {
        fn entry(a: &mut Activation) -> Result<Op> {
            a.consume()?;
            Ok(Op::Next("entry"))
        }
        let g = Arc::new(Grammar::new("entry").transition("entry", entry));
        let mut eng = Engine::new(g).unwrap();
        eng.extend("a").unwrap();
        let err = eng.finish().unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::UnexpectedEnd);
        assert_eq!(err.downcast_ref::<GrammarError>().unwrap().pos, 1);
    }

    #[test]
    fn unterminated_stack_at_finish() {
        fn entry(_a: &mut Activation) -> Result<Op> {
            Ok(Op::Call {
                callee: "hang",
                return_to: None,
            })
        }
        fn hang(_a: &mut Activation) -> Result<Op> {
            Ok(Op::Next("hang"))
        }
        let g = Arc::new(
            Grammar::new("entry")
                .transition("entry", entry)
                .transition("hang", hang),
        );
        let mut eng = Engine::new(g).unwrap();
        eng.extend("ab").unwrap();
        let err = eng.finish().unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::UnterminatedStack);
    }

    #[test]
    fn trailing_input_after_return() {
        fn entry(_a: &mut Activation) -> Result<Op> {
            Ok(Op::ReturnNow(None))
        }
        let g = Arc::new(Grammar::new("entry").transition("entry", entry));
        let mut eng = Engine::new(g).unwrap();
        let err = eng.extend("a").unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::Grammar);
    }

    #[test]
    fn spent_engine_rejects_mutation() {
        let mut eng = Engine::new(const_grammar()).unwrap();
        eng.finish().unwrap();
        assert_eq!(kind_of(&eng.finish().unwrap_err()), ErrorKind::Spent);
        assert_eq!(kind_of(&eng.extend("x").unwrap_err()), ErrorKind::Spent);
    }

    #[test]
    fn suspends_between_chunks() {
        fn entry(a: &mut Activation) -> Result<Op> {
            match a.current() {
                None => Ok(Op::ReturnNow(None)),
                Some(_) => {
                    a.consume()?;
                    Ok(Op::Next("entry"))
                }
            }
        }
        let g = Arc::new(Grammar::new("entry").transition("entry", entry));
        let mut eng = Engine::new(g).unwrap();
        eng.extend("4").unwrap();
        eng.extend("2").unwrap();
        assert!(!eng.is_done());
        assert_eq!(eng.finish().unwrap(), Some(Value::Str("42".to_string())));
        assert!(eng.is_done());
        assert_eq!(eng.stats().chars, 2);
        assert_eq!(eng.stats().max_depth, 2);
    }

    // Return-value resolution order: explicit, then context, then buffer,
    // then the frame's previously recorded return.

    fn relay(a: &mut Activation) -> Result<Op> {
        Ok(Op::ReturnNow(a.returned().cloned()))
    }

    fn resolution_grammar(child: TransitionFn) -> Arc<Grammar> {
        fn entry(_a: &mut Activation) -> Result<Op> {
            Ok(Op::CallNow {
                callee: "child",
                return_to: Some("relay"),
            })
        }
        Arc::new(
            Grammar::new("entry")
                .transition("entry", entry)
                .transition("child", child)
                .transition("relay", relay),
        )
    }

    #[test]
    fn resolution_prefers_explicit_value() {
        fn child(a: &mut Activation) -> Result<Op> {
            a.set_context(Value::Num(1.0));
            a.consume_char('x');
            Ok(Op::ReturnNow(Some(Value::Num(9.0))))
        }
        let mut eng = Engine::new(resolution_grammar(child)).unwrap();
        assert_eq!(eng.finish().unwrap(), Some(Value::Num(9.0)));
    }

    #[test]
    fn resolution_falls_back_to_context() {
        fn child(a: &mut Activation) -> Result<Op> {
            a.set_context(Value::Num(7.0));
            a.consume_char('x');
            Ok(Op::ReturnNow(None))
        }
        let mut eng = Engine::new(resolution_grammar(child)).unwrap();
        assert_eq!(eng.finish().unwrap(), Some(Value::Num(7.0)));
    }

    #[test]
    fn resolution_falls_back_to_buffer() {
        fn child(a: &mut Activation) -> Result<Op> {
            a.consume_char('h');
            a.consume_char('i');
            Ok(Op::ReturnNow(None))
        }
        let mut eng = Engine::new(resolution_grammar(child)).unwrap();
        assert_eq!(eng.finish().unwrap(), Some(Value::Str("hi".to_string())));
    }

    #[test]
    fn resolution_falls_back_to_recorded_return() {
        fn child(_a: &mut Activation) -> Result<Op> {
            Ok(Op::ReturnNow(Some(Value::Num(5.0))))
        }
        fn drop_value(_a: &mut Activation) -> Result<Op> {
            // nothing explicit, no context, empty buffer: the 5 recorded
            // into this frame by the child surfaces again
            Ok(Op::ReturnNow(None))
        }
        fn entry(_a: &mut Activation) -> Result<Op> {
            Ok(Op::CallNow {
                callee: "child",
                return_to: Some("drop_value"),
            })
        }
        let g = Arc::new(
            Grammar::new("entry")
                .transition("entry", entry)
                .transition("child", child)
                .transition("drop_value", drop_value),
        );
        let mut eng = Engine::new(g).unwrap();
        assert_eq!(eng.finish().unwrap(), Some(Value::Num(5.0)));
    }

    #[test]
    fn context_saved_and_restored_across_calls() {
        fn entry(a: &mut Activation) -> Result<Op> {
            a.set_context(Value::Str("outer".to_string()));
            Ok(Op::CallNow {
                callee: "child",
                return_to: Some("check"),
            })
        }
        fn child(a: &mut Activation) -> Result<Op> {
            // fresh frame starts with an empty context slot
            assert!(a.context().is_none());
            Ok(Op::ReturnNow(Some(Value::Num(0.0))))
        }
        fn check(a: &mut Activation) -> Result<Op> {
            assert_eq!(a.context(), Some(&Value::Str("outer".to_string())));
            Ok(Op::ReturnNow(None))
        }
        let g = Arc::new(
            Grammar::new("entry")
                .transition("entry", entry)
                .transition("child", child)
                .transition("check", check),
        );
        let mut eng = Engine::new(g).unwrap();
        // check returns nothing explicit, so its context surfaces
        assert_eq!(
            eng.finish().unwrap(),
            Some(Value::Str("outer".to_string()))
        );
    }
}
