use anyhow::Result;

use crate::{infoln, Engine, EngineStats, Logger, OpReport, Value};

/// A tracing wrapper around [`Engine`], driven through its per-step API.
///
/// Before each step it logs a RUN line with the logical call stack
/// (outermost first), position, current character, and pending return
/// value; after each step it logs the applied primitive, indented by stack
/// depth. The engine itself has no awareness of tracing.
pub struct TraceEngine {
    engine: Engine,
    pub logger: Logger,
}

impl TraceEngine {
    pub fn new(engine: Engine, logger: Logger) -> Self {
        TraceEngine { engine, logger }
    }

    pub fn extend(&mut self, chunk: &str) -> Result<()> {
        self.engine.feed(chunk)?;
        while self.engine.prepare_step() {
            self.log_run();
            let report = self.engine.dispatch_step()?;
            self.log_op(&report);
        }
        Ok(())
    }

    pub fn finish(&mut self) -> Result<Option<Value>> {
        self.engine.begin_finish()?;
        loop {
            let before = self.engine.active_name();
            self.engine.prepare_step();
            self.log_run();
            let report = self.engine.dispatch_step()?;
            self.log_op(&report);
            if self.engine.active_name() == before {
                break;
            }
        }
        self.engine.end_finish()
    }

    pub fn on_result(&mut self, observer: impl FnMut(&Value) + 'static) {
        self.engine.on_result(observer);
    }

    pub fn last_result(&self) -> Option<&Value> {
        self.engine.last_result()
    }

    pub fn stats(&self) -> &EngineStats {
        self.engine.stats()
    }

    pub fn into_inner(self) -> Engine {
        self.engine
    }

    fn log_run(&mut self) {
        let stack = self.engine.stack_names().join(" <- ");
        let ch = match self.engine.current_char() {
            None => "END".to_string(),
            Some(c) => format!("{c:?}"),
        };
        let ret = match self.engine.pending_return() {
            None => "null".to_string(),
            Some(v) => serde_json::to_string(v).unwrap_or_else(|_| "?".to_string()),
        };
        let (line, col) = (self.engine.line(), self.engine.col());
        infoln!(
            self,
            "RUN {} {{line: {}, col: {}, char: {}, ret: {}}}",
            stack,
            line,
            col,
            ch,
            ret
        );
    }

    fn log_op(&mut self, report: &OpReport) {
        if report.kind == "DONE" {
            return;
        }
        let indent = "  ".repeat(self.engine.depth().saturating_sub(1));
        let mut line = format!("  {}{}", indent, report.kind);
        if let Some(target) = report.target {
            line.push(' ');
            line.push_str(target);
        }
        if let Some(ret) = report.return_to {
            line.push_str(" -> ");
            line.push_str(ret);
        }
        infoln!(self, "{}", line);
    }
}
