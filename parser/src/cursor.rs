/// Tracks the current character, absolute position, line, and column over
/// one or more appended input chunks. Chunks accumulate into a single
/// logical stream; position, line, and column are monotonic for the whole
/// engine lifetime, including across chunk seams.
#[derive(Debug)]
pub struct Cursor {
    chars: Vec<char>,
    idx: usize,
    current: Option<char>,
    finished: bool,
    pos: usize,
    line: usize,
    col: usize,
}

impl Cursor {
    pub fn new() -> Self {
        Cursor {
            chars: Vec::new(),
            idx: 0,
            current: None,
            finished: false,
            pos: 0,
            line: 0,
            col: 0,
        }
    }

    pub fn push_chunk(&mut self, chunk: &str) {
        if self.idx > 0 {
            self.chars.drain(..self.idx);
            self.idx = 0;
        }
        self.chars.extend(chunk.chars());
    }

    /// Move to the next character. Line and column bookkeeping keys off the
    /// *previous* character: a line feed bumps the line and resets the
    /// column for whatever follows it. Returns false when the appended text
    /// is exhausted and the stream is still open; once `finish()` has been
    /// called the cursor sits at END and every advance succeeds.
    pub fn advance(&mut self) -> bool {
        if self.finished {
            self.current = None;
            return true;
        }
        if self.idx >= self.chars.len() {
            return false;
        }
        if self.current == Some('\n') {
            self.line += 1;
            self.col = 0;
        } else {
            self.col += 1;
        }
        self.pos += 1;
        self.current = Some(self.chars[self.idx]);
        self.idx += 1;
        true
    }

    /// Switch permanently to the END sentinel.
    pub fn finish(&mut self) {
        self.finished = true;
    }

    /// The current character; `None` is the END sentinel once `finish()`
    /// has switched the stream over.
    pub fn current(&self) -> Option<char> {
        self.current
    }

    pub fn at_end(&self) -> bool {
        self.finished && self.current.is_none()
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn line(&self) -> usize {
        self.line
    }

    pub fn col(&self) -> usize {
        self.col
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_across_newline() {
        let mut c = Cursor::new();
        c.push_chunk("ab\ncd");
        let expected = [
            ('a', 1, 0, 1),
            ('b', 2, 0, 2),
            ('\n', 3, 0, 3),
            ('c', 4, 1, 0),
            ('d', 5, 1, 1),
        ];
        for (ch, pos, line, col) in expected {
            assert!(c.advance());
            assert_eq!(c.current(), Some(ch));
            assert_eq!((c.pos(), c.line(), c.col()), (pos, line, col));
        }
        assert!(!c.advance());
    }

    #[test]
    fn newline_at_chunk_seam() {
        let mut c = Cursor::new();
        c.push_chunk("a\n");
        assert!(c.advance());
        assert!(c.advance());
        assert!(!c.advance());
        c.push_chunk("b");
        assert!(c.advance());
        assert_eq!(c.current(), Some('b'));
        assert_eq!((c.line(), c.col()), (1, 0));
    }

    #[test]
    fn end_sentinel_after_finish() {
        let mut c = Cursor::new();
        c.push_chunk("x");
        assert!(c.advance());
        assert!(!c.advance());
        c.finish();
        assert!(c.advance());
        assert_eq!(c.current(), None);
        assert!(c.at_end());
        assert!(c.advance());
    }
}
