//! Incremental line splitting for process output
//!
//! Lines end at `\n`, `\r\n` or a bare `\r` (ssh and the relay controller
//! both rewrite status lines in place with carriage returns). Bytes after the
//! last terminator are held until more input arrives or the stream ends.

/// Accumulates raw output chunks and yields complete lines
#[derive(Debug, Default)]
pub struct LineSplitter {
    buffer: Vec<u8>,
    /// Last byte seen was `\r`, so a following `\n` belongs to it
    after_cr: bool,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &byte in chunk {
            match byte {
                b'\n' if self.after_cr => {
                    self.after_cr = false;
                }
                b'\n' => {
                    lines.push(self.take_line());
                }
                b'\r' => {
                    self.after_cr = true;
                    lines.push(self.take_line());
                }
                _ => {
                    self.after_cr = false;
                    self.buffer.push(byte);
                }
            }
        }

        lines
    }

    /// Flush the unterminated remainder at end of stream
    pub fn finish(&mut self) -> Option<String> {
        self.after_cr = false;
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_on_newline() {
        let mut splitter = LineSplitter::new();
        assert_eq!(splitter.push(b"one\ntwo\n"), vec!["one", "two"]);
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_buffers_partial_lines_across_chunks() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"pgrok tunnel ").is_empty());
        assert!(splitter.push(b"active: https://a.example").is_empty());
        assert_eq!(
            splitter.push(b".com\nnext"),
            vec!["pgrok tunnel active: https://a.example.com"]
        );
        assert_eq!(splitter.finish(), Some("next".to_string()));
    }

    #[test]
    fn test_bare_carriage_return_terminates() {
        let mut splitter = LineSplitter::new();
        assert_eq!(splitter.push(b"10%\r20%\r"), vec!["10%", "20%"]);
    }

    #[test]
    fn test_crlf_is_a_single_terminator() {
        let mut splitter = LineSplitter::new();
        assert_eq!(splitter.push(b"a\r\nb\r\n"), vec!["a", "b"]);

        // Split across chunk boundary
        assert_eq!(splitter.push(b"c\r"), vec!["c"]);
        assert_eq!(splitter.push(b"\nd\n"), vec!["d"]);
    }

    #[test]
    fn test_blank_lines_are_preserved() {
        let mut splitter = LineSplitter::new();
        assert_eq!(splitter.push(b"\n\nx\n"), vec!["", "", "x"]);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut splitter = LineSplitter::new();
        let lines = splitter.push(b"bad \xff byte\n");
        assert_eq!(lines, vec!["bad \u{fffd} byte"]);
    }
}
