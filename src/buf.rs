//! Reply buffer.
//!
//! Every command's output is accumulated here and flushed in one write,
//! terminated by the `\n> ` prompt.

use std::fmt;
use std::io::Write as _;
use std::net::TcpStream;

use log::warn;

/// Initial buffer capacity; grows by doubling.
const INITIAL_CAP: usize = 2048;

/// Where a flush lands.
#[derive(Debug, Default)]
pub enum Sink {
    /// No client attached; flushed data is discarded.
    #[default]
    Discard,
    /// Inline mode.
    Stdout,
    /// A connected debugger client.
    Client(TcpStream),
}

/// Growable byte buffer with formatted append and prompt-terminated flush.
#[derive(Debug)]
pub struct Reply {
    buf: Vec<u8>,
}

impl Default for Reply {
    fn default() -> Self {
        Self {
            buf: Vec::with_capacity(INITIAL_CAP),
        }
    }
}

impl Reply {
    /// Appends raw bytes.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Appends a string slice.
    pub fn push_str(&mut self, s: &str) {
        self.push_bytes(s.as_bytes());
    }

    /// Appends formatted text.
    pub fn push_fmt(&mut self, args: fmt::Arguments<'_>) {
        use fmt::Write as _;
        let mut s = String::new();
        // Formatting into a String cannot fail.
        let _ = s.write_fmt(args);
        self.push_str(&s);
    }

    /// Discards the accumulated contents and appends formatted text.
    pub fn reset_fmt(&mut self, args: fmt::Arguments<'_>) {
        self.buf.clear();
        self.push_fmt(args);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Takes the accumulated contents without the prompt decoration.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Appends the terminating `\n> ` prompt.
    fn seal(&mut self) {
        if self.buf.last() != Some(&b'\n') {
            self.buf.push(b'\n');
        }
        self.buf.extend_from_slice(b"> ");
    }

    /// Terminates the reply with `\n> ` and writes it to `sink` in one call.
    ///
    /// Write failures are not surfaced here: a dead client is detected by the
    /// transport's read path, which then detaches.
    pub fn flush(&mut self, sink: &mut Sink) {
        self.seal();
        match sink {
            Sink::Discard => {}
            Sink::Stdout => {
                let mut out = std::io::stdout();
                if let Err(err) = out.write_all(&self.buf).and_then(|()| out.flush()) {
                    warn!("stdout write failed: {err}");
                }
            }
            Sink::Client(stream) => {
                if let Err(err) = stream.write_all(&self.buf) {
                    warn!("client write failed: {err}");
                }
            }
        }
        self.buf.clear();
    }
}

/// `write!`-style formatted append.
macro_rules! reply {
    ($out:expr, $($arg:tt)*) => {
        $out.push_fmt(format_args!($($arg)*))
    };
}
pub(crate) use reply;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_keeps_existing_newline() {
        let mut out = Reply::default();
        out.push_str("hello\n");
        out.seal();
        assert_eq!(out.as_bytes(), b"hello\n> ");
    }

    #[test]
    fn seal_inserts_missing_newline() {
        let mut out = Reply::default();
        out.push_str("hi");
        out.seal();
        assert_eq!(out.as_bytes(), b"hi\n> ");
    }

    #[test]
    fn empty_reply_is_bare_prompt() {
        let mut out = Reply::default();
        out.seal();
        assert_eq!(out.as_bytes(), b"\n> ");
        out.flush(&mut Sink::Discard);
        assert!(out.is_empty());
    }

    #[test]
    fn reset_discards_previous_contents() {
        let mut out = Reply::default();
        reply!(out, "stale");
        out.reset_fmt(format_args!("fatal error: {}", "boom"));
        assert_eq!(out.as_bytes(), b"fatal error: boom");
    }
}
