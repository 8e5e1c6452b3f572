//! Source-file cache.
//!
//! Maps a registered source file to a memory-resident copy plus a line-offset
//! index. Files load on first use and stay cached for the process lifetime.
//! A UTF-8 BOM is skipped, and files that hold compiled bytecode (optionally
//! behind a shebang line) are marked binary and never listed.

use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use log::debug;

use crate::vm::SrcId;

/// First byte of the compiled-chunk signature (`"\x1bLua"`).
const BYTECODE_MARK: u8 = 0x1b;

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// A loaded source file.
#[derive(Debug)]
pub struct FileContent {
    /// Raw text; `None` for binary (compiled) files.
    text: Option<Box<[u8]>>,
    /// Number of lines; the last line extends to end of file.
    lines: usize,
    /// Byte offset of each line's first byte.
    linepos: Box<[usize]>,
}

impl FileContent {
    fn load(path: &Path) -> Option<Self> {
        let raw = fs::read(path).ok()?;

        // Skip a UTF-8 BOM.
        let mut text = raw.as_slice();
        if text.starts_with(BOM) {
            text = &text[BOM.len()..];
        }

        // Refuse compiled chunks; a shebang line may precede the signature.
        let binary = match text.first() {
            Some(&b'#') => {
                let rest = text.iter().position(|&b| b == b'\n').map(|i| &text[i + 1..]);
                rest.and_then(<[u8]>::first) == Some(&BYTECODE_MARK)
            }
            Some(&b) => b == BYTECODE_MARK,
            None => false,
        };
        if binary {
            debug!("refusing binary source {}", path.display());
            return Some(Self {
                text: None,
                lines: 0,
                linepos: Box::new([]),
            });
        }

        let lines = bytecount::count(text, b'\n') + 1;
        let mut linepos = Vec::with_capacity(lines);
        linepos.push(0);
        for (i, &b) in text.iter().enumerate() {
            if b == b'\n' && linepos.len() < lines {
                linepos.push(i + 1);
            }
        }

        Some(Self {
            text: Some(text.into()),
            lines,
            linepos: linepos.into(),
        })
    }

    /// Whether the file held compiled bytecode.
    #[must_use]
    pub fn is_binary(&self) -> bool {
        self.text.is_none()
    }

    #[must_use]
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Raw bytes of 1-based `line`, including its trailing newline.
    ///
    /// # Panics
    ///
    /// Panics when out of range or binary; callers clamp against
    /// [`Self::lines`] first.
    #[must_use]
    pub fn line(&self, line: usize) -> &[u8] {
        let text = self.text.as_deref().expect("binary file has no lines");
        let start = self.linepos[line - 1];
        let end = if line == self.lines {
            text.len()
        } else {
            self.linepos[line]
        };
        &text[start..end]
    }
}

/// Process-lifetime cache of loaded sources, keyed by source id.
#[derive(Debug, Default)]
pub struct SourceCache {
    files: IndexMap<SrcId, FileContent>,
}

impl SourceCache {
    /// Returns the cached content, loading it on first use.
    ///
    /// `None` means the file could not be read at all; a *binary* file still
    /// yields a (line-less) record.
    pub fn get_or_load(&mut self, id: SrcId, path: &Path) -> Option<&FileContent> {
        if !self.files.contains_key(&id) {
            let content = FileContent::load(path)?;
            debug!(
                "cached source {} ({} lines)",
                path.display(),
                content.lines()
            );
            self.files.insert(id, content);
        }
        self.files.get(&id)
    }

    /// Cached lookup without loading.
    #[must_use]
    pub fn get(&self, id: SrcId) -> Option<&FileContent> {
        self.files.get(&id)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn load_bytes(bytes: &[u8]) -> FileContent {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        FileContent::load(f.path()).unwrap()
    }

    #[test]
    fn line_index_round_trips() {
        let text = b"local x = 1\nprint(x)\n\nreturn x";
        let fc = load_bytes(text);
        assert_eq!(fc.lines(), 4);
        let mut rebuilt = Vec::new();
        for i in 1..=fc.lines() {
            rebuilt.extend_from_slice(fc.line(i));
        }
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn trailing_newline_yields_empty_last_line() {
        let fc = load_bytes(b"a\nb\n");
        assert_eq!(fc.lines(), 3);
        assert_eq!(fc.line(3), b"");
    }

    #[test]
    fn bom_is_skipped() {
        let fc = load_bytes(b"\xEF\xBB\xBFprint('hi')\n");
        assert_eq!(fc.line(1), b"print('hi')\n");
    }

    #[test]
    fn bytecode_is_marked_binary() {
        let fc = load_bytes(b"\x1bLua\x53\x00");
        assert!(fc.is_binary());
    }

    #[test]
    fn bytecode_behind_shebang_is_binary() {
        let fc = load_bytes(b"#!/usr/bin/lua\n\x1bLua\x53\x00");
        assert!(fc.is_binary());
    }

    #[test]
    fn shebang_text_is_not_binary() {
        let fc = load_bytes(b"#!/usr/bin/lua\nprint('hi')\n");
        assert!(!fc.is_binary());
        assert_eq!(fc.line(2), b"print('hi')\n");
    }

    #[test]
    fn missing_file_fails_to_load() {
        assert!(FileContent::load(Path::new("/nonexistent/nope.lua")).is_none());
    }
}
