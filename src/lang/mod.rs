//! Command language.
//!
//! One command per `\n`-terminated line: a keyword (long name or short
//! alias) plus whitespace-separated arguments. Argument shapes stay loose
//! here; the handlers validate and answer with their usage lines, so a
//! malformed operand never kills the session.

use std::str::FromStr;

mod parse;

pub use self::parse::{int, Error};

/// A parsed command line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Blank input; redraws the prompt without dispatching.
    Empty,
    /// Unrecognized command word.
    Unknown(String),
    /// `print V...` — resolve and pretty-print variable paths.
    Print(Vec<String>),
    /// `break [FILE] LINE` — set a breakpoint.
    Break { file: Option<String>, line: i64 },
    /// `tb [FILE] LINE` — set a temporary breakpoint.
    TBreak { file: Option<String>, line: i64 },
    /// `enable breaks [ID...]`.
    Enable { what: Option<String>, ids: Vec<String> },
    /// `disable breaks [ID...]`.
    Disable { what: Option<String>, ids: Vec<String> },
    /// `delete breaks [ID...]`.
    Delete { what: Option<String>, ids: Vec<String> },
    /// `info breaks|locals|upvals|args`.
    Info { what: Option<String> },
    /// `list [FILE [LINE]]`; with no arguments, continue the last window.
    List { file: Option<String>, line: i64 },
    /// `frame [N]` — select a frame, counted up from the topmost Lua frame.
    Frame { level: i64 },
    /// `backtrace`.
    Backtrace,
    /// `step` — single source line, descending into calls.
    Step,
    /// `next` — single source line, stepping over calls.
    Next,
    /// `finish` — run until the current function returns.
    Finish,
    /// `until` — run until the enclosing loop finishes.
    Until,
    /// `continue`.
    Continue,
    /// `pause` — interrupt a running VM (background mode).
    Pause,
    /// `quit`.
    Quit,
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse::line(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Command {
        s.parse().unwrap()
    }

    #[test]
    fn keywords_and_aliases() {
        assert_eq!(parse("step"), Command::Step);
        assert_eq!(parse("s"), Command::Step);
        assert_eq!(parse("next"), Command::Next);
        assert_eq!(parse("n"), Command::Next);
        assert_eq!(parse("finish"), Command::Finish);
        assert_eq!(parse("fi"), Command::Finish);
        assert_eq!(parse("until"), Command::Until);
        assert_eq!(parse("un"), Command::Until);
        assert_eq!(parse("continue"), Command::Continue);
        assert_eq!(parse("c"), Command::Continue);
        assert_eq!(parse("backtrace"), Command::Backtrace);
        assert_eq!(parse("bt"), Command::Backtrace);
        assert_eq!(parse("pause"), Command::Pause);
        assert_eq!(parse("pa"), Command::Pause);
        assert_eq!(parse("quit"), Command::Quit);
        assert_eq!(parse("q"), Command::Quit);
    }

    #[test]
    fn empty_line_is_empty() {
        assert_eq!(parse(""), Command::Empty);
        assert_eq!(parse("   \t"), Command::Empty);
    }

    #[test]
    fn print_collects_path_tokens() {
        assert_eq!(
            parse("print t.x.y nope"),
            Command::Print(vec!["t.x.y".into(), "nope".into()])
        );
        assert_eq!(parse("p t['ab']"), Command::Print(vec!["t['ab']".into()]));
        assert_eq!(parse("print"), Command::Print(vec![]));
    }

    #[test]
    fn break_variants() {
        assert_eq!(
            parse("break a.lua 3"),
            Command::Break {
                file: Some("a.lua".into()),
                line: 3
            }
        );
        assert_eq!(parse("b 12"), Command::Break { file: None, line: 12 });
        assert_eq!(parse("break"), Command::Break { file: None, line: 0 });
        assert_eq!(
            parse("tb x.lua 9"),
            Command::TBreak {
                file: Some("x.lua".into()),
                line: 9
            }
        );
        // A non-numeric line falls back to zero, answered by a usage line.
        assert_eq!(
            parse("break a.lua zzz"),
            Command::Break {
                file: Some("a.lua".into()),
                line: 0
            }
        );
    }

    #[test]
    fn bulk_breakpoint_verbs() {
        assert_eq!(
            parse("delete breaks"),
            Command::Delete {
                what: Some("breaks".into()),
                ids: vec![]
            }
        );
        assert_eq!(
            parse("d breaks 1 2"),
            Command::Delete {
                what: Some("breaks".into()),
                ids: vec!["1".into(), "2".into()]
            }
        );
        assert_eq!(
            parse("ea breaks 7"),
            Command::Enable {
                what: Some("breaks".into()),
                ids: vec!["7".into()]
            }
        );
        assert_eq!(
            parse("da breaks"),
            Command::Disable {
                what: Some("breaks".into()),
                ids: vec![]
            }
        );
        assert_eq!(parse("delete"), Command::Delete { what: None, ids: vec![] });
    }

    #[test]
    fn list_and_frame_and_info() {
        assert_eq!(parse("list"), Command::List { file: None, line: 1 });
        assert_eq!(
            parse("l a.lua"),
            Command::List {
                file: Some("a.lua".into()),
                line: 1
            }
        );
        assert_eq!(
            parse("list a.lua 40"),
            Command::List {
                file: Some("a.lua".into()),
                line: 40
            }
        );
        assert_eq!(parse("frame"), Command::Frame { level: 0 });
        assert_eq!(parse("f 2"), Command::Frame { level: 2 });
        assert_eq!(
            parse("info breaks"),
            Command::Info {
                what: Some("breaks".into())
            }
        );
        assert_eq!(parse("i"), Command::Info { what: None });
    }

    #[test]
    fn unknown_commands_keep_their_name() {
        assert_eq!(parse("bogus 1 2"), Command::Unknown("bogus".into()));
        // A keyword prefix without the boundary is still unknown.
        assert_eq!(parse("printx"), Command::Unknown("printx".into()));
    }

    #[test]
    fn quoted_arguments_join_spaces() {
        assert_eq!(
            parse("break 'my file.lua' 3"),
            Command::Break {
                file: Some("my file.lua".into()),
                line: 3
            }
        );
        assert_eq!(
            parse("print \"quoted\""),
            Command::Print(vec!["quoted".into()])
        );
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert!("print 'abc".parse::<Command>().is_err());
        assert!("\"".parse::<Command>().is_err());
    }
}
