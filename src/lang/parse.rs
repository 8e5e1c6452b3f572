use std::str::FromStr;

use num::Zero as _;
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use thiserror::Error;

use super::Command;

#[derive(Parser)]
#[grammar = "lang/parse.pest"]
struct Language;

/// A convenient type alias for [`Result`](std::result::Result).
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error caused by parsing a command line.
#[derive(Debug, Error)]
pub enum Error {
    /// External parsing error.
    #[error(transparent)]
    Pest(#[from] Box<pest::error::Error<Rule>>),
}

/// C-style integer conversion: a token that is not a number reads as zero,
/// which the handlers answer with their usage lines.
pub fn int<I>(tok: &str) -> I
where
    I: num::Integer + FromStr,
{
    tok.parse().unwrap_or_else(|_| I::zero())
}

/// Parses one command line.
pub(super) fn line(s: &str) -> Result<Command> {
    let mut pairs =
        Language::parse(Rule::Line, s).map_err(|err| Error::Pest(Box::new(err)))?;
    // `Line` is silent, so the first pair is the command itself; blank input
    // surfaces only the end-of-input marker.
    let Some(top) = pairs.next() else {
        return Ok(Command::Empty);
    };
    if top.as_rule() == Rule::EOI {
        return Ok(Command::Empty);
    }
    Ok(command(top))
}

fn text(pair: Pair<'_, Rule>) -> String {
    pair.as_str().to_string()
}

fn command(top: Pair<'_, Rule>) -> Command {
    let rule = top.as_rule();
    let mut inner = top.into_inner();
    if rule == Rule::Unknown {
        let name = inner.next().map(text).unwrap_or_default();
        return Command::Unknown(name);
    }

    // Skip the keyword pair; everything after it is an argument token.
    let _kword = inner.next();
    let args: Vec<String> = inner.filter(|p| p.as_rule() != Rule::EOI).map(text).collect();

    match rule {
        Rule::Print => Command::Print(args),
        Rule::Break | Rule::TBreak => {
            let (file, line) = place(&args);
            if rule == Rule::Break {
                Command::Break { file, line }
            } else {
                Command::TBreak { file, line }
            }
        }
        Rule::Enable => Command::Enable {
            what: args.first().cloned(),
            ids: args.get(1..).unwrap_or_default().to_vec(),
        },
        Rule::Disable => Command::Disable {
            what: args.first().cloned(),
            ids: args.get(1..).unwrap_or_default().to_vec(),
        },
        Rule::Delete => Command::Delete {
            what: args.first().cloned(),
            ids: args.get(1..).unwrap_or_default().to_vec(),
        },
        Rule::Info => Command::Info {
            what: args.first().cloned(),
        },
        Rule::List => {
            let file = args.first().cloned();
            let line = match args.get(1) {
                Some(tok) => match int(tok) {
                    0 => 1,
                    n => n,
                },
                None => 1,
            };
            Command::List { file, line }
        }
        Rule::Frame => Command::Frame {
            level: args.first().map(|tok| int(tok)).unwrap_or(0),
        },
        Rule::Backtrace => Command::Backtrace,
        Rule::Step => Command::Step,
        Rule::Next => Command::Next,
        Rule::Finish => Command::Finish,
        Rule::Until => Command::Until,
        Rule::Continue => Command::Continue,
        Rule::Pause => Command::Pause,
        Rule::Quit => Command::Quit,
        rule => unreachable!("unhandled command rule: {rule:?}"),
    }
}

/// Shapes `[LINE]` / `[FILE LINE]` argument lists.
fn place(args: &[String]) -> (Option<String>, i64) {
    match args {
        [] => (None, 0),
        [line] => (None, int(line)),
        [file, line, ..] => (Some(file.clone()), int(line)),
    }
}
