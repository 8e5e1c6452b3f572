//! Variable paths.
//!
//! Grammar: `IDENT ( '.' IDENT | '[' INT ']' | '[' STRING ']' )*`, at most 16
//! fields deep. Parsed by a small state machine whose diagnostics are part of
//! the wire contract, then resolved against the selected frame: live locals
//! (innermost shadowing first), upvalues by name, then the globals table.

use thiserror::Error;

use crate::vm::{Frame, Value, Vm};

/// Maximum number of fields in one path.
pub const MAX_FIELDS: usize = 16;

/// One resolved segment of a path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Field {
    Str(String),
    Int(i64),
}

/// A convenient type alias for [`Result`](std::result::Result).
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A variable-path diagnostic.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum Error {
    /// illegal variable name
    #[error("illegal variable name")]
    IllegalName,
    /// expecting integer or string in []
    #[error("expecting integer or string in []")]
    ExpectingIndex,
    /// unmatched quote
    #[error("unmatched quote")]
    UnmatchedQuote,
    /// expecting ']'
    #[error("expecting ']'")]
    ExpectingBracket,
    /// expecting suffix '.' or '['
    #[error("expecting suffix '.' or '['")]
    ExpectingSuffix,
    /// too many fields
    #[error("too many fields")]
    TooManyFields,
    /// integer constant overflows
    #[error("integer constant overflows")]
    IntOverflow,
    /// unable to index non-table
    #[error("unable to index non-table")]
    NotATable,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    VarStart,
    Var,
    IntStr,
    Int,
    Str,
    Init,
}

fn push(fields: &mut Vec<Field>, field: Field) -> Result<()> {
    if fields.len() == MAX_FIELDS {
        return Err(Error::TooManyFields);
    }
    fields.push(field);
    Ok(())
}

fn parse_int(digits: &str) -> Result<i64> {
    digits.bytes().try_fold(0i64, |acc, b| {
        acc.checked_mul(10)
            .and_then(|n| n.checked_add(i64::from(b - b'0')))
            .ok_or(Error::IntOverflow)
    })
}

/// Parses a path expression into its fields.
pub fn parse(expr: &str) -> Result<Vec<Field>> {
    let bytes = expr.as_bytes();
    let mut fields = Vec::new();
    let mut st = State::VarStart;
    let mut tk = 0;
    let mut quote = 0u8;

    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match st {
            State::VarStart => {
                if !c.is_ascii_alphabetic() && c != b'_' {
                    return Err(Error::IllegalName);
                }
                tk = i;
                st = State::Var;
            }
            State::Var => {
                if !c.is_ascii_alphanumeric() && c != b'_' {
                    push(&mut fields, Field::Str(expr[tk..i].into()))?;
                    match c {
                        b'.' => st = State::VarStart,
                        b'[' => st = State::IntStr,
                        _ => return Err(Error::IllegalName),
                    }
                }
            }
            State::IntStr => {
                if c == b'\'' || c == b'"' {
                    quote = c;
                    tk = i + 1;
                    st = State::Str;
                } else if c.is_ascii_digit() {
                    tk = i;
                    st = State::Int;
                } else {
                    return Err(Error::ExpectingIndex);
                }
            }
            State::Str => {
                if c == b'\'' || c == b'"' {
                    if c != quote {
                        return Err(Error::UnmatchedQuote);
                    }
                    if bytes.get(i + 1) != Some(&b']') {
                        return Err(Error::ExpectingBracket);
                    }
                    push(&mut fields, Field::Str(expr[tk..i].into()))?;
                    i += 1;
                    st = State::Init;
                }
            }
            State::Int => {
                if !c.is_ascii_digit() {
                    if c != b']' {
                        return Err(Error::ExpectingBracket);
                    }
                    push(&mut fields, Field::Int(parse_int(&expr[tk..i])?))?;
                    st = State::Init;
                }
            }
            State::Init => match c {
                b'.' => st = State::VarStart,
                b'[' => st = State::IntStr,
                _ => return Err(Error::ExpectingSuffix),
            },
        }
        i += 1;
    }

    // Every state but a finished identifier or a closed suffix is an
    // incomplete path.
    match st {
        State::Var => {
            push(&mut fields, Field::Str(expr[tk..].into()))?;
            Ok(fields)
        }
        State::Init => Ok(fields),
        State::VarStart => Err(Error::IllegalName),
        State::IntStr => Err(Error::ExpectingIndex),
        State::Int => Err(Error::ExpectingBracket),
        State::Str => Err(Error::UnmatchedQuote),
    }
}

/// Which scope a name resolved in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VarKind {
    Local,
    Upvalue,
    Global,
    /// Not found anywhere; the value reads as nil.
    Undefined,
}

/// Resolves a bare name at `pc` of `frame`.
///
/// Locals are scanned in reverse declaration order so shadowing inner
/// bindings win over outer ones.
#[must_use]
pub fn resolve_name(vm: &Vm, frame: &Frame, pc: usize, name: &str) -> (Value, VarKind) {
    let closure = frame.closure();
    let proto = &closure.proto;

    for (reg, lv) in proto.locvars.iter().enumerate().rev() {
        if &*lv.name == name && lv.startpc <= pc && pc < lv.endpc {
            return (vm.register(frame, reg), VarKind::Local);
        }
    }

    for (i, uv) in proto.upvals.iter().enumerate() {
        if &*uv.name == name {
            let v = closure.upvals.get(i).cloned().unwrap_or_default();
            return (v, VarKind::Upvalue);
        }
    }

    match vm.table(vm.globals()).get_str(name) {
        Value::Nil => (Value::Nil, VarKind::Undefined),
        v => (v, VarKind::Global),
    }
}

/// Resolves a full parsed path at `pc` of `frame`.
pub fn resolve(vm: &Vm, frame: &Frame, pc: usize, fields: &[Field]) -> Result<(Value, VarKind)> {
    let Some((Field::Str(name), rest)) = fields.split_first() else {
        return Err(Error::IllegalName);
    };
    let (mut value, kind) = resolve_name(vm, frame, pc, name);
    for field in rest {
        let Value::Table(id) = value else {
            return Err(Error::NotATable);
        };
        let table = vm.table(id);
        value = match field {
            Field::Int(i) => table.get_int(*i),
            Field::Str(s) => table.get_str(s),
        };
    }
    Ok((value, kind))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::vm::{Closure, Code, Instruction, LocVar, Opcode, Proto, SrcId, UpvalDesc};

    #[test]
    fn accepts_the_grammar() {
        assert_eq!(
            parse("t.x.y").unwrap(),
            vec![
                Field::Str("t".into()),
                Field::Str("x".into()),
                Field::Str("y".into())
            ]
        );
        assert_eq!(
            parse("a[1]['k'].b").unwrap(),
            vec![
                Field::Str("a".into()),
                Field::Int(1),
                Field::Str("k".into()),
                Field::Str("b".into())
            ]
        );
        assert_eq!(
            parse("_priv0[\"x y\"]").unwrap(),
            vec![Field::Str("_priv0".into()), Field::Str("x y".into())]
        );
        assert_eq!(
            parse("my_var.sub_field").unwrap(),
            vec![Field::Str("my_var".into()), Field::Str("sub_field".into())]
        );
    }

    #[test]
    fn rejects_with_exact_diagnostics() {
        assert_eq!(parse("1foo"), Err(Error::IllegalName));
        assert_eq!(parse(""), Err(Error::IllegalName));
        assert_eq!(parse("a."), Err(Error::IllegalName));
        assert_eq!(parse("a.1"), Err(Error::IllegalName));
        assert_eq!(parse("a-b"), Err(Error::IllegalName));
        assert_eq!(parse("a[x]"), Err(Error::ExpectingIndex));
        assert_eq!(parse("a["), Err(Error::ExpectingIndex));
        assert_eq!(parse("a['k\"]"), Err(Error::UnmatchedQuote));
        assert_eq!(parse("a['k"), Err(Error::UnmatchedQuote));
        assert_eq!(parse("a[1"), Err(Error::ExpectingBracket));
        assert_eq!(parse("a[1x]"), Err(Error::ExpectingBracket));
        assert_eq!(parse("a['k'x"), Err(Error::ExpectingBracket));
        assert_eq!(parse("a[1]x"), Err(Error::ExpectingSuffix));
    }

    #[test]
    fn caps_field_depth() {
        let deep = format!("v{}", ".f".repeat(MAX_FIELDS));
        assert_eq!(parse(&deep), Err(Error::TooManyFields));
        let ok = format!("v{}", ".f".repeat(MAX_FIELDS - 1));
        assert_eq!(parse(&ok).unwrap().len(), MAX_FIELDS);
    }

    #[test]
    fn rejects_overflowing_index() {
        assert_eq!(parse("a[99999999999999999999]"), Err(Error::IntOverflow));
    }

    fn test_frame(vm: &mut Vm) -> Frame {
        let src = SrcId(0);
        let proto = Arc::new(Proto {
            source: src,
            linedefined: 0,
            lastlinedefined: 10,
            code: Code::from(vec![Instruction::abc(Opcode::Return, 0, 1, 0)]),
            lineinfo: Box::new([1]),
            constants: Box::new([]),
            locvars: Box::new([
                LocVar {
                    name: Arc::from("x"),
                    startpc: 0,
                    endpc: 10,
                },
                LocVar {
                    name: Arc::from("x"),
                    startpc: 5,
                    endpc: 10,
                },
            ]),
            upvals: Box::new([UpvalDesc {
                name: Arc::from("up"),
            }]),
            protos: Box::new([]),
            numparams: 0,
            is_vararg: false,
        });
        let closure = Arc::new(Closure {
            proto,
            upvals: vec![Value::Integer(77)],
        });
        vm.set_stack(0, Value::Integer(1));
        vm.set_stack(1, Value::Integer(2));
        Frame::lua(closure, 0)
    }

    #[test]
    fn shadowing_local_wins() {
        let mut vm = Vm::new();
        let frame = test_frame(&mut vm);
        // Before the inner binding is live, the outer one resolves.
        let (v, kind) = resolve_name(&vm, &frame, 2, "x");
        assert_eq!(kind, VarKind::Local);
        assert!(matches!(v, Value::Integer(1)));
        // Once both are live the higher register shadows.
        let (v, kind) = resolve_name(&vm, &frame, 7, "x");
        assert_eq!(kind, VarKind::Local);
        assert!(matches!(v, Value::Integer(2)));
    }

    #[test]
    fn falls_back_to_upvalues_then_globals() {
        let mut vm = Vm::new();
        vm.set_global("g", Value::str("global"));
        let frame = test_frame(&mut vm);
        let (v, kind) = resolve_name(&vm, &frame, 0, "up");
        assert_eq!(kind, VarKind::Upvalue);
        assert!(matches!(v, Value::Integer(77)));
        let (_, kind) = resolve_name(&vm, &frame, 0, "g");
        assert_eq!(kind, VarKind::Global);
        let (v, kind) = resolve_name(&vm, &frame, 0, "nope");
        assert_eq!(kind, VarKind::Undefined);
        assert!(matches!(v, Value::Nil));
    }

    #[test]
    fn indexes_nested_tables() {
        let mut vm = Vm::new();
        let inner = vm.new_table();
        vm.table_mut(inner).set_str("y", Value::Integer(7));
        let outer = vm.new_table();
        vm.table_mut(outer).set_str("x", Value::Table(inner));
        vm.set_global("t", Value::Table(outer));
        let frame = test_frame(&mut vm);

        let fields = parse("t.x.y").unwrap();
        let (v, _) = resolve(&vm, &frame, 0, &fields).unwrap();
        assert!(matches!(v, Value::Integer(7)));

        let fields = parse("t.x.y.z").unwrap();
        assert!(matches!(
            resolve(&vm, &frame, 0, &fields),
            Err(Error::NotATable)
        ));
    }
}
