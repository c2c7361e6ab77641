//! Textual program format.
//!
//! A program is a TOML document with one `[[unit]]` table per unit:
//!
//! ```toml
//! [[unit]]
//! name = "countdown"
//! locals = 1
//! code = """
//!     iconst 10
//!     store 0
//! head:
//!     load 0
//!     ifeq done
//!     load 0
//!     iconst 1
//!     sub
//!     store 0
//!     goto head
//! done:
//!     return
//! """
//! ```
//!
//! Units are numbered in file order, so `invoke` may name any unit in the
//! file. `;` starts a comment.

use super::{Constant, Op, Program, ProgramError, UnitBuilder, UnitId};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProgramFile {
    #[serde(rename = "unit", default)]
    units: Vec<UnitSource>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnitSource {
    name: String,
    #[serde(default)]
    locals: u16,
    code: String,
}

/// Parse a program from its TOML source.
pub fn parse_program(source: &str) -> Result<Program, ProgramError> {
    let file: ProgramFile = toml::from_str(source)?;

    let ids: HashMap<&str, UnitId> = file
        .units
        .iter()
        .enumerate()
        .map(|(i, unit)| (unit.name.as_str(), UnitId(i as u16)))
        .collect();

    let mut program = Program::new();
    for unit in &file.units {
        let mut builder = UnitBuilder::new(&unit.name, unit.locals);
        for (index, line) in unit.code.lines().enumerate() {
            parse_line(&mut builder, line, &ids).map_err(|message| ProgramError::Syntax {
                line: index + 1,
                message: format!("{}: {}", unit.name, message),
            })?;
        }
        program.push(builder.build(program.next_id())?);
    }
    Ok(program)
}

fn parse_line(
    builder: &mut UnitBuilder,
    line: &str,
    ids: &HashMap<&str, UnitId>,
) -> Result<(), String> {
    let line = line.split(';').next().unwrap_or("").trim();
    if line.is_empty() {
        return Ok(());
    }
    if let Some(label) = line.strip_suffix(':') {
        builder.label(label.trim());
        return Ok(());
    }

    let mut words = line.split_whitespace();
    let mnemonic = words.next().unwrap_or("");
    let args: Vec<&str> = words.collect();
    let expect_args = |n: usize| -> Result<(), String> {
        if args.len() == n {
            Ok(())
        } else {
            Err(format!("'{}' takes {} operand(s), got {}", mnemonic, n, args.len()))
        }
    };

    let simple = match mnemonic {
        "nop" => Some(Op::Nop),
        "dup" => Some(Op::Dup),
        "pop" => Some(Op::Pop),
        "add" => Some(Op::Add),
        "sub" => Some(Op::Sub),
        "mul" => Some(Op::Mul),
        "div" => Some(Op::Div),
        "and" => Some(Op::And),
        "or" => Some(Op::Or),
        "xor" => Some(Op::Xor),
        "neg" => Some(Op::Neg),
        "aload" => Some(Op::ALoad),
        "astore" => Some(Op::AStore),
        "monitorenter" => Some(Op::MonitorEnter),
        "monitorexit" => Some(Op::MonitorExit),
        "return" => Some(Op::Return),
        "vreturn" => Some(Op::VReturn),
        "throw" => Some(Op::Throw),
        _ => None,
    };
    if let Some(op) = simple {
        expect_args(0)?;
        builder.op(op);
        return Ok(());
    }

    let branch: Option<fn(u32) -> Op> = match mnemonic {
        "goto" => Some(Op::Goto),
        "ifeq" => Some(Op::IfEq),
        "ifne" => Some(Op::IfNe),
        "iflt" => Some(Op::IfLt),
        "ifcmpeq" => Some(Op::IfCmpEq),
        "ifcmplt" => Some(Op::IfCmpLt),
        _ => None,
    };
    if let Some(make) = branch {
        expect_args(1)?;
        builder.branch(make, args[0]);
        return Ok(());
    }

    match mnemonic {
        "iconst" => {
            expect_args(1)?;
            builder.op(Op::IConst(parse_int(args[0])?));
        }
        "fconst" => {
            expect_args(1)?;
            builder.op(Op::FConst(parse_float(args[0])?));
        }
        "ldc.int" => {
            expect_args(1)?;
            builder.ldc(Constant::Int(parse_int(args[0])?));
        }
        "ldc.float" => {
            expect_args(1)?;
            builder.ldc(Constant::Float(parse_float(args[0])?));
        }
        "ldc.obj" => {
            expect_args(2)?;
            builder.ldc(Constant::Object {
                handle: parse_int(args[0])? as u32,
                offset: parse_int(args[1])?,
            });
        }
        "load" | "store" | "checkcast" => {
            expect_args(1)?;
            let index = parse_u16(args[0])?;
            builder.op(match mnemonic {
                "load" => Op::Load(index),
                "store" => Op::Store(index),
                _ => Op::CheckCast(index),
            });
        }
        "invoke" | "invoke.inline" => {
            expect_args(2)?;
            let unit = ids
                .get(args[0])
                .ok_or_else(|| format!("unknown unit '{}'", args[0]))?
                .0;
            let argc: u8 = args[1]
                .parse()
                .map_err(|_| format!("invalid argument count '{}'", args[1]))?;
            builder.op(if mnemonic == "invoke" {
                Op::Invoke { unit, argc }
            } else {
                Op::InvokeInline { unit, argc }
            });
        }
        _ => return Err(format!("unknown instruction '{}'", mnemonic)),
    }
    Ok(())
}

fn parse_int(text: &str) -> Result<i32, String> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let value = match digits.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => digits.parse::<i64>(),
    }
    .map_err(|_| format!("invalid integer '{}'", text))?;
    let value = if negative { -value } else { value };
    // Hex literals may spell any 32-bit pattern.
    if (i32::MIN as i64..=u32::MAX as i64).contains(&value) {
        Ok(value as i32)
    } else {
        Err(format!("integer '{}' does not fit in 32 bits", text))
    }
}

fn parse_float(text: &str) -> Result<f32, String> {
    text.parse()
        .map_err(|_| format!("invalid float '{}'", text))
}

fn parse_u16(text: &str) -> Result<u16, String> {
    text.parse()
        .map_err(|_| format!("invalid index '{}'", text))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
[[unit]]
name = "main"
locals = 1
code = """
    ldc.int 0x12345678      ; does not fit an immediate
    store 0
head:
    load 0
    ifeq done
    load 0
    invoke helper 1
    store 0
    goto head
done:
    return
"""

[[unit]]
name = "helper"
locals = 1
code = """
    load 0
    iconst -1
    add
    vreturn
"""
"#;

    #[test]
    fn test_parse_program() {
        let program = parse_program(SOURCE).unwrap();
        assert_eq!(program.len(), 2);

        let main = program.by_name("main").unwrap();
        assert_eq!(main.constants(), &[Constant::Int(0x12345678)]);
        assert!(main.has_loops());
        assert!(
            main.ops()
                .any(|(_, op)| op == Op::Invoke { unit: 1, argc: 1 })
        );

        let helper = program.get(UnitId(1)).unwrap();
        assert_eq!(helper.name(), "helper");
        assert_eq!(helper.op_at(3), Some((Op::IConst(-1), 8)));
    }

    #[test]
    fn test_syntax_error_reports_line() {
        let source = "[[unit]]\nname = \"x\"\ncode = \"\"\"\nnop\nfrobnicate 3\n\"\"\"\n";
        let err = parse_program(source).unwrap_err();
        assert!(matches!(err, ProgramError::Syntax { line: 2, .. }), "{}", err);
    }

    #[test]
    fn test_parse_int_forms() {
        assert_eq!(parse_int("-5"), Ok(-5));
        assert_eq!(parse_int("0xFFFFFFFF"), Ok(-1));
        assert!(parse_int("0x1FFFFFFFF").is_err());
    }
}
