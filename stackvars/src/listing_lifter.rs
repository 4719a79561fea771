//! A lifter from the disassembler's listing export
//!
//! The export is line oriented. A `PROGRAM` header names the program and its bit width, followed
//! by one section per function:
//!
//! ```text
//! PROGRAM
//! name <program name>
//! bits <32|64>
//!
//! FUNCTION <entry hex> <end hex> <name>
//! FRAME <locals size hex>
//! 	<raw offset hex>	<size>	<flag word hex or ->	<member name>
//! BLOCK <start hex> -> <succ hex> <succ hex> ...
//! 	<addr hex>	<mnemonic>	<operand0>	<operand1>
//! ```
//!
//! `NOFRAME` replaces the `FRAME` line (and its members) for frameless functions. Indented lines
//! are tab separated; trailing empty fields may be omitted.

use crate::arch::Architecture;
use crate::error::LiftError;
use crate::frame::{Frame, FrameMember};
use crate::insn::{BasicBlock, Function, Instruction, Program};
use crate::log::*;

use itertools::Itertools;

fn parse_hex(s: &str) -> Option<u64> {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(s, 16).ok()
}

fn hex_field(line: usize, what: &str, s: &str) -> Result<u64, LiftError> {
    parse_hex(s).ok_or_else(|| LiftError::syntax(line, format!("Bad {} `{}`", what, s)))
}

/// What indented lines currently belong to
enum Cursor {
    Nothing,
    FrameMembers,
    Block {
        start: u64,
        instructions: Vec<Instruction>,
        successors: Vec<u64>,
    },
}

struct FunctionBuilder {
    func: Function,
    cursor: Cursor,
}

impl FunctionBuilder {
    fn flush_block(&mut self, line: usize) -> Result<(), LiftError> {
        if let Cursor::Block {
            start,
            instructions,
            successors,
        } = std::mem::replace(&mut self.cursor, Cursor::Nothing)
        {
            if self
                .func
                .add_block(BasicBlock::new(start, instructions, successors))
                .is_some()
            {
                return Err(LiftError::syntax(
                    line,
                    format!("Duplicate block {:#x} in `{}`", start, self.func.name),
                ));
            }
        }
        Ok(())
    }

    fn finish(mut self, line: usize) -> Result<Function, LiftError> {
        self.flush_block(line)?;
        if self.func.entry_block().is_none() && self.func.block_count() > 0 {
            warn!(
                "Function has no block at its entry address";
                "func" => &self.func.name,
                "entry" => format_args!("{:#x}", self.func.entry),
            );
        }
        Ok(self.func)
    }
}

/// Lift a listing export into a program on which stack variable recovery can be performed.
pub fn lift_from(listing: &str) -> Result<Program, LiftError> {
    let mut lines = listing
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim_end_matches('\r')))
        .filter(|(_, l)| !l.trim().is_empty())
        .peekable();

    // Header
    match lines.next() {
        Some((_, l)) if l.trim() == "PROGRAM" => {}
        _ => return Err(LiftError::MissingSection("PROGRAM")),
    }
    let mut name: Option<String> = None;
    let mut bits: Option<u32> = None;
    while let Some(&(line, l)) = lines.peek() {
        match l.trim().split_once(' ') {
            Some(("name", n)) => name = Some(n.trim().to_owned()),
            Some(("bits", b)) => {
                bits = Some(b.trim().parse().map_err(|_| {
                    LiftError::syntax(line, format!("Bad bit width `{}`", b.trim()))
                })?)
            }
            _ => break,
        }
        lines.next();
    }
    let bits = bits.ok_or(LiftError::MissingSection("bits"))?;
    let arch: Architecture =
        Architecture::for_bits(bits).ok_or(LiftError::UnsupportedBitWidth(bits))?;
    let mut prog = Program::new(name.unwrap_or_default(), arch);

    // Functions
    let mut current: Option<FunctionBuilder> = None;
    let mut last_line = 0;
    for (line, l) in lines {
        last_line = line;
        if let Some(indented) = l.strip_prefix('\t') {
            let builder = current.as_mut().ok_or_else(|| {
                LiftError::syntax(line, "Indented line outside of a function")
            })?;
            match &mut builder.cursor {
                Cursor::Nothing => {
                    return Err(LiftError::syntax(
                        line,
                        "Indented line outside of a FRAME or BLOCK",
                    ))
                }
                Cursor::FrameMembers => {
                    let member = parse_frame_member(line, indented)?;
                    if let Some(frame) = &mut builder.func.frame {
                        frame.members.push(member);
                    }
                }
                Cursor::Block { instructions, .. } => {
                    instructions.push(parse_instruction(line, indented, &prog.architecture)?);
                }
            }
            continue;
        }

        let l = l.trim();
        let (keyword, rest) = l.split_once(' ').unwrap_or((l, ""));
        match keyword {
            "FUNCTION" => {
                if let Some(b) = current.take() {
                    prog.functions.push(b.finish(line)?);
                }
                let (entry, end, fn_name) = rest
                    .splitn(3, ' ')
                    .collect_tuple()
                    .ok_or_else(|| {
                        LiftError::syntax(line, "Expected `FUNCTION <entry> <end> <name>`")
                    })?;
                current = Some(FunctionBuilder {
                    func: Function::new(
                        fn_name.trim(),
                        hex_field(line, "entry address", entry)?,
                        hex_field(line, "end address", end)?,
                        None,
                    ),
                    cursor: Cursor::Nothing,
                });
            }
            "FRAME" | "NOFRAME" => {
                let builder = current.as_mut().ok_or_else(|| {
                    LiftError::syntax(line, format!("{} outside of a function", keyword))
                })?;
                if builder.func.frame.is_some()
                    || builder.func.block_count() > 0
                    || matches!(builder.cursor, Cursor::Block { .. })
                {
                    return Err(LiftError::syntax(line, format!("Unexpected {}", keyword)));
                }
                if keyword == "FRAME" {
                    builder.func.frame = Some(Frame {
                        locals_size: hex_field(line, "locals size", rest)?,
                        members: vec![],
                    });
                    builder.cursor = Cursor::FrameMembers;
                } else {
                    builder.cursor = Cursor::Nothing;
                }
            }
            "BLOCK" => {
                let builder = current
                    .as_mut()
                    .ok_or_else(|| LiftError::syntax(line, "BLOCK outside of a function"))?;
                builder.flush_block(line)?;
                let (start, succs) = match rest.split_once("->") {
                    Some((s, succs)) => (s, succs),
                    None => (rest, ""),
                };
                let successors = succs
                    .split_whitespace()
                    .map(|s| hex_field(line, "successor", s))
                    .collect::<Result<Vec<u64>, LiftError>>()?;
                builder.cursor = Cursor::Block {
                    start: hex_field(line, "block start", start)?,
                    instructions: vec![],
                    successors,
                };
            }
            _ => {
                return Err(LiftError::syntax(
                    line,
                    format!("Unexpected line `{}`", l),
                ))
            }
        }
    }
    if let Some(b) = current.take() {
        prog.functions.push(b.finish(last_line)?);
    }

    debug!(
        "Lifted listing";
        "program" => &prog.name,
        "arch" => &prog.architecture.name,
        "functions" => prog.functions.len(),
        "blocks" => prog.functions.iter().map(|f| f.block_count()).sum::<usize>(),
    );
    Ok(prog)
}

fn parse_frame_member(line: usize, l: &str) -> Result<FrameMember, LiftError> {
    let mut fields = l.splitn(4, '\t');
    let offset = hex_field(line, "member offset", fields.next().unwrap_or(""))?;
    let size_text = fields.next().unwrap_or("").trim();
    let size = size_text
        .parse::<u64>()
        .map_err(|_| LiftError::syntax(line, format!("Bad member size `{}`", size_text)))?;
    let flags = match fields.next().map(str::trim) {
        None | Some("") | Some("-") => None,
        Some(f) => {
            let f = hex_field(line, "flag word", f)?;
            Some(u32::try_from(f).map_err(|_| {
                LiftError::syntax(line, format!("Flag word {:#x} wider than 32 bits", f))
            })?)
        }
    };
    // Names are taken verbatim; the sentinel members start with a space
    let name = fields.next().filter(|n| !n.is_empty()).map(str::to_owned);
    Ok(FrameMember {
        offset,
        name,
        size,
        flags,
    })
}

fn parse_instruction(line: usize, l: &str, arch: &Architecture) -> Result<Instruction, LiftError> {
    let mut fields = l.splitn(4, '\t');
    let address = hex_field(line, "instruction address", fields.next().unwrap_or(""))?;
    let mnemonic = fields.next().unwrap_or("").trim();
    if mnemonic.is_empty() {
        return Err(LiftError::syntax(line, "Missing mnemonic"));
    }
    let op0 = fields.next().unwrap_or("");
    let op1 = fields.next().unwrap_or("");
    let insn = Instruction::from_text(address, mnemonic, op0, op1, arch);
    insn.try_confirm_valid()
        .map_err(|e| LiftError::syntax(line, e))?;
    Ok(insn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::{MnemonicClass, Operand};
    use indoc::indoc;

    const TWO_FUNCTIONS: &str = indoc! {"
        PROGRAM
        name demo.exe
        bits 32

        FUNCTION 401000 401020 main
        FRAME 8
        \t0\t4\t-\tvar_8
        \t4\t4\t20000400\tvar_4
        \t8\t4\t-\t s
        \tc\t4\t-\t r
        BLOCK 401000 -> 401010 401018
        \t401000\tpush\tebp
        \t401001\tmov\tebp\tesp
        \t401003\tlea\teax\tdword ptr [ebp-8]
        BLOCK 401010 -> 401018
        \t401010\tcall\tsub_401100
        BLOCK 401018
        \t401018\tret

        FUNCTION 401100 401104 sub_401100
        NOFRAME
        BLOCK 401100
        \t401100\tretn
    "};

    #[test]
    fn lifts_functions_frames_and_blocks() {
        let prog = lift_from(TWO_FUNCTIONS).unwrap();
        assert_eq!(prog.name, "demo.exe");
        assert_eq!(prog.architecture.bits, 32);
        assert_eq!(prog.functions.len(), 2);

        let main = &prog.functions[0];
        assert_eq!(main.name, "main");
        assert_eq!((main.entry, main.end), (0x401000, 0x401020));
        let frame = main.frame.as_ref().unwrap();
        assert_eq!(frame.locals_size, 8);
        assert_eq!(frame.members.len(), 4);
        assert_eq!(frame.members[1].flags, Some(0x20000400));
        assert_eq!(frame.members[0].flags, None);
        assert_eq!(frame.saved_frame_pointer_offset(), Some(8));
        assert_eq!(frame.members[3].name.as_deref(), Some(" r"));

        assert_eq!(main.block_count(), 3);
        let entry = main.entry_block().unwrap();
        assert_eq!(entry.successors, vec![0x401010, 0x401018]);
        assert_eq!(entry.instructions[2].class, MnemonicClass::AddressOf);
        assert!(matches!(
            entry.instructions[2].operands[1],
            Operand::FrameMemory { displacement: -8, .. }
        ));
        assert!(main.block(0x401018).unwrap().successors.is_empty());

        let leaf = &prog.functions[1];
        assert!(leaf.frame.is_none());
        assert_eq!(leaf.block_count(), 1);
    }

    #[test]
    fn listing_with_64_bit_width_uses_64_bit_registers() {
        let prog = lift_from(indoc! {"
            PROGRAM
            name a.out
            bits 64

            FUNCTION 1000 1010 f
            NOFRAME
            BLOCK 1000
            \t1000\tmov\trax\tqword ptr [rbp-0x10]
        "})
        .unwrap();
        assert_eq!(prog.architecture.frame_pointer, "rbp");
        let insn = &prog.functions[0].entry_block().unwrap().instructions[0];
        assert!(insn.operands[0].is_register("rax"));
        assert!(matches!(
            insn.operands[1],
            Operand::FrameMemory { displacement: -16, .. }
        ));
    }

    #[test]
    fn header_errors() {
        assert!(matches!(
            lift_from("name x\nbits 32\n"),
            Err(LiftError::MissingSection("PROGRAM"))
        ));
        assert!(matches!(
            lift_from("PROGRAM\nname x\n"),
            Err(LiftError::MissingSection("bits"))
        ));
        assert!(matches!(
            lift_from("PROGRAM\nname x\nbits 16\n"),
            Err(LiftError::UnsupportedBitWidth(16))
        ));
    }

    #[test]
    fn structural_errors_carry_line_numbers() {
        let err = lift_from(indoc! {"
            PROGRAM
            name x
            bits 32

            FUNCTION 1000 1010 f
            BLOCK 1000
            \tzzz\tmov\teax\tebx
        "})
        .unwrap_err();
        assert!(matches!(err, LiftError::Syntax { line: 7, .. }), "{:?}", err);

        let err = lift_from(indoc! {"
            PROGRAM
            bits 32
            BLOCK 1000
        "})
        .unwrap_err();
        assert!(matches!(err, LiftError::Syntax { line: 3, .. }), "{:?}", err);

        let err = lift_from(indoc! {"
            PROGRAM
            bits 32
            FUNCTION 1000 1010 f
            BLOCK 1000
            BLOCK 1000
        "})
        .unwrap_err();
        assert!(matches!(err, LiftError::Syntax { .. }), "{:?}", err);
    }

    #[test]
    fn operand_count_is_validated() {
        let err = lift_from(indoc! {"
            PROGRAM
            bits 32
            FUNCTION 1000 1010 f
            BLOCK 1000
            \t1000\tlea\teax
        "})
        .unwrap_err();
        assert!(matches!(err, LiftError::Syntax { line: 5, .. }), "{:?}", err);
    }
}
