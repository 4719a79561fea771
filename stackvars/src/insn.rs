//! Typed view of disassembled functions: operands, instructions, basic blocks, and the
//! control-flow graph that the taint-propagation engine walks.
//!
//! Nothing in here decodes machine code. The front end (see
//! [`listing_lifter`](crate::listing_lifter)) hands over already-disassembled text, and this
//! module only classifies it.

use crate::arch::Architecture;
use crate::containers::unordered::UnorderedMap;
use crate::frame::Frame;

/// An operand of an [`Instruction`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operand {
    /// An operand slot that the instruction does not use.
    // Note: We use this rather than an `Option<Operand>` at every use case to keep pattern
    // matching cleaner.
    Unused,
    /// A register, by its (lowercase) name
    Register { name: String },
    /// Memory addressed purely off the frame pointer, e.g. `[ebp-8]`
    FrameMemory { token: String, displacement: i64 },
    /// Memory addressed purely off the stack pointer, e.g. `[esp+4]`
    StackMemory { token: String, displacement: i64 },
    /// Any other memory reference (indexed, off a general-purpose register, absolute)
    OtherMemory {
        token: String,
        base: Option<String>,
        displacement: i64,
    },
    /// An immediate value
    Immediate { text: String, value: i64 },
    /// Anything the classifier could not make sense of (labels, `offset foo`, ...)
    Other { text: String },
}

impl Operand {
    /// The identifying token of the operand. Operands compare equal for taint-tracking purposes
    /// iff their tokens are equal.
    pub fn token(&self) -> &str {
        match self {
            Operand::Unused => "",
            Operand::Register { name } => name,
            Operand::FrameMemory { token, .. }
            | Operand::StackMemory { token, .. }
            | Operand::OtherMemory { token, .. } => token,
            Operand::Immediate { text, .. } | Operand::Other { text } => text,
        }
    }

    pub fn is_used(&self) -> bool {
        !matches!(self, Operand::Unused)
    }

    /// Is this a frame-pointer or stack-pointer relative memory reference?
    pub fn is_stack_relative(&self) -> bool {
        matches!(
            self,
            Operand::FrameMemory { .. } | Operand::StackMemory { .. }
        )
    }

    /// Is this the register `name`?
    pub fn is_register(&self, name: &str) -> bool {
        matches!(self, Operand::Register { name: n } if n == name)
    }

    /// An unclassifiable operand that nonetheless looks like a memory reference. These are the
    /// ones worth reporting, since a label or an `offset` expression is expected to end up as
    /// [`Operand::Other`].
    pub fn looks_like_malformed_memory(&self) -> bool {
        matches!(self, Operand::Other { text } if text.contains('['))
    }

    /// Classify the disassembler's textual rendering of an operand.
    pub fn parse(text: &str, arch: &Architecture) -> Operand {
        let t = text.trim().to_ascii_lowercase();
        if t.is_empty() {
            return Operand::Unused;
        }
        if arch.is_register(&t) {
            return Operand::Register { name: t };
        }
        if let Some(value) = parse_number(&t, arch) {
            return Operand::Immediate { text: t, value };
        }
        if let Some(open) = t.find('[') {
            if let Some(op) = parse_memory(&t[..open], &t[open..], arch) {
                return op;
            }
        }
        Operand::Other { text: t }
    }
}

impl std::fmt::Debug for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        use Operand::*;
        match self {
            Unused => write!(f, "Unused"),
            Register { name } => write!(f, "Reg({})", name),
            FrameMemory {
                token,
                displacement,
            } => write!(f, "FrameMem{{{}, disp={}}}", token, displacement),
            StackMemory {
                token,
                displacement,
            } => write!(f, "StackMem{{{}, disp={}}}", token, displacement),
            OtherMemory {
                token,
                base,
                displacement,
            } => write!(
                f,
                "Mem{{{}, base={:?}, disp={}}}",
                token, base, displacement
            ),
            Immediate { value, .. } => {
                if f.alternate() {
                    write!(f, "${:#x}", value)
                } else {
                    write!(f, "${}", value)
                }
            }
            Other { text } => write!(f, "Other({})", text),
        }
    }
}

/// Parse a numeric literal in any of the forms disassemblers like to print: `12`, `-4`, `0x10`,
/// `10h`, `0FFFFFFF8h`. Values are reinterpreted at the architecture's bit width, so an
/// unsigned-rendered negative comes back negative.
pub fn parse_number(s: &str, arch: &Architecture) -> Option<i64> {
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if s.is_empty() {
        return None;
    }
    let magnitude = if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()?
    } else if let Some(hex) = s.strip_suffix('h') {
        if !hex.starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }
        u64::from_str_radix(hex, 16).ok()?
    } else if s.chars().all(|c| c.is_ascii_digit()) {
        s.parse::<u64>().ok()?
    } else {
        return None;
    };
    let value = arch.signed_from_unsigned(magnitude);
    Some(if negative { value.wrapping_neg() } else { value })
}

/// Size and segment decorations that may precede a bracketed memory reference.
const MEMORY_PREFIX_WORDS: &[&str] = &[
    "byte", "word", "dword", "qword", "tbyte", "xmmword", "ymmword", "zmmword", "ptr", "near",
    "far",
];

fn parse_memory(prefix: &str, bracketed: &str, arch: &Architecture) -> Option<Operand> {
    for word in prefix.split_whitespace() {
        let is_segment = word.len() == 3 && word.ends_with(':');
        if !is_segment && !MEMORY_PREFIX_WORDS.contains(&word) {
            return None;
        }
    }
    let inner = bracketed.strip_prefix('[')?.strip_suffix(']')?;

    let mut bases: Vec<String> = vec![];
    let mut index: Option<String> = None;
    let mut displacement: i64 = 0;

    let mut terms: Vec<(bool, String)> = vec![];
    let mut current = String::new();
    let mut negative = false;
    for c in inner.chars().filter(|c| !c.is_whitespace()) {
        if c == '+' || c == '-' {
            if !current.is_empty() {
                terms.push((negative, std::mem::take(&mut current)));
            } else if !terms.is_empty() {
                // Two operators in a row
                return None;
            }
            negative = c == '-';
        } else {
            current.push(c);
        }
    }
    if current.is_empty() {
        return None;
    }
    terms.push((negative, current));

    for (negative, term) in terms {
        if let Some((a, b)) = term.split_once('*') {
            let (reg, scale) = if arch.is_register(a) { (a, b) } else { (b, a) };
            if negative || index.is_some() || !arch.is_register(reg) {
                return None;
            }
            parse_number(scale, arch)?;
            index = Some(format!("{}*{}", reg, scale));
        } else if arch.is_register(&term) {
            if negative {
                return None;
            }
            bases.push(term);
        } else {
            let v = parse_number(&term, arch)?;
            displacement = if negative {
                displacement.wrapping_sub(v)
            } else {
                displacement.wrapping_add(v)
            };
        }
    }

    let token = {
        let mut t = String::from("[");
        t.push_str(
            &bases
                .iter()
                .cloned()
                .chain(index.iter().cloned())
                .collect::<Vec<_>>()
                .join("+"),
        );
        if displacement != 0 || t.len() == 1 {
            if t.len() == 1 {
                t.push_str(&displacement.to_string());
            } else {
                t.push_str(&format!("{:+}", displacement));
            }
        }
        t.push(']');
        t
    };

    Some(match (&bases[..], &index) {
        ([base], None) if *base == arch.frame_pointer => Operand::FrameMemory {
            token,
            displacement,
        },
        ([base], None) if *base == arch.stack_pointer => Operand::StackMemory {
            token,
            displacement,
        },
        _ => Operand::OtherMemory {
            token,
            base: bases.first().cloned(),
            displacement,
        },
    })
}

/// How the propagation engine dispatches on an instruction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum MnemonicClass {
    /// Load the address of `input1` into `input0` (`lea`)
    AddressOf,
    /// A move, load, or store from `input1` into `input0`
    Move,
    /// A call, or an indirect branch, to `input0`
    Call,
    /// `sub`; a stack adjustment when `input0` is the stack pointer
    StackAdjustSubtract,
    /// `add`; a stack adjustment when `input0` is the stack pointer
    StackAdjustAdd,
    /// `push`; `input0` is a source
    StackAdjustPush,
    /// `pop`; `input0` is a destination
    StackAdjustPop,
    /// A comparison that reads both operands and writes neither
    Compare,
    /// Anything else
    Other,
}

impl MnemonicClass {
    /// Classify `mnemonic`. The first operand is needed to tell indirect from direct jumps.
    pub fn classify(mnemonic: &str, operand0: &Operand) -> Self {
        match mnemonic {
            "lea" => MnemonicClass::AddressOf,
            "mov" | "movzx" | "movsx" | "movsxd" => MnemonicClass::Move,
            "call" => MnemonicClass::Call,
            "jmp" => match operand0 {
                Operand::Register { .. }
                | Operand::FrameMemory { .. }
                | Operand::StackMemory { .. }
                | Operand::OtherMemory { .. } => MnemonicClass::Call,
                _ => MnemonicClass::Other,
            },
            "sub" => MnemonicClass::StackAdjustSubtract,
            "add" => MnemonicClass::StackAdjustAdd,
            "push" => MnemonicClass::StackAdjustPush,
            "pop" => MnemonicClass::StackAdjustPop,
            "cmp" | "test" => MnemonicClass::Compare,
            _ => MnemonicClass::Other,
        }
    }

    /// Whether `input0` is overwritten by instructions of this class
    pub fn writes_operand0(&self) -> bool {
        !matches!(
            self,
            MnemonicClass::Call | MnemonicClass::StackAdjustPush | MnemonicClass::Compare
        )
    }
}

/// A single disassembled instruction.
#[derive(Clone, PartialEq, Eq)]
pub struct Instruction {
    /// The machine address of the instruction
    pub address: u64,
    /// The mnemonic, lowercased
    pub mnemonic: String,
    /// Dispatch class, derived from the mnemonic
    pub class: MnemonicClass,
    /// The operands. Any unused operands must be set to [`Operand::Unused`].
    pub operands: [Operand; 2],
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Instruction {{ addr: {:#x}, mnem: {}, class: {:?}, operands: {:?} }}",
            self.address, self.mnemonic, self.class, self.operands
        )
    }
}

impl Instruction {
    /// A new instruction, classified by its mnemonic
    pub fn new(address: u64, mnemonic: &str, operands: [Operand; 2]) -> Self {
        let mnemonic = mnemonic.trim().to_ascii_lowercase();
        let class = MnemonicClass::classify(&mnemonic, &operands[0]);
        Self {
            address,
            mnemonic,
            class,
            operands,
        }
    }

    /// Parse both operands from text and build the instruction
    pub fn from_text(
        address: u64,
        mnemonic: &str,
        operand0: &str,
        operand1: &str,
        arch: &Architecture,
    ) -> Self {
        Self::new(
            address,
            mnemonic,
            [
                Operand::parse(operand0, arch),
                Operand::parse(operand1, arch),
            ],
        )
    }

    /// Confirms the operand shape is what the instruction's class requires.
    pub fn try_confirm_valid(&self) -> Result<(), String> {
        let [op0, op1] = &self.operands;
        if !op0.is_used() && op1.is_used() {
            return Err(format!(
                "Second operand {:?} given without a first one. Address: {:#x}.",
                op1, self.address
            ));
        }
        let expected_operands = match self.class {
            MnemonicClass::AddressOf
            | MnemonicClass::Move
            | MnemonicClass::StackAdjustSubtract
            | MnemonicClass::StackAdjustAdd
            | MnemonicClass::Compare => 2,
            MnemonicClass::Call | MnemonicClass::StackAdjustPush | MnemonicClass::StackAdjustPop => {
                1
            }
            MnemonicClass::Other => return Ok(()),
        };
        let got = self.operands.iter().filter(|o| o.is_used()).count();
        if got != expected_operands {
            return Err(format!(
                "Got {} operands for `{}` ({:?}). Expected {}. Address: {:#x}.",
                got, self.mnemonic, self.class, expected_operands, self.address
            ));
        }
        Ok(())
    }
}

/// A basic block: straight-line instructions with outgoing edges at the end.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicBlock {
    /// Address of the first instruction; also the block's key within its function
    pub start: u64,
    pub instructions: Vec<Instruction>,
    /// Start addresses of successor blocks, in the order the front end listed them
    pub successors: Vec<u64>,
}

impl BasicBlock {
    pub fn new(start: u64, instructions: Vec<Instruction>, successors: Vec<u64>) -> Self {
        let mut seen = Vec::with_capacity(successors.len());
        for s in successors {
            if !seen.contains(&s) {
                seen.push(s);
            }
        }
        Self {
            start,
            instructions,
            successors: seen,
        }
    }
}

/// A function, with its stack frame metadata and its control-flow graph. Blocks live in an arena
/// keyed by start address; edges refer to blocks by address rather than by pointer.
#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    /// Entry address; the entry block starts here
    pub entry: u64,
    /// Address one past the last instruction of the function
    pub end: u64,
    /// Declared stack frame, or `None` for frameless (leaf/thunk) functions
    pub frame: Option<Frame>,
    blocks: UnorderedMap<u64, BasicBlock>,
}

impl Function {
    /// A new function with no blocks yet
    pub fn new(name: impl Into<String>, entry: u64, end: u64, frame: Option<Frame>) -> Self {
        Self {
            name: name.into(),
            entry,
            end,
            frame,
            blocks: Default::default(),
        }
    }

    /// Add `block` to the function. Returns the previous block with the same start address, if
    /// there was one.
    pub fn add_block(&mut self, block: BasicBlock) -> Option<BasicBlock> {
        self.blocks.insert(block.start, block)
    }

    pub fn block(&self, start: u64) -> Option<&BasicBlock> {
        self.blocks.get(&start)
    }

    pub fn entry_block(&self) -> Option<&BasicBlock> {
        self.block(self.entry)
    }

    /// All blocks, sorted by start address
    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        let mut v: Vec<&BasicBlock> = self.blocks.values().collect();
        v.sort_by_key(|b| b.start);
        v.into_iter()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

/// The whole program handed over by the front end
#[derive(Clone, Debug)]
pub struct Program {
    pub name: String,
    pub architecture: Architecture,
    pub functions: Vec<Function>,
}

impl Program {
    pub fn new(name: impl Into<String>, architecture: Architecture) -> Self {
        Self {
            name: name.into(),
            architecture,
            functions: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{X86, X86_64};

    #[test]
    fn operand_classification() {
        let a = &*X86;
        assert_eq!(
            Operand::parse("EAX", a),
            Operand::Register { name: "eax".into() }
        );
        assert_eq!(
            Operand::parse("dword ptr [ebp-8]", a),
            Operand::FrameMemory {
                token: "[ebp-8]".into(),
                displacement: -8
            }
        );
        assert_eq!(
            Operand::parse("ss:[esp + 0x4]", a),
            Operand::StackMemory {
                token: "[esp+4]".into(),
                displacement: 4
            }
        );
        assert_eq!(
            Operand::parse("[ebp+0FFFFFFF8h]", a),
            Operand::parse("[ebp-8]", a)
        );
        assert!(matches!(
            Operand::parse("[ebp+ecx*4-8]", a),
            Operand::OtherMemory { base: Some(ref b), displacement: -8, .. } if b == "ebp"
        ));
        assert!(matches!(
            Operand::parse("10h", a),
            Operand::Immediate { value: 16, .. }
        ));
        assert!(matches!(Operand::parse("sub_401000", a), Operand::Other { .. }));
        assert!(Operand::parse("[ebp+var_8]", a).looks_like_malformed_memory());
        assert_eq!(Operand::parse("  ", a), Operand::Unused);
    }

    #[test]
    fn absolute_memory_token() {
        let op = Operand::parse("ds:[0x404000]", &X86_64);
        assert_eq!(op.token(), "[4210688]");
        assert!(!op.is_stack_relative());
    }

    #[test]
    fn jump_classification_depends_on_target() {
        let a = &*X86;
        let direct = Instruction::from_text(0, "jmp", "loc_401020", "", a);
        let indirect = Instruction::from_text(0, "jmp", "eax", "", a);
        assert_eq!(direct.class, MnemonicClass::Other);
        assert_eq!(indirect.class, MnemonicClass::Call);
        assert!(!indirect.class.writes_operand0());
    }

    #[test]
    fn operand_count_validation() {
        let a = &*X86;
        assert!(Instruction::from_text(0, "lea", "eax", "[ebp-8]", a)
            .try_confirm_valid()
            .is_ok());
        assert!(Instruction::from_text(0, "lea", "eax", "", a)
            .try_confirm_valid()
            .is_err());
        assert!(Instruction::from_text(0, "ret", "", "", a)
            .try_confirm_valid()
            .is_ok());
    }

    #[test]
    fn successors_are_deduplicated_in_order() {
        let b = BasicBlock::new(0, vec![], vec![3, 1, 3, 2]);
        assert_eq!(b.successors, vec![3, 1, 2]);
    }
}
