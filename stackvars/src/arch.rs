//! Architecture parameters consumed by frame extraction and taint propagation.
//!
//! These are resolved once per [`Program`](crate::insn::Program) and passed by reference; nothing
//! in the analysis reads them from global state.

use crate::containers::unordered::UnorderedSet;

/// Description of the target architecture, as far as stack-variable recovery cares.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Architecture {
    /// A short human-readable name, e.g. `x86` or `x86_64`
    pub name: String,
    /// Bit width of the machine (32 or 64)
    pub bits: u32,
    /// The frame pointer register (`ebp`/`rbp`)
    pub frame_pointer: String,
    /// The stack pointer register (`esp`/`rsp`)
    pub stack_pointer: String,
    /// Every register name the operand classifier recognizes, including sub-registers.
    pub registers: UnorderedSet<String>,
    /// Registers whose contents are undefined after a call, under the platform's calling
    /// convention.
    pub caller_clobbered: UnorderedSet<String>,
}

fn names(v: &[&str]) -> UnorderedSet<String> {
    v.iter().map(|s| s.to_string()).collect()
}

lazy_static::lazy_static! {
    /// 32-bit x86, cdecl-style clobbers
    pub static ref X86: Architecture = Architecture {
        name: "x86".into(),
        bits: 32,
        frame_pointer: "ebp".into(),
        stack_pointer: "esp".into(),
        registers: names(&[
            "eax", "ebx", "ecx", "edx", "esi", "edi", "ebp", "esp",
            "ax", "bx", "cx", "dx", "si", "di", "bp", "sp",
            "al", "ah", "bl", "bh", "cl", "ch", "dl", "dh",
        ]),
        caller_clobbered: names(&[
            "eax", "ecx", "edx",
            "ax", "cx", "dx",
            "al", "ah", "cl", "ch", "dl", "dh",
        ]),
    };

    /// 64-bit x86, System V clobbers
    pub static ref X86_64: Architecture = Architecture {
        name: "x86_64".into(),
        bits: 64,
        frame_pointer: "rbp".into(),
        stack_pointer: "rsp".into(),
        registers: {
            let mut r = names(&[
                "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "rip",
                "eax", "ebx", "ecx", "edx", "esi", "edi", "ebp", "esp",
                "ax", "bx", "cx", "dx", "si", "di", "bp", "sp",
                "al", "ah", "bl", "bh", "cl", "ch", "dl", "dh", "sil", "dil", "bpl", "spl",
            ]);
            for n in 8..16 {
                r.extend([
                    format!("r{}", n),
                    format!("r{}d", n),
                    format!("r{}w", n),
                    format!("r{}b", n),
                ]);
            }
            r
        },
        caller_clobbered: {
            let mut r = names(&[
                "rax", "rcx", "rdx", "rsi", "rdi",
                "eax", "ecx", "edx", "esi", "edi",
                "ax", "cx", "dx", "si", "di",
                "al", "ah", "cl", "ch", "dl", "dh", "sil", "dil",
            ]);
            for n in 8..12 {
                r.extend([
                    format!("r{}", n),
                    format!("r{}d", n),
                    format!("r{}w", n),
                    format!("r{}b", n),
                ]);
            }
            r
        },
    };
}

impl Architecture {
    /// The preset architecture for a machine of the given bit width, if one exists
    pub fn for_bits(bits: u32) -> Option<Architecture> {
        match bits {
            32 => Some(X86.clone()),
            64 => Some(X86_64.clone()),
            _ => None,
        }
    }

    /// Size of a machine word in bytes
    pub fn word_size(&self) -> i64 {
        i64::from(self.bits / 8)
    }

    pub fn is_register(&self, name: &str) -> bool {
        self.registers.contains(name)
    }

    pub fn is_frame_or_stack_pointer(&self, name: &str) -> bool {
        name == self.frame_pointer || name == self.stack_pointer
    }

    /// Reinterpret `val` as a two's complement value of the machine's bit width. Disassemblers
    /// frequently render negative displacements as large unsigned numbers (e.g., `0xfffffff8`
    /// for `-8` on a 32-bit machine).
    pub fn signed_from_unsigned(&self, val: u64) -> i64 {
        if self.bits >= 64 {
            val as i64
        } else {
            let bits = self.bits;
            let masked = val & ((1u64 << bits) - 1);
            if masked & (1u64 << (bits - 1)) != 0 {
                masked as i64 - (1i64 << bits)
            } else {
                masked as i64
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_conversion_respects_width() {
        let x86 = Architecture::for_bits(32).unwrap();
        assert_eq!(x86.signed_from_unsigned(0xffff_fff8), -8);
        assert_eq!(x86.signed_from_unsigned(0x10), 16);
        let x64 = Architecture::for_bits(64).unwrap();
        assert_eq!(x64.signed_from_unsigned(0xffff_ffff_ffff_fff0), -16);
        assert_eq!(x64.signed_from_unsigned(0xffff_fff8), 0xffff_fff8);
    }

    #[test]
    fn presets() {
        assert!(Architecture::for_bits(16).is_none());
        assert!(X86.is_frame_or_stack_pointer("esp"));
        assert!(X86_64.is_register("r10d"));
        assert!(!X86.caller_clobbered.contains("ebx"));
        assert!(!X86_64.caller_clobbered.contains("ebx"));
        assert!(!X86_64.caller_clobbered.contains("r12d"));
    }

    #[test]
    fn clobbers_cover_sub_registers() {
        for arch in [&*X86, &*X86_64] {
            for reg in arch.caller_clobbered.iter() {
                assert!(arch.is_register(reg), "{} on {}", reg, arch.name);
            }
        }
        for reg in ["ax", "al", "cx", "dh"] {
            assert!(X86.caller_clobbered.contains(reg));
        }
        for reg in ["eax", "edi", "r8d", "r11b", "sil"] {
            assert!(X86_64.caller_clobbered.contains(reg));
        }
        assert_eq!(X86_64.word_size(), 8);
    }
}
