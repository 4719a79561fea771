//! Decode a frame member's raw flag word into the disassembler's symbolic flag names.

use crate::containers::unordered::UnorderedSet;

/// A field of the flag word whose masked value is an enumeration: exactly one entry matches.
struct EnumeratedField {
    mask: u32,
    values: &'static [(u32, &'static str)],
}

impl EnumeratedField {
    fn decode(&self, flags: u32) -> Option<&'static str> {
        let v = flags & self.mask;
        self.values
            .iter()
            .find(|(value, _)| *value == v)
            .map(|(_, name)| *name)
    }
}

const CLASS: EnumeratedField = EnumeratedField {
    mask: 0x600,
    values: &[
        (0x600, "FF_CODE"),
        (0x400, "FF_DATA"),
        (0x200, "FF_TAIL"),
        (0x000, "FF_UNK"),
    ],
};

/// Independent bits; any number may be set.
const COMMON_BITS: &[(u32, &str)] = &[
    (0x800, "FF_COMM"),
    (0x1000, "FF_REF"),
    (0x2000, "FF_LINE"),
    (0x4000, "FF_NAME"),
    (0x8000, "FF_LABL"),
    (0x10000, "FF_FLOW"),
    (0x80000, "FF_VAR"),
];

const OPERAND0_TYPE: EnumeratedField = EnumeratedField {
    mask: 0xF00000,
    values: &[
        (0x100000, "FF_0NUMH"),
        (0x200000, "FF_0NUMD"),
        (0x300000, "FF_0CHAR"),
        (0x400000, "FF_0SEG"),
        (0x500000, "FF_0OFF"),
        (0x600000, "FF_0NUMB"),
        (0x700000, "FF_0NUMO"),
        (0x800000, "FF_0ENUM"),
        (0x900000, "FF_0FOP"),
        (0xA00000, "FF_0STRO"),
        (0xB00000, "FF_0STK"),
    ],
};

const OPERAND1_TYPE: EnumeratedField = EnumeratedField {
    mask: 0xF000000,
    values: &[
        (0x1000000, "FF_1NUMH"),
        (0x2000000, "FF_1NUMD"),
        (0x3000000, "FF_1CHAR"),
        (0x4000000, "FF_1SEG"),
        (0x5000000, "FF_1OFF"),
        (0x6000000, "FF_1NUMB"),
        (0x7000000, "FF_1NUMO"),
        (0x8000000, "FF_1ENUM"),
        (0x9000000, "FF_1FOP"),
        (0xA000000, "FF_1STRO"),
        (0xB000000, "FF_1STK"),
    ],
};

const DATA_TYPE: EnumeratedField = EnumeratedField {
    mask: 0xF0000000,
    values: &[
        (0x00000000, "FF_BYTE"),
        (0x10000000, "FF_WORD"),
        (0x20000000, "FF_DWRD"),
        (0x30000000, "FF_QWRD"),
        (0x40000000, "FF_TBYT"),
        (0x50000000, "FF_ASCI"),
        (0x60000000, "FF_STRU"),
        (0x70000000, "FF_OWRD"),
        (0x80000000, "FF_FLOAT"),
        (0x90000000, "FF_DOUBLE"),
        (0xA0000000, "FF_PACKREAL"),
        (0xB0000000, "FF_ALIGN"),
    ],
};

/// Data-type flag marking a member as a struct. Struct-typed members are recovered as a single
/// opaque variable.
pub const STRUCT_FLAG: &str = "FF_STRU";

/// Decode `flags` into symbolic names. `None` (no flag word available) decodes to nothing.
pub fn decode(flags: Option<u32>) -> UnorderedSet<&'static str> {
    let flags = match flags {
        Some(f) => f,
        None => return Default::default(),
    };
    let mut res: UnorderedSet<&'static str> = Default::default();
    res.extend(CLASS.decode(flags));
    res.extend(
        COMMON_BITS
            .iter()
            .filter(|(bit, _)| flags & bit != 0)
            .map(|(_, name)| *name),
    );
    res.extend(OPERAND0_TYPE.decode(flags));
    res.extend(OPERAND1_TYPE.decode(flags));
    res.extend(DATA_TYPE.decode(flags));
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(s: UnorderedSet<&'static str>) -> Vec<&'static str> {
        let mut v: Vec<_> = s.into_iter().collect();
        v.sort_unstable();
        v
    }

    #[test]
    fn dword_data() {
        assert_eq!(sorted(decode(Some(0x20000400))), vec!["FF_DATA", "FF_DWRD"]);
    }

    #[test]
    fn pointer_to_stack_with_name() {
        assert_eq!(
            sorted(decode(Some(0x20000400 | 0x4000 | 0x1000 | 0xB00000))),
            vec!["FF_0STK", "FF_DATA", "FF_DWRD", "FF_NAME", "FF_REF"]
        );
    }

    #[test]
    fn zero_word_is_unknown_byte() {
        assert_eq!(sorted(decode(Some(0))), vec!["FF_BYTE", "FF_UNK"]);
    }

    #[test]
    fn missing_word_is_empty() {
        assert!(decode(None).is_empty());
    }

    #[test]
    fn unassigned_enumeration_values_are_ignored() {
        // 0xC in the data type nibble has no name
        assert_eq!(sorted(decode(Some(0xC0000400))), vec!["FF_DATA"]);
    }
}
