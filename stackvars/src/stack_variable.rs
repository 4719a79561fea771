//! Recovered stack variables and their usage annotations.

use crate::containers::unordered::{UnorderedMap, UnorderedSet};

/// A flag on a [`StackVariable`]: either declared in the frame metadata, or synthesized by the
/// propagation engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum VariableFlag {
    /// A symbolic flag decoded from the frame member's flag word (see
    /// [`frame_flags`](crate::frame_flags))
    Declared(&'static str),
    /// The variable holds the address of another stack variable
    LocalReferer,
    /// The variable's value is used as an indirect call/branch target
    CodePtr,
}

impl std::fmt::Display for VariableFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            VariableFlag::Declared(name) => write!(f, "{}", name),
            VariableFlag::LocalReferer => write!(f, "LOCAL_REFERER"),
            VariableFlag::CodePtr => write!(f, "CODE_PTR"),
        }
    }
}

/// A stack-resident variable, keyed by its canonical (frame-pointer relative) offset.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StackVariable {
    /// Canonical offset; unique within the owning function
    pub offset: i64,
    pub name: String,
    pub size: u64,
    pub flags: UnorderedSet<VariableFlag>,
    /// Addresses of instructions that write to the variable
    pub writes: UnorderedSet<u64>,
    /// Addresses of instructions that read from the variable
    pub reads: UnorderedSet<u64>,
    /// Canonical offsets of the stack variables whose addresses this variable holds
    pub referents: UnorderedSet<i64>,
}

impl StackVariable {
    /// A freshly extracted variable, with no observed usage
    pub fn new(
        offset: i64,
        name: impl Into<String>,
        size: u64,
        declared_flags: impl IntoIterator<Item = &'static str>,
    ) -> Self {
        Self {
            offset,
            name: name.into(),
            size,
            flags: declared_flags
                .into_iter()
                .map(VariableFlag::Declared)
                .collect(),
            writes: Default::default(),
            reads: Default::default(),
            referents: Default::default(),
        }
    }

    pub fn has_flag(&self, flag: VariableFlag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn sorted_flags(&self) -> Vec<VariableFlag> {
        sorted(&self.flags)
    }

    pub fn sorted_writes(&self) -> Vec<u64> {
        sorted(&self.writes)
    }

    pub fn sorted_reads(&self) -> Vec<u64> {
        sorted(&self.reads)
    }

    pub fn sorted_referents(&self) -> Vec<i64> {
        sorted(&self.referents)
    }
}

fn sorted<T: Ord + Copy + std::hash::Hash>(s: &UnorderedSet<T>) -> Vec<T> {
    let mut v: Vec<T> = s.iter().copied().collect();
    v.sort_unstable();
    v
}

/// All stack variables of one function, keyed by canonical offset.
pub type StackVariables = UnorderedMap<i64, StackVariable>;
