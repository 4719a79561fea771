//! Stack frame metadata, and extraction of the initial stack-variable table from it.

use crate::frame_flags;
use crate::insn::Function;
use crate::log::*;
use crate::stack_variable::{StackVariable, StackVariables};

/// Name of the sentinel member holding the saved frame pointer. Its offset defines canonical
/// offset 0.
pub const SAVED_FRAME_POINTER: &str = " s";
/// Name of the sentinel member holding the return address.
pub const RETURN_ADDRESS: &str = " r";

/// A member of a function's declared stack frame, as the disassembler reports it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameMember {
    /// Raw offset from the start of the frame structure
    pub offset: u64,
    /// Declared name; `None` for layout gaps
    pub name: Option<String>,
    pub size: u64,
    /// Raw flag word, if the disassembler provided one
    pub flags: Option<u32>,
}

/// A function's declared stack frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Size of the local-variable area
    pub locals_size: u64,
    pub members: Vec<FrameMember>,
}

impl Frame {
    /// Raw offset of the saved-frame-pointer sentinel, if present
    pub fn saved_frame_pointer_offset(&self) -> Option<u64> {
        self.members
            .iter()
            .find(|m| m.name.as_deref() == Some(SAVED_FRAME_POINTER))
            .map(|m| m.offset)
    }
}

/// Enumerate the declared members of `func`'s frame into stack variables keyed by canonical
/// offset (raw offset minus the saved-frame-pointer sentinel's offset, so that `[ebp-4]` refers
/// to canonical offset `-4`).
///
/// Gaps and the two sentinel members are skipped. A function without a frame yields an empty
/// table; that is normal for leaf functions and thunks.
pub fn extract_stack_variables(func: &Function) -> StackVariables {
    let mut vars = StackVariables::new();
    let frame = match &func.frame {
        Some(frame) => frame,
        None => return vars,
    };

    let delta = frame.saved_frame_pointer_offset().unwrap_or_else(|| {
        debug!(
            "No saved frame pointer member found. Assuming raw offsets are canonical.";
            "func" => &func.name,
        );
        0
    });

    let mut members: Vec<&FrameMember> = frame.members.iter().collect();
    members.sort_by_key(|m| m.offset);

    for member in members {
        let name = match member.name.as_deref() {
            None | Some("") => continue,
            Some(SAVED_FRAME_POINTER) | Some(RETURN_ADDRESS) => continue,
            Some(name) => name,
        };
        let offset = match i64::try_from(member.offset)
            .ok()
            .zip(i64::try_from(delta).ok())
            .and_then(|(raw, delta)| raw.checked_sub(delta))
        {
            Some(offset) => offset,
            None => {
                warn!(
                    "Frame member offset out of range. Skipping.";
                    "func" => &func.name,
                    "member" => name,
                    "raw_offset" => format_args!("{:#x}", member.offset),
                );
                continue;
            }
        };
        let flags = frame_flags::decode(member.flags);
        if flags.contains(frame_flags::STRUCT_FLAG) {
            trace!(
                "Struct-typed frame member kept as a single variable";
                "func" => &func.name,
                "member" => name,
            );
        }
        if let Some(prev) = vars.get(&offset) {
            warn!(
                "Frame members share a canonical offset. Keeping the first.";
                "func" => &func.name,
                "offset" => offset,
                "kept" => &prev.name,
                "dropped" => name,
            );
            continue;
        }
        vars.insert(offset, StackVariable::new(offset, name, member.size, flags));
    }

    vars
}
