//! Intraprocedural taint propagation over a function's control-flow graph.
//!
//! Each traversal path carries a [`PathState`]: which operands currently hold the _address_ of a
//! stack slot (referers), which hold a _value loaded from_ a stack slot (dereferences), and the
//! path's [`ShadowDisplacement`]. Walking the instructions updates that state, and annotates the
//! function's [`StackVariables`] with reads, writes, referents and synthesized flags.

use std::collections::VecDeque;

use crate::analysis_config::{AnalysisConfig, TraversalMode};
use crate::arch::Architecture;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::error::Anomaly;
use crate::insn::{BasicBlock, Function, Instruction, MnemonicClass, Operand};
use crate::log::*;
use crate::shadow::ShadowDisplacement;
use crate::stack_variable::{StackVariables, VariableFlag};

/// A set of canonical stack offsets. With [`TraversalMode::FirstPathWins`], every such set in a
/// [`PathState`] is a singleton; only joins at merge points can grow them.
pub type Offsets = UnorderedSet<i64>;

/// Taint state of one traversal path. Forking a path is a deep copy ([`Clone`]); sibling paths
/// never observe each other's updates.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct PathState {
    /// Operand token → offsets of the stack slots whose address it holds
    pub referers: UnorderedMap<String, Offsets>,
    /// Operand token → offsets of the stack slots whose value it holds
    pub dereferences: UnorderedMap<String, Offsets>,
    pub shadow: ShadowDisplacement,
}

impl PathState {
    /// Drop whatever is known about `token`
    pub fn forget(&mut self, token: &str) {
        self.referers.remove(token);
        self.dereferences.remove(token);
    }

    /// Is anything known about `token`?
    pub fn is_tainted(&self, token: &str) -> bool {
        self.referers.contains_key(token) || self.dereferences.contains_key(token)
    }

    /// Join with the state arriving over another edge (set union per token). Returns `true` if
    /// `self` changed.
    pub fn join_from(&mut self, other: &Self) -> bool {
        fn join_maps(
            this: &mut UnorderedMap<String, Offsets>,
            other: &UnorderedMap<String, Offsets>,
        ) -> bool {
            let mut changed = false;
            for (token, offsets) in other.iter() {
                match this.get_mut(token) {
                    Some(mine) => {
                        if !offsets.is_subset(mine) {
                            mine.extend(offsets);
                            changed = true;
                        }
                    }
                    None => {
                        this.insert(token.clone(), offsets.clone());
                        changed = true;
                    }
                }
            }
            changed
        }
        let mut changed = join_maps(&mut self.referers, &other.referers);
        changed |= join_maps(&mut self.dereferences, &other.dereferences);
        changed |= self.shadow.join_from(&other.shadow);
        changed
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Access {
    Read,
    Write,
}

/// The propagation engine for a single function. Holds the only mutable reference to the
/// function's stack variables for the duration of the walk.
pub struct Propagation<'a> {
    func_name: &'a str,
    arch: &'a Architecture,
    config: &'a AnalysisConfig,
    vars: &'a mut StackVariables,
    anomalies: UnorderedSet<Anomaly>,
}

impl<'a> Propagation<'a> {
    pub fn new(
        func_name: &'a str,
        arch: &'a Architecture,
        config: &'a AnalysisConfig,
        vars: &'a mut StackVariables,
    ) -> Self {
        Self {
            func_name,
            arch,
            config,
            vars,
            anomalies: Default::default(),
        }
    }

    /// Anomalies observed so far, in a stable order
    pub fn into_anomalies(self) -> Vec<Anomaly> {
        let mut v: Vec<Anomaly> = self.anomalies.into_iter().collect();
        v.sort();
        v
    }

    fn anomaly(&mut self, a: Anomaly) {
        trace!("Anomaly"; "func" => self.func_name, "anomaly" => %a);
        self.anomalies.insert(a);
    }

    /// The canonical offset a frame/stack relative operand refers to on the current path, if it
    /// can be determined.
    pub fn canonical_offset(&self, op: &Operand, state: &PathState) -> Option<i64> {
        match op {
            Operand::FrameMemory { displacement, .. } => Some(*displacement),
            Operand::StackMemory { displacement, .. } => {
                if self.config.track_shadow_displacement {
                    state.shadow.resolve(*displacement)
                } else {
                    Some(*displacement)
                }
            }
            _ => None,
        }
    }

    /// Record that the instruction at `address` reads or writes `op`, if `op` is a stack
    /// variable.
    fn record_access(&mut self, address: u64, op: &Operand, state: &PathState, access: Access) {
        if !op.is_stack_relative() {
            return;
        }
        let offset = match self.canonical_offset(op, state) {
            Some(offset) => offset,
            None => {
                trace!(
                    "Stack pointer relative access with unknown shadow displacement";
                    "func" => self.func_name,
                    "addr" => format_args!("{:#x}", address),
                    "op" => ?op,
                );
                return;
            }
        };
        match self.vars.get_mut(&offset) {
            Some(var) => {
                match access {
                    Access::Read => var.reads.insert(address),
                    Access::Write => var.writes.insert(address),
                };
            }
            None => self.anomaly(Anomaly::UnresolvedOffset { address, offset }),
        }
    }

    /// Process one instruction, updating `state` and annotating stack variables.
    pub fn step(&mut self, insn: &Instruction, state: &mut PathState) {
        if self.config.debug_trace_instructions {
            trace!("Instruction";
                   "func" => self.func_name,
                   "addr" => format_args!("{:#x}", insn.address),
                   "insn" => ?insn,
                   "state" => ?state,
            );
        }

        let [op0, op1] = &insn.operands;

        // Whatever the destination held is about to be overwritten
        if insn.class.writes_operand0() && op0.is_used() {
            state.forget(op0.token());
        }

        let mut malformed = false;
        for (index, op) in insn.operands.iter().enumerate() {
            if op.looks_like_malformed_memory() {
                malformed = true;
                self.anomaly(Anomaly::MalformedOperand {
                    address: insn.address,
                    index,
                    text: op.token().to_owned(),
                });
            }
        }
        if malformed && insn.class != MnemonicClass::Other {
            if insn.class == MnemonicClass::Call {
                self.purge_caller_clobbered(state);
            }
            return;
        }

        match insn.class {
            MnemonicClass::AddressOf => self.address_of(insn, state),
            MnemonicClass::Move => self.move_(insn, state),
            MnemonicClass::Call => self.call(insn, state),
            MnemonicClass::StackAdjustSubtract | MnemonicClass::StackAdjustAdd => {
                if !self.adjust_stack_pointer(insn, state) {
                    self.record_access(insn.address, op1, state, Access::Read);
                }
            }
            MnemonicClass::StackAdjustPush => {
                self.push_or_pop(op0, state, self.arch.word_size());
                self.record_access(insn.address, op0, state, Access::Read);
            }
            MnemonicClass::StackAdjustPop => {
                self.record_access(insn.address, op0, state, Access::Write);
                self.push_or_pop(op0, state, -self.arch.word_size());
            }
            MnemonicClass::Compare => {
                self.record_access(insn.address, op0, state, Access::Read);
                self.record_access(insn.address, op1, state, Access::Read);
            }
            MnemonicClass::Other => {
                self.record_access(insn.address, op1, state, Access::Read);
            }
        }
    }

    /// `lea dst, [fp-X]`: `dst` now holds the address of the slot at `X`.
    fn address_of(&mut self, insn: &Instruction, state: &mut PathState) {
        let [dst, src] = &insn.operands;
        if !src.is_stack_relative() || !dst.is_used() {
            return;
        }
        match self.canonical_offset(src, state) {
            Some(offset) => {
                state
                    .referers
                    .insert(dst.token().to_owned(), std::iter::once(offset).collect());
            }
            None => {
                trace!(
                    "Address of stack slot with unknown shadow displacement";
                    "func" => self.func_name,
                    "addr" => format_args!("{:#x}", insn.address),
                );
            }
        }
    }

    fn move_(&mut self, insn: &Instruction, state: &mut PathState) {
        let [dst, src] = &insn.operands;
        if !dst.is_used() || !src.is_used() {
            return;
        }

        if let Some(pointees) = state.referers.get(src.token()).cloned() {
            if dst.is_stack_relative() {
                // Storing a stack address into a stack slot: the slot is a pointer to a local
                if let Some(var) = self
                    .canonical_offset(dst, state)
                    .and_then(|offset| self.vars.get_mut(&offset))
                {
                    var.flags.insert(VariableFlag::LocalReferer);
                    var.referents.extend(&pointees);
                }
            } else {
                // Copying the address around
                state.referers.insert(dst.token().to_owned(), pointees);
            }
        } else if src.is_stack_relative() {
            // A plain load of a stack variable's value
            if let Some(offset) = self.canonical_offset(src, state) {
                if self.vars.contains_key(&offset) {
                    state
                        .dereferences
                        .insert(dst.token().to_owned(), std::iter::once(offset).collect());
                }
            }
        }

        self.record_access(insn.address, dst, state, Access::Write);
        self.record_access(insn.address, src, state, Access::Read);

        // `mov fp, sp` (and back) re-aligns the two pointers
        let (fp, sp) = (&self.arch.frame_pointer, &self.arch.stack_pointer);
        if (dst.is_register(fp) && src.is_register(sp))
            || (dst.is_register(sp) && src.is_register(fp))
        {
            state.shadow = ShadowDisplacement::Known(0);
        }
    }

    fn call(&mut self, insn: &Instruction, state: &mut PathState) {
        let target = &insn.operands[0];

        if state.referers.contains_key(target.token()) {
            debug!(
                "Indirect call to the address of a stack slot";
                "func" => self.func_name,
                "addr" => format_args!("{:#x}", insn.address),
            );
        }

        let mut code_pointers: Vec<i64> = state
            .dereferences
            .get(target.token())
            .map(|offsets| offsets.iter().copied().collect())
            .unwrap_or_default();
        if target.is_stack_relative() {
            // `call [fp-X]` goes through the slot directly
            self.record_access(insn.address, target, state, Access::Read);
            code_pointers.extend(self.canonical_offset(target, state));
        }
        for offset in code_pointers {
            if let Some(var) = self.vars.get_mut(&offset) {
                var.flags.insert(VariableFlag::CodePtr);
            }
        }

        self.purge_caller_clobbered(state);
    }

    /// Register contents do not survive a call
    fn purge_caller_clobbered(&self, state: &mut PathState) {
        for reg in self.arch.caller_clobbered.iter() {
            state.forget(reg);
        }
    }

    /// `sub sp, N` / `add sp, N`. Returns `false` if this is not a stack-pointer adjustment.
    fn adjust_stack_pointer(&mut self, insn: &Instruction, state: &mut PathState) -> bool {
        let [dst, amount] = &insn.operands;
        if !dst.is_register(&self.arch.stack_pointer) {
            return false;
        }
        let sign = match insn.class {
            MnemonicClass::StackAdjustSubtract => 1,
            _ => -1,
        };
        match amount {
            Operand::Immediate { value, .. } => match value.checked_mul(sign) {
                Some(delta) => state.shadow.shift(delta),
                None => {
                    debug!(
                        "Stack pointer adjustment out of range";
                        "func" => self.func_name,
                        "addr" => format_args!("{:#x}", insn.address),
                    );
                    state.shadow.invalidate();
                }
            },
            _ => {
                debug!(
                    "Non-constant stack pointer adjustment";
                    "func" => self.func_name,
                    "addr" => format_args!("{:#x}", insn.address),
                    "amount" => ?amount,
                );
                state.shadow.invalidate();
            }
        }
        true
    }

    /// `push`/`pop` of the stack or frame pointer moves the stack pointer by a word.
    fn push_or_pop(&self, op: &Operand, state: &mut PathState, delta: i64) {
        if !self.config.adjust_shadow_on_push_pop {
            return;
        }
        if let Operand::Register { name } = op {
            if self.arch.is_frame_or_stack_pointer(name) {
                state.shadow.shift(delta);
            }
        }
    }

    /// Walk `func` from its entry block, starting in `initial`, with the configured traversal.
    pub fn run(&mut self, func: &Function, initial: PathState) {
        if func.entry_block().is_none() {
            debug!(
                "Function has no entry block";
                "func" => self.func_name,
                "entry" => format_args!("{:#x}", func.entry),
            );
            return;
        }
        match self.config.traversal {
            TraversalMode::FirstPathWins => self.first_path_wins(func, initial),
            TraversalMode::Fixpoint => self.fixpoint(func, initial),
        }
    }

    /// Successors of `block` that exist in `func`, reporting the rest.
    fn successors_of(&mut self, func: &Function, block: &BasicBlock) -> Vec<u64> {
        let mut res = Vec::with_capacity(block.successors.len());
        for &succ in &block.successors {
            if func.block(succ).is_some() {
                res.push(succ);
            } else {
                self.anomaly(Anomaly::DanglingSuccessor {
                    block: block.start,
                    successor: succ,
                });
            }
        }
        res
    }

    /// Depth-first; every block is processed at most once, in the state of the first path to
    /// reach it. Each successor gets its own fork of the block's exit state.
    fn first_path_wins(&mut self, func: &Function, initial: PathState) {
        let mut visited: UnorderedSet<u64> = Default::default();
        let mut stack: Vec<(u64, PathState)> = vec![(func.entry, initial)];
        let mut visits = 0;

        while let Some((addr, mut state)) = stack.pop() {
            if !visited.insert(addr) {
                continue;
            }
            if visits >= self.config.block_visit_limit {
                self.anomaly(Anomaly::BlockLimitReached {
                    limit: self.config.block_visit_limit,
                });
                break;
            }
            visits += 1;

            let block = match func.block(addr) {
                Some(b) => b,
                None => continue,
            };
            for insn in &block.instructions {
                self.step(insn, &mut state);
            }

            // Reversed, so that the first-listed successor is explored first
            for succ in self.successors_of(func, block).into_iter().rev() {
                if !visited.contains(&succ) {
                    stack.push((succ, state.clone()));
                }
            }
        }
    }

    /// Worklist iteration until no block's entry state changes, joining at merge points.
    fn fixpoint(&mut self, func: &Function, initial: PathState) {
        let mut entry_states: UnorderedMap<u64, PathState> =
            std::iter::once((func.entry, initial)).collect();
        let mut worklist: VecDeque<u64> = std::iter::once(func.entry).collect();
        let mut visits = 0;

        while let Some(addr) = worklist.pop_front() {
            if visits >= self.config.block_visit_limit {
                self.anomaly(Anomaly::BlockLimitReached {
                    limit: self.config.block_visit_limit,
                });
                break;
            }
            visits += 1;

            let (block, mut state) = match (func.block(addr), entry_states.get(&addr)) {
                (Some(b), Some(s)) => (b, s.clone()),
                _ => continue,
            };
            for insn in &block.instructions {
                self.step(insn, &mut state);
            }

            for succ in self.successors_of(func, block) {
                let changed = match entry_states.get_mut(&succ) {
                    Some(existing) => existing.join_from(&state),
                    None => {
                        entry_states.insert(succ, state.clone());
                        true
                    }
                };
                if changed && !worklist.contains(&succ) {
                    worklist.push_back(succ);
                }
            }
        }
    }
}

/// Annotate `vars` by walking `func`, starting in `initial`. Returns the anomalies observed.
pub fn propagate(
    func: &Function,
    vars: &mut StackVariables,
    initial: PathState,
    arch: &Architecture,
    config: &AnalysisConfig,
) -> Vec<Anomaly> {
    let mut p = Propagation::new(&func.name, arch, config, vars);
    p.run(func, initial);
    p.into_anomalies()
}
