//! Flags that can impact stack-variable recovery.
//!
//! Unlike architecture parameters, these are chosen by the user. Either way, the resulting
//! [`AnalysisConfig`] is passed by reference to the analysis; there is no global store.

/// How the propagation engine walks a function's control-flow graph.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TraversalMode {
    /// Depth-first, each block processed at most once, with the taint state of whichever path
    /// reaches it first. No joining at merge points.
    FirstPathWins,
    /// Worklist to a fixpoint, joining taint states at merge points by set union.
    Fixpoint,
}

/// The analysis configuration
#[derive(Clone, Debug)]
pub struct AnalysisConfig {
    /// Traversal strategy for each function's CFG.
    pub traversal: TraversalMode,
    /// Analyze functions concurrently on the rayon thread pool. Results do not depend on this.
    pub parallel_across_functions: bool,
    /// Adjust stack-pointer relative references by the running shadow displacement. If `false`,
    /// `[esp+d]` resolves to canonical offset `d`, ignoring any earlier `sub esp, N`.
    pub track_shadow_displacement: bool,
    /// Whether `push`/`pop` of the stack or frame pointer implicitly moves the shadow
    /// displacement by the word size. If `false`, only explicit `sub`/`add` deltas count.
    pub adjust_shadow_on_push_pop: bool,
    /// Upper bound on block visits per function. Only pathological graphs get near it.
    pub block_visit_limit: usize,
    /// Log every instruction along with the taint state it is processed in (at trace level).
    pub debug_trace_instructions: bool,
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Analysis configuration parameters
pub enum CommandLineAnalysisConfig {
    EnableFixpointTraversal,
    DisableParallelAnalysis,
    DisableShadowDisplacementTracking,
    DisablePushPopShadowAdjustment,
    EnableDebugTraceInstructions,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            traversal: TraversalMode::FirstPathWins,
            parallel_across_functions: true,
            track_shadow_displacement: true,
            adjust_shadow_on_push_pop: true,
            block_visit_limit: 1 << 16,
            debug_trace_instructions: false,
        }
    }
}

impl From<Vec<CommandLineAnalysisConfig>> for AnalysisConfig {
    fn from(v: Vec<CommandLineAnalysisConfig>) -> Self {
        use CommandLineAnalysisConfig::*;
        let mut r = AnalysisConfig::default();
        for v in v {
            match v {
                EnableFixpointTraversal => {
                    r.traversal = TraversalMode::Fixpoint;
                }
                DisableParallelAnalysis => {
                    r.parallel_across_functions = false;
                }
                DisableShadowDisplacementTracking => {
                    r.track_shadow_displacement = false;
                }
                DisablePushPopShadowAdjustment => {
                    r.adjust_shadow_on_push_pop = false;
                }
                EnableDebugTraceInstructions => {
                    r.debug_trace_instructions = true;
                }
            }
        }
        r
    }
}
