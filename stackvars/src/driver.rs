//! Per-function orchestration: frame extraction followed by taint propagation.

use rayon::prelude::*;

use crate::analysis_config::AnalysisConfig;
use crate::arch::Architecture;
use crate::error::Anomaly;
use crate::frame::extract_stack_variables;
use crate::insn::{Function, Program};
use crate::log::*;
use crate::stack_variable::StackVariables;
use crate::taint::{propagate, PathState};

/// The recovered stack variables of a single function
#[derive(Clone, Debug)]
pub struct FunctionVariables {
    pub entry: u64,
    pub name: String,
    pub variables: StackVariables,
    /// Non-fatal observations made while analyzing the function
    pub anomalies: Vec<Anomaly>,
}

impl FunctionVariables {
    /// Variables sorted by canonical offset
    pub fn sorted_variables(&self) -> Vec<&crate::stack_variable::StackVariable> {
        let mut v: Vec<_> = self.variables.values().collect();
        v.sort_by_key(|var| var.offset);
        v
    }
}

/// Recover and annotate the stack variables of `func`.
///
/// Functions without a frame, or whose frame declares no variables, skip propagation entirely.
pub fn recover_function(
    func: &Function,
    arch: &Architecture,
    config: &AnalysisConfig,
) -> FunctionVariables {
    let mut variables = extract_stack_variables(func);
    let mut anomalies = vec![];

    if func.frame.is_none() {
        debug!("Function has no frame"; "func" => &func.name);
        anomalies.push(Anomaly::MissingFrame);
    } else if variables.is_empty() {
        debug!("Frame declares no stack variables"; "func" => &func.name);
    } else {
        anomalies = propagate(func, &mut variables, PathState::default(), arch, config);
    }

    for anomaly in &anomalies {
        debug!("Anomaly"; "func" => &func.name, "anomaly" => %anomaly);
    }
    debug!(
        "Recovered stack variables";
        "func" => &func.name,
        "count" => variables.len(),
        OptionalKV("first_anomaly", anomalies.first().map(|a| a.to_string())),
    );

    FunctionVariables {
        entry: func.entry,
        name: func.name.clone(),
        variables,
        anomalies,
    }
}

/// Recover the stack variables of every function in `prog`, in program order.
pub fn recover_all(prog: &Program, config: &AnalysisConfig) -> Vec<FunctionVariables> {
    let arch = &prog.architecture;
    info!(
        "Recovering stack variables";
        "program" => &prog.name,
        "arch" => &arch.name,
        "functions" => prog.functions.len(),
        "parallel" => config.parallel_across_functions,
    );

    let res: Vec<FunctionVariables> = if config.parallel_across_functions {
        prog.functions
            .par_iter()
            .map(|f| recover_function(f, arch, config))
            .collect()
    } else {
        prog.functions
            .iter()
            .map(|f| recover_function(f, arch, config))
            .collect()
    };

    info!(
        "Done recovering stack variables";
        "variables" => res.iter().map(|f| f.variables.len()).sum::<usize>(),
        "anomalies" => res.iter().map(|f| f.anomalies.len()).sum::<usize>(),
    );
    res
}
