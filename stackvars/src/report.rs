//! Printable and serializable views of recovered stack variables.

use crate::driver::FunctionVariables;

use itertools::Itertools;

/// Render a canonical offset as signed hex (`-0x8`, `0x4`)
fn signed_hex(v: i64) -> String {
    if v < 0 {
        format!("-{:#x}", v.unsigned_abs())
    } else {
        format!("{:#x}", v)
    }
}

/// Human-readable listing of every function's stack variables, sorted by offset.
#[derive(Debug)]
pub struct PrintableStackVariables<'a> {
    funcs: &'a [FunctionVariables],
}

impl<'a> PrintableStackVariables<'a> {
    pub fn new(funcs: &'a [FunctionVariables]) -> Self {
        Self { funcs }
    }
}

impl<'a> std::fmt::Display for PrintableStackVariables<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "Stack Vars:")?;
        for func in self.funcs {
            writeln!(f, "{} {{", func.name)?;
            for var in func.sorted_variables() {
                writeln!(
                    f,
                    "  {}: {{name: {}, size: {}, flags: [{}], writes: [{}], reads: [{}], referent: [{}]}}",
                    signed_hex(var.offset),
                    var.name,
                    var.size,
                    var.sorted_flags().iter().join(", "),
                    var.sorted_writes().iter().map(|a| format!("{:#x}", a)).join(", "),
                    var.sorted_reads().iter().map(|a| format!("{:#x}", a)).join(", "),
                    var.sorted_referents().into_iter().map(signed_hex).join(", "),
                )?;
            }
            writeln!(f, "}}")?;
        }
        write!(f, "End Stack Vars")
    }
}

/// Machine-readable form of the recovered stack variables.
///
/// A `FUNCTIONS` header, then per function a line `<entry hex>\t<name>\t<variable count>`
/// followed by one tab-indented line per variable:
/// `<offset>\t<name>\t<size>\t<flags>\twrites=<hex,...>\treads=<hex,...>\treferents=<offset,...>`.
pub fn serialize(funcs: &[FunctionVariables]) -> String {
    let mut res = String::new();
    // Writing into a `String` cannot fail
    let _ = serialize_to(funcs, &mut res);
    res
}

fn serialize_to(funcs: &[FunctionVariables], f: &mut String) -> std::fmt::Result {
    use std::fmt::Write;

    writeln!(f, "FUNCTIONS")?;
    for func in funcs {
        writeln!(f, "{:x}\t{}\t{}", func.entry, func.name, func.variables.len())?;
        for var in func.sorted_variables() {
            writeln!(
                f,
                "\t{}\t{}\t{}\t{}\twrites={}\treads={}\treferents={}",
                var.offset,
                var.name,
                var.size,
                var.sorted_flags().iter().join(","),
                var.sorted_writes().iter().map(|a| format!("{:x}", a)).join(","),
                var.sorted_reads().iter().map(|a| format!("{:x}", a)).join(","),
                var.sorted_referents().iter().join(","),
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack_variable::{StackVariable, StackVariables, VariableFlag};
    use indoc::indoc;

    fn sample() -> Vec<FunctionVariables> {
        let mut vars = StackVariables::new();
        let mut buf = StackVariable::new(-8, "var_8", 4, ["FF_DATA", "FF_DWRD"]);
        buf.writes.insert(0x401003);
        let mut ptr = StackVariable::new(-4, "var_4", 4, []);
        ptr.flags.insert(VariableFlag::LocalReferer);
        ptr.flags.insert(VariableFlag::CodePtr);
        ptr.referents.insert(-8);
        ptr.writes.insert(0x401009);
        ptr.reads.insert(0x401010);
        ptr.reads.insert(0x40100c);
        vars.insert(-4, ptr);
        vars.insert(-8, buf);
        vec![
            FunctionVariables {
                entry: 0x401000,
                name: "main".into(),
                variables: vars,
                anomalies: vec![],
            },
            FunctionVariables {
                entry: 0x401100,
                name: "leaf".into(),
                variables: StackVariables::new(),
                anomalies: vec![],
            },
        ]
    }

    #[test]
    fn human_readable() {
        assert_eq!(
            PrintableStackVariables::new(&sample()).to_string(),
            indoc! {"
                Stack Vars:
                main {
                  -0x8: {name: var_8, size: 4, flags: [FF_DATA, FF_DWRD], writes: [0x401003], reads: [], referent: []}
                  -0x4: {name: var_4, size: 4, flags: [LOCAL_REFERER, CODE_PTR], writes: [0x401009], reads: [0x40100c, 0x401010], referent: [-0x8]}
                }
                leaf {
                }
                End Stack Vars"}
        );
    }

    #[test]
    fn serialized() {
        assert_eq!(
            serialize(&sample()),
            indoc! {"
                FUNCTIONS
                401000\tmain\t2
                \t-8\tvar_8\t4\tFF_DATA,FF_DWRD\twrites=401003\treads=\treferents=
                \t-4\tvar_4\t4\tLOCAL_REFERER,CODE_PTR\twrites=401009\treads=40100c,401010\treferents=-8
                401100\tleaf\t0
            "}
        );
    }
}
