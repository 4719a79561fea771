//! GraphViz rendering of the lifted control-flow graphs, for debugging the front end.

use crate::insn::{BasicBlock, Instruction, Program};

/// A block, identified by its function's index in the program and its start address
type Node = (usize, u64);
type Edge = (Node, Node);

struct Graph<'a> {
    prog: &'a Program,
}

impl<'a> Graph<'a> {
    fn block(&self, n: &Node) -> Option<&'a BasicBlock> {
        self.prog.functions.get(n.0).and_then(|f| f.block(n.1))
    }

    fn nodes_and_edges(&self) -> (Vec<Node>, Vec<Edge>) {
        let mut nodes = vec![];
        let mut edges = vec![];
        for (i, func) in self.prog.functions.iter().enumerate() {
            for block in func.blocks() {
                nodes.push((i, block.start));
                for &succ in &block.successors {
                    // Dangling edges are reported by the analysis; leave them out here
                    if func.block(succ).is_some() {
                        edges.push(((i, block.start), (i, succ)));
                    }
                }
            }
        }
        (nodes, edges)
    }
}

fn render_instruction(insn: &Instruction) -> String {
    let operands = insn
        .operands
        .iter()
        .filter(|o| o.is_used())
        .map(|o| o.token())
        .collect::<Vec<_>>()
        .join(", ");
    format!("{:#x}: {} {}", insn.address, insn.mnemonic, operands)
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

impl<'a> dot::Labeller<'a, Node, Edge> for Graph<'a> {
    fn graph_id(&'a self) -> dot::Id<'a> {
        dot::Id::new("ControlFlow").unwrap()
    }
    fn node_id(&'a self, n: &Node) -> dot::Id<'a> {
        dot::Id::new(format!("f{}_b{:x}", n.0, n.1)).unwrap()
    }
    fn node_label<'b>(&'b self, n: &Node) -> dot::LabelText<'b> {
        let func = &self.prog.functions[n.0];
        let mut text = format!("{} @ {:#x}\\l\\l", escape(&func.name), n.1);
        if let Some(block) = self.block(n) {
            for insn in &block.instructions {
                text.push_str(&escape(&render_instruction(insn)));
                text.push_str("\\l");
            }
        }
        dot::LabelText::escaped(text)
    }
    fn node_shape(&'a self, _n: &Node) -> Option<dot::LabelText<'a>> {
        Some(dot::LabelText::label("box"))
    }
}

impl<'a> dot::GraphWalk<'a, Node, Edge> for Graph<'a> {
    fn nodes(&self) -> dot::Nodes<'a, Node> {
        self.nodes_and_edges().0.into()
    }
    fn edges(&'a self) -> dot::Edges<'a, Edge> {
        self.nodes_and_edges().1.into()
    }
    fn source(&self, e: &Edge) -> Node {
        e.0
    }
    fn target(&self, e: &Edge) -> Node {
        e.1
    }
}

/// Write a `.dot` digraph of every function's blocks and successor edges to `w`
pub fn write_dot<W: std::io::Write>(prog: &Program, w: &mut W) -> std::io::Result<()> {
    dot::render(&Graph { prog }, w)
}

/// Generate a `.dot` digraph of every function's blocks and successor edges
pub fn generate_dot(prog: &Program) -> std::io::Result<String> {
    let mut s: Vec<u8> = vec![];
    write_dot(prog, &mut s)?;
    Ok(String::from_utf8_lossy(&s).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::X86;
    use crate::insn::Function;

    #[test]
    fn blocks_and_edges_are_rendered() {
        let a = &*X86;
        let mut f = Function::new("f", 0x10, 0x20, None);
        f.add_block(BasicBlock::new(
            0x10,
            vec![Instruction::from_text(0x10, "mov", "eax", "[ebp-4]", a)],
            vec![0x18, 0x99],
        ));
        f.add_block(BasicBlock::new(0x18, vec![], vec![]));
        let mut prog = Program::new("p", a.clone());
        prog.functions.push(f);

        let dot = generate_dot(&prog).unwrap();
        assert!(dot.starts_with("digraph ControlFlow {"));
        assert!(dot.contains("f0_b10 -> f0_b18"));
        assert!(!dot.contains("f0_b99"));
        assert!(dot.contains("0x10: mov eax, [ebp-4]"));
    }
}
