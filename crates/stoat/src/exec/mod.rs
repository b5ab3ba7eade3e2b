// Execution - turning a staged graph into a runnable program
//
// Compilation happens in two layers. `plan` handles one node: it compares
// the bound input's layout against what the backend's kernel prefers,
// inserts reorder ops where they disagree, and builds the kernel op into a
// destination buffer. `program` walks the staged graph in order, threads
// value bindings from node to node, and collects everything into one flat
// op list that a run submits in a single blocking call.

mod plan;
mod program;

pub use program::{compile, CompiledModel, OpMeta, Program};
