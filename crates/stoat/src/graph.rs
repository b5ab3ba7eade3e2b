// Dependency scheduler - prune to the needed subgraph, partition into stages
//
// A model arrives as a flat node list in arbitrary order. Before anything
// gets planned, the scheduler answers two questions:
//
//   1. Which nodes are actually needed for the outputs the caller asked
//      for? Backward reachability from the requested names; everything
//      unreached is dropped.
//   2. In what order can the needed nodes run? Forward layering into
//      stages: a node joins the earliest stage in which every one of its
//      inputs is already available.
//
// Stages are the unit the planner walks. Members of one stage are mutually
// independent, so their within-stage order carries no meaning beyond
// determinism (ascending NodeId). If layering ever makes no forward
// progress the remaining nodes form a cycle, which is an error rather than
// an infinite loop.

use std::collections::{BTreeSet, HashMap, HashSet};

use stoat_core::{bail, Error, Node, OpKind, Result};

/// Index of a node in the original node list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// The staged, pruned execution graph.
///
/// The full node list is kept so `NodeId` stays a stable index; pruned
/// nodes simply appear in no stage.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    stages: Vec<Vec<NodeId>>,
}

impl Graph {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Execution stages; every stage's inputs come from earlier stages,
    /// declared inputs, or parameters.
    pub fn stages(&self) -> &[Vec<NodeId>] {
        &self.stages
    }

    /// How many nodes survived pruning.
    pub fn staged_node_count(&self) -> usize {
        self.stages.iter().map(Vec::len).sum()
    }

    pub fn is_staged(&self, id: NodeId) -> bool {
        self.stages.iter().any(|stage| stage.contains(&id))
    }
}

/// Prune `nodes` down to what the requested outputs need, then partition
/// the survivors into dependency-respecting stages.
///
/// `declared_inputs` and `parameter_names` are the externally supplied
/// values; every other name must be produced by some node. A requested
/// output nothing can explain is [`Error::UnresolvedOutput`]; an
/// intermediate input nothing can explain is [`Error::MissingValue`].
pub fn prune_and_stage(
    nodes: Vec<Node>,
    required_outputs: &[String],
    declared_inputs: &[String],
    parameter_names: &HashSet<String>,
) -> Result<Graph> {
    // Producer of every output name. Two nodes claiming the same name is a
    // malformed graph, not a tie to break.
    let mut producer: HashMap<&str, NodeId> = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        for out in node.outputs() {
            if producer.insert(out.as_str(), NodeId(i)).is_some() {
                bail!("multiple nodes produce \"{out}\"");
            }
        }
    }

    let external: HashSet<&str> = declared_inputs
        .iter()
        .map(String::as_str)
        .chain(parameter_names.iter().map(String::as_str))
        .collect();

    // Backward reachability from the requested outputs. A produced name is
    // traced through its producer; a name nobody produces must be external.
    // Empty names are the interchange format's "absent optional input" and
    // depend on nothing.
    let mut needed: HashSet<NodeId> = HashSet::new();
    let mut frontier: Vec<&str> = Vec::new();
    for name in required_outputs {
        match producer.get(name.as_str()) {
            Some(&id) => {
                if needed.insert(id) {
                    frontier.extend(
                        nodes[id.0]
                            .inputs()
                            .iter()
                            .map(String::as_str)
                            .filter(|n| !n.is_empty()),
                    );
                }
            }
            None if external.contains(name.as_str()) => {}
            None => {
                return Err(Error::UnresolvedOutput { name: name.clone() });
            }
        }
    }
    while let Some(name) = frontier.pop() {
        // A bound input satisfies the name even when some node also
        // produces it; the producer is then left for pruning to drop.
        if external.contains(name) {
            continue;
        }
        match producer.get(name) {
            Some(&id) => {
                if needed.insert(id) {
                    frontier.extend(
                        nodes[id.0]
                            .inputs()
                            .iter()
                            .map(String::as_str)
                            .filter(|n| !n.is_empty()),
                    );
                }
            }
            None => {
                return Err(Error::MissingValue {
                    name: name.to_string(),
                });
            }
        }
    }

    // Forward layering. Each round collects every still-unstaged node whose
    // inputs are all available; an empty round with nodes remaining means
    // the rest can never run.
    let mut available = external;
    let mut remaining: BTreeSet<NodeId> = needed.into_iter().collect();
    let mut stages: Vec<Vec<NodeId>> = Vec::new();
    while !remaining.is_empty() {
        let stage: Vec<NodeId> = remaining
            .iter()
            .copied()
            .filter(|id| {
                nodes[id.0]
                    .inputs()
                    .iter()
                    .all(|input| input.is_empty() || available.contains(input.as_str()))
            })
            .collect();
        if stage.is_empty() {
            return Err(Error::Cycle);
        }
        for id in &stage {
            remaining.remove(id);
        }
        for id in &stage {
            for out in nodes[id.0].outputs() {
                available.insert(out.as_str());
            }
        }
        stages.push(stage);
    }

    Ok(Graph { nodes, stages })
}

/// Inference treats dropout as identity: every consumer of a dropout's
/// output is rewired to read the dropout's input instead, leaving the node
/// unreachable for pruning to drop. Chained dropouts collapse regardless of
/// their order in the list because rewiring is global over names.
pub fn bypass_dropout(nodes: &mut [Node]) {
    for i in 0..nodes.len() {
        if nodes[i].kind() != OpKind::Dropout {
            continue;
        }
        let Some(from) = nodes[i].outputs().first().cloned() else {
            continue;
        };
        let Some(to) = nodes[i].inputs().first().cloned() else {
            continue;
        };
        for node in nodes.iter_mut() {
            node.replace_input(&from, &to);
        }
    }
}

/// A reshape that only flattens a conv/pool activation for fully-connected
/// consumers is dropped: the fc kernel accepts 4-d input and flattens it
/// internally, so its consumers can read the reshape's input directly.
pub fn bypass_reshape_before_fc(nodes: &mut [Node]) {
    for i in 0..nodes.len() {
        if nodes[i].kind() != OpKind::Reshape {
            continue;
        }
        let Some(out) = nodes[i].outputs().first().cloned() else {
            continue;
        };
        let Some(inp) = nodes[i].inputs().first().cloned() else {
            continue;
        };
        let produced_by = nodes
            .iter()
            .find(|n| n.outputs().contains(&inp))
            .map(|n| n.kind());
        if !matches!(produced_by, Some(OpKind::Conv | OpKind::MaxPool)) {
            continue;
        }
        let consumers: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.inputs().contains(&out))
            .map(|(j, _)| j)
            .collect();
        if consumers.is_empty() || consumers.iter().any(|&j| nodes[j].kind() != OpKind::Fc) {
            continue;
        }
        for &j in &consumers {
            nodes[j].replace_input(&out, &inp);
        }
    }
}
