//! Dependency graph between the computations of one iteration.

use std::collections::HashMap;
use std::fmt::{self, Write as _};

use tracing::trace;

use crate::error::{CbdError, Result};
use crate::model::{BlockId, Diagram, PortId};

/// A node of the dependency graph: a primitive block or a port of the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DepNode {
    Block(BlockId),
    Port(PortId),
}

impl fmt::Display for DepNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepNode::Block(id) => write!(f, "{}", id),
            DepNode::Port(id) => write!(f, "{}", id),
        }
    }
}

/// Directed graph of "dependent needs influencer" relations.
///
/// Members keep their insertion order, which makes schedules
/// deterministic for a given model.
#[derive(Debug, Clone, Default)]
pub struct DepGraph {
    members: Vec<DepNode>,
    influencers: HashMap<DepNode, Vec<DepNode>>,
    dependents: HashMap<DepNode, Vec<DepNode>>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&mut self, node: DepNode) -> Result<()> {
        if self.has_member(node) {
            return Err(CbdError::MemberExists {
                node: node.to_string(),
            });
        }
        self.members.push(node);
        self.influencers.insert(node, Vec::new());
        self.dependents.insert(node, Vec::new());
        Ok(())
    }

    pub fn has_member(&self, node: DepNode) -> bool {
        self.influencers.contains_key(&node)
    }

    fn check_member(&self, node: DepNode) -> Result<()> {
        if self.has_member(node) {
            Ok(())
        } else {
            Err(CbdError::NotMember {
                node: node.to_string(),
            })
        }
    }

    /// Record that `dependent` needs the value of `influencer`. Adding the
    /// same dependency twice has no effect.
    pub fn set_dependency(&mut self, dependent: DepNode, influencer: DepNode) -> Result<()> {
        self.check_member(dependent)?;
        self.check_member(influencer)?;
        if self.has_dependency(dependent, influencer) {
            return Ok(());
        }
        if let Some(list) = self.influencers.get_mut(&dependent) {
            list.push(influencer);
        }
        if let Some(list) = self.dependents.get_mut(&influencer) {
            list.push(dependent);
        }
        Ok(())
    }

    pub fn has_dependency(&self, dependent: DepNode, influencer: DepNode) -> bool {
        self.influencers
            .get(&dependent)
            .map(|list| list.contains(&influencer))
            .unwrap_or(false)
    }

    pub fn unset_dependency(&mut self, dependent: DepNode, influencer: DepNode) -> Result<()> {
        self.check_member(dependent)?;
        self.check_member(influencer)?;
        if let Some(list) = self.influencers.get_mut(&dependent) {
            list.retain(|n| *n != influencer);
        }
        if let Some(list) = self.dependents.get_mut(&influencer) {
            list.retain(|n| *n != dependent);
        }
        Ok(())
    }

    /// Remove a node together with every dependency it takes part in.
    pub fn remove_member(&mut self, node: DepNode) -> Result<()> {
        self.check_member(node)?;
        for influencer in self.influencers.remove(&node).unwrap_or_default() {
            if let Some(list) = self.dependents.get_mut(&influencer) {
                list.retain(|n| *n != node);
            }
        }
        for dependent in self.dependents.remove(&node).unwrap_or_default() {
            if let Some(list) = self.influencers.get_mut(&dependent) {
                list.retain(|n| *n != node);
            }
        }
        self.members.retain(|n| *n != node);
        Ok(())
    }

    /// Nodes that need `node`.
    pub fn dependents(&self, node: DepNode) -> Result<&[DepNode]> {
        self.dependents
            .get(&node)
            .map(Vec::as_slice)
            .ok_or_else(|| CbdError::NotMember {
                node: node.to_string(),
            })
    }

    /// Nodes that `node` needs.
    pub fn influencers(&self, node: DepNode) -> Result<&[DepNode]> {
        self.influencers
            .get(&node)
            .map(Vec::as_slice)
            .ok_or_else(|| CbdError::NotMember {
                node: node.to_string(),
            })
    }

    pub fn members(&self) -> &[DepNode] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Dependencies of `diagram` at `iteration`.
    ///
    /// Members are the root's input ports, every primitive block and the
    /// root's output ports. Connections through composite ports are
    /// followed to the block that actually produces the value.
    pub fn build(diagram: &Diagram, iteration: usize) -> Result<Self> {
        Self::build_with(diagram, iteration, |input| diagram.driver_of(input))
    }

    /// Dependencies of an already flattened `diagram`, reading the direct
    /// incoming link of each input.
    pub fn build_flat(diagram: &Diagram, iteration: usize) -> Result<Self> {
        let root = diagram.root();
        if let Some((id, _)) = diagram.blocks().find(|(id, b)| *id != root && b.is_composite()) {
            return Err(CbdError::NotFlat {
                block: diagram.path_of(id),
            });
        }
        Self::build_with(diagram, iteration, |input| {
            diagram.port(input)?.incoming().ok_or_else(|| CbdError::UnconnectedInput {
                block: diagram.path_of(input.block),
                port: diagram.port(input).map(|p| p.name().to_string()).unwrap_or_default(),
            })
        })
    }

    fn build_with<F>(diagram: &Diagram, iteration: usize, driver: F) -> Result<Self>
    where
        F: Fn(PortId) -> Result<PortId>,
    {
        let root = diagram.root();
        let root_block = diagram.block(root)?;
        let source_node = |port: PortId| {
            if port.block == root {
                DepNode::Port(port)
            } else {
                DepNode::Block(port.block)
            }
        };

        let mut graph = DepGraph::new();
        for index in 0..root_block.inputs().len() {
            graph.add_member(DepNode::Port(PortId::input(root, index)))?;
        }
        let primitives = diagram.primitive_blocks();
        for id in &primitives {
            graph.add_member(DepNode::Block(*id))?;
        }
        for index in 0..root_block.outputs().len() {
            graph.add_member(DepNode::Port(PortId::output(root, index)))?;
        }

        for id in primitives {
            for port in diagram.block(id)?.kind().dependency_ports(iteration) {
                let source = driver(PortId::input(id, port))?;
                graph.set_dependency(DepNode::Block(id), source_node(source))?;
            }
        }
        for index in 0..root_block.outputs().len() {
            let output = PortId::output(root, index);
            let source = diagram.prev_closure(output)?;
            if source != output {
                graph.set_dependency(DepNode::Port(output), source_node(source))?;
            }
        }

        trace!(iteration, members = graph.len(), "dependency graph built");
        Ok(graph)
    }

    /// Graphviz rendering, labelled with the paths of `diagram`.
    pub fn to_dot(&self, diagram: &Diagram) -> String {
        let label = |node: &DepNode| match node {
            DepNode::Block(id) => diagram.path_of(*id),
            DepNode::Port(id) => diagram.port_path(*id),
        };
        let mut out = String::from("digraph dependencies {\n");
        for node in &self.members {
            let _ = writeln!(out, "  \"{}\";", label(node));
        }
        for node in &self.members {
            for influencer in self.influencers.get(node).into_iter().flatten() {
                let _ = writeln!(out, "  \"{}\" -> \"{}\";", label(node), label(influencer));
            }
        }
        out.push_str("}\n");
        out
    }
}
