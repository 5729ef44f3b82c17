//! Block diagram arena.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use super::signal::SignalHistory;
use super::types::{BlockId, PortDirection, PortId, Signal};
use crate::blocks::{BlockKind, DEFAULT_OUTPUT};
use crate::error::{CbdError, Result};

/// Separator between the components of a block path.
pub const PATH_SEPARATOR: char = '.';

const HASH_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789$_";

/// Short case-sensitive textual form of a number, used for generated names.
pub fn hash64(mut number: u64) -> String {
    let base = HASH_ALPHABET.len() as u64;
    let mut digits = Vec::new();
    loop {
        digits.push(HASH_ALPHABET[(number % base) as usize] as char);
        number /= base;
        if number == 0 {
            break;
        }
    }
    digits.iter().rev().collect()
}

/// A named terminal of a block.
#[derive(Debug, Clone)]
pub struct Port {
    pub(super) name: String,
    pub(super) direction: PortDirection,
    pub(super) incoming: Option<PortId>,
    pub(super) outgoing: Vec<PortId>,
    pub(super) history: SignalHistory,
}

impl Port {
    pub(super) fn new(name: impl Into<String>, direction: PortDirection) -> Self {
        Self {
            name: name.into(),
            direction,
            incoming: None,
            outgoing: Vec::new(),
            history: SignalHistory::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    /// The port driving this one, if connected.
    pub fn incoming(&self) -> Option<PortId> {
        self.incoming
    }

    /// The ports this one drives.
    pub fn outgoing(&self) -> &[PortId] {
        &self.outgoing
    }

    /// Samples recorded on this port.
    pub fn history(&self) -> &SignalHistory {
        &self.history
    }
}

/// A block: a primitive operator or a composite sub-diagram.
#[derive(Debug, Clone)]
pub struct Block {
    pub(super) name: String,
    pub(super) kind: BlockKind,
    pub(super) parent: Option<BlockId>,
    pub(super) inputs: Vec<Port>,
    pub(super) outputs: Vec<Port>,
    pub(super) children: Vec<BlockId>,
    pub(super) child_index: HashMap<String, BlockId>,
    pub(super) rate: Option<f64>,
}

impl Block {
    pub(super) fn new(name: String, kind: BlockKind, parent: Option<BlockId>, inputs: Vec<String>, outputs: Vec<String>) -> Self {
        Self {
            name,
            kind,
            parent,
            inputs: inputs.into_iter().map(|n| Port::new(n, PortDirection::Input)).collect(),
            outputs: outputs.into_iter().map(|n| Port::new(n, PortDirection::Output)).collect(),
            children: Vec::new(),
            child_index: HashMap::new(),
            rate: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &BlockKind {
        &self.kind
    }

    pub fn parent(&self) -> Option<BlockId> {
        self.parent
    }

    pub fn inputs(&self) -> &[Port] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Port] {
        &self.outputs
    }

    /// Children in insertion order (composites only).
    pub fn children(&self) -> &[BlockId] {
        &self.children
    }

    /// Child by local name.
    pub fn child(&self, name: &str) -> Option<BlockId> {
        self.child_index.get(name).copied()
    }

    /// Execution rate, if the block only computes at multiples of it.
    pub fn rate(&self) -> Option<f64> {
        self.rate
    }

    pub fn is_composite(&self) -> bool {
        self.kind.is_composite()
    }

    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|p| p.name == name)
    }

    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|p| p.name == name)
    }

    fn ports(&self, direction: PortDirection) -> &[Port] {
        match direction {
            PortDirection::Input => &self.inputs,
            PortDirection::Output => &self.outputs,
        }
    }

    fn ports_mut(&mut self, direction: PortDirection) -> &mut Vec<Port> {
        match direction {
            PortDirection::Input => &mut self.inputs,
            PortDirection::Output => &mut self.outputs,
        }
    }

    pub(super) fn has_port_named(&self, name: &str) -> bool {
        self.input_index(name).is_some() || self.output_index(name).is_some()
    }

    fn all_ports_mut(&mut self) -> impl Iterator<Item = &mut Port> {
        self.inputs.iter_mut().chain(self.outputs.iter_mut())
    }
}

/// A hierarchical causal block diagram.
///
/// Blocks live in an arena indexed by [`BlockId`]. The root is a composite
/// block; composites own their children by id and children refer back to
/// their parent by id.
#[derive(Debug, Clone)]
pub struct Diagram {
    pub(super) blocks: Vec<Option<Block>>,
    pub(super) root: BlockId,
}

impl Diagram {
    /// Create a diagram whose root exposes the given ports.
    pub fn new(name: impl Into<String>, inputs: &[&str], outputs: &[&str]) -> Self {
        let root = Block::new(
            name.into(),
            BlockKind::composite("Diagram"),
            None,
            inputs.iter().map(|s| s.to_string()).collect(),
            outputs.iter().map(|s| s.to_string()).collect(),
        );
        Self {
            blocks: vec![Some(root)],
            root: BlockId(0),
        }
    }

    pub fn root(&self) -> BlockId {
        self.root
    }

    /// Name of the root block.
    pub fn name(&self) -> &str {
        self.blocks[self.root.0].as_ref().map(|b| b.name.as_str()).unwrap_or("")
    }

    /// Look up a block by id.
    pub fn block(&self, id: BlockId) -> Result<&Block> {
        self.blocks
            .get(id.0)
            .and_then(|b| b.as_ref())
            .ok_or_else(|| CbdError::block_not_found(id.to_string()))
    }

    pub(super) fn block_mut(&mut self, id: BlockId) -> Result<&mut Block> {
        self.blocks
            .get_mut(id.0)
            .and_then(|b| b.as_mut())
            .ok_or_else(|| CbdError::block_not_found(id.to_string()))
    }

    /// Look up a port by id.
    pub fn port(&self, id: PortId) -> Result<&Port> {
        let block = self.block(id.block)?;
        block
            .ports(id.direction)
            .get(id.index)
            .ok_or_else(|| CbdError::port_not_found(self.path_of(id.block), format!("{}{}", id.direction, id.index)))
    }

    pub(super) fn port_mut(&mut self, id: PortId) -> Result<&mut Port> {
        let path = self.path_of(id.block);
        self.block_mut(id.block)?
            .ports_mut(id.direction)
            .get_mut(id.index)
            .ok_or_else(|| CbdError::port_not_found(path, format!("{}{}", id.direction, id.index)))
    }

    /// Iterate over every live block in arena order.
    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &Block)> {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_ref().map(|b| (BlockId(i), b)))
    }

    /// Children of a composite.
    pub fn children(&self, id: BlockId) -> Result<&[BlockId]> {
        Ok(self.block(id)?.children())
    }

    /// `id` and all of its descendants, parents before children.
    pub fn descendants(&self, id: BlockId) -> Vec<BlockId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Ok(block) = self.block(current) {
                out.push(current);
                stack.extend(block.children.iter().rev());
            }
        }
        out
    }

    /// Primitive blocks below the root, in model order.
    pub fn primitive_blocks(&self) -> Vec<BlockId> {
        self.descendants(self.root)
            .into_iter()
            .filter(|id| self.block(*id).map(|b| !b.is_composite()).unwrap_or(false))
            .collect()
    }

    /// Dotted path of a block, relative to the root. The root itself is
    /// named by its own name.
    pub fn path_of(&self, id: BlockId) -> String {
        if id == self.root {
            return self.name().to_string();
        }
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(cid) = current {
            if cid == self.root {
                break;
            }
            match self.block(cid) {
                Ok(block) => {
                    names.push(block.name.as_str());
                    current = block.parent;
                }
                Err(_) => break,
            }
        }
        names.reverse();
        names.join(&PATH_SEPARATOR.to_string())
    }

    /// Dotted name of a port; root ports are named by their port name.
    pub fn port_path(&self, id: PortId) -> String {
        let port = self.port(id).map(|p| p.name.clone()).unwrap_or_else(|_| id.to_string());
        if id.block == self.root {
            port
        } else {
            format!("{}{}{}", self.path_of(id.block), PATH_SEPARATOR, port)
        }
    }

    // ============ Construction ============

    /// Add a primitive block to a composite.
    ///
    /// Names must be unique among the siblings and must not shadow one of
    /// the parent's ports. An empty name is replaced by a generated one.
    pub fn add_block(&mut self, parent: BlockId, name: &str, kind: BlockKind) -> Result<BlockId> {
        let inputs = kind.input_names();
        let outputs = kind.output_names();
        self.insert_block(parent, name, kind, inputs, outputs)
    }

    /// Add an empty composite block exposing the given ports.
    pub fn add_composite(
        &mut self,
        parent: BlockId,
        name: &str,
        type_name: &str,
        inputs: &[&str],
        outputs: &[&str],
    ) -> Result<BlockId> {
        self.insert_block(
            parent,
            name,
            BlockKind::composite(type_name),
            inputs.iter().map(|s| s.to_string()).collect(),
            outputs.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn insert_block(
        &mut self,
        parent: BlockId,
        name: &str,
        kind: BlockKind,
        inputs: Vec<String>,
        outputs: Vec<String>,
    ) -> Result<BlockId> {
        let parent_block = self.block(parent)?;
        if !parent_block.is_composite() {
            return Err(CbdError::NotComposite {
                block: self.path_of(parent),
            });
        }

        let name = if name.is_empty() {
            let generated = self.unique_block_name(parent, "", true)?;
            warn!(parent = %self.path_of(parent), name = %generated, "unnamed block, using generated name");
            generated
        } else {
            name.to_string()
        };

        if !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
            warn!(name = %name, "block name is not alphanumeric");
        }

        let parent_block = self.block(parent)?;
        if parent_block.child_index.contains_key(&name) || parent_block.has_port_named(&name) {
            let parent_path = self.path_of(parent);
            warn!(parent = %parent_path, name = %name, "block name already in use, block not added");
            return Err(CbdError::DuplicateBlock {
                parent: parent_path,
                name,
            });
        }

        let id = BlockId(self.blocks.len());
        self.blocks.push(Some(Block::new(name.clone(), kind, Some(parent), inputs, outputs)));
        let parent_block = self.block_mut(parent)?;
        parent_block.children.push(id);
        parent_block.child_index.insert(name, id);
        Ok(id)
    }

    /// A name not yet used by a child or port of `parent`: `prefix` itself
    /// when free, otherwise `prefix` followed by a counter (or its hashed
    /// form).
    pub fn unique_block_name(&self, parent: BlockId, prefix: &str, hashed: bool) -> Result<String> {
        let block = self.block(parent)?;
        let taken = |name: &str| name.is_empty() || block.child_index.contains_key(name) || block.has_port_named(name);
        let mut uid: u64 = if hashed { (self.blocks.len() as u64) << 16 | parent.0 as u64 } else { 1 };
        let mut name = prefix.to_string();
        while taken(&name) {
            let suffix = if hashed { hash64(uid) } else { uid.to_string() };
            name = format!("{}{}", prefix, suffix);
            uid += 1;
        }
        Ok(name)
    }

    /// Source port named by `from` inside `parent`: one of the parent's own
    /// inputs, or an output (default `OUT1`) of a child.
    fn resolve_source(&self, parent: BlockId, from: &str, output_port: Option<&str>) -> Result<PortId> {
        let parent_block = self.block(parent)?;
        if let Some(index) = parent_block.input_index(from) {
            return Ok(PortId::input(parent, index));
        }
        let child = parent_block
            .child(from)
            .ok_or_else(|| CbdError::block_not_found(self.child_path(parent, from)))?;
        let port_name = output_port.unwrap_or(DEFAULT_OUTPUT);
        let index = self
            .block(child)?
            .output_index(port_name)
            .ok_or_else(|| CbdError::port_not_found(self.path_of(child), port_name))?;
        Ok(PortId::output(child, index))
    }

    /// Target port named by `to` inside `parent`: one of the parent's own
    /// outputs, or an input of a child (default: the first free `INn`).
    fn resolve_target(&self, parent: BlockId, to: &str, input_port: Option<&str>) -> Result<PortId> {
        let parent_block = self.block(parent)?;
        if let Some(index) = parent_block.output_index(to) {
            return Ok(PortId::output(parent, index));
        }
        let child = parent_block
            .child(to)
            .ok_or_else(|| CbdError::block_not_found(self.child_path(parent, to)))?;
        let block = self.block(child)?;
        match input_port {
            Some(port_name) => {
                let index = block
                    .input_index(port_name)
                    .ok_or_else(|| CbdError::port_not_found(self.path_of(child), port_name))?;
                Ok(PortId::input(child, index))
            }
            None => {
                if block.kind.is_order_sensitive() {
                    return Err(CbdError::OrderSensitivePort {
                        block: self.path_of(child),
                        kind: block.kind.type_name().to_string(),
                    });
                }
                let index = self.free_input_port(block).ok_or_else(|| CbdError::NoFreeInputPort {
                    block: self.path_of(child),
                })?;
                Ok(PortId::input(child, index))
            }
        }
    }

    /// First unconnected `INn` port, in numeric order.
    fn free_input_port(&self, block: &Block) -> Option<usize> {
        (1..=block.inputs.len())
            .filter_map(|n| block.input_index(&format!("IN{}", n)))
            .find(|&index| block.inputs[index].incoming.is_none())
    }

    pub(super) fn child_path(&self, parent: BlockId, name: &str) -> String {
        if parent == self.root {
            name.to_string()
        } else {
            format!("{}{}{}", self.path_of(parent), PATH_SEPARATOR, name)
        }
    }

    /// Connect `from` to `to` inside `parent`, using the default ports.
    pub fn connect(&mut self, parent: BlockId, from: &str, to: &str) -> Result<()> {
        self.add_connection(parent, from, to, None, None)
    }

    /// Connect `from` to `to` inside `parent`.
    ///
    /// `from` is a child block (using `output_port`, default `OUT1`) or one
    /// of the parent's input ports. `to` is a child block (using
    /// `input_port`, default the first free `INn`) or one of the parent's
    /// output ports.
    pub fn add_connection(
        &mut self,
        parent: BlockId,
        from: &str,
        to: &str,
        output_port: Option<&str>,
        input_port: Option<&str>,
    ) -> Result<()> {
        let source = self.resolve_source(parent, from, output_port)?;
        let target = self.resolve_target(parent, to, input_port)?;
        self.connect_ports(source, target)
    }

    /// Connect two ports directly.
    ///
    /// The source must be a child's output or the enclosing composite's
    /// input; the target a child's input or the enclosing composite's
    /// output, both at the same level of the hierarchy.
    pub fn connect_ports(&mut self, source: PortId, target: PortId) -> Result<()> {
        let level = self.connection_level(source, target)?;

        let target_port = self.port(target)?;
        if target_port.incoming.is_some() {
            return Err(CbdError::FanIn {
                block: self.path_of(target.block),
                port: target_port.name.clone(),
            });
        }

        self.port_mut(source)?.outgoing.push(target);
        self.port_mut(target)?.incoming = Some(source);
        debug!(
            level = %self.path_of(level),
            source = %self.port_path(source),
            target = %self.port_path(target),
            "connected"
        );
        Ok(())
    }

    /// The composite a connection between `source` and `target` lives in.
    fn connection_level(&self, source: PortId, target: PortId) -> Result<BlockId> {
        self.port(source)?;
        self.port(target)?;
        let source_block = self.block(source.block)?;
        let level = match source.direction {
            PortDirection::Output => source_block.parent,
            PortDirection::Input if source_block.is_composite() => Some(source.block),
            PortDirection::Input => None,
        };
        let target_level = match target.direction {
            PortDirection::Input => self.block(target.block)?.parent,
            PortDirection::Output if self.block(target.block)?.is_composite() => Some(target.block),
            PortDirection::Output => None,
        };
        match (level, target_level) {
            (Some(a), Some(b)) if a == b => Ok(a),
            _ => Err(CbdError::InvalidConnection {
                parent: level.map(|l| self.path_of(l)).unwrap_or_default(),
                message: format!(
                    "cannot connect '{}' to '{}'",
                    self.port_path(source),
                    self.port_path(target)
                ),
            }),
        }
    }

    /// Remove the link between two ports.
    pub fn disconnect_ports(&mut self, source: PortId, target: PortId) -> Result<()> {
        if self.port(target)?.incoming != Some(source) {
            return Err(CbdError::InvalidConnection {
                parent: self.path_of(target.block),
                message: format!(
                    "'{}' is not connected to '{}'",
                    self.port_path(source),
                    self.port_path(target)
                ),
            });
        }
        self.port_mut(source)?.outgoing.retain(|p| *p != target);
        self.port_mut(target)?.incoming = None;
        Ok(())
    }

    /// Remove a connection created with [`Diagram::add_connection`]. When
    /// `input_port` is omitted, the first input of `to` driven by `from` is
    /// disconnected.
    pub fn remove_connection(
        &mut self,
        parent: BlockId,
        from: &str,
        to: &str,
        output_port: Option<&str>,
        input_port: Option<&str>,
    ) -> Result<()> {
        let source = self.resolve_source(parent, from, output_port)?;
        let target = match input_port {
            Some(_) => self.resolve_target(parent, to, input_port)?,
            None => {
                let parent_block = self.block(parent)?;
                if let Some(index) = parent_block.output_index(to) {
                    PortId::output(parent, index)
                } else {
                    let child = parent_block
                        .child(to)
                        .ok_or_else(|| CbdError::block_not_found(self.child_path(parent, to)))?;
                    let index = self
                        .block(child)?
                        .inputs
                        .iter()
                        .position(|p| p.incoming == Some(source))
                        .ok_or_else(|| CbdError::InvalidConnection {
                            parent: self.path_of(parent),
                            message: format!("'{}' does not drive '{}'", from, to),
                        })?;
                    PortId::input(child, index)
                }
            }
        };
        self.disconnect_ports(source, target)
    }

    // ============ Lookup ============

    /// Find a block by dotted path relative to the root. The empty path is
    /// the root. Names containing the separator (as produced by flattening)
    /// are matched greedily.
    pub fn find(&self, path: &str) -> Result<BlockId> {
        if path.is_empty() {
            return Ok(self.root);
        }
        let segments: Vec<&str> = path.split(PATH_SEPARATOR).collect();
        let mut current = self.root;
        let mut i = 0;
        'outer: while i < segments.len() {
            let block = self.block(current)?;
            for k in (1..=segments.len() - i).rev() {
                let candidate = segments[i..i + k].join(&PATH_SEPARATOR.to_string());
                if let Some(child) = block.child(&candidate) {
                    current = child;
                    i += k;
                    continue 'outer;
                }
            }
            return Err(CbdError::block_not_found(path));
        }
        Ok(current)
    }

    /// Find an output port by signal name: `block.port`, `block` (its
    /// `OUT1`) or a root port name.
    pub fn find_port(&self, path: &str) -> Result<PortId> {
        let root = self.block(self.root)?;
        if let Some(index) = root.output_index(path) {
            return Ok(PortId::output(self.root, index));
        }
        if let Some(index) = root.input_index(path) {
            return Ok(PortId::input(self.root, index));
        }
        if let Ok(id) = self.find(path) {
            if id != self.root {
                let block = self.block(id)?;
                let index = block
                    .output_index(DEFAULT_OUTPUT)
                    .ok_or_else(|| CbdError::port_not_found(path, DEFAULT_OUTPUT))?;
                return Ok(PortId::output(id, index));
            }
        }
        let (block_path, port_name) = path
            .rsplit_once(PATH_SEPARATOR)
            .ok_or_else(|| CbdError::block_not_found(path))?;
        let id = self.find(block_path)?;
        let index = self
            .block(id)?
            .output_index(port_name)
            .ok_or_else(|| CbdError::port_not_found(block_path, port_name))?;
        Ok(PortId::output(id, index))
    }

    /// Port of `block` called `name`, inputs first.
    pub fn port_by_name(&self, block: BlockId, name: &str) -> Result<PortId> {
        let b = self.block(block)?;
        if let Some(index) = b.input_index(name) {
            return Ok(PortId::input(block, index));
        }
        b.output_index(name)
            .map(|index| PortId::output(block, index))
            .ok_or_else(|| CbdError::port_not_found(self.path_of(block), name))
    }

    /// Signal history of an output port by name, following forwarding
    /// through composite ports.
    pub fn signal_history(&self, path: &str) -> Result<&SignalHistory> {
        let port = self.find_port(path)?;
        self.history_of(port)
    }

    /// Signal history carried by a port, following forwarding through
    /// composite ports.
    pub fn history_of(&self, port: PortId) -> Result<&SignalHistory> {
        let source = self.prev_closure(port)?;
        Ok(&self.port(source)?.history)
    }

    /// Dotted names of all output ports (nested blocks first, then the
    /// root outputs), in model order.
    pub fn all_signal_names(&self) -> Vec<String> {
        self.signal_ports().into_iter().map(|p| self.port_path(p)).collect()
    }

    /// The output ports named by [`Diagram::all_signal_names`], in the same
    /// order.
    pub fn signal_ports(&self) -> Vec<PortId> {
        let mut ports = Vec::new();
        self.collect_signal_ports(self.root, &mut ports);
        if let Ok(root) = self.block(self.root) {
            ports.extend((0..root.outputs.len()).map(|i| PortId::output(self.root, i)));
        }
        ports
    }

    fn collect_signal_ports(&self, id: BlockId, ports: &mut Vec<PortId>) {
        let Ok(block) = self.block(id) else { return };
        for &child in &block.children {
            let Ok(child_block) = self.block(child) else { continue };
            if child_block.is_composite() {
                self.collect_signal_ports(child, ports);
            }
            ports.extend((0..child_block.outputs.len()).map(|i| PortId::output(child, i)));
        }
    }

    // ============ Closures ============

    /// Follow incoming links through composite ports until a primitive
    /// output port or an undriven port is reached.
    pub fn prev_closure(&self, port: PortId) -> Result<PortId> {
        let mut visited = HashSet::new();
        let mut current = port;
        loop {
            if !visited.insert(current) {
                return Err(CbdError::ForwardingLoop {
                    port: self.port_path(port),
                });
            }
            if current.is_output() && !self.block(current.block)?.is_composite() {
                return Ok(current);
            }
            match self.port(current)?.incoming {
                Some(source) => current = source,
                None => return Ok(current),
            }
        }
    }

    /// Follow outgoing links through composite ports, collecting every
    /// primitive input port and every port without outgoing links.
    pub fn next_closure(&self, port: PortId) -> Result<Vec<PortId>> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![port];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                return Err(CbdError::ForwardingLoop {
                    port: self.port_path(port),
                });
            }
            let current_port = self.port(current)?;
            let primitive_input = current.is_input() && !self.block(current.block)?.is_composite();
            if current != port && (primitive_input || current_port.outgoing.is_empty()) {
                out.push(current);
                continue;
            }
            stack.extend(current_port.outgoing.iter().rev());
        }
        Ok(out)
    }

    /// The port whose history drives `input` of `block`.
    ///
    /// Fails when the chain ends anywhere other than a primitive output or
    /// a root input.
    pub fn driver_of(&self, input: PortId) -> Result<PortId> {
        let source = self.prev_closure(input)?;
        let drives = if source.is_output() {
            !self.block(source.block)?.is_composite()
        } else {
            source.block == self.root
        };
        if !drives {
            return Err(CbdError::UnconnectedInput {
                block: self.path_of(input.block),
                port: self.port(input)?.name.clone(),
            });
        }
        Ok(source)
    }

    /// Value driving input `index` of `block` at `iteration`.
    pub fn input_signal(&self, block: BlockId, index: usize, iteration: usize) -> Result<Signal> {
        let driver = self.driver_of(PortId::input(block, index))?;
        self.port(driver)?
            .history
            .get(iteration)
            .copied()
            .ok_or_else(|| CbdError::missing_signal(self.port_path(driver), iteration))
    }

    // ============ Signals ============

    /// Append a sample to a port's history.
    pub(crate) fn push_signal(&mut self, port: PortId, signal: Signal) -> Result<()> {
        self.port_mut(port)?.history.push(signal);
        Ok(())
    }

    /// Remove the newest sample of every port in the model.
    pub fn rewind(&mut self) {
        for block in self.blocks.iter_mut().flatten() {
            for port in block.all_ports_mut() {
                port.history.pop();
            }
        }
    }

    /// Empty every signal history, keeping the structure.
    pub fn clear_signals(&mut self) {
        for block in self.blocks.iter_mut().flatten() {
            for port in block.all_ports_mut() {
                port.history.clear();
            }
        }
    }

    // ============ Parameters ============

    /// Change the value of a constant block.
    pub fn set_constant(&mut self, path: &str, value: f64) -> Result<()> {
        let id = self.find(path)?;
        match &mut self.block_mut(id)?.kind {
            BlockKind::Constant { value: v } => {
                *v = value;
                Ok(())
            }
            other => Err(CbdError::invalid_parameter(
                path,
                format!("expected a Constant block, found {}", other.type_name()),
            )),
        }
    }

    /// Tag a block with an execution rate, or clear it with `None`.
    pub fn set_rate(&mut self, id: BlockId, rate: Option<f64>) -> Result<()> {
        if let Some(r) = rate {
            if !(r > 0.0 && r.is_finite()) {
                return Err(CbdError::invalid_parameter(
                    self.path_of(id),
                    format!("rate must be positive, got {}", r),
                ));
            }
        }
        self.block_mut(id)?.rate = rate;
        Ok(())
    }

    /// The single clock block of the model.
    pub fn clock(&self) -> Result<BlockId> {
        let clocks: Vec<BlockId> = self
            .primitive_blocks()
            .into_iter()
            .filter(|id| self.block(*id).map(|b| b.kind.is_clock()).unwrap_or(false))
            .collect();
        match clocks.len() {
            0 => Err(CbdError::MissingClock {
                model: self.name().to_string(),
            }),
            1 => Ok(clocks[0]),
            count => Err(CbdError::MultipleClocks {
                model: self.name().to_string(),
                count,
            }),
        }
    }

    /// Restart the clock at `start_time`.
    pub fn set_clock_start(&mut self, start_time: f64) -> Result<()> {
        let id = self.clock()?;
        if let BlockKind::Clock { start_time: t, .. } = &mut self.block_mut(id)?.kind {
            *t = start_time;
        }
        Ok(())
    }

    // ============ Validation ============

    /// Check that the model can be simulated: exactly one clock, every
    /// input of every primitive driven, and no forwarding loops.
    pub fn validate(&self) -> Result<()> {
        self.clock()?;
        for id in self.primitive_blocks() {
            let block = self.block(id)?;
            // An undriven clock keeps its start delta.
            if block.kind.is_clock() && block.inputs.iter().all(|p| p.incoming.is_none()) {
                continue;
            }
            for index in 0..block.inputs.len() {
                self.driver_of(PortId::input(id, index))?;
            }
        }
        let root = self.block(self.root)?;
        for index in 0..root.outputs.len() {
            self.prev_closure(PortId::output(self.root, index))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::BlockKind;

    fn adder_model() -> Diagram {
        let mut d = Diagram::new("model", &[], &["OUT1"]);
        let root = d.root();
        d.add_block(root, "c1", BlockKind::constant(1.0)).unwrap();
        d.add_block(root, "c2", BlockKind::constant(2.0)).unwrap();
        d.add_block(root, "sum", BlockKind::adder()).unwrap();
        d.connect(root, "c1", "sum").unwrap();
        d.connect(root, "c2", "sum").unwrap();
        d.connect(root, "sum", "OUT1").unwrap();
        d
    }

    #[test]
    fn test_hash64() {
        assert_eq!(hash64(0), "a");
        assert_eq!(hash64(63), "_");
        assert_eq!(hash64(64), "ba");
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut d = adder_model();
        let root = d.root();
        assert!(matches!(
            d.add_block(root, "sum", BlockKind::Negator),
            Err(CbdError::DuplicateBlock { .. })
        ));
        // Shadowing a port of the parent is refused as well.
        assert!(matches!(
            d.add_block(root, "OUT1", BlockKind::Negator),
            Err(CbdError::DuplicateBlock { .. })
        ));
        assert_eq!(d.children(root).unwrap().len(), 3);
    }

    #[test]
    fn test_unnamed_block_gets_generated_name() {
        let mut d = Diagram::new("model", &[], &[]);
        let root = d.root();
        let id = d.add_block(root, "", BlockKind::Negator).unwrap();
        let name = d.block(id).unwrap().name().to_string();
        assert!(!name.is_empty());
        assert_eq!(d.find(&name).unwrap(), id);
    }

    #[test]
    fn test_unique_block_name() {
        let d = adder_model();
        assert_eq!(d.unique_block_name(d.root(), "sum", false).unwrap(), "sum1");
        assert_eq!(d.unique_block_name(d.root(), "gain", false).unwrap(), "gain");
        assert_eq!(d.unique_block_name(d.root(), "c", false).unwrap(), "c");
    }

    #[test]
    fn test_default_input_ports_fill_in_order() {
        let d = adder_model();
        let sum = d.find("sum").unwrap();
        let block = d.block(sum).unwrap();
        let c1 = d.find("c1").unwrap();
        let c2 = d.find("c2").unwrap();
        assert_eq!(block.inputs()[0].incoming(), Some(PortId::output(c1, 0)));
        assert_eq!(block.inputs()[1].incoming(), Some(PortId::output(c2, 0)));
    }

    #[test]
    fn test_fan_in_and_full_ports() {
        let mut d = adder_model();
        let root = d.root();
        d.add_block(root, "c3", BlockKind::constant(3.0)).unwrap();
        assert!(matches!(
            d.connect(root, "c3", "sum"),
            Err(CbdError::NoFreeInputPort { .. })
        ));
        assert!(matches!(
            d.add_connection(root, "c3", "sum", None, Some("IN1")),
            Err(CbdError::FanIn { .. })
        ));
        assert!(matches!(
            d.add_connection(root, "c3", "sum", None, Some("IN7")),
            Err(CbdError::PortNotFound { .. })
        ));
    }

    #[test]
    fn test_order_sensitive_blocks_need_port_names() {
        let mut d = adder_model();
        let root = d.root();
        d.add_block(root, "mod", BlockKind::Modulo).unwrap();
        assert!(matches!(
            d.connect(root, "c1", "mod"),
            Err(CbdError::OrderSensitivePort { .. })
        ));
        d.add_connection(root, "c1", "mod", None, Some("IN2")).unwrap();
    }

    #[test]
    fn test_remove_connection() {
        let mut d = adder_model();
        let root = d.root();
        d.remove_connection(root, "c2", "sum", None, None).unwrap();
        let sum = d.find("sum").unwrap();
        assert!(d.block(sum).unwrap().inputs()[1].incoming().is_none());
        let c2 = d.find("c2").unwrap();
        assert!(d.block(c2).unwrap().outputs()[0].outgoing().is_empty());
        // Reconnecting takes the freed port.
        d.connect(root, "c2", "sum").unwrap();
    }

    #[test]
    fn test_closure_through_composites() {
        let mut d = Diagram::new("model", &[], &["y"]);
        let root = d.root();
        d.add_block(root, "src", BlockKind::constant(4.0)).unwrap();
        let outer = d.add_composite(root, "outer", "Outer", &["IN1"], &["OUT1"]).unwrap();
        let inner = d.add_composite(outer, "inner", "Inner", &["IN1"], &["OUT1"]).unwrap();
        let neg = d.add_block(inner, "neg", BlockKind::Negator).unwrap();
        d.connect(inner, "IN1", "neg").unwrap();
        d.connect(inner, "neg", "OUT1").unwrap();
        d.connect(outer, "IN1", "inner").unwrap();
        d.connect(outer, "inner", "OUT1").unwrap();
        d.connect(root, "src", "outer").unwrap();
        d.connect(root, "outer", "y").unwrap();

        let src = d.find("src").unwrap();
        assert_eq!(d.driver_of(PortId::input(neg, 0)).unwrap(), PortId::output(src, 0));
        assert_eq!(d.prev_closure(PortId::output(root, 0)).unwrap(), PortId::output(neg, 0));
        assert_eq!(d.next_closure(PortId::output(src, 0)).unwrap(), vec![PortId::input(neg, 0)]);
        assert_eq!(d.find("outer.inner.neg").unwrap(), neg);
        assert_eq!(d.path_of(neg), "outer.inner.neg");
        d.validate().unwrap_err();
    }

    #[test]
    fn test_forwarding_loop_detected() {
        let mut d = Diagram::new("model", &[], &[]);
        let root = d.root();
        let c = d.add_composite(root, "c", "Loop", &["IN1"], &["OUT1"]).unwrap();
        d.connect(c, "IN1", "OUT1").unwrap();
        d.connect(root, "c", "c").unwrap();
        assert!(matches!(
            d.prev_closure(PortId::input(c, 0)),
            Err(CbdError::ForwardingLoop { .. })
        ));
    }

    #[test]
    fn test_invalid_connection_across_levels() {
        let mut d = Diagram::new("model", &[], &[]);
        let root = d.root();
        let sub = d.add_composite(root, "sub", "Sub", &[], &[]).unwrap();
        let neg = d.add_block(sub, "neg", BlockKind::Negator).unwrap();
        let c = d.add_block(root, "c", BlockKind::constant(1.0)).unwrap();
        assert!(matches!(
            d.connect_ports(PortId::output(c, 0), PortId::input(neg, 0)),
            Err(CbdError::InvalidConnection { .. })
        ));
    }

    #[test]
    fn test_signal_names_and_lookup() {
        let mut d = Diagram::new("model", &[], &["OUT1"]);
        let root = d.root();
        d.add_block(root, "t", BlockKind::Time).unwrap();
        let sub = d.add_composite(root, "sub", "Sub", &["IN1"], &["OUT1"]).unwrap();
        d.add_block(sub, "neg", BlockKind::Negator).unwrap();
        d.connect(sub, "IN1", "neg").unwrap();
        d.connect(sub, "neg", "OUT1").unwrap();
        d.connect(root, "t", "sub").unwrap();
        d.connect(root, "sub", "OUT1").unwrap();

        assert_eq!(
            d.all_signal_names(),
            vec!["t.OUT1", "t.relative", "sub.neg.OUT1", "sub.OUT1", "OUT1"]
        );
        let neg = d.find("sub.neg").unwrap();
        assert_eq!(d.find_port("sub.neg").unwrap(), PortId::output(neg, 0));
        assert_eq!(d.find_port("t.relative").unwrap().index, 1);
        assert!(d.find_port("t.nothing").is_err());
        assert_eq!(d.port_by_name(sub, "IN1").unwrap(), PortId::input(sub, 0));
        assert_eq!(d.port_by_name(sub, "OUT1").unwrap(), PortId::output(sub, 0));
        assert!(d.port_by_name(neg, "IN7").is_err());
    }

    #[test]
    fn test_rewind_and_clear() {
        let mut d = adder_model();
        let c1 = d.find("c1").unwrap();
        let port = PortId::output(c1, 0);
        d.push_signal(port, Signal::new(0.0, 1.0)).unwrap();
        d.push_signal(port, Signal::new(1.0, 1.0)).unwrap();
        d.rewind();
        assert_eq!(d.signal_history("c1").unwrap().len(), 1);
        d.clear_signals();
        assert!(d.signal_history("c1").unwrap().is_empty());
    }

    #[test]
    fn test_set_constant_and_rate() {
        let mut d = adder_model();
        d.set_constant("c1", 9.0).unwrap();
        let c1 = d.find("c1").unwrap();
        assert_eq!(d.block(c1).unwrap().kind(), &BlockKind::constant(9.0));
        assert!(d.set_constant("sum", 1.0).is_err());
        assert!(d.set_rate(c1, Some(-1.0)).is_err());
        d.set_rate(c1, Some(0.5)).unwrap();
        assert_eq!(d.block(c1).unwrap().rate(), Some(0.5));
    }

    #[test]
    fn test_clock_lookup() {
        let mut d = adder_model();
        assert!(matches!(d.clock(), Err(CbdError::MissingClock { .. })));
        let root = d.root();
        d.add_block(root, "clk", BlockKind::clock(0.0, 1.0)).unwrap();
        d.add_block(root, "clk2", BlockKind::clock(0.0, 1.0)).unwrap();
        assert!(matches!(d.clock(), Err(CbdError::MultipleClocks { count: 2, .. })));
    }
}
