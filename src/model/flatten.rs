//! Flattening and cloning of composite blocks.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::diagram::{Block, Diagram, Port, PATH_SEPARATOR};
use super::signal::SignalHistory;
use super::types::{BlockId, PortDirection, PortId};
use crate::error::{CbdError, Result};

impl Diagram {
    /// Copy of the whole model without any signal history.
    pub fn deep_clone(&self) -> Diagram {
        let mut copy = self.clone();
        copy.clear_signals();
        copy
    }

    /// Copy the block `source` (with its whole sub-diagram) into `parent`
    /// under a new name.
    ///
    /// Connections inside the copied sub-diagram are re-established;
    /// connections to the outside and signal histories are not copied.
    pub fn clone_block(&mut self, source: BlockId, parent: BlockId, name: &str) -> Result<BlockId> {
        if source == self.root {
            return Err(CbdError::invalid_parameter("source", "the root block cannot be cloned into itself"));
        }
        let parent_block = self.block(parent)?;
        if !parent_block.is_composite() {
            return Err(CbdError::NotComposite {
                block: self.path_of(parent),
            });
        }
        if name.is_empty() || parent_block.child_index.contains_key(name) || parent_block.has_port_named(name) {
            let parent_path = self.path_of(parent);
            warn!(parent = %parent_path, name, "block name already in use, clone not added");
            return Err(CbdError::DuplicateBlock {
                parent: parent_path,
                name: name.to_string(),
            });
        }

        let subtree = self.descendants(source);
        let base = self.blocks.len();
        let mapping: HashMap<BlockId, BlockId> = subtree
            .iter()
            .enumerate()
            .map(|(i, old)| (*old, BlockId(base + i)))
            .collect();
        let remap = |p: PortId| mapping.get(&p.block).map(|b| PortId { block: *b, ..p });

        let mut copies = Vec::with_capacity(subtree.len());
        for old in &subtree {
            let block = self.block(*old)?;
            let top = *old == source;
            // The copied block's own links to its siblings stay behind.
            let copy_port = |port: &Port| Port {
                name: port.name.clone(),
                direction: port.direction,
                incoming: if top && port.direction == PortDirection::Input {
                    None
                } else {
                    port.incoming.and_then(remap)
                },
                outgoing: if top && port.direction == PortDirection::Output {
                    Vec::new()
                } else {
                    port.outgoing.iter().filter_map(|p| remap(*p)).collect()
                },
                history: SignalHistory::new(),
            };
            copies.push(Block {
                name: if top { name.to_string() } else { block.name.clone() },
                kind: block.kind.clone(),
                parent: if top {
                    Some(parent)
                } else {
                    block.parent.and_then(|p| mapping.get(&p).copied())
                },
                inputs: block.inputs.iter().map(copy_port).collect(),
                outputs: block.outputs.iter().map(copy_port).collect(),
                children: block.children.iter().filter_map(|c| mapping.get(c).copied()).collect(),
                child_index: block
                    .child_index
                    .iter()
                    .filter_map(|(n, c)| mapping.get(c).map(|m| (n.clone(), *m)))
                    .collect(),
                rate: block.rate,
            });
        }

        self.blocks.extend(copies.into_iter().map(Some));
        let id = BlockId(base);
        let parent_block = self.block_mut(parent)?;
        parent_block.children.push(id);
        parent_block.child_index.insert(name.to_string(), id);
        Ok(id)
    }

    /// Inline every composite child of `id` (recursively), except those
    /// whose type name is listed in `ignore`.
    ///
    /// Children of an inlined composite are renamed `composite.child` and
    /// rewired through the composite's ports, which disappear with it.
    pub fn flatten(&mut self, id: BlockId, ignore: &[&str]) -> Result<()> {
        if !self.block(id)?.is_composite() {
            return Err(CbdError::NotComposite {
                block: self.path_of(id),
            });
        }
        let children = self.block(id)?.children.clone();
        for child in children {
            let kind = &self.block(child)?.kind;
            if !kind.is_composite() || ignore.contains(&kind.type_name()) {
                continue;
            }
            self.flatten(child, ignore)?;
            self.inline_composite(id, child)?;
        }
        Ok(())
    }

    /// Flattened copy of the whole model, without signal histories.
    pub fn flattened(&self, ignore: &[&str]) -> Result<Diagram> {
        let mut copy = self.deep_clone();
        let root = copy.root();
        copy.flatten(root, ignore)?;
        Ok(copy)
    }

    fn inline_composite(&mut self, parent: BlockId, composite: BlockId) -> Result<()> {
        let (prefix, n_inputs, n_outputs, children) = {
            let block = self.block(composite)?;
            (block.name.clone(), block.inputs.len(), block.outputs.len(), block.children.clone())
        };
        debug!(composite = %self.path_of(composite), "inlining");

        // Inputs first: a pass-through link from an input to an output is
        // then handled by the output pass.
        let ports = (0..n_inputs)
            .map(|i| PortId::input(composite, i))
            .chain((0..n_outputs).map(|i| PortId::output(composite, i)));
        for port_id in ports {
            let (source, targets) = {
                let port = self.port(port_id)?;
                (port.incoming, port.outgoing.clone())
            };
            if let Some(src) = source {
                self.disconnect_ports(src, port_id)?;
            }
            for target in targets {
                self.disconnect_ports(port_id, target)?;
                if let Some(src) = source {
                    self.link(src, target)?;
                }
            }
        }

        for child in children {
            let name = format!("{}{}{}", prefix, PATH_SEPARATOR, self.block(child)?.name);
            self.reparent(child, parent, name)?;
        }
        self.remove_block(composite)?;
        Ok(())
    }

    /// Link two ports without checking hierarchy levels.
    fn link(&mut self, source: PortId, target: PortId) -> Result<()> {
        self.port_mut(source)?.outgoing.push(target);
        self.port_mut(target)?.incoming = Some(source);
        Ok(())
    }

    /// Move `child` under `parent` with a new local name.
    fn reparent(&mut self, child: BlockId, parent: BlockId, name: String) -> Result<()> {
        let parent_block = self.block(parent)?;
        if parent_block.child_index.contains_key(&name) || parent_block.has_port_named(&name) {
            return Err(CbdError::DuplicateBlock {
                parent: self.path_of(parent),
                name,
            });
        }
        self.detach(child)?;
        let parent_block = self.block_mut(parent)?;
        parent_block.children.push(child);
        parent_block.child_index.insert(name.clone(), child);
        let block = self.block_mut(child)?;
        block.parent = Some(parent);
        block.name = name;
        Ok(())
    }

    fn detach(&mut self, id: BlockId) -> Result<()> {
        let (parent, name) = {
            let block = self.block(id)?;
            (block.parent, block.name.clone())
        };
        if let Some(parent) = parent {
            let parent_block = self.block_mut(parent)?;
            parent_block.children.retain(|c| *c != id);
            parent_block.child_index.remove(&name);
        }
        Ok(())
    }

    fn remove_block(&mut self, id: BlockId) -> Result<()> {
        self.detach(id)?;
        self.blocks[id.0] = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::blocks::{library, BlockKind};
    use crate::model::{Diagram, PortId};

    fn nested_model() -> Diagram {
        let mut d = Diagram::new("model", &[], &["OUT1"]);
        let root = d.root();
        d.add_block(root, "time", BlockKind::Time).unwrap();
        library::add_one(&mut d, root, "add1").unwrap();
        d.connect(root, "time", "add1").unwrap();
        d.connect(root, "add1", "OUT1").unwrap();
        d
    }

    fn child_names(d: &Diagram) -> Vec<String> {
        let mut names: Vec<String> = d
            .children(d.root())
            .unwrap()
            .iter()
            .map(|id| d.block(*id).unwrap().name().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_flatten_renames_and_rewires() {
        let d = nested_model();
        let flat = d.flattened(&[]).unwrap();
        assert_eq!(child_names(&flat), vec!["add1.OneConstant", "add1.PlusOne", "time"]);

        let plus = flat.find("add1.PlusOne").unwrap();
        let time = flat.find("time").unwrap();
        let one = flat.find("add1.OneConstant").unwrap();
        let inputs = flat.block(plus).unwrap().inputs();
        assert_eq!(inputs[0].incoming(), Some(PortId::output(time, 0)));
        assert_eq!(inputs[1].incoming(), Some(PortId::output(one, 0)));
        assert_eq!(
            flat.prev_closure(PortId::output(flat.root(), 0)).unwrap(),
            PortId::output(plus, 0)
        );
        // The source block is untouched.
        assert!(d.find("add1.PlusOne").is_ok());
        assert_eq!(child_names(&d), vec!["add1", "time"]);
    }

    #[test]
    fn test_flatten_ignores_listed_types() {
        let d = nested_model();
        let flat = d.flattened(&["AddOne"]).unwrap();
        assert_eq!(child_names(&flat), vec!["add1", "time"]);
    }

    #[test]
    fn test_flatten_pass_through_and_empty_composites() {
        let mut d = Diagram::new("model", &[], &["OUT1"]);
        let root = d.root();
        d.add_block(root, "c", BlockKind::constant(2.0)).unwrap();
        let wire = d.add_composite(root, "wire", "Wire", &["IN1"], &["OUT1"]).unwrap();
        d.connect(wire, "IN1", "OUT1").unwrap();
        d.add_composite(root, "empty", "Empty", &[], &[]).unwrap();
        d.add_block(root, "neg", BlockKind::Negator).unwrap();
        d.connect(root, "c", "wire").unwrap();
        d.connect(root, "wire", "neg").unwrap();
        d.connect(root, "neg", "OUT1").unwrap();

        let root = d.root();
        d.flatten(root, &[]).unwrap();
        assert_eq!(child_names(&d), vec!["c", "neg"]);
        let c = d.find("c").unwrap();
        let neg = d.find("neg").unwrap();
        assert_eq!(d.block(neg).unwrap().inputs()[0].incoming(), Some(PortId::output(c, 0)));
        assert_eq!(d.block(c).unwrap().outputs()[0].outgoing(), &[PortId::input(neg, 0)]);
    }

    #[test]
    fn test_nested_flatten_uses_full_prefix() {
        let mut d = Diagram::new("model", &[], &[]);
        let root = d.root();
        let outer = d.add_composite(root, "outer", "Outer", &[], &[]).unwrap();
        let inner = d.add_composite(outer, "inner", "Inner", &[], &[]).unwrap();
        d.add_block(inner, "k", BlockKind::constant(1.0)).unwrap();
        d.flatten(root, &[]).unwrap();
        assert_eq!(child_names(&d), vec!["outer.inner.k"]);
        assert!(d.find("outer.inner.k").is_ok());
    }

    #[test]
    fn test_clone_block_copies_internals_only() {
        let mut d = nested_model();
        let root = d.root();
        let add1 = d.find("add1").unwrap();
        let copy = d.clone_block(add1, root, "add2").unwrap();

        let plus = d.find("add2.PlusOne").unwrap();
        let one = d.find("add2.OneConstant").unwrap();
        assert_eq!(d.block(plus).unwrap().parent(), Some(copy));
        assert_eq!(
            d.block(plus).unwrap().inputs()[1].incoming(),
            Some(PortId::output(one, 0))
        );
        // The external input link of the source block is not copied.
        assert!(d.block(copy).unwrap().inputs()[0].incoming().is_none());
        assert!(d.block(copy).unwrap().outputs()[0].outgoing().is_empty());
        assert!(d.clone_block(add1, root, "add2").is_err());
    }

    #[test]
    fn test_deep_clone_drops_histories() {
        let mut d = nested_model();
        let time = d.find("time").unwrap();
        d.push_signal(PortId::output(time, 0), crate::model::Signal::new(0.0, 0.0))
            .unwrap();
        let copy = d.deep_clone();
        assert!(copy.signal_history("time").unwrap().is_empty());
        assert_eq!(d.signal_history("time").unwrap().len(), 1);
    }
}
