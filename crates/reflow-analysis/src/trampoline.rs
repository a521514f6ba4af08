//! Trampoline composition.
//!
//! A patch tool splices instrumentation into a function by rewriting one
//! instruction into a jump to a wrapper region: a setup block saving state,
//! one or more payload blocks, and takedown/breakout blocks restoring state
//! before rejoining the original code. Left alone, those blocks distort
//! every downstream analysis. Composition collapses each declared group
//! into one opaque node before the `Cfg` is assembled, keyed by the setup
//! block's address, with the member instructions preserved for payload
//! pattern matching.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use reflow_core::{CfgBlock, NodeId, PatchEvent, TrampolineCase, TrampolineInfo, TrampolineRole};
use tracing::debug;

use crate::error::TrampolineError;

/// Rewrites raw block/edge tables, replacing each patch event's member
/// blocks with a single trampoline node.
pub struct TrampolineComposer {
    events: IndexMap<u64, PatchEvent>,
    max_payload_chain: usize,
}

impl TrampolineComposer {
    pub fn new(events: IndexMap<u64, PatchEvent>, max_payload_chain: usize) -> Self {
        Self {
            events,
            max_payload_chain,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Composes every declared trampoline, in event order.
    pub fn compose(
        &self,
        blocks: &mut IndexMap<NodeId, CfgBlock>,
        edges: &mut IndexMap<NodeId, Vec<NodeId>>,
    ) -> Result<(), TrampolineError> {
        for (&wrapper, event) in &self.events {
            self.compose_one(wrapper, event, blocks, edges)?;
        }
        Ok(())
    }

    fn compose_one(
        &self,
        wrapper: u64,
        event: &PatchEvent,
        blocks: &mut IndexMap<NodeId, CfgBlock>,
        edges: &mut IndexMap<NodeId, Vec<NodeId>>,
    ) -> Result<(), TrampolineError> {
        let setup = NodeId::Block(wrapper);
        if !blocks.contains_key(&setup) {
            return Err(TrampolineError::MissingMember(setup));
        }
        let ft_dest = event
            .fallthrough_destination
            .ok_or(TrampolineError::MissingFallthrough(wrapper))?;
        let ft_node = NodeId::Block(ft_dest);

        let cases = event.case_set();
        let mut info = TrampolineInfo::new(event.clone());
        info.add_role(TrampolineRole::Setup, setup);

        let members = if cases == BTreeSet::from([TrampolineCase::Fallthrough]) {
            self.compose_single_path(wrapper, setup, ft_node, edges, &mut info)?
        } else if cases == BTreeSet::from([TrampolineCase::Break, TrampolineCase::Fallthrough]) {
            self.compose_decision(wrapper, setup, ft_node, edges, &mut info)?
        } else {
            return Err(TrampolineError::UnrecognizedShape {
                wrapper,
                cases: event.cases.clone(),
            });
        };
        info.add_role(TrampolineRole::Fallthrough, ft_node);

        // Single-entry contract: nothing outside may target an interior
        // member. Edges into the setup block stay valid because the setup
        // address names the composed node.
        for (&src, tgts) in edges.iter() {
            if members.contains(&src) {
                continue;
            }
            for &tgt in tgts {
                if tgt != setup && members.contains(&tgt) {
                    return Err(TrampolineError::EntersInterior { src, member: tgt });
                }
            }
        }

        for &member in &members {
            for &tgt in successors(edges, member) {
                if members.contains(&tgt) {
                    info.add_internal_edge(member, tgt);
                }
            }
            let block = blocks
                .get(&member)
                .ok_or(TrampolineError::MissingMember(member))?;
            info.add_member_code(member, block.instruction_list());
        }

        // The breakout arm keeps its external target as the composed
        // node's first successor; rejoining code is always last.
        let new_succs = match info.role_node(TrampolineRole::Breakout) {
            Some(breakout) => {
                let tgt = single_successor(edges, breakout)?;
                vec![tgt, ft_node]
            }
            None => vec![ft_node],
        };

        debug!(
            "composed trampoline at {:#x}: {} members, {} successors",
            wrapper,
            members.len(),
            new_succs.len()
        );

        for &member in &members {
            edges.shift_remove(&member);
            if member != setup {
                blocks.shift_remove(&member);
            }
        }
        edges.insert(setup, new_succs);
        blocks.insert(setup, CfgBlock::trampoline(wrapper, info));
        Ok(())
    }

    /// `{fallthrough}`: setup, payload chain, takedown whose single
    /// successor is the declared fallthrough destination.
    fn compose_single_path(
        &self,
        wrapper: u64,
        setup: NodeId,
        ft_node: NodeId,
        edges: &IndexMap<NodeId, Vec<NodeId>>,
        info: &mut TrampolineInfo,
    ) -> Result<Vec<NodeId>, TrampolineError> {
        let mut chain = Vec::new();
        let mut cur = setup;
        loop {
            let next = single_successor(edges, cur)?;
            if next == ft_node {
                break;
            }
            if chain.len() > self.max_payload_chain {
                return Err(TrampolineError::PayloadChain {
                    wrapper,
                    limit: self.max_payload_chain,
                });
            }
            chain.push(next);
            cur = next;
        }
        // Last chain node rejoins the original code: that is the takedown.
        let takedown = chain
            .pop()
            .ok_or(TrampolineError::MissingPayload(wrapper))?;
        if chain.is_empty() {
            return Err(TrampolineError::MissingPayload(wrapper));
        }
        add_payload_roles(info, &chain);
        info.add_role(TrampolineRole::Takedown, takedown);

        let mut members = vec![setup];
        members.extend_from_slice(&chain);
        members.push(takedown);
        Ok(members)
    }

    /// `{break, fallthrough}`: setup, payload chain, a two-way decision
    /// block whose arms are the takedown (rejoins at the fallthrough
    /// destination) and the breakout (leaves the patched region).
    fn compose_decision(
        &self,
        wrapper: u64,
        setup: NodeId,
        ft_node: NodeId,
        edges: &IndexMap<NodeId, Vec<NodeId>>,
        info: &mut TrampolineInfo,
    ) -> Result<Vec<NodeId>, TrampolineError> {
        let mut chain = Vec::new();
        let mut cur = setup;
        let decision = loop {
            let next = single_successor(edges, cur)?;
            if next == ft_node {
                // Rejoined without ever presenting a decision block.
                return Err(TrampolineError::UnrecognizedShape {
                    wrapper,
                    cases: info.event().cases.clone(),
                });
            }
            match successors(edges, next).len() {
                1 => {
                    if chain.len() >= self.max_payload_chain {
                        return Err(TrampolineError::PayloadChain {
                            wrapper,
                            limit: self.max_payload_chain,
                        });
                    }
                    chain.push(next);
                    cur = next;
                }
                2 => break next,
                n => {
                    return Err(TrampolineError::Arity {
                        block: next,
                        expected: 2,
                        found: n,
                    })
                }
            }
        };
        if chain.is_empty() {
            return Err(TrampolineError::MissingPayload(wrapper));
        }
        add_payload_roles(info, &chain);
        info.add_role(TrampolineRole::Decision, decision);

        let arms = successors(edges, decision).to_vec();
        let first_rejoins = successors(edges, arms[0]) == [ft_node];
        let second_rejoins = successors(edges, arms[1]) == [ft_node];
        let (takedown, breakout) = match (first_rejoins, second_rejoins) {
            (true, false) => (arms[0], arms[1]),
            (false, true) => (arms[1], arms[0]),
            _ => return Err(TrampolineError::AmbiguousDecision(decision)),
        };
        let breakout_succs = successors(edges, breakout);
        if breakout_succs.len() != 1 {
            return Err(TrampolineError::Arity {
                block: breakout,
                expected: 1,
                found: breakout_succs.len(),
            });
        }
        info.add_role(TrampolineRole::Takedown, takedown);
        info.add_role(TrampolineRole::Breakout, breakout);

        let mut members = vec![setup];
        members.extend_from_slice(&chain);
        members.push(decision);
        members.push(takedown);
        members.push(breakout);
        Ok(members)
    }
}

fn successors<'a>(edges: &'a IndexMap<NodeId, Vec<NodeId>>, node: NodeId) -> &'a [NodeId] {
    edges.get(&node).map(Vec::as_slice).unwrap_or(&[])
}

fn single_successor(
    edges: &IndexMap<NodeId, Vec<NodeId>>,
    node: NodeId,
) -> Result<NodeId, TrampolineError> {
    let succs = successors(edges, node);
    if succs.len() != 1 {
        return Err(TrampolineError::Arity {
            block: node,
            expected: 1,
            found: succs.len(),
        });
    }
    Ok(succs[0])
}

fn add_payload_roles(info: &mut TrampolineInfo, chain: &[NodeId]) {
    if let [payload] = chain {
        info.add_role(TrampolineRole::Payload, *payload);
    } else {
        for (i, &node) in chain.iter().enumerate() {
            info.add_role(TrampolineRole::PayloadPart(i as u32 + 1), node);
        }
    }
}
