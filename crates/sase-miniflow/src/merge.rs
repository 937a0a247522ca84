//! Chain merge
//!
//! Folds the constituents of a chain into one hardware rule equivalent to
//! traversing the whole chain.
//!
//! # Rules
//!
//! - Match criteria are ORed together. An outer field overwritten by a later
//!   rewrite is left out of every earlier constituent's match; the rewriting
//!   constituent keeps its own criterion on it.
//! - The packet's wire 5-tuple is carried as a separate explicit match, so
//!   the merged rule stays pinned to one connection.
//! - Actions are unioned; CT and GOTO are dropped since the chain has been
//!   flattened.
//! - Destinations and rewrites are concatenated in chain order, bounded by
//!   [`MergeLimits`].
//! - Tunnel metadata comes from the last constituent carrying any.

use std::collections::BTreeSet;

use crate::error::{MergeError, MergeResult, Resource};
use crate::matching::{anti_mask, HeaderMatch, HeaderRewrite, MatchField, MatchLevel, MatchSpec, RewriteField};
use crate::rules::{ActionFlags, CounterId, Destination, RuleSnapshot, TunnelInfo};
use crate::tuple::{ConnStep, FiveTuple, NatKind, IPPROTO_TCP, IPPROTO_UDP, ETH_P_IP, TCP_ACK, TCP_FIN, TCP_RST, TCP_SYN};

/// Bounds applied while merging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeLimits {
    /// Maximum forward destinations
    pub max_fanout: usize,
    /// Maximum header rewrites
    pub max_rewrites: usize,
}

/// One resolved step of a chain, ready to merge
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Constituent {
    /// Match criteria
    pub matches: MatchSpec,
    /// Actions
    pub actions: ActionFlags,
    /// Header rewrites
    pub rewrites: Vec<HeaderRewrite>,
    /// Forward destinations
    pub dests: Vec<Destination>,
    /// Mirror splits among `dests`
    pub split_count: usize,
    /// Encapsulation metadata
    pub tunnel: Option<TunnelInfo>,
    /// Counter to link to the merged flow
    pub counter: Option<CounterId>,
}

impl From<RuleSnapshot> for Constituent {
    fn from(rule: RuleSnapshot) -> Self {
        Self {
            matches: rule.matches,
            actions: rule.actions,
            rewrites: rule.rewrites,
            dests: rule.dests,
            split_count: rule.split_count,
            tunnel: rule.tunnel,
            counter: rule.counter,
        }
    }
}

impl Constituent {
    /// Synthetic step for a tracked connection: count, plus NAT if any
    pub fn from_conn(step: &ConnStep) -> Self {
        let mut actions = ActionFlags::COUNT;
        let mut rewrites = Vec::new();

        if let Some(nat) = step.nat {
            actions |= ActionFlags::MOD_HDR;
            let proto = step.key.tuple.protocol;
            let (addr, port) = match (nat.kind, proto) {
                (NatKind::Source, IPPROTO_TCP) => (RewriteField::SrcIpv4, Some(RewriteField::TcpSport)),
                (NatKind::Source, IPPROTO_UDP) => (RewriteField::SrcIpv4, Some(RewriteField::UdpSport)),
                (NatKind::Source, _) => (RewriteField::SrcIpv4, None),
                (NatKind::Destination, IPPROTO_TCP) => (RewriteField::DstIpv4, Some(RewriteField::TcpDport)),
                (NatKind::Destination, IPPROTO_UDP) => (RewriteField::DstIpv4, Some(RewriteField::UdpDport)),
                (NatKind::Destination, _) => (RewriteField::DstIpv4, None),
            };
            rewrites.push(HeaderRewrite::new(addr, nat.addr as u64));
            if let Some(port_field) = port {
                rewrites.push(HeaderRewrite::new(port_field, nat.port as u64));
            }
        }

        Self {
            actions,
            rewrites,
            ..Default::default()
        }
    }
}

/// Explicit 5-tuple match of a merged flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleMatch {
    /// Wire tuple of the triggering packet
    pub tuple: FiveTuple,
    /// Match the tuple on inner headers (chain decapsulates)
    pub on_inner: bool,
}

impl TupleMatch {
    /// Header criteria for the tuple
    pub fn header_match(&self) -> HeaderMatch {
        let t = &self.tuple;
        let mut m = HeaderMatch::new();
        m.set_exact(MatchField::EtherType, ETH_P_IP as u64)
            .set_exact(MatchField::IpVersion, 4)
            .set_exact(MatchField::SrcIpv4, t.src_ip as u64)
            .set_exact(MatchField::DstIpv4, t.dst_ip as u64)
            .set_exact(MatchField::IpProto, t.protocol as u64);

        match t.protocol {
            IPPROTO_TCP => {
                m.set_exact(MatchField::TcpSport, t.src_port as u64)
                    .set_exact(MatchField::TcpDport, t.dst_port as u64)
                    .set(
                        MatchField::TcpFlags,
                        TCP_ACK as u64,
                        (TCP_ACK | TCP_FIN | TCP_SYN | TCP_RST) as u64,
                    );
            }
            IPPROTO_UDP => {
                m.set_exact(MatchField::UdpSport, t.src_port as u64)
                    .set_exact(MatchField::UdpDport, t.dst_port as u64);
            }
            _ => {}
        }
        m
    }
}

/// Result of merging a chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedArtifact {
    /// Folded constituent criteria, anti-mask applied
    pub matches: MatchSpec,
    /// Connection pin
    pub tuple: TupleMatch,
    /// Union of actions
    pub actions: ActionFlags,
    /// Rewrites in chain order
    pub rewrites: Vec<HeaderRewrite>,
    /// Destinations in chain order
    pub dests: Vec<Destination>,
    /// Mirror splits among `dests`
    pub split_count: usize,
    /// Encapsulation metadata
    pub tunnel: Option<TunnelInfo>,
    /// Constituent counters to link
    pub counters: Vec<CounterId>,
}

impl MergedArtifact {
    /// Match to program: constituent criteria plus the tuple pin
    pub fn full_match(&self) -> MatchSpec {
        let mut spec = self.matches.clone();
        let pin = MatchSpec::outer(self.tuple.header_match(), MatchLevel::L4);
        if self.tuple.on_inner {
            spec.inner.fold(&pin.outer, &BTreeSet::new());
            spec.inner_level = spec.inner_level.max(MatchLevel::L4);
        } else {
            spec.outer.fold(&pin.outer, &BTreeSet::new());
            spec.outer_level = spec.outer_level.max(MatchLevel::L4);
        }
        spec
    }
}

/// Merge resolved constituents, in chain order, into one artifact
pub fn merge_chain(
    constituents: &[Constituent],
    tuple: FiveTuple,
    limits: MergeLimits,
) -> MergeResult<MergedArtifact> {
    // Walk backwards so each constituent only loses fields rewritten after it.
    let mut matches = MatchSpec::default();
    let mut anti = BTreeSet::new();
    for c in constituents.iter().rev() {
        matches.fold(&c.matches, &anti);
        anti.extend(anti_mask(&c.rewrites));
    }

    let mut actions = ActionFlags::empty();
    let mut rewrites = Vec::new();
    let mut dests = Vec::new();
    let mut split_count = 0;
    let mut tunnel = None;
    let mut counters = Vec::new();

    for c in constituents {
        actions |= c.actions;

        if c.actions.contains(ActionFlags::FWD_DEST) {
            if dests.len() + c.dests.len() > limits.max_fanout {
                return Err(MergeError::ResourceExhausted(Resource::Fanout));
            }
            dests.extend_from_slice(&c.dests);
            split_count += c.split_count;
        }

        if rewrites.len() + c.rewrites.len() > limits.max_rewrites {
            return Err(MergeError::ResourceExhausted(Resource::Rewrites));
        }
        rewrites.extend_from_slice(&c.rewrites);

        if c.tunnel.is_some() {
            tunnel = c.tunnel;
        }
        if let Some(counter) = c.counter {
            counters.push(counter);
        }
    }

    actions -= ActionFlags::CHAINING;

    Ok(MergedArtifact {
        matches,
        tuple: TupleMatch {
            tuple,
            on_inner: actions.contains(ActionFlags::DECAP),
        },
        actions,
        rewrites,
        dests,
        split_count,
        tunnel,
        counters,
    })
}
