//! Match criteria and header rewrites
//!
//! Rules match on a value/mask pair per header field, split into outer and
//! inner (post-decap) headers. Merging ORs criteria together, skipping any
//! field listed in an anti-mask.

use std::collections::{BTreeMap, BTreeSet};

/// Matchable header field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MatchField {
    /// Destination MAC
    DstMac,
    /// Source MAC
    SrcMac,
    /// EtherType
    EtherType,
    /// IP version (4 or 6)
    IpVersion,
    /// IPv4 TTL
    IpTtl,
    /// IPv4 source address
    SrcIpv4,
    /// IPv4 destination address
    DstIpv4,
    /// IP protocol
    IpProto,
    /// TCP source port
    TcpSport,
    /// TCP destination port
    TcpDport,
    /// TCP flags
    TcpFlags,
    /// UDP source port
    UdpSport,
    /// UDP destination port
    UdpDport,
}

impl MatchField {
    /// Mask covering the full width of the field
    pub const fn full_mask(&self) -> u64 {
        match self {
            MatchField::DstMac | MatchField::SrcMac => 0xffff_ffff_ffff,
            MatchField::EtherType => 0xffff,
            MatchField::IpVersion => 0xf,
            MatchField::IpTtl | MatchField::IpProto => 0xff,
            MatchField::SrcIpv4 | MatchField::DstIpv4 => 0xffff_ffff,
            MatchField::TcpSport
            | MatchField::TcpDport
            | MatchField::UdpSport
            | MatchField::UdpDport => 0xffff,
            MatchField::TcpFlags => 0x1ff,
        }
    }
}

/// Value and mask for one field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldMatch {
    /// Expected value, already masked
    pub value: u64,
    /// Bits that take part in the match
    pub mask: u64,
}

/// Criteria for one header level
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeaderMatch {
    fields: BTreeMap<MatchField, FieldMatch>,
}

impl HeaderMatch {
    /// Empty match (matches everything)
    pub fn new() -> Self {
        Self::default()
    }

    /// Match `field` on the bits in `mask`
    pub fn set(&mut self, field: MatchField, value: u64, mask: u64) -> &mut Self {
        let mask = mask & field.full_mask();
        self.fields.insert(field, FieldMatch { value: value & mask, mask });
        self
    }

    /// Match `field` exactly
    pub fn set_exact(&mut self, field: MatchField, value: u64) -> &mut Self {
        self.set(field, value, field.full_mask())
    }

    /// Builder form of `set_exact`
    pub fn with(mut self, field: MatchField, value: u64) -> Self {
        self.set_exact(field, value);
        self
    }

    /// Criteria for `field`, if matched
    pub fn get(&self, field: MatchField) -> Option<FieldMatch> {
        self.fields.get(&field).copied()
    }

    /// Whether `field` takes part in the match
    pub fn contains(&self, field: MatchField) -> bool {
        self.fields.contains_key(&field)
    }

    /// Matched fields in field order
    pub fn fields(&self) -> impl Iterator<Item = (MatchField, FieldMatch)> + '_ {
        self.fields.iter().map(|(f, m)| (*f, *m))
    }

    /// No criteria
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// OR `other` into this match, skipping fields in `anti_mask`
    pub fn fold(&mut self, other: &HeaderMatch, anti_mask: &BTreeSet<MatchField>) {
        for (field, m) in other.fields() {
            if anti_mask.contains(&field) {
                continue;
            }
            let entry = self.fields.entry(field).or_default();
            entry.value |= m.value & m.mask;
            entry.mask |= m.mask;
        }
    }
}

/// Deepest header layer a match inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum MatchLevel {
    /// No header criteria
    #[default]
    None,
    /// Ethernet
    L2,
    /// IP
    L3,
    /// TCP/UDP
    L4,
}

/// Complete match of a rule
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchSpec {
    /// Outer headers
    pub outer: HeaderMatch,
    /// Inner headers of a tunnelled packet
    pub inner: HeaderMatch,
    /// Layer depth of outer criteria
    pub outer_level: MatchLevel,
    /// Layer depth of inner criteria
    pub inner_level: MatchLevel,
    /// Match applies to tunnelled traffic
    pub tunnel: bool,
}

impl MatchSpec {
    /// Match on outer headers only
    pub fn outer(outer: HeaderMatch, level: MatchLevel) -> Self {
        Self {
            outer,
            outer_level: level,
            ..Default::default()
        }
    }

    /// Fold `other` into this match; `anti_mask` applies to outer headers
    pub fn fold(&mut self, other: &MatchSpec, anti_mask: &BTreeSet<MatchField>) {
        self.outer.fold(&other.outer, anti_mask);
        self.inner.fold(&other.inner, &BTreeSet::new());
        self.outer_level = self.outer_level.max(other.outer_level);
        self.inner_level = self.inner_level.max(other.inner_level);
        self.tunnel |= other.tunnel;
    }
}

/// Header field a rewrite action can modify
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RewriteField {
    /// Source MAC
    SrcMac,
    /// Destination MAC
    DstMac,
    /// EtherType
    EtherType,
    /// IPv4 TTL
    IpTtl,
    /// IPv4 DSCP
    IpDscp,
    /// IPv4 source address
    SrcIpv4,
    /// IPv4 destination address
    DstIpv4,
    /// TCP source port
    TcpSport,
    /// TCP destination port
    TcpDport,
    /// UDP source port
    UdpSport,
    /// UDP destination port
    UdpDport,
}

impl RewriteField {
    /// Match field whose wire value this rewrite replaces
    pub const fn overwrites(&self) -> Option<MatchField> {
        match self {
            RewriteField::SrcMac => Some(MatchField::SrcMac),
            RewriteField::DstMac => Some(MatchField::DstMac),
            RewriteField::EtherType => Some(MatchField::EtherType),
            RewriteField::IpTtl => Some(MatchField::IpTtl),
            RewriteField::IpDscp => None,
            RewriteField::SrcIpv4 => Some(MatchField::SrcIpv4),
            RewriteField::DstIpv4 => Some(MatchField::DstIpv4),
            RewriteField::TcpSport => Some(MatchField::TcpSport),
            RewriteField::TcpDport => Some(MatchField::TcpDport),
            RewriteField::UdpSport => Some(MatchField::UdpSport),
            RewriteField::UdpDport => Some(MatchField::UdpDport),
        }
    }
}

/// Set one header field to a fixed value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeaderRewrite {
    /// Field written
    pub field: RewriteField,
    /// New value
    pub value: u64,
}

impl HeaderRewrite {
    /// Create new rewrite
    pub const fn new(field: RewriteField, value: u64) -> Self {
        Self { field, value }
    }
}

/// Match fields overwritten by any of `rewrites`
pub fn anti_mask<'a>(rewrites: impl IntoIterator<Item = &'a HeaderRewrite>) -> BTreeSet<MatchField> {
    rewrites
        .into_iter()
        .filter_map(|rw| rw.field.overwrites())
        .collect()
}
