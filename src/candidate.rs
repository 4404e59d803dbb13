// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! ICE candidates and candidate pairs

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

pub use crate::stun::TransportType;

/// The maximum number of local or remote candidates a session will hold.
pub const MAX_CANDIDATES: usize = 64;

/// The type of a [`Candidate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    /// A candidate with an address directly attached to a local interface.
    Host,
    /// A candidate discovered from the mapped address of a connectivity
    /// check response or request.
    PeerReflexive,
    /// A candidate discovered by asking an external server.
    ServerReflexive,
    /// A candidate that relays all data through an external server.
    Relayed,
}

impl CandidateType {
    /// The type preference used when computing candidate priorities.
    /// Higher is more preferred.
    pub fn preference(self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relayed => 0,
        }
    }

    fn foundation_prefix(self) -> char {
        match self {
            CandidateType::Host => 'H',
            CandidateType::PeerReflexive => 'P',
            CandidateType::ServerReflexive => 'S',
            CandidateType::Relayed => 'R',
        }
    }
}

impl std::fmt::Display for CandidateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CandidateType::Host => f.pad("host"),
            CandidateType::PeerReflexive => f.pad("prflx"),
            CandidateType::ServerReflexive => f.pad("srflx"),
            CandidateType::Relayed => f.pad("relay"),
        }
    }
}

/// The role a TCP candidate takes when establishing its connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpType {
    /// The candidate initiates the outgoing connection.
    Active,
    /// The candidate waits for an incoming connection.
    Passive,
    /// Simultaneous open.
    So,
}

/// An ICE candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub component_id: usize,
    pub candidate_type: CandidateType,
    pub transport_type: TransportType,
    pub foundation: String,
    pub priority: u32,
    pub address: SocketAddr,
    pub base_address: SocketAddr,
    pub related_address: Option<SocketAddr>,
    pub tcp_type: Option<TcpType>,
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Candidate(comp:{} {} {} prio:{} addr:{} base:{}",
            self.component_id,
            self.candidate_type,
            self.transport_type,
            self.priority,
            self.address,
            self.base_address,
        )?;
        if let Some(tcp_type) = self.tcp_type {
            write!(f, " tcp:{tcp_type:?}")?;
        }
        write!(f, ")")
    }
}

impl Candidate {
    /// Start building a new [`Candidate`] from the required fields
    pub fn builder(
        component_id: usize,
        candidate_type: CandidateType,
        transport_type: TransportType,
        address: SocketAddr,
    ) -> CandidateBuilder {
        CandidateBuilder {
            component_id,
            candidate_type,
            transport_type,
            address,
            foundation: None,
            priority: None,
            local_preference: 65535,
            base_address: None,
            related_address: None,
            tcp_type: None,
        }
    }

    /// Compute the priority of a candidate from its type preference, a
    /// caller-provided local preference and the component it belongs to.
    pub fn calculate_priority(
        candidate_type: CandidateType,
        local_preference: u32,
        component_id: usize,
    ) -> u32 {
        (candidate_type.preference() << 24)
            + (local_preference << 8)
            + 256u32.saturating_sub(component_id as u32)
    }

    /// Compute the foundation for a candidate.  Candidates of the same type,
    /// base IP address and transport share a foundation, whatever port and
    /// component they are gathered for.
    pub fn calculate_foundation(
        candidate_type: CandidateType,
        base_address: SocketAddr,
        transport_type: TransportType,
    ) -> String {
        let mut hasher = DefaultHasher::new();
        base_address.ip().hash(&mut hasher);
        transport_type.to_string().hash(&mut hasher);
        format!(
            "{}{:08x}",
            candidate_type.foundation_prefix(),
            hasher.finish() as u32
        )
    }

    /// The address a pair containing this local candidate is pruned against.
    /// Reflexive candidates are identified by their base.
    pub(crate) fn pair_prune_address(&self) -> SocketAddr {
        match self.candidate_type {
            CandidateType::Host => self.address,
            _ => self.base_address,
        }
    }

    /// Whether a pair containing `self` is redundant with a pair containing
    /// `other` against the same remote candidate.
    pub(crate) fn redundant_with(&self, other: &Candidate) -> bool {
        self.pair_prune_address() == other.pair_prune_address()
            && self.transport_type == other.transport_type
            && self.tcp_type == other.tcp_type
    }
}

/// A builder of [`Candidate`]s
#[derive(Debug)]
pub struct CandidateBuilder {
    component_id: usize,
    candidate_type: CandidateType,
    transport_type: TransportType,
    address: SocketAddr,
    foundation: Option<String>,
    priority: Option<u32>,
    local_preference: u32,
    base_address: Option<SocketAddr>,
    related_address: Option<SocketAddr>,
    tcp_type: Option<TcpType>,
}

impl CandidateBuilder {
    /// Specify an explicit priority.  When unset, the priority is computed
    /// from the type preference and local preference.
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// The local preference fed into the priority computation (default 65535).
    pub fn local_preference(mut self, local_preference: u32) -> Self {
        self.local_preference = local_preference;
        self
    }

    /// Specify an explicit foundation.  When unset, the foundation is derived
    /// from the candidate type, base address and transport.
    pub fn foundation(mut self, foundation: &str) -> Self {
        self.foundation = Some(foundation.to_owned());
        self
    }

    /// The base address of the candidate (defaults to the candidate address).
    pub fn base_address(mut self, base_address: SocketAddr) -> Self {
        self.base_address = Some(base_address);
        self
    }

    pub fn related_address(mut self, related_address: SocketAddr) -> Self {
        self.related_address = Some(related_address);
        self
    }

    pub fn tcp_type(mut self, tcp_type: TcpType) -> Self {
        self.tcp_type = Some(tcp_type);
        self
    }

    pub fn build(self) -> Candidate {
        let base_address = self.base_address.unwrap_or(self.address);
        let priority = self.priority.unwrap_or_else(|| {
            Candidate::calculate_priority(
                self.candidate_type,
                self.local_preference,
                self.component_id,
            )
        });
        let foundation = self.foundation.unwrap_or_else(|| {
            Candidate::calculate_foundation(
                self.candidate_type,
                base_address,
                self.transport_type,
            )
        });
        Candidate {
            component_id: self.component_id,
            candidate_type: self.candidate_type,
            transport_type: self.transport_type,
            foundation,
            priority,
            address: self.address,
            base_address,
            related_address: self.related_address,
            tcp_type: self.tcp_type,
        }
    }
}

/// A pair of local and remote candidates to check for connectivity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePair {
    pub local: Candidate,
    pub remote: Candidate,
}

impl std::fmt::Display for CandidatePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pair(local:{} {} {} -> remote:{} {} {})",
            self.local.candidate_type,
            self.local.address,
            self.local.transport_type,
            self.remote.candidate_type,
            self.remote.address,
            self.remote.transport_type,
        )
    }
}

impl CandidatePair {
    pub fn new(local: Candidate, remote: Candidate) -> Self {
        Self { local, remote }
    }

    /// Whether these two candidates may be paired at all: same component,
    /// same address family, relays only with relays, and compatible TCP
    /// connection roles.
    pub(crate) fn may_pair(local: &Candidate, remote: &Candidate) -> bool {
        if local.component_id != remote.component_id {
            return false;
        }
        if local.address.is_ipv4() != remote.address.is_ipv4() {
            return false;
        }
        if (local.candidate_type == CandidateType::Relayed)
            != (remote.candidate_type == CandidateType::Relayed)
        {
            return false;
        }
        matches!(
            (local.tcp_type, remote.tcp_type),
            (None, None)
                | (Some(TcpType::Passive), Some(TcpType::Active))
                | (Some(TcpType::Active), Some(TcpType::Passive))
                | (Some(TcpType::Active), Some(TcpType::Active))
                | (Some(TcpType::So), Some(TcpType::So))
        )
    }

    /// The pair priority as defined in RFC 5245 Section 5.7.2.  `controlling`
    /// signals which agent we currently are.
    pub fn priority(&self, controlling: bool) -> u64 {
        let (controlling_prio, controlled_prio) = if controlling {
            (self.local.priority as u64, self.remote.priority as u64)
        } else {
            (self.remote.priority as u64, self.local.priority as u64)
        };
        (1 << 32) * controlling_prio.min(controlled_prio)
            + 2 * controlling_prio.max(controlled_prio)
            + u64::from(controlling_prio > controlled_prio)
    }

    /// The pair foundation used for unfreezing related checks.
    pub fn foundation(&self) -> String {
        format!("{}:{}", self.local.foundation, self.remote.foundation)
    }
}
