// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Connectivity checks, the checklist and the valid list

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::candidate::{Candidate, CandidatePair, CandidateType};
use crate::session::SessionError;
use crate::stun::{StunTransaction, TransactionId};

/// The maximum number of checks a checklist will hold.
pub const MAX_CHECKS: usize = 128;

/// A stable handle to a check.  Handles survive any reordering of the
/// checklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnCheckId(usize);

impl ConnCheckId {
    fn generate() -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(1);
        ConnCheckId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnCheckId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stable handle to a valid-list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValidId(usize);

impl ValidId {
    fn generate() -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(1);
        ValidId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// The state of a connectivity check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidatePairState {
    /// Waiting for a sibling check with the same foundation to complete
    /// before moving to [`CandidatePairState::Waiting`].
    Frozen,
    /// Ready to be started by the periodic timer or a triggered check.
    Waiting,
    /// A Binding request is in flight for this pair.
    InProgress,
    /// The check completed successfully.  Terminal.
    Succeeded,
    /// The check failed or was cancelled.  Terminal.
    Failed,
}

impl CandidatePairState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for CandidatePairState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A connectivity check over a single candidate pair
#[derive(Debug)]
pub(crate) struct ConnCheck {
    pub(crate) id: ConnCheckId,
    pub(crate) pair: CandidatePair,
    pub(crate) priority: u64,
    state: CandidatePairState,
    /// USE-CANDIDATE was (or will be) part of this check, or an incoming
    /// check carried it.  Never cleared once set.
    pub(crate) nominated: bool,
    pub(crate) transaction: Option<StunTransaction>,
}

impl ConnCheck {
    pub(crate) fn new(pair: CandidatePair, controlling: bool) -> Self {
        let priority = pair.priority(controlling);
        Self {
            id: ConnCheckId::generate(),
            pair,
            priority,
            state: CandidatePairState::Frozen,
            nominated: false,
            transaction: None,
        }
    }

    pub(crate) fn state(&self) -> CandidatePairState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: CandidatePairState) {
        if self.state != state {
            trace!(check = %self.id, old_state = %self.state, new_state = %state, "check state");
            self.state = state;
        }
    }

    /// Drop any in-flight transaction.  Retransmissions stop immediately.
    pub(crate) fn cancel_transaction(&mut self) {
        if self.transaction.take().is_some() {
            trace!(check = %self.id, "cancelled in-flight transaction");
        }
    }
}

/// A successful pair in the valid list
#[derive(Debug)]
pub(crate) struct ValidPair {
    pub(crate) id: ValidId,
    pub(crate) pair: CandidatePair,
    pub(crate) priority: u64,
    pub(crate) nominated: bool,
}

/// The overall state of a checklist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CheckListState {
    Idle,
    Running,
    Completed,
}

/// The ordered set of connectivity checks for a session, plus the valid
/// list accumulated from their successes.
#[derive(Debug)]
pub(crate) struct CheckList {
    pub(crate) state: CheckListState,
    checks: Vec<ConnCheck>,
    valid: Vec<ValidPair>,
}

impl Default for CheckList {
    fn default() -> Self {
        Self {
            state: CheckListState::Idle,
            checks: vec![],
            valid: vec![],
        }
    }
}

impl CheckList {
    /// Pair every compatible local and remote candidate, sort by pair
    /// priority and prune redundant pairs.
    pub(crate) fn build(
        local: &[Candidate],
        remote: &[Candidate],
        controlling: bool,
    ) -> Result<Self, SessionError> {
        let mut list = CheckList::default();
        for lcand in local {
            for rcand in remote {
                if !CandidatePair::may_pair(lcand, rcand) {
                    continue;
                }
                if list.checks.len() >= MAX_CHECKS {
                    return Err(SessionError::TooManyChecks);
                }
                let pair = CandidatePair::new(lcand.clone(), rcand.clone());
                list.checks.push(ConnCheck::new(pair, controlling));
            }
        }
        list.sort();
        list.prune(local)?;
        Ok(list)
    }

    fn sort(&mut self) {
        self.checks.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub(crate) fn sort_valid(&mut self) {
        self.valid.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Replace reflexive local candidates with their base host candidate,
    /// then remove later checks that duplicate an earlier check's
    /// (local, remote) pair or share its (base address, tcp role) against
    /// the same remote.
    fn prune(&mut self, local: &[Candidate]) -> Result<(), SessionError> {
        for check in self.checks.iter_mut() {
            if check.pair.local.candidate_type != CandidateType::ServerReflexive {
                continue;
            }
            let srflx = &check.pair.local;
            let host = local
                .iter()
                .find(|cand| {
                    cand.candidate_type == CandidateType::Host
                        && cand.component_id == srflx.component_id
                        && cand.transport_type == srflx.transport_type
                        && cand.address == srflx.base_address
                })
                .ok_or_else(|| {
                    warn!(
                        "no host candidate with address {} for reflexive candidate",
                        srflx.base_address
                    );
                    SessionError::NoHostCandidate
                })?;
            check.pair.local = host.clone();
        }

        let mut i = 0;
        while i < self.checks.len() {
            let mut j = i + 1;
            while j < self.checks.len() {
                let earlier = &self.checks[i].pair;
                let later = &self.checks[j].pair;
                let reason = if earlier.local == later.local && earlier.remote == later.remote {
                    Some("duplicate")
                } else if earlier.remote == later.remote
                    && later.local.redundant_with(&earlier.local)
                {
                    Some("equal base")
                } else {
                    None
                };
                if let Some(reason) = reason {
                    trace!(pair = %self.checks[j].pair, reason, "pruned check");
                    self.checks.remove(j);
                } else {
                    j += 1;
                }
            }
            i += 1;
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.checks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ConnCheck> {
        self.checks.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConnCheck> {
        self.checks.iter_mut()
    }

    pub(crate) fn check_by_id(&self, id: ConnCheckId) -> Option<&ConnCheck> {
        self.checks.iter().find(|check| check.id == id)
    }

    pub(crate) fn check_by_id_mut(&mut self, id: ConnCheckId) -> Option<&mut ConnCheck> {
        self.checks.iter_mut().find(|check| check.id == id)
    }

    pub(crate) fn find_check(
        &self,
        local: &Candidate,
        remote: &Candidate,
    ) -> Option<ConnCheckId> {
        self.checks
            .iter()
            .find(|check| &check.pair.local == local && &check.pair.remote == remote)
            .map(|check| check.id)
    }

    pub(crate) fn check_by_transaction(&self, transaction_id: TransactionId) -> Option<ConnCheckId> {
        self.checks
            .iter()
            .find(|check| {
                check
                    .transaction
                    .as_ref()
                    .is_some_and(|transaction| transaction.transaction_id() == transaction_id)
            })
            .map(|check| check.id)
    }

    /// Insert a check keeping the list sorted by descending pair priority.
    pub(crate) fn add_check(&mut self, check: ConnCheck) -> Result<ConnCheckId, SessionError> {
        if self.checks.len() >= MAX_CHECKS {
            return Err(SessionError::TooManyChecks);
        }
        let id = check.id;
        let idx = self
            .checks
            .partition_point(|existing| existing.priority >= check.priority);
        self.checks.insert(idx, check);
        Ok(id)
    }

    /// The highest-priority check in the given state.
    pub(crate) fn next_in_state(&self, state: CandidatePairState) -> Option<ConnCheckId> {
        self.checks
            .iter()
            .find(|check| check.state() == state)
            .map(|check| check.id)
    }

    /// Move every Frozen check sharing `foundation` (local-candidate
    /// foundation) to Waiting.
    pub(crate) fn unfreeze_foundation(&mut self, foundation: &str) {
        for check in self.checks.iter_mut() {
            if check.state() == CandidatePairState::Frozen
                && check.pair.local.foundation == foundation
            {
                check.set_state(CandidatePairState::Waiting);
            }
        }
    }

    pub(crate) fn all_terminal(&self) -> bool {
        self.checks.iter().all(|check| check.state().is_terminal())
    }

    /// Add or update a valid-list entry for this pair.  Entries are unique
    /// per (local, remote) candidate pair; an existing entry only gains
    /// the nominated flag.
    pub(crate) fn add_valid(
        &mut self,
        pair: CandidatePair,
        priority: u64,
        nominated: bool,
    ) -> ValidId {
        if let Some(existing) = self
            .valid
            .iter_mut()
            .find(|valid| valid.pair.local == pair.local && valid.pair.remote == pair.remote)
        {
            existing.nominated |= nominated;
            return existing.id;
        }
        let valid = ValidPair {
            id: ValidId::generate(),
            pair,
            priority,
            nominated,
        };
        let id = valid.id;
        let idx = self
            .valid
            .partition_point(|existing| existing.priority >= priority);
        self.valid.insert(idx, valid);
        id
    }

    pub(crate) fn valid_by_id(&self, id: ValidId) -> Option<&ValidPair> {
        self.valid.iter().find(|valid| valid.id == id)
    }

    pub(crate) fn valid_iter(&self) -> impl Iterator<Item = &ValidPair> {
        self.valid.iter()
    }

    pub(crate) fn valid_iter_mut(&mut self) -> impl Iterator<Item = &mut ValidPair> {
        self.valid.iter_mut()
    }

    pub(crate) fn any_valid_nominated(&self) -> bool {
        self.valid.iter().any(|valid| valid.nominated)
    }

    /// Trace-dump every check, used after checklist construction and on
    /// state transitions worth debugging.
    pub(crate) fn dump_check_state(&self) {
        let mut s = format!("checklist state {:?}, {} checks", self.state, self.checks.len());
        for check in self.checks.iter() {
            use std::fmt::Write as _;
            let _ = write!(
                &mut s,
                "\n\tcheck {}: state {} nominated {} priority {} {}",
                check.id,
                check.state(),
                check.nominated,
                check.priority,
                check.pair,
            );
        }
        for valid in self.valid.iter() {
            use std::fmt::Write as _;
            let _ = write!(
                &mut s,
                "\n\tvalid: nominated {} priority {} {}",
                valid.nominated, valid.priority, valid.pair,
            );
        }
        trace!("{}", s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{TcpType, TransportType};
    use std::net::SocketAddr;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn host(component_id: usize, s: &str) -> Candidate {
        Candidate::builder(
            component_id,
            CandidateType::Host,
            TransportType::Udp,
            addr(s),
        )
        .build()
    }

    #[test]
    fn build_single_pair() {
        let _log = crate::tests::test_init_log();
        let local = [host(1, "192.168.1.1:1000")];
        let remote = [host(1, "192.168.1.2:2000")];
        let list = CheckList::build(&local, &remote, true).unwrap();
        assert_eq!(list.len(), 1);
        let check = list.iter().next().unwrap();
        assert_eq!(check.state(), CandidatePairState::Frozen);
        assert_eq!(check.pair.local.address, addr("192.168.1.1:1000"));
    }

    #[test]
    fn build_sorted_by_priority() {
        let _log = crate::tests::test_init_log();
        let relay = Candidate::builder(
            1,
            CandidateType::Relayed,
            TransportType::Udp,
            addr("7.7.7.7:7000"),
        )
        .build();
        let local = [host(1, "192.168.1.1:1000"), relay.clone()];
        let remote_relay = Candidate::builder(
            1,
            CandidateType::Relayed,
            TransportType::Udp,
            addr("8.8.8.8:8000"),
        )
        .build();
        let remote = [host(1, "192.168.1.2:2000"), remote_relay];
        let list = CheckList::build(&local, &remote, true).unwrap();
        // host pairs host, relay pairs relay
        assert_eq!(list.len(), 2);
        let priorities: Vec<_> = list.iter().map(|check| check.priority).collect();
        assert!(priorities[0] >= priorities[1]);
        assert_eq!(
            list.iter().next().unwrap().pair.local.candidate_type,
            CandidateType::Host
        );
    }

    #[test]
    fn prune_replaces_reflexive_with_base() {
        let _log = crate::tests::test_init_log();
        let host_cand = host(1, "192.168.1.1:1000");
        let srflx = Candidate::builder(
            1,
            CandidateType::ServerReflexive,
            TransportType::Udp,
            addr("9.9.9.9:9000"),
        )
        .base_address(addr("192.168.1.1:1000"))
        .build();
        let local = [host_cand.clone(), srflx];
        let remote = [host(1, "192.168.1.2:2000")];
        let list = CheckList::build(&local, &remote, true).unwrap();
        // reflexive pair collapses into the host pair and is pruned
        assert_eq!(list.len(), 1);
        let check = list.iter().next().unwrap();
        assert_eq!(check.pair.local, host_cand);
    }

    #[test]
    fn prune_errors_without_base_host() {
        let _log = crate::tests::test_init_log();
        let srflx = Candidate::builder(
            1,
            CandidateType::ServerReflexive,
            TransportType::Udp,
            addr("9.9.9.9:9000"),
        )
        .base_address(addr("192.168.1.1:1000"))
        .build();
        let local = [srflx];
        let remote = [host(1, "192.168.1.2:2000")];
        assert!(matches!(
            CheckList::build(&local, &remote, true),
            Err(SessionError::NoHostCandidate)
        ));
    }

    #[test]
    fn prune_removes_equal_base() {
        let _log = crate::tests::test_init_log();
        // two local host candidates with the same address differ only in
        // foundation; their pairs against one remote are equal-base
        let cand_a = host(1, "192.168.1.1:1000");
        let mut cand_b = host(1, "192.168.1.1:1000");
        cand_b.foundation = "other".to_owned();
        let local = [cand_a, cand_b];
        let remote = [host(1, "192.168.1.2:2000")];
        let list = CheckList::build(&local, &remote, true).unwrap();
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn tcp_roles_do_not_prune_each_other() {
        let _log = crate::tests::test_init_log();
        let tcp = |ttype, s: &str| {
            Candidate::builder(1, CandidateType::Host, TransportType::Tcp, addr(s))
                .tcp_type(ttype)
                .build()
        };
        let local = [
            tcp(TcpType::Active, "192.168.1.1:9"),
            tcp(TcpType::Passive, "192.168.1.1:1000"),
        ];
        let remote = [
            tcp(TcpType::Active, "192.168.1.2:9"),
            tcp(TcpType::Passive, "192.168.1.2:1000"),
        ];
        let list = CheckList::build(&local, &remote, true).unwrap();
        // active->passive, active->active, passive->active; different tcp
        // roles on the same base are not redundant
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn unfreeze_by_foundation() {
        let _log = crate::tests::test_init_log();
        let local = [host(1, "192.168.1.1:1000"), host(2, "192.168.1.1:1001")];
        let remote = [host(1, "192.168.1.2:2000"), host(2, "192.168.1.2:2001")];
        let mut list = CheckList::build(&local, &remote, true).unwrap();
        assert_eq!(list.len(), 2);
        let foundation = local[0].foundation.clone();
        list.unfreeze_foundation(&foundation);
        assert!(list
            .iter()
            .all(|check| check.state() == CandidatePairState::Waiting));
    }

    #[test]
    fn valid_list_unique_per_pair() {
        let _log = crate::tests::test_init_log();
        let mut list = CheckList::default();
        let pair = CandidatePair::new(host(1, "192.168.1.1:1000"), host(1, "192.168.1.2:2000"));
        let id1 = list.add_valid(pair.clone(), 100, false);
        let id2 = list.add_valid(pair.clone(), 100, true);
        assert_eq!(id1, id2);
        assert_eq!(list.valid_iter().count(), 1);
        // nominated flag is never cleared
        assert!(list.valid_by_id(id1).unwrap().nominated);
        let _ = list.add_valid(pair, 100, false);
        assert!(list.valid_by_id(id1).unwrap().nominated);
    }

    #[test]
    fn valid_ids_survive_sorting() {
        let _log = crate::tests::test_init_log();
        let mut list = CheckList::default();
        let low = CandidatePair::new(host(1, "192.168.1.1:1000"), host(1, "192.168.1.2:2000"));
        let high = CandidatePair::new(host(1, "192.168.1.1:1001"), host(1, "192.168.1.2:2001"));
        let low_id = list.add_valid(low.clone(), 1, false);
        let high_id = list.add_valid(high.clone(), 1000, false);
        list.sort_valid();
        assert_eq!(list.valid_by_id(low_id).unwrap().pair, low);
        assert_eq!(list.valid_by_id(high_id).unwrap().pair, high);
        // sorted descending
        let priorities: Vec<_> = list.valid_iter().map(|valid| valid.priority).collect();
        assert_eq!(priorities, vec![1000, 1]);
    }

    #[test]
    fn check_ids_survive_insertion() {
        let _log = crate::tests::test_init_log();
        let local = [host(1, "192.168.1.1:1000")];
        let remote = [host(1, "192.168.1.2:2000")];
        let mut list = CheckList::build(&local, &remote, true).unwrap();
        let first = list.iter().next().unwrap().id;
        let pair = CandidatePair::new(host(1, "192.168.1.1:1002"), host(1, "192.168.1.2:2002"));
        let second = list.add_check(ConnCheck::new(pair, true)).unwrap();
        assert_ne!(first, second);
        assert!(list.check_by_id(first).is_some());
        assert!(list.check_by_id(second).is_some());
    }
}
