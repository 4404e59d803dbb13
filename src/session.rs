// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! An ICE session: candidate pairing, connectivity checks, nomination.
//!
//! The [`Session`] is sans-io.  It never performs I/O or spawns threads;
//! the caller feeds it received STUN messages and drives it with
//! [`Session::poll`], sending the returned [`Transmit`]s and sleeping
//! until the returned deadlines.  Exclusive (`&mut`) access serializes
//! every entry point; callers needing shared access wrap the session in a
//! mutex, which yields exactly one lock per session acquired at the top
//! of each operation and released on every exit path.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::candidate::{
    Candidate, CandidatePair, CandidateType, TransportType, MAX_CANDIDATES,
};
use crate::component::{Component, ComponentConnectionState};
use crate::conncheck::{
    CandidatePairState, CheckList, CheckListState, ConnCheck, ConnCheckId, ValidId,
};
use crate::stun::{self, Attribute, Message, MessageClass, StunTransaction, TransactionPoll};

/// The most components a single stream may carry.  Candidate priorities
/// encode the component id in their low byte, so it must fit in 1..=256.
const MAX_COMPONENTS: usize = 256;
/// Interval between periodic connectivity checks (Ta).
const CHECK_INTERVAL: Duration = Duration::from_millis(20);
/// How long a controlling agent lets checks settle before nominating.
const NOMINATED_CHECK_DELAY: Duration = Duration::from_millis(400);
/// How long a controlled agent waits for the controlling agent to nominate
/// once its own checklist is exhausted.
const CONTROLLED_WAIT_NOMINATION_TIMEOUT: Duration = Duration::from_secs(10);
/// Base keep-alive interval, jittered by up to [`KEEPALIVE_JITTER_SECS`]
/// and divided across components.
const KEEPALIVE_INTERVAL_SECS: u64 = 20;
const KEEPALIVE_JITTER_SECS: u64 = 5;

/// The agent role negotiated by ICE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceRole {
    /// The agent that drives nomination.
    Controlling,
    /// The agent that waits for the controlling agent to nominate.
    Controlled,
}

impl std::fmt::Display for IceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IceRole::Controlling => f.pad("controlling"),
            IceRole::Controlled => f.pad("controlled"),
        }
    }
}

/// ICE credentials: a username fragment and a password
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ufrag: String,
    pub passwd: String,
}

impl Credentials {
    pub fn new(ufrag: String, passwd: String) -> Self {
        Self { ufrag, passwd }
    }

    /// Generate a random set of credentials of the RFC-recommended sizes.
    pub fn generate() -> Self {
        Self {
            ufrag: generate_ice_string(4),
            passwd: generate_ice_string(22),
        }
    }
}

fn generate_ice_string(length: usize) -> String {
    const ALPHABET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Errors returned synchronously by session operations.  None of these
/// change any session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// A component id of 0 or above the configured component count.
    InvalidComponent,
    /// The candidate capacity of the session has been reached.
    TooManyCandidates,
    /// The check capacity of the checklist has been reached.
    TooManyChecks,
    /// A reflexive local candidate has no registered host candidate with
    /// its base address.
    NoHostCandidate,
    /// The checklist contains no pair for component 1.
    NoCandidateForComponent1,
    /// No pair has been nominated for the component yet.
    NotYetNominated,
    /// The operation is not valid in the session's current state.
    InvalidState,
}

impl std::error::Error for SessionError {}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::InvalidComponent => write!(f, "invalid component id"),
            SessionError::TooManyCandidates => write!(f, "too many candidates"),
            SessionError::TooManyChecks => write!(f, "too many checks"),
            SessionError::NoHostCandidate => {
                write!(f, "no host candidate for reflexive base address")
            }
            SessionError::NoCandidateForComponent1 => {
                write!(f, "no candidate pair for component 1")
            }
            SessionError::NotYetNominated => write!(f, "no nominated pair yet"),
            SessionError::InvalidState => write!(f, "invalid state for operation"),
        }
    }
}

/// Why a session completed unsuccessfully
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionError {
    /// The checklist was exhausted without a valid or nominated pair for
    /// every component.
    Failed,
    /// The controlled agent timed out waiting for the controlling agent
    /// to nominate.
    NominationTimeout,
}

impl std::error::Error for CompletionError {}

impl std::fmt::Display for CompletionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionError::Failed => write!(f, "connectivity checks failed"),
            CompletionError::NominationTimeout => {
                write!(f, "timed out waiting for nomination")
            }
        }
    }
}

/// Events produced by the session, delivered through [`Session::poll`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A component changed connection state.
    ComponentStateChange {
        component_id: usize,
        state: ComponentConnectionState,
    },
    /// A pair has been selected for a component.
    SelectedPair {
        component_id: usize,
        pair: Box<CandidatePair>,
    },
    /// ICE processing finished.  Delivered at most once per session.
    Completed(Result<(), CompletionError>),
}

/// A STUN message the caller must send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub component_id: usize,
    pub transport: TransportType,
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub msg: Message,
}

/// Application data routed over the nominated pair of a component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTransmit<'a> {
    pub component_id: usize,
    pub transport: TransportType,
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub data: &'a [u8],
}

/// Return value of [`Session::poll`]
#[derive(Debug)]
pub enum SessionPoll {
    /// Send this message.
    Transmit(Transmit),
    /// Something happened.
    Event(SessionEvent),
    /// Call [`Session::poll`] again no later than this deadline.
    WaitUntil(Instant),
    /// Nothing is scheduled.
    Idle,
    /// The session has been closed.
    Closed,
}

/// What the single multiplexed session timer is armed for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    ControlledWaitNomination,
    StartNominatedCheck,
    Keepalive,
}

#[derive(Debug)]
struct Timer {
    kind: TimerKind,
    deadline: Instant,
}

/// An incoming binding request recorded before or during checklist
/// processing, possibly replayed later as an early check.
#[derive(Debug)]
struct IncomingCheck {
    component_id: usize,
    transport: TransportType,
    from: SocketAddr,
    to: SocketAddr,
    priority: u32,
    use_candidate: bool,
}

/// Configure and create a [`Session`]
#[derive(Debug)]
pub struct SessionBuilder {
    role: IceRole,
    component_count: usize,
    local_credentials: Option<Credentials>,
    tie_breaker: Option<u64>,
    aggressive: bool,
    nominated_check_delay: Duration,
    controlled_wait_nomination_timeout: Option<Duration>,
}

impl SessionBuilder {
    /// Use these local credentials instead of generating random ones.
    pub fn local_credentials(mut self, credentials: Credentials) -> Self {
        self.local_credentials = Some(credentials);
        self
    }

    /// Use this tie-breaker value instead of a random one.
    pub fn tie_breaker(mut self, tie_breaker: u64) -> Self {
        self.tie_breaker = Some(tie_breaker);
        self
    }

    /// Aggressive nomination: every outgoing check carries USE-CANDIDATE.
    pub fn aggressive(mut self, aggressive: bool) -> Self {
        self.aggressive = aggressive;
        self
    }

    /// How long the controlling agent lets checks settle before starting
    /// the nomination sequence.
    pub fn nominated_check_delay(mut self, delay: Duration) -> Self {
        self.nominated_check_delay = delay;
        self
    }

    /// How long the controlled agent waits for nomination after exhausting
    /// its checklist.  `None` disables the timeout.
    pub fn controlled_wait_nomination_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.controlled_wait_nomination_timeout = timeout;
        self
    }

    pub fn build(self) -> Session {
        let component_count = self.component_count.clamp(1, MAX_COMPONENTS);
        Session {
            role: self.role,
            tie_breaker: self.tie_breaker.unwrap_or_else(rand::random),
            local_credentials: self.local_credentials.unwrap_or_else(Credentials::generate),
            remote_credentials: None,
            aggressive: self.aggressive,
            nominated_check_delay: self.nominated_check_delay,
            controlled_wait_nomination_timeout: self.controlled_wait_nomination_timeout,
            components: (1..=component_count).map(Component::new).collect(),
            local_candidates: vec![],
            remote_candidates: vec![],
            checklist: CheckList::default(),
            early_checks: vec![],
            timer: None,
            periodic_tick: None,
            keepalive_component: 0,
            nominating: false,
            completed: false,
            closing: false,
            events: VecDeque::new(),
            transmits: VecDeque::new(),
        }
    }
}

/// A single ICE session over one media stream
#[derive(Debug)]
pub struct Session {
    role: IceRole,
    tie_breaker: u64,
    local_credentials: Credentials,
    remote_credentials: Option<Credentials>,
    aggressive: bool,
    nominated_check_delay: Duration,
    controlled_wait_nomination_timeout: Option<Duration>,
    components: Vec<Component>,
    local_candidates: Vec<Candidate>,
    remote_candidates: Vec<Candidate>,
    checklist: CheckList,
    early_checks: Vec<IncomingCheck>,
    timer: Option<Timer>,
    periodic_tick: Option<Instant>,
    keepalive_component: usize,
    nominating: bool,
    completed: bool,
    closing: bool,
    events: VecDeque<SessionEvent>,
    transmits: VecDeque<Transmit>,
}

fn transmit_for_check(check: &ConnCheck, msg: Message) -> Transmit {
    Transmit {
        component_id: check.pair.local.component_id,
        transport: check.pair.local.transport_type,
        from: check.pair.local.base_address,
        to: check.pair.remote.address,
        msg,
    }
}

impl Session {
    /// Start building a session with the provided role and number of
    /// components.
    pub fn builder(role: IceRole, component_count: usize) -> SessionBuilder {
        SessionBuilder {
            role,
            component_count,
            local_credentials: None,
            tie_breaker: None,
            aggressive: false,
            nominated_check_delay: NOMINATED_CHECK_DELAY,
            controlled_wait_nomination_timeout: Some(CONTROLLED_WAIT_NOMINATION_TIMEOUT),
        }
    }

    pub fn role(&self) -> IceRole {
        self.role
    }

    fn controlling(&self) -> bool {
        self.role == IceRole::Controlling
    }

    pub fn local_credentials(&self) -> &Credentials {
        &self.local_credentials
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    pub fn component_state(&self, component_id: usize) -> Option<ComponentConnectionState> {
        self.components
            .iter()
            .find(|comp| comp.id == component_id)
            .map(|comp| comp.state())
    }

    /// The pair selected for a component, available once the component is
    /// [`ComponentConnectionState::Connected`].
    pub fn selected_pair(&self, component_id: usize) -> Option<&CandidatePair> {
        self.components
            .iter()
            .find(|comp| comp.id == component_id)
            .and_then(|comp| comp.selected_pair.as_ref())
    }

    /// Register a local candidate.  Candidates must be registered before
    /// the checklist is created.
    pub fn add_local_candidate(&mut self, candidate: Candidate) -> Result<usize, SessionError> {
        if candidate.component_id == 0 || candidate.component_id > self.components.len() {
            return Err(SessionError::InvalidComponent);
        }
        if self.local_candidates.len() >= MAX_CANDIDATES {
            return Err(SessionError::TooManyCandidates);
        }
        if !self.checklist.is_empty() {
            return Err(SessionError::InvalidState);
        }
        debug!(candidate = %candidate, "adding local candidate");
        self.local_candidates.push(candidate);
        Ok(self.local_candidates.len() - 1)
    }

    /// Provide the remote credentials and candidates, and build the
    /// checklist by pairing, sorting and pruning.  Errors leave the
    /// session unchanged.
    #[tracing::instrument(level = "debug", skip(self, remote_credentials, remote_candidates))]
    pub fn create_checklist(
        &mut self,
        remote_credentials: Credentials,
        remote_candidates: Vec<Candidate>,
    ) -> Result<(), SessionError> {
        if !self.checklist.is_empty() || self.remote_credentials.is_some() {
            return Err(SessionError::InvalidState);
        }
        if remote_candidates.len() > MAX_CANDIDATES {
            return Err(SessionError::TooManyCandidates);
        }
        let mut highest_component = 0;
        let mut accepted = Vec::with_capacity(remote_candidates.len());
        for candidate in remote_candidates {
            // a candidate for a component we don't have is ignored
            if candidate.component_id == 0 || candidate.component_id > self.components.len() {
                continue;
            }
            highest_component = highest_component.max(candidate.component_id);
            accepted.push(candidate);
        }
        let checklist = CheckList::build(&self.local_candidates, &accepted, self.controlling())?;
        debug!(checks = checklist.len(), "created checklist");
        self.remote_candidates = accepted;
        self.checklist = checklist;
        self.remote_credentials = Some(remote_credentials);
        // components the remote did not offer are dropped
        self.components.truncate(highest_component.max(1));
        self.checklist.dump_check_state();
        Ok(())
    }

    /// Begin connectivity checking.  Unfreezes the initial foundation
    /// groups, replays any early incoming checks and arms the periodic
    /// check timer.
    #[tracing::instrument(level = "debug", skip(self, now))]
    pub fn start_checks(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.checklist.is_empty() {
            return Err(SessionError::InvalidState);
        }
        if !self
            .checklist
            .iter()
            .any(|check| check.pair.local.component_id == 1)
        {
            return Err(SessionError::NoCandidateForComponent1);
        }

        info!("starting connectivity checks");
        if self.aggressive {
            self.nominating = true;
        }

        // first pair of component 1 goes Waiting, then the first pair of
        // every further foundation for that component
        let mut foundations: Vec<String> = vec![];
        for check in self.checklist.iter_mut() {
            if check.pair.local.component_id != 1 {
                continue;
            }
            if !foundations.contains(&check.pair.local.foundation) {
                if check.state() == CandidatePairState::Frozen {
                    check.set_state(CandidatePairState::Waiting);
                }
                foundations.push(check.pair.local.foundation.clone());
            }
        }

        self.checklist.state = CheckListState::Running;
        for idx in 0..self.components.len() {
            if self.components[idx].set_state(ComponentConnectionState::Connecting) {
                self.events.push_back(SessionEvent::ComponentStateChange {
                    component_id: self.components[idx].id,
                    state: ComponentConnectionState::Connecting,
                });
            }
        }

        let early = std::mem::take(&mut self.early_checks);
        for incoming in early {
            debug!(
                component = incoming.component_id,
                "performing delayed triggered check"
            );
            self.handle_incoming_check(incoming, now);
        }

        self.periodic_tick = Some(now);
        Ok(())
    }

    /// Feed a received STUN message into the session.
    ///
    /// `from`/`to` are the source and destination addresses of the packet
    /// the message arrived in.
    #[tracing::instrument(level = "trace", skip(self, msg, now))]
    pub fn handle_incoming_stun(
        &mut self,
        msg: Message,
        transport: TransportType,
        from: SocketAddr,
        to: SocketAddr,
        component_id: usize,
        now: Instant,
    ) -> Result<(), SessionError> {
        if component_id == 0 || component_id > self.components.len() {
            return Err(SessionError::InvalidComponent);
        }
        if self.closing {
            return Ok(());
        }
        match msg.class() {
            MessageClass::Request => {
                self.handle_binding_request(&msg, transport, from, to, component_id, now)
            }
            MessageClass::Indication => {
                trace!(component = component_id, "received keep-alive indication");
            }
            MessageClass::Success | MessageClass::Error => {
                self.handle_response(&msg, from, now);
            }
        }
        Ok(())
    }

    /// Resolve the nominated path for application data on a component.
    pub fn send_data<'a>(
        &self,
        component_id: usize,
        data: &'a [u8],
    ) -> Result<DataTransmit<'a>, SessionError> {
        let component = self
            .components
            .iter()
            .find(|comp| comp.id == component_id)
            .ok_or(SessionError::InvalidComponent)?;
        let pair = component
            .selected_pair
            .as_ref()
            .ok_or(SessionError::NotYetNominated)?;
        Ok(DataTransmit {
            component_id,
            transport: pair.local.transport_type,
            from: pair.local.base_address,
            to: pair.remote.address,
            data,
        })
    }

    /// Tear the session down.  All timers and in-flight transactions are
    /// cancelled; subsequent polls return [`SessionPoll::Closed`].
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn close(&mut self) {
        if self.closing {
            return;
        }
        info!("closing session");
        self.closing = true;
        self.timer = None;
        self.periodic_tick = None;
        for check in self.checklist.iter_mut() {
            check.cancel_transaction();
        }
        self.events.clear();
        self.transmits.clear();
    }

    /// Drive the session forward.  Returns queued transmits and events,
    /// runs due timers and retransmissions, and finally the next deadline.
    pub fn poll(&mut self, now: Instant) -> SessionPoll {
        loop {
            if self.closing {
                return SessionPoll::Closed;
            }
            if let Some(transmit) = self.transmits.pop_front() {
                return SessionPoll::Transmit(transmit);
            }
            if let Some(event) = self.events.pop_front() {
                return SessionPoll::Event(event);
            }

            if self
                .timer
                .as_ref()
                .is_some_and(|timer| timer.deadline <= now)
            {
                if let Some(timer) = self.timer.take() {
                    self.handle_timer(timer.kind, now);
                }
                continue;
            }
            if self.periodic_tick.is_some_and(|deadline| deadline <= now) {
                self.periodic_tick = None;
                self.periodic_check(now);
                continue;
            }

            let mut earliest: Option<Instant> = None;
            let mut retransmits: Vec<Transmit> = vec![];
            let mut timed_out: Vec<ConnCheckId> = vec![];
            for check in self.checklist.iter_mut() {
                if check.state() != CandidatePairState::InProgress {
                    continue;
                }
                let polled = match check.transaction.as_mut() {
                    Some(transaction) => transaction.poll(now),
                    None => continue,
                };
                match polled {
                    TransactionPoll::WaitUntil(deadline) => {
                        earliest = Some(earliest.map_or(deadline, |e| e.min(deadline)));
                    }
                    TransactionPoll::Retransmit => {
                        if let Some(request) =
                            check.transaction.as_ref().map(|tx| tx.request().clone())
                        {
                            trace!(check = %check.id, "retransmitting connectivity check");
                            retransmits.push(transmit_for_check(check, request));
                        }
                    }
                    TransactionPoll::TimedOut => timed_out.push(check.id),
                }
            }
            let progressed = !retransmits.is_empty() || !timed_out.is_empty();
            self.transmits.extend(retransmits);
            for id in timed_out {
                debug!(check = %id, "connectivity check timed out");
                self.check_failed(id, now);
            }
            if progressed {
                continue;
            }

            let mut deadline = earliest;
            if let Some(timer) = self.timer.as_ref() {
                deadline = Some(deadline.map_or(timer.deadline, |d| d.min(timer.deadline)));
            }
            if let Some(tick) = self.periodic_tick {
                deadline = Some(deadline.map_or(tick, |d| d.min(tick)));
            }
            return match deadline {
                Some(deadline) => SessionPoll::WaitUntil(deadline),
                None => SessionPoll::Idle,
            };
        }
    }

    fn handle_timer(&mut self, kind: TimerKind, now: Instant) {
        match kind {
            TimerKind::ControlledWaitNomination => {
                if self.checklist.any_valid_nominated() {
                    debug!("nomination arrived while waiting, completing");
                    self.complete(Ok(()), now);
                } else {
                    warn!(
                        "timed out waiting for the controlling agent to send a \
                         nominated check"
                    );
                    self.complete(Err(CompletionError::NominationTimeout), now);
                }
            }
            TimerKind::StartNominatedCheck => self.start_nominated_check(now),
            TimerKind::Keepalive => self.keep_alive(true, now),
        }
    }

    /// One periodic tick: start the highest-priority Waiting check, or
    /// absent any, the highest-priority Frozen check.
    fn periodic_check(&mut self, now: Instant) {
        if self.completed {
            return;
        }
        self.checklist.state = CheckListState::Running;
        let next = self
            .checklist
            .next_in_state(CandidatePairState::Waiting)
            .or_else(|| self.checklist.next_in_state(CandidatePairState::Frozen));
        if let Some(check_id) = next {
            let nominate = self.nominating
                || self
                    .checklist
                    .check_by_id(check_id)
                    .is_some_and(|check| check.nominated);
            self.perform_check(check_id, nominate, now);
            self.periodic_tick = Some(now + CHECK_INTERVAL);
        }
    }

    /// Issue the Binding request for a check and move it to In-Progress.
    fn perform_check(&mut self, check_id: ConnCheckId, nominate: bool, now: Instant) {
        let controlling = self.controlling();
        let tie_breaker = self.tie_breaker;
        let username = match self.remote_credentials.as_ref() {
            Some(remote) => format!("{}:{}", remote.ufrag, self.local_credentials.ufrag),
            None => {
                warn!("cannot perform check without remote credentials");
                return;
            }
        };
        let Some(check) = self.checklist.check_by_id_mut(check_id) else {
            return;
        };
        let component_id = check.pair.local.component_id;
        let mut request = Message::binding_request();
        request.add_attribute(Attribute::Priority(Candidate::calculate_priority(
            CandidateType::PeerReflexive,
            65535,
            component_id,
        )));
        if controlling {
            if nominate {
                request.add_attribute(Attribute::UseCandidate);
                check.nominated = true;
            }
            request.add_attribute(Attribute::IceControlling(tie_breaker));
        } else {
            request.add_attribute(Attribute::IceControlled(tie_breaker));
        }
        request.add_attribute(Attribute::Username(username));
        debug!(check = %check.id, pair = %check.pair, nominate, "sending connectivity check");
        let transmit = transmit_for_check(check, request.clone());
        check.transaction = Some(StunTransaction::new(request, now));
        check.set_state(CandidatePairState::InProgress);
        self.transmits.push_back(transmit);
    }

    fn respond(
        &mut self,
        transport: TransportType,
        component_id: usize,
        peer: SocketAddr,
        local: SocketAddr,
        msg: Message,
    ) {
        self.transmits.push_back(Transmit {
            component_id,
            transport,
            from: local,
            to: peer,
            msg,
        });
    }

    fn handle_binding_request(
        &mut self,
        msg: &Message,
        transport: TransportType,
        from: SocketAddr,
        to: SocketAddr,
        component_id: usize,
        now: Instant,
    ) {
        if msg.method() != stun::BINDING {
            self.respond(
                transport,
                component_id,
                from,
                to,
                Message::error_response(msg, stun::BAD_REQUEST, "Bad Request"),
            );
            return;
        }
        let expected_prefix = format!("{}:", self.local_credentials.ufrag);
        if !msg
            .username()
            .is_some_and(|username| username.starts_with(&expected_prefix))
        {
            debug!("binding request with missing or mismatched USERNAME");
            self.respond(
                transport,
                component_id,
                from,
                to,
                Message::error_response(msg, stun::UNAUTHORIZED, "Unauthorized"),
            );
            return;
        }
        let Some(priority) = msg.priority() else {
            debug!("binding request without PRIORITY, ignoring");
            return;
        };

        // role conflict resolution: either flip our role or reject with
        // 487, never both
        if self.controlling() {
            if let Some(theirs) = msg.ice_controlling() {
                if self.tie_breaker < theirs {
                    info!("changing role to controlled because of ICE-CONTROLLING");
                    self.role = IceRole::Controlled;
                } else {
                    self.respond(
                        transport,
                        component_id,
                        from,
                        to,
                        Message::error_response(msg, stun::ROLE_CONFLICT, "Role Conflict"),
                    );
                    return;
                }
            }
        } else if let Some(theirs) = msg.ice_controlled() {
            if self.tie_breaker < theirs {
                self.respond(
                    transport,
                    component_id,
                    from,
                    to,
                    Message::error_response(msg, stun::ROLE_CONFLICT, "Role Conflict"),
                );
                return;
            } else {
                info!("changing role to controlling because of ICE-CONTROLLED");
                self.role = IceRole::Controlling;
            }
        }

        let mut response = Message::success_response(msg);
        response.add_attribute(Attribute::XorMappedAddress(from));
        self.respond(transport, component_id, from, to, response);

        let incoming = IncomingCheck {
            component_id,
            transport,
            from,
            to,
            priority,
            use_candidate: msg.use_candidate(),
        };
        if self.remote_candidates.is_empty() {
            // no answer yet, so no checklist to check against
            debug!(component = component_id, "queueing early check");
            self.early_checks.push(incoming);
        } else {
            self.handle_incoming_check(incoming, now);
        }
    }

    /// Perform the triggered-check rules for an incoming binding request.
    fn handle_incoming_check(&mut self, incoming: IncomingCheck, now: Instant) {
        // resolve the source address to a remote candidate, discovering a
        // peer-reflexive one if needed
        let remote = match self
            .remote_candidates
            .iter()
            .find(|cand| cand.address == incoming.from)
        {
            Some(cand) => cand.clone(),
            None => {
                if self.remote_candidates.len() >= MAX_CANDIDATES {
                    warn!("cannot add peer-reflexive candidate: too many candidates");
                    return;
                }
                let mut builder = Candidate::builder(
                    incoming.component_id,
                    CandidateType::PeerReflexive,
                    incoming.transport,
                    incoming.from,
                )
                .priority(incoming.priority)
                // unique foundation, distinct from any signalled candidate
                .foundation(&format!("P{:08x}", rand::random::<u32>()));
                if incoming.transport == TransportType::Tcp {
                    builder = builder.tcp_type(crate::candidate::TcpType::Active);
                }
                let prflx = builder.build();
                debug!(candidate = %prflx, "discovered peer-reflexive remote candidate");
                self.remote_candidates.push(prflx.clone());
                prflx
            }
        };

        // the local candidate the request was addressed to, falling back to
        // the highest-priority one with the same component and transport
        let mut fallback = None;
        let mut resolved = None;
        for check in self.checklist.iter() {
            let cand = &check.pair.local;
            if cand.component_id != incoming.component_id
                || cand.transport_type != incoming.transport
            {
                continue;
            }
            if cand.base_address == incoming.to || cand.address == incoming.to {
                resolved = Some(cand.clone());
                break;
            }
            if fallback.is_none() {
                fallback = Some(cand.clone());
            }
        }
        let Some(local) = resolved.or(fallback) else {
            warn!("binding request for a component with no local candidate");
            return;
        };

        if let Some(check_id) = self.checklist.find_check(&local, &remote) {
            let (state, nominated) = {
                let Some(check) = self.checklist.check_by_id_mut(check_id) else {
                    return;
                };
                // never clear an existing nomination
                check.nominated |= incoming.use_candidate;
                (check.state(), check.nominated)
            };
            match state {
                CandidatePairState::Frozen | CandidatePairState::Waiting => {
                    debug!(check = %check_id, "performing triggered check");
                    self.perform_check(check_id, nominated || self.nominating, now);
                }
                CandidatePairState::InProgress => {
                    debug!(check = %check_id, "triggered check on in-progress pair, retransmitting");
                    let retransmit = self.checklist.check_by_id_mut(check_id).and_then(|check| {
                        let request = check
                            .transaction
                            .as_mut()
                            .map(|transaction| transaction.force_retransmit(now));
                        request.map(|request| transmit_for_check(check, request))
                    });
                    if let Some(transmit) = retransmit {
                        self.transmits.push_back(transmit);
                    }
                }
                CandidatePairState::Succeeded => {
                    if incoming.use_candidate {
                        self.nominate_matching_valid(check_id);
                    }
                    self.on_check_complete(check_id, now);
                }
                CandidatePairState::Failed => {}
            }
        } else {
            // a pair we have never seen: insert it Waiting and perform a
            // triggered check immediately
            let pair = CandidatePair::new(local, remote);
            let mut check = ConnCheck::new(pair, self.controlling());
            check.set_state(CandidatePairState::Waiting);
            check.nominated = incoming.use_candidate;
            let nominate = check.nominated || self.nominating;
            match self.checklist.add_check(check) {
                Ok(check_id) => {
                    debug!(check = %check_id, "new triggered check added");
                    self.perform_check(check_id, nominate, now);
                }
                Err(err) => warn!(error = %err, "unable to add triggered check"),
            }
        }
    }

    /// An incoming USE-CANDIDATE on an already-succeeded check: propagate
    /// the nomination into the valid list.  The controlled agent commonly
    /// finishes the check before the nomination arrives.
    fn nominate_matching_valid(&mut self, check_id: ConnCheckId) {
        let Some((transport, remote, component_id)) =
            self.checklist.check_by_id(check_id).map(|check| {
                (
                    check.pair.local.transport_type,
                    check.pair.remote.clone(),
                    check.pair.local.component_id,
                )
            })
        else {
            return;
        };
        let mut nominated = vec![];
        for valid in self.checklist.valid_iter_mut() {
            if valid.pair.local.transport_type == transport && valid.pair.remote == remote {
                valid.nominated = true;
                nominated.push(valid.id);
                debug!(pair = %valid.pair, "valid pair nominated by incoming check");
            }
        }
        for valid_id in nominated {
            self.update_component_check(component_id, valid_id);
        }
    }

    /// Route a response to the check whose transaction it answers.
    fn handle_response(&mut self, msg: &Message, from: SocketAddr, now: Instant) {
        let Some(check_id) = self.checklist.check_by_transaction(msg.transaction_id()) else {
            trace!(transaction = %msg.transaction_id(), "response for no known transaction");
            return;
        };
        // mark the transaction complete; a duplicate response will no
        // longer find the check
        let request = {
            let Some(check) = self.checklist.check_by_id_mut(check_id) else {
                return;
            };
            match check.transaction.take() {
                Some(transaction) => transaction.request().clone(),
                None => return,
            }
        };

        if msg.class() == MessageClass::Error {
            if msg.error_code() == Some(stun::ROLE_CONFLICT) {
                // flip to the opposite of whatever the request claimed and
                // retry the same check
                let new_role = if request.ice_controlling().is_some() {
                    IceRole::Controlled
                } else {
                    IceRole::Controlling
                };
                if new_role != self.role {
                    info!(%new_role, "changing role because of role conflict response");
                    self.role = new_role;
                }
                debug!(check = %check_id, "resending check because of role conflict");
                let nominated = self
                    .checklist
                    .check_by_id_mut(check_id)
                    .map(|check| {
                        check.set_state(CandidatePairState::Waiting);
                        check.nominated
                    })
                    .unwrap_or_default();
                self.perform_check(check_id, nominated || self.nominating, now);
                return;
            }
            debug!(check = %check_id, code = ?msg.error_code(), "connectivity check error response");
            self.check_failed(check_id, now);
            return;
        }

        // the response must come from the address the request was sent to
        let remote_address = self
            .checklist
            .check_by_id(check_id)
            .map(|check| check.pair.remote.address);
        if remote_address != Some(from) {
            warn!(check = %check_id, %from, "connectivity check failed: source address mismatch");
            self.check_failed(check_id, now);
            return;
        }
        let Some(mapped) = msg.xor_mapped_address() else {
            warn!(check = %check_id, "success response without XOR-MAPPED-ADDRESS");
            self.check_failed(check_id, now);
            return;
        };
        self.check_success(check_id, mapped, now);
    }

    fn check_failed(&mut self, check_id: ConnCheckId, now: Instant) {
        if let Some(check) = self.checklist.check_by_id_mut(check_id) {
            check.cancel_transaction();
            check.set_state(CandidatePairState::Failed);
        }
        self.on_check_complete(check_id, now);
    }

    /// A check succeeded: build the valid pair from the mapped address,
    /// discovering a peer-reflexive local candidate if the mapped address
    /// is unknown, and update the valid list and component state.
    fn check_success(&mut self, check_id: ConnCheckId, mapped: SocketAddr, now: Instant) {
        let Some((pair, nominated)) = self
            .checklist
            .check_by_id(check_id)
            .map(|check| (check.pair.clone(), check.nominated))
        else {
            return;
        };
        info!(check = %check_id, %mapped, nominated, "connectivity check succeeded");

        let local = match self.local_candidates.iter().find(|cand| {
            cand.address == mapped
                && cand.component_id == pair.local.component_id
                && cand.transport_type == pair.local.transport_type
        }) {
            Some(cand) => cand.clone(),
            None => {
                if self.local_candidates.len() >= MAX_CANDIDATES {
                    warn!("cannot add peer-reflexive candidate: too many candidates");
                    self.check_failed(check_id, now);
                    return;
                }
                let mut builder = Candidate::builder(
                    pair.local.component_id,
                    CandidateType::PeerReflexive,
                    pair.local.transport_type,
                    mapped,
                )
                .base_address(pair.local.base_address)
                .related_address(pair.local.base_address);
                if let Some(tcp_type) = pair.local.tcp_type {
                    builder = builder.tcp_type(tcp_type);
                }
                let prflx = builder.build();
                debug!(candidate = %prflx, "discovered peer-reflexive local candidate");
                self.local_candidates.push(prflx.clone());
                prflx
            }
        };

        let valid_pair = CandidatePair::new(local, pair.remote.clone());
        let priority = valid_pair.priority(self.controlling());
        let component_id = valid_pair.local.component_id;
        let valid_id = self.checklist.add_valid(valid_pair, priority, nominated);
        self.update_component_check(component_id, valid_id);
        self.checklist.sort_valid();

        if let Some(check) = self.checklist.check_by_id_mut(check_id) {
            check.set_state(CandidatePairState::Succeeded);
        }
        self.on_check_complete(check_id, now);
    }

    /// Keep the component's best valid and nominated references current.
    fn update_component_check(&mut self, component_id: usize, valid_id: ValidId) {
        let Some((priority, nominated, pair)) = self
            .checklist
            .valid_by_id(valid_id)
            .map(|valid| (valid.priority, valid.nominated, valid.pair.clone()))
        else {
            return;
        };
        let current_valid = self
            .components
            .iter()
            .find(|comp| comp.id == component_id)
            .and_then(|comp| comp.valid_check)
            .and_then(|id| self.checklist.valid_by_id(id))
            .map(|valid| valid.priority);
        let current_nominated = self
            .components
            .iter()
            .find(|comp| comp.id == component_id)
            .and_then(|comp| comp.nominated_check)
            .and_then(|id| self.checklist.valid_by_id(id))
            .map(|valid| valid.priority);

        let Some(component) = self
            .components
            .iter_mut()
            .find(|comp| comp.id == component_id)
        else {
            return;
        };
        if current_valid.map_or(true, |current| current < priority) {
            component.valid_check = Some(valid_id);
        }
        if nominated && current_nominated.map_or(true, |current| current < priority) {
            component.nominated_check = Some(valid_id);
            component.selected_pair = Some(pair.clone());
            let changed = component.set_state(ComponentConnectionState::Connected);
            self.events.push_back(SessionEvent::SelectedPair {
                component_id,
                pair: Box::new(pair),
            });
            if changed {
                self.events.push_back(SessionEvent::ComponentStateChange {
                    component_id,
                    state: ComponentConnectionState::Connected,
                });
            }
        }
    }

    /// Evaluate the session after a check reaches a terminal state.
    /// Returns whether the session completed.
    fn on_check_complete(&mut self, check_id: ConnCheckId, now: Instant) -> bool {
        let Some((state, nominated, component_id, foundation, priority)) =
            self.checklist.check_by_id(check_id).map(|check| {
                (
                    check.state(),
                    check.nominated,
                    check.pair.local.component_id,
                    check.pair.local.foundation.clone(),
                    check.priority,
                )
            })
        else {
            return false;
        };

        // a success unfreezes every sibling with the same foundation
        if state == CandidatePairState::Succeeded {
            self.checklist.unfreeze_foundation(&foundation);
        }

        // a nominated success obsoletes the other checks of its component
        if state == CandidatePairState::Succeeded && nominated {
            for check in self.checklist.iter_mut() {
                if check.id == check_id || check.pair.local.component_id != component_id {
                    continue;
                }
                match check.state() {
                    CandidatePairState::Frozen | CandidatePairState::Waiting => {
                        check.set_state(CandidatePairState::Failed);
                    }
                    CandidatePairState::InProgress if check.priority < priority => {
                        check.cancel_transaction();
                        check.set_state(CandidatePairState::Failed);
                    }
                    _ => {}
                }
            }
        }

        if self
            .components
            .iter()
            .all(|comp| comp.nominated_check.is_some())
        {
            self.complete(Ok(()), now);
            return true;
        }

        if self.checklist.all_terminal() {
            let all_valid = self
                .components
                .iter()
                .all(|comp| comp.valid_check.is_some());
            if !all_valid {
                // some component can never be connected
                self.complete(Err(CompletionError::Failed), now);
                return true;
            }
            match self.role {
                IceRole::Controlled => {
                    // wait for the controlling agent to nominate
                    if self.timer.is_none() {
                        if let Some(timeout) = self.controlled_wait_nomination_timeout {
                            debug!(
                                "all checks have completed, waiting {}ms for nomination",
                                timeout.as_millis()
                            );
                            self.timer = Some(Timer {
                                kind: TimerKind::ControlledWaitNomination,
                                deadline: now + timeout,
                            });
                        }
                    }
                    return false;
                }
                IceRole::Controlling => {
                    info!("all checks have completed, starting nominated checks");
                    self.start_nominated_check(now);
                    return false;
                }
            }
        }

        // controlling agent with full valid coverage: let the checks
        // settle a little, then nominate
        if state == CandidatePairState::Succeeded
            && self.controlling()
            && !self.nominating
            && self.timer.is_none()
            && self
                .components
                .iter()
                .all(|comp| comp.valid_check.is_some())
        {
            debug!(
                "scheduling nominated check in {}ms",
                self.nominated_check_delay.as_millis()
            );
            self.timer = Some(Timer {
                kind: TimerKind::StartNominatedCheck,
                deadline: now + self.nominated_check_delay,
            });
        }
        false
    }

    /// Re-arm the best valid check of every component and resend it with
    /// USE-CANDIDATE.
    fn start_nominated_check(&mut self, now: Instant) {
        if self.nominating {
            return;
        }
        info!("starting nominated checks");
        if self
            .timer
            .as_ref()
            .is_some_and(|timer| timer.kind == TimerKind::StartNominatedCheck)
        {
            self.timer = None;
        }
        for idx in 0..self.components.len() {
            let Some(valid) = self.components[idx]
                .valid_check
                .and_then(|id| self.checklist.valid_by_id(id))
                .map(|valid| valid.pair.clone())
            else {
                continue;
            };
            let rearm = self
                .checklist
                .iter()
                .find(|check| {
                    check.pair.local.transport_type == valid.local.transport_type
                        && check.pair.remote == valid.remote
                })
                .map(|check| check.id);
            if let Some(check_id) = rearm {
                if let Some(check) = self.checklist.check_by_id_mut(check_id) {
                    check.set_state(CandidatePairState::Waiting);
                }
            }
        }
        self.nominating = true;
        self.periodic_tick = Some(now);
    }

    /// Finish ICE processing.  The completion event fires at most once.
    fn complete(&mut self, status: Result<(), CompletionError>, now: Instant) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.timer = None;
        self.periodic_tick = None;
        self.checklist.state = CheckListState::Completed;
        self.checklist.sort_valid();
        match status {
            Ok(()) => info!("ICE processing complete"),
            Err(error) => warn!(%error, "ICE processing failed"),
        }
        self.checklist.dump_check_state();

        let mut changes = vec![];
        for component in self.components.iter_mut() {
            if component.state() != ComponentConnectionState::Connected
                && component.set_state(ComponentConnectionState::Failed)
            {
                changes.push(component.id);
            }
        }
        for component_id in changes {
            self.events.push_back(SessionEvent::ComponentStateChange {
                component_id,
                state: ComponentConnectionState::Failed,
            });
        }
        self.events.push_back(SessionEvent::Completed(status));
        if status.is_ok() {
            // arm the keep-alive timer without sending anything yet
            self.keep_alive(false, now);
        }
    }

    /// Send a Binding indication on the nominated pair of the current
    /// keep-alive component and round-robin to the next one.
    fn keep_alive(&mut self, send_now: bool, now: Instant) {
        let component_count = self.components.len().max(1);
        if send_now {
            let index = self.keepalive_component % component_count;
            if let Some(pair) = self.components[index].selected_pair.clone() {
                trace!(component = self.components[index].id, "sending keep-alive");
                self.transmits.push_back(Transmit {
                    component_id: pair.local.component_id,
                    transport: pair.local.transport_type,
                    from: pair.local.base_address,
                    to: pair.remote.address,
                    msg: Message::binding_indication(),
                });
            }
            self.keepalive_component = (index + 1) % component_count;
        }
        if self.timer.is_none() {
            let jitter = rand::thread_rng().gen_range(0..KEEPALIVE_JITTER_SECS);
            let delay =
                Duration::from_secs(KEEPALIVE_INTERVAL_SECS + jitter) / component_count as u32;
            self.timer = Some(Timer {
                kind: TimerKind::Keepalive,
                deadline: now + delay,
            });
        }
    }
}
