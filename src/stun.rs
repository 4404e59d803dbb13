// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Structured STUN messages and connectivity check transactions.
//!
//! Wire encoding, decoding and authentication are the caller's concern.
//! Messages cross this boundary as typed values carrying only the
//! attributes the ICE session reads and writes.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// The transport family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    /// The UDP transport
    Udp,
    /// The TCP transport
    Tcp,
}

/// Errors when parsing a [`TransportType`]
#[derive(Debug)]
pub enum ParseTransportTypeError {
    UnknownTransport,
}

impl std::error::Error for ParseTransportTypeError {}

impl std::fmt::Display for ParseTransportTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl FromStr for TransportType {
    type Err = ParseTransportTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UDP" => Ok(TransportType::Udp),
            "TCP" => Ok(TransportType::Tcp),
            _ => Err(ParseTransportTypeError::UnknownTransport),
        }
    }
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            TransportType::Udp => f.pad("UDP"),
            TransportType::Tcp => f.pad("TCP"),
        }
    }
}

/// A STUN transaction identifier (96 bits of randomness)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(u128);

impl TransactionId {
    pub fn generate() -> Self {
        TransactionId(rand::random::<u128>() & 0xffff_ffff_ffff_ffff_ffff_ffff)
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:024x}", self.0)
    }
}

/// The class of a STUN message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Request,
    Indication,
    Success,
    Error,
}

/// The Binding method, the only method the session deals in
pub const BINDING: u16 = 0x0001;

/// STUN error code for a malformed or unexpected request
pub const BAD_REQUEST: u16 = 400;
/// STUN error code for failed credential validation
pub const UNAUTHORIZED: u16 = 401;
/// STUN error code signalling a controlling/controlled role conflict
pub const ROLE_CONFLICT: u16 = 487;

/// A typed STUN attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    Priority(u32),
    UseCandidate,
    IceControlling(u64),
    IceControlled(u64),
    Username(String),
    XorMappedAddress(SocketAddr),
    ErrorCode { code: u16, reason: String },
}

/// A structured STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    class: MessageClass,
    method: u16,
    transaction_id: TransactionId,
    attributes: Vec<Attribute>,
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Message({:?} method:{:#x} tid:{} attrs:{})",
            self.class,
            self.method,
            self.transaction_id,
            self.attributes.len()
        )
    }
}

impl Message {
    /// Create a new Binding request with a fresh transaction id
    pub fn binding_request() -> Self {
        Self {
            class: MessageClass::Request,
            method: BINDING,
            transaction_id: TransactionId::generate(),
            attributes: vec![],
        }
    }

    /// Create a new Binding indication.  Indications carry no attributes.
    pub fn binding_indication() -> Self {
        Self {
            class: MessageClass::Indication,
            method: BINDING,
            transaction_id: TransactionId::generate(),
            attributes: vec![],
        }
    }

    /// Create a success response to `request`
    pub fn success_response(request: &Message) -> Self {
        Self {
            class: MessageClass::Success,
            method: request.method,
            transaction_id: request.transaction_id,
            attributes: vec![],
        }
    }

    /// Create an error response to `request` with the provided error code
    pub fn error_response(request: &Message, code: u16, reason: &str) -> Self {
        Self {
            class: MessageClass::Error,
            method: request.method,
            transaction_id: request.transaction_id,
            attributes: vec![Attribute::ErrorCode {
                code,
                reason: reason.to_owned(),
            }],
        }
    }

    pub fn class(&self) -> MessageClass {
        self.class
    }

    pub fn method(&self) -> u16 {
        self.method
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn is_response(&self) -> bool {
        matches!(self.class, MessageClass::Success | MessageClass::Error)
    }

    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn has_attribute(&self, matcher: impl Fn(&Attribute) -> bool) -> bool {
        self.attributes.iter().any(matcher)
    }

    pub fn priority(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Priority(v) => Some(*v),
            _ => None,
        })
    }

    pub fn use_candidate(&self) -> bool {
        self.has_attribute(|a| matches!(a, Attribute::UseCandidate))
    }

    pub fn ice_controlling(&self) -> Option<u64> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::IceControlling(v) => Some(*v),
            _ => None,
        })
    }

    pub fn ice_controlled(&self) -> Option<u64> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::IceControlled(v) => Some(*v),
            _ => None,
        })
    }

    pub fn username(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Username(v) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorMappedAddress(v) => Some(*v),
            _ => None,
        })
    }

    pub fn error_code(&self) -> Option<u16> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ErrorCode { code, .. } => Some(*code),
            _ => None,
        })
    }
}

/// Initial retransmission timeout for a request transaction
const STUN_RTO: Duration = Duration::from_millis(500);
/// Total number of transmissions before a transaction times out
const STUN_TRANSMITS: u32 = 7;

/// The retransmission state of one in-flight request.
///
/// The initial transmission is the caller's: constructing the transaction
/// assumes the request goes out at `now` and only schedules what follows.
#[derive(Debug)]
pub struct StunTransaction {
    request: Message,
    transmit_count: u32,
    rto: Duration,
    retransmit_at: Instant,
}

/// Return value of [`StunTransaction::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPoll {
    /// Nothing to do before the provided deadline.
    WaitUntil(Instant),
    /// The request needs to be retransmitted now.
    Retransmit,
    /// The transaction has run out of retransmissions.
    TimedOut,
}

impl StunTransaction {
    pub fn new(request: Message, now: Instant) -> Self {
        Self {
            request,
            transmit_count: 1,
            rto: STUN_RTO,
            retransmit_at: now + STUN_RTO,
        }
    }

    pub fn request(&self) -> &Message {
        &self.request
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.request.transaction_id()
    }

    /// Advance the retransmission schedule.  A [`TransactionPoll::Retransmit`]
    /// return means the caller must send [`StunTransaction::request`] again.
    pub fn poll(&mut self, now: Instant) -> TransactionPoll {
        if now < self.retransmit_at {
            return TransactionPoll::WaitUntil(self.retransmit_at);
        }
        if self.transmit_count >= STUN_TRANSMITS {
            return TransactionPoll::TimedOut;
        }
        self.transmit_count += 1;
        self.rto *= 2;
        self.retransmit_at = now + self.rto;
        TransactionPoll::Retransmit
    }

    /// Immediately retransmit, used by triggered checks against an
    /// In-Progress pair.  Resets the next scheduled retransmission.
    pub fn force_retransmit(&mut self, now: Instant) -> Message {
        self.retransmit_at = now + self.rto;
        self.request.clone()
    }
}
