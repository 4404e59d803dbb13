// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-component state of an ICE session

use crate::candidate::CandidatePair;
use crate::conncheck::ValidId;

/// The connection state of a component
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ComponentConnectionState {
    /// No connectivity checks are in progress.
    New,
    /// Connectivity checks are in progress for this component.
    Connecting,
    /// A pair has been nominated for this component.
    Connected,
    /// No connection could be found for this component.
    Failed,
}

/// State a session tracks for each of its components.
///
/// The best valid and nominated checks are referenced by stable id so that
/// reordering the owning lists never invalidates them.
#[derive(Debug)]
pub(crate) struct Component {
    pub(crate) id: usize,
    state: ComponentConnectionState,
    pub(crate) valid_check: Option<ValidId>,
    pub(crate) nominated_check: Option<ValidId>,
    pub(crate) selected_pair: Option<CandidatePair>,
}

impl Component {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            state: ComponentConnectionState::New,
            valid_check: None,
            nominated_check: None,
            selected_pair: None,
        }
    }

    pub(crate) fn state(&self) -> ComponentConnectionState {
        self.state
    }

    /// Update the connection state, returning whether it changed.
    pub(crate) fn set_state(&mut self, state: ComponentConnectionState) -> bool {
        if self.state != state {
            debug!(
                component = self.id,
                old_state = ?self.state,
                new_state = ?state,
                "setting component state"
            );
            self.state = state;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_new() {
        let _log = crate::tests::test_init_log();
        let component = Component::new(1);
        assert_eq!(component.state(), ComponentConnectionState::New);
        assert!(component.valid_check.is_none());
        assert!(component.nominated_check.is_none());
    }

    #[test]
    fn set_state_reports_change() {
        let _log = crate::tests::test_init_log();
        let mut component = Component::new(1);
        assert!(component.set_state(ComponentConnectionState::Connecting));
        assert!(!component.set_state(ComponentConnectionState::Connecting));
        assert!(component.set_state(ComponentConnectionState::Connected));
    }
}
