// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Backend transition table.
//!
//! The backend walks from its current state towards a target chosen from the
//! peer's state, one legal edge at a time. Each edge names the side effect
//! that must run before the new state is published. Pairs outside the table
//! are a [`Fault`], never a silent no-op.

use thiserror::Error;

use crate::state::ConnState;

/// Upper bound on edges in one walk; the longest legal walk has three.
pub const MAX_STEPS: usize = 8;

/// Side effect attached to an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeAction {
    /// Publish the new state only.
    Publish,
    /// Bring the transport up, then publish.
    ConnectSetup,
    /// Take the transport down, then publish.
    ConnectTeardown,
}

/// One legal single-step transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// State before the step.
    pub from: ConnState,
    /// State after the step.
    pub to: ConnState,
    /// Work performed before publishing `to`.
    pub action: EdgeAction,
}

/// Protocol violation detected by the state machine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// No edge leads from `from` towards `to`.
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        /// Local state.
        from: ConnState,
        /// Requested target.
        to: ConnState,
    },
    /// The local state machine was never activated.
    #[error("local state is Unknown")]
    UnknownLocalState,
    /// The walk did not reach its target within [`MAX_STEPS`].
    #[error("walk {from} -> {to} does not terminate")]
    Unterminated {
        /// Start of the walk.
        from: ConnState,
        /// Requested target.
        to: ConnState,
    },
}

/// Next edge from `current` towards `target` (which must differ from `current`).
pub fn next_edge(current: ConnState, target: ConnState) -> Result<Edge, Fault> {
    use ConnState::*;
    use EdgeAction::*;

    let (to, action) = match (current, target) {
        (Unknown, _) => return Err(Fault::UnknownLocalState),
        (Initialising, InitWait | Connected | Closing) => (InitWait, Publish),
        (Initialising, Closed) => (Closed, Publish),
        (Closed, InitWait | Connected) => (InitWait, Publish),
        (Closed, Closing) => (Closing, Publish),
        (InitWait, Connected) => (Connected, ConnectSetup),
        (InitWait, Closing | Closed) => (Closing, Publish),
        (Connected, InitWait | Closing | Closed) => (Closing, ConnectTeardown),
        (Closing, InitWait | Connected | Closed) => (Closed, Publish),
        _ => return Err(Fault::IllegalTransition { from: current, to: target }),
    };
    Ok(Edge { from: current, to, action })
}

/// Full list of edges from `current` to `target`; empty when already there.
pub fn plan(current: ConnState, target: ConnState) -> Result<Vec<Edge>, Fault> {
    let mut edges = Vec::new();
    let mut state = current;
    while state != target {
        if edges.len() == MAX_STEPS {
            return Err(Fault::Unterminated { from: current, to: target });
        }
        let edge = next_edge(state, target)?;
        state = edge.to;
        edges.push(edge);
    }
    Ok(edges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use ConnState::*;

    const LEGAL: [(ConnState, ConnState); 8] = [
        (Initialising, InitWait),
        (Initialising, Closed),
        (Closed, InitWait),
        (Closed, Closing),
        (InitWait, Connected),
        (InitWait, Closing),
        (Connected, Closing),
        (Closing, Closed),
    ];

    fn check_walk(from: ConnState, to: ConnState) -> Result<usize, Fault> {
        let edges = plan(from, to)?;
        let mut state = from;
        for edge in &edges {
            assert_eq!(edge.from, state);
            assert!(LEGAL.contains(&(edge.from, edge.to)), "{} -> {} not tabulated", edge.from, edge.to);
            let expected = match (edge.from, edge.to) {
                (InitWait, Connected) => EdgeAction::ConnectSetup,
                (Connected, Closing) => EdgeAction::ConnectTeardown,
                _ => EdgeAction::Publish,
            };
            assert_eq!(edge.action, expected);
            state = edge.to;
        }
        assert_eq!(state, to);
        Ok(edges.len())
    }

    #[test]
    fn every_pair_reaches_target_or_faults() {
        let mut reached = 0;
        for from in ConnState::ALL {
            for to in ConnState::ALL {
                match check_walk(from, to) {
                    Ok(steps) => {
                        assert!(steps <= 3);
                        reached += 1;
                    }
                    Err(Fault::UnknownLocalState) => assert_eq!(from, Unknown),
                    Err(Fault::IllegalTransition { .. }) => {}
                    Err(fault @ Fault::Unterminated { .. }) => panic!("{fault}"),
                }
            }
        }
        // Nine self-walks plus sixteen distinct pairs: Initialising is only ever a start.
        assert_eq!(reached, 9 + 16);
    }

    #[test]
    fn source_step_choices() {
        assert_eq!(next_edge(Initialising, Connected).unwrap().to, InitWait);
        assert_eq!(next_edge(Connected, InitWait).unwrap().to, Closing);
        assert_eq!(next_edge(Closing, Connected).unwrap().to, Closed);
        assert_eq!(next_edge(Closed, Connected).unwrap().to, InitWait);
        assert_eq!(plan(Connected, Closed).unwrap().len(), 2);
        assert_eq!(
            next_edge(InitWait, Initialising),
            Err(Fault::IllegalTransition { from: InitWait, to: Initialising })
        );
    }

    fn any_state() -> impl Strategy<Value = ConnState> {
        (0u8..9).prop_map(|code| ConnState::from_code(code).unwrap_or(Unknown))
    }

    proptest! {
        #[test]
        fn walks_chain_without_leaving_the_table(
            start in any_state(),
            targets in proptest::collection::vec(any_state(), 1..16),
        ) {
            let mut state = start;
            for target in targets {
                match plan(state, target) {
                    Ok(edges) => {
                        prop_assert!(edges.iter().all(|edge| LEGAL.contains(&(edge.from, edge.to))));
                        state = target;
                    }
                    Err(fault) => {
                        let unterminated = matches!(fault, Fault::Unterminated { .. });
                        prop_assert!(!unterminated);
                    }
                }
            }
        }
    }
}
