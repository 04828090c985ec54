/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

use std::fmt::Display;

use tonic::Status;

pub mod channel;
pub mod load_balancing;
pub mod name_resolution;

/// A representation of the current state of a gRPC channel, also used for the
/// state of LB policies and subchannels (individual connections within the
/// channel).
///
/// A channel begins in the Idle state.  When an RPC is attempted, the channel
/// will automatically transition to Connecting.  If connections to a backend
/// service are available, the state becomes Ready.  Otherwise, if RPCs would
/// fail due to a lack of connections, the state becomes TransientFailure and
/// the channel continues to attempt to reconnect.  Shutdown is terminal and
/// only ever entered through an explicit shutdown.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ConnectivityState {
    Init,
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityState::Init => write!(f, "Init"),
            ConnectivityState::Idle => write!(f, "Idle"),
            ConnectivityState::Connecting => write!(f, "Connecting"),
            ConnectivityState::Ready => write!(f, "Ready"),
            ConnectivityState::TransientFailure => write!(f, "TransientFailure"),
            ConnectivityState::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// A one-shot observer of connectivity state changes.  Receives the new state
/// and, for TransientFailure and Shutdown, the associated error.
///
/// Watchers are invoked outside the lock of the component that owns the
/// tracker, on whatever thread performed the transition.  A watcher that
/// wants further notifications must re-register itself.
pub type StateWatcher = Box<dyn FnOnce(ConnectivityState, Option<Status>) + Send>;

/// Tracks the connectivity state of a component and the set of one-shot
/// watchers waiting for it to change.
///
/// The tracker itself is not synchronized; it is meant to be embedded in
/// state that is already guarded by the owner's mutex.  Mutating methods
/// return the watchers that became ready instead of invoking them, so the
/// owner can release its lock first.
pub struct ConnectivityStateTracker {
    state: ConnectivityState,
    error: Option<Status>,
    watchers: Vec<StateWatcher>,
}

impl ConnectivityStateTracker {
    pub fn new(initial: ConnectivityState) -> Self {
        Self {
            state: initial,
            error: None,
            watchers: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn error(&self) -> Option<Status> {
        self.error.clone()
    }

    /// Moves the tracker to `state`.  Returns the watchers to notify; empty
    /// when the state did not change.
    #[must_use = "returned watchers must be invoked outside the owner's lock"]
    pub fn set(
        &mut self,
        state: ConnectivityState,
        error: Option<Status>,
        reason: &'static str,
    ) -> Vec<StateWatcher> {
        if self.state == state {
            self.error = error;
            return Vec::new();
        }
        tracing::trace!(target: "glb", from = %self.state, to = %state, reason, "connectivity state change");
        self.state = state;
        self.error = error;
        std::mem::take(&mut self.watchers)
    }

    /// Registers a one-shot watcher.  If the tracked state already differs
    /// from `last_seen`, the watcher is returned to the caller to be invoked
    /// immediately (outside the owner's lock); otherwise it is queued for the
    /// next transition.
    #[must_use = "a returned watcher must be invoked outside the owner's lock"]
    pub fn notify_on_state_change(
        &mut self,
        last_seen: ConnectivityState,
        watcher: StateWatcher,
    ) -> Option<(StateWatcher, ConnectivityState, Option<Status>)> {
        if last_seen != self.state {
            return Some((watcher, self.state, self.error.clone()));
        }
        self.watchers.push(watcher);
        None
    }

    /// Removes all queued watchers, to be fired by the owner on teardown.
    pub fn take_watchers(&mut self) -> Vec<StateWatcher> {
        std::mem::take(&mut self.watchers)
    }
}
