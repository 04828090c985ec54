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

//! Load balancing for gRPC clients.
//!
//! An LB policy decides, per RPC, which connection the RPC should use.  The
//! operations every policy exposes are collected in the [`LbPolicy`] trait;
//! policies are constructed through name-keyed [`LbPolicyFactory`] instances
//! held in the [`registry`].  The grpclb policy lives in [`grpclb`] and uses
//! another registered policy (`round_robin`) as its child.

pub mod grpclb;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_utils;

use std::{any::Any, error::Error, net::SocketAddr, sync::Arc, time::Instant};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tonic::{Status, metadata::MetadataMap};

use crate::{
    client::{
        ConnectivityState, StateWatcher,
        channel::{ChannelArgs, ClientChannelFactory},
        name_resolution::UserData,
    },
    rt::Runtime,
};

/// A connection to a server, ready to carry RPCs.  Produced by a picker; the
/// transport behind it is owned elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedSubchannel {
    address: SocketAddr,
}

impl ConnectedSubchannel {
    pub fn new(address: SocketAddr) -> Self {
        Self { address }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

/// Output slot for a pick.  The cell's identity doubles as the key for
/// cancelling a specific pending pick.
pub type TargetCell = Arc<Mutex<Option<Arc<ConnectedSubchannel>>>>;

/// Output slot for the opaque per-address data of a picked target.
pub type UserDataCell = Arc<Mutex<Option<UserData>>>;

/// The arguments of one pick operation.
#[derive(Clone)]
pub struct PickArgs {
    /// The RPC's initial metadata, to which the policy may append entries.
    pub initial_metadata: Arc<Mutex<MetadataMap>>,
    /// Flags the caller set on the initial metadata batch; used for bulk
    /// cancellation.
    pub initial_metadata_flags: u32,
    /// The RPC's deadline.
    pub deadline: Option<Instant>,
    /// Storage for the LB token metadata element attached to the pick.  A
    /// policy that attaches tokens fails picks that do not provide it.
    pub lb_token_storage: Option<UserDataCell>,
}

impl PickArgs {
    pub fn new(initial_metadata: Arc<Mutex<MetadataMap>>) -> Self {
        Self {
            initial_metadata,
            initial_metadata_flags: 0,
            deadline: None,
            lb_token_storage: Some(Arc::new(Mutex::new(None))),
        }
    }
}

/// A one-shot completion callback.  Consuming `run` makes double invocation
/// unrepresentable; dropping an unfired completion is allowed and silent.
pub struct Completion(Box<dyn FnOnce(Result<(), Status>) + Send>);

impl Completion {
    pub fn new(f: impl FnOnce(Result<(), Status>) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn run(self, result: Result<(), Status>) {
        (self.0)(result)
    }
}

/// The operations of an LB policy instance.  Implemented both by grpclb
/// itself (toward the channel) and by the child policies it creates.
///
/// All operations are non-blocking: a pick either resolves synchronously or
/// is queued by the policy, which later completes it through the provided
/// callback.
pub trait LbPolicy: Send + Sync {
    /// Picks a connection for an RPC.
    ///
    /// On a synchronous pick the target and `user_data` cells are filled and
    /// `true` is returned; `on_complete` is not invoked.  Otherwise the
    /// policy takes ownership of `on_complete` and fires it once the pick
    /// resolves, after filling the cells.
    fn pick(
        &self,
        args: &PickArgs,
        target: &TargetCell,
        user_data: &UserDataCell,
        on_complete: Completion,
    ) -> bool;

    /// Cancels the pending pick whose target cell is `target`.  Picks that
    /// already completed, or that were handed to a child, are unaffected.
    fn cancel_pick(&self, target: &TargetCell, error: Status);

    /// Cancels all pending picks whose initial metadata flags match
    /// `flags & mask == eq`.
    fn cancel_picks_by_flags(&self, mask: u32, eq: u32, error: Status);

    /// Requests a ping on a connection; `notify` fires when it resolves.
    fn ping_one(&self, notify: Completion);

    /// Kicks an idle policy into connecting.
    fn exit_idle(&self);

    /// Returns the policy's connectivity state and, for TransientFailure or
    /// Shutdown, the associated error.
    fn check_connectivity(&self) -> (ConnectivityState, Option<Status>);

    /// Registers a one-shot state watcher, fired as soon as the state
    /// differs from `last_seen`.
    fn notify_on_state_change(&self, last_seen: ConnectivityState, watcher: StateWatcher);

    /// Shuts the policy down: pending work is drained, the state becomes
    /// Shutdown, and no further picks succeed.  Idempotent.
    fn shutdown(&self);
}

/// Everything a factory needs to build a policy instance.
pub struct LbPolicyArgs {
    pub channel_args: ChannelArgs,
    pub channel_factory: Arc<dyn ClientChannelFactory>,
    pub runtime: Arc<dyn Runtime>,
}

/// An LB policy factory, registered by name in the [`registry`].
pub trait LbPolicyFactory: Send + Sync {
    /// Reports the name of the LB policy.
    fn name(&self) -> &'static str;

    /// Builds a new policy instance.  Fails when the supplied arguments are
    /// unusable for this policy (e.g. no balancer addresses for grpclb).
    fn create(&self, args: LbPolicyArgs)
    -> Result<Arc<dyn LbPolicy>, Box<dyn Error + Send + Sync>>;

    /// Parses the JSON LB policy configuration into an internal
    /// representation.
    ///
    /// LB policies do not need to accept a configuration, in which case the
    /// default implementation returns Ok(None).
    fn parse_config(
        &self,
        _config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }
}

/// A JSON LB configuration as received from the service config, not yet
/// converted into a policy's own representation.
#[derive(Debug, Clone)]
pub struct ParsedJsonLbConfig {
    value: serde_json::Value,
}

impl ParsedJsonLbConfig {
    pub fn new(json: &str) -> Result<Self, String> {
        match serde_json::from_str(json) {
            Ok(value) => Ok(ParsedJsonLbConfig { value }),
            Err(e) => Err(format!("failed to parse LB config JSON: {e}")),
        }
    }

    pub fn from_value(value: serde_json::Value) -> Self {
        ParsedJsonLbConfig { value }
    }

    /// Converts the wrapped JSON into the type used by the LB policy.
    pub fn convert_to<T: DeserializeOwned>(&self) -> Result<T, String> {
        serde_json::from_value(self.value.clone()).map_err(|e| e.to_string())
    }
}

/// A policy's parsed configuration, type-erased for transport through the
/// channel.
pub struct LbConfig {
    config: Arc<dyn Any + Send + Sync>,
}

impl LbConfig {
    pub fn new<T: Send + Sync + 'static>(config: T) -> Self {
        LbConfig {
            config: Arc::new(config),
        }
    }

    pub fn convert_to<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, String> {
        self.config
            .clone()
            .downcast::<T>()
            .map_err(|_| "config is of an unexpected type".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize, Debug, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct SampleConfig {
        child_policy: Option<String>,
    }

    #[test]
    fn parsed_json_lb_config_round_trips() {
        let parsed = ParsedJsonLbConfig::from_value(json!({"childPolicy": "round_robin"}));
        let config: SampleConfig = parsed.convert_to().unwrap();
        assert_eq!(config.child_policy.as_deref(), Some("round_robin"));

        let wrapped = LbConfig::new(config);
        let back: Arc<SampleConfig> = wrapped.convert_to().unwrap();
        assert_eq!(back.child_policy.as_deref(), Some("round_robin"));
        assert!(wrapped.convert_to::<u64>().is_err());
    }

    #[test]
    fn parsed_json_lb_config_rejects_invalid_json() {
        assert!(ParsedJsonLbConfig::new("{not json").is_err());
        assert!(ParsedJsonLbConfig::new("{}").is_ok());
    }
}
