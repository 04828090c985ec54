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

//! The grpclb LB policy.
//!
//! The policy takes as input a set of resolved addresses of which at least
//! one is marked as a balancer.  A channel to those balancers is created at
//! construction time; the first pick, ping or exit-idle request opens a
//! streaming session on it (see [`session`]).  Each server list received on
//! the session is turned into a fresh `round_robin` child picker, installed
//! through a handover that drains the picks and pings queued while no child
//! was available.  Picks routed through a child carry the balancer-issued
//! `lb-token` in their initial metadata.
//!
//! The child's connectivity is folded into the policy's own state: any child
//! state other than TransientFailure/Shutdown is adopted as-is; a child
//! reporting TransientFailure or Shutdown leaves both the current state and
//! the previously installed picker in place.

use std::{
    error::Error,
    sync::{Arc, Once, Weak, atomic::AtomicU64},
    time::Instant,
};

use parking_lot::Mutex;
use tonic::{Status, metadata::MetadataMap};

use crate::{
    client::{
        ConnectivityState, ConnectivityStateTracker, StateWatcher,
        channel::{
            ARG_LB_ADDRESSES, ARG_LB_POLICY_NAME, ARG_SERVER_NAME, ArgValue, BalancerChannel,
            ChannelArgs, ClientChannelFactory,
        },
        load_balancing::{
            Completion, LbPolicy, LbPolicyArgs, LbPolicyFactory, PickArgs, TargetCell,
            UserDataCell, registry::GLOBAL_LB_REGISTRY,
        },
        name_resolution::balancer_target_uri,
    },
    rt::Runtime,
};

mod serverlist;
mod session;
pub mod token;

use serverlist::pb;
use session::{BalancerCall, LbCallBackoff};
use token::LbToken;

pub static POLICY_NAME: &str = "grpclb";

/// The child policy used for the backends the balancer returns.
static CHILD_POLICY_NAME: &str = "round_robin";

struct GrpcLbFactory {}

impl LbPolicyFactory for GrpcLbFactory {
    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn create(
        &self,
        args: LbPolicyArgs,
    ) -> Result<Arc<dyn LbPolicy>, Box<dyn Error + Send + Sync>> {
        let policy = GrpcLbPolicy::new(args)?;
        Ok(policy)
    }
}

/// Registers the grpclb policy in the global registry, once per process.
pub fn reg() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        GLOBAL_LB_REGISTRY.add_factory(GrpcLbFactory {});
    });
}

pub struct GrpcLbPolicy {
    inner: Mutex<Inner>,
    weak_self: Weak<GrpcLbPolicy>,
    call_seq: AtomicU64,
}

struct Inner {
    /// Who the client is trying to communicate with; doubles as the
    /// authority of the balancer call.
    server_name: String,
    /// The channel args the policy was created with, reused (with the
    /// address list replaced) for every child picker.
    args: ChannelArgs,
    channel_factory: Arc<dyn ClientChannelFactory>,
    runtime: Arc<dyn Runtime>,
    /// The channel to the balancer(s).
    lb_channel: Arc<dyn BalancerChannel>,
    /// The child picker built from the current serverlist, if any.
    rr_policy: Option<Arc<dyn LbPolicy>>,
    /// The most recent non-empty serverlist; identical updates are dropped.
    serverlist: Option<pb::ServerList>,
    pending_picks: Vec<PendingPick>,
    pending_pings: Vec<PendingPing>,
    state_tracker: ConnectivityStateTracker,
    started_picking: bool,
    shutting_down: bool,
    /// Deadline of the most recent pick, forwarded to the balancer call.
    deadline: Option<Instant>,
    lb_call: Option<BalancerCall>,
    backoff: LbCallBackoff,
}

/// Work accumulated while holding the policy lock, executed after release.
/// Watcher callbacks and pick completions may re-enter the policy, and a
/// child picker whose last reference goes away fires its shutdown watcher
/// from the destructor.
#[derive(Default)]
pub(super) struct Deferred {
    watchers: Vec<(StateWatcher, ConnectivityState, Option<Status>)>,
    completions: Vec<(Arc<WrappedRrClosure>, Result<(), Status>)>,
    drops: Vec<Arc<dyn LbPolicy>>,
}

impl Deferred {
    pub(super) fn flush(self) {
        for (watcher, state, error) in self.watchers {
            watcher(state, error);
        }
        for (wrapper, result) in self.completions {
            wrapper.run(result);
        }
        // Child policy refs are released last, once their picks are settled.
        drop(self.drops);
    }
}

/// A pick queued while no child picker is available.
struct PendingPick {
    args: PickArgs,
    target: TargetCell,
    wrapper: Arc<WrappedRrClosure>,
}

/// A ping queued while no child picker is available.
struct PendingPing {
    wrapper: Arc<WrappedRrClosure>,
}

/// State shared between a pick (or ping) and the completion handed to the
/// child picker.  Firing the wrapper attaches the LB token of the picked
/// target to the RPC's initial metadata and releases the strong child ref
/// taken on behalf of the request; that release is always the last step.
struct WrappedRrClosure {
    wrapped: Mutex<Option<Completion>>,
    initial_metadata: Option<Arc<Mutex<MetadataMap>>>,
    target: Option<TargetCell>,
    lb_token: UserDataCell,
    lb_token_storage: Option<UserDataCell>,
    rr_policy: Mutex<Option<Arc<dyn LbPolicy>>>,
}

impl WrappedRrClosure {
    fn for_pick(args: &PickArgs, target: &TargetCell, on_complete: Completion) -> Arc<Self> {
        Arc::new(Self {
            wrapped: Mutex::new(Some(on_complete)),
            initial_metadata: Some(args.initial_metadata.clone()),
            target: Some(target.clone()),
            lb_token: Arc::new(Mutex::new(None)),
            lb_token_storage: args.lb_token_storage.clone(),
            rr_policy: Mutex::new(None),
        })
    }

    fn for_ping(notify: Completion) -> Arc<Self> {
        Arc::new(Self {
            wrapped: Mutex::new(Some(notify)),
            initial_metadata: None,
            target: None,
            lb_token: Arc::new(Mutex::new(None)),
            lb_token_storage: None,
            rr_policy: Mutex::new(None),
        })
    }

    fn set_rr(&self, rr: Arc<dyn LbPolicy>) {
        *self.rr_policy.lock() = Some(rr);
    }

    /// The completion handed to the child; `run` fires at most once.
    fn completion(self: &Arc<Self>) -> Completion {
        let this = self.clone();
        Completion::new(move |result| this.run(result))
    }

    fn run(&self, result: Result<(), Status>) {
        let Some(wrapped) = self.wrapped.lock().take() else {
            return;
        };
        if let Some(rr) = self.rr_policy.lock().take() {
            // When no target was produced (e.g. every subchannel failed)
            // there is no token to attach.
            let picked = self.target.as_ref().is_some_and(|t| t.lock().is_some());
            if picked {
                self.attach_token();
            }
            tracing::debug!(target: "glb", "unreffing RR");
            drop(rr);
        }
        wrapped.run(result);
    }

    /// Appends the token recorded at pick time to the RPC's initial metadata
    /// and stores it in the caller's token storage.  A chosen target without
    /// a token violates the serverlist processing contract.
    fn attach_token(&self) {
        let token_data = self.lb_token.lock().clone();
        let token = token_data
            .as_ref()
            .and_then(|t| t.downcast_ref::<LbToken>())
            .cloned();
        let Some(token) = token else {
            tracing::error!(target: "glb", "no LB token for connected subchannel pick");
            panic!("no LB token for connected subchannel pick");
        };
        if let Some(initial_metadata) = &self.initial_metadata {
            token.append_to(&mut initial_metadata.lock());
        }
        if let Some(storage) = &self.lb_token_storage {
            *storage.lock() = token_data;
        }
    }
}

/// Watches the connectivity of one child picker on behalf of the policy.
/// Holds weak refs only, so it neither keeps the policy alive nor the child.
struct RrConnectivity {
    policy: Weak<GrpcLbPolicy>,
    rr: Weak<dyn LbPolicy>,
}

fn rr_connectivity_watcher(data: Arc<RrConnectivity>) -> StateWatcher {
    Box::new(move |state, error| {
        if let Some(policy) = data.policy.upgrade() {
            policy.on_rr_connectivity_changed(&data, state, error);
        }
    })
}

/// The composed policy state is the child's state, except that a child
/// reporting TransientFailure or Shutdown leaves the current state untouched
/// and keeps the previously installed picker (second return value: whether
/// the new child may replace the old one).
fn compose_connectivity(
    current: ConnectivityState,
    rr_state: ConnectivityState,
) -> (ConnectivityState, bool) {
    match rr_state {
        ConnectivityState::TransientFailure | ConnectivityState::Shutdown => (current, false),
        _ => (rr_state, true),
    }
}

fn pick_cancelled(cause: &Status) -> Status {
    Status::cancelled(format!("Pick Cancelled: {}", cause.message()))
}

impl GrpcLbPolicy {
    fn new(args: LbPolicyArgs) -> Result<Arc<Self>, Box<dyn Error + Send + Sync>> {
        let channel_args = args.channel_args;
        let server_name = channel_args
            .get_string(ARG_SERVER_NAME)
            .unwrap_or_default()
            .to_string();
        if server_name.is_empty() {
            return Err("grpclb requires a server name channel arg".into());
        }
        let addresses = channel_args
            .get_address_list(ARG_LB_ADDRESSES)
            .ok_or("grpclb requires a resolved address list channel arg")?
            .clone();
        for address in addresses.iter() {
            if address.user_data.is_some() {
                tracing::error!(target: "glb", %address, "this LB policy doesn't support user data, it will be ignored");
            }
        }
        // Non-balancer addresses are ignored; there must be at least one
        // balancer to talk to.
        let target = balancer_target_uri(&addresses)
            .ok_or("grpclb requires at least one balancer address")?;

        // The channel to the balancers must not select this policy again,
        // and must resolve the target itself: strip the policy name and the
        // address list.
        let inner_channel_args = channel_args
            .clone()
            .without(&[ARG_LB_POLICY_NAME, ARG_LB_ADDRESSES]);
        let lb_channel = args
            .channel_factory
            .create_channel(&target, &inner_channel_args)?;

        let inner = Inner {
            server_name,
            args: channel_args,
            channel_factory: args.channel_factory,
            runtime: args.runtime,
            lb_channel,
            rr_policy: None,
            serverlist: None,
            pending_picks: Vec::new(),
            pending_pings: Vec::new(),
            state_tracker: ConnectivityStateTracker::new(ConnectivityState::Idle),
            started_picking: false,
            shutting_down: false,
            deadline: None,
            lb_call: None,
            backoff: LbCallBackoff::new(),
        };
        Ok(Arc::new_cyclic(|weak| GrpcLbPolicy {
            inner: Mutex::new(inner),
            weak_self: weak.clone(),
            call_seq: AtomicU64::new(0),
        }))
    }

    fn start_picking(&self, inner: &mut Inner) {
        inner.started_picking = true;
        inner.backoff.reset();
        self.query_for_backends(inner);
    }

    /// Performs a pick on the child.  On a synchronous completion the child
    /// does not run the wrapper, so its cleanups happen here.
    fn pick_from_internal_rr(
        rr: &Arc<dyn LbPolicy>,
        args: &PickArgs,
        target: &TargetCell,
        wrapper: &Arc<WrappedRrClosure>,
    ) -> bool {
        let pick_done = rr.pick(args, target, &wrapper.lb_token, wrapper.completion());
        if pick_done {
            let _ = wrapper.wrapped.lock().take();
            tracing::debug!(target: "glb", "unreffing RR (sync pick)");
            let _rr = wrapper.rr_policy.lock().take();
            wrapper.attach_token();
        }
        pick_done
    }

    /// Builds a fresh child picker from the serverlist: the policy's args
    /// with the address list replaced by the processed backend addresses.
    fn create_rr(
        &self,
        inner: &Inner,
        serverlist: &pb::ServerList,
    ) -> Result<Arc<dyn LbPolicy>, Box<dyn Error + Send + Sync>> {
        let addresses = serverlist::process_serverlist(serverlist)
            .ok_or("serverlist contains no usable entries")?;
        let child_args = inner
            .args
            .clone()
            .with(ARG_LB_ADDRESSES, ArgValue::AddressList(Arc::new(addresses)));
        let factory = GLOBAL_LB_REGISTRY
            .get_factory(CHILD_POLICY_NAME)
            .ok_or("round_robin LB policy not registered")?;
        factory.create(LbPolicyArgs {
            channel_args: child_args,
            channel_factory: inner.channel_factory.clone(),
            runtime: inner.runtime.clone(),
        })
    }

    /// Folds a child state report into the policy state.  Returns whether a
    /// newly built child may replace the current one.  Must not be called
    /// once the policy state is Shutdown.
    fn update_lb_connectivity_status(
        inner: &mut Inner,
        rr_state: ConnectivityState,
        rr_error: Option<Status>,
        deferred: &mut Deferred,
    ) -> bool {
        let current = inner.state_tracker.state();
        debug_assert!(current != ConnectivityState::Shutdown);
        match rr_state {
            ConnectivityState::TransientFailure | ConnectivityState::Shutdown => {
                debug_assert!(rr_error.is_some());
            }
            _ => debug_assert!(rr_error.is_none()),
        }
        let (next, replace) = compose_connectivity(current, rr_state);
        if !replace {
            return false;
        }
        tracing::debug!(target: "glb", state = %next, "setting grpclb state from new RR policy state");
        let watchers = inner
            .state_tracker
            .set(next, rr_error.clone(), "update_lb_connectivity_status");
        deferred
            .watchers
            .extend(watchers.into_iter().map(|w| (w, next, rr_error.clone())));
        true
    }

    /// Replaces the active child picker with one built from the current
    /// serverlist and drains the pending queues against it.
    pub(super) fn rr_handover(&self, inner: &mut Inner, deferred: &mut Deferred) {
        if inner.shutting_down {
            return;
        }
        debug_assert!(
            inner
                .serverlist
                .as_ref()
                .is_some_and(|sl| !sl.servers.is_empty())
        );
        let Some(serverlist) = inner.serverlist.clone() else {
            return;
        };

        let new_rr = match self.create_rr(inner, &serverlist) {
            Ok(rr) => rr,
            Err(e) => {
                tracing::error!(
                    target: "glb",
                    error = %e,
                    servers = serverlist.servers.len(),
                    "failure creating a RoundRobin policy for serverlist update, the previous RR instance, if any, will continue to be used"
                );
                return;
            }
        };

        // The policy state becomes a function of the new child's state; a
        // child that is already failing is discarded instead of installed.
        let (new_rr_state, new_rr_error) = new_rr.check_connectivity();
        if !Self::update_lb_connectivity_status(inner, new_rr_state, new_rr_error, deferred) {
            tracing::debug!(
                target: "glb",
                state = %new_rr_state,
                "keeping old RR policy despite new serverlist, new RR policy was in a failing connectivity state"
            );
            deferred.drops.push(new_rr);
            return;
        }

        tracing::debug!(target: "glb", "created RR policy to replace old one");
        if let Some(old_rr) = inner.rr_policy.take() {
            deferred.drops.push(old_rr);
        }
        inner.rr_policy = Some(new_rr.clone());

        let watcher_data = Arc::new(RrConnectivity {
            policy: self.weak_self.clone(),
            rr: Arc::downgrade(&new_rr),
        });
        new_rr.notify_on_state_change(new_rr_state, rr_connectivity_watcher(watcher_data));
        new_rr.exit_idle();

        // Drain waiting picks and pings; each takes a strong ref on the new
        // child, released when its wrapper fires.
        while let Some(pending) = inner.pending_picks.pop() {
            pending.wrapper.set_rr(new_rr.clone());
            tracing::debug!(target: "glb", "pending pick about to PICK from internal RR");
            Self::pick_from_internal_rr(&new_rr, &pending.args, &pending.target, &pending.wrapper);
        }
        while let Some(pending) = inner.pending_pings.pop() {
            pending.wrapper.set_rr(new_rr.clone());
            tracing::debug!(target: "glb", "pending ping about to PING from internal RR");
            new_rr.ping_one(pending.wrapper.completion());
        }
    }

    fn on_rr_connectivity_changed(
        &self,
        data: &Arc<RrConnectivity>,
        state: ConnectivityState,
        error: Option<Status>,
    ) {
        let mut deferred = Deferred::default();
        let resubscribe = {
            let mut inner = self.inner.lock();
            if state == ConnectivityState::Shutdown || inner.shutting_down {
                // The watched child is going away, or we are: the watcher
                // retires and its weak refs die with it.
                false
            } else {
                Self::update_lb_connectivity_status(&mut inner, state, error.clone(), &mut deferred);
                true
            }
        };
        if resubscribe {
            // Re-register on the same picker the report came from.
            if let Some(rr) = data.rr.upgrade() {
                rr.notify_on_state_change(state, rr_connectivity_watcher(data.clone()));
            }
        }
        deferred.flush();
    }
}

impl LbPolicy for GrpcLbPolicy {
    fn pick(
        &self,
        args: &PickArgs,
        target: &TargetCell,
        _user_data: &UserDataCell,
        on_complete: Completion,
    ) -> bool {
        if args.lb_token_storage.is_none() {
            *target.lock() = None;
            on_complete.run(Err(Status::internal(
                "no mdelem storage for the LB token, load reporting won't work without it, failing",
            )));
            return false;
        }

        let mut inner = self.inner.lock();
        inner.deadline = args.deadline;
        if let Some(rr) = inner.rr_policy.clone() {
            tracing::debug!(target: "glb", "about to PICK from internal RR");
            let wrapper = WrappedRrClosure::for_pick(args, target, on_complete);
            wrapper.set_rr(rr.clone());
            Self::pick_from_internal_rr(&rr, args, target, &wrapper)
        } else {
            tracing::debug!(target: "glb", "no RR policy, adding to pending picks");
            inner.pending_picks.push(PendingPick {
                args: args.clone(),
                target: target.clone(),
                wrapper: WrappedRrClosure::for_pick(args, target, on_complete),
            });
            if !inner.started_picking {
                self.start_picking(&mut inner);
            }
            false
        }
    }

    fn cancel_pick(&self, target: &TargetCell, error: Status) {
        let mut deferred = Deferred::default();
        {
            let mut inner = self.inner.lock();
            let pending = std::mem::take(&mut inner.pending_picks);
            for pp in pending {
                if Arc::ptr_eq(&pp.target, target) {
                    *pp.target.lock() = None;
                    deferred
                        .completions
                        .push((pp.wrapper, Err(pick_cancelled(&error))));
                } else {
                    inner.pending_picks.push(pp);
                }
            }
        }
        deferred.flush();
    }

    fn cancel_picks_by_flags(&self, mask: u32, eq: u32, error: Status) {
        let mut deferred = Deferred::default();
        {
            let mut inner = self.inner.lock();
            let pending = std::mem::take(&mut inner.pending_picks);
            for pp in pending {
                if pp.args.initial_metadata_flags & mask == eq {
                    deferred
                        .completions
                        .push((pp.wrapper, Err(pick_cancelled(&error))));
                } else {
                    inner.pending_picks.push(pp);
                }
            }
        }
        deferred.flush();
    }

    fn ping_one(&self, notify: Completion) {
        let mut inner = self.inner.lock();
        if let Some(rr) = inner.rr_policy.clone() {
            rr.ping_one(notify);
        } else {
            inner.pending_pings.push(PendingPing {
                wrapper: WrappedRrClosure::for_ping(notify),
            });
            if !inner.started_picking {
                self.start_picking(&mut inner);
            }
        }
    }

    fn exit_idle(&self) {
        let mut inner = self.inner.lock();
        if !inner.started_picking {
            self.start_picking(&mut inner);
        }
    }

    fn check_connectivity(&self) -> (ConnectivityState, Option<Status>) {
        let inner = self.inner.lock();
        (inner.state_tracker.state(), inner.state_tracker.error())
    }

    fn notify_on_state_change(&self, last_seen: ConnectivityState, watcher: StateWatcher) {
        let ready = {
            self.inner
                .lock()
                .state_tracker
                .notify_on_state_change(last_seen, watcher)
        };
        if let Some((watcher, state, error)) = ready {
            watcher(state, error);
        }
    }

    fn shutdown(&self) {
        let mut deferred = Deferred::default();
        let cancel;
        {
            let mut inner = self.inner.lock();
            inner.shutting_down = true;

            let picks = std::mem::take(&mut inner.pending_picks);
            let pings = std::mem::take(&mut inner.pending_pings);
            if let Some(rr) = inner.rr_policy.take() {
                deferred.drops.push(rr);
            }
            let error = Some(Status::unavailable("Channel Shutdown"));
            let watchers =
                inner
                    .state_tracker
                    .set(ConnectivityState::Shutdown, error.clone(), "glb_shutdown");
            deferred.watchers.extend(
                watchers
                    .into_iter()
                    .map(|w| (w, ConnectivityState::Shutdown, error.clone())),
            );

            // The call is cancelled only after releasing the lock: its
            // status handler takes this same lock and performs the cleanup.
            cancel = inner.lb_call.as_ref().map(|call| call.cancel.clone());

            for pp in picks {
                *pp.target.lock() = None;
                deferred.completions.push((pp.wrapper, Ok(())));
            }
            for pping in pings {
                deferred.completions.push((pping.wrapper, Ok(())));
            }
        }
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        deferred.flush();
    }
}

impl Drop for GrpcLbPolicy {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(call) = inner.lb_call.take() {
            call.cancel.cancel();
        }
    }
}
