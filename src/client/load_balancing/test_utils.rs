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

//! Fakes shared by LB policy tests: a balancer channel whose calls are
//! driven by the test, a `round_robin` child policy whose state transitions
//! the test controls, and a runtime with observable timers.

use std::{
    error::Error,
    fmt::Debug,
    future::Future,
    pin::Pin,
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tonic::Status;

use crate::{
    client::{
        ConnectivityState, ConnectivityStateTracker, StateWatcher,
        channel::{
            ARG_LB_ADDRESSES, BalanceLoadCall, BalancerChannel, CancelHandle, ChannelArgs,
            ClientChannelFactory, ResponseStream,
        },
        load_balancing::{
            Completion, ConnectedSubchannel, LbPolicy, LbPolicyArgs, LbPolicyFactory, PickArgs,
            TargetCell, UserDataCell, registry::GLOBAL_LB_REGISTRY,
        },
        name_resolution::Address,
    },
    rt::{Runtime, Sleep, TaskHandle},
};

/// Events produced by the fake transport and runtime.
pub(crate) enum TestEvent {
    ChannelCreated(String, ChannelArgs),
    CallStarted(FakeBalancerCall),
    SleepRequested(Duration),
}

impl Debug for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChannelCreated(target, _) => write!(f, "ChannelCreated({target})"),
            Self::CallStarted(call) => write!(f, "CallStarted({})", call.authority),
            Self::SleepRequested(d) => write!(f, "SleepRequested({d:?})"),
        }
    }
}

/// The test's handle to one balancer call opened by the policy.  Responses
/// sent here surface from the call's stream; dropping the handle ends the
/// stream cleanly.
pub(crate) struct FakeBalancerCall {
    pub(crate) authority: String,
    pub(crate) payload: Bytes,
    pub(crate) deadline: Option<Instant>,
    pub(crate) cancel: CancelHandle,
    pub(crate) responses: mpsc::UnboundedSender<Result<Bytes, Status>>,
}

struct FakeResponseStream {
    rx: mpsc::UnboundedReceiver<Result<Bytes, Status>>,
}

#[tonic::async_trait]
impl ResponseStream for FakeResponseStream {
    async fn message(&mut self) -> Result<Option<Bytes>, Status> {
        match self.rx.recv().await {
            Some(Ok(payload)) => Ok(Some(payload)),
            Some(Err(status)) => Err(status),
            None => Ok(None),
        }
    }
}

pub(crate) struct FakeBalancerChannel {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

#[tonic::async_trait]
impl BalancerChannel for FakeBalancerChannel {
    async fn balance_load(&self, call: BalanceLoadCall) -> Result<Box<dyn ResponseStream>, Status> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.tx_events.send(TestEvent::CallStarted(FakeBalancerCall {
            authority: call.authority,
            payload: call.payload,
            deadline: call.deadline,
            cancel: call.cancel,
            responses: tx,
        }));
        Ok(Box::new(FakeResponseStream { rx }))
    }
}

pub(crate) struct FakeChannelFactory {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl ClientChannelFactory for FakeChannelFactory {
    fn create_channel(
        &self,
        target: &str,
        args: &ChannelArgs,
    ) -> Result<Arc<dyn BalancerChannel>, Box<dyn Error + Send + Sync>> {
        let _ = self
            .tx_events
            .send(TestEvent::ChannelCreated(target.to_string(), args.clone()));
        Ok(Arc::new(FakeBalancerChannel {
            tx_events: self.tx_events.clone(),
        }))
    }
}

/// A tokio-backed runtime that reports every requested sleep and shortens it
/// so retry paths run promptly in tests.
pub(crate) struct TestRuntime {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl Runtime for TestRuntime {
    fn spawn(
        &self,
        task: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
    ) -> Box<dyn TaskHandle> {
        Box::new(tokio::spawn(task))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>> {
        let _ = self.tx_events.send(TestEvent::SleepRequested(duration));
        Box::pin(tokio::time::sleep(Duration::from_millis(5)))
    }
}

/// Channel arg under which tests pass the fake round_robin configuration
/// through the grpclb policy into the child factory.
pub(crate) const FAKE_RR_CONFIG_ARG: &str = "test.fake_round_robin_config";

/// Events produced by fake round_robin instances.
pub(crate) enum FakeRrEvent {
    Created(Arc<FakeRoundRobin>),
    ExitIdle,
    PickQueued,
    PingQueued,
}

impl Debug for FakeRrEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created(_) => write!(f, "Created"),
            Self::ExitIdle => write!(f, "ExitIdle"),
            Self::PickQueued => write!(f, "PickQueued"),
            Self::PingQueued => write!(f, "PingQueued"),
        }
    }
}

#[derive(Clone)]
pub(crate) struct FakeRrConfig {
    pub(crate) initial_state: ConnectivityState,
    pub(crate) initial_error: Option<Status>,
    pub(crate) fail_create: Arc<AtomicBool>,
    pub(crate) events: mpsc::UnboundedSender<FakeRrEvent>,
}

impl FakeRrConfig {
    pub(crate) fn new(events: mpsc::UnboundedSender<FakeRrEvent>) -> Self {
        Self {
            initial_state: ConnectivityState::Idle,
            initial_error: None,
            fail_create: Arc::new(AtomicBool::new(false)),
            events,
        }
    }
}

struct FakeQueuedPick {
    target: TargetCell,
    user_data: UserDataCell,
    on_complete: Completion,
    flags: u32,
}

struct FakeRrInner {
    addresses: Arc<Vec<Address>>,
    tracker: ConnectivityStateTracker,
    next: usize,
    queued_picks: Vec<FakeQueuedPick>,
    queued_pings: Vec<Completion>,
    events: mpsc::UnboundedSender<FakeRrEvent>,
}

/// A child policy whose connectivity the test drives explicitly via
/// `set_state`.  Picks made while Ready complete synchronously, rotating
/// through the configured addresses; otherwise they queue and complete on
/// the transition to Ready.
pub(crate) struct FakeRoundRobin {
    inner: Mutex<FakeRrInner>,
}

impl FakeRoundRobin {
    /// Transitions the fake and delivers the resulting callbacks the way the
    /// RPC runtime would: on other tasks, with no internal lock held.
    pub(crate) fn set_state(&self, state: ConnectivityState, error: Option<Status>) {
        let mut completions: Vec<Box<dyn FnOnce() + Send>> = Vec::new();
        let watchers;
        {
            let mut inner = self.inner.lock();
            watchers = inner.tracker.set(state, error.clone(), "test transition");
            if state == ConnectivityState::Ready {
                for pick in std::mem::take(&mut inner.queued_picks) {
                    let address = Self::next_address(&mut inner);
                    completions.push(Box::new(move || {
                        *pick.target.lock() =
                            Some(Arc::new(ConnectedSubchannel::new(address.address)));
                        *pick.user_data.lock() = address.user_data.clone();
                        pick.on_complete.run(Ok(()));
                    }));
                }
                for ping in std::mem::take(&mut inner.queued_pings) {
                    completions.push(Box::new(move || ping.run(Ok(()))));
                }
            }
        }
        for watcher in watchers {
            let error = error.clone();
            tokio::spawn(async move { watcher(state, error) });
        }
        // One task, in queue order, so callers observe drain order.
        tokio::spawn(async move {
            for completion in completions {
                completion();
            }
        });
    }

    fn next_address(inner: &mut FakeRrInner) -> Address {
        let idx = inner.next % inner.addresses.len();
        inner.next += 1;
        inner.addresses[idx].clone()
    }
}

impl LbPolicy for FakeRoundRobin {
    fn pick(
        &self,
        args: &PickArgs,
        target: &TargetCell,
        user_data: &UserDataCell,
        on_complete: Completion,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.tracker.state() == ConnectivityState::Ready {
            let address = Self::next_address(&mut inner);
            *target.lock() = Some(Arc::new(ConnectedSubchannel::new(address.address)));
            *user_data.lock() = address.user_data.clone();
            return true;
        }
        inner.queued_picks.push(FakeQueuedPick {
            target: target.clone(),
            user_data: user_data.clone(),
            on_complete,
            flags: args.initial_metadata_flags,
        });
        let _ = inner.events.send(FakeRrEvent::PickQueued);
        false
    }

    fn cancel_pick(&self, target: &TargetCell, error: Status) {
        let cancelled: Vec<_> = {
            let mut inner = self.inner.lock();
            let (matched, kept) = std::mem::take(&mut inner.queued_picks)
                .into_iter()
                .partition(|p| Arc::ptr_eq(&p.target, target));
            inner.queued_picks = kept;
            matched
        };
        for pick in cancelled {
            *pick.target.lock() = None;
            pick.on_complete.run(Err(error.clone()));
        }
    }

    fn cancel_picks_by_flags(&self, mask: u32, eq: u32, error: Status) {
        let cancelled: Vec<_> = {
            let mut inner = self.inner.lock();
            let (matched, kept) = std::mem::take(&mut inner.queued_picks)
                .into_iter()
                .partition(|p| p.flags & mask == eq);
            inner.queued_picks = kept;
            matched
        };
        for pick in cancelled {
            pick.on_complete.run(Err(error.clone()));
        }
    }

    fn ping_one(&self, notify: Completion) {
        let ready = self.inner.lock().tracker.state() == ConnectivityState::Ready;
        if ready {
            notify.run(Ok(()));
        } else {
            let mut inner = self.inner.lock();
            inner.queued_pings.push(notify);
            let _ = inner.events.send(FakeRrEvent::PingQueued);
        }
    }

    fn exit_idle(&self) {
        let _ = self.inner.lock().events.send(FakeRrEvent::ExitIdle);
    }

    fn check_connectivity(&self) -> (ConnectivityState, Option<Status>) {
        let inner = self.inner.lock();
        (inner.tracker.state(), inner.tracker.error())
    }

    fn notify_on_state_change(&self, last_seen: ConnectivityState, watcher: StateWatcher) {
        let ready = self
            .inner
            .lock()
            .tracker
            .notify_on_state_change(last_seen, watcher);
        if let Some((watcher, state, error)) = ready {
            tokio::spawn(async move { watcher(state, error) });
        }
    }

    fn shutdown(&self) {
        self.set_state(
            ConnectivityState::Shutdown,
            Some(Status::unavailable("round_robin shut down")),
        );
    }
}

impl Drop for FakeRoundRobin {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let error = Status::unavailable("round_robin destroyed");
        for watcher in inner.tracker.take_watchers() {
            watcher(ConnectivityState::Shutdown, Some(error.clone()));
        }
    }
}

pub(crate) struct FakeRoundRobinFactory {}

impl LbPolicyFactory for FakeRoundRobinFactory {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn create(
        &self,
        args: LbPolicyArgs,
    ) -> Result<Arc<dyn LbPolicy>, Box<dyn Error + Send + Sync>> {
        let config = args
            .channel_args
            .get_pointer(FAKE_RR_CONFIG_ARG)
            .and_then(|p| p.downcast_ref::<FakeRrConfig>().cloned())
            .ok_or("fake round_robin requires a test config arg")?;
        if config.fail_create.load(Ordering::SeqCst) {
            return Err("fake round_robin forced creation failure".into());
        }
        let addresses = args
            .channel_args
            .get_address_list(ARG_LB_ADDRESSES)
            .cloned()
            .ok_or("fake round_robin requires addresses")?;
        let mut tracker = ConnectivityStateTracker::new(config.initial_state);
        let _ = tracker.set(config.initial_state, config.initial_error.clone(), "init");
        let policy = Arc::new(FakeRoundRobin {
            inner: Mutex::new(FakeRrInner {
                addresses,
                tracker,
                next: 0,
                queued_picks: Vec::new(),
                queued_pings: Vec::new(),
                events: config.events.clone(),
            }),
        });
        let _ = config.events.send(FakeRrEvent::Created(policy.clone()));
        Ok(policy)
    }
}

/// Registers the fake under the real child policy name, once per process.
pub(crate) fn reg_fake_round_robin() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        GLOBAL_LB_REGISTRY.add_factory(FakeRoundRobinFactory {});
    });
}
