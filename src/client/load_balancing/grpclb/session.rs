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

//! The streaming session to the balancer.
//!
//! A session is one `BalanceLoad` call: the request is encoded once and sent
//! up front, then a single receive is outstanding at all times so server
//! lists are processed in arrival order.  When the call ends, a retry is
//! scheduled on the policy's backoff unless it is shutting down.  The
//! session task and the retry timer hold weak policy references only: they
//! keep the policy's memory reachable but never extend its logical lifetime.

use std::{sync::atomic::Ordering, time::Duration};

use bytes::Bytes;
use rand::Rng;
use tonic::{Code, Status};

use super::{Deferred, GrpcLbPolicy, Inner, serverlist};
use crate::client::channel::{BalanceLoadCall, CancelHandle};

pub(super) const BALANCE_LOAD_METHOD: &str = "/grpc.lb.v1.LoadBalancer/BalanceLoad";

const BACKOFF_BASE_SECS: f64 = 10.0;
const BACKOFF_MULTIPLIER: f64 = 1.6;
const BACKOFF_JITTER: f64 = 0.2;
const BACKOFF_MAX_SECS: f64 = 60.0;

/// The record of the in-flight balancer call.  Dropped (and the id retired)
/// when the call's status arrives.
pub(super) struct BalancerCall {
    pub(super) id: u64,
    pub(super) cancel: CancelHandle,
}

/// Retry pacing for the balancer call.  Consecutive failures stretch the
/// delay from 10s by 1.6x up to 60s, each draw carrying +/-20% jitter; any
/// payload from the balancer resets the schedule.  Callers hold the policy
/// lock.
pub(super) struct LbCallBackoff {
    /// Delay for the next attempt before jitter, in seconds.
    next_delay_secs: f64,
}

impl LbCallBackoff {
    pub(super) fn new() -> Self {
        Self {
            next_delay_secs: BACKOFF_BASE_SECS,
        }
    }

    pub(super) fn reset(&mut self) {
        self.next_delay_secs = BACKOFF_BASE_SECS;
    }

    /// Returns the jittered delay for the next attempt and advances the
    /// schedule.
    pub(super) fn next_delay(&mut self) -> Duration {
        let spread = (1.0 - BACKOFF_JITTER)..(1.0 + BACKOFF_JITTER);
        let delay = self.next_delay_secs * rand::rng().random_range(spread);
        self.next_delay_secs = (self.next_delay_secs * BACKOFF_MULTIPLIER).min(BACKOFF_MAX_SECS);
        Duration::from_secs_f64(delay)
    }
}

impl GrpcLbPolicy {
    /// Opens a new balancer call and spawns the task driving it.  Caller
    /// holds the policy lock; no-op when shutting down.
    pub(super) fn query_for_backends(&self, inner: &mut Inner) {
        if inner.shutting_down {
            return;
        }
        debug_assert!(inner.lb_call.is_none());

        let id = self.call_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancelHandle::new();
        inner.lb_call = Some(BalancerCall {
            id,
            cancel: cancel.clone(),
        });
        tracing::debug!(target: "glb", call = id, server_name = %inner.server_name, "query for backends");

        let call = BalanceLoadCall {
            method: BALANCE_LOAD_METHOD,
            authority: inner.server_name.clone(),
            deadline: inner.deadline,
            payload: serverlist::encode_request(&inner.server_name),
            cancel: cancel.clone(),
        };
        let channel = inner.lb_channel.clone();
        let policy = self.weak_self.clone();
        inner.runtime.spawn(Box::pin(async move {
            let mut stream = match channel.balance_load(call).await {
                Ok(stream) => stream,
                Err(status) => {
                    if let Some(policy) = policy.upgrade() {
                        policy.on_balancer_status(id, status);
                    }
                    return;
                }
            };
            let status = loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break Status::cancelled("LB call cancelled");
                    }
                    message = stream.message() => match message {
                        Ok(Some(payload)) => {
                            let Some(policy) = policy.upgrade() else { return };
                            if !policy.on_balancer_response(id, payload) {
                                break Status::cancelled("LB call cancelled");
                            }
                        }
                        Ok(None) => break Status::new(Code::Ok, "LB stream closed"),
                        Err(status) => break status,
                    }
                }
            };
            if let Some(policy) = policy.upgrade() {
                policy.on_balancer_status(id, status);
            }
        }));
    }

    /// Handles one response payload.  Returns whether the session should
    /// keep receiving.
    pub(super) fn on_balancer_response(&self, call_id: u64, payload: Bytes) -> bool {
        let mut deferred = Deferred::default();
        let keep_receiving = {
            let mut inner = self.inner.lock();
            if inner.lb_call.as_ref().map(|c| c.id) != Some(call_id) {
                return false;
            }
            // Any response from the balancer counts as progress.
            inner.backoff.reset();
            if let Some(incoming) = serverlist::parse_serverlist(&payload) {
                tracing::debug!(target: "glb", servers = incoming.servers.len(), "serverlist received");
                for (idx, server) in incoming.servers.iter().enumerate() {
                    if serverlist::is_server_valid(server, idx, false) {
                        tracing::trace!(target: "glb", idx, address = %serverlist::server_address(server), "serverlist entry");
                    }
                }
                if incoming.servers.is_empty() {
                    tracing::debug!(target: "glb", "received empty server list, picks will stay pending until a response with > 0 servers is received");
                } else if inner.serverlist.as_ref() == Some(&incoming) {
                    tracing::debug!(target: "glb", "incoming server list identical to current, ignoring");
                } else {
                    inner.serverlist = Some(incoming);
                    self.rr_handover(&mut inner, &mut deferred);
                }
            }
            !inner.shutting_down
        };
        deferred.flush();
        keep_receiving
    }

    /// Handles call termination: destroys the call record and, unless
    /// shutting down, schedules the next attempt per backoff.
    pub(super) fn on_balancer_status(&self, call_id: u64, status: Status) {
        let mut inner = self.inner.lock();
        tracing::debug!(
            target: "glb",
            call = call_id,
            code = ?status.code(),
            details = status.message(),
            "status from LB server received"
        );
        if !matches!(&inner.lb_call, Some(call) if call.id == call_id) {
            // A completion for a call that has already been replaced.
            return;
        }
        inner.lb_call = None;
        if inner.shutting_down {
            return;
        }

        let delay = inner.backoff.next_delay();
        tracing::debug!(target: "glb", ?delay, "connection to LB server lost, retrying");
        let policy = self.weak_self.clone();
        let sleep = inner.runtime.sleep(delay);
        inner.runtime.spawn(Box::pin(async move {
            sleep.await;
            if let Some(policy) = policy.upgrade() {
                policy.on_retry_timer();
            }
        }));
    }

    fn on_retry_timer(&self) {
        let mut inner = self.inner.lock();
        if inner.shutting_down || inner.lb_call.is_some() {
            return;
        }
        tracing::debug!(target: "glb", "restarting call to LB server");
        self.query_for_backends(&mut inner);
    }
}
