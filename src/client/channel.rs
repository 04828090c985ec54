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

//! Channel arguments and the interfaces the policy consumes from the RPC
//! runtime: creating a channel to the balancers and opening the streaming
//! `BalanceLoad` call on it.

use std::{
    collections::HashMap,
    error::Error,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use bytes::Bytes;
use tokio::sync::Notify;
use tonic::Status;

use crate::client::name_resolution::{Address, UserData};

/// The name of the service the channel's user is ultimately calling.
pub const ARG_SERVER_NAME: &str = "grpc.server_name";

/// The LB policy the channel should use.  Removed when constructing the
/// channel to the balancers so that it falls back to its default policy.
pub const ARG_LB_POLICY_NAME: &str = "grpc.lb_policy_name";

/// The resolved address list, carried as a shared pointer value.
pub const ARG_LB_ADDRESSES: &str = "grpc.lb_addresses";

/// A single channel argument value.
#[derive(Clone)]
pub enum ArgValue {
    String(String),
    Integer(i64),
    AddressList(Arc<Vec<Address>>),
    /// An opaque shared pointer, compared by identity.
    Pointer(UserData),
}

impl std::fmt::Debug for ArgValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgValue::String(s) => write!(f, "String({s:?})"),
            ArgValue::Integer(i) => write!(f, "Integer({i})"),
            ArgValue::AddressList(a) => write!(f, "AddressList(len={})", a.len()),
            ArgValue::Pointer(_) => write!(f, "Pointer"),
        }
    }
}

/// An immutable-by-convention set of key/value arguments configuring a
/// channel or an LB policy.  Copies are cheap for pointer-valued entries.
#[derive(Clone, Debug, Default)]
pub struct ChannelArgs {
    args: HashMap<String, ArgValue>,
}

impl ChannelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: ArgValue) -> Self {
        self.args.insert(key.to_string(), value);
        self
    }

    /// Returns a copy with the given keys removed.
    pub fn without(mut self, keys: &[&str]) -> Self {
        for key in keys {
            self.args.remove(*key);
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.args.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.args.get(key) {
            Some(ArgValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_address_list(&self, key: &str) -> Option<&Arc<Vec<Address>>> {
        match self.args.get(key) {
            Some(ArgValue::AddressList(a)) => Some(a),
            _ => None,
        }
    }

    pub fn get_pointer(&self, key: &str) -> Option<&UserData> {
        match self.args.get(key) {
            Some(ArgValue::Pointer(p)) => Some(p),
            _ => None,
        }
    }
}

/// An idempotent cancellation handle for an in-flight call.  Clones share the
/// same underlying flag.
#[derive(Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.  Safe to call any number of times from any
    /// thread.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Completes once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel
            // cannot slip between the check and the wait.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Everything needed to open one streaming call to a balancer.  The payload
/// is encoded once by the caller; `cancel` is shared with the policy so the
/// call can be torn down from the outside.
pub struct BalanceLoadCall {
    pub method: &'static str,
    pub authority: String,
    pub deadline: Option<Instant>,
    pub payload: Bytes,
    pub cancel: CancelHandle,
}

/// The receive half of a streaming balancer call, mirroring tonic's
/// `Streaming::message`: `Ok(Some(_))` for each response payload, `Ok(None)`
/// for a clean end of stream, `Err` for a terminal status.
#[tonic::async_trait]
pub trait ResponseStream: Send {
    async fn message(&mut self) -> Result<Option<Bytes>, Status>;
}

/// A channel to the balancer service.  Implementations are provided by the
/// transport layer; the policy only ever opens `BalanceLoad` calls on it.
#[tonic::async_trait]
pub trait BalancerChannel: Send + Sync {
    async fn balance_load(&self, call: BalanceLoadCall) -> Result<Box<dyn ResponseStream>, Status>;
}

/// Creates channels from a target URI and channel arguments.  The enclosing
/// channel supplies an implementation when constructing the policy.
pub trait ClientChannelFactory: Send + Sync {
    fn create_channel(
        &self,
        target: &str,
        args: &ChannelArgs,
    ) -> Result<Arc<dyn BalancerChannel>, Box<dyn Error + Send + Sync>>;
}
