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

//! Client-side grpclb load-balancing policy.
//!
//! The policy receives resolved balancer addresses from the channel, keeps a
//! streaming `BalanceLoad` session to one balancer, converts each server list
//! published on that session into a round-robin child picker, and routes user
//! RPCs to the listed backends while attaching the per-backend `lb-token`
//! metadata supplied by the balancer.
//!
//! Call [`client::load_balancing::grpclb::reg`] once at process start to make
//! the policy available under the name `grpclb` in the LB policy registry.

pub mod client;
pub mod rt;
