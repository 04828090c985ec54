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

//! The `grpc.lb.v1` wire messages and the conversion of balancer server
//! lists into resolved backend addresses.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;
use prost::Message;

use crate::client::{load_balancing::grpclb::token::LbToken, name_resolution::Address};

pub(crate) mod pb {
    //! Hand-rolled prost bindings for the subset of `grpc.lb.v1` this policy
    //! speaks.

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct LoadBalanceRequest {
        #[prost(message, optional, tag = "1")]
        pub initial_request: Option<InitialLoadBalanceRequest>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct InitialLoadBalanceRequest {
        /// Name of the target the client is asking to be balanced for.
        #[prost(string, tag = "1")]
        pub name: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct LoadBalanceResponse {
        #[prost(message, optional, tag = "1")]
        pub initial_response: Option<InitialLoadBalanceResponse>,
        #[prost(message, optional, tag = "2")]
        pub server_list: Option<ServerList>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct InitialLoadBalanceResponse {
        #[prost(string, tag = "1")]
        pub load_balancer_delegate: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ServerList {
        /// Ordered list of servers to use; equality is pointwise and
        /// order-sensitive, which the derived `PartialEq` provides.
        #[prost(message, repeated, tag = "1")]
        pub servers: Vec<Server>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Server {
        /// 4 bytes for IPv4, 16 for IPv6, in network byte order.
        #[prost(bytes = "vec", tag = "1")]
        pub ip_address: Vec<u8>,
        #[prost(int32, tag = "2")]
        pub port: i32,
        /// Opaque token to echo back on RPCs routed to this server.
        #[prost(string, tag = "3")]
        pub load_balance_token: String,
        #[prost(bool, tag = "4")]
        pub drop_request: bool,
    }
}

/// Encodes the initial request sent once on every balancer call.
pub(crate) fn encode_request(server_name: &str) -> Bytes {
    let request = pb::LoadBalanceRequest {
        initial_request: Some(pb::InitialLoadBalanceRequest {
            name: server_name.to_string(),
        }),
    };
    Bytes::from(request.encode_to_vec())
}

/// Decodes a response payload into its server list.  Responses that fail to
/// decode, or that carry no server list, are invalid: they are logged and
/// dropped, keeping the session alive.
pub(crate) fn parse_serverlist(payload: &[u8]) -> Option<pb::ServerList> {
    let response = match pb::LoadBalanceResponse::decode(payload) {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(target: "glb", error = %e, len = payload.len(), "invalid LB response received, ignoring");
            return None;
        }
    };
    match response.server_list {
        Some(server_list) => Some(server_list),
        None => {
            tracing::error!(target: "glb", "LB response carried no server list, ignoring");
            None
        }
    }
}

/// A server entry is usable iff its port fits in 16 bits and its address is
/// exactly 4 or 16 bytes.  Invalid entries are dropped; their siblings are
/// kept.
pub(crate) fn is_server_valid(server: &pb::Server, idx: usize, log: bool) -> bool {
    if !(0..=u16::MAX as i32).contains(&server.port) {
        if log {
            tracing::error!(target: "glb", port = server.port, idx, "invalid port in serverlist entry, ignoring");
        }
        return false;
    }
    let len = server.ip_address.len();
    if len != 4 && len != 16 {
        if log {
            tracing::error!(target: "glb", len, idx, "expected IP of 4 or 16 bytes in serverlist entry, ignoring");
        }
        return false;
    }
    true
}

/// Converts a valid entry into a socket address.  Callers must have checked
/// `is_server_valid` first.
pub(crate) fn server_address(server: &pb::Server) -> SocketAddr {
    let port = server.port as u16;
    let ip = match server.ip_address.len() {
        4 => {
            let octets: [u8; 4] = server.ip_address[..].try_into().unwrap();
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        _ => {
            let octets: [u8; 16] = server.ip_address[..].try_into().unwrap();
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    };
    SocketAddr::new(ip, port)
}

/// Extracts backend addresses from a server list.  Two passes: count the
/// valid entries, then populate a vector of exactly that size, pairing each
/// address with its token (the designated empty token when the entry carries
/// none).  Every produced address has `is_balancer` unset so the child
/// policy cannot recursively select grpclb.  Returns None when no entry is
/// valid.
pub(crate) fn process_serverlist(serverlist: &pb::ServerList) -> Option<Vec<Address>> {
    let num_valid = serverlist
        .servers
        .iter()
        .enumerate()
        .filter(|(idx, server)| is_server_valid(server, *idx, true))
        .count();
    if num_valid == 0 {
        return None;
    }

    let mut addresses = Vec::with_capacity(num_valid);
    for (idx, server) in serverlist.servers.iter().enumerate() {
        if !is_server_valid(server, idx, false) {
            continue;
        }
        let address = server_address(server);
        let token = if server.load_balance_token.is_empty() {
            tracing::info!(target: "glb", backend = %address, "missing LB token for backend address, the empty token will be used instead");
            LbToken::empty()
        } else {
            match LbToken::new(server.load_balance_token.as_bytes()) {
                Some(token) => token,
                None => {
                    tracing::info!(target: "glb", backend = %address, "LB token is not a valid metadata value, the empty token will be used instead");
                    LbToken::empty()
                }
            }
        };
        addresses.push(Address {
            address,
            is_balancer: false,
            user_data: Some(std::sync::Arc::new(token)),
        });
    }
    debug_assert_eq!(addresses.len(), num_valid);
    Some(addresses)
}
