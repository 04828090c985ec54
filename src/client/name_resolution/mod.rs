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

//! Resolved addresses as consumed by the grpclb policy.
//!
//! The resolver marks each address as either a balancer or an ordinary
//! backend; this policy only consumes the balancer ones and produces backend
//! address lists of its own from the balancer's server lists.

use core::fmt;
use std::{
    any::Any,
    fmt::{Display, Formatter},
    net::SocketAddr,
    sync::Arc,
};

/// Opaque per-address data, shared and compared by identity.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// A resolved endpoint: an IPv4 or IPv6 socket address, whether it points at
/// a balancer rather than a backend, and optional opaque data attached by
/// whoever produced the address.
#[derive(Clone)]
pub struct Address {
    pub address: SocketAddr,
    pub is_balancer: bool,
    pub user_data: Option<UserData>,
}

impl Address {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            is_balancer: false,
            user_data: None,
        }
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        let user_data_eq = match (&self.user_data, &other.user_data) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        self.address == other.address && self.is_balancer == other.is_balancer && user_data_eq
    }
}

impl Eq for Address {}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("address", &self.address)
            .field("is_balancer", &self.is_balancer)
            .field("has_user_data", &self.user_data.is_some())
            .finish()
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Builds the target URI for the channel to the balancers, in the form the
/// sockaddr resolver understands: `ipv4:host:port,host:port,...` (or `ipv6:`).
/// The scheme is taken from the first balancer address; mixing address
/// families in one target is unsupported.  Returns `None` when the input
/// contains no balancer addresses.
pub fn balancer_target_uri(addresses: &[Address]) -> Option<String> {
    let mut balancers = addresses.iter().filter(|a| a.is_balancer);
    let first = balancers.next()?;
    let scheme = if first.address.is_ipv4() {
        "ipv4"
    } else {
        "ipv6"
    };
    let mut uri = format!("{scheme}:{}", first.address);
    for address in balancers {
        uri.push(',');
        uri.push_str(&address.address.to_string());
    }
    Some(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str, is_balancer: bool) -> Address {
        Address {
            address: s.parse().unwrap(),
            is_balancer,
            user_data: None,
        }
    }

    #[test]
    fn target_uri_joins_balancer_addresses() {
        let addresses = vec![
            addr("10.0.0.1:50051", false),
            addr("1.2.3.4:10000", true),
            addr("5.6.7.8:10001", true),
        ];
        assert_eq!(
            balancer_target_uri(&addresses).as_deref(),
            Some("ipv4:1.2.3.4:10000,5.6.7.8:10001")
        );
    }

    #[test]
    fn target_uri_uses_ipv6_scheme() {
        let addresses = vec![addr("[2001:db8::1]:10000", true)];
        assert_eq!(
            balancer_target_uri(&addresses).as_deref(),
            Some("ipv6:[2001:db8::1]:10000")
        );
    }

    #[test]
    fn target_uri_requires_a_balancer() {
        assert!(balancer_target_uri(&[addr("1.2.3.4:80", false)]).is_none());
        assert!(balancer_target_uri(&[]).is_none());
    }

    #[test]
    fn address_user_data_compares_by_identity() {
        let data: UserData = Arc::new(42u32);
        let a = Address {
            user_data: Some(data.clone()),
            ..addr("1.2.3.4:80", false)
        };
        let b = Address {
            user_data: Some(data),
            ..addr("1.2.3.4:80", false)
        };
        let c = Address {
            user_data: Some(Arc::new(42u32)),
            ..addr("1.2.3.4:80", false)
        };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
