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

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;

use crate::client::load_balancing::LbPolicyFactory;

/// A registry to store and retrieve LB policy factories, indexed by policy
/// name.  Registering a factory under an existing name replaces it.
pub struct LbPolicyRegistry {
    m: Mutex<HashMap<String, Arc<dyn LbPolicyFactory>>>,
}

impl LbPolicyRegistry {
    pub fn new() -> Self {
        Self {
            m: Mutex::default(),
        }
    }

    /// Add an LB policy factory into the registry.
    pub fn add_factory(&self, factory: impl LbPolicyFactory + 'static) {
        self.m
            .lock()
            .insert(factory.name().to_string(), Arc::new(factory));
    }

    /// Retrieve an LB policy factory from the registry, or None if not found.
    pub fn get_factory(&self, name: &str) -> Option<Arc<dyn LbPolicyFactory>> {
        self.m.lock().get(name).cloned()
    }
}

impl Default for LbPolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide registry, shared by every channel that does not provide
/// its own.
pub static GLOBAL_LB_REGISTRY: LazyLock<LbPolicyRegistry> = LazyLock::new(LbPolicyRegistry::new);
