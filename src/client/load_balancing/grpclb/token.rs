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

use std::sync::{Arc, LazyLock};

use tonic::metadata::{AsciiMetadataValue, MetadataMap};

/// The metadata key under which the balancer's token travels on user RPCs.
pub const LB_TOKEN_MD_KEY: &str = "lb-token";

/// Wire bound on token length; longer tokens are truncated.
pub const LB_TOKEN_MAX_LEN: usize = 50;

static LB_TOKEN_EMPTY: LazyLock<LbToken> = LazyLock::new(|| LbToken {
    value: Arc::new(AsciiMetadataValue::from_static("")),
});

/// The `lb-token` metadata element for one backend.  Copies share the
/// underlying value; equality is identity, so every copy of the process-wide
/// empty token compares equal and tokens from distinct server entries do
/// not, even when their bytes match.
#[derive(Clone, Debug)]
pub struct LbToken {
    value: Arc<AsciiMetadataValue>,
}

impl LbToken {
    /// Builds a token from the bytes received on the wire, truncated to
    /// [`LB_TOKEN_MAX_LEN`].  Returns None when the bytes cannot be carried
    /// in an ASCII metadata value.
    pub fn new(bytes: &[u8]) -> Option<LbToken> {
        let bytes = &bytes[..bytes.len().min(LB_TOKEN_MAX_LEN)];
        let s = std::str::from_utf8(bytes).ok()?;
        let value = AsciiMetadataValue::try_from(s).ok()?;
        Some(LbToken {
            value: Arc::new(value),
        })
    }

    /// The designated token used when a server entry carries none.
    pub fn empty() -> LbToken {
        LB_TOKEN_EMPTY.clone()
    }

    pub fn value(&self) -> &AsciiMetadataValue {
        &self.value
    }

    /// Appends this token to an RPC's initial metadata.
    pub fn append_to(&self, initial_metadata: &mut MetadataMap) {
        initial_metadata.append(LB_TOKEN_MD_KEY, (*self.value).clone());
    }
}

impl PartialEq for LbToken {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl Eq for LbToken {}
