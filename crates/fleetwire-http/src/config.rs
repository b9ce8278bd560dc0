// Copyright 2025 Fleetwire Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use fleetwire_common::protocol::error::{Result, TransportError};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;

/// Connection settings for [`HttpExecutor`](crate::HttpExecutor).
///
/// # Example
///
/// ```
/// use fleetwire_http::HttpExecutorConfig;
/// use std::time::Duration;
///
/// let config = HttpExecutorConfig::default()
///     .with_pool_idle_timeout(Duration::from_secs(30))
///     .with_header("Authorization", "ApiKey c2VjcmV0")
///     .unwrap();
/// assert_eq!(config.default_headers.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct HttpExecutorConfig {
    /// How long an idle keep-alive connection stays in a node's pool
    pub pool_idle_timeout: Duration,
    /// Idle connections kept per node
    pub pool_max_idle_per_host: usize,
    /// TCP connect timeout; `None` leaves only the per-attempt timeout
    pub connect_timeout: Option<Duration>,
    /// Headers sent with every request (e.g. `Authorization`)
    pub default_headers: HeaderMap,
}

impl Default for HttpExecutorConfig {
    fn default() -> Self {
        Self {
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 32,
            connect_timeout: Some(Duration::from_secs(5)),
            default_headers: HeaderMap::new(),
        }
    }
}

impl HttpExecutorConfig {
    pub fn with_pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_idle_timeout = timeout;
        self
    }

    pub fn with_pool_max_idle_per_host(mut self, max: usize) -> Self {
        self.pool_max_idle_per_host = max;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Adds a header sent with every request.
    ///
    /// # Errors
    ///
    /// `TransportError::InvalidConfig` when the name or value is not a valid
    /// HTTP header.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::InvalidConfig(format!("header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::InvalidConfig(format!("header value for '{}': {}", name, e)))?;
        self.default_headers.insert(name, value);
        Ok(self)
    }
}
