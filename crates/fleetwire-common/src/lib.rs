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

//! Fleetwire Common Types
//!
//! Shared vocabulary for the Fleetwire cluster transport:
//!
//! - [`protocol`] - the logical [`Request`], the classified [`Response`], the
//!   executor-level [`RawResponse`] and the [`TransportError`] taxonomy
//! - [`config`] - [`TransportConfig`], the single policy surface consulted by
//!   every transport component
//!
//! # Example
//!
//! ```
//! use fleetwire_common::{Request, TransportConfig};
//! use std::time::Duration;
//!
//! let config = TransportConfig::default().with_max_retries(2);
//! let request = Request::get("/_cluster/health").with_timeout(Duration::from_secs(1));
//! assert_eq!(config.max_retries, 2);
//! assert_eq!(request.path, "/_cluster/health");
//! ```

pub mod config;
pub mod protocol;

pub use config::TransportConfig;
pub use protocol::*;
