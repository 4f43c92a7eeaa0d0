// Copyright 2024 RustFS Team
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

use crate::types::Identity;
use std::time::Duration;
use thiserror::Error;

/// Lock operation related error types.
///
/// Ordinary contention never surfaces here: acquisition paths report a lost
/// race or an expired timeout as `false`. Errors are reserved for the lease
/// store, configuration and internal invariants.
#[derive(Error, Debug)]
pub enum LockError {
    /// Lock acquisition timeout
    #[error("Lock acquisition timeout for resource '{resource}' after {timeout:?}")]
    Timeout { resource: String, timeout: Duration },

    /// Identity was chosen as the victim of a wait-for cycle
    #[error("Identity {identity} was rejected on '{resource}' to break a deadlock")]
    Deadlock { identity: Identity, resource: String },

    /// Lease store communication failure
    #[error("Lease store error: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Deserialization error
    #[error("Deserialization error: {message}")]
    Deserialization {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Background worker is gone
    #[error("Lock service '{service}' has shut down")]
    ShutDown { service: String },
}

impl Clone for LockError {
    fn clone(&self) -> Self {
        match self {
            LockError::Timeout { resource, timeout } => LockError::Timeout {
                resource: resource.clone(),
                timeout: *timeout,
            },
            LockError::Deadlock { identity, resource } => LockError::Deadlock {
                identity: *identity,
                resource: resource.clone(),
            },
            LockError::Store { message, source: _ } => LockError::Store {
                message: message.clone(),
                source: Some(Box::new(std::io::Error::other(message.clone()))),
            },
            LockError::Internal { message } => LockError::Internal {
                message: message.clone(),
            },
            LockError::Configuration { message } => LockError::Configuration {
                message: message.clone(),
            },
            LockError::Deserialization { message, source: _ } => LockError::Deserialization {
                message: message.clone(),
                source: Box::new(std::io::Error::other(message.clone())),
            },
            LockError::ShutDown { service } => LockError::ShutDown {
                service: service.clone(),
            },
        }
    }
}

impl LockError {
    /// Create timeout error
    pub fn timeout(resource: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            resource: resource.into(),
            timeout,
        }
    }

    /// Create deadlock victim error
    pub fn deadlock(identity: Identity, resource: impl Into<String>) -> Self {
        Self::Deadlock {
            identity,
            resource: resource.into(),
        }
    }

    /// Create store error without an underlying cause
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// Create store error wrapping the backend's error
    pub fn store_with_source(message: impl Into<String>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Store {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Create configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create shut down error
    pub fn shut_down(service: impl Into<String>) -> Self {
        Self::ShutDown { service: service.into() }
    }

    /// Check if it is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Deadlock { .. } | Self::Store { .. })
    }

    /// Check if it is a fatal error
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Internal { .. } | Self::Configuration { .. })
    }
}

/// Lock operation Result type
pub type Result<T> = std::result::Result<T, LockError>;

/// Convert from serde_json::Error
impl From<serde_json::Error> for LockError {
    fn from(err: serde_json::Error) -> Self {
        let message = if err.is_syntax() || err.is_eof() {
            "JSON syntax error"
        } else if err.is_data() {
            "JSON data error"
        } else {
            "JSON IO error"
        };
        Self::Deserialization {
            message: message.to_string(),
            source: Box::new(err),
        }
    }
}
