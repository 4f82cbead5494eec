// Copyright 2025 Sushanth (https://github.com/sushanthpy)
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

//! Declarative chain wiring.
//!
//! A [`ChainConfig`] lists operations together with references to named
//! interceptors registered on the
//! [`InterceptorRegistry`](crate::registry::InterceptorRegistry). Applying
//! a validated config installs the referenced interceptors in declaration
//! order.

use crate::interceptor::InterceptorMode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for wiring interceptor chains.
///
/// # Example JSON Configuration
///
/// ```json
/// {
///     "operations": [
///         {
///             "operation": "save",
///             "pre": [
///                 "validate",
///                 {"interceptor": "enrich", "mode": "async"}
///             ],
///             "post": ["audit"],
///             "error_handler": "report_failure"
///         }
///     ]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Operations to wire.
    #[serde(default)]
    pub operations: Vec<OperationWiring>,
}

impl ChainConfig {
    /// Parse a configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ChainConfigError> {
        serde_json::from_str(json).map_err(|e| ChainConfigError::ParseError(e.to_string()))
    }

    /// Parse a configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ChainConfigError> {
        toml::from_str(toml_str).map_err(|e| ChainConfigError::ParseError(e.to_string()))
    }

    /// The wiring entry for `operation`, if present.
    pub fn wiring_for(&self, operation: &str) -> Option<&OperationWiring> {
        self.operations.iter().find(|w| w.operation == operation)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ChainConfigError> {
        for (index, wiring) in self.operations.iter().enumerate() {
            wiring.validate().map_err(|e| ChainConfigError::InvalidWiring {
                index,
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

/// Wiring for a single operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationWiring {
    /// The operation name.
    pub operation: String,

    /// Pre-interceptors, in execution order.
    #[serde(default)]
    pub pre: Vec<InterceptorRef>,

    /// Post-interceptors, in execution order.
    #[serde(default)]
    pub post: Vec<InterceptorRef>,

    /// Named default error handler for the operation.
    pub error_handler: Option<String>,
}

impl OperationWiring {
    /// Create a wiring entry with empty interceptor lists.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            pre: Vec::new(),
            post: Vec::new(),
            error_handler: None,
        }
    }

    /// Validate this wiring entry.
    pub fn validate(&self) -> Result<(), ChainConfigError> {
        if self.operation.is_empty() {
            return Err(ChainConfigError::EmptyOperationName);
        }
        for reference in &self.pre {
            reference.validate()?;
        }
        for reference in &self.post {
            reference.validate()?;
            if reference.declared_mode().is_some() {
                return Err(ChainConfigError::ModeOnPost {
                    operation: self.operation.clone(),
                    interceptor: reference.name().to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Reference to a named interceptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InterceptorRef {
    /// Bare interceptor name.
    Name(String),

    /// Full reference with optional mode declaration and enable flag.
    Detailed {
        /// Name of the registered interceptor.
        interceptor: String,
        /// Declared mode; checked against the registered interceptor when
        /// the config is applied.
        mode: Option<InterceptorMode>,
        /// Whether this entry is installed.
        #[serde(default = "default_enabled")]
        enabled: bool,
    },
}

fn default_enabled() -> bool {
    true
}

impl InterceptorRef {
    /// The referenced interceptor name.
    pub fn name(&self) -> &str {
        match self {
            InterceptorRef::Name(name) => name,
            InterceptorRef::Detailed { interceptor, .. } => interceptor,
        }
    }

    /// Whether this entry should be installed.
    pub fn enabled(&self) -> bool {
        match self {
            InterceptorRef::Name(_) => true,
            InterceptorRef::Detailed { enabled, .. } => *enabled,
        }
    }

    /// The declared mode, when the reference carries one.
    pub fn declared_mode(&self) -> Option<InterceptorMode> {
        match self {
            InterceptorRef::Name(_) => None,
            InterceptorRef::Detailed { mode, .. } => *mode,
        }
    }

    /// Validate this reference.
    pub fn validate(&self) -> Result<(), ChainConfigError> {
        if self.name().is_empty() {
            return Err(ChainConfigError::EmptyInterceptorName);
        }
        Ok(())
    }
}

/// Errors that can occur during chain configuration.
#[derive(Debug, Error)]
pub enum ChainConfigError {
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Operation name cannot be empty")]
    EmptyOperationName,

    #[error("Interceptor name cannot be empty")]
    EmptyInterceptorName,

    #[error("Post `{interceptor}` on operation `{operation}` declares a mode; posts are always serial")]
    ModeOnPost {
        operation: String,
        interceptor: String,
    },

    #[error("Invalid wiring at index {index}: {reason}")]
    InvalidWiring { index: usize, reason: String },
}
