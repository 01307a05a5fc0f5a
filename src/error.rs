//! Error taxonomy for container builds.
//!
//! Every failure is attributed to the container (and, where known, the
//! module and property) that caused it, so a misconfiguration can be traced
//! back to its declaration.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApexError {
    /// Invalid or inconsistent build description.
    #[error("{module}: property '{property}': {message}")]
    Config {
        module: String,
        property: String,
        message: String,
    },

    /// The produced content list no longer matches the checked-in allow-list.
    #[error("{module}: {message}")]
    ContentDrift { module: String, message: String },

    /// An external tool exited unsuccessfully.
    #[error("{tool} failed ({status}): {stderr}")]
    ToolFailure {
        tool: String,
        status: String,
        stderr: String,
    },

    /// A pipeline stage was requested out of order.
    #[error("{module}: cannot move from {from} to {to}")]
    StateTransition {
        module: String,
        from: String,
        to: String,
    },
}

impl ApexError {
    pub fn config(
        module: impl Into<String>,
        property: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::Config {
            module: module.into(),
            property: property.into(),
            message: message.to_string(),
        }
    }

    pub fn drift(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ContentDrift {
            module: module.into(),
            message: message.into(),
        }
    }

    /// Property name for configuration errors.
    pub fn property(&self) -> Option<&str> {
        match self {
            Self::Config { property, .. } => Some(property),
            _ => None,
        }
    }
}
