// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the Reef plugin host.

use std::time::Duration;

use strum::{Display, EnumString};
use thiserror::Error;

/// The primary error type used across the registry, router, channel, and transports.
#[derive(Debug, Error)]
pub enum ReefError {
    /// Configuration errors (invalid TOML, bad values).
    #[error("configuration error: {0}")]
    Config(String),

    /// Persistence errors (state database, blob store I/O).
    #[error("storage error: {source}")]
    Storage {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A plugin artifact could not be loaded. No registry entry is created.
    #[error("failed to load plugin '{plugin}': {message}")]
    LoadFailure { plugin: String, message: String },

    /// No plugin with this id is registered.
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    /// A plugin with this id and source is already registered.
    #[error("plugin '{0}' is already loaded")]
    AlreadyLoaded(String),

    /// Replacing an uploaded plugin with another upload needs explicit confirmation.
    #[error("plugin '{0}' is already installed from an upload; confirm replacement to continue")]
    ConflictRequiresConfirmation(String),

    /// Another lifecycle operation on the same plugin id is still running.
    #[error("plugin '{0}' has a lifecycle operation in progress")]
    Busy(String),

    /// The requested service is not registered with the router.
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// The service exists but does not expose the requested method.
    #[error("method not found: {service}.{method}")]
    MethodNotFound { service: String, method: String },

    /// A host-side handler failed or panicked; the failure is wrapped, never re-raised.
    #[error("handler error in {service}.{method}: {message}")]
    HandlerError {
        service: String,
        method: String,
        message: String,
    },

    /// The calling plugin did not declare a permission covering the action.
    #[error("permission denied for plugin '{plugin}': {action}")]
    PermissionDenied { plugin: String, action: String },

    /// The calling plugin is registered but disabled.
    #[error("plugin '{0}' is disabled")]
    PluginDisabled(String),

    /// A synchronous channel exchange stalled past its bound.
    #[error("channel timed out after {duration:?} while {stage}")]
    ChannelTimeout { stage: String, duration: Duration },

    /// A synchronous channel exchange was malformed.
    #[error("channel protocol error: {0}")]
    ChannelProtocolError(String),

    /// An adapter failed while dispatching or sending to its plugin.
    #[error("transport error for plugin '{plugin}': {message}")]
    TransportError { plugin: String, message: String },

    /// A lifecycle operation timed out.
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`ReefError`], stable across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum ErrorKind {
    Config,
    Storage,
    LoadFailure,
    PluginNotFound,
    AlreadyLoaded,
    ConflictRequiresConfirmation,
    Busy,
    ServiceNotFound,
    MethodNotFound,
    HandlerError,
    PermissionDenied,
    PluginDisabled,
    ChannelTimeout,
    ChannelProtocolError,
    TransportError,
    Timeout,
    Internal,
}

impl ErrorKind {
    /// Numeric code written into the channel header's `errorCode` word.
    pub fn channel_code(self) -> u32 {
        match self {
            ErrorKind::ServiceNotFound => 1,
            ErrorKind::MethodNotFound => 2,
            ErrorKind::HandlerError => 3,
            ErrorKind::PermissionDenied => 4,
            ErrorKind::ChannelProtocolError => 5,
            ErrorKind::PluginDisabled | ErrorKind::PluginNotFound => 6,
            ErrorKind::ChannelTimeout | ErrorKind::Timeout => 7,
            _ => 99,
        }
    }

    /// Inverse of [`ErrorKind::channel_code`]; unknown codes map to `Internal`.
    pub fn from_channel_code(code: u32) -> Self {
        match code {
            1 => ErrorKind::ServiceNotFound,
            2 => ErrorKind::MethodNotFound,
            3 => ErrorKind::HandlerError,
            4 => ErrorKind::PermissionDenied,
            5 => ErrorKind::ChannelProtocolError,
            6 => ErrorKind::PluginDisabled,
            7 => ErrorKind::ChannelTimeout,
            _ => ErrorKind::Internal,
        }
    }
}

impl ReefError {
    /// Shorthand for a [`ReefError::LoadFailure`].
    pub fn load_failure(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        ReefError::LoadFailure {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`ReefError::TransportError`].
    pub fn transport(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        ReefError::TransportError {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Returns the error's kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReefError::Config(_) => ErrorKind::Config,
            ReefError::Storage { .. } => ErrorKind::Storage,
            ReefError::LoadFailure { .. } => ErrorKind::LoadFailure,
            ReefError::PluginNotFound(_) => ErrorKind::PluginNotFound,
            ReefError::AlreadyLoaded(_) => ErrorKind::AlreadyLoaded,
            ReefError::ConflictRequiresConfirmation(_) => ErrorKind::ConflictRequiresConfirmation,
            ReefError::Busy(_) => ErrorKind::Busy,
            ReefError::ServiceNotFound(_) => ErrorKind::ServiceNotFound,
            ReefError::MethodNotFound { .. } => ErrorKind::MethodNotFound,
            ReefError::HandlerError { .. } => ErrorKind::HandlerError,
            ReefError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            ReefError::PluginDisabled(_) => ErrorKind::PluginDisabled,
            ReefError::ChannelTimeout { .. } => ErrorKind::ChannelTimeout,
            ReefError::ChannelProtocolError(_) => ErrorKind::ChannelProtocolError,
            ReefError::TransportError { .. } => ErrorKind::TransportError,
            ReefError::Timeout { .. } => ErrorKind::Timeout,
            ReefError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Errors that only affect the caller and leave host state untouched.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ReefError::Internal(_) | ReefError::Storage { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_codes_round_trip_for_call_errors() {
        for kind in [
            ErrorKind::ServiceNotFound,
            ErrorKind::MethodNotFound,
            ErrorKind::HandlerError,
            ErrorKind::PermissionDenied,
            ErrorKind::ChannelProtocolError,
        ] {
            assert_eq!(ErrorKind::from_channel_code(kind.channel_code()), kind);
        }
        assert_eq!(ErrorKind::from_channel_code(0), ErrorKind::Internal);
    }

    #[test]
    fn load_failure_message_names_plugin() {
        let err = ReefError::load_failure("ocr", "missing entry point plugin_init");
        assert_eq!(err.kind(), ErrorKind::LoadFailure);
        assert_eq!(
            err.to_string(),
            "failed to load plugin 'ocr': missing entry point plugin_init"
        );
    }

    #[test]
    fn storage_errors_are_not_recoverable() {
        let err = ReefError::Storage {
            source: Box::new(std::io::Error::other("disk gone")),
        };
        assert!(!err.is_recoverable());
        assert!(ReefError::ServiceNotFound("x".into()).is_recoverable());
    }
}
