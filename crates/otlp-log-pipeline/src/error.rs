// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::net::SocketAddr;

use crate::allowlist::AllowlistError;
use crate::config::ConfigError;
use crate::output::OutputError;
use crate::routing::RoutingError;
use crate::transform::TransformError;

/// Errors that can occur when starting or stopping the receiver services
#[derive(Debug, thiserror::Error)]
pub enum ServicesError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to load allowlist: {0}")]
    Allowlist(#[from] AllowlistError),

    #[error("Failed to load routing rules: {0}")]
    Routing(#[from] RoutingError),

    #[error("Failed to load transform config: {0}")]
    Transform(#[from] TransformError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ServicesError::Config(ConfigError::Invalid("bad port".to_string()));
        assert_eq!(error.to_string(), "Invalid configuration: bad port");

        let error = ServicesError::Bind {
            addr: SocketAddr::from(([127, 0, 0, 1], 4317)),
            source: io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        };
        assert_eq!(
            error.to_string(),
            "Failed to bind 127.0.0.1:4317: address in use"
        );
    }

    #[test]
    fn test_error_debug() {
        let error = ServicesError::Output(OutputError::Closed);
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("Closed"));
    }

    #[test]
    fn test_from_component_errors() {
        let error: ServicesError = AllowlistError::Read {
            path: "/missing".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "not found"),
        }
        .into();
        assert!(matches!(error, ServicesError::Allowlist(_)));
        assert!(error.to_string().starts_with("Failed to load allowlist"));
    }
}
