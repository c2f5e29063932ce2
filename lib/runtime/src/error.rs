// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error types for the messaging layer.
//!
//! - [`CodecError`]: a message could not be turned into bytes or back.
//! - [`TransportError`]: a link could not be opened, broke, or the manager is gone.
//!
//! Transport errors raised inside a read loop are not returned to any caller;
//! they are delivered to the observer bound to the link's source address via
//! [`Observer::on_error`](crate::Observer::on_error), or logged.

use crate::address::RemoteAddress;

// ============================================================================
// CodecError
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("failed to decode message: {0}")]
    Decode(String),

    #[error("codec '{kind}' cannot carry values of type {type_name}")]
    Unsupported {
        kind: String,
        type_name: &'static str,
    },
}

// ============================================================================
// TransportError
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection to {0} is closed")]
    ConnectionClosed(RemoteAddress),

    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: RemoteAddress,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to {0}")]
    ConnectTimeout(RemoteAddress),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("serialization failed: {0}")]
    Serialization(#[from] CodecError),

    #[error("remote manager has been disposed")]
    Disposed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True for errors that mean the peer is gone rather than that a message was bad.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::ConnectionClosed(_)
            | TransportError::Connect { .. }
            | TransportError::ConnectTimeout(_) => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
