// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Canopy Runtime
//!
//! Remote messaging substrate for tree-structured group communication:
//! pluggable message codecs, length-prefixed TCP links, an address-keyed
//! [`RemoteManager`] with observer dispatch, and a task name service.

pub use anyhow::{
    Context as ErrorContext, Error, Ok as OK, Result, anyhow as error, bail as raise,
};

pub mod address;
pub mod codec;
pub mod config;
pub mod error;
pub mod link;
pub mod logging;
pub mod naming;
pub mod remote;

pub use address::RemoteAddress;
pub use codec::{Codec, CodecKind, JsonCodec, Payload};
pub use config::{RuntimeConfig, TransportConfig};
pub use error::{CodecError, TransportError};
pub use naming::{InMemoryNameRegistry, NameClient, NamingError};
pub use remote::{Observer, ObserverRegistration, RemoteManager, RemoteMessage, RemoteObserver};
pub use tokio_util::sync::CancellationToken;
