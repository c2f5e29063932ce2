// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Remote Manager Layer
//!
//! A [`RemoteManager`] is the process-level messaging endpoint. It is generic
//! over the message type and carries one [`Codec`](crate::Codec) for it.
//!
//! - Outbound: [`RemoteManager::remote_observer`] returns a [`RemoteObserver`]
//!   backed by the one cached link for that destination.
//! - Inbound: observers are bound either to a source address
//!   ([`RemoteManager::register_observer`]) or to all traffic
//!   ([`RemoteManager::register_catch_all`], which sees [`RemoteMessage`]
//!   envelopes). A message is offered to the source-bound observer first and
//!   then to every catch-all observer.
//! - Failures inside a read loop reach the source-bound observer's
//!   [`Observer::on_error`]; without one they are logged and the link closes.

mod manager;
pub mod observer;

pub use manager::{ObserverRegistration, RemoteManager, RemoteObserver};
pub use observer::{Observer, RemoteMessage};
