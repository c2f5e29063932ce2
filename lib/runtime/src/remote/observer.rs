// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::address::RemoteAddress;
use crate::error::TransportError;

/// Receives inbound messages from a [`RemoteManager`](super::RemoteManager).
///
/// Observers are invoked from the read loop of the link the message arrived
/// on; they should hand work off rather than block.
pub trait Observer<T>: Send + Sync {
    fn on_next(&self, value: T);

    /// A link bound to this observer failed. The link is closed afterwards.
    fn on_error(&self, error: &TransportError) {
        let _ = error;
    }
}

/// Inbound message paired with the address it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMessage<T> {
    pub source: RemoteAddress,
    pub payload: T,
}

struct FnObserver<F>(F);

impl<T, F> Observer<T> for FnObserver<F>
where
    F: Fn(T) + Send + Sync,
{
    fn on_next(&self, value: T) {
        (self.0)(value)
    }
}

/// Wrap a closure as an observer that ignores errors.
pub fn from_fn<T, F>(f: F) -> Arc<dyn Observer<T>>
where
    T: 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    Arc::new(FnObserver(f))
}

/// What a [`channel`] observer saw.
#[derive(Debug)]
pub enum Notification<T> {
    Next(T),
    Error(String),
}

struct ChannelObserver<T> {
    tx: mpsc::UnboundedSender<Notification<T>>,
}

impl<T: Send> Observer<T> for ChannelObserver<T> {
    fn on_next(&self, value: T) {
        let _ = self.tx.send(Notification::Next(value));
    }

    fn on_error(&self, error: &TransportError) {
        let _ = self.tx.send(Notification::Error(error.to_string()));
    }
}

/// Observer that forwards everything it sees into an unbounded channel.
pub fn channel<T: Send + 'static>() -> (
    Arc<dyn Observer<T>>,
    mpsc::UnboundedReceiver<Notification<T>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelObserver { tx }), rx)
}
