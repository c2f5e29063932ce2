// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::address::RemoteAddress;
use crate::codec::Codec;
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::link::{Link, LinkReader};

use super::observer::{Observer, RemoteMessage};

type LinkSlot = Arc<OnceCell<Arc<Link>>>;
type CatchAll<T> = Arc<dyn Observer<RemoteMessage<T>>>;

/// Address-keyed messaging endpoint.
///
/// Owns zero or one listener and at most one live [`Link`] per destination.
/// Every link, inbound or outbound, runs its own read loop that decodes
/// frames with the manager's codec and dispatches them to observers.
///
/// Dropping the manager disposes it.
pub struct RemoteManager<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    local: Option<RemoteAddress>,
    config: TransportConfig,
    codec: Arc<dyn Codec<T>>,

    // one slot per destination; the OnceCell makes concurrent first sends share one connect
    links: DashMap<RemoteAddress, LinkSlot>,

    observers: DashMap<RemoteAddress, (u64, Arc<dyn Observer<T>>)>,
    catch_all: RwLock<Vec<(u64, CatchAll<T>)>>,
    next_registration: AtomicU64,

    opened: AtomicUsize,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl<T> RemoteManager<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Bind a listener on `config.host:config.port` and start accepting links.
    pub async fn listen(
        config: TransportConfig,
        codec: Arc<dyn Codec<T>>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let local = RemoteAddress::from(listener.local_addr()?);

        let inner = Arc::new(Inner::new(Some(local), config, codec));
        tokio::spawn(accept_loop(inner.clone(), listener));

        info!("Remote manager listening on {}", local);
        Ok(Self { inner })
    }

    /// A manager without a listener. It can still send, and it receives
    /// whatever peers write back on its outbound links.
    pub fn client(config: TransportConfig, codec: Arc<dyn Codec<T>>) -> Self {
        Self {
            inner: Arc::new(Inner::new(None, config, codec)),
        }
    }

    /// Send handle for `destination`, opening and caching a link on first use.
    ///
    /// All handles for one destination share the same link until it closes.
    pub async fn remote_observer(
        &self,
        destination: RemoteAddress,
    ) -> Result<RemoteObserver<T>, TransportError> {
        // a cached link may have closed without being evicted yet; one retry reconnects
        for _ in 0..2 {
            self.ensure_live()?;

            let slot = self.inner.links.entry(destination).or_default().clone();
            let link = slot
                .get_or_try_init(|| self.inner.open_link(destination))
                .await?
                .clone();

            if !link.is_closed() {
                return Ok(RemoteObserver {
                    link,
                    codec: self.inner.codec.clone(),
                });
            }
            self.inner.evict(destination, link.id());
        }

        Err(TransportError::ConnectionClosed(destination))
    }

    /// Observe messages whose source is `source`. Replaces any observer
    /// previously bound to that address.
    pub fn register_observer(
        &self,
        source: RemoteAddress,
        observer: Arc<dyn Observer<T>>,
    ) -> ObserverRegistration {
        let id = self.inner.next_registration.fetch_add(1, Ordering::Relaxed);
        if self.inner.observers.insert(source, (id, observer)).is_some() {
            debug!("Replaced observer for {}", source);
        }

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        ObserverRegistration::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.observers.remove_if(&source, |_, (rid, _)| *rid == id);
            }
        })
    }

    /// Observe every inbound message together with its source.
    pub fn register_catch_all(&self, observer: CatchAll<T>) -> ObserverRegistration {
        let id = self.inner.next_registration.fetch_add(1, Ordering::Relaxed);
        self.inner.catch_all.write().push((id, observer));

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        ObserverRegistration::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.catch_all.write().retain(|(rid, _)| *rid != id);
            }
        })
    }

    fn ensure_live(&self) -> Result<(), TransportError> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(TransportError::Disposed);
        }
        Ok(())
    }
}

impl<T> RemoteManager<T> {
    /// Listener address, if this manager listens.
    pub fn local_address(&self) -> Option<RemoteAddress> {
        self.inner.local
    }

    /// Number of outbound connections this manager has opened.
    pub fn connections_opened(&self) -> usize {
        self.inner.opened.load(Ordering::Relaxed)
    }

    /// Number of destinations with a cached link.
    pub fn cached_links(&self) -> usize {
        self.inner
            .links
            .iter()
            .filter(|slot| slot.value().get().is_some_and(|link| !link.is_closed()))
            .count()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Close every link, stop the listener and all read loops.
    ///
    /// Safe to call more than once.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.cancel.cancel();
        self.inner.links.clear();
        self.inner.observers.clear();
        self.inner.catch_all.write().clear();

        match self.inner.local {
            Some(local) => info!("Remote manager {} disposed", local),
            None => info!("Client remote manager disposed"),
        }
    }
}

impl<T> Drop for RemoteManager<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<T> fmt::Debug for RemoteManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteManager")
            .field("local", &self.inner.local)
            .field("links", &self.inner.links.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl<T> Inner<T> {
    fn new(local: Option<RemoteAddress>, config: TransportConfig, codec: Arc<dyn Codec<T>>) -> Self {
        Self {
            local,
            config,
            codec,
            links: DashMap::new(),
            observers: DashMap::new(),
            catch_all: RwLock::new(Vec::new()),
            next_registration: AtomicU64::new(1),
            opened: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Drop the cached link for `address` if it is still the link with `link_id`.
    fn evict(&self, address: RemoteAddress, link_id: u64) {
        let removed = self.links.remove_if(&address, |_, slot| {
            slot.get().is_some_and(|link| link.id() == link_id)
        });
        if removed.is_some() {
            debug!(link_id, "Evicted link to {}", address);
        }
    }
}

impl<T> Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn open_link(self: &Arc<Self>, destination: RemoteAddress) -> Result<Arc<Link>, TransportError> {
        let (link, reader) =
            Link::connect(destination, self.local, &self.config, self.cancel.child_token()).await?;
        self.opened.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(self.clone().read_loop(link.clone(), reader));
        Ok(link)
    }

    /// Cache an accepted link under its source unless a link is already there,
    /// then start reading from it.
    fn adopt_inbound(self: &Arc<Self>, link: Arc<Link>, reader: LinkReader) {
        let slot = self.links.entry(link.remote()).or_default().clone();
        if slot.set(link.clone()).is_err() {
            debug!(link_id = link.id(), "Link to {} already cached", link.remote());
        }

        tokio::spawn(self.clone().read_loop(link, reader));
    }

    async fn read_loop(self: Arc<Self>, link: Arc<Link>, mut reader: LinkReader) {
        let source = link.remote();
        let link_id = link.id();

        loop {
            tokio::select! {
                biased;
                _ = link.token().cancelled() => {
                    debug!(link_id, "Read loop for {} cancelled", source);
                    break;
                }
                frame = reader.next() => match frame {
                    Some(Ok(bytes)) => match self.codec.decode(&bytes) {
                        Ok(value) => self.dispatch(source, value),
                        Err(e) => {
                            self.report(source, TransportError::Serialization(e));
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        self.report(source, TransportError::Io(e));
                        break;
                    }
                    None => {
                        debug!(link_id, "Link from {} closed gracefully", source);
                        break;
                    }
                },
            }
        }

        link.close();
        self.evict(source, link_id);
    }

    fn dispatch(&self, source: RemoteAddress, value: T) {
        let bound = self.observers.get(&source).map(|entry| entry.value().1.clone());
        let catch_all: Vec<CatchAll<T>> = self
            .catch_all
            .read()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();

        if bound.is_none() && catch_all.is_empty() {
            debug!("No observer for message from {}; dropped", source);
            return;
        }

        if let Some(observer) = bound {
            observer.on_next(value.clone());
        }
        for observer in catch_all {
            observer.on_next(RemoteMessage {
                source,
                payload: value.clone(),
            });
        }
    }

    fn report(&self, source: RemoteAddress, error: TransportError) {
        match self.observers.get(&source).map(|entry| entry.value().1.clone()) {
            Some(observer) => observer.on_error(&error),
            None => warn!("Link with {} failed and no observer is bound: {}", source, error),
        }
    }
}

async fn accept_loop<T>(inner: Arc<Inner<T>>, listener: TcpListener)
where
    T: Clone + Send + Sync + 'static,
{
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        let token = inner.cancel.child_token();
                        let accepted = tokio::select! {
                            result = Link::accept(stream, &inner.config, token.clone()) => result,
                            _ = token.cancelled() => return,
                        };
                        match accepted {
                            Ok((link, reader)) => inner.adopt_inbound(link, reader),
                            Err(e) => warn!("Rejected connection from {}: {}", peer, e),
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
            _ = inner.cancel.cancelled() => {
                debug!("Listener on {:?} shutting down", inner.local);
                break;
            }
        }
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Send side of a cached link.
pub struct RemoteObserver<T> {
    link: Arc<Link>,
    codec: Arc<dyn Codec<T>>,
}

impl<T: 'static> RemoteObserver<T> {
    /// Encode `value` and enqueue it on the link.
    pub fn on_next(&self, value: &T) -> Result<(), TransportError> {
        let frame = self.codec.encode(value)?;
        self.link.send(frame)
    }

    pub fn destination(&self) -> RemoteAddress {
        self.link.remote()
    }

    /// Identity of the underlying connection.
    pub fn link_id(&self) -> u64 {
        self.link.id()
    }

    pub fn is_closed(&self) -> bool {
        self.link.is_closed()
    }
}

impl<T> Clone for RemoteObserver<T> {
    fn clone(&self) -> Self {
        Self {
            link: self.link.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl<T> fmt::Debug for RemoteObserver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObserver")
            .field("destination", &self.link.remote())
            .field("link_id", &self.link.id())
            .finish()
    }
}

/// Keeps an observer registered until [`ObserverRegistration::unregister`] is called.
pub struct ObserverRegistration {
    unregister: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ObserverRegistration {
    fn new(unregister: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unregister: Some(Box::new(unregister)),
        }
    }

    pub fn unregister(mut self) {
        if let Some(unregister) = self.unregister.take() {
            unregister();
        }
    }
}

impl fmt::Debug for ObserverRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverRegistration")
            .field("active", &self.unregister.is_some())
            .finish()
    }
}
