// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Task side of a communication group.
//!
//! A [`CommunicationGroupClient`] publishes its task's address with the name
//! service, routes every inbound [`GroupMessage`] into a mailbox keyed by
//! `(operator, source task)` and hands out operator endpoints bound to the
//! task's role in each operator.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use canopy_runtime::{
    CancellationToken, JsonCodec, NameClient, Observer, ObserverRegistration, RemoteAddress,
    RemoteManager, RemoteMessage, TransportConfig, TransportError,
};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::GroupConfig;
use crate::driver::{GroupConfiguration, OperatorConfiguration};
use crate::error::GroupError;
use crate::message::{ChunkHeader, GroupMessage};
use crate::operators::{
    BroadcastReceiver, BroadcastSender, OperatorContext, OperatorKind, ReduceFunction,
    ReduceFunctionKind, ReduceReceiver, ReduceSender, Reducible, ScatterReceiver, ScatterSender,
};
use crate::pipeline::GroupData;
use crate::topology::OperatorRole;

type MailboxKey = (String, String);

struct Mailbox {
    tx: mpsc::UnboundedSender<GroupMessage>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<GroupMessage>>,
}

impl Mailbox {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }
}

#[derive(Default)]
struct Mailboxes {
    boxes: DashMap<MailboxKey, Arc<Mailbox>>,
}

impl Mailboxes {
    fn get(&self, operator: &str, source: &str) -> Arc<Mailbox> {
        self.boxes
            .entry((operator.to_string(), source.to_string()))
            .or_insert_with(|| Arc::new(Mailbox::new()))
            .clone()
    }

    fn deliver(&self, message: GroupMessage) {
        let mailbox = self.get(&message.operator, &message.source);
        // the receiver half lives inside the mailbox, so this cannot fail
        let _ = mailbox.tx.send(message);
    }

    /// Drop mailboxes for tasks that are no longer neighbors.
    fn retain_sources(&self, sources: &HashSet<&str>) {
        self.boxes
            .retain(|(_, source), _| sources.contains(source.as_str()));
    }
}

/// Catch-all observer feeding the mailboxes.
struct MailboxRouter {
    group: String,
    task_id: String,
    mailboxes: Arc<Mailboxes>,
}

impl Observer<RemoteMessage<GroupMessage>> for MailboxRouter {
    fn on_next(&self, message: RemoteMessage<GroupMessage>) {
        let RemoteMessage { source, payload } = message;
        if payload.group != self.group || payload.destination != self.task_id {
            warn!(
                %source,
                group = %payload.group,
                destination = %payload.destination,
                "Dropping message addressed to another group or task"
            );
            return;
        }
        self.mailboxes.deliver(payload);
    }
}

/// Shared send/receive plumbing for every operator endpoint of one client.
pub(crate) struct GroupChannel {
    group: String,
    task_id: String,
    manager: RemoteManager<GroupMessage>,
    naming: Arc<dyn NameClient>,
    mailboxes: Arc<Mailboxes>,
    epoch: AtomicU64,
    receive_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl GroupChannel {
    pub(crate) fn task_id(&self) -> &str {
        &self.task_id
    }

    pub(crate) async fn send(
        &self,
        operator: &str,
        destination: &str,
        chunk: ChunkHeader,
        payload: Vec<u8>,
    ) -> Result<(), GroupError> {
        if self.cancel.is_cancelled() {
            return Err(GroupError::ConnectionClosed(destination.to_string()));
        }

        let address = self.naming.lookup(destination).await?;
        let remote = self
            .manager
            .remote_observer(address)
            .await
            .map_err(|e| self.peer_error(destination, e))?;

        let message = GroupMessage {
            group: self.group.clone(),
            epoch: self.epoch.load(Ordering::Acquire),
            operator: operator.to_string(),
            source: self.task_id.clone(),
            destination: destination.to_string(),
            chunk,
            payload,
        };
        remote
            .on_next(&message)
            .map_err(|e| self.peer_error(destination, e))
    }

    /// Next message from `source` for `operator`, in arrival order.
    ///
    /// Messages stamped with an epoch older than this task's are left over
    /// from a round abandoned before a re-placement and are skipped.
    pub(crate) async fn receive(
        &self,
        operator: &str,
        source: &str,
    ) -> Result<GroupMessage, GroupError> {
        let mailbox = self.mailboxes.get(operator, source);
        let mut rx = mailbox.rx.lock().await;

        let next = async {
            loop {
                let message = tokio::select! {
                    message = rx.recv() => {
                        message.ok_or_else(|| GroupError::ConnectionClosed(source.to_string()))?
                    }
                    _ = self.cancel.cancelled() => {
                        return Err(GroupError::ConnectionClosed(source.to_string()));
                    }
                };

                let current = self.epoch.load(Ordering::Acquire);
                if message.epoch >= current {
                    return Ok(message);
                }
                debug!(
                    task_id = %self.task_id,
                    operator,
                    source,
                    stale = message.epoch,
                    current,
                    "Discarding message from an earlier placement"
                );
            }
        };

        match self.receive_timeout {
            Some(limit) => tokio::time::timeout(limit, next).await.map_err(|_| {
                GroupError::Timeout {
                    operator: operator.to_string(),
                    source_task: source.to_string(),
                }
            })?,
            None => next.await,
        }
    }

    fn peer_error(&self, destination: &str, error: TransportError) -> GroupError {
        if error.is_disconnect() {
            debug!(task_id = %self.task_id, destination, %error, "Peer unreachable");
            GroupError::ConnectionClosed(destination.to_string())
        } else {
            error.into()
        }
    }
}

pub struct CommunicationGroupClient {
    configuration: RwLock<GroupConfiguration>,
    channel: Arc<GroupChannel>,
    registration: Mutex<Option<ObserverRegistration>>,
}

impl CommunicationGroupClient {
    /// Join the group over an existing listening manager.
    ///
    /// The task's address is published under its id, so every task of a
    /// round must have joined before any operator sends.
    pub async fn new(
        configuration: GroupConfiguration,
        manager: RemoteManager<GroupMessage>,
        naming: Arc<dyn NameClient>,
        config: &GroupConfig,
    ) -> Result<Self, GroupError> {
        let task_id = configuration.task_id.clone();
        let address = manager
            .local_address()
            .ok_or_else(|| GroupError::NotListening(task_id.clone()))?;

        let mailboxes = Arc::new(Mailboxes::default());
        let registration = manager.register_catch_all(Arc::new(MailboxRouter {
            group: configuration.group_name.clone(),
            task_id: task_id.clone(),
            mailboxes: mailboxes.clone(),
        }));

        naming.register(&task_id, address).await?;
        info!(group = %configuration.group_name, task_id = %task_id, "Joined group at {}", address);

        let channel = Arc::new(GroupChannel {
            group: configuration.group_name.clone(),
            task_id,
            manager,
            naming,
            mailboxes,
            epoch: AtomicU64::new(configuration.epoch),
            receive_timeout: config.receive_timeout(),
            cancel: CancellationToken::new(),
        });

        Ok(Self {
            configuration: RwLock::new(configuration),
            channel,
            registration: Mutex::new(Some(registration)),
        })
    }

    /// Bind a fresh manager with the JSON envelope codec and join the group.
    pub async fn listen(
        configuration: GroupConfiguration,
        transport: TransportConfig,
        naming: Arc<dyn NameClient>,
        config: &GroupConfig,
    ) -> Result<Self, GroupError> {
        let manager =
            RemoteManager::listen(transport, Arc::new(JsonCodec::<GroupMessage>::new())).await?;
        Self::new(configuration, manager, naming, config).await
    }

    pub fn task_id(&self) -> &str {
        self.channel.task_id()
    }

    pub fn group_name(&self) -> &str {
        &self.channel.group
    }

    pub fn local_address(&self) -> Option<RemoteAddress> {
        self.channel.manager.local_address()
    }

    pub fn configuration(&self) -> GroupConfiguration {
        self.configuration.read().clone()
    }

    /// Install a new bundle from the driver after a membership change.
    ///
    /// Endpoints created earlier keep their old topology; create new ones
    /// for the next round. Every surviving task must install the new bundle:
    /// once a task moves to the new epoch it ignores traffic stamped with
    /// the old one, including anything already queued.
    pub fn reconfigure(&self, configuration: GroupConfiguration) -> Result<(), GroupError> {
        if configuration.task_id != self.channel.task_id {
            return Err(GroupError::UnknownTask(configuration.task_id));
        }
        self.channel
            .mailboxes
            .retain_sources(&configuration.neighbors());
        self.channel
            .epoch
            .fetch_max(configuration.epoch, Ordering::AcqRel);
        debug!(
            task_id = %self.channel.task_id,
            epoch = configuration.epoch,
            "Installed new group configuration"
        );
        *self.configuration.write() = configuration;
        Ok(())
    }

    pub fn broadcast_sender<T: GroupData>(&self, name: &str) -> Result<BroadcastSender<T>, GroupError> {
        let (op, ctx) = self.context::<T>(name, OperatorKind::Broadcast)?;
        if op.topology.role != OperatorRole::Sender {
            return Err(self.not_root(name));
        }
        Ok(BroadcastSender::new(ctx))
    }

    pub fn broadcast_receiver<T: GroupData>(
        &self,
        name: &str,
    ) -> Result<BroadcastReceiver<T>, GroupError> {
        let (op, ctx) = self.context::<T>(name, OperatorKind::Broadcast)?;
        if op.topology.role != OperatorRole::Receiver {
            return Err(self.not_receiver(name));
        }
        Ok(BroadcastReceiver::new(ctx))
    }

    /// Reduce sender using the built-in function named by the operator.
    pub fn reduce_sender<T: GroupData + Reducible>(
        &self,
        name: &str,
    ) -> Result<ReduceSender<T>, GroupError> {
        let function = T::reduce_function(self.reduce_kind(name)?);
        self.reduce_sender_with(name, function)
    }

    pub fn reduce_sender_with<T: GroupData>(
        &self,
        name: &str,
        function: Arc<dyn ReduceFunction<T>>,
    ) -> Result<ReduceSender<T>, GroupError> {
        let (op, ctx) = self.context::<T>(name, OperatorKind::Reduce)?;
        if op.topology.role != OperatorRole::Sender {
            return Err(GroupError::NotSender {
                task: self.channel.task_id.clone(),
                operator: name.to_string(),
            });
        }
        Ok(ReduceSender::new(ctx, function))
    }

    /// Reduce receiver using the built-in function named by the operator.
    pub fn reduce_receiver<T: GroupData + Reducible>(
        &self,
        name: &str,
    ) -> Result<ReduceReceiver<T>, GroupError> {
        let function = T::reduce_function(self.reduce_kind(name)?);
        self.reduce_receiver_with(name, function)
    }

    pub fn reduce_receiver_with<T: GroupData>(
        &self,
        name: &str,
        function: Arc<dyn ReduceFunction<T>>,
    ) -> Result<ReduceReceiver<T>, GroupError> {
        let (op, ctx) = self.context::<T>(name, OperatorKind::Reduce)?;
        if op.topology.role != OperatorRole::Receiver {
            return Err(self.not_root(name));
        }
        Ok(ReduceReceiver::new(ctx, function))
    }

    pub fn scatter_sender<E>(&self, name: &str) -> Result<ScatterSender<E>, GroupError>
    where
        E: Send + Sync + 'static,
        Vec<E>: GroupData,
    {
        let (op, ctx) = self.context::<Vec<E>>(name, OperatorKind::Scatter)?;
        if op.topology.role != OperatorRole::Sender {
            return Err(self.not_root(name));
        }
        Ok(ScatterSender::new(ctx))
    }

    pub fn scatter_receiver<E>(&self, name: &str) -> Result<ScatterReceiver<E>, GroupError>
    where
        E: Send + Sync + 'static,
        Vec<E>: GroupData,
    {
        let (op, ctx) = self.context::<Vec<E>>(name, OperatorKind::Scatter)?;
        if op.topology.role != OperatorRole::Receiver {
            return Err(self.not_receiver(name));
        }
        Ok(ScatterReceiver::new(ctx))
    }

    /// Leave the group: withdraw the published address, fail pending
    /// receives and close every link.
    pub async fn shutdown(&self) -> Result<(), GroupError> {
        if let Some(registration) = self.registration.lock().take() {
            registration.unregister();
        }
        self.channel.cancel.cancel();
        self.channel.naming.unregister(&self.channel.task_id).await?;
        self.channel.manager.dispose();
        info!(group = %self.channel.group, task_id = %self.channel.task_id, "Left group");
        Ok(())
    }

    fn operator(&self, name: &str, kind: OperatorKind) -> Result<OperatorConfiguration, GroupError> {
        let configuration = self.configuration.read();
        let op = configuration.operator(name)?;
        if op.spec.kind() != kind {
            return Err(GroupError::WrongOperatorKind {
                operator: name.to_string(),
                expected: kind,
                actual: op.spec.kind(),
            });
        }
        Ok(op.clone())
    }

    fn context<T: GroupData>(
        &self,
        name: &str,
        kind: OperatorKind,
    ) -> Result<(OperatorConfiguration, OperatorContext<T>), GroupError> {
        let op = self.operator(name, kind)?;
        let codec = T::codec(op.spec.codec())?;
        let converter = T::converter(op.spec.pipeline());
        let ctx = OperatorContext::new(
            name.to_string(),
            op.topology.clone(),
            self.channel.clone(),
            codec,
            converter,
        );
        Ok((op, ctx))
    }

    fn reduce_kind(&self, name: &str) -> Result<ReduceFunctionKind, GroupError> {
        let op = self.operator(name, OperatorKind::Reduce)?;
        op.spec
            .reduce_function()
            .ok_or_else(|| GroupError::UnknownOperator(name.to_string()))
    }

    fn not_root(&self, name: &str) -> GroupError {
        GroupError::NotRoot {
            task: self.channel.task_id.clone(),
            operator: name.to_string(),
        }
    }

    fn not_receiver(&self, name: &str) -> GroupError {
        GroupError::NotReceiver {
            task: self.channel.task_id.clone(),
            operator: name.to_string(),
        }
    }
}

impl std::fmt::Debug for CommunicationGroupClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunicationGroupClient")
            .field("group", &self.channel.group)
            .field("task_id", &self.channel.task_id)
            .field("local_address", &self.local_address())
            .finish()
    }
}
