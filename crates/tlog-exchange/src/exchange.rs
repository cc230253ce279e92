//! One exchange between two peers, and the loop that keeps running them.
//!
//! An exchange runs a [`MergeProtocol`] and a [`ServiceProtocol`]
//! concurrently over a single [`FrameChannel`]. The dispatcher below reads
//! every inbound frame and routes it: requests to the service, responses to
//! the merge, control messages to itself. The exchange ends cleanly once the
//! local merge is acknowledged and the peer's merge has completed.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tlog_chain::{Hash, Repository, SigningIdentity};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::channel::FrameChannel;
use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, Result};
use crate::merge::{MergeOutcome, MergeProtocol, MergeReport};
use crate::message::{ExchangeMessage, MessageKind};
use crate::service::{Delivery, ExchangeContext, ServiceProtocol};

/// Summary of a finished exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeReport {
    pub outcome: MergeOutcome,
    pub new_root: Hash,
    /// Blocks this side stored.
    pub blocks_added: usize,
    /// Requests this side answered for the peer.
    pub requests_served: usize,
}

/// Run one exchange, timestamped with the current wall clock.
pub async fn run_exchange(
    channel: Arc<dyn FrameChannel>,
    repository: Arc<Repository>,
    identity: SigningIdentity,
    config: &ExchangeConfig,
) -> Result<ExchangeReport> {
    let timestamp = chrono::Utc::now().timestamp_millis();
    run_exchange_at(channel, repository, identity, config, timestamp).await
}

/// Run one exchange with an explicit local timestamp.
///
/// Takes the repository's exchange lock first and holds it until the
/// exchange has fully ended, successfully or not.
pub async fn run_exchange_at(
    channel: Arc<dyn FrameChannel>,
    repository: Arc<Repository>,
    identity: SigningIdentity,
    config: &ExchangeConfig,
    timestamp: i64,
) -> Result<ExchangeReport> {
    exchange(channel, repository, identity, config, timestamp, || {}).await
}

async fn exchange(
    channel: Arc<dyn FrameChannel>,
    repository: Arc<Repository>,
    identity: SigningIdentity,
    config: &ExchangeConfig,
    timestamp: i64,
    on_locked: impl FnOnce(),
) -> Result<ExchangeReport> {
    let guard = {
        let repository = repository.clone();
        tokio::task::spawn_blocking(move || repository.begin_exchange())
            .await
            .map_err(|e| ExchangeError::terminated(format!("lock task failed: {}", e)))?
    };
    on_locked();

    let result = match repository.get_root() {
        Ok(root) => {
            let context = Arc::new(ExchangeContext {
                identity,
                root,
                timestamp,
            });
            debug!(root = %context.root.hash().short(), timestamp, "exchange started");
            Dispatcher::new(channel, repository.clone(), context, config)
                .run()
                .await
        }
        Err(e) => {
            if let Ok(frame) = ExchangeMessage::MergeInterrupted.encode() {
                let _ = timeout(config.teardown_grace, channel.send(frame)).await;
            }
            Err(e.into())
        }
    };

    repository.end_exchange(guard);
    match &result {
        Ok(report) => info!(
            outcome = ?report.outcome,
            root = %report.new_root.short(),
            added = report.blocks_added,
            served = report.requests_served,
            "exchange finished"
        ),
        Err(e) => warn!(error = %e, "exchange failed"),
    }
    result
}

struct Dispatcher {
    channel: Arc<dyn FrameChannel>,
    service_tx: mpsc::Sender<Delivery>,
    merge_tx: mpsc::Sender<Delivery>,
    service_task: JoinHandle<Result<usize>>,
    merge_task: JoinHandle<Result<MergeReport>>,
    round_trip_timeout: Duration,
    teardown_grace: Duration,

    merge_joined: bool,
    service_joined: bool,
    merge_report: Option<MergeReport>,
    requests_served: Option<usize>,
    /// Our MergeComplete has gone out.
    complete_sent: bool,
    /// The peer acknowledged our MergeComplete.
    local_done: bool,
    /// The peer's merge completed; its requests are over.
    remote_done: bool,
}

impl Dispatcher {
    fn new(
        channel: Arc<dyn FrameChannel>,
        repository: Arc<Repository>,
        context: Arc<ExchangeContext>,
        config: &ExchangeConfig,
    ) -> Self {
        let (service_tx, service_rx) = mpsc::channel(config.service_queue_depth.max(1));
        let (merge_tx, merge_rx) = mpsc::channel(config.merge_queue_depth.max(1));

        let service = ServiceProtocol::new(repository.clone(), context.clone());
        let service_task = tokio::spawn(service.run(channel.clone(), service_rx));
        let merge = MergeProtocol::new(
            repository,
            context,
            channel.clone(),
            config.round_trip_timeout,
        );
        let merge_task = tokio::spawn(merge.run(merge_rx));

        Self {
            channel,
            service_tx,
            merge_tx,
            service_task,
            merge_task,
            round_trip_timeout: config.round_trip_timeout,
            teardown_grace: config.teardown_grace,
            merge_joined: false,
            service_joined: false,
            merge_report: None,
            requests_served: None,
            complete_sent: false,
            local_done: false,
            remote_done: false,
        }
    }

    async fn run(mut self) -> Result<ExchangeReport> {
        match self.dispatch().await {
            Ok(()) => self.finish().await,
            Err(e) => {
                self.teardown().await;
                Err(e)
            }
        }
    }

    /// Route frames until both merges are acknowledged. Once the local merge
    /// has finished nothing else bounds the wait, so a peer silent for a
    /// whole round trip ends the exchange.
    async fn dispatch(&mut self) -> Result<()> {
        while !(self.local_done && self.remote_done) {
            let merge_running = !self.merge_joined;
            let service_running = !self.service_joined;
            let watch_idle = self.merge_joined;
            let idle_limit = self.round_trip_timeout;
            tokio::select! {
                frame = self.channel.recv() => {
                    let Some(frame) = frame else {
                        return Err(ExchangeError::terminated("peer disconnected"));
                    };
                    let message = ExchangeMessage::decode(&frame).map_err(|e| {
                        ExchangeError::terminated(format!("undecodable frame: {}", e))
                    })?;
                    self.route(message).await?;
                }
                joined = &mut self.merge_task, if merge_running => {
                    self.merge_joined = true;
                    let report = flatten(joined, "merge")?;
                    self.send_control(ExchangeMessage::MergeComplete).await?;
                    self.complete_sent = true;
                    debug!(outcome = ?report.outcome, "local merge complete");
                    self.merge_report = Some(report);
                }
                joined = &mut self.service_task, if service_running => {
                    self.service_joined = true;
                    self.requests_served = Some(flatten(joined, "service")?);
                }
                _ = tokio::time::sleep(idle_limit), if watch_idle => {
                    return Err(ExchangeError::terminated(format!(
                        "peer silent for {:?} after our merge finished",
                        idle_limit
                    )));
                }
            }
        }
        Ok(())
    }

    async fn route(&mut self, message: ExchangeMessage) -> Result<()> {
        match message.kind() {
            MessageKind::Request => {
                if self.remote_done {
                    return Err(violation(&message));
                }
                deliver(&self.service_tx, Delivery::Message(message), "service")
            }
            MessageKind::Response => {
                if self.merge_joined {
                    return Err(violation(&message));
                }
                deliver(&self.merge_tx, Delivery::Message(message), "merge")
            }
            MessageKind::Control => match message {
                ExchangeMessage::MergeComplete if !self.remote_done => {
                    self.send_control(ExchangeMessage::MergeCompleteAck).await?;
                    if !self.service_joined {
                        deliver(&self.service_tx, Delivery::Stop, "service")?;
                    }
                    self.remote_done = true;
                    debug!("peer merge complete");
                    Ok(())
                }
                ExchangeMessage::MergeCompleteAck if self.complete_sent && !self.local_done => {
                    self.local_done = true;
                    Ok(())
                }
                ExchangeMessage::MergeInterrupted => {
                    Err(ExchangeError::terminated("peer interrupted the exchange"))
                }
                other => Err(violation(&other)),
            },
        }
    }

    async fn send_control(&self, message: ExchangeMessage) -> Result<()> {
        let frame = message.encode()?;
        match timeout(self.round_trip_timeout, self.channel.send(frame)).await {
            Ok(sent) => Ok(sent?),
            Err(_) => Err(ExchangeError::terminated(format!(
                "peer stopped reading; could not send {}",
                message.name()
            ))),
        }
    }

    async fn finish(mut self) -> Result<ExchangeReport> {
        let requests_served = match self.requests_served {
            Some(served) => served,
            None => match timeout(self.teardown_grace, &mut self.service_task).await {
                Ok(joined) => flatten(joined, "service")?,
                Err(_) => {
                    self.service_task.abort();
                    return Err(ExchangeError::terminated("service did not stop"));
                }
            },
        };
        let report = self
            .merge_report
            .ok_or_else(|| ExchangeError::terminated("merge produced no report"))?;
        Ok(ExchangeReport {
            outcome: report.outcome,
            new_root: report.new_root,
            blocks_added: report.blocks_added,
            requests_served,
        })
    }

    /// Best-effort notice to the peer, then stop both sub-protocols.
    async fn teardown(self) {
        if let Ok(frame) = ExchangeMessage::MergeInterrupted.encode() {
            let _ = timeout(self.teardown_grace, self.channel.send(frame)).await;
        }
        let _ = self.service_tx.try_send(Delivery::Interrupted);
        let _ = self.merge_tx.try_send(Delivery::Interrupted);
        drop(self.service_tx);
        drop(self.merge_tx);

        if !self.service_joined {
            join_or_abort(self.service_task, self.teardown_grace, "service").await;
        }
        if !self.merge_joined {
            join_or_abort(self.merge_task, self.teardown_grace, "merge").await;
        }
    }
}

fn flatten<T>(
    joined: std::result::Result<Result<T>, tokio::task::JoinError>,
    task: &str,
) -> Result<T> {
    joined.map_err(|e| ExchangeError::terminated(format!("{} task failed: {}", task, e)))?
}

/// Hand an item to a sub-protocol without waiting. A well-behaved peer never
/// has more items in flight than a queue holds, so a full queue means the
/// peer is ignoring the one-request-at-a-time discipline.
fn deliver(queue: &mpsc::Sender<Delivery>, item: Delivery, task: &str) -> Result<()> {
    queue.try_send(item).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => ExchangeError::terminated(format!(
            "protocol violation: peer overran the {} queue",
            task
        )),
        mpsc::error::TrySendError::Closed(_) => {
            ExchangeError::terminated(format!("{} stopped early", task))
        }
    })
}

fn violation(message: &ExchangeMessage) -> ExchangeError {
    ExchangeError::terminated(format!("protocol violation: unexpected {}", message.name()))
}

async fn join_or_abort<T>(mut handle: JoinHandle<T>, grace: Duration, task: &str) {
    if timeout(grace, &mut handle).await.is_err() {
        warn!(task, "sub-protocol did not stop in time, aborting");
        handle.abort();
    }
}

/// Where the exchanger is in its cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeState {
    /// No peer connected.
    Idle,
    /// A channel is open; waiting for the exchange lock.
    Connected,
    /// The exchange lock is held and the protocols are running.
    Exchanging,
}

/// Supplies channels to peers.
#[async_trait]
pub trait Connector: Send + Sync {
    /// The next peer to exchange with. `Ok(None)` stops the exchanger.
    async fn connect(&self) -> Result<Option<Arc<dyn FrameChannel>>>;
}

/// Runs exchanges back to back, pausing between them.
pub struct Exchanger {
    repository: Arc<Repository>,
    identity: SigningIdentity,
    config: ExchangeConfig,
    state: watch::Sender<ExchangeState>,
}

impl Exchanger {
    pub fn new(repository: Arc<Repository>, identity: SigningIdentity, config: ExchangeConfig) -> Self {
        let (state, _) = watch::channel(ExchangeState::Idle);
        Self {
            repository,
            identity,
            config,
            state,
        }
    }

    pub fn state(&self) -> ExchangeState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ExchangeState> {
        self.state.subscribe()
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    /// Run a single exchange over an already connected channel.
    pub async fn run_once(&self, channel: Arc<dyn FrameChannel>) -> Result<ExchangeReport> {
        self.state.send_replace(ExchangeState::Connected);
        let timestamp = chrono::Utc::now().timestamp_millis();
        let result = exchange(
            channel,
            self.repository.clone(),
            self.identity.clone(),
            &self.config,
            timestamp,
            || {
                self.state.send_replace(ExchangeState::Exchanging);
            },
        )
        .await;
        self.state.send_replace(ExchangeState::Idle);
        result
    }

    /// Exchange with whatever the connector yields until it yields `None`.
    /// Failed exchanges are logged and do not stop the loop.
    pub async fn run<C: Connector + ?Sized>(&self, connector: &C) -> Result<()> {
        loop {
            let Some(channel) = connector.connect().await? else {
                info!("connector closed, exchanger stopping");
                return Ok(());
            };
            if let Err(e) = self.run_once(channel).await {
                warn!(error = %e, recoverable = e.is_recoverable(), "exchange abandoned");
            }
            tokio::time::sleep(self.config.cooldown).await;
        }
    }
}
