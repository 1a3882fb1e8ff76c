//! Per-device connection actor.

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{ConnectionEvent, ConnectionEventKind, ConnectionState, Snapshot};
use crate::config::{ConnectionConfig, TransferConfig};
use crate::device::Address;
use crate::error::{Error, ErrorKind, Result};
use crate::pool::ConnectionTable;
use crate::transfer::{DataEvent, TransferChannel};
use crate::transport::{EventStream, LinkHandle, Transport, TransportError, TransportEvent};

/// Capacity of a machine's command queue.
const COMMAND_CAPACITY: usize = 16;

/// Reply channel for a command.
pub(crate) type Reply = oneshot::Sender<Result<()>>;

/// Request sent to a machine.
pub(crate) enum Command {
    /// Resolve once connected, or with the reason the connection gave up.
    Connect { reply: Reply },
    /// Tear the connection down.
    Disconnect { reply: Reply },
}

/// Everything a machine needs besides its command queue.
pub(crate) struct MachineParts {
    pub id: u64,
    pub address: Address,
    pub transport: Arc<dyn Transport>,
    pub connection: ConnectionConfig,
    pub transfer: TransferConfig,
    pub events: broadcast::Sender<ConnectionEvent>,
    pub activity: broadcast::Sender<DataEvent>,
    pub table: ConnectionTable,
}

enum Attempt {
    Opened(LinkHandle, EventStream),
    Failed(ErrorKind),
    Cancelled(Option<Reply>),
}

enum Served {
    TornDown(Outcome),
    LinkLost,
}

enum Outcome {
    /// Explicit disconnect of a live link.
    Disconnected {
        reply: Option<Reply>,
        result: Result<()>,
    },
    /// Disconnect before a link was established.
    Cancelled { reply: Option<Reply> },
    /// Link lost with reconnection disabled.
    Lost,
    /// Retries used up.
    Exhausted,
}

/// State machine for one device, run as its own task.
pub(crate) struct Machine {
    id: u64,
    address: Address,
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    transfer: TransferConfig,
    commands: mpsc::Receiver<Command>,
    snapshot: watch::Sender<Snapshot>,
    events: broadcast::Sender<ConnectionEvent>,
    activity: broadcast::Sender<DataEvent>,
    table: ConnectionTable,
    waiters: Vec<Reply>,
}

impl Machine {
    /// Enter `Connecting` and spawn the machine.
    ///
    /// The state change is published before this returns, so the caller can
    /// register the machine with the state already counting against the cap.
    pub(crate) fn start(
        parts: MachineParts,
        first: Reply,
    ) -> (mpsc::Sender<Command>, watch::Receiver<Snapshot>) {
        let (command_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (snapshot, snapshot_rx) = watch::channel(Snapshot::default());

        let machine = Self {
            id: parts.id,
            address: parts.address,
            transport: parts.transport,
            config: parts.connection,
            transfer: parts.transfer,
            commands,
            snapshot,
            events: parts.events,
            activity: parts.activity,
            table: parts.table,
            waiters: vec![first],
        };

        machine.transition(ConnectionState::Connecting);
        tokio::spawn(machine.run());

        (command_tx, snapshot_rx)
    }

    async fn run(mut self) {
        let outcome = self.drive().await;
        self.settle(outcome).await;
    }

    async fn drive(&mut self) -> Outcome {
        loop {
            match self.attempt().await {
                Attempt::Opened(handle, events) => match self.serve(handle, events).await {
                    Served::TornDown(outcome) => return outcome,
                    Served::LinkLost if self.config.reconnect_on_link_loss => {
                        if let Some(outcome) = self.fail(ErrorKind::Disconnected).await {
                            return outcome;
                        }
                    }
                    Served::LinkLost => {
                        self.record_failure(ErrorKind::Disconnected);
                        self.transition(ConnectionState::Failed);
                        return Outcome::Lost;
                    }
                },
                Attempt::Failed(kind) => {
                    if let Some(outcome) = self.fail(kind).await {
                        return outcome;
                    }
                }
                Attempt::Cancelled(reply) => return Outcome::Cancelled { reply },
            }
        }
    }

    /// One `open_link` call, bounded by the connect timeout.
    async fn attempt(&mut self) -> Attempt {
        let attempt = self.snapshot.borrow().retry_count + 1;
        debug!(
            "Connecting to {} (attempt {} of {})",
            self.address, attempt, self.config.max_retries
        );

        // Subscribe first so nothing published for the new link is missed.
        let events = match self.transport.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Failed to subscribe to transport events: {}", e);
                return Attempt::Failed(ErrorKind::TransportError);
            }
        };

        let open = {
            let transport = self.transport.clone();
            let address = self.address.clone();
            let limit = self.config.connect_timeout;
            async move { timeout(limit, transport.open_link(&address)).await }
        };
        tokio::pin!(open);

        let cancelled = loop {
            tokio::select! {
                result = &mut open => {
                    return match result {
                        Ok(Ok(handle)) => Attempt::Opened(handle, events),
                        Ok(Err(e)) => {
                            warn!("Connection attempt {} to {} failed: {}", attempt, self.address, e);
                            Attempt::Failed(ErrorKind::TransportError)
                        }
                        Err(_) => {
                            warn!(
                                "Connection attempt {} to {} timed out after {:?}",
                                attempt, self.address, self.config.connect_timeout
                            );
                            Attempt::Failed(ErrorKind::TransportError)
                        }
                    };
                }
                command = self.commands.recv() => match command {
                    Some(Command::Connect { reply }) => self.waiters.push(reply),
                    Some(Command::Disconnect { reply }) => break Some(reply),
                    None => break None,
                },
            }
        };

        // Let the open resolve so a link it produced is not leaked.
        self.transition(ConnectionState::Disconnecting);
        if let Ok(Ok(handle)) = open.await {
            self.close_quietly(handle).await;
        }
        Attempt::Cancelled(cancelled)
    }

    /// Record a failure and wait out the backoff.
    ///
    /// Returns `None` once the machine is back in `Connecting`.
    async fn fail(&mut self, kind: ErrorKind) -> Option<Outcome> {
        let failures = self.record_failure(kind);
        self.transition(ConnectionState::Failed);

        if failures >= self.config.max_retries {
            warn!(
                "Giving up on {} after {} attempts",
                self.address, failures
            );
            return Some(Outcome::Exhausted);
        }

        let delay = self.config.backoff.delay(failures);
        debug!("Retrying {} in {:?}", self.address, delay);

        let backoff = tokio::time::sleep(delay);
        tokio::pin!(backoff);
        loop {
            tokio::select! {
                _ = &mut backoff => break,
                command = self.commands.recv() => match command {
                    Some(Command::Connect { reply }) => self.waiters.push(reply),
                    Some(Command::Disconnect { reply }) => {
                        return Some(Outcome::Cancelled { reply: Some(reply) })
                    }
                    None => return Some(Outcome::Cancelled { reply: None }),
                },
            }
        }

        self.transition(ConnectionState::Connecting);
        None
    }

    /// Run the connection until it is torn down or the link is lost.
    async fn serve(&mut self, handle: LinkHandle, mut events: EventStream) -> Served {
        let (channel, mut writer_failure) = TransferChannel::open(
            self.address.clone(),
            self.transport.clone(),
            handle,
            self.transfer.clone(),
            self.activity.clone(),
        );

        self.snapshot.send_modify(|s| {
            s.retry_count = 0;
            s.link = Some(handle);
            s.channel = Some(channel.clone());
            s.connected_since = Some(Utc::now());
        });
        self.transition(ConnectionState::Connected);
        info!("Connected to {} over {}", self.address, handle);
        self.emit(ConnectionEventKind::Connected);
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        let mut backlog: VecDeque<Bytes> = VecDeque::new();
        let mut paused = false;

        loop {
            let waiting_for_space = paused || !backlog.is_empty();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Connect { reply }) => {
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::Disconnect { reply }) => {
                        return Served::TornDown(self.teardown(handle, &channel, Some(reply)).await);
                    }
                    None => return Served::TornDown(self.teardown(handle, &channel, None).await),
                },
                event = events.next() => match event {
                    Some(TransportEvent::DataArrived { handle: from, data }) if from == handle => {
                        backlog.push_back(data);
                        paused = self.pump(handle, &channel, &mut backlog, paused).await;
                    }
                    Some(TransportEvent::LinkDown { handle: lost, reason }) if lost == handle => {
                        warn!("Link to {} lost: {}", self.address, reason);
                        return self.lose_link(&channel);
                    }
                    Some(_) => {}
                    None => {
                        warn!("Transport event feed ended while connected to {}", self.address);
                        return self.lose_link(&channel);
                    }
                },
                failure = &mut writer_failure => {
                    let reason = failure
                        .map(|e| e.to_string())
                        .unwrap_or_else(|_| "writer stopped".to_string());
                    warn!("Writes to {} failed: {}", self.address, reason);
                    self.close_quietly(handle).await;
                    return self.lose_link(&channel);
                }
                _ = channel.space_available(), if waiting_for_space => {
                    paused = self.pump(handle, &channel, &mut backlog, paused).await;
                }
            }
        }
    }

    /// Move inbound data into the channel and apply flow control.
    ///
    /// Returns whether transport reads are paused afterwards.
    async fn pump(
        &self,
        handle: LinkHandle,
        channel: &TransferChannel,
        backlog: &mut VecDeque<Bytes>,
        mut paused: bool,
    ) -> bool {
        flush(channel, backlog);

        if !paused && (channel.above_high_watermark() || !backlog.is_empty()) {
            match self.transport.set_read_paused(handle, true).await {
                Ok(()) => {
                    debug!(
                        "Paused reads from {} at {} buffered bytes",
                        self.address,
                        channel.buffered()
                    );
                    paused = true;
                }
                Err(e) => warn!("Failed to pause reads from {}: {}", self.address, e),
            }
        }

        if !paused || !backlog.is_empty() || !channel.at_or_below_low_watermark() {
            return paused;
        }

        // Pull what the transport held back before letting new data through.
        loop {
            match self.transport.read(handle).await {
                Ok(data) if data.is_empty() => break,
                Ok(data) => {
                    backlog.push_back(data);
                    flush(channel, backlog);
                    if !backlog.is_empty() {
                        return true;
                    }
                }
                Err(e) => {
                    warn!("Failed to read held data from {}: {}", self.address, e);
                    break;
                }
            }
        }

        if channel.above_high_watermark() {
            return true;
        }

        match self.transport.set_read_paused(handle, false).await {
            Ok(()) => {
                debug!("Resumed reads from {}", self.address);
                false
            }
            Err(e) => {
                warn!("Failed to resume reads from {}: {}", self.address, e);
                true
            }
        }
    }

    async fn teardown(
        &mut self,
        handle: LinkHandle,
        channel: &TransferChannel,
        reply: Option<Reply>,
    ) -> Outcome {
        info!("Disconnecting from {}", self.address);
        self.transition(ConnectionState::Disconnecting);
        channel.close();

        let result = match timeout(self.config.disconnect_timeout, self.transport.close_link(handle))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::transport(
                format!("closing link to {}", self.address),
                e,
            )),
            Err(_) => Err(Error::transport(
                format!("closing link to {}", self.address),
                TransportError::Timeout,
            )),
        };

        if let Err(e) = &result {
            warn!("{}", e);
        }

        Outcome::Disconnected { reply, result }
    }

    fn lose_link(&self, channel: &TransferChannel) -> Served {
        channel.close();
        self.emit(ConnectionEventKind::LinkLost);
        Served::LinkLost
    }

    async fn close_quietly(&self, handle: LinkHandle) {
        match timeout(self.config.disconnect_timeout, self.transport.close_link(handle)).await {
            Ok(Ok(())) => debug!("Closed {} to {}", handle, self.address),
            Ok(Err(e)) => debug!("Closing {} to {} failed: {}", handle, self.address, e),
            Err(_) => debug!("Closing {} to {} timed out", handle, self.address),
        }
    }

    /// Settle in `Idle`, leave the table and answer everyone still waiting.
    async fn settle(mut self, outcome: Outcome) {
        self.transition(ConnectionState::Idle);
        self.table.remove_if(&self.address, self.id);

        let attempts = self.snapshot.borrow().retry_count;
        let exhausted = matches!(outcome, Outcome::Exhausted);

        match outcome {
            Outcome::Disconnected { reply, result } => {
                info!("Disconnected from {}", self.address);
                self.emit(ConnectionEventKind::Disconnected);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Outcome::Cancelled { reply } => {
                info!("Connection to {} cancelled", self.address);
                self.emit(ConnectionEventKind::Disconnected);
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            Outcome::Lost => {
                info!("Connection to {} dropped after link loss", self.address);
                self.emit(ConnectionEventKind::Disconnected);
            }
            Outcome::Exhausted => {
                self.emit(ConnectionEventKind::ConnectFailed { attempts });
            }
        }

        let failure = |address: &Address| {
            if exhausted {
                Error::ConnectFailed {
                    address: address.to_string(),
                    attempts,
                }
            } else {
                Error::Disconnected {
                    address: address.to_string(),
                }
            }
        };

        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(failure(&self.address)));
        }

        self.commands.close();
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Connect { reply } => {
                    let _ = reply.send(Err(failure(&self.address)));
                }
                Command::Disconnect { reply } => {
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }

    /// Count a failed attempt, returning the consecutive failure count.
    fn record_failure(&self, kind: ErrorKind) -> u32 {
        let mut failures = 0;
        self.snapshot.send_modify(|s| {
            s.retry_count += 1;
            s.last_error = Some(kind);
            failures = s.retry_count;
        });
        failures
    }

    /// Move to `to`, publishing the snapshot and a `StateChanged` event.
    fn transition(&self, to: ConnectionState) {
        let from = self.snapshot.borrow().state;
        if !from.can_transition_to(to) {
            warn!(
                "Ignoring invalid transition for {}: {} -> {}",
                self.address, from, to
            );
            return;
        }

        self.snapshot.send_modify(|s| {
            s.state = to;
            if !to.is_connected() {
                s.channel = None;
                s.connected_since = None;
            }
            if !matches!(
                to,
                ConnectionState::Connected | ConnectionState::Disconnecting
            ) {
                s.link = None;
            }
        });

        debug!("{} state changed: {} -> {}", self.address, from, to);
        self.emit(ConnectionEventKind::StateChanged { from, to });
    }

    fn emit(&self, kind: ConnectionEventKind) {
        let _ = self.events.send(ConnectionEvent {
            address: self.address.clone(),
            kind,
        });
    }
}

/// Offer backlog chunks to the channel in order until one does not fit.
fn flush(channel: &TransferChannel, backlog: &mut VecDeque<Bytes>) {
    while let Some(chunk) = backlog.pop_front() {
        let rest = channel.offer(chunk);
        if !rest.is_empty() {
            backlog.push_front(rest);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use futures::stream;
    use std::time::Duration;

    fn parts(
        transport: MockTransport,
        config: ConnectionConfig,
    ) -> (MachineParts, broadcast::Receiver<ConnectionEvent>) {
        let (events, rx) = broadcast::channel(64);
        (
            MachineParts {
                id: 1,
                address: Address::parse("AA:BB:CC:DD:EE:01").unwrap(),
                transport: Arc::new(transport),
                connection: config,
                transfer: TransferConfig::default(),
                events,
                activity: broadcast::channel(16).0,
                table: ConnectionTable::default(),
            },
            rx,
        )
    }

    fn states(rx: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionState> {
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ConnectionEventKind::StateChanged { to, .. } = event.kind {
                states.push(to);
            }
        }
        states
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_errors_exhaust_retries() {
        let mut transport = MockTransport::new();
        transport
            .expect_events()
            .returning(|| Ok(stream::pending().boxed()));
        transport.expect_open_link().times(2).returning(|address| {
            Err(TransportError::Unreachable(address.to_string()))
        });

        let config = ConnectionConfig {
            max_retries: 2,
            ..ConnectionConfig::default()
        };
        let (parts, mut events) = parts(transport, config);
        let (reply, result) = oneshot::channel();
        let (_commands, snapshot) = Machine::start(parts, reply);

        let err = result.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectFailed { attempts: 2, .. }));
        assert_eq!(snapshot.borrow().state, ConnectionState::Idle);
        assert_eq!(snapshot.borrow().last_error, Some(ErrorKind::TransportError));
        assert_eq!(
            states(&mut events),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Failed,
                ConnectionState::Connecting,
                ConnectionState::Failed,
                ConnectionState::Idle,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_backoff_settles_idle() {
        let mut transport = MockTransport::new();
        transport
            .expect_events()
            .returning(|| Ok(stream::pending().boxed()));
        transport
            .expect_open_link()
            .times(1)
            .returning(|_| Err(TransportError::Timeout));

        let (parts, mut events) = parts(transport, ConnectionConfig::default());
        let (reply, result) = oneshot::channel();
        let (commands, _snapshot) = Machine::start(parts, reply);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let (disconnect, done) = oneshot::channel();
        assert!(commands
            .send(Command::Disconnect { reply: disconnect })
            .await
            .is_ok());

        assert!(done.await.unwrap().is_ok());
        assert!(matches!(
            result.await.unwrap(),
            Err(Error::Disconnected { .. })
        ));
        assert_eq!(
            states(&mut events),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Failed,
                ConnectionState::Idle,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_failure_is_returned_to_disconnect_caller() {
        let mut transport = MockTransport::new();
        transport
            .expect_events()
            .returning(|| Ok(stream::pending().boxed()));
        transport
            .expect_open_link()
            .returning(|_| Ok(LinkHandle::new(9)));
        transport.expect_max_payload_size().return_const(20usize);
        transport
            .expect_close_link()
            .returning(|handle| Err(TransportError::LinkClosed(handle)));

        let (parts, _events) = parts(transport, ConnectionConfig::default());
        let (reply, result) = oneshot::channel();
        let (commands, snapshot) = Machine::start(parts, reply);

        assert!(result.await.unwrap().is_ok());
        assert_eq!(snapshot.borrow().link, Some(LinkHandle::new(9)));

        let (disconnect, done) = oneshot::channel();
        assert!(commands
            .send(Command::Disconnect { reply: disconnect })
            .await
            .is_ok());
        let err = done.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportError);
        assert_eq!(snapshot.borrow().state, ConnectionState::Idle);
    }
}
