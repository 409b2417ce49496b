//! Control plane: command envelopes from a queue, routed to named handlers.
//!
//! Every delivery is acknowledged before it is looked at, so nothing is ever
//! redelivered. Malformed envelopes, unknown commands and handler faults are
//! only logged. The reserved `stop` command flips the shared [`RunFlag`].

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::mpsc;

use crate::callsite;
use crate::contract::{CommandHandler, ControlQueue, Delivery};
use crate::dedup_log::{DedupLogger, LogEvent, LogLevel};
use crate::error::{Result, SyncError};

pub const STOP_COMMAND: &str = "stop";

/// `<store>.<service>.control`
pub fn control_queue_name(store: &str, service: &str) -> String {
    format!("{store}.{service}.control")
}

/// A command name plus the whole envelope it arrived in.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlCommand {
    name: String,
    envelope: Map<String, Value>,
}

impl ControlCommand {
    pub fn new(name: impl Into<String>, mut envelope: Map<String, Value>) -> Self {
        let name = name.into();
        envelope.insert("cmd".to_string(), Value::String(name.clone()));
        Self { name, envelope }
    }

    /// Parses a UTF-8 JSON object with a string `cmd`.
    pub fn parse(body: &[u8]) -> std::result::Result<Self, String> {
        let text = std::str::from_utf8(body).map_err(|e| format!("body is not UTF-8: {e}"))?;
        let value: Value = serde_json::from_str(text).map_err(|e| format!("body is not JSON: {e}"))?;
        let Value::Object(envelope) = value else {
            return Err("body is not a JSON object".to_string());
        };
        let name = match envelope.get("cmd") {
            Some(Value::String(name)) => name.clone(),
            Some(other) => return Err(format!("'cmd' is not a string: {other}")),
            None => return Err("no 'cmd' key in command object".to_string()),
        };
        Ok(Self { name, envelope })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn envelope(&self) -> &Map<String, Value> {
        &self.envelope
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.envelope.get(key).and_then(Value::as_str)
    }

    /// Deserializes the envelope into a handler-specific argument type.
    pub fn args<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(Value::Object(self.envelope.clone()))
    }
}

/// Shared run flag of the service loop.
#[derive(Debug, Clone)]
pub struct RunFlag(Arc<AtomicBool>);

impl Default for RunFlag {
    fn default() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }
}

impl RunFlag {
    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Read-only map from command name to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl HandlerRegistryBuilder {
    pub fn register(mut self, name: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Result<Self> {
        let name = name.into();
        if name == STOP_COMMAND {
            return Err(SyncError::Config(format!("command name '{STOP_COMMAND}' is reserved")));
        }
        if self.handlers.contains_key(&name) {
            return Err(SyncError::Config(format!("command '{name}' registered twice")));
        }
        self.handlers.insert(name, handler);
        Ok(self)
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Stopped,
    Handled(String),
    HandlerFault(String),
    UnknownCommand(String),
    Malformed,
    AckFailed,
}

pub struct ControlPlaneDispatcher {
    registry: Arc<HandlerRegistry>,
    run_flag: RunFlag,
    logger: Arc<DedupLogger>,
}

impl ControlPlaneDispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, run_flag: RunFlag, logger: Arc<DedupLogger>) -> Self {
        Self {
            registry,
            run_flag,
            logger,
        }
    }

    pub fn run_flag(&self) -> RunFlag {
        self.run_flag.clone()
    }

    /// Pulls deliveries until the run flag clears or the queue closes.
    /// Returns how many deliveries were processed.
    pub async fn run<Q>(&self, queue: &mut Q) -> usize
    where
        Q: ControlQueue + ?Sized,
    {
        let mut processed = 0;
        while self.run_flag.is_running() {
            let Some(delivery) = queue.next().await else {
                tracing::info!(queue = %queue.name(), "Control queue closed");
                break;
            };
            self.process(queue, delivery).await;
            processed += 1;
        }
        processed
    }

    /// Acknowledges one delivery, then dispatches it.
    pub async fn process<Q>(&self, queue: &mut Q, delivery: Delivery) -> DispatchOutcome
    where
        Q: ControlQueue + ?Sized,
    {
        let source = queue.name();
        if let Err(e) = queue.ack(delivery.tag).await {
            self.logger
                .log(
                    LogEvent::new(
                        LogLevel::Error,
                        callsite!(),
                        format!("FAILED to acknowledge message from {source}, dropping it"),
                    )
                    .with_error(&e),
                )
                .await;
            return DispatchOutcome::AckFailed;
        }
        self.dispatch(&source, &delivery.body).await
    }

    pub async fn dispatch(&self, source: &str, body: &[u8]) -> DispatchOutcome {
        let command = match ControlCommand::parse(body) {
            Ok(command) => command,
            Err(reason) => {
                self.logger
                    .log(
                        LogEvent::new(
                            LogLevel::Warning,
                            callsite!(),
                            format!("Malformed control message from {source}: {reason}"),
                        )
                        .with_payload(Value::String(String::from_utf8_lossy(body).into_owned())),
                    )
                    .await;
                return DispatchOutcome::Malformed;
            }
        };

        if command.name() == STOP_COMMAND {
            self.run_flag.stop();
            self.logger
                .log(LogEvent::new(
                    LogLevel::Info,
                    callsite!(),
                    format!("Stop command received from {source}"),
                ))
                .await;
            return DispatchOutcome::Stopped;
        }

        let Some(handler) = self.registry.get(command.name()) else {
            self.logger
                .log(LogEvent::new(
                    LogLevel::Warning,
                    callsite!(),
                    format!("Unknown command '{}' received from {source}", command.name()),
                ))
                .await;
            return DispatchOutcome::UnknownCommand(command.name().to_string());
        };

        tracing::debug!(command = command.name(), source, "Dispatching control command");
        let outcome = AssertUnwindSafe(async { handler.handle(&command).await })
            .catch_unwind()
            .await;
        let name = command.name().to_string();
        match outcome {
            Ok(Ok(())) => DispatchOutcome::Handled(name),
            Ok(Err(e)) => {
                self.logger
                    .log(
                        LogEvent::new(LogLevel::Error, callsite!(), format!("Command '{name}' failed"))
                            .with_error(&*e)
                            .with_payload(Value::Object(command.envelope().clone())),
                    )
                    .await;
                DispatchOutcome::HandlerFault(name)
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                self.logger
                    .log(
                        LogEvent::new(LogLevel::Error, callsite!(), format!("Command '{name}' panicked"))
                            .with_trace(reason)
                            .with_payload(Value::Object(command.envelope().clone())),
                    )
                    .await;
                DispatchOutcome::HandlerFault(name)
            }
        }
    }
}

/// Number of acknowledged tags a [`ChannelQueue`] remembers.
pub const ACK_HISTORY: usize = 1024;

/// In-process queue over an unbounded channel. Remembers the most recent
/// [`ACK_HISTORY`] acknowledged tags.
pub struct ChannelQueue {
    name: String,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    next_tag: u64,
    acked: VecDeque<u64>,
}

impl ChannelQueue {
    pub fn new(name: impl Into<String>) -> (mpsc::UnboundedSender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            name: name.into(),
            rx,
            next_tag: 0,
            acked: VecDeque::with_capacity(ACK_HISTORY),
        };
        (tx, queue)
    }

    /// Acknowledged tags, oldest first.
    pub fn acked(&self) -> Vec<u64> {
        self.acked.iter().copied().collect()
    }
}

#[async_trait]
impl ControlQueue for ChannelQueue {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn next(&mut self) -> Option<Delivery> {
        let body = self.rx.recv().await?;
        self.next_tag += 1;
        Some(Delivery {
            tag: self.next_tag,
            body,
        })
    }

    async fn ack(&mut self, tag: u64) -> Result<()> {
        if self.acked.len() == ACK_HISTORY {
            self.acked.pop_front();
        }
        self.acked.push_back(tag);
        Ok(())
    }
}

/// Newline-delimited JSON envelopes from a reader such as stdin. Blank lines are skipped.
pub struct LineQueue<R> {
    name: String,
    lines: Lines<R>,
    next_tag: u64,
}

impl<R: AsyncBufRead + Unpin + Send> LineQueue<R> {
    pub fn new(name: impl Into<String>, reader: R) -> Self {
        Self {
            name: name.into(),
            lines: reader.lines(),
            next_tag: 0,
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> ControlQueue for LineQueue<R> {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn next(&mut self) -> Option<Delivery> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    self.next_tag += 1;
                    return Some(Delivery {
                        tag: self.next_tag,
                        body: line.into_bytes(),
                    });
                }
                Ok(None) => return None,
                Err(e) => {
                    tracing::error!(queue = %self.name, error = %e, "Failed to read control input");
                    return None;
                }
            }
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<()> {
        tracing::trace!(queue = %self.name, tag, "Acknowledged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{MockCommandHandler, MockControlQueue};
    use crate::log_store::MemoryLogStore;
    use std::time::Duration;

    fn dispatcher(registry: HandlerRegistry) -> ControlPlaneDispatcher {
        ControlPlaneDispatcher::new(
            Arc::new(registry),
            RunFlag::default(),
            Arc::new(DedupLogger::local("sync")),
        )
    }

    fn ok_handler(times: usize) -> Arc<dyn CommandHandler> {
        let mut handler = MockCommandHandler::new();
        handler.expect_handle().times(times).returning(|_| Ok(()));
        Arc::new(handler)
    }

    #[test]
    fn parses_envelopes() {
        let cmd = ControlCommand::parse(br#"{"cmd":"resync","domain":"acme"}"#).unwrap();
        assert_eq!(cmd.name(), "resync");
        assert_eq!(cmd.get_str("domain"), Some("acme"));

        assert!(ControlCommand::parse(b"[1,2]").is_err());
        assert!(ControlCommand::parse(br#"{"domain":"acme"}"#).is_err());
        assert!(ControlCommand::parse(br#"{"cmd":7}"#).is_err());
        assert!(ControlCommand::parse(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn registry_rejects_stop_and_duplicates() {
        assert!(HandlerRegistry::builder().register(STOP_COMMAND, ok_handler(0)).is_err());
        let err = HandlerRegistry::builder()
            .register("resync", ok_handler(0))
            .unwrap()
            .register("resync", ok_handler(0));
        assert!(matches!(err, Err(SyncError::Config(_))));
    }

    #[test]
    fn queue_name_follows_convention() {
        assert_eq!(control_queue_name("fm", "sync"), "fm.sync.control");
    }

    #[tokio::test]
    async fn routes_to_registered_handler() {
        let mut handler = MockCommandHandler::new();
        handler
            .expect_handle()
            .withf(|c| c.name() == "resync" && c.get_str("domain") == Some("acme"))
            .times(1)
            .returning(|_| Ok(()));
        let registry = HandlerRegistry::builder()
            .register("resync", Arc::new(handler))
            .unwrap()
            .build();
        let d = dispatcher(registry);

        let outcome = d.dispatch("q", br#"{"cmd":"resync","domain":"acme"}"#).await;
        assert_eq!(outcome, DispatchOutcome::Handled("resync".into()));
        assert!(d.run_flag().is_running());
    }

    #[tokio::test]
    async fn unknown_and_malformed_messages_are_dropped() {
        let logs = Arc::new(MemoryLogStore::default());
        let d = ControlPlaneDispatcher::new(
            Arc::new(HandlerRegistry::default()),
            RunFlag::default(),
            Arc::new(DedupLogger::new("sync", Some(logs.clone()), Duration::from_secs(60))),
        );

        assert_eq!(
            d.dispatch("q", br#"{"cmd":"explode"}"#).await,
            DispatchOutcome::UnknownCommand("explode".into())
        );
        assert_eq!(d.dispatch("q", b"not json").await, DispatchOutcome::Malformed);
        assert!(d.run_flag().is_running());

        let entries = logs.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.level == LogLevel::Warning));
        assert!(entries[1].payload.as_deref().unwrap().contains("not json"));
    }

    #[tokio::test]
    async fn handler_errors_and_panics_are_contained() {
        let mut failing = MockCommandHandler::new();
        failing
            .expect_handle()
            .returning(|_| Err("database unavailable".into()));
        let mut panicking = MockCommandHandler::new();
        panicking.expect_handle().returning(|_| panic!("handler blew up"));
        let registry = HandlerRegistry::builder()
            .register("fail", Arc::new(failing))
            .unwrap()
            .register("boom", Arc::new(panicking))
            .unwrap()
            .build();
        let d = dispatcher(registry);

        assert_eq!(
            d.dispatch("q", br#"{"cmd":"fail"}"#).await,
            DispatchOutcome::HandlerFault("fail".into())
        );
        assert_eq!(
            d.dispatch("q", br#"{"cmd":"boom"}"#).await,
            DispatchOutcome::HandlerFault("boom".into())
        );
        assert!(d.run_flag().is_running());
    }

    #[tokio::test]
    async fn stop_halts_the_loop_and_leaves_the_rest_queued() {
        let registry = HandlerRegistry::builder()
            .register("resync", ok_handler(1))
            .unwrap()
            .build();
        let d = dispatcher(registry);
        let (tx, mut queue) = ChannelQueue::new("fm.sync.control");
        tx.send(br#"{"cmd":"resync"}"#.to_vec()).unwrap();
        tx.send(br#"{"cmd":"stop"}"#.to_vec()).unwrap();
        tx.send(br#"{"cmd":"resync"}"#.to_vec()).unwrap();

        let processed = d.run(&mut queue).await;

        assert_eq!(processed, 2);
        assert!(!d.run_flag().is_running());
        assert_eq!(queue.acked(), vec![1, 2]);
        // The third envelope is still in the channel.
        assert!(queue.next().await.is_some());
    }

    #[tokio::test]
    async fn ack_history_keeps_only_recent_tags() {
        let (_tx, mut queue) = ChannelQueue::new("fm.sync.control");
        for tag in 1..=(ACK_HISTORY as u64 + 5) {
            queue.ack(tag).await.unwrap();
        }
        let acked = queue.acked();
        assert_eq!(acked.len(), ACK_HISTORY);
        assert_eq!(acked.first(), Some(&6));
        assert_eq!(acked.last(), Some(&(ACK_HISTORY as u64 + 5)));
    }

    #[tokio::test]
    async fn ack_failure_drops_the_delivery() {
        let mut queue = MockControlQueue::new();
        queue.expect_name().return_const("fm.sync.control".to_string());
        queue
            .expect_ack()
            .returning(|_| Err(SyncError::Queue("channel closed".into())));
        let d = dispatcher(HandlerRegistry::builder().register("resync", ok_handler(0)).unwrap().build());

        let outcome = d
            .process(
                &mut queue,
                Delivery {
                    tag: 9,
                    body: br#"{"cmd":"resync"}"#.to_vec(),
                },
            )
            .await;
        assert_eq!(outcome, DispatchOutcome::AckFailed);
    }

    #[tokio::test]
    async fn line_queue_reads_ndjson_until_eof() {
        let input: &[u8] = b"{\"cmd\":\"a\"}\n\n{\"cmd\":\"b\"}\n";
        let mut queue = LineQueue::new("stdin", input);

        let first = queue.next().await.unwrap();
        let second = queue.next().await.unwrap();
        assert_eq!((first.tag, second.tag), (1, 2));
        assert_eq!(second.body, br#"{"cmd":"b"}"#.to_vec());
        assert!(queue.next().await.is_none());
    }
}
