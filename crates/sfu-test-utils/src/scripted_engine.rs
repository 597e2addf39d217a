//! Scriptable media engine for failure-path tests.
//!
//! `ScriptedEngine` forwards every call to an inner [`LoopbackEngine`] unless
//! a script says otherwise:
//!
//! - `fail_next` fails the next call of one kind, `fail_always` every call,
//!   `fail_after` the first call after a number of successes
//! - `hang` makes calls of one kind never complete (exercises timeouts)
//! - `set_delay` slows every call down
//! - `refuse_consumption` makes `can_consume` answer `false`
//!
//! Every call is logged before the script is applied, so tests can assert
//! which engine operations a signaling flow triggered.
//!
//! # Example
//!
//! ```rust,ignore
//! let engine = Arc::new(ScriptedEngine::new());
//! engine.fail_next(EngineCall::CreateTransport, EngineError::Rejected("no ports".into()));
//! // ... run a join, expect TRANSPORT_CREATION_FAILED ...
//! assert_eq!(engine.calls(EngineCall::CreateTransport), 1);
//! ```

use async_trait::async_trait;
use serde_json::Value;
use sfu_controller::media::{
    ConsumerId, ConsumerInfo, DtlsParameters, EngineError, EngineHandle, LoopbackEngine,
    MediaEngine, MediaKind, ProducerId, RouterId, RouterInfo, RtpCapabilities, RtpParameters,
    TransportDirection, TransportId, TransportInfo,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Engine operations that can be scripted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineCall {
    CreateRouter,
    CreateTransport,
    ConnectTransport,
    CreateProducer,
    CreateConsumer,
    ResumeConsumer,
    CanConsume,
    Close,
}

#[derive(Debug, Default)]
struct Script {
    fail_next: HashMap<EngineCall, VecDeque<EngineError>>,
    fail_always: HashMap<EngineCall, EngineError>,
    /// Calls still allowed through before failing once.
    fail_after: HashMap<EngineCall, (usize, EngineError)>,
    hang: HashSet<EngineCall>,
    delay: Option<Duration>,
    refuse_consumption: bool,
    log: Vec<EngineCall>,
}

impl Script {
    /// Advance the `fail_after` countdown for `call`.
    fn countdown(&mut self, call: EngineCall) -> Option<EngineError> {
        let remaining = &mut self.fail_after.get_mut(&call)?.0;
        if *remaining > 0 {
            *remaining -= 1;
            return None;
        }
        self.fail_after.remove(&call).map(|(_, error)| error)
    }
}

/// What to do with a call after consulting the script.
enum Outcome {
    Forward,
    Fail(EngineError),
    Hang,
}

/// Media engine wrapper with injectable failures.
#[derive(Default)]
pub struct ScriptedEngine {
    inner: LoopbackEngine,
    script: Mutex<Script>,
}

impl ScriptedEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a configured loopback engine.
    #[must_use]
    pub fn with_loopback(inner: LoopbackEngine) -> Self {
        Self {
            inner,
            script: Mutex::new(Script::default()),
        }
    }

    /// The wrapped engine, for resource inspection.
    #[must_use]
    pub fn loopback(&self) -> &LoopbackEngine {
        &self.inner
    }

    /// Fail the next call of `call` with `error`. Queues up if called twice.
    pub fn fail_next(&self, call: EngineCall, error: EngineError) {
        self.script()
            .fail_next
            .entry(call)
            .or_default()
            .push_back(error);
    }

    /// Fail every call of `call` with `error` until `clear`.
    pub fn fail_always(&self, call: EngineCall, error: EngineError) {
        self.script().fail_always.insert(call, error);
    }

    /// Let `successes` calls of `call` through, then fail the next one.
    pub fn fail_after(&self, call: EngineCall, successes: usize, error: EngineError) {
        self.script().fail_after.insert(call, (successes, error));
    }

    /// Never complete calls of `call` until `clear`.
    pub fn hang(&self, call: EngineCall) {
        self.script().hang.insert(call);
    }

    /// Delay every call by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.script().delay = Some(delay);
    }

    /// Make `can_consume` answer `false` for every producer.
    pub fn refuse_consumption(&self) {
        self.script().refuse_consumption = true;
    }

    /// Drop every scripted behaviour (the call log is kept).
    pub fn clear(&self) {
        let mut script = self.script();
        script.fail_next.clear();
        script.fail_always.clear();
        script.fail_after.clear();
        script.hang.clear();
        script.delay = None;
        script.refuse_consumption = false;
    }

    /// Number of calls of `call` made so far.
    #[must_use]
    pub fn calls(&self, call: EngineCall) -> usize {
        self.script().log.iter().filter(|c| **c == call).count()
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn call_log(&self) -> Vec<EngineCall> {
        self.script().log.clone()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Log `call` and apply the script. The lock is released before any
    /// awaiting happens.
    async fn enter(&self, call: EngineCall) -> Result<(), EngineError> {
        let (outcome, delay) = {
            let mut script = self.script();
            script.log.push(call);

            let outcome = if script.hang.contains(&call) {
                Outcome::Hang
            } else if let Some(error) = script
                .fail_next
                .get_mut(&call)
                .and_then(VecDeque::pop_front)
            {
                Outcome::Fail(error)
            } else if let Some(error) = script.countdown(call) {
                Outcome::Fail(error)
            } else if let Some(error) = script.fail_always.get(&call) {
                Outcome::Fail(error.clone())
            } else {
                Outcome::Forward
            };
            (outcome, script.delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match outcome {
            Outcome::Forward => Ok(()),
            Outcome::Fail(error) => Err(error),
            Outcome::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl MediaEngine for ScriptedEngine {
    async fn create_router(&self) -> Result<RouterInfo, EngineError> {
        self.enter(EngineCall::CreateRouter).await?;
        self.inner.create_router().await
    }

    async fn create_transport(
        &self,
        router: &RouterId,
        direction: TransportDirection,
    ) -> Result<TransportInfo, EngineError> {
        self.enter(EngineCall::CreateTransport).await?;
        self.inner.create_transport(router, direction).await
    }

    async fn connect_transport(
        &self,
        transport: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError> {
        self.enter(EngineCall::ConnectTransport).await?;
        self.inner.connect_transport(transport, dtls_parameters).await
    }

    async fn create_producer(
        &self,
        transport: &TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
        app_data: &Value,
    ) -> Result<ProducerId, EngineError> {
        self.enter(EngineCall::CreateProducer).await?;
        self.inner
            .create_producer(transport, kind, rtp_parameters, app_data)
            .await
    }

    async fn create_consumer(
        &self,
        transport: &TransportId,
        producer: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerInfo, EngineError> {
        self.enter(EngineCall::CreateConsumer).await?;
        self.inner
            .create_consumer(transport, producer, rtp_capabilities, paused)
            .await
    }

    async fn resume_consumer(&self, consumer: &ConsumerId) -> Result<(), EngineError> {
        self.enter(EngineCall::ResumeConsumer).await?;
        self.inner.resume_consumer(consumer).await
    }

    async fn can_consume(
        &self,
        producer: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError> {
        self.enter(EngineCall::CanConsume).await?;
        let refused = self.script().refuse_consumption;
        if refused {
            return Ok(false);
        }
        self.inner.can_consume(producer, rtp_capabilities).await
    }

    async fn close(&self, handle: EngineHandle) -> Result<(), EngineError> {
        self.enter(EngineCall::Close).await?;
        self.inner.close(handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[tokio::test]
    async fn test_fail_next_fails_once() {
        let engine = ScriptedEngine::new();
        engine.fail_next(
            EngineCall::CreateRouter,
            EngineError::Unavailable("worker restarting".to_string()),
        );

        assert!(engine.create_router().await.is_err());
        assert!(engine.create_router().await.is_ok());
        assert_eq!(engine.calls(EngineCall::CreateRouter), 2);
        assert_eq!(engine.loopback().resource_counts().await.routers, 1);
    }

    #[tokio::test]
    async fn test_refuse_consumption() {
        let engine = ScriptedEngine::new();
        let router = engine.create_router().await.unwrap();
        let send = engine
            .create_transport(&router.id, TransportDirection::Send)
            .await
            .unwrap();
        let producer = engine
            .create_producer(
                &send.id,
                MediaKind::Audio,
                &fixtures::opus_parameters(),
                &Value::Null,
            )
            .await
            .unwrap();

        let caps = fixtures::device_capabilities();
        assert!(engine.can_consume(&producer, &caps).await.unwrap());

        engine.refuse_consumption();
        assert!(!engine.can_consume(&producer, &caps).await.unwrap());

        engine.clear();
        assert!(engine.can_consume(&producer, &caps).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_never_completes() {
        let engine = ScriptedEngine::new();
        engine.hang(EngineCall::CreateRouter);

        let result =
            tokio::time::timeout(Duration::from_secs(60), engine.create_router()).await;
        assert!(result.is_err());
        assert_eq!(engine.call_log(), vec![EngineCall::CreateRouter]);
    }
}
