//! One tokio task per instrument
//!
//! The task is the single writer of its `InstrumentEngine`. Commands are
//! processed strictly in arrival order; after each event the snapshot is
//! published on a `watch` channel, so readers see either the state before or
//! after an event, never a partial one.

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::regime_core::{EngineError, EngineEvent, EngineOutput, EngineUpdate, InstrumentEngine};

use super::Notice;

/// Mailbox depth per instrument
const MAILBOX: usize = 1024;

enum Command {
    Ingest {
        event: EngineEvent,
        reply: oneshot::Sender<Result<EngineUpdate, EngineError>>,
    },
    Shutdown,
}

/// Cheap cloneable handle to a running instrument task
#[derive(Debug, Clone)]
pub struct EngineHandle {
    instrument: String,
    tx: mpsc::Sender<Command>,
    snapshot: watch::Receiver<EngineOutput>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Ingest { event, .. } => write!(f, "Ingest({})", event.kind()),
            Command::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl EngineHandle {
    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    /// Queue an event and wait for it to be processed
    pub async fn ingest(&self, event: EngineEvent) -> Result<EngineUpdate, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Ingest { event, reply })
            .await
            .map_err(|_| EngineError::EngineStopped(self.instrument.clone()))?;
        rx.await
            .map_err(|_| EngineError::EngineStopped(self.instrument.clone()))?
    }

    /// Latest published output
    pub fn snapshot(&self) -> EngineOutput {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<EngineOutput> {
        self.snapshot.clone()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

/// Start the task for `instrument`
pub fn spawn(instrument: &str, config: EngineConfig, notices: broadcast::Sender<Notice>) -> EngineHandle {
    let engine = InstrumentEngine::new(instrument, config);
    let (snapshot_tx, snapshot_rx) = watch::channel(engine.output().clone());
    let (tx, rx) = mpsc::channel(MAILBOX);

    info!("Starting engine for {}", instrument);
    tokio::spawn(run(engine, rx, snapshot_tx, notices));

    EngineHandle {
        instrument: instrument.to_string(),
        tx,
        snapshot: snapshot_rx,
    }
}

async fn run(
    mut engine: InstrumentEngine,
    mut rx: mpsc::Receiver<Command>,
    snapshot_tx: watch::Sender<EngineOutput>,
    notices: broadcast::Sender<Notice>,
) {
    while let Some(command) = rx.recv().await {
        debug!("{}: {:?}", engine.instrument(), command);
        let (event, reply) = match command {
            Command::Ingest { event, reply } => (event, reply),
            Command::Shutdown => break,
        };

        let result = engine.handle(&event);
        match &result {
            Ok(update) => {
                snapshot_tx.send_replace(update.output.clone());
                publish(&notices, update);
            }
            Err(e) if e.is_rejection() => {
                let _ = notices.send(Notice::Rejected {
                    instrument: engine.instrument().to_string(),
                    event: event.kind().to_string(),
                    reason: e.to_string(),
                });
            }
            Err(e) => error!("{}: {}", engine.instrument(), e),
        }

        // Caller may have given up waiting
        let _ = reply.send(result);
    }

    info!("Engine for {} stopped", engine.instrument());
}

fn publish(notices: &broadcast::Sender<Notice>, update: &EngineUpdate) {
    // No subscribers is fine
    for record in &update.records {
        let _ = notices.send(Notice::Transition(record.clone()));
    }
    if let Some(exit) = update.force_exit {
        let _ = notices.send(Notice::ForceExit {
            instrument: update.output.instrument.clone(),
            exit,
        });
    }
    for alarm in &update.alarms {
        let _ = notices.send(Notice::Alarm(alarm.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime_core::candle::test_support::{candle, t0};
    use crate::regime_core::levels::test_support::level_set;
    use crate::regime_core::{SessionState, Strategy, Timeframe};

    #[tokio::test]
    async fn test_ingest_publishes_snapshot_and_notices() {
        let (notices, mut rx) = broadcast::channel(64);
        let handle = spawn("NQ", EngineConfig::default(), notices);

        handle.ingest(EngineEvent::Levels(level_set(100.0, 90.0))).await.unwrap();
        // Nothing is granted before the opening lock has run out
        assert_eq!(handle.snapshot().permitted_strategy, None);

        let update = handle.ingest(EngineEvent::Clock(t0())).await.unwrap();
        assert_eq!(update.output.permitted_strategy, Some(Strategy::RangeToTriggerTransition));
        assert_eq!(handle.snapshot().permitted_strategy, Some(Strategy::RangeToTriggerTransition));

        match rx.recv().await.unwrap() {
            Notice::Transition(record) => assert_eq!(record.instrument, "NQ"),
            other => panic!("unexpected notice {:?}", other),
        }

        handle
            .ingest(EngineEvent::Candle(candle(Timeframe::M15, 0, 101.0)))
            .await
            .unwrap();
        assert_eq!(handle.snapshot().session_state, SessionState::TransitionWatch);
    }

    #[tokio::test]
    async fn test_rejection_reported_and_state_kept() {
        let (notices, mut rx) = broadcast::channel(64);
        let handle = spawn("NQ", EngineConfig::default(), notices);
        handle.ingest(EngineEvent::Levels(level_set(100.0, 90.0))).await.unwrap();
        handle.ingest(EngineEvent::Clock(t0())).await.unwrap();
        let _ = rx.recv().await;

        let mut bad = candle(Timeframe::M15, 0, 101.0);
        bad.high = 90.0;
        let err = handle.ingest(EngineEvent::Candle(bad)).await.unwrap_err();
        assert!(matches!(err, EngineError::MalformedCandle { .. }));

        match rx.recv().await.unwrap() {
            Notice::Rejected { event, .. } => assert_eq!(event, "candle"),
            other => panic!("unexpected notice {:?}", other),
        }
        assert_eq!(handle.snapshot().session_state, SessionState::Observation);
    }

    #[tokio::test]
    async fn test_stopped_engine_errors() {
        let (notices, _rx) = broadcast::channel(8);
        let handle = spawn("NQ", EngineConfig::default(), notices);
        handle.shutdown().await;

        // Give the task a chance to exit
        tokio::task::yield_now().await;
        let result = handle.ingest(EngineEvent::Levels(level_set(100.0, 90.0))).await;
        assert!(matches!(result, Err(EngineError::EngineStopped(_))));
    }
}
