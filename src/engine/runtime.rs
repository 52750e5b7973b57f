// src/engine/runtime.rs

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::inbox::{CommandInbox, CommandResponse};
use super::{Engine, RuntimeEvent};
use crate::errors::Result;

/// Options controlling the runtime loop.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// How often the timeline is evaluated.
    pub tick_interval: Duration,
    /// Stop once no attempt is live (used by tests and one-shot runs).
    pub exit_when_idle: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            exit_when_idle: false,
        }
    }
}

/// Async IO shell around [`Engine`].
///
/// Feeds interval ticks, agent events and queued operator commands into the
/// engine. All semantics live in the engine; this loop only decides when to
/// call it.
pub struct Runtime {
    engine: Arc<Engine>,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    inbox: Option<CommandInbox>,
    options: RuntimeOptions,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("engine", &self.engine)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(
        engine: Arc<Engine>,
        event_rx: mpsc::Receiver<RuntimeEvent>,
        options: RuntimeOptions,
    ) -> Self {
        Self {
            engine,
            event_rx,
            inbox: None,
            options,
        }
    }

    /// Execute commands queued by other processes on every tick.
    pub fn with_inbox(mut self, inbox: CommandInbox) -> Self {
        self.inbox = Some(inbox);
        self
    }

    /// Main event loop.
    ///
    /// Errors from individual ticks or events are logged and the loop keeps
    /// going; it ends on shutdown, when the event channel closes, or when
    /// idle if `exit_when_idle` is set.
    pub async fn run(mut self) -> Result<()> {
        info!(
            tick_interval_ms = self.options.tick_interval.as_millis() as u64,
            "sessionflow runtime started"
        );

        let mut interval = tokio::time::interval(self.options.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick();
                }

                event = self.event_rx.recv() => {
                    let Some(event) = event else {
                        info!("runtime event channel closed; exiting");
                        break;
                    };
                    debug!(?event, "runtime received event");
                    match event {
                        RuntimeEvent::Agent(agent_event) => {
                            if let Err(e) = self.engine.handle_agent_event(agent_event) {
                                error!(error = %e, "failed to apply agent event");
                            }
                        }
                        RuntimeEvent::Tick => self.tick(),
                        RuntimeEvent::ShutdownRequested => {
                            info!("shutdown requested; stopping runtime");
                            break;
                        }
                    }
                }
            }

            if self.options.exit_when_idle && self.engine.live_attempts() == 0 {
                info!("no live attempts; stopping runtime");
                break;
            }
        }

        info!("runtime exiting");
        Ok(())
    }

    fn tick(&self) {
        if let Some(inbox) = &self.inbox {
            self.process_inbox(inbox);
        }

        let now = self.engine.clock().now();
        match self.engine.tick(now) {
            Ok(report) => debug!(?report, "tick complete"),
            Err(e) => error!(error = %e, "tick failed"),
        }
    }

    fn process_inbox(&self, inbox: &CommandInbox) {
        let pending = match inbox.take_pending() {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "failed to read command inbox");
                return;
            }
        };

        for (id, command) in pending {
            let now = self.engine.clock().now();
            let response = match command.and_then(|c| c.execute(&self.engine, now)) {
                Ok(output) => CommandResponse::Completed(output),
                Err(e) => {
                    info!(id = %id, error = %e, "queued command rejected");
                    CommandResponse::Failed(e.to_string())
                }
            };
            if let Err(e) = inbox.respond(&id, &response) {
                warn!(id = %id, error = %e, "failed to write command response");
            }
        }
    }
}
