use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{sleep, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    controller::{AutoBookingController, DISABLED_STATUS},
    error::RadarError,
    geo::Coordinate,
    markers::MapMarkers,
    session::{RadarState, Session, Update},
};

const COMMAND_BUFFER: usize = 16;

/// What a session task publishes after every tick or command.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub status: String,
    pub state: RadarState,
    pub markers: Option<MapMarkers>,
    pub at: DateTime<Utc>,
}

enum Command {
    SetCenter(Coordinate),
    SetRadius(u32, oneshot::Sender<Result<(), RadarError>>),
    Enable(oneshot::Sender<Result<(), RadarError>>),
    Disable,
    Current(oneshot::Sender<Session>),
}

struct SessionHandle {
    commands: mpsc::Sender<Command>,
    reports: watch::Receiver<TickReport>,
    task: JoinHandle<()>,
}

// Owns one session and drives it tick by tick. A tick is awaited to the end
// before the timer is re-armed, so ticks of a session never overlap.
struct SessionTask {
    controller: Arc<AutoBookingController>,
    session: Session,
    markers: Option<MapMarkers>,
    reports: watch::Sender<TickReport>,
}

impl SessionTask {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let interval = self.controller.config().tick_interval;
        let timer = sleep(interval);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("command channel closed, session task exiting");
                        break;
                    };
                    if self.handle(command) {
                        timer.as_mut().reset(Instant::now());
                    }
                }
                () = &mut timer => {
                    self.tick().await;
                    timer.as_mut().reset(Instant::now() + interval);
                }
            }
        }
    }

    // Returns true when a tick should run right away.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::SetCenter(center) => {
                self.session.set_center(center);
                debug!(?center, "search centre updated");
                false
            }
            Command::SetRadius(radius, reply) => {
                let result = self.session.set_radius(radius, self.controller.config());
                let _ = reply.send(result);
                false
            }
            Command::Enable(reply) => match self.controller.enable(&self.session, Utc::now()) {
                Ok(session) => {
                    self.session = session;
                    self.publish(self.session.last_status.clone().unwrap_or_default());
                    let _ = reply.send(Ok(()));
                    true
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    false
                }
            },
            Command::Disable => {
                self.session = self.controller.disable(&self.session);
                self.publish(DISABLED_STATUS.to_string());
                false
            }
            Command::Current(reply) => {
                let _ = reply.send(self.session.clone());
                false
            }
        }
    }

    async fn tick(&mut self) {
        let outcome = self.controller.tick(&self.session).await;
        outcome.session.apply(&mut self.session);
        if let Update::Updated(markers) = outcome.markers {
            self.markers = Some(markers);
        }
        self.publish(outcome.status);
    }

    fn publish(&self, status: String) {
        self.reports.send_replace(TickReport {
            status,
            state: self.session.state(),
            markers: self.markers.clone(),
            at: Utc::now(),
        });
    }
}

/// Runs the auto-booking loop for any number of sessions, one task each.
pub struct RadarScheduler {
    controller: Arc<AutoBookingController>,
    sessions: DashMap<String, SessionHandle>,
}

impl RadarScheduler {
    pub fn new(controller: Arc<AutoBookingController>) -> Self {
        Self {
            controller,
            sessions: DashMap::new(),
        }
    }

    /// Spawns the task for `id`. A task already running under the same id is
    /// retired first, so two tasks never drive one session.
    pub async fn start(
        &self,
        id: impl Into<String>,
        session: Session,
    ) -> watch::Receiver<TickReport> {
        let id = id.into();
        if let Some((_, previous)) = self.sessions.remove(&id) {
            warn!(session_id = %id, "replacing running session task");
            retire(&id, previous).await;
        }

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (reports_tx, reports_rx) = watch::channel(TickReport {
            status: session
                .last_status
                .clone()
                .unwrap_or_else(|| DISABLED_STATUS.to_string()),
            state: session.state(),
            markers: None,
            at: Utc::now(),
        });

        let task = SessionTask {
            controller: self.controller.clone(),
            session,
            markers: None,
            reports: reports_tx,
        };
        let task = tokio::spawn(task.run(commands_rx));

        info!(session_id = %id, "session task started");
        self.sessions.insert(
            id,
            SessionHandle {
                commands: commands_tx,
                reports: reports_rx.clone(),
                task,
            },
        );
        reports_rx
    }

    pub async fn enable(&self, id: &str) -> Result<(), RadarError> {
        let (tx, rx) = oneshot::channel();
        self.send(id, Command::Enable(tx)).await?;
        rx.await.map_err(|_| gone(id))?
    }

    pub async fn disable(&self, id: &str) -> Result<(), RadarError> {
        self.send(id, Command::Disable).await
    }

    pub async fn set_center(&self, id: &str, center: Coordinate) -> Result<(), RadarError> {
        self.send(id, Command::SetCenter(center)).await
    }

    pub async fn set_radius(&self, id: &str, radius: u32) -> Result<(), RadarError> {
        let (tx, rx) = oneshot::channel();
        self.send(id, Command::SetRadius(radius, tx)).await?;
        rx.await.map_err(|_| gone(id))?
    }

    pub async fn current(&self, id: &str) -> Result<Session, RadarError> {
        let (tx, rx) = oneshot::channel();
        self.send(id, Command::Current(tx)).await?;
        rx.await.map_err(|_| gone(id))
    }

    pub fn subscribe(&self, id: &str) -> Result<watch::Receiver<TickReport>, RadarError> {
        self.sessions
            .get(id)
            .map(|handle| handle.reports.clone())
            .ok_or_else(|| unknown(id))
    }

    /// Ends the task for `id` at the next tick boundary and waits for it.
    pub async fn stop(&self, id: &str) -> bool {
        match self.sessions.remove(id) {
            Some((id, handle)) => {
                retire(&id, handle).await;
                info!(session_id = %id, "session task stopped");
                true
            }
            None => false,
        }
    }

    /// Closes every session's command channel and waits for the tasks to end.
    /// A tick in flight is allowed to finish.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let handles: Vec<(String, SessionHandle)> = ids
            .iter()
            .filter_map(|id| self.sessions.remove(id))
            .collect();

        info!(sessions = handles.len(), "shutting down session tasks");
        join_all(
            handles
                .into_iter()
                .map(|(id, handle)| async move { retire(&id, handle).await }),
        )
        .await;
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    async fn send(&self, id: &str, command: Command) -> Result<(), RadarError> {
        // clone the sender so no map guard is held across the await
        let commands = self
            .sessions
            .get(id)
            .map(|handle| handle.commands.clone())
            .ok_or_else(|| unknown(id))?;
        commands.send(command).await.map_err(|_| gone(id))
    }
}

// Dropping the sender closes the command channel; the task leaves its loop
// once the tick in flight, if any, has finished.
async fn retire(id: &str, handle: SessionHandle) {
    let SessionHandle { commands, task, .. } = handle;
    drop(commands);
    if let Err(e) = task.await {
        warn!(session_id = %id, error = %e, "session task ended abnormally");
    }
}

fn unknown(id: &str) -> RadarError {
    RadarError::Validation(format!("Unknown session {id}"))
}

fn gone(id: &str) -> RadarError {
    RadarError::Validation(format!("Session {id} is no longer running"))
}
