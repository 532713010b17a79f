pub mod auditor;
pub mod board;
pub mod ledger;
pub mod scheduler;
pub mod selections;
pub mod session;
pub mod timers;

use std::{sync::Arc, time::SystemTime};

use axum::extract::ws::Message;
use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::{
    dao::persistence::PersistenceEngine,
    dto::{health::SummaryResponse, ws::ServerMessage},
    services::persistence_worker::{self, PersistenceQueue},
    state::{
        ledger::AccountId,
        scheduler::ConnectionId,
        session::{Audience, GameSession, Outcome, SessionError, TurnCommand},
        timers::{TaskKey, TaskRegistry},
    },
};

/// Shared handle passed to routes and services.
pub type SharedState = Arc<AppState>;

#[derive(Clone)]
/// Handle used to push messages to a connected client.
pub struct ClientConnection {
    /// Registry key.
    pub id: ConnectionId,
    /// Account bound after a successful login.
    pub account: Option<AccountId>,
    /// Receives admin-only traffic.
    pub is_privileged: bool,
    /// Session token issued at login.
    pub token: Option<Uuid>,
    /// Writer half feeding the socket task.
    pub tx: mpsc::UnboundedSender<Message>,
}

/// Central application state: the game session, live connections and persistence.
pub struct AppState {
    session: Mutex<GameSession>,
    connections: DashMap<ConnectionId, ClientConnection>,
    persistence: Arc<PersistenceEngine>,
    writer: PersistenceQueue,
    tasks: TaskRegistry<TaskKey>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] and start its persistence worker.
    pub fn new(session: GameSession, persistence: Arc<PersistenceEngine>) -> SharedState {
        let (writer, _worker) = persistence_worker::spawn(persistence.clone());
        Arc::new(Self {
            session: Mutex::new(session),
            connections: DashMap::new(),
            persistence,
            writer,
            tasks: TaskRegistry::new(),
        })
    }

    /// Queue feeding the persistence worker.
    pub fn writer(&self) -> &PersistenceQueue {
        &self.writer
    }

    /// Delayed turn work.
    pub fn tasks(&self) -> &TaskRegistry<TaskKey> {
        &self.tasks
    }

    /// Current degraded flag.
    pub fn is_degraded(&self) -> bool {
        self.persistence.is_degraded()
    }

    /// Registry of live client sockets keyed by connection id.
    pub fn connections(&self) -> &DashMap<ConnectionId, ClientConnection> {
        &self.connections
    }

    /// Read-only access to the session for callers that do not mutate it.
    pub async fn read_session<T>(&self, read: impl FnOnce(&GameSession) -> T) -> T {
        let session = self.session.lock().await;
        read(&session)
    }

    /// Counters for the status endpoint.
    pub async fn summary(&self) -> SummaryResponse {
        self.read_session(GameSession::summary).await
    }

    /// Run one transition to completion and dispatch its outcome before the
    /// session is released to the next transition.
    pub async fn transition<T>(
        self: &Arc<Self>,
        work: impl FnOnce(&mut GameSession, SystemTime) -> (T, Outcome),
    ) -> T {
        let mut session = self.session.lock().await;
        let (value, outcome) = work(&mut session, SystemTime::now());
        self.dispatch(&session, outcome);
        value
    }

    /// [`Self::transition`] for operations that may be refused.
    pub async fn try_transition(
        self: &Arc<Self>,
        work: impl FnOnce(&mut GameSession, SystemTime) -> Result<Outcome, SessionError>,
    ) -> Result<(), SessionError> {
        self.transition(|session, now| match work(session, now) {
            Ok(outcome) => (Ok(()), outcome),
            Err(err) => (Err(err), Outcome::default()),
        })
        .await
    }

    async fn run_turn_task(self: Arc<Self>, command: TurnCommand) {
        let mut session = self.session.lock().await;
        let outcome = session.run_turn_task(command.epoch, command.action, SystemTime::now());
        if let Some(outcome) = outcome {
            self.dispatch(&session, outcome);
        }
    }

    fn dispatch(self: &Arc<Self>, session: &GameSession, outcome: Outcome) {
        let Outcome {
            messages,
            turn,
            save,
            differential,
            immediate,
        } = outcome;

        for dispatch in messages {
            self.deliver(&dispatch.audience, &dispatch.message);
        }

        if let Some(command) = turn {
            self.schedule_turn(command);
        }

        self.writer.write_now(immediate);
        if save {
            self.writer.save(session.to_document(SystemTime::now()));
        } else {
            self.writer.queue(differential);
        }
    }

    fn schedule_turn(self: &Arc<Self>, command: TurnCommand) {
        trace!(epoch = command.epoch, action = ?command.action, delay = ?command.delay, "turn task scheduled");
        let state = Arc::clone(self);
        self.tasks
            .schedule(TaskKey::Turn, command.delay, state.run_turn_task(command));
    }

    fn deliver(&self, audience: &Audience, message: &ServerMessage) {
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to serialize message `{message:?}`");
                return;
            }
        };
        for connection in self.connections.iter() {
            let wanted = match audience {
                Audience::Everyone => connection.account.is_some(),
                Audience::Account(id) => connection.account.as_deref() == Some(id.as_str()),
                Audience::Admins => connection.is_privileged,
            };
            if wanted && connection.tx.send(Message::Text(payload.clone().into())).is_err() {
                trace!(connection = %connection.id, "writer closed; message dropped");
            }
        }
    }

    /// Register a freshly opened socket.
    pub fn register_connection(&self, id: ConnectionId, tx: mpsc::UnboundedSender<Message>) {
        self.connections.insert(
            id,
            ClientConnection {
                id,
                account: None,
                is_privileged: false,
                token: None,
                tx,
            },
        );
    }

    /// Forget a socket.
    pub fn remove_connection(&self, id: &ConnectionId) -> Option<ClientConnection> {
        self.connections.remove(id).map(|(_, connection)| connection)
    }

    /// Account bound to a connection.
    pub fn connection_account(&self, id: &ConnectionId) -> Option<AccountId> {
        self.connections
            .get(id)
            .and_then(|connection| connection.account.clone())
    }

    /// Bind an authenticated account to a connection. Other connections of
    /// the same account are unregistered and handed back to the caller.
    pub fn bind_account(
        &self,
        id: ConnectionId,
        account: &AccountId,
        is_privileged: bool,
        token: Uuid,
    ) -> Vec<ClientConnection> {
        let replaced: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|connection| {
                connection.id != id && connection.account.as_ref() == Some(account)
            })
            .map(|connection| connection.id)
            .collect();
        let replaced: Vec<ClientConnection> = replaced
            .iter()
            .filter_map(|other| self.remove_connection(other))
            .collect();

        if let Some(mut connection) = self.connections.get_mut(&id) {
            connection.account = Some(account.clone());
            connection.is_privileged = is_privileged;
            connection.token = Some(token);
        }
        replaced
    }

    /// Send a message to one connection.
    pub fn send_to_connection(&self, id: &ConnectionId, message: &ServerMessage) {
        let Some(tx) = self.connections.get(id).map(|connection| connection.tx.clone()) else {
            return;
        };
        crate::services::websocket_service::send_message_to_websocket(&tx, message);
    }
}
