//! Session registry
//!
//! Owns every live session, the transport factory and the task tracker all
//! background work is spawned on.

use chrono::{DateTime, Utc};
use relay_protocol::{MemberId, ServerMessage, SessionId, StatsData};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::{fanout, Member, Session};
use crate::error::{RelayError, Result};
use crate::transport::{Transport, TransportContext, TransportEvents, TransportFactory};

pub struct Registry {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    transports: Arc<dyn TransportFactory>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    started_at: DateTime<Utc>,
}

impl Registry {
    pub fn new(transports: Arc<dyn TransportFactory>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            transports,
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            started_at: Utc::now(),
        }
    }

    /// Get the open session for `session_id`, creating it if needed
    ///
    /// A registered session that was closed by its last leave is replaced.
    pub async fn ensure(&self, session_id: &SessionId) -> Arc<Session> {
        let mut sessions = self.sessions.lock().await;

        if let Some(session) = sessions.get(session_id) {
            if !session.is_closed().await {
                return session.clone();
            }
        }

        let session = Arc::new(Session::new(session_id.clone()));
        sessions.insert(session_id.clone(), session.clone());
        tracing::info!("Created session {}", session_id);

        session
    }

    pub async fn get(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Drop `session` from the registry if it is still registered and empty
    pub async fn remove_if_empty(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.lock().await;

        let registered = sessions
            .get(session.id())
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if !registered || !session.close_if_empty().await {
            return false;
        }

        sessions.remove(session.id());
        tracing::info!("Removed empty session {}", session.id());
        true
    }

    pub async fn find_member(
        &self,
        session_id: &SessionId,
        member_id: &MemberId,
    ) -> Option<Arc<Member>> {
        self.get(session_id).await?.get_member(member_id).await
    }

    /// New member bound to a signaling connection; not yet in any session
    pub fn create_member(
        &self,
        session_id: SessionId,
        member_id: MemberId,
        connection_id: Uuid,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) -> Arc<Member> {
        Arc::new(Member::new(
            session_id,
            member_id,
            connection_id,
            sender,
            self.shutdown.child_token(),
        ))
    }

    /// Open a new transport generation for `member`
    pub async fn open_transport(
        &self,
        member: &Arc<Member>,
    ) -> Result<(Arc<dyn Transport>, TransportEvents, CancellationToken)> {
        let cancel = member.transport_token();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let ctx = TransportContext {
            session_id: member.session_id().clone(),
            member_id: member.id().clone(),
            events: events_tx,
            cancel: cancel.clone(),
            tasks: self.tasks.clone(),
        };

        let transport = self
            .transports
            .connect(ctx)
            .await
            .map_err(RelayError::NegotiationFailure)?;

        Ok((transport, events_rx, cancel))
    }

    /// Add `member` to its session and start relaying its transport events
    pub async fn join(self: &Arc<Self>, member: &Arc<Member>) -> Result<Arc<Session>> {
        loop {
            let session = self.ensure(member.session_id()).await;
            match session.add_member(member.clone()).await {
                Ok(()) => {
                    member.mark_joined();
                    self.start_fanout(member, session.clone()).await;
                    return Ok(session);
                }
                Err(RelayError::SessionClosed(id)) => {
                    tracing::debug!("Session {} closed while joining, retrying", id);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Spawn the fanout task for the member's current transport
    pub async fn start_fanout(self: &Arc<Self>, member: &Arc<Member>, session: Arc<Session>) {
        let Some((events, cancel)) = member.take_events().await else {
            tracing::debug!("Fanout of member {} already running", member.id());
            return;
        };

        self.tasks.spawn(fanout::run(
            self.clone(),
            session,
            member.clone(),
            events,
            cancel,
        ));
    }

    /// Deliver every source already published in `session` to `member`
    pub async fn share_sources(&self, session: &Session, member: &Member) -> usize {
        let mut sources = Vec::new();
        for other in session.members().await {
            if other.id() != member.id() {
                sources.extend(other.sources().await);
            }
        }
        member.receive_sources(&sources).await
    }

    /// Bring a reconnected member's new transport into its session
    ///
    /// Other members forget what they received from the old transport before
    /// the new one's fanout starts, so its sources are delivered again.
    pub async fn rejoin(self: &Arc<Self>, member: &Arc<Member>) -> Result<Arc<Session>> {
        let session = self
            .get(member.session_id())
            .await
            .ok_or_else(|| RelayError::SessionNotFound(member.session_id().clone()))?;

        session
            .broadcast(member.id(), |other| {
                let publisher = member.id().clone();
                async move { other.forget_publisher(&publisher).await }
            })
            .await;

        self.start_fanout(member, session.clone()).await;
        Ok(session)
    }

    /// Tear a member down; only the first call for a member has any effect
    pub async fn remove_member(&self, member: &Arc<Member>) -> bool {
        if !member.mark_removed() {
            return false;
        }

        member.shutdown().await;

        let Some(session) = self.get(member.session_id()).await else {
            tracing::debug!("Member {} left before joining a session", member.id());
            return true;
        };

        let Some(removal) = session.remove_exact(member).await else {
            return true;
        };

        let notice = ServerMessage::MemberLeft {
            member_id: member.id().clone(),
        };
        session.notify(member.id(), &notice).await;

        if removal.now_empty {
            self.remove_if_empty(&session).await;
        }

        true
    }

    pub async fn stats(&self) -> StatsData {
        let sessions: Vec<_> = self.sessions.lock().await.values().cloned().collect();

        let mut members = 0;
        for session in &sessions {
            members += session.member_count().await;
        }

        StatsData {
            sessions: sessions.len(),
            members,
            tasks: self.tasks.len(),
            started_at: self.started_at,
        }
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Token cancelled when the registry shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Remove every member and wait for all background tasks to finish
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down relay");

        let sessions: Vec<_> = self.sessions.lock().await.values().cloned().collect();
        for session in sessions {
            for member in session.members().await {
                self.remove_member(&member).await;
            }
        }

        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        tracing::info!("Relay stopped");
    }
}
