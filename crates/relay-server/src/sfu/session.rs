//! Session: a named group of members whose media is relayed to each other

use relay_protocol::{MediaKind, MemberId, ServerMessage, SessionId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::Member;
use crate::error::{RelayError, Result};

#[derive(Default)]
struct Membership {
    members: HashMap<MemberId, Arc<Member>>,
    /// Set when the last member left; a closed session accepts no joins
    closed: bool,
}

/// Outcome of removing a member
pub struct Removal {
    /// The session has no members left and was closed
    pub now_empty: bool,
}

pub struct Session {
    id: SessionId,
    /// Guards membership; broadcasts iterate a snapshot taken under it
    membership: Mutex<Membership>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            membership: Mutex::new(Membership::default()),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Add a member
    ///
    /// Fails with `AlreadyMember` when the id is taken and with
    /// `SessionClosed` when the session was already reclaimed.
    pub async fn add_member(&self, member: Arc<Member>) -> Result<()> {
        let mut membership = self.membership.lock().await;

        if membership.closed {
            return Err(RelayError::SessionClosed(self.id.clone()));
        }

        if membership.members.contains_key(member.id()) {
            return Err(RelayError::AlreadyMember {
                session_id: self.id.clone(),
                member_id: member.id().clone(),
            });
        }

        tracing::info!(
            "Member {} joined session {} ({} members)",
            member.id(),
            self.id,
            membership.members.len() + 1
        );
        membership.members.insert(member.id().clone(), member);

        Ok(())
    }

    /// Remove a member by id; `None` if it was not present
    pub async fn remove_member(&self, member_id: &MemberId) -> Option<Removal> {
        self.remove_where(member_id, |_| true).await
    }

    /// Remove exactly this member instance, leaving a namesake untouched
    pub async fn remove_exact(&self, member: &Arc<Member>) -> Option<Removal> {
        self.remove_where(member.id(), |current| Arc::ptr_eq(current, member))
            .await
    }

    async fn remove_where<F>(&self, member_id: &MemberId, matches: F) -> Option<Removal>
    where
        F: FnOnce(&Arc<Member>) -> bool,
    {
        let mut membership = self.membership.lock().await;

        if !membership.members.get(member_id).is_some_and(matches) {
            return None;
        }
        membership.members.remove(member_id)?;

        let now_empty = membership.members.is_empty();
        if now_empty {
            membership.closed = true;
        }

        tracing::info!(
            "Member {} left session {} ({} members)",
            member_id,
            self.id,
            membership.members.len()
        );

        Some(Removal { now_empty })
    }

    /// Close the session if it has no members; returns whether it is closed
    pub async fn close_if_empty(&self) -> bool {
        let mut membership = self.membership.lock().await;
        if membership.members.is_empty() {
            membership.closed = true;
        }
        membership.closed
    }

    pub async fn is_closed(&self) -> bool {
        self.membership.lock().await.closed
    }

    pub async fn get_member(&self, member_id: &MemberId) -> Option<Arc<Member>> {
        self.membership.lock().await.members.get(member_id).cloned()
    }

    /// Snapshot of all members, ordered by id
    pub async fn members(&self) -> Vec<Arc<Member>> {
        let mut members: Vec<_> = self
            .membership
            .lock()
            .await
            .members
            .values()
            .cloned()
            .collect();
        members.sort_by(|a, b| a.id().cmp(b.id()));
        members
    }

    pub async fn member_count(&self) -> usize {
        self.membership.lock().await.members.len()
    }

    /// Run `f` for every member except `exclude`
    ///
    /// The member list is snapshotted under the lock and `f` runs without
    /// it, so `f` may await network I/O. Returns the number of targets.
    pub async fn broadcast<F, Fut>(&self, exclude: &MemberId, mut f: F) -> usize
    where
        F: FnMut(Arc<Member>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let targets: Vec<_> = self
            .members()
            .await
            .into_iter()
            .filter(|member| member.id() != exclude)
            .collect();

        let count = targets.len();
        for target in targets {
            f(target).await;
        }
        count
    }

    /// Send a signaling message to every member except `exclude`
    pub async fn notify(&self, exclude: &MemberId, message: &ServerMessage) -> usize {
        self.broadcast(exclude, |member| {
            let message = message.clone();
            async move {
                member.send(message).await;
            }
        })
        .await
    }

    /// Update a member's presence flag and tell everyone else
    pub async fn set_presence(
        &self,
        member_id: &MemberId,
        kind: MediaKind,
        enabled: bool,
    ) -> Result<()> {
        let member = self
            .get_member(member_id)
            .await
            .ok_or_else(|| RelayError::MemberNotFound(member_id.clone()))?;
        self.apply_presence(member, kind, enabled).await;
        Ok(())
    }

    /// Like [`Session::set_presence`], but only for this member instance
    ///
    /// A removed member whose id was taken over by a newer member fails with
    /// `MemberNotFound` instead of changing its successor.
    pub async fn set_member_presence(
        &self,
        member: &Arc<Member>,
        kind: MediaKind,
        enabled: bool,
    ) -> Result<()> {
        let current = self
            .get_member(member.id())
            .await
            .filter(|current| Arc::ptr_eq(current, member))
            .ok_or_else(|| RelayError::MemberNotFound(member.id().clone()))?;
        self.apply_presence(current, kind, enabled).await;
        Ok(())
    }

    async fn apply_presence(&self, member: Arc<Member>, kind: MediaKind, enabled: bool) {
        member.set_presence(kind, enabled).await;

        let member_id = member.id();
        let message = match kind {
            MediaKind::Video => ServerMessage::ToggleVideo {
                member_id: member_id.clone(),
                enabled,
            },
            MediaKind::Audio => ServerMessage::ToggleAudio {
                member_id: member_id.clone(),
                enabled,
            },
        };
        let notified = self.notify(member_id, &message).await;

        tracing::debug!(
            "Member {} set {} to {} in session {}, notified {} members",
            member_id,
            kind,
            enabled,
            self.id,
            notified
        );
    }
}
