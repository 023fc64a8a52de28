//! Session table and admin arbitration.
//!
//! Both live in one struct behind one mutex so that handshake, disconnect,
//! eviction and admin transitions never observe each other half-done.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::protocol::{SessionId, HANDSHAKE_SESSION};

/// Rolling reply-latency statistics of one session, times in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub reply_count: u64,
    pub min_reply_time: Option<f64>,
    pub max_reply_time: Option<f64>,
    pub total_reply_time: f64,
    pub total_reply_time_sq: f64,
    pub last_reply_at: Option<DateTime<Utc>>,
}

impl LatencyStats {
    fn record(&mut self, latency: Duration) {
        let secs = latency.as_secs_f64();
        self.reply_count += 1;
        self.total_reply_time += secs;
        self.total_reply_time_sq += secs * secs;
        self.min_reply_time = Some(self.min_reply_time.map_or(secs, |m| m.min(secs)));
        self.max_reply_time = Some(self.max_reply_time.map_or(secs, |m| m.max(secs)));
        self.last_reply_at = Some(Utc::now());
    }

    /// Mean reply time, if any reply was recorded.
    pub fn mean(&self) -> Option<f64> {
        (self.reply_count > 0).then(|| self.total_reply_time / self.reply_count as f64)
    }
}

/// What `^stats` returns.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub id: SessionId,
    pub name: String,
    pub connected_at: DateTime<Utc>,
    #[serde(flatten)]
    pub latency: LatencyStats,
}

#[derive(Debug)]
struct Session {
    name: String,
    connected_at: DateTime<Utc>,
    latency: LatencyStats,
    budget: Duration,
}

/// Who may call admin-gated capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminSlot {
    Free,
    HeldBy(SessionId),
}

/// Successful admin transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminGrant {
    Granted,
    AlreadyHeld,
    Forced { previous: SessionId },
    Released,
}

impl AdminGrant {
    pub fn message(&self) -> String {
        match self {
            AdminGrant::Granted => "admin granted".to_string(),
            AdminGrant::AlreadyHeld => "already admin".to_string(),
            AdminGrant::Forced { previous } => format!("forced admin from session {previous}"),
            AdminGrant::Released => "admin released".to_string(),
        }
    }
}

/// Refused admin transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdminRefusal {
    #[error("admin already held by session {0}")]
    HeldByOther(SessionId),
    #[error("not admin")]
    NotAdmin,
}

#[derive(Debug)]
pub(crate) struct SessionTable {
    sessions: BTreeMap<SessionId, Session>,
    next_id: SessionId,
    admin: AdminSlot,
    budget: Duration,
}

impl SessionTable {
    pub(crate) fn new(budget: Duration) -> Self {
        Self {
            sessions: BTreeMap::new(),
            next_id: HANDSHAKE_SESSION + 1,
            admin: AdminSlot::Free,
            budget,
        }
    }

    /// Register a new session. Ids are never reused, even across restarts of
    /// the listener.
    pub(crate) fn open(&mut self, name: Option<String>) -> SessionId {
        let id = self.next_id;
        self.next_id += 1;
        let session = Session {
            name: name.unwrap_or_else(|| format!("#{id}")),
            connected_at: Utc::now(),
            latency: LatencyStats::default(),
            budget: self.budget,
        };
        self.sessions.insert(id, session);
        id
    }

    /// Remove a session, freeing the admin slot if it held it.
    pub(crate) fn close(&mut self, id: SessionId) -> bool {
        let removed = self.sessions.remove(&id).is_some();
        if self.admin == AdminSlot::HeldBy(id) {
            self.admin = AdminSlot::Free;
        }
        removed
    }

    pub(crate) fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn name(&self, id: SessionId) -> Option<&str> {
        self.sessions.get(&id).map(|s| s.name.as_str())
    }

    /// Refill a session's liveness budget. Returns false for unknown ids.
    pub(crate) fn touch(&mut self, id: SessionId) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) => {
                session.budget = self.budget;
                true
            }
            None => false,
        }
    }

    /// Drain `elapsed` from every budget and evict the sessions that ran out.
    pub(crate) fn drain(&mut self, elapsed: Duration) -> Vec<SessionId> {
        let mut evicted = Vec::new();
        for (id, session) in self.sessions.iter_mut() {
            session.budget = session.budget.saturating_sub(elapsed);
            if session.budget.is_zero() {
                evicted.push(*id);
            }
        }
        for id in &evicted {
            self.close(*id);
        }
        evicted
    }

    pub(crate) fn record_latency(&mut self, id: SessionId, latency: Duration) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.latency.record(latency);
        }
    }

    pub(crate) fn stats(&self, id: SessionId) -> Option<SessionStats> {
        self.sessions.get(&id).map(|session| SessionStats {
            id,
            name: session.name.clone(),
            connected_at: session.connected_at,
            latency: session.latency.clone(),
        })
    }

    pub(crate) fn admin(&self) -> AdminSlot {
        self.admin
    }

    pub(crate) fn is_admin(&self, id: SessionId) -> bool {
        self.admin == AdminSlot::HeldBy(id)
    }

    pub(crate) fn request_admin(
        &mut self,
        id: SessionId,
        force: bool,
    ) -> Result<AdminGrant, AdminRefusal> {
        match self.admin {
            AdminSlot::Free => {
                self.admin = AdminSlot::HeldBy(id);
                Ok(AdminGrant::Granted)
            }
            AdminSlot::HeldBy(holder) if holder == id => Ok(AdminGrant::AlreadyHeld),
            AdminSlot::HeldBy(holder) if force => {
                self.admin = AdminSlot::HeldBy(id);
                Ok(AdminGrant::Forced { previous: holder })
            }
            AdminSlot::HeldBy(holder) => Err(AdminRefusal::HeldByOther(holder)),
        }
    }

    pub(crate) fn release_admin(&mut self, id: SessionId) -> Result<AdminGrant, AdminRefusal> {
        if self.admin == AdminSlot::HeldBy(id) {
            self.admin = AdminSlot::Free;
            Ok(AdminGrant::Released)
        } else {
            Err(AdminRefusal::NotAdmin)
        }
    }

    /// Drop every session and free the admin slot. The id counter keeps going.
    pub(crate) fn clear(&mut self) {
        self.sessions.clear();
        self.admin = AdminSlot::Free;
    }
}
