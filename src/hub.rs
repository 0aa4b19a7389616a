use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

use crate::messages::ServerMessage;

pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// Routes outbound messages to connected sessions.
///
/// A team may hold several connections; per-team sends reach all of them. Senders whose
/// receiver is gone are dropped on the next send.
#[derive(Debug, Default)]
pub struct Hub {
    clients: DashMap<String, Vec<(u64, Outbox)>>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a connection id for [`Hub::unregister`].
    pub fn register(&self, team: &str, outbox: Outbox) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients
            .entry(team.to_string())
            .or_default()
            .push((id, outbox));
        debug!(team, conn = id, "session registered");
        id
    }

    pub fn unregister(&self, team: &str, conn: u64) {
        let now_empty = match self.clients.get_mut(team) {
            Some(mut conns) => {
                conns.retain(|(id, _)| *id != conn);
                conns.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.clients.remove_if(team, |_, conns| conns.is_empty());
        }
        debug!(team, conn, "session unregistered");
    }

    /// Number of connections the message reached.
    pub fn send_to_team(&self, team: &str, msg: ServerMessage) -> usize {
        let Some(mut conns) = self.clients.get_mut(team) else {
            return 0;
        };
        conns.retain(|(_, tx)| tx.send(msg.clone()).is_ok());
        conns.len()
    }

    pub fn broadcast(&self, msg: ServerMessage) {
        for mut entry in self.clients.iter_mut() {
            entry
                .value_mut()
                .retain(|(_, tx)| tx.send(msg.clone()).is_ok());
        }
    }

    pub fn is_connected(&self, team: &str) -> bool {
        self.clients.get(team).is_some_and(|c| !c.is_empty())
    }
}
