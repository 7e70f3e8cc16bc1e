//! Client session bookkeeping.
//!
//! Everything mutable the gateway shares between connection tasks lives in
//! one [`Registry`] guarded by a single mutex: the connection list, the
//! key-to-socket routing map and the resume buffers.

use crate::pool::QueueKey;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use std::collections::HashMap;

use tracing::{debug, trace};

pub type ConnId = u64;

/// A registered client connection.
pub struct ConnectionHandle {
    pub id: ConnId,
    pub user_id: u64,
    /// Serialized frames for the writer task.
    pub tx: UnboundedSender<String>,
    pub resume_key: Option<String>,
    /// Seconds the resume buffer stays alive after a disconnect.
    pub resume_timeout: u64,
}

/// Frames held for a disconnected client that configured resuming.
pub struct ResumeBuffer {
    pub conn_id: ConnId,
    pub user_id: u64,
    pub events: Vec<String>,
    /// Expiry task; aborted when the client comes back.
    pub timer: Option<JoinHandle<()>>,
}

/// What the gateway must do after a connection goes away.
pub struct ClosedConnection {
    pub user_id: u64,
    /// When set, open a resume buffer under this key for this many seconds
    /// instead of destroying the user's players.
    pub resume: Option<(String, u64)>,
}

#[derive(Default)]
pub struct Registry {
    next_id: ConnId,
    connections: Vec<ConnectionHandle>,
    player_map: HashMap<QueueKey, ConnId>,
    resume_buffers: HashMap<String, ResumeBuffer>,
}

impl Registry {
    /// Registers a fresh connection, returning its id.
    pub fn register(&mut self, user_id: u64, tx: UnboundedSender<String>) -> ConnId {
        self.next_id += 1;
        let id = self.next_id;

        self.connections.push(ConnectionHandle {
            id,
            user_id,
            tx,
            resume_key: None,
            resume_timeout: crate::constants::RESUME_TIMEOUT_DEFAULT,
        });

        debug!("connection {} registered for user {}", id, user_id);

        id
    }

    /// Binds (or clears) a resume key for a connection.
    pub fn configure_resume(&mut self, id: ConnId, key: Option<String>, timeout: Option<u64>) {
        if let Some(conn) = self.connections.iter_mut().find(|conn| conn.id == id) {
            conn.resume_key = key;
            if let Some(timeout) = timeout {
                conn.resume_timeout = timeout;
            }
        }
    }

    /// Records which socket receives a key's events.
    pub fn record_route(&mut self, key: QueueKey, id: ConnId) {
        self.player_map.insert(key, id);
    }

    /// Forgets a key's route (queue destroyed or track over).
    pub fn clear_route(&mut self, key: QueueKey) {
        self.player_map.remove(&key);
    }

    /// Delivers a frame to whichever socket owns the key, or buffers it if
    /// that socket is inside its resume window.
    pub fn deliver(&mut self, key: QueueKey, frame: String) {
        let Some(&id) = self.player_map.get(&key) else {
            trace!("no route for {:?}, dropping frame", key);
            return;
        };

        if let Some(conn) = self.connections.iter().find(|conn| conn.id == id) {
            let _ = conn.tx.send(frame);
        } else if let Some(buffer) = self
            .resume_buffers
            .values_mut()
            .find(|buffer| buffer.conn_id == id)
        {
            buffer.events.push(frame);
        }
    }

    /// Pushes a frame to every connected client.
    pub fn broadcast(&self, frame: &str) {
        for conn in &self.connections {
            let _ = conn.tx.send(frame.to_owned());
        }
    }

    /// Removes a connection, reporting what cleanup it needs.
    pub fn close(&mut self, id: ConnId) -> Option<ClosedConnection> {
        let index = self.connections.iter().position(|conn| conn.id == id)?;
        let conn = self.connections.remove(index);

        Some(ClosedConnection {
            user_id: conn.user_id,
            resume: conn.resume_key.map(|key| (key, conn.resume_timeout)),
        })
    }

    /// Opens a resume buffer for a closed connection.
    pub fn open_buffer(
        &mut self,
        resume_key: String,
        conn_id: ConnId,
        user_id: u64,
        timer: JoinHandle<()>,
    ) {
        self.resume_buffers.insert(
            resume_key,
            ResumeBuffer {
                conn_id,
                user_id,
                events: Vec::new(),
                timer: Some(timer),
            },
        );
    }

    /// Claims a resume buffer, cancelling its expiry timer. The caller
    /// replays the events and re-binds the routes.
    pub fn take_buffer(&mut self, resume_key: &str) -> Option<ResumeBuffer> {
        let mut buffer = self.resume_buffers.remove(resume_key)?;

        if let Some(timer) = buffer.timer.take() {
            timer.abort();
        }

        Some(buffer)
    }

    /// Drops a buffer without replay (expiry).
    pub fn expire_buffer(&mut self, resume_key: &str) -> Option<ResumeBuffer> {
        self.resume_buffers.remove(resume_key)
    }

    /// Points every route of `old` at `new` (resume takeover).
    pub fn adopt_routes(&mut self, old: ConnId, new: ConnId) {
        for id in self.player_map.values_mut() {
            if *id == old {
                *id = new;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc;

    #[tokio::test]
    async fn delivery_follows_routes() {
        let mut registry = Registry::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let id = registry.register(42, tx);
        registry.record_route((42, 100), id);

        registry.deliver((42, 100), String::from("a"));
        registry.deliver((42, 999), String::from("dropped"));

        assert_eq!(rx.try_recv().unwrap(), "a");
        assert!(rx.try_recv().is_err());

        registry.clear_route((42, 100));
        registry.deliver((42, 100), String::from("late"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn buffered_frames_replay_in_order() {
        let mut registry = Registry::default();
        let (tx, _rx) = mpsc::unbounded_channel();

        let id = registry.register(42, tx);
        registry.record_route((42, 100), id);
        registry.configure_resume(id, Some(String::from("k")), Some(5));

        // disconnect with a resume key: buffer opens
        let closed = registry.close(id).unwrap();
        let (key, timeout) = closed.resume.unwrap();
        assert_eq!(key, "k");
        assert_eq!(timeout, 5);

        let timer = tokio::spawn(async {});
        registry.open_buffer(key, id, closed.user_id, timer);

        registry.deliver((42, 100), String::from("one"));
        registry.deliver((42, 100), String::from("two"));

        // reconnect: claim the buffer, adopt routes
        let buffer = registry.take_buffer("k").unwrap();
        assert_eq!(buffer.events, ["one", "two"]);

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let new_id = registry.register(42, tx2);
        registry.adopt_routes(buffer.conn_id, new_id);

        registry.deliver((42, 100), String::from("three"));
        assert_eq!(rx2.try_recv().unwrap(), "three");
    }

    #[tokio::test]
    async fn close_without_resume_key() {
        let mut registry = Registry::default();
        let (tx, _rx) = mpsc::unbounded_channel();

        let id = registry.register(42, tx);
        let closed = registry.close(id).unwrap();

        assert!(closed.resume.is_none());
        assert!(registry.close(id).is_none());
    }

    #[tokio::test]
    async fn broadcast_reaches_all_connections() {
        let mut registry = Registry::default();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        registry.register(1, tx1);
        registry.register(2, tx2);
        registry.broadcast("stats");

        assert_eq!(rx1.try_recv().unwrap(), "stats");
        assert_eq!(rx2.try_recv().unwrap(), "stats");
    }
}
