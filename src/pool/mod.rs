//! The worker pool.
//!
//! Playback state is spread across N workers (N = CPU count), each owning a
//! disjoint set of queues. The pool routes commands to workers and never
//! keeps a global key table: a keyed command is broadcast and non-owners
//! drop it, and `play` asks every worker whether it owns the key before
//! placing new work on the least-loaded one.

pub mod player;
pub mod queue;
mod streamer;
pub mod worker;

use crate::config::SourcesConfig;
use crate::constants::VOICE_STATE_TTL;
use crate::protocol::payload::{PlayRequest, VoiceUpdate};
use crate::protocol::{FilterSpec, OutboundFrame};

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

/// Identifies a queue: `(user id, guild id)`.
pub type QueueKey = (u64, u64);

/// Traffic from workers back to the gateway.
#[derive(Debug)]
pub enum GatewayBound {
    /// A frame to deliver to whichever socket registered the key.
    Frame { key: QueueKey, frame: OutboundFrame },
    /// The key's route can be forgotten (track over or queue destroyed).
    ClearRoute { key: QueueKey },
}

/// A command consumed by a worker.
pub enum WorkerMsg {
    Play {
        key: QueueKey,
        req: PlayRequest,
        /// Set on the ownership-discovery broadcast; the reply is `true`
        /// from the worker that owns the key.
        reply: Option<oneshot::Sender<bool>>,
    },
    Op {
        key: QueueKey,
        op: KeyedOp,
    },
    VoiceServer {
        key: QueueKey,
        update: VoiceUpdate,
    },
    Stats {
        reply: oneshot::Sender<WorkerStats>,
    },
    DeleteAll {
        user_id: u64,
        reply: oneshot::Sender<usize>,
    },
}

/// Keyed queue operations besides `play`.
#[derive(Clone)]
pub enum KeyedOp {
    Stop,
    Pause(bool),
    Destroy,
    Seek(u64),
    Volume(u32),
    Filters(FilterSpec),
    Ffmpeg(Vec<String>),
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WorkerStats {
    pub players: usize,
    pub playing: usize,
}

/// Voice server states delivered by clients, kept for replay when a queue is
/// created after its `voiceUpdate` arrived. Entries expire.
#[derive(Clone, Default)]
pub struct VoiceStateStore(Arc<Mutex<HashMap<QueueKey, (Instant, VoiceUpdate)>>>);

impl VoiceStateStore {
    pub fn put(&self, key: QueueKey, update: VoiceUpdate) {
        let mut map = self.0.lock().unwrap();

        map.retain(|_, (at, _)| at.elapsed() < VOICE_STATE_TTL);
        map.insert(key, (Instant::now(), update));
    }

    pub fn get(&self, key: QueueKey) -> Option<VoiceUpdate> {
        let map = self.0.lock().unwrap();

        map.get(&key)
            .filter(|(at, _)| at.elapsed() < VOICE_STATE_TTL)
            .map(|(_, update)| update.clone())
    }

    /// Drops expired entries; called from the stats tick.
    pub fn purge(&self) {
        self.0
            .lock()
            .unwrap()
            .retain(|_, (at, _)| at.elapsed() < VOICE_STATE_TTL);
    }
}

/// The worker pool dispatcher.
pub struct Pool {
    workers: Mutex<Vec<WorkerHandle>>,
    events_tx: UnboundedSender<GatewayBound>,
    voice_states: VoiceStateStore,
    http: reqwest::Client,
    sources: SourcesConfig,
    size: usize,
}

struct WorkerHandle {
    tx: UnboundedSender<WorkerMsg>,
    queue_count: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Pool {
    /// Creates a pool of `size` workers.
    pub fn new(
        size: usize,
        http: reqwest::Client,
        sources: SourcesConfig,
        voice_states: VoiceStateStore,
        events_tx: UnboundedSender<GatewayBound>,
    ) -> Pool {
        let pool = Pool {
            workers: Mutex::new(Vec::with_capacity(size)),
            events_tx,
            voice_states,
            http,
            sources,
            size,
        };

        {
            let mut workers = pool.workers.lock().unwrap();
            for index in 0..size {
                workers.push(pool.spawn_worker(index));
            }
        }

        pool
    }

    fn spawn_worker(&self, index: usize) -> WorkerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue_count = Arc::new(AtomicUsize::new(0));

        let ctx = worker::WorkerContext {
            index,
            events_tx: self.events_tx.clone(),
            voice_states: self.voice_states.clone(),
            http: self.http.clone(),
            sources: self.sources.clone(),
            queue_count: queue_count.clone(),
        };

        debug!("spawning worker {}", index);

        let task = tokio::spawn(worker::run(rx, ctx));

        WorkerHandle {
            tx,
            queue_count,
            task,
        }
    }

    /// Routes a play request: the owning worker takes it, otherwise the
    /// least-loaded worker becomes the owner.
    pub async fn play(&self, key: QueueKey, req: PlayRequest) {
        let replies: Vec<oneshot::Receiver<bool>> = {
            let mut workers = self.workers.lock().unwrap();

            (0..workers.len())
                .map(|index| {
                    let (reply, rx) = oneshot::channel();
                    let msg = WorkerMsg::Play {
                        key,
                        req: req.clone(),
                        reply: Some(reply),
                    };

                    send_or_respawn(self, &mut workers, index, msg);
                    rx
                })
                .collect()
        };

        for reply in replies {
            // a worker that died counts as not owning the key
            if reply.await.unwrap_or(false) {
                return;
            }
        }

        // nobody owns it; place it on the worker with the fewest queues,
        // ties to the lowest index
        let mut workers = self.workers.lock().unwrap();
        let index = workers
            .iter()
            .enumerate()
            .min_by_key(|(_, worker)| worker.queue_count.load(Ordering::Relaxed))
            .map(|(index, _)| index)
            .unwrap_or(0);

        send_or_respawn(
            self,
            &mut workers,
            index,
            WorkerMsg::Play {
                key,
                req,
                reply: None,
            },
        );
    }

    /// Broadcasts a keyed op; only the owner acts on it.
    pub fn op(&self, key: QueueKey, op: KeyedOp) {
        let mut workers = self.workers.lock().unwrap();

        for index in 0..workers.len() {
            let msg = WorkerMsg::Op {
                key,
                op: op.clone(),
            };
            send_or_respawn(self, &mut workers, index, msg);
        }
    }

    /// Broadcasts a voice server update; only the owner applies it.
    pub fn voice_server(&self, key: QueueKey, update: VoiceUpdate) {
        let mut workers = self.workers.lock().unwrap();

        for index in 0..workers.len() {
            let msg = WorkerMsg::VoiceServer {
                key,
                update: update.clone(),
            };
            send_or_respawn(self, &mut workers, index, msg);
        }
    }

    /// Collects player counts from every worker.
    pub async fn stats(&self) -> WorkerStats {
        let replies: Vec<oneshot::Receiver<WorkerStats>> = {
            let mut workers = self.workers.lock().unwrap();

            (0..workers.len())
                .map(|index| {
                    let (reply, rx) = oneshot::channel();
                    send_or_respawn(self, &mut workers, index, WorkerMsg::Stats { reply });
                    rx
                })
                .collect()
        };

        let mut total = WorkerStats::default();
        for reply in replies {
            if let Ok(stats) = reply.await {
                total.players += stats.players;
                total.playing += stats.playing;
            }
        }

        total
    }

    /// Destroys every queue belonging to a user. Returns how many went down.
    pub async fn delete_all(&self, user_id: u64) -> usize {
        let replies: Vec<oneshot::Receiver<usize>> = {
            let mut workers = self.workers.lock().unwrap();

            (0..workers.len())
                .map(|index| {
                    let (reply, rx) = oneshot::channel();
                    let msg = WorkerMsg::DeleteAll { user_id, reply };
                    send_or_respawn(self, &mut workers, index, msg);
                    rx
                })
                .collect()
        };

        let mut count = 0;
        for reply in replies {
            count += reply.await.unwrap_or(0);
        }

        count
    }

    /// Terminates and restarts every worker, dropping all playback state.
    pub fn dump(&self) {
        warn!("dumping all workers");

        let mut workers = self.workers.lock().unwrap();
        for worker in workers.iter() {
            worker.task.abort();
        }

        *workers = (0..self.size).map(|index| self.spawn_worker(index)).collect();
    }
}

/// Sends to a worker slot, respawning the worker first if its loop died.
fn send_or_respawn(pool: &Pool, workers: &mut [WorkerHandle], index: usize, msg: WorkerMsg) {
    if let Err(mpsc::error::SendError(msg)) = workers[index].tx.send(msg) {
        error!("worker {} died, restarting it", index);

        workers[index] = pool.spawn_worker(index);
        let _ = workers[index].tx.send(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn voice_state_store_round_trip() {
        let store = VoiceStateStore::default();
        let update: VoiceUpdate = serde_json::from_str(
            r#"{"guildId":"100","sessionId":"s","event":{"token":"t","endpoint":"e"}}"#,
        )
        .unwrap();

        store.put((42, 100), update);

        let got = store.get((42, 100)).unwrap();
        assert_eq!(got.session_id, "s");
        assert!(store.get((42, 101)).is_none());
    }

    #[tokio::test]
    async fn least_loaded_routing_prefers_lowest_index_on_tie() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let pool = Pool::new(
            2,
            reqwest::Client::new(),
            SourcesConfig::default(),
            VoiceStateStore::default(),
            events_tx,
        );

        // both empty: index 0 wins the tie
        let index = {
            let workers = pool.workers.lock().unwrap();
            workers
                .iter()
                .enumerate()
                .min_by_key(|(_, worker)| worker.queue_count.load(Ordering::Relaxed))
                .map(|(index, _)| index)
                .unwrap()
        };
        assert_eq!(index, 0);

        // load up worker 0; worker 1 must win now
        {
            let workers = pool.workers.lock().unwrap();
            workers[0].queue_count.store(3, Ordering::Relaxed);
        }
        let index = {
            let workers = pool.workers.lock().unwrap();
            workers
                .iter()
                .enumerate()
                .min_by_key(|(_, worker)| worker.queue_count.load(Ordering::Relaxed))
                .map(|(index, _)| index)
                .unwrap()
        };
        assert_eq!(index, 1);
    }
}
