//! A worker: the message loop hosting a set of queues.

use crate::config::SourcesConfig;
use crate::constants::PLAYER_UPDATE_INTERVAL;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::player::Player;
use super::queue::{Internal, Queue};
use super::{GatewayBound, KeyedOp, QueueKey, VoiceStateStore, WorkerMsg, WorkerStats};

/// Everything a worker needs from the pool.
pub(crate) struct WorkerContext {
    pub index: usize,
    pub events_tx: UnboundedSender<GatewayBound>,
    pub voice_states: VoiceStateStore,
    pub http: reqwest::Client,
    pub sources: SourcesConfig,
    /// Mirrors `queues.len()` so the pool can pick the least-loaded worker
    /// without asking.
    pub queue_count: Arc<AtomicUsize>,
}

/// The worker loop. One per worker task.
pub(crate) async fn run(mut rx: UnboundedReceiver<WorkerMsg>, ctx: WorkerContext) {
    let mut queues: HashMap<QueueKey, Queue> = HashMap::new();

    // events from the player tasks this worker owns
    let (player_tx, mut player_rx) = mpsc::unbounded_channel();
    // completions from arm tasks and stuck timers
    let (internal_tx, mut internal_rx) = mpsc::unbounded_channel();

    let mut ticker = tokio::time::interval(PLAYER_UPDATE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    debug!("worker {} up", ctx.index);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else { break };

                handle_msg(&ctx, &mut queues, &player_tx, &internal_tx, msg);
            }
            Some((key, event)) = player_rx.recv() => {
                if let Some(queue) = queues.get_mut(&key) {
                    queue.on_player_event(event);
                }
            }
            Some(internal) = internal_rx.recv() => {
                match internal {
                    Internal::Armed { key, epoch, result } => {
                        if let Some(queue) = queues.get_mut(&key) {
                            queue.on_armed(epoch, result);
                        }
                    }
                    Internal::Stuck { key, epoch } => {
                        if let Some(queue) = queues.get_mut(&key) {
                            queue.check_stuck(epoch);
                        }
                    }
                }
            }
            _ = ticker.tick() => {
                for (key, queue) in queues.iter() {
                    if let Some(frame) = queue.player_update() {
                        let _ = ctx.events_tx.send(GatewayBound::Frame { key: *key, frame });
                    }
                }
            }
        }
    }

    debug!("worker {} down", ctx.index);
}

fn handle_msg(
    ctx: &WorkerContext,
    queues: &mut HashMap<QueueKey, Queue>,
    player_tx: &UnboundedSender<(QueueKey, super::player::PlayerEvent)>,
    internal_tx: &UnboundedSender<Internal>,
    msg: WorkerMsg,
) {
    match msg {
        WorkerMsg::Play { key, req, reply } => {
            let owned = queues.contains_key(&key);

            if let Some(reply) = reply {
                let _ = reply.send(owned);

                // the discovery broadcast only executes on the owner
                if !owned {
                    return;
                }
            }

            if !owned {
                debug!("worker {} takes ownership of {:?}", ctx.index, key);

                let player = Player::new(key, player_tx.clone());
                let mut queue = Queue::new(
                    key,
                    player,
                    ctx.events_tx.clone(),
                    internal_tx.clone(),
                    ctx.http.clone(),
                    ctx.sources.clone(),
                );

                // replay the voice server state the gateway saw before we
                // existed
                if let Some(update) = ctx.voice_states.get(key) {
                    queue.voice_server(update);
                }

                queues.insert(key, queue);
                ctx.queue_count.store(queues.len(), Ordering::Relaxed);
            }

            let queue = queues.get_mut(&key).unwrap();
            if let Err(err) = queue.play(req) {
                warn!("bad track blob for {:?}: {}", key, err);
            }
        }
        WorkerMsg::Op { key, op } => {
            let Some(queue) = queues.get_mut(&key) else {
                // broadcast reached a non-owner
                trace!("worker {} ignoring op for {:?}", ctx.index, key);
                return;
            };

            match op {
                KeyedOp::Stop => queue.stop(false),
                KeyedOp::Pause(paused) => queue.pause(paused),
                KeyedOp::Seek(position) => queue.seek(position),
                KeyedOp::Volume(volume) => queue.set_volume(volume),
                KeyedOp::Filters(spec) => queue.filters(spec),
                KeyedOp::Ffmpeg(args) => queue.ffmpeg(args),
                KeyedOp::Destroy => {
                    if let Some(mut queue) = queues.remove(&key) {
                        queue.destroy();
                    }
                    ctx.queue_count.store(queues.len(), Ordering::Relaxed);

                    if queues.is_empty() {
                        debug!("worker {} idle", ctx.index);
                    }
                }
            }
        }
        WorkerMsg::VoiceServer { key, update } => {
            if let Some(queue) = queues.get_mut(&key) {
                queue.voice_server(update);
            }
        }
        WorkerMsg::Stats { reply } => {
            let stats = WorkerStats {
                players: queues.len(),
                playing: queues.values().filter(|queue| queue.is_playing()).count(),
            };

            let _ = reply.send(stats);
        }
        WorkerMsg::DeleteAll { user_id, reply } => {
            let keys: Vec<QueueKey> = queues
                .keys()
                .filter(|(user, _)| *user == user_id)
                .copied()
                .collect();

            let count = keys.len();
            for key in keys {
                if let Some(mut queue) = queues.remove(&key) {
                    queue.destroy();
                }
            }
            ctx.queue_count.store(queues.len(), Ordering::Relaxed);

            let _ = reply.send(count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::payload::PlayRequest;

    use tokio::sync::oneshot;

    fn context() -> (
        WorkerContext,
        mpsc::UnboundedReceiver<GatewayBound>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let ctx = WorkerContext {
            index: 0,
            events_tx,
            voice_states: VoiceStateStore::default(),
            http: reqwest::Client::new(),
            sources: SourcesConfig::default(),
            queue_count: Arc::new(AtomicUsize::new(0)),
        };

        (ctx, events_rx)
    }

    fn play_req(track: &str) -> PlayRequest {
        serde_json::from_str(&format!(r#"{{"guildId":"100","track":"{}"}}"#, track)).unwrap()
    }

    #[tokio::test]
    async fn discovery_broadcast_replies_ownership() {
        let (ctx, _events) = context();
        let (player_tx, _player_rx) = mpsc::unbounded_channel();
        let (internal_tx, _internal_rx) = mpsc::unbounded_channel();
        let mut queues = HashMap::new();

        // unknown key: reply false, create nothing
        let (reply, rx) = oneshot::channel();
        handle_msg(
            &ctx,
            &mut queues,
            &player_tx,
            &internal_tx,
            WorkerMsg::Play {
                key: (42, 100),
                req: play_req("xxx"),
                reply: Some(reply),
            },
        );

        assert!(!rx.await.unwrap());
        assert!(queues.is_empty());

        // executed play: the queue is created even when the blob is garbage
        handle_msg(
            &ctx,
            &mut queues,
            &player_tx,
            &internal_tx,
            WorkerMsg::Play {
                key: (42, 100),
                req: play_req("xxx"),
                reply: None,
            },
        );

        assert_eq!(queues.len(), 1);
        assert_eq!(ctx.queue_count.load(Ordering::Relaxed), 1);

        // now the discovery broadcast finds an owner
        let (reply, rx) = oneshot::channel();
        handle_msg(
            &ctx,
            &mut queues,
            &player_tx,
            &internal_tx,
            WorkerMsg::Play {
                key: (42, 100),
                req: play_req("xxx"),
                reply: Some(reply),
            },
        );

        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn delete_all_only_hits_one_user() {
        let (ctx, _events) = context();
        let (player_tx, _player_rx) = mpsc::unbounded_channel();
        let (internal_tx, _internal_rx) = mpsc::unbounded_channel();
        let mut queues = HashMap::new();

        for key in [(42, 100), (42, 101), (7, 100)] {
            handle_msg(
                &ctx,
                &mut queues,
                &player_tx,
                &internal_tx,
                WorkerMsg::Play {
                    key,
                    req: play_req("xxx"),
                    reply: None,
                },
            );
        }
        assert_eq!(queues.len(), 3);

        let (reply, rx) = oneshot::channel();
        handle_msg(
            &ctx,
            &mut queues,
            &player_tx,
            &internal_tx,
            WorkerMsg::DeleteAll {
                user_id: 42,
                reply,
            },
        );

        assert_eq!(rx.await.unwrap(), 2);
        assert_eq!(queues.len(), 1);
        assert!(queues.contains_key(&(7, 100)));
    }

    #[tokio::test]
    async fn ops_for_unowned_keys_are_dropped() {
        let (ctx, mut events) = context();
        let (player_tx, _player_rx) = mpsc::unbounded_channel();
        let (internal_tx, _internal_rx) = mpsc::unbounded_channel();
        let mut queues = HashMap::new();

        handle_msg(
            &ctx,
            &mut queues,
            &player_tx,
            &internal_tx,
            WorkerMsg::Op {
                key: (1, 2),
                op: KeyedOp::Stop,
            },
        );

        assert!(queues.is_empty());
        assert!(events.try_recv().is_err());
    }
}
