//! The client gateway.
//!
//! One TCP listener serves both surfaces: websocket upgrades become control
//! connections, anything else is answered by the REST handlers. The upgrade
//! is completed by hand because the response must carry the protocol's
//! custom headers (`Session-Resumed`, `Lavalink-Major-Version`,
//! `Is-Volcano`).

pub mod rest;
pub mod state;
pub mod stats;

use crate::config::Config;
use crate::constants::{KEEPALIVE_INTERVAL, STATS_INTERVAL};
use crate::pool::{GatewayBound, KeyedOp, Pool, QueueKey, VoiceStateStore};
use crate::protocol::{InboundFrame, OutboundFrame};

use state::{ConnId, Registry};
use stats::StatsCollector;

use async_tungstenite::tokio::TokioAdapter;
use async_tungstenite::WebSocketStream;
use tungstenite::handshake::derive_accept_key;
use tungstenite::protocol::{Message, Role};

use futures_util::{SinkExt, StreamExt};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Duration, Instant};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

/// The gateway process state shared by every connection task.
pub struct Gateway {
    pub(crate) config: Config,
    pub(crate) pool: Pool,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) voice_states: VoiceStateStore,
    pub(crate) http: reqwest::Client,
    stats: StatsCollector,
}

impl Gateway {
    /// Builds the pool and serves forever.
    pub async fn run(config: Config) -> anyhow::Result<()> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let voice_states = VoiceStateStore::default();
        let http = reqwest::Client::new();

        let workers = num_cpus::get().max(1);
        let pool = Pool::new(
            workers,
            http.clone(),
            config.lavalink.server.sources.clone(),
            voice_states.clone(),
            events_tx,
        );

        let addr = SocketAddr::new(config.server.address, config.server.port);

        let gateway = Arc::new(Gateway {
            config,
            pool,
            registry: Mutex::new(Registry::default()),
            voice_states,
            http,
            stats: StatsCollector::new(),
        });

        // worker events -> client sockets, preserving arrival order
        let router = gateway.clone();
        tokio::spawn(async move {
            while let Some(bound) = events_rx.recv().await {
                match bound {
                    GatewayBound::Frame { key, frame } => {
                        let Ok(text) = serde_json::to_string(&frame) else {
                            continue;
                        };
                        router.registry.lock().unwrap().deliver(key, text);
                    }
                    GatewayBound::ClearRoute { key } => {
                        router.registry.lock().unwrap().clear_route(key);
                    }
                }
            }
        });

        tokio::spawn(stats_loop(gateway.clone()));

        let listener = TcpListener::bind(addr).await?;
        info!("listening on {} with {} workers", addr, workers);

        loop {
            let (stream, peer) = listener.accept().await?;
            tokio::spawn(handle_connection(gateway.clone(), stream, peer));
        }
    }
}

/// Pushes `stats` frames to every client and sweeps expired voice states.
async fn stats_loop(gateway: Arc<Gateway>) {
    let mut ticker = interval_at(Instant::now() + STATS_INTERVAL, STATS_INTERVAL);

    loop {
        ticker.tick().await;

        let counts = gateway.pool.stats().await;
        let frame = OutboundFrame::Stats(gateway.stats.frame(counts.players, counts.playing));

        if let Ok(text) = serde_json::to_string(&frame) {
            gateway.registry.lock().unwrap().broadcast(&text);
        }

        gateway.voice_states.purge();
    }
}

async fn handle_connection(gateway: Arc<Gateway>, mut stream: TcpStream, peer: SocketAddr) {
    let req = match read_request(&mut stream).await {
        Ok(req) => req,
        Err(err) => {
            debug!("bad request head from {}: {}", peer, err);
            return;
        }
    };

    if req.is_upgrade() {
        handle_ws(gateway, stream, req, peer).await;
    } else {
        let response = rest::handle(&gateway, &req).await;
        let _ = stream.write_all(&response.to_bytes()).await;
    }
}

/// Completes the websocket handshake and runs the connection until it
/// closes.
async fn handle_ws(gateway: Arc<Gateway>, mut stream: TcpStream, req: HttpRequest, peer: SocketAddr) {
    let authorized = gateway.config.authorized(req.header("authorization"));
    let user_id = req.header("user-id").and_then(|v| v.parse::<u64>().ok());
    let ws_key = req.header("sec-websocket-key").map(str::to_owned);

    let (Some(user_id), Some(ws_key), true) = (user_id, ws_key, authorized) else {
        let _ = stream.write_all(b"HTTP/1.1 401 Unauthorized\r\n\r\n").await;
        return;
    };

    // a returning client claims its buffered events before the response, so
    // the header can announce the resume
    let resumed = req
        .header("resume-key")
        .and_then(|key| gateway.registry.lock().unwrap().take_buffer(key));

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         Session-Resumed: {}\r\n\
         Lavalink-Major-Version: 3\r\n\
         Is-Volcano: true\r\n\r\n",
        derive_accept_key(ws_key.as_bytes()),
        resumed.is_some(),
    );
    if stream.write_all(response.as_bytes()).await.is_err() {
        return;
    }

    let wss =
        WebSocketStream::from_raw_socket(TokioAdapter::new(stream), Role::Server, None).await;
    let (mut sink, mut source) = wss.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let conn_id = {
        let mut registry = gateway.registry.lock().unwrap();
        let conn_id = registry.register(user_id, tx.clone());

        if let Some(buffer) = resumed {
            registry.adopt_routes(buffer.conn_id, conn_id);

            // replay everything missed during the window, in order
            for event in buffer.events {
                let _ = tx.send(event);
            }
        }

        conn_id
    };

    info!("client {} connected (user {})", peer, user_id);

    // greet with a stats frame
    let counts = gateway.pool.stats().await;
    let stats = OutboundFrame::Stats(gateway.stats.frame(counts.players, counts.playing));
    if let Ok(text) = serde_json::to_string(&stats) {
        let _ = tx.send(text);
    }

    let alive = Arc::new(AtomicBool::new(true));

    // writer: outbound frames plus the keepalive ping; a missed pong
    // terminates the client
    let writer_alive = alive.clone();
    let writer = tokio::spawn(async move {
        let mut ping = interval_at(
            Instant::now() + KEEPALIVE_INTERVAL,
            KEEPALIVE_INTERVAL,
        );

        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    match outbound {
                        Some(text) => {
                            if sink.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping.tick() => {
                    if !writer_alive.swap(false, Ordering::AcqRel) {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(msg) = source.next().await {
        match msg {
            Ok(Message::Text(text)) => dispatch(&gateway, conn_id, user_id, &text).await,
            Ok(Message::Pong(_)) => alive.store(true, Ordering::Release),
            Ok(Message::Close(_)) => break,
            Ok(_) => (),
            Err(err) => {
                debug!("client {} socket error: {}", conn_id, err);
                break;
            }
        }
    }

    writer.abort();
    on_close(gateway, conn_id).await;

    info!("client {} disconnected", peer);
}

/// Handles one inbound control frame. Malformed payloads are logged and
/// dropped without disconnecting the client.
async fn dispatch(gateway: &Arc<Gateway>, conn_id: ConnId, user_id: u64, text: &str) {
    let frame = match serde_json::from_str::<InboundFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("malformed frame from connection {}: {}", conn_id, err);
            return;
        }
    };

    match frame {
        InboundFrame::Play(req) => {
            let Some(key) = parse_key(user_id, &req.guild_id) else {
                return;
            };

            // this socket receives the room's events from now on
            gateway.registry.lock().unwrap().record_route(key, conn_id);
            gateway.pool.play(key, req).await;
        }
        InboundFrame::VoiceUpdate(update) => {
            let Some(key) = parse_key(user_id, &update.guild_id) else {
                return;
            };

            gateway.voice_states.put(key, update.clone());
            gateway.pool.voice_server(key, update);
        }
        InboundFrame::Stop { guild_id } => keyed(gateway, user_id, &guild_id, KeyedOp::Stop),
        InboundFrame::Pause { guild_id, pause } => {
            keyed(gateway, user_id, &guild_id, KeyedOp::Pause(pause));
        }
        InboundFrame::Destroy { guild_id } => keyed(gateway, user_id, &guild_id, KeyedOp::Destroy),
        InboundFrame::Seek { guild_id, position } => {
            keyed(gateway, user_id, &guild_id, KeyedOp::Seek(position));
        }
        InboundFrame::Volume { guild_id, volume } => {
            keyed(gateway, user_id, &guild_id, KeyedOp::Volume(volume));
        }
        InboundFrame::Filters { guild_id, spec } => {
            keyed(gateway, user_id, &guild_id, KeyedOp::Filters(spec));
        }
        InboundFrame::Ffmpeg { guild_id, args } => {
            keyed(gateway, user_id, &guild_id, KeyedOp::Ffmpeg(args));
        }
        InboundFrame::ConfigureResuming { key, timeout } => {
            gateway
                .registry
                .lock()
                .unwrap()
                .configure_resume(conn_id, key, timeout);
        }
        InboundFrame::Dump => gateway.pool.dump(),
    }
}

fn keyed(gateway: &Gateway, user_id: u64, guild_id: &str, op: KeyedOp) {
    if let Some(key) = parse_key(user_id, guild_id) {
        gateway.pool.op(key, op);
    }
}

fn parse_key(user_id: u64, guild_id: &str) -> Option<QueueKey> {
    match guild_id.parse::<u64>() {
        Ok(guild) => Some((user_id, guild)),
        Err(_) => {
            warn!("unparsable guild id {:?}", guild_id);
            None
        }
    }
}

/// Cleans up after a closed connection: either open the resume window or
/// destroy the user's players right away.
async fn on_close(gateway: Arc<Gateway>, conn_id: ConnId) {
    let closed = gateway.registry.lock().unwrap().close(conn_id);
    let Some(closed) = closed else { return };

    match closed.resume {
        Some((resume_key, timeout)) => {
            debug!(
                "connection {} has resume key, holding events for {}s",
                conn_id, timeout,
            );

            let expiry_gateway = gateway.clone();
            let expiry_key = resume_key.clone();
            let timer = tokio::spawn(async move {
                sleep(Duration::from_secs(timeout)).await;

                let expired = expiry_gateway
                    .registry
                    .lock()
                    .unwrap()
                    .expire_buffer(&expiry_key);

                if let Some(buffer) = expired {
                    let count = expiry_gateway.pool.delete_all(buffer.user_id).await;
                    info!(
                        "resume window {:?} expired, destroyed {} players",
                        expiry_key, count,
                    );
                }
            });

            gateway
                .registry
                .lock()
                .unwrap()
                .open_buffer(resume_key, conn_id, closed.user_id, timer);
        }
        None => {
            let count = gateway.pool.delete_all(closed.user_id).await;
            debug!(
                "connection {} closed without resume key, destroyed {} players",
                conn_id, count,
            );
        }
    }
}

/// A parsed HTTP request head.
pub(crate) struct HttpRequest {
    pub method: String,
    pub path: String,
    query: Vec<(String, String)>,
    headers: HashMap<String, String>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn query_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.query
            .iter()
            .filter(move |(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn is_upgrade(&self) -> bool {
        self.header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }

    fn parse(head: &str) -> Result<HttpRequest, std::io::Error> {
        let bad = || std::io::Error::new(std::io::ErrorKind::InvalidData, "bad request head");

        let mut lines = head.split("\r\n");
        let request_line = lines.next().ok_or_else(bad)?;

        let mut parts = request_line.split_whitespace();
        let method = parts.next().ok_or_else(bad)?.to_owned();
        let target = parts.next().ok_or_else(bad)?;

        let (path, query_str) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };

        let mut headers = HashMap::new();
        for line in lines.take_while(|line| !line.is_empty()) {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_lowercase(), value.trim().to_owned());
            }
        }

        Ok(HttpRequest {
            method,
            path: path.to_owned(),
            query: parse_query(query_str),
            headers,
        })
    }

    #[cfg(test)]
    pub(crate) fn parse_for_test(method: &str, target: &str) -> HttpRequest {
        HttpRequest::parse(&format!("{} {} HTTP/1.1\r\n\r\n", method, target)).unwrap()
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));

            (
                urlencoding::decode(key).map(|s| s.into_owned()).unwrap_or_else(|_| key.to_owned()),
                urlencoding::decode(value)
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| value.to_owned()),
            )
        })
        .collect()
}

/// Reads the request head off a fresh socket, up to the blank line.
async fn read_request(stream: &mut TcpStream) -> Result<HttpRequest, std::io::Error> {
    const HEAD_MAX: usize = 8192;

    let mut head = Vec::with_capacity(512);
    let mut byte = [0u8; 1];

    // byte-at-a-time keeps us from consuming websocket frames that follow
    // the head
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= HEAD_MAX {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }

        let read = stream.read(&mut byte).await?;
        if read == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }

        head.push(byte[0]);
    }

    let head = std::str::from_utf8(&head)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "head is not utf8"))?;

    HttpRequest::parse(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_head() {
        let req = HttpRequest::parse(
            "GET /loadtracks?identifier=ytsearch%3Anever+gonna HTTP/1.1\r\n\
             Host: localhost\r\n\
             Authorization: youshallnotpass\r\n\
             User-Id: 42\r\n\r\n",
        )
        .unwrap();

        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/loadtracks");
        assert_eq!(req.query_value("identifier"), Some("ytsearch:never+gonna"));
        assert_eq!(req.header("authorization"), Some("youshallnotpass"));
        assert_eq!(req.header("user-id"), Some("42"));
        assert!(!req.is_upgrade());
    }

    #[test]
    fn upgrade_detection_is_case_insensitive() {
        let req = HttpRequest::parse(
            "GET / HTTP/1.1\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\n\r\n",
        )
        .unwrap();

        assert!(req.is_upgrade());
    }

    #[test]
    fn repeated_query_values_keep_order() {
        let req = HttpRequest::parse_for_test("GET", "/decodetracks?track=a&track=b&track=c");

        let values: Vec<&str> = req.query_values("track").collect();
        assert_eq!(values, ["a", "b", "c"]);
    }

    #[test]
    fn key_parsing() {
        assert_eq!(parse_key(42, "100"), Some((42, 100)));
        assert_eq!(parse_key(42, "not a number"), None);
    }
}
