//! The secure voice connection to the platform.
//!
//! A [`Connection`] drives the voice endpoint websocket: the identify
//! handshake, heartbeats and resume attempts. The companion [`rtp::Socket`]
//! carries the actual Opus frames over UDP. Both are owned by a player task;
//! nothing here knows about queues or tracks.

pub mod error;
pub mod payload;
pub mod rtp;

pub use error::Error;
pub use rtp::{Encryptor, Packet as RtpPacket, Socket as RtpSocket};

use payload::{
    Identify, OpCode, Packet, Resume, SelectProtocol, SelectProtocolData, Speaking, VoiceEvent,
};
use rtp::EncryptionMode;

use async_tungstenite::tokio::{connect_async, ConnectStream};
use async_tungstenite::WebSocketStream;
use tungstenite::protocol::Message;

use futures_util::{Sink, SinkExt, Stream, StreamExt};

use tokio::net::UdpSocket;
use tokio::time::{sleep_until, Duration, Instant};

use tracing::{debug, info, warn};

/// Session information for a voice connection, assembled from a client's
/// `voiceUpdate`.
#[derive(Clone, Debug)]
pub struct Session {
    pub guild_id: u64,
    pub user_id: u64,
    pub session_id: String,
    pub token: String,
    pub endpoint: String,
}

impl Session {
    fn url(&self) -> String {
        // the platform hands out endpoints with a stale port attached
        let host = self.endpoint.split(':').next().unwrap_or(&self.endpoint);

        format!("wss://{}/?v=4", host)
    }
}

/// Unmanaged voice connection to the platform endpoint.
///
/// This must be polled constantly to ensure heartbeats are sent. To poll the
/// connection, call [`Connection::recv`].
pub struct Connection {
    session: Session,
    wss: WebSocketStream<ConnectStream>,
    heartbeater: Heartbeater,
}

impl Connection {
    /// Establishes a connection to an endpoint and completes the handshake.
    pub async fn connect(session: Session) -> Result<(Connection, RtpSocket), Error> {
        let (wss, _response) = connect_async(session.url()).await?;

        let mut conn = Connection {
            session,
            wss,
            heartbeater: Heartbeater::default(),
        };
        let rtp = conn.handshake().await?;

        Ok((conn, rtp))
    }

    /// Polls for the next event, sending heartbeats as they come due.
    ///
    /// This is (should be) cancel-safe.
    pub async fn recv(&mut self) -> Option<Result<Event, Error>> {
        loop {
            tokio::select! {
                ev = recv(&mut self.wss) => {
                    match ev {
                        Some(Ok(VoiceEvent::HeartbeatAck(nonce))) => {
                            if self.heartbeater.nonce() != nonce {
                                warn!("invalid heartbeat ack, nonce: {}", nonce);
                            }
                        }
                        Some(Ok(VoiceEvent::Speaking(_))) => (),
                        Some(Ok(VoiceEvent::ClientDisconnect)) => (),
                        Some(Ok(ev)) => {
                            debug!("skipping voice ev: {:?}", ev);
                        }
                        Some(Err(err)) if err.can_resume() => {
                            match self.resume().await {
                                Ok(Some(rtp)) => return Some(Ok(Event::ChangeSocket(rtp))),
                                Ok(None) => (),
                                Err(err) => return Some(Err(err)),
                            }
                        }
                        Some(Err(err)) => return Some(Err(err)),
                        None => return None,
                    }
                }
                nonce = self.heartbeater.next() => {
                    let heartbeat = match Packet::new(OpCode::Heartbeat, &nonce) {
                        Ok(heartbeat) => heartbeat,
                        Err(err) => return Some(Err(err)),
                    };
                    if let Err(err) = send(&mut self.wss, &heartbeat).await {
                        return Some(Err(err));
                    }
                }
            }
        }
    }

    /// Reports whether this connection is speaking.
    pub async fn send_speaking(&mut self, speaking: bool, ssrc: u32) -> Result<(), Error> {
        let packet = Packet::new(
            OpCode::Speaking,
            &Speaking {
                speaking: speaking as u8,
                delay: Some(0),
                ssrc,
            },
        )?;

        send(&mut self.wss, &packet).await
    }

    /// Gets session information.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Completes an identify handshake with the voice endpoint, establishing
    /// the UDP socket on the way.
    async fn handshake(&mut self) -> Result<RtpSocket, Error> {
        debug!("begin voice handshake");

        let identify = Packet::new(
            OpCode::Identify,
            &Identify {
                server_id: self.session.guild_id.to_string(),
                user_id: self.session.user_id.to_string(),
                session_id: self.session.session_id.clone(),
                token: self.session.token.clone(),
            },
        )?;
        send(&mut self.wss, &identify).await?;

        // wait for hello and ready events
        let mut hello = None;
        let mut ready = None;

        while hello.is_none() || ready.is_none() {
            match recv(&mut self.wss).await {
                Some(Ok(VoiceEvent::Hello(ev))) => hello = Some(ev),
                Some(Ok(VoiceEvent::Ready(ev))) => ready = Some(ev),
                Some(Ok(ev)) => warn!("unexpected event: {:?}", ev),
                Some(Err(err)) => return Err(err),
                None => return Err(Error::Closed(None)),
            }
        }

        let (hello, ready) = (hello.unwrap(), ready.unwrap());

        self.heartbeater = Heartbeater::new(hello.heartbeat_interval);

        // establish udp connection and discover our external address
        let udp = UdpSocket::bind("0.0.0.0:0").await?;
        udp.connect((ready.ip.as_str(), ready.port)).await?;

        let ip = rtp::ip_discovery(&udp, ready.ssrc).await?;

        let mode = EncryptionMode::select(&ready.modes).ok_or(Error::UnsupportedEncryption)?;

        debug!("selected encryption mode {}", mode);

        let select = Packet::new(
            OpCode::SelectProtocol,
            &SelectProtocol {
                protocol: String::from("udp"),
                data: SelectProtocolData {
                    address: ip.ip().to_string(),
                    port: ip.port(),
                    mode: mode.as_str().to_owned(),
                },
            },
        )?;
        send(&mut self.wss, &select).await?;

        let desc = loop {
            match recv(&mut self.wss).await {
                Some(Ok(VoiceEvent::SessionDescription(ev))) => break ev,
                Some(Ok(ev)) => warn!("unexpected event: {:?}", ev),
                Some(Err(err)) => return Err(err),
                None => return Err(Error::Closed(None)),
            }
        };

        info!("voice connected to {}", self.session.endpoint);

        Ok(RtpSocket::new(
            udp,
            ready.ssrc,
            Encryptor::new(mode, desc.secret_key),
        ))
    }

    /// Completes a session resume handshake. If the endpoint rejected the
    /// resume, a full reconnect happens and the new `RtpSocket` is returned.
    async fn resume(&mut self) -> Result<Option<RtpSocket>, Error> {
        debug!("begin voice resume handshake");

        let resume = Packet::new(
            OpCode::Resume,
            &Resume {
                server_id: self.session.guild_id.to_string(),
                session_id: self.session.session_id.clone(),
                token: self.session.token.clone(),
            },
        )?;
        send(&mut self.wss, &resume).await?;

        loop {
            match recv(&mut self.wss).await {
                Some(Ok(VoiceEvent::Resumed)) => return Ok(None),
                Some(Ok(ev)) => warn!("unexpected event: {:?}", ev),
                Some(Err(Error::Closed(_))) | Some(Err(Error::Api(_))) => {
                    warn!("resume failed, attempting to reconnect");
                    return self.handshake().await.map(Some);
                }
                Some(Err(err)) => return Err(err),
                None => return Err(Error::Closed(None)),
            }
        }
    }
}

/// Voice event surfaced to the player task.
#[derive(Debug)]
pub enum Event {
    /// The connection dropped and managed to reform; packets must go to the
    /// new socket from now on.
    ChangeSocket(RtpSocket),
}

/// Receives a voice gateway event from the endpoint.
async fn recv(
    mut wss: impl Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
) -> Option<Result<VoiceEvent, Error>> {
    while let Some(res) = wss.next().await {
        match res {
            Ok(Message::Text(msg)) => {
                let packet = match serde_json::from_str::<Packet>(&msg) {
                    Ok(packet) => packet,
                    Err(err) => return Some(Err(Error::Json(err))),
                };

                return Some(VoiceEvent::try_from(packet));
            }
            Ok(Message::Close(Some(frame))) => {
                return Some(Err(match error::ApiError::from_close(&frame) {
                    Some(err) => Error::Api(err),
                    None => Error::Closed(Some(frame)),
                }));
            }
            Ok(Message::Close(None)) => return Some(Err(Error::Closed(None))),
            // if a ping or pong frame is received, silently drop
            Ok(_) => (),
            Err(err) => return Some(Err(err.into())),
        }
    }

    None
}

/// Sends a voice gateway packet to the endpoint.
async fn send(
    mut wss: impl Sink<Message, Error = tungstenite::Error> + Unpin,
    packet: &Packet,
) -> Result<(), Error> {
    let msg = serde_json::to_string(packet).map_err(Error::Json)?;

    wss.send(Message::Text(msg)).await?;

    Ok(())
}

/// Manages heartbeat state.
struct Heartbeater {
    interval: f32,
    nonce: u64,
    next: Instant,
}

impl Heartbeater {
    fn new(interval: f32) -> Heartbeater {
        Heartbeater {
            interval,
            nonce: 0,
            next: Instant::now() + Duration::from_millis(interval as u64),
        }
    }

    /// Returns the next heartbeat nonce after the alloted time has passed.
    async fn next(&mut self) -> u64 {
        sleep_until(self.next).await;

        self.nonce += 1;
        self.next = Instant::now() + Duration::from_millis(self.interval as u64);

        self.nonce
    }

    fn nonce(&self) -> u64 {
        self.nonce
    }
}

impl Default for Heartbeater {
    fn default() -> Heartbeater {
        Heartbeater::new(15_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_port_is_stripped() {
        let session = Session {
            guild_id: 1,
            user_id: 2,
            session_id: String::new(),
            token: String::new(),
            endpoint: String::from("us-east42.example.gg:80"),
        };

        assert_eq!(session.url(), "wss://us-east42.example.gg/?v=4");
    }
}
