//! Low-level RTP protocol types.

use std::fmt::{self, Debug, Display, Formatter};
use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::str::Utf8Error;

use tokio::net::UdpSocket;

use rand::rngs::{OsRng, StdRng};
use rand::{Rng, RngCore, SeedableRng};

use xsalsa20poly1305::aead::{self, AeadInPlace, KeyInit};
use xsalsa20poly1305::{XSalsa20Poly1305, NONCE_SIZE, TAG_SIZE};

use crate::constants::{MONO_FRAME_SIZE, VOICE_PACKET_MAX};

/// A socket for outgoing RTP packets.
#[derive(Debug)]
pub struct Socket {
    udp: UdpSocket,
    encryptor: Encryptor,

    sequence: u16,
    timestamp: u32,
    ssrc: u32,
}

impl Socket {
    /// Creates a new `Socket`.
    pub fn new(udp: UdpSocket, ssrc: u32, encryptor: Encryptor) -> Socket {
        Socket {
            udp,
            encryptor,
            sequence: 0,
            timestamp: 0,
            ssrc,
        }
    }

    /// Sends a packet over the socket, filling in its metadata and then
    /// encrypting it.
    pub async fn send(&mut self, mut packet: Packet) -> Result<(), super::Error> {
        packet.set_sequence(self.sequence);
        packet.set_timestamp(self.timestamp);
        packet.set_ssrc(self.ssrc);

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(MONO_FRAME_SIZE as u32);

        self.encryptor
            .encrypt(&mut packet)
            .map_err(|_| super::Error::Crypto)?;

        self.udp.send(packet.as_ref()).await?;

        Ok(())
    }

    /// The ssrc of the socket.
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }
}

/// An RTP packet under construction.
///
/// The backing buffer is never resized; the payload length is tracked
/// manually and the tag slot sits between the 12-byte header and the
/// payload.
pub struct Packet {
    pkt: [u8; VOICE_PACKET_MAX],
    payload_len: usize,
}

impl Packet {
    /// The size of the RTP header plus the Poly1305 tag slot.
    pub const HEADER_LEN: usize = 12 + TAG_SIZE;

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// # Panics
    /// Panics if `payload_len + HEADER_LEN` exceeds the backing buffer.
    pub fn set_payload_len(&mut self, payload_len: usize) {
        assert!(self.pkt.len() >= Packet::HEADER_LEN + payload_len);

        self.payload_len = payload_len;
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.pkt[Self::HEADER_LEN..]
    }

    /// The 12 RTP header bytes, without the tag slot.
    fn rtp_header(&self) -> &[u8] {
        &self.pkt[..12]
    }

    fn tag_mut(&mut self) -> &mut [u8] {
        &mut self.pkt[12..12 + TAG_SIZE]
    }

    fn set_sequence(&mut self, sequence: u16) {
        self.pkt[2..4].copy_from_slice(&sequence.to_be_bytes());
    }

    fn set_timestamp(&mut self, timestamp: u32) {
        self.pkt[4..8].copy_from_slice(&timestamp.to_be_bytes());
    }

    fn set_ssrc(&mut self, ssrc: u32) {
        self.pkt[8..12].copy_from_slice(&ssrc.to_be_bytes());
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.pkt[..Self::HEADER_LEN + self.payload_len]
    }
}

impl Default for Packet {
    fn default() -> Packet {
        let mut pkt = [0u8; VOICE_PACKET_MAX];

        // version 2, dynamic payload type 0x78
        pkt[0] = 0x80;
        pkt[1] = 0x78;

        Packet {
            pkt,
            payload_len: 0,
        }
    }
}

/// Encrypts outgoing packets using [`xsalsa20poly1305`].
pub struct Encryptor {
    aead: XSalsa20Poly1305,
    state: EncryptorState,
}

enum EncryptorState {
    Normal,
    Suffix(StdRng),
    Lite(u32),
}

impl Encryptor {
    /// Creates a new encryptor from a secret key and an encryption mode.
    pub fn new(mode: EncryptionMode, secret_key: [u8; 32]) -> Encryptor {
        Encryptor {
            aead: XSalsa20Poly1305::new_from_slice(&secret_key)
                .expect("32-bytes enforced by compiler"),
            state: match mode {
                EncryptionMode::Normal => EncryptorState::Normal,
                EncryptionMode::Suffix => EncryptorState::Suffix(StdRng::from_entropy()),
                EncryptionMode::Lite => EncryptorState::Lite(OsRng.gen()),
            },
        }
    }

    /// Encrypts a packet in-place, updating any necessary values.
    pub fn encrypt(&mut self, pkt: &mut Packet) -> Result<(), aead::Error> {
        let payload_len = pkt.payload_len();

        match &mut self.state {
            EncryptorState::Normal => {
                // the RTP header, zero-padded, is the nonce
                let mut nonce = [0u8; NONCE_SIZE];
                nonce[0..12].copy_from_slice(pkt.rtp_header());

                let tag = self.aead.encrypt_in_place_detached(
                    &nonce.into(),
                    b"",
                    &mut pkt.payload_mut()[..payload_len],
                )?;

                pkt.tag_mut().copy_from_slice(&tag[..]);

                Ok(())
            }
            EncryptorState::Suffix(rng) => {
                let mut nonce = [0u8; NONCE_SIZE];
                rng.fill_bytes(&mut nonce);

                let tag = self.aead.encrypt_in_place_detached(
                    &nonce.into(),
                    b"",
                    &mut pkt.payload_mut()[..payload_len],
                )?;

                pkt.tag_mut().copy_from_slice(&tag[..]);

                // nonce rides at the end of the payload
                pkt.payload_mut()[payload_len..payload_len + NONCE_SIZE].copy_from_slice(&nonce);
                pkt.set_payload_len(payload_len + NONCE_SIZE);

                Ok(())
            }
            EncryptorState::Lite(next_nonce) => {
                let mut nonce = [0u8; NONCE_SIZE];
                nonce[0..4].copy_from_slice(&next_nonce.to_be_bytes());
                *next_nonce = next_nonce.wrapping_add(1);

                let tag = self.aead.encrypt_in_place_detached(
                    &nonce.into(),
                    b"",
                    &mut pkt.payload_mut()[..payload_len],
                )?;

                pkt.tag_mut().copy_from_slice(&tag[..]);

                pkt.payload_mut()[payload_len..payload_len + 4].copy_from_slice(&nonce[0..4]);
                pkt.set_payload_len(payload_len + 4);

                Ok(())
            }
        }
    }
}

impl Debug for Encryptor {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str("Encryptor(_)")
    }
}

/// Platform packet encryption scheme.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EncryptionMode {
    /// The nonce bytes are the RTP header.
    Normal,
    /// 24 random nonce bytes appended to the payload.
    Suffix,
    /// 4 incrementing nonce bytes appended to the payload.
    Lite,
}

impl EncryptionMode {
    const NORMAL_STR: &'static str = "xsalsa20_poly1305";
    const SUFFIX_STR: &'static str = "xsalsa20_poly1305_suffix";
    const LITE_STR: &'static str = "xsalsa20_poly1305_lite";

    /// Picks the preferred mode out of the server's offering.
    ///
    /// Order: lite > suffix > normal.
    pub fn select(offered: &[String]) -> Option<EncryptionMode> {
        [
            (Self::LITE_STR, EncryptionMode::Lite),
            (Self::SUFFIX_STR, EncryptionMode::Suffix),
            (Self::NORMAL_STR, EncryptionMode::Normal),
        ]
        .into_iter()
        .find(|(name, _)| offered.iter().any(|m| m == name))
        .map(|(_, mode)| mode)
    }

    /// Returns the string representation of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => Self::NORMAL_STR,
            Self::Suffix => Self::SUFFIX_STR,
            Self::Lite => Self::LITE_STR,
        }
    }
}

impl Display for EncryptionMode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Platform IP discovery.
///
/// Accepts a UDP socket connected to a voice endpoint. **While the client is
/// waiting for a UDP response, unrelated packets will throw errors.**
pub async fn ip_discovery(udp: &UdpSocket, ssrc: u32) -> Result<SocketAddr, IpDiscoveryError> {
    const REQ_HEADER: &[u8] = &[0x00, 0x01, 0x00, 0x46];
    const RES_HEADER: &[u8] = &[0x00, 0x02, 0x00, 0x46];

    let mut buf = [0u8; 74];
    buf[..4].copy_from_slice(REQ_HEADER);
    buf[4..8].copy_from_slice(&ssrc.to_be_bytes());

    udp.send(&buf).await.map_err(IpDiscoveryError::Io)?;

    match udp.recv(&mut buf).await {
        Ok(size) if size == 74 => {
            if &buf[..4] != RES_HEADER {
                let mut header = [0u8; 4];
                header.copy_from_slice(&buf[..4]);
                return Err(IpDiscoveryError::InvalidHeader(header));
            }

            let mut pkt_ssrc = [0u8; 4];
            pkt_ssrc.copy_from_slice(&buf[4..8]);
            let pkt_ssrc = u32::from_be_bytes(pkt_ssrc);

            if pkt_ssrc != ssrc {
                return Err(IpDiscoveryError::InvalidSsrc(ssrc, pkt_ssrc));
            }

            let mut port = [0u8; 2];
            port.copy_from_slice(&buf[72..74]);
            let port = u16::from_be_bytes(port);

            // the address is a null-terminated string
            let addr = &buf[8..72];
            let addr_end = addr.iter().position(|&x| x == 0).unwrap_or(64);

            match std::str::from_utf8(&addr[..addr_end]) {
                Ok(addr) => match addr.parse::<IpAddr>() {
                    Ok(addr) => Ok((addr, port).into()),
                    Err(err) => Err(IpDiscoveryError::InvalidAddr(err)),
                },
                Err(err) => Err(IpDiscoveryError::InvalidAddrUtf8(err)),
            }
        }
        Ok(size) => Err(IpDiscoveryError::InvalidSize(size)),
        Err(err) => Err(IpDiscoveryError::Io(err)),
    }
}

/// An error that is returned from [`ip_discovery`].
#[derive(Debug)]
pub enum IpDiscoveryError {
    InvalidHeader([u8; 4]),
    InvalidSsrc(u32, u32),
    InvalidAddrUtf8(Utf8Error),
    InvalidAddr(AddrParseError),
    InvalidSize(usize),
    Io(std::io::Error),
}

impl Display for IpDiscoveryError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            IpDiscoveryError::InvalidHeader([b1, b2, b3, b4]) => write!(
                f,
                "invalid header, expected 00 02 00 46, got {:02X} {:02X} {:02X} {:02X}",
                b1, b2, b3, b4,
            ),
            IpDiscoveryError::InvalidSsrc(exp, got) => {
                write!(f, "invalid ssrc, expected {}, got {}", exp, got)
            }
            IpDiscoveryError::InvalidAddrUtf8(err) => write!(f, "address has invalid utf8: {}", err),
            IpDiscoveryError::InvalidAddr(err) => write!(f, "address is badly formed: {}", err),
            IpDiscoveryError::InvalidSize(size) => {
                write!(f, "packet is invalid size: {} bytes", size)
            }
            IpDiscoveryError::Io(err) => write!(f, "io: {}", err),
        }
    }
}

impl std::error::Error for IpDiscoveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IpDiscoveryError::InvalidAddr(err) => Some(err),
            IpDiscoveryError::Io(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_best_encryption_mode() {
        let offered = vec![
            String::from("xsalsa20_poly1305"),
            String::from("xsalsa20_poly1305_suffix"),
        ];
        assert_eq!(
            EncryptionMode::select(&offered),
            Some(EncryptionMode::Suffix),
        );

        let offered = vec![String::from("aead_aes256_gcm")];
        assert_eq!(EncryptionMode::select(&offered), None);
    }

    #[test]
    fn packet_header_layout() {
        let mut packet = Packet::default();
        packet.set_sequence(0x0102);
        packet.set_timestamp(0x03040506);
        packet.set_ssrc(0x0708090a);
        packet.set_payload_len(4);

        let bytes = packet.as_ref();
        assert_eq!(bytes[0], 0x80);
        assert_eq!(bytes[1], 0x78);
        assert_eq!(&bytes[2..4], &[0x01, 0x02]);
        assert_eq!(&bytes[4..8], &[0x03, 0x04, 0x05, 0x06]);
        assert_eq!(&bytes[8..12], &[0x07, 0x08, 0x09, 0x0a]);
        assert_eq!(bytes.len(), Packet::HEADER_LEN + 4);
    }

    #[test]
    fn suffix_mode_appends_nonce() {
        let mut encryptor = Encryptor::new(EncryptionMode::Suffix, [7u8; 32]);

        let mut packet = Packet::default();
        packet.payload_mut()[..3].copy_from_slice(&[1, 2, 3]);
        packet.set_payload_len(3);

        encryptor.encrypt(&mut packet).unwrap();
        assert_eq!(packet.payload_len(), 3 + NONCE_SIZE);
    }
}
