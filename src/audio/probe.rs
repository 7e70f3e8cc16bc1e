//! Container detection and Ogg-Opus demuxing for the no-transcode path.

use tokio::io::{AsyncRead, AsyncReadExt};

use std::collections::VecDeque;
use std::io;

/// Magic length needed by [`detect`].
pub const PROBE_LEN: usize = 4;

/// Containers the probe can recognize.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Container {
    /// An Ogg stream, assumed to carry Opus.
    Ogg,
    /// An EBML (WebM/Matroska) stream.
    Webm,
    /// Anything else; goes through ffmpeg.
    Unknown,
}

/// Sniffs the container from the first bytes of a stream.
pub fn detect(header: &[u8]) -> Container {
    if header.starts_with(b"OggS") {
        Container::Ogg
    } else if header.starts_with(&[0x1a, 0x45, 0xdf, 0xa3]) {
        Container::Webm
    } else {
        Container::Unknown
    }
}

/// Pulls Opus packets out of an Ogg stream.
///
/// Pages are parsed lazily; lacing values of 255 concatenate segments into
/// one packet, and the continuation flag carries a packet across a page
/// boundary. `OpusHead`/`OpusTags` header packets are skipped.
pub struct OggPacketReader<R> {
    reader: R,
    ready: VecDeque<Vec<u8>>,
    partial: Vec<u8>,
    eof: bool,
}

impl<R> OggPacketReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> OggPacketReader<R> {
        OggPacketReader {
            reader,
            ready: VecDeque::new(),
            partial: Vec::new(),
            eof: false,
        }
    }

    /// Reads the next audio packet, or `None` at end of stream.
    pub async fn next_packet(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(packet) = self.ready.pop_front() {
                if packet.starts_with(b"OpusHead") || packet.starts_with(b"OpusTags") {
                    continue;
                }

                return Ok(Some(packet));
            }

            if self.eof || !self.read_page().await? {
                return Ok(None);
            }
        }
    }

    /// Reads one page, pushing completed packets into `ready`. Returns
    /// `false` on a clean end of stream.
    async fn read_page(&mut self) -> io::Result<bool> {
        let mut header = [0u8; 27];

        // a stream may end cleanly at a page boundary
        match self.reader.read_exact(&mut header).await {
            Ok(_) => (),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                self.eof = true;
                return Ok(false);
            }
            Err(err) => return Err(err),
        }

        if &header[..4] != b"OggS" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad ogg capture pattern",
            ));
        }

        let continuation = header[5] & 0x01 != 0;
        if !continuation && !self.partial.is_empty() {
            // the previous packet never terminated; drop it
            self.partial.clear();
        }

        let segments = header[26] as usize;
        let mut lacing = vec![0u8; segments];
        self.reader.read_exact(&mut lacing).await?;

        for &lace in &lacing {
            let start = self.partial.len();
            self.partial.resize(start + lace as usize, 0);
            self.reader.read_exact(&mut self.partial[start..]).await?;

            if lace < 255 {
                self.ready.push_back(std::mem::take(&mut self.partial));
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds an Ogg page by hand.
    fn page(continuation: bool, lacing: &[u8], data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"OggS");
        out.push(0); // version
        out.push(if continuation { 0x01 } else { 0x00 });
        out.extend_from_slice(&[0u8; 8]); // granule
        out.extend_from_slice(&[0u8; 4]); // serial
        out.extend_from_slice(&[0u8; 4]); // sequence
        out.extend_from_slice(&[0u8; 4]); // crc (unchecked)
        out.push(lacing.len() as u8);
        out.extend_from_slice(lacing);
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn detects_containers() {
        assert_eq!(detect(b"OggSxxxx"), Container::Ogg);
        assert_eq!(detect(&[0x1a, 0x45, 0xdf, 0xa3, 0, 0]), Container::Webm);
        assert_eq!(detect(b"ID3\x04"), Container::Unknown);
        assert_eq!(detect(b""), Container::Unknown);
    }

    #[tokio::test]
    async fn two_packets_in_one_page() {
        let bytes = page(false, &[2, 3], &[1, 1, 2, 2, 2]);

        let mut reader = OggPacketReader::new(bytes.as_slice());
        assert_eq!(reader.next_packet().await.unwrap(), Some(vec![1, 1]));
        assert_eq!(reader.next_packet().await.unwrap(), Some(vec![2, 2, 2]));
        assert_eq!(reader.next_packet().await.unwrap(), None);
    }

    #[tokio::test]
    async fn packet_spanning_pages() {
        // a 255 lacing value continues into the next page
        let mut bytes = page(false, &[255], &[7u8; 255]);
        bytes.extend(page(true, &[10], &[7u8; 10]));

        let mut reader = OggPacketReader::new(bytes.as_slice());
        assert_eq!(reader.next_packet().await.unwrap(), Some(vec![7u8; 265]));
        assert_eq!(reader.next_packet().await.unwrap(), None);
    }

    #[tokio::test]
    async fn skips_opus_headers() {
        let mut head = b"OpusHead".to_vec();
        head.extend_from_slice(&[1, 2]);
        let mut bytes = page(false, &[head.len() as u8], &head);
        bytes.extend(page(false, &[8], b"OpusTags"));
        bytes.extend(page(false, &[3], &[9, 9, 9]));

        let mut reader = OggPacketReader::new(bytes.as_slice());
        assert_eq!(reader.next_packet().await.unwrap(), Some(vec![9, 9, 9]));
        assert_eq!(reader.next_packet().await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_garbage() {
        let mut reader = OggPacketReader::new(&b"garbage garbage garbage ab!"[..]);

        assert!(reader.next_packet().await.is_err());
    }
}
