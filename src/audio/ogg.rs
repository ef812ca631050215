//! Ogg page parsing for the transcoder's Opus output.
//!
//! Each emitted packet is one Opus frame ready for the voice sink. Pages are
//! located by their `OggS` capture pattern, so junk between pages is skipped.
//! Page CRCs are not verified; the input is a local pipe.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt};

const CAPTURE_PATTERN: &[u8; 4] = b"OggS";
const HEADER_LEN: usize = 27;
const FLAG_CONTINUED: u8 = 0x01;
const FLAG_BOS: u8 = 0x02;
const LACING_CONTINUES: u8 = 255;
const READ_CHUNK: usize = 64 * 1024;

const OPUS_HEAD: &[u8] = b"OpusHead";
const OPUS_TAGS: &[u8] = b"OpusTags";

/// Incremental demuxer: push bytes in any chunking, pull packets out.
#[derive(Debug, Default)]
pub struct OggDemuxer {
    buffer: BytesMut,
    partial: BytesMut,
    partial_from_bos: bool,
    ready: VecDeque<Bytes>,
}

impl OggDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete audio packet, or `None` until more bytes arrive.
    pub fn next_packet(&mut self) -> Option<Bytes> {
        loop {
            if let Some(packet) = self.ready.pop_front() {
                return Some(packet);
            }
            if !self.read_page() {
                return None;
            }
        }
    }

    /// Consumes one page (or one byte of false sync). Returns false when the
    /// buffer holds no complete page.
    fn read_page(&mut self) -> bool {
        let Some(start) = find_capture(&self.buffer) else {
            let keep = self.buffer.len().min(CAPTURE_PATTERN.len() - 1);
            let stale = self.buffer.len() - keep;
            self.buffer.advance(stale);
            return false;
        };
        self.buffer.advance(start);

        if self.buffer.len() < HEADER_LEN {
            return false;
        }
        if self.buffer[4] != 0 {
            // unknown stream structure version: not a real page boundary
            self.buffer.advance(1);
            return true;
        }

        let segment_count = self.buffer[26] as usize;
        let table_end = HEADER_LEN + segment_count;
        if self.buffer.len() < table_end {
            return false;
        }
        let body_len: usize = self.buffer[HEADER_LEN..table_end]
            .iter()
            .map(|&lace| lace as usize)
            .sum();
        if self.buffer.len() < table_end + body_len {
            return false;
        }

        let page = self.buffer.split_to(table_end + body_len).freeze();
        let header_type = page[5];
        let lacing = page.slice(HEADER_LEN..table_end);
        let body = page.slice(table_end..);
        self.assemble(header_type, &lacing, &body);
        true
    }

    fn assemble(&mut self, header_type: u8, lacing: &[u8], body: &Bytes) {
        let continued = header_type & FLAG_CONTINUED != 0;
        let bos = header_type & FLAG_BOS != 0;

        // lacing alone decides spanning: an open packet runs into this
        // page's first segment whatever the continued flag says
        if bos && !self.partial.is_empty() {
            // a new logical stream starts; the old packet cannot finish
            self.partial.clear();
        }
        // a continuation with nothing to continue: skip up to the first
        // packet boundary
        let mut orphaned = continued && self.partial.is_empty();

        let mut offset = 0;
        for &lace in lacing {
            let segment = &body[offset..offset + lace as usize];
            offset += lace as usize;

            if orphaned {
                orphaned = lace == LACING_CONTINUES;
                continue;
            }

            if self.partial.is_empty() {
                self.partial_from_bos = bos;
            }
            self.partial.extend_from_slice(segment);

            if lace < LACING_CONTINUES {
                let packet = self.partial.split().freeze();
                self.emit(packet);
            }
        }
    }

    fn emit(&mut self, packet: Bytes) {
        if packet.is_empty()
            || self.partial_from_bos
            || packet.starts_with(OPUS_HEAD)
            || packet.starts_with(OPUS_TAGS)
        {
            return;
        }
        self.ready.push_back(packet);
    }
}

fn find_capture(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(CAPTURE_PATTERN.len())
        .position(|window| window == CAPTURE_PATTERN)
}

/// Demuxes a complete in-memory stream.
pub fn demux(data: &[u8]) -> Vec<Bytes> {
    let mut demuxer = OggDemuxer::new();
    demuxer.push(data);
    std::iter::from_fn(|| demuxer.next_packet()).collect()
}

/// Pulls packets from an async byte stream. A packet cut off by end of
/// stream is dropped.
pub struct OggPacketReader<R> {
    inner: R,
    demuxer: OggDemuxer,
    chunk: Box<[u8]>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> OggPacketReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            demuxer: OggDemuxer::new(),
            chunk: vec![0; READ_CHUNK].into_boxed_slice(),
            eof: false,
        }
    }

    /// `Ok(None)` at end of stream. Cancel safe.
    pub async fn next_packet(&mut self) -> std::io::Result<Option<Bytes>> {
        loop {
            if let Some(packet) = self.demuxer.next_packet() {
                return Ok(Some(packet));
            }
            if self.eof {
                return Ok(None);
            }

            let read = self.inner.read(&mut self.chunk).await?;
            if read == 0 {
                self.eof = true;
            } else {
                self.demuxer.push(&self.chunk[..read]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::ogg_page as page;
    use pretty_assertions::assert_eq;

    fn opus_head() -> Vec<u8> {
        let mut head = b"OpusHead".to_vec();
        head.extend_from_slice(&[1, 2, 0x38, 0x01, 0x80, 0xbb, 0, 0, 0, 0, 0]);
        head
    }

    fn headers() -> Vec<u8> {
        let head = opus_head();
        let tags = b"OpusTags\x05\x00\x00\x00tests\x00\x00\x00\x00".to_vec();
        let mut out = page(FLAG_BOS, &[head.len() as u8], &head);
        out.extend(page(0, &[tags.len() as u8], &tags));
        out
    }

    #[test]
    fn header_only_stream_yields_nothing() {
        assert!(demux(&headers()).is_empty());
    }

    #[test]
    fn packet_spanning_two_pages_is_reassembled() {
        let first = vec![0xAA; 255];
        let second = vec![0xBB; 10];
        let mut stream = headers();
        stream.extend(page(0, &[255], &first));
        stream.extend(page(FLAG_CONTINUED, &[10], &second));

        let packets = demux(&stream);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 265);
        assert_eq!(&packets[0][..255], &first[..]);
        assert_eq!(&packets[0][255..], &second[..]);
    }

    #[test]
    fn several_packets_in_one_page() {
        let stream = page(0, &[3, 5, 0, 1], b"abcdefghi");
        let packets = demux(&stream);
        assert_eq!(packets, vec![Bytes::from_static(b"abc"), Bytes::from_static(b"defgh"), Bytes::from_static(b"i")]);
    }

    #[test]
    fn exact_multiple_of_255_needs_a_zero_terminator() {
        let body = vec![7u8; 510];
        let packets = demux(&page(0, &[255, 255, 0], &body));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 510);
    }

    #[test]
    fn junk_between_pages_is_skipped() {
        let mut stream = b"garbage!".to_vec();
        stream.extend(page(0, &[2], b"p1"));
        stream.extend_from_slice(b"OggX noise");
        stream.extend(page(0, &[2], b"p2"));

        assert_eq!(demux(&stream), vec![Bytes::from_static(b"p1"), Bytes::from_static(b"p2")]);
    }

    #[test]
    fn byte_at_a_time_matches_whole_buffer() {
        let mut stream = headers();
        stream.extend(page(0, &[255, 20], &[1u8; 275]));
        stream.extend(page(0, &[255], &[2u8; 255]));
        stream.extend(page(FLAG_CONTINUED, &[4, 9], &[3u8; 13]));

        let mut demuxer = OggDemuxer::new();
        let mut packets = Vec::new();
        for byte in &stream {
            demuxer.push(std::slice::from_ref(byte));
            while let Some(packet) = demuxer.next_packet() {
                packets.push(packet);
            }
        }

        assert_eq!(packets, demux(&stream));
        assert_eq!(packets.iter().map(Bytes::len).collect::<Vec<_>>(), vec![275, 259, 9]);
    }

    #[test]
    fn truncated_final_packet_is_dropped() {
        let mut stream = page(0, &[4], b"full");
        stream.extend(page(0, &[255], &[9u8; 255]));
        assert_eq!(demux(&stream), vec![Bytes::from_static(b"full")]);
    }

    #[test]
    fn orphan_continuation_is_discarded() {
        let mut stream = page(FLAG_CONTINUED, &[255, 3, 2], &{
            let mut body = vec![0u8; 258];
            body.extend_from_slice(b"ok");
            body
        });
        stream.extend(page(0, &[3], b"yes"));
        assert_eq!(demux(&stream), vec![Bytes::from_static(b"ok"), Bytes::from_static(b"yes")]);
    }

    #[test]
    fn spanning_follows_lacing_even_without_the_continued_flag() {
        let mut stream = page(0, &[255], &[0xAA; 255]);
        stream.extend(page(0, &[10], &[0xBB; 10]));

        let packets = demux(&stream);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 265);
        assert_eq!(&packets[0][..255], &[0xAA; 255][..]);
        assert_eq!(&packets[0][255..], &[0xBB; 10][..]);
    }

    #[test]
    fn unfinished_packet_is_abandoned_when_a_new_stream_begins() {
        let mut stream = page(0, &[255], &[1u8; 255]);
        stream.extend(page(FLAG_BOS, &[8], b"OpusHead"));
        stream.extend(page(0, &[3], b"new"));
        assert_eq!(demux(&stream), vec![Bytes::from_static(b"new")]);
    }

    #[tokio::test]
    async fn reader_yields_packets_then_none() {
        let mut stream = headers();
        stream.extend(page(0, &[3, 3], b"onetwo"));
        let mut reader = OggPacketReader::new(&stream[..]);

        assert_eq!(reader.next_packet().await.unwrap(), Some(Bytes::from_static(b"one")));
        assert_eq!(reader.next_packet().await.unwrap(), Some(Bytes::from_static(b"two")));
        assert_eq!(reader.next_packet().await.unwrap(), None);
        assert_eq!(reader.next_packet().await.unwrap(), None);
    }
}
