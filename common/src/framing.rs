//! File-transfer framing, server → client.
//!
//! A response starts either with a bare marker (`BUSY`, `OK`, `FAIL`) or
//! with a transfer: a manifest naming N artifacts, then the N payloads,
//! then `QUIT`. Two framings carry the transfer:
//!
//! ```text
//! marker: <manifest json> DONE <file 0> MORE <file 1> ... MORE <file N-1> QUIT
//! length: <u32 BE len><manifest json> DONE <u64 BE len><file 0> ... <u64 BE len><file N-1> QUIT
//! ```
//!
//! Marker framing is the historical wire format. Its markers are not
//! escaped, so a payload containing `MORE`/`QUIT` (or a manifest containing
//! `DONE`) is cut at that point. Length framing carries the same logical
//! sequence without scanning payload bytes. Its manifest length is capped at
//! [`MAX_MANIFEST_LEN`], so the first byte of a length-framed transfer is
//! always `0x00` and cannot be mistaken for a bare marker.

use std::fmt;
use std::str::FromStr;

use crate::error::TransferError;
use crate::protocol::{BUSY, DONE, FAIL, MORE, OK, QUIT};

/// Largest accepted manifest, in bytes.
pub const MAX_MANIFEST_LEN: usize = 16 * 1024 * 1024;

const MARKER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// Delimit files by scanning for ASCII markers.
    Marker,
    /// Prefix manifest and files with their byte length.
    #[default]
    LengthPrefixed,
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "marker" => Ok(Self::Marker),
            "length" | "length-prefixed" => Ok(Self::LengthPrefixed),
            other => Err(format!("unknown framing {other:?} (expected marker or length)")),
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Marker => "marker",
            Self::LengthPrefixed => "length",
        })
    }
}

// ── encoding ─────────────────────────────────────────────────────────────

/// Produces the byte segments of one transfer, in order.
///
/// The caller writes `begin`, then for each file `file_header` followed by
/// exactly the announced number of payload bytes, then `finish`.
#[derive(Debug)]
pub struct TransferEncoder {
    framing: Framing,
    total: usize,
    next: usize,
}

impl TransferEncoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            total: 0,
            next: 0,
        }
    }

    /// Manifest followed by `DONE`.
    pub fn begin(&mut self, names: &[String]) -> Result<Vec<u8>, TransferError> {
        let manifest = serde_json::to_vec(names)
            .map_err(|e| TransferError::corrupt(format!("cannot serialize manifest: {e}")))?;
        if manifest.len() > MAX_MANIFEST_LEN {
            return Err(TransferError::ManifestTooLarge {
                size: manifest.len(),
                max: MAX_MANIFEST_LEN,
            });
        }
        self.total = names.len();
        self.next = 0;

        let mut out = Vec::with_capacity(manifest.len() + 8);
        if self.framing == Framing::LengthPrefixed {
            out.extend_from_slice(&(manifest.len() as u32).to_be_bytes());
        }
        out.extend_from_slice(&manifest);
        out.extend_from_slice(DONE);
        Ok(out)
    }

    /// Bytes that precede the next file's payload.
    pub fn file_header(&mut self, len: u64) -> Vec<u8> {
        let index = self.next;
        self.next += 1;
        match self.framing {
            Framing::Marker if index > 0 => MORE.to_vec(),
            Framing::Marker => Vec::new(),
            Framing::LengthPrefixed => len.to_be_bytes().to_vec(),
        }
    }

    pub fn finish(&mut self) -> Vec<u8> {
        QUIT.to_vec()
    }

    /// Number of files announced by the manifest.
    pub fn total(&self) -> usize {
        self.total
    }
}

/// Encode a complete transfer held in memory.
pub fn encode_transfer(
    framing: Framing,
    items: &[(String, Vec<u8>)],
) -> Result<Vec<u8>, TransferError> {
    let names: Vec<String> = items.iter().map(|(name, _)| name.clone()).collect();
    let mut encoder = TransferEncoder::new(framing);
    let mut out = encoder.begin(&names)?;
    for (_, data) in items {
        out.extend(encoder.file_header(data.len() as u64));
        out.extend_from_slice(data);
    }
    out.extend(encoder.finish());
    Ok(out)
}

// ── decoding ─────────────────────────────────────────────────────────────

/// Something the decoder recognised in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Busy,
    Ok,
    /// The capture engine failed to start.
    Fail,
    Manifest(Vec<String>),
    FileStart { index: usize },
    /// A slice of a file's payload; a file may arrive in many slices.
    FileData { index: usize, data: Vec<u8> },
    FileEnd { index: usize },
    /// `QUIT` was read; the response is complete.
    Finished,
}

impl TransferEvent {
    /// True for events that end a response.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Busy | Self::Ok | Self::Fail | Self::Finished)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting to see what kind of response this is.
    Start,
    Manifest,
    /// Inside file `index`. `remaining` is `None` until `FileStart` has been
    /// emitted; length framing then counts down the payload bytes.
    File {
        index: usize,
        remaining: Option<u64>,
    },
    ExpectQuit,
    /// `QUIT` already consumed (marker framing), `Finished` not yet emitted.
    Finishing,
    Done,
}

/// Resumable decoder for one server response.
///
/// Feed socket reads of any size with [`feed`](Self::feed) and drain events
/// with [`next_event`](Self::next_event). Bytes after the terminal event
/// stay available through [`take_remaining`](Self::take_remaining).
#[derive(Debug)]
pub struct TransferDecoder {
    framing: Framing,
    state: State,
    total: usize,
    buf: Vec<u8>,
}

impl TransferDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            state: State::Start,
            total: 0,
            buf: Vec::new(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// The response has been fully decoded.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Bytes received past the end of this response.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Pop the next event, or `Ok(None)` when more input is needed.
    pub fn next_event(&mut self) -> Result<Option<TransferEvent>, TransferError> {
        match self.state {
            State::Start => self.decode_start(),
            State::Manifest => match self.framing {
                Framing::Marker => self.decode_marker_manifest(),
                Framing::LengthPrefixed => self.decode_length_manifest(),
            },
            State::File { index, remaining } => match self.framing {
                Framing::Marker => self.decode_marker_file(index),
                Framing::LengthPrefixed => self.decode_length_file(index, remaining),
            },
            State::ExpectQuit => {
                if self.buf.len() < MARKER_LEN {
                    return Ok(None);
                }
                if !self.buf.starts_with(QUIT) {
                    return Err(TransferError::corrupt("expected QUIT after last file"));
                }
                self.buf.drain(..MARKER_LEN);
                self.state = State::Done;
                Ok(Some(TransferEvent::Finished))
            }
            State::Finishing => {
                self.state = State::Done;
                Ok(Some(TransferEvent::Finished))
            }
            State::Done => Ok(None),
        }
    }

    fn decode_start(&mut self) -> Result<Option<TransferEvent>, TransferError> {
        let Some(&first) = self.buf.first() else {
            return Ok(None);
        };

        let bare = [
            (BUSY, TransferEvent::Busy),
            (OK, TransferEvent::Ok),
            (FAIL, TransferEvent::Fail),
        ];
        for (marker, event) in bare {
            if first != marker[0] {
                continue;
            }
            if self.buf.len() < marker.len() {
                return if marker.starts_with(&self.buf) {
                    Ok(None)
                } else {
                    Err(TransferError::corrupt("unexpected response prefix"))
                };
            }
            if !self.buf.starts_with(marker) {
                return Err(TransferError::corrupt("unexpected response prefix"));
            }
            self.buf.drain(..marker.len());
            self.state = State::Done;
            return Ok(Some(event));
        }

        let looks_like_manifest = match self.framing {
            Framing::Marker => first == b'[',
            Framing::LengthPrefixed => first == 0,
        };
        if !looks_like_manifest {
            return Err(TransferError::corrupt(format!(
                "unexpected first response byte {first:#04x}"
            )));
        }
        self.state = State::Manifest;
        self.next_event()
    }

    fn decode_marker_manifest(&mut self) -> Result<Option<TransferEvent>, TransferError> {
        let Some(pos) = find(&self.buf, DONE) else {
            if self.buf.len() > MAX_MANIFEST_LEN {
                return Err(TransferError::ManifestTooLarge {
                    size: self.buf.len(),
                    max: MAX_MANIFEST_LEN,
                });
            }
            return Ok(None);
        };
        let names = parse_manifest(&self.buf[..pos])?;
        self.buf.drain(..pos + DONE.len());
        Ok(Some(self.enter_files(names)))
    }

    fn decode_length_manifest(&mut self) -> Result<Option<TransferEvent>, TransferError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_MANIFEST_LEN {
            return Err(TransferError::ManifestTooLarge {
                size: len,
                max: MAX_MANIFEST_LEN,
            });
        }
        let end = 4 + len;
        if self.buf.len() < end + DONE.len() {
            return Ok(None);
        }
        if &self.buf[end..end + DONE.len()] != DONE {
            return Err(TransferError::corrupt("manifest not followed by DONE"));
        }
        let names = parse_manifest(&self.buf[4..end])?;
        self.buf.drain(..end + DONE.len());
        Ok(Some(self.enter_files(names)))
    }

    fn enter_files(&mut self, names: Vec<String>) -> TransferEvent {
        self.total = names.len();
        self.state = if names.is_empty() {
            State::ExpectQuit
        } else {
            State::File {
                index: 0,
                remaining: None,
            }
        };
        TransferEvent::Manifest(names)
    }

    fn decode_marker_file(&mut self, index: usize) -> Result<Option<TransferEvent>, TransferError> {
        if let State::File { remaining: None, .. } = self.state {
            self.state = State::File {
                index,
                remaining: Some(0),
            };
            return Ok(Some(TransferEvent::FileStart { index }));
        }

        let last = index + 1 == self.total;
        let marker = if last { QUIT } else { MORE };

        if let Some(pos) = find(&self.buf, marker) {
            if pos > 0 {
                let data: Vec<u8> = self.buf.drain(..pos).collect();
                return Ok(Some(TransferEvent::FileData { index, data }));
            }
            self.buf.drain(..marker.len());
            self.state = if last {
                State::Finishing
            } else {
                State::File {
                    index: index + 1,
                    remaining: None,
                }
            };
            return Ok(Some(TransferEvent::FileEnd { index }));
        }

        // Hold back a possible partial marker at the end of the buffer.
        let safe = self.buf.len().saturating_sub(marker.len() - 1);
        if safe == 0 {
            return Ok(None);
        }
        let data: Vec<u8> = self.buf.drain(..safe).collect();
        Ok(Some(TransferEvent::FileData { index, data }))
    }

    fn decode_length_file(
        &mut self,
        index: usize,
        remaining: Option<u64>,
    ) -> Result<Option<TransferEvent>, TransferError> {
        let Some(remaining) = remaining else {
            if self.buf.len() < 8 {
                return Ok(None);
            }
            let mut len = [0u8; 8];
            len.copy_from_slice(&self.buf[..8]);
            self.buf.drain(..8);
            self.state = State::File {
                index,
                remaining: Some(u64::from_be_bytes(len)),
            };
            return Ok(Some(TransferEvent::FileStart { index }));
        };

        if remaining == 0 {
            self.state = if index + 1 == self.total {
                State::ExpectQuit
            } else {
                State::File {
                    index: index + 1,
                    remaining: None,
                }
            };
            return Ok(Some(TransferEvent::FileEnd { index }));
        }

        if self.buf.is_empty() {
            return Ok(None);
        }
        let take = self.buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let data: Vec<u8> = self.buf.drain(..take).collect();
        self.state = State::File {
            index,
            remaining: Some(remaining - take as u64),
        };
        Ok(Some(TransferEvent::FileData { index, data }))
    }
}

fn parse_manifest(bytes: &[u8]) -> Result<Vec<String>, TransferError> {
    serde_json::from_slice::<Vec<String>>(bytes)
        .map_err(|e| TransferError::corrupt(format!("manifest is not a list of names: {e}")))
}

/// Position of the first occurrence of `needle` in `haystack`.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Decoded transfer: names, then each file's reassembled payload.
    #[derive(Debug, PartialEq, Eq)]
    struct Decoded {
        names: Vec<String>,
        files: Vec<Vec<u8>>,
        finished: bool,
    }

    fn decode_in_chunks(framing: Framing, bytes: &[u8], chunk: usize) -> Decoded {
        let mut decoder = TransferDecoder::new(framing);
        let mut out = Decoded {
            names: vec![],
            files: vec![],
            finished: false,
        };
        for piece in bytes.chunks(chunk.max(1)) {
            decoder.feed(piece);
            while let Some(event) = decoder.next_event().unwrap() {
                match event {
                    TransferEvent::Manifest(names) => out.names = names,
                    TransferEvent::FileStart { index } => {
                        assert_eq!(index, out.files.len());
                        out.files.push(Vec::new());
                    }
                    TransferEvent::FileData { index, data } => out.files[index].extend(data),
                    TransferEvent::FileEnd { .. } => {}
                    TransferEvent::Finished => out.finished = true,
                    other => panic!("unexpected event {other:?}"),
                }
            }
        }
        out
    }

    fn sample_items() -> Vec<(String, Vec<u8>)> {
        vec![
            ("/data/media/2024-05-01 10:00:00_000.jpg".to_string(), vec![0xff, 0xd8, 1, 2, 3]),
            ("empty.jpg".to_string(), vec![]),
            ("big.mp4".to_string(), (0..5000u32).map(|i| (i % 251) as u8).collect()),
        ]
    }

    #[test]
    fn test_roundtrip_both_framings() {
        let items = sample_items();
        for framing in [Framing::Marker, Framing::LengthPrefixed] {
            let bytes = encode_transfer(framing, &items).unwrap();
            let decoded = decode_in_chunks(framing, &bytes, bytes.len());
            assert!(decoded.finished, "{framing}");
            assert_eq!(decoded.names.len(), 3);
            for (i, (name, data)) in items.iter().enumerate() {
                assert_eq!(&decoded.names[i], name);
                assert_eq!(&decoded.files[i], data);
            }
        }
    }

    #[test]
    fn test_chunk_size_does_not_change_result() {
        let items = sample_items();
        for framing in [Framing::Marker, Framing::LengthPrefixed] {
            let bytes = encode_transfer(framing, &items).unwrap();
            let whole = decode_in_chunks(framing, &bytes, bytes.len());
            for chunk in [1, 2, 3, 5, 1024] {
                assert_eq!(decode_in_chunks(framing, &bytes, chunk), whole, "{framing} / {chunk}");
            }
        }
    }

    /// Small xorshift generator so generated cases are reproducible.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        fn below(&mut self, n: u64) -> u64 {
            self.next() % n
        }
    }

    fn generated_items(rng: &mut XorShift, count: usize, marker_safe: bool) -> Vec<(String, Vec<u8>)> {
        (0..count)
            .map(|i| {
                let len = match rng.below(4) {
                    0 => 0,
                    1 => rng.below(8) as usize,
                    _ => rng.below(600) as usize,
                };
                let data: Vec<u8> = if marker_safe {
                    // bytes below 0x40 never spell a marker
                    (0..len).map(|_| (rng.next() & 0x3f) as u8).collect()
                } else if rng.below(3) == 0 {
                    b"MOREQUITDONE".iter().copied().cycle().take(len).collect()
                } else {
                    (0..len).map(|_| rng.next() as u8).collect()
                };
                (format!("capture {i}.jpg"), data)
            })
            .collect()
    }

    #[test]
    fn test_generated_transfers_decode_at_any_chunk_size() {
        let mut rng = XorShift(0x9e37_79b9_7f4a_7c15);
        for count in (0..=12).chain([25, 40]) {
            for framing in [Framing::LengthPrefixed, Framing::Marker] {
                let items = generated_items(&mut rng, count, framing == Framing::Marker);
                let bytes = encode_transfer(framing, &items).unwrap();
                for chunk in [1, 3, bytes.len()] {
                    let decoded = decode_in_chunks(framing, &bytes, chunk);
                    assert!(decoded.finished, "{framing} n={count} chunk={chunk}");
                    assert_eq!(decoded.names.len(), count);
                    assert_eq!(decoded.files.len(), count);
                    for (i, (name, data)) in items.iter().enumerate() {
                        assert_eq!(&decoded.names[i], name);
                        assert_eq!(&decoded.files[i], data, "{framing} n={count} file={i}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_empty_manifest() {
        for framing in [Framing::Marker, Framing::LengthPrefixed] {
            let bytes = encode_transfer(framing, &[]).unwrap();
            let decoded = decode_in_chunks(framing, &bytes, 1);
            assert!(decoded.finished);
            assert!(decoded.names.is_empty());
            assert!(decoded.files.is_empty());
        }
    }

    #[test]
    fn test_marker_wire_layout() {
        let items = vec![("a".to_string(), b"xy".to_vec()), ("b".to_string(), b"z".to_vec())];
        let bytes = encode_transfer(Framing::Marker, &items).unwrap();
        assert_eq!(bytes, br#"["a","b"]DONExyMOREzQUIT"#.to_vec());
    }

    #[test]
    fn test_length_framing_survives_marker_bytes() {
        let items = vec![
            ("one".to_string(), b"MOREQUITDONE".to_vec()),
            ("two".to_string(), b"QUIT".to_vec()),
        ];
        let bytes = encode_transfer(Framing::LengthPrefixed, &items).unwrap();
        assert_eq!(bytes[0], 0);
        let decoded = decode_in_chunks(Framing::LengthPrefixed, &bytes, 3);
        assert_eq!(decoded.files[0], b"MOREQUITDONE".to_vec());
        assert_eq!(decoded.files[1], b"QUIT".to_vec());
    }

    #[test]
    fn test_marker_framing_cuts_payload_at_embedded_marker() {
        // Known limitation of marker framing: an embedded MORE ends the file.
        let items = vec![
            ("one".to_string(), b"abMOREcd".to_vec()),
            ("two".to_string(), b"ef".to_vec()),
        ];
        let bytes = encode_transfer(Framing::Marker, &items).unwrap();
        let decoded = decode_in_chunks(Framing::Marker, &bytes, bytes.len());
        assert!(decoded.finished);
        assert_eq!(decoded.files[0], b"ab".to_vec());
        assert_eq!(decoded.files[1], b"cdMOREef".to_vec());
    }

    #[test]
    fn test_bare_markers() {
        for framing in [Framing::Marker, Framing::LengthPrefixed] {
            for (bytes, expected) in [
                (&b"BUSY"[..], TransferEvent::Busy),
                (&b"OK"[..], TransferEvent::Ok),
                (&b"FAIL"[..], TransferEvent::Fail),
            ] {
                let mut decoder = TransferDecoder::new(framing);
                decoder.feed(&bytes[..1]);
                assert_eq!(decoder.next_event().unwrap(), None);
                decoder.feed(&bytes[1..]);
                assert_eq!(decoder.next_event().unwrap(), Some(expected));
                assert!(decoder.is_done());
            }
        }
    }

    #[test]
    fn test_bytes_after_response_are_kept() {
        let mut decoder = TransferDecoder::new(Framing::LengthPrefixed);
        decoder.feed(b"OKBUSY");
        assert_eq!(decoder.next_event().unwrap(), Some(TransferEvent::Ok));
        assert_eq!(decoder.take_remaining(), b"BUSY".to_vec());
    }

    #[test]
    fn test_corrupt_manifest() {
        let mut decoder = TransferDecoder::new(Framing::Marker);
        decoder.feed(b"[1, 2]DONEdataQUIT");
        assert!(matches!(decoder.next_event(), Err(TransferError::Corrupt(_))));

        let mut decoder = TransferDecoder::new(Framing::LengthPrefixed);
        let mut bytes = 5u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"nopeXDONE");
        decoder.feed(&bytes);
        assert!(matches!(decoder.next_event(), Err(TransferError::Corrupt(_))));
    }

    #[test]
    fn test_unexpected_prefix() {
        let mut decoder = TransferDecoder::new(Framing::Marker);
        decoder.feed(b"OX");
        assert!(decoder.next_event().is_err());

        let mut decoder = TransferDecoder::new(Framing::LengthPrefixed);
        decoder.feed(b"[\"a\"]DONE");
        assert!(decoder.next_event().is_err());
    }

    #[test]
    fn test_framing_from_str() {
        assert_eq!("marker".parse::<Framing>().unwrap(), Framing::Marker);
        assert_eq!("Length".parse::<Framing>().unwrap(), Framing::LengthPrefixed);
        assert!("pickle".parse::<Framing>().is_err());
    }

    #[test]
    fn test_find() {
        assert_eq!(find(b"abcDONE", DONE), Some(3));
        assert_eq!(find(b"DON", DONE), None);
        assert_eq!(find(b"", DONE), None);
    }
}
