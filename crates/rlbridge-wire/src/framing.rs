//! Terminator-delimited framing.
//!
//! Every message on the wire is followed by one terminator, either a newline
//! or a literal token such as `STEP`. A single read may carry several frames,
//! part of a frame, or a terminator split across two reads.
//!
//! # Wire format
//!
//! ```text
//! +-------------+------------+-------------+------------+
//! | Message 1   | Terminator | Message 2   | Terminator | ...
//! +-------------+------------+-------------+------------+
//! ```

use rlbridge_core::{Terminator, TransportError};

/// Split `buffer` into complete frames and the trailing leftover.
///
/// Every piece followed by `terminator` is a frame; whatever follows the last
/// terminator is returned as the leftover for the next call. An empty
/// terminator yields no frames.
///
/// ```
/// use rlbridge_wire::framing::split_frames;
/// let (frames, rest) = split_frames("A\nB\nC", "\n");
/// assert_eq!(frames, ["A", "B"]);
/// assert_eq!(rest, "C");
/// ```
pub fn split_frames(buffer: &str, terminator: &str) -> (Vec<String>, String) {
    if terminator.is_empty() {
        return (Vec::new(), buffer.to_string());
    }
    let mut pieces: Vec<&str> = buffer.split(terminator).collect();
    // `split` always yields at least one piece; the last one is unterminated.
    let leftover = pieces.pop().unwrap_or_default().to_string();
    (pieces.into_iter().map(str::to_string).collect(), leftover)
}

/// Append `terminator` to `message`, producing the bytes written to a socket.
pub fn frame(message: &str, terminator: &Terminator) -> Vec<u8> {
    let term = terminator.as_bytes();
    let mut out = Vec::with_capacity(message.len() + term.len());
    out.extend_from_slice(message.as_bytes());
    out.extend_from_slice(term);
    out
}

// ---------------------------------------------------------------------------
// FrameBuffer
// ---------------------------------------------------------------------------

/// Reassembles frames from a byte stream delivered in arbitrary chunks.
///
/// Bytes are kept raw until a full frame is available, so a multi-byte UTF-8
/// character split across reads decodes correctly. Frames are decoded lossily.
///
/// An unterminated tail longer than the limit is dropped on `push`.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    terminator: Vec<u8>,
    pending: Vec<u8>,
    limit: usize,
}

impl FrameBuffer {
    /// A buffer with no size limit.
    pub fn new(terminator: &Terminator) -> Self {
        Self::with_limit(terminator, usize::MAX)
    }

    /// A buffer that drops an unterminated tail longer than `limit` bytes.
    pub fn with_limit(terminator: &Terminator, limit: usize) -> Self {
        Self {
            terminator: terminator.as_bytes().to_vec(),
            pending: Vec::new(),
            limit,
        }
    }

    /// Append freshly read bytes.
    ///
    /// Complete frames already buffered are kept when the tail overflows.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.pending.extend_from_slice(bytes);
        let complete =
            rfind(&self.pending, &self.terminator).map_or(0, |at| at + self.terminator.len());
        let len = self.pending.len() - complete;
        if len > self.limit {
            self.pending.truncate(complete);
            return Err(TransportError::FrameTooLong {
                len,
                limit: self.limit,
            });
        }
        Ok(())
    }

    /// Remove and return the earliest complete frame, if any.
    pub fn next_frame(&mut self) -> Option<String> {
        let at = find(&self.pending, &self.terminator)?;
        let text = String::from_utf8_lossy(&self.pending[..at]).into_owned();
        self.pending.drain(..at + self.terminator.len());
        Some(text)
    }

    /// Remove and return every complete frame, oldest first.
    pub fn drain_frames(&mut self) -> Vec<String> {
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    /// Number of buffered bytes not yet part of a complete frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rlbridge_test_utils::rng::{random_chunks, seeded_rng};

    fn step() -> Terminator {
        Terminator::Token("STEP".into())
    }

    // ---- split_frames ----

    #[test]
    fn split_empty_buffer() {
        let (frames, rest) = split_frames("", "\n");
        assert!(frames.is_empty());
        assert_eq!(rest, "");
    }

    #[test]
    fn split_without_terminator_keeps_everything() {
        let (frames, rest) = split_frames("OBS=1,2", "\n");
        assert!(frames.is_empty());
        assert_eq!(rest, "OBS=1,2");
    }

    #[test]
    fn split_n_concatenated_frames() {
        for n in 0..6 {
            let messages: Vec<String> = (0..n).map(|i| format!("ACT={i}.0")).collect();
            let buffer: String = messages.iter().map(|m| format!("{m}STEP")).collect();
            let (frames, rest) = split_frames(&buffer, "STEP");
            assert_eq!(frames, messages);
            assert_eq!(rest, "");
        }
    }

    #[test]
    fn split_keeps_partial_tail() {
        let (frames, rest) = split_frames("ACT=1STEPACT=2ST", "STEP");
        assert_eq!(frames, ["ACT=1"]);
        assert_eq!(rest, "ACT=2ST");
    }

    #[test]
    fn split_empty_terminator_yields_nothing() {
        let (frames, rest) = split_frames("abc", "");
        assert!(frames.is_empty());
        assert_eq!(rest, "abc");
    }

    // ---- frame ----

    #[test]
    fn frame_appends_terminator() {
        assert_eq!(frame("RESET", &Terminator::Newline), b"RESET\n");
        assert_eq!(frame("RESET", &step()), b"RESETSTEP");
    }

    // ---- FrameBuffer ----

    #[test]
    fn terminator_split_across_pushes() {
        let mut buf = FrameBuffer::new(&step());
        buf.push(b"ACT=1.0,2.0ST").unwrap();
        assert_eq!(buf.next_frame(), None);
        buf.push(b"EP").unwrap();
        assert_eq!(buf.next_frame().as_deref(), Some("ACT=1.0,2.0"));
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn several_frames_in_one_push() {
        let mut buf = FrameBuffer::new(&Terminator::Newline);
        buf.push(b"A\nB\nC").unwrap();
        assert_eq!(buf.drain_frames(), ["A", "B"]);
        assert_eq!(buf.pending_len(), 1);
        buf.push(b"\n").unwrap();
        assert_eq!(buf.next_frame().as_deref(), Some("C"));
    }

    #[test]
    fn next_frame_returns_earliest_first() {
        let mut buf = FrameBuffer::new(&Terminator::Newline);
        buf.push(b"first\nsecond\n").unwrap();
        assert_eq!(buf.next_frame().as_deref(), Some("first"));
        assert_eq!(buf.next_frame().as_deref(), Some("second"));
        assert_eq!(buf.next_frame(), None);
    }

    #[test]
    fn utf8_split_across_reads() {
        let mut buf = FrameBuffer::new(&Terminator::Newline);
        let bytes = "é\n".as_bytes();
        buf.push(&bytes[..1]).unwrap();
        assert_eq!(buf.next_frame(), None);
        buf.push(&bytes[1..]).unwrap();
        assert_eq!(buf.next_frame().as_deref(), Some("é"));
    }

    #[test]
    fn clear_drops_partial_bytes() {
        let mut buf = FrameBuffer::new(&Terminator::Newline);
        buf.push(b"partial").unwrap();
        buf.clear();
        buf.push(b"x\n").unwrap();
        assert_eq!(buf.drain_frames(), ["x"]);
    }

    #[test]
    fn oversized_tail_is_dropped_and_reported() {
        let mut buf = FrameBuffer::with_limit(&step(), 8);
        buf.push(b"ACT=1STEP0123").unwrap();
        let err = buf.push(b"456789").unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLong { len: 10, limit: 8 }));
        // The complete frame before the runaway tail survives.
        assert_eq!(buf.drain_frames(), ["ACT=1"]);
        assert_eq!(buf.pending_len(), 0);

        buf.push(b"RESETSTEP").unwrap();
        assert_eq!(buf.next_frame().as_deref(), Some("RESET"));
    }

    #[test]
    fn limit_counts_only_the_unterminated_tail() {
        let mut buf = FrameBuffer::with_limit(&Terminator::Newline, 4);
        buf.push(b"abcd\nefgh\nij").unwrap();
        assert_eq!(buf.drain_frames(), ["abcd", "efgh"]);
        assert_eq!(buf.pending_len(), 2);
    }

    #[test]
    fn random_chunking_reassembles_same_frames() {
        let messages = ["OBS=1.00;REW=0.50;DONE=0", "RESET", "", "ACT=-1.25,3.00"];
        let stream: Vec<u8> = messages
            .iter()
            .flat_map(|m| frame(m, &step()))
            .collect();
        let mut rng = seeded_rng(11);
        for _ in 0..20 {
            let mut buf = FrameBuffer::new(&step());
            let mut frames = Vec::new();
            for chunk in random_chunks(&mut rng, &stream, 5) {
                buf.push(chunk).unwrap();
                frames.extend(buf.drain_frames());
            }
            assert_eq!(frames, messages);
            assert_eq!(buf.pending_len(), 0);
        }
    }
}
