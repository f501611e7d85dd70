use bytes::Bytes;
use futures_util::Stream;
use memchr::memchr_iter;
use serde_json::Value;
use smallvec::SmallVec;

/// One decoded upstream `data:` payload.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamFrame {
    Chunk(Value),
    /// The literal `[DONE]` sentinel.
    Done,
}

/// FIFO of decoded frames, drained front-first without shifting.
struct PendingFrames {
    frames: SmallVec<[UpstreamFrame; 8]>,
    head: usize,
}

impl PendingFrames {
    #[inline]
    fn new() -> Self {
        Self {
            frames: SmallVec::new(),
            head: 0,
        }
    }

    #[inline]
    fn pop_front(&mut self) -> Option<UpstreamFrame> {
        if self.head >= self.frames.len() {
            return None;
        }
        let frame = std::mem::replace(&mut self.frames[self.head], UpstreamFrame::Done);
        self.head += 1;
        if self.head == self.frames.len() {
            self.frames.clear();
            self.head = 0;
        }
        Some(frame)
    }

    #[inline]
    fn extend_from_vec(&mut self, parsed: &mut Vec<UpstreamFrame>) {
        self.frames.extend(parsed.drain(..));
    }
}

// ---------------------------------------------------------------------------
// Line reader
// ---------------------------------------------------------------------------

/// Splits upstream text into `data:` lines and decodes their JSON payloads.
///
/// A partial line at the end of a read is buffered and completed by the next
/// read. Lines that are not `data:` lines or carry undecodable JSON are
/// skipped.
#[derive(Debug, Default)]
pub struct DataLineReader {
    buffer: String,
    read_offset: usize,
}

impl DataLineReader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed_into(&mut self, text: &str, out: &mut Vec<UpstreamFrame>) {
        self.buffer.push_str(text);
        let mut processed_up_to = self.read_offset;
        let scan_start = processed_up_to;
        for rel_pos in memchr_iter(b'\n', &self.buffer.as_bytes()[scan_start..]) {
            let line_end = scan_start + rel_pos;
            process_line(&self.buffer[processed_up_to..line_end], out);
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    /// Process a final line that arrived without a trailing newline.
    pub fn finish_into(&mut self, out: &mut Vec<UpstreamFrame>) {
        if self.read_offset < self.buffer.len() {
            process_line(&self.buffer[self.read_offset..], out);
        }
        self.buffer.clear();
        self.read_offset = 0;
    }
}

fn process_line(line: &str, out: &mut Vec<UpstreamFrame>) {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return;
    };
    let data = data.trim();
    if data.is_empty() {
        return;
    }
    if data == "[DONE]" {
        out.push(UpstreamFrame::Done);
        return;
    }
    match serde_json::from_str::<Value>(data) {
        Ok(chunk) => out.push(UpstreamFrame::Chunk(chunk)),
        Err(error) => {
            tracing::debug!(%error, line_len = data.len(), "skipping undecodable upstream line");
        }
    }
}

// ---------------------------------------------------------------------------
// UTF-8 reassembly
// ---------------------------------------------------------------------------

/// Decodes a byte stream as UTF-8, carrying a character split across reads
/// into the next read. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Carry {
    carry: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, bytes: &[u8]) -> String {
        if self.carry.is_empty() {
            if let Ok(text) = std::str::from_utf8(bytes) {
                return text.to_owned();
            }
        }
        self.carry.extend_from_slice(bytes);

        let mut out = String::with_capacity(self.carry.len());
        let mut pos = 0;
        while pos < self.carry.len() {
            match std::str::from_utf8(&self.carry[pos..]) {
                Ok(text) => {
                    out.push_str(text);
                    pos = self.carry.len();
                }
                Err(error) => {
                    let valid = pos + error.valid_up_to();
                    if let Ok(text) = std::str::from_utf8(&self.carry[pos..valid]) {
                        out.push_str(text);
                    }
                    match error.error_len() {
                        Some(len) => {
                            out.push('\u{fffd}');
                            pos = valid + len;
                        }
                        None => {
                            pos = valid;
                            break;
                        }
                    }
                }
            }
        }
        self.carry.drain(..pos);
        out
    }

    fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        tail
    }
}

// ---------------------------------------------------------------------------
// Stream adapter
// ---------------------------------------------------------------------------

struct FrameReaderState<S> {
    stream: std::pin::Pin<Box<S>>,
    reader: DataLineReader,
    utf8: Utf8Carry,
    parsed: Vec<UpstreamFrame>,
    pending: PendingFrames,
    exhausted: bool,
}

/// Turn an upstream response body into decoded frames.
///
/// A transport error is yielded once and ends the stream. At end of input a
/// trailing unterminated line is still decoded.
pub fn upstream_frame_stream<S, E>(byte_stream: S) -> impl Stream<Item = Result<UpstreamFrame, E>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Send + 'static,
{
    use futures_util::StreamExt;

    let state = FrameReaderState {
        stream: Box::pin(byte_stream),
        reader: DataLineReader::new(),
        utf8: Utf8Carry::default(),
        parsed: Vec::with_capacity(8),
        pending: PendingFrames::new(),
        exhausted: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.pending.pop_front() {
                return Some((Ok(frame), state));
            }
            if state.exhausted {
                return None;
            }
            match state.stream.as_mut().next().await {
                Some(Ok(bytes)) => {
                    let text = state.utf8.decode(&bytes);
                    state.reader.feed_into(&text, &mut state.parsed);
                }
                Some(Err(error)) => {
                    state.exhausted = true;
                    return Some((Err(error), state));
                }
                None => {
                    state.exhausted = true;
                    let tail = state.utf8.finish();
                    state.reader.feed_into(&tail, &mut state.parsed);
                    state.reader.finish_into(&mut state.parsed);
                }
            }
            state.pending.extend_from_vec(&mut state.parsed);
        }
    })
}
