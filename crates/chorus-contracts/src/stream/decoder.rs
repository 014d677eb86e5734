use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::error::StreamError;
use super::events::{decode_line, StreamEvent};

const READ_CHUNK: usize = 8 * 1024;

/// Splits a byte stream into lines, holding partial lines (and partial UTF-8
/// sequences) until the rest arrives.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every non-blank line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(text) = non_blank(&line) {
                lines.push(text);
            }
        }
        lines
    }

    /// Flushes a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        non_blank(&rest)
    }
}

fn non_blank(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Shared cancellation flag for one in-flight request.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Lazy iterator of decoded events over one response body.
///
/// Ends at EOF, after a read error, or as soon as the abort signal is seen.
/// Malformed lines are yielded as [`StreamError::Malformed`] and the stream
/// carries on.
pub struct EventStream<R: Read> {
    reader: R,
    decoder: LineDecoder,
    pending: VecDeque<String>,
    signal: AbortSignal,
    finished: bool,
    aborted: bool,
}

impl<R: Read> EventStream<R> {
    pub fn new(reader: R, signal: AbortSignal) -> Self {
        Self {
            reader,
            decoder: LineDecoder::new(),
            pending: VecDeque::new(),
            signal,
            finished: false,
            aborted: false,
        }
    }

    /// True if the stream stopped because its signal fired.
    pub fn was_aborted(&self) -> bool {
        self.aborted
    }

    fn fill(&mut self) -> Result<(), StreamError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.reader.read(&mut chunk) {
                Ok(0) => {
                    self.finished = true;
                    self.pending.extend(self.decoder.finish());
                    return Ok(());
                }
                Ok(n) => {
                    self.pending.extend(self.decoder.push(&chunk[..n]));
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.finished = true;
                    return Err(err.into());
                }
            }
        }
    }
}

impl<R: Read> Iterator for EventStream<R> {
    type Item = Result<StreamEvent, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.aborted {
                return None;
            }
            if self.signal.is_aborted() {
                self.aborted = true;
                self.finished = true;
                self.pending.clear();
                return None;
            }
            if let Some(line) = self.pending.pop_front() {
                match decode_line(&line) {
                    Ok(Some(event)) => return Some(Ok(event)),
                    Ok(None) => continue,
                    Err(source) => return Some(Err(StreamError::Malformed { line, source })),
                }
            }
            if self.finished {
                return None;
            }
            if let Err(err) = self.fill() {
                return Some(Err(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Read};

    use super::{AbortSignal, EventStream, LineDecoder};
    use crate::stream::{StreamError, StreamEvent};

    /// Hands out the body in fixed-size pieces, like a network socket.
    struct Chunked {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Chunked {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let end = (self.pos + self.step).min(self.data.len()).min(self.pos + buf.len());
            let n = end - self.pos;
            buf[..n].copy_from_slice(&self.data[self.pos..end]);
            self.pos = end;
            Ok(n)
        }
    }

    struct Failing;

    impl Read for Failing {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
        }
    }

    const BODY: &str = concat!(
        "{\"type\":\"bot_response\",\"botId\":\"gpt\",\"response\":\"안녕하세요\",\"requestId\":\"req-1\"}\n",
        "\n",
        "{\"type\":\"bot_error\",\"botId\":\"claude\",\"error\":\"down\"}\n",
        "{\"type\":\"analysis\",\"best_response\":\"x\",\"reasoning\":\"y\"}"
    );

    #[test]
    fn line_decoder_joins_split_chunks() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"{\"a\":").is_empty());
        assert_eq!(decoder.push(b"1}\n{\"b\""), vec!["{\"a\":1}"]);
        assert_eq!(decoder.push(b":2}\r\n\n"), vec!["{\"b\":2}"]);
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn multibyte_text_survives_any_chunk_size() -> anyhow::Result<()> {
        for step in [1, 2, 3, 7, 64, 4096] {
            let reader = Chunked {
                data: BODY.as_bytes().to_vec(),
                pos: 0,
                step,
            };
            let events: Vec<StreamEvent> =
                EventStream::new(reader, AbortSignal::new()).collect::<Result<_, _>>()?;
            assert_eq!(events.len(), 3, "step {step}");
            let StreamEvent::BotResponse(first) = &events[0] else {
                anyhow::bail!("expected bot_response first");
            };
            assert_eq!(first.response, "안녕하세요");
            assert_eq!(events[2].kind(), "analysis");
        }
        Ok(())
    }

    #[test]
    fn malformed_lines_are_reported_and_skipped() {
        let body = "{oops\n{\"type\":\"bot_response\",\"botId\":\"gpt\",\"response\":\"ok\"}\n";
        let items: Vec<_> = EventStream::new(body.as_bytes(), AbortSignal::new()).collect();
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Err(StreamError::Malformed { line, .. }) if line == "{oops"));
        assert!(matches!(&items[1], Ok(StreamEvent::BotResponse(_))));
    }

    #[test]
    fn abort_stops_the_stream() {
        let signal = AbortSignal::new();
        let mut stream = EventStream::new(BODY.as_bytes(), signal.clone());
        assert!(matches!(stream.next(), Some(Ok(_))));
        signal.abort();
        assert!(stream.next().is_none());
        assert!(stream.was_aborted());
        assert!(stream.next().is_none());
    }

    #[test]
    fn read_errors_end_the_stream() {
        let mut stream = EventStream::new(Failing, AbortSignal::new());
        match stream.next() {
            Some(Err(err @ StreamError::Io(_))) => assert!(!err.is_recoverable()),
            other => panic!("expected read error, got {other:?}"),
        }
        assert!(stream.next().is_none());
    }
}
