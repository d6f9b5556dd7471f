//! SSE decoding for the streaming turn feed.
//!
//! The decoder owns a byte buffer so a frame split across read
//! boundaries is reassembled before parsing. Frames are delimited by a
//! double newline (LF and CRLF both accepted); `data:` lines inside a
//! frame are joined and parsed as one JSON object.

use std::collections::HashMap;
use std::pin::Pin;

use futures_util::Stream;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ProtocolError, ProtocolResult};
use crate::events::StreamingEvent;

/// Boxed decoded-event stream, for callers that do not want to carry
/// the transport's concrete stream type.
pub type EventStream = Pin<Box<dyn Stream<Item = ProtocolResult<StreamingEvent>> + Send>>;

const KNOWN_TAGS: &[&str] = &[
    "text.delta",
    "tool_call.started",
    "tool_call.delta",
    "tool_call.completed",
    "reasoning.delta",
    "reasoning.summary",
    "usage.update",
    "turn.completed",
    "error",
];

/// Decodes an incrementally arriving byte stream into [`StreamingEvent`]s.
///
/// The decoder is not restartable: once it yields an error or the wire
/// `error` event, it is fused and a new stream must be requested.
pub struct SseDecoder<S> {
    inner: S,
    buffer: Vec<u8>,
    last_seq: HashMap<usize, u64>,
    saw_terminal: bool,
    done: bool,
}

impl<S> SseDecoder<S> {
    pub fn new(stream: S) -> Self {
        Self {
            inner: stream,
            buffer: Vec::new(),
            last_seq: HashMap::new(),
            saw_terminal: false,
            done: false,
        }
    }

    /// Extracts the next complete frame from the buffer, if any.
    ///
    /// `Ok(None)` means no complete frame is buffered yet. Frames that
    /// carry no `data:` payload (comments, `[DONE]`) are consumed and
    /// skipped in place.
    fn next_buffered_event(&mut self) -> ProtocolResult<Option<StreamingEvent>> {
        loop {
            let Some((pos, delim_len)) = find_double_newline(&self.buffer) else {
                return Ok(None);
            };

            let chunk = self.buffer.drain(..pos).collect::<Vec<u8>>();
            self.buffer.drain(..delim_len);

            let chunk_text = String::from_utf8_lossy(&chunk);
            match parse_sse_data(&chunk_text)? {
                Some(value) => return self.map_frame(value).map(Some),
                None => continue,
            }
        }
    }

    /// Maps one parsed JSON frame to a typed event.
    fn map_frame(&mut self, value: Value) -> ProtocolResult<StreamingEvent> {
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        if !KNOWN_TAGS.contains(&tag.as_str()) {
            warn!(tag = %tag, "unrecognized frame tag, passing through as unknown");
            return Ok(StreamingEvent::Unknown { kind: tag });
        }

        let event: StreamingEvent = serde_json::from_value(value)
            .map_err(|err| ProtocolError::decode(format!("malformed {tag} frame: {err}")))?;

        self.check_order(&event)?;

        if event.is_terminal() {
            self.saw_terminal = true;
        }
        Ok(event)
    }

    /// Enforces per-item non-decreasing sequence numbers.
    fn check_order(&mut self, event: &StreamingEvent) -> ProtocolResult<()> {
        let Some((item, seq)) = event.ordering_key() else {
            return Ok(());
        };
        match self.last_seq.get_mut(&item) {
            Some(last) if seq < *last => Err(ProtocolError::out_of_order(item, *last, seq)),
            Some(last) => {
                *last = seq;
                Ok(())
            }
            None => {
                self.last_seq.insert(item, seq);
                Ok(())
            }
        }
    }

    /// Handles end of input: drains whatever is still buffered, then
    /// decides between clean termination and an incomplete-turn error.
    fn finish(&mut self) -> Option<ProtocolResult<StreamingEvent>> {
        // A final frame may have arrived without a trailing delimiter.
        if !self.buffer.iter().all(u8::is_ascii_whitespace) {
            self.buffer.extend_from_slice(b"\n\n");
            match self.next_buffered_event() {
                Ok(Some(event)) => {
                    if matches!(event, StreamingEvent::Error { .. }) {
                        self.done = true;
                    }
                    return Some(Ok(event));
                }
                Ok(None) => {}
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }

        self.done = true;
        if self.saw_terminal {
            None
        } else {
            Some(Err(ProtocolError::incomplete_turn()))
        }
    }
}

impl<S, E> Stream for SseDecoder<S>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = ProtocolResult<StreamingEvent>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;

        loop {
            if self.done {
                return Poll::Ready(None);
            }

            match self.next_buffered_event() {
                Ok(Some(event)) => {
                    debug!(?event, "decoded frame");
                    if matches!(event, StreamingEvent::Error { .. }) {
                        // No further events follow a wire error.
                        self.done = true;
                    }
                    return Poll::Ready(Some(Ok(event)));
                }
                Ok(None) => {}
                Err(err) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(err)));
                }
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    self.buffer.extend_from_slice(&bytes);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(ProtocolError::transport(format!(
                        "stream delivery failed: {e}"
                    )))));
                }
                Poll::Ready(None) => {
                    return Poll::Ready(self.finish());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Finds the position of a double newline in the buffer.
/// Handles both LF (\n\n) and CRLF (\r\n\r\n) delimiters.
/// Returns the position and the delimiter length (2 or 4 bytes).
fn find_double_newline(buffer: &[u8]) -> Option<(usize, usize)> {
    let crlf_pos = buffer.windows(4).position(|w| w == b"\r\n\r\n");
    let lf_pos = buffer.windows(2).position(|w| w == b"\n\n");

    match (crlf_pos, lf_pos) {
        (Some(c), Some(l)) => {
            if l <= c {
                Some((l, 2))
            } else {
                Some((c, 4))
            }
        }
        (Some(c), None) => Some((c, 4)),
        (None, Some(l)) => Some((l, 2)),
        (None, None) => None,
    }
}

/// Joins the `data:` lines of one SSE frame and parses them as JSON.
/// Returns `None` for frames with no payload and for `[DONE]` markers.
fn parse_sse_data(chunk: &str) -> ProtocolResult<Option<Value>> {
    let mut data_lines = Vec::new();
    for line in chunk.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim());
        }
    }
    if data_lines.is_empty() {
        return Ok(None);
    }
    let data = data_lines.join("\n");
    let trimmed = data.trim();
    if trimmed.is_empty() || trimmed == "[DONE]" {
        return Ok(None);
    }
    let value = serde_json::from_str::<Value>(trimmed)
        .map_err(|err| ProtocolError::decode(format!("frame is not valid JSON: {err}")))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures_util::{StreamExt, stream};

    use super::*;
    use crate::error::ProtocolErrorKind;

    fn decoder_over(
        chunks: Vec<&str>,
    ) -> SseDecoder<impl Stream<Item = Result<Bytes, std::io::Error>> + Unpin> {
        let owned: Vec<Result<Bytes, std::io::Error>> = chunks
            .into_iter()
            .map(|c| Ok(Bytes::copy_from_slice(c.as_bytes())))
            .collect();
        SseDecoder::new(stream::iter(owned))
    }

    async fn collect(
        mut decoder: SseDecoder<impl Stream<Item = Result<Bytes, std::io::Error>> + Unpin>,
    ) -> Vec<ProtocolResult<StreamingEvent>> {
        let mut out = Vec::new();
        while let Some(item) = decoder.next().await {
            out.push(item);
        }
        out
    }

    fn frame(json: &str) -> String {
        format!("data: {json}\n\n")
    }

    const TERMINAL: &str =
        r#"{"type":"turn.completed","item":0,"seq":99,"continuation":"cont_1"}"#;

    #[tokio::test]
    async fn decodes_text_deltas_in_order() {
        let body = [
            frame(r#"{"type":"text.delta","item":0,"seq":0,"text":"Hel"}"#),
            frame(r#"{"type":"text.delta","item":0,"seq":1,"text":"lo"}"#),
            frame(TERMINAL),
        ]
        .concat();
        let events = collect(decoder_over(vec![&body])).await;

        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0].as_ref().unwrap(),
            &StreamingEvent::TextDelta {
                item: 0,
                seq: 0,
                text: "Hel".to_string()
            }
        );
        assert!(matches!(
            events[2].as_ref().unwrap(),
            StreamingEvent::TurnCompleted { continuation, .. } if continuation == "cont_1"
        ));
    }

    #[tokio::test]
    async fn reassembles_frame_split_across_reads() {
        let events = collect(decoder_over(vec![
            "data: {\"type\":\"text.delta\",\"it",
            "em\":0,\"seq\":0,\"text\":\"hi\"}\n",
            "\n",
            &frame(TERMINAL),
        ]))
        .await;

        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            StreamingEvent::TextDelta { text, .. } if text == "hi"
        ));
    }

    #[tokio::test]
    async fn accepts_crlf_delimiters() {
        let body = format!(
            "data: {}\r\n\r\ndata: {}\r\n\r\n",
            r#"{"type":"text.delta","item":0,"seq":0,"text":"a"}"#, TERMINAL,
        );
        let events = collect(decoder_over(vec![&body])).await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn unknown_tag_passes_through_without_stalling() {
        let body = [
            frame(r#"{"type":"totally.new","item":3,"payload":true}"#),
            frame(r#"{"type":"text.delta","item":0,"seq":0,"text":"still fine"}"#),
            frame(TERMINAL),
        ]
        .concat();
        let events = collect(decoder_over(vec![&body])).await;

        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0].as_ref().unwrap(),
            &StreamingEvent::Unknown {
                kind: "totally.new".to_string()
            }
        );
        assert!(matches!(
            events[1].as_ref().unwrap(),
            StreamingEvent::TextDelta { .. }
        ));
    }

    #[tokio::test]
    async fn wire_error_event_fuses_the_stream() {
        let body = [
            frame(r#"{"type":"error","code":"overloaded","message":"try later"}"#),
            frame(r#"{"type":"text.delta","item":0,"seq":0,"text":"never seen"}"#),
        ]
        .concat();
        let events = collect(decoder_over(vec![&body])).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            StreamingEvent::Error { code, .. } if code == "overloaded"
        ));
    }

    #[tokio::test]
    async fn closure_without_terminal_is_incomplete_turn() {
        let body = frame(r#"{"type":"text.delta","item":0,"seq":0,"text":"partial"}"#);
        let events = collect(decoder_over(vec![&body])).await;

        assert_eq!(events.len(), 2);
        let err = events[1].as_ref().unwrap_err();
        assert_eq!(err.kind(), ProtocolErrorKind::IncompleteTurn);
    }

    #[tokio::test]
    async fn sequence_regression_is_out_of_order() {
        let body = [
            frame(r#"{"type":"text.delta","item":0,"seq":5,"text":"a"}"#),
            frame(r#"{"type":"text.delta","item":0,"seq":2,"text":"b"}"#),
        ]
        .concat();
        let events = collect(decoder_over(vec![&body])).await;

        assert_eq!(events.len(), 2);
        let err = events[1].as_ref().unwrap_err();
        assert_eq!(err.kind(), ProtocolErrorKind::OutOfOrder);
    }

    #[tokio::test]
    async fn equal_sequence_numbers_are_tolerated() {
        // The wire may re-emit a frame boundary; only regression is a
        // violation.
        let body = [
            frame(r#"{"type":"text.delta","item":0,"seq":1,"text":"a"}"#),
            frame(r#"{"type":"text.delta","item":0,"seq":1,"text":"b"}"#),
            frame(TERMINAL),
        ]
        .concat();
        let events = collect(decoder_over(vec![&body])).await;
        assert!(events.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn done_marker_and_empty_frames_are_skipped() {
        let body = format!(": keep-alive\n\ndata:\n\n{}data: [DONE]\n\n", frame(TERMINAL));
        let events = collect(decoder_over(vec![&body])).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            StreamingEvent::TurnCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn inner_stream_failure_is_a_transport_error() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(
                b"data: {\"type\":\"text.delta\",\"item\":0,\"seq\":0,\"text\":\"a\"}\n\n",
            )),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )),
        ];
        let events = collect(SseDecoder::new(stream::iter(chunks))).await;

        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        let err = events[1].as_ref().unwrap_err();
        assert_eq!(err.kind(), ProtocolErrorKind::Transport);
        // Fused: a delivery failure ends the stream.
    }

    #[tokio::test]
    async fn malformed_known_frame_is_a_decode_error() {
        let body = frame(r#"{"type":"text.delta","item":"not a number"}"#);
        let events = collect(decoder_over(vec![&body])).await;

        assert_eq!(events.len(), 1);
        let err = events[0].as_ref().unwrap_err();
        assert_eq!(err.kind(), ProtocolErrorKind::Decode);
    }

    #[tokio::test]
    async fn trailing_frame_without_delimiter_is_flushed_on_close() {
        let body = format!(
            "{}data: {}",
            frame(r#"{"type":"text.delta","item":0,"seq":0,"text":"x"}"#),
            TERMINAL,
        );
        let events = collect(decoder_over(vec![&body])).await;

        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1].as_ref().unwrap(),
            StreamingEvent::TurnCompleted { .. }
        ));
    }
}
