//! SSE-aware streaming forwarder.
//!
//! Two line-framed adapters over the upstream byte stream: [`NativeTap`]
//! forwards the native event stream verbatim while extracting usage on the
//! side, [`TranslatedStream`] re-emits it as OpenAI chat-completion chunks.
//! Both record exactly one ledger entry when the stream ends, errors out, or
//! is dropped by a disconnecting client.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Local};
use futures_util::Stream;

use crate::conversion::{map_stop_reason, stream_chunk, ChunkPayload};
use crate::ledger::{Ledger, RequestRecord};
use crate::models::anthropic::StreamEvent;
use crate::pricing::PricingTable;

const DATA_PREFIX: &[u8] = b"data: ";

/// Token counters picked out of the event stream in flight.
#[derive(Debug, Clone, Default)]
pub struct UsageCapture {
    pub message_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

impl UsageCapture {
    /// Fold one decoded event into the running counters. `message_start`
    /// fixes the input-side counters, each `message_delta` overwrites the
    /// output count with the latest cumulative value.
    pub fn observe(&mut self, event: &StreamEvent) {
        match event.kind.as_str() {
            "message_start" => {
                self.message_id = event.message.id.clone();
                self.input_tokens = event.message.usage.input_tokens;
                self.cache_read = event.message.usage.cache_read_input_tokens;
                self.cache_write = event.message.usage.cache_creation_input_tokens;
            }
            "message_delta" => {
                self.output_tokens = event.usage.output_tokens;
            }
            _ => {}
        }
    }
}

/// Decode the JSON payload of a `data:` line. Returns `None` for non-data
/// lines, the `[DONE]` terminator, and frames that fail to parse — a bad
/// frame is ignored for extraction but still forwarded by the caller.
pub fn parse_data_frame(line: &[u8]) -> Option<StreamEvent> {
    let payload = line.strip_prefix(DATA_PREFIX)?;
    if payload == b"[DONE]" {
        return None;
    }
    serde_json::from_slice(payload).ok()
}

/// One-shot ledger bookkeeping for a single exchange. Latency runs from
/// construction; whichever finish method is called first wins.
pub struct ExchangeRecorder {
    ledger: Arc<Ledger>,
    pricing: Arc<PricingTable>,
    model: String,
    timestamp: DateTime<Local>,
    started: Instant,
}

impl ExchangeRecorder {
    pub fn new(ledger: Arc<Ledger>, pricing: Arc<PricingTable>, model: String) -> Self {
        Self {
            ledger,
            pricing,
            model,
            timestamp: Local::now(),
            started: Instant::now(),
        }
    }

    /// Record a completed exchange with the captured counters.
    pub fn finish(self, usage: &UsageCapture, status: u16) {
        let cost = self.pricing.cost(
            &self.model,
            usage.input_tokens,
            usage.output_tokens,
            usage.cache_read,
            usage.cache_write,
        );
        self.ledger.record(RequestRecord {
            id: 0,
            timestamp: self.timestamp,
            model: self.model,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read: usage.cache_read,
            cache_write: usage.cache_write,
            cost,
            latency: self.started.elapsed(),
            status,
            error: None,
        });
    }

    /// Record a failed exchange: zero tokens, zero cost, error string set.
    pub fn finish_error(self, error: String, status: u16) {
        self.ledger.record(RequestRecord {
            id: 0,
            timestamp: self.timestamp,
            model: self.model,
            input_tokens: 0,
            output_tokens: 0,
            cache_read: 0,
            cache_write: 0,
            cost: 0.0,
            latency: self.started.elapsed(),
            status,
            error: Some(error),
        });
    }
}

/// Pop the next complete line out of `buf`, stripping the `\n` and an
/// optional preceding `\r`. Lines grow with the buffer, so payloads past
/// 1 MiB come through intact.
fn next_line(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let mut line: Vec<u8> = buf.drain(..=pos).collect();
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Some(line)
}

/// Native passthrough: every upstream line is forwarded as `line + "\n"`
/// (blank separators included) while `data:` frames feed the usage capture.
pub struct NativeTap<S> {
    inner: S,
    buf: Vec<u8>,
    usage: UsageCapture,
    recorder: Option<ExchangeRecorder>,
    status: u16,
    done: bool,
}

impl<S> NativeTap<S> {
    pub fn new(inner: S, recorder: ExchangeRecorder, status: u16) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            usage: UsageCapture::default(),
            recorder: Some(recorder),
            status,
            done: false,
        }
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let line = next_line(&mut self.buf)?;
        if let Some(event) = parse_data_frame(&line) {
            self.usage.observe(&event);
        }
        Some(line)
    }

    fn finalize(&mut self) {
        if let Some(recorder) = self.recorder.take() {
            recorder.finish(&self.usage, self.status);
        }
    }
}

impl<S> Stream for NativeTap<S>
where
    S: Stream<Item = Result<Bytes, io::Error>> + Unpin,
{
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            let mut out = Vec::new();
            while let Some(line) = this.take_line() {
                out.extend_from_slice(&line);
                out.push(b'\n');
            }
            if !out.is_empty() {
                return Poll::Ready(Some(Ok(Bytes::from(out))));
            }

            if this.done {
                if !this.buf.is_empty() {
                    // Trailing line without a terminator still counts.
                    let mut line = std::mem::take(&mut this.buf);
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    if let Some(event) = parse_data_frame(&line) {
                        this.usage.observe(&event);
                    }
                    line.push(b'\n');
                    return Poll::Ready(Some(Ok(Bytes::from(line))));
                }
                this.finalize();
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => this.buf.extend_from_slice(&chunk),
                Poll::Ready(Some(Err(err))) => {
                    // Record what was seen so far; the connection is torn
                    // down by the error propagating below.
                    this.finalize();
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => this.done = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> Drop for NativeTap<S> {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// Translated streaming: native events in, OpenAI chunk frames out.
pub struct TranslatedStream<S> {
    inner: S,
    buf: Vec<u8>,
    model: String,
    usage: UsageCapture,
    sent_role: bool,
    recorder: Option<ExchangeRecorder>,
    status: u16,
    done: bool,
}

impl<S> TranslatedStream<S> {
    pub fn new(inner: S, model: String, recorder: ExchangeRecorder, status: u16) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            model,
            usage: UsageCapture::default(),
            sent_role: false,
            recorder: Some(recorder),
            status,
            done: false,
        }
    }

    fn encode(&self, payload: ChunkPayload) -> Vec<u8> {
        let chunk = stream_chunk(&self.usage.message_id, &self.model, payload);
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(DATA_PREFIX);
        out.extend_from_slice(&serde_json::to_vec(&chunk).unwrap_or_default());
        out.extend_from_slice(b"\n\n");
        out
    }

    /// Translate one upstream line into zero or more output frames.
    fn translate_line(&mut self, line: &[u8]) -> Option<Vec<u8>> {
        let event = parse_data_frame(line)?;
        self.usage.observe(&event);

        match event.kind.as_str() {
            "message_start" => {
                if !self.sent_role {
                    self.sent_role = true;
                    return Some(self.encode(ChunkPayload::Role));
                }
                None
            }
            "content_block_delta" => {
                if event.delta.kind == "text_delta" && !event.delta.text.is_empty() {
                    return Some(self.encode(ChunkPayload::Text(event.delta.text)));
                }
                None
            }
            "message_delta" => {
                let reason = map_stop_reason(&event.delta.stop_reason);
                Some(self.encode(ChunkPayload::Finish(reason)))
            }
            "message_stop" => Some(b"data: [DONE]\n\n".to_vec()),
            _ => None,
        }
    }

    fn finalize(&mut self) {
        if let Some(recorder) = self.recorder.take() {
            recorder.finish(&self.usage, self.status);
        }
    }
}

impl<S> Stream for TranslatedStream<S>
where
    S: Stream<Item = Result<Bytes, io::Error>> + Unpin,
{
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            let mut out = Vec::new();
            while let Some(line) = next_line(&mut this.buf) {
                if let Some(frame) = this.translate_line(&line) {
                    out.extend_from_slice(&frame);
                }
            }
            if !out.is_empty() {
                return Poll::Ready(Some(Ok(Bytes::from(out))));
            }

            if this.done {
                if !this.buf.is_empty() {
                    let line = std::mem::take(&mut this.buf);
                    if let Some(frame) = this.translate_line(&line) {
                        return Poll::Ready(Some(Ok(Bytes::from(frame))));
                    }
                }
                this.finalize();
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => this.buf.extend_from_slice(&chunk),
                Poll::Ready(Some(Err(err))) => {
                    this.finalize();
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => this.done = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> Drop for TranslatedStream<S> {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};

    fn chunked(parts: Vec<&str>) -> impl Stream<Item = Result<Bytes, io::Error>> + Unpin {
        stream::iter(
            parts
                .into_iter()
                .map(|p| Ok(Bytes::from(p.as_bytes().to_vec())))
                .collect::<Vec<_>>(),
        )
    }

    fn recorder(ledger: &Arc<Ledger>, model: &str) -> ExchangeRecorder {
        ExchangeRecorder::new(
            ledger.clone(),
            Arc::new(PricingTable::default()),
            model.to_string(),
        )
    }

    const NATIVE_STREAM: &str = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"abc\",\"usage\":{\"input_tokens\":10,\"cache_read_input_tokens\":5,\"cache_creation_input_tokens\":0}}}\n",
        "\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"he\"}}\n",
        "\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"llo\"}}\n",
        "\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n",
        "\n",
        "data: {\"type\":\"message_stop\"}\n",
        "\n",
    );

    async fn collect(s: impl Stream<Item = Result<Bytes, io::Error>> + Unpin) -> String {
        let mut out = Vec::new();
        let mut s = s;
        while let Some(item) = s.next().await {
            out.extend_from_slice(&item.expect("stream error"));
        }
        String::from_utf8(out).expect("utf8")
    }

    #[tokio::test]
    async fn native_tap_forwards_verbatim_and_captures_usage() {
        let ledger = Arc::new(Ledger::new());
        // Split at awkward places, including mid-line.
        let upstream = chunked(vec![
            &NATIVE_STREAM[..40],
            &NATIVE_STREAM[40..41],
            &NATIVE_STREAM[41..200],
            &NATIVE_STREAM[200..],
        ]);
        let tap = NativeTap::new(upstream, recorder(&ledger, "claude-sonnet-4"), 200);

        let body = collect(tap).await;
        assert_eq!(body, NATIVE_STREAM);

        let records = ledger.all();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.input_tokens, 10);
        assert_eq!(r.output_tokens, 2);
        assert_eq!(r.cache_read, 5);
        assert_eq!(r.cache_write, 0);
        assert_eq!(r.status, 200);
        assert!(r.error.is_none());
        assert!(r.cost > 0.0);
    }

    #[tokio::test]
    async fn native_tap_ignores_unparsable_frames_but_forwards_them() {
        let ledger = Arc::new(Ledger::new());
        let input = "data: {not json\ndata: [DONE]\n";
        let tap = NativeTap::new(chunked(vec![input]), recorder(&ledger, "m"), 200);
        let body = collect(tap).await;
        assert_eq!(body, input);
        assert_eq!(ledger.all()[0].input_tokens, 0);
    }

    #[tokio::test]
    async fn native_tap_handles_lines_past_one_mebibyte() {
        let ledger = Arc::new(Ledger::new());
        let big = format!(
            "data: {{\"type\":\"ping\",\"pad\":\"{}\"}}\n",
            "x".repeat(1024 * 1024 + 512)
        );
        let tap = NativeTap::new(
            stream::iter(vec![Ok(Bytes::from(big.clone()))]),
            recorder(&ledger, "m"),
            200,
        );
        let body = collect(tap).await;
        assert_eq!(body.len(), big.len());
        assert_eq!(ledger.all().len(), 1);
    }

    #[tokio::test]
    async fn translated_stream_emits_chunk_sequence() {
        let ledger = Arc::new(Ledger::new());
        let upstream = chunked(vec![NATIVE_STREAM]);
        let translated = TranslatedStream::new(
            upstream,
            "claude-sonnet-4".to_string(),
            recorder(&ledger, "claude-sonnet-4"),
            200,
        );

        let body = collect(translated).await;
        let frames: Vec<&str> = body
            .split("\n\n")
            .filter(|f| !f.is_empty())
            .collect();
        assert_eq!(frames.len(), 5);

        let chunk = |i: usize| -> serde_json::Value {
            serde_json::from_str(frames[i].strip_prefix("data: ").unwrap()).unwrap()
        };

        assert_eq!(chunk(0)["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(chunk(0)["choices"][0]["delta"]["content"], "");
        assert_eq!(chunk(0)["id"], "chatcmpl-abc");
        assert_eq!(chunk(0)["model"], "claude-sonnet-4");
        assert_eq!(chunk(1)["choices"][0]["delta"]["content"], "he");
        assert_eq!(chunk(2)["choices"][0]["delta"]["content"], "llo");
        assert_eq!(chunk(3)["choices"][0]["finish_reason"], "stop");
        assert!(chunk(3)["choices"][0].get("delta").is_none());
        assert_eq!(frames[4], "data: [DONE]");

        let r = &ledger.all()[0];
        assert_eq!(r.input_tokens, 10);
        assert_eq!(r.output_tokens, 2);
        assert_eq!(r.cache_read, 5);
    }

    #[tokio::test]
    async fn translated_stream_records_on_mid_stream_error() {
        let ledger = Arc::new(Ledger::new());
        let items: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from(
                "data: {\"type\":\"message_start\",\"message\":{\"id\":\"x\",\"usage\":{\"input_tokens\":7}}}\n",
            )),
            Err(io::Error::other("upstream reset")),
        ];
        let mut translated = TranslatedStream::new(
            stream::iter(items),
            "m".to_string(),
            recorder(&ledger, "m"),
            200,
        );

        let first = translated.next().await.unwrap().unwrap();
        assert!(first.starts_with(DATA_PREFIX));
        let err = translated.next().await.unwrap();
        assert!(err.is_err());

        let records = ledger.all();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].input_tokens, 7);
        assert_eq!(records[0].status, 200);
    }

    #[tokio::test]
    async fn dropping_a_stream_records_once() {
        let ledger = Arc::new(Ledger::new());
        let tap = NativeTap::new(
            chunked(vec!["data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":3}}\n"]),
            recorder(&ledger, "m"),
            200,
        );
        drop(tap);
        let records = ledger.all();
        assert_eq!(records.len(), 1);
        // Nothing was polled, so no counters were captured.
        assert_eq!(records[0].output_tokens, 0);
    }
}
