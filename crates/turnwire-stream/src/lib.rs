//! Consumes the agent service's newline-delimited event stream.
//!
//! The consumer opens a streaming POST, decodes each frame into a
//! [`StreamEvent`] and hands it to the subscriber callback strictly in
//! arrival order. Nothing well-formed is ever dropped or reordered;
//! malformed lines are counted and skipped. A dropped connection triggers
//! resume with the last-seen sequence number, and once reconnect attempts
//! are exhausted a synthetic terminal error event is delivered so the state
//! machine fails cleanly instead of hanging.

use std::io::BufRead;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::json;
use thiserror::Error;
use turnwire_core::{
    CancelToken, EndpointConfig, EventKind, LimitsConfig, StreamEvent, decode_frame,
};
use uuid::Uuid;

/// Display length of response bodies echoed into error messages.
const ERROR_BODY_SNIPPET: usize = 200;

/// Invoked once per decoded event, on the thread running the consumer.
pub type EventCallback = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// Local transport failures. These never abort a turn by themselves; the
/// consumer either retries or converts them into a synthetic terminal event.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("stream read error: {0}")]
    Read(String),
    #[error("service rejected stream request ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// What to send when opening a turn stream.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub turn_id: Uuid,
    pub input: String,
}

impl StreamRequest {
    pub fn new(turn_id: Uuid, input: impl Into<String>) -> Self {
        Self {
            turn_id,
            input: input.into(),
        }
    }
}

/// Bookkeeping for one completed `stream_events` call.
#[derive(Debug, Clone, Default)]
pub struct StreamSummary {
    pub events_delivered: u64,
    pub malformed_frames: u64,
    pub reconnects: u32,
    pub last_sequence: Option<u64>,
    /// True when the stream ended on its own terms (`[DONE]`, a `done`
    /// event, or a terminal error from the service) rather than by
    /// cancellation or transport exhaustion.
    pub ended_cleanly: bool,
}

/// Source of turn events. Production talks HTTP via [`StreamClient`]; tests
/// script frames without a network.
pub trait EventSource: Send + Sync {
    fn stream_events(
        &self,
        request: &StreamRequest,
        cancel: &CancelToken,
        cb: EventCallback,
    ) -> Result<StreamSummary>;
}

enum StreamEnd {
    /// The service finished the turn; no reconnect.
    Finished,
    /// The caller cancelled; no reconnect, no synthetic event.
    Cancelled,
    /// The connection dropped mid-stream; eligible for resume.
    Dropped(TransportError),
}

/// Blocking HTTP consumer with reconnect/resume.
pub struct StreamClient {
    endpoint: EndpointConfig,
    limits: LimitsConfig,
    client: Client,
}

impl StreamClient {
    pub fn new(endpoint: EndpointConfig, limits: LimitsConfig) -> Result<Self> {
        // No overall timeout: a turn stream stays open as long as the turn
        // runs. Connect attempts are still bounded.
        let client = Client::builder()
            .timeout(None)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            endpoint,
            limits,
            client,
        })
    }

    fn stream_url(&self) -> String {
        format!(
            "{}{}",
            self.endpoint.base_url.trim_end_matches('/'),
            self.endpoint.stream_path
        )
    }

    fn open_stream(
        &self,
        request: &StreamRequest,
        stream_id: Option<&str>,
        last_sequence: Option<u64>,
    ) -> reqwest::Result<reqwest::blocking::Response> {
        let payload = json!({
            "turn_id": request.turn_id,
            "input": request.input,
            "stream_id": stream_id,
            "last_seen_sequence": last_sequence,
        });
        let mut builder = self.client.post(self.stream_url()).json(&payload);
        if let Some(key) = &self.endpoint.api_key {
            builder = builder.bearer_auth(key);
        }
        builder.send()
    }
}

impl EventSource for StreamClient {
    fn stream_events(
        &self,
        request: &StreamRequest,
        cancel: &CancelToken,
        cb: EventCallback,
    ) -> Result<StreamSummary> {
        let mut summary = StreamSummary::default();
        let mut stream_id: Option<String> = None;
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(summary);
            }

            let failure = match self.open_stream(request, stream_id.as_deref(), summary.last_sequence)
            {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        // A live connection resets the backoff clock.
                        attempt = 0;
                        let reader = std::io::BufReader::new(resp);
                        match consume_lines(reader, cancel, &cb, &mut summary, &mut stream_id) {
                            StreamEnd::Finished => {
                                summary.ended_cleanly = true;
                                return Ok(summary);
                            }
                            StreamEnd::Cancelled => return Ok(summary),
                            StreamEnd::Dropped(err) => err,
                        }
                    } else {
                        let body = snippet(&resp.text().unwrap_or_default());
                        let err = TransportError::Rejected {
                            status: status.as_u16(),
                            body,
                        };
                        if !should_retry_status(status) {
                            cb(StreamEvent::synthetic_terminal(
                                err.to_string(),
                                "stream_rejected",
                            ));
                            return Ok(summary);
                        }
                        err
                    }
                }
                Err(err) => {
                    let wrapped = TransportError::Connect(err.to_string());
                    if !should_retry_transport_error(&err) {
                        cb(StreamEvent::synthetic_terminal(
                            wrapped.to_string(),
                            "connection_lost",
                        ));
                        return Ok(summary);
                    }
                    wrapped
                }
            };

            if attempt >= self.limits.max_reconnect_attempts {
                cb(StreamEvent::synthetic_terminal(
                    format!("connection lost after {attempt} reconnect attempts: {failure}"),
                    "connection_lost",
                ));
                return Ok(summary);
            }
            thread::sleep(reconnect_delay(
                self.limits.reconnect_base_delay_ms,
                attempt,
            ));
            attempt += 1;
            summary.reconnects += 1;
        }
    }
}

/// Reads frames off one live connection until it ends one way or another.
/// Factored over any `BufRead` so tests can feed canned bytes.
fn consume_lines<R: BufRead>(
    reader: R,
    cancel: &CancelToken,
    cb: &EventCallback,
    summary: &mut StreamSummary,
    stream_id: &mut Option<String>,
) -> StreamEnd {
    for line_result in reader.lines() {
        if cancel.is_cancelled() {
            return StreamEnd::Cancelled;
        }
        let line = match line_result {
            Ok(l) => l,
            Err(err) => return StreamEnd::Dropped(TransportError::Read(err.to_string())),
        };
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(':') {
            continue;
        }
        let frame = trimmed
            .strip_prefix("data:")
            .map(str::trim)
            .unwrap_or(trimmed);
        if frame == "[DONE]" {
            return StreamEnd::Finished;
        }
        match decode_frame(frame) {
            Ok(Some(event)) => {
                if let Some(seq) = event.sequence {
                    summary.last_sequence = Some(seq);
                }
                if let EventKind::Metadata {
                    stream_id: Some(id),
                    ..
                } = &event.kind
                {
                    *stream_id = Some(id.clone());
                }
                let finishes = ends_turn(&event.kind);
                summary.events_delivered += 1;
                cb(event);
                if finishes {
                    return StreamEnd::Finished;
                }
            }
            Ok(None) => {}
            Err(_) => summary.malformed_frames += 1,
        }
    }
    StreamEnd::Dropped(TransportError::Read(
        "connection closed before end of stream".to_string(),
    ))
}

/// A `done` event or a terminal service error ends the turn; reconnecting
/// after either would replay a finished conversation.
fn ends_turn(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Done {} | EventKind::Error { terminal: true, .. })
}

fn should_retry_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::SERVICE_UNAVAILABLE
    )
}

fn should_retry_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn reconnect_delay(base_ms: u64, attempt: u32) -> Duration {
    let exponential = base_ms.saturating_mul(2_u64.saturating_pow(attempt));
    Duration::from_millis(exponential.max(base_ms.max(100)))
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= ERROR_BODY_SNIPPET {
        return trimmed.to_string();
    }
    let mut cut = ERROR_BODY_SNIPPET;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &trimmed[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Mutex;

    fn collect(body: &str) -> (Vec<StreamEvent>, StreamSummary, Option<String>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let cb: EventCallback = Arc::new(move |event| {
            sink.lock().expect("events lock").push(event);
        });
        let mut summary = StreamSummary::default();
        let mut stream_id = None;
        let end = consume_lines(
            Cursor::new(body.to_string()),
            &CancelToken::new(),
            &cb,
            &mut summary,
            &mut stream_id,
        );
        summary.ended_cleanly = matches!(end, StreamEnd::Finished);
        let events = events.lock().expect("events lock").clone();
        (events, summary, stream_id)
    }

    #[test]
    fn delivers_frames_in_arrival_order() {
        let body = concat!(
            "{\"type\":\"ack\",\"data\":{},\"sequence\":1}\n",
            "{\"type\":\"token\",\"data\":{\"text\":\"a\"},\"sequence\":2}\n",
            "{\"type\":\"token\",\"data\":{\"text\":\"b\"},\"sequence\":3}\n",
            "data: [DONE]\n",
        );
        let (events, summary, _) = collect(body);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0].kind, EventKind::Ack { .. }));
        assert!(matches!(&events[1].kind, EventKind::Token { text } if text == "a"));
        assert!(matches!(&events[2].kind, EventKind::Token { text } if text == "b"));
        assert!(summary.ended_cleanly);
        assert_eq!(summary.last_sequence, Some(3));
    }

    #[test]
    fn tolerates_comments_blanks_and_data_prefixes() {
        let body = concat!(
            ": keep-alive\n",
            "\n",
            "data: {\"type\":\"token\",\"data\":{\"text\":\"x\"}}\n",
            "{\"type\":\"token\",\"data\":{\"text\":\"y\"}}\n",
            "[DONE]\n",
        );
        let (events, summary, _) = collect(body);
        assert_eq!(events.len(), 2);
        assert_eq!(summary.malformed_frames, 0);
        assert!(summary.ended_cleanly);
    }

    #[test]
    fn counts_malformed_lines_and_keeps_going() {
        let body = concat!(
            "{not even json\n",
            "{\"type\":\"token\"}\n",
            "{\"type\":\"token\",\"data\":{\"text\":\"ok\"}}\n",
            "[DONE]\n",
        );
        let (events, summary, _) = collect(body);
        assert_eq!(events.len(), 1);
        assert_eq!(summary.malformed_frames, 2);
    }

    #[test]
    fn unknown_event_types_are_skipped_silently() {
        let body = concat!(
            "{\"type\":\"shiny_new_thing\",\"data\":{\"x\":1}}\n",
            "{\"type\":\"token\",\"data\":{\"text\":\"ok\"}}\n",
            "[DONE]\n",
        );
        let (events, summary, _) = collect(body);
        assert_eq!(events.len(), 1);
        assert_eq!(summary.malformed_frames, 0);
    }

    #[test]
    fn done_event_finishes_without_sentinel() {
        let body = concat!(
            "{\"type\":\"token\",\"data\":{\"text\":\"ok\"}}\n",
            "{\"type\":\"done\",\"data\":{}}\n",
        );
        let (events, summary, _) = collect(body);
        assert_eq!(events.len(), 2);
        assert!(summary.ended_cleanly);
    }

    #[test]
    fn terminal_error_event_finishes_the_stream() {
        let body = concat!(
            "{\"type\":\"error\",\"data\":{\"message\":\"boom\",\"terminal\":true}}\n",
            "{\"type\":\"token\",\"data\":{\"text\":\"never read\"}}\n",
        );
        let (events, summary, _) = collect(body);
        assert_eq!(events.len(), 1);
        assert!(summary.ended_cleanly, "terminal service error is a clean end");
    }

    #[test]
    fn transient_error_event_does_not_finish_the_stream() {
        let body = concat!(
            "{\"type\":\"error\",\"data\":{\"message\":\"hiccup\",\"terminal\":false}}\n",
            "{\"type\":\"token\",\"data\":{\"text\":\"still here\"}}\n",
            "[DONE]\n",
        );
        let (events, _, _) = collect(body);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn eof_without_sentinel_counts_as_dropped() {
        let body = "{\"type\":\"token\",\"data\":{\"text\":\"partial\"}}\n";
        let (events, summary, _) = collect(body);
        assert_eq!(events.len(), 1);
        assert!(!summary.ended_cleanly);
    }

    #[test]
    fn metadata_stream_id_is_captured_for_resume() {
        let body = concat!(
            "{\"type\":\"metadata\",\"data\":{\"resume_supported\":true,\"stream_id\":\"s-42\"}}\n",
            "[DONE]\n",
        );
        let (_, _, stream_id) = collect(body);
        assert_eq!(stream_id.as_deref(), Some("s-42"));
    }

    #[test]
    fn reconnect_delay_doubles_per_attempt() {
        assert_eq!(reconnect_delay(500, 0), Duration::from_millis(500));
        assert_eq!(reconnect_delay(500, 1), Duration::from_millis(1000));
        assert_eq!(reconnect_delay(500, 2), Duration::from_millis(2000));
    }

    #[test]
    fn snippet_truncates_long_bodies() {
        let long = "x".repeat(500);
        assert!(snippet(&long).len() < 210);
        assert_eq!(snippet("short"), "short");
    }

    // ── Live HTTP behavior against a scripted listener ──

    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn read_http_request(stream: &mut std::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).expect("read request");
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let headers = &text[..header_end];
                let content_length = headers
                    .lines()
                    .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(str::trim).map(String::from))
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    return text.into_owned();
                }
            }
            if n == 0 {
                return String::from_utf8_lossy(&buf).into_owned();
            }
        }
    }

    fn respond_with_frames(stream: &mut std::net::TcpStream, frames: &str) {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            frames.len(),
            frames
        );
        stream.write_all(response.as_bytes()).expect("write response");
    }

    #[test]
    fn resumes_with_last_seen_sequence_after_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = thread::spawn(move || {
            // First connection: two frames, then drop without [DONE].
            let (mut first, _) = listener.accept().expect("accept first");
            let first_request = read_http_request(&mut first);
            respond_with_frames(
                &mut first,
                concat!(
                    "{\"type\":\"metadata\",\"data\":{\"stream_id\":\"s-7\"},\"sequence\":1}\n",
                    "{\"type\":\"token\",\"data\":{\"text\":\"hel\"},\"sequence\":2}\n",
                ),
            );
            drop(first);

            // Second connection: expect the resume marker, then finish.
            let (mut second, _) = listener.accept().expect("accept second");
            let second_request = read_http_request(&mut second);
            respond_with_frames(
                &mut second,
                concat!(
                    "{\"type\":\"token\",\"data\":{\"text\":\"lo\"},\"sequence\":3}\n",
                    "{\"type\":\"done\",\"data\":{},\"sequence\":4}\n",
                ),
            );
            (first_request, second_request)
        });

        let endpoint = EndpointConfig {
            base_url: format!("http://{addr}"),
            ..EndpointConfig::default()
        };
        let limits = LimitsConfig {
            reconnect_base_delay_ms: 10,
            ..LimitsConfig::default()
        };
        let client = StreamClient::new(endpoint, limits).expect("client");

        let texts = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&texts);
        let cb: EventCallback = Arc::new(move |event| {
            if let EventKind::Token { text } = event.kind {
                sink.lock().expect("texts lock").push_str(&text);
            }
        });

        let request = StreamRequest::new(Uuid::now_v7(), "say hello");
        let summary = client
            .stream_events(&request, &CancelToken::new(), cb)
            .expect("stream");

        let (first_request, second_request) = server.join().expect("server");
        assert!(first_request.contains("\"last_seen_sequence\":null"));
        assert!(second_request.contains("\"last_seen_sequence\":2"));
        assert!(second_request.contains("\"stream_id\":\"s-7\""));
        assert_eq!(texts.lock().expect("texts lock").as_str(), "hello");
        assert_eq!(summary.reconnects, 1);
        assert!(summary.ended_cleanly);
        assert_eq!(summary.last_sequence, Some(4));
    }

    #[test]
    fn exhausted_reconnects_surface_synthetic_terminal() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        // Nothing ever responds properly: close every connection immediately.
        let _server = thread::spawn(move || {
            for _ in 0..8 {
                match listener.accept() {
                    Ok((stream, _)) => drop(stream),
                    Err(_) => break,
                }
            }
        });

        let endpoint = EndpointConfig {
            base_url: format!("http://{addr}"),
            ..EndpointConfig::default()
        };
        let limits = LimitsConfig {
            max_reconnect_attempts: 1,
            reconnect_base_delay_ms: 10,
            ..LimitsConfig::default()
        };
        let client = StreamClient::new(endpoint, limits).expect("client");

        let saw_terminal = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&saw_terminal);
        let cb: EventCallback = Arc::new(move |event| {
            if let EventKind::Error {
                terminal: true,
                code,
                ..
            } = event.kind
            {
                *sink.lock().expect("terminal lock") = code;
            }
        });

        let request = StreamRequest::new(Uuid::now_v7(), "hello?");
        let summary = client
            .stream_events(&request, &CancelToken::new(), cb)
            .expect("stream");

        assert!(!summary.ended_cleanly);
        assert_eq!(
            saw_terminal.lock().expect("terminal lock").as_deref(),
            Some("connection_lost")
        );
    }
}
