//! Optional live feed: server-sent events from `GET /soil/stream`, applied to
//! the tracked plants as they arrive. Polling keeps running alongside.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::backend::HttpBackend;
use crate::error::TrackerError;
use crate::tracker::PlantTracker;

/// Upper bound on a buffered partial line plus the event being assembled.
pub const MAX_EVENT_BYTES: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// SSE framing
// ---------------------------------------------------------------------------

/// Incremental `text/event-stream` decoder. Feed it raw chunks; it returns the
/// `data` payload of every event completed by that chunk. Chunk boundaries
/// may fall anywhere, including inside a UTF-8 sequence.
///
/// An event (or an unterminated line) larger than [`MAX_EVENT_BYTES`] is a
/// `Decode` error; the connection should be dropped.
#[derive(Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    data: Vec<String>,
    data_len: usize,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, TrackerError> {
        self.pending.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                // blank line terminates the event
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                    self.data_len = 0;
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            if field == "data" {
                self.data_len += value.len();
                self.data.push(value.to_string());
            }
            // event/id/retry carry nothing this feed uses
        }

        if self.pending.len() + self.data_len > MAX_EVENT_BYTES {
            self.pending.clear();
            self.data.clear();
            self.data_len = 0;
            return Err(TrackerError::Decode(format!(
                "stream event exceeds {MAX_EVENT_BYTES} bytes"
            )));
        }
        Ok(events)
    }
}

// ---------------------------------------------------------------------------
// Feed loop
// ---------------------------------------------------------------------------

/// Follow the stream forever, reconnecting after `reconnect_every` whenever
/// it ends or fails. Intended to be `tokio::spawn`-ed from main.
pub async fn run(
    backend: Arc<HttpBackend>,
    trackers: Vec<Arc<PlantTracker<HttpBackend>>>,
    reconnect_every: Duration,
) {
    info!(plants = trackers.len(), "live stream started");
    loop {
        let result = backend
            .follow_soil_stream(|update| {
                for t in &trackers {
                    t.apply_update(update);
                }
            })
            .await;

        match result {
            Ok(()) => info!("live stream ended, reconnecting"),
            Err(e) => warn!(kind = e.kind(), "live stream failed: {e}"),
        }
        tokio::time::sleep(reconnect_every).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_event() {
        let mut d = SseDecoder::default();
        assert_eq!(d.push(b"data: {\"level\":5}\n\n").unwrap(), vec!["{\"level\":5}"]);
    }

    #[test]
    fn event_split_across_chunks() {
        let mut d = SseDecoder::default();
        assert!(d.push(b"da").unwrap().is_empty());
        assert!(d.push(b"ta: {\"on\":").unwrap().is_empty());
        assert!(d.push(b"true}\n").unwrap().is_empty());
        assert_eq!(d.push(b"\n").unwrap(), vec!["{\"on\":true}"]);
    }

    #[test]
    fn multi_byte_char_split_across_chunks() {
        let mut d = SseDecoder::default();
        let payload = "data: {\"name\":\"نعناع\"}\n\n".as_bytes();
        let (a, b) = payload.split_at(16); // inside the first Arabic letter
        assert!(d.push(a).unwrap().is_empty());
        assert_eq!(d.push(b).unwrap(), vec!["{\"name\":\"نعناع\"}"]);
    }

    #[test]
    fn crlf_and_multiline_data() {
        let mut d = SseDecoder::default();
        let events = d.push(b"data: line1\r\ndata: line2\r\n\r\n").unwrap();
        assert_eq!(events, vec!["line1\nline2"]);
    }

    #[test]
    fn comments_and_other_fields_ignored() {
        let mut d = SseDecoder::default();
        let events = d.push(b": ping\n\nevent: reading\nid: 7\nretry: 1000\ndata:{\"v\":1}\n\n").unwrap();
        assert_eq!(events, vec!["{\"v\":1}"]);
    }

    #[test]
    fn several_events_in_one_chunk() {
        let mut d = SseDecoder::default();
        let events = d.push(b"data: 1\n\ndata: 2\n\ndata: 3").unwrap();
        assert_eq!(events, vec!["1", "2"]);
        assert_eq!(d.push(b"\n\n").unwrap(), vec!["3"]);
    }

    #[test]
    fn unterminated_line_over_limit_is_rejected() {
        let mut d = SseDecoder::default();
        let mut junk = b"data: ".to_vec();
        junk.extend(std::iter::repeat(b'x').take(MAX_EVENT_BYTES));
        assert_eq!(d.push(&junk).unwrap_err().kind(), "decode");

        // buffer was reset; the decoder keeps working
        assert_eq!(d.push(b"data: 1\n\n").unwrap(), vec!["1"]);
    }

    #[test]
    fn event_built_from_many_data_lines_over_limit_is_rejected() {
        let mut d = SseDecoder::default();
        let line = format!("data: {}\n", "y".repeat(1024));
        let mut result = Ok(Vec::new());
        for _ in 0..70 {
            result = d.push(line.as_bytes());
            if result.is_err() {
                break;
            }
        }
        assert!(result.is_err());
    }

    #[test]
    fn blank_lines_without_data_dispatch_nothing() {
        let mut d = SseDecoder::default();
        assert!(d.push(b"\n\n\n").unwrap().is_empty());
    }
}
