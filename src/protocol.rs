//! Wire types for the HTTP API and the viewer push channel.
//!
//! Request and response bodies are JSON with camelCase field names, matching
//! what the browser UI sends. Push-channel frames are JSON objects tagged by
//! `type`.

use crate::config::{LogFileSpec, ServerProfile};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Tail depth used when a start request omits `lines`.
pub const DEFAULT_TAIL_LINES: i64 = 100;

const fn default_tail_lines() -> i64 {
    DEFAULT_TAIL_LINES
}

/// Body of `POST /api/log/start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub server_name: String,
    pub file_alias: String,
    /// Number of existing lines to replay before following.
    #[serde(default = "default_tail_lines")]
    pub lines: i64,
}

/// Body of `POST /api/log/stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    pub server_name: String,
    pub file_alias: String,
}

/// Body of `POST /api/command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub server_name: String,
    pub command: String,
}

/// Response of `POST /api/command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Captured standard output.
    pub output: String,
}

/// A configured server as exposed to viewers. Credentials are never included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub log_files: Vec<LogFileSpec>,
}

impl From<&ServerProfile> for ServerSummary {
    fn from(profile: &ServerProfile) -> Self {
        Self {
            name: profile.name.clone(),
            host: profile.host.clone(),
            port: profile.port,
            log_files: profile.log_files.clone(),
        }
    }
}

/// An active stream, as listed by `GET /api/streams`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub server: String,
    pub file: String,
    /// Unix timestamp (seconds) when the stream was started.
    pub started_at: u64,
}

/// One chunk of tailed output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    /// Server name.
    pub server: String,
    /// File alias.
    pub file: String,
    /// Chunk content as text.
    pub content: String,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
}

/// Frames pushed to every connected viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    /// Output from a tailed file.
    Log(LogMessage),
}

/// Current Unix time in seconds.
#[must_use]
pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Incremental UTF-8 decoder for tailed output.
///
/// A remote read can split a multi-byte character across two chunks. The
/// trailing partial sequence is held back and prefixed to the next chunk, so
/// the concatenated output of `decode` equals the decoded input. Bytes that
/// can never form valid UTF-8 become U+FFFD.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    pending: Vec<u8>,
}

impl ChunkDecoder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Decode as much of `chunk` (plus held-back bytes) as possible.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    if let Some(len) = e.error_len() {
                        out.push(char::REPLACEMENT_CHARACTER);
                        rest = &tail[len..];
                    } else {
                        // Incomplete sequence at the end; wait for more bytes.
                        rest = tail;
                        break;
                    }
                }
            }
        }

        let consumed = self.pending.len() - rest.len();
        self.pending.drain(..consumed);
        out
    }

    /// Flush whatever is still held back at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }

    /// Number of bytes currently held back.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_message_shape() {
        let msg = PushMessage::Log(LogMessage {
            server: "web1".into(),
            file: "app.log".into(),
            content: "GET /health 200\n".into(),
            timestamp: 1_706_140_800,
        });
        let value = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({
                "type": "log",
                "server": "web1",
                "file": "app.log",
                "content": "GET /health 200\n",
                "timestamp": 1_706_140_800u64,
            })
        );
    }

    #[test]
    fn test_start_request_camel_case() {
        let req: StartRequest =
            serde_json::from_str(r#"{"serverName":"web1","fileAlias":"app.log","lines":10}"#)
                .expect("deserialize");
        assert_eq!(req.server_name, "web1");
        assert_eq!(req.file_alias, "app.log");
        assert_eq!(req.lines, 10);
    }

    #[test]
    fn test_start_request_default_lines() {
        let req: StartRequest =
            serde_json::from_str(r#"{"serverName":"web1","fileAlias":"app.log"}"#)
                .expect("deserialize");
        assert_eq!(req.lines, DEFAULT_TAIL_LINES);
    }

    #[test]
    fn test_server_summary_hides_credentials() {
        let profile = ServerProfile {
            name: "web1".into(),
            host: "10.0.0.5".into(),
            port: 22,
            username: "deploy".into(),
            password: Some("hunter2".into()),
            key_path: None,
            log_files: vec![LogFileSpec {
                path: "/var/log/app.log".into(),
                alias: "app.log".into(),
            }],
        };
        let json = serde_json::to_string(&ServerSummary::from(&profile)).expect("serialize");
        assert!(json.contains(r#""logFiles":[{"path":"/var/log/app.log","alias":"app.log"}]"#));
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("deploy"));
    }

    #[test]
    fn test_decoder_passes_ascii_through() {
        let mut decoder = ChunkDecoder::new();
        assert_eq!(decoder.decode(b"hello\n"), "hello\n");
        assert_eq!(decoder.pending(), 0);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_decoder_holds_split_character() {
        let bytes = "日志".as_bytes();
        let mut decoder = ChunkDecoder::new();
        assert_eq!(decoder.decode(&bytes[..2]), "");
        assert_eq!(decoder.pending(), 2);
        assert_eq!(decoder.decode(&bytes[2..4]), "日");
        assert_eq!(decoder.decode(&bytes[4..]), "志");
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_decoder_every_split_point_reassembles() {
        let text = "a→b😀c\n";
        let bytes = text.as_bytes();
        for split in 0..=bytes.len() {
            let mut decoder = ChunkDecoder::new();
            let mut out = decoder.decode(&bytes[..split]);
            out.push_str(&decoder.decode(&bytes[split..]));
            assert_eq!(out, text, "split at {split}");
            assert_eq!(decoder.pending(), 0);
        }
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = ChunkDecoder::new();
        assert_eq!(decoder.decode(b"ok\xffok"), "ok\u{FFFD}ok");
    }

    #[test]
    fn test_decoder_flushes_truncated_tail() {
        let mut decoder = ChunkDecoder::new();
        assert_eq!(decoder.decode(&"é".as_bytes()[..1]), "");
        assert_eq!(decoder.finish().as_deref(), Some("\u{FFFD}"));
        assert_eq!(decoder.pending(), 0);
    }
}
