use bytes::Bytes;
use chrono::{DateTime, Utc};
use data_encoding::BASE64;
use serde::Serialize;
use shellgate_common::protocols::TerminalSize;
use tokio::time::Instant;

use super::writer::RecordingWriter;
use super::Error;

/// Which side of the terminal a chunk came from; matches the asciicast
/// event markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStream {
    Output,
    Error,
}

impl TerminalStream {
    pub fn marker(&self) -> &'static str {
        match self {
            Self::Output => "o",
            Self::Error => "e",
        }
    }
}

#[derive(Serialize)]
struct CastHeader<'a> {
    version: u32,
    width: u32,
    height: u32,
    timestamp: i64,
    env: CastEnv<'a>,
    title: &'a str,
}

#[derive(Serialize)]
struct CastEnv<'a> {
    #[serde(rename = "TERM")]
    term: &'a str,
    #[serde(rename = "SHELL")]
    shell: &'a str,
}

/// Writes an asciicast-v2 stream (newline-delimited JSON) through the
/// gzip writer: one header line, then `[seconds, "o"|"e", data]` events.
pub struct TerminalRecorder {
    writer: RecordingWriter,
    started_at: Instant,
}

impl TerminalRecorder {
    pub fn new(writer: RecordingWriter) -> Self {
        TerminalRecorder {
            writer,
            started_at: Instant::now(),
        }
    }

    pub fn write_header(
        &self,
        size: TerminalSize,
        title: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let header = CastHeader {
            version: 2,
            width: size.cols,
            height: size.rows,
            timestamp: started_at.timestamp(),
            env: CastEnv {
                term: "xterm-256color",
                shell: "/bin/sh",
            },
            title,
        };
        self.write_line(&serde_json::to_vec(&header)?)
    }

    pub fn write_event(&self, stream: TerminalStream, chunk: &[u8]) -> Result<(), Error> {
        let elapsed = Instant::now().duration_since(self.started_at).as_secs_f64();
        // UTF-8 chunks are stored verbatim, anything else as base64.
        let data = match std::str::from_utf8(chunk) {
            Ok(s) => s.to_owned(),
            Err(_) => BASE64.encode(chunk),
        };
        let event = serde_json::json!([elapsed, stream.marker(), data]);
        self.write_line(&serde_json::to_vec(&event)?)
    }

    pub fn elapsed_seconds(&self) -> f64 {
        Instant::now().duration_since(self.started_at).as_secs_f64()
    }

    pub async fn finalize(&self) -> Result<super::writer::FinalizedRecording, Error> {
        self.writer.finalize().await
    }

    fn write_line(&self, line: &[u8]) -> Result<(), Error> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line);
        buf.push(b'\n');
        self.writer.write(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    async fn record_and_read(chunks: &[&[u8]]) -> Vec<String> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cast.gz");
        let recorder = TerminalRecorder::new(RecordingWriter::new(path.clone()).unwrap());
        recorder
            .write_header(TerminalSize { cols: 80, rows: 24 }, "test", Utc::now())
            .unwrap();
        for chunk in chunks {
            recorder.write_event(TerminalStream::Output, chunk).unwrap();
        }
        recorder.finalize().await.unwrap();

        let compressed = std::fs::read(&path).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        out.lines().map(|l| l.to_owned()).collect()
    }

    #[tokio::test]
    async fn header_line_is_asciicast_v2() {
        let lines = record_and_read(&[]).await;
        let header: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(header["version"], 2);
        assert_eq!(header["width"], 80);
        assert_eq!(header["height"], 24);
        assert_eq!(header["env"]["TERM"], "xterm-256color");
    }

    #[tokio::test]
    async fn output_frames_concatenate_to_stream_bytes() {
        let lines = record_and_read(&[b"hello ", b"world\n"]).await;
        let mut concat = String::new();
        for line in &lines[1..] {
            let event: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(event[1], "o");
            concat.push_str(event[2].as_str().unwrap());
        }
        assert_eq!(concat, "hello world\n");
    }

    #[tokio::test]
    async fn event_times_are_monotonic() {
        let lines = record_and_read(&[b"a", b"b", b"c"]).await;
        let mut last = -1.0f64;
        for line in &lines[1..] {
            let event: serde_json::Value = serde_json::from_str(line).unwrap();
            let t = event[0].as_f64().unwrap();
            assert!(t >= last);
            last = t;
        }
    }

    #[tokio::test]
    async fn binary_chunks_fall_back_to_base64() {
        let lines = record_and_read(&[&[0xff, 0xfe, 0x00]]).await;
        let event: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
        let data = event[2].as_str().unwrap();
        assert_eq!(BASE64.decode(data.as_bytes()).unwrap(), vec![0xff, 0xfe, 0x00]);
    }
}
