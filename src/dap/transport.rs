//! `Content-Length` framing over any buffered stream.
//!
//! Reads tolerate socket read timeouts: a `WouldBlock`/`TimedOut` mid-frame is
//! retried against the caller's deadline, so a frame split across arbitrary
//! chunk boundaries is reassembled without loss.

use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::io::{BufRead, ErrorKind, Read, Write};
use std::time::Instant;

fn is_retriable(kind: ErrorKind) -> bool {
    kind == ErrorKind::WouldBlock || kind == ErrorKind::TimedOut || kind == ErrorKind::Interrupted
}

/// Read one framed DAP message, blocking until `deadline`.
pub fn read_message<R: BufRead>(reader: &mut R, deadline: Instant) -> Result<Value> {
    match read_message_inner(reader, deadline, false)? {
        Some(msg) => Ok(msg),
        None => unreachable!("non-polling read always yields a message or an error"),
    }
}

/// Like [`read_message`], but returns `None` immediately when no frame has
/// started to arrive. Once the first header byte is in, the read commits and
/// runs against `deadline` like a blocking read.
pub fn try_read_message<R: BufRead>(reader: &mut R, deadline: Instant) -> Result<Option<Value>> {
    read_message_inner(reader, deadline, true)
}

fn read_message_inner<R: BufRead>(
    reader: &mut R,
    deadline: Instant,
    poll: bool,
) -> Result<Option<Value>> {
    let mut content_length: Option<usize> = None;
    let mut first_header = true;
    loop {
        let mut line = String::new();
        let read_n = loop {
            match reader.read_line(&mut line) {
                Ok(n) => break n,
                Err(err) if is_retriable(err.kind()) => {
                    if poll && first_header && line.is_empty() {
                        return Ok(None);
                    }
                    if Instant::now() > deadline {
                        return Err(Error::Timeout("DAP frame header".to_string()));
                    }
                }
                Err(err) => return Err(err.into()),
            }
        };
        if read_n == 0 {
            return Err(Error::ConnectionClosed);
        }
        first_header = false;
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("content-length")
        {
            content_length = Some(
                value
                    .trim()
                    .parse()
                    .map_err(|_| Error::Frame(format!("bad Content-Length `{}`", value.trim())))?,
            );
        }
    }

    let len = content_length.ok_or_else(|| Error::Frame("missing Content-Length".to_string()))?;
    let mut buf = vec![0u8; len];
    read_exact_with_deadline(reader, &mut buf, deadline)?;
    let msg: Value =
        serde_json::from_slice(&buf).map_err(|e| Error::Frame(format!("body is not JSON: {e}")))?;
    Ok(Some(msg))
}

fn read_exact_with_deadline<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    deadline: Instant,
) -> Result<()> {
    let mut offset = 0;
    while offset < buf.len() {
        match reader.read(&mut buf[offset..]) {
            Ok(0) => return Err(Error::ConnectionClosed),
            Ok(n) => offset += n,
            Err(err) if is_retriable(err.kind()) => {
                if Instant::now() > deadline {
                    return Err(Error::Timeout("DAP frame body".to_string()));
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Write one framed DAP message.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let payload = serde_json::to_vec(message)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{self, BufReader};
    use std::time::Duration;

    /// Reader that yields its bytes in fixed-size chunks, so frames cross
    /// read boundaries at every possible offset.
    struct Chunked {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Read for Chunked {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.data.len() {
                return Ok(0);
            }
            let n = self.chunk.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn frame(body: &Value) -> Vec<u8> {
        let payload = serde_json::to_vec(body).unwrap();
        let mut out = format!("Content-Length: {}\r\n\r\n", payload.len()).into_bytes();
        out.extend_from_slice(&payload);
        out
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    #[test]
    fn frames_survive_any_chunk_boundary() {
        let mut data = frame(&json!({"type": "event", "event": "stopped", "seq": 1}));
        data.extend(frame(&json!({"type": "response", "seq": 2, "request_seq": 1})));
        data.extend(frame(&json!({"type": "event", "event": "exited", "seq": 3})));

        for chunk in 1..=7 {
            let mut reader = BufReader::new(Chunked {
                data: data.clone(),
                pos: 0,
                chunk,
            });
            let first = read_message(&mut reader, deadline()).unwrap();
            assert_eq!(first["event"], "stopped");
            let second = read_message(&mut reader, deadline()).unwrap();
            assert_eq!(second["request_seq"], 1);
            let third = read_message(&mut reader, deadline()).unwrap();
            assert_eq!(third["event"], "exited");
            assert!(matches!(
                read_message(&mut reader, deadline()),
                Err(Error::ConnectionClosed)
            ));
        }
    }

    #[test]
    fn header_name_is_case_insensitive() {
        let payload = br#"{"type":"event","event":"output","seq":9}"#;
        let mut data = format!("content-length: {}\r\n\r\n", payload.len()).into_bytes();
        data.extend_from_slice(payload);
        let mut reader = BufReader::new(data.as_slice());
        let msg = read_message(&mut reader, deadline()).unwrap();
        assert_eq!(msg["event"], "output");
    }

    #[test]
    fn extra_headers_are_ignored() {
        let payload = br#"{"type":"event","event":"output","seq":9}"#;
        let mut data = format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            payload.len()
        )
        .into_bytes();
        data.extend_from_slice(payload);
        let mut reader = BufReader::new(data.as_slice());
        assert!(read_message(&mut reader, deadline()).is_ok());
    }

    #[test]
    fn non_json_body_is_a_frame_error() {
        let data = b"Content-Length: 5\r\n\r\nhello".to_vec();
        let mut reader = BufReader::new(data.as_slice());
        assert!(matches!(
            read_message(&mut reader, deadline()),
            Err(Error::Frame(_))
        ));
    }

    #[test]
    fn missing_content_length_is_a_frame_error() {
        let data = b"Content-Type: application/json\r\n\r\n".to_vec();
        let mut reader = BufReader::new(data.as_slice());
        assert!(matches!(
            read_message(&mut reader, deadline()),
            Err(Error::Frame(_))
        ));
    }

    #[test]
    fn write_then_read_round_trip() {
        let mut out = Vec::new();
        write_message(
            &mut out,
            &json!({"type": "request", "seq": 1, "command": "next"}),
        )
        .unwrap();
        let mut reader = BufReader::new(out.as_slice());
        let msg = read_message(&mut reader, deadline()).unwrap();
        assert_eq!(msg["command"], "next");
    }
}
