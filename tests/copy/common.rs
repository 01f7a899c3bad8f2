//! In-process PostgreSQL backend speaking just enough of the simple query
//! and COPY sub-protocols for the integration tests.
//!
//! The client and server are joined by `tokio::io::duplex` with a small pipe
//! capacity, so every message is split at arbitrary points on the way.
//!
//! Recognized statements:
//! - `SELECT 1`
//! - `COPY (SELECT generate_series(A, B)) TO STDOUT`
//! - `COPY numbers FROM STDIN` / `COPY numbers TO STDOUT`
//! - `COPY big TO STDOUT` (one 64 KiB row)
//! - `COPY noisy TO STDOUT` (notice, parameter status and notification between rows)
//! - `COPY (SELECT pg_sleep(10)) TO STDOUT` (fails after the first row)
//! - `COPY bogus TO STDOUT` (RowDescription in the middle of the copy)
//! - `COPY twice TO STDOUT` (two CopyOutResponse messages)
//! - `COPY crash TO STDOUT` (server goes away after the first row)
//! - `COPY crash FROM STDIN` (server goes away after CopyInResponse)
//! - anything mentioning `missing` fails with undefined_table

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use zero_pg_copy::tokio::Conn;
use zero_pg_copy::{FrameEvent, Framer};

/// Size of the `big` row.
pub const BIG_ROW_LEN: usize = 64 * 1024;

/// What the server saw and stored.
#[derive(Debug, Default)]
pub struct ServerState {
    /// Type byte of every frontend message, in arrival order.
    pub received: Vec<u8>,
    /// Every query string.
    pub queries: Vec<String>,
    /// Rows of the `numbers` table, newline included.
    pub numbers: Vec<Vec<u8>>,
    /// Reasons carried by CopyFail messages.
    pub copy_fail_reasons: Vec<String>,
}

/// Handle on the running mock backend.
#[derive(Clone)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    pub fn received(&self) -> Vec<u8> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.lock().unwrap().queries.clone()
    }

    pub fn numbers(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().numbers.clone()
    }

    pub fn copy_fail_reasons(&self) -> Vec<String> {
        self.state.lock().unwrap().copy_fail_reasons.clone()
    }
}

/// Connect to a fresh mock backend through a 61-byte pipe.
pub fn connect() -> (Conn<DuplexStream>, MockServer) {
    connect_with_capacity(61)
}

/// Connect to a fresh mock backend through a pipe of `capacity` bytes.
pub fn connect_with_capacity(capacity: usize) -> (Conn<DuplexStream>, MockServer) {
    let (client, server) = tokio::io::duplex(capacity);
    let state = Arc::new(Mutex::new(ServerState::default()));
    tokio::spawn(serve(server, Arc::clone(&state)));
    (Conn::new(client), MockServer { state })
}

pub fn message(out: &mut Vec<u8>, type_byte: u8, payload: &[u8]) {
    out.push(type_byte);
    out.extend_from_slice(&((payload.len() + 4) as u32).to_be_bytes());
    out.extend_from_slice(payload);
}

pub fn error_fields(code: &str, text: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    for (field, value) in [(b'S', "ERROR"), (b'V', "ERROR"), (b'C', code), (b'M', text)] {
        payload.push(field);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
    }
    payload.push(0);
    payload
}

fn ready(out: &mut Vec<u8>) {
    message(out, b'Z', b"I");
}

fn command_complete(out: &mut Vec<u8>, tag: &str) {
    let mut payload = tag.as_bytes().to_vec();
    payload.push(0);
    message(out, b'C', &payload);
}

fn fail(out: &mut Vec<u8>, code: &str, text: &str) {
    message(out, b'E', &error_fields(code, text));
    ready(out);
}

/// CopyOutResponse / CopyInResponse for a one-column text copy.
const TEXT_ONE_COLUMN: [u8; 5] = [0, 0, 1, 0, 0];

fn copy_out(out: &mut Vec<u8>, rows: &[Vec<u8>]) {
    message(out, b'H', &TEXT_ONE_COLUMN);
    for row in rows {
        message(out, b'd', row);
    }
    message(out, b'c', b"");
    command_complete(out, &format!("COPY {}", rows.len()));
    ready(out);
}

fn generate_series(sql: &str) -> Option<Vec<Vec<u8>>> {
    let range = sql
        .strip_prefix("COPY (SELECT generate_series(")?
        .strip_suffix(")) TO STDOUT")?;
    let (start, end) = range.split_once(", ")?;
    let start: i64 = start.parse().ok()?;
    let end: i64 = end.parse().ok()?;
    Some((start..=end).map(|i| format!("{i}\n").into_bytes()).collect())
}

async fn read_message(
    stream: &mut DuplexStream,
    framer: &mut Framer,
    buf: &mut [u8],
) -> Option<(u8, Vec<u8>)> {
    let mut current: Option<(u8, usize, Vec<u8>)> = None;
    loop {
        while let Some(event) = framer.next_event().ok()? {
            match event {
                FrameEvent::Message { type_byte, len: 0 } => return Some((type_byte, Vec::new())),
                FrameEvent::Message { type_byte, len } => {
                    current = Some((type_byte, len, Vec::with_capacity(len)));
                }
                FrameEvent::Content(data) => {
                    let (_, len, payload) = current.as_mut()?;
                    payload.extend_from_slice(&data);
                    if payload.len() == *len {
                        return current.take().map(|(type_byte, _, payload)| (type_byte, payload));
                    }
                }
            }
        }
        let n = stream.read(buf).await.ok()?;
        if n == 0 {
            return None;
        }
        framer.feed(&buf[..n]);
    }
}

fn cstr(payload: &[u8]) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

async fn serve(mut stream: DuplexStream, state: Arc<Mutex<ServerState>>) {
    let mut framer = Framer::new();
    let mut buf = vec![0; 4096];

    while let Some((type_byte, payload)) = read_message(&mut stream, &mut framer, &mut buf).await {
        state.lock().unwrap().received.push(type_byte);
        if type_byte != b'Q' {
            // copy sub-protocol messages outside a copy are ignored
            continue;
        }
        let sql = cstr(&payload);
        state.lock().unwrap().queries.push(sql.clone());

        let mut out = Vec::new();
        match sql.as_str() {
            "SELECT 1" => {
                message(&mut out, b'T', b"\0\x01?column?\0\0\0\0\0\0\0\0\0\0\x17\0\x04\xff\xff\xff\xff\0\0");
                message(&mut out, b'D', b"\0\x01\0\0\0\x011");
                command_complete(&mut out, "SELECT 1");
                ready(&mut out);
            }
            s if s.contains("missing") => {
                fail(&mut out, "42P01", "relation \"missing\" does not exist");
            }
            "COPY numbers FROM STDIN" => {
                message(&mut out, b'G', &TEXT_ONE_COLUMN);
                if stream.write_all(&out).await.is_err() {
                    return;
                }
                out.clear();
                let Some(()) = copy_in(&mut stream, &mut framer, &mut buf, &state, &mut out).await
                else {
                    return;
                };
            }
            "COPY numbers TO STDOUT" => {
                let rows = state.lock().unwrap().numbers.clone();
                copy_out(&mut out, &rows);
            }
            "COPY big TO STDOUT" => {
                let mut row = vec![b'x'; BIG_ROW_LEN - 1];
                row.push(b'\n');
                copy_out(&mut out, &[row]);
            }
            "COPY noisy TO STDOUT" => {
                message(&mut out, b'H', &TEXT_ONE_COLUMN);
                message(&mut out, b'N', b"SWARNING\0VWARNING\0C01000\0Mcopy is noisy\0\0");
                message(&mut out, b'd', b"a\n");
                message(&mut out, b'S', b"application_name\0copy-test\0");
                message(&mut out, b'A', b"\0\0\0\x2achannel\0payload\0");
                message(&mut out, b'd', b"b\n");
                message(&mut out, b'c', b"");
                command_complete(&mut out, "COPY 2");
                ready(&mut out);
            }
            "COPY (SELECT pg_sleep(10)) TO STDOUT" => {
                message(&mut out, b'H', &TEXT_ONE_COLUMN);
                message(&mut out, b'd', b"1\n");
                fail(&mut out, "57014", "canceling statement due to statement timeout");
            }
            "COPY bogus TO STDOUT" => {
                message(&mut out, b'H', &TEXT_ONE_COLUMN);
                message(&mut out, b'd', b"1\n");
                message(&mut out, b'T', b"\0\0");
                ready(&mut out);
            }
            "COPY twice TO STDOUT" => {
                message(&mut out, b'H', &TEXT_ONE_COLUMN);
                message(&mut out, b'd', b"1\n");
                message(&mut out, b'H', &TEXT_ONE_COLUMN);
                message(&mut out, b'c', b"");
                command_complete(&mut out, "COPY 1");
                ready(&mut out);
            }
            "COPY crash FROM STDIN" => {
                message(&mut out, b'G', &TEXT_ONE_COLUMN);
                let _ = stream.write_all(&out).await;
                return;
            }
            "COPY crash TO STDOUT" => {
                message(&mut out, b'H', &TEXT_ONE_COLUMN);
                message(&mut out, b'd', b"1\n");
                let _ = stream.write_all(&out).await;
                return;
            }
            s => match generate_series(s) {
                Some(rows) => copy_out(&mut out, &rows),
                None => fail(&mut out, "42601", "syntax error"),
            },
        }

        if stream.write_all(&out).await.is_err() {
            return;
        }
    }
}

/// Serve the input half of `COPY numbers FROM STDIN`.
///
/// Returns `None` once the client is gone.
async fn copy_in(
    stream: &mut DuplexStream,
    framer: &mut Framer,
    buf: &mut [u8],
    state: &Mutex<ServerState>,
    out: &mut Vec<u8>,
) -> Option<()> {
    let mut data = Vec::new();
    loop {
        let (type_byte, payload) = read_message(stream, framer, buf).await?;
        state.lock().unwrap().received.push(type_byte);
        match type_byte {
            b'd' => data.extend_from_slice(&payload),
            b'c' => {
                let rows: Vec<Vec<u8>> = data
                    .split_inclusive(|&b| b == b'\n')
                    .map(<[u8]>::to_vec)
                    .collect();
                let bad = rows.iter().find(|row| {
                    std::str::from_utf8(row)
                        .ok()
                        .and_then(|s| s.trim_end().parse::<i64>().ok())
                        .is_none()
                });
                match bad {
                    Some(row) => {
                        let text = String::from_utf8_lossy(row).trim_end().to_string();
                        fail(
                            out,
                            "22P02",
                            &format!("invalid input syntax for type integer: \"{text}\""),
                        );
                    }
                    None => {
                        command_complete(out, &format!("COPY {}", rows.len()));
                        ready(out);
                        state.lock().unwrap().numbers.extend(rows);
                    }
                }
                return Some(());
            }
            b'f' => {
                let reason = cstr(&payload);
                fail(out, "57014", &format!("COPY from stdin failed: {reason}"));
                state.lock().unwrap().copy_fail_reasons.push(reason);
                return Some(());
            }
            other => {
                fail(
                    out,
                    "08P01",
                    &format!("unexpected message type 0x{other:02x} during COPY from stdin"),
                );
                return Some(());
            }
        }
    }
}
