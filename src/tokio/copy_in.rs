//! Writable sink for a `COPY ... FROM STDIN` session.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};
use crate::opts::CopyOpts;
use crate::protocol::backend::{CopyFormat, RawMessage};
use crate::protocol::frontend::{write_copy_data, write_copy_done, write_copy_fail};
use crate::state::copy_in::CopyInStateMachine;
use crate::state::{Action, StateMachine};

use super::conn::{Conn, Deferred};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closing {
    /// Accepting writes.
    Open,
    /// CopyDone or CopyFail is queued and being written.
    Flushing,
    /// Waiting for CommandComplete and ReadyForQuery.
    Reading,
    Done,
}

/// Input of a `COPY ... FROM STDIN` statement.
///
/// Every write is sent as one CopyData message of at most
/// `high_water_mark` bytes, so writes larger than that are accepted
/// partially. Bytes are forwarded as they are: the caller supplies the text,
/// CSV or binary COPY format matching the statement.
///
/// Call [`finish`](Self::finish) (or `shutdown` through `AsyncWriteExt`) to
/// end the input and learn the outcome. If the sink is dropped before that,
/// the COPY is aborted with CopyFail at the start of the connection's next
/// operation.
pub struct CopyIn<'a, S> {
    conn: &'a mut Conn<S>,
    state: CopyInStateMachine,
    high_water_mark: usize,
    closing: Closing,
}

impl<'a, S: AsyncRead + AsyncWrite + Unpin> CopyIn<'a, S> {
    pub(crate) fn new(conn: &'a mut Conn<S>, state: CopyInStateMachine, opts: CopyOpts) -> Self {
        Self {
            conn,
            state,
            high_water_mark: opts.high_water_mark,
            closing: Closing::Open,
        }
    }

    /// Formats announced by the server's CopyInResponse.
    pub fn format(&self) -> Option<&CopyFormat> {
        self.state.format()
    }

    /// Rows reported by the server once the session has finished.
    pub fn row_count(&self) -> Option<u64> {
        self.state.row_count()
    }

    /// Send all input and wait for the server to commit it.
    ///
    /// Returns the number of rows copied.
    pub async fn finish(mut self) -> Result<u64> {
        poll_fn(|cx| self.poll_finish(cx, None)).await?;
        Ok(self.state.row_count().unwrap_or_default())
    }

    /// Abort the COPY. The server discards every row of this session.
    pub async fn abort(mut self, reason: &str) -> Result<()> {
        poll_fn(|cx| self.poll_finish(cx, Some(reason))).await
    }

    /// End the input and drive the session to ReadyForQuery.
    ///
    /// `abort` is only looked at while the input is still open.
    fn poll_finish(&mut self, cx: &mut Context<'_>, abort: Option<&str>) -> Poll<Result<()>> {
        loop {
            match self.closing {
                Closing::Open => {
                    self.state.end_input(abort.is_some())?;
                    match abort {
                        Some(reason) => write_copy_fail(&mut self.conn.write_buffer, reason),
                        None => write_copy_done(&mut self.conn.write_buffer),
                    }
                    // the end marker is queued; the rest is plain draining
                    self.conn.deferred = Some(Deferred::Drain);
                    self.closing = Closing::Flushing;
                }
                Closing::Flushing => {
                    ready!(self.conn.poll_flush_write_buffer(cx))?;
                    ready!(self.conn.poll_flush_stream(cx))?;
                    self.closing = Closing::Reading;
                }
                Closing::Reading => {
                    let (type_byte, payload) = ready!(self.conn.poll_message(cx))?;
                    let action = match self.state.step(RawMessage::new(type_byte, &payload)) {
                        Ok(action) => action,
                        Err(e) => {
                            // deferred stays Drain, the next operation resyncs
                            self.closing = Closing::Done;
                            return Poll::Ready(Err(e));
                        }
                    };
                    match action {
                        Action::ReadMessage => {}
                        Action::Finished => {
                            self.closing = Closing::Done;
                            self.conn.deferred = None;
                            self.conn.transaction_status = self.state.transaction_status();
                            if let Some(e) = self.state.take_error() {
                                return Poll::Ready(Err(e));
                            }
                        }
                    }
                }
                Closing::Done => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for CopyIn<'_, S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closing != Closing::Open {
            return Poll::Ready(Err(Error::InvalidUsage("COPY FROM input already ended".into()).into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        // at most one frame in flight
        ready!(this.conn.poll_flush_write_buffer(cx))?;

        let n = buf.len().min(this.high_water_mark);
        write_copy_data(&mut this.conn.write_buffer, buf.get(..n).unwrap_or(buf));

        // the frame is accepted; whatever the transport can't take now goes
        // out on the next write or flush
        if let Poll::Ready(Err(e)) = this.conn.poll_flush_write_buffer(cx) {
            return Poll::Ready(Err(e.into()));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.conn.poll_flush_write_buffer(cx))?;
        ready!(this.conn.poll_flush_stream(cx))?;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_finish(cx, None))?;
        Poll::Ready(Ok(()))
    }
}

impl<S> Drop for CopyIn<'_, S> {
    fn drop(&mut self) {
        if self.closing != Closing::Done {
            tracing::debug!("COPY FROM sink dropped before the end, finishing on next use");
        }
    }
}
