//! Readable stream over a `COPY ... TO STDOUT` session.

use std::future::poll_fn;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_core::stream::FusedStream;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};
use crate::opts::CopyOpts;
use crate::protocol::backend::CopyFormat;
use crate::state::copy_out::{CopyOutStateMachine, CopyOutStep};

use super::conn::{Conn, Deferred};

/// Output of a `COPY ... TO STDOUT` statement.
///
/// Each item holds the CopyData payload bytes decoded from one transport
/// read, concatenated in wire order. Row boundaries are not preserved: a
/// row may span items and an item may hold many rows.
///
/// The stream ends after CopyDone. A server error, a protocol violation or
/// a transport failure is yielded once as `Err`, after any bytes decoded
/// before it, and the stream ends right after.
///
/// Nothing is read from the connection unless the stream is polled. If the
/// stream is dropped early, the rest of the session is skipped at the start
/// of the connection's next operation.
pub struct CopyOut<'a, S> {
    conn: &'a mut Conn<S>,
    state: CopyOutStateMachine,
    high_water_mark: usize,
    pending_error: Option<Error>,
    done: bool,
}

impl<'a, S: AsyncRead + AsyncWrite + Unpin> CopyOut<'a, S> {
    pub(crate) fn new(conn: &'a mut Conn<S>, opts: CopyOpts) -> Self {
        Self {
            conn,
            state: CopyOutStateMachine::new(),
            high_water_mark: opts.high_water_mark,
            pending_error: None,
            done: false,
        }
    }

    /// Number of CopyData messages received so far.
    pub fn row_count(&self) -> u64 {
        self.state.row_count()
    }

    /// Formats announced by the server, once the session has started.
    pub fn format(&self) -> Option<&CopyFormat> {
        self.state.format()
    }

    /// Returns true once the stream has ended.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Wait for the next chunk of output.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        poll_fn(|cx| self.poll_chunk(cx)).await
    }

    /// Read the rest of the output into one buffer.
    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }

    /// Feed buffered framer events to the state machine.
    ///
    /// Stops at the end of the session so that whatever follows CopyDone
    /// stays buffered for the connection.
    fn process_buffered(&mut self) {
        while !self.state.is_finished() {
            let event = match self.conn.framer.next_event() {
                Ok(Some(event)) => event,
                Ok(None) => return,
                Err(e) => {
                    self.conn.mark_broken();
                    self.pending_error = Some(e);
                    return;
                }
            };
            match self.state.step(event) {
                Ok(CopyOutStep::Continue) => {}
                Ok(CopyOutStep::Finished) => return,
                Err(e) => {
                    if self.state.awaiting_input() {
                        self.conn.deferred = Some(Deferred::AbortCopyIn);
                    }
                    self.pending_error = Some(e);
                    return;
                }
            }
        }
    }

    fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes>>> {
        loop {
            if self.done {
                return Poll::Ready(None);
            }

            self.process_buffered();

            if let Some(chunk) = self.state.take_chunk() {
                return Poll::Ready(Some(Ok(chunk)));
            }
            if let Some(e) = self.pending_error.take() {
                self.done = true;
                return Poll::Ready(Some(Err(e)));
            }
            if self.state.is_finished() {
                self.done = true;
                return Poll::Ready(None);
            }

            match self.conn.poll_read_chunk(cx, self.high_water_mark) {
                Poll::Ready(Ok(_)) => {}
                Poll::Ready(Err(e)) => self.pending_error = Some(e),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Stream for CopyOut<'_, S> {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_chunk(cx)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> FusedStream for CopyOut<'_, S> {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

impl<S> Drop for CopyOut<'_, S> {
    fn drop(&mut self) {
        if !self.done {
            tracing::debug!(
                rows = self.state.row_count(),
                "COPY TO stream dropped before the end, skipping the rest on next use"
            );
        }
    }
}
