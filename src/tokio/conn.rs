//! Asynchronous PostgreSQL connection for COPY sessions.

use std::future::poll_fn;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::{Error, Result};
use crate::opts::{CopyOpts, DEFAULT_HIGH_WATER_MARK};
use crate::protocol::backend::{RawMessage, msg_type};
use crate::protocol::framer::{FrameEvent, Framer};
use crate::protocol::frontend::{write_copy_fail, write_query};
use crate::protocol::types::TransactionStatus;
use crate::state::copy_in::CopyInStateMachine;
use crate::state::simple_query::SimpleQueryStateMachine;
use crate::state::sync::SyncStateMachine;
use crate::state::{Action, StateMachine};

use super::copy_in::CopyIn;
use super::copy_out::CopyOut;

/// Work a detached session left for the connection's next operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deferred {
    /// Skip the rest of the session's server messages up to ReadyForQuery.
    Drain,
    /// The server still waits for COPY FROM input: send CopyFail, then drain.
    AbortCopyIn,
}

/// Message whose payload is still arriving.
#[derive(Debug)]
struct PartialMessage {
    type_byte: u8,
    len: usize,
    payload: BytesMut,
}

/// Asynchronous PostgreSQL connection.
///
/// Wraps a transport on which startup and authentication already completed.
/// A COPY session borrows the connection mutably for its whole lifetime, so
/// nothing else can read from the transport while a session is attached.
///
/// When a session ends (or is dropped early) the connection is not synced
/// right away. The session records what is left to do, and the connection
/// performs it at the start of its next operation.
pub struct Conn<S> {
    stream: S,
    pub(crate) framer: Framer,
    read_buffer: Vec<u8>,
    pub(crate) write_buffer: Vec<u8>,
    write_pos: usize,
    message: Option<PartialMessage>,
    pub(crate) deferred: Option<Deferred>,
    pub(crate) transaction_status: TransactionStatus,
    is_broken: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Conn<S> {
    /// Wrap a transport that is ready for queries.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            framer: Framer::new(),
            read_buffer: Vec::new(),
            write_buffer: Vec::with_capacity(8192),
            write_pos: 0,
            message: None,
            deferred: None,
            transaction_status: TransactionStatus::Idle,
            is_broken: false,
        }
    }

    /// Get the current transaction status.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Check if the connection is broken.
    pub fn is_broken(&self) -> bool {
        self.is_broken
    }

    /// Returns true if a detached session left work for the next operation.
    pub fn needs_sync(&self) -> bool {
        self.deferred.is_some() || self.write_pos < self.write_buffer.len()
    }

    /// Unwrap the underlying transport.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Finish whatever a previous session left behind.
    ///
    /// Called at the start of every operation. Calling it directly is only
    /// needed to observe the transaction status right after a session.
    pub async fn sync(&mut self) -> Result<()> {
        if self.is_broken {
            return Err(Error::ConnectionBroken);
        }
        let result = self.sync_inner().await;
        self.check(result)
    }

    async fn sync_inner(&mut self) -> Result<()> {
        // a dropped COPY FROM may have left half a frame unsent
        self.flush().await?;

        loop {
            match self.deferred {
                Some(Deferred::AbortCopyIn) => {
                    tracing::debug!("aborting unfinished COPY FROM");
                    write_copy_fail(&mut self.write_buffer, "COPY FROM input was dropped");
                    self.deferred = Some(Deferred::Drain);
                    self.flush().await?;
                }
                Some(Deferred::Drain) => {
                    tracing::debug!("resuming connection after detached session");
                    let mut state_machine = SyncStateMachine::new();
                    self.drive(&mut state_machine).await?;
                    // a statement that turned out to be COPY FROM holds the
                    // server in copy-in mode until CopyFail
                    self.deferred = state_machine
                        .awaiting_input()
                        .then_some(Deferred::AbortCopyIn);
                }
                None => return Ok(()),
            }
        }
    }

    /// Write a Query message and flush it.
    pub async fn submit_query(&mut self, sql: &str) -> Result<()> {
        self.sync().await?;
        tracing::debug!(sql, "submitting query");
        write_query(&mut self.write_buffer, sql);
        // the server's answer belongs to whoever submitted the query
        self.deferred = Some(Deferred::Drain);
        let result = self.flush().await;
        self.check(result)
    }

    /// Execute a simple query and discard results.
    pub async fn query_drop(&mut self, sql: &str) -> Result<Option<u64>> {
        self.submit_query(sql).await?;
        let mut state_machine = SimpleQueryStateMachine::new();
        let result = self.drive(&mut state_machine).await;
        let result = self.check(result);
        if result.is_ok() {
            self.deferred = None;
        }
        result?;
        Ok(state_machine.rows_affected())
    }

    /// Start a `COPY ... TO STDOUT` and return its output as a stream.
    ///
    /// The returned [`CopyOut`] yields the CopyData payload bytes in order.
    /// The connection is reusable as soon as the stream has ended.
    pub async fn copy_out(&mut self, sql: &str, opts: CopyOpts) -> Result<CopyOut<'_, S>> {
        opts.validate()?;
        self.submit_query(sql).await?;
        Ok(CopyOut::new(self, opts))
    }

    /// Start a `COPY ... FROM STDIN` and return a writer for its input.
    ///
    /// Waits for the server's CopyInResponse, so a failing statement is
    /// reported here rather than on the first write.
    pub async fn copy_in(&mut self, sql: &str, opts: CopyOpts) -> Result<CopyIn<'_, S>> {
        opts.validate()?;
        self.submit_query(sql).await?;
        let mut state_machine = CopyInStateMachine::new();
        let result = self.drive(&mut state_machine).await;
        self.check(result)?;
        if !state_machine.is_streaming() {
            // finished without CopyInResponse: drive already returned the error
            self.deferred = None;
            return Err(Error::Protocol("COPY FROM did not start".into()));
        }
        self.deferred = Some(Deferred::AbortCopyIn);
        Ok(CopyIn::new(self, state_machine, opts))
    }

    /// Drive a state machine to completion.
    async fn drive<M: StateMachine>(&mut self, state_machine: &mut M) -> Result<()> {
        loop {
            let (type_byte, payload) = self.read_message().await?;
            let action = match state_machine.step(RawMessage::new(type_byte, &payload)) {
                Ok(action) => action,
                Err(e) => {
                    self.deferred = Some(if type_byte == msg_type::COPY_IN_RESPONSE {
                        Deferred::AbortCopyIn
                    } else {
                        Deferred::Drain
                    });
                    return Err(e);
                }
            };
            match action {
                Action::ReadMessage => {}
                Action::Finished => {
                    // CopyInResponse also finishes a drive; only ReadyForQuery carries a status
                    if type_byte == msg_type::READY_FOR_QUERY {
                        self.transaction_status = state_machine.transaction_status();
                    }
                    break;
                }
            }
        }
        match state_machine.take_error() {
            Some(e) => {
                self.deferred = None;
                Err(e)
            }
            None => Ok(()),
        }
    }

    async fn read_message(&mut self) -> Result<(u8, Bytes)> {
        poll_fn(|cx| self.poll_message(cx)).await
    }

    async fn flush(&mut self) -> Result<()> {
        poll_fn(|cx| self.poll_flush_write_buffer(cx)).await?;
        if let Err(e) = self.stream.flush().await {
            self.is_broken = true;
            return Err(e.into());
        }
        Ok(())
    }

    pub(crate) fn mark_broken(&mut self) {
        self.is_broken = true;
    }

    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result
            && e.is_connection_broken()
        {
            self.is_broken = true;
        }
        result
    }

    /// Read one transport chunk of at most `max` bytes into the framer.
    pub(crate) fn poll_read_chunk(&mut self, cx: &mut Context<'_>, max: usize) -> Poll<Result<usize>> {
        if self.is_broken {
            return Poll::Ready(Err(Error::ConnectionBroken));
        }
        self.read_buffer.resize(max.max(1), 0);
        let mut read_buf = ReadBuf::new(&mut self.read_buffer);
        if let Err(e) = ready!(Pin::new(&mut self.stream).poll_read(cx, &mut read_buf)) {
            self.is_broken = true;
            return Poll::Ready(Err(e.into()));
        }
        let filled = read_buf.filled();
        if filled.is_empty() {
            self.is_broken = true;
            return Poll::Ready(Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            ))));
        }
        self.framer.feed(filled);
        Poll::Ready(Ok(filled.len()))
    }

    /// Poll for the next complete message.
    ///
    /// Content that arrives with no header in progress is the tail of a
    /// message a detached session stopped reading halfway; it is skipped.
    pub(crate) fn poll_message(&mut self, cx: &mut Context<'_>) -> Poll<Result<(u8, Bytes)>> {
        loop {
            let event = match self.framer.next_event() {
                Ok(event) => event,
                Err(e) => {
                    self.is_broken = true;
                    return Poll::Ready(Err(e));
                }
            };
            match event {
                Some(FrameEvent::Message { type_byte, len: 0 }) => {
                    return Poll::Ready(Ok((type_byte, Bytes::new())));
                }
                Some(FrameEvent::Message { type_byte, len }) => {
                    self.message = Some(PartialMessage {
                        type_byte,
                        len,
                        payload: BytesMut::with_capacity(len.min(DEFAULT_HIGH_WATER_MARK)),
                    });
                }
                Some(FrameEvent::Content(data)) => {
                    let complete = match &mut self.message {
                        Some(partial) => {
                            partial.payload.extend_from_slice(&data);
                            partial.payload.len() >= partial.len
                        }
                        None => false,
                    };
                    if complete && let Some(done) = self.message.take() {
                        return Poll::Ready(Ok((done.type_byte, done.payload.freeze())));
                    }
                }
                None => {
                    ready!(self.poll_read_chunk(cx, DEFAULT_HIGH_WATER_MARK))?;
                }
            }
        }
    }

    /// Write out everything queued in the write buffer.
    pub(crate) fn poll_flush_write_buffer(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        while self.write_pos < self.write_buffer.len() {
            let pending = self.write_buffer.get(self.write_pos..).unwrap_or_default();
            match ready!(Pin::new(&mut self.stream).poll_write(cx, pending)) {
                Ok(0) => {
                    self.is_broken = true;
                    return Poll::Ready(Err(Error::Io(std::io::ErrorKind::WriteZero.into())));
                }
                Ok(n) => self.write_pos += n,
                Err(e) => {
                    self.is_broken = true;
                    return Poll::Ready(Err(e.into()));
                }
            }
        }
        self.write_buffer.clear();
        self.write_pos = 0;
        Poll::Ready(Ok(()))
    }

    /// Flush the transport itself.
    pub(crate) fn poll_flush_stream(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        match ready!(Pin::new(&mut self.stream).poll_flush(cx)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(e) => {
                self.is_broken = true;
                Poll::Ready(Err(e.into()))
            }
        }
    }
}
