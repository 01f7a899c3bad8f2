//! Integration tests for `COPY ... TO STDOUT` streaming.
//!
//! Every test runs against the in-process mock backend in `common`, so the
//! backend's bytes arrive in small, arbitrarily split chunks.
//!
//! ## Test Matrix
//!
//! ### Output
//! - `generate_series_output` - rows arrive in order, counted once each
//! - `empty_output` - zero-row copy ends cleanly
//! - `large_row_spans_items` - one 64 KiB row over many items
//! - `items_bounded_by_high_water_mark` - no item larger than one read
//! - `interspersed_messages_ignored` - notice / parameter / notification skipped
//!
//! ### Failures
//! - `server_error_mid_copy` - bytes before the error, then the error, then end
//! - `error_before_start` - failing statement surfaces on the stream
//! - `unexpected_message_type` - protocol error names the message
//! - `duplicate_start_marker` - second CopyOutResponse is a protocol error
//! - `copy_from_statement_rejected` - CopyInResponse is a protocol error, server is released with CopyFail
//! - `server_goes_away` - EOF breaks the connection
//! - `zero_high_water_mark_rejected` - invalid options never reach the server
//!
//! ### Reuse
//! - `early_drop_then_reuse` - dropped stream is drained on next use
//! - `unpolled_copy_from_statement_released` - drain that meets CopyInResponse sends CopyFail
//! - `fused_after_end` - polling past the end keeps returning `None`

use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::timeout;
use zero_pg_copy::{CopyOpts, Error, FormatCode, TransactionStatus};

use crate::common::{BIG_ROW_LEN, connect, connect_with_capacity};

fn series(start: i64, end: i64) -> Vec<u8> {
    (start..=end).flat_map(|i| format!("{i}\n").into_bytes()).collect()
}

#[tokio::test]
async fn generate_series_output() {
    let (mut conn, _server) = connect();
    let mut out = conn
        .copy_out(
            "COPY (SELECT generate_series(1, 1000)) TO STDOUT",
            CopyOpts::default(),
        )
        .await
        .unwrap();

    let bytes = out.read_to_end().await.unwrap();
    assert_eq!(bytes, series(1, 1000));
    assert_eq!(out.row_count(), 1000);
    let format = out.format().unwrap();
    assert_eq!(format.format, FormatCode::Text);
    assert_eq!(format.column_formats, vec![FormatCode::Text]);
    drop(out);

    assert_eq!(conn.query_drop("SELECT 1").await.unwrap(), Some(1));
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
}

#[tokio::test]
async fn empty_output() {
    let (mut conn, _server) = connect();
    let mut out = conn
        .copy_out(
            "COPY (SELECT generate_series(1, 0)) TO STDOUT",
            CopyOpts::default(),
        )
        .await
        .unwrap();

    assert!(out.next_chunk().await.is_none());
    assert_eq!(out.row_count(), 0);
    assert!(out.is_done());
    drop(out);

    assert_eq!(conn.query_drop("SELECT 1").await.unwrap(), Some(1));
}

#[tokio::test]
async fn large_row_spans_items() {
    let (mut conn, _server) = connect_with_capacity(4096);
    let mut out = conn
        .copy_out("COPY big TO STDOUT", CopyOpts::default())
        .await
        .unwrap();

    let mut items = Vec::new();
    while let Some(chunk) = out.next().await {
        items.push(chunk.unwrap());
    }
    assert!(items.len() > 1);
    let total: usize = items.iter().map(|c| c.len()).sum();
    assert_eq!(total, BIG_ROW_LEN);
    assert_eq!(items.last().and_then(|c| c.last()), Some(&b'\n'));
    assert_eq!(out.row_count(), 1);
}

#[tokio::test]
async fn items_bounded_by_high_water_mark() {
    let (mut conn, _server) = connect_with_capacity(8192);
    let opts = CopyOpts::default().with_high_water_mark(100);
    let mut out = conn
        .copy_out("COPY (SELECT generate_series(1, 2000)) TO STDOUT", opts)
        .await
        .unwrap();

    let mut bytes = Vec::new();
    while let Some(chunk) = out.next_chunk().await {
        let chunk = chunk.unwrap();
        assert!(!chunk.is_empty());
        assert!(chunk.len() <= 100, "item of {} bytes", chunk.len());
        bytes.extend_from_slice(&chunk);
    }
    assert_eq!(bytes, series(1, 2000));
    assert_eq!(out.row_count(), 2000);
}

#[tokio::test]
async fn interspersed_messages_ignored() {
    let (mut conn, _server) = connect();
    let mut out = conn
        .copy_out("COPY noisy TO STDOUT", CopyOpts::default())
        .await
        .unwrap();

    assert_eq!(&out.read_to_end().await.unwrap()[..], b"a\nb\n");
    assert_eq!(out.row_count(), 2);
}

#[tokio::test]
async fn server_error_mid_copy() {
    let (mut conn, _server) = connect();
    let mut out = conn
        .copy_out("COPY (SELECT pg_sleep(10)) TO STDOUT", CopyOpts::default())
        .await
        .unwrap();

    let mut bytes = Vec::new();
    let err = loop {
        match out.next_chunk().await {
            Some(Ok(chunk)) => bytes.extend_from_slice(&chunk),
            Some(Err(e)) => break e,
            None => panic!("stream ended without the server error"),
        }
    };
    assert_eq!(bytes, b"1\n");
    assert_eq!(err.sqlstate(), Some("57014"));
    assert!(
        err.to_string()
            .contains("canceling statement due to statement timeout")
    );
    assert!(out.next_chunk().await.is_none());
    drop(out);

    assert!(!conn.is_broken());
    assert_eq!(conn.query_drop("SELECT 1").await.unwrap(), Some(1));
}

#[tokio::test]
async fn error_before_start() {
    let (mut conn, _server) = connect();
    let mut out = conn
        .copy_out("COPY missing TO STDOUT", CopyOpts::default())
        .await
        .unwrap();

    let err = out.next_chunk().await.unwrap().unwrap_err();
    assert_eq!(err.sqlstate(), Some("42P01"));
    assert!(err.to_string().contains("relation \"missing\" does not exist"));
    assert!(out.next_chunk().await.is_none());
    drop(out);

    assert_eq!(conn.query_drop("SELECT 1").await.unwrap(), Some(1));
}

#[tokio::test]
async fn unexpected_message_type() {
    let (mut conn, _server) = connect();
    let mut out = conn
        .copy_out("COPY bogus TO STDOUT", CopyOpts::default())
        .await
        .unwrap();

    let err = out.read_to_end().await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    assert!(err.to_string().contains("Unexpected PostgreSQL message T"));
    drop(out);

    assert_eq!(conn.query_drop("SELECT 1").await.unwrap(), Some(1));
}

#[tokio::test]
async fn duplicate_start_marker() {
    let (mut conn, _server) = connect();
    let mut out = conn
        .copy_out("COPY twice TO STDOUT", CopyOpts::default())
        .await
        .unwrap();

    let mut items = Vec::new();
    while let Some(item) = out.next().await {
        items.push(item);
    }
    let (errors, chunks): (Vec<_>, Vec<_>) = items.into_iter().partition(|i| i.is_err());
    assert_eq!(errors.len(), 1);
    let bytes: Vec<u8> = chunks.into_iter().flat_map(|c| c.unwrap().to_vec()).collect();
    assert_eq!(bytes, b"1\n");
    drop(out);

    assert_eq!(conn.query_drop("SELECT 1").await.unwrap(), Some(1));
}

#[tokio::test]
async fn server_goes_away() {
    let (mut conn, _server) = connect();
    let mut out = conn
        .copy_out("COPY crash TO STDOUT", CopyOpts::default())
        .await
        .unwrap();

    let err = out.read_to_end().await.unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    drop(out);

    assert!(conn.is_broken());
    assert!(matches!(
        conn.query_drop("SELECT 1").await,
        Err(Error::ConnectionBroken)
    ));
}

#[tokio::test]
async fn zero_high_water_mark_rejected() {
    let (mut conn, server) = connect();
    let opts = CopyOpts::default().with_high_water_mark(0);
    let result = conn
        .copy_out("COPY (SELECT generate_series(1, 3)) TO STDOUT", opts)
        .await;
    assert!(matches!(result, Err(Error::InvalidUsage(_))));
    drop(result);

    assert_eq!(conn.query_drop("SELECT 1").await.unwrap(), Some(1));
    assert_eq!(server.queries(), vec!["SELECT 1".to_string()]);
}

#[tokio::test]
async fn early_drop_then_reuse() {
    let (mut conn, server) = connect_with_capacity(1024);
    let mut out = conn
        .copy_out(
            "COPY (SELECT generate_series(1, 50000)) TO STDOUT",
            CopyOpts::default(),
        )
        .await
        .unwrap();

    let first = out.next_chunk().await.unwrap().unwrap();
    assert!(!first.is_empty());
    assert!(first.starts_with(b"1"));
    drop(out);
    assert!(conn.needs_sync());

    assert_eq!(conn.query_drop("SELECT 1").await.unwrap(), Some(1));
    assert!(!conn.needs_sync());

    // and the connection still streams correctly afterwards
    let mut out = conn
        .copy_out(
            "COPY (SELECT generate_series(5, 7)) TO STDOUT",
            CopyOpts::default(),
        )
        .await
        .unwrap();
    assert_eq!(&out.read_to_end().await.unwrap()[..], b"5\n6\n7\n");
    drop(out);

    assert_eq!(server.queries().len(), 3);
}

#[tokio::test]
async fn fused_after_end() {
    use futures_util::stream::FusedStream;

    let (mut conn, _server) = connect();
    let mut out = conn
        .copy_out(
            "COPY (SELECT generate_series(1, 3)) TO STDOUT",
            CopyOpts::default(),
        )
        .await
        .unwrap();

    assert!(!out.is_terminated());
    while out.next().await.is_some() {}
    assert!(out.is_terminated());
    assert!(out.next().await.is_none());
    assert!(out.next().await.is_none());
}

#[tokio::test]
async fn copy_from_statement_rejected() {
    let (mut conn, server) = connect();
    let mut out = conn
        .copy_out("COPY numbers FROM STDIN", CopyOpts::default())
        .await
        .unwrap();

    let err = out.read_to_end().await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    assert!(err.to_string().contains("Unexpected PostgreSQL message G"));
    drop(out);
    assert!(!conn.is_broken());

    let reused = timeout(Duration::from_secs(5), conn.query_drop("SELECT 1"))
        .await
        .expect("connection still held in copy-in mode");
    assert_eq!(reused.unwrap(), Some(1));
    assert_eq!(server.copy_fail_reasons().len(), 1);
    assert!(server.numbers().is_empty());
}

#[tokio::test]
async fn unpolled_copy_from_statement_released() {
    let (mut conn, server) = connect();
    let out = conn
        .copy_out("COPY numbers FROM STDIN", CopyOpts::default())
        .await
        .unwrap();
    drop(out);

    let synced = timeout(Duration::from_secs(5), conn.sync())
        .await
        .expect("connection still held in copy-in mode");
    synced.unwrap();
    assert!(!conn.needs_sync());
    assert_eq!(server.copy_fail_reasons().len(), 1);
    assert_eq!(conn.query_drop("SELECT 1").await.unwrap(), Some(1));
}
