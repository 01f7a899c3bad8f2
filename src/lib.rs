//! Streaming PostgreSQL COPY for Rust.
//!
//! # Features
//!
//! - **Incremental framing**: Backend bytes are split into messages as they
//!   arrive, with no assumption about transport chunk boundaries
//! - **Sans-I/O state machines**: COPY protocol logic is separated from I/O
//! - **Backpressure**: Nothing is read from the server unless the consumer
//!   polls, and writes wait for the transport to drain
//! - **Reusable connections**: A finished or dropped COPY session leaves the
//!   connection ready for the next query
//!
//! # Example
//!
//! ```no_run
//! use tokio::io::AsyncWriteExt;
//! use tokio::net::TcpStream;
//! use zero_pg_copy::CopyOpts;
//! use zero_pg_copy::tokio::Conn;
//!
//! async fn run(stream: TcpStream) -> zero_pg_copy::Result<()> {
//!     // `stream` has already completed startup and authentication
//!     let mut conn = Conn::new(stream);
//!
//!     let mut sink = conn
//!         .copy_in("COPY numbers FROM STDIN", CopyOpts::default())
//!         .await?;
//!     sink.write_all(b"1\n2\n3\n").await?;
//!     let rows = sink.finish().await?;
//!     assert_eq!(rows, 3);
//!
//!     let mut out = conn
//!         .copy_out("COPY numbers TO STDOUT", CopyOpts::default())
//!         .await?;
//!     while let Some(chunk) = out.next_chunk().await {
//!         let chunk = chunk?;
//!         tracing::info!(len = chunk.len(), "received");
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod opts;
pub mod protocol;
pub mod state;

#[cfg(feature = "tokio")]
pub mod tokio;

pub use error::{Error, ErrorFields, Result};
pub use opts::CopyOpts;
pub use protocol::framer::{FrameEvent, FrameHandler, Framer};
pub use protocol::types::{FormatCode, TransactionStatus};
