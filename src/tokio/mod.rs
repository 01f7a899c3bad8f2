//! Asynchronous COPY streaming using Tokio.

mod conn;
mod copy_in;
mod copy_out;

pub use conn::Conn;
pub use copy_in::CopyIn;
pub use copy_out::CopyOut;
