//! vws socket transport core.
//! Blocking-setup, non-blocking-I/O sockets with optional TLS, plus the
//! buffer, per-thread error environment, sorted key/value store and URL
//! parser they build on.

pub mod buffer;
pub mod env;
pub mod error;
pub mod kvs;
pub mod socket;
pub mod sys;
pub mod tls;
pub mod url;
pub mod util;

pub use buffer::Buffer;
pub use env::{Environment, Level};
pub use error::{Error, ErrorCode, ErrorValue, Result};
pub use kvs::Kvs;
pub use socket::{NoHooks, Socket, SocketHooks, State as SocketState};
pub use url::Url;
