//! Synchronous PostgreSQL client.

mod conn;
mod named_portal;
mod pool;
mod stream;
mod transaction;

pub use conn::Conn;
pub use named_portal::NamedPortal;
pub use pool::{Pool, PooledConn};
pub use transaction::Transaction;
