pub mod connection;
pub mod decoder;
pub mod replication;
pub mod target;
pub mod types;


pub use connection::PgConnection;
pub use decoder::Wal2JsonDecoder;
pub use replication::{ChangeSource, SlotReader};
pub use target::{PostgresTarget, TargetDatabase};
pub use types::*;
