//! Persistence layer: connection pools and per-entity repositories.
//!
//! Each repository wraps a [`pool::DbPool`] and exposes only the queries the
//! core actually issues; nothing here is a generic ORM. `batch` and
//! `options` additionally hold process-wide in-memory state (the counter
//! accumulator and the hot-reloaded tunables snapshot respectively).

pub mod abilities;
pub mod batch;
pub mod channels;
pub mod logs;
pub mod options;
pub mod pool;
pub mod tokens;
pub mod users;

pub use abilities::AbilityRepository;
pub use batch::BatchAccumulator;
pub use channels::ChannelRepository;
pub use logs::LogRepository;
pub use options::{OptionRepository, OptionsSnapshot, OptionsStore};
pub use pool::{init_pool, DbPool};
pub use tokens::TokenRepository;
pub use users::UserRepository;
