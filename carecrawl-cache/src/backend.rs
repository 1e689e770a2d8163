pub mod fjall;
pub mod memory;

pub use self::fjall::FjallDedupCache;
pub use self::memory::InMemoryDedupCache;
