//! Mail store access: the trait the pipeline talks to and an in-memory backend.

pub mod memory;
pub mod traits;

pub use memory::MemoryMailStore;
pub use traits::MailStore;
