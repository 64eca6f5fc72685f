//! Wire protocol spoken by urboot and STK500v1-style bootloaders.

pub mod stk500;
pub mod sync;

// Re-export common types
pub use stk500::{Dialect, Memory, PageOp};
pub use sync::{BootInfo, SyncNegotiator, SyncOutcome, decode_bootinfo, encode_bootinfo};
