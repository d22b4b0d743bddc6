pub mod retry;
pub mod sync;
