mod backend_adapter;

#[rustfmt::skip]
pub use self::backend_adapter::{BackendAdapter, BackendStatus, ListFilter};
