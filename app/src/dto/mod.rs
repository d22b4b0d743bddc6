pub mod manifest;

#[rustfmt::skip]
pub use self::manifest::*;
