pub mod models;
pub mod lsf_client;

#[rustfmt::skip]
pub use self::{
    models::*,
    lsf_client::*
};
