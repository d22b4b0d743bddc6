mod checkpoint;
mod progress;
mod report;

pub mod prelude {
    #[rustfmt::skip]
    pub use super::{
        checkpoint::checkpoint,
        progress::wait_for_completion,
        report::report_events,
    };
}
