pub mod config;
pub mod dispatch;
pub mod event;
pub mod registry;
pub mod template;

pub mod prelude {
    #[rustfmt::skip]
    pub use super::{
        config::{BackendPolicy, NotFoundPolicy},
        dispatch::DispatchManager,
        event::DispatchEvent,
        registry::JobRegistry,
        template::{ScriptTemplate, TemplateBindings, TemplateEngine},
    };
}
