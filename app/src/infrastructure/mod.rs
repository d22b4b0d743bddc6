pub mod command;
pub mod database;
pub mod ioc;
pub mod service;
pub mod telemetry;
