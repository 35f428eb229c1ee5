#![allow(
    clippy::collapsible_if,
    clippy::large_enum_variant,
    clippy::manual_range_contains,
    clippy::needless_range_loop,
    clippy::new_without_default,
    clippy::single_match,
    clippy::too_many_arguments,
    clippy::type_complexity
)]

pub mod common;
pub mod config;
pub mod dns;
pub mod engine;
pub mod flow;
pub mod proxy;
pub mod router;
pub mod stack;

pub use common::error::CoreError;
pub use config::VlessConfig;
pub use engine::Engine;
