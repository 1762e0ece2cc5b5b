//! Built-in step providers.

pub mod template;

pub use template::CommandTemplateProvider;
