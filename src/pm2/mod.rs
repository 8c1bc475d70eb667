pub mod decoder;
pub mod invoker;
pub mod locator;
pub mod record;
pub mod service;
