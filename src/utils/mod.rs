pub mod error;
pub mod logger;
pub mod secrets;
pub mod validation;
