pub mod dispatch;
pub mod pipeline;
pub mod source;
pub mod transform;
