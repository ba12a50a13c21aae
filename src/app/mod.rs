pub mod errors;
pub mod local;
pub mod task_runner;

pub use errors::AppError;
pub use local::{AppLocal, CreateBookmark};
