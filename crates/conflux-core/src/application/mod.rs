/// Process engine API facade and its builder
pub mod process_engine;

pub use process_engine::{ProcessEngine, ProcessEngineBuilder};
