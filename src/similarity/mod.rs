pub mod engine;
pub mod error;
pub mod matching;
pub mod storage;
