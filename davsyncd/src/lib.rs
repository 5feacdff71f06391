pub mod daemon;
pub mod settings;
pub mod storage;
pub mod sync;
