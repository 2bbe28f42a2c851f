pub mod event;
pub mod optimization;
