//! Infrastructure adapters: configuration storage, the in-memory loopback
//! radio and the simulated ranging engine.

pub mod loopback;
pub mod simulated_ranging;
pub mod storage;
