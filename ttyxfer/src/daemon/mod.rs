//! Process lifecycle for the binary.

pub mod shutdown;
