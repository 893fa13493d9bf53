//! Server side: the daemon with its listener and transport tasks, and the
//! bounded pool that runs handler continuations.

pub mod daemon;
pub mod pool;
