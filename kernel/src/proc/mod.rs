//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 进程与调度子系统

pub mod process;
pub mod sched;
pub mod thread;
