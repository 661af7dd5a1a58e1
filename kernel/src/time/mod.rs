//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 时间子系统

pub mod timer;

/// 初始化每 CPU 定时器轮
pub fn init() {
    timer::init();
}
