//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 安全子系统

pub mod token;
