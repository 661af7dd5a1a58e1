//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! x86-64 (amd64) 架构支持
//!
//! 引导与中断入口由引导桩提供；本目录只包含内核核心需要的
//! 页表格式实现

pub mod mm;
