//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! ARM64 (AArch64) 架构支持
//!
//! SMP 启动、IPI、关机路径由引导桩提供；本目录只包含内核核心
//! 需要的页表格式实现

pub mod mm;
