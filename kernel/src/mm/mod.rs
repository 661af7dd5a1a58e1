//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 内存管理子系统

pub mod kmalloc;
pub mod kmem;
pub mod mmu;
pub mod page;
pub mod safe;
pub mod vm;

/// 按依赖序初始化内存子系统（引导期调用一次）
///
/// 堆先行（页数据库依赖堆），随后注册引导内存图的可用范围、
/// 建立内核 MMU 上下文与内核虚拟窗口。
/// 调用前架构后端（arch::install / mmu::install）必须已注册。
pub fn init(ranges: &[(u64, u64)]) {
    kmalloc::init();
    for &(start, end) in ranges {
        page::add_range(start, end);
    }
    mmu::init();
    kmem::init();

    let stats = page::page_stats();
    log::info!("mm: {} pages available ({} free)", stats.total, stats.free);
}
