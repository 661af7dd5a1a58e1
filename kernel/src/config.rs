//! Kiwi 内核配置
//!
//! 可配置常量由 build.rs 根据 Kernel.toml 生成（见 config_gen.rs），
//! 本文件补充由它们派生的固定常量。

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));

// ============================================================
// 内存布局
// ============================================================

/// 页大小位移
pub const PAGE_SHIFT: usize = 12;

/// 页内偏移掩码
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// 用户地址空间起始地址（NULL 页之上）
pub const USER_BASE: usize = 0x0000_0000_0001_0000;

/// 用户地址空间结束地址（不含）
pub const USER_END: usize = 0x0000_7fff_ffff_f000;

/// 内核 kmem 窗口起始地址
pub const KERNEL_KMEM_BASE: usize = 0xffff_ff00_0000_0000;

/// 内核 kmem 窗口大小（16 GiB）
pub const KERNEL_KMEM_SIZE: usize = 16 * 1024 * 1024 * 1024;

/// 内核栈大小（固定 8 KiB）
pub const KSTACK_SIZE: usize = 8 * 1024;

// ============================================================
// MMU
// ============================================================

/// TLB 失效队列大小；超出后整个上下文全量冲刷
pub const INVALIDATE_QUEUE_SIZE: usize = 128;

/// TLB 击落 IPI 的应答等待上限（纳秒）
pub const SHOOTDOWN_TIMEOUT: u64 = 10_000_000;

// ============================================================
// 调度器
// ============================================================

/// 时间片移位上限（时间片 = BASE_TIMESLICE << min(priority, 上限)）
pub const MAX_TIMESLICE_SHIFT: usize = 6;

/// 默认线程优先级
pub const PRIORITY_DEFAULT: u8 = 16;
