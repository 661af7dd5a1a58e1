//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 体系结构接口
//!
//! 所有跨架构代码只通过本模块的 trait 访问硬件：
//! - CPU 标识与 per-CPU 访问
//! - IRQ 屏蔽
//! - 上下文切换
//! - 物理内存直映射窗口
//! - TLB 击落 IPI
//!
//! 每个架构（amd64、arm64）提供一个实现，在引导时通过 `install()`
//! 注册。页表格式的架构差异见 `arch/*/mm.rs` 与 `mm/mmu.rs`。

pub mod amd64;
pub mod arm64;

/// 特性选中的目标架构；引导桩经 `arch::active` 取默认后端
#[cfg(feature = "amd64")]
pub use amd64 as active;
#[cfg(all(feature = "arm64", not(feature = "amd64")))]
pub use arm64 as active;

use spin::Once;

/// 保存的 CPU 上下文（内核线程切换用的寄存器快照）
///
/// 只保存被调用者保存寄存器与栈指针/返回地址；
/// 用户态寄存器保存在各线程的 user_frame 中
#[repr(C)]
#[derive(Clone, Debug, Default)]
pub struct CpuContext {
    /// 返回地址
    pub pc: u64,
    /// 栈指针
    pub sp: u64,
    /// 被调用者保存寄存器
    pub regs: [u64; 12],
}

impl CpuContext {
    pub const fn new() -> Self {
        Self { pc: 0, sp: 0, regs: [0; 12] }
    }
}

/// 体系结构操作接口
///
/// 对应 Kiwi 设计说明中的架构多态：(a) MMU 操作（见 ArchMmuOps），
/// (b) IRQ 屏蔽，(c) 上下文切换，(d) per-CPU 访问器
pub trait ArchOps: Send + Sync {
    /// 当前 CPU 编号
    fn cpu_id(&self) -> usize;

    /// 系统中的 CPU 数量
    fn cpu_count(&self) -> usize;

    /// 关中断，返回之前的中断状态（true = 之前开启）
    fn irq_disable(&self) -> bool;

    /// 恢复中断状态
    fn irq_restore(&self, state: bool);

    /// 查询当前中断状态
    fn irq_state(&self) -> bool;

    /// 物理地址到内核直映射窗口的转换
    ///
    /// 内核访问页帧内容（清零、COW 复制、futex 值检查）都经过这里
    fn phys_map(&self, phys: u64) -> *mut u8;

    /// 单调时间戳（纳秒）
    fn timestamp(&self) -> u64;

    /// 内核线程上下文切换
    ///
    /// # Safety
    /// prev/next 必须指向有效的 CpuContext
    unsafe fn context_switch(&self, prev: *mut CpuContext, next: *const CpuContext);

    /// 空闲：开中断等待下一个中断（WFI/HLT）
    fn idle(&self);

    /// 全量内存屏障（页表写入前后使用）
    fn memory_barrier(&self);

    /// 向目标 CPU 发送 TLB 击落 IPI
    ///
    /// 返回目标是否在有限时间内应答；超时的 CPU 由调用方标记
    /// 为 TLB-stale，在下次上下文切换时强制全量冲刷
    fn send_shootdown(&self, cpu: usize) -> bool;
}

static ARCH: Once<&'static dyn ArchOps> = Once::new();

/// 注册体系结构后端（引导早期调用一次）
pub fn install(ops: &'static dyn ArchOps) {
    ARCH.call_once(|| ops);
}

/// 获取体系结构后端
///
/// 在注册前调用是引导顺序错误，按内核断言处理
pub fn ops() -> &'static dyn ArchOps {
    *ARCH.get().expect("arch: backend not installed")
}

#[inline]
pub fn cpu_id() -> usize {
    ops().cpu_id()
}

#[inline]
pub fn cpu_count() -> usize {
    ops().cpu_count()
}

#[inline]
pub fn local_irq_disable() -> bool {
    ops().irq_disable()
}

#[inline]
pub fn local_irq_restore(state: bool) {
    ops().irq_restore(state)
}

#[inline]
pub fn local_irq_state() -> bool {
    ops().irq_state()
}

#[inline]
pub fn phys_map(phys: u64) -> *mut u8 {
    ops().phys_map(phys)
}

#[inline]
pub fn timestamp() -> u64 {
    ops().timestamp()
}

#[inline]
pub fn memory_barrier() {
    ops().memory_barrier()
}

// ============================================================================
// 测试后端
// ============================================================================
