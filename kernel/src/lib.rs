//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! Kiwi 内核核心
//!
//! 调度器、地址空间管理、阻塞原语、句柄/对象系统与系统调用
//! 分发。本 crate 是架构引导桩链接的库：引导桩完成早期架构
//! 初始化（页表自举、中断向量、per-CPU 寄存器）、注册架构后端
//! （arch::install、mm::mmu::install），然后带着引导内存图调用
//! init()。
//!
//! 外部协作者（设备驱动、文件系统、网络）通过句柄/对象框架
//! 接入，不在本 crate 中。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod console;
pub mod mm;
pub mod object;
pub mod proc;
pub mod security;
pub mod status;
pub mod sync;
pub mod syscall;
pub mod time;

/// 引导桩交给内核的启动描述
pub struct BootInfo<'a> {
    /// 可用物理内存范围 [start, end)，已扣除内核镜像与引导数据
    pub memory_ranges: &'a [(u64, u64)],
    /// 内核命令行
    pub command_line: &'a str,
}

/// 内核核心初始化（引导 CPU 上调用一次）
///
/// 调用前架构后端必须已注册。返回后调度器就绪，引导桩挂入
/// init 进程并进入调度循环。
pub fn init(boot: &BootInfo) {
    console::init();
    log::info!(
        "{} {} starting (cmdline: {:?})",
        config::KERNEL_NAME,
        config::KERNEL_VERSION,
        boot.command_line
    );

    mm::init(boot.memory_ranges);
    time::init();
    proc::sched::init();

    log::info!("kernel core ready ({} cpus)", arch::cpu_count());
}

#[cfg(test)]
pub mod test_util {
    //! 宿主测试的公共引导
    //!
    //! bootstrap 在首个用到它的测试里把模拟后端和全部子系统
    //! 初始化一次；serialize 给共享每 CPU 状态（调度器、定时器
    //! 轮、模拟时钟）的测试做全局互斥。

    use spin::{Mutex, MutexGuard, Once};

    use crate::arch::testing;

    static BOOT: Once<()> = Once::new();
    static SERIAL: Mutex<()> = Mutex::new(());

    /// 一次性初始化模拟架构后端与各子系统（可重复调用）
    pub fn bootstrap() {
        BOOT.call_once(|| {
            testing::init();
            crate::mm::mmu::install(&crate::arch::amd64::mm::MMU);
            crate::console::init();

            crate::init(&crate::BootInfo {
                memory_ranges: &[
                    (testing::LOW_BASE, testing::LOW_BASE + testing::LOW_SIZE),
                    (testing::HIGH_BASE, testing::HIGH_BASE + testing::HIGH_SIZE),
                ],
                command_line: "test",
            });
        });
    }

    /// 串行化持有方；作用域结束自动释放
    pub fn serialize() -> MutexGuard<'static, ()> {
        SERIAL.lock()
    }
}
