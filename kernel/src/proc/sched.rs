//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 线程调度器
//!
//! 每 CPU 一份调度状态：一对优先级数组（活动 / 过期）加当前
//! 线程指针。每个数组是 PRIORITY_COUNT 个 FIFO 带一个非空位图，
//! 选取即找最高置位，O(1)。
//!
//! 时间片与优先级挂钩（quantum 函数）；用满整个时间片的线程
//! 累积惩罚压低有效优先级并转入过期数组，活动数组耗尽时两个
//! 数组互换。自愿睡眠逐步偿还惩罚，交互式线程因此保持高位。
//!
//! 就绪队列空时从负载最重的对等 CPU 拉取最旧的可迁移线程。
//! preempt_disable 期间重调度退化为挂起 pending 标志，最外层
//! enable 时补上。

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::{Mutex, Once};

use crate::arch;
use crate::config::{BASE_TIMESLICE, MAX_CPUS, MAX_PENALTY, MAX_TIMESLICE_SHIFT, PRIORITY_COUNT};
use crate::mm::vm::AddressSpace;
use crate::proc::thread::{ExitReason, Thread, ThreadState};
use crate::security::token::Token;

// 位图是 u32
const _: () = assert!(PRIORITY_COUNT <= 32);

/// 优先级对应的时间片（纳秒）
#[inline]
pub fn quantum(priority: u8) -> u64 {
    BASE_TIMESLICE << (priority as usize).min(MAX_TIMESLICE_SHIFT)
}

/// 一个优先级数组：非空位图 + 每优先级 FIFO
struct PrioArray {
    bitmap: u32,
    queues: [VecDeque<Arc<Thread>>; PRIORITY_COUNT],
}

impl PrioArray {
    fn new() -> Self {
        Self {
            bitmap: 0,
            queues: core::array::from_fn(|_| VecDeque::new()),
        }
    }

    fn push(&mut self, thread: Arc<Thread>) {
        let prio = thread.curr_priority() as usize;
        self.bitmap |= 1 << prio;
        self.queues[prio].push_back(thread);
    }

    fn pop_highest(&mut self) -> Option<Arc<Thread>> {
        if self.bitmap == 0 {
            return None;
        }
        let prio = 31 - self.bitmap.leading_zeros() as usize;
        let thread = self.queues[prio].pop_front();
        if self.queues[prio].is_empty() {
            self.bitmap &= !(1 << prio);
        }
        thread
    }

    /// 摘下第一个亲和性允许 cpu_mask 的线程（迁移用）
    fn steal(&mut self, cpu_mask: usize) -> Option<Arc<Thread>> {
        for prio in (0..PRIORITY_COUNT).rev() {
            if self.bitmap & (1 << prio) == 0 {
                continue;
            }
            if let Some(pos) = self.queues[prio]
                .iter()
                .position(|t| t.affinity() & cpu_mask != 0)
            {
                let thread = self.queues[prio].remove(pos);
                if self.queues[prio].is_empty() {
                    self.bitmap &= !(1 << prio);
                }
                return thread;
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }
}

/// 活动 / 过期数组对
struct RunQueue {
    active: PrioArray,
    expired: PrioArray,
}

impl RunQueue {
    fn new() -> Self {
        Self {
            active: PrioArray::new(),
            expired: PrioArray::new(),
        }
    }

    fn enqueue(&mut self, thread: Arc<Thread>, expired: bool) {
        if expired {
            self.expired.push(thread);
        } else {
            self.active.push(thread);
        }
    }

    fn pick(&mut self) -> Option<Arc<Thread>> {
        if let Some(thread) = self.active.pop_highest() {
            return Some(thread);
        }
        // 活动数组耗尽：互换
        core::mem::swap(&mut self.active, &mut self.expired);
        self.active.pop_highest()
    }

    fn steal(&mut self, cpu_mask: usize) -> Option<Arc<Thread>> {
        self.active.steal(cpu_mask).or_else(|| self.expired.steal(cpu_mask))
    }

    fn len(&self) -> usize {
        self.active.len() + self.expired.len()
    }
}

/// 每 CPU 调度状态
struct CpuSched {
    runqueue: Mutex<RunQueue>,
    current: Mutex<Option<Arc<Thread>>>,
    idle: Arc<Thread>,
    preempt_count: AtomicUsize,
    preempt_pending: AtomicBool,
    /// 当前线程用满了时间片，重调度时进过期数组
    expire_current: AtomicBool,
    /// 本 CPU 当前加载的用户地址空间；内核线程沿用，惰性切换
    active_space: Mutex<Option<Arc<AddressSpace>>>,
}

static CPUS: Once<Vec<CpuSched>> = Once::new();

fn idle_loop() {
    loop {
        arch::ops().idle();
    }
}

/// 初始化调度器：为每个在线 CPU 建状态与 idle 线程
pub fn init() {
    CPUS.call_once(|| {
        let count = arch::cpu_count().min(MAX_CPUS);
        (0..count)
            .map(|i| {
                let idle = Thread::new(
                    Weak::new(),
                    alloc::format!("idle-{}", i),
                    idle_loop as usize,
                    0,
                    Token::kernel(),
                )
                .expect("sched: cannot create idle thread");
                idle.set_cpu(i);
                CpuSched {
                    runqueue: Mutex::new(RunQueue::new()),
                    current: Mutex::new(None),
                    idle,
                    preempt_count: AtomicUsize::new(0),
                    preempt_pending: AtomicBool::new(false),
                    expire_current: AtomicBool::new(false),
                    active_space: Mutex::new(None),
                }
            })
            .collect()
    });
}

fn cpus() -> &'static [CpuSched] {
    CPUS.get().expect("sched: not initialized")
}

fn this_cpu() -> &'static CpuSched {
    &cpus()[arch::cpu_id()]
}

/// 当前 CPU 上正在运行的线程
pub fn current_thread() -> Option<Arc<Thread>> {
    CPUS.get()?.get(arch::cpu_id())?.current.lock().clone()
}

/// 把调用者登记为本 CPU 的当前线程（引导期与 CPU 上线路径）
pub fn adopt(thread: Arc<Thread>) {
    thread.set_state(ThreadState::Running);
    thread.set_cpu(arch::cpu_id());
    if thread.timeslice() == 0 {
        thread.set_timeslice(quantum(thread.curr_priority()));
    }
    *this_cpu().current.lock() = Some(thread);
}

/// 把新线程放入就绪队列
///
/// 按亲和性掩码在允许的 CPU 里挑负载最轻的；优先级高于该 CPU
/// 的当前线程时请求抢占
pub fn insert_thread(thread: &Arc<Thread>) {
    let cpus = cpus();
    let affinity = thread.affinity();

    let mut best: Option<(usize, usize)> = None;
    for (i, cpu) in cpus.iter().enumerate() {
        if affinity & (1 << i) == 0 {
            continue;
        }
        let len = cpu.runqueue.lock().len();
        if best.map_or(true, |(blen, _)| len < blen) {
            best = Some((len, i));
        }
    }
    let (_, idx) = best.unwrap_or((0, 0));

    thread.set_cpu(idx);
    thread.set_state(ThreadState::Ready);
    thread.set_timeslice(quantum(thread.curr_priority()));
    cpus[idx].runqueue.lock().enqueue(thread.clone(), false);

    let preempt = cpus[idx]
        .current
        .lock()
        .as_ref()
        .map_or(false, |curr| thread.curr_priority() > curr.curr_priority());
    if preempt {
        cpus[idx].preempt_pending.store(true, Ordering::Release);
    }
}

/// 唤醒一个睡眠线程（等待队列 / 定时器回调使用）
pub fn unblock(thread: Arc<Thread>) {
    let cpus = cpus();
    let idx = thread.cpu().min(cpus.len() - 1);
    thread.set_state(ThreadState::Ready);
    cpus[idx].runqueue.lock().enqueue(thread, false);
}

fn steal_for(idx: usize) -> Option<Arc<Thread>> {
    let cpus = cpus();
    let victim = cpus
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != idx)
        .max_by_key(|(_, cpu)| cpu.runqueue.lock().len())?
        .0;
    cpus[victim].runqueue.lock().steal(1 << idx)
}

/// 禁止本 CPU 抢占（不屏蔽中断）
pub fn preempt_disable() {
    this_cpu().preempt_count.fetch_add(1, Ordering::AcqRel);
}

/// 恢复抢占；最外层恢复时补上被推迟的重调度
pub fn preempt_enable() {
    let cpu = this_cpu();
    let prev = cpu.preempt_count.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prev > 0, "sched: unbalanced preempt_enable");
    if prev == 1 && cpu.preempt_pending.swap(false, Ordering::AcqRel) {
        reschedule();
    }
}

#[cfg(test)]
pub fn preempt_depth() -> usize {
    this_cpu().preempt_count.load(Ordering::Acquire)
}

/// 重调度：选出最高优先级就绪线程并切换过去
///
/// 抢占被禁止时只挂起 pending 标志。仍处 Running 的前任回到
/// 就绪队列（过期与否看 expire_current）；Sleeping / Exited 的
/// 前任已由阻塞或退出路径摘走，不再入队。
pub fn reschedule() {
    let cpu = this_cpu();
    if cpu.preempt_count.load(Ordering::Acquire) > 0 {
        cpu.preempt_pending.store(true, Ordering::Release);
        return;
    }

    let irq_state = arch::local_irq_disable();
    let expire = cpu.expire_current.swap(false, Ordering::AcqRel);
    let prev = cpu.current.lock().clone();

    if let Some(ref prev) = prev {
        if prev.state() == ThreadState::Running && !Arc::ptr_eq(prev, &cpu.idle) {
            prev.set_state(ThreadState::Ready);
            cpu.runqueue.lock().enqueue(prev.clone(), expire);
        }
    }

    let next = {
        let picked = cpu.runqueue.lock().pick();
        picked
            .or_else(|| steal_for(arch::cpu_id()))
            .unwrap_or_else(|| cpu.idle.clone())
    };

    next.set_state(ThreadState::Running);
    next.set_cpu(arch::cpu_id());
    if next.timeslice() == 0 {
        next.set_timeslice(quantum(next.curr_priority()));
    }

    let switch_needed = prev.as_ref().map_or(true, |p| !Arc::ptr_eq(p, &next));
    *cpu.current.lock() = Some(next.clone());

    if switch_needed {
        // 进程线程落地前切换地址空间；内核线程沿用现有映射。
        // switch_to 同时维护上下文的活动 CPU 位图与 stale 冲刷
        if let Some(process) = next.process() {
            let next_space = process.aspace().clone();
            let mut active = cpu.active_space.lock();
            let same = active.as_ref().map_or(false, |a| Arc::ptr_eq(a, &next_space));
            if !same {
                if let Some(old) = active.take() {
                    old.deactivate();
                }
                next_space.activate();
                *active = Some(next_space);
            }
        }

        let prev_ctx = prev
            .as_ref()
            .map(|p| p.context().as_mut_ptr())
            .unwrap_or(core::ptr::null_mut());
        let next_ctx = next.context().as_mut_ptr();
        // 切换回来后先恢复调用方的 IRQ 状态再返回
        unsafe {
            arch::ops().context_switch(prev_ctx, next_ctx);
        }
    }

    arch::local_irq_restore(irq_state);
}

/// 主动让出 CPU：回到本优先级 FIFO 尾部
pub fn yield_now() {
    reschedule();
}

/// 时钟节拍：时间片记账与推迟抢占的兑现
pub fn timer_tick(elapsed: u64) {
    crate::time::timer::process(arch::timestamp());

    let cpu = this_cpu();
    let current = cpu.current.lock().clone();
    let Some(current) = current else {
        return;
    };

    if Arc::ptr_eq(&current, &cpu.idle) {
        if cpu.runqueue.lock().len() > 0 {
            reschedule();
        }
        return;
    }

    let remaining = current.timeslice().saturating_sub(elapsed);
    current.set_timeslice(remaining);

    if remaining == 0 {
        // 用满时间片：惩罚累积，转入过期数组
        current.set_penalty((current.penalty() + 1).min(MAX_PENALTY));
        cpu.expire_current.store(true, Ordering::Release);
        reschedule();
    } else if cpu.preempt_pending.swap(false, Ordering::AcqRel) {
        reschedule();
    }
}

/// 结束当前线程并调度下一个
pub fn exit_current(code: i32, reason: ExitReason) {
    let thread = current_thread().expect("sched: exit with no current thread");
    thread.set_exited(code, reason);
    if let Some(process) = thread.process() {
        process.note_thread_exit(&thread);
    }
    log::debug!("sched: thread {} ({}) exited", thread.id(), thread.name());
    reschedule();
}

/// 清空本 CPU 的调度状态，只留测试自己布置的线程
#[cfg(test)]
pub fn test_reset() {
    let cpu = this_cpu();
    *cpu.current.lock() = None;
    if let Some(space) = cpu.active_space.lock().take() {
        space.deactivate();
    }
    let mut rq = cpu.runqueue.lock();
    while rq.pick().is_some() {}
    cpu.preempt_count.store(0, Ordering::Release);
    cpu.preempt_pending.store(false, Ordering::Release);
    cpu.expire_current.store(false, Ordering::Release);
}
