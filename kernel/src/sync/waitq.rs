//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 等待队列
//!
//! 阻塞线程的 FIFO。睡眠方登记自己、置 Sleeping、可选地在定时器
//! 轮上武装截止时刻，然后调度走；唤醒方（wake / 超时回调 / 中断）
//! 把线程摘下队列、填写阻塞结果、送回就绪队列。
//!
//! 队列内部锁在重调度之前释放；结果经由线程的 wait_result 传递，
//! 摘队和填结果在队列锁内完成，因此不会有虚假唤醒。

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use spin::Mutex;

use crate::arch;
use crate::proc::sched;
use crate::proc::thread::{Thread, ThreadState};
use crate::status::Status;
use crate::time::timer::{self, TimerId};

bitflags::bitflags! {
    /// 睡眠行为
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct SleepFlags: u32 {
        /// 线程被要求退出时返回 INTERRUPTED
        const INTERRUPTIBLE = 1 << 0;
        /// 不睡眠，直接返回 WOULD_BLOCK
        const NONBLOCK      = 1 << 1;
    }
}

struct Waiter {
    thread: Arc<Thread>,
    /// (cpu, 定时器编号, 绝对到期时刻)；迁移时按到期时刻重新武装
    timer: Option<(usize, TimerId, u64)>,
}

/// 等待队列
pub struct WaitQueue {
    name: &'static str,
    waiters: Mutex<VecDeque<Waiter>>,
}

impl WaitQueue {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            waiters: Mutex::new(VecDeque::new()),
        })
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    /// 阻塞当前线程直到被唤醒、超时或中断
    ///
    /// deadline 是绝对单调时刻。调用方必须先检查自己的条件再
    /// 睡眠；检查与入队之间有唤醒窗口的调用方改用 sleep_if。
    pub fn sleep(self: &Arc<Self>, deadline: Option<u64>, flags: SleepFlags) -> Status {
        self.sleep_if(|| true, deadline, flags)
    }

    /// 先入队再复查条件的睡眠
    ///
    /// still_blocked 在登记完成之后求值：返回 false 说明条件在
    /// 检查与入队之间已被满足，线程摘队直接返回成功，不经过
    /// 调度器。唤醒方只要在改变条件之后唤醒，就不会丢失唤醒。
    pub fn sleep_if<F>(self: &Arc<Self>, still_blocked: F, deadline: Option<u64>, flags: SleepFlags) -> Status
    where
        F: FnOnce() -> bool,
    {
        if flags.contains(SleepFlags::NONBLOCK) {
            return Status::WouldBlock;
        }

        let thread = sched::current_thread().expect("waitq: sleep with no current thread");
        if flags.contains(SleepFlags::INTERRUPTIBLE) && thread.killed() {
            return Status::Interrupted;
        }

        thread.set_wait_result(Status::Success);
        thread.set_interruptible(flags.contains(SleepFlags::INTERRUPTIBLE));
        // 自愿睡眠偿还一级时间片惩罚
        thread.set_penalty(thread.penalty().saturating_sub(1));
        thread.set_state(ThreadState::Sleeping);

        let timer = deadline.map(|expiry| {
            let cpu = arch::cpu_id();
            let queue = self.clone();
            let sleeper = thread.clone();
            let id = timer::arm(
                cpu,
                expiry,
                alloc::boxed::Box::new(move || queue.expire(&sleeper)),
            );
            (cpu, id, expiry)
        });

        self.waiters.lock().push_back(Waiter { thread: thread.clone(), timer });

        if !still_blocked() {
            // 条件在入队前已满足；还在队上就撤掉登记直接返回。
            // 已被并发唤醒的照常走调度器。
            let waiter = {
                let mut waiters = self.waiters.lock();
                match waiters.iter().position(|w| Arc::ptr_eq(&w.thread, &thread)) {
                    Some(pos) => waiters.remove(pos),
                    None => None,
                }
            };
            if let Some(waiter) = waiter {
                if let Some((cpu, id, _)) = waiter.timer {
                    timer::cancel(cpu, id);
                }
                thread.set_interruptible(false);
                thread.set_state(ThreadState::Running);
                return Status::Success;
            }
        }

        sched::reschedule();

        // 醒来：结果由唤醒方在队列锁内填好
        thread.set_interruptible(false);
        thread.take_wait_result()
    }

    /// 摘下线程并填写结果；不在队列上（已被并发唤醒）返回 false
    fn remove_and_finish(&self, thread: &Arc<Thread>, result: Status) -> bool {
        let waiter = {
            let mut waiters = self.waiters.lock();
            match waiters.iter().position(|w| Arc::ptr_eq(&w.thread, thread)) {
                Some(pos) => waiters.remove(pos),
                None => None,
            }
        };
        match waiter {
            Some(waiter) => {
                if result != Status::TimedOut {
                    if let Some((cpu, id, _)) = waiter.timer {
                        timer::cancel(cpu, id);
                    }
                }
                waiter.thread.set_wait_result(result);
                sched::unblock(waiter.thread);
                true
            }
            None => false,
        }
    }

    /// 截止时刻回调
    fn expire(&self, thread: &Arc<Thread>) {
        self.remove_and_finish(thread, Status::TimedOut);
    }

    /// 要求线程放弃等待；仅对可中断睡眠生效
    pub fn interrupt(&self, thread: &Arc<Thread>) -> bool {
        if !thread.interruptible() {
            return false;
        }
        self.remove_and_finish(thread, Status::Interrupted)
    }

    /// 唤醒队首线程
    pub fn wake_one(&self) -> bool {
        let waiter = self.waiters.lock().pop_front();
        match waiter {
            Some(waiter) => {
                if let Some((cpu, id, _)) = waiter.timer {
                    timer::cancel(cpu, id);
                }
                waiter.thread.set_wait_result(Status::Success);
                sched::unblock(waiter.thread);
                true
            }
            None => false,
        }
    }

    /// 唤醒至多 n 个，返回实际唤醒数
    pub fn wake_n(&self, n: usize) -> usize {
        let mut woken = 0;
        while woken < n && self.wake_one() {
            woken += 1;
        }
        woken
    }

    pub fn wake_all(&self) -> usize {
        self.wake_n(usize::MAX)
    }

    /// 把至多 n 个等待者整体迁移到另一条队列（futex requeue）
    pub fn requeue_to(&self, target: &Arc<WaitQueue>, n: usize) -> usize {
        if core::ptr::eq(self as *const _, Arc::as_ptr(target)) {
            return 0;
        }
        let mut moved = 0;
        let mut source = self.waiters.lock();
        let mut dest = target.waiters.lock();
        while moved < n {
            match source.pop_front() {
                Some(mut waiter) => {
                    // 截止时刻跟随线程迁移：旧队列上的超时登记作废，
                    // 按原到期时刻在目标队列重新武装
                    if let Some((cpu, id, expiry)) = waiter.timer.take() {
                        timer::cancel(cpu, id);
                        let queue = target.clone();
                        let sleeper = waiter.thread.clone();
                        let new_id = timer::arm(
                            cpu,
                            expiry,
                            alloc::boxed::Box::new(move || queue.expire(&sleeper)),
                        );
                        waiter.timer = Some((cpu, new_id, expiry));
                    }
                    dest.push_back(waiter);
                    moved += 1;
                }
                None => break,
            }
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::testing;
    use crate::security::token::Token;
    use crate::test_util;
    use alloc::string::String;
    use alloc::sync::Weak;

    fn sleeping_thread(queue: &Arc<WaitQueue>, deadline: Option<u64>) -> Arc<Thread> {
        let thread = Thread::new(
            Weak::new(),
            String::from("sleeper"),
            0x1000,
            16,
            Token::kernel(),
        )
        .unwrap();
        thread.set_state(ThreadState::Sleeping);
        thread.set_interruptible(true);
        let timer = deadline.map(|expiry| {
            let q = queue.clone();
            let t = thread.clone();
            let id = timer::arm(0, expiry, alloc::boxed::Box::new(move || q.expire(&t)));
            (0, id, expiry)
        });
        queue
            .waiters
            .lock()
            .push_back(Waiter { thread: thread.clone(), timer });
        thread
    }

    #[test]
    fn test_nonblock_returns_would_block() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let queue = WaitQueue::new("test");
        assert_eq!(queue.sleep(None, SleepFlags::NONBLOCK), Status::WouldBlock);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_sleep_if_condition_already_met() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let current = Thread::new(
            Weak::new(),
            String::from("runner"),
            0x1000,
            16,
            Token::kernel(),
        )
        .unwrap();
        crate::proc::sched::adopt(current.clone());

        let queue = WaitQueue::new("test");
        // 入队后条件复查失败：不经调度器直接返回
        assert_eq!(
            queue.sleep_if(|| false, None, SleepFlags::empty()),
            Status::Success
        );
        assert!(queue.is_empty());
        assert_eq!(current.state(), ThreadState::Running);

        crate::proc::sched::test_reset();
    }

    #[test]
    fn test_wake_one_fifo() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let queue = WaitQueue::new("test");
        let first = sleeping_thread(&queue, None);
        let second = sleeping_thread(&queue, None);

        assert!(queue.wake_one());
        assert_eq!(first.state(), ThreadState::Ready);
        assert_eq!(second.state(), ThreadState::Sleeping);
        assert!(queue.wake_one());
        assert!(!queue.wake_one());

        crate::proc::sched::test_reset();
    }

    #[test]
    fn test_timeout_expires_waiter() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let queue = WaitQueue::new("test");
        let deadline = arch::timestamp() + 50_000;
        let sleeper = sleeping_thread(&queue, Some(deadline));

        testing::advance_time(100_000);
        timer::process(arch::timestamp());

        assert!(queue.is_empty());
        assert_eq!(sleeper.state(), ThreadState::Ready);
        assert_eq!(sleeper.take_wait_result(), Status::TimedOut);

        crate::proc::sched::test_reset();
    }

    #[test]
    fn test_wake_cancels_timer() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let queue = WaitQueue::new("test");
        let deadline = arch::timestamp() + 50_000;
        let sleeper = sleeping_thread(&queue, Some(deadline));

        assert!(queue.wake_one());
        assert_eq!(sleeper.take_wait_result(), Status::Success);

        // 截止时刻过去也不再有超时动作
        testing::advance_time(100_000);
        timer::process(arch::timestamp());
        assert_eq!(sleeper.take_wait_result(), Status::Success);

        crate::proc::sched::test_reset();
    }

    #[test]
    fn test_interrupt_only_when_interruptible() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let queue = WaitQueue::new("test");
        let sleeper = sleeping_thread(&queue, None);

        sleeper.set_interruptible(false);
        assert!(!queue.interrupt(&sleeper));
        assert_eq!(sleeper.state(), ThreadState::Sleeping);

        sleeper.set_interruptible(true);
        assert!(queue.interrupt(&sleeper));
        assert_eq!(sleeper.state(), ThreadState::Ready);
        assert_eq!(sleeper.take_wait_result(), Status::Interrupted);

        crate::proc::sched::test_reset();
    }

    #[test]
    fn test_requeue_moves_waiters() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let source = WaitQueue::new("source");
        let target = WaitQueue::new("target");
        let a = sleeping_thread(&source, None);
        let b = sleeping_thread(&source, None);
        let c = sleeping_thread(&source, None);

        assert_eq!(source.requeue_to(&target, 2), 2);
        assert_eq!(source.len(), 1);
        assert_eq!(target.len(), 2);

        // FIFO 保序：先到的先迁移
        assert!(target.wake_one());
        assert_eq!(a.state(), ThreadState::Ready);
        assert!(source.wake_one());
        assert_eq!(c.state(), ThreadState::Ready);
        let _ = b;

        crate::proc::sched::test_reset();
    }

    #[test]
    fn test_requeue_keeps_deadline() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let source = WaitQueue::new("source");
        let target = WaitQueue::new("target");
        let deadline = arch::timestamp() + 50_000;
        let sleeper = sleeping_thread(&source, Some(deadline));

        assert_eq!(source.requeue_to(&target, usize::MAX), 1);
        assert_eq!(target.len(), 1);

        // 迁移后的绝对截止时刻照常生效，超时把线程从目标队列摘走
        testing::advance_time(100_000);
        timer::process(arch::timestamp());

        assert!(target.is_empty());
        assert_eq!(sleeper.state(), ThreadState::Ready);
        assert_eq!(sleeper.take_wait_result(), Status::TimedOut);

        crate::proc::sched::test_reset();
    }
}
