//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 信号量
//!
//! 可睡眠的计数信号量，同时作为句柄层对象暴露：up 投递
//! SEMAPHORE_EVENT，等待侧的边沿闩由计数本身充当（计数非零
//! 即处于触发态）。内核里的可睡眠互斥就是初值 1 的信号量。

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::object::{EventList, EventWaiter, KernelObject, ObjectType};
use crate::status::{KResult, Status};

use super::waitq::{SleepFlags, WaitQueue};

pub const SEMAPHORE_EVENT: u32 = 1;

pub struct Semaphore {
    count: AtomicU32,
    queue: Arc<WaitQueue>,
    events: EventList,
}

impl Semaphore {
    pub fn new(initial: u32) -> Arc<Self> {
        Arc::new(Self {
            count: AtomicU32::new(initial),
            queue: WaitQueue::new("semaphore"),
            events: EventList::new(),
        })
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// 不阻塞地尝试取走一个计数
    fn try_down(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .is_ok()
    }

    /// 计数为零时阻塞；deadline 是绝对单调时刻
    pub fn down(&self, deadline: Option<u64>, flags: SleepFlags) -> Status {
        loop {
            if self.try_down() {
                return Status::Success;
            }
            // 入队后复查，关掉 up 与入队之间的窗口
            match self.queue.sleep_if(|| !self.try_down(), deadline, flags) {
                Status::Success => {
                    // 唤醒即转交：up 方已替我们留好计数
                    return Status::Success;
                }
                status => return status,
            }
        }
    }

    /// 归还 n 个计数并唤醒至多 n 个等待者
    pub fn up(&self, n: u32) {
        if n == 0 {
            return;
        }
        self.count.fetch_add(n, Ordering::AcqRel);
        let woken = self.queue.wake_n(n as usize);
        // 被唤醒者各带走一个计数
        for _ in 0..woken {
            let _ = self.try_down();
        }
        self.events.signal(SEMAPHORE_EVENT);
    }
}

impl KernelObject for Semaphore {
    fn type_id(&self) -> ObjectType {
        ObjectType::Semaphore
    }

    fn as_any(&self) -> &dyn core::any::Any {
        self
    }

    fn wait_begin(&self, event: u32, index: usize, waiter: &Arc<EventWaiter>) -> KResult<()> {
        if event != SEMAPHORE_EVENT {
            return Err(Status::InvalidArg);
        }
        // 计数非零即处于触发态
        if self.count() > 0 {
            waiter.signal(index);
        } else {
            self.events.register(event, index, waiter);
        }
        Ok(())
    }

    fn wait_end(&self, event: u32, waiter: &Arc<EventWaiter>) {
        self.events.deregister(event, waiter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    #[test]
    fn test_down_consumes_count() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let sem = Semaphore::new(2);
        assert_eq!(sem.down(None, SleepFlags::NONBLOCK), Status::Success);
        assert_eq!(sem.down(None, SleepFlags::NONBLOCK), Status::Success);
        assert_eq!(sem.down(None, SleepFlags::NONBLOCK), Status::WouldBlock);
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn test_up_restores_count() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let sem = Semaphore::new(0);
        sem.up(3);
        assert_eq!(sem.count(), 3);
        assert_eq!(sem.down(None, SleepFlags::NONBLOCK), Status::Success);
        assert_eq!(sem.count(), 2);
    }

    #[test]
    fn test_event_fires_when_count_available() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let sem = Semaphore::new(1);
        let waiter = EventWaiter::new();
        sem.wait_begin(SEMAPHORE_EVENT, 0, &waiter).unwrap();
        // 计数可用：登记即触发
        assert!(waiter.fired());

        let drained = Semaphore::new(0);
        let waiter = EventWaiter::new();
        drained.wait_begin(SEMAPHORE_EVENT, 0, &waiter).unwrap();
        assert!(!waiter.fired());
        drained.up(1);
        assert!(waiter.fired());
        drained.wait_end(SEMAPHORE_EVENT, &waiter);
    }

    #[test]
    fn test_bad_event_rejected() {
        test_util::bootstrap();

        let sem = Semaphore::new(0);
        let waiter = EventWaiter::new();
        assert_eq!(
            sem.wait_begin(7, 0, &waiter).unwrap_err(),
            Status::InvalidArg
        );
    }
}
