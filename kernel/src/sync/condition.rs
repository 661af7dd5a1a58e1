//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 条件对象
//!
//! 一个布尔位。置位时向所有等待 CONDITION_EVENT_SET 的线程投递
//! 事件；已置位时新来的等待立即得到满足（电平语义在等待侧表现
//! 为登记即触发）。清零只影响之后的等待。

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::object::{EventList, EventWaiter, KernelObject, ObjectType};
use crate::status::{KResult, Status};

pub const CONDITION_EVENT_SET: u32 = 1;

pub struct Condition {
    set: AtomicBool,
    events: EventList,
}

impl Condition {
    pub fn new(initial: bool) -> Arc<Self> {
        Arc::new(Self {
            set: AtomicBool::new(initial),
            events: EventList::new(),
        })
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// 置位并唤醒所有等待者；清零是静默的
    pub fn set(&self, value: bool) {
        self.set.store(value, Ordering::Release);
        if value {
            self.events.signal(CONDITION_EVENT_SET);
        }
    }
}

impl KernelObject for Condition {
    fn type_id(&self) -> ObjectType {
        ObjectType::Condition
    }

    fn as_any(&self) -> &dyn core::any::Any {
        self
    }

    fn wait_begin(&self, event: u32, index: usize, waiter: &Arc<EventWaiter>) -> KResult<()> {
        if event != CONDITION_EVENT_SET {
            return Err(Status::InvalidArg);
        }
        if self.is_set() {
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
