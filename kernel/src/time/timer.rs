//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 定时器
//!
//! 底层是每 CPU 一个按到期时刻排序的一次性定时器轮，时钟节拍
//! 里用当前时间戳驱动（process）。回调在轮锁之外执行，可以
//! 重新武装定时器。
//!
//! TimerObject 是暴露给句柄层的定时器对象：单次或周期，到期
//! 投递 TIMER_EVENT。事件是边沿语义：触发时没有等待者就闩住，
//! 下一次等待立即消费；被等待消费过后需要再次到期才再触发。

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::{Mutex, Once};

use crate::arch;
use crate::config::MAX_CPUS;
use crate::object::{EventList, EventWaiter, KernelObject, ObjectType};
use crate::status::{KResult, Status};

pub type TimerId = u64;

type Callback = Box<dyn FnOnce() + Send>;

struct Wheel {
    /// (到期时刻, 序号) -> 回调
    entries: Mutex<BTreeMap<(u64, TimerId), Callback>>,
}

static WHEELS: Once<Vec<Wheel>> = Once::new();
static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

pub fn init() {
    WHEELS.call_once(|| {
        (0..arch::cpu_count().min(MAX_CPUS))
            .map(|_| Wheel { entries: Mutex::new(BTreeMap::new()) })
            .collect()
    });
}

fn wheel(cpu: usize) -> &'static Wheel {
    let wheels = WHEELS.get().expect("timer: not initialized");
    &wheels[cpu.min(wheels.len() - 1)]
}

/// 武装一个一次性定时器，到期后在 cpu 的节拍上下文执行回调
pub fn arm(cpu: usize, expiry: u64, callback: Callback) -> TimerId {
    let id = NEXT_TIMER_ID.fetch_add(1, Ordering::AcqRel);
    wheel(cpu).entries.lock().insert((expiry, id), callback);
    id
}

/// 撤销定时器；已经触发（或不存在）时返回 false
pub fn cancel(cpu: usize, id: TimerId) -> bool {
    let mut entries = wheel(cpu).entries.lock();
    let key = entries.keys().find(|(_, tid)| *tid == id).copied();
    match key {
        Some(key) => {
            entries.remove(&key);
            true
        }
        None => false,
    }
}

/// 本 CPU 下一个到期时刻
pub fn next_expiry() -> Option<u64> {
    let wheels = WHEELS.get()?;
    let entries = wheels[arch::cpu_id().min(wheels.len() - 1)].entries.lock();
    entries.keys().next().map(|&(expiry, _)| expiry)
}

/// 触发本 CPU 所有到期的定时器
///
/// 回调在轮锁之外按到期顺序执行
pub fn process(now: u64) {
    let Some(wheels) = WHEELS.get() else {
        return;
    };
    let wheel = &wheels[arch::cpu_id().min(wheels.len() - 1)];

    let mut due: Vec<Callback> = Vec::new();
    {
        let mut entries = wheel.entries.lock();
        while let Some((&(expiry, id), _)) = entries.first_key_value() {
            if expiry > now {
                break;
            }
            if let Some(callback) = entries.remove(&(expiry, id)) {
                due.push(callback);
            }
        }
    }

    for callback in due {
        callback();
    }
}

/// 定时器对象的 TIMER_EVENT
pub const TIMER_EVENT: u32 = 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimerMode {
    OneShot,
    Periodic,
}

struct ArmState {
    cpu: usize,
    id: TimerId,
    interval: u64,
    mode: TimerMode,
}

/// 句柄层的定时器对象
pub struct TimerObject {
    events: EventList,
    /// 触发时无人等待则闩住，下一次等待立即消费
    latched: AtomicBool,
    armed: Mutex<Option<ArmState>>,
    self_ref: Weak<TimerObject>,
}

impl TimerObject {
    pub fn create() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            events: EventList::new(),
            latched: AtomicBool::new(false),
            armed: Mutex::new(None),
            self_ref: weak.clone(),
        })
    }

    /// 武装定时器；已武装时先撤销旧的
    pub fn start(&self, interval_ns: u64, mode: TimerMode) -> KResult<()> {
        if interval_ns == 0 {
            return Err(Status::InvalidArg);
        }
        self.stop();

        let cpu = arch::cpu_id();
        let weak = self.self_ref.clone();
        let id = arm(
            cpu,
            arch::timestamp() + interval_ns,
            Box::new(move || {
                if let Some(timer) = weak.upgrade() {
                    timer.fire();
                }
            }),
        );
        *self.armed.lock() = Some(ArmState { cpu, id, interval: interval_ns, mode });
        Ok(())
    }

    /// 撤销定时器；未武装时是空操作
    pub fn stop(&self) {
        if let Some(state) = self.armed.lock().take() {
            cancel(state.cpu, state.id);
        }
    }

    fn fire(&self) {
        let rearm = {
            let mut armed = self.armed.lock();
            match armed.take() {
                Some(state) if state.mode == TimerMode::Periodic => Some(state.interval),
                _ => None,
            }
        };

        if self.events.signal(TIMER_EVENT) == 0 {
            self.latched.store(true, Ordering::Release);
        }

        if let Some(interval) = rearm {
            // 周期模式重新武装；self_ref 存活由上面的 upgrade 保证
            let _ = self.start(interval, TimerMode::Periodic);
        }
    }
}

impl KernelObject for TimerObject {
    fn type_id(&self) -> ObjectType {
        ObjectType::Timer
    }

    fn as_any(&self) -> &dyn core::any::Any {
        self
    }

    fn wait_begin(&self, event: u32, index: usize, waiter: &Arc<EventWaiter>) -> KResult<()> {
        if event != TIMER_EVENT {
            return Err(Status::InvalidArg);
        }
        if self.latched.swap(false, Ordering::AcqRel) {
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

impl Drop for TimerObject {
    fn drop(&mut self) {
        if let Some(state) = self.armed.get_mut().take() {
            cancel(state.cpu, state.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::testing;
    use crate::test_util;
    use core::sync::atomic::AtomicUsize;

    #[test]
    fn test_oneshot_fires_once() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let fired = Arc::new(AtomicUsize::new(0));
        let hit = fired.clone();
        let now = arch::timestamp();
        arm(0, now + 1000, Box::new(move || {
            hit.fetch_add(1, Ordering::AcqRel);
        }));

        process(now);
        assert_eq!(fired.load(Ordering::Acquire), 0);

        process(now + 1000);
        assert_eq!(fired.load(Ordering::Acquire), 1);
        process(now + 2000);
        assert_eq!(fired.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_cancel_before_expiry() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let fired = Arc::new(AtomicUsize::new(0));
        let hit = fired.clone();
        let now = arch::timestamp();
        let id = arm(0, now + 1000, Box::new(move || {
            hit.fetch_add(1, Ordering::AcqRel);
        }));

        assert!(cancel(0, id));
        assert!(!cancel(0, id)); // 第二次已经不存在
        process(now + 2000);
        assert_eq!(fired.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_expiry_order() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let order = Arc::new(Mutex::new(Vec::new()));
        let now = arch::timestamp();
        for (tag, delta) in [(2u32, 200u64), (1, 100), (3, 300)] {
            let order = order.clone();
            arm(0, now + delta, Box::new(move || order.lock().push(tag)));
        }

        process(now + 300);
        assert_eq!(*order.lock(), alloc::vec![1, 2, 3]);
    }

    #[test]
    fn test_timer_object_latches_without_waiter() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let timer = TimerObject::create();
        timer.start(5000, TimerMode::OneShot).unwrap();

        testing::advance_time(10_000);
        process(arch::timestamp());

        // 无人等待：闩住，等待侧下一次 wait_begin 立即消费
        assert!(timer.latched.load(Ordering::Acquire));
    }

    #[test]
    fn test_periodic_rearms() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let timer = TimerObject::create();
        timer.start(1000, TimerMode::Periodic).unwrap();

        for _ in 0..3 {
            testing::advance_time(1000);
            process(arch::timestamp());
        }
        // 周期定时器始终保持武装
        assert!(timer.armed.lock().is_some());
        timer.stop();
        assert!(timer.armed.lock().is_none());
    }
}
