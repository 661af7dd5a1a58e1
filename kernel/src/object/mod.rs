//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 内核对象与事件
//!
//! 所有能被句柄寻址的资源都实现 KernelObject。用户态通过
//! object_wait 做多路事件等待：一个 EventWaiter 同时登记到多个
//! 对象的事件表上，第一个触发的对象赢得本次等待，其余在返回
//! 前注销。触发和注销都在各对象的事件表锁内完成，不会有虚假
//! 唤醒。
//!
//! 事件号按对象类型划分（TIMER_EVENT=1、SEMAPHORE_EVENT=1 …）。
//! 边沿触发语义由各对象自行实现：触发时没有等待者就闩住，
//! 下一次 wait_begin 立即消费。

pub mod handle;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;

use crate::status::{KResult, Status};
use crate::sync::waitq::{SleepFlags, WaitQueue};

/// 对象类型标签
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ObjectType {
    Process,
    Thread,
    Timer,
    Semaphore,
    Condition,
    Console,
    Token,
}

/// 句柄可寻址的内核对象
///
/// 引用计数就是 Arc；最后一个引用释放时 Drop 充当析构。
/// 不支持等待或控制的对象保留默认实现。
pub trait KernelObject: Send + Sync {
    fn type_id(&self) -> ObjectType;

    /// 具体类型访问，句柄层按类型派发时向下转型用
    fn as_any(&self) -> &dyn core::any::Any;

    /// 把等待者登记到 event 上；事件已处于触发态时直接
    /// waiter.signal(index) 并不登记
    fn wait_begin(&self, event: u32, index: usize, waiter: &Arc<EventWaiter>) -> KResult<()> {
        let _ = (event, index, waiter);
        Err(Status::NotSupported)
    }

    /// 注销等待者；对未登记的等待者是空操作
    fn wait_end(&self, event: u32, waiter: &Arc<EventWaiter>) {
        let _ = (event, waiter);
    }

    /// 类型私有的控制消息
    fn control(&self, request: u32, arg: u64) -> KResult<u64> {
        let _ = (request, arg);
        Err(Status::NotSupported)
    }
}

impl core::fmt::Debug for dyn KernelObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KernelObject").field("type_id", &self.type_id()).finish()
    }
}

/// 一次多路等待的状态
///
/// 多个对象共享同一个 waiter；第一个 signal 成功者记下自己的
/// 槽位并唤醒等待线程，后续 signal 落空
pub struct EventWaiter {
    queue: Arc<WaitQueue>,
    fired: AtomicBool,
    winner: AtomicUsize,
}

impl EventWaiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: WaitQueue::new("object_wait"),
            fired: AtomicBool::new(false),
            winner: AtomicUsize::new(0),
        })
    }

    /// 宣告槽位 index 的事件触发；返回是否赢得本次等待
    pub fn signal(&self, index: usize) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.winner.store(index, Ordering::Release);
        self.queue.wake_all();
        true
    }

    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub fn winner(&self) -> usize {
        self.winner.load(Ordering::Acquire)
    }
}

struct EventEntry {
    event: u32,
    index: usize,
    waiter: Arc<EventWaiter>,
}

/// 对象侧的事件等待者表
pub struct EventList {
    entries: Mutex<Vec<EventEntry>>,
}

impl EventList {
    pub fn new() -> Self {
        Self { entries: Mutex::new(Vec::new()) }
    }

    pub fn register(&self, event: u32, index: usize, waiter: &Arc<EventWaiter>) {
        self.entries.lock().push(EventEntry {
            event,
            index,
            waiter: waiter.clone(),
        });
    }

    pub fn deregister(&self, event: u32, waiter: &Arc<EventWaiter>) {
        self.entries
            .lock()
            .retain(|e| e.event != event || !Arc::ptr_eq(&e.waiter, waiter));
    }

    /// 触发 event：通知所有登记的等待者，返回拿到事件的个数
    ///
    /// 触发过的登记即消耗（边沿语义）
    pub fn signal(&self, event: u32) -> usize {
        let fired: Vec<EventEntry> = {
            let mut entries = self.entries.lock();
            let mut fired = Vec::new();
            let mut i = 0;
            while i < entries.len() {
                if entries[i].event == event {
                    fired.push(entries.remove(i));
                } else {
                    i += 1;
                }
            }
            fired
        };

        let mut consumed = 0;
        for entry in fired {
            if entry.waiter.signal(entry.index) {
                consumed += 1;
            }
        }
        consumed
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for EventList {
    fn default() -> Self {
        Self::new()
    }
}

/// 睡眠结束后的裁决
///
/// 超时或中断与 signal 竞争时已消费的触发胜出：登记在 signal
/// 时就被摘掉了（边沿语义），这里不收下事件它就丢了
fn settle(waiter: &EventWaiter, slept: Status) -> KResult<usize> {
    if slept == Status::Success || waiter.fired() {
        Ok(waiter.winner())
    } else {
        Err(slept)
    }
}

/// 多路事件等待
///
/// deadline 是绝对单调时刻；Some(0) 表示只轮询不睡眠。
/// 返回第一个触发的槽位下标。
pub fn object_wait(
    entries: &[(Arc<dyn KernelObject>, u32)],
    deadline: Option<u64>,
) -> KResult<usize> {
    if entries.is_empty() {
        return Err(Status::InvalidArg);
    }

    let waiter = EventWaiter::new();

    // 登记阶段：任何一个对象已处于触发态都会立即 signal
    for (i, (object, event)) in entries.iter().enumerate() {
        if let Err(err) = object.wait_begin(*event, i, &waiter) {
            for (object, event) in entries.iter().take(i) {
                object.wait_end(*event, &waiter);
            }
            return Err(err);
        }
    }

    let result = if waiter.fired() {
        Ok(waiter.winner())
    } else if deadline == Some(0) {
        Err(Status::TimedOut)
    } else {
        // 入队后复查触发位：fired 检查与入队之间落下的 signal
        // 只会 wake 一条空队列，复查把这种情况折算成立即返回
        let slept = waiter
            .queue
            .sleep_if(|| !waiter.fired(), deadline, SleepFlags::INTERRUPTIBLE);
        settle(&waiter, slept)
    };

    for (object, event) in entries.iter() {
        object.wait_end(*event, &waiter);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    struct FlagObject {
        events: EventList,
        latched: AtomicBool,
    }

    impl FlagObject {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: EventList::new(),
                latched: AtomicBool::new(false),
            })
        }

        fn trip(&self) {
            if self.events.signal(1) == 0 {
                self.latched.store(true, Ordering::Release);
            }
        }
    }

    impl KernelObject for FlagObject {
        fn type_id(&self) -> ObjectType {
            ObjectType::Condition
        }

        fn as_any(&self) -> &dyn core::any::Any {
            self
        }

        fn wait_begin(&self, event: u32, index: usize, waiter: &Arc<EventWaiter>) -> KResult<()> {
            if event != 1 {
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

    #[test]
    fn test_waiter_first_signal_wins() {
        test_util::bootstrap();

        let waiter = EventWaiter::new();
        assert!(waiter.signal(3));
        assert!(!waiter.signal(5));
        assert_eq!(waiter.winner(), 3);
    }

    #[test]
    fn test_latched_event_consumed_by_wait() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let object = FlagObject::new();
        object.trip();

        let entries: Vec<(Arc<dyn KernelObject>, u32)> = alloc::vec![(object.clone() as _, 1)];
        // 已闩住：不睡眠直接返回
        assert_eq!(object_wait(&entries, Some(0)).unwrap(), 0);
        // 闩已消费：轮询超时
        assert_eq!(object_wait(&entries, Some(0)).unwrap_err(), Status::TimedOut);
    }

    #[test]
    fn test_multiwait_reports_winning_slot() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let quiet = FlagObject::new();
        let tripped = FlagObject::new();
        tripped.trip();

        let entries: Vec<(Arc<dyn KernelObject>, u32)> =
            alloc::vec![(quiet.clone() as _, 1), (tripped.clone() as _, 1)];
        assert_eq!(object_wait(&entries, Some(0)).unwrap(), 1);
        // 输家的登记被清理
        assert!(quiet.events.is_empty());
    }

    #[test]
    fn test_bad_event_unregisters_partial() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let good = FlagObject::new();
        let bad = FlagObject::new();
        let entries: Vec<(Arc<dyn KernelObject>, u32)> =
            alloc::vec![(good.clone() as _, 1), (bad.clone() as _, 99)];
        assert_eq!(object_wait(&entries, Some(0)).unwrap_err(), Status::InvalidArg);
        assert!(good.events.is_empty());
    }

    /// wait_begin 时触发 victim 的事件；模拟登记阶段落下的 signal
    struct Tripper {
        victim: Arc<FlagObject>,
    }

    impl KernelObject for Tripper {
        fn type_id(&self) -> ObjectType {
            ObjectType::Condition
        }

        fn as_any(&self) -> &dyn core::any::Any {
            self
        }

        fn wait_begin(&self, _event: u32, _index: usize, _waiter: &Arc<EventWaiter>) -> KResult<()> {
            self.victim.trip();
            Ok(())
        }
    }

    #[test]
    fn test_signal_during_registration_returns_winner() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        // 槽位 0 先登记，槽位 1 的登记过程触发槽位 0 的事件；
        // 等待不得睡过去，必须立即收下槽位 0
        let victim = FlagObject::new();
        let entries: Vec<(Arc<dyn KernelObject>, u32)> = alloc::vec![
            (victim.clone() as _, 1),
            (Arc::new(Tripper { victim: victim.clone() }) as _, 1),
        ];
        assert_eq!(object_wait(&entries, None).unwrap(), 0);
        assert!(victim.events.is_empty());
    }

    #[test]
    fn test_consumed_event_beats_timeout() {
        test_util::bootstrap();

        let waiter = EventWaiter::new();
        // 未触发：睡眠结果原样传播
        assert_eq!(settle(&waiter, Status::TimedOut).unwrap_err(), Status::TimedOut);
        assert_eq!(
            settle(&waiter, Status::Interrupted).unwrap_err(),
            Status::Interrupted
        );

        // 已消费的触发不得因超时丢弃
        waiter.signal(4);
        assert_eq!(settle(&waiter, Status::TimedOut).unwrap(), 4);
        assert_eq!(settle(&waiter, Status::Success).unwrap(), 4);
    }

    #[test]
    fn test_signal_while_registered() {
        test_util::bootstrap();

        let object = FlagObject::new();
        let waiter = EventWaiter::new();
        object.wait_begin(1, 0, &waiter).unwrap();
        assert!(!waiter.fired());

        object.trip();
        assert!(waiter.fired());
        assert_eq!(waiter.winner(), 0);
        // 登记已随触发消耗
        assert!(object.events.is_empty());
        object.wait_end(1, &waiter);
    }
}
