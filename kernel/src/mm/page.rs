//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 物理页帧管理
//!
//! 页数据库为可用内存映射中的每个物理页维护一条记录（状态、
//! 引用计数、所属地址空间的弱引用）。空闲页按 zone 组织：
//! - ABOVE_4G：4G 以上，通用分配优先使用
//! - BELOW_4G：4G 以下，保留给有 DMA 约束的消费者
//!
//! 跨越 4G 边界的范围在 add_range 时被拆分。
//!
//! 不变式：state == Free ⇔ refcount == 0 且恰好在一个空闲链表上

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use spin::{Mutex, RwLock};

use crate::arch;
use crate::config::{PAGE_MASK, PAGE_SIZE};
use crate::status::{KResult, Status};

pub type PhysFrameNr = usize;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(pub usize);

impl PhysAddr {
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_aligned(&self) -> bool {
        self.0 & PAGE_MASK as u64 == 0
    }

    #[inline]
    pub fn frame_number(&self) -> PhysFrameNr {
        (self.0 as usize) / PAGE_SIZE
    }
}

impl VirtAddr {
    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }

    #[inline]
    pub fn is_aligned(&self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    #[inline]
    pub fn floor(&self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    #[inline]
    pub fn ceil(&self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    #[inline]
    pub fn page_number(&self) -> usize {
        self.0 / PAGE_SIZE
    }
}

/// 页帧状态
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PageState {
    /// 在空闲链表上
    Free = 0,
    /// 已分配给地址空间
    Allocated = 1,
    /// 固定（不可换出）
    Wired = 2,
    /// 内核内部使用（页表等）
    Kernel = 3,
    /// 页缓存
    PageCache = 4,
}

impl PageState {
    fn from_u8(v: u8) -> PageState {
        match v {
            0 => PageState::Free,
            1 => PageState::Allocated,
            2 => PageState::Wired,
            3 => PageState::Kernel,
            _ => PageState::PageCache,
        }
    }
}

/// 页帧记录
///
/// 身份即其物理地址除以页大小；引导时从内存映射范围创建，
/// 之后永不销毁
pub struct Page {
    /// 物理地址
    addr: u64,
    /// 状态
    state: AtomicU8,
    /// 引用计数（在空闲链表上时为 0）
    refcount: AtomicU32,
    /// 所属地址空间的弱回指（可选）
    owner: Mutex<Option<Weak<crate::mm::vm::AddressSpace>>>,
}

impl Page {
    fn new(addr: u64) -> Self {
        Self {
            addr,
            state: AtomicU8::new(PageState::Free as u8),
            refcount: AtomicU32::new(0),
            owner: Mutex::new(None),
        }
    }

    #[inline]
    pub fn addr(&self) -> PhysAddr {
        PhysAddr(self.addr)
    }

    #[inline]
    pub fn state(&self) -> PageState {
        PageState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn set_owner(&self, owner: Option<Weak<crate::mm::vm::AddressSpace>>) {
        *self.owner.lock() = owner;
    }

    pub fn owner(&self) -> Option<Weak<crate::mm::vm::AddressSpace>> {
        self.owner.lock().clone()
    }

    /// 增加引用计数（COW 共享）
    pub fn retain(&self) {
        let prev = self.refcount.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "page: retain of free page {:#x}", self.addr);
    }

    /// 减少引用计数；返回是否应释放回空闲链表
    fn release(&self) -> bool {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "page: release of free page {:#x}", self.addr);
        prev == 1
    }
}

bitflags::bitflags! {
    /// zone 掩码；分配时按优先级顺序扫描（4G 以上优先）
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ZoneMask: u32 {
        const BELOW_4G = 1 << 0;
        const ABOVE_4G = 1 << 1;
    }
}

impl ZoneMask {
    pub fn any() -> Self {
        ZoneMask::BELOW_4G | ZoneMask::ABOVE_4G
    }
}

bitflags::bitflags! {
    /// 分配行为标志
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// 分配后清零
        const ZERO = 1 << 0;
    }
}

const ZONE_COUNT: usize = 2;
const ZONE_BELOW_4G: usize = 0;
const ZONE_ABOVE_4G: usize = 1;
const BOUNDARY_4G: u64 = 0x1_0000_0000;

struct Zone {
    /// 空闲页物理地址集合（有序，便于查找连续段）
    free: Mutex<BTreeSet<u64>>,
    total: AtomicUsize,
    free_count: AtomicUsize,
}

impl Zone {
    const fn new() -> Self {
        Self {
            free: Mutex::new(BTreeSet::new()),
            total: AtomicUsize::new(0),
            free_count: AtomicUsize::new(0),
        }
    }
}

/// 页数据库：物理地址 -> 页记录
static PAGE_DB: RwLock<BTreeMap<u64, Arc<Page>>> = RwLock::new(BTreeMap::new());

static ZONES: [Zone; ZONE_COUNT] = [Zone::new(), Zone::new()];

fn zone_for(addr: u64) -> usize {
    if addr >= BOUNDARY_4G {
        ZONE_ABOVE_4G
    } else {
        ZONE_BELOW_4G
    }
}

/// 统计信息（"页计数"指标的来源）
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PageStats {
    pub total: usize,
    pub free: usize,
    pub allocated: usize,
}

pub fn page_stats() -> PageStats {
    let mut total = 0;
    let mut free = 0;
    for zone in ZONES.iter() {
        total += zone.total.load(Ordering::Acquire);
        free += zone.free_count.load(Ordering::Acquire);
    }
    PageStats { total, free, allocated: total - free }
}

/// 注册一段可用物理内存（仅引导期）
///
/// 为范围内每个页创建记录并推入所属 zone 的空闲链表；
/// 跨越 4G 边界的范围在此处拆分
pub fn add_range(start: u64, end: u64) {
    assert!(start < end, "page: invalid range");
    assert_eq!(start & PAGE_MASK as u64, 0, "page: range not aligned");
    assert_eq!(end & PAGE_MASK as u64, 0, "page: range not aligned");

    if start < BOUNDARY_4G && end > BOUNDARY_4G {
        add_range(start, BOUNDARY_4G);
        add_range(BOUNDARY_4G, end);
        return;
    }

    let zone = &ZONES[zone_for(start)];
    let mut db = PAGE_DB.write();
    let mut free = zone.free.lock();

    let mut addr = start;
    while addr < end {
        // 引导模块可能重复上报；跳过已注册的页
        if !db.contains_key(&addr) {
            db.insert(addr, Arc::new(Page::new(addr)));
            free.insert(addr);
            zone.total.fetch_add(1, Ordering::AcqRel);
            zone.free_count.fetch_add(1, Ordering::AcqRel);
        }
        addr += PAGE_SIZE as u64;
    }

    log::debug!(
        "page: added range {:#x}-{:#x} to zone {}",
        start,
        end,
        zone_for(start)
    );
}

/// 查找页记录
pub fn lookup(phys: PhysAddr) -> Option<Arc<Page>> {
    PAGE_DB.read().get(&(phys.0 & !(PAGE_MASK as u64))).cloned()
}

/// 在一个 zone 内查找 count 个连续空闲页并摘下
fn zone_take_run(zone: &Zone, count: usize) -> Option<u64> {
    let mut free = zone.free.lock();

    let mut run_start: Option<u64> = None;
    let mut run_len = 0usize;
    for &addr in free.iter() {
        match run_start {
            Some(start) if addr == start + (run_len as u64) * PAGE_SIZE as u64 => {
                run_len += 1;
            }
            _ => {
                run_start = Some(addr);
                run_len = 1;
            }
        }
        if run_len == count {
            break;
        }
    }

    if run_len < count {
        return None;
    }

    let start = run_start.expect("run without start");
    for i in 0..count {
        free.remove(&(start + (i as u64) * PAGE_SIZE as u64));
    }
    zone.free_count.fetch_sub(count, Ordering::AcqRel);
    Some(start)
}

/// 分配 count 个物理连续页
///
/// 从 zone_mask 中优先级最高的 zone（4G 以上优先）取页；
/// 没有满足的连续段时返回 NO_MEMORY
pub fn phys_alloc(count: usize, zone_mask: ZoneMask, flags: AllocFlags) -> KResult<PhysAddr> {
    if count == 0 {
        return Err(Status::InvalidArg);
    }

    // 扫描顺序：ABOVE_4G 优先
    let order = [
        (ZONE_ABOVE_4G, ZoneMask::ABOVE_4G),
        (ZONE_BELOW_4G, ZoneMask::BELOW_4G),
    ];

    let mut start = None;
    for (idx, bit) in order {
        if !zone_mask.contains(bit) {
            continue;
        }
        if let Some(addr) = zone_take_run(&ZONES[idx], count) {
            start = Some(addr);
            break;
        }
    }

    let start = start.ok_or(Status::NoMemory)?;

    {
        let db = PAGE_DB.read();
        for i in 0..count {
            let addr = start + (i as u64) * PAGE_SIZE as u64;
            let page = db.get(&addr).expect("page: free page missing from database");
            page.state.store(PageState::Allocated as u8, Ordering::Release);
            page.refcount.store(1, Ordering::Release);
        }
    }

    if flags.contains(AllocFlags::ZERO) {
        for i in 0..count {
            let addr = start + (i as u64) * PAGE_SIZE as u64;
            unsafe {
                core::ptr::write_bytes(arch::phys_map(addr), 0, PAGE_SIZE);
            }
        }
    }

    Ok(PhysAddr(start))
}

fn free_one(page: &Page) {
    // debug 构建对释放页投毒，帮助发现悬挂访问
    #[cfg(debug_assertions)]
    unsafe {
        core::ptr::write_bytes(arch::phys_map(page.addr), 0xde, PAGE_SIZE);
    }

    let zone = &ZONES[zone_for(page.addr)];
    page.state.store(PageState::Free as u8, Ordering::Release);
    let mut free = zone.free.lock();
    let inserted = free.insert(page.addr);
    debug_assert!(inserted, "page: double free of {:#x}", page.addr);
    zone.free_count.fetch_add(1, Ordering::AcqRel);
}

/// 释放一个引用；计数归零时页回到所属 zone
pub fn page_release(page: &Arc<Page>) {
    if page.release() {
        page.set_owner(None);
        free_one(page);
    }
}

/// 归还 count 个页（要求每页引用计数恰为 1）
pub fn phys_free(phys: PhysAddr, count: usize) {
    let db = PAGE_DB.read();
    for i in 0..count {
        let addr = phys.0 + (i as u64) * PAGE_SIZE as u64;
        let page = db.get(&addr).expect("page: free of unknown page");
        let was_last = page.release();
        debug_assert!(was_last, "page: phys_free of shared page {:#x}", addr);
        if was_last {
            page.set_owner(None);
            free_one(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    #[test]
    fn test_alloc_free() {
        test_util::bootstrap();

        let before = page_stats();
        let phys = phys_alloc(1, ZoneMask::any(), AllocFlags::ZERO).unwrap();
        assert!(phys.is_aligned());

        let page = lookup(phys).unwrap();
        assert_eq!(page.state(), PageState::Allocated);
        assert_eq!(page.refcount(), 1);

        let during = page_stats();
        assert_eq!(during.allocated, before.allocated + 1);

        phys_free(phys, 1);
        let page = lookup(phys).unwrap();
        assert_eq!(page.state(), PageState::Free);
        assert_eq!(page.refcount(), 0);
    }

    #[test]
    fn test_zeroed_alloc() {
        test_util::bootstrap();

        let phys = phys_alloc(1, ZoneMask::any(), AllocFlags::ZERO).unwrap();
        let ptr = arch::phys_map(phys.0);
        for i in 0..PAGE_SIZE {
            assert_eq!(unsafe { *ptr.add(i) }, 0);
        }
        phys_free(phys, 1);
    }

    #[test]
    fn test_contiguous_alloc() {
        test_util::bootstrap();

        let phys = phys_alloc(4, ZoneMask::any(), AllocFlags::empty()).unwrap();
        for i in 0..4 {
            let page = lookup(PhysAddr(phys.0 + (i * PAGE_SIZE) as u64)).unwrap();
            assert_eq!(page.state(), PageState::Allocated);
        }
        phys_free(phys, 4);
    }

    #[test]
    fn test_zone_preference() {
        test_util::bootstrap();

        // 通用分配应优先取 4G 以上的 zone
        let phys = phys_alloc(1, ZoneMask::any(), AllocFlags::empty()).unwrap();
        assert!(phys.0 >= BOUNDARY_4G);
        phys_free(phys, 1);

        // 显式要求 BELOW_4G 时必须低于 4G
        let phys = phys_alloc(1, ZoneMask::BELOW_4G, AllocFlags::empty()).unwrap();
        assert!(phys.0 < BOUNDARY_4G);
        phys_free(phys, 1);
    }

    #[test]
    fn test_cow_refcount() {
        test_util::bootstrap();

        let phys = phys_alloc(1, ZoneMask::any(), AllocFlags::empty()).unwrap();
        let page = lookup(phys).unwrap();
        page.retain();
        assert_eq!(page.refcount(), 2);

        page_release(&page);
        assert_eq!(page.state(), PageState::Allocated);
        page_release(&page);
        assert_eq!(page.state(), PageState::Free);
    }
}
