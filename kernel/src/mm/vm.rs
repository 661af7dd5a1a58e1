//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 地址空间管理
//!
//! 每个进程持有一个地址空间：有序的区域集合加上一个 MMU 上下文。
//! 区域是半开区间 [start, end)，带访问权限与后备类型（匿名 /
//! 文件 / 保留）。结构性修改（map/unmap/protect/reserve）持写锁，
//! 缺页解析持读锁加区域页表锁。
//!
//! 锁序：地址空间 > 区域页集合 > MMU 批次。
//!
//! 页帧共享（fork 后的 COW、文件页缓存）通过页帧引用计数表达：
//! 引用计数大于 1 的页帧一律只读映射，写缺页时复制断开。

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::{Mutex, RwLock};

use crate::arch;
use crate::config::{PAGE_MASK, PAGE_SIZE, USER_BASE, USER_END};
use crate::mm::mmu::{MmuBatch, MmuContext, MmuFlags};
use crate::mm::page::{self, AllocFlags, Page, VirtAddr, ZoneMask};
use crate::status::{KResult, Status};

bitflags::bitflags! {
    /// 区域访问权限
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct VmRights: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

bitflags::bitflags! {
    /// 映射行为
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        /// 必须落在 hint 处；占用时失败
        const FIXED  = 1 << 0;
        /// 共享映射：写穿透到底层页帧，克隆时不 COW
        const SHARED = 1 << 1;
    }
}

/// 文件页的提供方（文件对象、共享内存段实现此接口）
///
/// 返回的页帧引用归调用方，调用方用 page_release 归还
pub trait PageSource: Send + Sync {
    fn get_page(&self, offset: u64) -> KResult<Arc<Page>>;
}

/// 区域后备类型
#[derive(Clone)]
enum Backing {
    Anonymous,
    File { source: Weak<dyn PageSource>, offset: u64 },
    /// 地址保留：不可映射也不可缺页（NULL 页等）
    Reserved,
}

struct Region {
    start: usize,
    end: usize,
    rights: VmRights,
    backing: Backing,
    shared: bool,
    /// 已装入的页帧，键为虚拟页号
    pages: Mutex<BTreeMap<usize, Arc<Page>>>,
}

impl Region {
    fn split(mut self, at: usize) -> (Region, Region) {
        debug_assert!(self.start < at && at < self.end && at & PAGE_MASK == 0);

        let tail_pages = self.pages.get_mut().split_off(&(at / PAGE_SIZE));
        let tail_backing = match &self.backing {
            Backing::File { source, offset } => Backing::File {
                source: source.clone(),
                offset: offset + (at - self.start) as u64,
            },
            other => other.clone(),
        };

        let tail = Region {
            start: at,
            end: self.end,
            rights: self.rights,
            backing: tail_backing,
            shared: self.shared,
            pages: Mutex::new(tail_pages),
        };
        self.end = at;
        (self, tail)
    }
}

struct AsInner {
    /// 起址 -> 区域
    regions: BTreeMap<usize, Region>,
}

/// 地址空间
pub struct AddressSpace {
    mmu: MmuContext,
    inner: RwLock<AsInner>,
    self_ref: Weak<AddressSpace>,
}

/// 页帧是否可以可写地装入叶映射
///
/// 共享区域写穿透；私有区域要求独占引用（否则留待写缺页复制）
fn page_writable(region: &Region, page: &Page) -> bool {
    region.rights.contains(VmRights::WRITE) && (region.shared || page.refcount() == 1)
}

fn leaf_flags(rights: VmRights, writable: bool) -> MmuFlags {
    let mut flags = MmuFlags::READ | MmuFlags::USER;
    if writable {
        flags |= MmuFlags::WRITE;
    }
    if rights.contains(VmRights::EXEC) {
        flags |= MmuFlags::EXEC;
    }
    flags
}

fn find_containing<'a>(inner: &'a AsInner, addr: usize) -> Option<&'a Region> {
    inner
        .regions
        .range(..=addr)
        .next_back()
        .map(|(_, r)| r)
        .filter(|r| r.end > addr)
}

fn range_is_free(inner: &AsInner, start: usize, end: usize) -> bool {
    match inner.regions.range(..end).next_back() {
        Some((_, r)) => r.end <= start,
        None => true,
    }
}

/// 从 from 向上扫描一个能容纳 size 字节的空洞
fn scan_gap(inner: &AsInner, from: usize, size: usize) -> Option<usize> {
    let mut candidate = from;
    if let Some((_, r)) = inner.regions.range(..=candidate).next_back() {
        if r.end > candidate {
            candidate = r.end;
        }
    }
    for (_, r) in inner.regions.range(candidate..) {
        if candidate.checked_add(size)? <= r.start {
            break;
        }
        candidate = r.end;
    }
    if candidate.checked_add(size)? <= USER_END {
        Some(candidate)
    } else {
        None
    }
}

impl AddressSpace {
    /// 创建空的地址空间
    pub fn new() -> KResult<Arc<Self>> {
        let mmu = MmuContext::new()?;
        Ok(Arc::new_cyclic(|weak| Self {
            mmu,
            inner: RwLock::new(AsInner { regions: BTreeMap::new() }),
            self_ref: weak.clone(),
        }))
    }

    #[inline]
    pub fn mmu(&self) -> &MmuContext {
        &self.mmu
    }

    /// 在本 CPU 上激活此地址空间
    pub fn activate(&self) {
        self.mmu.switch_to();
    }

    pub fn deactivate(&self) {
        self.mmu.switch_away();
    }

    fn check_args(addr: usize, size: usize) -> KResult<usize> {
        if size == 0 || addr & PAGE_MASK != 0 {
            return Err(Status::InvalidArg);
        }
        let size = (size + PAGE_MASK) & !PAGE_MASK;
        addr.checked_add(size).ok_or(Status::InvalidArg)
    }

    fn place(
        inner: &AsInner,
        hint: usize,
        size: usize,
        flags: VmFlags,
    ) -> KResult<usize> {
        if flags.contains(VmFlags::FIXED) {
            if hint & PAGE_MASK != 0 || hint < USER_BASE || hint + size > USER_END {
                return Err(Status::InvalidArg);
            }
            if !range_is_free(inner, hint, hint + size) {
                return Err(Status::AlreadyExists);
            }
            return Ok(hint);
        }

        let from = if (USER_BASE..USER_END).contains(&hint) {
            hint & !PAGE_MASK
        } else {
            USER_BASE
        };
        // hint 之上放不下时从窗口底部再扫一遍
        scan_gap(inner, from, size)
            .or_else(|| if from > USER_BASE { scan_gap(inner, USER_BASE, size) } else { None })
            .ok_or(Status::NoMemory)
    }

    fn insert_region(
        &self,
        hint: usize,
        size: usize,
        rights: VmRights,
        flags: VmFlags,
        backing: Backing,
    ) -> KResult<VirtAddr> {
        if size == 0 {
            return Err(Status::InvalidArg);
        }
        let size = (size + PAGE_MASK) & !PAGE_MASK;

        let mut inner = self.inner.write();
        let start = Self::place(&inner, hint, size, flags)?;
        inner.regions.insert(
            start,
            Region {
                start,
                end: start + size,
                rights,
                backing,
                shared: flags.contains(VmFlags::SHARED),
                pages: Mutex::new(BTreeMap::new()),
            },
        );
        Ok(VirtAddr(start))
    }

    /// 保留一段地址：既不可映射也不可访问
    pub fn reserve(&self, start: usize, size: usize) -> KResult<()> {
        let end = Self::check_args(start, size)?;
        let mut inner = self.inner.write();
        if !range_is_free(&inner, start, end) {
            return Err(Status::AlreadyExists);
        }
        inner.regions.insert(
            start,
            Region {
                start,
                end,
                rights: VmRights::empty(),
                backing: Backing::Reserved,
                shared: false,
                pages: Mutex::new(BTreeMap::new()),
            },
        );
        Ok(())
    }

    /// 建立匿名映射；页帧在首次缺页时装入
    pub fn map_anon(
        &self,
        hint: usize,
        size: usize,
        rights: VmRights,
        flags: VmFlags,
    ) -> KResult<VirtAddr> {
        self.insert_region(hint, size, rights, flags, Backing::Anonymous)
    }

    /// 建立文件映射
    ///
    /// 区域只持提供方的弱引用；强引用归句柄表，提供方消亡后
    /// 的缺页返回 DEAD
    pub fn map_file(
        &self,
        hint: usize,
        size: usize,
        rights: VmRights,
        flags: VmFlags,
        source: &Arc<dyn PageSource>,
        offset: u64,
    ) -> KResult<VirtAddr> {
        if offset & PAGE_MASK as u64 != 0 {
            return Err(Status::InvalidArg);
        }
        self.insert_region(
            hint,
            size,
            rights,
            flags,
            Backing::File { source: Arc::downgrade(source), offset },
        )
    }

    fn release_region(region: Region, batch: &mut MmuBatch<'_>) {
        for (vpn, frame) in region.pages.into_inner() {
            batch.unmap(vpn * PAGE_SIZE);
            page::page_release(&frame);
        }
    }

    /// 对 [addr, addr+size) 重叠的每个区域执行 f；
    /// 只被部分覆盖的区域先按边界切分
    fn for_covered<F>(&self, addr: usize, size: usize, mut f: F) -> KResult<()>
    where
        F: FnMut(Region, &mut BTreeMap<usize, Region>, &mut MmuBatch<'_>),
    {
        let end = Self::check_args(addr, size)?;
        let mut inner = self.inner.write();
        let mut batch = self.mmu.lock();

        let keys: Vec<usize> = inner
            .regions
            .range(..end)
            .filter(|(_, r)| r.end > addr)
            .map(|(&k, _)| k)
            .collect();

        for key in keys {
            let mut region = inner.regions.remove(&key).expect("vm: region vanished");
            if region.start < addr {
                let (left, rest) = region.split(addr);
                inner.regions.insert(left.start, left);
                region = rest;
            }
            if region.end > end {
                let (mid, right) = region.split(end);
                inner.regions.insert(right.start, right);
                region = mid;
            }
            f(region, &mut inner.regions, &mut batch);
        }
        Ok(())
    }

    /// 解除 [addr, addr+size) 的映射
    ///
    /// 覆盖的区域被移除或切分；装入的页帧随引用计数归零回到
    /// 空闲链表；TLB 失效由 MMU 批次在返回前完成
    pub fn unmap(&self, addr: usize, size: usize) -> KResult<()> {
        self.for_covered(addr, size, |region, _, batch| {
            Self::release_region(region, batch);
        })
    }

    /// 调整 [addr, addr+size) 内区域的权限
    ///
    /// 可写到只读的降级立即反映到叶映射；只读到可写的提升
    /// 对共享页帧推迟到写缺页
    pub fn protect(&self, addr: usize, size: usize, rights: VmRights) -> KResult<()> {
        self.for_covered(addr, size, |mut region, regions, batch| {
            if matches!(region.backing, Backing::Reserved) {
                regions.insert(region.start, region);
                return;
            }
            region.rights = rights;
            for (&vpn, frame) in region.pages.get_mut().iter() {
                let writable = rights.contains(VmRights::WRITE)
                    && (region.shared || frame.refcount() == 1);
                batch.protect(vpn * PAGE_SIZE, leaf_flags(rights, writable));
            }
            regions.insert(region.start, region);
        })
    }

    fn fault_locked(&self, addr: usize, is_write: bool) -> KResult<()> {
        let page_addr = addr & !PAGE_MASK;
        let vpn = page_addr / PAGE_SIZE;

        let inner = self.inner.read();
        let region = find_containing(&inner, addr).ok_or(Status::AccessDenied)?;

        if matches!(region.backing, Backing::Reserved) {
            return Err(Status::AccessDenied);
        }
        if is_write && !region.rights.contains(VmRights::WRITE) {
            return Err(Status::AccessDenied);
        }
        if !is_write && !region.rights.contains(VmRights::READ) {
            return Err(Status::AccessDenied);
        }

        let mut pages = region.pages.lock();
        let mut batch = self.mmu.lock();

        match pages.get(&vpn) {
            None => {
                let frame = match &region.backing {
                    Backing::Anonymous => {
                        let phys = page::phys_alloc(1, ZoneMask::any(), AllocFlags::ZERO)?;
                        let frame = page::lookup(phys).ok_or(Status::Corrupt)?;
                        frame.set_owner(Some(self.self_ref.clone()));
                        frame
                    }
                    Backing::File { source, offset } => {
                        let source = source.upgrade().ok_or(Status::Dead)?;
                        source.get_page(offset + (page_addr - region.start) as u64)?
                    }
                    Backing::Reserved => unreachable!(),
                };

                let writable = page_writable(region, &frame);
                if let Err(err) = batch.map(page_addr, frame.addr(), leaf_flags(region.rights, writable))
                {
                    page::page_release(&frame);
                    return Err(err);
                }
                pages.insert(vpn, frame);
                Ok(())
            }
            Some(frame) if is_write => {
                if !region.shared && frame.refcount() > 1 {
                    // COW 断开：复制到新页帧，可写装入，归还共享引用
                    let phys = page::phys_alloc(1, ZoneMask::any(), AllocFlags::empty())?;
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            arch::phys_map(frame.addr().0),
                            arch::phys_map(phys.0),
                            PAGE_SIZE,
                        );
                    }
                    let new_frame = page::lookup(phys).ok_or(Status::Corrupt)?;
                    new_frame.set_owner(Some(self.self_ref.clone()));

                    batch.unmap(page_addr);
                    if let Err(err) = batch.map(page_addr, phys, leaf_flags(region.rights, true)) {
                        page::page_release(&new_frame);
                        return Err(err);
                    }

                    let old = pages.insert(vpn, new_frame).expect("vm: slot vanished");
                    page::page_release(&old);
                    Ok(())
                } else {
                    // 独占或共享区域：就地提升为可写
                    let flags = leaf_flags(region.rights, true);
                    if batch.protect(page_addr, flags).is_none() {
                        batch.map(page_addr, frame.addr(), flags)?;
                    }
                    Ok(())
                }
            }
            // 竞争线程已装好映射
            Some(_) => Ok(()),
        }
    }

    /// 缺页解析（缺页异常处理器调用）
    pub fn fault(&self, addr: usize, is_write: bool, is_user: bool) -> Status {
        if is_user && !(USER_BASE..USER_END).contains(&addr) {
            return Status::AccessDenied;
        }
        match self.fault_locked(addr, is_write) {
            Ok(()) => Status::Success,
            Err(status) => status,
        }
    }

    /// 克隆地址空间（process_clone 的核心）
    ///
    /// 保留与共享区域原样复制；私有可写区域在双方标记 COW：
    /// 页帧共享、引用计数加一、两侧叶映射都降为只读
    pub fn clone_regions(&self) -> KResult<Arc<AddressSpace>> {
        let child = AddressSpace::new()?;
        let mut inner = self.inner.write();
        let mut child_inner = child.inner.write();
        let mut parent_batch = self.mmu.lock();
        let mut child_batch = child.mmu.lock();

        for (&start, region) in inner.regions.iter_mut() {
            let mut child_pages = BTreeMap::new();

            if !matches!(region.backing, Backing::Reserved) {
                for (&vpn, frame) in region.pages.get_mut().iter() {
                    frame.retain();
                    let writable = region.shared && region.rights.contains(VmRights::WRITE);
                    if !writable {
                        parent_batch.protect(vpn * PAGE_SIZE, leaf_flags(region.rights, false));
                    }
                    child_batch.map(
                        vpn * PAGE_SIZE,
                        frame.addr(),
                        leaf_flags(region.rights, writable),
                    )?;
                    child_pages.insert(vpn, frame.clone());
                }
            }

            child_inner.regions.insert(
                start,
                Region {
                    start: region.start,
                    end: region.end,
                    rights: region.rights,
                    backing: region.backing.clone(),
                    shared: region.shared,
                    pages: Mutex::new(child_pages),
                },
            );
        }

        drop(child_batch);
        drop(parent_batch);
        drop(child_inner);
        drop(inner);
        Ok(child)
    }

    /// 常驻页数（调试与指标）
    pub fn resident_pages(&self) -> usize {
        let inner = self.inner.read();
        inner.regions.values().map(|r| r.pages.lock().len()).sum()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for (_, region) in core::mem::take(&mut inner.regions) {
            for (_, frame) in region.pages.into_inner() {
                page::page_release(&frame);
            }
        }
    }
}
