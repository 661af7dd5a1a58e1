//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! ARM64 页表实现（TTL0 起 4 级，4 KiB 粒度，带 ASID）
//!
//! 与 amd64 相同的下行结构；差异在描述符格式：
//! - 中间级使用表描述符（bits[1:0] = 0b11）
//! - 叶级使用页描述符（bits[1:0] = 0b11）+ AF
//! - 访问控制：AP[1] = EL0 可访问，AP[2] = 只读，UXN/PXN 禁执行

use crate::arch;
use crate::mm::mmu::{ArchMmuOps, MmuFlags};
use crate::mm::page::{self, AllocFlags, PhysAddr, ZoneMask};
use crate::status::{KResult, Status};

const PTE_VALID: u64 = 1 << 0;
/// 中间级：表描述符；叶级：页描述符
const PTE_TYPE: u64 = 1 << 1;
/// Access Flag，未置位的访问会产生异常
const PTE_AF: u64 = 1 << 10;
/// AP[1]：EL0 可访问
const PTE_AP_EL0: u64 = 1 << 6;
/// AP[2]：只读
const PTE_AP_RO: u64 = 1 << 7;
/// Inner Shareable
const PTE_SH_INNER: u64 = 3 << 8;
const PTE_PXN: u64 = 1 << 53;
const PTE_UXN: u64 = 1 << 54;
const PTE_ADDR_MASK: u64 = 0x0000_ffff_ffff_f000;

#[inline]
fn index(level: usize, virt: usize) -> usize {
    (virt >> (12 + 9 * level)) & 0x1ff
}

#[inline]
fn table(phys: u64) -> *mut u64 {
    arch::phys_map(phys) as *mut u64
}

fn encode(phys: u64, flags: MmuFlags) -> u64 {
    let mut pte = (phys & PTE_ADDR_MASK) | PTE_VALID | PTE_TYPE | PTE_AF | PTE_SH_INNER;
    if !flags.contains(MmuFlags::WRITE) {
        pte |= PTE_AP_RO;
    }
    if flags.contains(MmuFlags::USER) {
        pte |= PTE_AP_EL0;
        // 用户映射对内核禁执行
        pte |= PTE_PXN;
    }
    if !flags.contains(MmuFlags::EXEC) {
        pte |= PTE_UXN | PTE_PXN;
    }
    pte
}

fn decode(pte: u64) -> MmuFlags {
    let mut flags = MmuFlags::READ;
    if pte & PTE_AP_RO == 0 {
        flags |= MmuFlags::WRITE;
    }
    if pte & PTE_AP_EL0 != 0 {
        flags |= MmuFlags::USER;
    }
    if pte & PTE_UXN == 0 {
        flags |= MmuFlags::EXEC;
    }
    flags
}

fn walk(root: u64, virt: usize, alloc: bool) -> KResult<*mut u64> {
    let mut table_phys = root;

    for level in (1..=3).rev() {
        let entry_ptr = unsafe { table(table_phys).add(index(level, virt)) };
        let entry = unsafe { entry_ptr.read_volatile() };

        if entry & PTE_VALID == 0 {
            if !alloc {
                return Err(Status::NotFound);
            }
            let new = page::phys_alloc(1, ZoneMask::any(), AllocFlags::ZERO)?;
            unsafe {
                entry_ptr.write_volatile(new.0 | PTE_VALID | PTE_TYPE);
            }
            table_phys = new.0;
        } else {
            table_phys = entry & PTE_ADDR_MASK;
        }
    }

    Ok(unsafe { table(table_phys).add(index(0, virt)) })
}

fn free_table(phys: u64, level: usize) {
    if level > 1 {
        for i in 0..512 {
            let entry = unsafe { table(phys).add(i).read_volatile() };
            if entry & PTE_VALID != 0 {
                free_table(entry & PTE_ADDR_MASK, level - 1);
            }
        }
    }
    page::phys_free(PhysAddr(phys), 1);
}

pub struct Arm64Mmu;

/// 注册用的单例
pub static MMU: Arm64Mmu = Arm64Mmu;

impl ArchMmuOps for Arm64Mmu {
    fn create_root(&self) -> KResult<u64> {
        let root = page::phys_alloc(1, ZoneMask::any(), AllocFlags::ZERO)?;
        Ok(root.0)
    }

    fn destroy_root(&self, root: u64) {
        free_table(root, 4);
    }

    fn map(&self, root: u64, virt: usize, phys: u64, flags: MmuFlags) -> KResult<()> {
        let leaf = walk(root, virt, true)?;
        let existing = unsafe { leaf.read_volatile() };
        if existing & PTE_VALID != 0 {
            return Err(Status::AlreadyExists);
        }
        unsafe {
            leaf.write_volatile(encode(phys, flags));
        }
        Ok(())
    }

    fn unmap(&self, root: u64, virt: usize) -> Option<u64> {
        let leaf = walk(root, virt, false).ok()?;
        let entry = unsafe { leaf.read_volatile() };
        if entry & PTE_VALID == 0 {
            return None;
        }
        unsafe {
            leaf.write_volatile(0);
        }
        Some(entry & PTE_ADDR_MASK)
    }

    fn protect(&self, root: u64, virt: usize, flags: MmuFlags) -> Option<MmuFlags> {
        let leaf = walk(root, virt, false).ok()?;
        let entry = unsafe { leaf.read_volatile() };
        if entry & PTE_VALID == 0 {
            return None;
        }
        let old = decode(entry);
        unsafe {
            leaf.write_volatile(encode(entry & PTE_ADDR_MASK, flags));
        }
        Some(old)
    }

    fn query(&self, root: u64, virt: usize) -> Option<(u64, MmuFlags)> {
        let leaf = walk(root, virt, false).ok()?;
        let entry = unsafe { leaf.read_volatile() };
        if entry & PTE_VALID == 0 {
            return None;
        }
        Some((entry & PTE_ADDR_MASK, decode(entry)))
    }

    fn load(&self, root: u64, asid: u16) {
        // TTBR0 携带 ASID；TLB 条目按 ASID 打标，切换无须冲刷
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        unsafe {
            let ttbr0 = root | ((asid as u64) << 48);
            core::arch::asm!(
                "msr ttbr0_el1, {}",
                "isb",
                in(reg) ttbr0,
                options(nostack)
            );
        }
        #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
        {
            let _ = (root, asid);
        }
    }

    fn invalidate_page(&self, asid: u16, virt: usize) {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        unsafe {
            let arg = ((asid as u64) << 48) | ((virt as u64) >> 12);
            core::arch::asm!(
                "dsb ishst",
                "tlbi vae1is, {}",
                "dsb ish",
                "isb",
                in(reg) arg,
                options(nostack)
            );
        }
        #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
        {
            let _ = (asid, virt);
        }
    }

    fn flush(&self, asid: u16) {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        unsafe {
            let arg = (asid as u64) << 48;
            core::arch::asm!(
                "dsb ishst",
                "tlbi aside1is, {}",
                "dsb ish",
                "isb",
                in(reg) arg,
                options(nostack)
            );
        }
        #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
        {
            let _ = asid;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pte_encode_decode() {
        let pte = encode(0x8_0000_1000, MmuFlags::READ | MmuFlags::USER);
        assert_eq!(pte & PTE_ADDR_MASK, 0x8_0000_1000);
        assert!(pte & PTE_AF != 0);
        assert!(pte & PTE_AP_RO != 0); // 无 WRITE 即只读
        assert!(pte & PTE_AP_EL0 != 0);

        let flags = decode(pte);
        assert!(!flags.contains(MmuFlags::WRITE));
        assert!(flags.contains(MmuFlags::USER));
    }

    #[test]
    fn test_write_implies_not_ro() {
        let pte = encode(0x1000, MmuFlags::READ | MmuFlags::WRITE);
        assert_eq!(pte & PTE_AP_RO, 0);
        assert!(decode(pte).contains(MmuFlags::WRITE));
    }
}
