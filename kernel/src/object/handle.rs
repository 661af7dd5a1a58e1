//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 句柄表
//!
//! 用户态命名内核对象的唯一方式。每个表项是 (对象, 权限, 标志)；
//! 句柄号是表内下标，分配时取最小空闲槽位。关闭最后一个引用时
//! Arc 析构即对象析构。

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::config::HANDLE_TABLE_SIZE;
use crate::status::{KResult, Status};

use super::KernelObject;

/// 用户可见的句柄号
pub type Handle = i32;

pub const INVALID_HANDLE: Handle = -1;

bitflags::bitflags! {
    /// 句柄持有者被允许的操作
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct HandleRights: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const WAIT    = 1 << 2;
        const CONTROL = 1 << 3;
    }
}

bitflags::bitflags! {
    /// 句柄自身的属性
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct HandleFlags: u32 {
        /// 进程克隆时复制到子进程的句柄表
        const INHERITABLE = 1 << 0;
    }
}

#[derive(Clone)]
struct Entry {
    object: Arc<dyn KernelObject>,
    rights: HandleRights,
    flags: HandleFlags,
}

/// 每进程句柄表
pub struct HandleTable {
    entries: Mutex<Vec<Option<Entry>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self { entries: Mutex::new(Vec::new()) }
    }

    /// 登记对象，返回最小空闲句柄号；表满返回 NO_HANDLES
    pub fn attach(
        &self,
        object: Arc<dyn KernelObject>,
        rights: HandleRights,
        flags: HandleFlags,
    ) -> KResult<Handle> {
        let entry = Entry { object, rights, flags };
        let mut entries = self.entries.lock();
        for (i, slot) in entries.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(entry);
                return Ok(i as Handle);
            }
        }
        if entries.len() >= HANDLE_TABLE_SIZE {
            return Err(Status::NoHandles);
        }
        entries.push(Some(entry));
        Ok((entries.len() - 1) as Handle)
    }

    fn entry(&self, handle: Handle) -> KResult<Entry> {
        if handle < 0 {
            return Err(Status::InvalidHandle);
        }
        self.entries
            .lock()
            .get(handle as usize)
            .and_then(|slot| slot.clone())
            .ok_or(Status::InvalidHandle)
    }

    /// 解析句柄并检查权限
    pub fn lookup(
        &self,
        handle: Handle,
        required: HandleRights,
    ) -> KResult<Arc<dyn KernelObject>> {
        let entry = self.entry(handle)?;
        if !entry.rights.contains(required) {
            return Err(Status::AccessDenied);
        }
        Ok(entry.object)
    }

    pub fn rights(&self, handle: Handle) -> KResult<HandleRights> {
        Ok(self.entry(handle)?.rights)
    }

    pub fn flags(&self, handle: Handle) -> KResult<HandleFlags> {
        Ok(self.entry(handle)?.flags)
    }

    /// 修改句柄属性（例如开关可继承）
    pub fn set_flags(&self, handle: Handle, flags: HandleFlags) -> KResult<()> {
        if handle < 0 {
            return Err(Status::InvalidHandle);
        }
        let mut entries = self.entries.lock();
        match entries.get_mut(handle as usize).and_then(|s| s.as_mut()) {
            Some(entry) => {
                entry.flags = flags;
                Ok(())
            }
            None => Err(Status::InvalidHandle),
        }
    }

    /// 关闭句柄；掉落的可能是对象的最后一个引用
    pub fn detach(&self, handle: Handle) -> KResult<()> {
        if handle < 0 {
            return Err(Status::InvalidHandle);
        }
        let mut entries = self.entries.lock();
        match entries.get_mut(handle as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(Status::InvalidHandle),
        }
    }

    /// 同表复制：新句柄共享对象，号码取最小空闲槽位
    pub fn duplicate(&self, handle: Handle) -> KResult<Handle> {
        let entry = self.entry(handle)?;
        self.attach(entry.object, entry.rights, entry.flags)
    }

    /// 进程克隆：可继承的句柄保留原号码复制到新表
    pub fn clone_inheritable(&self) -> Self {
        let entries = self.entries.lock();
        let copied = entries
            .iter()
            .map(|slot| {
                slot.as_ref()
                    .filter(|e| e.flags.contains(HandleFlags::INHERITABLE))
                    .cloned()
            })
            .collect();
        Self { entries: Mutex::new(copied) }
    }

    pub fn count(&self) -> usize {
        self.entries.lock().iter().filter(|s| s.is_some()).count()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectType;
    use crate::test_util;

    struct Dummy;

    impl KernelObject for Dummy {
        fn type_id(&self) -> ObjectType {
            ObjectType::Console
        }

        fn as_any(&self) -> &dyn core::any::Any {
            self
        }
    }

    fn full_rights() -> HandleRights {
        HandleRights::all()
    }

    #[test]
    fn test_attach_reuses_lowest_slot() {
        test_util::bootstrap();

        let table = HandleTable::new();
        let a = table.attach(Arc::new(Dummy), full_rights(), HandleFlags::empty()).unwrap();
        let b = table.attach(Arc::new(Dummy), full_rights(), HandleFlags::empty()).unwrap();
        let c = table.attach(Arc::new(Dummy), full_rights(), HandleFlags::empty()).unwrap();
        assert_eq!((a, b, c), (0, 1, 2));

        table.detach(b).unwrap();
        let again = table.attach(Arc::new(Dummy), full_rights(), HandleFlags::empty()).unwrap();
        assert_eq!(again, b);
    }

    #[test]
    fn test_lookup_checks_rights() {
        test_util::bootstrap();

        let table = HandleTable::new();
        let h = table
            .attach(Arc::new(Dummy), HandleRights::READ, HandleFlags::empty())
            .unwrap();

        assert!(table.lookup(h, HandleRights::READ).is_ok());
        assert_eq!(
            table.lookup(h, HandleRights::WRITE).unwrap_err(),
            Status::AccessDenied
        );
        assert_eq!(
            table.lookup(INVALID_HANDLE, HandleRights::empty()).unwrap_err(),
            Status::InvalidHandle
        );
    }

    #[test]
    fn test_detach_invalidates() {
        test_util::bootstrap();

        let table = HandleTable::new();
        let h = table.attach(Arc::new(Dummy), full_rights(), HandleFlags::empty()).unwrap();
        table.detach(h).unwrap();
        assert_eq!(table.detach(h).unwrap_err(), Status::InvalidHandle);
        assert_eq!(
            table.lookup(h, HandleRights::empty()).unwrap_err(),
            Status::InvalidHandle
        );
    }

    #[test]
    fn test_last_detach_drops_object() {
        test_util::bootstrap();

        let object: Arc<dyn KernelObject> = Arc::new(Dummy);
        let table = HandleTable::new();
        let h = table.attach(object.clone(), full_rights(), HandleFlags::empty()).unwrap();

        assert_eq!(Arc::strong_count(&object), 2);
        table.detach(h).unwrap();
        assert_eq!(Arc::strong_count(&object), 1);
    }

    #[test]
    fn test_clone_keeps_only_inheritable() {
        test_util::bootstrap();

        let table = HandleTable::new();
        let kept = table
            .attach(Arc::new(Dummy), full_rights(), HandleFlags::INHERITABLE)
            .unwrap();
        let dropped = table
            .attach(Arc::new(Dummy), full_rights(), HandleFlags::empty())
            .unwrap();

        let child = table.clone_inheritable();
        // 保号复制
        assert!(child.lookup(kept, HandleRights::READ).is_ok());
        assert_eq!(
            child.lookup(dropped, HandleRights::empty()).unwrap_err(),
            Status::InvalidHandle
        );
        assert_eq!(child.count(), 1);
    }

    #[test]
    fn test_table_capacity() {
        test_util::bootstrap();

        let table = HandleTable::new();
        for _ in 0..HANDLE_TABLE_SIZE {
            table
                .attach(Arc::new(Dummy), full_rights(), HandleFlags::empty())
                .unwrap();
        }
        assert_eq!(
            table
                .attach(Arc::new(Dummy), full_rights(), HandleFlags::empty())
                .unwrap_err(),
            Status::NoHandles
        );
    }
}
