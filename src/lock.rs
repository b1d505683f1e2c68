//! 资源锁接口
//!
//! 核心只依赖 acquire / release / recover 三个操作；崩溃恢复、进程存活探测
//! 等策略属于外部模块。写入 block 目录前按有限次数重试获取锁，超过上限返回
//! `LockTimeout`，调用方降级为跳过。

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use crate::common::{OlapError, Result};

pub trait ResourceLock: Send + Sync {
    fn acquire(&self, resource: &Path) -> bool;
    fn release(&self, resource: &Path);
    /// 清理残留锁；成功后可再次 acquire
    fn recover(&self, resource: &Path) -> bool;
}

/// 不加锁（单进程或测试）
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLock;

impl ResourceLock for NoLock {
    fn acquire(&self, _resource: &Path) -> bool { true }
    fn release(&self, _resource: &Path) {}
    fn recover(&self, _resource: &Path) -> bool { true }
}

/// `<resource>.lock` 独占创建即持有
#[derive(Debug, Default, Clone, Copy)]
pub struct FileLock;

impl FileLock {
    pub fn lock_path(resource: &Path) -> PathBuf {
        let mut name = resource.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }
}

impl ResourceLock for FileLock {
    fn acquire(&self, resource: &Path) -> bool {
        let path = Self::lock_path(resource);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_)  => true,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => false,
            Err(e) => {
                warn!(lock = %path.display(), error = %e, "cannot create lock file");
                false
            }
        }
    }

    fn release(&self, resource: &Path) {
        let path = Self::lock_path(resource);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(lock = %path.display(), error = %e, "cannot remove lock file");
            }
        }
    }

    fn recover(&self, resource: &Path) -> bool {
        let path = Self::lock_path(resource);
        match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) => e.kind() == ErrorKind::NotFound,
        }
    }
}

/// 有限次重试 + 退避；全部失败返回 `LockTimeout`
pub fn acquire_with_retries(
    lock:       &dyn ResourceLock,
    resource:   &Path,
    retries:    u32,
    backoff_ms: u64,
) -> Result<()> {
    for attempt in 0..retries.max(1) {
        if lock.acquire(resource) {
            return Ok(());
        }
        debug!(resource = %resource.display(), attempt, "lock busy, backing off");
        thread::sleep(Duration::from_millis(backoff_ms * (attempt as u64 + 1)));
    }
    Err(OlapError::LockTimeout(resource.display().to_string()))
}

/// 作用域内持有锁，离开时释放
pub struct LockGuard<'a> {
    lock:     &'a dyn ResourceLock,
    resource: PathBuf,
}

impl<'a> LockGuard<'a> {
    pub fn acquire(lock: &'a dyn ResourceLock, resource: &Path, retries: u32, backoff_ms: u64) -> Result<Self> {
        acquire_with_retries(lock, resource, retries, backoff_ms)?;
        Ok(Self { lock, resource: resource.to_path_buf() })
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(&self.resource);
    }
}
