//! 自旋锁，封装了一下 `spin::mutex::spin`
//!
//! 裁剪了一些不太需要的方法，并记录持锁位置以便排查死锁

use core::{
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    panic::Location,
};

pub struct SpinMutex<T: ?Sized> {
    holder: spin::mutex::SpinMutex<Option<&'static Location<'static>>>,
    base: spin::mutex::SpinMutex<T>,
}

pub struct SpinMutexGuard<'a, T: ?Sized> {
    inner: spin::mutex::SpinMutexGuard<'a, T>,
    mutex: &'a SpinMutex<T>,
    // Guard 不应被转移到别的执行流上释放
    _not_send: PhantomData<*const ()>,
}

// Same unsafe impls as `std::sync::Mutex`
unsafe impl<T: ?Sized + Send> Sync for SpinMutex<T> {}
unsafe impl<T: ?Sized + Send> Send for SpinMutex<T> {}

unsafe impl<T: ?Sized + Sync> Sync for SpinMutexGuard<'_, T> {}

impl<T> SpinMutex<T> {
    /// Creates a new [`SpinMutex`] wrapping the supplied data.
    #[inline(always)]
    pub const fn new(data: T) -> Self {
        Self {
            holder: spin::mutex::SpinMutex::new(None),
            base: spin::mutex::SpinMutex::new(data),
        }
    }

    #[inline(always)]
    pub fn into_inner(self) -> T {
        self.base.into_inner()
    }
}

impl<T: ?Sized> SpinMutex<T> {
    /// Locks the [`SpinMutex`] and returns a guard that permits access to the
    /// inner data.
    ///
    /// The returned value may be dereferenced for data access
    /// and the lock will be dropped when the guard falls out of scope.
    #[inline]
    #[track_caller]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        let caller = Location::caller();
        #[cfg(test)]
        let begin = std::time::Instant::now();
        loop {
            if let Some(guard) = self.try_lock_at(caller) {
                return guard;
            }

            while self.is_locked() {
                core::hint::spin_loop();
                #[cfg(test)]
                if begin.elapsed().as_millis() >= 2000 {
                    panic!(
                        "deadlock detected at {caller}, lock held since {:?}",
                        self.holder()
                    );
                }
            }
        }
    }

    /// Try to lock this [`SpinMutex`], returning a lock guard if successful.
    #[inline]
    #[track_caller]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        self.try_lock_at(Location::caller())
    }

    fn try_lock_at(&self, caller: &'static Location<'static>) -> Option<SpinMutexGuard<'_, T>> {
        let inner = self.base.try_lock()?;
        *self.holder.lock() = Some(caller);
        Some(SpinMutexGuard {
            inner,
            mutex: self,
            _not_send: PhantomData,
        })
    }

    /// Returns `true` if the lock is currently held.
    ///
    /// This function provides no synchronization guarantees and so its result
    /// should be considered 'out of date' the instant it is called. Do not
    /// use it for synchronization purposes. However, it may be useful as a
    /// heuristic.
    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.base.is_locked()
    }

    /// 最近一次成功加锁的位置，锁空闲时为 `None`
    pub fn holder(&self) -> Option<&'static Location<'static>> {
        *self.holder.lock()
    }

    /// 独占借用时不需要真的加锁
    #[inline(always)]
    pub fn get_mut(&mut self) -> &mut T {
        self.base.get_mut()
    }
}

impl<T: Default> Default for SpinMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SpinMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.base.try_lock() {
            Some(guard) => f.debug_struct("SpinMutex").field("data", &&*guard).finish(),
            None => write!(f, "SpinMutex {{ <locked at {:?}> }}", self.holder()),
        }
    }
}

impl<T: ?Sized> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: ?Sized> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: ?Sized> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        // `inner` 在这之后才释放，所以清空时锁仍然被持有
        *self.mutex.holder.lock() = None;
    }
}
