use core::ops::{Deref, DerefMut};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cell whose contents may be mutated through a shared reference, where
/// `borrow_mut()` is *always unsafe*: the caller serializes access. Socket
/// records use one cell per I/O direction, so the reading side and the
/// writing side of a socket never contend, but two concurrent readers (or
/// two concurrent writers) on the same socket are undefined.
///
/// A runtime flag catches overlapping borrows in debug builds.
pub(crate) struct SerialCell<T> {
    value: UnsafeCell<T>,
    borrowed: AtomicBool,
}

impl<T> SerialCell<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(value),
            borrowed: AtomicBool::new(false),
        }
    }

    /// SAFETY: The caller must ensure no other borrow of this cell overlaps
    /// with the returned guard.
    pub(crate) unsafe fn borrow_mut(&self) -> SerialRefMut<'_, T> {
        let was = self.borrowed.swap(true, Ordering::Acquire);
        debug_assert!(!was, "SerialCell borrowed twice");
        SerialRefMut {
            value: unsafe { &mut *self.value.get() },
            cell: self,
        }
    }
}

unsafe impl<T: Send> Send for SerialCell<T> {}
unsafe impl<T: Send> Sync for SerialCell<T> {}

/// Unique-borrow RAII guard; maintains the debug borrow flag.
pub(crate) struct SerialRefMut<'a, T> {
    value: &'a mut T,
    cell: &'a SerialCell<T>,
}

impl<'a, T> Deref for SerialRefMut<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.value
    }
}

impl<'a, T> DerefMut for SerialRefMut<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.value
    }
}

impl<'a, T> Drop for SerialRefMut<'a, T> {
    fn drop(&mut self) {
        self.cell.borrowed.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn borrow_roundtrip() {
        let cell = SerialCell::new(vec![0u8; 4]);
        unsafe {
            let mut guard = cell.borrow_mut();
            guard[2] = 7;
        }
        unsafe {
            let guard = cell.borrow_mut();
            assert_eq!(guard[2], 7);
        }
    }
}
