//! A minimal object pool with guard-based return.
//!
//! The ICMP encoder and decoder carry internal scratch that the next
//! call invalidates, so each one must be exclusively owned from
//! acquisition to release. The guard returned by [`Pool::get`] enforces
//! that: the object goes back to the pool only when the guard drops,
//! which callers arrange to happen after the produced bytes were
//! consumed.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};

pub struct Pool<T> {
    items: Mutex<Vec<T>>,
    make: fn() -> T,
}

impl<T> Pool<T> {
    pub fn new(make: fn() -> T) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            make,
        }
    }

    pub fn get(&self) -> PoolGuard<'_, T> {
        let item = self
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(self.make);
        PoolGuard {
            pool: self,
            item: Some(item),
        }
    }

    fn put(&self, item: T) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item);
    }
}

impl<T> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").finish_non_exhaustive()
    }
}

pub struct PoolGuard<'a, T> {
    pool: &'a Pool<T>,
    item: Option<T>,
}

impl<T> Deref for PoolGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("pool guard holds an item")
    }
}

impl<T> DerefMut for PoolGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pool guard holds an item")
    }
}

impl<T> Drop for PoolGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.put(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_returned_items() {
        let pool: Pool<Vec<u8>> = Pool::new(Vec::new);

        {
            let mut a = pool.get();
            a.push(7);
        }
        // The returned vector comes back with its previous contents; the
        // user of the pool is responsible for resetting state.
        let b = pool.get();
        assert_eq!(&*b, &[7]);
    }

    #[test]
    fn concurrent_gets_are_distinct() {
        let pool: Pool<Vec<u8>> = Pool::new(Vec::new);
        let mut a = pool.get();
        let mut b = pool.get();
        a.push(1);
        b.push(2);
        assert_ne!(&*a, &*b);
    }
}
