use core::sync::atomic::{AtomicIsize, Ordering};

/// A counting semaphore over an atomic counter.
///
/// Unlike [`super::Mutex`], ownership is not tied to a guard, so a
/// `Semaphore::new(1)` can be taken in one function and released in
/// another. The frame table relies on this: a frame is locked when it is
/// handed out by the allocator and unlocked by whoever finishes installing
/// or destroying the page that owns it.
pub struct Semaphore {
    value: AtomicIsize,
}

impl Semaphore {
    pub const fn new(value: isize) -> Self {
        Self {
            value: AtomicIsize::new(value),
        }
    }

    /// Decrements the semaphore, waiting until it is positive.
    pub fn down(&self) {
        while !self.try_down() {
            relax();
        }
    }

    /// Decrements the semaphore if it is positive, without waiting.
    /// Returns whether the decrement happened.
    pub fn try_down(&self) -> bool {
        self.value
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |v| {
                if v > 0 {
                    Some(v - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Increments the semaphore, waking one waiter.
    pub fn up(&self) {
        self.value.fetch_add(1, Ordering::Release);
    }

    /// Whether a `down` would currently block.
    pub fn would_block(&self) -> bool {
        self.value.load(Ordering::Relaxed) <= 0
    }
}

#[cfg(not(target_os = "none"))]
#[inline]
fn relax() {
    std::thread::yield_now();
}

#[cfg(target_os = "none")]
#[inline]
fn relax() {
    core::hint::spin_loop();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_semaphore() {
        let sema = Semaphore::new(1);
        assert!(sema.try_down());
        assert!(!sema.try_down());
        assert!(sema.would_block());
        sema.up();
        assert!(sema.try_down());
        sema.up();
    }

    #[test]
    fn test_down_blocks_until_up() {
        let sema = Semaphore::new(0);
        std::thread::scope(|s| {
            let waiter = s.spawn(|| {
                sema.down();
                true
            });
            sema.up();
            assert!(waiter.join().expect("waiter panicked"));
        });
    }
}
