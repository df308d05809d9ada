use std::sync::Mutex;

use crate::consts::MTU_LIMIT;

/// A process-wide pool of MTU-sized buffers, recycled across the
/// send/recv/FEC hot path. Correctness never depends on whether `acquire`
/// hands back zeroed memory; the pool only amortizes allocation.
pub struct Pool {
    free: Mutex<Vec<Box<[u8; MTU_LIMIT]>>>,
}

impl Pool {
    pub fn new() -> Self {
        Pool {
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn acquire(&self) -> Box<[u8; MTU_LIMIT]> {
        self.free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Box::new([0u8; MTU_LIMIT]))
    }

    pub fn release(&self, buf: Box<[u8; MTU_LIMIT]>) {
        self.free.lock().unwrap().push(buf);
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_recycled_not_reallocated() {
        let pool = Pool::new();
        let buf = pool.acquire();
        let ptr = buf.as_ptr();
        pool.release(buf);

        let buf2 = pool.acquire();
        assert_eq!(buf2.as_ptr(), ptr);
    }

    #[test]
    fn acquire_without_release_allocates_fresh() {
        let pool = Pool::new();
        let a = pool.acquire();
        let b = pool.acquire();
        assert_ne!(a.as_ptr(), b.as_ptr());
    }
}
