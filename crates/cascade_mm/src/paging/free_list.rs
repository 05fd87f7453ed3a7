use super::PageFrame;
use core::{
    ptr,
    ptr::NonNull,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

/// The lock-free LIFO of free page frames.
///
/// Pops and pushes are single CAS loops on the head; higher-level arenas
/// batch their traffic, so contention here stays low.
pub struct FreeList {
    head: AtomicPtr<PageFrame>,
    len: AtomicUsize,
}

impl FreeList {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    /// How many frames are on the list. Racy by nature; useful for
    /// reporting, not for decisions.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, frame: NonNull<PageFrame>) {
        self.push_chain(frame, frame, 1);
    }

    /// Push a pre-linked chain of frames: `first` reaches `last` through
    /// the frames' free links.
    pub fn push_chain(&self, first: NonNull<PageFrame>, last: NonNull<PageFrame>, count: usize) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { last.as_ref() }.set_next_free(head);
            match self.head.compare_exchange_weak(
                head,
                first.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }
        self.len.fetch_add(count, Ordering::Relaxed);
    }

    pub fn pop(&self) -> Option<NonNull<PageFrame>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let frame = NonNull::new(head)?;
            let next = unsafe { frame.as_ref() }.next_free();
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => {
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    return Some(frame);
                }
                Err(observed) => head = observed,
            }
        }
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: The list only ever hands a frame to one popper, and frames are
//         plain descriptors.
unsafe impl Send for FreeList {}
unsafe impl Sync for FreeList {}
