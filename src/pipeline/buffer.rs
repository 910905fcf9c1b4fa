//! Fixed-Capacity Pipeline Ring
//!
//! A ring of response slots indexed by two cursors:
//!
//! ```text
//!            head                 tail
//!             │                    │
//!             ▼                    ▼
//!   ┌──────┬──────┬──────┬──────┬──────┬──────┐
//!   │ free │ wait │ READY│ wait │ free │ free │
//!   └──────┴──────┴──────┴──────┴──────┴──────┘
//!             ▲
//!             └── front(): the only slot the writer may emit
//! ```
//!
//! - `consume()` hands out the slot at `tail` for the next request.
//! - `push()` advances `tail` once that request has been read.
//! - `commit(i)` marks slot `i` ready, in any order.
//! - `ready()` only reports true when the slot at `head` is ready, so a
//!   later slot committed early waits for everything before it.
//! - `pop()` retires `head` and resets the slot.
//!
//! One slot is always kept free so that `head == tail` means empty and
//! `head == tail + 1` means full. With `N` slots at most `N - 1` requests are
//! outstanding, which is the backpressure bound per connection.

use thiserror::Error;

/// Errors returned when an operation would break the ring's invariants.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PipelineError {
    /// No free slot is left for another request
    #[error("pipeline is full")]
    Full,

    /// There is no outstanding slot to access or retire
    #[error("pipeline is empty")]
    Empty,

    /// The slot was already marked ready
    #[error("slot {0} is already committed")]
    AlreadyCommitted(usize),

    /// The index lies outside the ring
    #[error("slot {index} is out of range (ring has {len} slots)")]
    OutOfRange { index: usize, len: usize },

    /// The index is inside the ring but no request occupies it
    #[error("slot {0} is not outstanding")]
    NotOutstanding(usize),
}

/// A single response slot.
#[derive(Debug, Default)]
struct Slot<T> {
    ready: bool,
    value: T,
}

impl<T: Default> Slot<T> {
    fn reset(&mut self) {
        self.ready = false;
        self.value = T::default();
    }
}

/// A bounded ring of response slots that emits strictly in insertion order.
///
/// # Example
///
/// ```
/// use httpipe::pipeline::PipelineBuffer;
///
/// let mut ring: PipelineBuffer<&str> = PipelineBuffer::new(4);
///
/// let first = ring.consume().unwrap();
/// ring.push().unwrap();
/// let second = ring.consume().unwrap();
/// ring.push().unwrap();
///
/// // The second response finishes first, but cannot be emitted yet.
/// *ring.get_mut(second).unwrap() = "second";
/// ring.commit(second).unwrap();
/// assert!(!ring.ready());
///
/// *ring.get_mut(first).unwrap() = "first";
/// ring.commit(first).unwrap();
/// assert_eq!(*ring.front().unwrap(), "first");
/// ```
#[derive(Debug)]
pub struct PipelineBuffer<T> {
    /// Oldest outstanding slot
    head: usize,
    /// Next free slot
    tail: usize,
    slots: Vec<Slot<T>>,
}

impl<T: Default> PipelineBuffer<T> {
    /// Creates a ring for a pipeline depth of `depth`.
    ///
    /// A depth of `N` allows `N - 1` outstanding requests. Depths of 0 and 1
    /// both allocate two slots, so one request at a time is outstanding and
    /// the connection alternates strictly between request and response.
    pub fn new(depth: usize) -> Self {
        let len = depth.max(2);
        let mut slots = Vec::with_capacity(len);
        slots.resize_with(len, Slot::default);

        Self {
            head: 0,
            tail: 0,
            slots,
        }
    }

    /// Number of physical slots in the ring.
    pub fn slots(&self) -> usize {
        self.slots.len()
    }

    /// Maximum number of outstanding requests.
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Number of outstanding requests (read but not yet retired).
    pub fn len(&self) -> usize {
        (self.tail + self.slots.len() - self.head) % self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Returns true when no further request may be read.
    pub fn full(&self) -> bool {
        self.head == self.next(self.tail)
    }

    /// Index of the oldest outstanding slot.
    pub fn head(&self) -> usize {
        self.head
    }

    /// Returns true iff the oldest outstanding slot has been committed.
    pub fn ready(&self) -> bool {
        self.head != self.tail && self.slots[self.head].ready
    }

    /// Returns the index the next request should be read into.
    pub fn consume(&self) -> Result<usize, PipelineError> {
        if self.full() {
            return Err(PipelineError::Full);
        }
        Ok(self.tail)
    }

    /// Makes the consumed slot outstanding. The slot is not ready yet.
    pub fn push(&mut self) -> Result<(), PipelineError> {
        if self.full() {
            return Err(PipelineError::Full);
        }
        self.tail = self.next(self.tail);
        Ok(())
    }

    /// Marks an outstanding slot as ready for transmission.
    pub fn commit(&mut self, index: usize) -> Result<(), PipelineError> {
        self.check_outstanding(index)?;

        let slot = &mut self.slots[index];
        if slot.ready {
            return Err(PipelineError::AlreadyCommitted(index));
        }
        slot.ready = true;
        Ok(())
    }

    /// Returns whether an outstanding slot has been committed.
    pub fn is_ready(&self, index: usize) -> Result<bool, PipelineError> {
        self.check_outstanding(index)?;
        Ok(self.slots[index].ready)
    }

    /// Mutable access to the value of an outstanding slot.
    pub fn get_mut(&mut self, index: usize) -> Result<&mut T, PipelineError> {
        self.check_outstanding(index)?;
        Ok(&mut self.slots[index].value)
    }

    /// The value at `head`.
    pub fn front(&self) -> Result<&T, PipelineError> {
        if self.is_empty() {
            return Err(PipelineError::Empty);
        }
        Ok(&self.slots[self.head].value)
    }

    /// Retires the slot at `head`, clearing its flag and value.
    pub fn pop(&mut self) -> Result<T, PipelineError> {
        if self.is_empty() {
            return Err(PipelineError::Empty);
        }
        let slot = &mut self.slots[self.head];
        let value = std::mem::take(&mut slot.value);
        slot.reset();
        self.head = self.next(self.head);
        Ok(value)
    }

    #[inline]
    fn next(&self, index: usize) -> usize {
        (index + 1) % self.slots.len()
    }

    fn check_outstanding(&self, index: usize) -> Result<(), PipelineError> {
        let len = self.slots.len();
        if index >= len {
            return Err(PipelineError::OutOfRange { index, len });
        }
        // Distance from head must fall inside the occupied span.
        let offset = (index + len - self.head) % len;
        if offset >= self.len() {
            return Err(PipelineError::NotOutstanding(index));
        }
        Ok(())
    }
}
