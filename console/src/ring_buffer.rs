use imbl::Vector;

/// Fixed-capacity FIFO. Inserting into a full buffer evicts from the opposite
/// end, so both `push_back` and `push_front` stay O(1) amortized.
///
/// Storage is a persistent vector: a clone shares its chunks with the original
/// and a later push only copies the few chunks it touches, never the whole
/// window.
#[derive(Debug, Clone)]
pub struct RingBuffer<T: Clone> {
    max: usize,
    buf: Vector<T>,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            buf: Vector::new(),
        }
    }

    /// Appends `item`; returns the evicted front entry when full.
    pub fn push_back(&mut self, item: T) -> Option<T> {
        if self.max == 0 {
            return Some(item);
        }
        let evicted = if self.buf.len() == self.max {
            self.buf.pop_front()
        } else {
            None
        };
        self.buf.push_back(item);
        evicted
    }

    /// Prepends `item`; returns the evicted back entry when full.
    pub fn push_front(&mut self, item: T) -> Option<T> {
        if self.max == 0 {
            return Some(item);
        }
        let evicted = if self.buf.len() == self.max {
            self.buf.pop_back()
        } else {
            None
        };
        self.buf.push_front(item);
        evicted
    }

    pub fn iter(&self) -> imbl::vector::Iter<'_, T> {
        self.buf.iter()
    }

    pub fn front(&self) -> Option<&T> {
        self.buf.front()
    }

    pub fn back(&self) -> Option<&T> {
        self.buf.back()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.max
    }
}
