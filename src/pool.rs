//! Fixed-size circular frame pool
//!
//! Ranging and clock calibration keep a small ring of frames. The current
//! index always stays below the pool length, so the previous exchange stays
//! available after advancing (double-sided ranging needs both) for any pool
//! length.

/// A ring of `T` addressed by an index in `0..len`
#[derive(Clone, Debug)]
pub struct FramePool<T> {
    frames: Vec<T>,
    idx: u16,
}

impl<T> FramePool<T> {
    /// Creates a pool of `len` frames, each produced by `init`
    ///
    /// A pool always holds at least one frame and at most `u16::MAX + 1`.
    pub fn new(len: usize, mut init: impl FnMut() -> T) -> Self {
        let len = len.clamp(1, usize::from(u16::MAX) + 1);
        FramePool {
            frames: (0..len).map(|_| init()).collect(),
            idx: 0,
        }
    }

    /// Number of frames in the pool
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Always `false`, a pool is never empty
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Current index, always below [`len`](#method.len)
    pub fn idx(&self) -> u16 {
        self.idx
    }

    /// Index following `idx`, wrapping at the pool length
    pub fn next_idx(&self, idx: u16) -> u16 {
        ((usize::from(idx) + 1) % self.frames.len()) as u16
    }

    /// Index preceding `idx`, wrapping at the pool length
    pub fn prev_idx(&self, idx: u16) -> u16 {
        let len = self.frames.len();
        ((usize::from(idx) % len + len - 1) % len) as u16
    }

    /// The frame at index `idx`, modulo the pool length
    pub fn at(&self, idx: u16) -> &T {
        &self.frames[usize::from(idx) % self.frames.len()]
    }

    /// Mutable access to the frame at index `idx`, modulo the pool length
    pub fn at_mut(&mut self, idx: u16) -> &mut T {
        let len = self.frames.len();
        &mut self.frames[usize::from(idx) % len]
    }

    /// The frame after the current one, without advancing
    pub fn next_mut(&mut self) -> &mut T {
        let idx = self.next_idx(self.idx);
        self.at_mut(idx)
    }

    /// The current frame
    pub fn current(&self) -> &T {
        self.at(self.idx)
    }

    /// Mutable access to the current frame
    pub fn current_mut(&mut self) -> &mut T {
        let idx = self.idx;
        self.at_mut(idx)
    }

    /// The frame before the current one
    pub fn previous(&self) -> &T {
        self.at(self.prev_idx(self.idx))
    }

    /// Moves to the next frame and returns it
    pub fn advance(&mut self) -> &mut T {
        self.idx = self.next_idx(self.idx);
        self.current_mut()
    }
}
