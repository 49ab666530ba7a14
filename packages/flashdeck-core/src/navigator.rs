/// Position tracking over the visible subsequence of a working set.
///
/// `current` is an index into the working set, not into the visible list.
/// Navigation wraps around the visible list so a filtered deck behaves like
/// a contiguous one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Navigator {
    current: Option<usize>,
    flipped: bool,
}

impl Navigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn is_flipped(&self) -> bool {
        self.flipped
    }

    pub fn flip(&mut self) -> bool {
        self.flipped = !self.flipped;
        self.flipped
    }

    /// Point at `position` directly, showing the front.
    pub fn set_current(&mut self, position: Option<usize>) {
        self.current = position;
        self.flipped = false;
    }

    /// Rank of the current position within `visible`, if it is visible.
    pub fn rank(&self, visible: &[usize]) -> Option<usize> {
        let current = self.current?;
        visible.binary_search(&current).ok()
    }

    pub fn next(&mut self, visible: &[usize]) {
        if visible.is_empty() {
            return;
        }
        let len = visible.len() as isize;
        let rank = self.rank(visible).map_or(-1, |r| r as isize);
        let next = (rank + 1).rem_euclid(len) as usize;
        self.set_current(Some(visible[next]));
    }

    pub fn prev(&mut self, visible: &[usize]) {
        if visible.is_empty() {
            return;
        }
        let len = visible.len();
        // Not visible: step back from the end.
        let prev = match self.rank(visible) {
            Some(rank) => (rank + len - 1) % len,
            None => len - 1,
        };
        self.set_current(Some(visible[prev]));
    }

    /// Slider jump; `rank` is clamped into range.
    pub fn jump_to_visible_rank(&mut self, visible: &[usize], rank: usize) {
        if visible.is_empty() {
            return;
        }
        let rank = rank.min(visible.len() - 1);
        self.set_current(Some(visible[rank]));
    }

    /// Snap to the first visible position unless the current one is still visible.
    pub fn reanchor(&mut self, visible: &[usize]) {
        match self.current {
            Some(c) if visible.binary_search(&c).is_ok() => {}
            _ => self.set_current(visible.first().copied()),
        }
    }
}
