//! Purpose: Track a reader's byte window and plan repositioning without performing I/O.
//! Exports: `Window`, `SeekPlan`.
//! Role: Pure planning layer used by every reader variant before it touches its source.
//! Invariants: `remaining <= size` whenever the size is bounded.
//! Invariants: A non-seekable window can only be positioned once, at offset 0.
use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Window {
    start: Option<u64>,
    size: Option<u64>,
    remaining: Option<u64>,
    max_size: Option<u64>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SeekPlan {
    Unchanged,
    Reset(Window),
}

impl Window {
    /// A window over a source of `max_size` bytes (`None` when unknown) that has not
    /// been positioned yet.
    pub fn unpositioned(max_size: Option<u64>) -> Self {
        Self {
            start: None,
            size: None,
            remaining: None,
            max_size,
        }
    }

    pub fn start(&self) -> Option<u64> {
        self.start
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn remaining(&self) -> Option<u64> {
        self.remaining
    }

    pub fn max_size(&self) -> Option<u64> {
        self.max_size
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }

    /// Absolute source offset of the next byte to produce, if the window is bounded.
    pub fn position(&self) -> Option<u64> {
        let start = self.start?;
        let consumed = self.size? - self.remaining?;
        Some(start + consumed)
    }

    /// How many bytes may be produced next into a buffer with `capacity` free bytes.
    pub fn want(&self, capacity: usize) -> usize {
        match self.remaining {
            Some(remaining) => capacity.min(usize::try_from(remaining).unwrap_or(usize::MAX)),
            None => capacity,
        }
    }

    /// Accounts for `n` produced bytes.
    pub fn advance(&mut self, n: u64) -> Result<(), Error> {
        if let Some(remaining) = self.remaining {
            if n > remaining {
                return Err(Error::new(ErrorKind::Overflow)
                    .with_message(format!("{n} bytes produced with {remaining} left in window")));
            }
            self.remaining = Some(remaining - n);
        }
        Ok(())
    }

    /// Decides what moving to `[offset, offset + size)` requires.
    ///
    /// `size == None` extends the window to the end of the source. Any delivery since
    /// the last reset forces a reset even when the window itself is unchanged.
    pub fn plan(
        &self,
        offset: u64,
        size: Option<u64>,
        delivered: bool,
        seekable: bool,
    ) -> Result<SeekPlan, Error> {
        match size {
            Some(size) => {
                let end = offset.checked_add(size).ok_or_else(|| {
                    Error::new(ErrorKind::Usage)
                        .with_message("window end overflows")
                        .with_offset(offset)
                })?;
                if let Some(max) = self.max_size {
                    if end > max {
                        return Err(Error::new(ErrorKind::Usage)
                            .with_message(format!("window end {end} exceeds source size {max}"))
                            .with_offset(offset));
                    }
                }
            }
            None => {
                if let Some(max) = self.max_size {
                    if offset > max {
                        return Err(Error::new(ErrorKind::Usage)
                            .with_message(format!("offset exceeds source size {max}"))
                            .with_offset(offset));
                    }
                }
            }
        }

        let new_size = size.or_else(|| self.max_size.map(|max| max - offset));
        let changed = delivered || self.start != Some(offset) || self.size != new_size;
        if !changed {
            return Ok(SeekPlan::Unchanged);
        }

        if !seekable && (self.start.is_some() || offset != 0) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("source is not seekable")
                .with_offset(offset));
        }

        Ok(SeekPlan::Reset(Window {
            start: Some(offset),
            size: new_size,
            remaining: new_size,
            max_size: self.max_size,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::{SeekPlan, Window};
    use crate::core::error::ErrorKind;

    fn positioned(max: Option<u64>, offset: u64, size: Option<u64>) -> Window {
        match Window::unpositioned(max)
            .plan(offset, size, false, true)
            .expect("plan")
        {
            SeekPlan::Reset(window) => window,
            SeekPlan::Unchanged => panic!("first positioning must reset"),
        }
    }

    #[test]
    fn open_ended_window_runs_to_source_end() {
        let window = positioned(Some(1000), 200, None);
        assert_eq!(window.start(), Some(200));
        assert_eq!(window.size(), Some(800));
        assert_eq!(window.remaining(), Some(800));
        assert_eq!(window.position(), Some(200));
    }

    #[test]
    fn unknown_source_size_stays_unbounded() {
        let window = positioned(None, 0, None);
        assert_eq!(window.size(), None);
        assert_eq!(window.want(4096), 4096);
        assert!(!window.is_exhausted());
        assert_eq!(window.position(), None);
    }

    #[test]
    fn advance_tracks_remaining_and_rejects_overflow() {
        let mut window = positioned(Some(100), 0, Some(10));
        assert_eq!(window.want(64), 10);
        window.advance(6).expect("advance");
        assert_eq!(window.want(64), 4);
        assert_eq!(window.position(), Some(6));
        let err = window.advance(5).expect_err("overflow");
        assert_eq!(err.kind(), ErrorKind::Overflow);
        window.advance(4).expect("advance");
        assert!(window.is_exhausted());
    }

    #[test]
    fn same_window_without_delivery_is_unchanged() {
        let window = positioned(Some(100), 10, Some(20));
        assert_eq!(
            window.plan(10, Some(20), false, true).expect("plan"),
            SeekPlan::Unchanged
        );
        assert_eq!(
            window.plan(10, None, false, true).expect("plan"),
            SeekPlan::Reset(positioned(Some(100), 10, None))
        );
    }

    #[test]
    fn delivery_forces_reset_of_same_window() {
        let window = positioned(Some(100), 10, Some(20));
        assert!(matches!(
            window.plan(10, Some(20), true, true).expect("plan"),
            SeekPlan::Reset(_)
        ));
    }

    #[test]
    fn rejects_overflow_and_out_of_range() {
        let window = Window::unpositioned(Some(100));
        let err = window.plan(u64::MAX, Some(2), false, true).expect_err("overflow");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = window.plan(50, Some(51), false, true).expect_err("range");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = window.plan(101, None, false, true).expect_err("range");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn non_seekable_allows_only_initial_start() {
        let fresh = Window::unpositioned(None);
        assert!(fresh.plan(5, None, false, false).is_err());
        let window = match fresh.plan(0, None, false, false).expect("plan") {
            SeekPlan::Reset(window) => window,
            SeekPlan::Unchanged => panic!("expected reset"),
        };
        assert_eq!(
            window.plan(0, None, false, false).expect("plan"),
            SeekPlan::Unchanged
        );
        assert!(window.plan(0, None, true, false).is_err());
    }
}
