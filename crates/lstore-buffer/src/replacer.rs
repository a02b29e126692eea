//! Page replacement policies for the buffer pool.

use crate::frame::{BufferFrame, FrameId};
use lstore_common::config::TieBreak;
use lstore_common::page::PageId;

/// Trait for page replacement algorithms.
///
/// The pool calls `evict` while it holds its page table exclusively, so the
/// frames' pin counts and page ids cannot change underneath the replacer.
pub trait Replacer: Send + Sync {
    /// Selects a victim among the frames for which `is_evictable` is true.
    ///
    /// Returns None if no frame qualifies.
    fn evict(
        &self,
        frames: &[BufferFrame],
        is_evictable: &dyn Fn(&BufferFrame) -> bool,
    ) -> Option<FrameId>;
}

/// Least-frequently-used replacement.
///
/// The candidate with the lowest visit counter is chosen. Candidates with
/// equal counters are ordered by the configured [`TieBreak`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LfuReplacer {
    tie_break: TieBreak,
}

impl LfuReplacer {
    /// Creates a replacer with the given tie-break rule.
    pub fn new(tie_break: TieBreak) -> Self {
        Self { tie_break }
    }

    /// Returns the tie-break rule.
    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    fn rank(&self, frame: &BufferFrame, page_id: PageId) -> (u64, u64, PageId) {
        let recency = match self.tie_break {
            TieBreak::RecencyThenPageId => frame.last_access(),
            TieBreak::PageId => 0,
        };
        (frame.visit_count(), recency, page_id)
    }
}

impl Replacer for LfuReplacer {
    fn evict(
        &self,
        frames: &[BufferFrame],
        is_evictable: &dyn Fn(&BufferFrame) -> bool,
    ) -> Option<FrameId> {
        frames
            .iter()
            .filter(|frame| is_evictable(frame))
            .filter_map(|frame| {
                let page_id = frame.page_id()?;
                Some((self.rank(frame, page_id), frame.frame_id()))
            })
            .min_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, frame_id)| frame_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lstore_common::page::PageKind;

    fn create_test_frames(pages: &[u32]) -> Vec<BufferFrame> {
        pages
            .iter()
            .enumerate()
            .map(|(i, &page_num)| {
                let frame = BufferFrame::new(FrameId(i as u32));
                frame.set_page_id(Some(PageId::new(0, 0, PageKind::Base, 0, page_num)));
                frame
            })
            .collect()
    }

    fn unpinned(frame: &BufferFrame) -> bool {
        frame.pin_count() == 0
    }

    #[test]
    fn test_lfu_evict_empty() {
        let replacer = LfuReplacer::default();
        assert!(replacer.evict(&[], &unpinned).is_none());
    }

    #[test]
    fn test_lfu_picks_lowest_visit_count() {
        let frames = create_test_frames(&[0, 1, 2]);
        let mut tick = 0;
        for (frame, visits) in frames.iter().zip([3, 1, 2]) {
            for _ in 0..visits {
                tick += 1;
                frame.pin(tick);
                frame.unpin();
            }
        }

        let replacer = LfuReplacer::default();
        assert_eq!(replacer.evict(&frames, &unpinned), Some(FrameId(1)));
    }

    #[test]
    fn test_lfu_skips_pinned_frames() {
        let frames = create_test_frames(&[0, 1]);
        frames[0].pin(1);
        frames[1].pin(2);
        frames[1].pin(3);
        frames[1].unpin();
        frames[1].unpin();

        let replacer = LfuReplacer::default();
        assert_eq!(replacer.evict(&frames, &unpinned), Some(FrameId(1)));

        frames[1].pin(4);
        assert_eq!(replacer.evict(&frames, &unpinned), None);
    }

    #[test]
    fn test_lfu_skips_empty_frames() {
        let frames = create_test_frames(&[0]);
        frames[0].set_page_id(None);

        let replacer = LfuReplacer::default();
        assert_eq!(replacer.evict(&frames, &|_| true), None);
    }

    #[test]
    fn test_tie_break_prefers_oldest_access() {
        // Higher page id but accessed earlier.
        let frames = create_test_frames(&[7, 3]);
        frames[0].pin(1);
        frames[0].unpin();
        frames[1].pin(2);
        frames[1].unpin();

        let replacer = LfuReplacer::new(TieBreak::RecencyThenPageId);
        assert_eq!(replacer.evict(&frames, &unpinned), Some(FrameId(0)));
    }

    #[test]
    fn test_tie_break_falls_back_to_page_id() {
        let frames = create_test_frames(&[7, 3]);
        frames[0].pin(5);
        frames[0].unpin();
        frames[1].pin(5);
        frames[1].unpin();

        let replacer = LfuReplacer::new(TieBreak::RecencyThenPageId);
        assert_eq!(replacer.evict(&frames, &unpinned), Some(FrameId(1)));
    }

    #[test]
    fn test_tie_break_page_id_only() {
        let frames = create_test_frames(&[7, 3]);
        frames[0].pin(1);
        frames[0].unpin();
        frames[1].pin(2);
        frames[1].unpin();

        let replacer = LfuReplacer::new(TieBreak::PageId);
        assert_eq!(replacer.tie_break(), TieBreak::PageId);
        assert_eq!(replacer.evict(&frames, &unpinned), Some(FrameId(1)));
    }
}
