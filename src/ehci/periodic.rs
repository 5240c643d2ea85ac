//! Periodic schedule for interrupt transfers
//!
//! The frame list has 1024 entries, one per millisecond frame. Instead of
//! giving every polling interval its own frame list slots, the schedule is a
//! fixed tree of eight empty "anchor" queue heads chained from the rarest
//! level to the most frequent one. Frame `f` enters the tree at a level chosen
//! by the trailing zero bits of `f`, so an endpoint placed after anchor `L` is
//! polled every `2^(TREE_DEPTH - 1 - L)` frames.

use core::sync::atomic::{AtomicU32, Ordering};

use super::qh::link;

/// Frame list size (1024 entries per EHCI spec)
pub const FRAME_LIST_SIZE: usize = 1024;

/// Number of levels in the periodic tree
pub const TREE_DEPTH: usize = 8;

/// Level polled every frame
pub const MOST_FREQUENT_LEVEL: usize = TREE_DEPTH - 1;

/// Longest poll interval accepted before rounding, in frames
pub const MAX_POLL_RATE: u32 = u16::MAX as u32 / 2;

/// Micro-frames per frame (high-speed intervals are given in micro-frames)
pub const MICROFRAMES_PER_FRAME: u32 = 8;

/// Periodic frame list
///
/// Must be 4096-byte aligned per EHCI specification
#[repr(C, align(4096))]
pub struct PeriodicFrameList {
    entries: [AtomicU32; FRAME_LIST_SIZE],
}

impl PeriodicFrameList {
    /// Create new frame list with all entries terminated
    pub const fn new() -> Self {
        Self {
            entries: [const { AtomicU32::new(link::TERMINATE) }; FRAME_LIST_SIZE],
        }
    }

    /// Physical address of frame list (for PERIODICLISTBASE register)
    pub fn base_address(&self) -> u32 {
        self.entries.as_ptr() as usize as u32
    }

    /// Raw link stored for `frame`
    pub fn entry(&self, frame: usize) -> u32 {
        self.entries[frame % FRAME_LIST_SIZE].load(Ordering::Acquire)
    }

    /// Point every frame at its tree level
    ///
    /// `anchors[level]` is the physical address of that level's anchor queue head.
    pub fn build_tree(&self, anchors: &[u32; TREE_DEPTH]) {
        for (frame, entry) in self.entries.iter().enumerate() {
            entry.store(
                link::queue_head(anchors[frame_tree_level(frame)]),
                Ordering::Relaxed,
            );
        }

        super::register::dsb();
    }

    /// Terminate every entry
    pub fn clear(&self) {
        for entry in &self.entries {
            entry.store(link::TERMINATE, Ordering::Relaxed);
        }

        super::register::dsb();
    }
}

impl Default for PeriodicFrameList {
    fn default() -> Self {
        Self::new()
    }
}

/// Tree level a frame list entry points at
///
/// More trailing zero bits means a rarer level; frame 0 has all of them.
pub const fn frame_tree_level(frame: usize) -> usize {
    let zeros = if frame == 0 {
        MOST_FREQUENT_LEVEL
    } else {
        frame.trailing_zeros() as usize
    };

    let zeros = if zeros > MOST_FREQUENT_LEVEL {
        MOST_FREQUENT_LEVEL
    } else {
        zeros
    };

    MOST_FREQUENT_LEVEL - zeros
}

/// Round a poll interval (in frames) down to a power of two, capped
///
/// An interval of zero is treated as one.
pub const fn round_poll_rate(rate: u32) -> u32 {
    let rate = if rate > MAX_POLL_RATE { MAX_POLL_RATE } else { rate };
    if rate <= 1 {
        1
    } else {
        1 << (31 - rate.leading_zeros())
    }
}

/// Tree level an endpoint with the given poll interval (in frames) goes to
pub const fn poll_rate_tree_level(rate: u32) -> usize {
    let exponent = round_poll_rate(rate).trailing_zeros() as usize;
    if exponent >= MOST_FREQUENT_LEVEL {
        0
    } else {
        MOST_FREQUENT_LEVEL - exponent
    }
}

/// Convert a high-speed interval in micro-frames to frames, rounding up
pub const fn microframes_to_frames(microframes: u32) -> u32 {
    microframes.div_ceil(MICROFRAMES_PER_FRAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_list_creation() {
        let frame_list = PeriodicFrameList::new();

        for i in 0..FRAME_LIST_SIZE {
            assert_eq!(frame_list.entry(i), link::TERMINATE);
        }
    }

    #[test]
    fn test_frame_list_alignment() {
        let frame_list = PeriodicFrameList::new();
        let addr = &frame_list as *const _ as usize;

        assert_eq!(addr & 0xFFF, 0, "Frame list not 4096-byte aligned");
    }

    #[test]
    fn test_frame_levels() {
        assert_eq!(frame_tree_level(1), 7);
        assert_eq!(frame_tree_level(2), 6);
        assert_eq!(frame_tree_level(4), 5);
        assert_eq!(frame_tree_level(64), 1);
        assert_eq!(frame_tree_level(128), 0);
        assert_eq!(frame_tree_level(256), 0);
        assert_eq!(frame_tree_level(0), 0);
    }

    #[test]
    fn test_frame_level_distribution() {
        let mut counts = [0usize; TREE_DEPTH];
        for frame in 0..FRAME_LIST_SIZE {
            counts[frame_tree_level(frame)] += 1;
        }

        assert_eq!(counts, [8, 8, 16, 32, 64, 128, 256, 512]);
    }

    #[test]
    fn test_poll_rate_rounding() {
        assert_eq!(round_poll_rate(0), 1);
        assert_eq!(round_poll_rate(1), 1);
        assert_eq!(round_poll_rate(3), 2);
        assert_eq!(round_poll_rate(10), 8);
        assert_eq!(round_poll_rate(255), 128);
        assert_eq!(round_poll_rate(100_000), 16384);
    }

    #[test]
    fn test_poll_rate_levels() {
        assert_eq!(poll_rate_tree_level(1), 7);
        assert_eq!(poll_rate_tree_level(2), 6);
        assert_eq!(poll_rate_tree_level(10), 4);
        assert_eq!(poll_rate_tree_level(128), 0);
        assert_eq!(poll_rate_tree_level(1000), 0);
    }

    #[test]
    fn test_microframe_conversion() {
        assert_eq!(microframes_to_frames(1), 1);
        assert_eq!(microframes_to_frames(8), 1);
        assert_eq!(microframes_to_frames(9), 2);
        assert_eq!(microframes_to_frames(64), 8);
    }

    #[test]
    fn test_build_tree() {
        let frame_list = PeriodicFrameList::new();
        let anchors = [0x100, 0x200, 0x300, 0x400, 0x500, 0x600, 0x700, 0x800];
        frame_list.build_tree(&anchors);

        assert_eq!(frame_list.entry(1), link::queue_head(0x800));
        assert_eq!(frame_list.entry(0), link::queue_head(0x100));
        assert_eq!(frame_list.entry(12), link::queue_head(0x600));

        frame_list.clear();
        assert_eq!(frame_list.entry(12), link::TERMINATE);
    }
}
