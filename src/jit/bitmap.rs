//! Per-region dirty bitmaps over work RAM.
//!
//! One bit per granule (one executable buffer's worth of guest bytes). A set
//! bit means a live translation may cover that granule, so a write there has
//! to go through a full table scan. Mirrors share bits: offsets are taken
//! modulo the region size.

use super::region::{Region, SIZE_WORKING_IRAM, SIZE_WORKING_RAM};

/// Fixed-length bit vector indexed by granule.
#[derive(Debug, Clone)]
pub struct GranuleBitmap {
    words: Vec<u64>,
    granules: usize,
}

impl GranuleBitmap {
    pub fn new(granules: usize) -> Self {
        Self {
            words: vec![0; granules.div_ceil(64)],
            granules,
        }
    }

    pub fn len(&self) -> usize {
        self.granules
    }

    pub fn is_empty(&self) -> bool {
        self.granules == 0
    }

    #[inline]
    pub fn get(&self, granule: usize) -> bool {
        granule < self.granules && self.words[granule / 64] & (1 << (granule % 64)) != 0
    }

    #[inline]
    pub fn set(&mut self, granule: usize) {
        if granule < self.granules {
            self.words[granule / 64] |= 1 << (granule % 64);
        }
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    pub fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Dirty bitmaps for every writable jitable region.
#[derive(Debug, Clone)]
pub struct DirtyBitmaps {
    working_ram: GranuleBitmap,
    working_iram: GranuleBitmap,
    granule_shift: u32,
}

impl DirtyBitmaps {
    /// `granule_size` must be a power of two.
    pub fn new(granule_size: usize) -> Self {
        debug_assert!(granule_size.is_power_of_two());
        let granules = |region_size: u32| (region_size as usize).div_ceil(granule_size);
        Self {
            working_ram: GranuleBitmap::new(granules(SIZE_WORKING_RAM)),
            working_iram: GranuleBitmap::new(granules(SIZE_WORKING_IRAM)),
            granule_shift: granule_size.trailing_zeros(),
        }
    }

    pub fn granule_size(&self) -> usize {
        1 << self.granule_shift
    }

    /// Bitmap and unwrapped granule index for an address in a tracked region.
    fn locate(&self, address: u32) -> Option<(&GranuleBitmap, u64)> {
        let (base, _) = Region::of(address).tracked_span()?;
        let bitmap = match Region::of(address) {
            Region::WorkingRam => &self.working_ram,
            _ => &self.working_iram,
        };
        Some((bitmap, u64::from(address - base) >> self.granule_shift))
    }

    fn bitmap_mut(&mut self, region: Region) -> Option<&mut GranuleBitmap> {
        match region {
            Region::WorkingRam => Some(&mut self.working_ram),
            Region::WorkingIram => Some(&mut self.working_iram),
            _ => None,
        }
    }

    /// Set the bit for the granule containing `address`.
    pub fn mark_used(&mut self, address: u32) {
        self.mark_range(address, 0);
    }

    /// Set every granule touched by the closed interval `[start, start + size]`.
    pub fn mark_range(&mut self, start: u32, size: u32) {
        let region = Region::of(start);
        let Some((base, _)) = region.tracked_span() else {
            return;
        };
        let shift = self.granule_shift;
        let Some(bitmap) = self.bitmap_mut(region) else {
            return;
        };
        let granules = bitmap.len() as u64;
        let first = u64::from(start - base) >> shift;
        let last = (u64::from(start - base) + u64::from(size)) >> shift;
        let span = (last - first + 1).min(granules);
        for granule in first..first + span {
            bitmap.set((granule % granules) as usize);
        }
    }

    /// Whether a write of `size` bytes at `address` provably touches no
    /// live translation.
    ///
    /// Only answers for writes no larger than one granule that stay inside
    /// one tracked region; the write's closed interval can then reach at most the
    /// granule it starts in and the next one.
    pub fn quick_invalid_check(&self, address: u32, size: u32) -> bool {
        if size as usize > self.granule_size()
            || Region::of(address.saturating_add(size)) != Region::of(address)
        {
            return false;
        }
        let Some((bitmap, granule)) = self.locate(address) else {
            return false;
        };
        let granules = bitmap.len() as u64;
        let this = (granule % granules) as usize;
        let next = ((granule + 1) % granules) as usize;
        !bitmap.get(this) && !bitmap.get(next)
    }

    pub fn is_marked(&self, address: u32) -> bool {
        self.locate(address)
            .is_some_and(|(bitmap, granule)| bitmap.get((granule % bitmap.len() as u64) as usize))
    }

    pub fn clear(&mut self) {
        self.working_ram.clear();
        self.working_iram.clear();
    }

    pub fn marked_granules(&self) -> usize {
        self.working_ram.count_set() + self.working_iram.count_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_granule_bitmap_bounds() {
        let mut bits = GranuleBitmap::new(70);
        bits.set(69);
        bits.set(70);
        assert!(bits.get(69));
        assert!(!bits.get(70));
        assert_eq!(bits.count_set(), 1);
    }

    #[test]
    fn test_sizes_follow_granule() {
        let maps = DirtyBitmaps::new(1024);
        assert_eq!(maps.working_ram.len(), 256);
        assert_eq!(maps.working_iram.len(), 32);
    }

    #[test]
    fn test_mark_used_untracked_is_noop() {
        let mut maps = DirtyBitmaps::new(1024);
        maps.mark_used(0x0800_0000);
        maps.mark_used(0x0000_0100);
        assert_eq!(maps.marked_granules(), 0);
    }

    #[test]
    fn test_quick_check_sees_neighbour() {
        let mut maps = DirtyBitmaps::new(1024);
        maps.mark_used(0x0200_0400);

        // Granule 0 is clean but its neighbour is marked.
        assert!(!maps.quick_invalid_check(0x0200_03FE, 4));
        assert!(!maps.quick_invalid_check(0x0200_0000, 4));
        assert!(maps.quick_invalid_check(0x0200_0800, 4));
        // Multi-granule writes never take the fast path.
        assert!(!maps.quick_invalid_check(0x0200_0800, 2048));
    }

    #[test]
    fn test_quick_check_write_leaving_region() {
        let mut maps = DirtyBitmaps::new(1024);
        maps.mark_used(0x0300_0000);
        // The EWRAM side is clean, but the write ends in marked IWRAM.
        assert!(!maps.quick_invalid_check(0x02FF_FFFE, 4));
        assert!(maps.quick_invalid_check(0x02FF_F000, 4));
    }

    #[test]
    fn test_mirrors_share_bits() {
        let mut maps = DirtyBitmaps::new(1024);
        maps.mark_used(0x0304_0000);
        assert!(maps.is_marked(0x0300_0000));
        assert!(maps.is_marked(0x0300_8000));
    }

    #[test]
    fn test_mark_range_closed_interval() {
        let mut maps = DirtyBitmaps::new(1024);
        maps.mark_range(0x0200_0000, 1024);
        assert!(maps.is_marked(0x0200_0000));
        assert!(maps.is_marked(0x0200_0400));
        assert!(!maps.is_marked(0x0200_0800));
    }

    #[test]
    fn test_mark_range_wraps_at_region_end() {
        let mut maps = DirtyBitmaps::new(1024);
        maps.mark_range(0x0300_7F00, 0x200);
        assert!(maps.is_marked(0x0300_7C00));
        assert!(maps.is_marked(0x0300_0000));
        assert_eq!(maps.marked_granules(), 2);
    }
}
