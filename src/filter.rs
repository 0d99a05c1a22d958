//! Row id filters applied during search.
//!
//! Filters are evaluated against the ids reported in results, i.e. the custom
//! row ids when the index was built with them.

use roaring::RoaringBitmap;

/// Membership predicate over row ids.
pub trait IdFilter: Send + Sync {
    fn is_member(&self, id: i64) -> bool;
}

/// Accepts ids in the half-open range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeIdFilter {
    start: i64,
    end: i64,
}

impl RangeIdFilter {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }
}

impl IdFilter for RangeIdFilter {
    #[inline]
    fn is_member(&self, id: i64) -> bool {
        id >= self.start && id < self.end
    }
}

/// Accepts ids contained in an explicit list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayIdFilter {
    ids: Vec<i64>,
}

impl ArrayIdFilter {
    pub fn new(mut ids: Vec<i64>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Self { ids }
    }
}

impl IdFilter for ArrayIdFilter {
    #[inline]
    fn is_member(&self, id: i64) -> bool {
        self.ids.binary_search(&id).is_ok()
    }
}

/// Accepts ids present in a roaring bitmap. Ids outside `u32` never match.
#[derive(Debug, Clone, PartialEq)]
pub struct BitmapIdFilter {
    bitmap: RoaringBitmap,
}

impl BitmapIdFilter {
    pub fn new(bitmap: RoaringBitmap) -> Self {
        Self { bitmap }
    }

    pub fn bitmap(&self) -> &RoaringBitmap {
        &self.bitmap
    }
}

impl IdFilter for BitmapIdFilter {
    #[inline]
    fn is_member(&self, id: i64) -> bool {
        u32::try_from(id).map_or(false, |id| self.bitmap.contains(id))
    }
}

#[inline]
pub(crate) fn accepts(filter: Option<&dyn IdFilter>, id: i64) -> bool {
    filter.map_or(true, |f| f.is_member(id))
}
