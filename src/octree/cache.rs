//! Write-back brick cache used during conversion
//!
//! A flat pool of equally sized slots with an access counter per slot.
//! Replacement is true LRU; dirty slots are written to disk before reuse.
//! Slot memory is allocated lazily on first use.

pub(crate) const UNUSED: u64 = u64::MAX;

pub(crate) struct CacheSlot {
    pub data: Vec<u8>,
    /// brick index held by this slot, `UNUSED` when free
    pub index: u64,
    pub dirty: bool,
    /// access timestamp for the replacement strategy
    pub access: u64,
}

pub(crate) struct WriteCache {
    pub slots: Vec<CacheSlot>,
    pub counter: u64,
    slot_bytes: usize,
}

impl WriteCache {
    /// Size the pool so that data plus per-slot bookkeeping stays within
    /// `mem_limit` bytes. More slots than bricks would never be used, so
    /// `max_slots` caps the pool.
    pub fn new(mem_limit: usize, slot_bytes: usize, max_slots: usize) -> Self {
        let per_slot = slot_bytes + std::mem::size_of::<CacheSlot>();
        let count = if per_slot == 0 { 0 } else { mem_limit / per_slot };
        let count = count.min(max_slots);
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            slots.push(CacheSlot {
                data: Vec::new(),
                index: UNUSED,
                dirty: false,
                access: 0,
            });
        }
        Self {
            slots,
            counter: 0,
            slot_bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn next_access(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Slot currently holding `index`, if any
    pub fn find(&mut self, index: u64) -> Option<usize> {
        self.slots.iter().position(|s| s.index == index)
    }

    /// Slot with the oldest access time; allocates its backing memory if it
    /// was never used. The caller must flush it if dirty.
    pub fn victim(&mut self) -> usize {
        let slot = self
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.access)
            .map(|(i, _)| i)
            .expect("victim() on an empty cache");
        if self.slots[slot].data.is_empty() {
            let bytes = self.slot_bytes;
            self.slots[slot].data.resize(bytes, 0);
        }
        slot
    }

    /// Indices of all dirty slots, for the flush walk
    pub fn dirty_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.dirty)
            .map(|(i, _)| i)
            .collect()
    }
}
