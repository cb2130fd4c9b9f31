use std::collections::BTreeMap;

/// First-fit allocator over a contiguous id range.
///
/// Used for audio buses, control buses and buffer numbers. Freed blocks are
/// merged with their neighbours so multichannel groups can be reused.
#[derive(Debug, Clone)]
pub struct BlockAllocator {
    /// start -> length of each free block
    free: BTreeMap<i32, u32>,
    /// start -> length of each live block
    used: BTreeMap<i32, u32>,
}

impl BlockAllocator {
    pub fn new(start: i32, count: u32) -> Self {
        let mut free = BTreeMap::new();
        if count > 0 {
            free.insert(start, count);
        }
        Self { free, used: BTreeMap::new() }
    }

    /// Reserve `len` contiguous ids, returning the first.
    pub fn allocate(&mut self, len: u32) -> Option<i32> {
        if len == 0 {
            return None;
        }
        let (&start, &size) = self.free.iter().find(|(_, &size)| size >= len)?;
        self.free.remove(&start);
        if size > len {
            self.free.insert(start + len as i32, size - len);
        }
        self.used.insert(start, len);
        Some(start)
    }

    /// Release a block previously returned by `allocate`. Unknown starts are ignored.
    pub fn free(&mut self, start: i32) -> bool {
        let Some(len) = self.used.remove(&start) else {
            log::warn!(target: "mixgraph::provider", "freeing unallocated block {}", start);
            return false;
        };
        let mut start = start;
        let mut len = len;
        if let Some((&prev_start, &prev_len)) = self.free.range(..start).next_back() {
            if prev_start + prev_len as i32 == start {
                self.free.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        let end = start + len as i32;
        if let Some(next_len) = self.free.remove(&end) {
            len += next_len;
        }
        self.free.insert(start, len);
        true
    }

    pub fn is_allocated(&self, start: i32) -> bool {
        self.used.contains_key(&start)
    }

    pub fn allocated_count(&self) -> usize {
        self.used.len()
    }
}
