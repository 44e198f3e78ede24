/// Grow-only per-frame allocator for transient GPU buffers.
///
/// Every draw uploads its vertex/index/uniform bytes into a block taken
/// from one of these pools. Blocks are never returned mid-frame; the
/// cursor rewinds to zero when the frame's fence proves the GPU is done
/// with all of them. A block that is too small is replaced by a larger
/// one through the caller's realloc hook, so steady-state frames perform
/// no allocations at all.
pub struct StreamPool<T> {
    blocks: Vec<Block<T>>,
    cursor: usize,
    min_block_size: usize,
}

struct Block<T> {
    buffer: T,
    capacity: usize,
}

impl<T> StreamPool<T> {
    pub fn new(min_block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            cursor: 0,
            min_block_size,
        }
    }

    /// Rewinds the cursor. Callable only once the frame that used these
    /// blocks has been waited on.
    pub fn begin_frame(&mut self) {
        self.cursor = 0;
    }

    /// Hands out the next block with at least `size` bytes of capacity.
    ///
    /// `realloc` builds the native buffer; it receives the undersized old
    /// block (if one is being replaced) so the engine can destroy it, and
    /// the rounded-up capacity to allocate.
    pub fn acquire<E>(
        &mut self,
        size: usize,
        realloc: impl FnOnce(Option<T>, usize) -> Result<T, E>,
    ) -> Result<&mut T, E> {
        let needed = size.max(self.min_block_size).next_power_of_two();
        let index = self.cursor;
        self.cursor += 1;

        if index < self.blocks.len() {
            if self.blocks[index].capacity < size {
                let old = self.blocks.remove(index);
                let buffer = realloc(Some(old.buffer), needed)?;
                self.blocks.insert(
                    index,
                    Block {
                        buffer,
                        capacity: needed,
                    },
                );
            }
        } else {
            let buffer = realloc(None, needed)?;
            self.blocks.push(Block {
                buffer,
                capacity: needed,
            });
        }

        Ok(&mut self.blocks[index].buffer)
    }

    /// Tears down every block through `destroy`.
    pub fn drain(&mut self, mut destroy: impl FnMut(T)) {
        for block in self.blocks.drain(..) {
            destroy(block.buffer);
        }
        self.cursor = 0;
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn alloc(old: Option<Vec<u8>>, size: usize) -> Result<Vec<u8>, Infallible> {
        drop(old);
        Ok(vec![0; size])
    }

    #[test]
    fn reuses_blocks_across_frames() {
        let mut pool: StreamPool<Vec<u8>> = StreamPool::new(64);
        pool.acquire(10, alloc).unwrap();
        pool.acquire(20, alloc).unwrap();
        assert_eq!(pool.block_count(), 2);

        pool.begin_frame();
        pool.acquire(10, alloc).unwrap();
        pool.acquire(20, alloc).unwrap();
        // Same two blocks, no growth.
        assert_eq!(pool.block_count(), 2);
    }

    #[test]
    fn grows_an_undersized_block_in_place() {
        let mut pool: StreamPool<Vec<u8>> = StreamPool::new(64);
        pool.acquire(10, alloc).unwrap();
        pool.begin_frame();

        let mut replaced = None;
        let block = pool
            .acquire(1000, |old, size| -> Result<Vec<u8>, Infallible> {
                replaced = old.map(|b| b.len());
                Ok(vec![0; size])
            })
            .unwrap();
        assert_eq!(replaced, Some(64));
        assert_eq!(block.len(), 1024);
        assert_eq!(pool.block_count(), 1);
    }

    #[test]
    fn blocks_keep_their_capacity_for_smaller_requests() {
        let mut pool: StreamPool<Vec<u8>> = StreamPool::new(64);
        pool.acquire(1000, alloc).unwrap();

        pool.begin_frame();
        let mut reallocated = false;
        let block = pool
            .acquire(10, |old, size| -> Result<Vec<u8>, Infallible> {
                reallocated = true;
                alloc(old, size)
            })
            .unwrap();
        assert!(!reallocated);
        assert_eq!(block.len(), 1024);
    }

    #[test]
    fn capacity_rounds_up_to_a_power_of_two() {
        let mut pool: StreamPool<Vec<u8>> = StreamPool::new(64);
        let block = pool.acquire(300, alloc).unwrap();
        assert_eq!(block.len(), 512);
    }
}
