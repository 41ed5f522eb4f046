// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed-block memory pool
//!
//! An O(1) allocator over pre-sliced chunks. Free blocks are threaded into
//! an intrusive LIFO list through their own first word, so the pool carries
//! no side tables. Chunks grow on demand and are returned to the system
//! allocator only when the pool is dropped.

use std::{
    alloc::{self, Layout},
    fmt, mem, ptr,
    ptr::NonNull,
    sync::Mutex,
};

use crate::error::{Error, Result};

struct FreeBlock {
    next: Option<NonNull<FreeBlock>>,
}

struct PoolState {
    free: Option<NonNull<FreeBlock>>,
    chunks: Vec<NonNull<u8>>,
}

// The raw pointers only ever reference memory owned by the pool, and every
// mutation happens under the pool mutex.
unsafe impl Send for PoolState {}

/// Thread-safe fixed-block allocator.
///
/// `allocate` and `deallocate` are O(1); growth allocates one chunk of
/// `blocks_per_chunk` blocks and links it into the free list.
#[derive(Debug)]
pub struct MemoryPool {
    block_size: usize,
    blocks_per_chunk: usize,
    chunk_layout: Layout,
    state: Mutex<PoolState>,
}

impl MemoryPool {
    /// Creates a pool and eagerly carves the first chunk.
    ///
    /// The effective block size is `block_size` raised to at least one
    /// pointer, rounded to pointer alignment, so every free block can hold
    /// its list link.
    pub fn new(block_size: usize, blocks_per_chunk: usize) -> Result<Self> {
        assert!(blocks_per_chunk > 0, "chunk must hold at least one block");

        let align = mem::align_of::<FreeBlock>();
        let block_size = block_size
            .max(mem::size_of::<FreeBlock>())
            .checked_next_multiple_of(align)
            .ok_or(Error::OutOfMemory)?;
        let chunk_size = block_size
            .checked_mul(blocks_per_chunk)
            .ok_or(Error::OutOfMemory)?;
        let chunk_layout =
            Layout::from_size_align(chunk_size, align).map_err(|_| Error::OutOfMemory)?;

        let pool = Self {
            block_size,
            blocks_per_chunk,
            chunk_layout,
            state: Mutex::new(PoolState {
                free: None,
                chunks: Vec::new(),
            }),
        };
        pool.grow(&mut pool.state.lock().unwrap())?;
        Ok(pool)
    }

    /// The effective size of every block this pool hands out.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Pops a block from the free list, growing by one chunk if empty.
    pub fn allocate(&self) -> Result<NonNull<u8>> {
        let mut state = self.state.lock().unwrap();

        if state.free.is_none() {
            self.grow(&mut state)?;
        }

        // grow either produced a block or errored out above
        let block = state.free.take().unwrap();
        // Safety: `block` came off the free list, which only holds pointers
        // into live chunks that were initialized as `FreeBlock`s.
        state.free = unsafe { block.as_ref().next };
        Ok(block.cast())
    }

    /// Pushes a block back onto the free list.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// pool and must not already be freed. Provenance is not validated;
    /// violating either rule corrupts the free list.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let mut state = self.state.lock().unwrap();
        let block = ptr.cast::<FreeBlock>();
        // Safety: per the contract, `ptr` addresses one full, live block,
        // which is large enough and aligned for a `FreeBlock` header.
        ptr::write(block.as_ptr(), FreeBlock { next: state.free });
        state.free = Some(block);
    }

    fn grow(&self, state: &mut PoolState) -> Result<()> {
        // Safety: `chunk_layout` has non-zero size (at least one block of at
        // least pointer size).
        let chunk = unsafe { alloc::alloc(self.chunk_layout) };
        let chunk = NonNull::new(chunk).ok_or(Error::OutOfMemory)?;
        state.chunks.push(chunk);

        for i in 0..self.blocks_per_chunk {
            // Safety: `i * block_size` stays inside the chunk allocation,
            // and every block offset is pointer-aligned by construction.
            unsafe {
                let block = chunk.as_ptr().add(i * self.block_size).cast::<FreeBlock>();
                ptr::write(block, FreeBlock { next: state.free });
                state.free = Some(NonNull::new_unchecked(block));
            }
        }

        Ok(())
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap();
        for chunk in state.chunks.drain(..) {
            // Safety: every chunk was allocated with `chunk_layout` and is
            // freed exactly once here.
            unsafe { alloc::dealloc(chunk.as_ptr(), self.chunk_layout) }
        }
    }
}

impl fmt::Debug for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolState")
            .field("chunks", &self.chunks.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::mem;
    use std::sync::Arc;
    use std::thread;

    use super::MemoryPool;

    #[test]
    fn block_size_is_raised_to_pointer_size() {
        let pool = MemoryPool::new(1, 4).unwrap();
        assert_eq!(mem::size_of::<*mut u8>(), pool.block_size());
    }

    #[test]
    fn freed_blocks_are_reused_lifo() {
        let pool = MemoryPool::new(64, 4).unwrap();

        let blocks: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        for block in &blocks {
            unsafe { pool.deallocate(*block) };
        }

        let again: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        let mut reversed = blocks.clone();
        reversed.reverse();
        assert_eq!(reversed, again);
    }

    #[test]
    fn blocks_lie_at_block_size_offsets_within_one_chunk() {
        let pool = MemoryPool::new(64, 4).unwrap();

        let mut addrs: Vec<usize> = (0..4)
            .map(|_| pool.allocate().unwrap().as_ptr() as usize)
            .collect();
        addrs.sort_unstable();

        let base = addrs[0];
        for (i, addr) in addrs.iter().enumerate() {
            assert_eq!(base + i * pool.block_size(), *addr);
        }
    }

    #[test]
    fn exhausting_a_chunk_grows_another() {
        let pool = MemoryPool::new(32, 4).unwrap();

        let blocks: Vec<_> = (0..9).map(|_| pool.allocate().unwrap()).collect();
        let unique: HashSet<usize> = blocks.iter().map(|b| b.as_ptr() as usize).collect();
        assert_eq!(9, unique.len());
    }

    #[test]
    fn round_trip_reuse_does_not_corrupt_contents() {
        let pool = MemoryPool::new(64, 4).unwrap();

        let block = pool.allocate().unwrap();
        unsafe {
            ptr_fill(block.as_ptr(), 0xAB, pool.block_size());
            pool.deallocate(block);
        }

        let again = pool.allocate().unwrap();
        assert_eq!(block, again);
        unsafe {
            ptr_fill(again.as_ptr(), 0xCD, pool.block_size());
            assert!((0..pool.block_size()).all(|i| *again.as_ptr().add(i) == 0xCD));
            pool.deallocate(again);
        }
    }

    #[test]
    fn concurrent_allocate_and_deallocate() {
        let pool = Arc::new(MemoryPool::new(64, 8).unwrap());
        let mut workers = Vec::new();

        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            workers.push(thread::spawn(move || {
                for _ in 0..200 {
                    let block = pool.allocate().unwrap();
                    unsafe { pool.deallocate(block) };
                }
            }));
        }

        for worker in workers {
            worker.join().unwrap();
        }
    }

    unsafe fn ptr_fill(ptr: *mut u8, byte: u8, len: usize) {
        std::ptr::write_bytes(ptr, byte, len);
    }
}
