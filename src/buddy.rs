//! The buddy page allocator.
//!
//! ## Region layout
//!
//! At construction the managed region is split into a usable prefix and a
//! metadata tail. The tail is sized by the smallest number of pages that
//! can hold the occupancy tree for the prefix that remains. Pages in the prefix
//! are identified by zero-based page numbers, and a block of order `k`
//! covers `1 << k` pages starting at a page number divisible by `1 << k`.
//!
//! ## Free lists
//!
//! One doubly linked list per order holds the free blocks. The list heads
//! live in the allocator; the links live in the first two machine words of
//! each free block's head page, as page numbers. Those words belong to the
//! caller while the block is allocated and revert to the allocator when it
//! is freed.
//!
//! ## Splitting and coalescing
//!
//! Allocation pops the head of the requested order's free list, splitting a
//! block from the next order up when the list is empty. Deallocation
//! recovers the block's order from the tree, then greedily merges the block
//! with its buddy, one order at a time, for as long as the buddy is free at
//! the same order. A buddy that lies past the usable prefix has no tree
//! node and never merges, which is what lets the allocator manage a prefix
//! that is not a power of two.

use core::{alloc::Layout, cmp, fmt, mem, num::NonZeroUsize, ptr::NonNull};

use crate::{
    tree::{self, BlockTree, Node, NodeArena},
    BackingAllocator, BasePtr, PageLink, Raw,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// The highest order at which a block can be allocated.
///
/// A block of order `k` covers `1 << k` pages, so a single allocation spans
/// at most `PAGE_SIZE << MAX_ORDER` bytes.
pub const MAX_ORDER: usize = 20;

/// The number of free lists, one per order in `0..=MAX_ORDER`.
const ORDERS: usize = MAX_ORDER + 1;

/// A binary-buddy page allocator over a caller-supplied region.
///
/// `PAGE_SIZE` is the size in bytes of the smallest allocatable unit. It
/// must be a power of two no smaller than two machine words, so that a free
/// page can hold its own free-list link.
pub struct BuddyAllocator<const PAGE_SIZE: usize, A: BackingAllocator> {
    parts: BuddyAllocatorParts<PAGE_SIZE>,
    backing_allocator: A,
}

impl<const PAGE_SIZE: usize> BuddyAllocator<PAGE_SIZE, Raw> {
    /// Constructs a new `BuddyAllocator` from a raw pointer.
    ///
    /// The allocator owns the region exclusively until it is dropped or
    /// decomposed with [`into_raw_parts`](Self::into_raw_parts); the caller
    /// may touch only pages currently handed out by
    /// [`allocate`](Self::allocate).
    ///
    /// # Panics
    ///
    /// Panics if `PAGE_SIZE` is not a power of two at least
    /// `2 * size_of::<usize>()`, if `region` is not aligned to `PAGE_SIZE`,
    /// if `len` is not a multiple of `PAGE_SIZE` covering at least two
    /// pages, if `PAGE_SIZE` is so small relative to the metadata-node size
    /// that reserving the tail leaves no usable prefix, or if the usable
    /// prefix would be so large that its top order exceeds [`MAX_ORDER`].
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `len` bytes, and the
    /// memory it points to must not be accessed except through this
    /// allocator for the allocator's lifetime.
    pub unsafe fn new_raw(region: NonNull<u8>, len: usize) -> BuddyAllocator<PAGE_SIZE, Raw> {
        unsafe { BuddyAllocatorParts::<PAGE_SIZE>::new(region, len).with_backing_allocator(Raw) }
    }
}

#[cfg(any(feature = "alloc", test))]
impl<const PAGE_SIZE: usize> BuddyAllocator<PAGE_SIZE, Global> {
    /// Constructs a new `BuddyAllocator` over a region of `region_pages`
    /// pages obtained from the global allocator.
    ///
    /// The region is returned to the global allocator on drop.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as `new_raw`, including when
    /// `PAGE_SIZE` is too small for any usable prefix to remain after the
    /// metadata tail is reserved.
    ///
    /// # Errors
    ///
    /// If allocation fails, this constructor invokes [`handle_alloc_error`].
    ///
    /// [`handle_alloc_error`]: alloc::alloc::handle_alloc_error
    pub fn new(region_pages: usize) -> BuddyAllocator<PAGE_SIZE, Global> {
        let layout = Self::region_layout(region_pages);

        unsafe {
            let region = {
                let raw = alloc::alloc::alloc(layout);
                NonNull::new(raw).unwrap_or_else(|| alloc::alloc::handle_alloc_error(layout))
            };

            BuddyAllocatorParts::<PAGE_SIZE>::new(region, layout.size())
                .with_backing_allocator(Global)
        }
    }
}

impl<const PAGE_SIZE: usize, A: BackingAllocator> BuddyAllocator<PAGE_SIZE, A> {
    /// Returns the layout a region of `region_pages` pages must satisfy.
    ///
    /// # Panics
    ///
    /// Panics if `PAGE_SIZE` is invalid, if `region_pages` is less than
    /// two, or if the region size overflows `usize`.
    pub fn region_layout(region_pages: usize) -> Layout {
        assert!(PAGE_SIZE.is_power_of_two() && PAGE_SIZE >= mem::size_of::<PageLink>());
        assert!(region_pages >= 2);

        let size = region_pages
            .checked_mul(PAGE_SIZE)
            .expect("region size overflows usize");

        Layout::from_size_align(size, PAGE_SIZE).unwrap()
    }

    /// Allocates a block of `1 << order` pages.
    ///
    /// The returned pointer addresses the first byte of the block and its
    /// offset from the region base is a multiple of `PAGE_SIZE << order`.
    /// Returns `None` if `order` exceeds the allocator's top order or if no
    /// block of that order can be assembled by splitting larger free
    /// blocks.
    pub fn allocate(&mut self, order: usize) -> Option<NonNull<u8>> {
        self.parts.allocate(order)
    }

    /// Deallocates the block of pages at `ptr`, merging it with its free
    /// buddies.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by a call to
    /// [`allocate`](Self::allocate) on this allocator, and it must not have
    /// been deallocated since.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        unsafe { self.parts.deallocate(ptr) };
    }

    /// Returns the number of pages available for allocation.
    ///
    /// This is the managed region's page count minus the pages reserved for
    /// bookkeeping.
    pub fn usable_pages(&self) -> usize {
        self.parts.usable_pages
    }

    /// Decomposes the allocator into the pointer to its managed region.
    ///
    /// # Safety
    ///
    /// All outstanding allocations are invalidated when this method is
    /// called; the returned pointer becomes the sole owner of the region
    /// that was used to construct the allocator. As such, all allocations
    /// made from this allocator should be either freed or forgotten before
    /// calling this method.
    pub unsafe fn into_raw_parts(self) -> NonNull<u8> {
        let this = mem::ManuallyDrop::new(self);

        this.parts.base.ptr()
    }

    /// Returns the highest order this allocator can serve.
    ///
    /// The top order depends on the usable page count and never exceeds
    /// [`MAX_ORDER`]. Allocations above it always fail.
    pub fn top_order(&self) -> usize {
        self.parts.tree.height() as usize
    }

    #[cfg(test)]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.parts.base.ptr()
    }
}

impl<const PAGE_SIZE: usize, A: BackingAllocator> Drop for BuddyAllocator<PAGE_SIZE, A> {
    fn drop(&mut self) {
        let layout = Self::region_layout(self.parts.region_pages);

        unsafe { self.backing_allocator.deallocate(self.parts.base.ptr(), layout) };
    }
}

impl<const PAGE_SIZE: usize, A: BackingAllocator> fmt::Debug for BuddyAllocator<PAGE_SIZE, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyAllocator")
            .field("page_size", &PAGE_SIZE)
            .field("region_pages", &self.parts.region_pages)
            .field("usable_pages", &self.parts.usable_pages)
            .field("top_order", &self.parts.tree.height())
            .finish()
    }
}

/// Like a `BuddyAllocator`, but without a `Drop` impl or an associated
/// allocator.
///
/// The split serves two purposes: this struct can be moved out of while
/// `BuddyAllocator` itself cannot, which assists in tacking on the
/// allocator type parameter, and the whole engine can live here without
/// repeating the `A` parameter it never uses.
struct BuddyAllocatorParts<const PAGE_SIZE: usize> {
    base: BasePtr,
    tree: BlockTree,
    usable_pages: usize,
    region_pages: usize,
    free_heads: [Option<usize>; ORDERS],
}

impl<const PAGE_SIZE: usize> BuddyAllocatorParts<PAGE_SIZE> {
    fn with_backing_allocator<A: BackingAllocator>(
        self,
        backing_allocator: A,
    ) -> BuddyAllocator<PAGE_SIZE, A> {
        BuddyAllocator {
            parts: self,
            backing_allocator,
        }
    }

    /// Partitions the region and seeds the tree and free lists.
    ///
    /// # Safety
    ///
    /// As for [`BuddyAllocator::new_raw`].
    unsafe fn new(region: NonNull<u8>, len: usize) -> BuddyAllocatorParts<PAGE_SIZE> {
        assert!(PAGE_SIZE.is_power_of_two() && PAGE_SIZE >= mem::size_of::<PageLink>());
        assert_eq!(
            region.addr().get() % PAGE_SIZE,
            0,
            "region must be aligned to the page size",
        );
        assert_eq!(
            len % PAGE_SIZE,
            0,
            "region length must be a whole number of pages",
        );

        let region_pages = len / PAGE_SIZE;
        assert!(region_pages >= 2, "region must cover at least two pages");

        // Reserve pages at the tail until the tree over the remaining
        // prefix fits in them. The bound allows one node per usable page
        // plus one per page of the next power of two, which covers the
        // worst partial shape.
        let mut usable = region_pages;
        let mut tail = 0;
        while mem::size_of::<Node>() * (usable + usable.next_power_of_two()) > tail * PAGE_SIZE {
            tail += 1;
            usable -= 1;
        }
        assert!(usable >= 1, "page size too small to hold the bookkeeping");

        let height = tree::height_for(usable);
        assert!(
            height as usize <= MAX_ORDER,
            "region too large for MAX_ORDER",
        );

        let tree = {
            // SAFETY: The tail starts `tail` pages before the end of the
            // region, is page-aligned, and holds at least `cap` nodes by
            // the partition loop's bound. It is owned by the allocator and
            // never handed out, so the arena has it exclusively.
            let storage = unsafe { region.as_ptr().add(usable * PAGE_SIZE) }.cast::<Node>();
            let cap = u32::try_from((tail * PAGE_SIZE) / mem::size_of::<Node>()).unwrap();
            let arena = unsafe { NodeArena::new(storage, cap) };
            BlockTree::build(arena, usable - 1, height)
        };

        let mut parts = BuddyAllocatorParts {
            base: BasePtr { ptr: region },
            tree,
            usable_pages: usable,
            region_pages,
            free_heads: [None; ORDERS],
        };

        // Sweep the tree, putting every complete free subtree on the free
        // list of its order. Only when the whole capacity is usable does
        // the sweep report one undivided block, added here at the top.
        if parts.collect_subtrees(BlockTree::ROOT, 0, height) {
            parts.add_block(0, height);
        }

        parts
    }

    /// Walks the freshly built tree in post-order. Returns `true` if the
    /// subtree at `node` is one undivided free block, leaving it for the
    /// caller; otherwise adds each complete free subtree below it to the
    /// free list of the matching order and returns `false`.
    fn collect_subtrees(&mut self, node: u32, page: usize, depth: u32) -> bool {
        if depth == 0 {
            return true;
        }

        let (left, right) = self.tree.children(node);
        match right {
            Some(right) => {
                if self.collect_subtrees(right, page + (1 << (depth - 1)), depth - 1) {
                    return true;
                }
                self.add_block(page, depth - 1);
                false
            }
            None => {
                // No right child: the usable prefix ends inside the left
                // half, so only the left subtree can contribute blocks.
                let left = left.expect("interior tree node has no children");
                if self.collect_subtrees(left, page, depth - 1) {
                    self.add_block(page, depth - 1);
                }
                false
            }
        }
    }

    fn allocate(&mut self, order: usize) -> Option<NonNull<u8>> {
        let block = self.allocate_block(order)?;

        // Only the block that leaves the allocator is flagged as given;
        // the blocks split on the way down were not handed out at their
        // own order.
        self.tree.set_was_given(block, order as u32, true);

        Some(self.base.with_addr(self.page_addr(block)))
    }

    /// Takes a free block of the requested order off the free lists,
    /// splitting a larger block if none is free at that order.
    fn allocate_block(&mut self, order: usize) -> Option<usize> {
        if order > self.tree.height() as usize {
            return None;
        }

        if let Some(block) = self.free_heads[order] {
            self.remove_block(block, order as u32);
            return Some(block);
        }

        let block = self.allocate_block(order + 1)?;

        // Keep the left half; the right half becomes free at this order.
        self.add_block(block + (1 << order), order as u32);

        Some(block)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let offset = self.base.offset_to(ptr.addr());
        debug_assert_eq!(offset % PAGE_SIZE, 0);

        let mut block = offset / PAGE_SIZE;
        let mut order = self
            .tree
            .given_order(block)
            .expect("deallocated pointer does not denote an outstanding block");

        self.tree.set_was_given(block, order, false);
        self.add_block(block, order);

        // Merge upward while the buddy is free at the same order. At the
        // top order the block covers the whole capacity and has no buddy.
        while order < self.tree.height() {
            let buddy = block ^ (1 << order);
            if !self.tree.is_available(buddy, order) {
                break;
            }

            self.remove_block(buddy, order);
            self.remove_block(block, order);
            block = cmp::min(block, buddy);
            order += 1;
            self.add_block(block, order);
        }
    }

    /// Prepends the block at `(page, order)` to its free list and marks it
    /// available in the tree.
    ///
    /// This dirties the first two words of the page.
    fn add_block(&mut self, page: usize, order: u32) {
        self.tree.set_available(page, order, true);

        let old_head = self.free_heads[order as usize];
        if let Some(head) = old_head {
            // SAFETY: The old head is a free block's head page, so its
            // link is initialized and owned by the allocator.
            unsafe { self.base.link_mut(self.page_addr(head)) }.set_prev(Some(page));
        }

        // SAFETY: `page` lies in the usable prefix and is free, so its
        // link words are the allocator's to write.
        unsafe {
            self.base
                .init_link_at(self.page_addr(page), PageLink::new(old_head, None));
        }

        self.free_heads[order as usize] = Some(page);
    }

    /// Unlinks the block at `(page, order)` from its free list and clears
    /// its available flag in the tree.
    ///
    /// The page's link words are left undefined.
    fn remove_block(&mut self, page: usize, order: u32) {
        debug_assert!(
            self.tree.is_available(page, order),
            "free-list link read from a block the tree does not mark available",
        );

        // SAFETY: The tree marks the block available, so the page is a
        // free block's head and its link is initialized.
        let link = unsafe { self.base.link_mut(self.page_addr(page)) };
        let (next, prev) = (link.next(), link.prev());

        self.tree.set_available(page, order, false);

        if let Some(next) = next {
            // SAFETY: Neighbours on a free list are free blocks' head
            // pages with initialized links.
            unsafe { self.base.link_mut(self.page_addr(next)) }.set_prev(prev);
        }
        match prev {
            Some(prev) => {
                // SAFETY: As above.
                unsafe { self.base.link_mut(self.page_addr(prev)) }.set_next(next);
            }
            None => self.free_heads[order as usize] = next,
        }
    }

    /// Returns the address of the first byte of `page`.
    fn page_addr(&self, page: usize) -> NonZeroUsize {
        let offset = page.checked_mul(PAGE_SIZE).unwrap();

        self.base.addr().checked_add(offset).unwrap()
    }
}
