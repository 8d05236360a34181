#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use page_buddy::{BuddyAllocator, Global, MAX_ORDER};

const PAGE_SIZE: usize = 4096;
const MAX_REGION_PAGES: usize = 256;

#[derive(Clone, Debug, Arbitrary)]
enum PageOp {
    Allocate(usize),
    Deallocate(usize),
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    region_pages: usize,
    ops: Vec<PageOp>,
}

fuzz_target!(|args: Args| {
    let region_pages = 2 + args.region_pages % (MAX_REGION_PAGES - 1);
    let mut alloc: BuddyAllocator<PAGE_SIZE, Global> = BuddyAllocator::new(region_pages);

    let mut outstanding = Vec::new();

    for op in args.ops {
        match op {
            PageOp::Allocate(raw_order) => {
                // Reach past the largest possible order so failed
                // allocations stay exercised.
                let order = raw_order % (MAX_ORDER + 2);
                if let Some(block) = alloc.allocate(order) {
                    outstanding.push(block);
                }
            }

            PageOp::Deallocate(raw_idx) => {
                if outstanding.is_empty() {
                    continue;
                }

                let block = outstanding.swap_remove(raw_idx % outstanding.len());
                unsafe { alloc.deallocate(block) };
            }
        }
    }
});
