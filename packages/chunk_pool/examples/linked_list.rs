//! Builds a doubly linked list whose nodes come from a `ChunkAllocator`.
//!
//! The list is grown past the capacity of the first slab to show the allocator appending a
//! larger slab, then drained, refilled and finally discarded in bulk.

use std::ptr::{self, NonNull};

use chunk_pool::ChunkAllocator;
use new_zealand::nz;

struct Node {
    value: u32,
    prev: *mut Node,
    next: *mut Node,
}

struct List {
    head: *mut Node,
    tail: *mut Node,
}

impl List {
    fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    fn push_back(&mut self, allocator: &mut ChunkAllocator, value: u32) {
        let node = allocator
            .acquire()
            .expect("the example never runs out of memory")
            .cast::<Node>()
            .as_ptr();

        // SAFETY: The chunk is sized and aligned for a Node, and the tail (if any) is a node
        // this list initialized earlier.
        unsafe {
            node.write(Node {
                value,
                prev: self.tail,
                next: ptr::null_mut(),
            });

            match NonNull::new(self.tail) {
                Some(mut tail) => tail.as_mut().next = node,
                None => self.head = node,
            }
        }

        self.tail = node;
    }

    fn pop_front(&mut self, allocator: &mut ChunkAllocator) -> Option<u32> {
        let node = NonNull::new(self.head)?;

        // SAFETY: Every node reachable from head was initialized by push_back().
        let Node { value, next, .. } = unsafe { node.read() };

        self.head = next;
        match NonNull::new(next) {
            // SAFETY: See above, the next node is a live node of this list.
            Some(mut next) => unsafe { next.as_mut().prev = ptr::null_mut() },
            None => self.tail = ptr::null_mut(),
        }

        // SAFETY: The node came from this allocator and is no longer reachable from the list.
        unsafe { allocator.release(node.cast()) };

        Some(value)
    }

    fn sum(&self) -> u64 {
        let mut total = 0_u64;
        let mut current = self.head;

        while let Some(node) = NonNull::new(current) {
            // SAFETY: Every node reachable from head was initialized by push_back().
            let node = unsafe { node.as_ref() };
            total = total.wrapping_add(u64::from(node.value));
            current = node.next;
        }

        total
    }
}

fn print_chain(allocator: &ChunkAllocator) {
    for (index, slab) in allocator.slabs().enumerate() {
        println!(
            "  slab {index}: capacity {}, free {}",
            slab.capacity(),
            slab.free_count()
        );
    }
}

fn main() {
    let mut allocator = ChunkAllocator::builder()
        .layout_of::<Node>()
        .initial_capacity(nz!(100))
        .build()
        .expect("the example never runs out of memory");

    let mut list = List::new();

    for value in 0..101 {
        list.push_back(&mut allocator, value);
    }

    println!("After pushing 101 nodes (sum {}):", list.sum());
    print_chain(&allocator);

    let mut popped = 0_usize;
    while list.pop_front(&mut allocator).is_some() {
        popped = popped.wrapping_add(1);
    }

    println!("After popping {popped} nodes:");
    print_chain(&allocator);

    for value in 0..250 {
        list.push_back(&mut allocator, value);
    }

    println!("After pushing 250 nodes (sum {}):", list.sum());
    print_chain(&allocator);

    // The nodes hold no resources, so the whole list can be discarded at once.
    list = List::new();
    allocator.reset();

    println!("After reset (list sum {}):", list.sum());
    print_chain(&allocator);

    allocator.destroy();
    println!(
        "After destroy: {} slabs, acquire yields {:?}",
        allocator.slab_count(),
        allocator.acquire()
    );
}
