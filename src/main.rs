//! Exercise the atomic cells with a simple unbounded concurrent stack.
//!
//! This doesn't prove anything but does catch basic bugs, and with
//! `RUST_LOG=trace` it shows how rarely the replenishment path runs.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use larc::{AtomicOptionLarc, Larc};
use log::{debug, info};

// Singly-linked-list node for a Treiber stack.  The stack does not suffer
// from the ABA problem because the counted pointers guarantee memory is not
// recycled while any thread still holds a reference to it.
struct Node<T> {
    next: Option<Larc<Node<T>>>,
    value: T,
}

impl<T> Drop for Node<T> {
    fn drop(&mut self) {
        // Automatic drop recurses along the list and tends to blow the stack.
        // If we are the sole owner of the next node, steal its next field and
        // overwrite our own, deleting nodes one at a time until we hit one
        // somebody else owns too.
        loop {
            let tmp: Option<Larc<Node<T>>>;
            match self.next {
                None => return,
                Some(ref mut a) => match Larc::get_mut(a) {
                    None => return,
                    Some(nn) => {
                        tmp = nn.next.take();
                    }
                },
            }
            self.next = tmp;
        }
    }
}

struct Stack<T> {
    head: AtomicOptionLarc<Node<T>>,
}

impl<T: Clone> Stack<T> {
    fn push(&self, val: T) {
        let mut current = self.head.load();
        loop {
            let new = Some(Larc::new(Node {
                next: current.clone(),
                value: val.clone(),
            }));
            match self.head.compare_exchange(current, new) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn pop(&self) -> Option<T> {
        let mut current = self.head.load();
        loop {
            match current {
                Some(ref node) => {
                    let new = node.next.clone();
                    let payload = node.value.clone();
                    match self.head.compare_exchange(current.clone(), new) {
                        Ok(_) => return Some(payload),
                        Err(actual) => current = actual,
                    }
                }
                None => return None,
            }
        }
    }
}

impl<T> Default for Stack<T> {
    fn default() -> Stack<T> {
        Stack { head: AtomicOptionLarc::default() }
    }
}

fn main() {
    env_logger::init();

    let stack: Arc<Stack<usize>> = Arc::new(Stack::default());
    let pushed = Arc::new(AtomicUsize::new(0));
    let popped = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for k in 0..16usize {
        let stack = Arc::clone(&stack);
        let pushed = Arc::clone(&pushed);
        let popped = Arc::clone(&popped);
        handles.push(std::thread::spawn(move || {
            for i in 0..1000 {
                let j = i * 2 + k * 2000;
                stack.push(j);
                stack.push(j + 1);
                pushed.fetch_add(j + j + 1, Relaxed);
                if let Some(p) = stack.pop() {
                    popped.fetch_add(p, Relaxed);
                }
            }
            debug!("thread {} finished", k);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // Whatever was not popped is still on the stack; the totals must balance
    let mut rest = 0;
    while let Some(p) = stack.pop() {
        rest += p;
    }
    let pushed = pushed.load(Relaxed);
    let popped = popped.load(Relaxed);
    info!("pushed sum {}, popped sum {}, drained sum {}", pushed, popped, rest);
    assert_eq!(pushed, popped + rest);
    info!("balanced");
}
