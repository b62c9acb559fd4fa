//! # Lock-free leased atomic reference counting for 64-bit architectures
//!
//! This crate provides a lock-free atomic smart pointer, a useful building
//! block for lock-free concurrent data structures.  `Larc` is a shared-ownership
//! handle like `Arc`, and `AtomicLarc`/`AtomicOptionLarc` provide the interface
//! of the `std::sync::atomic` types for it, so we can `load`, `swap` and
//! `compare_exchange` reference-counted pointers across threads.
//!
//! `Larc` is implemented with what is variously called external, distributed or
//! weighted reference counting.  Each `Larc` packs a count into the spare bits
//! of its pointer, marking how many units of ownership it possesses, with the
//! global strong count in the control block being the total of all extant
//! counts.  Acquiring a reference from an atomic cell is then a single
//! compare-exchange that subtracts one unit from the packed word.
//!
//! Rarely, the counter in the cell runs low and the thread that noticed must
//! replenish it, leasing a fresh batch of weight from the control block and
//! installing it with a second compare-exchange.  Threads that catch the cell
//! with only one unit left park on the cell until the replenisher has finished.
//! Everything else is lock-free; the parked case cannot occur unless a cell was
//! seeded with a tiny lease, because replenishment triggers while the cell
//! still holds tens of thousands of units.
//!
//! The word layout also reserves the low bits freed by pointee alignment as a
//! small user tag, carried untouched through every protocol operation.
//!
//! Drawbacks relative to `std::sync::Arc`:
//! * Less tested
//! * Small cost to mask the pointer on each access?
//! * `strong_bound` is an upper bound, not a count (but there was no way to
//!   use an exact count safely anyway)

#![cfg(all(target_pointer_width = "64", target_has_atomic = "64"))]

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::Ordering::Acquire;
use std::sync::atomic::Ordering::AcqRel;
use std::sync::atomic::Ordering::Release;
use std::sync::atomic::Ordering;

use std::marker::PhantomData;
use std::mem;
use std::num::NonZeroUsize;
use std::ops::{Add, Deref, DerefMut, Sub};
use std::ptr::NonNull;

use log::trace;

// # Pointer packing
//
// To operate on a pointer and its local reference count with single atomic
// instructions, both live in one 64-bit word.  User-space addresses on x86_64
// and AArch64 fit in 47 bits, and the control block is at least 8-byte
// aligned, so the 3 least significant bits of the address are also free.
//
// Bits 47..=63 hold the count, *stored as count - 1*, so counts run 1..=N
// with N = 1 << 17.  The payoff of the minus-one storage is that a pointer
// with count 1 and tag 0 is bitwise identical to the bare pointer.  Bits
// 0..=2 hold the tag.
//
// Rust does not have bit fields; constants to extract the fields by hand:
const SHIFT: usize = 47;
const TAG: usize = 0b111;
const PTR: usize = ((1 << SHIFT) - 1) & !TAG;
const CNT: usize = !((1 << SHIFT) - 1);
const INC: usize = 1 << SHIFT;
const N: usize = 1 << 17;

/// Pointer, local count and tag packed into a 64 bit value
///
/// This trivial non-owning struct solves the problems of packing and unpacking
/// the fields so that `Larc` and the atomic cells can concentrate on
/// ownership.  The all-zero word is the null state.
struct Counted<T> {
    bits: usize,
    phantom: PhantomData<*mut T>,
}

impl<T> Counted<T> {
    // 1 <= count <= N; pointer 8-aligned and within 47 bits; tag <= 7
    fn new(count: usize, pointer: *mut T, tag: usize) -> Self {
        debug_assert!(0 < count);
        debug_assert!(count <= N);
        debug_assert!(pointer as usize & !PTR == 0);
        debug_assert!(tag & !TAG == 0);
        Self {
            bits: ((count - 1) << SHIFT) | (pointer as usize) | tag,
            phantom: PhantomData,
        }
    }

    fn null() -> Self {
        Self { bits: 0, phantom: PhantomData }
    }

    fn from_usize(bits: usize) -> Self {
        Self { bits, phantom: PhantomData }
    }

    fn get(&self) -> (usize, *mut T, usize) {
        (
            ((self.bits & CNT) >> SHIFT) + 1,
            (self.bits & PTR) as *mut T,
            self.bits & TAG,
        )
    }

    fn count(&self) -> usize {
        ((self.bits & CNT) >> SHIFT) + 1
    }

    fn is_null(&self) -> bool {
        self.bits & PTR == 0
    }

    fn set_count(&mut self, count: usize) {
        debug_assert!(0 < count);
        debug_assert!(count <= N);
        self.bits = (self.bits & !CNT) | ((count - 1) << SHIFT);
    }

    fn set_ptr(&mut self, pointer: *mut T) {
        debug_assert!(pointer as usize & !PTR == 0);
        self.bits = (self.bits & !PTR) | (pointer as usize);
    }

    fn set_tag(&mut self, tag: usize) {
        debug_assert!(tag & !TAG == 0);
        self.bits = (self.bits & !TAG) | tag;
    }

    fn tag(&self) -> usize {
        self.bits & TAG
    }

    /// The fast decrement path may be used again without hitting exhaustion.
    ///
    /// Detects the stored count landing on a 2^k - 1 pattern.  From a full
    /// cell the first such value is reached with half the batch still
    /// unspent, so replenishment runs long before anyone has to park.
    fn healthy(&self) -> bool {
        self.bits & self.bits.wrapping_add(INC) & CNT != 0
    }

    fn ptr_eq(left: Self, right: Self) -> bool {
        left.bits & PTR == right.bits & PTR
    }
}

// Subtraction and addition act on the count field alone.  Because the field
// occupies the most significant bits, in-range arithmetic on the whole word
// cannot carry into or borrow from the pointer and tag.
impl<T> Sub<usize> for Counted<T> {
    type Output = Self;
    fn sub(self, n: usize) -> Self {
        debug_assert!(self.count() > n);
        Self::from_usize(self.bits - (n << SHIFT))
    }
}

impl<T> Add<usize> for Counted<T> {
    type Output = Self;
    fn add(self, n: usize) -> Self {
        debug_assert!(self.count() + n <= N);
        Self::from_usize(self.bits + (n << SHIFT))
    }
}

impl<T> Clone for Counted<T> {
    fn clone(&self) -> Self {
        Self { bits: self.bits, phantom: PhantomData }
    }
}

impl<T> Copy for Counted<T> {}

impl<T> PartialEq for Counted<T> {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<T> Deref for Counted<T> {
    type Target = T;
    fn deref(&self) -> &T {
        let (_, p, _) = self.get();
        debug_assert!(!p.is_null());
        unsafe { &*p }
    }
}

impl<T> DerefMut for Counted<T> {
    fn deref_mut(&mut self) -> &mut T {
        let (_, p, _) = self.get();
        debug_assert!(!p.is_null());
        unsafe { &mut *p }
    }
}

/// Non-null pointer, local count and tag packed into a 64 bit value
///
/// The `NonZeroUsize` field lets `Option` use `0usize` for `None`, so
/// `Option<Larc<T>>` has the same representation as the corresponding
/// `Counted` word.
#[repr(transparent)]
struct CountedNonNull<T> {
    bits: NonZeroUsize,
    phantom: PhantomData<NonNull<T>>,
}

impl<T> CountedNonNull<T> {
    fn new(count: usize, pointer: NonNull<T>, tag: usize) -> Self {
        debug_assert!(0 < count);
        debug_assert!(count <= N);
        debug_assert!(pointer.as_ptr() as usize & !PTR == 0);
        debug_assert!(tag & !TAG == 0);
        let bits = ((count - 1) << SHIFT) | (pointer.as_ptr() as usize) | tag;
        Self {
            bits: unsafe { NonZeroUsize::new_unchecked(bits) },
            phantom: PhantomData,
        }
    }

    fn get(&self) -> (usize, NonNull<T>, usize) {
        let bits = self.bits.get();
        let p = (bits & PTR) as *mut T;
        debug_assert!(!p.is_null());
        (
            ((bits & CNT) >> SHIFT) + 1,
            unsafe { NonNull::new_unchecked(p) },
            bits & TAG,
        )
    }

    fn set_count(&mut self, count: usize) {
        let (_, p, tag) = self.get();
        *self = Self::new(count, p, tag);
    }

    fn set_tag(&mut self, tag: usize) {
        let (count, p, _) = self.get();
        *self = Self::new(count, p, tag);
    }

    fn as_usize(&self) -> usize {
        self.bits.get()
    }
}

impl<T> Clone for CountedNonNull<T> {
    fn clone(&self) -> Self {
        Self { bits: self.bits, phantom: PhantomData }
    }
}

impl<T> Copy for CountedNonNull<T> {}

impl<T> Deref for CountedNonNull<T> {
    type Target = T;
    fn deref(&self) -> &T {
        let (_, p, _) = self.get();
        unsafe { &*p.as_ptr() }
    }
}

impl<T> DerefMut for CountedNonNull<T> {
    fn deref_mut(&mut self) -> &mut T {
        let (_, p, _) = self.get();
        unsafe { &mut *p.as_ptr() }
    }
}

/// Atomic cell over the packed word, plus the parking that backs the
/// exhausted-cell wait.  Threads park keyed on the cell's address and
/// revalidate the word before sleeping, so a wakeup cannot slip between the
/// check and the park.
struct AtomicCounted<T> {
    bits: AtomicUsize,
    phantom: PhantomData<Counted<T>>,
}

impl<T> AtomicCounted<T> {
    fn new(p: Counted<T>) -> Self {
        Self { bits: AtomicUsize::new(p.bits), phantom: PhantomData }
    }

    fn load(&self, order: Ordering) -> Counted<T> {
        Counted::from_usize(self.bits.load(order))
    }

    fn swap(&self, p: Counted<T>, order: Ordering) -> Counted<T> {
        Counted::from_usize(self.bits.swap(p.bits, order))
    }

    fn compare_exchange_weak(
        &self,
        current: Counted<T>,
        new: Counted<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Counted<T>, Counted<T>> {
        match self.bits.compare_exchange_weak(current.bits, new.bits, success, failure) {
            Ok(x) => Ok(Counted::from_usize(x)),
            Err(x) => Err(Counted::from_usize(x)),
        }
    }

    fn compare_exchange(
        &self,
        current: Counted<T>,
        new: Counted<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Counted<T>, Counted<T>> {
        match self.bits.compare_exchange(current.bits, new.bits, success, failure) {
            Ok(x) => Ok(Counted::from_usize(x)),
            Err(x) => Err(Counted::from_usize(x)),
        }
    }

    /// Park until the word changes from `current`.  Spurious wakeups are
    /// fine; callers loop.
    fn wait(&self, current: Counted<T>) {
        let key = &self.bits as *const AtomicUsize as usize;
        unsafe {
            parking_lot_core::park(
                key,
                || self.bits.load(Relaxed) == current.bits,
                || {},
                |_, _| {},
                parking_lot_core::DEFAULT_PARK_TOKEN,
                None,
            );
        }
    }

    fn notify_all(&self) {
        let key = &self.bits as *const AtomicUsize as usize;
        unsafe {
            parking_lot_core::unpark_all(key, parking_lot_core::DEFAULT_UNPARK_TOKEN);
        }
    }
}

/// Control block: the pointee and its global strong count.  The strong count
/// is the total of all leased-out units not yet returned; the block is freed
/// by exactly the release that takes it to zero.
struct Inner<T> {
    strong: AtomicUsize,
    data: T,
}

impl<T> Inner<T> {
    /// Lease `n` more units out of the block.  Only meaningful while at least
    /// one unit is already held, which is why this never needs ordering.
    fn acquire(&self, n: usize) {
        let old = self.strong.fetch_add(n, Relaxed);
        debug_assert!(old > 0);
    }
}

/// Return `n` units.  Frees the block if these were the last.
///
/// The release ordering makes every prior use of the data visible to the
/// destroyer; only the thread that hits zero pays for the acquire fence.
unsafe fn release<T>(p: NonNull<Inner<T>>, n: usize) {
    debug_assert!(n > 0);
    let old = p.as_ref().strong.fetch_sub(n, Release);
    debug_assert!(old >= n);
    if old == n {
        std::sync::atomic::fence(Acquire);
        trace!("strong count reached zero; dropping control block");
        drop(Box::from_raw(p.as_ptr()));
    }
}

/// Shared-ownership handle compatible with lock-free atomics
///
/// A `Larc` packs a weight into the spare bits of its pointer, the weight
/// ranging from 1 to N (stored as 0 to N - 1).  The weight is a measure of how
/// much ownership the handle has, and it can be moved between handles and
/// atomic cells without touching the global strong count, which is what makes
/// a lock-free `AtomicLarc` possible.  A `Larc` with weight one has the same
/// bit representation as the bare control-block pointer.
#[repr(transparent)]
pub struct Larc<T> {
    ptr: CountedNonNull<Inner<T>>,
}

impl<T> Larc<T> {
    /// Create a new `Larc` managing the lifetime of a value on the heap,
    /// holding a full batch of weight.
    pub fn new(data: T) -> Self {
        Self::with_lease(data, N)
    }

    /// Create with a chosen initial lease, `1 <= lease <= N`.  The strong
    /// count starts equal to the lease.  Mostly useful for driving the
    /// replenishment machinery in tests and demos; `new` is the normal entry
    /// point.
    pub fn with_lease(data: T, lease: usize) -> Self {
        assert!(0 < lease && lease <= N);
        debug_assert!(mem::align_of::<Inner<T>>() > TAG);
        let p = NonNull::from(Box::leak(Box::new(Inner {
            strong: AtomicUsize::new(lease),
            data,
        })));
        Self { ptr: CountedNonNull::new(lease, p, 0) }
    }

    /// The user tag carried in the low bits of the packed word.  Tags ride
    /// through atomic cells and the acquire protocol untouched.
    pub fn tag(&self) -> usize {
        let (_, _, tag) = self.ptr.get();
        tag
    }

    pub fn set_tag(&mut self, tag: usize) {
        assert!(tag & !TAG == 0);
        self.ptr.set_tag(tag);
    }

    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        let (_, p, _) = this.ptr.get();
        let (_, q, _) = other.ptr.get();
        p == q
    }

    /// An upper bound on the number of handles sharing the value.  Exact only
    /// in the absence of concurrent clones and drops.
    pub fn strong_bound(this: &Self) -> usize {
        let (n, _, _) = this.ptr.get();
        let m = this.ptr.strong.load(Relaxed);
        m - n + 1
    }

    fn is_unique(&mut self) -> bool {
        // Unique iff our weight is all the weight there is.  Nobody can gain
        // weight except from a holder, so this cannot go stale under us.
        let (n, _, _) = self.ptr.get();
        self.ptr.strong.load(Acquire) == n
    }

    /// Get `&mut T` if `self` is the only handle to the value.
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        if this.is_unique() {
            Some(&mut this.ptr.data)
        } else {
            None
        }
    }

    /// Clone, but allowed to mutate self.  Usually avoids touching the global
    /// strong count by splitting our own weight with the new handle.
    pub fn clone_mut(&mut self) -> Self {
        let (n, p, tag) = self.ptr.get();
        if n == 1 {
            // No spare weight to split; take a double batch from the block
            self.ptr.strong.fetch_add(N * 2 - 1, Relaxed);
            self.ptr.set_count(N);
            Larc { ptr: CountedNonNull::new(N, p, tag) }
        } else {
            let m = n >> 1;
            self.ptr.set_count(n - m);
            Larc { ptr: CountedNonNull::new(m, p, tag) }
        }
    }

    /// Top the handle's weight up to a full batch if it is down to one unit,
    /// so it can be installed into an atomic cell without immediately parking
    /// loaders.
    fn condition(&mut self) {
        let (n, _, _) = self.ptr.get();
        if n == 1 {
            self.ptr.strong.fetch_add(N - 1, Relaxed);
            self.ptr.set_count(N);
        }
    }
}

// A shared handle cannot touch its own count field, so plain clone leases a
// whole fresh batch.  Use clone_mut where a &mut self is available.
impl<T> Clone for Larc<T> {
    fn clone(&self) -> Self {
        self.ptr.strong.fetch_add(N, Relaxed);
        let (_, p, tag) = self.ptr.get();
        Self { ptr: CountedNonNull::new(N, p, tag) }
    }
}

impl<T> Deref for Larc<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.ptr.data
    }
}

impl<T> Drop for Larc<T> {
    fn drop(&mut self) {
        let (n, p, _) = self.ptr.get();
        unsafe { release(p, n) }
    }
}

unsafe impl<T: Send + Sync> Send for Larc<T> {}
unsafe impl<T: Send + Sync> Sync for Larc<T> {}

impl<T: std::fmt::Debug> std::fmt::Debug for Larc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Debug::fmt(&**self, f)
    }
}

impl<T: PartialEq> PartialEq for Larc<T> {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

impl<T: Eq> Eq for Larc<T> {}

impl<T: Default> Default for Larc<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Lock-free concurrent `Option<Larc<T>>`
///
/// Provides a thread-safe nullable smart pointer with an interface similar to
/// [`std::sync::atomic::AtomicPtr`], an alternative to `Mutex<Option<Arc<T>>>`.
///
/// `store` and `swap` are single atomic swaps.  `load` and the
/// `compare_exchange` family are a load plus a looping `compare_exchange_weak`
/// that subtracts one unit of weight from the cell; when the cell's weight
/// runs low, the thread that noticed leases a fresh batch from the control
/// block and refills the cell, and any thread that caught the cell on its
/// last unit parks until the refill lands.
pub struct AtomicOptionLarc<T> {
    ptr: AtomicCounted<Inner<T>>,
}

impl<T> AtomicOptionLarc<T> {
    fn to_ptr(p: Option<Larc<T>>) -> Counted<Inner<T>> {
        match p {
            None => Counted::null(),
            Some(mut q) => {
                // Never install an exhausted word: a cell at weight one with
                // no replenisher in flight would park loaders forever
                q.condition();
                let bits = q.ptr.as_usize();
                mem::forget(q);
                Counted::from_usize(bits)
            }
        }
    }

    fn from_ptr(p: Counted<Inner<T>>) -> Option<Larc<T>> {
        match p.bits & PTR {
            0 => None,
            _ => Some(Larc {
                ptr: CountedNonNull {
                    bits: unsafe { NonZeroUsize::new_unchecked(p.bits) },
                    phantom: PhantomData,
                },
            }),
        }
    }

    pub fn new(p: Option<Larc<T>>) -> Self {
        Self { ptr: AtomicCounted::new(Self::to_ptr(p)) }
    }

    /// Non-atomic access while not shared.
    pub fn get_mut(&mut self) -> &mut Option<Larc<T>> {
        // Option<Larc<T>> is repr(transparent) down to the word
        unsafe { &mut *(self.ptr.bits.get_mut() as *mut usize as *mut Option<Larc<T>>) }
    }

    pub fn into_inner(mut self) -> Option<Larc<T>> {
        let a = Self::from_ptr(Counted::from_usize(*self.ptr.bits.get_mut()));
        mem::forget(self);
        a
    }

    // # The acquire protocol
    //
    // One acquisition attempt against the cell.  Returns the number of
    // ownership units transferred to the caller; zero means no reference was
    // obtained and `expected` has been updated with a fresher view of the
    // cell.  The caller owns exactly the returned units and must release
    // exactly that many.
    //
    // The rare path: when the decrement leaves the word unhealthy, this
    // thread leases N - 1 units from the control block (holding N in hand:
    // the decremented unit plus the lease) and refills the cell to a full N,
    // keeping whatever the refill does not absorb.  If the pointer changes
    // before the refill lands, all N units in hand go straight back, for a
    // net leak of zero, and the caller is told nothing was acquired.
    pub(crate) fn compare_acquire_weak(&self, expected: &mut Counted<Inner<T>>) -> usize {
        if expected.is_null() {
            return 0;
        }
        if expected.count() == 1 {
            // Exhausted; a replenisher is in flight.  Park until the word
            // changes, then report failure so the caller retries.
            self.ptr.wait(*expected);
            *expected = self.ptr.load(Relaxed);
            return 0;
        }
        let mut desired = *expected - 1;
        match self.ptr.compare_exchange_weak(*expected, desired, Acquire, Relaxed) {
            Err(e) => {
                *expected = e;
                0
            }
            Ok(_) => {
                if desired.healthy() {
                    *expected = desired;
                    return 1;
                }
                let (_, raw, _) = desired.get();
                let p = unsafe { NonNull::new_unchecked(raw) };
                trace!("cell weight low; replenishing");
                unsafe { p.as_ref().acquire(N - 1) };
                loop {
                    let m = desired.count();
                    let refill = desired + (N - m);
                    // Deliberately not compare_exchange_weak: a real failure
                    // tells us whether the pointer moved; a spurious one would
                    // only force another lap
                    match self.ptr.compare_exchange(desired, refill, Release, Relaxed) {
                        Ok(_) => {
                            if m == 1 {
                                // Someone may have parked on the exhausted word
                                self.ptr.notify_all();
                            }
                            *expected = refill;
                            return m;
                        }
                        Err(e) => {
                            if !e.is_null() && Counted::ptr_eq(e, desired) {
                                // Count or tag moved; retry against it.  This
                                // also covers a concurrent replenisher having
                                // already refilled, making our exchange a
                                // no-op next time around.
                                desired = e;
                                continue;
                            }
                            // Object replaced under us; give every unit back
                            trace!("pointer changed during replenish; returning lease");
                            unsafe { release(p, N) };
                            *expected = e;
                            return 0;
                        }
                    }
                }
            }
        }
    }

    // Acquisition with compare_exchange_strong semantics: retries until a
    // reference is obtained or the cell genuinely holds a different pointer.
    pub(crate) fn compare_acquire_strong(&self, expected: &mut Counted<Inner<T>>) -> usize {
        let (_, p, _) = expected.get();
        if p.is_null() {
            return 0;
        }
        loop {
            let n = self.compare_acquire_weak(expected);
            if n != 0 {
                return n;
            }
            let (_, q, _) = expected.get();
            if q != p {
                return 0;
            }
        }
    }

    // Blocking acquisition: retries until a reference is obtained or the cell
    // is null.  Uninterruptible by design; as long as the object is installed
    // a reference is eventually obtainable.
    pub(crate) fn atomic_acquire(&self, expected: &mut Counted<Inner<T>>) -> usize {
        loop {
            if expected.is_null() {
                return 0;
            }
            let n = self.compare_acquire_weak(expected);
            if n != 0 {
                return n;
            }
        }
    }

    /// Loading is the key operation for the structure: obtain a reference to
    /// whatever the cell currently holds.
    pub fn load(&self) -> Option<Larc<T>> {
        let mut expected = self.ptr.load(Relaxed);
        let n = self.atomic_acquire(&mut expected);
        if n == 0 {
            return None;
        }
        let (_, p, tag) = expected.get();
        debug_assert!(!p.is_null());
        let p = unsafe { NonNull::new_unchecked(p) };
        Some(Larc { ptr: CountedNonNull::new(n, p, tag) })
    }

    /// Always lock-free
    pub fn store(&self, new: Option<Larc<T>>) {
        self.swap(new);
    }

    /// Always lock-free
    pub fn swap(&self, new: Option<Larc<T>>) -> Option<Larc<T>> {
        let old = self.ptr.swap(Self::to_ptr(new), AcqRel);
        if !old.is_null() && old.count() == 1 {
            // We just replaced an exhausted word.  Its replenisher will see
            // the new pointer and back out without notifying, so threads
            // parked on the old word are ours to wake.
            self.ptr.notify_all();
        }
        Self::from_ptr(old)
    }

    /// See [`AtomicOptionLarc::compare_exchange`]
    pub fn compare_and_swap(
        &self,
        current: Option<Larc<T>>,
        new: Option<Larc<T>>,
    ) -> Option<Larc<T>> {
        match self.compare_exchange(current, new) {
            Ok(old) => old,
            Err(old) => old,
        }
    }

    /// If the cell holds the same pointer as `current`, replace it with `new`
    /// and return the old value; otherwise acquire and return what it does
    /// hold.  The failure branch is a full acquisition, so it pays the same
    /// costs as `load`, replenishment included.
    pub fn compare_exchange(
        &self,
        current: Option<Larc<T>>,
        new: Option<Larc<T>>,
    ) -> Result<Option<Larc<T>>, Option<Larc<T>>> {
        let current_cp = Self::to_ptr(current);
        let new_cp = Self::to_ptr(new);
        let mut expected = self.ptr.load(Relaxed);
        loop {
            if Counted::ptr_eq(expected, current_cp) {
                match self.ptr.compare_exchange_weak(expected, new_cp, AcqRel, Relaxed) {
                    Ok(old) => {
                        // Success linearization point.  As in swap, replacing
                        // an exhausted word leaves its parked threads to us.
                        if !old.is_null() && old.count() == 1 {
                            self.ptr.notify_all();
                        }
                        Self::from_ptr(current_cp);
                        return Ok(Self::from_ptr(old));
                    }
                    Err(e) => {
                        expected = e;
                        continue;
                    }
                }
            } else {
                if expected.is_null() {
                    Self::from_ptr(current_cp);
                    Self::from_ptr(new_cp);
                    return Err(None);
                }
                let n = self.compare_acquire_weak(&mut expected);
                if n != 0 {
                    // Failure linearization point
                    let (_, raw, tag) = expected.get();
                    let p = unsafe { NonNull::new_unchecked(raw) };
                    Self::from_ptr(current_cp);
                    Self::from_ptr(new_cp);
                    return Err(Some(Larc { ptr: CountedNonNull::new(n, p, tag) }));
                }
                // Acquisition failed; expected was refreshed, go around
            }
        }
    }

    /// Currently equivalent to [`AtomicOptionLarc::compare_exchange`]: the
    /// failure branch must acquire anyway, so there is little to gain from
    /// exploiting spurious failure.
    pub fn compare_exchange_weak(
        &self,
        current: Option<Larc<T>>,
        new: Option<Larc<T>>,
    ) -> Result<Option<Larc<T>>, Option<Larc<T>>> {
        self.compare_exchange(current, new)
    }
}

impl<T> Default for AtomicOptionLarc<T> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<T> Drop for AtomicOptionLarc<T> {
    fn drop(&mut self) {
        // Sole owner; skip the atomics
        Self::from_ptr(Counted::from_usize(*self.ptr.bits.get_mut()));
    }
}

unsafe impl<T: Send + Sync> Send for AtomicOptionLarc<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicOptionLarc<T> {}

/// Lock-free concurrent [`Larc`]
///
/// [`std::sync::Arc`] manages the lifetime of a shared value but a given `Arc`
/// cannot be safely mutated by multiple threads; [`std::sync::atomic::AtomicPtr`]
/// is concurrently mutable but manages no lifetime.  `AtomicLarc` does both,
/// without locking, which makes it a useful primitive for lock-free data
/// structures.  It can replace `Mutex<Arc<T>>`; it cannot replace
/// `Arc<Mutex<T>>`.
///
/// Currently a wrapper around [`AtomicOptionLarc`].
pub struct AtomicLarc<T> {
    value: AtomicOptionLarc<T>,
}

impl<T> AtomicLarc<T> {
    pub fn new(val: Larc<T>) -> Self {
        Self { value: AtomicOptionLarc::new(Some(val)) }
    }

    pub fn into_inner(self) -> Larc<T> {
        self.value.into_inner().unwrap()
    }

    pub fn get_mut(&mut self) -> &mut Larc<T> {
        // Repr(transparent) chain; the option is known Some
        unsafe { &mut *(self.value.get_mut() as *mut Option<Larc<T>> as *mut Larc<T>) }
    }

    /// See [`AtomicOptionLarc`] for details
    pub fn load(&self) -> Larc<T> {
        self.value.load().unwrap()
    }

    pub fn store(&self, new: Larc<T>) {
        self.value.store(Some(new))
    }

    pub fn swap(&self, new: Larc<T>) -> Larc<T> {
        self.value.swap(Some(new)).unwrap()
    }

    pub fn compare_and_swap(&self, current: Larc<T>, new: Larc<T>) -> Larc<T> {
        self.value.compare_and_swap(Some(current), Some(new)).unwrap()
    }

    pub fn compare_exchange(
        &self,
        current: Larc<T>,
        new: Larc<T>,
    ) -> Result<Larc<T>, Larc<T>> {
        match self.value.compare_exchange(Some(current), Some(new)) {
            Ok(old) => Ok(old.unwrap()),
            Err(old) => Err(old.unwrap()),
        }
    }

    pub fn compare_exchange_weak(
        &self,
        current: Larc<T>,
        new: Larc<T>,
    ) -> Result<Larc<T>, Larc<T>> {
        match self.value.compare_exchange_weak(Some(current), Some(new)) {
            Ok(old) => Ok(old.unwrap()),
            Err(old) => Err(old.unwrap()),
        }
    }
}

impl<T: Default> Default for AtomicLarc<T> {
    fn default() -> Self {
        Self::new(Larc::default())
    }
}

unsafe impl<T: Send + Sync> Send for AtomicLarc<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicLarc<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::AtomicIsize;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;

    // Instrumented pointee: counts live instances so tests can assert that
    // everything created was destroyed exactly once.  Tests touching it
    // serialize on TESTS so the live count is theirs alone.
    static LIVE: AtomicIsize = AtomicIsize::new(0);
    static TESTS: Mutex<()> = Mutex::new(());

    fn serial() -> std::sync::MutexGuard<'static, ()> {
        TESTS.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[derive(Debug, PartialEq, Eq)]
    struct Counter {
        value: usize,
    }

    impl Counter {
        fn new(value: usize) -> Self {
            let n = LIVE.fetch_add(1, AcqRel);
            assert!(n >= 0);
            Counter { value }
        }
        fn check() {
            assert_eq!(LIVE.load(Acquire), 0);
        }
    }

    impl Drop for Counter {
        fn drop(&mut self) {
            let n = LIVE.fetch_sub(1, AcqRel);
            assert!(n > 0);
        }
    }

    #[test]
    fn layout() {
        assert!(cfg!(target_has_atomic = "64"));
        assert_eq!(mem::size_of::<Counted<Inner<Counter>>>(), 8);
        assert_eq!(mem::align_of::<Counted<Inner<Counter>>>(), 8);
        assert_eq!(mem::size_of::<Larc<Counter>>(), 8);
        assert_eq!(mem::size_of::<Option<Larc<Counter>>>(), 8);
        assert_eq!(mem::size_of::<AtomicOptionLarc<Counter>>(), 8);
        fn is_copy<T: Copy>() {}
        is_copy::<Counted<Inner<Counter>>>();
        is_copy::<CountedNonNull<Inner<Counter>>>();
    }

    #[test]
    fn packing() {
        let b = Box::into_raw(Box::new(7usize));
        let mut c = Counted::new(5, b, 3);
        assert_eq!(c.get(), (5, b, 3));
        assert_eq!(c.count(), 5);
        assert_eq!(c.tag(), 3);
        assert!(!c.is_null());

        // Arithmetic touches only the count
        let d = c - 1;
        assert_eq!(d.get(), (4, b, 3));
        let e = d + 3;
        assert_eq!(e.get(), (7, b, 3));

        // Mutators preserve the other fields
        c.set_count(N);
        assert_eq!(c.get(), (N, b, 3));
        c.set_tag(1);
        assert_eq!(c.get(), (N, b, 1));
        let b2 = Box::into_raw(Box::new(8usize));
        c.set_ptr(b2);
        assert_eq!(c.get(), (N, b2, 1));

        // Count 1, tag 0 is bitwise the bare pointer
        let unit = Counted::new(1, b, 0);
        assert_eq!(unit.bits, b as usize);

        assert!(Counted::ptr_eq(Counted::new(1, b, 0), Counted::new(9, b, 2)));
        assert!(!Counted::ptr_eq(Counted::new(1, b, 0), Counted::new(1, b2, 0)));
        assert!(Counted::<usize>::null().is_null());

        drop(unsafe { Box::from_raw(b) });
        drop(unsafe { Box::from_raw(b2) });
    }

    #[test]
    fn health() {
        let b = Box::into_raw(Box::new(0usize));
        let at = |count: usize| Counted::new(count, b, 0).healthy();
        // Unhealthy exactly where the stored count - 1 is 2^k - 1
        assert!(!at(1));
        assert!(!at(2));
        assert!(at(3));
        assert!(!at(4));
        assert!(at(5));
        assert!(at(7));
        assert!(!at(8));
        assert!(!at(1 << 16));
        assert!(at((1 << 16) + 1));
        assert!(at(N - 1));
        assert!(!at(N));
        drop(unsafe { Box::from_raw(b) });
    }

    // The canonical replenishment sequence, bit for bit.  Seed the strong
    // count and the cell's lease at 10.  The first strong acquisition is the
    // fast path and takes one unit.  The second decrements 9 -> 8, landing on
    // an unhealthy word, so it leases N - 1 from the control block, refills
    // the cell to a full N, and keeps the 8 units the refill displaced.
    #[test]
    fn replenish_scenario() {
        let _g = serial();
        {
            let cell = AtomicOptionLarc::new(Some(Larc::with_lease(Counter::new(42), 10)));
            let mut expected = cell.ptr.load(Relaxed);
            assert_eq!(expected.count(), 10);
            assert_eq!(expected.strong.load(Relaxed), 10);

            let n1 = cell.compare_acquire_strong(&mut expected);
            assert_eq!(n1, 1);
            assert_eq!(expected.count(), 9);
            assert_eq!(expected.strong.load(Relaxed), 10);

            let n2 = cell.compare_acquire_strong(&mut expected);
            assert_eq!(n2, 8);
            assert_eq!(expected.count(), N);
            assert_eq!(cell.ptr.load(Relaxed).count(), N);
            assert_eq!(expected.strong.load(Relaxed), 9 + N);

            let (_, p, _) = expected.get();
            let p = NonNull::new(p).unwrap();
            unsafe {
                release(p, n1);
                release(p, n2);
            }
        }
        Counter::check();
    }

    #[test]
    fn lease_conservation() {
        let _g = serial();
        {
            let cell = AtomicOptionLarc::new(Some(Larc::with_lease(Counter::new(1), 100)));
            let strong = |c: &AtomicOptionLarc<Counter>| {
                let w = c.ptr.load(Relaxed);
                w.strong.load(Relaxed)
            };
            let cell_count = |c: &AtomicOptionLarc<Counter>| c.ptr.load(Relaxed).count();

            let mut held: Vec<Larc<Counter>> = Vec::new();
            let mut held_units = 0;
            for _ in 0..20 {
                let a = cell.load().unwrap();
                held_units += a.ptr.get().0;
                held.push(a);
                assert_eq!(strong(&cell), cell_count(&cell) + held_units);
            }
            while let Some(a) = held.pop() {
                held_units -= a.ptr.get().0;
                drop(a);
                assert_eq!(strong(&cell), cell_count(&cell) + held_units);
            }
        }
        Counter::check();
    }

    #[test]
    fn basics() {
        let _g = serial();
        {
            let a = Larc::new(Counter::new(0));
            assert_eq!(*a, Counter::new(0));
        }
        Counter::check();
        {
            let a = Larc::new(Counter::new(3));
            let b = a.clone();
            assert_eq!(a, b);
            assert!(Larc::ptr_eq(&a, &b));
            let c = Larc::new(Counter::new(3));
            assert_eq!(a, c);
            assert!(!Larc::ptr_eq(&a, &c));
        }
        Counter::check();
        {
            let mut a = Larc::new(Counter::new(1));
            assert_eq!(Larc::strong_bound(&a), 1);
            let b = a.clone_mut();
            assert!(Larc::ptr_eq(&a, &b));
            assert!(Larc::strong_bound(&a) > 1);
        }
        Counter::check();
        {
            let mut a = Larc::new(Counter::new(1));
            *Larc::get_mut(&mut a).unwrap() = Counter::new(2);
            assert_eq!(*a, Counter::new(2));
            let b = a.clone();
            assert_eq!(Larc::get_mut(&mut a), None);
            drop(b);
            assert!(Larc::get_mut(&mut a).is_some());
        }
        Counter::check();
        {
            // A minimal lease splits correctly on clone_mut
            let mut a = Larc::with_lease(Counter::new(9), 1);
            let b = a.clone_mut();
            assert!(Larc::ptr_eq(&a, &b));
        }
        Counter::check();
    }

    #[test]
    fn tags() {
        let _g = serial();
        {
            let mut a = Larc::new(Counter::new(5));
            assert_eq!(a.tag(), 0);
            a.set_tag(5);
            assert_eq!(a.tag(), 5);

            // Tags ride through the cell and come back on load
            let cell = AtomicOptionLarc::new(Some(a));
            let b = cell.load().unwrap();
            assert_eq!(b.tag(), 5);
        }
        Counter::check();
    }

    #[test]
    fn atomics() {
        let _g = serial();
        {
            let a = AtomicOptionLarc::new(Some(Larc::new(Counter::new(99))));
            drop(a);
        }
        Counter::check();
        {
            let a = AtomicOptionLarc::new(Some(Larc::new(Counter::new(1))));
            assert_eq!(a.load().unwrap().value, 1);
            let b: AtomicOptionLarc<Counter> = AtomicOptionLarc::default();
            assert!(b.load().is_none());
        }
        Counter::check();
        {
            let a = AtomicOptionLarc::new(Some(Larc::new(Counter::new(1))));
            assert_eq!(a.into_inner(), Some(Larc::new(Counter::new(1))));
        }
        Counter::check();
        {
            let a = Larc::new(Counter::new(1));
            let b = AtomicOptionLarc::new(Some(a.clone()));
            let c = b.load();
            assert_eq!(&a, &c.unwrap());
        }
        Counter::check();
        {
            let a = Larc::new(Counter::new(1));
            let b = Larc::new(Counter::new(2));
            let c = AtomicOptionLarc::new(Some(a));
            c.store(Some(b));
            assert_eq!(*c.load().unwrap(), Counter::new(2));
        }
        Counter::check();
        {
            let a = Larc::new(Counter::new(1));
            let b = Larc::new(Counter::new(2));
            let c = AtomicOptionLarc::new(Some(a));
            let d = c.swap(Some(b));
            assert_eq!(*d.unwrap(), Counter::new(1));
            assert_eq!(*c.load().unwrap(), Counter::new(2));
        }
        Counter::check();
        {
            let a = Larc::new(Counter::new(1));
            let b = Larc::new(Counter::new(2));
            let c = AtomicOptionLarc::new(Some(a.clone()));
            let d = c.compare_and_swap(Some(a.clone()), Some(b.clone()));
            assert!(Larc::ptr_eq(&d.unwrap(), &a));
            let e = c.compare_and_swap(Some(a.clone()), Some(b.clone()));
            assert!(Larc::ptr_eq(&e.unwrap(), &b));
        }
        Counter::check();
        {
            let a = Larc::new(Counter::new(1));
            let c = AtomicOptionLarc::new(Some(a.clone()));
            match c.compare_exchange(None, None) {
                Err(Some(e)) => assert!(Larc::ptr_eq(&e, &a)),
                _ => panic!("expected failure with the current value"),
            }
        }
        Counter::check();
        {
            let c: AtomicOptionLarc<Counter> = AtomicOptionLarc::default();
            assert!(matches!(c.compare_exchange(None, None), Ok(None)));
            match c.compare_exchange(Some(Larc::new(Counter::new(1))), None) {
                Err(None) => {}
                _ => panic!("expected failure with None"),
            }
        }
        Counter::check();
    }

    // A load that drives a tiny lease into the unhealthy band must refill the
    // cell rather than leave it exhausted
    #[test]
    fn replenish_refills_cell() {
        let _g = serial();
        {
            let cell = AtomicOptionLarc::new(Some(Larc::with_lease(Counter::new(0), 4)));
            let a = cell.load().unwrap(); // 4 -> 3, healthy
            assert_eq!(a.ptr.get().0, 1);
            let b = cell.load().unwrap(); // 3 -> 2, unhealthy: replenishes
            assert_eq!(cell.ptr.load(Relaxed).count(), N);
            assert_eq!(b.ptr.get().0, 2);
            drop(a);
            drop(b);
        }
        Counter::check();
    }

    // A thread that catches the cell on its last unit parks; the replenisher
    // must wake it.  The replenisher is played by the main thread, stalled
    // mid-protocol: it has decremented to the exhausted word and not yet
    // refilled.
    #[test]
    fn park_and_notify() {
        let _g = serial();
        {
            let cell = Arc::new(AtomicOptionLarc::new(Some(Larc::with_lease(
                Counter::new(7),
                2,
            ))));

            // Decrement 2 -> 1 by hand: the stalled replenisher now holds one
            // unit and owes the cell a refill
            let expected = cell.ptr.load(Relaxed);
            assert_eq!(expected.count(), 2);
            let exhausted = expected - 1;
            cell.ptr
                .compare_exchange(expected, exhausted, Acquire, Relaxed)
                .ok()
                .unwrap();

            let loaded = Arc::new(AtomicBool::new(false));
            let t = {
                let cell = Arc::clone(&cell);
                let loaded = Arc::clone(&loaded);
                std::thread::spawn(move || {
                    let a = cell.load().unwrap();
                    loaded.store(true, Release);
                    drop(a);
                })
            };

            std::thread::sleep(Duration::from_millis(100));
            assert!(!loaded.load(Acquire), "loader should be parked");

            // Complete the replenishment the way the protocol would
            let (_, p, _) = exhausted.get();
            let p = NonNull::new(p).unwrap();
            unsafe { p.as_ref().acquire(N - 1) };
            cell.ptr
                .compare_exchange(exhausted, exhausted + (N - 1), Release, Relaxed)
                .ok()
                .unwrap();
            cell.ptr.notify_all();

            let mut waited = Duration::ZERO;
            while !loaded.load(Acquire) && waited < Duration::from_secs(5) {
                std::thread::sleep(Duration::from_millis(10));
                waited += Duration::from_millis(10);
            }
            assert!(loaded.load(Acquire), "loader was not woken by the refill");
            t.join().unwrap();

            // The stalled replenisher's one unit
            unsafe { release(p, 1) };
        }
        Counter::check();
    }

    #[test]
    fn stress() {
        let _g = serial();
        {
            let cells: Arc<Vec<AtomicOptionLarc<Counter>>> = Arc::new(
                (0..4usize)
                    .map(|i| AtomicOptionLarc::new(Some(Larc::new(Counter::new(i)))))
                    .collect(),
            );
            let mut handles = Vec::new();
            for k in 0..8usize {
                let cells = Arc::clone(&cells);
                handles.push(std::thread::spawn(move || {
                    for i in 0..20_000usize {
                        let cell = &cells[(i + k) % cells.len()];
                        match i % 17 {
                            0 => {
                                cell.store(Some(Larc::new(Counter::new(i))));
                            }
                            1 => {
                                let old = cell.swap(Some(Larc::new(Counter::new(i))));
                                drop(old);
                            }
                            2 => {
                                let cur = cell.load();
                                let _ =
                                    cell.compare_exchange(cur, Some(Larc::new(Counter::new(i))));
                            }
                            _ => {
                                if let Some(a) = cell.load() {
                                    assert!(a.value < usize::MAX);
                                }
                            }
                        }
                    }
                }));
            }
            for h in handles {
                h.join().unwrap();
            }
            drop(cells);
        }
        Counter::check();
    }

    // Tiny leases force the replenishment path constantly under contention
    #[test]
    fn stress_replenish() {
        let _g = serial();
        {
            let cell = Arc::new(AtomicOptionLarc::new(Some(Larc::with_lease(
                Counter::new(0),
                3,
            ))));
            let mut handles = Vec::new();
            for _ in 0..8usize {
                let cell = Arc::clone(&cell);
                handles.push(std::thread::spawn(move || {
                    for i in 0..10_000usize {
                        if i % 101 == 0 {
                            cell.store(Some(Larc::with_lease(Counter::new(i), 3)));
                        } else {
                            let a = cell.load();
                            drop(a);
                        }
                    }
                }));
            }
            for h in handles {
                h.join().unwrap();
            }
            drop(cell);
        }
        Counter::check();
    }
}
