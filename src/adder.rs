use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use rand::Rng;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};

/// A cell-striped additive counter.
///
/// Uncontended updates go straight to `base`. Once an update observes contention, it moves to a
/// lazily allocated array of cells, selected by a per-thread probe; further contention rehashes
/// the probe and, if collisions persist, doubles the cell array up to the number of CPUs rounded
/// to the next power of two. `sum` returns `base` plus the cell total; under concurrent updates
/// it is a recent value rather than an instantaneous one, and it may be transiently negative
/// while an increment and a decrement race.
#[derive(Default, Debug)]
pub(crate) struct LongAdder {
    base: AtomicIsize,
    cells: Atomic<Vec<AtomicIsize>>,
    cells_busy: AtomicBool,
}

thread_local! {
    static PROBE: Cell<u32> = Cell::new(0);
}

/// This thread's cell-selection probe, seeded on first use.
fn probe() -> u32 {
    PROBE.with(|probe| {
        let mut h = probe.get();
        if h == 0 {
            h = rand::thread_rng().gen::<u32>() | 1;
            probe.set(h);
        }
        h
    })
}

/// Rehashes the probe after a collision, so the thread tries a different cell next time.
fn advance_probe(mut h: u32) -> u32 {
    h ^= h << 13;
    h ^= h >> 17;
    h ^= h << 5;
    PROBE.with(|probe| probe.set(h));
    h
}

impl LongAdder {
    pub(crate) fn add(&self, value: isize, guard: &Guard) {
        let cells = self.cells.load(Ordering::SeqCst, guard);
        let base = self.base.load(Ordering::SeqCst);
        if !cells.is_null()
            || self
                .base
                .compare_exchange(base, base + value, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
        {
            if cells.is_null() {
                self.accumulate(value, true, guard);
                return;
            }

            // safety: the cells array is valid because once allocated it is only replaced by a
            // larger one, and replaced arrays are reclaimed through the guard's epoch
            let cells = unsafe { cells.deref() };
            let c = &cells[(probe() as usize) & (cells.len() - 1)];
            let cv = c.load(Ordering::SeqCst);
            let uncontended = c
                .compare_exchange(cv, cv + value, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            if !uncontended {
                self.accumulate(value, uncontended, guard);
            }
        }
    }

    fn accumulate(&self, value: isize, mut uncontended: bool, guard: &Guard) {
        let mut h = probe();
        let mut collide = false;
        loop {
            let cells = self.cells.load(Ordering::SeqCst, guard);
            if !cells.is_null() {
                if !uncontended {
                    // freshly arrived from a failed CAS; rehash and retry before escalating
                    uncontended = true;
                    h = advance_probe(h);
                    continue;
                }

                // safety: as in `add`
                let cells = unsafe { cells.deref() };
                let c = &cells[(h as usize) & (cells.len() - 1)];
                let cv = c.load(Ordering::SeqCst);
                if c.compare_exchange(cv, cv + value, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }

                if cells.len() >= cell_bound() {
                    // at the cell limit; keep rehashing until a cell frees up
                    collide = false;
                    h = advance_probe(h);
                    continue;
                }

                if !collide {
                    collide = true;
                    h = advance_probe(h);
                    continue;
                }

                if self
                    .cells_busy
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    // repeated collisions on distinct probes; double the cell array
                    if self.cells.load(Ordering::SeqCst, guard).as_raw()
                        == cells as *const Vec<AtomicIsize>
                    {
                        let new_len = cells.len() << 1;
                        let mut new_cells = Vec::with_capacity(new_len);
                        for cell in cells {
                            new_cells.push(AtomicIsize::new(cell.load(Ordering::SeqCst)));
                        }
                        for _ in cells.len()..new_len {
                            new_cells.push(AtomicIsize::new(0));
                        }
                        let now_garbage =
                            self.cells
                                .swap(Owned::new(new_cells), Ordering::SeqCst, guard);
                        // safety: threads that still hold a reference to the old array read it
                        // under an epoch no later than ours, so it is not freed until they
                        // unpin
                        unsafe { guard.defer_destroy(now_garbage) };
                    }
                    self.cells_busy.store(false, Ordering::SeqCst);
                    collide = false;
                    continue;
                }

                h = advance_probe(h);
            } else if self
                .cells_busy
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                // we get to allocate the initial cells
                if self.cells.load(Ordering::SeqCst, guard).is_null() {
                    let init = vec![AtomicIsize::new(0), AtomicIsize::new(0)];
                    init[(h as usize) & 1].store(value, Ordering::SeqCst);
                    self.cells.store(Owned::new(init), Ordering::SeqCst);
                    self.cells_busy.store(false, Ordering::SeqCst);
                    break;
                }
                self.cells_busy.store(false, Ordering::SeqCst);
            } else {
                // another thread is allocating; fall back on the base
                let base = self.base.load(Ordering::SeqCst);
                if self
                    .base
                    .compare_exchange(base, base + value, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
        }
    }

    pub(crate) fn sum(&self, guard: &Guard) -> isize {
        let cells = self.cells.load(Ordering::SeqCst, guard);
        let base = self.base.load(Ordering::SeqCst);
        if cells.is_null() {
            return base;
        }

        // safety: as in `add`
        let cells: isize = unsafe { cells.deref() }
            .iter()
            .map(|c| c.load(Ordering::SeqCst))
            .sum();
        base + cells
    }
}

/// The largest cell array we will grow to.
fn cell_bound() -> usize {
    crate::map::num_cpus().next_power_of_two()
}

impl Drop for LongAdder {
    fn drop(&mut self) {
        // safety: we have &mut self, so no other thread can be using the cells
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let cells = self.cells.swap(Shared::null(), Ordering::SeqCst, guard);
        if cells.is_null() {
            return;
        }
        // safety: as above, and the cells were never handed out beyond a borrow
        drop(unsafe { cells.into_owned() });
    }
}
