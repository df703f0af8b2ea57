//! In-place sorting over an index permutation
//!
//! Three-way quicksort (many equal keys are common in grouping workloads)
//! with median-of-three pivots, insertion sort for short ranges and a
//! heapsort fallback once recursion gets too deep.

use std::cmp::Ordering;

/// Something that can be sorted by comparing and swapping positions
pub trait IndexedSortable {
    fn compare(&mut self, i: usize, j: usize) -> Ordering;
    fn swap(&mut self, i: usize, j: usize);
    fn size(&self) -> usize;
}

/// Ranges shorter than this are insertion sorted
const INSERTION_THRESHOLD: usize = 13;

/// Sort all positions of `sortable`
pub fn sort<S: IndexedSortable + ?Sized>(sortable: &mut S) {
    let n = sortable.size();
    if n < 2 {
        return;
    }
    let max_depth = 2 * (usize::BITS - n.leading_zeros()) as usize;
    sort_range(sortable, 0, n, max_depth);
}

fn sort_range<S: IndexedSortable + ?Sized>(s: &mut S, mut lo: usize, mut hi: usize, mut depth: usize) {
    loop {
        if hi - lo < INSERTION_THRESHOLD {
            insertion_sort(s, lo, hi);
            return;
        }
        if depth == 0 {
            heap_sort(s, lo, hi);
            return;
        }
        depth -= 1;

        let (lt, gt) = partition(s, lo, hi);

        // Recurse into the smaller side, loop on the larger one
        if lt - lo < hi - gt {
            sort_range(s, lo, lt, depth);
            lo = gt;
        } else {
            sort_range(s, gt, hi, depth);
            hi = lt;
        }
    }
}

/// Dijkstra partition around a median-of-three pivot
///
/// Afterwards `[lo, lt)` < pivot, `[lt, gt)` == pivot, `[gt, hi)` > pivot.
fn partition<S: IndexedSortable + ?Sized>(s: &mut S, lo: usize, hi: usize) -> (usize, usize) {
    let mid = lo + (hi - lo) / 2;
    let last = hi - 1;
    if s.compare(mid, lo) == Ordering::Less {
        s.swap(mid, lo);
    }
    if s.compare(last, lo) == Ordering::Less {
        s.swap(last, lo);
    }
    if s.compare(last, mid) == Ordering::Less {
        s.swap(last, mid);
    }
    s.swap(lo, mid);

    // s[lt] always holds an element equal to the pivot
    let mut lt = lo;
    let mut i = lo + 1;
    let mut gt = hi;
    while i < gt {
        match s.compare(i, lt) {
            Ordering::Less => {
                s.swap(lt, i);
                lt += 1;
                i += 1;
            }
            Ordering::Greater => {
                gt -= 1;
                s.swap(i, gt);
            }
            Ordering::Equal => i += 1,
        }
    }
    (lt, gt)
}

fn insertion_sort<S: IndexedSortable + ?Sized>(s: &mut S, lo: usize, hi: usize) {
    for i in lo + 1..hi {
        let mut j = i;
        while j > lo && s.compare(j, j - 1) == Ordering::Less {
            s.swap(j, j - 1);
            j -= 1;
        }
    }
}

fn heap_sort<S: IndexedSortable + ?Sized>(s: &mut S, lo: usize, hi: usize) {
    let n = hi - lo;
    for root in (0..n / 2).rev() {
        sift_down(s, lo, root, n);
    }
    for end in (1..n).rev() {
        s.swap(lo, lo + end);
        sift_down(s, lo, 0, end);
    }
}

fn sift_down<S: IndexedSortable + ?Sized>(s: &mut S, lo: usize, mut root: usize, n: usize) {
    loop {
        let mut child = 2 * root + 1;
        if child >= n {
            return;
        }
        if child + 1 < n && s.compare(lo + child, lo + child + 1) == Ordering::Less {
            child += 1;
        }
        if s.compare(lo + root, lo + child) != Ordering::Less {
            return;
        }
        s.swap(lo + root, lo + child);
        root = child;
    }
}
