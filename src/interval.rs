//! Intervals and interval sets over ordered values.
//!
//! Row ranges, column ranges and time ranges are all expressed as
//! [`Interval`]s built on [`std::ops::Bound`]. An [`IntervalSet`] is a sorted
//! list of disjoint intervals that coalesces on insert.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;

/// A possibly unbounded interval.
#[derive(Clone, PartialEq, Eq)]
pub struct Interval<T> {
    lower: Bound<T>,
    upper: Bound<T>,
}

impl<T: fmt::Debug> fmt::Debug for Interval<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.lower {
            Bound::Included(v) => write!(f, "[{:?}", v)?,
            Bound::Excluded(v) => write!(f, "({:?}", v)?,
            Bound::Unbounded => write!(f, "(<<")?,
        }
        write!(f, ", ")?;
        match &self.upper {
            Bound::Included(v) => write!(f, "{:?}]", v),
            Bound::Excluded(v) => write!(f, "{:?})", v),
            Bound::Unbounded => write!(f, ">>)"),
        }
    }
}

impl<T: Ord + Clone> Interval<T> {
    /// Build an interval from explicit bounds.
    pub fn new(lower: Bound<T>, upper: Bound<T>) -> Self {
        Self { lower, upper }
    }

    /// The interval containing everything.
    pub fn all() -> Self {
        Self { lower: Bound::Unbounded, upper: Bound::Unbounded }
    }

    /// `[lo, hi]`
    pub fn closed(lo: T, hi: T) -> Self {
        Self { lower: Bound::Included(lo), upper: Bound::Included(hi) }
    }

    /// `[lo, hi)`
    pub fn half_open(lo: T, hi: T) -> Self {
        Self { lower: Bound::Included(lo), upper: Bound::Excluded(hi) }
    }

    /// `[v, v]`
    pub fn point(v: T) -> Self {
        Self { lower: Bound::Included(v.clone()), upper: Bound::Included(v) }
    }

    /// Everything at or after `v`.
    pub fn at_least(v: T) -> Self {
        Self { lower: Bound::Included(v), upper: Bound::Unbounded }
    }

    /// Lower bound.
    pub fn lower(&self) -> &Bound<T> {
        &self.lower
    }

    /// Upper bound.
    pub fn upper(&self) -> &Bound<T> {
        &self.upper
    }

    /// Replace the lower bound.
    pub fn with_lower(mut self, lower: Bound<T>) -> Self {
        self.lower = lower;
        self
    }

    /// Replace the upper bound.
    pub fn with_upper(mut self, upper: Bound<T>) -> Self {
        self.upper = upper;
        self
    }

    /// True if the interval contains no values.
    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
            (Bound::Included(lo), Bound::Excluded(hi))
            | (Bound::Excluded(lo), Bound::Included(hi))
            | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
            _ => false,
        }
    }

    /// True if the interval is unbounded on both sides.
    pub fn is_infinite(&self) -> bool {
        matches!((&self.lower, &self.upper), (Bound::Unbounded, Bound::Unbounded))
    }

    /// True if `v` lies within the interval.
    pub fn contains(&self, v: &T) -> bool {
        let above = match &self.lower {
            Bound::Included(lo) => v >= lo,
            Bound::Excluded(lo) => v > lo,
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(hi) => v <= hi,
            Bound::Excluded(hi) => v < hi,
            Bound::Unbounded => true,
        };
        above && below
    }

    /// Intersection of two intervals (possibly empty).
    pub fn intersect(&self, other: &Self) -> Self {
        let lower = if cmp_lower(&self.lower, &other.lower) == Ordering::Less {
            other.lower.clone()
        } else {
            self.lower.clone()
        };
        let upper = if cmp_upper(&self.upper, &other.upper) == Ordering::Greater {
            other.upper.clone()
        } else {
            self.upper.clone()
        };
        Self { lower, upper }
    }

    /// True if the intervals share at least one value.
    pub fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty() && !other.is_empty() && !self.intersect(other).is_empty()
    }

    /// True if every value of `other` is inside `self`.
    pub fn contains_interval(&self, other: &Self) -> bool {
        if other.is_empty() {
            return true;
        }
        cmp_lower(&self.lower, &other.lower) != Ordering::Greater
            && cmp_upper(&self.upper, &other.upper) != Ordering::Less
    }

    /// The lower bound starting immediately after this interval's upper
    /// bound, or `None` if the interval is unbounded above.
    pub fn upper_adjacent_complement(&self) -> Option<Bound<T>> {
        match &self.upper {
            Bound::Included(v) => Some(Bound::Excluded(v.clone())),
            Bound::Excluded(v) => Some(Bound::Included(v.clone())),
            Bound::Unbounded => None,
        }
    }

    /// True if a range starting at `lower` starts inside this interval.
    pub fn admits_lower(&self, lower: &Bound<T>) -> bool {
        cmp_lower(&self.lower, lower) != Ordering::Greater
            && !Interval::new(lower.clone(), self.upper.clone()).is_empty()
    }

    /// Compare lower bounds.
    pub fn cmp_lower(&self, other: &Self) -> Ordering {
        cmp_lower(&self.lower, &other.lower)
    }
}

/// Order two lower bounds. `Unbounded` sorts first; `Included(x)` sorts
/// before `Excluded(x)`.
pub fn cmp_lower<T: Ord>(a: &Bound<T>, b: &Bound<T>) -> Ordering {
    match (a, b) {
        (Bound::Unbounded, Bound::Unbounded) => Ordering::Equal,
        (Bound::Unbounded, _) => Ordering::Less,
        (_, Bound::Unbounded) => Ordering::Greater,
        (Bound::Included(x), Bound::Included(y)) | (Bound::Excluded(x), Bound::Excluded(y)) => {
            x.cmp(y)
        }
        (Bound::Included(x), Bound::Excluded(y)) => x.cmp(y).then(Ordering::Less),
        (Bound::Excluded(x), Bound::Included(y)) => x.cmp(y).then(Ordering::Greater),
    }
}

/// Order two upper bounds. `Unbounded` sorts last; `Excluded(x)` sorts
/// before `Included(x)`.
pub fn cmp_upper<T: Ord>(a: &Bound<T>, b: &Bound<T>) -> Ordering {
    match (a, b) {
        (Bound::Unbounded, Bound::Unbounded) => Ordering::Equal,
        (Bound::Unbounded, _) => Ordering::Greater,
        (_, Bound::Unbounded) => Ordering::Less,
        (Bound::Included(x), Bound::Included(y)) | (Bound::Excluded(x), Bound::Excluded(y)) => {
            x.cmp(y)
        }
        (Bound::Included(x), Bound::Excluded(y)) => x.cmp(y).then(Ordering::Greater),
        (Bound::Excluded(x), Bound::Included(y)) => x.cmp(y).then(Ordering::Less),
    }
}

/// True if there is at least one value strictly between an upper bound and
/// a following lower bound, i.e. the two intervals neither overlap nor touch.
fn gap_between<T: Ord>(upper: &Bound<T>, lower: &Bound<T>) -> bool {
    match (upper, lower) {
        (Bound::Unbounded, _) | (_, Bound::Unbounded) => false,
        (Bound::Excluded(u), Bound::Excluded(l)) => l >= u,
        (Bound::Included(u), Bound::Included(l))
        | (Bound::Included(u), Bound::Excluded(l))
        | (Bound::Excluded(u), Bound::Included(l)) => l > u,
    }
}

/// A sorted set of disjoint intervals.
#[derive(Clone, PartialEq, Eq)]
pub struct IntervalSet<T> {
    intervals: Vec<Interval<T>>,
}

impl<T: fmt::Debug> fmt::Debug for IntervalSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.intervals.iter()).finish()
    }
}

impl<T: Ord + Clone> Default for IntervalSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Clone> IntervalSet<T> {
    /// An empty set.
    pub fn new() -> Self {
        Self { intervals: Vec::new() }
    }

    /// A set holding every value.
    pub fn all() -> Self {
        Self { intervals: vec![Interval::all()] }
    }

    /// A set holding a single interval.
    pub fn from_interval(interval: Interval<T>) -> Self {
        let mut set = Self::new();
        set.add(interval);
        set
    }

    /// True if the set holds no values.
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Iterate over the disjoint intervals in ascending order.
    pub fn iter(&self) -> std::slice::Iter<'_, Interval<T>> {
        self.intervals.iter()
    }

    /// Number of disjoint intervals.
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// Union an interval into the set.
    pub fn add(&mut self, interval: Interval<T>) {
        if interval.is_empty() {
            return;
        }
        let mut merged = interval;
        let mut out = Vec::with_capacity(self.intervals.len() + 1);
        let mut placed = false;
        for existing in self.intervals.drain(..) {
            if placed {
                out.push(existing);
            } else if gap_between(&existing.upper, &merged.lower) {
                out.push(existing);
            } else if gap_between(&merged.upper, &existing.lower) {
                out.push(merged.clone());
                out.push(existing);
                placed = true;
            } else {
                if cmp_lower(&existing.lower, &merged.lower) == Ordering::Less {
                    merged.lower = existing.lower;
                }
                if cmp_upper(&existing.upper, &merged.upper) == Ordering::Greater {
                    merged.upper = existing.upper;
                }
            }
        }
        if !placed {
            out.push(merged);
        }
        self.intervals = out;
    }

    /// Union another set into this one.
    pub fn add_set(&mut self, other: &Self) {
        for interval in &other.intervals {
            self.add(interval.clone());
        }
    }

    /// Restrict the set to values inside `interval`.
    pub fn clip(&mut self, interval: &Interval<T>) {
        self.intervals = self
            .intervals
            .iter()
            .map(|i| i.intersect(interval))
            .filter(|i| !i.is_empty())
            .collect();
    }

    /// Return a copy restricted to `interval`.
    pub fn clipped(&self, interval: &Interval<T>) -> Self {
        let mut copy = self.clone();
        copy.clip(interval);
        copy
    }

    /// Intersect with another set.
    pub fn intersect(&self, other: &Self) -> Self {
        let mut out = Self::new();
        for a in &self.intervals {
            for b in &other.intervals {
                out.add(a.intersect(b));
            }
        }
        out
    }

    /// True if `v` is in the set.
    pub fn contains(&self, v: &T) -> bool {
        self.intervals.iter().any(|i| i.contains(v))
    }

    /// True if any member interval overlaps `interval`.
    pub fn overlaps(&self, interval: &Interval<T>) -> bool {
        self.intervals.iter().any(|i| i.overlaps(interval))
    }

    /// The lowest lower bound in the set.
    pub fn lowest_bound(&self) -> Option<&Bound<T>> {
        self.intervals.first().map(|i| &i.lower)
    }

    /// The first interval in the set.
    pub fn first(&self) -> Option<&Interval<T>> {
        self.intervals.first()
    }
}

impl<T: Ord + Clone> FromIterator<Interval<T>> for IntervalSet<T> {
    fn from_iter<I: IntoIterator<Item = Interval<T>>>(iter: I) -> Self {
        let mut set = Self::new();
        for interval in iter {
            set.add(interval);
        }
        set
    }
}
