// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Allocation-free queue structures used by the kernel scheduler.
//!
//! Everything in here is generic over the node type, so that it can be tested
//! on the host without dragging in the rest of the kernel. Nodes live in a
//! caller-owned slice (in the kernel, the thread table) and are named by their
//! index in that slice. Each node embeds one [`Link`] per list it can be a
//! member of; an [`Adapter`] tells a [`List`] which embedded link to use.
//!
//! A node's `Link` records whether it is currently linked. This is what makes
//! removal idempotent: removing a node that has already been removed (say, by
//! a timeout that raced a signal) is a cheap no-op that returns `false`.

// Allow std-y things to be used in test. Note that this attribute is a bit of a
// trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]
#![forbid(clippy::wildcard_imports)]

use core::marker::PhantomData;

/// Largest node index that can be stored in a `Link`.
pub const MAX_NODE_INDEX: usize = u16::MAX as usize;

/// Intrusive doubly-linked list fields, embedded in each node.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Link {
    prev: Option<u16>,
    next: Option<u16>,
    linked: bool,
}

impl Link {
    pub const UNLINKED: Self = Self {
        prev: None,
        next: None,
        linked: false,
    };

    /// Checks whether the node owning this link is currently on a list.
    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub fn next(&self) -> Option<usize> {
        self.next.map(usize::from)
    }

    pub fn prev(&self) -> Option<usize> {
        self.prev.map(usize::from)
    }
}

/// Selects which embedded `Link` a list threads through.
///
/// A node type that can sit on two lists at once (a thread can be on a wait
/// queue and on the timeout queue, for instance) has two links and two
/// adapters.
pub trait Adapter {
    type Node;

    fn link(node: &Self::Node) -> &Link;
    fn link_mut(node: &mut Self::Node) -> &mut Link;
}

/// A doubly-linked list of nodes held in an external slice.
///
/// The list itself is only a head, a tail and a count; the caller passes the
/// node slice into every operation. Passing a different slice than the one
/// the list was built over is a logic error and will corrupt the list (but
/// not memory).
pub struct List<A> {
    head: Option<u16>,
    tail: Option<u16>,
    len: u16,
    _adapter: PhantomData<fn() -> A>,
}

// Written by hand because derive would demand `A: Clone`, and `A` is only a
// marker.
impl<A> Clone for List<A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A> Copy for List<A> {}

impl<A: Adapter> Default for List<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> core::fmt::Debug for List<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("List")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("len", &self.len)
            .finish()
    }
}

impl<A: Adapter> List<A> {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            _adapter: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn head(&self) -> Option<usize> {
        self.head.map(usize::from)
    }

    pub fn tail(&self) -> Option<usize> {
        self.tail.map(usize::from)
    }

    /// Appends node `i` at the tail.
    ///
    /// # Panics
    ///
    /// If node `i` is already linked somewhere. That would indicate that a
    /// queue invariant has been lost, and carrying on would corrupt two lists.
    pub fn push_back(&mut self, nodes: &mut [A::Node], i: usize) {
        let ix = checked_index(i);
        let old_tail = self.tail;
        {
            let link = A::link_mut(&mut nodes[i]);
            assert!(!link.linked, "node {i} is already on a list");
            *link = Link {
                prev: old_tail,
                next: None,
                linked: true,
            };
        }
        match old_tail {
            Some(t) => A::link_mut(&mut nodes[usize::from(t)]).next = Some(ix),
            None => self.head = Some(ix),
        }
        self.tail = Some(ix);
        self.len += 1;
    }

    /// Prepends node `i` at the head.
    ///
    /// # Panics
    ///
    /// If node `i` is already linked somewhere.
    pub fn push_front(&mut self, nodes: &mut [A::Node], i: usize) {
        match self.head() {
            Some(h) => self.link_before(nodes, i, h),
            None => self.push_back(nodes, i),
        }
    }

    /// Inserts node `i` ahead of the first node `n` for which
    /// `goes_before(&nodes[i], &nodes[n])` is true, or at the tail if there is
    /// no such node.
    ///
    /// Because the comparison is only asked whether `i` belongs *strictly*
    /// before `n`, nodes that compare equal keep their insertion order.
    pub fn insert_by(
        &mut self,
        nodes: &mut [A::Node],
        i: usize,
        goes_before: impl Fn(&A::Node, &A::Node) -> bool,
    ) {
        let mut cursor = self.head();
        while let Some(c) = cursor {
            if goes_before(&nodes[i], &nodes[c]) {
                self.link_before(nodes, i, c);
                return;
            }
            cursor = A::link(&nodes[c]).next();
        }
        self.push_back(nodes, i);
    }

    /// Removes node `i` from this list.
    ///
    /// Returns `false`, and changes nothing, if `i` is not linked. The node
    /// must otherwise be a member of *this* list.
    pub fn remove(&mut self, nodes: &mut [A::Node], i: usize) -> bool {
        let link = *A::link(&nodes[i]);
        if !link.linked {
            return false;
        }
        match link.prev {
            Some(p) => A::link_mut(&mut nodes[usize::from(p)]).next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(n) => A::link_mut(&mut nodes[usize::from(n)]).prev = link.prev,
            None => self.tail = link.prev,
        }
        *A::link_mut(&mut nodes[i]) = Link::UNLINKED;
        self.len -= 1;
        true
    }

    /// Unlinks and returns the head node, if any.
    pub fn pop_front(&mut self, nodes: &mut [A::Node]) -> Option<usize> {
        let h = self.head()?;
        self.remove(nodes, h);
        Some(h)
    }

    /// Walks the list and checks whether `i` is on it. This is O(n) and
    /// intended for consistency checks, not the hot path.
    pub fn contains(&self, nodes: &[A::Node], i: usize) -> bool {
        self.iter(nodes).any(|n| n == i)
    }

    pub fn iter<'n>(&self, nodes: &'n [A::Node]) -> Iter<'n, A> {
        Iter {
            nodes,
            cursor: self.head(),
        }
    }

    fn link_before(&mut self, nodes: &mut [A::Node], i: usize, before: usize) {
        let ix = checked_index(i);
        let prev = A::link(&nodes[before]).prev;
        {
            let link = A::link_mut(&mut nodes[i]);
            assert!(!link.linked, "node {i} is already on a list");
            *link = Link {
                prev,
                next: Some(checked_index(before)),
                linked: true,
            };
        }
        A::link_mut(&mut nodes[before]).prev = Some(ix);
        match prev {
            Some(p) => A::link_mut(&mut nodes[usize::from(p)]).next = Some(ix),
            None => self.head = Some(ix),
        }
        self.len += 1;
    }
}

fn checked_index(i: usize) -> u16 {
    assert!(i <= MAX_NODE_INDEX);
    i as u16
}

/// Iterator over the node indices of a `List`, head first.
pub struct Iter<'n, A: Adapter> {
    nodes: &'n [A::Node],
    cursor: Option<usize>,
}

impl<A: Adapter> Iterator for Iter<'_, A> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let c = self.cursor?;
        self.cursor = A::link(&self.nodes[c]).next();
        Some(c)
    }
}

/// One bit per priority level; bit 0 is the most important level.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct PriorityBitmap(u64);

impl PriorityBitmap {
    /// Number of levels a bitmap can track.
    pub const LEVELS: usize = 64;

    pub const fn new() -> Self {
        Self(0)
    }

    pub fn set(&mut self, level: usize) {
        self.0 |= 1 << level;
    }

    pub fn clear(&mut self, level: usize) {
        self.0 &= !(1 << level);
    }

    pub fn contains(&self, level: usize) -> bool {
        self.0 & (1 << level) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns the most important (lowest-numbered) set level.
    pub fn first(&self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }
}

/// Runnable nodes, one FIFO list per priority level.
///
/// Level 0 is the most important. The head of the most important non-empty
/// level is cached after every mutation, so `peek` is a load.
pub struct ReadyQueue<A, const LEVELS: usize> {
    levels: [List<A>; LEVELS],
    occupied: PriorityBitmap,
    head: Option<u16>,
}

impl<A: Adapter, const LEVELS: usize> Default for ReadyQueue<A, LEVELS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Adapter, const LEVELS: usize> ReadyQueue<A, LEVELS> {
    pub const fn new() -> Self {
        assert!(LEVELS <= PriorityBitmap::LEVELS);
        Self {
            levels: [List::new(); LEVELS],
            occupied: PriorityBitmap::new(),
            head: None,
        }
    }

    /// Makes `i` runnable at `level`, behind any peers already there.
    pub fn push_back(&mut self, nodes: &mut [A::Node], level: usize, i: usize) {
        self.levels[level].push_back(nodes, i);
        self.occupied.set(level);
        self.refresh();
    }

    /// Makes `i` runnable at `level`, ahead of any peers already there. This
    /// is how a preempted node keeps its turn.
    pub fn push_front(&mut self, nodes: &mut [A::Node], level: usize, i: usize) {
        self.levels[level].push_front(nodes, i);
        self.occupied.set(level);
        self.refresh();
    }

    /// Removes `i`, which was queued at `level`. Returns `false` if it was not
    /// linked.
    pub fn remove(
        &mut self,
        nodes: &mut [A::Node],
        level: usize,
        i: usize,
    ) -> bool {
        let removed = self.levels[level].remove(nodes, i);
        if self.levels[level].is_empty() {
            self.occupied.clear(level);
        }
        self.refresh();
        removed
    }

    /// The node that should run next, if any.
    pub fn peek(&self) -> Option<usize> {
        self.head.map(usize::from)
    }

    /// Removes and returns the node that should run next.
    pub fn pop(&mut self, nodes: &mut [A::Node]) -> Option<usize> {
        let level = self.occupied.first()?;
        let i = self.levels[level].head()?;
        self.remove(nodes, level, i);
        Some(i)
    }

    /// Most important level with anything on it.
    pub fn highest_level(&self) -> Option<usize> {
        self.occupied.first()
    }

    pub fn level_len(&self, level: usize) -> usize {
        self.levels[level].len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied.is_empty()
    }

    pub fn iter_level<'n>(
        &self,
        nodes: &'n [A::Node],
        level: usize,
    ) -> Iter<'n, A> {
        self.levels[level].iter(nodes)
    }

    pub fn contains(&self, nodes: &[A::Node], i: usize) -> bool {
        self.levels.iter().any(|l| l.contains(nodes, i))
    }

    fn refresh(&mut self) {
        self.head = self
            .occupied
            .first()
            .and_then(|level| self.levels[level].head)
    }
}

#[cfg(test)]
mod tests {
    use super::{Adapter, Link, List, PriorityBitmap, ReadyQueue};
    use proptest::prelude::*;
    use proptest_derive::Arbitrary;
    use std::collections::VecDeque;

    #[derive(Debug, Default)]
    struct Node {
        key: u8,
        link: Link,
    }

    struct ByLink;

    impl Adapter for ByLink {
        type Node = Node;
        fn link(node: &Node) -> &Link {
            &node.link
        }
        fn link_mut(node: &mut Node) -> &mut Link {
            &mut node.link
        }
    }

    fn nodes(keys: &[u8]) -> Vec<Node> {
        keys.iter()
            .map(|&key| Node {
                key,
                link: Link::UNLINKED,
            })
            .collect()
    }

    fn collect(list: &List<ByLink>, nodes: &[Node]) -> Vec<usize> {
        list.iter(nodes).collect()
    }

    #[test]
    fn push_back_is_fifo() {
        let mut n = nodes(&[0; 4]);
        let mut list = List::<ByLink>::new();
        for i in [2, 0, 3, 1] {
            list.push_back(&mut n, i);
        }
        assert_eq!(collect(&list, &n), [2, 0, 3, 1]);
        assert_eq!(list.len(), 4);
        assert_eq!(list.head(), Some(2));
        assert_eq!(list.tail(), Some(1));
    }

    #[test]
    fn push_front_goes_to_head() {
        let mut n = nodes(&[0; 3]);
        let mut list = List::<ByLink>::new();
        list.push_front(&mut n, 0);
        list.push_back(&mut n, 1);
        list.push_front(&mut n, 2);
        assert_eq!(collect(&list, &n), [2, 0, 1]);
    }

    #[test]
    fn remove_from_each_position() {
        for victim in 0..3 {
            let mut n = nodes(&[0; 3]);
            let mut list = List::<ByLink>::new();
            for i in 0..3 {
                list.push_back(&mut n, i);
            }
            assert!(list.remove(&mut n, victim));
            let expected: Vec<usize> =
                (0..3).filter(|&i| i != victim).collect();
            assert_eq!(
                collect(&list, &n),
                expected,
                "removing node {victim} left the list in the wrong shape",
            );
            assert!(!n[victim].link.is_linked());
            assert_eq!(list.len(), 2);
        }
    }

    #[test]
    fn second_remove_is_a_no_op() {
        let mut n = nodes(&[0; 2]);
        let mut list = List::<ByLink>::new();
        list.push_back(&mut n, 0);
        list.push_back(&mut n, 1);
        assert!(list.remove(&mut n, 0));
        assert!(
            !list.remove(&mut n, 0),
            "removing an unlinked node should report false",
        );
        assert_eq!(collect(&list, &n), [1]);
        assert_eq!(list.len(), 1);
    }

    #[test]
    #[should_panic]
    fn double_link_panics() {
        let mut n = nodes(&[0; 1]);
        let mut list = List::<ByLink>::new();
        list.push_back(&mut n, 0);
        list.push_back(&mut n, 0);
    }

    #[test]
    fn insert_by_keeps_equal_keys_in_arrival_order() {
        // keys:        0  1  2  3  4  5
        let mut n = nodes(&[5, 3, 5, 1, 3, 9]);
        let mut list = List::<ByLink>::new();
        for i in 0..n.len() {
            list.insert_by(&mut n, i, |a, b| a.key < b.key);
        }
        assert_eq!(collect(&list, &n), [3, 1, 4, 0, 2, 5]);
    }

    #[test]
    fn pop_front_drains_in_order() {
        let mut n = nodes(&[0; 3]);
        let mut list = List::<ByLink>::new();
        for i in 0..3 {
            list.push_back(&mut n, i);
        }
        assert_eq!(list.pop_front(&mut n), Some(0));
        assert_eq!(list.pop_front(&mut n), Some(1));
        assert_eq!(list.pop_front(&mut n), Some(2));
        assert_eq!(list.pop_front(&mut n), None);
        assert!(list.is_empty());
    }

    #[test]
    fn bitmap_first_is_lowest_level() {
        let mut b = PriorityBitmap::new();
        assert_eq!(b.first(), None);
        b.set(40);
        b.set(7);
        b.set(63);
        assert_eq!(b.first(), Some(7));
        b.clear(7);
        assert_eq!(b.first(), Some(40));
        assert!(b.contains(63));
        assert!(!b.contains(7));
    }

    #[test]
    fn ready_queue_peeks_most_important_earliest() {
        let mut n = nodes(&[0; 5]);
        let mut rq = ReadyQueue::<ByLink, 8>::new();
        rq.push_back(&mut n, 5, 0);
        rq.push_back(&mut n, 3, 1);
        rq.push_back(&mut n, 3, 2);
        rq.push_back(&mut n, 7, 3);
        assert_eq!(rq.peek(), Some(1));
        rq.remove(&mut n, 3, 1);
        assert_eq!(rq.peek(), Some(2));
        rq.remove(&mut n, 3, 2);
        assert_eq!(rq.peek(), Some(0));
        assert_eq!(rq.highest_level(), Some(5));
        rq.push_front(&mut n, 5, 4);
        assert_eq!(rq.peek(), Some(4));
        assert_eq!(rq.pop(&mut n), Some(4));
        assert_eq!(rq.pop(&mut n), Some(0));
        assert_eq!(rq.pop(&mut n), Some(3));
        assert_eq!(rq.pop(&mut n), None);
        assert!(rq.is_empty());
    }

    const NODES: usize = 8;
    const LEVELS: usize = 4;

    #[derive(Debug, Clone, Arbitrary)]
    enum Op {
        PushBack(
            #[proptest(strategy = "0..NODES")] usize,
            #[proptest(strategy = "0..LEVELS")] usize,
        ),
        PushFront(
            #[proptest(strategy = "0..NODES")] usize,
            #[proptest(strategy = "0..LEVELS")] usize,
        ),
        Remove(#[proptest(strategy = "0..NODES")] usize),
        Pop,
    }

    proptest! {
        /// Drives a ready queue and a naive model side by side and checks that
        /// `peek` always agrees with "lowest level, earliest arrival".
        #[test]
        fn ready_queue_matches_model(ops in proptest::collection::vec(any::<Op>(), 0..64)) {
            let mut n = nodes(&[0; NODES]);
            let mut rq = ReadyQueue::<ByLink, LEVELS>::new();
            let mut model: Vec<VecDeque<usize>> = vec![VecDeque::new(); LEVELS];
            let mut level_of: [Option<usize>; NODES] = [None; NODES];

            for op in ops {
                match op {
                    Op::PushBack(i, level) if level_of[i].is_none() => {
                        rq.push_back(&mut n, level, i);
                        model[level].push_back(i);
                        level_of[i] = Some(level);
                    }
                    Op::PushFront(i, level) if level_of[i].is_none() => {
                        rq.push_front(&mut n, level, i);
                        model[level].push_front(i);
                        level_of[i] = Some(level);
                    }
                    Op::Remove(i) => {
                        let was_queued = level_of[i].is_some();
                        let level = level_of[i].unwrap_or(0);
                        prop_assert_eq!(rq.remove(&mut n, level, i), was_queued);
                        model[level].retain(|&x| x != i);
                        level_of[i] = None;
                    }
                    Op::Pop => {
                        let expected = model.iter_mut().find_map(|q| q.pop_front());
                        prop_assert_eq!(rq.pop(&mut n), expected);
                        if let Some(i) = expected {
                            level_of[i] = None;
                        }
                    }
                    _ => {}
                }
                let expected = model.iter().find_map(|q| q.front().copied());
                prop_assert_eq!(rq.peek(), expected);
                for (level, q) in model.iter().enumerate() {
                    let got: Vec<usize> = rq.iter_level(&n, level).collect();
                    let want: Vec<usize> = q.iter().copied().collect();
                    prop_assert_eq!(got, want, "level {} diverged", level);
                }
            }
        }
    }
}
