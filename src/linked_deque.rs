//! FIFO queue with O(1) removal of arbitrary nodes

use slab::Slab;

/// Handle to a node previously pushed onto a [`LinkedDeque`].
///
/// Handles carry a generation so a stale handle never removes a node that
/// later reused the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeHandle {
    key: usize,
    generation: u64,
}

struct Node<T> {
    value: T,
    generation: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

pub(crate) struct LinkedDeque<T> {
    nodes: Slab<Node<T>>,
    head: Option<usize>,
    tail: Option<usize>,
    generation: u64,
}

impl<T> LinkedDeque<T> {
    pub fn new() -> Self {
        Self {
            nodes: Slab::new(),
            head: None,
            tail: None,
            generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn push_back(&mut self, value: T) -> NodeHandle {
        self.generation += 1;
        let key = self.nodes.insert(Node {
            value,
            generation: self.generation,
            prev: self.tail,
            next: None,
        });
        match self.tail.and_then(|tail| self.nodes.get_mut(tail)) {
            Some(tail) => tail.next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
        NodeHandle {
            key,
            generation: self.generation,
        }
    }

    pub fn pop_front(&mut self) -> Option<T> {
        let head = self.head?;
        self.unlink(head)
    }

    /// Removes the node behind `handle` if it is still queued.
    pub fn remove(&mut self, handle: NodeHandle) -> Option<T> {
        match self.nodes.get(handle.key) {
            Some(node) if node.generation == handle.generation => self.unlink(handle.key),
            _ => None,
        }
    }

    pub fn drain(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.len());
        while let Some(value) = self.pop_front() {
            drained.push(value);
        }
        drained
    }

    fn unlink(&mut self, key: usize) -> Option<T> {
        let node = self.nodes.try_remove(key)?;
        match node.prev.and_then(|prev| self.nodes.get_mut(prev)) {
            Some(prev) => prev.next = node.next,
            None => self.head = node.next,
        }
        match node.next.and_then(|next| self.nodes.get_mut(next)) {
            Some(next) => next.prev = node.prev,
            None => self.tail = node.prev,
        }
        Some(node.value)
    }
}
