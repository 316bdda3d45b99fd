// lru.rs - Arena-backed doubly linked list for recency ordering

/// Node of the list. `prev` points towards the head (more recent).
struct Node<T> {
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly linked list whose nodes live in a vector and are addressed by
/// stable slot indices. Removed slots are recycled.
pub(crate) struct LruList<T> {
    slots: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> LruList<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Least recently used slot.
    pub fn tail(&self) -> Option<usize> {
        self.tail
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        self.slots.get(idx)?.as_ref().map(|n| &n.value)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.slots.get_mut(idx)?.as_mut().map(|n| &mut n.value)
    }

    /// Insert as most recently used; returns the slot index.
    pub fn push_front(&mut self, value: T) -> usize {
        let node = Node {
            value,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.link_front(idx);
        self.len += 1;
        idx
    }

    pub fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) || self.slots.get(idx).map_or(true, Option::is_none) {
            return;
        }
        self.unlink(idx);
        self.link_front(idx);
    }

    /// Unlink and free a slot, returning its value.
    pub fn remove(&mut self, idx: usize) -> Option<T> {
        if self.slots.get(idx).map_or(true, Option::is_none) {
            return None;
        }
        self.unlink(idx);
        let node = self.slots[idx].take()?;
        self.free.push(idx);
        self.len -= 1;
        Some(node.value)
    }

    /// Values from most to least recently used.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let node = self.slots.get(cursor?)?.as_ref()?;
            cursor = node.next;
            Some(&node.value)
        })
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node<T>> {
        self.slots.get_mut(idx)?.as_mut()
    }

    fn link_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(node) = self.node_mut(idx) {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(node) = self.node_mut(h) {
                node.prev = Some(idx);
            }
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.node_mut(idx) {
            Some(node) => (node.prev.take(), node.next.take()),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(node) = self.node_mut(p) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }
}

#[cfg(test)]
mod lru_tests {
    use super::*;

    fn order(list: &LruList<&'static str>) -> Vec<&'static str> {
        list.iter().copied().collect()
    }

    #[test]
    fn test_push_front_orders_by_recency() {
        let mut list = LruList::new();
        list.push_front("a");
        list.push_front("b");
        list.push_front("c");
        assert_eq!(order(&list), vec!["c", "b", "a"]);
        assert_eq!(list.get(list.tail().unwrap()), Some(&"a"));
    }

    #[test]
    fn test_move_to_front() {
        let mut list = LruList::new();
        let a = list.push_front("a");
        list.push_front("b");
        list.push_front("c");

        list.move_to_front(a);
        assert_eq!(order(&list), vec!["a", "c", "b"]);
        assert_eq!(list.get(list.tail().unwrap()), Some(&"b"));
    }

    #[test]
    fn test_remove_middle_and_reuse_slot() {
        let mut list = LruList::new();
        list.push_front("a");
        let b = list.push_front("b");
        list.push_front("c");

        assert_eq!(list.remove(b), Some("b"));
        assert_eq!(list.remove(b), None);
        assert_eq!(order(&list), vec!["c", "a"]);

        let d = list.push_front("d");
        assert_eq!(d, b);
        assert_eq!(order(&list), vec!["d", "c", "a"]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_remove_only_element() {
        let mut list = LruList::new();
        let a = list.push_front("a");
        list.remove(a);
        assert!(list.tail().is_none());
        assert_eq!(list.len(), 0);
        assert!(order(&list).is_empty());
    }
}
