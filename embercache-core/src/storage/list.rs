use std::time::Instant;

use bytes::Bytes;

/// Sentinel for absent links in the slot arena.
pub(crate) const NIL: usize = usize::MAX;

/// A cache entry living in the slot arena. The `prev`/`next` links carry the
/// LRU chain for live entries and the free chain for vacant slots.
#[derive(Debug)]
pub(crate) struct EntrySlot {
    pub key: String,
    pub value: Bytes,
    pub expires_at: Instant,
    pub prev: usize,
    pub next: usize,
}

impl EntrySlot {
    /// Bytes this entry accounts for against the memory cap.
    pub fn bytes_used(&self) -> u64 {
        (self.key.len() + self.value.len()) as u64
    }
}

/// Doubly-linked LRU order over the slot arena. `head` is the least recently
/// used entry and `tail` the most recently used. Not thread safe; the storage
/// mutex serialises all access.
#[derive(Debug)]
pub(crate) struct LruList {
    head: usize,
    tail: usize,
}

impl LruList {
    pub fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
        }
    }

    /// Attach `idx` at the tail (most recently used position).
    pub fn append(&mut self, slots: &mut [EntrySlot], idx: usize) {
        slots[idx].prev = self.tail;
        slots[idx].next = NIL;
        if self.tail != NIL {
            slots[self.tail].next = idx;
        } else {
            self.head = idx;
        }
        self.tail = idx;
    }

    /// Detach `idx` from anywhere in the list and clear its links.
    pub fn remove(&mut self, slots: &mut [EntrySlot], idx: usize) {
        let prev = slots[idx].prev;
        let next = slots[idx].next;

        if idx == self.head && idx == self.tail {
            self.head = NIL;
            self.tail = NIL;
        } else if idx == self.head {
            self.head = next;
            slots[next].prev = NIL;
        } else if idx == self.tail {
            self.tail = prev;
            slots[prev].next = NIL;
        } else {
            slots[prev].next = next;
            slots[next].prev = prev;
        }

        slots[idx].prev = NIL;
        slots[idx].next = NIL;
    }

    /// Move an existing node to the tail (most recently used).
    pub fn move_to_tail(&mut self, slots: &mut [EntrySlot], idx: usize) {
        if idx == self.tail {
            return;
        }
        self.remove(slots, idx);
        self.append(slots, idx);
    }

    /// Least recently used slot index, if any.
    pub fn front(&self) -> Option<usize> {
        if self.head == NIL {
            None
        } else {
            Some(self.head)
        }
    }

    #[cfg(test)]
    pub fn tail(&self) -> Option<usize> {
        if self.tail == NIL {
            None
        } else {
            Some(self.tail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn slot(key: &str) -> EntrySlot {
        EntrySlot {
            key: key.to_string(),
            value: Bytes::from_static(b"v"),
            expires_at: Instant::now() + Duration::from_secs(60),
            prev: NIL,
            next: NIL,
        }
    }

    fn slots(keys: &[&str]) -> Vec<EntrySlot> {
        keys.iter().map(|key| slot(key)).collect()
    }

    fn forward_keys(list: &LruList, slots: &[EntrySlot]) -> Vec<String> {
        let mut keys = Vec::new();
        let mut cursor = list.front();
        while let Some(idx) = cursor {
            keys.push(slots[idx].key.clone());
            let next = slots[idx].next;
            cursor = (next != NIL).then_some(next);
        }
        keys
    }

    fn backward_keys(list: &LruList, slots: &[EntrySlot]) -> Vec<String> {
        let mut keys = Vec::new();
        let mut cursor = list.tail();
        while let Some(idx) = cursor {
            keys.push(slots[idx].key.clone());
            let prev = slots[idx].prev;
            cursor = (prev != NIL).then_some(prev);
        }
        keys
    }

    fn assert_symmetric(list: &LruList, slots: &[EntrySlot], expected: &[&str]) {
        let forward = forward_keys(list, slots);
        assert_eq!(forward, expected);
        let mut backward = backward_keys(list, slots);
        backward.reverse();
        assert_eq!(forward, backward);
    }

    #[test]
    fn append_builds_order() {
        let mut arena = slots(&["a", "b", "c"]);
        let mut list = LruList::new();
        for idx in 0..arena.len() {
            list.append(&mut arena, idx);
        }
        assert_symmetric(&list, &arena, &["a", "b", "c"]);
        assert_eq!(list.front(), Some(0));
        assert_eq!(list.tail(), Some(2));
    }

    #[test]
    fn empty_list_has_no_ends() {
        let list = LruList::new();
        assert_eq!(list.front(), None);
        assert_eq!(list.tail(), None);
    }

    #[test]
    fn remove_sole_node_empties_list() {
        let mut arena = slots(&["a"]);
        let mut list = LruList::new();
        list.append(&mut arena, 0);
        list.remove(&mut arena, 0);
        assert_eq!(list.front(), None);
        assert_eq!(list.tail(), None);
        assert_eq!(arena[0].prev, NIL);
        assert_eq!(arena[0].next, NIL);
    }

    #[test]
    fn remove_head_middle_tail() {
        let mut arena = slots(&["a", "b", "c", "d"]);
        let mut list = LruList::new();
        for idx in 0..arena.len() {
            list.append(&mut arena, idx);
        }

        list.remove(&mut arena, 0); // head
        assert_symmetric(&list, &arena, &["b", "c", "d"]);

        list.remove(&mut arena, 2); // middle
        assert_symmetric(&list, &arena, &["b", "d"]);

        list.remove(&mut arena, 3); // tail
        assert_symmetric(&list, &arena, &["b"]);
    }

    #[test]
    fn removed_node_links_are_cleared() {
        let mut arena = slots(&["a", "b", "c"]);
        let mut list = LruList::new();
        for idx in 0..arena.len() {
            list.append(&mut arena, idx);
        }
        list.remove(&mut arena, 1);
        assert_eq!(arena[1].prev, NIL);
        assert_eq!(arena[1].next, NIL);
    }

    #[test]
    fn move_to_tail_is_noop_for_tail() {
        let mut arena = slots(&["a", "b"]);
        let mut list = LruList::new();
        list.append(&mut arena, 0);
        list.append(&mut arena, 1);
        list.move_to_tail(&mut arena, 1);
        assert_symmetric(&list, &arena, &["a", "b"]);
    }

    #[test]
    fn move_to_tail_promotes_head() {
        let mut arena = slots(&["a", "b", "c"]);
        let mut list = LruList::new();
        for idx in 0..arena.len() {
            list.append(&mut arena, idx);
        }
        list.move_to_tail(&mut arena, 0);
        assert_symmetric(&list, &arena, &["b", "c", "a"]);
    }

    #[test]
    fn move_to_tail_promotes_middle() {
        let mut arena = slots(&["a", "b", "c"]);
        let mut list = LruList::new();
        for idx in 0..arena.len() {
            list.append(&mut arena, idx);
        }
        list.move_to_tail(&mut arena, 1);
        assert_symmetric(&list, &arena, &["a", "c", "b"]);
    }

    #[test]
    fn reappend_after_remove() {
        let mut arena = slots(&["a", "b"]);
        let mut list = LruList::new();
        list.append(&mut arena, 0);
        list.append(&mut arena, 1);
        list.remove(&mut arena, 0);
        list.append(&mut arena, 0);
        assert_symmetric(&list, &arena, &["b", "a"]);
    }
}
