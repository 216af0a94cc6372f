//! Doubly-linked list implementation (NT LIST_ENTRY style)
//!
//! An intrusive circular list: the entry is embedded in the containing
//! structure and recovered with [`containing_record!`], giving O(1) insert
//! and O(1) unlink from the middle of a queue. Ready queues, the sleep list,
//! dispatcher wait lists, DPC queues and APC queues are all built on it.
//!
//! Unlike the raw NT structure, an empty list is represented by null links.
//! A head only points at itself while it has members, and the last removal
//! puts it back to null. That lets an idle object (an event nobody waits on,
//! a freshly built `Kernel`) be moved by value; once something is linked the
//! head must stay put until the list drains again.
//!
//! # Safety
//!
//! The caller must ensure:
//! - List entries are only in one list at a time
//! - The containing structure outlives its list membership
//! - The lock that protects the list is held for every operation

use core::ptr;

/// Doubly-linked list entry (embedded in containing structure)
#[derive(Clone, Copy)]
#[repr(C)]
pub struct ListEntry {
    /// Forward link (next entry)
    pub flink: *mut ListEntry,
    /// Backward link (previous entry)
    pub blink: *mut ListEntry,
}

impl ListEntry {
    /// Create a new empty list head / unlinked entry
    pub const fn new() -> Self {
        Self {
            flink: ptr::null_mut(),
            blink: ptr::null_mut(),
        }
    }

    /// Reset a head to the empty state
    #[inline]
    pub fn init_head(&mut self) {
        self.flink = ptr::null_mut();
        self.blink = ptr::null_mut();
    }

    /// Check if the list is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.flink.is_null() || self.flink == self as *const ListEntry as *mut ListEntry
    }

    /// Check whether this entry is currently linked into some list
    #[inline]
    pub fn is_linked(&self) -> bool {
        !self.flink.is_null()
    }

    /// Make an empty head self-referential before the first insertion
    #[inline]
    fn ensure_linked(&mut self) {
        if self.flink.is_null() {
            self.flink = self as *mut ListEntry;
            self.blink = self as *mut ListEntry;
        }
    }

    /// Drop a drained head back to null links
    #[inline]
    fn settle(&mut self) {
        if self.flink == self as *mut ListEntry {
            self.init_head();
        }
    }

    /// First entry, or null when empty
    #[inline]
    pub fn first(&self) -> *mut ListEntry {
        if self.is_empty() { ptr::null_mut() } else { self.flink }
    }

    /// Last entry, or null when empty
    #[inline]
    pub fn last(&self) -> *mut ListEntry {
        if self.is_empty() { ptr::null_mut() } else { self.blink }
    }

    /// Insert entry at the head of the list
    ///
    /// Equivalent to InsertHeadList()
    ///
    /// # Safety
    /// The entry must not already be in a list
    #[inline]
    pub unsafe fn insert_head(&mut self, entry: *mut ListEntry) {
        self.ensure_linked();
        let old_flink = self.flink;
        (*entry).flink = old_flink;
        (*entry).blink = self as *mut ListEntry;
        (*old_flink).blink = entry;
        self.flink = entry;
    }

    /// Insert entry at the tail of the list
    ///
    /// Equivalent to InsertTailList()
    ///
    /// # Safety
    /// The entry must not already be in a list
    #[inline]
    pub unsafe fn insert_tail(&mut self, entry: *mut ListEntry) {
        self.ensure_linked();
        let old_blink = self.blink;
        (*entry).flink = self as *mut ListEntry;
        (*entry).blink = old_blink;
        (*old_blink).flink = entry;
        self.blink = entry;
    }

    /// Insert `entry` immediately before `position`, which must be a member
    /// of this list (or the head itself, meaning "at the tail")
    ///
    /// # Safety
    /// `position` must be linked into this list; `entry` must be unlinked
    #[inline]
    pub unsafe fn insert_before(&mut self, position: *mut ListEntry, entry: *mut ListEntry) {
        if position == self as *mut ListEntry {
            self.insert_tail(entry);
            return;
        }
        let prev = (*position).blink;
        (*entry).flink = position;
        (*entry).blink = prev;
        (*prev).flink = entry;
        (*position).blink = entry;
    }

    /// Remove and return the first entry, or null when empty
    ///
    /// Equivalent to RemoveHeadList()
    ///
    /// # Safety
    /// Caller holds the list's lock
    #[inline]
    pub unsafe fn remove_head(&mut self) -> *mut ListEntry {
        if self.is_empty() {
            return ptr::null_mut();
        }
        let entry = self.flink;
        let new_flink = (*entry).flink;
        self.flink = new_flink;
        (*new_flink).blink = self as *mut ListEntry;
        (*entry).flink = ptr::null_mut();
        (*entry).blink = ptr::null_mut();
        self.settle();
        entry
    }

    /// Remove and return the last entry, or null when empty
    ///
    /// Equivalent to RemoveTailList()
    ///
    /// # Safety
    /// Caller holds the list's lock
    #[inline]
    pub unsafe fn remove_tail(&mut self) -> *mut ListEntry {
        if self.is_empty() {
            return ptr::null_mut();
        }
        let entry = self.blink;
        let new_blink = (*entry).blink;
        self.blink = new_blink;
        (*new_blink).flink = self as *mut ListEntry;
        (*entry).flink = ptr::null_mut();
        (*entry).blink = ptr::null_mut();
        self.settle();
        entry
    }

    /// Remove this entry from whatever list it is in
    ///
    /// Equivalent to RemoveEntryList(). Returns true if the list the entry
    /// was in is now empty.
    ///
    /// # Safety
    /// The entry must be linked; caller holds the list's lock
    #[inline]
    pub unsafe fn remove_entry(&mut self) -> bool {
        let flink = self.flink;
        let blink = self.blink;
        (*blink).flink = flink;
        (*flink).blink = blink;
        self.flink = ptr::null_mut();
        self.blink = ptr::null_mut();

        // A lone remaining node in a circular list can only be the head
        if flink == blink {
            (*flink).init_head();
            true
        } else {
            false
        }
    }

    /// Count the entries (walks the list)
    ///
    /// # Safety
    /// Caller holds the list's lock
    pub unsafe fn len(&self) -> usize {
        let head = self as *const ListEntry as *mut ListEntry;
        let mut count = 0;
        let mut cursor = self.first();
        while !cursor.is_null() && cursor != head {
            count += 1;
            cursor = (*cursor).flink;
        }
        count
    }

    /// Iterate over raw entry pointers from head to tail
    ///
    /// # Safety
    /// The list must not be modified while the iterator is alive
    pub unsafe fn iter(&self) -> ListIter {
        ListIter {
            head: self as *const ListEntry as *mut ListEntry,
            cursor: self.first(),
        }
    }
}

impl Default for ListEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw iterator over a list's entries
pub struct ListIter {
    head: *mut ListEntry,
    cursor: *mut ListEntry,
}

impl Iterator for ListIter {
    type Item = *mut ListEntry;

    fn next(&mut self) -> Option<*mut ListEntry> {
        if self.cursor.is_null() || self.cursor == self.head {
            return None;
        }
        let entry = self.cursor;
        self.cursor = unsafe { (*entry).flink };
        Some(entry)
    }
}

/// Get a pointer to the containing structure from a list entry pointer
///
/// Equivalent to the CONTAINING_RECORD() macro.
#[macro_export]
macro_rules! containing_record {
    ($ptr:expr, $type:ty, $field:ident) => {{
        let offset = core::mem::offset_of!($type, $field);
        ($ptr as *mut u8).sub(offset) as *mut $type
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Node {
        value: u32,
        link: ListEntry,
    }

    impl Node {
        fn new(value: u32) -> Self {
            Self { value, link: ListEntry::new() }
        }
    }

    unsafe fn values(head: &ListEntry) -> alloc::vec::Vec<u32> {
        head.iter()
            .map(|entry| (*containing_record!(entry, Node, link)).value)
            .collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut head = ListEntry::new();
        let mut a = Node::new(1);
        let mut b = Node::new(2);
        let mut c = Node::new(3);

        unsafe {
            head.insert_tail(&mut a.link);
            head.insert_tail(&mut b.link);
            head.insert_head(&mut c.link);
            assert_eq!(values(&head), [3, 1, 2]);
            assert_eq!(head.len(), 3);

            let first = head.remove_head();
            assert_eq!((*containing_record!(first, Node, link)).value, 3);
            let last = head.remove_tail();
            assert_eq!((*containing_record!(last, Node, link)).value, 2);
            assert_eq!(values(&head), [1]);
        }
    }

    #[test]
    fn test_empty_head_returns_to_null() {
        let mut head = ListEntry::new();
        let mut a = Node::new(1);
        let mut b = Node::new(2);

        unsafe {
            head.insert_tail(&mut a.link);
            head.insert_tail(&mut b.link);
            assert!(!b.link.remove_entry());
            assert!(a.link.remove_entry());
        }

        assert!(head.is_empty());
        assert!(head.flink.is_null());
        assert!(!a.link.is_linked());

        // A drained head can be moved and reused
        let mut moved = head;
        unsafe {
            moved.insert_tail(&mut a.link);
            assert_eq!(values(&moved), [1]);
            assert!(moved.remove_head() == &mut a.link as *mut ListEntry);
            assert!(moved.remove_head().is_null());
        }
    }

    #[test]
    fn test_insert_before() {
        let mut head = ListEntry::new();
        let mut a = Node::new(10);
        let mut b = Node::new(30);
        let mut c = Node::new(20);
        let mut d = Node::new(40);

        unsafe {
            head.insert_tail(&mut a.link);
            head.insert_tail(&mut b.link);
            head.insert_before(&mut b.link, &mut c.link);
            let head_ptr = &mut head as *mut ListEntry;
            head.insert_before(head_ptr, &mut d.link);
            assert_eq!(values(&head), [10, 20, 30, 40]);
        }
    }
}
