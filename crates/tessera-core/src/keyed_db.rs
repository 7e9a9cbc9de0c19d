//! Ordered, key-addressable collection
//!
//! [`KeyedDb`] keeps its entries sorted by a derived string sort key and
//! indexes them by a derived unique id. Lookups, inserts and deletes locate
//! entries by binary search, and pagination scans outward from the position of
//! a cursor key.
//!
//! Entries sharing a sort key (but not an id) are kept adjacent, in the order
//! they were inserted.

use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::HashMap;
use thiserror::Error;

/// Values stored in a [`KeyedDb`]
pub trait Keyed {
    /// Sort key. Entries are ordered by comparing these strings.
    fn sort_key(&self) -> String;

    /// Unique identity key
    fn id(&self) -> String;
}

/// Errors raised by collection contract violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyedDbError {
    /// Value has an empty identity key
    #[error("value has an empty id")]
    EmptyId,

    /// Id already present
    #[error("duplicate id being inserted: {0}")]
    DuplicateId(String),

    /// Id not present
    #[error("value not found: {0}")]
    NotFound(String),
}

/// Direction the sort keys are ordered in
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Smallest key first
    Ascending,
    /// Largest key first
    #[default]
    Descending,
}

impl SortOrder {
    /// Three-way comparison of a target key against an element key.
    ///
    /// `Less` means the target belongs before the element.
    pub fn compare(&self, target: &str, element: &str) -> Ordering {
        match self {
            SortOrder::Ascending => target.cmp(element),
            SortOrder::Descending => element.cmp(target),
        }
    }
}

/// Which side of the cursor a page is taken from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PageMode {
    /// Entries positioned after the cursor
    #[default]
    After,
    /// Entries positioned before the cursor
    Before,
}

/// Result of [`KeyedDb::update`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// No entry with that id
    NotFound,
    /// Mutated in place, sort key unchanged
    Unchanged,
    /// Sort key changed and the entry moved
    Repositioned,
}

/// Binary search over a sorted slice with a three-way predicate.
///
/// `predicate(elem)` returns `Less` when the target belongs before `elem`.
/// Returns `0` for an empty slice, `-1` when the target sorts before the first
/// element, `len` when it sorts after the last, the index of an equal element
/// when one exists, and otherwise the insertion point.
pub fn binary_search<T>(items: &[T], mut predicate: impl FnMut(&T) -> Ordering) -> isize {
    let len = items.len();
    if len == 0 {
        return 0;
    }

    match predicate(&items[0]) {
        Ordering::Less => return -1,
        Ordering::Equal => return 0,
        Ordering::Greater => {}
    }
    match predicate(&items[len - 1]) {
        Ordering::Greater => return len as isize,
        Ordering::Equal => return (len - 1) as isize,
        Ordering::Less => {}
    }

    let (mut low, mut high) = (0usize, len);
    while low != high {
        let mid = low + (high - low) / 2;
        match predicate(&items[mid]) {
            Ordering::Less => high = mid,
            Ordering::Greater => low = mid + 1,
            Ordering::Equal => return mid as isize,
        }
    }
    low as isize
}

/// Sorted collection indexed by id
#[derive(Clone, Debug)]
pub struct KeyedDb<T> {
    order: SortOrder,
    items: Vec<T>,
    /// id -> sort key of every entry in `items`
    ids: HashMap<String, String>,
}

impl<T: Keyed> Default for KeyedDb<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Keyed> KeyedDb<T> {
    /// Empty collection, largest sort key first
    pub fn new() -> Self {
        Self::with_order(SortOrder::Descending)
    }

    /// Empty collection with the given order
    pub fn with_order(order: SortOrder) -> Self {
        Self {
            order,
            items: Vec::new(),
            ids: HashMap::new(),
        }
    }

    /// Sort order
    pub fn order(&self) -> SortOrder {
        self.order
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// No entries
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// First entry in sort order
    pub fn first(&self) -> Option<&T> {
        self.items.first()
    }

    /// Last entry in sort order
    pub fn last(&self) -> Option<&T> {
        self.items.last()
    }

    /// All entries in sort order
    pub fn all(&self) -> &[T] {
        &self.items
    }

    /// Iterate in sort order
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Remove everything
    pub fn clear(&mut self) {
        self.items.clear();
        self.ids.clear();
    }

    /// Id is present
    pub fn contains_id(&self, id: &str) -> bool {
        self.ids.contains_key(id)
    }

    /// Entry by id
    pub fn get(&self, id: &str) -> Option<&T> {
        self.position_of(id).map(|pos| &self.items[pos])
    }

    /// Insert values, failing on the first empty or duplicate id.
    ///
    /// Values before the failing one stay inserted.
    pub fn insert(&mut self, values: impl IntoIterator<Item = T>) -> Result<(), KeyedDbError> {
        for value in values {
            self.insert_single(value)?;
        }
        Ok(())
    }

    /// Insert values, replacing entries with the same id.
    ///
    /// Returns the entries that were replaced.
    pub fn upsert(&mut self, values: impl IntoIterator<Item = T>) -> Result<Vec<T>, KeyedDbError> {
        let mut displaced = Vec::new();
        for value in values {
            let id = value.id();
            if id.is_empty() {
                return Err(KeyedDbError::EmptyId);
            }
            if let Some(old) = self.remove_id(&id) {
                displaced.push(old);
            }
            self.insert_single(value)?;
        }
        Ok(displaced)
    }

    /// Insert each value unless an entry with the same id or the same sort
    /// key already exists. Returns how many were inserted.
    pub fn insert_if_absent(&mut self, values: impl IntoIterator<Item = T>) -> usize {
        let mut inserted = 0;
        for value in values {
            let id = value.id();
            if id.is_empty() || self.ids.contains_key(&id) {
                continue;
            }
            let (start, end) = self.run_bounds(&value.sort_key());
            if start != end {
                continue;
            }
            if self.insert_single(value).is_ok() {
                inserted += 1;
            }
        }
        inserted
    }

    /// Remove the entry with the same id as `value`
    pub fn delete(&mut self, value: &T) -> Option<T> {
        self.remove_id(&value.id())
    }

    /// Remove by id. A missing id is an error when `assert_present` is set.
    pub fn delete_by_id(&mut self, id: &str, assert_present: bool) -> Result<Option<T>, KeyedDbError> {
        match self.remove_id(id) {
            Some(value) => Ok(Some(value)),
            None if assert_present => Err(KeyedDbError::NotFound(id.to_string())),
            None => Ok(None),
        }
    }

    /// Mutate an entry in place, moving it if its sort key changed.
    ///
    /// A mutator that changes the id re-indexes the entry under the new id,
    /// replacing any other entry that already had it.
    pub fn update(&mut self, id: &str, mutate: impl FnOnce(&mut T)) -> UpdateOutcome {
        let Some(pos) = self.position_of(id) else {
            return UpdateOutcome::NotFound;
        };

        let old_key = self.items[pos].sort_key();
        mutate(&mut self.items[pos]);

        let new_id = self.items[pos].id();
        if new_id != id {
            let value = self.items.remove(pos);
            self.ids.remove(id);
            self.remove_id(&new_id);
            self.place(value);
            return UpdateOutcome::Repositioned;
        }

        let new_key = self.items[pos].sort_key();
        if new_key == old_key {
            return UpdateOutcome::Unchanged;
        }

        let value = self.items.remove(pos);
        self.ids.remove(id);
        self.place(value);
        UpdateOutcome::Repositioned
    }

    /// [`update`](Self::update) addressed by a value's id
    pub fn update_by_value(&mut self, value: &T, mutate: impl FnOnce(&mut T)) -> UpdateOutcome {
        self.update(&value.id(), mutate)
    }

    /// Page of up to `limit` entries strictly after (or before) the cursor key.
    ///
    /// Without a cursor the page starts at the beginning (`After`) or the end
    /// (`Before`). The predicate filters entries while scanning outward.
    /// Entries come back in collection order either way.
    pub fn paginated(
        &self,
        cursor: Option<&str>,
        limit: usize,
        predicate: Option<&dyn Fn(&T) -> bool>,
        mode: PageMode,
    ) -> Vec<&T> {
        let start = match (cursor, mode) {
            (None, PageMode::After) => 0,
            (None, PageMode::Before) => self.items.len(),
            (Some(cursor), PageMode::After) => self.run_bounds(cursor).1,
            (Some(cursor), PageMode::Before) => self.run_bounds(cursor).0,
        };
        let keep = |value: &&T| predicate.map_or(true, |p| p(value));

        match mode {
            PageMode::After => self.items[start..].iter().filter(keep).take(limit).collect(),
            PageMode::Before => {
                let mut page: Vec<&T> = self.items[..start]
                    .iter()
                    .rev()
                    .filter(keep)
                    .take(limit)
                    .collect();
                page.reverse();
                page
            }
        }
    }

    /// [`paginated`](Self::paginated) with the cursor taken from a value
    pub fn paginated_by_value(
        &self,
        value: Option<&T>,
        limit: usize,
        predicate: Option<&dyn Fn(&T) -> bool>,
        mode: PageMode,
    ) -> Vec<&T> {
        let cursor = value.map(|v| v.sort_key());
        self.paginated(cursor.as_deref(), limit, predicate, mode)
    }

    fn insert_single(&mut self, value: T) -> Result<(), KeyedDbError> {
        let id = value.id();
        if id.is_empty() {
            return Err(KeyedDbError::EmptyId);
        }
        if self.ids.contains_key(&id) {
            return Err(KeyedDbError::DuplicateId(id));
        }
        self.place(value);
        Ok(())
    }

    /// Splice after any entries with an equal sort key
    fn place(&mut self, value: T) {
        let key = value.sort_key();
        let (_, end) = self.run_bounds(&key);
        self.ids.insert(value.id(), key);
        self.items.insert(end, value);
    }

    fn remove_id(&mut self, id: &str) -> Option<T> {
        let pos = self.position_of(id)?;
        self.ids.remove(id);
        Some(self.items.remove(pos))
    }

    fn position_of(&self, id: &str) -> Option<usize> {
        let key = self.ids.get(id)?;
        let (start, end) = self.run_bounds(key);
        (start..end).find(|&i| self.items[i].id() == id)
    }

    /// `[start, end)` of the entries whose sort key equals `key`. When there
    /// are none, both bounds are the insertion point.
    fn run_bounds(&self, key: &str) -> (usize, usize) {
        let len = self.items.len();
        let found = binary_search(&self.items, |v| self.order.compare(key, &v.sort_key()));
        if found < 0 {
            return (0, 0);
        }
        let idx = found as usize;
        if idx >= len || self.items[idx].sort_key() != key {
            return (idx, idx);
        }

        let mut start = idx;
        while start > 0 && self.items[start - 1].sort_key() == key {
            start -= 1;
        }
        let mut end = idx + 1;
        while end < len && self.items[end].sort_key() == key {
            end += 1;
        }
        (start, end)
    }
}

impl<T: Keyed + Clone> KeyedDb<T> {
    /// New collection holding the matching entries
    pub fn filter(&self, predicate: impl Fn(&T) -> bool) -> KeyedDb<T> {
        let items: Vec<T> = self.items.iter().filter(|v| predicate(v)).cloned().collect();
        self.with_items(items)
    }

    /// New collection holding `items[start..end]`
    pub fn slice(&self, start: usize, end: usize) -> KeyedDb<T> {
        let end = end.min(self.items.len());
        let start = start.min(end);
        self.with_items(self.items[start..end].to_vec())
    }

    fn with_items(&self, items: Vec<T>) -> KeyedDb<T> {
        let ids = items.iter().map(|v| (v.id(), v.sort_key())).collect();
        KeyedDb {
            order: self.order,
            items,
            ids,
        }
    }
}

impl<T: Serialize> Serialize for KeyedDb<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.items.serialize(serializer)
    }
}
