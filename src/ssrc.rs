//! Contributing-source (SSRC) bookkeeping.
//!
//! During a conference the streams that send out mixed audio attach a
//! contributing-source list to every packet. Rather than rebuilding that
//! list per packet, the registry caches it as an immutable array that is
//! replaced wholesale on membership changes, so readers grab a snapshot with
//! one cheap clone and never observe a half-updated set.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::event::SsrcChangeCallback;

/// A deduplicated, ordered, atomically-swapped set of SSRC identifiers.
///
/// The set is kept as an immutable `Arc<[u32]>`; `add` and `remove` build a
/// new array and swap it in rather than mutating in place. Each swap fires
/// the change callback with the old and new arrays.
///
/// # Example
///
/// ```
/// use conf_media::SsrcRegistry;
///
/// let registry = SsrcRegistry::new();
/// assert!(registry.add(0x1234));
/// assert!(!registry.add(0x1234)); // duplicate is a no-op
/// assert_eq!(&*registry.snapshot(), &[0x1234]);
/// ```
#[derive(Default)]
pub struct SsrcRegistry {
    list: RwLock<Arc<[u32]>>,
    callback: RwLock<Option<SsrcChangeCallback>>,
}

impl SsrcRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            list: RwLock::new(Vec::new().into()),
            callback: RwLock::new(None),
        }
    }

    /// Returns the current SSRC array.
    ///
    /// The returned snapshot is immutable; later membership changes swap in
    /// a fresh array and do not affect it.
    pub fn snapshot(&self) -> Arc<[u32]> {
        self.list.read().clone()
    }

    /// Returns `true` if `ssrc` is currently in the set.
    pub fn contains(&self, ssrc: u32) -> bool {
        self.list.read().contains(&ssrc)
    }

    /// Returns the number of contributing sources.
    pub fn len(&self) -> usize {
        self.list.read().len()
    }

    /// Returns `true` if no sources are registered.
    pub fn is_empty(&self) -> bool {
        self.list.read().is_empty()
    }

    /// Adds `ssrc` to the set.
    ///
    /// Returns `true` if the set changed; adding a known SSRC is a no-op
    /// and fires no notification.
    pub fn add(&self, ssrc: u32) -> bool {
        let (old, new) = {
            let mut list = self.list.write();
            if list.contains(&ssrc) {
                return false;
            }
            let old = list.clone();
            let mut next = list.to_vec();
            next.push(ssrc);
            *list = next.into();
            (old, list.clone())
        };
        self.fire(&old, &new);
        true
    }

    /// Removes `ssrc` from the set.
    ///
    /// Returns `true` if the set changed; removing an absent SSRC is a
    /// no-op and fires no notification. Removing the sole element leaves an
    /// empty set.
    pub fn remove(&self, ssrc: u32) -> bool {
        let (old, new) = {
            let mut list = self.list.write();
            let Some(index) = list.iter().position(|&s| s == ssrc) else {
                return false;
            };
            let old = list.clone();
            let mut next = list.to_vec();
            next.remove(index);
            *list = next.into();
            (old, list.clone())
        };
        self.fire(&old, &new);
        true
    }

    /// Sets the change callback fired on each swap, or clears it.
    pub fn set_change_callback(&self, callback: Option<SsrcChangeCallback>) {
        *self.callback.write() = callback;
    }

    fn fire(&self, old: &[u32], new: &[u32]) {
        // Clone out so the callback runs without holding any registry lock.
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(old, new);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_add_deduplicates() {
        let registry = SsrcRegistry::new();
        assert!(registry.add(42));
        assert!(!registry.add(42));
        assert_eq!(registry.len(), 1);
        assert_eq!(&*registry.snapshot(), &[42]);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let registry = SsrcRegistry::new();
        registry.add(1);
        assert!(!registry.remove(99));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_sole_element_empties() {
        let registry = SsrcRegistry::new();
        registry.add(7);
        assert!(registry.remove(7));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_preserves_insertion_order() {
        let registry = SsrcRegistry::new();
        registry.add(3);
        registry.add(1);
        registry.add(2);
        registry.remove(1);
        assert_eq!(&*registry.snapshot(), &[3, 2]);
    }

    #[test]
    fn test_snapshot_is_immutable() {
        let registry = SsrcRegistry::new();
        registry.add(1);
        let before = registry.snapshot();
        registry.add(2);
        assert_eq!(&*before, &[1]);
        assert_eq!(&*registry.snapshot(), &[1, 2]);
    }

    #[test]
    fn test_change_callback_old_and_new() {
        let registry = SsrcRegistry::new();
        let seen: Arc<Mutex<Vec<(Vec<u32>, Vec<u32>)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        registry.set_change_callback(Some(Arc::new(move |old: &[u32], new: &[u32]| {
            seen_clone.lock().push((old.to_vec(), new.to_vec()));
        })));

        registry.add(10);
        registry.add(20);
        registry.add(10); // no-op, no event
        registry.remove(10);

        let events = seen.lock();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], (vec![], vec![10]));
        assert_eq!(events[1], (vec![10], vec![10, 20]));
        assert_eq!(events[2], (vec![10, 20], vec![20]));
    }
}
