//! Admission control for concurrent builds

use goldenpipe_common::{Error, Result};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Caps the number of non-terminal builds. Slots are held per image name,
/// so releasing a build twice frees its slot once.
#[derive(Debug)]
pub struct AdmissionControl {
    held: Mutex<HashSet<String>>,
    limit: usize,
}

impl AdmissionControl {
    pub fn new(limit: usize) -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn active(&self) -> usize {
        self.lock().len()
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.lock().contains(name)
    }

    /// Take a slot for `name`. `Conflict` if the name already holds one,
    /// `CapacityExceeded` when none is free.
    pub fn try_acquire(&self, name: &str) -> Result<AdmissionSlot<'_>> {
        let mut held = self.lock();

        if held.contains(name) {
            return Err(Error::Conflict(format!(
                "a build for image {} is already in progress",
                name
            )));
        }

        if held.len() >= self.limit {
            return Err(Error::CapacityExceeded {
                active: held.len(),
                limit: self.limit,
            });
        }

        held.insert(name.to_string());
        Ok(AdmissionSlot {
            control: self,
            name: name.to_string(),
            committed: false,
        })
    }

    /// Give back the slot held by `name`. Returns whether one was held.
    pub fn release(&self, name: &str) -> bool {
        let released = self.lock().remove(name);
        if released {
            debug!("Released build slot of {}", name);
        }
        released
    }

    /// Replace the held set, e.g. from records found at startup
    pub fn reset<I>(&self, names: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut held = self.lock();
        *held = names.into_iter().collect();
        debug!("Admission reset to {}/{}", held.len(), self.limit);
    }
}

/// A reserved slot. Dropped without `commit` it is given back.
#[must_use]
pub struct AdmissionSlot<'a> {
    control: &'a AdmissionControl,
    name: String,
    committed: bool,
}

impl AdmissionSlot<'_> {
    /// Keep the slot held past this call
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for AdmissionSlot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.control.release(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_is_enforced() {
        let control = AdmissionControl::new(2);

        control.try_acquire("a").unwrap().commit();
        control.try_acquire("b").unwrap().commit();

        match control.try_acquire("c") {
            Err(Error::CapacityExceeded { active, limit }) => {
                assert_eq!((active, limit), (2, 2));
            }
            _ => panic!("expected capacity error"),
        };
    }

    #[test]
    fn test_uncommitted_slot_is_returned() {
        let control = AdmissionControl::new(1);
        {
            let _slot = control.try_acquire("a").unwrap();
            assert_eq!(control.active(), 1);
        }
        assert_eq!(control.active(), 0);
        assert!(control.try_acquire("a").is_ok());
    }

    #[test]
    fn test_held_name_conflicts() {
        let control = AdmissionControl::new(5);
        let slot = control.try_acquire("web01").unwrap();

        assert!(matches!(control.try_acquire("web01"), Err(Error::Conflict(_))));
        assert!(control.try_acquire("web02").is_ok());

        slot.commit();
        assert!(matches!(control.try_acquire("web01"), Err(Error::Conflict(_))));
        // a rejected attempt must not free the holder's slot
        assert!(control.is_held("web01"));
    }

    #[test]
    fn test_release_is_idempotent_per_name() {
        let control = AdmissionControl::new(3);
        assert!(!control.release("a"));

        control.try_acquire("a").unwrap().commit();
        control.try_acquire("b").unwrap().commit();

        assert!(control.release("a"));
        assert!(!control.release("a"));
        assert_eq!(control.active(), 1);
        assert!(control.is_held("b"));
    }

    #[test]
    fn test_concurrent_releases_free_one_slot() {
        let control = std::sync::Arc::new(AdmissionControl::new(2));
        control.try_acquire("a").unwrap().commit();
        control.try_acquire("b").unwrap().commit();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let control = control.clone();
                std::thread::spawn(move || control.release("a"))
            })
            .collect();
        let freed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|released| *released)
            .count();

        assert_eq!(freed, 1);
        assert_eq!(control.active(), 1);
        assert!(control.try_acquire("c").is_ok());
    }

    #[test]
    fn test_reset_replaces_held_names() {
        let control = AdmissionControl::new(5);
        control.try_acquire("stale").unwrap().commit();

        control.reset(vec!["a".to_string(), "b".to_string()]);

        assert_eq!(control.active(), 2);
        assert!(!control.is_held("stale"));
        assert!(control.is_held("a"));
    }
}
