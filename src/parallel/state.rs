//! State of a partially complete parallel operation

use std::collections::HashSet;
use std::hash::Hash;

/// Tracks every object of one run.
///
/// * `started`:  objects being processed
/// * `finished`: objects which have been processed
/// * `failed`:   objects which either failed or whose dependencies failed
///
/// Anything in none of these sets is pending.
#[derive(Debug)]
pub struct ExecutionState<T> {
    objects: Vec<T>,
    members: HashSet<T>,
    started: HashSet<T>,
    finished: HashSet<T>,
    failed: HashSet<T>,
}

impl<T> ExecutionState<T>
where
    T: Clone + Eq + Hash,
{
    /// Duplicate objects are dropped, first occurrence wins
    pub fn new(objects: Vec<T>) -> Self {
        let mut members = HashSet::with_capacity(objects.len());
        let objects: Vec<T> = objects
            .into_iter()
            .filter(|o| members.insert(o.clone()))
            .collect();

        Self {
            objects,
            members,
            started: HashSet::new(),
            finished: HashSet::new(),
            failed: HashSet::new(),
        }
    }

    pub fn objects(&self) -> &[T] {
        &self.objects
    }

    pub fn contains(&self, object: &T) -> bool {
        self.members.contains(object)
    }

    /// Pending objects, in input order
    pub fn pending(&self) -> Vec<T> {
        self.objects
            .iter()
            .filter(|o| self.is_pending(o))
            .cloned()
            .collect()
    }

    pub fn is_pending(&self, object: &T) -> bool {
        !self.started.contains(object)
            && !self.finished.contains(object)
            && !self.failed.contains(object)
    }

    pub fn is_finished(&self, object: &T) -> bool {
        self.finished.contains(object)
    }

    pub fn is_failed(&self, object: &T) -> bool {
        self.failed.contains(object)
    }

    pub fn mark_started(&mut self, object: T) {
        self.started.insert(object);
    }

    pub fn mark_finished(&mut self, object: &T) {
        self.started.remove(object);
        if !self.failed.contains(object) {
            self.finished.insert(object.clone());
        }
    }

    pub fn mark_failed(&mut self, object: &T) {
        self.started.remove(object);
        if !self.finished.contains(object) {
            self.failed.insert(object.clone());
        }
    }

    pub fn is_done(&self) -> bool {
        self.finished.len() + self.failed.len() >= self.objects.len()
    }
}
