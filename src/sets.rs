//! A small generic set with lazy set-algebra iterators.

use std::collections::HashSet;
use std::collections::hash_set;
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct Set<T: Eq + Hash> {
    data: HashSet<T>,
}

impl<T: Eq + Hash> Default for Set<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + Hash> Set<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: HashSet::new(),
        }
    }

    #[must_use]
    pub fn singleton(item: T) -> Self {
        let mut set = Self::new();
        set.insert(item);
        set
    }

    /// Inserts an item, returning true if it was not already present.
    pub fn insert(&mut self, item: T) -> bool {
        self.data.insert(item)
    }

    /// Removes an item, returning true if it was present.
    pub fn remove(&mut self, item: &T) -> bool {
        self.data.remove(item)
    }

    pub fn contains(&self, item: &T) -> bool {
        self.data.contains(item)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn iter(&self) -> hash_set::Iter<'_, T> {
        self.data.iter()
    }

    /// Iterates the larger set in full, then whatever the smaller one adds.
    pub fn union<'a>(&'a self, other: &'a Set<T>) -> impl Iterator<Item = &'a T> + 'a {
        let (big, small) = if self.len() >= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        big.iter().chain(small.difference(big))
    }

    pub fn intersection<'a>(&'a self, other: &'a Set<T>) -> impl Iterator<Item = &'a T> + 'a {
        self.iter().filter(move |item| other.contains(item))
    }

    pub fn difference<'a>(&'a self, other: &'a Set<T>) -> impl Iterator<Item = &'a T> + 'a {
        self.iter().filter(move |item| !other.contains(item))
    }

    pub fn symmetric_difference<'a>(
        &'a self,
        other: &'a Set<T>,
    ) -> impl Iterator<Item = &'a T> + 'a {
        self.difference(other).chain(other.difference(self))
    }

    pub fn is_subset(&self, other: &Set<T>) -> bool {
        self.iter().all(|item| other.contains(item))
    }

    pub fn is_superset(&self, other: &Set<T>) -> bool {
        other.is_subset(self)
    }

    pub fn is_disjoint(&self, other: &Set<T>) -> bool {
        !self.iter().any(|item| other.contains(item))
    }
}

impl<T: Eq + Hash> PartialEq for Set<T> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.is_subset(other)
    }
}

impl<T: Eq + Hash> Eq for Set<T> {}

impl<T: Eq + Hash> FromIterator<T> for Set<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            data: iter.into_iter().collect(),
        }
    }
}

impl<T: Eq + Hash> Extend<T> for Set<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.data.extend(iter);
    }
}

impl<T: Eq + Hash> IntoIterator for Set<T> {
    type Item = T;
    type IntoIter = hash_set::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.data.into_iter()
    }
}

impl<'a, T: Eq + Hash> IntoIterator for &'a Set<T> {
    type Item = &'a T;
    type IntoIter = hash_set::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.data.iter()
    }
}

/// Collects borrowed items into an owned set.
pub fn collect_cloned<'a, T, I>(iter: I) -> Set<T>
where
    T: Eq + Hash + Clone + 'a,
    I: IntoIterator<Item = &'a T>,
{
    iter.into_iter().cloned().collect()
}
