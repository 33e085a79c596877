//! Generally useful container data structures

use unordered::UnorderedMap;

/// A set of values of type `T`, which maintain their order of insertion into the set. Each value
/// is assigned a dense index on first insertion, and keeps that index for as long as the set lives.
#[derive(Default, Clone)]
pub struct InsertionOrderedSet<T: Eq + std::hash::Hash + Ord + Clone> {
    data: Vec<T>,
    revmap: UnorderedMap<T, usize>,
}

impl<T: Eq + std::hash::Hash + Ord + Clone> InsertionOrderedSet<T> {
    /// Insert `v` into the set, returning its index and whether it was newly inserted. If `v`
    /// already exists in the set, its pre-existing index is returned.
    pub fn insert_full(&mut self, v: T) -> (usize, bool) {
        if let Some(idx) = self.revmap.get(&v) {
            (*idx, false)
        } else {
            let idx = self.data.len();
            self.data.push(v.clone());
            self.revmap.insert(v, idx);
            (idx, true)
        }
    }

    /// Get the index of `v` if it exists in the set
    pub fn get_index(&self, v: &T) -> Option<usize> {
        self.revmap.get(v).cloned()
    }

    /// Iterate over the storage, in the order of insertion
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.data.iter()
    }
}

impl<T: Eq + std::hash::Hash + Ord + Clone + std::fmt::Debug> std::fmt::Debug
    for InsertionOrderedSet<T>
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_map().entries(self.data.iter().enumerate()).finish()
    }
}

pub mod unordered {
    #[cfg(not(feature = "deterministic_containers"))]
    type BaseMap<K, V> = std::collections::HashMap<K, V>;
    #[cfg(feature = "deterministic_containers")]
    type BaseMap<K, V> = std::collections::BTreeMap<K, V>;
    #[cfg(not(feature = "deterministic_containers"))]
    pub type UnorderedMapEntry<'a, K, V> = std::collections::hash_map::Entry<'a, K, V>;
    #[cfg(feature = "deterministic_containers")]
    pub type UnorderedMapEntry<'a, K, V> = std::collections::btree_map::Entry<'a, K, V>;
    #[cfg(not(feature = "deterministic_containers"))]
    type BaseSet<T> = std::collections::HashSet<T>;
    #[cfg(feature = "deterministic_containers")]
    type BaseSet<T> = std::collections::BTreeSet<T>;

    /// An unordered map type. This type specifies the _intention_ of unorderedness, but allows the
    /// crate's features to dictate whether it actually use non-determinism at runtime.
    ///
    /// Anything that feeds into the numbering of SSA indices or stack variables must not iterate
    /// over one of these; use the flow's block order instead.
    #[derive(Clone, PartialEq, Eq)]
    pub struct UnorderedMap<K: std::hash::Hash + Ord + Eq, V> {
        map: BaseMap<K, V>,
    }

    impl<K: std::hash::Hash + Ord + Eq, V> UnorderedMap<K, V> {
        /// Make a new, empty unordered map
        pub fn new() -> Self {
            Self {
                map: Default::default(),
            }
        }

        /// Get an iterator over the entries of the map.
        pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
            self.map.iter()
        }

        /// Returns `true` if the map contains a value for the specified key.
        pub fn contains_key<Q: ?Sized>(&self, k: &Q) -> bool
        where
            K: std::borrow::Borrow<Q>,
            Q: std::hash::Hash + Ord + Eq,
        {
            self.map.contains_key(k)
        }

        /// Returns a reference to the value corresponding to the key.
        pub fn get<Q: ?Sized>(&self, k: &Q) -> Option<&V>
        where
            K: std::borrow::Borrow<Q>,
            Q: std::hash::Hash + Ord + Eq,
        {
            self.map.get(k)
        }

        /// Returns a mutable reference to the value corresponding to the key.
        pub fn get_mut<Q: ?Sized>(&mut self, k: &Q) -> Option<&mut V>
        where
            K: std::borrow::Borrow<Q>,
            Q: std::hash::Hash + Ord + Eq,
        {
            self.map.get_mut(k)
        }

        /// Inserts a key-value pair into the map, returning the old value if there was one.
        pub fn insert(&mut self, k: K, v: V) -> Option<V> {
            self.map.insert(k, v)
        }

        /// Gets the given key's corresponding entry in the map for in-place manipulation.
        pub fn entry(&mut self, key: K) -> UnorderedMapEntry<'_, K, V> {
            self.map.entry(key)
        }
    }

    impl<K: std::hash::Hash + Ord + Eq, V> Default for UnorderedMap<K, V> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<K, Q: ?Sized, V> std::ops::Index<&Q> for UnorderedMap<K, V>
    where
        K: std::hash::Hash + Ord + Eq + std::borrow::Borrow<Q>,
        Q: std::hash::Hash + Ord + Eq,
    {
        type Output = V;

        fn index(&self, key: &Q) -> &V {
            self.map.get(key).expect("key not present in map")
        }
    }

    impl<K: std::hash::Hash + Ord + Eq, V> FromIterator<(K, V)> for UnorderedMap<K, V> {
        fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
            Self {
                map: BaseMap::from_iter(iter),
            }
        }
    }

    impl<K: std::hash::Hash + Ord + Eq + std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug
        for UnorderedMap<K, V>
    {
        #[cfg(not(feature = "deterministic_containers"))]
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            self.map
                .iter()
                .collect::<std::collections::BTreeMap<_, _>>()
                .fmt(f)
        }
        #[cfg(feature = "deterministic_containers")]
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            self.map.fmt(f)
        }
    }

    /// An unordered set type. Same caveats as [`UnorderedMap`].
    #[derive(Clone, PartialEq, Eq)]
    pub struct UnorderedSet<T: std::hash::Hash + Ord + Eq> {
        set: BaseSet<T>,
    }

    impl<T: std::hash::Hash + Ord + Eq> UnorderedSet<T> {
        /// Make a new, empty unordered set
        pub fn new() -> Self {
            Self {
                set: BaseSet::new(),
            }
        }

        /// Adds a value to the set, returning whether it was newly added.
        pub fn insert(&mut self, value: T) -> bool {
            self.set.insert(value)
        }

        /// Get an iterator over the elements of the set.
        pub fn iter(&self) -> impl Iterator<Item = &T> {
            self.set.iter()
        }

        /// Returns the number of elements in the set.
        pub fn len(&self) -> usize {
            self.set.len()
        }

        /// Returns `true` if the set contains no elements.
        pub fn is_empty(&self) -> bool {
            self.set.is_empty()
        }

        /// Visits the values representing the union, i.e., all the values in `self` or `other`,
        /// without duplicates.
        pub fn union<'a>(&'a self, other: &'a Self) -> impl Iterator<Item = &'a T> {
            self.set.union(&other.set)
        }
    }

    impl<T: std::hash::Hash + Ord + Eq> Default for UnorderedSet<T> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<T: std::hash::Hash + Ord + Eq + std::fmt::Debug> std::fmt::Debug for UnorderedSet<T> {
        #[cfg(not(feature = "deterministic_containers"))]
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            self.set
                .iter()
                .collect::<std::collections::BTreeSet<_>>()
                .fmt(f)
        }
        #[cfg(feature = "deterministic_containers")]
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            self.set.fmt(f)
        }
    }

    impl<'a, T: std::hash::Hash + Ord + Eq> IntoIterator for &'a UnorderedSet<T> {
        type Item = &'a T;
        type IntoIter = <&'a BaseSet<T> as IntoIterator>::IntoIter;

        fn into_iter(self) -> Self::IntoIter {
            self.set.iter()
        }
    }

    impl<T: std::hash::Hash + Ord + Eq> FromIterator<T> for UnorderedSet<T> {
        fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
            Self {
                set: BaseSet::from_iter(iter),
            }
        }
    }
}
