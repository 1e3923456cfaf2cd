use std::collections::HashMap;
use std::hash::Hash;

// Interning table: each distinct value keeps the index it was first added at.
pub struct IndexMap<T> {
    values: Vec<T>,
    indices: HashMap<T, usize>,
}

impl<T> Default for IndexMap<T> {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            indices: HashMap::new(),
        }
    }
}

impl<T: Eq + Hash + Clone> IndexMap<T> {
    pub fn add(&mut self, value: T) -> usize {
        if let Some(index) = self.indices.get(&value) {
            return *index;
        }

        let index = self.values.len();
        self.indices.insert(value.clone(), index);
        self.values.push(value);
        index
    }

    pub fn index_of(&self, value: &T) -> Option<usize> {
        self.indices.get(value).copied()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.values.get(index)
    }
}
