//! Handle tables for backend-owned resources

use std::collections::HashMap;

use crate::error::GpuError;

/// Map from numeric handle to resource; ids are never reused
pub struct ResourceTable<T> {
    kind: &'static str,
    items: HashMap<u32, T>,
    next_id: u32,
}

impl<T> ResourceTable<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            items: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn insert(&mut self, item: T) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.items.insert(id, item);
        id
    }

    pub fn get(&self, id: u32) -> Result<&T, GpuError> {
        self.items
            .get(&id)
            .ok_or(GpuError::InvalidHandle { kind: self.kind, id })
    }

    pub fn get_mut(&mut self, id: u32) -> Result<&mut T, GpuError> {
        self.items
            .get_mut(&id)
            .ok_or(GpuError::InvalidHandle { kind: self.kind, id })
    }

    pub fn remove(&mut self, id: u32) -> Option<T> {
        self.items.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
