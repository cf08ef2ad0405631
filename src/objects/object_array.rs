use crate::value::Value;

pub struct ObjectArray {
    pub items: Vec<Value>,
}

impl ObjectArray {
    pub fn with_capacity(capacity: usize) -> ObjectArray {
        ObjectArray {
            items: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Bounds-checked read. Negative or past-the-end indices yield `None`.
    pub fn get(&self, index: i64) -> Option<Value> {
        if index < 0 {
            return None;
        }
        self.items.get(index as usize).copied()
    }

    /// Writes in place, or appends when `index == len`. Anything further is out of range.
    pub fn set(&mut self, index: i64, value: Value) -> bool {
        if index < 0 {
            return false;
        }
        let index = index as usize;
        if index < self.items.len() {
            self.items[index] = value;
            true
        } else if index == self.items.len() {
            self.items.push(value);
            true
        } else {
            false
        }
    }

    pub fn push(&mut self, value: Value) {
        self.items.push(value);
    }
}
