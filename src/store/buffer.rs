//! Append-only buffers with explicit doubling growth.

/// Capacity a fresh buffer starts with.
pub const INITIAL_CAPACITY: usize = 100;

/// Append-only buffer that doubles its capacity when full.
///
/// Appends are O(1) amortized and `n` appends move O(n) elements in total.
/// Reads from an index borrow the stored suffix without copying.
#[derive(Debug, Clone)]
pub struct GrowthBuffer<T> {
    data: Vec<T>,
    capacity: usize,
}

impl<T> Default for GrowthBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> GrowthBuffer<T> {
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(INITIAL_CAPACITY),
            capacity: INITIAL_CAPACITY,
        }
    }

    /// Build a buffer from already-collected rows in one allocation step.
    pub fn from_vec(mut data: Vec<T>) -> Self {
        let mut capacity = INITIAL_CAPACITY;
        while capacity < data.len() {
            capacity *= 2;
        }
        data.reserve_exact(capacity - data.len());
        Self { data, capacity }
    }

    pub fn push(&mut self, value: T) {
        if self.data.len() == self.capacity {
            self.capacity *= 2;
            self.data.reserve_exact(self.capacity - self.data.len());
        }
        self.data.push(value);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Logical capacity; doubles each time the buffer fills up.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Elements from `index` on; empty when `index` is past the end.
    pub fn from_index(&self, index: usize) -> &[T] {
        self.data.get(index..).unwrap_or(&[])
    }

    pub fn last(&self) -> Option<&T> {
        self.data.last()
    }
}

/// Fixed-width rows stored contiguously in a [`GrowthBuffer`].
#[derive(Debug, Clone)]
pub struct RowBuffer<T, const W: usize> {
    rows: GrowthBuffer<[T; W]>,
}

impl<T, const W: usize> Default for RowBuffer<T, W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const W: usize> RowBuffer<T, W> {
    pub fn new() -> Self {
        Self {
            rows: GrowthBuffer::new(),
        }
    }

    pub fn push_row(&mut self, row: [T; W]) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.rows.capacity()
    }

    pub fn rows(&self) -> &[[T; W]] {
        self.rows.as_slice()
    }

    pub fn rows_from(&self, index: usize) -> &[[T; W]] {
        self.rows.from_index(index)
    }

    /// Values of one column, in row order.
    pub fn column(&self, col: usize) -> impl Iterator<Item = &T> + '_ {
        self.rows.as_slice().iter().filter_map(move |row| row.get(col))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_thresholds_keep_every_element() {
        let mut buf = GrowthBuffer::new();
        assert_eq!(buf.capacity(), INITIAL_CAPACITY);

        for i in 0..99 {
            buf.push(i);
        }
        assert_eq!(buf.len(), 99);
        assert_eq!(buf.capacity(), 100);

        buf.push(99);
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.capacity(), 100);

        buf.push(100);
        assert_eq!(buf.len(), 101);
        assert_eq!(buf.capacity(), 200);

        let expected: Vec<i32> = (0..101).collect();
        assert_eq!(buf.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_from_index_suffix() {
        let mut buf = GrowthBuffer::new();
        for i in 0..250u32 {
            buf.push(i);
        }
        assert_eq!(buf.capacity(), 400);
        assert_eq!(buf.from_index(0).len(), 250);
        assert_eq!(buf.from_index(248), &[248, 249]);
        assert!(buf.from_index(250).is_empty());
        assert!(buf.from_index(1000).is_empty());
    }

    #[test]
    fn test_from_vec_capacity() {
        let buf = GrowthBuffer::from_vec((0..150).collect::<Vec<u8>>());
        assert_eq!(buf.len(), 150);
        assert_eq!(buf.capacity(), 200);

        let small = GrowthBuffer::from_vec(vec![1u8]);
        assert_eq!(small.capacity(), INITIAL_CAPACITY);
    }

    #[test]
    fn test_row_buffer_columns() {
        let mut rows: RowBuffer<f64, 3> = RowBuffer::new();
        rows.push_row([0.1, 4.0, 0.0]);
        rows.push_row([0.2, 5.0, 1.0]);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows.rows_from(1), &[[0.2, 5.0, 1.0]]);
        let values: Vec<f64> = rows.column(1).copied().collect();
        assert_eq!(values, vec![4.0, 5.0]);
    }
}
