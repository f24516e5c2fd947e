//! Tensor views over backend memory.

use std::cell::RefCell;
use std::fmt;
use std::ops::Range;
use std::rc::Rc;

use ndarray::{ArrayD, IxDyn};

use crate::Result;
use crate::error::RuntimeError;

/// A float buffer shared between a runner and the views it hands out.
pub type SharedBuffer = Rc<RefCell<Vec<f32>>>;

/// A named, shaped window onto a runner's memory.
///
/// Cloning a view clones the handle, not the data: writes through an input
/// view are what the next `run()` reads, and output views observe what the
/// last `run()` wrote.
#[derive(Clone)]
pub struct TensorView {
    name: String,
    shape: Vec<usize>,
    buffer: SharedBuffer,
    offset: usize,
    len: usize,
}

impl TensorView {
    /// Create a view of `shape` starting at `offset` in `buffer`.
    ///
    /// The range is checked on access, not here: a view whose range falls
    /// outside the buffer reports `InvalidInput` from every accessor.
    pub fn new(
        name: impl Into<String>,
        shape: Vec<usize>,
        buffer: SharedBuffer,
        offset: usize,
    ) -> Self {
        let len = element_count(&shape);
        Self {
            name: name.into(),
            shape,
            buffer,
            offset,
            len,
        }
    }

    /// Create a view backed by its own zeroed buffer.
    pub fn owned(name: impl Into<String>, shape: Vec<usize>) -> Self {
        let len: usize = shape.iter().product();
        let buffer = Rc::new(RefCell::new(vec![0.0; len]));
        Self::new(name, shape, buffer, 0)
    }

    /// Variable name as declared by the graph.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the view covers zero elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Element range inside the backing buffer.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset.saturating_add(self.len)
    }

    fn unreachable(&self, buffer_len: usize) -> RuntimeError {
        RuntimeError::InvalidInput(format!(
            "'{}' spans {:?} but its memory holds {} elements",
            self.name,
            self.range(),
            buffer_len
        ))
    }

    fn busy(&self) -> RuntimeError {
        RuntimeError::InvalidInput(format!("'{}' is in use by a running graph", self.name))
    }

    /// Borrow the viewed elements.
    ///
    /// Fails while a run holds the memory or when the range lies outside it.
    pub fn with<R>(&self, f: impl FnOnce(&[f32]) -> R) -> Result<R> {
        let buffer = self.buffer.try_borrow().map_err(|_| self.busy())?;
        let data = buffer
            .get(self.range())
            .ok_or_else(|| self.unreachable(buffer.len()))?;
        Ok(f(data))
    }

    /// Mutably borrow the viewed elements.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [f32]) -> R) -> Result<R> {
        let range = self.range();
        let mut buffer = self.buffer.try_borrow_mut().map_err(|_| self.busy())?;
        let buffer_len = buffer.len();
        let data = buffer
            .get_mut(range)
            .ok_or_else(|| self.unreachable(buffer_len))?;
        Ok(f(data))
    }

    /// Copy the viewed elements out.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        self.with(|data| data.to_vec())
    }

    /// Read a single element.
    pub fn get(&self, index: usize) -> Option<f32> {
        self.with(|data| data.get(index).copied()).ok().flatten()
    }

    /// Overwrite the viewed elements with `data`.
    pub fn set(&self, data: &[f32]) -> Result<()> {
        if data.len() != self.len {
            return Err(RuntimeError::InvalidInput(format!(
                "'{}' expects {} elements, got {}",
                self.name,
                self.len,
                data.len()
            )));
        }
        self.with_mut(|dst| dst.copy_from_slice(data))
    }

    /// Set every element to `value`.
    pub fn fill(&self, value: f32) -> Result<()> {
        self.with_mut(|dst| dst.fill(value))
    }

    /// Copy the view into an owned ndarray of the declared shape.
    pub fn to_array(&self) -> Result<ArrayD<f32>> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.to_vec()?)
            .map_err(|e| RuntimeError::InvalidInput(e.to_string()))
    }
}

/// Product of `shape`, saturating instead of overflowing.
fn element_count(shape: &[usize]) -> usize {
    shape.iter().fold(1usize, |acc, dim| acc.saturating_mul(*dim))
}

impl fmt::Debug for TensorView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorView")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("offset", &self.offset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_views_share_memory() {
        let buffer: SharedBuffer = Rc::new(RefCell::new(vec![0.0; 6]));
        let a = TensorView::new("a", vec![2], buffer.clone(), 0);
        let b = TensorView::new("b", vec![2, 2], buffer.clone(), 2);

        a.set(&[1.0, 2.0]).unwrap();
        b.fill(3.0).unwrap();

        assert_eq!(*buffer.borrow(), vec![1.0, 2.0, 3.0, 3.0, 3.0, 3.0]);

        let a2 = a.clone();
        a2.set(&[9.0, 8.0]).unwrap();
        assert_eq!(a.to_vec().unwrap(), vec![9.0, 8.0]);
        assert_eq!(a.get(1), Some(8.0));
    }

    #[test]
    fn test_set_rejects_wrong_length() {
        let view = TensorView::owned("x", vec![3]);
        assert!(matches!(view.set(&[1.0]), Err(RuntimeError::InvalidInput(_))));
    }

    #[test]
    fn test_to_array_keeps_shape() {
        let view = TensorView::owned("x", vec![2, 3]);
        view.with_mut(|d| {
            d.iter_mut()
                .enumerate()
                .for_each(|(i, v)| *v = i as f32)
        })
        .unwrap();
        let arr = view.to_array().unwrap();
        assert_eq!(arr.shape(), &[2, 3]);
        assert_eq!(arr[[1, 2]], 5.0);
    }

    #[test]
    fn test_view_outside_buffer_is_an_error() {
        let view = TensorView::new("x", vec![2], Rc::new(RefCell::new(vec![])), 0);

        assert!(matches!(view.set(&[1.0, 2.0]), Err(RuntimeError::InvalidInput(_))));
        assert!(matches!(view.to_vec(), Err(RuntimeError::InvalidInput(_))));
        assert!(view.fill(0.0).is_err());
        assert_eq!(view.get(0), None);
    }

    #[test]
    fn test_view_of_taken_buffer_is_an_error() {
        let buffer: SharedBuffer = Rc::new(RefCell::new(vec![0.0; 2]));
        let view = TensorView::new("x", vec![2], buffer.clone(), 0);

        let taken = buffer.take();
        assert!(matches!(view.set(&[1.0, 2.0]), Err(RuntimeError::InvalidInput(_))));
        buffer.replace(taken);
        view.set(&[1.0, 2.0]).unwrap();

        let _held = buffer.borrow_mut();
        assert!(matches!(
            view.to_vec(),
            Err(RuntimeError::InvalidInput(msg)) if msg.contains("in use")
        ));
    }

    #[test]
    fn test_oversized_shape_does_not_overflow() {
        let view = TensorView::new("x", vec![usize::MAX, 2], Rc::new(RefCell::new(vec![0.0])), 3);
        assert_eq!(view.len(), usize::MAX);
        assert_eq!(view.range().end, usize::MAX);
        assert!(view.to_vec().is_err());
    }
}
