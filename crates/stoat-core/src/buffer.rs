use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::Shape;

// TensorBuffer - the unit of data interchange between execution stages
//
// A TensorBuffer is an owned, dtype-tagged, shape-tagged, layout-tagged block
// of elements. Parameters, model inputs, intermediate activations, layout
// conversion scratch, and user-visible outputs are all TensorBuffers.
//
// MEMORY MODEL:
//
//   The handle is an Arc over the buffer metadata, and the element storage is
//   a further Arc<RwLock<Storage>> inside it. Cloning a handle is O(1), so a
//   kernel op, the program's keep-alive list, and the caller can all hold the
//   same buffer without copying data, and the storage is freed when the last
//   owner drops. Identity is the allocation, not the bytes: every buffer gets
//   a process-unique BufferId at creation, and an alias (reshape view) is a
//   new buffer sharing the old storage.

/// Flat element storage behind a buffer.
///
/// Kernels compute in f32 or f64; half-precision model data is widened to f32
/// when the model is decoded, so no half storage variant exists.
#[derive(Debug, Clone)]
pub enum Storage {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Storage {
    /// Zero-filled storage of the given dtype and element count.
    pub fn zeros(dtype: DType, len: usize) -> Result<Storage> {
        match dtype {
            DType::F32 => Ok(Storage::F32(vec![0.0; len])),
            DType::F64 => Ok(Storage::F64(vec![0.0; len])),
            DType::F16 | DType::BF16 => Err(Error::msg(format!(
                "no storage for {dtype}: half data is widened to f32 at load time"
            ))),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Storage::F32(_) => DType::F32,
            Storage::F64(_) => DType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Storage::F32(v) => v.len(),
            Storage::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scalar types that have a Storage variant.
///
/// This is the bridge kernels use to get typed slices out of a buffer.
/// Half types implement WithDType but not StorageScalar, which keeps
/// "no half compute" a compile-time fact rather than a runtime check.
pub trait StorageScalar: WithDType {
    fn vec_into_storage(v: Vec<Self>) -> Storage;
    fn slice(storage: &Storage) -> Result<&[Self]>;
    fn slice_mut(storage: &mut Storage) -> Result<&mut [Self]>;
}

impl StorageScalar for f32 {
    fn vec_into_storage(v: Vec<Self>) -> Storage {
        Storage::F32(v)
    }
    fn slice(storage: &Storage) -> Result<&[Self]> {
        match storage {
            Storage::F32(v) => Ok(v),
            other => Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: other.dtype(),
            }),
        }
    }
    fn slice_mut(storage: &mut Storage) -> Result<&mut [Self]> {
        match storage {
            Storage::F32(v) => Ok(v),
            other => Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: other.dtype(),
            }),
        }
    }
}

impl StorageScalar for f64 {
    fn vec_into_storage(v: Vec<Self>) -> Storage {
        Storage::F64(v)
    }
    fn slice(storage: &Storage) -> Result<&[Self]> {
        match storage {
            Storage::F64(v) => Ok(v),
            other => Err(Error::DTypeMismatch {
                expected: DType::F64,
                got: other.dtype(),
            }),
        }
    }
    fn slice_mut(storage: &mut Storage) -> Result<&mut [Self]> {
        match storage {
            Storage::F64(v) => Ok(v),
            other => Err(Error::DTypeMismatch {
                expected: DType::F64,
                got: other.dtype(),
            }),
        }
    }
}

/// Process-unique identity of one buffer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(usize);

static NEXT_BUFFER_ID: AtomicUsize = AtomicUsize::new(1);

impl BufferId {
    fn fresh() -> Self {
        BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

struct BufferInner {
    id: BufferId,
    dtype: DType,
    shape: Shape,
    layout: Layout,
    storage: Arc<RwLock<Storage>>,
}

/// An owned, dtype/shape/layout-tagged block of elements.
pub struct TensorBuffer {
    inner: Arc<BufferInner>,
}

// Manual Clone: Arc::clone is cheap.
impl Clone for TensorBuffer {
    fn clone(&self) -> Self {
        TensorBuffer {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn check_layout_rank(layout: Layout, shape: &Shape) -> Result<()> {
    let ok = match layout {
        Layout::Nchw | Layout::Nhwc => shape.rank() == 4,
        Layout::Nc => shape.rank() == 2,
        Layout::X => true,
    };
    if ok {
        Ok(())
    } else {
        Err(Error::msg(format!(
            "layout {layout} does not fit shape {shape}"
        )))
    }
}

impl TensorBuffer {
    /// Allocate a zero-filled buffer.
    pub fn zeros(dtype: DType, shape: impl Into<Shape>, layout: Layout) -> Result<Self> {
        let shape = shape.into();
        check_layout_rank(layout, &shape)?;
        let storage = Storage::zeros(dtype, shape.elem_count())?;
        Ok(Self::from_parts(storage, shape, layout))
    }

    /// Build a buffer from already-populated elements in natural layout.
    pub fn from_vec<T: StorageScalar>(data: Vec<T>, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let layout = Layout::natural_for(&shape);
        Ok(Self::from_parts(T::vec_into_storage(data), shape, layout))
    }

    fn from_parts(storage: Storage, shape: Shape, layout: Layout) -> Self {
        TensorBuffer {
            inner: Arc::new(BufferInner {
                id: BufferId::fresh(),
                dtype: storage.dtype(),
                shape,
                layout,
                storage: Arc::new(RwLock::new(storage)),
            }),
        }
    }

    /// A new buffer over the same storage with a different shape.
    ///
    /// This is the layout-preserving reshape: no elements move, so the source
    /// must already be in natural order and the element counts must agree.
    pub fn alias_reshape(&self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if !self.layout().is_natural() {
            return Err(Error::msg(format!(
                "cannot alias-reshape a {} buffer: elements are not in logical order",
                self.layout()
            )));
        }
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: self.elem_count(),
                got: shape.elem_count(),
                shape,
            });
        }
        let layout = Layout::natural_for(&shape);
        Ok(TensorBuffer {
            inner: Arc::new(BufferInner {
                id: BufferId::fresh(),
                dtype: self.dtype(),
                shape,
                layout,
                storage: Arc::clone(&self.inner.storage),
            }),
        })
    }

    pub fn id(&self) -> BufferId {
        self.inner.id
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.inner.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.shape.dims()
    }

    pub fn layout(&self) -> Layout {
        self.inner.layout
    }

    pub fn rank(&self) -> usize {
        self.inner.shape.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.inner.shape.elem_count()
    }

    /// Whether two handles point at the same allocation.
    pub fn ptr_eq(&self, other: &TensorBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether two buffers share element storage (true for reshape aliases).
    pub fn same_storage(&self, other: &TensorBuffer) -> bool {
        Arc::ptr_eq(&self.inner.storage, &other.inner.storage)
    }

    /// Read access to the storage.
    pub fn read(&self) -> Result<RwLockReadGuard<'_, Storage>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg("tensor buffer lock poisoned"))
    }

    /// Write access to the storage.
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, Storage>> {
        self.inner
            .storage
            .write()
            .map_err(|_| Error::msg("tensor buffer lock poisoned"))
    }

    /// Overwrite the buffer's elements from a slice of the same dtype/length.
    pub fn copy_from_slice<T: StorageScalar>(&self, data: &[T]) -> Result<()> {
        if T::DTYPE != self.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: T::DTYPE,
            });
        }
        if data.len() != self.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: self.elem_count(),
                got: data.len(),
                shape: self.shape().clone(),
            });
        }
        let mut guard = self.write()?;
        T::slice_mut(&mut guard)?.copy_from_slice(data);
        Ok(())
    }

    /// Copy the elements out as a typed vec.
    pub fn to_vec<T: StorageScalar>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: T::DTYPE,
            });
        }
        let guard = self.read()?;
        Ok(T::slice(&guard)?.to_vec())
    }

    /// Copy the elements out widened to f64, whatever the dtype.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let guard = self.read()?;
        Ok(match &*guard {
            Storage::F32(v) => v.iter().map(|&x| x as f64).collect(),
            Storage::F64(v) => v.clone(),
        })
    }
}

impl fmt::Debug for TensorBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorBuffer")
            .field("id", &self.inner.id)
            .field("dtype", &self.inner.dtype)
            .field("shape", &self.inner.shape)
            .field("layout", &self.inner.layout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros_invariant() {
        let b = TensorBuffer::zeros(DType::F32, (2, 3), Layout::Nc).unwrap();
        assert_eq!(b.elem_count(), 6);
        assert_eq!(b.read().unwrap().len(), 6);
        assert_eq!(b.layout(), Layout::Nc);
    }

    #[test]
    fn test_zeros_rejects_bad_layout() {
        assert!(TensorBuffer::zeros(DType::F32, (2, 3), Layout::Nchw).is_err());
        assert!(TensorBuffer::zeros(DType::F16, (2, 3), Layout::Nc).is_err());
    }

    #[test]
    fn test_from_vec_count_mismatch() {
        let err = TensorBuffer::from_vec(vec![1.0f32, 2.0], (3usize,));
        assert!(matches!(
            err,
            Err(Error::ElementCountMismatch { expected: 3, got: 2, .. })
        ));
    }

    #[test]
    fn test_alias_reshape_shares_storage() {
        let b = TensorBuffer::from_vec(vec![0.0f32; 12], (3, 4)).unwrap();
        let r = b.alias_reshape(vec![2, 6]).unwrap();
        assert!(b.same_storage(&r));
        assert!(!b.ptr_eq(&r));
        assert_ne!(b.id(), r.id());
        // A write through one handle is visible through the other.
        b.copy_from_slice(&[1.0f32; 12]).unwrap();
        assert_eq!(r.to_vec::<f32>().unwrap(), vec![1.0f32; 12]);
    }

    #[test]
    fn test_alias_reshape_count_mismatch() {
        let b = TensorBuffer::from_vec(vec![0.0f32; 12], (3, 4)).unwrap();
        assert!(b.alias_reshape(vec![5, 5]).is_err());
    }

    #[test]
    fn test_copy_from_slice_dtype_mismatch() {
        let b = TensorBuffer::zeros(DType::F32, (2, 2), Layout::Nc).unwrap();
        assert!(b.copy_from_slice(&[1.0f64; 4]).is_err());
    }
}
