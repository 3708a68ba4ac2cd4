//! Size, shape and byte-view adapters for host containers.
//!
//! Every supported container variant has exactly one [`Container`] impl,
//! chosen by its static type. Contiguous variants hand out a borrowed view of
//! their storage; nested sequences and non-standard matrix layouts are
//! linearized into one owned row-major buffer.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use tracing::trace;

use crate::dtype::{DType, Element};
use crate::error::{DataError, Result};

/// Dimensions of a container: rank 0 (scalar), 1 or 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: [usize; 2],
    rank: usize,
}

impl Shape {
    /// Highest supported rank.
    pub const MAX_RANK: usize = 2;

    pub const fn scalar() -> Self {
        Self {
            dims: [0, 0],
            rank: 0,
        }
    }

    pub const fn vector(len: usize) -> Self {
        Self {
            dims: [len, 0],
            rank: 1,
        }
    }

    pub const fn matrix(rows: usize, cols: usize) -> Self {
        Self {
            dims: [rows, cols],
            rank: 2,
        }
    }

    /// Build a shape from a dimension list; `None` above [`Shape::MAX_RANK`].
    pub fn from_dims(dims: &[usize]) -> Option<Self> {
        match *dims {
            [] => Some(Self::scalar()),
            [len] => Some(Self::vector(len)),
            [rows, cols] => Some(Self::matrix(rows, cols)),
            _ => None,
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims[..self.rank]
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Product of all dimensions. A scalar holds one element.
    pub fn element_count(&self) -> usize {
        self.dims().iter().product()
    }

    /// Like [`Shape::element_count`], but `None` on overflow.
    pub fn checked_element_count(&self) -> Option<usize> {
        self.dims()
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
    }
}

/// Renders as `(d1,d2,)`, one trailing comma per dimension; scalars as `()`.
impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for dim in self.dims() {
            write!(f, "{dim},")?;
        }
        f.write_str(")")
    }
}

impl FromStr for Shape {
    type Err = DataError;

    fn from_str(text: &str) -> Result<Self> {
        parse_tuple(text).map_err(|reason| DataError::MalformedHeader {
            header: text.to_string(),
            reason,
        })
    }
}

pub(crate) fn parse_tuple(text: &str) -> std::result::Result<Shape, String> {
    let inner = text
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| format!("shape {text:?} is not a parenthesized tuple"))?;
    if inner.is_empty() {
        return Ok(Shape::scalar());
    }

    let inner = inner
        .strip_suffix(',')
        .ok_or_else(|| format!("shape {text:?} lacks the trailing comma"))?;
    let dims = inner
        .split(',')
        .map(|dim| {
            dim.parse::<usize>()
                .map_err(|_| format!("shape dimension {dim:?} is not a count"))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Shape::from_dims(&dims).ok_or_else(|| {
        format!(
            "shape {text:?} has rank {}, at most {} is supported",
            dims.len(),
            Shape::MAX_RANK
        )
    })
}

/// Read-only view of a container as typed, shaped bytes.
///
/// The trait is object safe so a flush can carry heterogeneous arguments as
/// `&dyn Container`.
pub trait Container {
    /// Element type of every value in the container.
    fn dtype(&self) -> DType;

    /// Logical dimensions. Nested sequences take their column count from the
    /// first row; [`Container::bytes`] rejects rows that disagree.
    fn shape(&self) -> Shape;

    /// Number of elements, saturating at `usize::MAX`.
    fn len(&self) -> usize {
        self.shape().checked_element_count().unwrap_or(usize::MAX)
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload bytes in row-major order, native byte order.
    ///
    /// Borrowed when the storage is already contiguous, owned otherwise.
    fn bytes(&self) -> Result<Cow<'_, [u8]>>;
}

/// A container that can be overwritten in place from a reply payload.
///
/// The container is never resized: `bytes` must be exactly as long as the
/// payload [`Container::bytes`] produced.
pub trait ContainerMut: Container {
    fn write_back(&mut self, bytes: &[u8]) -> Result<()>;
}

fn check_reply_len(expected: usize, found: usize) -> Result<()> {
    if expected != found {
        return Err(DataError::ReplyLengthMismatch { expected, found });
    }
    Ok(())
}

fn fill<T: Element>(dst: &mut [T], bytes: &[u8]) -> Result<()> {
    let dst = bytemuck::cast_slice_mut::<T, u8>(dst);
    check_reply_len(dst.len(), bytes.len())?;
    dst.copy_from_slice(bytes);
    Ok(())
}

fn nested_shape<T, R: AsRef<[T]>>(rows: &[R]) -> Shape {
    match rows.first() {
        Some(first) => Shape::matrix(rows.len(), first.as_ref().len()),
        None => Shape::matrix(0, 0),
    }
}

/// Column count shared by every row.
fn uniform_columns<T, R: AsRef<[T]>>(rows: &[R]) -> Result<usize> {
    let expected = rows.first().map_or(0, |row| row.as_ref().len());
    for (row, values) in rows.iter().enumerate() {
        let found = values.as_ref().len();
        if found != expected {
            return Err(DataError::RaggedRows {
                row,
                expected,
                found,
            });
        }
    }
    Ok(expected)
}

fn linearize_rows<T: Element, R: AsRef<[T]>>(rows: &[R]) -> Result<Vec<u8>> {
    let cols = uniform_columns::<T, R>(rows)?;
    let mut out = Vec::with_capacity(rows.len() * cols * std::mem::size_of::<T>());
    for row in rows {
        out.extend_from_slice(bytemuck::cast_slice(row.as_ref()));
    }
    trace!(rows = rows.len(), cols, len = out.len(), "linearized nested sequence");
    Ok(out)
}

fn scatter_rows<T: Element, R: AsRef<[T]> + AsMut<[T]>>(
    rows: &mut [R],
    bytes: &[u8],
) -> Result<()> {
    let cols = uniform_columns::<T, R>(rows)?;
    let row_len = cols * std::mem::size_of::<T>();
    check_reply_len(rows.len() * row_len, bytes.len())?;
    if row_len == 0 {
        return Ok(());
    }
    for (row, chunk) in rows.iter_mut().zip(bytes.chunks_exact(row_len)) {
        bytemuck::cast_slice_mut::<T, u8>(row.as_mut()).copy_from_slice(chunk);
    }
    Ok(())
}

macro_rules! impl_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Container for $ty {
                fn dtype(&self) -> DType {
                    <$ty as Element>::DTYPE
                }

                fn shape(&self) -> Shape {
                    Shape::scalar()
                }

                fn bytes(&self) -> Result<Cow<'_, [u8]>> {
                    Ok(Cow::Borrowed(bytemuck::bytes_of(self)))
                }
            }

            impl ContainerMut for $ty {
                fn write_back(&mut self, bytes: &[u8]) -> Result<()> {
                    let dst = bytemuck::bytes_of_mut(self);
                    check_reply_len(dst.len(), bytes.len())?;
                    dst.copy_from_slice(bytes);
                    Ok(())
                }
            }
        )*
    };
}

impl_scalar!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

impl<T: Element> Container for [T] {
    fn dtype(&self) -> DType {
        T::DTYPE
    }

    fn shape(&self) -> Shape {
        Shape::vector(<[T]>::len(self))
    }

    fn bytes(&self) -> Result<Cow<'_, [u8]>> {
        Ok(Cow::Borrowed(bytemuck::cast_slice(self)))
    }
}

impl<T: Element> ContainerMut for [T] {
    fn write_back(&mut self, bytes: &[u8]) -> Result<()> {
        fill(self, bytes)
    }
}

impl<T: Element> Container for Vec<T> {
    fn dtype(&self) -> DType {
        T::DTYPE
    }

    fn shape(&self) -> Shape {
        self.as_slice().shape()
    }

    fn bytes(&self) -> Result<Cow<'_, [u8]>> {
        self.as_slice().bytes()
    }
}

impl<T: Element> ContainerMut for Vec<T> {
    fn write_back(&mut self, bytes: &[u8]) -> Result<()> {
        fill(self.as_mut_slice(), bytes)
    }
}

impl<T: Element, const N: usize> Container for [T; N] {
    fn dtype(&self) -> DType {
        T::DTYPE
    }

    fn shape(&self) -> Shape {
        Shape::vector(N)
    }

    fn bytes(&self) -> Result<Cow<'_, [u8]>> {
        self.as_slice().bytes()
    }
}

impl<T: Element, const N: usize> ContainerMut for [T; N] {
    fn write_back(&mut self, bytes: &[u8]) -> Result<()> {
        fill(self.as_mut_slice(), bytes)
    }
}

impl<T: Element> Container for [Vec<T>] {
    fn dtype(&self) -> DType {
        T::DTYPE
    }

    fn shape(&self) -> Shape {
        nested_shape::<T, _>(self)
    }

    fn bytes(&self) -> Result<Cow<'_, [u8]>> {
        linearize_rows::<T, _>(self).map(Cow::Owned)
    }
}

impl<T: Element> ContainerMut for [Vec<T>] {
    fn write_back(&mut self, bytes: &[u8]) -> Result<()> {
        scatter_rows::<T, _>(self, bytes)
    }
}

impl<T: Element> Container for Vec<Vec<T>> {
    fn dtype(&self) -> DType {
        T::DTYPE
    }

    fn shape(&self) -> Shape {
        nested_shape::<T, _>(self.as_slice())
    }

    fn bytes(&self) -> Result<Cow<'_, [u8]>> {
        linearize_rows::<T, _>(self.as_slice()).map(Cow::Owned)
    }
}

impl<T: Element> ContainerMut for Vec<Vec<T>> {
    fn write_back(&mut self, bytes: &[u8]) -> Result<()> {
        scatter_rows::<T, _>(self.as_mut_slice(), bytes)
    }
}

/// Fixed-size rows are contiguous by construction, so no copy is needed.
impl<T: Element, const C: usize, const R: usize> Container for [[T; C]; R] {
    fn dtype(&self) -> DType {
        T::DTYPE
    }

    fn shape(&self) -> Shape {
        Shape::matrix(R, C)
    }

    fn bytes(&self) -> Result<Cow<'_, [u8]>> {
        Ok(Cow::Borrowed(bytemuck::cast_slice(self.as_flattened())))
    }
}

impl<T: Element, const C: usize, const R: usize> ContainerMut for [[T; C]; R] {
    fn write_back(&mut self, bytes: &[u8]) -> Result<()> {
        fill(self.as_flattened_mut(), bytes)
    }
}

/// Character data: one element per UTF-8 byte.
impl Container for str {
    fn dtype(&self) -> DType {
        DType::Char
    }

    fn shape(&self) -> Shape {
        Shape::vector(str::len(self))
    }

    fn bytes(&self) -> Result<Cow<'_, [u8]>> {
        Ok(Cow::Borrowed(self.as_bytes()))
    }
}

impl Container for String {
    fn dtype(&self) -> DType {
        DType::Char
    }

    fn shape(&self) -> Shape {
        self.as_str().shape()
    }

    fn bytes(&self) -> Result<Cow<'_, [u8]>> {
        Ok(Cow::Borrowed(self.as_bytes()))
    }
}

impl<C: Container + ?Sized> Container for &C {
    fn dtype(&self) -> DType {
        (**self).dtype()
    }

    fn shape(&self) -> Shape {
        (**self).shape()
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn bytes(&self) -> Result<Cow<'_, [u8]>> {
        (**self).bytes()
    }
}

impl<C: Container + ?Sized> Container for &mut C {
    fn dtype(&self) -> DType {
        (**self).dtype()
    }

    fn shape(&self) -> Shape {
        (**self).shape()
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn bytes(&self) -> Result<Cow<'_, [u8]>> {
        (**self).bytes()
    }
}

impl<C: ContainerMut + ?Sized> ContainerMut for &mut C {
    fn write_back(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).write_back(bytes)
    }
}

impl<C: Container + ?Sized> Container for Box<C> {
    fn dtype(&self) -> DType {
        (**self).dtype()
    }

    fn shape(&self) -> Shape {
        (**self).shape()
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn bytes(&self) -> Result<Cow<'_, [u8]>> {
        (**self).bytes()
    }
}

impl<C: ContainerMut + ?Sized> ContainerMut for Box<C> {
    fn write_back(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).write_back(bytes)
    }
}

#[cfg(feature = "ndarray")]
mod dense {
    use std::borrow::Cow;

    use ndarray::{ArrayBase, Data, DataMut, Dimension, Ix1, Ix2};
    use tracing::trace;

    use super::{check_reply_len, fill, Container, ContainerMut, Shape};
    use crate::dtype::{DType, Element};
    use crate::error::Result;

    /// Standard-layout arrays are viewed in place; any other layout is copied
    /// out in logical row-major order.
    fn dense_bytes<A: Element, S: Data<Elem = A>, D: Dimension>(
        array: &ArrayBase<S, D>,
    ) -> Cow<'_, [u8]> {
        if let Some(values) = array.as_slice() {
            return Cow::Borrowed(bytemuck::cast_slice(values));
        }
        let mut out = Vec::with_capacity(array.len() * std::mem::size_of::<A>());
        for value in array.iter() {
            out.extend_from_slice(bytemuck::bytes_of(value));
        }
        trace!(shape = ?array.shape(), len = out.len(), "linearized non-standard layout");
        Cow::Owned(out)
    }

    fn dense_write_back<A: Element, S: DataMut<Elem = A>, D: Dimension>(
        array: &mut ArrayBase<S, D>,
        bytes: &[u8],
    ) -> Result<()> {
        if let Some(values) = array.as_slice_mut() {
            return fill(values, bytes);
        }
        let size = std::mem::size_of::<A>();
        check_reply_len(array.len() * size, bytes.len())?;
        for (value, chunk) in array.iter_mut().zip(bytes.chunks_exact(size)) {
            *value = bytemuck::pod_read_unaligned(chunk);
        }
        Ok(())
    }

    impl<A: Element, S: Data<Elem = A>> Container for ArrayBase<S, Ix2> {
        fn dtype(&self) -> DType {
            A::DTYPE
        }

        fn shape(&self) -> Shape {
            Shape::matrix(self.nrows(), self.ncols())
        }

        fn bytes(&self) -> Result<Cow<'_, [u8]>> {
            Ok(dense_bytes(self))
        }
    }

    impl<A: Element, S: DataMut<Elem = A>> ContainerMut for ArrayBase<S, Ix2> {
        fn write_back(&mut self, bytes: &[u8]) -> Result<()> {
            dense_write_back(self, bytes)
        }
    }

    impl<A: Element, S: Data<Elem = A>> Container for ArrayBase<S, Ix1> {
        fn dtype(&self) -> DType {
            A::DTYPE
        }

        fn shape(&self) -> Shape {
            Shape::vector(ArrayBase::len(self))
        }

        fn bytes(&self) -> Result<Cow<'_, [u8]>> {
            Ok(dense_bytes(self))
        }
    }

    impl<A: Element, S: DataMut<Elem = A>> ContainerMut for ArrayBase<S, Ix1> {
        fn write_back(&mut self, bytes: &[u8]) -> Result<()> {
            dense_write_back(self, bytes)
        }
    }
}
