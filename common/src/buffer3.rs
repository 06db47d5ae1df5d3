use std::ops::{Deref, DerefMut, Index, IndexMut};
use std::slice;

/// Dense 3D voxel buffer stored x-fastest, then y, then z.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer3<T> {
    voxels: Vec<T>,
    width: usize,
    height: usize,
    depth: usize,
}

impl<T> Buffer3<T> {
    pub fn new(width: usize, height: usize, depth: usize, voxels: Vec<T>) -> Self {
        assert_eq!(
            voxels.len(),
            width * height * depth,
            "voxels length must equal width * height * depth"
        );
        Self {
            voxels,
            width,
            height,
            depth,
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> &T {
        debug_assert!(x < self.width && y < self.height && z < self.depth);
        &self.voxels[self.index(x, y, z)]
    }

    #[inline]
    pub fn get_mut(&mut self, x: usize, y: usize, z: usize) -> &mut T {
        debug_assert!(x < self.width && y < self.height && z < self.depth);
        let idx = self.index(x, y, z);
        &mut self.voxels[idx]
    }

    /// Bounds-checked access; `None` outside the buffer.
    #[inline]
    pub fn try_get(&self, x: usize, y: usize, z: usize) -> Option<&T> {
        if !self.contains(x, y, z) {
            return None;
        }
        self.voxels.get(self.index(x, y, z))
    }

    #[inline]
    pub fn contains(&self, x: usize, y: usize, z: usize) -> bool {
        x < self.width && y < self.height && z < self.depth
    }

    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        (z * self.height + y) * self.width + x
    }

    #[inline]
    pub fn coords_of(&self, idx: usize) -> (usize, usize, usize) {
        let x = idx % self.width;
        let y = (idx / self.width) % self.height;
        let z = idx / self.slice_len();
        (x, y, z)
    }

    /// Number of voxels in one z-slice.
    #[inline]
    pub fn slice_len(&self) -> usize {
        self.width * self.height
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn dims(&self) -> (usize, usize, usize) {
        (self.width, self.height, self.depth)
    }

    #[inline]
    pub fn same_shape<U>(&self, other: &Buffer3<U>) -> bool {
        self.dims() == other.dims()
    }

    #[inline]
    pub fn voxels(&self) -> &[T] {
        &self.voxels
    }

    #[inline]
    pub fn voxels_mut(&mut self) -> &mut [T] {
        &mut self.voxels
    }

    #[inline]
    pub fn into_vec(self) -> Vec<T> {
        self.voxels
    }

    #[inline]
    pub fn iter(&self) -> slice::Iter<'_, T> {
        self.voxels.iter()
    }

    #[inline]
    pub fn iter_mut(&mut self) -> slice::IterMut<'_, T> {
        self.voxels.iter_mut()
    }
}

impl<T: Default + Clone> Buffer3<T> {
    pub fn new_default(width: usize, height: usize, depth: usize) -> Self {
        Self {
            voxels: vec![T::default(); width * height * depth],
            width,
            height,
            depth,
        }
    }
}

impl<T: Clone> Buffer3<T> {
    pub fn new_filled(width: usize, height: usize, depth: usize, value: T) -> Self {
        Self {
            voxels: vec![value; width * height * depth],
            width,
            height,
            depth,
        }
    }

    #[inline]
    pub fn fill(&mut self, value: T) {
        self.voxels.fill(value);
    }

    /// Copy surrounded by `border` voxels of `fill` on every side.
    pub fn padded(&self, border: usize, fill: T) -> Self {
        let width = self.width + 2 * border;
        let height = self.height + 2 * border;
        let depth = self.depth + 2 * border;
        let mut out = Self::new_filled(width, height, depth, fill);

        for z in 0..self.depth {
            for y in 0..self.height {
                let src = self.index(0, y, z);
                let dst = out.index(border, y + border, z + border);
                out.voxels[dst..dst + self.width]
                    .clone_from_slice(&self.voxels[src..src + self.width]);
            }
        }

        out
    }

    /// Inverse of [`Buffer3::padded`].
    pub fn unpadded(&self, border: usize) -> Self {
        assert!(
            self.width >= 2 * border && self.height >= 2 * border && self.depth >= 2 * border,
            "border larger than buffer"
        );
        let width = self.width - 2 * border;
        let height = self.height - 2 * border;
        let depth = self.depth - 2 * border;
        let mut voxels = Vec::with_capacity(width * height * depth);

        for z in border..border + depth {
            for y in border..border + height {
                let src = self.index(border, y, z);
                voxels.extend_from_slice(&self.voxels[src..src + width]);
            }
        }

        Self::new(width, height, depth, voxels)
    }
}

impl<T> Index<(usize, usize, usize)> for Buffer3<T> {
    type Output = T;

    #[inline]
    fn index(&self, (x, y, z): (usize, usize, usize)) -> &Self::Output {
        &self.voxels[(z * self.height + y) * self.width + x]
    }
}

impl<T> IndexMut<(usize, usize, usize)> for Buffer3<T> {
    #[inline]
    fn index_mut(&mut self, (x, y, z): (usize, usize, usize)) -> &mut Self::Output {
        &mut self.voxels[(z * self.height + y) * self.width + x]
    }
}

impl<T> Index<usize> for Buffer3<T> {
    type Output = T;

    #[inline]
    fn index(&self, idx: usize) -> &Self::Output {
        &self.voxels[idx]
    }
}

impl<T> IndexMut<usize> for Buffer3<T> {
    #[inline]
    fn index_mut(&mut self, idx: usize) -> &mut Self::Output {
        &mut self.voxels[idx]
    }
}

impl<T> Deref for Buffer3<T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.voxels
    }
}

impl<T> DerefMut for Buffer3<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.voxels
    }
}

impl<T> From<Buffer3<T>> for Vec<T> {
    #[inline]
    fn from(buffer: Buffer3<T>) -> Self {
        buffer.voxels
    }
}
