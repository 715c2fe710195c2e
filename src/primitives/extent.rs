// SPDX-License-Identifier: Apache-2.0

use std::mem::{align_of, size_of};
use std::ptr::NonNull;

/// A pointer and length naming memory owned by the caller.
///
/// Extents are pushed by reference: the trusted side receives the address,
/// never a copy of the bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Extent {
    data: NonNull<u8>,
    len: usize,
}

// Extents only travel with the call that borrows their memory.
unsafe impl Send for Extent {}

impl Extent {
    /// View an immutable byte slice.
    ///
    /// The trusted side must not write through the resulting extent.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: NonNull::from(bytes).cast(),
            len: bytes.len(),
        }
    }

    /// View a mutable value in place.
    pub fn from_mut<T>(value: &mut T) -> Self {
        Self {
            data: NonNull::from(value).cast(),
            len: size_of::<T>(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    /// # Safety
    ///
    /// The memory this extent was created from must still be live and not
    /// mutably borrowed elsewhere.
    pub unsafe fn as_bytes<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.data.as_ptr(), self.len)
    }

    /// Reinterpret the extent as a `T`, if the size and alignment fit.
    ///
    /// # Safety
    ///
    /// The extent must have been created from a live, exclusively borrowed `T`.
    pub unsafe fn as_mut<'a, T>(&self) -> Option<&'a mut T> {
        if self.len != size_of::<T>() || self.data.as_ptr() as usize % align_of::<T>() != 0 {
            return None;
        }

        Some(&mut *self.data.as_ptr().cast::<T>())
    }
}

/// An ordered stack of extents crossing the boundary with one call.
///
/// The untrusted side pushes in declaration order; the trusted side pops in
/// reverse.
#[derive(Debug, Default)]
pub struct ParameterStack {
    extents: Vec<Extent>,
}

impl ParameterStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_by_reference(&mut self, extent: Extent) {
        self.extents.push(extent);
    }

    pub fn pop(&mut self) -> Option<Extent> {
        self.extents.pop()
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }
}
