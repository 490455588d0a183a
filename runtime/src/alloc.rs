//! Fixed-alignment allocation for buffers, images and runtime scratch memory
//!
//! Allocation failure is fatal: the runtime has no channel to report a
//! partially executed dispatch, so a failed allocation aborts the process
//! through [`std::alloc::handle_alloc_error`].

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::mem;
use std::ptr::{self, NonNull};

use libc::c_int;

use crate::abi::{
    BufferDescriptor, ImageDescriptor, MIN_STORAGE_BUFFER_OFFSET_ALIGNMENT,
    REQUIRED_MEMORY_ALIGNMENT,
};

/// Owned, zero-initialised block of bytes with a fixed alignment.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
}

// The block is plain bytes owned by exactly one value.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Allocate `len` bytes aligned to `align`. A zero length still reserves
    /// one byte so the pointer is always valid.
    pub fn new(len: usize, align: usize) -> Self {
        let layout = match Layout::from_size_align(len.max(1), align) {
            Ok(layout) => layout,
            Err(_) => {
                log::error!("invalid allocation: {} bytes aligned to {}", len, align);
                std::process::abort();
            }
        };
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => handle_alloc_error(layout),
        };
        AlignedBuf { ptr, layout, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn align(&self) -> usize {
        self.layout.align()
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Give up ownership of the block. Reclaim with [`AlignedBuf::from_raw`].
    pub fn into_raw(self) -> *mut u8 {
        let ptr = self.ptr.as_ptr();
        mem::forget(self);
        ptr
    }

    /// # Safety
    /// `ptr` must come from [`AlignedBuf::into_raw`] of a block created with
    /// the same `len` and `align`.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize, align: usize) -> Self {
        AlignedBuf {
            ptr: NonNull::new_unchecked(ptr),
            layout: Layout::from_size_align_unchecked(len.max(1), align),
            len,
        }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Grow `slot` so it holds at least `len` bytes. Existing contents are not
/// preserved; storage is never shrunk. Returns true when a new block was
/// allocated.
pub(crate) fn ensure_capacity(slot: &mut Option<AlignedBuf>, len: usize, align: usize) -> bool {
    match slot {
        Some(buf) if buf.len() >= len => false,
        _ => {
            *slot = Some(AlignedBuf::new(len, align));
            true
        }
    }
}

fn to_c_int(value: usize, what: &str) -> c_int {
    match c_int::try_from(value) {
        Ok(v) => v,
        Err(_) => {
            log::error!("{} of {} bytes exceeds the descriptor range", what, value);
            std::process::abort();
        }
    }
}

/// A storage buffer bound through a [`BufferDescriptor`].
pub struct Buffer {
    storage: AlignedBuf,
}

/// Allocate a storage buffer of `size` bytes, aligned to
/// [`MIN_STORAGE_BUFFER_OFFSET_ALIGNMENT`].
pub fn allocate_buffer(size: usize) -> Buffer {
    to_c_int(size, "buffer");
    Buffer {
        storage: AlignedBuf::new(size, MIN_STORAGE_BUFFER_OFFSET_ALIGNMENT),
    }
}

impl Buffer {
    pub fn descriptor(&self) -> BufferDescriptor {
        let size = self.storage.len() as c_int;
        BufferDescriptor {
            ptr: self.storage.as_ptr(),
            size_in_bytes: size,
            robustness_size: size,
        }
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        self.storage.as_slice()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.storage.as_mut_slice()
    }

    /// Copy the buffer out as native-endian `u32` words.
    pub fn to_u32_vec(&self) -> Vec<u32> {
        self.bytes()
            .chunks_exact(4)
            .map(|w| u32::from_ne_bytes([w[0], w[1], w[2], w[3]]))
            .collect()
    }

    /// Overwrite the start of the buffer with `words`. Words past the end are
    /// dropped.
    pub fn write_u32s(&mut self, words: &[u32]) {
        for (dst, word) in self.bytes_mut().chunks_exact_mut(4).zip(words) {
            dst.copy_from_slice(&word.to_ne_bytes());
        }
    }

    pub fn into_descriptor(self) -> BufferDescriptor {
        let desc = self.descriptor();
        self.storage.into_raw();
        desc
    }

    /// # Safety
    /// `desc` must come from [`Buffer::into_descriptor`] and not be reclaimed twice.
    pub unsafe fn from_descriptor(desc: BufferDescriptor) -> Self {
        Buffer {
            storage: AlignedBuf::from_raw(
                desc.ptr,
                desc.size_in_bytes as usize,
                MIN_STORAGE_BUFFER_OFFSET_ALIGNMENT,
            ),
        }
    }
}

/// An image bound through an [`ImageDescriptor`].
pub struct Image {
    storage: AlignedBuf,
    desc: ImageDescriptor,
}

/// Allocate a single-sample, single-slice RGBA8 image.
pub fn allocate_image_rgba(width: u32, height: u32) -> Image {
    let size = width as usize * height as usize * 4;
    let size = (size + REQUIRED_MEMORY_ALIGNMENT - 1) & !(REQUIRED_MEMORY_ALIGNMENT - 1);
    let size_c = to_c_int(size, "image");
    let storage = AlignedBuf::new(size, REQUIRED_MEMORY_ALIGNMENT);
    let desc = ImageDescriptor {
        ptr: storage.as_ptr(),
        width: to_c_int(width as usize, "image width"),
        height: to_c_int(height as usize, "image height"),
        depth: 1,
        row_pitch_bytes: to_c_int(width as usize * 4, "image row"),
        slice_pitch_bytes: size_c,
        sample_pitch_bytes: size_c,
        sample_count: 1,
        size_in_bytes: size_c,
        ..ImageDescriptor::default()
    };
    Image { storage, desc }
}

impl Image {
    pub fn descriptor(&self) -> ImageDescriptor {
        self.desc
    }

    pub fn width(&self) -> u32 {
        self.desc.width as u32
    }

    pub fn height(&self) -> u32 {
        self.desc.height as u32
    }

    pub fn bytes(&self) -> &[u8] {
        self.storage.as_slice()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.storage.as_mut_slice()
    }

    /// Packed RGBA8 value at `(x, y)`.
    pub fn texel(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width() || y >= self.height() {
            return None;
        }
        let offset = y as usize * self.desc.row_pitch_bytes as usize + x as usize * 4;
        let px = &self.bytes()[offset..offset + 4];
        Some(u32::from_ne_bytes([px[0], px[1], px[2], px[3]]))
    }

    pub fn into_descriptor(self) -> ImageDescriptor {
        let desc = self.desc;
        self.storage.into_raw();
        desc
    }

    /// # Safety
    /// `desc` must come from [`Image::into_descriptor`] and not be reclaimed twice.
    pub unsafe fn from_descriptor(desc: ImageDescriptor) -> Self {
        Image {
            storage: AlignedBuf::from_raw(
                desc.ptr,
                desc.size_in_bytes as usize,
                REQUIRED_MEMORY_ALIGNMENT,
            ),
            desc,
        }
    }
}

/// Packs bindings into descriptor-set bytes.
///
/// Each binding is placed at the next offset matching its alignment; the
/// returned offset is what a kernel passes to [`crate::abi::ProgramData::binding`].
#[derive(Default)]
pub struct DescriptorSetWriter {
    bytes: Vec<u8>,
}

impl DescriptorSetWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_buffer(&mut self, desc: &BufferDescriptor) -> usize {
        self.push(desc)
    }

    pub fn push_image(&mut self, desc: &ImageDescriptor) -> usize {
        self.push(desc)
    }

    pub fn push_u32(&mut self, value: u32) -> usize {
        self.push(&value)
    }

    fn push<T: Copy>(&mut self, value: &T) -> usize {
        let align = mem::align_of::<T>();
        let offset = (self.bytes.len() + align - 1) & !(align - 1);
        self.bytes.resize(offset + mem::size_of::<T>(), 0);
        unsafe {
            ptr::write_unaligned(self.bytes.as_mut_ptr().add(offset) as *mut T, *value);
        }
        offset
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}
