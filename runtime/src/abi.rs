//! Kernel ABI: data layouts shared with compiled kernels
//!
//! Every `#[repr(C)]` type in this module crosses the boundary between the
//! runtime and code emitted by the shader translator. Field order, types and
//! alignment must match what the translator emits; do not reorder.

use libc::{c_int, c_void};
use std::mem;
use std::ptr;

pub const MAX_BOUND_DESCRIPTOR_SETS: usize = 4;
pub const MAX_DESCRIPTOR_SET_UNIFORM_BUFFERS_DYNAMIC: usize = 8;
pub const MAX_DESCRIPTOR_SET_STORAGE_BUFFERS_DYNAMIC: usize = 4;
pub const MAX_DESCRIPTOR_SET_COMBINED_BUFFERS_DYNAMIC: usize =
    MAX_DESCRIPTOR_SET_UNIFORM_BUFFERS_DYNAMIC + MAX_DESCRIPTOR_SET_STORAGE_BUFFERS_DYNAMIC;
pub const MAX_PUSH_CONSTANT_SIZE: usize = 128;

/// Alignment of every storage buffer allocation.
pub const MIN_STORAGE_BUFFER_OFFSET_ALIGNMENT: usize = 256;

/// Alignment of images, descriptor-set copies and workgroup memory.
pub const REQUIRED_MEMORY_ALIGNMENT: usize = 16;

/// Lanes per subgroup.
pub const SIMD_WIDTH: u32 = 4;

/// Opaque value written by `await`. The runtime never inspects it.
pub type YieldResult = i32;

/// Opaque coroutine handle returned by a native `begin`.
pub type RawCoroutine = *mut c_void;

pub type RoutineBegin = unsafe extern "C" fn(
    data: *mut ProgramData,
    workgroup_x: i32,
    workgroup_y: i32,
    workgroup_z: i32,
    workgroup_memory: *mut c_void,
    first_subgroup: i32,
    subgroup_count: i32,
) -> RawCoroutine;

/// Returns true while the coroutine is still running.
pub type RoutineAwait =
    unsafe extern "C" fn(routine: RawCoroutine, result: *mut YieldResult) -> bool;

pub type RoutineDestroy = unsafe extern "C" fn(routine: RawCoroutine);

/// Four 32-bit lanes on a 16-byte boundary (`uint4` on the kernel side).
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Uint4(pub [u32; 4]);

/// Storage buffer binding.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy)]
pub struct BufferDescriptor {
    pub ptr: *mut u8,
    pub size_in_bytes: c_int,
    /// Bytes a kernel may touch before robust access kicks in. Equal to
    /// `size_in_bytes` for every buffer the allocator hands out.
    pub robustness_size: c_int,
}

impl Default for BufferDescriptor {
    fn default() -> Self {
        BufferDescriptor {
            ptr: ptr::null_mut(),
            size_in_bytes: 0,
            robustness_size: 0,
        }
    }
}

impl BufferDescriptor {
    /// View the bound memory, limited to `robustness_size`.
    ///
    /// # Safety
    /// `ptr` must point to a live allocation of at least `robustness_size`
    /// bytes and no other reference may write to it while the slice lives.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.ptr.is_null() || self.robustness_size <= 0 {
            return &[];
        }
        std::slice::from_raw_parts(self.ptr, self.robustness_size as usize)
    }

    /// Mutable view of the bound memory, limited to `robustness_size`.
    ///
    /// # Safety
    /// Same as [`BufferDescriptor::as_slice`], and the caller must be the only
    /// accessor of the range for the lifetime of the slice.
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        if self.ptr.is_null() || self.robustness_size <= 0 {
            return &mut [];
        }
        std::slice::from_raw_parts_mut(self.ptr, self.robustness_size as usize)
    }

    /// Number of whole `u32` words that fit in the robust range.
    pub fn word_count(&self) -> usize {
        self.robustness_size.max(0) as usize / mem::size_of::<u32>()
    }

    /// Read word `index`; out of range reads return 0.
    ///
    /// # Safety
    /// `ptr` must point to a live allocation of at least `robustness_size` bytes.
    pub unsafe fn read_u32(&self, index: usize) -> u32 {
        if index >= self.word_count() {
            return 0;
        }
        ptr::read_unaligned((self.ptr as *const u32).add(index))
    }

    /// Write word `index`; out of range writes are discarded.
    ///
    /// # Safety
    /// `ptr` must point to a live allocation of at least `robustness_size` bytes.
    pub unsafe fn write_u32(&self, index: usize, value: u32) {
        if index >= self.word_count() {
            return;
        }
        ptr::write_unaligned((self.ptr as *mut u32).add(index), value);
    }
}

/// Image binding.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy)]
pub struct ImageDescriptor {
    pub ptr: *mut u8,
    pub width: c_int,
    pub height: c_int,
    pub depth: c_int,
    pub row_pitch_bytes: c_int,
    pub slice_pitch_bytes: c_int,
    pub sample_pitch_bytes: c_int,
    pub sample_count: c_int,
    pub size_in_bytes: c_int,

    pub stencil_ptr: *mut u8,
    pub stencil_row_pitch_bytes: c_int,
    pub stencil_slice_pitch_bytes: c_int,
    pub stencil_sample_pitch_bytes: c_int,

    pub memory_owner: *mut c_void,
}

impl Default for ImageDescriptor {
    fn default() -> Self {
        ImageDescriptor {
            ptr: ptr::null_mut(),
            width: 0,
            height: 0,
            depth: 0,
            row_pitch_bytes: 0,
            slice_pitch_bytes: 0,
            sample_pitch_bytes: 0,
            sample_count: 0,
            size_in_bytes: 0,
            stencil_ptr: ptr::null_mut(),
            stencil_row_pitch_bytes: 0,
            stencil_slice_pitch_bytes: 0,
            stencil_sample_pitch_bytes: 0,
            memory_owner: ptr::null_mut(),
        }
    }
}

impl ImageDescriptor {
    /// Write one RGBA8 texel; coordinates outside the image are ignored.
    ///
    /// # Safety
    /// `ptr` must point to a live allocation of at least `size_in_bytes` bytes.
    pub unsafe fn write_texel(&self, x: u32, y: u32, rgba: u32) {
        if self.ptr.is_null() || x >= self.width.max(0) as u32 || y >= self.height.max(0) as u32 {
            return;
        }
        let offset = y as usize * self.row_pitch_bytes as usize + x as usize * 4;
        ptr::write_unaligned(self.ptr.add(offset) as *mut u32, rgba);
    }

    /// # Safety
    /// `ptr` must point to a live allocation of at least `size_in_bytes` bytes.
    pub unsafe fn read_texel(&self, x: u32, y: u32) -> u32 {
        if self.ptr.is_null() || x >= self.width.max(0) as u32 || y >= self.height.max(0) as u32 {
            return 0;
        }
        let offset = y as usize * self.row_pitch_bytes as usize + x as usize * 4;
        ptr::read_unaligned(self.ptr.add(offset) as *const u32)
    }
}

/// Per-dispatch constants handed to every `begin`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProgramData {
    pub descriptor_sets: [*mut u8; MAX_BOUND_DESCRIPTOR_SETS],
    pub descriptor_dynamic_offsets: [u32; MAX_DESCRIPTOR_SET_COMBINED_BUFFERS_DYNAMIC],
    pub num_workgroups: Uint4,
    pub workgroup_size: Uint4,
    pub invocations_per_subgroup: u32,
    pub subgroups_per_workgroup: u32,
    pub invocations_per_workgroup: u32,
    pub push_constants: [u8; MAX_PUSH_CONSTANT_SIZE],
    // Unused.
    pub constants: *mut c_void,
}

impl Default for ProgramData {
    fn default() -> Self {
        ProgramData {
            descriptor_sets: [ptr::null_mut(); MAX_BOUND_DESCRIPTOR_SETS],
            descriptor_dynamic_offsets: [0; MAX_DESCRIPTOR_SET_COMBINED_BUFFERS_DYNAMIC],
            num_workgroups: Uint4::default(),
            workgroup_size: Uint4::default(),
            invocations_per_subgroup: 0,
            subgroups_per_workgroup: 0,
            invocations_per_workgroup: 0,
            push_constants: [0; MAX_PUSH_CONSTANT_SIZE],
            constants: ptr::null_mut(),
        }
    }
}

impl ProgramData {
    /// Read a binding of type `T` stored at `offset` bytes into descriptor set `set`.
    ///
    /// # Safety
    /// The set must be bound and hold a `T` at `offset` (see
    /// [`crate::alloc::DescriptorSetWriter`]).
    pub unsafe fn binding<T: Copy>(&self, set: usize, offset: usize) -> T {
        let base = self.descriptor_sets[set];
        debug_assert!(!base.is_null(), "descriptor set {} is not bound", set);
        ptr::read_unaligned(base.add(offset) as *const T)
    }

    /// Shorthand for a [`BufferDescriptor`] in set 0.
    ///
    /// # Safety
    /// See [`ProgramData::binding`].
    pub unsafe fn buffer(&self, offset: usize) -> BufferDescriptor {
        self.binding(0, offset)
    }

    /// Shorthand for an [`ImageDescriptor`] in set 0.
    ///
    /// # Safety
    /// See [`ProgramData::binding`].
    pub unsafe fn image(&self, offset: usize) -> ImageDescriptor {
        self.binding(0, offset)
    }
}

/// Constant parameters of a translated program, as emitted by the shader
/// translator.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ProgramInfo {
    /// Minimum size of the workgroup memory passed to `begin`.
    pub min_memory_size: usize,
    /// Set when the program contains control barriers.
    pub has_cbarriers: bool,
    /// Size in bytes of descriptor set 0.
    pub desc_set_size: usize,
    pub workgroup_size_x: c_int,
    pub workgroup_size_y: c_int,
    pub workgroup_size_z: c_int,
    pub begin: RoutineBegin,
    pub await_: RoutineAwait,
    pub destroy: RoutineDestroy,
}

impl std::fmt::Debug for ProgramInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramInfo")
            .field("min_memory_size", &self.min_memory_size)
            .field("has_cbarriers", &self.has_cbarriers)
            .field("desc_set_size", &self.desc_set_size)
            .field(
                "workgroup_size",
                &[self.workgroup_size_x, self.workgroup_size_y, self.workgroup_size_z],
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_layouts() {
        assert_eq!(mem::align_of::<BufferDescriptor>(), 16);
        assert_eq!(mem::size_of::<BufferDescriptor>(), 16);
        assert_eq!(mem::align_of::<ImageDescriptor>(), 16);
        assert_eq!(mem::size_of::<ImageDescriptor>() % 16, 0);
        assert_eq!(mem::align_of::<Uint4>(), 16);
    }

    #[test]
    fn test_program_data_offsets() {
        let data = ProgramData::default();
        let base = &data as *const ProgramData as usize;
        let sets = mem::size_of::<*mut u8>() * MAX_BOUND_DESCRIPTOR_SETS;
        let offsets = sets + 4 * MAX_DESCRIPTOR_SET_COMBINED_BUFFERS_DYNAMIC;
        // uint4 fields are padded up to a 16-byte boundary
        let num_workgroups = (offsets + 15) & !15;
        assert_eq!(&data.num_workgroups as *const Uint4 as usize - base, num_workgroups);
        assert_eq!(&data.workgroup_size as *const Uint4 as usize - base, num_workgroups + 16);
    }

    #[test]
    fn test_buffer_word_access_is_clamped() {
        let mut storage = [0u32; 4];
        let desc = BufferDescriptor {
            ptr: storage.as_mut_ptr() as *mut u8,
            size_in_bytes: 16,
            robustness_size: 16,
        };
        unsafe {
            desc.write_u32(1, 7);
            desc.write_u32(4, 9);
            assert_eq!(desc.read_u32(1), 7);
            assert_eq!(desc.read_u32(4), 0);
        }
        assert_eq!(storage, [0, 7, 0, 0]);
    }
}
