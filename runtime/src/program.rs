//! Programs and coroutines
//!
//! A program is one of a closed set of variants behind the same
//! `begin` / `await` / `destroy` surface:
//!
//! - [`Program::Native`]: entry points emitted by the shader translator,
//!   called through the C ABI described in [`crate::abi`].
//! - [`Program::Hosted`]: a [`Kernel`] written in Rust.
//!
//! The variant is picked once, when a dispatch is prepared.
//!
//! Native programs can only be built through the validating
//! [`Program::native`]; the payload of [`Program::Native`] is opaque:
//!
//! ```compile_fail
//! # fn info() -> kernrun_runtime::ProgramInfo { unimplemented!() }
//! let program = kernrun_runtime::Program::Native(kernrun_runtime::program::NativeProgram(info()));
//! ```

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::abi::{ProgramData, ProgramInfo, RawCoroutine, YieldResult};
use crate::error::RuntimeError;

/// Result of resuming a coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The coroutine cannot progress until others do (e.g. a control barrier).
    Suspended,
    Finished,
}

/// Static shape and resource requirements of a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramLayout {
    /// Minimum workgroup memory in bytes.
    pub min_memory_size: usize,
    pub has_cbarriers: bool,
    /// Size in bytes of descriptor set 0.
    pub desc_set_size: usize,
    pub workgroup_size: [u32; 3],
}

impl ProgramLayout {
    pub fn new(workgroup_size: [u32; 3]) -> Self {
        ProgramLayout {
            min_memory_size: 0,
            has_cbarriers: false,
            desc_set_size: 0,
            workgroup_size,
        }
    }

    pub fn with_memory(mut self, bytes: usize) -> Self {
        self.min_memory_size = bytes;
        self
    }

    pub fn with_cbarriers(mut self, has_cbarriers: bool) -> Self {
        self.has_cbarriers = has_cbarriers;
        self
    }

    pub fn with_descriptor_set(mut self, bytes: usize) -> Self {
        self.desc_set_size = bytes;
        self
    }

    /// Saturates at `u32::MAX`; [`ProgramLayout::validate`] rejects such shapes.
    pub fn invocations_per_workgroup(&self) -> u32 {
        let [x, y, z] = self.workgroup_size;
        x.saturating_mul(y).saturating_mul(z)
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.workgroup_size.contains(&0) {
            return Err(RuntimeError::InvalidProgram(format!(
                "workgroup size {:?} has a zero dimension",
                self.workgroup_size
            )));
        }
        let [x, y, z] = self.workgroup_size;
        x.checked_mul(y).and_then(|xy| xy.checked_mul(z)).ok_or_else(|| {
            RuntimeError::InvalidProgram(format!(
                "workgroup size {:?} overflows the invocation count",
                self.workgroup_size
            ))
        })?;
        Ok(())
    }
}

/// Workgroup shared memory handed to `begin`.
///
/// Every coroutine of a workgroup receives the same block, so access is
/// inherently aliased; kernels coordinate through control barriers the same
/// way they would on a GPU.
#[derive(Debug, Clone, Copy)]
pub struct WorkgroupMemory {
    ptr: *mut u8,
    len: usize,
}

// Only ever used by the worker that owns the backing thread context.
unsafe impl Send for WorkgroupMemory {}

impl WorkgroupMemory {
    pub(crate) fn new(ptr: *mut u8, len: usize) -> Self {
        WorkgroupMemory { ptr, len }
    }

    pub fn empty() -> Self {
        WorkgroupMemory {
            ptr: std::ptr::null_mut(),
            len: 0,
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// No other coroutine may access the block while the slice lives.
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        if self.ptr.is_null() {
            return &mut [];
        }
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }

    /// Read the `index`th `u32` word, or 0 past the end.
    ///
    /// # Safety
    /// The block must still be live (it is for the duration of a dispatch).
    pub unsafe fn load_u32(&self, index: usize) -> u32 {
        if (index + 1) * 4 > self.len {
            return 0;
        }
        std::ptr::read_unaligned((self.ptr as *const u32).add(index))
    }

    /// Store the `index`th `u32` word; stores past the end are discarded.
    ///
    /// # Safety
    /// See [`WorkgroupMemory::load_u32`].
    pub unsafe fn store_u32(&self, index: usize, value: u32) {
        if (index + 1) * 4 > self.len {
            return;
        }
        std::ptr::write_unaligned((self.ptr as *mut u32).add(index), value);
    }
}

/// Arguments of one `begin` call.
pub struct Launch<'a> {
    pub data: &'a ProgramData,
    pub workgroup: [u32; 3],
    pub memory: WorkgroupMemory,
    pub first_subgroup: u32,
    pub subgroup_count: u32,
}

/// A resumable kernel instance.
pub trait Routine: Send {
    fn resume(&mut self, result: &mut YieldResult) -> Status;
}

/// A kernel implemented in Rust.
pub trait Kernel: Send + Sync {
    fn name(&self) -> &str;

    fn begin(&self, launch: Launch<'_>) -> Box<dyn Routine>;

    /// Called exactly once per routine after it reports [`Status::Finished`].
    fn destroy(&self, routine: Box<dyn Routine>) {
        drop(routine);
    }
}

/// In-flight coroutine handle.
pub enum Coroutine {
    Native(NativeRoutine),
    Hosted(Box<dyn Routine>),
}

/// Opaque handle created by a native `begin`.
pub struct NativeRoutine(NonNull<libc::c_void>);

// A handle is owned by one worker queue at a time.
unsafe impl Send for NativeRoutine {}

impl NativeRoutine {
    pub fn as_raw(&self) -> RawCoroutine {
        self.0.as_ptr()
    }
}

#[derive(Clone)]
pub struct HostedProgram {
    layout: ProgramLayout,
    kernel: Arc<dyn Kernel>,
}

impl HostedProgram {
    // Unvalidated; for builtin kernels with fixed layouts.
    pub(crate) fn new(layout: ProgramLayout, kernel: Arc<dyn Kernel>) -> Self {
        debug_assert!(layout.validate().is_ok());
        HostedProgram { layout, kernel }
    }

    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kernel
    }
}

/// Validated translator entry points. Only built by [`Program::native`].
#[derive(Clone, Copy)]
pub struct NativeProgram(ProgramInfo);

impl NativeProgram {
    pub fn info(&self) -> &ProgramInfo {
        &self.0
    }
}

#[derive(Clone)]
pub enum Program {
    Native(NativeProgram),
    Hosted(HostedProgram),
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Program::Native(p) => f.debug_tuple("Native").field(&p.0).finish(),
            Program::Hosted(p) => f
                .debug_struct("Hosted")
                .field("kernel", &p.kernel.name())
                .field("layout", &p.layout)
                .finish(),
        }
    }
}

impl Program {
    /// Wrap translator-emitted entry points.
    ///
    /// # Safety
    /// The entry points in `info` must honour the contract in [`crate::abi`]:
    /// `begin` returns a non-null handle, `await` may be called until it
    /// returns false, `destroy` frees the handle.
    pub unsafe fn native(info: ProgramInfo) -> Result<Program, RuntimeError> {
        let dims = [info.workgroup_size_x, info.workgroup_size_y, info.workgroup_size_z];
        if dims.iter().any(|&d| d < 0) {
            return Err(RuntimeError::InvalidProgram(format!(
                "workgroup size {:?} has a negative dimension",
                dims
            )));
        }
        let program = Program::Native(NativeProgram(info));
        program.layout().validate()?;
        Ok(program)
    }

    pub fn hosted(layout: ProgramLayout, kernel: Arc<dyn Kernel>) -> Result<Program, RuntimeError> {
        layout.validate()?;
        Ok(Program::Hosted(HostedProgram { layout, kernel }))
    }

    pub fn layout(&self) -> ProgramLayout {
        match self {
            Program::Native(NativeProgram(info)) => ProgramLayout {
                min_memory_size: info.min_memory_size,
                has_cbarriers: info.has_cbarriers,
                desc_set_size: info.desc_set_size,
                workgroup_size: [
                    info.workgroup_size_x as u32,
                    info.workgroup_size_y as u32,
                    info.workgroup_size_z as u32,
                ],
            },
            Program::Hosted(p) => p.layout,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Program::Native(_) => "native",
            Program::Hosted(p) => p.kernel.name(),
        }
    }

    pub(crate) fn begin(&self, launch: Launch<'_>) -> Coroutine {
        match self {
            Program::Native(NativeProgram(info)) => {
                let [x, y, z] = launch.workgroup;
                debug_assert!(
                    launch.workgroup.iter().all(|&n| n <= i32::MAX as u32),
                    "group coordinates {:?} exceed c_int",
                    launch.workgroup
                );
                let raw = unsafe {
                    (info.begin)(
                        launch.data as *const ProgramData as *mut ProgramData,
                        x as i32,
                        y as i32,
                        z as i32,
                        launch.memory.as_ptr() as *mut libc::c_void,
                        launch.first_subgroup as i32,
                        launch.subgroup_count as i32,
                    )
                };
                match NonNull::new(raw) {
                    Some(handle) => Coroutine::Native(NativeRoutine(handle)),
                    None => {
                        log::error!("native begin returned a null coroutine");
                        std::process::abort();
                    }
                }
            }
            Program::Hosted(p) => Coroutine::Hosted(p.kernel.begin(launch)),
        }
    }

    pub(crate) fn resume(&self, routine: &mut Coroutine, result: &mut YieldResult) -> Status {
        match (self, routine) {
            (Program::Native(NativeProgram(info)), Coroutine::Native(handle)) => {
                let running = unsafe { (info.await_)(handle.as_raw(), result) };
                if running {
                    Status::Suspended
                } else {
                    Status::Finished
                }
            }
            (Program::Hosted(_), Coroutine::Hosted(routine)) => routine.resume(result),
            _ => unreachable!("coroutine does not belong to this program"),
        }
    }

    pub(crate) fn destroy(&self, routine: Coroutine) {
        match (self, routine) {
            (Program::Native(NativeProgram(info)), Coroutine::Native(handle)) => unsafe {
                (info.destroy)(handle.as_raw())
            },
            (Program::Hosted(p), Coroutine::Hosted(routine)) => p.kernel.destroy(routine),
            _ => unreachable!("coroutine does not belong to this program"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    struct NoopRoutine;

    impl Routine for NoopRoutine {
        fn resume(&mut self, _result: &mut YieldResult) -> Status {
            Status::Finished
        }
    }

    impl Kernel for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        fn begin(&self, _launch: Launch<'_>) -> Box<dyn Routine> {
            Box::new(NoopRoutine)
        }
    }

    #[test]
    fn test_zero_workgroup_dimension_is_rejected() {
        let err = Program::hosted(ProgramLayout::new([4, 0, 1]), Arc::new(Noop)).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidProgram(_)));
    }

    #[test]
    fn test_layout_builders() {
        let layout = ProgramLayout::new([2, 2, 3])
            .with_memory(64)
            .with_cbarriers(true)
            .with_descriptor_set(32);
        assert_eq!(layout.invocations_per_workgroup(), 12);
        let program = Program::hosted(layout, Arc::new(Noop)).unwrap();
        assert_eq!(program.layout(), layout);
        assert_eq!(program.name(), "noop");
    }

    #[test]
    fn test_invocation_count_saturates() {
        let layout = ProgramLayout::new([u32::MAX, 4, 1]);
        assert_eq!(layout.invocations_per_workgroup(), u32::MAX);
        assert!(matches!(layout.validate(), Err(RuntimeError::InvalidProgram(_))));
        assert!(Program::hosted(layout, Arc::new(Noop)).is_err());
    }

    #[test]
    fn test_workgroup_memory_bounds() {
        let mut words = [0u32; 2];
        let mem = WorkgroupMemory::new(words.as_mut_ptr() as *mut u8, 8);
        unsafe {
            mem.store_u32(1, 3);
            mem.store_u32(2, 4);
            assert_eq!(mem.load_u32(1), 3);
            assert_eq!(mem.load_u32(2), 0);
        }
        assert_eq!(words, [0, 3]);
        assert!(WorkgroupMemory::empty().is_empty());
    }
}
