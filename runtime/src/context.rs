//! Dispatch and thread contexts
//!
//! A dispatch runs in two phases:
//!
//! 1. [`DispatchContext::prepare`] copies the descriptor set and derives the
//!    workgroup geometry. It must complete before any worker starts.
//! 2. [`DispatchContext::dispatch_thread`] is called once per worker, each
//!    with its own [`ThreadContext`]. Workers share the dispatch context
//!    read-only and touch no other state in common.
//!
//! Workgroups are split by a strided round-robin over the flattened grid:
//! worker `t` of `T` runs groups `t, t + T, t + 2T, ...`.

use crate::abi::{ProgramData, Uint4, YieldResult, REQUIRED_MEMORY_ALIGNMENT, SIMD_WIDTH};
use crate::alloc::{ensure_capacity, AlignedBuf};
use crate::program::{Coroutine, Launch, Program, Status, WorkgroupMemory};
use crate::queue::CoroutineQueue;

/// State for one dispatch. Reusable across dispatches of different programs.
#[derive(Default)]
pub struct DispatchContext {
    // Aligned copy of descriptor set 0.
    descriptor_set: Option<AlignedBuf>,

    nthreads: usize,
    ngroups: usize,
    has_cbarriers: bool,
    memory_size: usize,
    program: Option<Program>,

    data: ProgramData,
}

// `data` holds raw pointers into `descriptor_set` and caller-owned bindings.
// The context is only written in `prepare` (which takes `&mut self`) and is
// read-only while workers run.
unsafe impl Send for DispatchContext {}
unsafe impl Sync for DispatchContext {}

impl DispatchContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set up a dispatch of `program` over a `groups` grid split among
    /// `nthreads` workers.
    ///
    /// Exactly `desc_set_size` bytes of `descriptor_set` are copied, so the
    /// caller may reuse its buffer as soon as this returns. A grid with more
    /// than `usize::MAX` groups, or a dimension above `i32::MAX`, is a
    /// precondition violation and dispatches nothing.
    ///
    /// # Safety
    ///
    /// The program dereferences the bindings encoded in `descriptor_set`
    /// without checking them. The bytes must describe live bindings laid out
    /// the way `program` expects (for example built by
    /// [`DescriptorSetWriter`](crate::DescriptorSetWriter)), and the memory
    /// they point to must stay valid until every `dispatch_thread` call for
    /// this preparation has returned.
    ///
    /// Calling it without `unsafe` does not compile:
    ///
    /// ```compile_fail
    /// use kernrun_runtime::{DispatchContext, Program};
    /// fn run(ctx: &mut DispatchContext, program: &Program, bytes: &[u8]) {
    ///     ctx.prepare(1, program, bytes, [1, 1, 1]);
    /// }
    /// ```
    pub unsafe fn prepare(
        &mut self,
        nthreads: usize,
        program: &Program,
        descriptor_set: &[u8],
        groups: [u32; 3],
    ) {
        let layout = program.layout();

        let nthreads = if nthreads == 0 {
            precondition_violation("prepare called with zero threads; using one");
            1
        } else {
            nthreads
        };

        let desc_set_size = layout.desc_set_size;
        if ensure_capacity(&mut self.descriptor_set, desc_set_size, REQUIRED_MEMORY_ALIGNMENT) {
            log::debug!("descriptor set storage grown to {} bytes", desc_set_size);
        }
        let storage = self
            .descriptor_set
            .as_mut()
            .map(AlignedBuf::as_mut_slice)
            .unwrap_or_default();
        let copied = descriptor_set.len().min(desc_set_size);
        if copied < desc_set_size {
            precondition_violation(&format!(
                "descriptor set is {} bytes, program expects {}; zero-filling",
                descriptor_set.len(),
                desc_set_size
            ));
        }
        storage[..copied].copy_from_slice(&descriptor_set[..copied]);
        storage[copied..desc_set_size].fill(0);

        let invocations_per_subgroup = SIMD_WIDTH;
        let invocations_per_workgroup = layout.invocations_per_workgroup();
        let subgroups_per_workgroup = invocations_per_workgroup.div_ceil(invocations_per_subgroup);

        self.ngroups = match grid_size(groups) {
            Some(n) => n,
            None => {
                precondition_violation(&format!(
                    "grid {:?} exceeds the addressable range; dispatching nothing",
                    groups
                ));
                0
            }
        };
        self.has_cbarriers = layout.has_cbarriers;
        self.program = Some(program.clone());
        self.nthreads = nthreads;
        self.memory_size = layout.min_memory_size;

        let [wx, wy, wz] = layout.workgroup_size;
        let [gx, gy, gz] = groups;
        self.data.workgroup_size = Uint4([wx, wy, wz, 0]);
        self.data.num_workgroups = Uint4([gx, gy, gz, 0]);
        self.data.invocations_per_subgroup = invocations_per_subgroup;
        self.data.invocations_per_workgroup = invocations_per_workgroup;
        self.data.subgroups_per_workgroup = subgroups_per_workgroup;
        self.data.descriptor_sets[0] = self
            .descriptor_set
            .as_ref()
            .map_or(std::ptr::null_mut(), AlignedBuf::as_ptr);

        log::debug!(
            "prepared '{}': groups {:?}, workgroup {:?}, {} subgroup(s)/group, \
             {} thread(s), barriers: {}",
            program.name(),
            groups,
            layout.workgroup_size,
            subgroups_per_workgroup,
            nthreads,
            self.has_cbarriers
        );
    }

    /// Forget the prepared program so later `dispatch_thread` calls do
    /// nothing. Storage is kept for the next `prepare`.
    pub fn reset(&mut self) {
        self.program = None;
        self.ngroups = 0;
    }

    /// Run this worker's share of the prepared dispatch.
    pub fn dispatch_thread(&self, thread_idx: usize, thread: &mut ThreadContext) {
        let Some(program) = self.program.as_ref() else {
            log::warn!("dispatch_thread called on an unprepared context");
            return;
        };

        let memory = thread.workgroup_memory(self.memory_size);
        let data = &self.data;

        let [sx, sy, _, _] = data.num_workgroups.0;
        let (sx, sy) = (sx as usize, sy as usize);

        for i in assigned_groups(thread_idx, self.nthreads, self.ngroups) {
            let (x, y, z) = group_coords(i, sx, sy);
            log::trace!("thread {} running group ({}, {}, {})", thread_idx, x, y, z);

            let workgroup = [x as u32, y as u32, z as u32];
            if self.has_cbarriers {
                for subgroup in 0..data.subgroups_per_workgroup {
                    let routine = program.begin(Launch {
                        data,
                        workgroup,
                        memory,
                        first_subgroup: subgroup,
                        subgroup_count: 1,
                    });
                    thread.routines.push(routine);
                }
            } else {
                let routine = program.begin(Launch {
                    data,
                    workgroup,
                    memory,
                    first_subgroup: 0,
                    subgroup_count: data.subgroups_per_workgroup,
                });
                thread.routines.push(routine);
            }

            // Retire the whole workgroup before starting the next one.
            while let Some(mut routine) = thread.routines.pop() {
                let mut result: YieldResult = 0;
                match program.resume(&mut routine, &mut result) {
                    Status::Suspended => thread.routines.push(routine),
                    Status::Finished => program.destroy(routine),
                }
            }
        }
    }

    /// Run every worker's share on scoped threads, one per thread context,
    /// and return once the whole grid has been executed.
    pub fn run_scoped(&self, threads: &mut [ThreadContext]) {
        std::thread::scope(|scope| {
            for (idx, thread) in threads.iter_mut().enumerate() {
                scope.spawn(move || self.dispatch_thread(idx, thread));
            }
        });
    }

    pub fn program(&self) -> Option<&Program> {
        self.program.as_ref()
    }

    pub fn data(&self) -> &ProgramData {
        &self.data
    }

    pub fn thread_count(&self) -> usize {
        self.nthreads
    }

    /// Workgroups in the prepared grid; zero if the grid was rejected.
    pub fn group_count(&self) -> usize {
        self.ngroups
    }

    pub fn subgroups_per_workgroup(&self) -> u32 {
        self.data.subgroups_per_workgroup
    }

    /// Bytes currently reserved for the descriptor-set copy.
    pub fn descriptor_set_capacity(&self) -> usize {
        self.descriptor_set.as_ref().map_or(0, AlignedBuf::len)
    }

    pub fn descriptor_set_bytes(&self) -> &[u8] {
        self.descriptor_set.as_ref().map_or(&[], AlignedBuf::as_slice)
    }
}

/// Flattened group index to grid coordinates.
pub fn group_coords(index: usize, sx: usize, sy: usize) -> (usize, usize, usize) {
    let z = index / (sx * sy);
    let rem = index % (sx * sy);
    (rem % sx, rem / sx, z)
}

/// Group indices assigned to worker `thread_idx` of `nthreads`.
pub fn assigned_groups(
    thread_idx: usize,
    nthreads: usize,
    ngroups: usize,
) -> impl Iterator<Item = usize> {
    (thread_idx..ngroups).step_by(nthreads.max(1))
}

// Coordinates are passed to native programs as `c_int`.
fn grid_size(groups: [u32; 3]) -> Option<usize> {
    if groups.iter().any(|&n| n > i32::MAX as u32) {
        return None;
    }
    let [x, y, z] = groups.map(|n| n as usize);
    x.checked_mul(y)?.checked_mul(z)
}

fn precondition_violation(message: &str) {
    #[cfg(feature = "panic-on-precondition-violation")]
    panic!("{}", message);

    #[cfg(not(feature = "panic-on-precondition-violation"))]
    log::warn!("{}", message);
}

/// Working memory of one worker. May be reused, but not concurrently.
#[derive(Default)]
pub struct ThreadContext {
    routines: CoroutineQueue<Coroutine>,
    memory: Option<AlignedBuf>,
}

impl ThreadContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn workgroup_memory(&mut self, size: usize) -> WorkgroupMemory {
        if size == 0 {
            return match &self.memory {
                Some(buf) => WorkgroupMemory::new(buf.as_ptr(), buf.len()),
                None => WorkgroupMemory::empty(),
            };
        }
        // The translator pads the size to leave room for alignment.
        if ensure_capacity(&mut self.memory, size, REQUIRED_MEMORY_ALIGNMENT) {
            log::debug!("workgroup memory grown to {} bytes", size);
        }
        match &self.memory {
            Some(buf) => WorkgroupMemory::new(buf.as_ptr(), buf.len()),
            None => WorkgroupMemory::empty(),
        }
    }

    /// Bytes of workgroup memory currently reserved.
    pub fn memory_capacity(&self) -> usize {
        self.memory.as_ref().map_or(0, AlignedBuf::len)
    }

    /// Capacity of the coroutine queue.
    pub fn queue_capacity(&self) -> usize {
        self.routines.capacity()
    }

    pub fn pending(&self) -> usize {
        self.routines.len()
    }

    /// Drop coroutines left behind by an interrupted dispatch. Native handles
    /// are released without calling `destroy`. Memory is kept.
    pub fn reset(&mut self) {
        if !self.routines.is_empty() {
            log::warn!("discarding {} pending coroutine(s)", self.routines.len());
        }
        self.routines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{Kernel, ProgramLayout, Routine};
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Records every begin; each routine suspends `resumes` times.
    #[derive(Default)]
    struct Recorder {
        begins: Mutex<Vec<([u32; 3], u32, u32, std::thread::ThreadId)>>,
        destroyed: AtomicUsize,
        resumes: u32,
    }

    struct CountdownRoutine(u32);

    impl Routine for CountdownRoutine {
        fn resume(&mut self, _result: &mut YieldResult) -> Status {
            if self.0 == 0 {
                Status::Finished
            } else {
                self.0 -= 1;
                Status::Suspended
            }
        }
    }

    impl Kernel for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn begin(&self, launch: Launch<'_>) -> Box<dyn Routine> {
            self.begins.lock().push((
                launch.workgroup,
                launch.first_subgroup,
                launch.subgroup_count,
                std::thread::current().id(),
            ));
            Box::new(CountdownRoutine(self.resumes))
        }

        fn destroy(&self, routine: Box<dyn Routine>) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            drop(routine);
        }
    }

    fn program(kernel: &Arc<Recorder>, layout: ProgramLayout) -> Program {
        Program::hosted(layout, kernel.clone()).unwrap()
    }

    fn prepare(
        ctx: &mut DispatchContext,
        nthreads: usize,
        program: &Program,
        bytes: &[u8],
        groups: [u32; 3],
    ) {
        // The recorder never reads its bindings.
        unsafe { ctx.prepare(nthreads, program, bytes, groups) }
    }

    #[test]
    fn test_group_coords() {
        // 3 x 2 x 2 grid
        assert_eq!(group_coords(0, 3, 2), (0, 0, 0));
        assert_eq!(group_coords(4, 3, 2), (1, 1, 0));
        assert_eq!(group_coords(6, 3, 2), (0, 0, 1));
        assert_eq!(group_coords(11, 3, 2), (2, 1, 1));
    }

    #[test]
    fn test_partition_covers_grid() {
        let ngroups = 37;
        for nthreads in 1..6 {
            let mut seen = HashSet::new();
            for t in 0..nthreads {
                for g in assigned_groups(t, nthreads, ngroups) {
                    assert!(seen.insert(g), "group {} assigned twice", g);
                }
            }
            assert_eq!(seen.len(), ngroups);
        }
    }

    #[test]
    fn test_prepare_derives_geometry() {
        let kernel = Arc::new(Recorder::default());
        let mut ctx = DispatchContext::new();
        let layout = ProgramLayout::new([5, 2, 1]).with_descriptor_set(8);
        prepare(&mut ctx, 3, &program(&kernel, layout), &[1, 2, 3, 4, 5, 6, 7, 8], [2, 3, 4]);
        assert_eq!(ctx.thread_count(), 3);
        assert_eq!(ctx.data().invocations_per_subgroup, 4);
        assert_eq!(ctx.data().invocations_per_workgroup, 10);
        assert_eq!(ctx.subgroups_per_workgroup(), 3);
        assert_eq!(ctx.data().num_workgroups, Uint4([2, 3, 4, 0]));
        assert_eq!(&ctx.descriptor_set_bytes()[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(
            ctx.data().descriptor_sets[0] as usize % REQUIRED_MEMORY_ALIGNMENT,
            0
        );
    }

    #[test]
    fn test_descriptor_storage_never_shrinks() {
        let kernel = Arc::new(Recorder::default());
        let mut ctx = DispatchContext::new();

        let big = program(&kernel, ProgramLayout::new([1, 1, 1]).with_descriptor_set(64));
        let small = program(&kernel, ProgramLayout::new([1, 1, 1]).with_descriptor_set(32));
        let bigger = program(&kernel, ProgramLayout::new([1, 1, 1]).with_descriptor_set(128));

        prepare(&mut ctx, 1, &big, &[0xAA; 64], [1, 1, 1]);
        prepare(&mut ctx, 1, &small, &[0x11; 32], [1, 1, 1]);
        assert!(ctx.descriptor_set_capacity() >= 64);
        assert_eq!(&ctx.descriptor_set_bytes()[..32], &[0x11; 32]);

        let bytes: Vec<u8> = (0..128).map(|i| i as u8).collect();
        prepare(&mut ctx, 1, &bigger, &bytes, [1, 1, 1]);
        assert!(ctx.descriptor_set_capacity() >= 128);
        assert_eq!(&ctx.descriptor_set_bytes()[..128], &bytes[..]);
    }

    #[test]
    fn test_prepare_is_idempotent() {
        let kernel = Arc::new(Recorder::default());
        let prog = program(&kernel, ProgramLayout::new([4, 4, 1]).with_descriptor_set(16));
        let mut a = DispatchContext::new();
        prepare(&mut a, 2, &prog, &[9; 16], [3, 1, 1]);
        let first = (a.descriptor_set_bytes().to_vec(), a.data().subgroups_per_workgroup);
        prepare(&mut a, 2, &prog, &[9; 16], [3, 1, 1]);
        assert_eq!(first, (a.descriptor_set_bytes().to_vec(), a.data().subgroups_per_workgroup));
        assert_eq!(a.data().num_workgroups, Uint4([3, 1, 1, 0]));
    }

    #[test]
    fn test_begin_count_without_barriers() {
        let kernel = Arc::new(Recorder {
            resumes: 2,
            ..Recorder::default()
        });
        let mut ctx = DispatchContext::new();
        prepare(&mut ctx, 3, &program(&kernel, ProgramLayout::new([8, 1, 1])), &[], [3, 2, 2]);
        let mut threads: Vec<_> = (0..3).map(|_| ThreadContext::new()).collect();
        ctx.run_scoped(&mut threads);

        let begins = kernel.begins.lock();
        assert_eq!(begins.len(), 12);
        assert!(begins.iter().all(|&(_, first, count, _)| first == 0 && count == 2));
        assert_eq!(kernel.destroyed.load(Ordering::SeqCst), 12);
        assert!(threads.iter().all(|t| t.pending() == 0));
    }

    #[test]
    fn test_begin_count_with_barriers() {
        let kernel = Arc::new(Recorder {
            resumes: 3,
            ..Recorder::default()
        });
        let layout = ProgramLayout::new([3, 3, 1]).with_cbarriers(true);
        let mut ctx = DispatchContext::new();
        prepare(&mut ctx, 2, &program(&kernel, layout), &[], [2, 2, 1]);
        let mut threads: Vec<_> = (0..2).map(|_| ThreadContext::new()).collect();
        ctx.run_scoped(&mut threads);

        // ceil(9 / 4) = 3 subgroups per workgroup
        let begins = kernel.begins.lock();
        assert_eq!(begins.len(), 4 * 3);
        assert!(begins.iter().all(|&(_, _, count, _)| count == 1));
        for group in [[0, 0, 0], [1, 0, 0], [0, 1, 0], [1, 1, 0]] {
            let mut subgroups: Vec<u32> = begins
                .iter()
                .filter(|b| b.0 == group)
                .map(|b| b.1)
                .collect();
            subgroups.sort_unstable();
            assert_eq!(subgroups, vec![0, 1, 2]);
        }
        assert_eq!(kernel.destroyed.load(Ordering::SeqCst), 12);
    }

    #[test]
    fn test_two_groups_two_threads() {
        let kernel = Arc::new(Recorder::default());
        let mut ctx = DispatchContext::new();
        prepare(&mut ctx, 2, &program(&kernel, ProgramLayout::new([4, 1, 1])), &[], [2, 1, 1]);
        assert_eq!(ctx.subgroups_per_workgroup(), 1);

        let mut threads = vec![ThreadContext::new(), ThreadContext::new()];
        ctx.run_scoped(&mut threads);

        let begins = kernel.begins.lock();
        assert_eq!(begins.len(), 2);
        assert_ne!(begins[0].3, begins[1].3, "each group should run on its own thread");
        let mut groups: Vec<_> = begins.iter().map(|b| b.0).collect();
        groups.sort_unstable();
        assert_eq!(groups, vec![[0, 0, 0], [1, 0, 0]]);
        assert_eq!(kernel.destroyed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_thread_memory_grows_only() {
        let kernel = Arc::new(Recorder::default());
        let mut thread = ThreadContext::new();
        let mut ctx = DispatchContext::new();

        let large = program(&kernel, ProgramLayout::new([1, 1, 1]).with_memory(256));
        prepare(&mut ctx, 1, &large, &[], [1, 1, 1]);
        ctx.dispatch_thread(0, &mut thread);
        assert_eq!(thread.memory_capacity(), 256);

        let small = program(&kernel, ProgramLayout::new([1, 1, 1]).with_memory(64));
        prepare(&mut ctx, 1, &small, &[], [1, 1, 1]);
        ctx.dispatch_thread(0, &mut thread);
        assert_eq!(thread.memory_capacity(), 256);
    }

    #[test]
    fn test_unprepared_context_is_a_no_op() {
        let ctx = DispatchContext::new();
        let mut thread = ThreadContext::new();
        ctx.dispatch_thread(0, &mut thread);
        assert_eq!(thread.pending(), 0);
    }

    #[cfg(not(feature = "panic-on-precondition-violation"))]
    #[test]
    fn test_zero_threads_is_clamped() {
        let kernel = Arc::new(Recorder::default());
        let mut ctx = DispatchContext::new();
        prepare(&mut ctx, 0, &program(&kernel, ProgramLayout::new([1, 1, 1])), &[], [3, 1, 1]);
        assert_eq!(ctx.thread_count(), 1);
        ctx.dispatch_thread(0, &mut ThreadContext::new());
        assert_eq!(kernel.begins.lock().len(), 3);
    }

    #[test]
    fn test_reset_forgets_program() {
        let kernel = Arc::new(Recorder::default());
        let mut ctx = DispatchContext::new();
        let layout = ProgramLayout::new([4, 1, 1]).with_descriptor_set(16);
        prepare(&mut ctx, 1, &program(&kernel, layout), &[7; 16], [3, 1, 1]);
        ctx.reset();
        assert!(ctx.program().is_none());
        assert_eq!(ctx.group_count(), 0);
        assert!(ctx.descriptor_set_capacity() >= 16);

        ctx.dispatch_thread(0, &mut ThreadContext::new());
        assert!(kernel.begins.lock().is_empty());
    }

    #[test]
    fn test_grid_size_limits() {
        assert_eq!(grid_size([2, 3, 4]), Some(24));
        assert_eq!(grid_size([0, 5, 5]), Some(0));
        assert_eq!(grid_size([i32::MAX as u32, 1, 1]), Some(i32::MAX as usize));
        assert_eq!(grid_size([i32::MAX as u32 + 1, 1, 1]), None);
        assert_eq!(grid_size([u32::MAX; 3]), None);
    }

    #[cfg(not(feature = "panic-on-precondition-violation"))]
    #[test]
    fn test_oversized_grid_dispatches_nothing() {
        let kernel = Arc::new(Recorder::default());
        let prog = program(&kernel, ProgramLayout::new([1, 1, 1]));
        let mut ctx = DispatchContext::new();
        let mut thread = ThreadContext::new();

        for groups in [[u32::MAX; 3], [i32::MAX as u32 + 1, 1, 1]] {
            prepare(&mut ctx, 1, &prog, &[], groups);
            assert_eq!(ctx.group_count(), 0);
            ctx.dispatch_thread(0, &mut thread);
        }
        assert!(kernel.begins.lock().is_empty());
    }
}
