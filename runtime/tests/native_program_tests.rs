//! Programs driven through the C entry-point contract
//!
//! The test kernel has two subgroups per workgroup. With control barriers each
//! subgroup publishes a value in workgroup memory, suspends, and checks its
//! peer's value once resumed. Every begin/destroy is counted in a buffer so
//! the tests can check that each coroutine is destroyed exactly once.

use std::sync::atomic::{AtomicU32, Ordering};

use kernrun_runtime::abi::{BufferDescriptor, ProgramData, ProgramInfo, RawCoroutine, YieldResult};
use kernrun_runtime::ffi::{
    kernrun_alloc_dispatch_context, kernrun_alloc_thread_context, kernrun_dispatch_thread,
    kernrun_free_dispatch_context, kernrun_free_thread_context, kernrun_prepare_dispatch,
};
use kernrun_runtime::{
    allocate_buffer, Buffer, DescriptorSetWriter, DispatchContext, PoolConfig, Program,
    RuntimeError, ThreadContext, WorkerPool,
};
use libc::{c_int, c_void};

const WORKGROUP_SIZE: c_int = 8;
const SUBGROUPS: usize = 2;
const OUTPUT_BINDING: usize = 0;
const COUNTERS_BINDING: usize = 16;
const DESC_SET_SIZE: usize = 32;
const BAD: u32 = 0xBAD;

struct State {
    counters: *const AtomicU32,
    output: BufferDescriptor,
    memory: *mut u32,
    group: u32,
    subgroup: usize,
    subgroup_count: u32,
    barriers: bool,
    resumed: bool,
}

unsafe fn start(
    data: *mut ProgramData,
    x: c_int,
    y: c_int,
    z: c_int,
    memory: *mut c_void,
    first_subgroup: c_int,
    subgroup_count: c_int,
    barriers: bool,
) -> RawCoroutine {
    let data = &*data;
    let counters = data.buffer(COUNTERS_BINDING).ptr as *const AtomicU32;
    (*counters).fetch_add(1, Ordering::SeqCst);
    let [gx, gy, _, _] = data.num_workgroups.0;
    let state = State {
        counters,
        output: data.buffer(OUTPUT_BINDING),
        memory: memory as *mut u32,
        group: x as u32 + y as u32 * gx + z as u32 * gx * gy,
        subgroup: first_subgroup as usize,
        subgroup_count: subgroup_count as u32,
        barriers,
        resumed: false,
    };
    Box::into_raw(Box::new(state)) as RawCoroutine
}

unsafe extern "C" fn begin_with_barriers(
    data: *mut ProgramData,
    x: c_int,
    y: c_int,
    z: c_int,
    memory: *mut c_void,
    first_subgroup: c_int,
    subgroup_count: c_int,
) -> RawCoroutine {
    start(data, x, y, z, memory, first_subgroup, subgroup_count, true)
}

unsafe extern "C" fn begin_plain(
    data: *mut ProgramData,
    x: c_int,
    y: c_int,
    z: c_int,
    memory: *mut c_void,
    first_subgroup: c_int,
    subgroup_count: c_int,
) -> RawCoroutine {
    start(data, x, y, z, memory, first_subgroup, subgroup_count, false)
}

unsafe extern "C" fn await_routine(routine: RawCoroutine, result: *mut YieldResult) -> bool {
    let state = &mut *(routine as *mut State);
    *result = state.group as YieldResult;
    if !state.barriers {
        state.output.write_u32(state.group as usize, state.subgroup_count);
        return false;
    }
    let token = state.group + 1;
    if !state.resumed {
        *state.memory.add(state.subgroup) = token;
        state.resumed = true;
        return true;
    }
    let peer = *state.memory.add(1 - state.subgroup);
    let slot = state.group as usize * SUBGROUPS + state.subgroup;
    state.output.write_u32(slot, if peer == token { 1 } else { BAD });
    false
}

unsafe extern "C" fn destroy_routine(routine: RawCoroutine) {
    let state = Box::from_raw(routine as *mut State);
    (*state.counters.add(1)).fetch_add(1, Ordering::SeqCst);
}

fn info(barriers: bool) -> ProgramInfo {
    ProgramInfo {
        min_memory_size: if barriers { 16 } else { 0 },
        has_cbarriers: barriers,
        desc_set_size: DESC_SET_SIZE,
        workgroup_size_x: WORKGROUP_SIZE,
        workgroup_size_y: 1,
        workgroup_size_z: 1,
        begin: if barriers { begin_with_barriers } else { begin_plain },
        await_: await_routine,
        destroy: destroy_routine,
    }
}

fn init_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Warn)
        .is_test(true)
        .try_init();
}

/// Buffers bound by `desc_set`; every test keeps the harness alive until its
/// dispatches have finished.
struct Harness {
    output: Buffer,
    counters: Buffer,
    desc_set: Vec<u8>,
}

impl Harness {
    fn new(output_words: usize) -> Self {
        init_logging();
        let output = allocate_buffer(output_words * 4);
        let counters = allocate_buffer(2 * 4);
        let mut writer = DescriptorSetWriter::new();
        writer.push_buffer(&output.descriptor());
        writer.push_buffer(&counters.descriptor());
        let desc_set = writer.finish();
        assert_eq!(desc_set.len(), DESC_SET_SIZE);
        Harness {
            output,
            counters,
            desc_set,
        }
    }

    fn begun(&self) -> u32 {
        self.counters.to_u32_vec()[0]
    }

    fn destroyed(&self) -> u32 {
        self.counters.to_u32_vec()[1]
    }
}

#[test]
fn test_barrier_program_single_thread() {
    let program = unsafe { Program::native(info(true)) }.unwrap();
    let groups = [3, 2, 1];
    let harness = Harness::new(6 * SUBGROUPS);

    let mut ctx = DispatchContext::new();
    let mut thread = ThreadContext::new();
    unsafe { ctx.prepare(1, &program, &harness.desc_set, groups) };
    assert_eq!(ctx.subgroups_per_workgroup(), SUBGROUPS as u32);
    ctx.dispatch_thread(0, &mut thread);

    assert_eq!(harness.begun(), 12);
    assert_eq!(harness.destroyed(), 12);
    assert_eq!(harness.output.to_u32_vec(), vec![1; 12]);
    assert_eq!(thread.pending(), 0);
    assert!(thread.memory_capacity() >= 16);
}

#[test]
fn test_barrier_program_on_scoped_threads() {
    let program = unsafe { Program::native(info(true)) }.unwrap();
    let groups = [4, 3, 2];
    let ngroups = 24;
    let harness = Harness::new(ngroups * SUBGROUPS);

    let mut ctx = DispatchContext::new();
    unsafe { ctx.prepare(3, &program, &harness.desc_set, groups) };
    let mut threads: Vec<_> = (0..3).map(|_| ThreadContext::new()).collect();
    ctx.run_scoped(&mut threads);

    assert_eq!(harness.begun() as usize, ngroups * SUBGROUPS);
    assert_eq!(harness.destroyed(), harness.begun());
    assert_eq!(harness.output.to_u32_vec(), vec![1; ngroups * SUBGROUPS]);
}

#[test]
fn test_plain_program_begins_once_per_workgroup() {
    let program = unsafe { Program::native(info(false)) }.unwrap();
    let harness = Harness::new(5);

    let mut ctx = DispatchContext::new();
    unsafe { ctx.prepare(2, &program, &harness.desc_set, [5, 1, 1]) };
    let mut threads = vec![ThreadContext::new(), ThreadContext::new()];
    ctx.run_scoped(&mut threads);

    assert_eq!(harness.begun(), 5);
    assert_eq!(harness.destroyed(), 5);
    assert_eq!(harness.output.to_u32_vec(), vec![SUBGROUPS as u32; 5]);
}

#[test]
fn test_native_program_through_pool() {
    let program = unsafe { Program::native(info(true)) }.unwrap();
    let pool = WorkerPool::new(PoolConfig::default().with_workers(4)).unwrap();
    let harness = Harness::new(10 * SUBGROUPS);

    for _ in 0..3 {
        unsafe { pool.dispatch(&program, &harness.desc_set, [10, 1, 1]) }.unwrap();
    }
    pool.wait().unwrap();

    assert_eq!(harness.begun() as usize, 3 * 10 * SUBGROUPS);
    assert_eq!(harness.destroyed(), harness.begun());
    assert_eq!(harness.output.to_u32_vec(), vec![1; 10 * SUBGROUPS]);
}

#[test]
fn test_c_entry_points_across_threads() {
    let info = info(true);
    let harness = Harness::new(7 * SUBGROUPS);
    let nthreads = 3;

    unsafe {
        let ctx = kernrun_alloc_dispatch_context();
        kernrun_prepare_dispatch(
            ctx,
            nthreads,
            &info,
            harness.desc_set.as_ptr(),
            7,
            1,
            1,
        );

        let threads: Vec<usize> = (0..nthreads)
            .map(|_| kernrun_alloc_thread_context() as usize)
            .collect();
        let ctx_addr = ctx as usize;
        std::thread::scope(|scope| {
            for (idx, &thread) in threads.iter().enumerate() {
                scope.spawn(move || {
                    kernrun_dispatch_thread(
                        ctx_addr as *const DispatchContext,
                        idx as c_int,
                        thread as *mut ThreadContext,
                    )
                });
            }
        });

        for thread in threads {
            kernrun_free_thread_context(thread as *mut ThreadContext);
        }
        kernrun_free_dispatch_context(ctx);
    }

    assert_eq!(harness.begun() as usize, 7 * SUBGROUPS);
    assert_eq!(harness.destroyed(), harness.begun());
    assert_eq!(harness.output.to_u32_vec(), vec![1; 7 * SUBGROUPS]);
}

#[test]
fn test_negative_workgroup_size_is_rejected() {
    let mut bad = info(false);
    bad.workgroup_size_y = -1;
    let err = unsafe { Program::native(bad) }.unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidProgram(_)));
}
