//! Builtin hosted kernels
//!
//! Small kernels written directly against the coroutine interface. They are
//! used by the `kernrun` CLI and the benchmarks, and double as reference
//! implementations for translator-emitted code:
//!
//! - [`FillKernel`]: no barriers, one coroutine per workgroup that yields
//!   after every subgroup.
//! - [`WorkgroupSumKernel`]: control barriers and shared memory.
//! - [`ClearImageKernel`]: image bindings, 2-D workgroups.

use std::sync::Arc;

use crate::abi::{BufferDescriptor, ImageDescriptor, ProgramData, YieldResult};
use crate::alloc::DescriptorSetWriter;
use crate::program::{
    HostedProgram, Kernel, Launch, Program, ProgramLayout, Routine, Status, WorkgroupMemory,
};

fn div_ceil(n: usize, d: usize) -> u32 {
    ((n + d - 1) / d) as u32
}

/// Linear index of `group` in the dispatch grid.
fn linear_group(data: &ProgramData, group: [u32; 3]) -> usize {
    let [gx, gy, _, _] = data.num_workgroups.0;
    group[0] as usize + group[1] as usize * gx as usize + group[2] as usize * (gx * gy) as usize
}

// ---------------------------------------------------------------------------
// Fill
// ---------------------------------------------------------------------------

/// Writes a constant into every `u32` of the target buffer.
pub struct FillKernel;

impl FillKernel {
    pub const WORKGROUP_SIZE: u32 = 64;
    pub const TARGET_BINDING: usize = 0;
    pub const VALUE_BINDING: usize = 16;
    pub const DESC_SET_SIZE: usize = 20;

    pub fn program() -> Program {
        let layout = ProgramLayout::new([Self::WORKGROUP_SIZE, 1, 1])
            .with_descriptor_set(Self::DESC_SET_SIZE);
        Program::Hosted(HostedProgram::new(layout, Arc::new(FillKernel)))
    }

    pub fn descriptor_set(target: &BufferDescriptor, value: u32) -> Vec<u8> {
        let mut writer = DescriptorSetWriter::new();
        writer.push_buffer(target);
        writer.push_u32(value);
        writer.finish()
    }

    /// Grid covering `words` elements.
    pub fn groups_for(words: usize) -> [u32; 3] {
        [div_ceil(words, Self::WORKGROUP_SIZE as usize), 1, 1]
    }
}

struct FillRoutine {
    target: BufferDescriptor,
    value: u32,
    base: usize,
    lanes: u32,
    next_subgroup: u32,
    end_subgroup: u32,
}

// The target pointer is only dereferenced by the worker resuming the routine.
unsafe impl Send for FillRoutine {}

impl Routine for FillRoutine {
    fn resume(&mut self, _result: &mut YieldResult) -> Status {
        let first = self.next_subgroup * self.lanes;
        for lane in first..first + self.lanes {
            unsafe { self.target.write_u32(self.base + lane as usize, self.value) };
        }
        self.next_subgroup += 1;
        if self.next_subgroup < self.end_subgroup {
            Status::Suspended
        } else {
            Status::Finished
        }
    }
}

impl Kernel for FillKernel {
    fn name(&self) -> &str {
        "fill"
    }

    fn begin(&self, launch: Launch<'_>) -> Box<dyn Routine> {
        let data = launch.data;
        let (target, value) = unsafe {
            (
                data.buffer(Self::TARGET_BINDING),
                data.binding::<u32>(0, Self::VALUE_BINDING),
            )
        };
        let invocations = data.invocations_per_workgroup as usize;
        Box::new(FillRoutine {
            target,
            value,
            base: linear_group(data, launch.workgroup) * invocations,
            lanes: data.invocations_per_subgroup,
            next_subgroup: launch.first_subgroup,
            end_subgroup: launch.first_subgroup + launch.subgroup_count,
        })
    }
}

// ---------------------------------------------------------------------------
// Workgroup sum
// ---------------------------------------------------------------------------

/// Sums each workgroup's slice of the input into one output word.
///
/// Every subgroup adds its lanes into a slot of workgroup memory and waits on
/// a control barrier; subgroup 0 then adds the slots and stores the total.
///
/// Workgroup memory layout (in `u32` words): `[arrived, partial_0, partial_1, ...]`.
pub struct WorkgroupSumKernel;

impl WorkgroupSumKernel {
    pub const WORKGROUP_SIZE: u32 = 16;
    pub const INPUT_BINDING: usize = 0;
    pub const OUTPUT_BINDING: usize = 16;
    pub const DESC_SET_SIZE: usize = 32;
    // One counter word plus a slot per subgroup, padded to 16 bytes.
    pub const MEMORY_SIZE: usize = 32;

    pub fn program() -> Program {
        let layout = ProgramLayout::new([Self::WORKGROUP_SIZE, 1, 1])
            .with_cbarriers(true)
            .with_memory(Self::MEMORY_SIZE)
            .with_descriptor_set(Self::DESC_SET_SIZE);
        Program::Hosted(HostedProgram::new(layout, Arc::new(WorkgroupSumKernel)))
    }

    pub fn descriptor_set(input: &BufferDescriptor, output: &BufferDescriptor) -> Vec<u8> {
        let mut writer = DescriptorSetWriter::new();
        writer.push_buffer(input);
        writer.push_buffer(output);
        writer.finish()
    }

    pub fn groups_for(words: usize) -> [u32; 3] {
        [div_ceil(words, Self::WORKGROUP_SIZE as usize), 1, 1]
    }

    /// Host-side reference result.
    pub fn reference(input: &[u32]) -> Vec<u32> {
        input
            .chunks(Self::WORKGROUP_SIZE as usize)
            .map(|chunk| chunk.iter().fold(0u32, |acc, v| acc.wrapping_add(*v)))
            .collect()
    }
}

enum SumState {
    Accumulate,
    Barrier,
}

struct SumRoutine {
    input: BufferDescriptor,
    output: BufferDescriptor,
    memory: WorkgroupMemory,
    group: usize,
    base: usize,
    lanes: u32,
    subgroup: u32,
    subgroups: u32,
    state: SumState,
}

unsafe impl Send for SumRoutine {}

impl Routine for SumRoutine {
    fn resume(&mut self, _result: &mut YieldResult) -> Status {
        match self.state {
            SumState::Accumulate => {
                let first = self.base + (self.subgroup * self.lanes) as usize;
                let partial = (first..first + self.lanes as usize)
                    .map(|i| unsafe { self.input.read_u32(i) })
                    .fold(0u32, u32::wrapping_add);
                unsafe {
                    self.memory.store_u32(1 + self.subgroup as usize, partial);
                    let arrived = self.memory.load_u32(0);
                    self.memory.store_u32(0, arrived + 1);
                }
                self.state = SumState::Barrier;
                Status::Suspended
            }
            SumState::Barrier => {
                if unsafe { self.memory.load_u32(0) } < self.subgroups {
                    return Status::Suspended;
                }
                if self.subgroup == 0 {
                    let total = (0..self.subgroups as usize)
                        .map(|s| unsafe { self.memory.load_u32(1 + s) })
                        .fold(0u32, u32::wrapping_add);
                    unsafe { self.output.write_u32(self.group, total) };
                }
                Status::Finished
            }
        }
    }
}

impl Kernel for WorkgroupSumKernel {
    fn name(&self) -> &str {
        "workgroup-sum"
    }

    fn begin(&self, launch: Launch<'_>) -> Box<dyn Routine> {
        let data = launch.data;
        // All subgroups of a workgroup are begun before any is resumed, so the
        // first one resets the barrier counter for the others.
        if launch.first_subgroup == 0 {
            unsafe { launch.memory.store_u32(0, 0) };
        }
        let group = linear_group(data, launch.workgroup);
        let (input, output) = unsafe {
            (
                data.buffer(Self::INPUT_BINDING),
                data.buffer(Self::OUTPUT_BINDING),
            )
        };
        Box::new(SumRoutine {
            input,
            output,
            memory: launch.memory,
            group,
            base: group * data.invocations_per_workgroup as usize,
            lanes: data.invocations_per_subgroup,
            subgroup: launch.first_subgroup,
            subgroups: data.subgroups_per_workgroup,
            state: SumState::Accumulate,
        })
    }
}

// ---------------------------------------------------------------------------
// Clear image
// ---------------------------------------------------------------------------

/// Fills an RGBA8 image with one packed color, an 8×8 tile per workgroup.
pub struct ClearImageKernel;

impl ClearImageKernel {
    pub const TILE: u32 = 8;
    pub const IMAGE_BINDING: usize = 0;
    pub const COLOR_BINDING: usize = std::mem::size_of::<ImageDescriptor>();
    pub const DESC_SET_SIZE: usize = Self::COLOR_BINDING + 4;

    pub fn program() -> Program {
        let layout = ProgramLayout::new([Self::TILE, Self::TILE, 1])
            .with_descriptor_set(Self::DESC_SET_SIZE);
        Program::Hosted(HostedProgram::new(layout, Arc::new(ClearImageKernel)))
    }

    pub fn descriptor_set(image: &ImageDescriptor, rgba: u32) -> Vec<u8> {
        let mut writer = DescriptorSetWriter::new();
        writer.push_image(image);
        writer.push_u32(rgba);
        writer.finish()
    }

    pub fn groups_for(width: u32, height: u32) -> [u32; 3] {
        [
            div_ceil(width as usize, Self::TILE as usize),
            div_ceil(height as usize, Self::TILE as usize),
            1,
        ]
    }
}

struct ClearRoutine {
    image: ImageDescriptor,
    rgba: u32,
    origin: (u32, u32),
    lanes: std::ops::Range<u32>,
}

unsafe impl Send for ClearRoutine {}

impl Routine for ClearRoutine {
    fn resume(&mut self, _result: &mut YieldResult) -> Status {
        let tile = ClearImageKernel::TILE;
        for lane in self.lanes.clone() {
            let (x, y) = (self.origin.0 + lane % tile, self.origin.1 + lane / tile);
            unsafe { self.image.write_texel(x, y, self.rgba) };
        }
        Status::Finished
    }
}

impl Kernel for ClearImageKernel {
    fn name(&self) -> &str {
        "clear-image"
    }

    fn begin(&self, launch: Launch<'_>) -> Box<dyn Routine> {
        let data = launch.data;
        let (image, rgba) = unsafe {
            (
                data.image(Self::IMAGE_BINDING),
                data.binding::<u32>(0, Self::COLOR_BINDING),
            )
        };
        let lanes = data.invocations_per_subgroup;
        let first = launch.first_subgroup * lanes;
        let last = (launch.first_subgroup + launch.subgroup_count) * lanes;
        Box::new(ClearRoutine {
            image,
            rgba,
            origin: (launch.workgroup[0] * Self::TILE, launch.workgroup[1] * Self::TILE),
            lanes: first..last.min(data.invocations_per_workgroup),
        })
    }
}
