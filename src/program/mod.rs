use std::sync::Arc;

use thiserror::Error;

use crate::code::Routine;

pub use binding::{BufferDescriptor, DescriptorSetLayout};

pub mod binding;

/// Reflection for one binding slot a program expects.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BindingInfo {
    /// Smallest buffer, in bytes, the program's declared accesses fit in.
    pub min_len: usize,
}

/// Reflection metadata of a compiled program.
///
/// Produced by the front-end compiler alongside the routine; never mutated.
/// The subgroup width and workgroup memory footprint are whatever that
/// compiler chose for the program, not engine constants.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProgramInfo {
    /// Entry point identifier, for diagnostics.
    pub entry: String,
    /// Invocations per workgroup along X/Y/Z.
    pub workgroup_size: [u32; 3],
    /// Invocations per subgroup.
    pub subgroup_width: u32,
    /// Workgroup-shared memory footprint in words.
    pub workgroup_words: usize,
    /// Binding slots the program expects, in slot order.
    pub bindings: Arc<[BindingInfo]>,
}

impl ProgramInfo {
    /// Invocations in one workgroup.
    #[inline]
    pub fn invocations(&self) -> u32 {
        let [x, y, z] = self.workgroup_size;
        x * y * z
    }

    /// Subgroups in one workgroup; the last one may be partial.
    #[inline]
    pub fn subgroups(&self) -> u32 {
        self.invocations().div_ceil(self.subgroup_width)
    }
}

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("workgroup extent must be non-zero on every axis: {0:?}")]
    Extent([u32; 3]),
    #[error("subgroup width must be non-zero")]
    SubgroupWidth,
}

/// A compiled kernel: reflection plus executable routine.
#[derive(Debug, Clone)]
pub struct Program {
    pub info: ProgramInfo,
    routine: Routine,
}

impl Program {
    pub fn new(info: ProgramInfo, routine: Routine) -> Result<Self, ProgramError> {
        if info.workgroup_size.contains(&0) {
            return Err(ProgramError::Extent(info.workgroup_size));
        }
        if info.subgroup_width == 0 {
            return Err(ProgramError::SubgroupWidth);
        }
        Ok(Self { info, routine })
    }

    #[inline]
    pub fn routine(&self) -> &Routine {
        &self.routine
    }
}

#[derive(Debug, Error)]
pub enum BindError {
    #[error("descriptor set has {actual} bindings, program expects {expected}")]
    SlotCount { expected: usize, actual: usize },
    #[error("binding {binding} is {len} bytes, program requires at least {min}")]
    BindingTooSmall {
        binding: usize,
        len: usize,
        min: usize,
    },
}

/// A program bound to concrete resources, ready to dispatch.
///
/// Built only through [`ProgramData::bind`], so a value of this type is the
/// proof that the descriptor set satisfied the program's requirements.
/// Read-only for the dispatch's duration; clones are cheap.
#[derive(Debug, Clone)]
pub struct ProgramData {
    program: Arc<Program>,
    layout: DescriptorSetLayout,
    uniform: Arc<[u32]>,
}

impl ProgramData {
    /// Validates the descriptor set against the program's reflection.
    ///
    /// Checks slot count and per-binding minimum footprints; no side effects
    /// on failure.
    pub fn bind(
        program: Arc<Program>,
        layout: DescriptorSetLayout,
        uniform: impl Into<Arc<[u32]>>,
    ) -> Result<Self, BindError> {
        let expected = program.info.bindings.len();
        let actual = layout.slots();
        if expected != actual {
            return Err(BindError::SlotCount { expected, actual });
        }
        for (binding, (info, descriptor)) in
            program.info.bindings.iter().zip(layout.iter()).enumerate()
        {
            if descriptor.len() < info.min_len {
                return Err(BindError::BindingTooSmall {
                    binding,
                    len: descriptor.len(),
                    min: info.min_len,
                });
            }
        }
        let uniform = uniform.into();
        Ok(Self {
            program,
            layout,
            uniform,
        })
    }

    #[inline]
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    #[inline]
    pub fn info(&self) -> &ProgramInfo {
        &self.program.info
    }

    #[inline]
    pub fn descriptor(&self, binding: u32) -> Option<&BufferDescriptor> {
        self.layout.slot(binding)
    }

    #[inline]
    pub fn uniform(&self) -> &[u32] {
        &self.uniform
    }
}
