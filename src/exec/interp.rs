use thiserror::Error;

use crate::{
    code::{BarrierId, BinaryOp, Builtin, Dim, Instr, Reg, UnaryOp},
    memory::{AccessError, WorkgroupMemory},
    program::ProgramData,
};

/// A trap raised by shader code, or a broken barrier discipline.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("buffer binding {binding}: {source}")]
    Buffer {
        binding: u32,
        #[source]
        source: AccessError,
    },
    #[error("workgroup memory: {0}")]
    Shared(AccessError),
    #[error("uniform word {index} out of range ({words} words)")]
    Uniform { index: u32, words: usize },
    #[error("no buffer bound at binding {0}")]
    Binding(u32),
    #[error("integer division by zero")]
    DivideByZero,
    #[error("one workgroup reached both {lhs} and {rhs}")]
    BarrierMismatch { lhs: BarrierId, rhs: BarrierId },
    #[error("some invocations returned while others wait at {0}")]
    BarrierExit(BarrierId),
}

/// Execution environment shared by every lane of one coroutine.
pub(crate) struct ExecCx<'a> {
    pub data: &'a ProgramData,
    pub shared: &'a WorkgroupMemory,
    pub workgroup: [u32; 3],
}

impl ExecCx<'_> {
    fn builtin(&self, builtin: Builtin, invocation: u32) -> u32 {
        let info = self.data.info();
        let [sx, sy, _] = info.workgroup_size;
        let local = [invocation % sx, (invocation / sx) % sy, invocation / (sx * sy)];
        let axis = |dim: Dim| dim as usize;
        match builtin {
            Builtin::LocalId(dim) => local[axis(dim)],
            Builtin::LocalIndex => invocation,
            Builtin::GlobalId(dim) => {
                let dim = axis(dim);
                self.workgroup[dim] * info.workgroup_size[dim] + local[dim]
            }
            Builtin::WorkgroupId(dim) => self.workgroup[axis(dim)],
            Builtin::WorkgroupSize(dim) => info.workgroup_size[axis(dim)],
            Builtin::SubgroupId => invocation / info.subgroup_width,
            Builtin::SubgroupLaneId => invocation % info.subgroup_width,
            Builtin::SubgroupWidth => info.subgroup_width,
            Builtin::NumSubgroups => info.subgroups(),
        }
    }
}

/// Why a lane stopped interpreting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LaneYield {
    Barrier(BarrierId),
    Finished,
}

/// Saved execution context of a single invocation: its position in the
/// routine plus its register file. The parked program counter is the resume
/// point.
#[derive(Debug, Clone)]
pub(crate) struct Lane {
    invocation: u32,
    pc: u32,
    regs: Box<[u32]>,
    finished: bool,
}

impl Lane {
    pub fn new(invocation: u32, registers: usize) -> Self {
        Self {
            invocation,
            pc: 0,
            regs: vec![0; registers].into_boxed_slice(),
            finished: false,
        }
    }

    #[inline]
    pub fn finished(&self) -> bool {
        self.finished
    }

    #[inline]
    fn get(&self, reg: Reg) -> u32 {
        self.regs[reg.0 as usize]
    }

    #[inline]
    fn set(&mut self, reg: Reg, value: u32) {
        self.regs[reg.0 as usize] = value;
    }

    /// Interprets until the lane parks at a barrier or returns.
    pub fn run(&mut self, cx: &ExecCx) -> Result<LaneYield, ExecError> {
        let code = cx.data.program().routine().code();
        loop {
            let instr = code[self.pc as usize];
            self.pc += 1;
            match instr {
                Instr::Const { dst, value } => self.set(dst, value),
                Instr::Move { dst, src } => self.set(dst, self.get(src)),
                Instr::Builtin { dst, builtin } => {
                    self.set(dst, cx.builtin(builtin, self.invocation))
                }
                Instr::Uniform { dst, index } => {
                    let uniform = cx.data.uniform();
                    let value =
                        uniform
                            .get(index as usize)
                            .copied()
                            .ok_or(ExecError::Uniform {
                                index,
                                words: uniform.len(),
                            })?;
                    self.set(dst, value)
                }
                Instr::Unary { dst, op, src } => self.set(dst, unary(op, self.get(src))),
                Instr::Binary { dst, op, lhs, rhs } => {
                    self.set(dst, binary(op, self.get(lhs), self.get(rhs))?)
                }
                Instr::Load { dst, binding, addr } => {
                    let descriptor = cx
                        .data
                        .descriptor(binding)
                        .ok_or(ExecError::Binding(binding))?;
                    let value = descriptor
                        .load(self.get(addr) as usize)
                        .map_err(|source| ExecError::Buffer { binding, source })?;
                    self.set(dst, value)
                }
                Instr::Store { binding, addr, src } => {
                    let descriptor = cx
                        .data
                        .descriptor(binding)
                        .ok_or(ExecError::Binding(binding))?;
                    descriptor
                        .store(self.get(addr) as usize, self.get(src))
                        .map_err(|source| ExecError::Buffer { binding, source })?
                }
                Instr::SharedLoad { dst, addr } => {
                    let value = cx
                        .shared
                        .load(self.get(addr) as usize)
                        .map_err(ExecError::Shared)?;
                    self.set(dst, value)
                }
                Instr::SharedStore { addr, src } => cx
                    .shared
                    .store(self.get(addr) as usize, self.get(src))
                    .map_err(ExecError::Shared)?,
                Instr::Jump { target } => self.pc = target,
                Instr::BranchZero { cond, target } => {
                    if self.get(cond) == 0 {
                        self.pc = target
                    }
                }
                Instr::Barrier { id } => return Ok(LaneYield::Barrier(id)),
                Instr::Return => {
                    self.finished = true;
                    return Ok(LaneYield::Finished);
                }
            }
        }
    }
}

fn unary(op: UnaryOp, x: u32) -> u32 {
    let f = f32::from_bits;
    match op {
        UnaryOp::Not => !x,
        UnaryOp::Neg => x.wrapping_neg(),
        UnaryOp::FNeg => (-f(x)).to_bits(),
        UnaryOp::ToF32 => (x as f32).to_bits(),
        UnaryOp::ToU32 => f(x) as u32,
    }
}

fn binary(op: BinaryOp, a: u32, b: u32) -> Result<u32, ExecError> {
    let f = f32::from_bits;
    let value = match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::Div => a.checked_div(b).ok_or(ExecError::DivideByZero)?,
        BinaryOp::Rem => a.checked_rem(b).ok_or(ExecError::DivideByZero)?,
        BinaryOp::And => a & b,
        BinaryOp::Or => a | b,
        BinaryOp::Xor => a ^ b,
        BinaryOp::Shl => a.wrapping_shl(b),
        BinaryOp::Shr => a.wrapping_shr(b),
        BinaryOp::Eq => (a == b) as u32,
        BinaryOp::Ne => (a != b) as u32,
        BinaryOp::Lt => (a < b) as u32,
        BinaryOp::Le => (a <= b) as u32,
        BinaryOp::FAdd => (f(a) + f(b)).to_bits(),
        BinaryOp::FSub => (f(a) - f(b)).to_bits(),
        BinaryOp::FMul => (f(a) * f(b)).to_bits(),
        BinaryOp::FDiv => (f(a) / f(b)).to_bits(),
        BinaryOp::FLt => (f(a) < f(b)) as u32,
        BinaryOp::FLe => (f(a) <= f(b)) as u32,
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::{binary, unary};
    use crate::code::{BinaryOp, UnaryOp};

    #[test]
    fn test_float_words() {
        let a = 1.5f32.to_bits();
        let b = 2.25f32.to_bits();
        let sum = binary(BinaryOp::FAdd, a, b).expect("must eval");
        assert_eq!(f32::from_bits(sum), 3.75);
        assert_eq!(binary(BinaryOp::FLt, a, b).expect("must eval"), 1);
        assert_eq!(unary(UnaryOp::ToU32, sum), 3);
    }

    #[test]
    fn test_division_traps() {
        assert!(binary(BinaryOp::Div, 1, 0).is_err());
        assert!(binary(BinaryOp::Rem, 1, 0).is_err());
        assert_eq!(binary(BinaryOp::Div, 7, 2).expect("must eval"), 3);
    }
}
