use std::sync::Arc;

use derive_more::Display;
use thiserror::Error;

/// Index of a register in an invocation's register file.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[display("r{_0}")]
pub struct Reg(pub u16);

/// Identity of a workgroup synchronization point.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[display("barrier {_0}")]
pub struct BarrierId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Dim {
    X,
    Y,
    Z,
}

/// Values the execution environment provides to an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Builtin {
    /// Invocation coordinate within the workgroup.
    LocalId(Dim),
    /// Linearized invocation index within the workgroup.
    LocalIndex,
    /// `workgroup_id * workgroup_size + local_id`.
    GlobalId(Dim),
    /// Coordinate of the workgroup in the dispatch grid.
    WorkgroupId(Dim),
    WorkgroupSize(Dim),
    /// Index of the invocation's subgroup within the workgroup.
    SubgroupId,
    /// Lane of the invocation within its subgroup.
    SubgroupLaneId,
    SubgroupWidth,
    NumSubgroups,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UnaryOp {
    /// Bitwise complement.
    Not,
    /// Wrapping integer negation.
    Neg,
    FNeg,
    /// Unsigned integer to `f32`.
    ToF32,
    /// `f32` to unsigned integer (saturating).
    ToU32,
}

/// Register-to-register operations. Integer ops are unsigned and wrapping;
/// float ops reinterpret the word as `f32` bits. Comparisons produce 0 or 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FLt,
    FLe,
}

/// One instruction of a compiled routine.
///
/// Registers hold 32-bit words. Buffer and workgroup memory are addressed in
/// words through a register. `Barrier` is the only suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Instr {
    Const { dst: Reg, value: u32 },
    Move { dst: Reg, src: Reg },
    Builtin { dst: Reg, builtin: Builtin },
    /// Reads a word of the bound uniform data.
    Uniform { dst: Reg, index: u32 },
    Unary { dst: Reg, op: UnaryOp, src: Reg },
    Binary { dst: Reg, op: BinaryOp, lhs: Reg, rhs: Reg },
    /// Loads a word from a bound buffer.
    Load { dst: Reg, binding: u32, addr: Reg },
    /// Stores a word into a bound buffer.
    Store { binding: u32, addr: Reg, src: Reg },
    SharedLoad { dst: Reg, addr: Reg },
    SharedStore { addr: Reg, src: Reg },
    Jump { target: u32 },
    /// Jumps when the condition register holds 0.
    BranchZero { cond: Reg, target: u32 },
    /// Parks the invocation until all subgroups of the workgroup arrive.
    Barrier { id: BarrierId },
    Return,
}

#[derive(Debug, Error)]
pub enum CodeError {
    #[error("routine has no instructions")]
    Empty,
    #[error("routine can fall off the end: last instruction must return or jump")]
    MissingReturn,
    #[error("instruction {index}: jump target {target} out of range ({len} instructions)")]
    JumpTarget { index: usize, target: u32, len: usize },
    #[error("instruction {index}: register {reg} out of range ({registers} registers)")]
    Register {
        index: usize,
        reg: Reg,
        registers: usize,
    },
    #[error("label {0} is never bound")]
    UnboundLabel(usize),
}

/// A compiled kernel body: straight bytecode plus the register file size
/// every invocation executes it with.
#[derive(Debug, Clone)]
pub struct Routine {
    code: Arc<[Instr]>,
    registers: usize,
}

impl Routine {
    /// Validates and wraps a code sequence.
    ///
    /// Rejects empty code, code whose last instruction can fall through, jump
    /// targets past the end, and register indices outside the declared file.
    pub fn new(code: impl Into<Arc<[Instr]>>, registers: usize) -> Result<Self, CodeError> {
        let code = code.into();
        let len = code.len();
        let Some(last) = code.last() else {
            return Err(CodeError::Empty);
        };
        if !matches!(last, Instr::Return | Instr::Jump { .. }) {
            return Err(CodeError::MissingReturn);
        }

        for (index, instr) in code.iter().enumerate() {
            for reg in instr.regs() {
                if reg.0 as usize >= registers {
                    return Err(CodeError::Register {
                        index,
                        reg,
                        registers,
                    });
                }
            }
            if let Some(target) = instr.target() {
                if target as usize >= len {
                    return Err(CodeError::JumpTarget { index, target, len });
                }
            }
        }

        Ok(Self { code, registers })
    }

    #[inline]
    pub fn code(&self) -> &[Instr] {
        &self.code
    }

    #[inline]
    pub fn registers(&self) -> usize {
        self.registers
    }
}

impl Instr {
    /// Registers the instruction names, in no particular order.
    fn regs(&self) -> Vec<Reg> {
        match *self {
            Instr::Const { dst, .. } => vec![dst],
            Instr::Move { dst, src } => vec![dst, src],
            Instr::Builtin { dst, .. } => vec![dst],
            Instr::Uniform { dst, .. } => vec![dst],
            Instr::Unary { dst, src, .. } => vec![dst, src],
            Instr::Binary { dst, lhs, rhs, .. } => vec![dst, lhs, rhs],
            Instr::Load { dst, addr, .. } => vec![dst, addr],
            Instr::Store { addr, src, .. } => vec![addr, src],
            Instr::SharedLoad { dst, addr } => vec![dst, addr],
            Instr::SharedStore { addr, src } => vec![addr, src],
            Instr::BranchZero { cond, .. } => vec![cond],
            Instr::Jump { .. } | Instr::Barrier { .. } | Instr::Return => vec![],
        }
    }

    fn target(&self) -> Option<u32> {
        match *self {
            Instr::Jump { target } | Instr::BranchZero { target, .. } => Some(target),
            _ => None,
        }
    }
}

/// A forward-declarable jump target for [`RoutineBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Builds a [`Routine`] with label-patched control flow.
///
/// The front-end compiler emits through this; tests use it to hand-assemble
/// kernels.
#[derive(Debug, Default, Clone)]
pub struct RoutineBuilder {
    code: Vec<Instr>,
    labels: Vec<Option<u32>>,
    patches: Vec<(usize, Label)>,
    registers: usize,
}

impl RoutineBuilder {
    pub fn new(registers: usize) -> Self {
        Self {
            registers,
            ..Default::default()
        }
    }

    #[inline]
    pub fn push(&mut self, instr: Instr) -> &mut Self {
        self.code.push(instr);
        self
    }

    /// Declares a label to be bound later.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds a label to the current position.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.code.len() as u32);
        self
    }

    pub fn jump(&mut self, label: Label) -> &mut Self {
        self.patches.push((self.code.len(), label));
        self.push(Instr::Jump { target: u32::MAX })
    }

    pub fn branch_zero(&mut self, cond: Reg, label: Label) -> &mut Self {
        self.patches.push((self.code.len(), label));
        self.push(Instr::BranchZero {
            cond,
            target: u32::MAX,
        })
    }

    /// Patches all recorded jumps and validates the result.
    pub fn build(mut self) -> Result<Routine, CodeError> {
        for (index, label) in self.patches {
            let target = self.labels[label.0].ok_or(CodeError::UnboundLabel(label.0))?;
            match &mut self.code[index] {
                Instr::Jump { target: t } | Instr::BranchZero { target: t, .. } => *t = target,
                _ => unreachable!(),
            }
        }
        Routine::new(self.code, self.registers)
    }
}

#[cfg(test)]
mod tests {
    use super::{BinaryOp, Builtin, CodeError, Instr, Reg, Routine, RoutineBuilder};

    #[test]
    fn test_label_patching() {
        // while i <= local_index { acc += i; i += 1 }
        let mut b = RoutineBuilder::new(4);
        let head = b.label();
        let exit = b.label();
        b.push(Instr::Builtin {
            dst: Reg(0),
            builtin: Builtin::LocalIndex,
        })
        .push(Instr::Const {
            dst: Reg(1),
            value: 0,
        })
        .push(Instr::Const {
            dst: Reg(2),
            value: 0,
        })
        .bind(head)
        .push(Instr::Binary {
            dst: Reg(3),
            op: BinaryOp::Le,
            lhs: Reg(2),
            rhs: Reg(0),
        })
        .branch_zero(Reg(3), exit)
        .push(Instr::Binary {
            dst: Reg(1),
            op: BinaryOp::Add,
            lhs: Reg(1),
            rhs: Reg(2),
        })
        .push(Instr::Const {
            dst: Reg(3),
            value: 1,
        })
        .push(Instr::Binary {
            dst: Reg(2),
            op: BinaryOp::Add,
            lhs: Reg(2),
            rhs: Reg(3),
        })
        .jump(head)
        .bind(exit)
        .push(Instr::Return);

        let routine = b.build().expect("must build");
        assert_eq!(routine.code().len(), 10);
        assert!(matches!(
            routine.code()[4],
            Instr::BranchZero { target: 9, .. }
        ));
        assert!(matches!(routine.code()[8], Instr::Jump { target: 3 }));
    }

    #[test]
    fn test_unbound_label() {
        let mut b = RoutineBuilder::new(1);
        let exit = b.label();
        b.jump(exit);
        assert!(matches!(b.build(), Err(CodeError::UnboundLabel(0))));
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            Routine::new(Vec::<Instr>::new(), 0),
            Err(CodeError::Empty)
        ));

        let code = vec![Instr::Const {
            dst: Reg(0),
            value: 1,
        }];
        assert!(matches!(
            Routine::new(code, 1),
            Err(CodeError::MissingReturn)
        ));

        let code = vec![Instr::Jump { target: 7 }];
        assert!(matches!(
            Routine::new(code, 0),
            Err(CodeError::JumpTarget {
                index: 0,
                target: 7,
                len: 1
            })
        ));

        let code = vec![
            Instr::Move {
                dst: Reg(2),
                src: Reg(0),
            },
            Instr::Return,
        ];
        assert!(matches!(
            Routine::new(code, 2),
            Err(CodeError::Register {
                index: 0,
                reg: Reg(2),
                ..
            })
        ));
    }
}
