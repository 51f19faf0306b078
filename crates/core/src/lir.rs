//! Register-based low-level IR for Limit
//!
//! LIR is the contract between the compiler's lowering pass and the
//! register VM (or an external code generator). Functions hold a dense
//! instruction vector partitioned into basic blocks with explicit
//! successor lists. Every register has exactly one ABI type for the
//! lifetime of a function; the validator rejects conflicting writes.

use serde::Serialize;

/// ABI-level value types. Every LIR register has exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AbiType {
    I32,
    I64,
    F64,
    Bool,
    Ptr,
    Void,
}

impl std::fmt::Display for AbiType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AbiType::I32 => "I32",
            AbiType::I64 => "I64",
            AbiType::F64 => "F64",
            AbiType::Bool => "Bool",
            AbiType::Ptr => "Ptr",
            AbiType::Void => "Void",
        };
        write!(f, "{}", s)
    }
}

/// Virtual register. Dense per function, parameters first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Reg(pub u16);

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Constant operand carried by `LoadConst`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ConstValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl std::fmt::Display for ConstValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConstValue::Null => write!(f, "null"),
            ConstValue::Int(n) => write!(f, "{}", n),
            ConstValue::Float(x) => write!(f, "{:?}", x),
            ConstValue::Bool(b) => write!(f, "{}", b),
            ConstValue::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// LIR opcodes, partitioned into families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Op {
    // Data movement
    Mov,
    LoadConst,
    Cast,

    // Arithmetic (signed/float forms distinguished by destination ABI type)
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,

    // Bitwise
    And,
    Or,
    Xor,
    Not,

    // Comparisons (always produce Bool)
    CmpEq,
    CmpNe,
    CmpLt,
    CmpLe,
    CmpGt,
    CmpGe,

    // Control flow. Jump targets are block ids in `imm`.
    Jump,
    JumpIf,
    JumpIfFalse,
    /// Return with a value in src1
    Return,
    /// Return void
    Ret,

    // Function operations. Callee name in `callee`, arguments in `args`.
    Call,
    CallBuiltin,
    /// Virtual dispatch: receiver in src1, method name in `callee`,
    /// remaining arguments in `args`
    CallMethod,
    /// Build a closure value: function name in `callee`, captured
    /// registers in `args`
    MakeClosure,

    // String operations
    StrConcat,
    /// Template in `konst`, one `{}` slot per register in `args`
    StrFormat,
    ToString,

    // Print family, parameterized by the ABI type of src1
    Print,

    // Object operations. Class id / field index / method id in `imm`.
    NewObject,
    GetField,
    SetField,

    // Unified optional/error operations
    ConstructOk,
    ConstructErr,
    IsError,
    IsSuccess,
    UnwrapValue,
    UnwrapError,
    /// Unwind the current function's regions and return the error in src1
    PropagateError,
    CheckError,

    // Deterministic cleanup markers honoring the memory checker's plan
    RegionEnter,
    RegionExit,
    ReleaseLocal,

    // Concurrency hooks, delegated to the external task runtime
    TaskContextAlloc,
    TaskContextInit,
    TaskSetField,
    TaskGetField,
    ChannelAlloc,
    ChannelPush,
    ChannelPop,
    ChannelHasData,
    SchedulerRun,
}

impl Op {
    /// Does this opcode end a basic block?
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Op::Jump | Op::JumpIf | Op::JumpIfFalse | Op::Return | Op::Ret | Op::PropagateError
        )
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One LIR instruction.
///
/// The operand slots are a superset across all opcodes; each opcode
/// documents which slots it reads. `abi` is the ABI type of the
/// destination register (or the operand type for `Print`/`Cast`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inst {
    pub op: Op,
    pub abi: AbiType,
    pub dst: Option<Reg>,
    pub src1: Option<Reg>,
    pub src2: Option<Reg>,
    pub imm: Option<i64>,
    pub konst: Option<ConstValue>,
    pub callee: Option<String>,
    pub args: Vec<Reg>,
}

impl Inst {
    pub fn new(op: Op, abi: AbiType) -> Self {
        Inst {
            op,
            abi,
            dst: None,
            src1: None,
            src2: None,
            imm: None,
            konst: None,
            callee: None,
            args: Vec::new(),
        }
    }

    pub fn dst(mut self, r: Reg) -> Self {
        self.dst = Some(r);
        self
    }

    pub fn src1(mut self, r: Reg) -> Self {
        self.src1 = Some(r);
        self
    }

    pub fn src2(mut self, r: Reg) -> Self {
        self.src2 = Some(r);
        self
    }

    pub fn imm(mut self, imm: i64) -> Self {
        self.imm = Some(imm);
        self
    }

    pub fn konst(mut self, k: ConstValue) -> Self {
        self.konst = Some(k);
        self
    }

    pub fn callee(mut self, name: impl Into<String>) -> Self {
        self.callee = Some(name.into());
        self
    }

    pub fn args(mut self, args: Vec<Reg>) -> Self {
        self.args = args;
        self
    }
}

/// Basic block: a contiguous index range into the function's
/// instruction vector, ending in a terminator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Block {
    pub id: u32,
    pub label: String,
    /// Half-open instruction index range `[start, end)`
    pub range: (usize, usize),
    pub is_entry: bool,
    pub is_exit: bool,
    pub successors: Vec<u32>,
}

/// Flattened class layout shared with the VM: field slots in declaration
/// order (inherited first) and a vtable keyed by method name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassLayout {
    pub name: String,
    pub parent: Option<u32>,
    pub field_names: Vec<String>,
    /// (method name, implementing function symbol), overrides applied
    pub vtable: Vec<(String, String)>,
}

impl ClassLayout {
    pub fn method(&self, name: &str) -> Option<&str> {
        self.vtable
            .iter()
            .find(|(m, _)| m == name)
            .map(|(_, f)| f.as_str())
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.field_names.iter().position(|f| f == name)
    }
}

/// A lowered function
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LirFunction {
    pub name: String,
    /// Parameter registers come first in the dense numbering
    pub params: Vec<(Reg, AbiType)>,
    pub result: AbiType,
    /// Static ABI type of every register, indexed by register number
    pub reg_types: Vec<AbiType>,
    pub insts: Vec<Inst>,
    pub blocks: Vec<Block>,
}

impl LirFunction {
    pub fn reg_count(&self) -> usize {
        self.reg_types.len()
    }

    pub fn entry_block(&self) -> Option<&Block> {
        self.blocks.iter().find(|b| b.is_entry)
    }

    pub fn block(&self, id: u32) -> &Block {
        &self.blocks[id as usize]
    }

    /// Structural validation: CFG shape and register typing.
    ///
    /// Rejects: zero or multiple entry blocks, non-contiguous block
    /// ranges, blocks without terminators, out-of-range jump targets,
    /// falling off the end of a non-void function, and destination
    /// writes that disagree with a register's static ABI type.
    pub fn validate(&self) -> Result<(), String> {
        let entries = self.blocks.iter().filter(|b| b.is_entry).count();
        if entries != 1 {
            return Err(format!(
                "function '{}': expected exactly one entry block, found {}",
                self.name, entries
            ));
        }

        let mut covered = 0usize;
        for block in &self.blocks {
            let (start, end) = block.range;
            if start != covered {
                return Err(format!(
                    "function '{}': block {} range [{}, {}) is not contiguous",
                    self.name, block.id, start, end
                ));
            }
            if end <= start || end > self.insts.len() {
                return Err(format!(
                    "function '{}': block {} has invalid range [{}, {})",
                    self.name, block.id, start, end
                ));
            }
            covered = end;

            let last = &self.insts[end - 1];
            if !last.op.is_terminator() {
                return Err(format!(
                    "function '{}': block {} does not end in a terminator (ends with {})",
                    self.name, block.id, last.op
                ));
            }
            if self.result != AbiType::Void && last.op == Op::Ret {
                return Err(format!(
                    "function '{}': non-void function falls off the end in block {}",
                    self.name, block.id
                ));
            }
            for succ in &block.successors {
                if *succ as usize >= self.blocks.len() {
                    return Err(format!(
                        "function '{}': block {} has out-of-range successor {}",
                        self.name, block.id, succ
                    ));
                }
            }
        }
        if covered != self.insts.len() {
            return Err(format!(
                "function '{}': {} trailing instructions belong to no block",
                self.name,
                self.insts.len() - covered
            ));
        }

        for (index, inst) in self.insts.iter().enumerate() {
            if let Some(dst) = inst.dst {
                let declared = self
                    .reg_types
                    .get(dst.0 as usize)
                    .ok_or_else(|| format!("function '{}': write to undeclared {}", self.name, dst))?;
                if *declared != inst.abi {
                    return Err(format!(
                        "function '{}': instruction {} writes {} as {} but the register is {}",
                        self.name, index, dst, inst.abi, declared
                    ));
                }
            }
        }

        Ok(())
    }
}

/// A complete lowered program
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LirModule {
    pub functions: Vec<LirFunction>,
    pub classes: Vec<ClassLayout>,
}

impl LirModule {
    pub fn function(&self, name: &str) -> Option<&LirFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn class(&self, id: u32) -> &ClassLayout {
        &self.classes[id as usize]
    }

    pub fn validate(&self) -> Result<(), String> {
        for function in &self.functions {
            function.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ret_i64_function(body: Vec<Inst>, blocks: Vec<Block>) -> LirFunction {
        LirFunction {
            name: "f".to_string(),
            params: vec![],
            result: AbiType::I64,
            reg_types: vec![AbiType::I64],
            insts: body,
            blocks,
        }
    }

    #[test]
    fn test_validate_single_block_return() {
        let f = ret_i64_function(
            vec![
                Inst::new(Op::LoadConst, AbiType::I64)
                    .dst(Reg(0))
                    .konst(ConstValue::Int(7)),
                Inst::new(Op::Return, AbiType::I64).src1(Reg(0)),
            ],
            vec![Block {
                id: 0,
                label: "entry".to_string(),
                range: (0, 2),
                is_entry: true,
                is_exit: true,
                successors: vec![],
            }],
        );
        assert!(f.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_terminator() {
        let f = ret_i64_function(
            vec![Inst::new(Op::LoadConst, AbiType::I64)
                .dst(Reg(0))
                .konst(ConstValue::Int(7))],
            vec![Block {
                id: 0,
                label: "entry".to_string(),
                range: (0, 1),
                is_entry: true,
                is_exit: true,
                successors: vec![],
            }],
        );
        let err = f.validate().unwrap_err();
        assert!(err.contains("terminator"));
    }

    #[test]
    fn test_validate_rejects_void_return_in_value_function() {
        let f = ret_i64_function(
            vec![Inst::new(Op::Ret, AbiType::Void)],
            vec![Block {
                id: 0,
                label: "entry".to_string(),
                range: (0, 1),
                is_entry: true,
                is_exit: true,
                successors: vec![],
            }],
        );
        let err = f.validate().unwrap_err();
        assert!(err.contains("falls off the end"));
    }

    #[test]
    fn test_validate_rejects_register_type_conflict() {
        let mut f = ret_i64_function(
            vec![
                Inst::new(Op::LoadConst, AbiType::F64)
                    .dst(Reg(0))
                    .konst(ConstValue::Float(1.5)),
                Inst::new(Op::Return, AbiType::I64).src1(Reg(0)),
            ],
            vec![Block {
                id: 0,
                label: "entry".to_string(),
                range: (0, 2),
                is_entry: true,
                is_exit: true,
                successors: vec![],
            }],
        );
        f.reg_types = vec![AbiType::I64];
        let err = f.validate().unwrap_err();
        assert!(err.contains("register"));
    }

    #[test]
    fn test_validate_rejects_two_entries() {
        let f = ret_i64_function(
            vec![
                Inst::new(Op::Return, AbiType::I64).src1(Reg(0)),
                Inst::new(Op::Return, AbiType::I64).src1(Reg(0)),
            ],
            vec![
                Block {
                    id: 0,
                    label: "a".to_string(),
                    range: (0, 1),
                    is_entry: true,
                    is_exit: true,
                    successors: vec![],
                },
                Block {
                    id: 1,
                    label: "b".to_string(),
                    range: (1, 2),
                    is_entry: true,
                    is_exit: true,
                    successors: vec![],
                },
            ],
        );
        let err = f.validate().unwrap_err();
        assert!(err.contains("entry"));
    }

    #[test]
    fn test_class_layout_lookup() {
        let layout = ClassLayout {
            name: "B".to_string(),
            parent: Some(0),
            field_names: vec!["x".to_string(), "y".to_string()],
            vtable: vec![
                ("name".to_string(), "B::name".to_string()),
                ("id".to_string(), "A::id".to_string()),
            ],
        };
        assert_eq!(layout.method("name"), Some("B::name"));
        assert_eq!(layout.method("missing"), None);
        assert_eq!(layout.field_index("y"), Some(1));
    }
}
