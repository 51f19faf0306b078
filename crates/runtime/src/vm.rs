//! Register VM for Limit LIR
//!
//! Interprets one [`LirFunction`] at a time over tagged values. State
//! is a register file per call frame, the Rust call stack as the frame
//! stack, a region stack per frame, and the global function registry of
//! the loaded [`LirModule`].
//!
//! The unified optional/error representation is zero-cost on the
//! success path: `IsError` is a tag check, `UnwrapValue` a pointer
//! load, and `PropagateError` returns the error value to the caller
//! after popping the frame's remaining regions in LIFO order.
//!
//! Faults (division by zero, out-of-bounds, invalid casts,
//! uninitialized registers, arity mismatches) abort with a typed error;
//! the driver renders them as `E4xx` diagnostics.

use crate::region::{RegionEvent, RegionStack, RegionTrace};
use crate::task::TaskRuntime;
use crate::value::{Closure, ErrorPool, InstanceData, MapKey, Value};
use limit_core::lir::{AbiType, ConstValue, Inst, LirFunction, LirModule, Op, Reg};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;
use tracing::trace;

/// Fatal runtime faults (debug mode aborts with a diagnostic)
#[derive(Debug, Clone, Error, PartialEq)]
pub enum VmError {
    #[error("division by zero")]
    DivisionByZero,
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: i64, len: usize },
    #[error("invalid cast: {from} is not usable as {to}")]
    InvalidCast { from: String, to: String },
    #[error("read of uninitialized register r{0}")]
    UninitializedRegister(u16),
    #[error("call arity mismatch: '{function}' expects {expected} arguments, found {found}")]
    ArityMismatch {
        function: String,
        expected: usize,
        found: usize,
    },
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("unknown builtin '{0}'")]
    UnknownBuiltin(String),
    #[error("ABI violation: register r{reg} holds {found}, instruction expects {expected}")]
    AbiViolation {
        reg: u16,
        found: String,
        expected: String,
    },
    #[error("call depth limit exceeded")]
    CallDepthExceeded,
    #[error("unhandled error value: {0}")]
    UnhandledError(String),
}

/// Stable runtime diagnostic codes (E400-E499)
pub mod codes {
    pub const DIVISION_BY_ZERO: u16 = 400;
    pub const OUT_OF_BOUNDS: u16 = 401;
    pub const INVALID_CAST: u16 = 402;
    pub const UNINITIALIZED_REGISTER: u16 = 403;
    pub const ARITY_MISMATCH: u16 = 404;
    pub const UNKNOWN_FUNCTION: u16 = 405;
    pub const ABI_VIOLATION: u16 = 406;
    pub const CALL_DEPTH: u16 = 407;
    pub const UNHANDLED_ERROR: u16 = 410;
}

impl VmError {
    pub fn code(&self) -> u16 {
        match self {
            VmError::DivisionByZero => codes::DIVISION_BY_ZERO,
            VmError::IndexOutOfBounds { .. } => codes::OUT_OF_BOUNDS,
            VmError::InvalidCast { .. } => codes::INVALID_CAST,
            VmError::UninitializedRegister(_) => codes::UNINITIALIZED_REGISTER,
            VmError::ArityMismatch { .. } => codes::ARITY_MISMATCH,
            VmError::UnknownFunction(_) | VmError::UnknownBuiltin(_) => codes::UNKNOWN_FUNCTION,
            VmError::AbiViolation { .. } => codes::ABI_VIOLATION,
            VmError::CallDepthExceeded => codes::CALL_DEPTH,
            VmError::UnhandledError(_) => codes::UNHANDLED_ERROR,
        }
    }
}

const MAX_CALL_DEPTH: usize = 512;

pub struct Vm<'a> {
    module: &'a LirModule,
    runtime: &'a dyn TaskRuntime,
    globals: HashMap<String, Value>,
    pool: ErrorPool,
    trace: RegionTrace,
    depth: usize,
    /// When set, printed lines collect here instead of stdout
    captured: Option<Vec<String>>,
    debug: bool,
}

impl<'a> Vm<'a> {
    pub fn new(module: &'a LirModule, runtime: &'a dyn TaskRuntime) -> Self {
        Vm {
            module,
            runtime,
            globals: HashMap::new(),
            pool: ErrorPool::new(),
            trace: RegionTrace::new(),
            depth: 0,
            captured: None,
            debug: false,
        }
    }

    /// Collect printed lines instead of writing them to stdout
    pub fn capture_output(&mut self) {
        self.captured = Some(Vec::new());
    }

    pub fn take_output(&mut self) -> Vec<String> {
        self.captured.take().unwrap_or_default()
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    /// The destruction record accumulated so far
    pub fn take_region_trace(&mut self) -> Vec<RegionEvent> {
        self.trace.take()
    }

    /// Run a function by name. An `Error`-tagged return from the entry
    /// function is an unhandled error.
    pub fn run(&mut self, function: &str, args: Vec<Value>) -> Result<Value, VmError> {
        let result = self.call(function, args)?;
        if let Value::Error(error) = &result {
            return Err(VmError::UnhandledError(error.kind.clone()));
        }
        Ok(result)
    }

    fn call(&mut self, function: &str, args: Vec<Value>) -> Result<Value, VmError> {
        let function = self
            .module
            .function(function)
            .ok_or_else(|| VmError::UnknownFunction(function.to_string()))?;
        if args.len() != function.params.len() {
            return Err(VmError::ArityMismatch {
                function: function.name.clone(),
                expected: function.params.len(),
                found: args.len(),
            });
        }
        if self.depth >= MAX_CALL_DEPTH {
            return Err(VmError::CallDepthExceeded);
        }
        self.depth += 1;
        let result = self.exec(function, args);
        self.depth -= 1;
        result
    }

    fn exec(&mut self, function: &LirFunction, args: Vec<Value>) -> Result<Value, VmError> {
        let mut registers: Vec<Option<Value>> = vec![None; function.reg_count()];
        for ((reg, _), value) in function.params.iter().zip(args.into_iter()) {
            registers[reg.0 as usize] = Some(value);
        }
        let mut regions = RegionStack::new();

        let entry = function
            .entry_block()
            .ok_or_else(|| VmError::UnknownFunction(function.name.clone()))?;
        let mut pc = entry.range.0;

        loop {
            let inst = &function.insts[pc];
            if self.debug {
                trace!(function = %function.name, pc, op = %inst.op, "dispatch");
            }
            match inst.op {
                // ----- data movement -----
                Op::Mov => {
                    let value = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    self.write(&mut registers, inst, value)?;
                }
                Op::LoadConst => {
                    let value = match inst.konst.as_ref() {
                        Some(ConstValue::Null) => Value::Null,
                        Some(ConstValue::Int(n)) => Value::Int(*n),
                        Some(ConstValue::Float(x)) => Value::Float(*x),
                        Some(ConstValue::Bool(b)) => Value::Bool(*b),
                        Some(ConstValue::Str(s)) => Value::str(s.clone()),
                        None => Value::Null,
                    };
                    self.write(&mut registers, inst, value)?;
                }
                Op::Cast => {
                    let value = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    let cast = cast_value(&value, inst.abi)?;
                    self.write(&mut registers, inst, cast)?;
                }

                // ----- arithmetic -----
                Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => {
                    let lhs = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    let rhs = self.read(&registers, inst.src2.unwrap_or(Reg(0)))?;
                    let value = arithmetic(inst.op, &lhs, &rhs)?;
                    self.write(&mut registers, inst, value)?;
                }
                Op::Neg => {
                    let value = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    let negated = match value {
                        Value::Int(n) => Value::Int(-n),
                        Value::Float(x) => Value::Float(-x),
                        other => {
                            return Err(VmError::InvalidCast {
                                from: other.type_name().to_string(),
                                to: "number".to_string(),
                            });
                        }
                    };
                    self.write(&mut registers, inst, negated)?;
                }

                // ----- bitwise / logical -----
                Op::And | Op::Or | Op::Xor => {
                    let lhs = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    let rhs = self.read(&registers, inst.src2.unwrap_or(Reg(0)))?;
                    let value = match (&lhs, &rhs) {
                        (Value::Bool(a), Value::Bool(b)) => Value::Bool(match inst.op {
                            Op::And => *a && *b,
                            Op::Or => *a || *b,
                            _ => *a != *b,
                        }),
                        (Value::Int(a), Value::Int(b)) => Value::Int(match inst.op {
                            Op::And => a & b,
                            Op::Or => a | b,
                            _ => a ^ b,
                        }),
                        _ => {
                            return Err(VmError::InvalidCast {
                                from: format!("{} and {}", lhs.type_name(), rhs.type_name()),
                                to: "bool or int".to_string(),
                            });
                        }
                    };
                    self.write(&mut registers, inst, value)?;
                }
                Op::Not => {
                    let value = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    let negated = match value {
                        Value::Bool(b) => Value::Bool(!b),
                        Value::Int(n) => Value::Int(!n),
                        other => {
                            return Err(VmError::InvalidCast {
                                from: other.type_name().to_string(),
                                to: "bool".to_string(),
                            });
                        }
                    };
                    self.write(&mut registers, inst, negated)?;
                }

                // ----- comparisons -----
                Op::CmpEq | Op::CmpNe | Op::CmpLt | Op::CmpLe | Op::CmpGt | Op::CmpGe => {
                    let lhs = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    let rhs = self.read(&registers, inst.src2.unwrap_or(Reg(0)))?;
                    let value = compare(inst.op, &lhs, &rhs)?;
                    self.write(&mut registers, inst, value)?;
                }

                // ----- control flow -----
                Op::Jump => {
                    pc = self.block_start(function, inst)?;
                    continue;
                }
                Op::JumpIf => {
                    let cond = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    if cond.truthy() {
                        pc = self.block_start(function, inst)?;
                        continue;
                    }
                }
                Op::JumpIfFalse => {
                    let cond = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    if !cond.truthy() {
                        pc = self.block_start(function, inst)?;
                        continue;
                    }
                }
                Op::Return => {
                    let value = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    return Ok(value);
                }
                Op::Ret => return Ok(Value::Null),

                // ----- calls -----
                Op::Call => {
                    let callee = inst.callee.as_deref().unwrap_or_default().to_string();
                    let args = self.read_args(&registers, inst)?;
                    let result = self.call(&callee, args)?;
                    self.write(&mut registers, inst, result)?;
                }
                Op::CallBuiltin => {
                    let result = self.builtin(inst, &registers)?;
                    self.write(&mut registers, inst, result)?;
                }
                Op::CallMethod => {
                    let receiver = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    let method = inst.callee.as_deref().unwrap_or_default();
                    let symbol = self.dispatch(&receiver, method)?;
                    let args = self.read_args(&registers, inst)?;
                    let result = self.call(&symbol, args)?;
                    self.write(&mut registers, inst, result)?;
                }
                Op::MakeClosure => {
                    let captures = self.read_args(&registers, inst)?;
                    let closure = Value::Function(Rc::new(Closure {
                        function: inst.callee.clone().unwrap_or_default(),
                        captures,
                    }));
                    self.write(&mut registers, inst, closure)?;
                }

                // ----- strings -----
                Op::StrConcat => {
                    let lhs = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    let rhs = self.read(&registers, inst.src2.unwrap_or(Reg(0)))?;
                    self.write(
                        &mut registers,
                        inst,
                        Value::str(format!("{}{}", lhs, rhs)),
                    )?;
                }
                Op::StrFormat => {
                    let template = match inst.konst.as_ref() {
                        Some(ConstValue::Str(s)) => s.clone(),
                        _ => String::new(),
                    };
                    let args = self.read_args(&registers, inst)?;
                    let mut out = String::new();
                    let mut pieces = template.split("{}");
                    if let Some(first) = pieces.next() {
                        out.push_str(first);
                    }
                    for (piece, arg) in pieces.zip(args.iter()) {
                        out.push_str(&arg.to_string());
                        out.push_str(piece);
                    }
                    self.write(&mut registers, inst, Value::str(out))?;
                }
                Op::ToString => {
                    let value = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    self.write(&mut registers, inst, Value::str(value.to_string()))?;
                }

                // ----- printing -----
                Op::Print => {
                    let value = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    let text = value.to_string();
                    if inst.imm == Some(1) {
                        self.print_line(text);
                    } else {
                        self.print_inline(text);
                    }
                }

                // ----- objects -----
                Op::NewObject => {
                    let class = inst.imm.unwrap_or(0) as u32;
                    let fields = self.module.class(class).field_names.len();
                    let instance = Value::Instance(Rc::new(RefCell::new(InstanceData {
                        class,
                        fields: vec![Value::Null; fields],
                    })));
                    self.write(&mut registers, inst, instance)?;
                }
                Op::GetField => {
                    let object = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    let index = inst.imm.unwrap_or(0) as usize;
                    let value = match &object {
                        Value::Instance(instance) => instance
                            .borrow()
                            .fields
                            .get(index)
                            .cloned()
                            .unwrap_or(Value::Null),
                        other => {
                            return Err(VmError::InvalidCast {
                                from: other.type_name().to_string(),
                                to: "instance".to_string(),
                            });
                        }
                    };
                    self.write(&mut registers, inst, value)?;
                }
                Op::SetField => {
                    let object = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    let value = self.read(&registers, inst.src2.unwrap_or(Reg(0)))?;
                    let index = inst.imm.unwrap_or(0) as usize;
                    match &object {
                        Value::Instance(instance) => {
                            let mut instance = instance.borrow_mut();
                            if index < instance.fields.len() {
                                instance.fields[index] = value;
                            }
                        }
                        other => {
                            return Err(VmError::InvalidCast {
                                from: other.type_name().to_string(),
                                to: "instance".to_string(),
                            });
                        }
                    }
                }

                // ----- optional / error -----
                Op::ConstructOk => {
                    let payload = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    self.write(&mut registers, inst, Value::Okay(Rc::new(payload)))?;
                }
                Op::ConstructErr => {
                    let payload = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    let error = self
                        .pool
                        .alloc("error", payload, vec![function.name.clone()]);
                    self.write(&mut registers, inst, Value::Error(error))?;
                }
                Op::IsError | Op::CheckError => {
                    let value = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    self.write(&mut registers, inst, Value::Bool(value.is_error()))?;
                }
                Op::IsSuccess => {
                    let value = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    self.write(&mut registers, inst, Value::Bool(!value.is_error()))?;
                }
                Op::UnwrapValue => {
                    let value = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    let unwrapped = match value {
                        Value::Okay(inner) => inner.as_ref().clone(),
                        Value::Error(error) => {
                            return Err(VmError::UnhandledError(error.kind.clone()));
                        }
                        other => other,
                    };
                    self.write(&mut registers, inst, unwrapped)?;
                }
                Op::UnwrapError => {
                    let value = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    let payload = match value {
                        Value::Error(error) => error.payload.clone(),
                        other => other,
                    };
                    self.write(&mut registers, inst, payload)?;
                }
                Op::PropagateError => {
                    // Remaining regions close innermost-first; the
                    // ReleaseLocal runs before this opcode already
                    // destroyed the frame's live linears
                    for region in regions.unwind() {
                        self.trace.record(RegionEvent::Exit(region));
                    }
                    let value = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    return Ok(value);
                }

                // ----- regions -----
                Op::RegionEnter => {
                    let id = regions.enter();
                    self.trace.record(RegionEvent::Enter(id));
                }
                Op::RegionExit => {
                    if let Some(id) = regions.exit() {
                        self.trace.record(RegionEvent::Exit(id));
                    }
                }
                Op::ReleaseLocal => {
                    let reg = inst.src1.unwrap_or(Reg(0));
                    registers[reg.0 as usize] = Some(Value::Null);
                    self.trace.record(RegionEvent::Release(reg.0));
                }

                // ----- concurrency hooks -----
                Op::TaskContextAlloc => {
                    let context = self.runtime.task_context_alloc(inst.imm.unwrap_or(8) as usize);
                    self.write(&mut registers, inst, context)?;
                }
                Op::TaskContextInit => {
                    let context = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    self.runtime.task_context_init(&context);
                }
                Op::TaskSetField => {
                    let context = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    let value = self.read(&registers, inst.src2.unwrap_or(Reg(0)))?;
                    self.runtime
                        .task_set_field(&context, inst.imm.unwrap_or(0) as usize, value);
                }
                Op::TaskGetField => {
                    let context = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    let value = self
                        .runtime
                        .task_get_field(&context, inst.imm.unwrap_or(0) as usize);
                    self.write(&mut registers, inst, value)?;
                }
                Op::ChannelAlloc => {
                    let channel = self.runtime.channel_alloc();
                    self.write(&mut registers, inst, channel)?;
                }
                Op::ChannelPush => {
                    let channel = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    let value = self.read(&registers, inst.src2.unwrap_or(Reg(0)))?;
                    self.runtime.channel_push(&channel, value);
                }
                Op::ChannelPop => {
                    let channel = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    let value = self.runtime.channel_pop(&channel);
                    self.write(&mut registers, inst, value)?;
                }
                Op::ChannelHasData => {
                    let channel = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    let value = Value::Bool(self.runtime.channel_has_data(&channel));
                    self.write(&mut registers, inst, value)?;
                }
                Op::SchedulerRun => {
                    let context = self.read(&registers, inst.src1.unwrap_or(Reg(0)))?;
                    self.runtime.scheduler_run(&context);
                }
            }
            pc += 1;
        }
    }

    // ----- helpers -----

    fn read(&self, registers: &[Option<Value>], reg: Reg) -> Result<Value, VmError> {
        registers
            .get(reg.0 as usize)
            .and_then(|slot| slot.clone())
            .ok_or(VmError::UninitializedRegister(reg.0))
    }

    fn write(
        &self,
        registers: &mut [Option<Value>],
        inst: &Inst,
        value: Value,
    ) -> Result<(), VmError> {
        let Some(dst) = inst.dst else {
            return Ok(());
        };
        registers[dst.0 as usize] = Some(value);
        Ok(())
    }

    fn read_args(&self, registers: &[Option<Value>], inst: &Inst) -> Result<Vec<Value>, VmError> {
        inst.args
            .iter()
            .map(|reg| self.read(registers, *reg))
            .collect()
    }

    fn block_start(&self, function: &LirFunction, inst: &Inst) -> Result<usize, VmError> {
        let block = inst.imm.unwrap_or(0) as usize;
        function
            .blocks
            .get(block)
            .map(|b| b.range.0)
            .ok_or_else(|| VmError::UnknownFunction(function.name.clone()))
    }

    /// Vtable dispatch for a method call on an instance
    fn dispatch(&self, receiver: &Value, method: &str) -> Result<String, VmError> {
        match receiver {
            Value::Instance(instance) => {
                let class = instance.borrow().class;
                self.module
                    .class(class)
                    .method(method)
                    .map(|symbol| symbol.to_string())
                    .ok_or_else(|| {
                        VmError::UnknownFunction(format!(
                            "{}::{}",
                            self.module.class(class).name,
                            method
                        ))
                    })
            }
            other => Err(VmError::InvalidCast {
                from: other.type_name().to_string(),
                to: "instance".to_string(),
            }),
        }
    }

    fn print_line(&mut self, text: String) {
        match &mut self.captured {
            Some(lines) => lines.push(text),
            None => println!("{}", text),
        }
    }

    fn print_inline(&mut self, text: String) {
        match &mut self.captured {
            Some(lines) => match lines.last_mut() {
                Some(last) => last.push_str(&text),
                None => lines.push(text),
            },
            None => print!("{}", text),
        }
    }

    // ----- builtins -----

    fn builtin(&mut self, inst: &Inst, registers: &[Option<Value>]) -> Result<Value, VmError> {
        let name = inst.callee.as_deref().unwrap_or_default();
        let args = self.read_args(registers, inst)?;
        match name {
            "global.get" => {
                let symbol = match inst.konst.as_ref() {
                    Some(ConstValue::Str(s)) => s.as_str(),
                    _ => "",
                };
                Ok(self.globals.get(symbol).cloned().unwrap_or(Value::Null))
            }
            "global.set" => {
                let symbol = match inst.konst.as_ref() {
                    Some(ConstValue::Str(s)) => s.clone(),
                    _ => String::new(),
                };
                let value = args.into_iter().next().unwrap_or(Value::Null);
                self.globals.insert(symbol, value);
                Ok(Value::Null)
            }
            "len" => {
                let value = args.first().cloned().unwrap_or(Value::Null);
                Ok(Value::Int(length_of(&value)? as i64))
            }
            "iter.get" => {
                let source = args.first().cloned().unwrap_or(Value::Null);
                let index = match args.get(1) {
                    Some(Value::Int(n)) => *n,
                    _ => 0,
                };
                element_at(&source, index)
            }
            "index.get" => {
                let source = args.first().cloned().unwrap_or(Value::Null);
                match (&source, args.get(1)) {
                    (Value::Dict(entries), Some(key)) => {
                        let key = MapKey::from_value(key).ok_or(VmError::InvalidCast {
                            from: key.type_name().to_string(),
                            to: "dict key".to_string(),
                        })?;
                        Ok(entries.borrow().get(&key).cloned().unwrap_or(Value::Null))
                    }
                    (_, Some(Value::Int(index))) => element_at(&source, *index),
                    _ => Err(VmError::InvalidCast {
                        from: source.type_name().to_string(),
                        to: "indexable".to_string(),
                    }),
                }
            }
            "index.set" => {
                let source = args.first().cloned().unwrap_or(Value::Null);
                match (&source, args.get(1), args.get(2)) {
                    (Value::List(items), Some(Value::Int(index)), Some(value)) => {
                        let mut items = items.borrow_mut();
                        let len = items.len();
                        let index = *index;
                        if index < 0 || index as usize >= len {
                            return Err(VmError::IndexOutOfBounds { index, len });
                        }
                        items[index as usize] = value.clone();
                        Ok(Value::Null)
                    }
                    (Value::Dict(entries), Some(key), Some(value)) => {
                        let key = MapKey::from_value(key).ok_or(VmError::InvalidCast {
                            from: key.type_name().to_string(),
                            to: "dict key".to_string(),
                        })?;
                        entries.borrow_mut().insert(key, value.clone());
                        Ok(Value::Null)
                    }
                    _ => Err(VmError::InvalidCast {
                        from: source.type_name().to_string(),
                        to: "indexable".to_string(),
                    }),
                }
            }
            "list.new" => Ok(Value::list(args)),
            "dict.new" => {
                let mut entries = HashMap::new();
                let mut iter = args.into_iter();
                while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                    let key = MapKey::from_value(&key).ok_or(VmError::InvalidCast {
                        from: key.type_name().to_string(),
                        to: "dict key".to_string(),
                    })?;
                    entries.insert(key, value);
                }
                Ok(Value::Dict(Rc::new(RefCell::new(entries))))
            }
            "range.new" => {
                let start = match args.first() {
                    Some(Value::Int(n)) => *n,
                    _ => 0,
                };
                let end = match args.get(1) {
                    Some(Value::Int(n)) => *n,
                    _ => 0,
                };
                Ok(Value::Range {
                    start,
                    end,
                    step: 1,
                })
            }
            "math.pow" => match (args.first(), args.get(1)) {
                (Some(Value::Int(base)), Some(Value::Int(exp))) => {
                    Ok(Value::Int(base.pow((*exp).max(0) as u32)))
                }
                (Some(Value::Float(base)), Some(Value::Float(exp))) => {
                    Ok(Value::Float(base.powf(*exp)))
                }
                _ => Err(VmError::InvalidCast {
                    from: "non-numeric".to_string(),
                    to: "number".to_string(),
                }),
            },
            "instance.of" => {
                let target = inst.imm.unwrap_or(0) as u32;
                let value = args.first().cloned().unwrap_or(Value::Null);
                let is_instance = match &value {
                    Value::Instance(instance) => {
                        let mut current = Some(instance.borrow().class);
                        let mut found = false;
                        while let Some(class) = current {
                            if class == target {
                                found = true;
                                break;
                            }
                            current = self.module.class(class).parent;
                        }
                        found
                    }
                    _ => false,
                };
                Ok(Value::Bool(is_instance))
            }
            "call" => {
                let mut iter = args.into_iter();
                let callee = iter.next().unwrap_or(Value::Null);
                match callee {
                    Value::Function(closure) => {
                        let mut call_args = closure.captures.clone();
                        call_args.extend(iter);
                        self.call(&closure.function, call_args)
                    }
                    other => Err(VmError::InvalidCast {
                        from: other.type_name().to_string(),
                        to: "function".to_string(),
                    }),
                }
            }
            other => Err(VmError::UnknownBuiltin(other.to_string())),
        }
    }
}

fn length_of(value: &Value) -> Result<usize, VmError> {
    match value {
        Value::List(items) => Ok(items.borrow().len()),
        Value::Dict(entries) => Ok(entries.borrow().len()),
        Value::Str(s) => Ok(s.chars().count()),
        Value::Range { start, end, step } => {
            if *step <= 0 {
                return Ok(0);
            }
            Ok(((end - start).max(0) as usize).div_ceil(*step as usize))
        }
        other => Err(VmError::InvalidCast {
            from: other.type_name().to_string(),
            to: "iterable".to_string(),
        }),
    }
}

fn element_at(value: &Value, index: i64) -> Result<Value, VmError> {
    match value {
        Value::List(items) => {
            let items = items.borrow();
            if index < 0 || index as usize >= items.len() {
                return Err(VmError::IndexOutOfBounds {
                    index,
                    len: items.len(),
                });
            }
            Ok(items[index as usize].clone())
        }
        Value::Range { start, step, .. } => Ok(Value::Int(start + index * step)),
        Value::Str(s) => {
            let ch = s.chars().nth(index.max(0) as usize);
            match ch {
                Some(ch) => Ok(Value::str(ch.to_string())),
                None => Err(VmError::IndexOutOfBounds {
                    index,
                    len: s.chars().count(),
                }),
            }
        }
        other => Err(VmError::InvalidCast {
            from: other.type_name().to_string(),
            to: "iterable".to_string(),
        }),
    }
}

fn arithmetic(op: Op, lhs: &Value, rhs: &Value) -> Result<Value, VmError> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => {
            if matches!(op, Op::Div | Op::Mod) && *b == 0 {
                return Err(VmError::DivisionByZero);
            }
            Ok(Value::Int(match op {
                Op::Add => a.wrapping_add(*b),
                Op::Sub => a.wrapping_sub(*b),
                Op::Mul => a.wrapping_mul(*b),
                Op::Div => a.wrapping_div(*b),
                Op::Mod => a.wrapping_rem(*b),
                _ => unreachable!("non-arithmetic op"),
            }))
        }
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(match op {
            Op::Add => a + b,
            Op::Sub => a - b,
            Op::Mul => a * b,
            Op::Div => a / b,
            Op::Mod => a % b,
            _ => unreachable!("non-arithmetic op"),
        })),
        (Value::Str(a), Value::Str(b)) if op == Op::Add => {
            Ok(Value::str(format!("{}{}", a, b)))
        }
        _ => Err(VmError::InvalidCast {
            from: format!("{} and {}", lhs.type_name(), rhs.type_name()),
            to: "matching numeric types".to_string(),
        }),
    }
}

fn compare(op: Op, lhs: &Value, rhs: &Value) -> Result<Value, VmError> {
    if matches!(op, Op::CmpEq | Op::CmpNe) {
        let equal = lhs == rhs;
        return Ok(Value::Bool(if op == Op::CmpEq { equal } else { !equal }));
    }
    let ordering = match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
        _ => None,
    };
    let Some(ordering) = ordering else {
        return Err(VmError::InvalidCast {
            from: format!("{} and {}", lhs.type_name(), rhs.type_name()),
            to: "comparable types".to_string(),
        });
    };
    Ok(Value::Bool(match op {
        Op::CmpLt => ordering.is_lt(),
        Op::CmpLe => ordering.is_le(),
        Op::CmpGt => ordering.is_gt(),
        Op::CmpGe => ordering.is_ge(),
        _ => unreachable!("non-ordering op"),
    }))
}

fn cast_value(value: &Value, to: AbiType) -> Result<Value, VmError> {
    match (value, to) {
        (Value::Int(n), AbiType::F64) => Ok(Value::Float(*n as f64)),
        (Value::Float(x), AbiType::I64) => Ok(Value::Int(*x as i64)),
        (Value::Int(n), AbiType::I32) => Ok(Value::Int(*n as i32 as i64)),
        (Value::Int(n), AbiType::I64) => Ok(Value::Int(*n)),
        (Value::Float(x), AbiType::F64) => Ok(Value::Float(*x)),
        (Value::Bool(b), AbiType::I64) => Ok(Value::Int(*b as i64)),
        (other, to) => Err(VmError::InvalidCast {
            from: other.type_name().to_string(),
            to: to.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::NullRuntime;
    use limit_core::lir::{Block, LirFunction, LirModule};

    fn single_block_function(name: &str, result: AbiType, insts: Vec<Inst>, regs: Vec<AbiType>) -> LirFunction {
        let len = insts.len();
        LirFunction {
            name: name.to_string(),
            params: vec![],
            result,
            reg_types: regs,
            insts,
            blocks: vec![Block {
                id: 0,
                label: "entry".to_string(),
                range: (0, len),
                is_entry: true,
                is_exit: true,
                successors: vec![],
            }],
        }
    }

    fn run_function(function: LirFunction) -> Result<Value, VmError> {
        let module = LirModule {
            functions: vec![function],
            classes: vec![],
        };
        let runtime = NullRuntime::new();
        let mut vm = Vm::new(&module, &runtime);
        vm.run("f", vec![])
    }

    #[test]
    fn test_arithmetic_and_return() {
        let function = single_block_function(
            "f",
            AbiType::I64,
            vec![
                Inst::new(Op::LoadConst, AbiType::I64)
                    .dst(Reg(0))
                    .konst(ConstValue::Int(40)),
                Inst::new(Op::LoadConst, AbiType::I64)
                    .dst(Reg(1))
                    .konst(ConstValue::Int(2)),
                Inst::new(Op::Add, AbiType::I64)
                    .dst(Reg(2))
                    .src1(Reg(0))
                    .src2(Reg(1)),
                Inst::new(Op::Return, AbiType::I64).src1(Reg(2)),
            ],
            vec![AbiType::I64; 3],
        );
        assert_eq!(run_function(function), Ok(Value::Int(42)));
    }

    #[test]
    fn test_division_by_zero_faults() {
        let function = single_block_function(
            "f",
            AbiType::I64,
            vec![
                Inst::new(Op::LoadConst, AbiType::I64)
                    .dst(Reg(0))
                    .konst(ConstValue::Int(1)),
                Inst::new(Op::LoadConst, AbiType::I64)
                    .dst(Reg(1))
                    .konst(ConstValue::Int(0)),
                Inst::new(Op::Div, AbiType::I64)
                    .dst(Reg(2))
                    .src1(Reg(0))
                    .src2(Reg(1)),
                Inst::new(Op::Return, AbiType::I64).src1(Reg(2)),
            ],
            vec![AbiType::I64; 3],
        );
        assert_eq!(run_function(function), Err(VmError::DivisionByZero));
    }

    #[test]
    fn test_uninitialized_register_faults() {
        let function = single_block_function(
            "f",
            AbiType::I64,
            vec![Inst::new(Op::Return, AbiType::I64).src1(Reg(0))],
            vec![AbiType::I64],
        );
        assert_eq!(
            run_function(function),
            Err(VmError::UninitializedRegister(0))
        );
    }

    #[test]
    fn test_construct_and_unwrap_ok() {
        let function = single_block_function(
            "f",
            AbiType::I64,
            vec![
                Inst::new(Op::LoadConst, AbiType::I64)
                    .dst(Reg(0))
                    .konst(ConstValue::Int(7)),
                Inst::new(Op::ConstructOk, AbiType::Ptr).dst(Reg(1)).src1(Reg(0)),
                Inst::new(Op::UnwrapValue, AbiType::I64).dst(Reg(2)).src1(Reg(1)),
                Inst::new(Op::Return, AbiType::I64).src1(Reg(2)),
            ],
            vec![AbiType::I64, AbiType::Ptr, AbiType::I64],
        );
        assert_eq!(run_function(function), Ok(Value::Int(7)));
    }

    #[test]
    fn test_unhandled_error_at_entry() {
        let function = single_block_function(
            "f",
            AbiType::Ptr,
            vec![
                Inst::new(Op::LoadConst, AbiType::Ptr)
                    .dst(Reg(0))
                    .konst(ConstValue::Null),
                Inst::new(Op::ConstructErr, AbiType::Ptr).dst(Reg(1)).src1(Reg(0)),
                Inst::new(Op::Return, AbiType::Ptr).src1(Reg(1)),
            ],
            vec![AbiType::Ptr, AbiType::Ptr],
        );
        assert!(matches!(
            run_function(function),
            Err(VmError::UnhandledError(_))
        ));
    }

    #[test]
    fn test_str_format() {
        let function = single_block_function(
            "f",
            AbiType::Ptr,
            vec![
                Inst::new(Op::LoadConst, AbiType::Ptr)
                    .dst(Reg(0))
                    .konst(ConstValue::Str("World".to_string())),
                Inst::new(Op::StrFormat, AbiType::Ptr)
                    .dst(Reg(1))
                    .konst(ConstValue::Str("Hello, {}!".to_string()))
                    .args(vec![Reg(0)]),
                Inst::new(Op::Return, AbiType::Ptr).src1(Reg(1)),
            ],
            vec![AbiType::Ptr, AbiType::Ptr],
        );
        assert_eq!(run_function(function), Ok(Value::str("Hello, World!")));
    }

    #[test]
    fn test_region_trace_order() {
        let function = single_block_function(
            "f",
            AbiType::Void,
            vec![
                Inst::new(Op::RegionEnter, AbiType::Void),
                Inst::new(Op::LoadConst, AbiType::Ptr)
                    .dst(Reg(0))
                    .konst(ConstValue::Str("x".to_string())),
                Inst::new(Op::ReleaseLocal, AbiType::Void).src1(Reg(0)),
                Inst::new(Op::RegionExit, AbiType::Void),
                Inst::new(Op::Ret, AbiType::Void),
            ],
            vec![AbiType::Ptr],
        );
        let module = LirModule {
            functions: vec![function],
            classes: vec![],
        };
        let runtime = NullRuntime::new();
        let mut vm = Vm::new(&module, &runtime);
        vm.run("f", vec![]).unwrap();
        assert_eq!(
            vm.take_region_trace(),
            vec![
                RegionEvent::Enter(0),
                RegionEvent::Release(0),
                RegionEvent::Exit(0)
            ]
        );
    }
}
