//! LIR disassembler
//!
//! Deterministic textual form used by `-bytecode` output and by tests.
//! One instruction per line: `rN = OP operands : ABI`, with labeled
//! basic blocks. The format is stable across releases; tests snapshot it.

use crate::lir::{Inst, LirFunction, LirModule, Op};

pub fn disassemble(module: &LirModule) -> String {
    let mut out = String::new();
    for (index, class) in module.classes.iter().enumerate() {
        out.push_str(&format!("class #{} {}", index, class.name));
        if let Some(parent) = class.parent {
            out.push_str(&format!(" : #{}", parent));
        }
        out.push_str(&format!(
            " {{ fields: [{}], vtable: [{}] }}\n",
            class.field_names.join(", "),
            class
                .vtable
                .iter()
                .map(|(m, f)| format!("{} -> {}", m, f))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    if !module.classes.is_empty() {
        out.push('\n');
    }
    for function in &module.functions {
        out.push_str(&disassemble_function(function));
        out.push('\n');
    }
    out
}

pub fn disassemble_function(function: &LirFunction) -> String {
    let params = function
        .params
        .iter()
        .map(|(reg, abi)| format!("{}: {}", reg, abi))
        .collect::<Vec<_>>()
        .join(", ");
    let mut out = format!(
        "fn {}({}) -> {} ; regs={}\n",
        function.name,
        params,
        function.result,
        function.reg_count()
    );
    for block in &function.blocks {
        let mut tags = Vec::new();
        if block.is_entry {
            tags.push("entry");
        }
        if block.is_exit {
            tags.push("exit");
        }
        let tag = if tags.is_empty() {
            String::new()
        } else {
            format!(" ({})", tags.join(", "))
        };
        out.push_str(&format!("bb{} {}{}:\n", block.id, block.label, tag));
        for inst in &function.insts[block.range.0..block.range.1] {
            out.push_str(&format!("  {}\n", render_inst(inst)));
        }
    }
    out
}

fn render_inst(inst: &Inst) -> String {
    let mut operands = Vec::new();
    if let Some(src1) = inst.src1 {
        operands.push(src1.to_string());
    }
    if let Some(src2) = inst.src2 {
        operands.push(src2.to_string());
    }
    if let Some(ref konst) = inst.konst {
        operands.push(format!("const {}", konst));
    }
    if let Some(imm) = inst.imm {
        // Jump targets read as block labels, everything else as plain immediates
        match inst.op {
            Op::Jump | Op::JumpIf | Op::JumpIfFalse => operands.push(format!("-> bb{}", imm)),
            _ => operands.push(format!("#{}", imm)),
        }
    }
    if let Some(ref callee) = inst.callee {
        let args = inst
            .args
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        operands.push(format!("{}({})", callee, args));
    } else if !inst.args.is_empty() {
        let args = inst
            .args
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        operands.push(format!("[{}]", args));
    }

    let body = if operands.is_empty() {
        format!("{}", inst.op)
    } else {
        format!("{} {}", inst.op, operands.join(", "))
    };
    match inst.dst {
        Some(dst) => format!("{} = {} : {}", dst, body, inst.abi),
        None => format!("{} : {}", body, inst.abi),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{AbiType, Block, ConstValue, Reg};

    #[test]
    fn test_disassemble_simple_function() {
        let function = LirFunction {
            name: "answer".to_string(),
            params: vec![],
            result: AbiType::I64,
            reg_types: vec![AbiType::I64],
            insts: vec![
                Inst::new(Op::LoadConst, AbiType::I64)
                    .dst(Reg(0))
                    .konst(ConstValue::Int(42)),
                Inst::new(Op::Return, AbiType::I64).src1(Reg(0)),
            ],
            blocks: vec![Block {
                id: 0,
                label: "entry".to_string(),
                range: (0, 2),
                is_entry: true,
                is_exit: true,
                successors: vec![],
            }],
        };

        let text = disassemble_function(&function);
        assert!(text.contains("fn answer() -> I64 ; regs=1"));
        assert!(text.contains("bb0 entry (entry, exit):"));
        assert!(text.contains("r0 = LoadConst const 42 : I64"));
        assert!(text.contains("Return r0 : I64"));
    }

    #[test]
    fn test_jump_targets_render_as_blocks() {
        let inst = Inst::new(Op::JumpIfFalse, AbiType::Void).src1(Reg(3)).imm(2);
        assert_eq!(render_inst(&inst), "JumpIfFalse r3, -> bb2 : Void");
    }

    #[test]
    fn test_call_renders_callee_and_args() {
        let inst = Inst::new(Op::Call, AbiType::Ptr)
            .dst(Reg(4))
            .callee("to_int")
            .args(vec![Reg(0), Reg(1)]);
        assert_eq!(render_inst(&inst), "r4 = Call to_int(r0, r1) : Ptr");
    }

    #[test]
    fn test_disassembly_is_deterministic() {
        let module = LirModule::default();
        assert_eq!(disassemble(&module), disassemble(&module));
    }
}
