//! The metadata storage planner.
//!
//! Runs once per function, before any body instruction is rewritten:
//!
//! 1. Create a synthetic prologue block.
//! 2. For every non-function pointer parameter, load its metadata from the
//!    shadow stack into freshly allocated shadow cells (slot indices start
//!    at 1; slot 0 is the return slot) and record it function-scoped.
//! 3. Create the don't-care metadata and the stack-frame key cells.
//! 4. Scan every instruction and terminator and collect the set of
//!    pointer operands that need shadow storage.
//! 5. Deduplicate and sort the set, then allocate four cells per operand.
//! 6. Terminate the prologue with a branch to the original entry block.
//!
//! The two-pass shape (scan, then allocate, then rewrite) is load-bearing:
//! phi instrumentation reads the shadow cells of incoming operands that
//! may be defined in blocks rewritten later, which is only SSA-legal when
//! every cell is an entry-dominating prologue alloca.

use std::collections::BTreeSet;

use crate::common::error::InstrumentError;
use crate::common::types::IrType;
use crate::ir::constants::IrConst;
use crate::ir::instruction::{
    BasicBlock, Callee, Instruction, Operand, Terminator, Value,
};
use crate::ir::module::IrFunction;

use super::metadata::{Metadata, Scope};
use super::runtime;
use super::{Frame, FuncInstrumenter, InstrumentOptions};

impl FuncInstrumenter<'_> {
    /// Build the prologue block and the shadow-storage map for `func`.
    /// On return, `func.blocks[0]` is the synthetic prologue.
    pub(crate) fn plan(&mut self, func: &mut IrFunction) -> Result<(), InstrumentError> {
        let entry_label = match func.blocks.first() {
            Some(block) => block.label,
            None => return Ok(()),
        };
        let prologue_label = func.fresh_block();
        let mut pro: Vec<Instruction> = Vec::new();

        // Parameters: pull metadata off the caller's shadow stack frame.
        let params = func.params.clone();
        let mut slot = 0i64;
        for param in &params {
            if !param.ty.is_pointer() || param.ty.is_function_pointer() {
                continue;
            }
            slot += 1;
            let cells = self.alloc_cells(&mut pro);
            self.emit_shadow_stack_load(&mut pro, cells, slot);
            self.insert_meta(Scope::Function, param.value, cells)?;
            self.storage.insert(param.value, cells);
        }

        // Don't-care metadata: base = bound = null, key = 0, and a lock
        // pointing at a word that holds 0, so the runtime always sees a
        // matching key. The runtime recognises this tuple as unchecked.
        let dc = self.alloc_cells(&mut pro);
        let word = self.fresh();
        pro.push(Instruction::Alloca {
            dest: word,
            ty: IrType::I64,
            count: None,
            count_ty: IrType::I64,
        });
        pro.push(Instruction::Store {
            val: Self::i64_const(0),
            ptr: Operand::Value(word),
            ty: IrType::I64,
        });
        let word8 = self.emit_cast_to_byte_ptr(&mut pro, Operand::Value(word), IrType::I64.ptr_to());
        pro.push(Instruction::Store {
            val: Operand::Const(IrConst::null_ptr(IrType::I8)),
            ptr: Operand::Value(dc.base),
            ty: IrType::i8_ptr(),
        });
        pro.push(Instruction::Store {
            val: Operand::Const(IrConst::null_ptr(IrType::I8)),
            ptr: Operand::Value(dc.bound),
            ty: IrType::i8_ptr(),
        });
        pro.push(Instruction::Store {
            val: Self::i64_const(0),
            ptr: Operand::Value(dc.key),
            ty: IrType::I64,
        });
        pro.push(Instruction::Store {
            val: Operand::Value(word8),
            ptr: Operand::Value(dc.lock),
            ty: IrType::i8_ptr(),
        });
        self.dont_care = Some(dc);

        // Cells for the stack-frame key; create_stack_key fills them in
        // the entry prologue.
        let lock_cell = self.alloc_cell(&mut pro, IrType::i8_ptr());
        let key_cell = self.alloc_cell(&mut pro, IrType::I64);
        self.frame = Some(Frame { key_cell, lock_cell, key: None, lock: None });

        // Scan and collect, then allocate cells for everything that does
        // not already own some (parameters do).
        let mut wanted: BTreeSet<Value> = BTreeSet::new();
        let ret_is_ptr =
            func.return_type.is_pointer() && !func.return_type.is_function_pointer();
        for block in &func.blocks {
            for inst in &block.instructions {
                collect_instruction(inst, self.opts, &mut wanted);
            }
            if ret_is_ptr {
                if let Terminator::Return(Some(Operand::Value(v))) = &block.terminator {
                    wanted.insert(*v);
                }
            }
        }
        for v in wanted {
            if !self.storage.contains_key(&v) {
                let cells = self.alloc_cells(&mut pro);
                self.storage.insert(v, cells);
            }
        }

        func.blocks.insert(
            0,
            BasicBlock {
                label: prologue_label,
                instructions: pro,
                terminator: Terminator::Branch(entry_label),
            },
        );
        log::trace!(
            "planned {} shadow cell sets for `{}`",
            self.storage.len(),
            self.func_name
        );
        Ok(())
    }

    /// Alloca one shadow cell of element type `ty` in the prologue.
    fn alloc_cell(&mut self, pro: &mut Vec<Instruction>, ty: IrType) -> Value {
        let dest = self.fresh();
        pro.push(Instruction::Alloca { dest, ty, count: None, count_ty: IrType::I64 });
        dest
    }

    /// Alloca the four shadow cells for one tracked pointer: base and
    /// bound cells hold `i8*`, the key cell holds `i64`, the lock cell
    /// holds `i8*`.
    pub(crate) fn alloc_cells(&mut self, pro: &mut Vec<Instruction>) -> Metadata {
        let base = self.alloc_cell(pro, IrType::i8_ptr());
        let bound = self.alloc_cell(pro, IrType::i8_ptr());
        let key = self.alloc_cell(pro, IrType::I64);
        let lock = self.alloc_cell(pro, IrType::i8_ptr());
        Metadata { base, bound, key, lock }
    }
}

/// Collection rules: which operands of one instruction need shadow cells.
/// Must mirror exactly what the rewriter will ask `storage_for` about.
fn collect_instruction(
    inst: &Instruction,
    opts: &InstrumentOptions,
    wanted: &mut BTreeSet<Value>,
) {
    match inst {
        // A load that produces a pointer needs cells for both the loaded
        // pointer (metadata_load writes through them) and the source
        // address.
        Instruction::Load { dest, ptr, ty } => {
            if opts.instrument_load && ty.is_pointer() && !ty.is_function_pointer() {
                wanted.insert(*dest);
                if let Some(v) = ptr.as_value() {
                    wanted.insert(v);
                }
            }
        }
        // An instrumented call needs cells for every non-function pointer
        // argument and for a pointer return value.
        Instruction::Call {
            dest,
            callee: Callee::Name(name),
            args,
            arg_types,
            return_type,
            is_variadic: false,
        } => {
            if !opts.instrument_call
                || runtime::is_ignored_name(name)
                || opts.blacklist.contains(name)
            {
                return;
            }
            for (arg, ty) in args.iter().zip(arg_types) {
                if ty.is_pointer() && !ty.is_function_pointer() {
                    if let Some(v) = arg.as_value() {
                        wanted.insert(v);
                    }
                }
            }
            if return_type.is_pointer() && !return_type.is_function_pointer() {
                if let Some(d) = dest {
                    wanted.insert(*d);
                }
            }
        }
        // A pointer phi needs cells for its result and for every local
        // incoming value; the parallel metadata phis read those cells.
        Instruction::Phi { dest, ty, incoming } => {
            if ty.is_pointer() && !ty.is_function_pointer() {
                wanted.insert(*dest);
                for (op, _) in incoming {
                    if let Some(v) = op.as_value() {
                        wanted.insert(v);
                    }
                }
            }
        }
        Instruction::Alloca { dest, .. } => {
            if opts.instrument_stack {
                wanted.insert(*dest);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::IrType;
    use crate::ir::instruction::Value;

    fn call(dest: Option<Value>, name: &str, args: Vec<(Operand, IrType)>) -> Instruction {
        let (args, arg_types) = args.into_iter().unzip();
        Instruction::Call {
            dest,
            callee: Callee::Name(name.to_string()),
            args,
            arg_types,
            return_type: if dest.is_some() { IrType::i8_ptr() } else { IrType::Void },
            is_variadic: false,
        }
    }

    #[test]
    fn test_collects_pointer_load_and_source() {
        let opts = InstrumentOptions::default();
        let mut wanted = BTreeSet::new();
        let inst = Instruction::Load {
            dest: Value(5),
            ptr: Operand::Value(Value(3)),
            ty: IrType::i8_ptr(),
        };
        collect_instruction(&inst, &opts, &mut wanted);
        assert!(wanted.contains(&Value(5)));
        assert!(wanted.contains(&Value(3)));
    }

    #[test]
    fn test_scalar_load_collects_nothing() {
        let opts = InstrumentOptions::default();
        let mut wanted = BTreeSet::new();
        let inst = Instruction::Load {
            dest: Value(5),
            ptr: Operand::Value(Value(3)),
            ty: IrType::I32,
        };
        collect_instruction(&inst, &opts, &mut wanted);
        assert!(wanted.is_empty());
    }

    #[test]
    fn test_ignored_callee_collects_nothing() {
        let opts = InstrumentOptions::default();
        let mut wanted = BTreeSet::new();
        let inst = call(
            Some(Value(8)),
            "llvm.memcpy.p0i8.p0i8.i64",
            vec![(Operand::Value(Value(2)), IrType::i8_ptr())],
        );
        collect_instruction(&inst, &opts, &mut wanted);
        assert!(wanted.is_empty());
    }

    #[test]
    fn test_call_collects_pointer_args_and_result() {
        let opts = InstrumentOptions::default();
        let mut wanted = BTreeSet::new();
        let inst = call(
            Some(Value(8)),
            "use_buffers",
            vec![
                (Operand::Value(Value(2)), IrType::i8_ptr()),
                (Operand::Value(Value(3)), IrType::I64),
                (Operand::Value(Value(4)), IrType::I32.ptr_to()),
            ],
        );
        collect_instruction(&inst, &opts, &mut wanted);
        assert_eq!(
            wanted.into_iter().collect::<Vec<_>>(),
            vec![Value(2), Value(4), Value(8)]
        );
    }

    #[test]
    fn test_alloca_collection_follows_stack_option() {
        let inst = Instruction::Alloca {
            dest: Value(1),
            ty: IrType::I32,
            count: None,
            count_ty: IrType::I64,
        };
        let mut opts = InstrumentOptions::default();
        let mut wanted = BTreeSet::new();
        collect_instruction(&inst, &opts, &mut wanted);
        assert!(wanted.contains(&Value(1)));

        opts.instrument_stack = false;
        let mut wanted = BTreeSet::new();
        collect_instruction(&inst, &opts, &mut wanted);
        assert!(wanted.is_empty());
    }
}
