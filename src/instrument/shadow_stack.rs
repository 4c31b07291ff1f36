//! The shadow-stack protocol.
//!
//! A side channel carrying per-pointer metadata between caller and callee.
//! The callee side (parameter metadata loads, emitted into the prologue by
//! the planner) mirrors the caller side (argument metadata stores around
//! each instrumented call, emitted by the rewriter). Slot 0 is reserved
//! for the return value; pointer arguments occupy slots 1..N in argument
//! order.

use crate::common::types::IrType;
use crate::ir::instruction::{Instruction, Operand};

use super::metadata::{Metadata, Scope};
use super::runtime;
use super::FuncInstrumenter;
use crate::common::error::InstrumentError;

impl FuncInstrumenter<'_> {
    /// Callee side: load the four metadata components of shadow-stack slot
    /// `index` into `cells`. Also used by callers to read a returned
    /// pointer's metadata back from slot 0.
    pub(crate) fn emit_shadow_stack_load(
        &mut self,
        out: &mut Vec<Instruction>,
        cells: Metadata,
        index: i64,
    ) {
        let loads = [
            (runtime::LOAD_BASE_SHADOW_STACK, cells.base, IrType::i8_ptr()),
            (runtime::LOAD_BOUND_SHADOW_STACK, cells.bound, IrType::i8_ptr()),
            (runtime::LOAD_KEY_SHADOW_STACK, cells.key, IrType::I64),
            (runtime::LOAD_LOCK_SHADOW_STACK, cells.lock, IrType::i8_ptr()),
        ];
        for (name, cell, ty) in loads {
            let value = self.fresh();
            out.push(Instruction::Call {
                dest: Some(value),
                callee: crate::ir::instruction::Callee::Name(name.to_string()),
                args: vec![Self::i32_const(index)],
                arg_types: vec![IrType::I32],
                return_type: ty.clone(),
                is_variadic: false,
            });
            out.push(Instruction::Store {
                val: Operand::Value(value),
                ptr: Operand::Value(cell),
                ty,
            });
        }
    }

    /// Caller side: store the metadata values held in `meta`'s cells to
    /// shadow-stack slot `index`, in base, bound, key, lock order.
    pub(crate) fn emit_shadow_stack_store(
        &mut self,
        out: &mut Vec<Instruction>,
        meta: Metadata,
        index: i64,
    ) {
        let stores = [
            (runtime::STORE_BASE_SHADOW_STACK, meta.base, IrType::i8_ptr()),
            (runtime::STORE_BOUND_SHADOW_STACK, meta.bound, IrType::i8_ptr()),
            (runtime::STORE_KEY_SHADOW_STACK, meta.key, IrType::I64),
            (runtime::STORE_LOCK_SHADOW_STACK, meta.lock, IrType::i8_ptr()),
        ];
        for (name, cell, ty) in stores {
            let value = self.emit_load_cell(out, cell, ty.clone());
            self.emit_call(
                out,
                name,
                vec![Operand::Value(value), Self::i32_const(index)],
                vec![ty, IrType::I32],
                IrType::Void,
            );
        }
    }

    /// The metadata to transfer for one pointer argument at a call site:
    /// the scope tables first; then the killed-metadata reload (the
    /// argument lost its metadata earlier in the block but owns shadow
    /// cells); constants transfer don't-care; anything else degrades to
    /// don't-care with a diagnostic.
    pub(crate) fn transfer_metadata(&mut self, op: &Operand) -> Result<Metadata, InstrumentError> {
        match op {
            Operand::Value(v) => {
                if let Some((_, meta)) = self.lookup_tables(*v)? {
                    return Ok(meta);
                }
                if let Ok(cells) = self.storage_for(*v) {
                    self.diags.record(format!(
                        "in `{}`: metadata for {} was invalidated; reloading from shadow cells",
                        self.func_name, v
                    ));
                    // Recovered: the pointer is tracked again for the rest
                    // of this block.
                    self.insert_meta(Scope::Block, *v, cells)?;
                    return Ok(cells);
                }
                self.diags.record(format!(
                    "in `{}`: pointer argument {} has no metadata; passing don't-care",
                    self.func_name, v
                ));
                self.dont_care()
            }
            Operand::Const(_) => self.dont_care(),
        }
    }
}
