//! The check emitter.
//!
//! Emits the spatial and temporal dereference checks in front of a memory
//! access. Order is fixed and observable through runtime failure messages:
//! spatial first, then temporal. The optional metadata-self-consistency
//! check (gated by `emit_checks`) precedes both.

use crate::common::types::IrType;
use crate::ir::instruction::{Instruction, Operand, Value};

use super::metadata::Metadata;
use super::runtime;
use super::FuncInstrumenter;

impl FuncInstrumenter<'_> {
    /// Emit the check pair for one dereference of `addr` (of pointer type
    /// `addr_ty`) touching `size` bytes. `is_load` selects the load or
    /// store flavor of both checks. Returns the `i8*`-cast address so the
    /// caller can reuse it for metadata table traffic.
    pub(crate) fn emit_dereference_checks(
        &mut self,
        out: &mut Vec<Instruction>,
        meta: Metadata,
        addr: &Operand,
        addr_ty: &IrType,
        size: u64,
        is_load: bool,
    ) -> Value {
        if self.opts.emit_checks {
            self.emit_metadata_check(out, meta);
        }

        let addr8 = self.emit_cast_to_byte_ptr(out, addr.clone(), addr_ty.clone());

        let base = self.emit_load_cell(out, meta.base, IrType::i8_ptr());
        let bound = self.emit_load_cell(out, meta.bound, IrType::i8_ptr());
        let spatial = if is_load {
            runtime::SPATIAL_LOAD_CHECK
        } else {
            runtime::SPATIAL_STORE_CHECK
        };
        self.emit_call(
            out,
            spatial,
            vec![
                Operand::Value(base),
                Operand::Value(bound),
                Operand::Value(addr8),
                Self::i64_const(size as i64),
            ],
            vec![IrType::i8_ptr(), IrType::i8_ptr(), IrType::i8_ptr(), IrType::I64],
            IrType::Void,
        );

        let key = self.emit_load_cell(out, meta.key, IrType::I64);
        let lock = self.emit_load_cell(out, meta.lock, IrType::i8_ptr());
        let temporal = if is_load {
            runtime::TEMPORAL_LOAD_CHECK
        } else {
            runtime::TEMPORAL_STORE_CHECK
        };
        self.emit_call(
            out,
            temporal,
            vec![Operand::Value(lock), Operand::Value(key)],
            vec![IrType::i8_ptr(), IrType::I64],
            IrType::Void,
        );

        addr8
    }

    /// The optional runtime-side invariant check that base, bound, key,
    /// and lock agree. Takes the cell addresses; the runtime reads them.
    fn emit_metadata_check(&mut self, out: &mut Vec<Instruction>, meta: Metadata) {
        let cell = IrType::i8_ptr().ptr_to();
        self.emit_call(
            out,
            runtime::METADATA_CHECK,
            vec![
                Operand::Value(meta.base),
                Operand::Value(meta.bound),
                Operand::Value(meta.key),
                Operand::Value(meta.lock),
            ],
            vec![cell.clone(), cell.clone(), IrType::I64.ptr_to(), cell],
            IrType::Void,
        );
    }
}
