//! The per-opcode instruction rewriter.
//!
//! Each opcode category gets a small rewrite routine that emits the
//! original instruction plus its instrumentation into the output list and
//! updates the metadata tables. Everything not listed here passes through
//! unchanged.

use crate::common::error::InstrumentError;
use crate::common::types::IrType;
use crate::ir::constants::IrConst;
use crate::ir::instruction::{
    BlockId, Callee, CastOp, Instruction, IrBinOp, Operand, Value,
};

use super::metadata::{Metadata, Scope};
use super::runtime;
use super::FuncInstrumenter;

impl FuncInstrumenter<'_> {
    /// Rewrite one instruction into `out`.
    pub(crate) fn rewrite_instruction(
        &mut self,
        inst: Instruction,
        out: &mut Vec<Instruction>,
    ) -> Result<(), InstrumentError> {
        match inst {
            Instruction::Alloca { dest, ty, count, count_ty } => {
                self.rewrite_alloca(dest, ty, count, count_ty, out)
            }
            Instruction::Load { dest, ptr, ty } => self.rewrite_load(dest, ptr, ty, out),
            Instruction::Store { val, ptr, ty } => self.rewrite_store(val, ptr, ty, out),
            Instruction::Call { dest, callee, args, arg_types, return_type, is_variadic } => {
                self.rewrite_call(dest, callee, args, arg_types, return_type, is_variadic, out)
            }
            Instruction::Gep { dest, base, base_ty, indices } => {
                self.rewrite_gep(dest, base, base_ty, indices, out)
            }
            Instruction::Cast { dest, op, src, from_ty, to_ty } => {
                self.rewrite_cast(dest, op, src, from_ty, to_ty, out)
            }
            Instruction::Select { dest, cond, true_val, false_val, ty } => {
                self.rewrite_select(dest, cond, true_val, false_val, ty, out)
            }
            Instruction::Phi { dest, ty, incoming } => self.rewrite_phi(dest, ty, incoming, out),
            // Pass-through: arithmetic and comparisons neither produce nor
            // consume tracked pointers.
            other => {
                out.push(other);
                Ok(())
            }
        }
    }

    /// Alloca: the address itself is safe, and when stack instrumentation
    /// is on, the allocation gets base = the address, bound = base +
    /// sizeof(ty) * count, and the function's stack-frame key and lock.
    fn rewrite_alloca(
        &mut self,
        dest: Value,
        ty: IrType,
        count: Option<Operand>,
        count_ty: IrType,
        out: &mut Vec<Instruction>,
    ) -> Result<(), InstrumentError> {
        out.push(Instruction::Alloca {
            dest,
            ty: ty.clone(),
            count: count.clone(),
            count_ty: count_ty.clone(),
        });
        self.safe_values.insert(dest);
        if !self.opts.instrument_stack {
            return Ok(());
        }

        let cells = self.storage_for(dest)?;
        let frame = match self.frame {
            Some(frame) => frame,
            None => return Ok(()),
        };
        let (Some(key), Some(lock)) = (frame.key, frame.lock) else {
            return Ok(());
        };

        let base8 = self.emit_cast_to_byte_ptr(out, Operand::Value(dest), ty.clone().ptr_to());
        let span = match count {
            None => Self::i64_const(ty.size() as i64),
            Some(op) => {
                // Sign-extend a narrow element count to 64 bits.
                let count64 = if count_ty == IrType::I64 {
                    op
                } else {
                    let widened = self.fresh();
                    out.push(Instruction::Cast {
                        dest: widened,
                        op: CastOp::Sext,
                        src: op,
                        from_ty: count_ty,
                        to_ty: IrType::I64,
                    });
                    Operand::Value(widened)
                };
                let bytes = self.fresh();
                out.push(Instruction::BinOp {
                    dest: bytes,
                    op: IrBinOp::Mul,
                    lhs: count64,
                    rhs: Self::i64_const(ty.size() as i64),
                    ty: IrType::I64,
                });
                Operand::Value(bytes)
            }
        };
        let bound8 = self.fresh();
        out.push(Instruction::Gep {
            dest: bound8,
            base: Operand::Value(base8),
            base_ty: IrType::I8,
            indices: vec![span],
        });

        out.push(Instruction::Store {
            val: Operand::Value(base8),
            ptr: Operand::Value(cells.base),
            ty: IrType::i8_ptr(),
        });
        out.push(Instruction::Store {
            val: Operand::Value(bound8),
            ptr: Operand::Value(cells.bound),
            ty: IrType::i8_ptr(),
        });
        out.push(Instruction::Store {
            val: Operand::Value(key),
            ptr: Operand::Value(cells.key),
            ty: IrType::I64,
        });
        out.push(Instruction::Store {
            val: Operand::Value(lock),
            ptr: Operand::Value(cells.lock),
            ty: IrType::i8_ptr(),
        });
        self.insert_meta(Scope::Function, dest, cells)
    }

    /// Load: check the address, then (for pointer loads) pull the loaded
    /// pointer's metadata out of the in-memory table keyed by the address.
    fn rewrite_load(
        &mut self,
        dest: Value,
        ptr: Operand,
        ty: IrType,
        out: &mut Vec<Instruction>,
    ) -> Result<(), InstrumentError> {
        let ptr_ty = ty.clone().ptr_to();
        let mut addr8 = None;
        if self.opts.instrument_load {
            if let Some((referent, meta)) = self.inspect(&ptr, &ptr_ty)? {
                addr8 =
                    Some(self.emit_dereference_checks(out, meta, &ptr, &ptr_ty, referent.size(), true));
            }
        }

        out.push(Instruction::Load { dest, ptr: ptr.clone(), ty: ty.clone() });

        if self.opts.instrument_load && ty.is_pointer() && !ty.is_function_pointer() {
            let cells = self.storage_for(dest)?;
            let addr8 = match addr8 {
                Some(a) => a,
                None => self.emit_cast_to_byte_ptr(out, ptr, ptr_ty),
            };
            self.emit_call(
                out,
                runtime::METADATA_LOAD,
                vec![
                    Operand::Value(addr8),
                    Operand::Value(cells.base),
                    Operand::Value(cells.bound),
                    Operand::Value(cells.key),
                    Operand::Value(cells.lock),
                ],
                vec![
                    IrType::i8_ptr(),
                    IrType::i8_ptr().ptr_to(),
                    IrType::i8_ptr().ptr_to(),
                    IrType::I64.ptr_to(),
                    IrType::i8_ptr().ptr_to(),
                ],
                IrType::Void,
            );
            self.insert_meta(Scope::Block, dest, cells)?;
        }
        Ok(())
    }

    /// Store: check the target address, then (for pointer stores) record
    /// the stored pointer's metadata in the in-memory table keyed by the
    /// target address.
    fn rewrite_store(
        &mut self,
        val: Operand,
        ptr: Operand,
        ty: IrType,
        out: &mut Vec<Instruction>,
    ) -> Result<(), InstrumentError> {
        let ptr_ty = ty.clone().ptr_to();
        let mut addr8 = None;
        if self.opts.instrument_store {
            if let Some((referent, meta)) = self.inspect(&ptr, &ptr_ty)? {
                addr8 = Some(self.emit_dereference_checks(
                    out,
                    meta,
                    &ptr,
                    &ptr_ty,
                    referent.size(),
                    false,
                ));
            }
        }

        out.push(Instruction::Store { val: val.clone(), ptr: ptr.clone(), ty: ty.clone() });

        if self.opts.instrument_store && ty.is_pointer() && !ty.is_function_pointer() {
            if let Some(meta) = self.stored_value_metadata(&val)? {
                let addr8 = match addr8 {
                    Some(a) => a,
                    None => self.emit_cast_to_byte_ptr(out, ptr, ptr_ty),
                };
                let (base, bound, key, lock) = self.emit_load_metadata(out, meta);
                self.emit_call(
                    out,
                    runtime::METADATA_STORE,
                    vec![
                        Operand::Value(addr8),
                        Operand::Value(base),
                        Operand::Value(bound),
                        Operand::Value(key),
                        Operand::Value(lock),
                    ],
                    vec![
                        IrType::i8_ptr(),
                        IrType::i8_ptr(),
                        IrType::i8_ptr(),
                        IrType::I64,
                        IrType::i8_ptr(),
                    ],
                    IrType::Void,
                );
            }
        }
        Ok(())
    }

    /// Metadata for a stored pointer value, when it is known: the scope
    /// tables, the killed-metadata reload, or don't-care for constants.
    /// Unknown locals are left alone (nothing to record).
    fn stored_value_metadata(
        &mut self,
        val: &Operand,
    ) -> Result<Option<Metadata>, InstrumentError> {
        match val {
            Operand::Value(v) => {
                if let Some((_, meta)) = self.lookup_tables(*v)? {
                    return Ok(Some(meta));
                }
                if let Ok(cells) = self.storage_for(*v) {
                    self.diags.record(format!(
                        "in `{}`: metadata for stored pointer {} was invalidated; reloading from shadow cells",
                        self.func_name, v
                    ));
                    self.insert_meta(Scope::Block, *v, cells)?;
                    return Ok(Some(cells));
                }
                log::trace!("stored pointer {} has no metadata to record", v);
                Ok(None)
            }
            Operand::Const(c) if c.is_pointer() => Ok(Some(self.dont_care()?)),
            Operand::Const(_) => Ok(None),
        }
    }

    /// Call: run the caller side of the shadow-stack protocol, redirect
    /// wrapped stdlib targets, and invalidate passed pointers (the callee
    /// may have freed any of them).
    #[allow(clippy::too_many_arguments)]
    fn rewrite_call(
        &mut self,
        dest: Option<Value>,
        callee: Callee,
        args: Vec<Operand>,
        arg_types: Vec<IrType>,
        return_type: IrType,
        is_variadic: bool,
        out: &mut Vec<Instruction>,
    ) -> Result<(), InstrumentError> {
        let name = match &callee {
            Callee::Name(name) => name.clone(),
            // Computed call targets are not instrumented.
            Callee::Indirect(_) => {
                out.push(Instruction::Call { dest, callee, args, arg_types, return_type, is_variadic });
                return Ok(());
            }
        };
        if !self.opts.instrument_call
            || is_variadic
            || runtime::is_ignored_name(&name)
            || self.opts.blacklist.contains(&name)
        {
            out.push(Instruction::Call { dest, callee, args, arg_types, return_type, is_variadic });
            return Ok(());
        }

        // Slot 0 carries the return value's metadata; pointer arguments
        // occupy slots 1..N in argument order.
        let pointer_args: Vec<&Operand> = args
            .iter()
            .zip(&arg_types)
            .filter(|(_, ty)| ty.is_pointer() && !ty.is_function_pointer())
            .map(|(arg, _)| arg)
            .collect();
        let slots = 1 + pointer_args.len() as i64;

        self.emit_call(
            out,
            runtime::ALLOCATE_SHADOW_STACK,
            vec![Self::i32_const(slots)],
            vec![IrType::I32],
            IrType::Void,
        );
        let pointer_args: Vec<Operand> = pointer_args.into_iter().cloned().collect();
        for (position, arg) in pointer_args.iter().enumerate() {
            let meta = self.transfer_metadata(arg)?;
            self.emit_shadow_stack_store(out, meta, position as i64 + 1);
        }

        let target = runtime::wrapper_for(&name).map(str::to_string).unwrap_or(name);
        out.push(Instruction::Call {
            dest,
            callee: Callee::Name(target),
            args,
            arg_types,
            return_type: return_type.clone(),
            is_variadic,
        });

        // The callee may have freed any pointer it was handed; its
        // metadata must be considered invalidated. It can be recovered
        // later by the shadow-cell reload.
        for arg in &pointer_args {
            if let Some(v) = arg.as_value() {
                self.tables.remove_block(v);
            }
        }

        if let Some(d) = dest {
            if return_type.is_pointer() && !return_type.is_function_pointer() {
                let cells = self.storage_for(d)?;
                self.emit_shadow_stack_load(out, cells, 0);
                self.insert_meta(Scope::Block, d, cells)?;
            }
        }

        self.emit_call(out, runtime::DEALLOCATE_SHADOW_STACK, vec![], vec![], IrType::Void);
        Ok(())
    }

    /// GEP: the result stays inside the parent's allocation, so it shares
    /// the parent's metadata (and shadow cells). Safety does not follow:
    /// an out-of-range index must still be caught, so a derived pointer is
    /// only safe when the parent was safe and carried no metadata at all.
    fn rewrite_gep(
        &mut self,
        dest: Value,
        base: Operand,
        base_ty: IrType,
        indices: Vec<Operand>,
        out: &mut Vec<Instruction>,
    ) -> Result<(), InstrumentError> {
        out.push(Instruction::Gep {
            dest,
            base: base.clone(),
            base_ty: base_ty.clone(),
            indices: indices.clone(),
        });
        let derivable = base_ty.indexed(&indices).is_some();
        if !derivable {
            self.diags.record(format!(
                "in `{}`: cannot derive the referent type of {} = gep {}; result left untracked",
                self.func_name, dest, base
            ));
        }
        self.propagate_derived(dest, &base, derivable, out)
    }

    /// Bitcast between pointer types: structurally identical to GEP
    /// (share the parent's metadata and cells), gated by the bitcast
    /// instrumentation flag. All other casts pass through.
    fn rewrite_cast(
        &mut self,
        dest: Value,
        op: CastOp,
        src: Operand,
        from_ty: IrType,
        to_ty: IrType,
        out: &mut Vec<Instruction>,
    ) -> Result<(), InstrumentError> {
        let is_pointer_bitcast = op == CastOp::Bitcast
            && from_ty.is_pointer()
            && to_ty.is_pointer()
            && !to_ty.is_function_pointer();
        out.push(Instruction::Cast { dest, op, src: src.clone(), from_ty, to_ty });
        if is_pointer_bitcast && self.opts.instrument_bitcast {
            self.propagate_derived(dest, &src, true, out)?;
        }
        Ok(())
    }

    /// Shared GEP/bitcast metadata propagation from a parent operand to a
    /// derived value. Safety propagation ignores `install_metadata`; the
    /// metadata install itself is skipped when the referent type could not
    /// be derived.
    fn propagate_derived(
        &mut self,
        dest: Value,
        parent: &Operand,
        install_metadata: bool,
        out: &mut Vec<Instruction>,
    ) -> Result<(), InstrumentError> {
        match parent {
            Operand::Value(v) => {
                if let Some((_, meta)) = self.lookup_tables(*v)? {
                    if install_metadata {
                        self.install_derived(dest, meta, out)?;
                    }
                } else if self.safe_values.contains(v) {
                    self.safe_values.insert(dest);
                } else {
                    log::trace!("derived pointer {} from untracked parent {}", dest, v);
                }
                Ok(())
            }
            Operand::Const(c) => {
                if let IrConst::Global { name, .. } = c {
                    if self.safe_globals.contains(name) {
                        self.safe_values.insert(dest);
                        return Ok(());
                    }
                    if let Some(meta) = self.module_meta.get(name).copied() {
                        if install_metadata {
                            return self.install_derived(dest, meta, out);
                        }
                        return Ok(());
                    }
                }
                self.diags.record(format!(
                    "in `{}`: pointer derived from unsupported constant {}; substituting don't-care metadata",
                    self.func_name, c
                ));
                if install_metadata {
                    let dc = self.dont_care()?;
                    self.install_derived(dest, dc, out)?;
                }
                Ok(())
            }
        }
    }

    /// Install derived metadata for `dest`. Normally the storage entry
    /// aliases the parent's cells; when the planner gave `dest` cells of
    /// its own (it feeds a phi), the parent's metadata values are copied
    /// into them instead so the parallel phi reads defined cells even
    /// across back edges.
    fn install_derived(
        &mut self,
        dest: Value,
        meta: Metadata,
        out: &mut Vec<Instruction>,
    ) -> Result<(), InstrumentError> {
        if let Some(own) = self.storage.get(&dest).copied() {
            self.emit_copy_metadata(out, meta, own);
            self.insert_meta(Scope::Block, dest, own)
        } else {
            self.storage.insert(dest, meta);
            self.insert_meta(Scope::Block, dest, meta)
        }
    }

    /// Select: when both inputs carry metadata, four more selects under
    /// the same condition merge the metadata cell pointers. The result is
    /// function-scoped only if both inputs were; it is safe only if both
    /// inputs were.
    fn rewrite_select(
        &mut self,
        dest: Value,
        cond: Operand,
        true_val: Operand,
        false_val: Operand,
        ty: IrType,
        out: &mut Vec<Instruction>,
    ) -> Result<(), InstrumentError> {
        out.push(Instruction::Select {
            dest,
            cond: cond.clone(),
            true_val: true_val.clone(),
            false_val: false_val.clone(),
            ty: ty.clone(),
        });
        if !ty.is_pointer() || ty.is_function_pointer() {
            return Ok(());
        }

        let true_meta = match true_val.as_value() {
            Some(v) => self.lookup_tables(v)?,
            None => None,
        };
        let false_meta = match false_val.as_value() {
            Some(v) => self.lookup_tables(v)?,
            None => None,
        };
        if let (Some((true_scope, tm)), Some((false_scope, fm))) = (true_meta, false_meta) {
            let scope = if true_scope == Scope::Function && false_scope == Scope::Function {
                Scope::Function
            } else {
                Scope::Block
            };
            let ptr_cell = IrType::i8_ptr().ptr_to();
            let key_cell = IrType::I64.ptr_to();
            let components = [
                (tm.base, fm.base, ptr_cell.clone()),
                (tm.bound, fm.bound, ptr_cell.clone()),
                (tm.key, fm.key, key_cell),
                (tm.lock, fm.lock, ptr_cell),
            ];
            let mut merged = [Value(0); 4];
            for (i, (true_cell, false_cell, cell_ty)) in components.into_iter().enumerate() {
                let m = self.fresh();
                out.push(Instruction::Select {
                    dest: m,
                    cond: cond.clone(),
                    true_val: Operand::Value(true_cell),
                    false_val: Operand::Value(false_cell),
                    ty: cell_ty,
                });
                merged[i] = m;
            }
            let meta = Metadata {
                base: merged[0],
                bound: merged[1],
                key: merged[2],
                lock: merged[3],
            };
            if let Some(own) = self.storage.get(&dest).copied() {
                self.emit_copy_metadata(out, meta, own);
                self.insert_meta(scope, dest, own)?;
            } else {
                self.storage.insert(dest, meta);
                self.insert_meta(scope, dest, meta)?;
            }
        }

        if self.operand_is_safe(&true_val) && self.operand_is_safe(&false_val) {
            self.safe_values.insert(dest);
        }
        Ok(())
    }

    /// Phi: four parallel phis merge the incoming operands' shadow-cell
    /// addresses; constant incomings contribute the don't-care cells. The
    /// merged pointer's cells alias the phi outputs.
    fn rewrite_phi(
        &mut self,
        dest: Value,
        ty: IrType,
        incoming: Vec<(Operand, BlockId)>,
        out: &mut Vec<Instruction>,
    ) -> Result<(), InstrumentError> {
        out.push(Instruction::Phi { dest, ty: ty.clone(), incoming: incoming.clone() });
        if !ty.is_pointer() || ty.is_function_pointer() {
            return Ok(());
        }

        let dc = self.dont_care()?;
        let mut base_in = Vec::with_capacity(incoming.len());
        let mut bound_in = Vec::with_capacity(incoming.len());
        let mut key_in = Vec::with_capacity(incoming.len());
        let mut lock_in = Vec::with_capacity(incoming.len());
        for (op, pred) in &incoming {
            let cells = match op.as_value() {
                // A local incoming with no shadow storage is a planner bug.
                Some(v) => self.storage_for(v)?,
                None => dc,
            };
            base_in.push((Operand::Value(cells.base), *pred));
            bound_in.push((Operand::Value(cells.bound), *pred));
            key_in.push((Operand::Value(cells.key), *pred));
            lock_in.push((Operand::Value(cells.lock), *pred));
        }

        let ptr_cell = IrType::i8_ptr().ptr_to();
        let base = self.fresh();
        out.push(Instruction::Phi { dest: base, ty: ptr_cell.clone(), incoming: base_in });
        let bound = self.fresh();
        out.push(Instruction::Phi { dest: bound, ty: ptr_cell.clone(), incoming: bound_in });
        let key = self.fresh();
        out.push(Instruction::Phi { dest: key, ty: IrType::I64.ptr_to(), incoming: key_in });
        let lock = self.fresh();
        out.push(Instruction::Phi { dest: lock, ty: ptr_cell, incoming: lock_in });

        let meta = Metadata { base, bound, key, lock };
        // Alias the merged pointer's cells to the phi outputs.
        self.storage.insert(dest, meta);
        self.insert_meta(Scope::Block, dest, meta)
    }
}
