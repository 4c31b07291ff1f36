//! The pointer inspector.
//!
//! Given a pointer-typed operand at a dereference site, classify it and
//! hand back its referent type and metadata, or nothing when the access
//! needs no check. The rules run in a fixed order:
//!
//! 1. pointer to function type: never tracked
//! 2. local in the safe set: checks elided
//! 3. local in the function-scoped table (4. or block-scoped): its metadata,
//!    with table exclusivity enforced
//! 5. constant reference to a safe global: checks elided
//! 6. any other constant pointer or unrecognised local: diagnostic, then
//!    don't-care metadata (conservatively permissive)
//! 7. a non-pointer operand here is a fatal programmer error
//!
//! Derivation sites (GEP, bitcast, select, call arguments) deliberately do
//! not go through this order: an alloca is simultaneously safe and
//! metadata-bearing, and derived pointers must inherit the metadata even
//! though the alloca's own dereference is uncheckable by construction.
//! Those sites use the table lookups directly (see rewriter.rs).

use crate::common::error::InstrumentError;
use crate::common::types::IrType;
use crate::ir::constants::IrConst;
use crate::ir::instruction::Operand;

use super::metadata::Metadata;
use super::FuncInstrumenter;

impl FuncInstrumenter<'_> {
    /// Classify a pointer operand at a dereference site. `ty` is the
    /// operand's own (pointer) type. Returns the referent type and the
    /// metadata to check against, or `None` when checks are elided.
    pub(crate) fn inspect(
        &mut self,
        op: &Operand,
        ty: &IrType,
    ) -> Result<Option<(IrType, Metadata)>, InstrumentError> {
        let referent = match ty {
            IrType::Ptr(inner) => inner.as_ref().clone(),
            _ => {
                return Err(InstrumentError::NotAPointer {
                    function: self.func_name.clone(),
                    operand: op.to_string(),
                    ty: ty.to_string(),
                })
            }
        };
        if matches!(referent, IrType::Func { .. }) {
            return Ok(None);
        }

        match op {
            Operand::Value(v) => {
                if self.safe_values.contains(v) {
                    return Ok(None);
                }
                if let Some((_, meta)) = self.lookup_tables(*v)? {
                    return Ok(Some((referent, meta)));
                }
                self.diags.record(format!(
                    "in `{}`: unrecognised local pointer {}; substituting don't-care metadata",
                    self.func_name, v
                ));
                let dc = self.dont_care()?;
                Ok(Some((referent, dc)))
            }
            Operand::Const(c) => {
                if let IrConst::Global { name, .. } = c {
                    if self.safe_globals.contains(name) {
                        return Ok(None);
                    }
                    if let Some(meta) = self.module_meta.get(name) {
                        return Ok(Some((referent, *meta)));
                    }
                }
                self.diags.record(format!(
                    "in `{}`: unsupported constant pointer {}; substituting don't-care metadata",
                    self.func_name, c
                ));
                let dc = self.dont_care()?;
                Ok(Some((referent, dc)))
            }
        }
    }

    /// True when an operand is a safe pointer: a local in the safe set or
    /// the address of a safe global.
    pub(crate) fn operand_is_safe(&self, op: &Operand) -> bool {
        match op {
            Operand::Value(v) => self.safe_values.contains(v),
            Operand::Const(IrConst::Global { name, .. }) => self.safe_globals.contains(name),
            Operand::Const(_) => false,
        }
    }
}
