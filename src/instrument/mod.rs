//! The SoftBound+CETS instrumentation pass.
//!
//! Rewrites a typed SSA module so that every pointer computation carries
//! four shadow values (base, bound, key, lock) and every dereference is
//! preceded by a spatial and a temporal check against them. The pass is
//! a per-function pipeline:
//!
//! 1. The storage planner pre-scans the body, builds a synthetic prologue
//!    block, and allocates four shadow cells for every site that will need
//!    them (planner.rs). Eager allocation is what keeps later shadow reads
//!    and writes dominated by their allocas.
//! 2. The rewriter walks each original block and dispatches per opcode
//!    (rewriter.rs), consulting the pointer inspector (inspector.rs) and
//!    emitting dereference checks (checks.rs) and the caller/callee shadow
//!    stack protocol (shadow_stack.rs).
//!
//! All mutable pass state lives in one `FuncInstrumenter` threaded
//! explicitly through the pipeline: the scope tables, the safe-pointer
//! sets, the shadow-storage map, the options, and the diagnostic log.

pub mod checks;
pub mod inspector;
pub mod metadata;
pub mod planner;
pub mod rewriter;
pub mod runtime;
pub mod shadow_stack;

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::common::error::{DiagnosticLog, InstrumentError};
use crate::common::types::IrType;
use crate::ir::constants::IrConst;
use crate::ir::instruction::{CastOp, Callee, Instruction, Operand, Terminator, Value};
use crate::ir::module::{IrFunction, IrModule};

use metadata::{Metadata, MetadataTables, Scope};

/// Which instrumentation categories are enabled. The external front end
/// decides; everything defaults to on except the optional
/// metadata-self-consistency checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentOptions {
    /// Emit checks and metadata loads at loads.
    pub instrument_load: bool,
    /// Emit checks and metadata stores at stores.
    pub instrument_store: bool,
    /// Apply the shadow-stack protocol at call sites.
    pub instrument_call: bool,
    /// Track metadata for allocas.
    pub instrument_stack: bool,
    /// Propagate metadata through bitcasts.
    pub instrument_bitcast: bool,
    /// Emit metadata-self-consistency checks alongside normal checks.
    pub emit_checks: bool,
    /// User-supplied function symbols to leave untouched.
    pub blacklist: HashSet<String>,
}

impl Default for InstrumentOptions {
    fn default() -> Self {
        InstrumentOptions {
            instrument_load: true,
            instrument_store: true,
            instrument_call: true,
            instrument_stack: true,
            instrument_bitcast: true,
            emit_checks: false,
            blacklist: HashSet::new(),
        }
    }
}

/// Instrument a whole module in place.
///
/// Emits the runtime declarations, seeds the safe-global set, instruments
/// every eligible function (renaming `main`), and flushes accumulated
/// diagnostics to stderr once the module is done — including when the
/// pass aborts with a fatal error.
pub fn instrument_module(
    module: &mut IrModule,
    opts: &InstrumentOptions,
) -> Result<(), InstrumentError> {
    let mut diags = DiagnosticLog::new();
    let result = instrument_module_inner(module, opts, &mut diags);
    diags.flush_to_stderr();
    result
}

/// As `instrument_module`, but diagnostics are handed back to the caller
/// instead of printed. Test entry point.
pub fn instrument_module_with_log(
    module: &mut IrModule,
    opts: &InstrumentOptions,
    diags: &mut DiagnosticLog,
) -> Result<(), InstrumentError> {
    instrument_module_inner(module, opts, diags)
}

fn instrument_module_inner(
    module: &mut IrModule,
    opts: &InstrumentOptions,
    diags: &mut DiagnosticLog,
) -> Result<(), InstrumentError> {
    runtime::declare_in(module);

    // Global variable addresses are safe: skip the linker-special tables,
    // anything parked in the llvm.metadata section, and uninitialised
    // (extern) globals. Globals are otherwise emitted unchanged; real
    // module-scoped metadata for them is not computed yet.
    let mut safe_globals: HashSet<String> = HashSet::new();
    for global in &module.globals {
        if global.name == "llvm.global_ctors" || global.name == "llvm.global_dtors" {
            continue;
        }
        if global.section.as_deref() == Some("llvm.metadata") {
            continue;
        }
        if global.init.is_none() {
            continue;
        }
        safe_globals.insert(global.name.clone());
    }

    // Module-scoped metadata table. Stays empty until global-variable
    // metadata is implemented, but participates in lookup order already.
    let module_meta: BTreeMap<String, Metadata> = BTreeMap::new();

    for func in &mut module.functions {
        if func.is_declaration || func.blocks.is_empty() {
            continue;
        }
        if func.is_variadic {
            log::debug!("skipping variadic function `{}`", func.name);
            continue;
        }
        if runtime::is_ignored_name(&func.name) || opts.blacklist.contains(&func.name) {
            log::debug!("skipping ignored function `{}`", func.name);
            continue;
        }
        if runtime::wrapper_for(&func.name).is_some() && func.name != "main" {
            // The runtime wraps this symbol; call sites are redirected to
            // the wrapper, the definition itself stays as the fallback.
            continue;
        }
        if func.name == "main" {
            // Surrender the entry symbol: the runtime's main initialises
            // the metadata structures and then calls softboundcets_main.
            func.name = runtime::RENAMED_MAIN.to_string();
        }
        log::debug!("instrumenting `{}`", func.name);
        instrument_function(func, opts, diags, &module_meta, &safe_globals)?;
    }
    Ok(())
}

/// Instrument one function body in place.
fn instrument_function(
    func: &mut IrFunction,
    opts: &InstrumentOptions,
    diags: &mut DiagnosticLog,
    module_meta: &BTreeMap<String, Metadata>,
    safe_globals: &HashSet<String>,
) -> Result<(), InstrumentError> {
    func.recompute_id_caches();
    let mut fi = FuncInstrumenter::new(func, opts, diags, module_meta, safe_globals);

    // Phase 1: prologue construction and shadow-cell planning.
    fi.plan(func)?;

    // Phase 2: per-block rewriting. blocks[0] is the synthetic prologue
    // and is never re-instrumented; the first original block (index 1)
    // gets the extra entry prologue (global lock, stack frame key).
    let mut blocks = std::mem::take(&mut func.blocks);
    for (index, block) in blocks.iter_mut().enumerate().skip(1) {
        let snapshot = fi.tables.snapshot_block();
        let mut out = Vec::with_capacity(block.instructions.len());
        if index == 1 {
            fi.emit_entry_prologue(&mut out);
        }
        for inst in block.instructions.drain(..) {
            fi.rewrite_instruction(inst, &mut out)?;
        }
        fi.rewrite_terminator(&block.terminator, &mut out)?;
        block.instructions = out;
        fi.tables.restore_block(snapshot);
    }
    func.blocks = blocks;
    func.next_value_id = fi.next_value;
    Ok(())
}

/// The stack-frame temporal identity of the function being instrumented:
/// the two prologue cells `create_stack_key` writes through, and the key
/// and lock values loaded from them in the entry block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Frame {
    pub key_cell: Value,
    pub lock_cell: Value,
    pub key: Option<Value>,
    pub lock: Option<Value>,
}

/// All mutable state for instrumenting one function.
pub(crate) struct FuncInstrumenter<'a> {
    pub(crate) opts: &'a InstrumentOptions,
    pub(crate) diags: &'a mut DiagnosticLog,
    pub(crate) module_meta: &'a BTreeMap<String, Metadata>,
    pub(crate) safe_globals: &'a HashSet<String>,
    pub(crate) func_name: String,
    pub(crate) return_type: IrType,
    next_value: u32,
    /// Block- and function-scoped metadata tables.
    pub(crate) tables: MetadataTables,
    /// SSA values whose dereference cannot fault (alloca results and
    /// values derived safe). Cleared when the function is done.
    pub(crate) safe_values: HashSet<Value>,
    /// Operand -> its four pre-allocated shadow cells (planner output).
    /// Rewrites may re-point entries at other cell sets (aliasing).
    pub(crate) storage: BTreeMap<Value, Metadata>,
    /// The per-function don't-care metadata cells, set by the planner.
    pub(crate) dont_care: Option<Metadata>,
    /// The stack-frame key state, set by the planner and completed by the
    /// entry prologue.
    pub(crate) frame: Option<Frame>,
    /// The global lock value acquired in the entry prologue. Reserved for
    /// global-variable metadata, which is not computed yet.
    #[allow(dead_code)]
    pub(crate) global_lock: Option<Value>,
}

impl<'a> FuncInstrumenter<'a> {
    fn new(
        func: &IrFunction,
        opts: &'a InstrumentOptions,
        diags: &'a mut DiagnosticLog,
        module_meta: &'a BTreeMap<String, Metadata>,
        safe_globals: &'a HashSet<String>,
    ) -> Self {
        FuncInstrumenter {
            opts,
            diags,
            module_meta,
            safe_globals,
            func_name: func.name.clone(),
            return_type: func.return_type.clone(),
            next_value: func.next_value_id,
            tables: MetadataTables::new(),
            safe_values: HashSet::new(),
            storage: BTreeMap::new(),
            dont_care: None,
            frame: None,
            global_lock: None,
        }
    }

    /// Mint a fresh SSA value.
    pub(crate) fn fresh(&mut self) -> Value {
        let v = Value(self.next_value);
        self.next_value += 1;
        v
    }

    /// The shadow cells the planner allocated for `v`. Missing storage at
    /// a site that requires it is a planner bug and aborts the pass.
    pub(crate) fn storage_for(&self, v: Value) -> Result<Metadata, InstrumentError> {
        self.storage.get(&v).copied().ok_or_else(|| InstrumentError::MissingShadowStorage {
            function: self.func_name.clone(),
            operand: v.to_string(),
        })
    }

    /// The don't-care metadata cells. The planner creates them before any
    /// rewrite runs; reaching this without them is a planner bug.
    pub(crate) fn dont_care(&self) -> Result<Metadata, InstrumentError> {
        self.dont_care.ok_or_else(|| InstrumentError::MissingShadowStorage {
            function: self.func_name.clone(),
            operand: "<don't-care metadata>".to_string(),
        })
    }

    fn frame(&self) -> Result<Frame, InstrumentError> {
        self.frame.ok_or_else(|| InstrumentError::MissingShadowStorage {
            function: self.func_name.clone(),
            operand: "<stack frame key>".to_string(),
        })
    }

    /// Table lookup with exclusivity enforcement.
    pub(crate) fn lookup_tables(
        &self,
        v: Value,
    ) -> Result<Option<(Scope, Metadata)>, InstrumentError> {
        self.tables.lookup(&self.func_name, v)
    }

    pub(crate) fn insert_meta(
        &mut self,
        scope: Scope,
        v: Value,
        meta: Metadata,
    ) -> Result<(), InstrumentError> {
        self.tables.insert(&self.func_name, scope, v, meta)
    }

    // ---- instruction emission primitives ----

    /// Emit a call to a runtime function. Returns the destination value
    /// when the return type is non-void.
    pub(crate) fn emit_call(
        &mut self,
        out: &mut Vec<Instruction>,
        name: &str,
        args: Vec<Operand>,
        arg_types: Vec<IrType>,
        return_type: IrType,
    ) -> Option<Value> {
        let dest = if return_type == IrType::Void { None } else { Some(self.fresh()) };
        out.push(Instruction::Call {
            dest,
            callee: Callee::Name(name.to_string()),
            args,
            arg_types,
            return_type,
            is_variadic: false,
        });
        dest
    }

    /// Load the value held in a shadow cell. `ty` is the cell's element
    /// type (`i8*` for base/bound/lock cells, `i64` for key cells).
    pub(crate) fn emit_load_cell(
        &mut self,
        out: &mut Vec<Instruction>,
        cell: Value,
        ty: IrType,
    ) -> Value {
        let dest = self.fresh();
        out.push(Instruction::Load { dest, ptr: Operand::Value(cell), ty });
        dest
    }

    /// Load all four metadata values out of their cells, in base, bound,
    /// key, lock order. Returns (base, bound, key, lock) SSA values.
    pub(crate) fn emit_load_metadata(
        &mut self,
        out: &mut Vec<Instruction>,
        meta: Metadata,
    ) -> (Value, Value, Value, Value) {
        let base = self.emit_load_cell(out, meta.base, IrType::i8_ptr());
        let bound = self.emit_load_cell(out, meta.bound, IrType::i8_ptr());
        let key = self.emit_load_cell(out, meta.key, IrType::I64);
        let lock = self.emit_load_cell(out, meta.lock, IrType::i8_ptr());
        (base, bound, key, lock)
    }

    /// Cast a pointer operand to `i8*` for a runtime call.
    pub(crate) fn emit_cast_to_byte_ptr(
        &mut self,
        out: &mut Vec<Instruction>,
        src: Operand,
        from_ty: IrType,
    ) -> Value {
        let dest = self.fresh();
        out.push(Instruction::Cast {
            dest,
            op: CastOp::Bitcast,
            src,
            from_ty,
            to_ty: IrType::i8_ptr(),
        });
        dest
    }

    /// Copy the metadata values held in `from`'s cells into `to`'s cells.
    /// Used when an operand owns planner-allocated cells (it feeds a phi)
    /// but derives its metadata from a parent.
    pub(crate) fn emit_copy_metadata(
        &mut self,
        out: &mut Vec<Instruction>,
        from: Metadata,
        to: Metadata,
    ) {
        let (base, bound, key, lock) = self.emit_load_metadata(out, from);
        out.push(Instruction::Store {
            val: Operand::Value(base),
            ptr: Operand::Value(to.base),
            ty: IrType::i8_ptr(),
        });
        out.push(Instruction::Store {
            val: Operand::Value(bound),
            ptr: Operand::Value(to.bound),
            ty: IrType::i8_ptr(),
        });
        out.push(Instruction::Store {
            val: Operand::Value(key),
            ptr: Operand::Value(to.key),
            ty: IrType::I64,
        });
        out.push(Instruction::Store {
            val: Operand::Value(lock),
            ptr: Operand::Value(to.lock),
            ty: IrType::i8_ptr(),
        });
    }

    // ---- entry prologue and returns ----

    /// Extra prologue at the top of the first original block: acquire the
    /// global lock, create the local stack-frame key, and load the key and
    /// lock values that alloca instrumentation will write into shadow
    /// cells.
    fn emit_entry_prologue(&mut self, out: &mut Vec<Instruction>) {
        let lock = self.emit_call(out, runtime::GET_GLOBAL_LOCK, vec![], vec![], IrType::i8_ptr());
        self.global_lock = lock;

        if let Some(mut frame) = self.frame {
            self.emit_call(
                out,
                runtime::CREATE_STACK_KEY,
                vec![Operand::Value(frame.lock_cell), Operand::Value(frame.key_cell)],
                vec![IrType::i8_ptr().ptr_to(), IrType::I64.ptr_to()],
                IrType::Void,
            );
            let lock_val = self.emit_load_cell(out, frame.lock_cell, IrType::i8_ptr());
            let key_val = self.emit_load_cell(out, frame.key_cell, IrType::I64);
            frame.lock = Some(lock_val);
            frame.key = Some(key_val);
            self.frame = Some(frame);
        }
    }

    /// Returns: store the returned pointer's metadata to shadow-stack slot
    /// 0 (local pointers only), then destroy the stack-frame key so any
    /// escaped stack pointer fails its next temporal check. The terminator
    /// itself is unchanged.
    fn rewrite_terminator(
        &mut self,
        term: &Terminator,
        out: &mut Vec<Instruction>,
    ) -> Result<(), InstrumentError> {
        let Terminator::Return(operand) = term else {
            return Ok(());
        };
        if let Some(Operand::Value(v)) = operand {
            if self.return_type.is_pointer() && !self.return_type.is_function_pointer() {
                let meta = self.returned_metadata(*v)?;
                self.emit_shadow_stack_store(out, meta, 0);
            }
        }
        let frame = self.frame()?;
        if let Some(key) = frame.key {
            self.emit_call(
                out,
                runtime::DESTROY_STACK_KEY,
                vec![Operand::Value(key)],
                vec![IrType::I64],
                IrType::Void,
            );
        }
        Ok(())
    }

    /// Metadata for a returned local pointer: scope tables first, then the
    /// killed-metadata reload from shadow storage, then don't-care with a
    /// diagnostic.
    fn returned_metadata(&mut self, v: Value) -> Result<Metadata, InstrumentError> {
        if let Some((_, meta)) = self.lookup_tables(v)? {
            return Ok(meta);
        }
        if let Ok(meta) = self.storage_for(v) {
            self.diags.record(format!(
                "in `{}`: metadata for returned pointer {} was invalidated; reloading from shadow cells",
                self.func_name, v
            ));
            return Ok(meta);
        }
        self.diags.record(format!(
            "in `{}`: returned pointer {} has no metadata; substituting don't-care",
            self.func_name, v
        ));
        self.dont_care()
    }

    /// Shorthand for an i32 immediate operand (shadow stack indices).
    pub(crate) fn i32_const(value: i64) -> Operand {
        Operand::Const(IrConst::int(IrType::I32, value))
    }

    /// Shorthand for an i64 immediate operand (sizes and keys).
    pub(crate) fn i64_const(value: i64) -> Operand {
        Operand::Const(IrConst::int(IrType::I64, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::{BasicBlock, BlockId, IrBinOp, IrCmpOp};
    use crate::ir::module::{GlobalInit, IrGlobal, IrParam};

    fn i8p() -> IrType {
        IrType::i8_ptr()
    }

    fn ret_void() -> Terminator {
        Terminator::Return(None)
    }

    fn one_block_function(
        name: &str,
        return_type: IrType,
        params: Vec<IrParam>,
        instructions: Vec<Instruction>,
        terminator: Terminator,
    ) -> IrFunction {
        let mut func = IrFunction::new(name, return_type, params, false);
        func.blocks.push(BasicBlock { label: BlockId(0), instructions, terminator });
        func
    }

    fn module_of(func: IrFunction) -> IrModule {
        let mut module = IrModule::new();
        module.functions.push(func);
        module
    }

    fn named_call(
        dest: Option<Value>,
        name: &str,
        args: Vec<(Operand, IrType)>,
        return_type: IrType,
    ) -> Instruction {
        let (args, arg_types) = args.into_iter().unzip();
        Instruction::Call {
            dest,
            callee: Callee::Name(name.to_string()),
            args,
            arg_types,
            return_type,
            is_variadic: false,
        }
    }

    /// The call-target names in one block, in emission order.
    fn call_names(block: &BasicBlock) -> Vec<&str> {
        block
            .instructions
            .iter()
            .filter_map(|inst| match inst {
                Instruction::Call { callee: Callee::Name(name), .. } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Integer constant argument `arg` of the `occurrence`-th call to `name`.
    fn call_int_arg(block: &BasicBlock, name: &str, occurrence: usize, arg: usize) -> Option<i64> {
        block
            .instructions
            .iter()
            .filter_map(|inst| match inst {
                Instruction::Call { callee: Callee::Name(n), args, .. } if n == name => Some(args),
                _ => None,
            })
            .nth(occurrence)?
            .get(arg)?
            .const_int()
    }

    // --- end-to-end scenario 1: use after free ---

    fn use_after_free_module() -> IrModule {
        module_of(one_block_function(
            "f",
            IrType::I32,
            vec![],
            vec![
                Instruction::Alloca {
                    dest: Value(0),
                    ty: i8p(),
                    count: None,
                    count_ty: IrType::I64,
                },
                named_call(
                    Some(Value(1)),
                    "malloc",
                    vec![(Operand::Const(IrConst::i64(10)), IrType::I64)],
                    i8p(),
                ),
                Instruction::Store {
                    val: Operand::Value(Value(1)),
                    ptr: Operand::Value(Value(0)),
                    ty: i8p(),
                },
                named_call(None, "free", vec![(Operand::Value(Value(1)), i8p())], IrType::Void),
                Instruction::Load { dest: Value(2), ptr: Operand::Value(Value(0)), ty: i8p() },
                Instruction::Load { dest: Value(3), ptr: Operand::Value(Value(2)), ty: IrType::I8 },
            ],
            Terminator::Return(Some(Operand::Const(IrConst::i32(0)))),
        ))
    }

    #[test]
    fn test_use_after_free_instrumentation() {
        let mut module = use_after_free_module();
        instrument_module(&mut module, &InstrumentOptions::default()).unwrap();

        let func = module.function("f").unwrap();
        assert_eq!(func.blocks.len(), 2, "prologue + original block");
        let body = &func.blocks[1];

        assert_eq!(
            call_names(body),
            vec![
                runtime::GET_GLOBAL_LOCK,
                runtime::CREATE_STACK_KEY,
                runtime::ALLOCATE_SHADOW_STACK,
                "softboundcets_malloc",
                runtime::LOAD_BASE_SHADOW_STACK,
                runtime::LOAD_BOUND_SHADOW_STACK,
                runtime::LOAD_KEY_SHADOW_STACK,
                runtime::LOAD_LOCK_SHADOW_STACK,
                runtime::DEALLOCATE_SHADOW_STACK,
                runtime::METADATA_STORE,
                runtime::ALLOCATE_SHADOW_STACK,
                runtime::STORE_BASE_SHADOW_STACK,
                runtime::STORE_BOUND_SHADOW_STACK,
                runtime::STORE_KEY_SHADOW_STACK,
                runtime::STORE_LOCK_SHADOW_STACK,
                "softboundcets_free",
                runtime::DEALLOCATE_SHADOW_STACK,
                runtime::METADATA_LOAD,
                runtime::SPATIAL_LOAD_CHECK,
                runtime::TEMPORAL_LOAD_CHECK,
                runtime::DESTROY_STACK_KEY,
            ]
        );

        // malloc has no pointer args: one slot. free has one: two slots.
        assert_eq!(call_int_arg(body, runtime::ALLOCATE_SHADOW_STACK, 0, 0), Some(1));
        assert_eq!(call_int_arg(body, runtime::ALLOCATE_SHADOW_STACK, 1, 0), Some(2));
        // The returned pointer's metadata is read back from slot 0.
        assert_eq!(call_int_arg(body, runtime::LOAD_BASE_SHADOW_STACK, 0, 0), Some(0));
        // free's argument occupies slot 1.
        assert_eq!(call_int_arg(body, runtime::STORE_KEY_SHADOW_STACK, 0, 1), Some(1));
        // The dereference check covers one byte (load i8).
        assert_eq!(call_int_arg(body, runtime::SPATIAL_LOAD_CHECK, 0, 3), Some(1));
    }

    // --- end-to-end scenario 2: out-of-bounds write through a gep ---

    #[test]
    fn test_out_of_bounds_gep_store() {
        let arr = IrType::Array(4, Box::new(IrType::I32));
        let mut module = module_of(one_block_function(
            "g",
            IrType::Void,
            vec![],
            vec![
                Instruction::Alloca {
                    dest: Value(0),
                    ty: arr.clone(),
                    count: None,
                    count_ty: IrType::I64,
                },
                Instruction::Gep {
                    dest: Value(1),
                    base: Operand::Value(Value(0)),
                    base_ty: arr,
                    indices: vec![
                        Operand::Const(IrConst::i64(0)),
                        Operand::Const(IrConst::i64(7)),
                    ],
                },
                Instruction::Store {
                    val: Operand::Const(IrConst::i32(42)),
                    ptr: Operand::Value(Value(1)),
                    ty: IrType::I32,
                },
            ],
            ret_void(),
        ));
        instrument_module(&mut module, &InstrumentOptions::default()).unwrap();

        let body = &module.function("g").unwrap().blocks[1];
        assert_eq!(
            call_names(body),
            vec![
                runtime::GET_GLOBAL_LOCK,
                runtime::CREATE_STACK_KEY,
                runtime::SPATIAL_STORE_CHECK,
                runtime::TEMPORAL_STORE_CHECK,
                runtime::DESTROY_STACK_KEY,
            ]
        );
        // The store touches a 4-byte element.
        assert_eq!(call_int_arg(body, runtime::SPATIAL_STORE_CHECK, 0, 3), Some(4));
        // The alloca's bound is base + 16 bytes, computed with a byte gep.
        assert!(body.instructions.iter().any(|inst| matches!(
            inst,
            Instruction::Gep { base_ty: IrType::I8, indices, .. }
                if indices.len() == 1 && indices[0].const_int() == Some(16)
        )));
    }

    // --- end-to-end scenario 3: stack pointer escapes through return ---

    #[test]
    fn test_returned_stack_pointer_protocol() {
        let mut module = module_of(one_block_function(
            "h",
            IrType::I32.ptr_to(),
            vec![],
            vec![Instruction::Alloca {
                dest: Value(0),
                ty: IrType::I32,
                count: None,
                count_ty: IrType::I64,
            }],
            Terminator::Return(Some(Operand::Value(Value(0)))),
        ));
        instrument_module(&mut module, &InstrumentOptions::default()).unwrap();

        let body = &module.function("h").unwrap().blocks[1];
        // Slot-0 store quadruple, then the stack key is destroyed, then
        // the (unchanged) return.
        assert_eq!(
            call_names(body),
            vec![
                runtime::GET_GLOBAL_LOCK,
                runtime::CREATE_STACK_KEY,
                runtime::STORE_BASE_SHADOW_STACK,
                runtime::STORE_BOUND_SHADOW_STACK,
                runtime::STORE_KEY_SHADOW_STACK,
                runtime::STORE_LOCK_SHADOW_STACK,
                runtime::DESTROY_STACK_KEY,
            ]
        );
        assert_eq!(call_int_arg(body, runtime::STORE_BASE_SHADOW_STACK, 0, 1), Some(0));
        assert_eq!(body.terminator, Terminator::Return(Some(Operand::Value(Value(0)))));
    }

    // --- end-to-end scenario 4: phi of two heap pointers ---

    #[test]
    fn test_phi_parallel_metadata_phis() {
        let mut func = IrFunction::new(
            "p",
            IrType::Void,
            vec![IrParam { value: Value(0), name: "c".to_string(), ty: IrType::I32 }],
            false,
        );
        func.blocks.push(BasicBlock {
            label: BlockId(0),
            instructions: vec![Instruction::Cmp {
                dest: Value(1),
                op: IrCmpOp::Ne,
                lhs: Operand::Value(Value(0)),
                rhs: Operand::Const(IrConst::i32(0)),
                ty: IrType::I32,
            }],
            terminator: Terminator::CondBranch {
                cond: Operand::Value(Value(1)),
                true_label: BlockId(1),
                false_label: BlockId(2),
            },
        });
        func.blocks.push(BasicBlock {
            label: BlockId(1),
            instructions: vec![named_call(
                Some(Value(2)),
                "malloc",
                vec![(Operand::Const(IrConst::i64(8)), IrType::I64)],
                i8p(),
            )],
            terminator: Terminator::Branch(BlockId(3)),
        });
        func.blocks.push(BasicBlock {
            label: BlockId(2),
            instructions: vec![named_call(
                Some(Value(3)),
                "malloc",
                vec![(Operand::Const(IrConst::i64(16)), IrType::I64)],
                i8p(),
            )],
            terminator: Terminator::Branch(BlockId(3)),
        });
        func.blocks.push(BasicBlock {
            label: BlockId(3),
            instructions: vec![Instruction::Phi {
                dest: Value(4),
                ty: i8p(),
                incoming: vec![
                    (Operand::Value(Value(2)), BlockId(1)),
                    (Operand::Value(Value(3)), BlockId(2)),
                ],
            }],
            terminator: ret_void(),
        });
        let mut module = module_of(func);
        instrument_module(&mut module, &InstrumentOptions::default()).unwrap();

        let func = module.function("p").unwrap();
        let merge = &func.blocks[4];
        let phis: Vec<&Instruction> = merge
            .instructions
            .iter()
            .filter(|inst| matches!(inst, Instruction::Phi { .. }))
            .collect();
        assert_eq!(phis.len(), 5, "original phi plus base/bound/key/lock phis");
        // The original pointer phi comes first, then the four parallel
        // metadata phis over shadow cell addresses.
        let ptr_cell = i8p().ptr_to();
        let expect_types = [
            i8p(),
            ptr_cell.clone(),
            ptr_cell.clone(),
            IrType::I64.ptr_to(),
            ptr_cell,
        ];
        for (phi, want) in phis.iter().zip(&expect_types) {
            let Instruction::Phi { ty, incoming, .. } = phi else { unreachable!() };
            assert_eq!(ty, want);
            assert_eq!(incoming.len(), 2);
            assert_eq!(incoming[0].1, BlockId(1));
            assert_eq!(incoming[1].1, BlockId(2));
        }
        // Each metadata phi merges two distinct predecessor cell sets.
        let Instruction::Phi { incoming, .. } = phis[1] else { unreachable!() };
        assert_ne!(incoming[0].0, incoming[1].0);
    }

    // --- end-to-end scenario 5: select between pointers ---

    #[test]
    fn test_select_merges_metadata() {
        let mut module = module_of(one_block_function(
            "s",
            IrType::Void,
            vec![IrParam { value: Value(0), name: "c".to_string(), ty: IrType::I1 }],
            vec![
                Instruction::Alloca {
                    dest: Value(1),
                    ty: IrType::I32,
                    count: None,
                    count_ty: IrType::I64,
                },
                Instruction::Alloca {
                    dest: Value(2),
                    ty: IrType::I32,
                    count: None,
                    count_ty: IrType::I64,
                },
                Instruction::Select {
                    dest: Value(3),
                    cond: Operand::Value(Value(0)),
                    true_val: Operand::Value(Value(1)),
                    false_val: Operand::Value(Value(2)),
                    ty: IrType::I32.ptr_to(),
                },
            ],
            ret_void(),
        ));
        instrument_module(&mut module, &InstrumentOptions::default()).unwrap();

        let body = &module.function("s").unwrap().blocks[1];
        let selects: Vec<&Instruction> = body
            .instructions
            .iter()
            .filter(|inst| matches!(inst, Instruction::Select { .. }))
            .collect();
        assert_eq!(selects.len(), 5, "original select plus four metadata selects");
        let ptr_cell = i8p().ptr_to();
        let expect_types =
            [IrType::I32.ptr_to(), ptr_cell.clone(), ptr_cell.clone(), IrType::I64.ptr_to(), ptr_cell];
        for (select, want) in selects.iter().zip(&expect_types) {
            let Instruction::Select { ty, cond, .. } = select else { unreachable!() };
            assert_eq!(ty, want);
            assert_eq!(cond, &Operand::Value(Value(0)), "same condition on every select");
        }
    }

    // --- end-to-end scenario 6: bitcast chain ---

    fn bitcast_chain_module() -> IrModule {
        module_of(one_block_function(
            "b",
            IrType::Void,
            vec![],
            vec![
                Instruction::Alloca {
                    dest: Value(0),
                    ty: IrType::I64,
                    count: None,
                    count_ty: IrType::I64,
                },
                Instruction::Cast {
                    dest: Value(1),
                    op: CastOp::Bitcast,
                    src: Operand::Value(Value(0)),
                    from_ty: IrType::I64.ptr_to(),
                    to_ty: IrType::I32.ptr_to(),
                },
                Instruction::Load {
                    dest: Value(2),
                    ptr: Operand::Value(Value(1)),
                    ty: IrType::I32,
                },
            ],
            ret_void(),
        ))
    }

    #[test]
    fn test_bitcast_shares_parent_metadata() {
        let mut module = bitcast_chain_module();
        instrument_module(&mut module, &InstrumentOptions::default()).unwrap();

        let body = &module.function("b").unwrap().blocks[1];
        assert_eq!(
            call_names(body),
            vec![
                runtime::GET_GLOBAL_LOCK,
                runtime::CREATE_STACK_KEY,
                runtime::SPATIAL_LOAD_CHECK,
                runtime::TEMPORAL_LOAD_CHECK,
                runtime::DESTROY_STACK_KEY,
            ]
        );
        // The check width is the bitcast target's pointee size, not the
        // allocation's.
        assert_eq!(call_int_arg(body, runtime::SPATIAL_LOAD_CHECK, 0, 3), Some(4));
    }

    #[test]
    fn test_bitcast_flag_disables_propagation() {
        let mut module = bitcast_chain_module();
        let opts = InstrumentOptions { instrument_bitcast: false, ..Default::default() };
        let mut diags = DiagnosticLog::new();
        instrument_module_with_log(&mut module, &opts, &mut diags).unwrap();

        // Without propagation the load address is an unrecognised local:
        // checks still run, but against don't-care metadata, and the
        // unsupported shape is diagnosed.
        let body = &module.function("b").unwrap().blocks[1];
        assert!(call_names(body).contains(&runtime::SPATIAL_LOAD_CHECK));
        assert!(diags.entries().iter().any(|d| d.contains("unrecognised local pointer")));
    }

    // --- boundary behaviors ---

    #[test]
    fn test_empty_and_variadic_functions_untouched() {
        let mut empty = IrFunction::new("empty", IrType::Void, vec![], false);
        empty.is_declaration = true;
        let mut variadic = one_block_function("printf_like", IrType::I32, vec![], vec![], ret_void());
        variadic.is_variadic = true;

        let mut module = IrModule::new();
        module.functions.push(empty);
        module.functions.push(variadic);
        instrument_module(&mut module, &InstrumentOptions::default()).unwrap();

        assert!(module.function("empty").unwrap().blocks.is_empty());
        let variadic = module.function("printf_like").unwrap();
        assert_eq!(variadic.blocks.len(), 1, "no prologue was added");
        assert!(variadic.blocks[0].instructions.is_empty());
    }

    #[test]
    fn test_ignored_and_computed_call_targets_untouched() {
        let memcpy = named_call(
            None,
            "llvm.memcpy.p0i8.p0i8.i64",
            vec![
                (Operand::Value(Value(0)), i8p()),
                (Operand::Value(Value(1)), i8p()),
                (Operand::Const(IrConst::i64(4)), IrType::I64),
            ],
            IrType::Void,
        );
        let indirect = Instruction::Call {
            dest: None,
            callee: Callee::Indirect(Operand::Value(Value(2))),
            args: vec![],
            arg_types: vec![],
            return_type: IrType::Void,
            is_variadic: false,
        };
        let variadic_call = Instruction::Call {
            dest: Some(Value(3)),
            callee: Callee::Name("printf".to_string()),
            args: vec![(Operand::Value(Value(0)))],
            arg_types: vec![i8p()],
            return_type: IrType::I32,
            is_variadic: true,
        };
        let mut module = module_of(one_block_function(
            "caller",
            IrType::Void,
            vec![
                IrParam { value: Value(0), name: "a".to_string(), ty: i8p() },
                IrParam { value: Value(1), name: "b".to_string(), ty: i8p() },
                IrParam {
                    value: Value(2),
                    name: "fp".to_string(),
                    ty: IrType::Func { ret: Box::new(IrType::Void), params: vec![], variadic: false }
                        .ptr_to(),
                },
            ],
            vec![memcpy, indirect, variadic_call],
            ret_void(),
        ));
        instrument_module(&mut module, &InstrumentOptions::default()).unwrap();

        let body = &module.function("caller").unwrap().blocks[1];
        // No shadow-stack traffic around any of the three calls.
        assert_eq!(
            call_names(body),
            vec![
                runtime::GET_GLOBAL_LOCK,
                runtime::CREATE_STACK_KEY,
                "llvm.memcpy.p0i8.p0i8.i64",
                "printf",
                runtime::DESTROY_STACK_KEY,
            ]
        );
    }

    #[test]
    fn test_blacklisted_function_untouched() {
        let func = one_block_function(
            "trusted",
            IrType::Void,
            vec![],
            vec![Instruction::Alloca {
                dest: Value(0),
                ty: IrType::I32,
                count: None,
                count_ty: IrType::I64,
            }],
            ret_void(),
        );
        let before = func.blocks.clone();
        let mut module = module_of(func);
        let mut opts = InstrumentOptions::default();
        opts.blacklist.insert("trusted".to_string());
        instrument_module(&mut module, &opts).unwrap();
        assert_eq!(module.function("trusted").unwrap().blocks, before);
    }

    #[test]
    fn test_wrapper_definition_untouched() {
        let func = one_block_function(
            "malloc",
            i8p(),
            vec![IrParam { value: Value(0), name: "n".to_string(), ty: IrType::I64 }],
            vec![],
            Terminator::Return(Some(Operand::Const(IrConst::null_ptr(IrType::I8)))),
        );
        let before = func.blocks.clone();
        let mut module = module_of(func);
        instrument_module(&mut module, &InstrumentOptions::default()).unwrap();
        assert_eq!(module.function("malloc").unwrap().blocks, before);
    }

    #[test]
    fn test_main_is_renamed_and_instrumented() {
        let mut module = module_of(one_block_function(
            "main",
            IrType::I32,
            vec![],
            vec![],
            Terminator::Return(Some(Operand::Const(IrConst::i32(0)))),
        ));
        instrument_module(&mut module, &InstrumentOptions::default()).unwrap();

        assert!(module.function("main").is_none());
        let renamed = module.function(runtime::RENAMED_MAIN).unwrap();
        assert_eq!(renamed.blocks.len(), 2, "renamed main still gets a prologue");
    }

    #[test]
    fn test_alloca_count_is_sign_extended() {
        let mut module = module_of(one_block_function(
            "t",
            IrType::Void,
            vec![IrParam { value: Value(0), name: "n".to_string(), ty: IrType::I32 }],
            vec![Instruction::Alloca {
                dest: Value(1),
                ty: IrType::I32,
                count: Some(Operand::Value(Value(0))),
                count_ty: IrType::I32,
            }],
            ret_void(),
        ));
        instrument_module(&mut module, &InstrumentOptions::default()).unwrap();

        let body = &module.function("t").unwrap().blocks[1];
        assert!(body.instructions.iter().any(|inst| matches!(
            inst,
            Instruction::Cast { op: CastOp::Sext, from_ty: IrType::I32, to_ty: IrType::I64, .. }
        )));
        assert!(body.instructions.iter().any(|inst| matches!(
            inst,
            Instruction::BinOp { op: IrBinOp::Mul, rhs, ty: IrType::I64, .. }
                if rhs.const_int() == Some(4)
        )));
    }

    #[test]
    fn test_pointer_parameter_metadata_loaded_in_prologue() {
        let mut module = module_of(one_block_function(
            "q",
            IrType::I32,
            vec![IrParam { value: Value(0), name: "p".to_string(), ty: IrType::I32.ptr_to() }],
            vec![Instruction::Load {
                dest: Value(1),
                ptr: Operand::Value(Value(0)),
                ty: IrType::I32,
            }],
            Terminator::Return(Some(Operand::Value(Value(1)))),
        ));
        instrument_module(&mut module, &InstrumentOptions::default()).unwrap();

        let func = module.function("q").unwrap();
        let prologue = &func.blocks[0];
        assert_eq!(
            call_names(prologue),
            vec![
                runtime::LOAD_BASE_SHADOW_STACK,
                runtime::LOAD_BOUND_SHADOW_STACK,
                runtime::LOAD_KEY_SHADOW_STACK,
                runtime::LOAD_LOCK_SHADOW_STACK,
            ]
        );
        // Parameter slots start at 1; slot 0 belongs to the return value.
        assert_eq!(call_int_arg(prologue, runtime::LOAD_BASE_SHADOW_STACK, 0, 0), Some(1));
        assert!(matches!(prologue.terminator, Terminator::Branch(_)));

        // Dereferencing the parameter is checked against its metadata.
        let body = &func.blocks[1];
        assert_eq!(
            call_names(body),
            vec![
                runtime::GET_GLOBAL_LOCK,
                runtime::CREATE_STACK_KEY,
                runtime::SPATIAL_LOAD_CHECK,
                runtime::TEMPORAL_LOAD_CHECK,
                runtime::DESTROY_STACK_KEY,
            ]
        );
    }

    #[test]
    fn test_safe_global_elides_checks() {
        let mut module = IrModule::new();
        module.globals.push(IrGlobal::new("g", IrType::I32, Some(GlobalInit::Zero)));
        module.globals.push(IrGlobal::new("h", IrType::I32, None));
        module.functions.push(one_block_function(
            "r",
            IrType::Void,
            vec![],
            vec![
                Instruction::Load {
                    dest: Value(0),
                    ptr: Operand::Const(IrConst::global("g", IrType::I32)),
                    ty: IrType::I32,
                },
                Instruction::Load {
                    dest: Value(1),
                    ptr: Operand::Const(IrConst::global("h", IrType::I32)),
                    ty: IrType::I32,
                },
            ],
            ret_void(),
        ));
        let mut diags = DiagnosticLog::new();
        instrument_module_with_log(&mut module, &InstrumentOptions::default(), &mut diags)
            .unwrap();

        // The initialized global is safe (no checks); the extern one is an
        // unsupported shape and is checked against don't-care metadata.
        let body = &module.function("r").unwrap().blocks[1];
        assert_eq!(
            call_names(body),
            vec![
                runtime::GET_GLOBAL_LOCK,
                runtime::CREATE_STACK_KEY,
                runtime::SPATIAL_LOAD_CHECK,
                runtime::TEMPORAL_LOAD_CHECK,
                runtime::DESTROY_STACK_KEY,
            ]
        );
        assert!(diags.entries().iter().any(|d| d.contains("@h")));
        assert!(!diags.entries().iter().any(|d| d.contains("@g")));
    }

    #[test]
    fn test_killed_metadata_reload_diagnostic() {
        let mut module = module_of(one_block_function(
            "k",
            IrType::Void,
            vec![],
            vec![
                named_call(
                    Some(Value(0)),
                    "malloc",
                    vec![(Operand::Const(IrConst::i64(8)), IrType::I64)],
                    i8p(),
                ),
                named_call(None, "free", vec![(Operand::Value(Value(0)), i8p())], IrType::Void),
                // The second use of %0 comes after its metadata was
                // invalidated by the first call; it is reloaded from the
                // shadow cells with a diagnostic.
                named_call(None, "use_ptr", vec![(Operand::Value(Value(0)), i8p())], IrType::Void),
            ],
            ret_void(),
        ));
        let mut diags = DiagnosticLog::new();
        instrument_module_with_log(&mut module, &InstrumentOptions::default(), &mut diags)
            .unwrap();
        assert!(diags.entries().iter().any(|d| d.contains("invalidated")));
    }

    #[test]
    fn test_disabled_load_instrumentation() {
        let mut module = bitcast_chain_module();
        let opts = InstrumentOptions { instrument_load: false, ..Default::default() };
        instrument_module(&mut module, &opts).unwrap();

        let body = &module.function("b").unwrap().blocks[1];
        assert_eq!(
            call_names(body),
            vec![runtime::GET_GLOBAL_LOCK, runtime::CREATE_STACK_KEY, runtime::DESTROY_STACK_KEY]
        );
    }

    #[test]
    fn test_runtime_declarations_present() {
        let mut module = use_after_free_module();
        instrument_module(&mut module, &InstrumentOptions::default()).unwrap();
        for name in [
            runtime::GET_GLOBAL_LOCK,
            runtime::SPATIAL_LOAD_CHECK,
            runtime::TEMPORAL_STORE_CHECK,
            runtime::CREATE_STACK_KEY,
            "softboundcets_malloc",
            "softboundcets_free",
        ] {
            let decl = module.function(name).unwrap_or_else(|| panic!("missing {}", name));
            assert!(decl.is_declaration);
        }
    }

    #[test]
    fn test_instrumentation_is_deterministic() {
        let mut first = use_after_free_module();
        let mut second = use_after_free_module();
        instrument_module(&mut first, &InstrumentOptions::default()).unwrap();
        instrument_module(&mut second, &InstrumentOptions::default()).unwrap();
        assert_eq!(first.function("f").unwrap().blocks, second.function("f").unwrap().blocks);
    }
}
