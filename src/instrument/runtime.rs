//! Runtime API binding.
//!
//! The instrumented code calls into a runtime library that owns the shadow
//! stack, the in-memory metadata table, and the check primitives. This
//! module is the single place that knows the runtime's symbol names and
//! prototypes; everything else refers to them through the constants below.
//!
//! Conventions shared by all prototypes: addresses are `i8*`, shadow-stack
//! slot indices are `i32`, sizes and keys are `i64`, and metadata
//! out-parameters are pointers to the caller's shadow cells (`i8**` for
//! base/bound/lock, `i64*` for key).

use crate::common::types::IrType;
use crate::ir::module::{IrFunction, IrModule};

pub const GET_GLOBAL_LOCK: &str = "__softboundcets_get_global_lock";

pub const METADATA_LOAD: &str = "__softboundcets_metadata_load";
pub const METADATA_STORE: &str = "__softboundcets_metadata_store";
pub const METADATA_CHECK: &str = "__softboundcets_metadata_check";

pub const LOAD_BASE_SHADOW_STACK: &str = "__softboundcets_load_base_shadow_stack";
pub const LOAD_BOUND_SHADOW_STACK: &str = "__softboundcets_load_bound_shadow_stack";
pub const LOAD_KEY_SHADOW_STACK: &str = "__softboundcets_load_key_shadow_stack";
pub const LOAD_LOCK_SHADOW_STACK: &str = "__softboundcets_load_lock_shadow_stack";

pub const STORE_BASE_SHADOW_STACK: &str = "__softboundcets_store_base_shadow_stack";
pub const STORE_BOUND_SHADOW_STACK: &str = "__softboundcets_store_bound_shadow_stack";
pub const STORE_KEY_SHADOW_STACK: &str = "__softboundcets_store_key_shadow_stack";
pub const STORE_LOCK_SHADOW_STACK: &str = "__softboundcets_store_lock_shadow_stack";

pub const ALLOCATE_SHADOW_STACK: &str = "__softboundcets_allocate_shadow_stack_space";
pub const DEALLOCATE_SHADOW_STACK: &str = "__softboundcets_deallocate_shadow_stack_space";

pub const SPATIAL_LOAD_CHECK: &str = "__softboundcets_spatial_load_dereference_check";
pub const SPATIAL_STORE_CHECK: &str = "__softboundcets_spatial_store_dereference_check";
pub const TEMPORAL_LOAD_CHECK: &str = "__softboundcets_temporal_load_dereference_check";
pub const TEMPORAL_STORE_CHECK: &str = "__softboundcets_temporal_store_dereference_check";

pub const CREATE_STACK_KEY: &str = "__softboundcets_create_stack_key";
pub const DESTROY_STACK_KEY: &str = "__softboundcets_destroy_stack_key";

/// The symbol user `main` is renamed to; the runtime provides the real
/// `main`, initialises itself, and then calls this.
pub const RENAMED_MAIN: &str = "softboundcets_main";

/// The standard-library functions the runtime wraps, and the wrapper each
/// call site is redirected to.
const WRAPPED: [(&str, &str); 4] = [
    ("calloc", "softboundcets_calloc"),
    ("malloc", "softboundcets_malloc"),
    ("realloc", "softboundcets_realloc"),
    ("free", "softboundcets_free"),
];

/// The wrapper symbol for a stdlib function, if the runtime provides one.
pub fn wrapper_for(name: &str) -> Option<&'static str> {
    WRAPPED.iter().find(|(from, _)| *from == name).map(|(_, to)| *to)
}

/// Functions the pass must leave untouched: the runtime's own symbols,
/// glibc's isoc99 aliases, and compiler intrinsics.
pub fn is_ignored_name(name: &str) -> bool {
    name.contains("__softboundcets") || name.contains("isoc99") || name.contains("llvm.")
}

/// The full prototype table: (name, return type, parameter types).
/// None of the runtime functions is variadic.
pub fn declarations() -> Vec<(&'static str, IrType, Vec<IrType>)> {
    let byte_ptr = IrType::i8_ptr;
    // Cell pointer types: where the runtime writes metadata back.
    let base_cell = || IrType::i8_ptr().ptr_to();
    let key_cell = || IrType::I64.ptr_to();

    vec![
        (GET_GLOBAL_LOCK, byte_ptr(), vec![]),
        (
            METADATA_LOAD,
            IrType::Void,
            vec![byte_ptr(), base_cell(), base_cell(), key_cell(), base_cell()],
        ),
        (
            METADATA_STORE,
            IrType::Void,
            vec![byte_ptr(), byte_ptr(), byte_ptr(), IrType::I64, byte_ptr()],
        ),
        (
            METADATA_CHECK,
            IrType::Void,
            vec![base_cell(), base_cell(), key_cell(), base_cell()],
        ),
        (LOAD_BASE_SHADOW_STACK, byte_ptr(), vec![IrType::I32]),
        (LOAD_BOUND_SHADOW_STACK, byte_ptr(), vec![IrType::I32]),
        (LOAD_KEY_SHADOW_STACK, IrType::I64, vec![IrType::I32]),
        (LOAD_LOCK_SHADOW_STACK, byte_ptr(), vec![IrType::I32]),
        (STORE_BASE_SHADOW_STACK, IrType::Void, vec![byte_ptr(), IrType::I32]),
        (STORE_BOUND_SHADOW_STACK, IrType::Void, vec![byte_ptr(), IrType::I32]),
        (STORE_KEY_SHADOW_STACK, IrType::Void, vec![IrType::I64, IrType::I32]),
        (STORE_LOCK_SHADOW_STACK, IrType::Void, vec![byte_ptr(), IrType::I32]),
        (ALLOCATE_SHADOW_STACK, IrType::Void, vec![IrType::I32]),
        (DEALLOCATE_SHADOW_STACK, IrType::Void, vec![]),
        (
            SPATIAL_LOAD_CHECK,
            IrType::Void,
            vec![byte_ptr(), byte_ptr(), byte_ptr(), IrType::I64],
        ),
        (
            SPATIAL_STORE_CHECK,
            IrType::Void,
            vec![byte_ptr(), byte_ptr(), byte_ptr(), IrType::I64],
        ),
        (TEMPORAL_LOAD_CHECK, IrType::Void, vec![byte_ptr(), IrType::I64]),
        (TEMPORAL_STORE_CHECK, IrType::Void, vec![byte_ptr(), IrType::I64]),
        (CREATE_STACK_KEY, IrType::Void, vec![base_cell(), key_cell()]),
        (DESTROY_STACK_KEY, IrType::Void, vec![IrType::I64]),
    ]
}

/// Prototypes for the stdlib wrappers themselves. Wrappers keep the shape
/// of the function they wrap.
fn wrapper_declarations() -> Vec<(&'static str, IrType, Vec<IrType>)> {
    vec![
        ("softboundcets_calloc", IrType::i8_ptr(), vec![IrType::I64, IrType::I64]),
        ("softboundcets_malloc", IrType::i8_ptr(), vec![IrType::I64]),
        ("softboundcets_realloc", IrType::i8_ptr(), vec![IrType::i8_ptr(), IrType::I64]),
        ("softboundcets_free", IrType::Void, vec![IrType::i8_ptr()]),
    ]
}

/// Append external declarations for the runtime API and the stdlib
/// wrappers to `module`, skipping names that are already present.
pub fn declare_in(module: &mut IrModule) {
    for (name, ret, params) in declarations().into_iter().chain(wrapper_declarations()) {
        if module.functions.iter().any(|f| f.name == name) {
            continue;
        }
        module.functions.push(IrFunction::declaration(name, ret, params, false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapper_table() {
        assert_eq!(wrapper_for("malloc"), Some("softboundcets_malloc"));
        assert_eq!(wrapper_for("free"), Some("softboundcets_free"));
        assert_eq!(wrapper_for("memcpy"), None);
    }

    #[test]
    fn test_ignored_names() {
        assert!(is_ignored_name("__softboundcets_metadata_load"));
        assert!(is_ignored_name("__isoc99_scanf"));
        assert!(is_ignored_name("llvm.memcpy.p0i8.p0i8.i64"));
        assert!(!is_ignored_name("main"));
        assert!(!is_ignored_name("softbound"));
    }

    #[test]
    fn test_declare_in_is_idempotent() {
        let mut module = IrModule::new();
        declare_in(&mut module);
        let count = module.functions.len();
        assert!(count >= declarations().len());
        declare_in(&mut module);
        assert_eq!(module.functions.len(), count);
        // Every declaration is a body-less extern.
        assert!(module.functions.iter().all(|f| f.is_declaration));
    }
}
