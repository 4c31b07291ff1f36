//! IR module, function, and global variable definitions.
//!
//! `IrModule` is the top-level compilation unit containing functions and
//! globals. `IrFunction` represents a single function with its parameter
//! list and basic blocks; blocks[0] is the entry block.

use crate::common::types::IrType;
use super::constants::IrConst;
use super::instruction::{BasicBlock, BlockId, Value};

/// A compilation unit in the IR.
#[derive(Debug, Default)]
pub struct IrModule {
    pub functions: Vec<IrFunction>,
    pub globals: Vec<IrGlobal>,
}

impl IrModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a function by name.
    pub fn function(&self, name: &str) -> Option<&IrFunction> {
        self.functions.iter().find(|f| f.name == name)
    }
}

/// A global variable.
#[derive(Debug, Clone)]
pub struct IrGlobal {
    pub name: String,
    pub ty: IrType,
    /// Initializer, or None for an uninitialised (extern) global.
    pub init: Option<GlobalInit>,
    /// ELF section override, when present (e.g. "llvm.metadata").
    pub section: Option<String>,
    /// Alignment in bytes.
    pub align: u64,
}

impl IrGlobal {
    pub fn new(name: impl Into<String>, ty: IrType, init: Option<GlobalInit>) -> Self {
        let align = ty.align();
        IrGlobal { name: name.into(), ty, init, section: None, align }
    }
}

/// Initializer for a global variable.
#[derive(Debug, Clone)]
pub enum GlobalInit {
    /// Zero-initialized storage.
    Zero,
    /// Single scalar constant.
    Scalar(IrConst),
    /// Compound initializer for arrays and structs.
    Aggregate(Vec<GlobalInit>),
}

/// An IR function.
#[derive(Debug)]
pub struct IrFunction {
    pub name: String,
    pub return_type: IrType,
    pub params: Vec<IrParam>,
    pub blocks: Vec<BasicBlock>,
    pub is_variadic: bool,
    /// True if no body (extern declaration).
    pub is_declaration: bool,
    /// First unused Value ID; all Value IDs in this function are below it.
    /// Kept current so passes can mint fresh values without a full scan.
    pub next_value_id: u32,
    /// First unused BlockId, maintained the same way.
    pub next_block_id: u32,
}

/// A function parameter: an SSA value with a name and a type.
#[derive(Debug, Clone)]
pub struct IrParam {
    pub value: Value,
    pub name: String,
    pub ty: IrType,
}

impl IrFunction {
    pub fn new(
        name: impl Into<String>,
        return_type: IrType,
        params: Vec<IrParam>,
        is_variadic: bool,
    ) -> Self {
        let next_value_id = params.iter().map(|p| p.value.0 + 1).max().unwrap_or(0);
        IrFunction {
            name: name.into(),
            return_type,
            params,
            blocks: Vec::new(),
            is_variadic,
            is_declaration: false,
            next_value_id,
            next_block_id: 0,
        }
    }

    /// Build an external declaration with the given prototype. Parameter
    /// values are positional placeholders; declarations have no body.
    pub fn declaration(
        name: impl Into<String>,
        return_type: IrType,
        param_types: Vec<IrType>,
        is_variadic: bool,
    ) -> Self {
        let params = param_types
            .into_iter()
            .enumerate()
            .map(|(i, ty)| IrParam { value: Value(i as u32), name: format!("arg{}", i), ty })
            .collect();
        let mut f = IrFunction::new(name, return_type, params, is_variadic);
        f.is_declaration = true;
        f
    }

    /// Mint a fresh SSA value.
    pub fn fresh_value(&mut self) -> Value {
        let v = Value(self.next_value_id);
        self.next_value_id += 1;
        v
    }

    /// Mint a fresh block id.
    pub fn fresh_block(&mut self) -> BlockId {
        let b = BlockId(self.next_block_id);
        self.next_block_id += 1;
        b
    }

    /// Recompute the fresh-id counters by scanning the body. Used after
    /// constructing a function by hand, where the counters were not
    /// maintained incrementally.
    pub fn recompute_id_caches(&mut self) {
        let mut max_value = self.params.iter().map(|p| p.value.0 + 1).max().unwrap_or(0);
        let mut max_block = 0;
        for block in &self.blocks {
            max_block = max_block.max(block.label.0 + 1);
            for inst in &block.instructions {
                if let Some(v) = inst.dest() {
                    max_value = max_value.max(v.0 + 1);
                }
            }
        }
        self.next_value_id = max_value;
        self.next_block_id = max_block;
    }
}
