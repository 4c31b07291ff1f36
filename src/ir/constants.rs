//! IR constants.
//!
//! Constants are typed, and the pointer-shaped ones matter to the
//! instrumentation pass: a `Global` is the address of a module-level symbol
//! (safe when the symbol is a tracked global), while `Null` and `Undef`
//! pointers are unsupported shapes that degrade to don't-care metadata.

use crate::common::types::IrType;

/// A typed IR constant.
#[derive(Debug, Clone, PartialEq)]
pub enum IrConst {
    /// Integer constant of the given integer type.
    Int { ty: IrType, value: i64 },
    /// Floating-point constant of the given float type.
    Float { ty: IrType, value: f64 },
    /// Typed null pointer.
    Null(IrType),
    /// Undefined value of the given type.
    Undef(IrType),
    /// The address of a global or function symbol. `ty` is the pointer type
    /// of that address (pointer to the symbol's value type).
    Global { name: String, ty: IrType },
}

impl IrConst {
    pub fn int(ty: IrType, value: i64) -> IrConst {
        IrConst::Int { ty, value }
    }

    pub fn i32(value: i64) -> IrConst {
        IrConst::Int { ty: IrType::I32, value }
    }

    pub fn i64(value: i64) -> IrConst {
        IrConst::Int { ty: IrType::I64, value }
    }

    /// Null pointer of type `pointee*`.
    pub fn null_ptr(pointee: IrType) -> IrConst {
        IrConst::Null(pointee.ptr_to())
    }

    /// Address of the global `name` whose value type is `pointee`.
    pub fn global(name: impl Into<String>, pointee: IrType) -> IrConst {
        IrConst::Global { name: name.into(), ty: pointee.ptr_to() }
    }

    /// The type of this constant.
    pub fn ty(&self) -> &IrType {
        match self {
            IrConst::Int { ty, .. } | IrConst::Float { ty, .. } => ty,
            IrConst::Null(ty) | IrConst::Undef(ty) => ty,
            IrConst::Global { ty, .. } => ty,
        }
    }

    pub fn is_pointer(&self) -> bool {
        self.ty().is_pointer()
    }

    /// Integer payload, if this is an integer constant.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            IrConst::Int { value, .. } => Some(*value),
            _ => None,
        }
    }
}

impl std::fmt::Display for IrConst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IrConst::Int { value, .. } => write!(f, "{}", value),
            IrConst::Float { value, .. } => write!(f, "{}", value),
            IrConst::Null(_) => write!(f, "null"),
            IrConst::Undef(_) => write!(f, "undef"),
            IrConst::Global { name, .. } => write!(f, "@{}", name),
        }
    }
}
