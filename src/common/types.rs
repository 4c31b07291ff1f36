//! The IR type system.
//!
//! Types form a tree: scalars at the leaves, with pointers, arrays, structs,
//! and function types as interior nodes. The instrumentation pass needs the
//! full tree (not just a scalar kind) because it must answer three questions
//! about any pointer-typed operand:
//!
//! 1. What is the referent (pointee) type, and how many bytes does a
//!    dereference touch? (spatial check sizes)
//! 2. Is this a pointer to a function? (function pointers are never tracked)
//! 3. What referent does a GEP index chain land on? (metadata propagation
//!    through aggregate indexing)

use crate::ir::instruction::Operand;

/// An IR type. Pointers are typed (a pointer always knows its pointee).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrType {
    Void,
    I1,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// Pointer to the contained type.
    Ptr(Box<IrType>),
    /// Fixed-length array: element count and element type.
    Array(u64, Box<IrType>),
    /// Struct with the given field types, laid out with natural alignment.
    Struct(Vec<IrType>),
    /// Function type. Only ever observed behind a `Ptr`.
    Func {
        ret: Box<IrType>,
        params: Vec<IrType>,
        variadic: bool,
    },
}

impl IrType {
    /// Shorthand for the untyped byte pointer `i8*` used by every runtime
    /// call that takes an address.
    pub fn i8_ptr() -> IrType {
        IrType::Ptr(Box::new(IrType::I8))
    }

    /// Wrap this type in a pointer.
    pub fn ptr_to(self) -> IrType {
        IrType::Ptr(Box::new(self))
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, IrType::Ptr(_))
    }

    /// The pointee type, if this is a pointer.
    pub fn pointee(&self) -> Option<&IrType> {
        match self {
            IrType::Ptr(inner) => Some(inner),
            _ => None,
        }
    }

    /// True for pointers whose pointee is a function type. These are call
    /// targets, not data pointers, and carry no bounds metadata.
    pub fn is_function_pointer(&self) -> bool {
        matches!(self.pointee(), Some(IrType::Func { .. }))
    }

    /// Byte size of a value of this type (the 64-bit size query used for
    /// dereference check widths and alloca bound computation).
    /// Void and function types occupy no storage.
    pub fn size(&self) -> u64 {
        match self {
            IrType::Void | IrType::Func { .. } => 0,
            IrType::I1 | IrType::I8 => 1,
            IrType::I16 => 2,
            IrType::I32 | IrType::F32 => 4,
            IrType::I64 | IrType::F64 | IrType::Ptr(_) => 8,
            IrType::Array(n, elem) => n * elem.size(),
            IrType::Struct(fields) => {
                let mut offset = 0u64;
                for field in fields {
                    offset = align_up(offset, field.align()) + field.size();
                }
                align_up(offset, self.align())
            }
        }
    }

    /// Natural alignment of a value of this type, in bytes.
    pub fn align(&self) -> u64 {
        match self {
            IrType::Void | IrType::Func { .. } => 1,
            IrType::I1 | IrType::I8 => 1,
            IrType::I16 => 2,
            IrType::I32 | IrType::F32 => 4,
            IrType::I64 | IrType::F64 | IrType::Ptr(_) => 8,
            IrType::Array(_, elem) => elem.align(),
            IrType::Struct(fields) => fields.iter().map(|f| f.align()).max().unwrap_or(1),
        }
    }

    /// Compute the referent type a GEP lands on, starting from this type as
    /// the pointee of the GEP base.
    ///
    /// The first index steps within the pointee and does not change the
    /// type; each further index selects an array element or a struct field.
    /// Struct field selection requires an integer constant index. Returns
    /// `None` when the chain indexes into a non-aggregate or a struct field
    /// cannot be resolved; callers treat that as an unsupported construct.
    pub fn indexed(&self, indices: &[Operand]) -> Option<IrType> {
        if indices.is_empty() {
            return None;
        }
        let mut ty = self.clone();
        for idx in &indices[1..] {
            ty = match ty {
                IrType::Array(_, elem) => *elem,
                IrType::Struct(fields) => {
                    let field = idx.const_int()? as usize;
                    fields.get(field)?.clone()
                }
                _ => return None,
            };
        }
        Some(ty)
    }
}

/// Round `value` up to the next multiple of `align` (which must be nonzero).
pub fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

impl std::fmt::Display for IrType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IrType::Void => write!(f, "void"),
            IrType::I1 => write!(f, "i1"),
            IrType::I8 => write!(f, "i8"),
            IrType::I16 => write!(f, "i16"),
            IrType::I32 => write!(f, "i32"),
            IrType::I64 => write!(f, "i64"),
            IrType::F32 => write!(f, "f32"),
            IrType::F64 => write!(f, "f64"),
            IrType::Ptr(inner) => write!(f, "{}*", inner),
            IrType::Array(n, elem) => write!(f, "[{} x {}]", n, elem),
            IrType::Struct(fields) => {
                write!(f, "{{ ")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, " }}")
            }
            IrType::Func { ret, params, variadic } => {
                write!(f, "{} (", ret)?;
                for (i, param) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", param)?;
                }
                if *variadic {
                    if !params.is_empty() {
                        write!(f, ", ")?;
                    }
                    write!(f, "...")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::constants::IrConst;
    use crate::ir::instruction::Value;

    #[test]
    fn test_scalar_sizes() {
        assert_eq!(IrType::I8.size(), 1);
        assert_eq!(IrType::I32.size(), 4);
        assert_eq!(IrType::i8_ptr().size(), 8);
        assert_eq!(IrType::Array(4, Box::new(IrType::I32)).size(), 16);
    }

    #[test]
    fn test_struct_layout_padding() {
        // { i8, i32 } pads the first field to 4-byte alignment: size 8.
        let ty = IrType::Struct(vec![IrType::I8, IrType::I32]);
        assert_eq!(ty.size(), 8);
        assert_eq!(ty.align(), 4);
        // { i32, i8 } pads the tail: also size 8.
        let ty = IrType::Struct(vec![IrType::I32, IrType::I8]);
        assert_eq!(ty.size(), 8);
    }

    #[test]
    fn test_indexed_referent() {
        // gep [4 x i32]* with indices (0, 7): referent is i32 even though
        // the element index is out of range; bounds are a runtime question.
        let arr = IrType::Array(4, Box::new(IrType::I32));
        let got = arr.indexed(&[
            Operand::Const(IrConst::int(IrType::I64, 0)),
            Operand::Const(IrConst::int(IrType::I64, 7)),
        ]);
        assert_eq!(got, Some(IrType::I32));
    }

    #[test]
    fn test_indexed_struct_needs_const() {
        let st = IrType::Struct(vec![IrType::I32, IrType::i8_ptr()]);
        let konst = |v| Operand::Const(IrConst::int(IrType::I32, v));
        assert_eq!(st.indexed(&[konst(0), konst(1)]), Some(IrType::i8_ptr()));
        // A dynamic struct index is not derivable.
        let dynamic = Operand::Value(Value(9));
        assert_eq!(st.indexed(&[konst(0), dynamic]), None);
    }

    #[test]
    fn test_single_index_keeps_pointee() {
        // gep i32* with one index stays an i32 referent.
        let konst = |v| Operand::Const(IrConst::int(IrType::I64, v));
        assert_eq!(IrType::I32.indexed(&[konst(3)]), Some(IrType::I32));
    }

    #[test]
    fn test_function_pointer_predicate() {
        let fnty = IrType::Func {
            ret: Box::new(IrType::Void),
            params: vec![IrType::I32],
            variadic: false,
        };
        assert!(fnty.clone().ptr_to().is_function_pointer());
        assert!(!IrType::i8_ptr().is_function_pointer());
    }
}
