//! Offset and padding computation

use super::{
    AlignmentMode, ArrayLen, CompositeKind, FieldDecl, FieldDescriptor, Passing, Platform,
    Resolution, SemanticType, StructureLayout,
};
use crate::error::{config_error, Result};
use crate::logging::log_layout_computed;
use crate::memory::align_up;

/// Size and natural (uncapped) alignment of a type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Sizing {
    pub size: usize,
    pub align: usize,
}

impl Sizing {
    #[inline]
    const fn scalar(size: usize) -> Self {
        Self { size, align: size }
    }
}

/// Compute the layout of an anonymous field list
///
/// Deferred array fields yield [`Resolution::Deferred`] unless `force` is
/// set, in which case they are a configuration error.
pub fn calculate(
    fields: &[FieldDecl],
    kind: CompositeKind,
    mode: AlignmentMode,
    platform: &Platform,
    force: bool,
) -> Result<Resolution> {
    compute("<anonymous>", fields, kind, mode, platform, force, &|_| None)
}

/// Layout computation with instance-supplied lengths for deferred arrays
pub(crate) fn compute(
    name: &str,
    fields: &[FieldDecl],
    kind: CompositeKind,
    mode: AlignmentMode,
    platform: &Platform,
    force: bool,
    deferred_len: &dyn Fn(usize) -> Option<usize>,
) -> Result<Resolution> {
    let mode = platform.resolve_mode(mode);
    let mut placed = Vec::with_capacity(fields.len());
    let mut offset = 0usize;
    let mut largest = 0usize;
    let mut struct_align = 1usize;

    for (index, decl) in fields.iter().enumerate() {
        let native = decl.native_type();
        let array_len = match &native {
            SemanticType::Array(_, ArrayLen::Fixed(n)) => Some(*n),
            SemanticType::Array(_, ArrayLen::Deferred) => match deferred_len(index) {
                Some(n) => Some(n),
                None if force => {
                    return Err(config_error!(
                        "array field '{}' of '{name}' must be initialized before its size is known",
                        decl.name
                    ))
                }
                None => {
                    return Ok(Resolution::Deferred {
                        field: decl.name.clone(),
                    })
                }
            },
            _ => None,
        };

        let natural = natural_sizing(&native, platform, array_len)
            .map_err(|e| config_error!("field '{}' of '{name}': {}", decl.name, message_of(e)))?;
        let align = match decl.alignment {
            Some(fixed) if fixed.is_power_of_two() => fixed,
            Some(bad) => {
                return Err(config_error!(
                    "field '{}' of '{name}' has alignment {bad}, which is not a power of two",
                    decl.name
                ))
            }
            None => platform.cap_alignment(mode, natural.align, index == 0),
        };
        struct_align = struct_align.max(align);

        let field_offset = match kind {
            CompositeKind::Struct => align_up(offset, align),
            CompositeKind::Union => 0,
        };
        offset = field_offset + natural.size;
        largest = largest.max(natural.size);

        placed.push(FieldDescriptor {
            name: decl.name.clone(),
            ty: decl.ty.clone(),
            native,
            offset: field_offset,
            size: natural.size,
            alignment: align,
            volatile: decl.volatile,
            codec: decl.codec.clone(),
            array_len,
        });
    }

    let raw_size = match kind {
        CompositeKind::Struct => offset,
        CompositeKind::Union => largest,
    };
    if raw_size == 0 {
        return Err(config_error!("structure '{name}' has unknown size (no fields)"));
    }
    let size = if mode == AlignmentMode::None {
        raw_size
    } else {
        align_up(raw_size, struct_align)
    };

    log_layout_computed(name, size, struct_align, placed.len());
    Ok(Resolution::Resolved(StructureLayout {
        name: name.to_string(),
        kind,
        mode,
        fields: placed,
        size,
        alignment: struct_align,
    }))
}

fn message_of(err: crate::Error) -> String {
    match err {
        crate::Error::Configuration { message } => message,
        other => other.to_string(),
    }
}

/// Size and uncapped alignment of `ty` on `platform`
///
/// `array_len` supplies the element count of a deferred top-level array.
pub(crate) fn natural_sizing(
    ty: &SemanticType,
    platform: &Platform,
    array_len: Option<usize>,
) -> Result<Sizing> {
    use SemanticType::*;

    Ok(match ty {
        Void => return Err(config_error!("void is not a storable type")),
        Int8 => Sizing::scalar(1),
        Int16 => Sizing::scalar(2),
        Bool | Int32 | Float32 => Sizing::scalar(4),
        Int64 | Float64 => Sizing::scalar(8),
        NativeLong => Sizing::scalar(platform.long_size),
        NarrowString | WideString | RawPointer | CallbackRef(_) => {
            Sizing::scalar(platform.pointer_size)
        }
        Composite(_, Passing::ByReference) => Sizing::scalar(platform.pointer_size),
        Composite(def, Passing::ByValue) => {
            let layout = def
                .layout_for(platform)
                .map_err(|e| config_error!("can't determine size of nested structure: {}", message_of(e)))?;
            Sizing {
                size: layout.size(),
                align: layout.alignment(),
            }
        }
        Array(element, len) => {
            let count = match len {
                ArrayLen::Fixed(n) => *n,
                ArrayLen::Deferred => array_len
                    .ok_or_else(|| config_error!("nested arrays must have a fixed length"))?,
            };
            if count == 0 {
                return Err(config_error!("arrays of length zero are not allowed in a structure"));
            }
            if matches!(**element, Array(_, ArrayLen::Deferred)) {
                return Err(config_error!("nested arrays must have a fixed length"));
            }
            let element = natural_sizing(element, platform, None)?;
            Sizing {
                size: element.size * count,
                align: element.align,
            }
        }
        Custom(key) => {
            return Err(config_error!("type '{key}' needs a codec to be stored natively"))
        }
    })
}
