//! Tagged resource handles.
//!
//! A [`Handle`] is the opaque value handed to callers in place of a driver
//! object. It packs three fields into a `u32`:
//!
//! | bits     | field      |
//! |----------|------------|
//! | `0..12`  | slot index |
//! | `12..16` | type tag   |
//! | `16..32` | generation |
//!
//! The generation is never zero, so a packed handle is never zero either and
//! `Option<Handle>` costs nothing over a raw `u32`.

use std::num::{NonZeroU16, NonZeroU32};

/// Number of bits used for the slot index.
pub const INDEX_BITS: u32 = 12;

/// Maximum number of slots addressable by a handle.
pub const MAX_SLOTS: usize = 1 << INDEX_BITS;

const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const TAG_SHIFT: u32 = INDEX_BITS;
const TAG_MASK: u32 = 0xf;
const GENERATION_SHIFT: u32 = 16;

/// Kind of resource a handle refers to.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleType {
    /// Off-screen pbuffer.
    Pbuffer = 0,
    /// Rendering context.
    Context = 1,
    /// Rendering context created with a core (3.0+) version request.
    ContextV3 = 3,
}

impl HandleType {
    /// Get the 4-bit tag stored in the handle.
    pub fn tag(self) -> u32 {
        self as u32
    }

    /// Decode a tag back into a handle type.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::Pbuffer),
            1 => Some(Self::Context),
            3 => Some(Self::ContextV3),
            _ => None,
        }
    }

    /// Whether this is one of the context types.
    pub fn is_context(self) -> bool {
        matches!(self, Self::Context | Self::ContextV3)
    }

    /// Whether a handle of this type satisfies a lookup for `expected`.
    ///
    /// Both context flavours satisfy a context lookup.
    pub fn satisfies(self, expected: HandleType) -> bool {
        if expected.is_context() {
            self.is_context()
        } else {
            self == expected
        }
    }
}

/// Per-slot generation counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Generation(NonZeroU16);

impl Generation {
    /// Generation of a freshly created slot.
    pub const FIRST: Self = Self(NonZeroU16::MIN);

    /// Get the raw generation value.
    pub fn get(self) -> u16 {
        self.0.get()
    }

    /// Get the next generation, wrapping around and skipping zero.
    pub fn next(self) -> Self {
        Self(NonZeroU16::new(self.0.get().wrapping_add(1)).unwrap_or(NonZeroU16::MIN))
    }
}

/// Opaque handle to a table slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(NonZeroU32);

impl Handle {
    /// Pack a slot index, type and generation into a handle.
    ///
    /// `index` must be below [`MAX_SLOTS`]; higher bits are discarded.
    pub fn pack(index: usize, ty: HandleType, generation: Generation) -> Self {
        debug_assert!(index < MAX_SLOTS, "slot index {index} out of range");
        let raw = (index as u32 & INDEX_MASK)
            | (ty.tag() << TAG_SHIFT)
            | (u32::from(generation.get()) << GENERATION_SHIFT);
        // The generation occupies the high half and is never zero.
        Self(NonZeroU32::new(raw).unwrap_or(NonZeroU32::MIN))
    }

    /// Reinterpret a raw value received from a caller.
    ///
    /// Zero is the null handle and yields `None`. Any other value is accepted
    /// here; whether it names a live slot is decided by the handle table.
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// Get the raw value handed to callers.
    pub fn raw(self) -> u32 {
        self.0.get()
    }

    /// Get the slot index.
    pub fn index(self) -> usize {
        (self.raw() & INDEX_MASK) as usize
    }

    /// Get the handle type, if the tag is a known one.
    pub fn handle_type(self) -> Option<HandleType> {
        HandleType::from_tag((self.raw() >> TAG_SHIFT) & TAG_MASK)
    }

    /// Get the generation the handle was issued with.
    pub fn generation(self) -> u16 {
        (self.raw() >> GENERATION_SHIFT) as u16
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.handle_type() {
            Some(ty) => write!(f, "Handle({}:{:?}@{})", self.index(), ty, self.generation()),
            None => write!(f, "Handle({:#010x})", self.raw()),
        }
    }
}
