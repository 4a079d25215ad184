//! Compile-time bounds.
//!
//! Values follow the upstream `lavascript` interpreter
//! (`src/interpreter/bytecode.h`): a 256-register file with register
//! #255 reserved as the accumulator, and 16-bit-addressable constant /
//! jump-target fields. The exact numeric ceilings for code length,
//! literal-table size and upvalue-table size are not pinned by a
//! retrievable upstream constant, so they are set here to the natural
//! ceiling implied by the encoding (anything addressable by the relevant
//! field width), which is the same ceiling the type-G 16-bit jump target
//! and type-B/C 16-bit constant index impose anyway.

/// Total number of bytecode registers, including the accumulator.
pub const TOTAL_REGISTER_SIZE: usize = 256;

/// Number of registers available to the allocator (excludes the
/// accumulator at index 255).
pub const ALLOCATABLE_REGISTER_SIZE: usize = 255;

/// Register #255: the implicit accumulator.
pub const ACC_REGISTER: u8 = 255;

/// Hard ceiling on the number of 32-bit words in a function's code buffer.
pub const MAX_CODE_LENGTH: usize = 1 << 16;

/// Hard ceiling on a single constant table (real, string, or SSO).
pub const MAX_LITERAL_SIZE: usize = 1 << 16;

/// Hard ceiling on the number of upvalue slots a single closure may capture.
pub const MAX_UPVALUE_SIZE: usize = 1 << 16;

/// Initial code-buffer capacity reservation, avoids early reallocation.
pub const INITIAL_CODE_BUFFER_SIZE: usize = 1024;

/// Hard ceiling on the number of prototypes (top-level functions plus
/// closures) a single compiled script's function table may hold (§7's
/// `TooManyPrototypes`).
pub const MAX_PROTOTYPE_SIZE: usize = 1 << 16;
