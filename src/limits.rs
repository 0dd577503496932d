//! Centralized VM limits and tunable constants.
//!
//! Collects the magic numbers that bound compiler and VM behavior in one
//! place, the way Lua's own `luaconf.h`/`llimits.h` does.

/// Extra register slots reserved above a frame's declared `maxStackSize`
/// for temporaries used while setting up a call.
pub const EXTRA_STACK: usize = 5;

/// Initial register-file capacity for a freshly created VM.
pub const BASIC_STACK_SIZE: usize = 64;

/// Maximum function call nesting depth before a `RuntimeError::StackOverflow`
/// is raised.
pub const MAX_CALL_DEPTH: usize = 200;

/// Maximum length, in bytes, for a "short" string eligible for interning.
pub const LUAI_MAXSHORTLEN: usize = 40;

/// Maximum number of local variables in a single function (encoding limit:
/// locals are addressed by an 8-bit register).
pub const MAX_LOCALS: usize = 200;

/// Maximum number of upvalues in a single function (iABC `B`/`C` are 9 bits,
/// but upvalue descriptors follow Lua's own 255 cap).
pub const MAX_UPVALUES: usize = 255;

/// Maximum number of constants in a single function's constant pool
/// (`2^18`, the width of an iABx `Bx` operand).
pub const MAX_CONSTANTS: usize = 1 << 18;

/// Maximum forward/backward jump distance encodable in a signed `sBx`.
pub const MAX_JUMP: i32 = (1 << 17) - 1;

/// Bound on `__index`/`__newindex` metatable chain length, to turn a
/// pathological cycle into a raised error instead of an infinite loop.
pub const MAXTAGLOOP: usize = 2000;

/// Number of array-constructor fields flushed per `SETLIST` instruction.
pub const LFIELDS_PER_FLUSH: usize = 50;
