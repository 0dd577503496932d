//! Lua strings are immutable byte strings, not necessarily valid UTF-8
//! and never Unicode-normalized, so they are backed by `Rc<[u8]>` rather
//! than `Rc<str>`.

use std::fmt;
use std::rc::Rc;

#[derive(Clone)]
pub struct LuaString(pub Rc<[u8]>);

impl LuaString {
    pub fn new(bytes: Vec<u8>) -> Self {
        LuaString(Rc::from(bytes))
    }

    pub fn from_str(s: &str) -> Self {
        LuaString(Rc::from(s.as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lossy UTF-8 view, for diagnostics/`Display` only; never used to
    /// decide program semantics.
    pub fn to_string_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }

    pub fn ptr_eq(&self, other: &LuaString) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for LuaString {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0 == other.0
    }
}
impl Eq for LuaString {}

impl std::hash::Hash for LuaString {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Debug for LuaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

impl PartialOrd for LuaString {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.0.cmp(&other.0))
    }
}
impl Ord for LuaString {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}
