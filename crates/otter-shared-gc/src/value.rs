//! Addresses, tagged words and slots
//!
//! Every reference-holding word in the heap (object fields, root storage)
//! is a [`TaggedValue`]. The tag bits decide whether the word is a heap
//! pointer and, if so, whether it is weak:
//!
//! ```text
//! 0x0                     HOLE (empty / cleared)
//! ....xxxx_xxxx_x000      strong heap pointer (non-zero, 8-byte aligned)
//! ....xxxx_xxxx_x010      weak heap pointer   (address | 0b010)
//! iiii_iiii_...._0001     32-bit integer in the upper half
//! ....xxxx_xxxx_x110      special constants (undefined, null, booleans)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A raw machine address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(usize);

impl Address {
    /// The null address
    pub const NULL: Address = Address(0);

    /// Wrap a raw address
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Address of a pointer
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Raw address value
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Address as a raw pointer
    #[inline]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }

    /// Check for null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` further on
    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Byte distance from `base` to `self`
    #[inline]
    pub const fn offset_from(self, base: Address) -> usize {
        self.0 - base.0
    }

    /// Check word alignment
    #[inline]
    pub const fn is_word_aligned(self) -> bool {
        self.0 % WORD_SIZE == 0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Size of a heap word in bytes
pub const WORD_SIZE: usize = 8;

const TAG_MASK: u64 = 0b111;
const WEAK_TAG: u64 = 0b010;
const INT_TAG: u64 = 0b1;
const SPECIAL_TAG: u64 = 0b110;

/// One tagged machine word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaggedValue(u64);

impl TaggedValue {
    /// Empty slot
    pub const HOLE: TaggedValue = TaggedValue(0);
    /// `undefined`
    pub const UNDEFINED: TaggedValue = TaggedValue(0x06);
    /// `null`
    pub const NULL: TaggedValue = TaggedValue(0x0e);
    /// `true`
    pub const TRUE: TaggedValue = TaggedValue(0x16);
    /// `false`
    pub const FALSE: TaggedValue = TaggedValue(0x1e);

    /// Rebuild a value from its raw bits
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw bits
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Strong reference to a heap object
    #[inline]
    pub fn object(addr: Address) -> Self {
        debug_assert!(!addr.is_null() && addr.is_word_aligned());
        Self(addr.as_usize() as u64)
    }

    /// Weak reference to a heap object
    #[inline]
    pub fn weak(addr: Address) -> Self {
        debug_assert!(!addr.is_null() && addr.is_word_aligned());
        Self(addr.as_usize() as u64 | WEAK_TAG)
    }

    /// 32-bit integer
    #[inline]
    pub const fn int(value: i32) -> Self {
        Self(((value as u32 as u64) << 32) | INT_TAG)
    }

    /// Is this the empty value
    #[inline]
    pub const fn is_hole(self) -> bool {
        self.0 == 0
    }

    /// Is this a heap pointer (strong or weak)
    #[inline]
    pub const fn is_heap_object(self) -> bool {
        self.0 & !TAG_MASK != 0 && (self.0 & TAG_MASK == 0 || self.0 & TAG_MASK == WEAK_TAG)
    }

    /// Is this a weak heap pointer
    #[inline]
    pub const fn is_weak(self) -> bool {
        self.0 & TAG_MASK == WEAK_TAG && self.0 & !TAG_MASK != 0
    }

    /// Integer payload, if this is an integer
    #[inline]
    pub const fn as_int(self) -> Option<i32> {
        if self.0 & INT_TAG == INT_TAG {
            Some((self.0 >> 32) as u32 as i32)
        } else {
            None
        }
    }

    /// Referenced object address with the weak tag stripped
    #[inline]
    pub fn heap_object(self) -> Option<Address> {
        if self.is_heap_object() {
            Some(Address::new((self.0 & !TAG_MASK) as usize))
        } else {
            None
        }
    }

    /// Decode into a [`Reference`]
    pub fn decode(self) -> Reference {
        if self.is_hole() {
            return Reference::Empty;
        }
        match self.0 & TAG_MASK {
            0 => Reference::Strong(Address::new(self.0 as usize)),
            WEAK_TAG if self.0 != WEAK_TAG => {
                Reference::Weak(Address::new((self.0 & !TAG_MASK) as usize))
            }
            _ => Reference::Primitive(self),
        }
    }
}

impl fmt::Debug for TaggedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Reference::Empty => write!(f, "Hole"),
            Reference::Strong(addr) => write!(f, "Object({addr})"),
            Reference::Weak(addr) => write!(f, "Weak({addr})"),
            Reference::Primitive(v) => match v.as_int() {
                Some(i) => write!(f, "Int({i})"),
                None if v.0 & TAG_MASK == SPECIAL_TAG => write!(f, "Special({:#x})", v.0),
                None => write!(f, "Raw({:#x})", v.0),
            },
        }
    }
}

/// What a tagged word refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference {
    /// Nothing (a cleared slot)
    Empty,
    /// A non-pointer value
    Primitive(TaggedValue),
    /// A strong heap reference
    Strong(Address),
    /// A weak heap reference; nulled when the referent dies
    Weak(Address),
}

impl Reference {
    /// Encode back into a tagged word
    pub fn encode(self) -> TaggedValue {
        match self {
            Reference::Empty => TaggedValue::HOLE,
            Reference::Primitive(v) => v,
            Reference::Strong(addr) => TaggedValue::object(addr),
            Reference::Weak(addr) => TaggedValue::weak(addr),
        }
    }
}

/// A word-sized location holding a [`TaggedValue`].
///
/// Loads and stores are relaxed atomic word accesses, so threads fixing up
/// disjoint slots at the same time never race.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot(Address);

impl Slot {
    /// Create a slot at `addr`.
    ///
    /// # Safety
    /// `addr` must be word aligned and point to a word that stays valid for
    /// every later `load`/`store` through this slot.
    #[inline]
    pub unsafe fn at(addr: Address) -> Self {
        debug_assert!(addr.is_word_aligned(), "unaligned slot {addr}");
        Self(addr)
    }

    /// Slot backed by an atomic word (root storage).
    ///
    /// # Safety
    /// `word` must outlive every use of the returned slot.
    #[inline]
    pub unsafe fn from_atomic(word: &AtomicU64) -> Self {
        Self(Address::from_ptr(word as *const AtomicU64))
    }

    /// Address of the slot itself
    #[inline]
    pub fn address(self) -> Address {
        self.0
    }

    /// Next word
    #[inline]
    pub fn next(self) -> Self {
        Self(self.0.offset(WORD_SIZE))
    }

    /// Slot `words` words further on
    #[inline]
    pub fn offset_words(self, words: usize) -> Self {
        Self(self.0.offset(words * WORD_SIZE))
    }

    #[inline]
    fn word(&self) -> &AtomicU64 {
        // SAFETY: guaranteed by the constructors' contracts
        unsafe { &*(self.0.as_usize() as *const AtomicU64) }
    }

    /// Read the tagged value
    #[inline]
    pub fn load(self) -> TaggedValue {
        TaggedValue(self.word().load(Ordering::Relaxed))
    }

    /// Overwrite the tagged value
    #[inline]
    pub fn store(self, value: TaggedValue) {
        self.word().store(value.0, Ordering::Relaxed);
    }

    /// Read an untagged word (derived pointers)
    #[inline]
    pub fn load_raw(self) -> usize {
        self.word().load(Ordering::Relaxed) as usize
    }

    /// Write an untagged word (derived pointers)
    #[inline]
    pub fn store_raw(self, raw: usize) {
        self.word().store(raw as u64, Ordering::Relaxed);
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({})", self.0)
    }
}
