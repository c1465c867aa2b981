//! GC object layout
//!
//! ```text
//! word 0   class word   [ length: u32 | class id: u32 ]
//! word 1   mark word    0 = Unmarked, address | 1 = Forwarded(address)
//! word 2.. body
//! ```
//!
//! The mark word is written once per cycle, by the copy phase, and only
//! read afterwards. The fix-up phase starts after every forwarding install
//! of the cycle, so plain relaxed accesses are sufficient.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::value::{Address, Slot, WORD_SIZE};

/// Size of the object header in bytes
pub const HEADER_SIZE: usize = 2 * WORD_SIZE;

const FORWARDED_TAG: u64 = 1;

/// Index of a class in the [`ClassTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u32);

/// Relocation state of an object for the current cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderState {
    /// Not relocated (dead, or not in the collect set)
    Unmarked,
    /// Relocated to the given address
    Forwarded(Address),
}

/// Encoded [`HeaderState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkWord(u64);

impl MarkWord {
    /// Unmarked state
    pub const UNMARKED: MarkWord = MarkWord(0);

    /// Forwarding entry to `to`
    #[inline]
    pub fn forwarded(to: Address) -> Self {
        debug_assert!(to.is_word_aligned());
        Self(to.as_usize() as u64 | FORWARDED_TAG)
    }

    /// Decode the state
    #[inline]
    pub fn state(self) -> HeaderState {
        if self.0 & FORWARDED_TAG != 0 {
            HeaderState::Forwarded(Address::new((self.0 & !FORWARDED_TAG) as usize))
        } else {
            HeaderState::Unmarked
        }
    }
}

/// View of the header of the object at an address.
#[derive(Debug, Clone, Copy)]
pub struct ObjectHeader(Address);

impl ObjectHeader {
    /// Header of the object at `object`.
    ///
    /// # Safety
    /// `object` must be the start of an initialized heap object.
    #[inline]
    pub unsafe fn at(object: Address) -> Self {
        Self(object)
    }

    /// Write a fresh header: class word set, mark word unmarked.
    ///
    /// # Safety
    /// `object` must point to at least [`HEADER_SIZE`] writable, word aligned bytes.
    pub unsafe fn initialize(object: Address, class: ClassId, length: u32) -> Self {
        let header = Self(object);
        header.class_word().store(
            ((length as u64) << 32) | class.0 as u64,
            Ordering::Relaxed,
        );
        header.mark_word_cell().store(0, Ordering::Relaxed);
        header
    }

    #[inline]
    fn class_word(&self) -> &AtomicU64 {
        // SAFETY: guaranteed by the constructors' contracts
        unsafe { &*(self.0.as_usize() as *const AtomicU64) }
    }

    #[inline]
    fn mark_word_cell(&self) -> &AtomicU64 {
        // SAFETY: guaranteed by the constructors' contracts
        unsafe { &*((self.0.as_usize() + WORD_SIZE) as *const AtomicU64) }
    }

    /// Object address
    #[inline]
    pub fn object(&self) -> Address {
        self.0
    }

    /// Class of the object
    #[inline]
    pub fn class(&self) -> ClassId {
        ClassId(self.class_word().load(Ordering::Relaxed) as u32)
    }

    /// Element count for array classes
    #[inline]
    pub fn length(&self) -> u32 {
        (self.class_word().load(Ordering::Relaxed) >> 32) as u32
    }

    /// Current mark word
    #[inline]
    pub fn mark_word(&self) -> MarkWord {
        MarkWord(self.mark_word_cell().load(Ordering::Relaxed))
    }

    /// Install a mark word
    #[inline]
    pub fn set_mark_word(&self, word: MarkWord) {
        self.mark_word_cell().store(word.0, Ordering::Relaxed);
    }

    /// Decoded relocation state
    #[inline]
    pub fn state(&self) -> HeaderState {
        self.mark_word().state()
    }

    /// Slot of the `index`th body word
    #[inline]
    pub fn body_slot(&self, index: usize) -> Slot {
        // SAFETY: body words are word aligned and live as long as the object
        unsafe { Slot::at(self.0.offset(HEADER_SIZE + index * WORD_SIZE)) }
    }
}

/// Storage representation of an in-object property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Representation {
    /// Tagged value, may be a heap pointer
    Tagged,
    /// Unboxed double
    Double,
    /// Unboxed integer
    Int,
}

impl Representation {
    /// Does the field hold a tagged value
    #[inline]
    pub fn is_tagged(self) -> bool {
        matches!(self, Representation::Tagged)
    }
}

/// Receives the pointer-bearing areas of an object body.
pub trait BodyVisitor {
    /// Every word in `[start, end)` is tagged.
    fn visit_range(&mut self, start: Slot, end: Slot);

    /// In-object properties starting at `start`, one word each; only the
    /// entries with a tagged representation hold references.
    fn visit_in_object_properties(&mut self, start: Slot, layout: &[Representation]);
}

/// Layout introspection used by the collector.
pub trait ObjectModel: Send + Sync {
    /// Size of the object in bytes, header included
    fn size_of(&self, object: Address) -> usize;

    /// Size of a new instance of `class`
    fn instance_size(&self, class: ClassId, length: u32) -> usize;

    /// Enumerate the pointer-bearing areas of the object's body
    fn visit_body(&self, object: Address, visitor: &mut dyn BodyVisitor);
}

/// Shape of instances of a class
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassKind {
    /// Fixed tagged fields followed by in-object properties
    Plain {
        /// Number of tagged body words
        tagged_fields: usize,
        /// Representation of each in-object property word
        in_object: Vec<Representation>,
    },
    /// `length` tagged elements
    TaggedArray,
    /// `length` raw bytes, no references
    ByteArray,
}

/// A registered class
#[derive(Debug, Clone)]
pub struct ClassDescriptor {
    /// Class name, for diagnostics
    pub name: &'static str,
    /// Instance shape
    pub kind: ClassKind,
}

impl ClassDescriptor {
    /// Instance size for a given array length (ignored by plain classes)
    pub fn instance_size(&self, length: u32) -> usize {
        let body = match &self.kind {
            ClassKind::Plain {
                tagged_fields,
                in_object,
            } => (tagged_fields + in_object.len()) * WORD_SIZE,
            ClassKind::TaggedArray => length as usize * WORD_SIZE,
            ClassKind::ByteArray => (length as usize).next_multiple_of(WORD_SIZE),
        };
        HEADER_SIZE + body
    }
}

/// Class registry implementing [`ObjectModel`] from header class words.
#[derive(Debug, Default)]
pub struct ClassTable {
    classes: Vec<ClassDescriptor>,
}

impl ClassTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class and return its id
    pub fn register(&mut self, name: &'static str, kind: ClassKind) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(ClassDescriptor { name, kind });
        id
    }

    /// Look up a class
    pub fn get(&self, id: ClassId) -> &ClassDescriptor {
        &self.classes[id.0 as usize]
    }

    /// Number of registered classes
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Check if no class is registered
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl ObjectModel for ClassTable {
    fn size_of(&self, object: Address) -> usize {
        // SAFETY: the collector only asks about live, initialized objects
        let header = unsafe { ObjectHeader::at(object) };
        self.get(header.class()).instance_size(header.length())
    }

    fn instance_size(&self, class: ClassId, length: u32) -> usize {
        self.get(class).instance_size(length)
    }

    fn visit_body(&self, object: Address, visitor: &mut dyn BodyVisitor) {
        // SAFETY: the collector only asks about live, initialized objects
        let header = unsafe { ObjectHeader::at(object) };
        match &self.get(header.class()).kind {
            ClassKind::Plain {
                tagged_fields,
                in_object,
            } => {
                if *tagged_fields > 0 {
                    visitor.visit_range(header.body_slot(0), header.body_slot(*tagged_fields));
                }
                if !in_object.is_empty() {
                    visitor.visit_in_object_properties(header.body_slot(*tagged_fields), in_object);
                }
            }
            ClassKind::TaggedArray => {
                let len = header.length() as usize;
                if len > 0 {
                    visitor.visit_range(header.body_slot(0), header.body_slot(len));
                }
            }
            ClassKind::ByteArray => {}
        }
    }
}
