//! Read-only class and method descriptors.
//!
//! The runtime never loads metadata itself; it is handed a [`Metadata`]
//! implementation at construction and only ever queries it.

use object::{ClassId, MethodId};

use crate::error::{Fault, Violation};

/// Classes every store must provide, at fixed ids.
pub mod classes {
    use object::ClassId;

    pub const OBJECT: ClassId = ClassId(0);
    pub const THROWABLE: ClassId = ClassId(1);
    pub const NULL_POINTER_EXCEPTION: ClassId = ClassId(2);
    pub const INDEX_OUT_OF_BOUNDS_EXCEPTION: ClassId = ClassId(3);
    pub const ARRAY_STORE_EXCEPTION: ClassId = ClassId(4);
    pub const OUT_OF_MEMORY_ERROR: ClassId = ClassId(5);
    pub const ILLEGAL_MONITOR_STATE_EXCEPTION: ClassId = ClassId(6);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDescriptor {
    pub id: ClassId,
    pub name: String,
    pub parent: Option<ClassId>,
    /// Reference fields, laid out before the primitive bytes.
    pub ref_fields: u16,
    pub primitive_bytes: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start_pc: u32,
    /// Exclusive.
    pub end_pc: u32,
    pub handler_pc: u32,
    /// `None` catches everything.
    pub catch: Option<ClassId>,
}

impl ExceptionHandler {
    #[inline]
    pub fn covers(&self, pc: u32) -> bool {
        pc >= self.start_pc && pc < self.end_pc
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    pub is_static: bool,
    pub code_length: u32,
    /// Arguments are passed in the first local slots.
    pub ref_args: u16,
    pub int_args: u16,
    pub ref_locals: u16,
    pub int_locals: u16,
    pub max_ref_stack: u16,
    pub max_int_stack: u16,
    pub handlers: Vec<ExceptionHandler>,
}

impl MethodDescriptor {
    /// Check that the declared slot counts are consistent.
    pub fn validate(&self, id: MethodId) -> Result<(), Violation> {
        let consistent = !(self.is_static && self.code_length == 0)
            && self.ref_args <= self.ref_locals
            && self.int_args <= self.int_locals;
        if consistent {
            Ok(())
        } else {
            Err(Violation::IncorrectMethodHeader(id))
        }
    }
}

pub trait Metadata {
    fn class(&self, id: ClassId) -> Option<&ClassDescriptor>;

    fn method(&self, id: MethodId) -> Option<&MethodDescriptor>;

    /// Class of the exception object raised for `fault`.
    fn fault_class(&self, fault: Fault) -> ClassId {
        match fault {
            Fault::NullPointer => classes::NULL_POINTER_EXCEPTION,
            Fault::IndexOutOfBounds => classes::INDEX_OUT_OF_BOUNDS_EXCEPTION,
            Fault::ArrayStore => classes::ARRAY_STORE_EXCEPTION,
            Fault::OutOfMemory => classes::OUT_OF_MEMORY_ERROR,
            Fault::IllegalMonitorState => classes::ILLEGAL_MONITOR_STATE_EXCEPTION,
        }
    }

    /// Whether `class` is `of` or inherits from it.
    fn is_subtype_of(&self, class: ClassId, of: ClassId) -> bool {
        let mut current = Some(class);
        while let Some(id) = current {
            if id == of {
                return true;
            }
            current = self.class(id).and_then(|c| c.parent);
        }
        false
    }

    /// Like [`Metadata::class`], aborting on an unknown id.
    fn class_or_abort(&self, id: ClassId) -> &ClassDescriptor {
        self.class(id)
            .unwrap_or_else(|| Violation::UnknownClass(id).abort())
    }

    /// Like [`Metadata::method`], aborting on an unknown id.
    fn method_or_abort(&self, id: MethodId) -> &MethodDescriptor {
        self.method(id)
            .unwrap_or_else(|| Violation::UnknownMethod(id).abort())
    }
}

/// In-memory descriptor store.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    classes: Vec<ClassDescriptor>,
    /// Indexed like `classes`.
    methods: Vec<Vec<MethodDescriptor>>,
}

impl MetadataStore {
    /// A store holding only the well-known classes from [`classes`].
    pub fn new() -> Self {
        let mut store = Self {
            classes: Vec::new(),
            methods: Vec::new(),
        };
        store.add_class("java.lang.Object", None, 0, 0);
        let throwable = store.add_class("java.lang.Throwable", Some(classes::OBJECT), 0, 0);
        for name in [
            "java.lang.NullPointerException",
            "java.lang.IndexOutOfBoundsException",
            "java.lang.ArrayStoreException",
            "java.lang.OutOfMemoryError",
            "java.lang.IllegalMonitorStateException",
        ] {
            store.add_class(name, Some(throwable), 0, 0);
        }
        debug_assert_eq!(
            store.classes.len(),
            classes::ILLEGAL_MONITOR_STATE_EXCEPTION.0 as usize + 1
        );
        store
    }

    pub fn add_class(
        &mut self,
        name: &str,
        parent: Option<ClassId>,
        ref_fields: u16,
        primitive_bytes: u16,
    ) -> ClassId {
        let id = ClassId(self.classes.len() as u16);
        self.classes.push(ClassDescriptor {
            id,
            name: name.to_string(),
            parent,
            ref_fields,
            primitive_bytes,
        });
        self.methods.push(Vec::new());
        id
    }

    pub fn add_method(&mut self, class: ClassId, method: MethodDescriptor) -> MethodId {
        let methods = &mut self.methods[class.0 as usize];
        let id = MethodId::new(class, methods.len() as u16);
        methods.push(method);
        id
    }

    pub fn find_class(&self, name: &str) -> Option<ClassId> {
        self.classes.iter().find(|c| c.name == name).map(|c| c.id)
    }
}

impl Default for MetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Metadata for MetadataStore {
    fn class(&self, id: ClassId) -> Option<&ClassDescriptor> {
        self.classes.get(id.0 as usize)
    }

    fn method(&self, id: MethodId) -> Option<&MethodDescriptor> {
        self.methods.get(id.class.0 as usize)?.get(id.index as usize)
    }
}
