//! Program graph: classes, message handlers, and name resolution
//!
//! The class graph has cyclic ownership (inner class to enclosing class,
//! handler to owning class), so everything lives in one arena and is
//! addressed by index. Back-references are write-once: the wiring operations
//! on [`Program`] set them exactly once and reject rebinding.

use crate::bytecode::Instruction;
use once_cell::sync::OnceCell;
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Arena index of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u32);

/// Arena index of a message handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u32);

impl std::fmt::Display for ClassId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "class#{}", self.0)
    }
}

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

/// Handler and class visibility.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    /// Always visible.
    Public = 0,
    /// Visible to the declaring class and its subclasses.
    Protected = 1,
    /// Visible only to the exact declaring class.
    Private = 2,
    /// Reserved for the anonymous default-handler slot; unmatchable by name.
    None = 3,
}

impl Visibility {
    /// Decode from wire bits.
    pub fn from_bits(bits: u8) -> Option<Visibility> {
        match bits {
            0 => Some(Visibility::Public),
            1 => Some(Visibility::Protected),
            2 => Some(Visibility::Private),
            3 => Some(Visibility::None),
            _ => None,
        }
    }

    /// Wire bit pattern.
    #[inline]
    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// Body of a message handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerBody {
    /// Interpreted VMIL body.
    Vmil {
        /// Argument names, in declaration order.
        argument_names: Vec<String>,
        /// Local variable names, in declaration order.
        local_names: Vec<String>,
        /// Symbolic instruction list.
        instructions: Vec<Instruction>,
    },
    /// Bound to a host routine by name.
    External {
        /// External binding name.
        binding: String,
    },
}

/// A method: VMIL-bodied or external.
///
/// Immutable once created, except for the write-once owner back-reference.
#[derive(Debug)]
pub struct MessageHandler {
    /// Visibility of the handler.
    pub visibility: Visibility,
    /// Handler name; `None` marks the anonymous default handler.
    pub name: Option<String>,
    /// Declared argument count.
    pub argument_count: u32,
    /// VMIL or external body.
    pub body: HandlerBody,
    /// Whether this handler is the program entrypoint.
    pub is_entrypoint: bool,
    owner: OnceCell<ClassId>,
}

impl MessageHandler {
    /// Create a named VMIL handler.
    pub fn vmil(
        visibility: Visibility,
        name: impl Into<String>,
        argument_names: Vec<String>,
        local_names: Vec<String>,
        instructions: Vec<Instruction>,
    ) -> Self {
        let argument_count = argument_names.len() as u32;
        Self {
            visibility,
            name: Some(name.into()),
            argument_count,
            body: HandlerBody::Vmil {
                argument_names,
                local_names,
                instructions,
            },
            is_entrypoint: false,
            owner: OnceCell::new(),
        }
    }

    /// Create a named external handler.
    pub fn external(
        visibility: Visibility,
        name: impl Into<String>,
        argument_count: u32,
        binding: impl Into<String>,
    ) -> Self {
        Self {
            visibility,
            name: Some(name.into()),
            argument_count,
            body: HandlerBody::External {
                binding: binding.into(),
            },
            is_entrypoint: false,
            owner: OnceCell::new(),
        }
    }

    /// Create an anonymous default handler (catch-all).
    pub fn anonymous_default(
        argument_names: Vec<String>,
        local_names: Vec<String>,
        instructions: Vec<Instruction>,
    ) -> Self {
        let argument_count = argument_names.len() as u32;
        Self {
            visibility: Visibility::None,
            name: None,
            argument_count,
            body: HandlerBody::Vmil {
                argument_names,
                local_names,
                instructions,
            },
            is_entrypoint: false,
            owner: OnceCell::new(),
        }
    }

    /// Mark this handler as the program entrypoint.
    pub fn entrypoint(mut self) -> Self {
        self.is_entrypoint = true;
        self
    }

    /// The owning class, once bound.
    pub fn owner(&self) -> Option<ClassId> {
        self.owner.get().copied()
    }

    fn bind_owner(&self, owner: ClassId) -> Result<(), ProgramError> {
        self.owner
            .set(owner)
            .map_err(|_| ProgramError::HandlerRebound {
                name: self.name.clone().unwrap_or_default(),
            })
    }
}

/// A class: name, declared superclasses, fields, handlers, inner classes.
///
/// Created once when a compiled unit loads; immutable afterwards except for
/// the memoized linearization and instance size.
#[derive(Debug)]
pub struct Class {
    /// Class name (unqualified).
    pub name: String,
    /// Visibility of the class.
    pub visibility: Visibility,
    /// Declared superclass names, in declaration order.
    pub superclass_names: Vec<String>,
    /// Declared field names, in declaration order.
    pub field_names: Vec<String>,
    /// Anonymous catch-all handler, if any.
    pub default_handler: Option<HandlerId>,
    handler_order: Vec<HandlerId>,
    handlers_by_name: FxHashMap<String, HandlerId>,
    inner_order: Vec<ClassId>,
    inner_by_name: FxHashMap<String, ClassId>,
    enclosing: OnceCell<ClassId>,
    pub(crate) linearization: OnceCell<Box<[ClassId]>>,
    pub(crate) instance_size: OnceCell<u32>,
}

impl Class {
    /// Create a class with its declaration-time shape.
    pub fn new(
        name: impl Into<String>,
        visibility: Visibility,
        superclass_names: Vec<String>,
        field_names: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            visibility,
            superclass_names,
            field_names,
            default_handler: None,
            handler_order: Vec::new(),
            handlers_by_name: FxHashMap::default(),
            inner_order: Vec::new(),
            inner_by_name: FxHashMap::default(),
            enclosing: OnceCell::new(),
            linearization: OnceCell::new(),
            instance_size: OnceCell::new(),
        }
    }

    /// Number of fields this class declares itself.
    pub fn field_count(&self) -> u32 {
        self.field_names.len() as u32
    }

    /// Index of a declared field within this class's block.
    pub fn field_index(&self, name: &str) -> Option<u32> {
        self.field_names
            .iter()
            .position(|f| f == name)
            .map(|i| i as u32)
    }

    /// Look up a named handler declared directly on this class.
    pub fn handler_named(&self, name: &str) -> Option<HandlerId> {
        self.handlers_by_name.get(name).copied()
    }

    /// Named handlers in declaration order.
    pub fn handlers(&self) -> &[HandlerId] {
        &self.handler_order
    }

    /// Look up an inner class by name.
    pub fn inner_named(&self, name: &str) -> Option<ClassId> {
        self.inner_by_name.get(name).copied()
    }

    /// Inner classes in declaration order.
    pub fn inner_classes(&self) -> &[ClassId] {
        &self.inner_order
    }

    /// The enclosing class, if this is an inner class.
    pub fn enclosing(&self) -> Option<ClassId> {
        self.enclosing.get().copied()
    }
}

/// Program wiring errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProgramError {
    /// A handler was attached to a second class.
    #[error("handler {name:?} is already bound to a class")]
    HandlerRebound {
        /// Handler name, empty for the anonymous default
        name: String,
    },

    /// Two handlers with the same name on one class.
    #[error("class {class:?} already declares a handler named {name:?}")]
    DuplicateHandlerName {
        /// Owning class name
        class: String,
        /// Conflicting handler name
        name: String,
    },

    /// A named handler was placed in the default slot, or an anonymous one
    /// in the named table.
    #[error("handler {name:?} cannot occupy the {slot} slot")]
    WrongSlot {
        /// Handler name, empty for the anonymous default
        name: String,
        /// Slot kind that rejected it
        slot: &'static str,
    },

    /// A class already has a default handler.
    #[error("class {class:?} already has a default handler")]
    DuplicateDefaultHandler {
        /// Owning class name
        class: String,
    },

    /// An inner class was attached to a second enclosing class.
    #[error("class {name:?} is already nested in another class")]
    ClassRebound {
        /// Inner class name
        name: String,
    },

    /// Two inner classes with the same name in one scope.
    #[error("scope {scope:?} already contains a class named {name:?}")]
    DuplicateClassName {
        /// Enclosing class name, or the program root
        scope: String,
        /// Conflicting class name
        name: String,
    },
}

/// Externally supplied class lookup.
///
/// The linearizer and dispatcher call but do not implement this; the default
/// implementation on [`Program`] walks the lexical scope chain.
pub trait ClassResolver {
    /// Resolve `name` as seen from `context`, or `None` when unknown.
    fn resolve_class(&self, context: ClassId, name: &str) -> Option<ClassId>;
}

/// Arena holding a loaded program's classes and handlers.
#[derive(Debug, Default)]
pub struct Program {
    classes: Vec<Class>,
    handlers: Vec<MessageHandler>,
    roots: Vec<ClassId>,
    roots_by_name: FxHashMap<String, ClassId>,
    /// Handler marked as the program entrypoint, if any.
    pub entrypoint: Option<HandlerId>,
}

impl Program {
    /// Create an empty program.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a class to the arena.
    pub fn add_class(&mut self, class: Class) -> ClassId {
        self.classes.push(class);
        ClassId(self.classes.len() as u32 - 1)
    }

    /// Add a handler to the arena.
    pub fn add_handler(&mut self, handler: MessageHandler) -> HandlerId {
        self.handlers.push(handler);
        HandlerId(self.handlers.len() as u32 - 1)
    }

    /// The class behind an id.
    pub fn class(&self, id: ClassId) -> &Class {
        &self.classes[id.0 as usize]
    }

    /// The handler behind an id.
    pub fn handler(&self, id: HandlerId) -> &MessageHandler {
        &self.handlers[id.0 as usize]
    }

    /// Number of classes in the arena.
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Number of handlers in the arena.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// All classes with their ids.
    pub fn classes(&self) -> impl Iterator<Item = (ClassId, &Class)> {
        self.classes
            .iter()
            .enumerate()
            .map(|(i, c)| (ClassId(i as u32), c))
    }

    /// All handlers with their ids.
    pub fn handlers(&self) -> impl Iterator<Item = (HandlerId, &MessageHandler)> {
        self.handlers
            .iter()
            .enumerate()
            .map(|(i, h)| (HandlerId(i as u32), h))
    }

    /// Top-level classes in declaration order.
    pub fn roots(&self) -> &[ClassId] {
        &self.roots
    }

    /// Look up a top-level class by name.
    pub fn root_named(&self, name: &str) -> Option<ClassId> {
        self.roots_by_name.get(name).copied()
    }

    /// Register a top-level class.
    pub fn add_root(&mut self, id: ClassId) -> Result<(), ProgramError> {
        let name = self.class(id).name.clone();
        if self.roots_by_name.contains_key(&name) {
            return Err(ProgramError::DuplicateClassName {
                scope: String::new(),
                name,
            });
        }
        self.roots_by_name.insert(name, id);
        self.roots.push(id);
        Ok(())
    }

    /// Attach a named handler to a class and bind its owner.
    pub fn attach_handler(&mut self, class: ClassId, handler: HandlerId) -> Result<(), ProgramError> {
        let name = match &self.handler(handler).name {
            Some(name) => name.clone(),
            None => {
                return Err(ProgramError::WrongSlot {
                    name: String::new(),
                    slot: "named handler",
                })
            }
        };
        if self.class(class).handlers_by_name.contains_key(&name) {
            return Err(ProgramError::DuplicateHandlerName {
                class: self.class(class).name.clone(),
                name,
            });
        }
        self.handler(handler).bind_owner(class)?;
        let entry = &mut self.classes[class.0 as usize];
        entry.handlers_by_name.insert(name, handler);
        entry.handler_order.push(handler);
        Ok(())
    }

    /// Install a class's anonymous default handler and bind its owner.
    pub fn attach_default_handler(
        &mut self,
        class: ClassId,
        handler: HandlerId,
    ) -> Result<(), ProgramError> {
        if let Some(name) = &self.handler(handler).name {
            return Err(ProgramError::WrongSlot {
                name: name.clone(),
                slot: "default handler",
            });
        }
        if self.class(class).default_handler.is_some() {
            return Err(ProgramError::DuplicateDefaultHandler {
                class: self.class(class).name.clone(),
            });
        }
        self.handler(handler).bind_owner(class)?;
        self.classes[class.0 as usize].default_handler = Some(handler);
        Ok(())
    }

    /// Nest `inner` inside `outer` and bind the back-reference.
    pub fn attach_inner_class(
        &mut self,
        outer: ClassId,
        inner: ClassId,
    ) -> Result<(), ProgramError> {
        let name = self.class(inner).name.clone();
        if self.class(outer).inner_by_name.contains_key(&name) {
            return Err(ProgramError::DuplicateClassName {
                scope: self.class(outer).name.clone(),
                name,
            });
        }
        self.class(inner)
            .enclosing
            .set(outer)
            .map_err(|_| ProgramError::ClassRebound { name })?;
        let name = self.class(inner).name.clone();
        let entry = &mut self.classes[outer.0 as usize];
        entry.inner_by_name.insert(name, inner);
        entry.inner_order.push(inner);
        Ok(())
    }
}

impl ClassResolver for Program {
    /// Walk the lexical scope chain: the context class's own inner classes,
    /// then each enclosing scope's, then the top-level classes. A scope's own
    /// name also resolves, so a class can name its siblings and itself.
    fn resolve_class(&self, context: ClassId, name: &str) -> Option<ClassId> {
        let mut scope = Some(context);
        while let Some(current) = scope {
            let class = self.class(current);
            if class.name == name {
                return Some(current);
            }
            if let Some(found) = class.inner_named(name) {
                return Some(found);
            }
            scope = class.enclosing();
        }
        self.root_named(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_class(name: &str) -> Class {
        Class::new(name, Visibility::Public, vec![], vec![])
    }

    #[test]
    fn test_attach_handler_binds_owner_once() {
        let mut program = Program::new();
        let a = program.add_class(empty_class("A"));
        let b = program.add_class(empty_class("B"));
        let h = program.add_handler(MessageHandler::external(
            Visibility::Public,
            "foo:0",
            0,
            "host_foo",
        ));

        program.attach_handler(a, h).unwrap();
        assert_eq!(program.handler(h).owner(), Some(a));
        assert_eq!(program.class(a).handler_named("foo:0"), Some(h));

        assert_eq!(
            program.attach_handler(b, h),
            Err(ProgramError::HandlerRebound {
                name: "foo:0".into()
            })
        );
    }

    #[test]
    fn test_duplicate_handler_name_rejected() {
        let mut program = Program::new();
        let a = program.add_class(empty_class("A"));
        let h1 = program.add_handler(MessageHandler::external(
            Visibility::Public,
            "foo:0",
            0,
            "x",
        ));
        let h2 = program.add_handler(MessageHandler::external(
            Visibility::Public,
            "foo:0",
            0,
            "y",
        ));
        program.attach_handler(a, h1).unwrap();
        assert!(matches!(
            program.attach_handler(a, h2),
            Err(ProgramError::DuplicateHandlerName { .. })
        ));
    }

    #[test]
    fn test_default_slot_requires_anonymous_handler() {
        let mut program = Program::new();
        let a = program.add_class(empty_class("A"));
        let named = program.add_handler(MessageHandler::external(
            Visibility::Public,
            "foo:0",
            0,
            "x",
        ));
        assert!(matches!(
            program.attach_default_handler(a, named),
            Err(ProgramError::WrongSlot { .. })
        ));

        let anon = program.add_handler(MessageHandler::anonymous_default(vec![], vec![], vec![]));
        program.attach_default_handler(a, anon).unwrap();
        assert_eq!(program.class(a).default_handler, Some(anon));

        // Anonymous handlers cannot enter the named table either.
        let anon2 = program.add_handler(MessageHandler::anonymous_default(vec![], vec![], vec![]));
        assert!(matches!(
            program.attach_handler(a, anon2),
            Err(ProgramError::WrongSlot { .. })
        ));
    }

    #[test]
    fn test_scope_resolution_walks_outward() {
        let mut program = Program::new();
        let outer = program.add_class(empty_class("Outer"));
        let inner = program.add_class(empty_class("Inner"));
        let sibling = program.add_class(empty_class("Sibling"));
        let top = program.add_class(empty_class("Top"));
        program.attach_inner_class(outer, inner).unwrap();
        program.attach_inner_class(outer, sibling).unwrap();
        program.add_root(outer).unwrap();
        program.add_root(top).unwrap();

        // Inner sees its sibling through the enclosing scope.
        assert_eq!(program.resolve_class(inner, "Sibling"), Some(sibling));
        // Inner sees top-level classes.
        assert_eq!(program.resolve_class(inner, "Top"), Some(top));
        // A class resolves its own name.
        assert_eq!(program.resolve_class(inner, "Inner"), Some(inner));
        assert_eq!(program.resolve_class(inner, "Missing"), None);
    }

    #[test]
    fn test_inner_class_nests_once() {
        let mut program = Program::new();
        let a = program.add_class(empty_class("A"));
        let b = program.add_class(empty_class("B"));
        let inner = program.add_class(empty_class("Inner"));
        program.attach_inner_class(a, inner).unwrap();
        assert!(matches!(
            program.attach_inner_class(b, inner),
            Err(ProgramError::ClassRebound { .. })
        ));
        assert_eq!(program.class(inner).enclosing(), Some(a));
    }
}
