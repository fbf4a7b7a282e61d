//! Safe pointers.
//!
//! Host code that holds a `Ref` across an allocation must protect it: the
//! allocation may collect, and only references reachable from the VM roots
//! are relocated. Protected slots form a stack released in LIFO order.

use object::Ref;

use crate::Vm;

/// A slot on the VM's safe pointer stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafePointer(usize);

impl Vm {
    pub fn protect(&mut self, r: Ref) -> SafePointer {
        self.roots.safe.push(r);
        SafePointer(self.roots.safe.len() - 1)
    }

    /// Current value of a protected reference, relocated if a collection
    /// ran since it was protected.
    pub fn protected(&self, slot: SafePointer) -> Ref {
        self.roots.safe[slot.0]
    }

    pub fn set_protected(&mut self, slot: SafePointer, r: Ref) {
        self.roots.safe[slot.0] = r;
    }

    /// Release `slot` and every slot protected after it.
    pub fn release(&mut self, slot: SafePointer) {
        debug_assert!(slot.0 < self.roots.safe.len(), "slot released twice");
        self.roots.safe.truncate(slot.0);
    }

    pub fn protected_count(&self) -> usize {
        self.roots.safe.len()
    }
}
