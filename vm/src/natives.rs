//! Native methods implemented by the runtime itself.
//!
//! A native pops its arguments from the calling frame's operand stacks and
//! pushes its result there. Faults are thrown, never returned.

use log::trace;

use crate::Vm;
use crate::arrays;

pub type NativeFn = fn(&mut Vm);

const NATIVES: &[(&str, NativeFn)] = &[
    ("java.lang.System.arraycopy", system_arraycopy),
    ("java.lang.System.currentTimeMillis", system_current_time_millis),
];

pub fn lookup(name: &str) -> Option<NativeFn> {
    NATIVES.iter().find(|(n, _)| *n == name).map(|&(_, f)| f)
}

/// `System.arraycopy(src, srcPos, dst, dstPos, length)`.
pub fn system_arraycopy(vm: &mut Vm) {
    let length = vm.pop_int();
    let dst_pos = vm.pop_int();
    let dst = vm.pop_ref();
    let src_pos = vm.pop_int();
    let src = vm.pop_ref();

    if let Err(fault) = arrays::copy(&mut vm.heap, &*vm.metadata, src, src_pos, dst, dst_pos, length) {
        trace!("arraycopy failed: {fault}");
        vm.create_and_throw(fault);
    }
}

/// `System.currentTimeMillis()`.
pub fn system_current_time_millis(vm: &mut Vm) {
    let now = vm.clock.now_millis();
    vm.push_long(now);
}
