//! procscope: remote process introspection for Linux/Android.
//!
//! The engine attaches to a live process by pid, reconstructs its loaded
//! shared objects from the dynamic linker's link map, indexes their symbols,
//! reads and writes the tracee's memory, synthesizes function calls inside
//! it, and enumerates its malloc heap through an injected callback.
//!
//! [`session::Session`] is the root object; everything else hangs off it.

#[macro_use]
extern crate lazy_static;

pub mod call;
pub mod consts;
pub mod dlsym;
pub mod elf;
pub mod heap;
pub mod linkmap;
pub mod proc;
pub mod reflection;
pub mod regs;
pub mod remote;
pub mod session;
pub mod symbols;
pub mod tracer;
