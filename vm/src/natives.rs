//! Native (Rust-implemented) globals. Lumen ships exactly one: `clock()`,
//! a wall-clock reader for benchmarking scripts, the only standard library
//! function this language provides.

use compiler::chunk::value::{NativeFn, Obj, ObjNative, Value};
use compiler::heap::Heap;
use compiler::table::Table;
use std::time::{SystemTime, UNIX_EPOCH};

fn clock(_args: &[Value]) -> Result<Value, String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| "system clock is before the Unix epoch".to_string())?;
    Ok(Value::Number(now.as_secs_f64()))
}

pub fn define_all(heap: &mut Heap, globals: &mut Table) {
    define(heap, globals, "clock", 0, clock);
}

fn define(heap: &mut Heap, globals: &mut Table, name: &'static str, arity: u8, function: NativeFn) {
    let name_ref = heap.intern_string(name);
    let native_ref = heap.alloc_object(Obj::Native(ObjNative { function, arity, name }));
    globals.set(name_ref, Value::Object(native_ref));
}
