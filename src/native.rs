// File: src/native.rs
//
// Built-in functions installed into the global table at VM startup,
// grounded on the teacher's pattern of registering `NativeFunction`
// values by name before running any user code. Each native is a plain
// `fn(&[Value]) -> Result<Value, String>` per `value::NativeFn` — no
// heap access, so none of these can allocate or trigger a collection.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::value::Value;
use crate::vm::Vm;

pub fn define_natives(vm: &mut Vm) {
    vm.define_native("clock", 0, clock);
}

/// Seconds since the Unix epoch, as a float — mirrors the C original's
/// `clock() / CLOCKS_PER_SEC` native, used by Lox benchmark scripts to
/// time themselves.
fn clock(_args: &[Value]) -> Result<Value, String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| "system clock is before the Unix epoch".to_string())?;
    Ok(Value::Number(now.as_secs_f64()))
}
