// File: src/gc.rs
//
// The object arena and tracing mark-sweep collector. Every heap object
// lives in `Heap.objects`, indexed by `ObjHandle`. A freed slot becomes
// `None` and is never reused for a different generation of object while
// any stale handle to it could still be read — handles to swept objects
// simply must not be dereferenced again, which the VM guarantees by
// only ever holding handles reachable from its roots.
//
// This mirrors the C original's intrusive `next`-linked allocation list
// one to one, substituting arena indices for raw pointers per the
// design notes' cycle-safety strategy.

use crate::table::Table;
use crate::value::{
    fnv1a_hash, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjHandle, ObjInstance,
    ObjKind, ObjNative, ObjPayload, ObjString, ObjUpvalue, UpvalueState, Value,
};

const GC_HEAP_GROW_FACTOR: usize = 2;
const INITIAL_NEXT_GC: usize = 1024 * 1024;

struct Slot {
    payload: Option<ObjPayload>,
    is_marked: bool,
}

/// Anything that can hand the collector its set of live roots. The VM
/// and, during compilation, the compiler chain both implement this so
/// that allocation can trigger a collection from either side per the
/// reentrancy requirement in the spec's concurrency section.
pub trait RootSource {
    fn mark_roots(&self, heap: &mut Heap);
}

pub struct Heap {
    objects: Vec<Slot>,
    free_list: Vec<ObjHandle>,
    pub strings: Table,
    gray_stack: Vec<ObjHandle>,
    pub bytes_allocated: usize,
    pub next_gc: usize,
    pub stress_gc: bool,
    pub log_gc: bool,
}

/// Rough per-kind size used for the `bytes_allocated` accounting; exact
/// byte counts don't matter, only that growth is monotonic with real
/// allocation so the growth-factor heuristic behaves sensibly.
fn approx_size(payload: &ObjPayload) -> usize {
    match payload {
        ObjPayload::String(s) => 32 + s.chars.len(),
        ObjPayload::Function(_) => 96,
        ObjPayload::Native(_) => 48,
        ObjPayload::Closure(c) => 32 + c.upvalues.len() * 8,
        ObjPayload::Upvalue(_) => 32,
        ObjPayload::Class(_) => 64,
        ObjPayload::Instance(_) => 48,
        ObjPayload::BoundMethod(_) => 32,
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            objects: Vec::new(),
            free_list: Vec::new(),
            strings: Table::new(),
            gray_stack: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            stress_gc: cfg!(feature = "stress_gc"),
            log_gc: false,
        }
    }

    pub fn get(&self, handle: ObjHandle) -> &ObjPayload {
        self.objects[handle]
            .payload
            .as_ref()
            .expect("dereferenced a freed object handle")
    }

    pub fn get_mut(&mut self, handle: ObjHandle) -> &mut ObjPayload {
        self.objects[handle]
            .payload
            .as_mut()
            .expect("dereferenced a freed object handle")
    }

    pub fn kind_of(&self, handle: ObjHandle) -> ObjKind {
        self.get(handle).kind()
    }

    /// Routes every allocation through here, per spec's `allocate(size,
    /// kind)`: threads the object onto the arena and may trigger a
    /// collection. Roots must already reflect any pending work before
    /// calling this — in particular, values not yet reachable from a
    /// root (e.g. a freshly built string about to be inserted into a
    /// table) must be pushed onto the VM stack first.
    fn allocate(&mut self, payload: ObjPayload, roots: &impl RootSource) -> ObjHandle {
        let size = approx_size(&payload);
        self.bytes_allocated += size;

        let should_collect = self.stress_gc || self.bytes_allocated > self.next_gc;
        if should_collect {
            self.collect_garbage(roots);
        }

        if let Some(handle) = self.free_list.pop() {
            self.objects[handle] = Slot { payload: Some(payload), is_marked: false };
            handle
        } else {
            self.objects.push(Slot { payload: Some(payload), is_marked: false });
            self.objects.len() - 1
        }
    }

    // --- Typed constructors -------------------------------------------------

    pub fn new_function(&mut self, function: ObjFunction, roots: &impl RootSource) -> ObjHandle {
        self.allocate(ObjPayload::Function(function), roots)
    }

    pub fn new_native(&mut self, native: ObjNative, roots: &impl RootSource) -> ObjHandle {
        self.allocate(ObjPayload::Native(native), roots)
    }

    pub fn new_closure(&mut self, closure: ObjClosure, roots: &impl RootSource) -> ObjHandle {
        self.allocate(ObjPayload::Closure(closure), roots)
    }

    pub fn new_upvalue(&mut self, slot: usize, roots: &impl RootSource) -> ObjHandle {
        self.allocate(
            ObjPayload::Upvalue(ObjUpvalue { state: UpvalueState::Open(slot), next: None }),
            roots,
        )
    }

    pub fn new_class(&mut self, name: ObjHandle, roots: &impl RootSource) -> ObjHandle {
        self.allocate(ObjPayload::Class(ObjClass::new(name)), roots)
    }

    pub fn new_instance(&mut self, class: ObjHandle, roots: &impl RootSource) -> ObjHandle {
        self.allocate(ObjPayload::Instance(ObjInstance::new(class)), roots)
    }

    pub fn new_bound_method(&mut self, receiver: Value, method: ObjHandle, roots: &impl RootSource) -> ObjHandle {
        self.allocate(ObjPayload::BoundMethod(ObjBoundMethod { receiver, method }), roots)
    }

    /// Interns a byte string. Hits return the canonical handle; misses
    /// allocate and insert. The freshly allocated string is pushed as a
    /// value-root argument the caller must stash (see `with_temp_root`)
    /// across the table insert, since inserting can itself grow the
    /// table and allocate.
    pub fn intern_string(&mut self, bytes: &str, roots: &impl RootSource) -> ObjHandle {
        let hash = fnv1a_hash(bytes.as_bytes());
        if let Some(existing) = self.find_interned(bytes.as_bytes(), hash) {
            return existing;
        }
        let handle = self.allocate(
            ObjPayload::String(ObjString { hash, chars: bytes.to_string() }),
            roots,
        );
        self.strings.set(handle, hash, Value::Nil);
        handle
    }

    fn find_interned(&self, bytes: &[u8], hash: u32) -> Option<ObjHandle> {
        self.strings.find_string(bytes, hash, |h| match self.get(h) {
            ObjPayload::String(s) => s.chars.as_bytes().to_vec(),
            _ => unreachable!("intern table holds only string handles"),
        })
    }

    pub fn as_str(&self, handle: ObjHandle) -> &str {
        match self.get(handle) {
            ObjPayload::String(s) => &s.chars,
            _ => panic!("handle is not a string"),
        }
    }

    // --- Marking / tracing ---------------------------------------------------

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(handle) = value {
            self.mark_object(handle);
        }
    }

    pub fn mark_object(&mut self, handle: ObjHandle) {
        let slot = &mut self.objects[handle];
        if slot.is_marked || slot.payload.is_none() {
            return;
        }
        slot.is_marked = true;
        // Leaf kinds never need blackening; skip the gray stack for them.
        match slot.payload.as_ref().unwrap() {
            ObjPayload::String(_) | ObjPayload::Native(_) => {}
            _ => self.gray_stack.push(handle),
        }
    }

    fn mark_table(&mut self, table: &Table) {
        let entries: Vec<(ObjHandle, Value)> = table.iter().collect();
        for (key, value) in entries {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    fn blacken_object(&mut self, handle: ObjHandle) {
        // Extract only the handles/values this object references before
        // recursing into `mark_*`, which needs `&mut self` and so can't
        // run while still borrowing `self.objects[handle]`.
        enum Refs {
            Function { name: Option<ObjHandle>, constants: Vec<Value> },
            Closure { function: ObjHandle, upvalues: Vec<ObjHandle> },
            ClosedUpvalue(Value),
            Class { name: ObjHandle, methods: Table, cached_init: Option<ObjHandle> },
            Instance { class: ObjHandle, fields: Table },
            BoundMethod { receiver: Value, method: ObjHandle },
            None,
        }

        let refs = match self.objects[handle].payload.as_ref() {
            Some(ObjPayload::Function(f)) => {
                Refs::Function { name: f.name, constants: f.chunk.constants.clone() }
            }
            Some(ObjPayload::Closure(c)) => {
                Refs::Closure { function: c.function, upvalues: c.upvalues.clone() }
            }
            Some(ObjPayload::Upvalue(u)) => match u.state {
                UpvalueState::Closed(v) => Refs::ClosedUpvalue(v),
                UpvalueState::Open(_) => Refs::None,
            },
            Some(ObjPayload::Class(c)) => {
                Refs::Class { name: c.name, methods: c.methods.clone(), cached_init: c.cached_init }
            }
            Some(ObjPayload::Instance(i)) => Refs::Instance { class: i.class, fields: i.fields.clone() },
            Some(ObjPayload::BoundMethod(b)) => Refs::BoundMethod { receiver: b.receiver, method: b.method },
            Some(ObjPayload::String(_)) | Some(ObjPayload::Native(_)) | None => Refs::None,
        };

        match refs {
            Refs::Function { name, constants } => {
                if let Some(name) = name {
                    self.mark_object(name);
                }
                for constant in constants {
                    self.mark_value(constant);
                }
            }
            Refs::Closure { function, upvalues } => {
                self.mark_object(function);
                for upvalue in upvalues {
                    self.mark_object(upvalue);
                }
            }
            Refs::ClosedUpvalue(v) => self.mark_value(v),
            Refs::Class { name, methods, cached_init } => {
                self.mark_object(name);
                self.mark_table(&methods);
                if let Some(init) = cached_init {
                    self.mark_object(init);
                }
            }
            Refs::Instance { class, fields } => {
                self.mark_object(class);
                self.mark_table(&fields);
            }
            Refs::BoundMethod { receiver, method } => {
                self.mark_value(receiver);
                self.mark_object(method);
            }
            Refs::None => {}
        }
    }

    fn trace_references(&mut self) {
        while let Some(handle) = self.gray_stack.pop() {
            self.blacken_object(handle);
        }
    }

    fn sweep(&mut self) {
        for handle in 0..self.objects.len() {
            let slot = &mut self.objects[handle];
            if slot.payload.is_none() {
                continue;
            }
            if slot.is_marked {
                slot.is_marked = false;
            } else {
                let freed = slot.payload.take().unwrap();
                self.bytes_allocated -= approx_size(&freed);
                self.free_list.push(handle);
            }
        }
    }

    pub fn collect_garbage(&mut self, roots: &impl RootSource) {
        roots.mark_roots(self);
        self.trace_references();
        let is_marked = |h: ObjHandle| self.objects.get(h).map(|s| s.is_marked).unwrap_or(false);
        // Clone because `remove_white` needs to borrow `self.strings`
        // mutably while the closure borrows `self.objects` immutably;
        // the intern table itself is small relative to the heap.
        let mut strings = std::mem::take(&mut self.strings);
        strings.remove_white(is_marked);
        self.strings = strings;
        self.sweep();
        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
        if self.next_gc < INITIAL_NEXT_GC {
            self.next_gc = INITIAL_NEXT_GC;
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.iter().filter(|s| s.payload.is_some()).count()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoRoots;
    impl RootSource for NoRoots {
        fn mark_roots(&self, _heap: &mut Heap) {}
    }

    #[test]
    fn interning_returns_same_handle_for_equal_bytes() {
        let mut heap = Heap::new();
        let a = heap.intern_string("hello", &NoRoots);
        let b = heap.intern_string("hello", &NoRoots);
        assert_eq!(a, b);
        let c = heap.intern_string("world", &NoRoots);
        assert_ne!(a, c);
    }

    #[test]
    fn unreachable_object_is_collected_and_reachable_survives() {
        let mut heap = Heap::new();
        let keep = heap.intern_string("keep", &NoRoots);
        let _drop_me = heap.intern_string("drop_me", &NoRoots);

        struct KeepOneRoot(ObjHandle);
        impl RootSource for KeepOneRoot {
            fn mark_roots(&self, heap: &mut Heap) {
                heap.mark_object(self.0);
            }
        }

        heap.collect_garbage(&KeepOneRoot(keep));
        assert_eq!(heap.as_str(keep), "keep");
        assert_eq!(heap.object_count(), 1);
    }
}
