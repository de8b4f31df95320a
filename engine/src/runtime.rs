//! Emulated thread-local storage.
//!
//! Every thread-local variable of generated code is described by a control
//! block `{size, align, index, template}` of pointer-sized words. The first
//! access from a thread allocates that thread's instance and copies the
//! template into it; instances are freed when the thread exits or when the
//! owning module's finalizer releases them.
//!
//! Slot indices are recycled. A destroyed region hands its indices back
//! with [`release_slots`], which bumps each slot's generation; threads drop
//! instances of an older generation before they touch any slot again.

use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Layout of the control block emitted by the frontend.
#[repr(C)]
pub struct EmutlsControl {
    pub size: usize,
    pub align: usize,
    /// Zero until the first access assigns a slot.
    pub index: AtomicUsize,
    pub template: *const u8,
}

struct Instance {
    ptr: NonNull<u8>,
    layout: Layout,
    generation: u64,
}

impl Drop for Instance {
    fn drop(&mut self) {
        // SAFETY: allocated with this layout in `instantiate`
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Process-wide slot allocation. Index 0 means "unassigned".
struct SlotTable {
    generations: Vec<u64>,
    free: Vec<usize>,
}

impl SlotTable {
    fn allocate(&mut self) -> usize {
        if let Some(index) = self.free.pop() {
            return index;
        }
        if self.generations.is_empty() {
            self.generations.push(0);
        }
        self.generations.push(0);
        self.generations.len() - 1
    }

    fn generation(&self, index: usize) -> u64 {
        self.generations.get(index).copied().unwrap_or_default()
    }
}

static SLOTS: Mutex<SlotTable> = parking_lot::const_mutex(SlotTable {
    generations: Vec::new(),
    free: Vec::new(),
});

/// Bumped by every release; threads that saw an older value sweep.
static RELEASES: AtomicUsize = AtomicUsize::new(0);

#[derive(Default)]
struct ThreadSlots {
    seen: usize,
    instances: Vec<Option<Instance>>,
}

impl ThreadSlots {
    fn sweep(&mut self) {
        let releases = RELEASES.load(Ordering::Acquire);
        if releases == self.seen {
            return;
        }
        let slots = SLOTS.lock();
        for (index, slot) in self.instances.iter_mut().enumerate() {
            if slot
                .as_ref()
                .is_some_and(|instance| instance.generation != slots.generation(index))
            {
                slot.take();
            }
        }
        self.seen = releases;
    }
}

thread_local! {
    static INSTANCES: RefCell<ThreadSlots> = RefCell::new(ThreadSlots::default());
}

fn slot_index(control: &EmutlsControl) -> usize {
    let index = control.index.load(Ordering::Acquire);
    if index != 0 {
        return index;
    }
    let mut slots = SLOTS.lock();
    // another thread may have assigned it while we waited
    let index = control.index.load(Ordering::Acquire);
    if index != 0 {
        return index;
    }
    let fresh = slots.allocate();
    control.index.store(fresh, Ordering::Release);
    fresh
}

fn instantiate(control: &EmutlsControl, generation: u64) -> Option<Instance> {
    let layout = Layout::from_size_align(control.size.max(1), control.align.max(1)).ok()?;
    // SAFETY: layout has a non-zero size
    let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
    if !control.template.is_null() {
        // SAFETY: the template object spans `size` bytes
        unsafe { ptr::copy_nonoverlapping(control.template, ptr.as_ptr(), control.size) };
    }
    Some(Instance {
        ptr,
        layout,
        generation,
    })
}

/// Address of the calling thread's instance, or null if it cannot be
/// allocated.
///
/// # Safety
/// `control` must point to a live control block.
pub unsafe extern "C" fn emutls_get_address(control: *mut EmutlsControl) -> *mut u8 {
    // SAFETY: forwarded contract
    let Some(control) = (unsafe { control.as_ref() }) else {
        return ptr::null_mut();
    };
    let index = slot_index(control);
    INSTANCES
        .try_with(|instances| {
            let mut instances = instances.borrow_mut();
            instances.sweep();
            if instances.instances.len() <= index {
                instances.instances.resize_with(index + 1, || None);
            }
            if instances.instances[index].is_none() {
                let generation = SLOTS.lock().generation(index);
                instances.instances[index] = instantiate(control, generation);
            }
            instances.instances[index]
                .as_ref()
                .map_or(ptr::null_mut(), |instance| instance.ptr.as_ptr())
        })
        .unwrap_or(ptr::null_mut())
}

/// Frees the calling thread's instance; the next access starts over from
/// the template.
///
/// # Safety
/// `control` must point to a live control block.
pub unsafe extern "C" fn emutls_release(control: *mut EmutlsControl) {
    // SAFETY: forwarded contract
    let Some(control) = (unsafe { control.as_ref() }) else {
        return;
    };
    let index = control.index.load(Ordering::Acquire);
    if index == 0 {
        return;
    }
    let _ = INSTANCES.try_with(|instances| {
        if let Some(slot) = instances.borrow_mut().instances.get_mut(index) {
            slot.take();
        }
    });
}

/// Hands the slots of control blocks that are about to be unmapped back
/// for reuse. Instances other threads still hold are dropped on their next
/// access; the calling thread's are dropped now.
///
/// # Safety
/// Every pointer must refer to a live control block that no thread
/// accesses again.
pub unsafe fn release_slots(controls: &[*const EmutlsControl]) {
    let mut released = Vec::new();
    {
        let mut slots = SLOTS.lock();
        for control in controls {
            // SAFETY: forwarded contract
            let Some(control) = (unsafe { control.as_ref() }) else {
                continue;
            };
            let index = control.index.swap(0, Ordering::AcqRel);
            if index == 0 || index >= slots.generations.len() {
                continue;
            }
            slots.generations[index] += 1;
            slots.free.push(index);
            released.push(index);
        }
        if !released.is_empty() {
            RELEASES.fetch_add(1, Ordering::AcqRel);
        }
    }
    if !released.is_empty() {
        log::debug!("released {} thread-local slots", released.len());
        let _ = INSTANCES.try_with(|instances| instances.borrow_mut().sweep());
    }
}

/// Slots currently handed out to control blocks.
pub fn live_slots() -> usize {
    let slots = SLOTS.lock();
    slots.generations.len().saturating_sub(1) - slots.free.len()
}

/// Instances the calling thread holds.
pub fn thread_instances() -> usize {
    INSTANCES
        .try_with(|instances| instances.borrow().instances.iter().flatten().count())
        .unwrap_or_default()
}

/// Runtime entry points generated code links against.
pub fn runtime_symbols() -> [(&'static str, usize); 2] {
    [
        ("__emutls_get_address", emutls_get_address as usize),
        ("__emutls_release", emutls_release as usize),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    fn control(template: &'static [u8; 8]) -> Box<EmutlsControl> {
        Box::new(EmutlsControl {
            size: 8,
            align: 8,
            index: AtomicUsize::new(0),
            template: template.as_ptr(),
        })
    }

    fn read(control: &mut EmutlsControl) -> (usize, u64) {
        // SAFETY: control block outlives the call, instance holds 8 bytes
        unsafe {
            let p = emutls_get_address(control);
            (p as usize, p.cast::<u64>().read_unaligned())
        }
    }

    #[test]
    fn instances_start_from_the_template() {
        static TEMPLATE: [u8; 8] = 41u64.to_le_bytes();
        let mut block = control(&TEMPLATE);
        let (first, value) = read(&mut block);
        assert_eq!(value, 41);
        assert_ne!(block.index.load(Ordering::Relaxed), 0);

        // SAFETY: the instance is live and 8 bytes wide
        unsafe { (first as *mut u64).write_unaligned(99) };
        let (again, value) = read(&mut block);
        assert_eq!(again, first);
        assert_eq!(value, 99);

        // SAFETY: block is live
        unsafe { emutls_release(&mut *block) };
        assert_eq!(read(&mut block).1, 41);
    }

    #[test]
    fn threads_get_distinct_instances() {
        static TEMPLATE: [u8; 8] = 7u64.to_le_bytes();
        let block = control(&TEMPLATE);
        let shared = &*block as *const EmutlsControl as usize;

        let here = read(&mut *Box::leak(block)).0;
        let there = thread::spawn(move || {
            // SAFETY: the leaked block lives for the rest of the test
            let p = unsafe { emutls_get_address(shared as *mut EmutlsControl) };
            p as usize
        })
        .join()
        .unwrap();
        assert_ne!(here, 0);
        assert_ne!(there, 0);
        assert_ne!(here, there);
    }

    #[test]
    fn released_slots_are_recycled() {
        static TEMPLATE: [u8; 8] = 3u64.to_le_bytes();
        let mut block = control(&TEMPLATE);
        let before = thread_instances();
        read(&mut block);
        let index = block.index.load(Ordering::Relaxed);
        let generation = SLOTS.lock().generation(index);
        assert_eq!(thread_instances(), before + 1);

        // SAFETY: the block is never accessed through the old slot again
        unsafe { release_slots(&[&*block as *const EmutlsControl]) };
        assert_eq!(block.index.load(Ordering::Relaxed), 0);
        assert_eq!(thread_instances(), before);
        assert!(SLOTS.lock().generation(index) > generation);

        // the same block starts over from the template in a fresh slot
        assert_eq!(read(&mut block).1, 3);
        unsafe { release_slots(&[&*block as *const EmutlsControl]) };
    }

    #[test]
    fn other_threads_drop_released_instances() {
        static TEMPLATE: [u8; 8] = 5u64.to_le_bytes();
        let first = Box::leak(control(&TEMPLATE)) as *mut EmutlsControl as usize;
        let second = Box::leak(control(&TEMPLATE)) as *mut EmutlsControl as usize;
        let (touched_tx, touched) = mpsc::channel();
        let (released_tx, released) = mpsc::channel::<()>();

        let worker = thread::spawn(move || {
            // SAFETY: both blocks are leaked and outlive the thread
            unsafe { emutls_get_address(first as *mut EmutlsControl) };
            touched_tx.send(thread_instances()).unwrap();
            released.recv().unwrap();
            unsafe { emutls_get_address(second as *mut EmutlsControl) };
            thread_instances()
        });

        assert_eq!(touched.recv().unwrap(), 1);
        // SAFETY: the worker never touches `first` again
        unsafe { release_slots(&[first as *const EmutlsControl]) };
        released_tx.send(()).unwrap();
        assert_eq!(worker.join().unwrap(), 1);
    }

    #[test]
    fn runtime_symbol_names() {
        let names: Vec<_> = runtime_symbols().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, ["__emutls_get_address", "__emutls_release"]);
    }
}
