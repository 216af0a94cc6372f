//! Simulated machine for unit tests
//!
//! [`SimHal`] implements [`Hal`] on the host: a manually advanced cycle
//! counter (one cycle per nanosecond), one interrupt mask per processor, and
//! logs of every software interrupt, one-shot timer, address-space switch and
//! context switch the executive asks for.
//!
//! # Context switches
//!
//! There is only one host stack, so a switch cannot really leave the thread
//! that asked for it. Instead [`SimHal::swap_context`] runs the hook
//! installed with [`TestSystem::on_next_switch`] in place: the hook plays
//! the part of "everything that happens while the old thread is switched
//! out", then ends its quantum so the scheduler can switch back. A switch
//! with no hook returns at once, as if the new thread immediately handed the
//! processor back.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::Cell;
use core::mem::offset_of;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{ArchThreadState, Hal, ThreadContext, ThreadEntry};
use crate::ke::irql::levels::PASSIVE_LEVEL;
use crate::ke::irql::{DispatchLevel, IrqlToken, Kirql};
use crate::ke::kernel::{idle_thread_routine, Kernel, KernelConfig};
use crate::ke::process::{KProcess, PriorityClass, ThreadPriority};
use crate::ke::thread::{KThread, ThreadStartRoutine};
use crate::ke::KeError;

/// Consecutive hookless switches after which the simulation gives up
const LIVELOCK_SWITCHES: u32 = 10_000;

std::thread_local! {
    static PROCESSOR: Cell<usize> = const { Cell::new(0) };
}

type SwitchHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct SimState {
    masks: Vec<Kirql>,
    software_interrupts: Vec<(usize, Kirql)>,
    oneshots: Vec<u64>,
    address_spaces: Vec<u64>,
    /// Context pointer of every switch target
    switches: Vec<usize>,
    hookless_switches: u32,
    user_memory: BTreeMap<u64, u8>,
    fail_user_copies: bool,
}

/// Host-side stand-in for the machine
pub struct SimHal {
    cycles: AtomicU64,
    state: Mutex<SimState>,
    hook: Mutex<Option<SwitchHook>>,
}

impl SimHal {
    pub fn new(processors: usize) -> Self {
        Self {
            cycles: AtomicU64::new(0),
            state: Mutex::new(SimState {
                masks: alloc::vec![PASSIVE_LEVEL; processors],
                ..SimState::default()
            }),
            hook: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        // A failed assertion inside a hook must not hide the original panic
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move the clock forward
    pub fn advance(&self, nanoseconds: u64) {
        self.cycles.fetch_add(nanoseconds, Ordering::SeqCst);
    }

    /// Interrupt mask of the executing processor
    pub fn mask(&self) -> Kirql {
        let cpu = self.processor_number();
        self.state().masks.get(cpu).copied().unwrap_or(PASSIVE_LEVEL)
    }

    /// Run `f` as processor `cpu`
    pub fn run_on<R>(&self, cpu: usize, f: impl FnOnce() -> R) -> R {
        let previous = PROCESSOR.with(|p| p.replace(cpu));
        struct Restore(usize);
        impl Drop for Restore {
            fn drop(&mut self) {
                PROCESSOR.with(|p| p.set(self.0));
            }
        }
        let _restore = Restore(previous);
        f()
    }

    pub fn software_interrupts(&self) -> Vec<(usize, Kirql)> {
        self.state().software_interrupts.clone()
    }

    pub fn oneshots(&self) -> Vec<u64> {
        self.state().oneshots.clone()
    }

    pub fn address_spaces(&self) -> Vec<u64> {
        self.state().address_spaces.clone()
    }

    pub fn switch_count(&self) -> usize {
        self.state().switches.len()
    }

    fn switches(&self) -> Vec<usize> {
        self.state().switches.clone()
    }

    /// Make every later user-mode copy fault
    pub fn fail_user_copies(&self, fail: bool) {
        self.state().fail_user_copies = fail;
    }

    /// Read back simulated user memory (unwritten bytes read as zero)
    pub fn read_user(&self, address: u64, len: usize) -> Vec<u8> {
        let state = self.state();
        (address..address + len as u64)
            .map(|a| state.user_memory.get(&a).copied().unwrap_or(0))
            .collect()
    }

    fn set_hook(&self, hook: SwitchHook) {
        *self.hook.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(hook);
    }
}

impl Hal for SimHal {
    fn processor_number(&self) -> usize {
        PROCESSOR.with(|p| p.get())
    }

    fn set_irql(&self, irql: Kirql) {
        let cpu = self.processor_number();
        if let Some(mask) = self.state().masks.get_mut(cpu) {
            *mask = irql;
        }
    }

    fn request_software_interrupt(&self, processor: usize, irql: Kirql) {
        self.state().software_interrupts.push((processor, irql));
    }

    fn read_cycle_counter(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    fn cycles_to_nanoseconds(&self, cycles: u64) -> u64 {
        cycles
    }

    fn arm_oneshot(&self, microseconds: u64) {
        self.state().oneshots.push(microseconds);
    }

    fn switch_address_space(&self, directory_table_base: u64) {
        self.state().address_spaces.push(directory_table_base);
    }

    unsafe fn switch_thread_state(&self, _old: &mut ArchThreadState, _new: &ArchThreadState) {}

    unsafe fn swap_context(&self, _old: &mut ThreadContext, new: &ThreadContext) {
        self.state().switches.push(new as *const ThreadContext as usize);

        let hook = self.hook.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        match hook {
            Some(hook) => {
                self.state().hookless_switches = 0;
                hook();
            }
            None => {
                let mut state = self.state();
                state.hookless_switches += 1;
                if state.hookless_switches > LIVELOCK_SWITCHES {
                    drop(state);
                    panic!("simulated processor livelock");
                }
            }
        }
    }

    unsafe fn init_thread_context(
        &self,
        context: &mut ThreadContext,
        arch: &mut ArchThreadState,
        stack_top: *mut u8,
        _entry: ThreadEntry,
    ) {
        context.stack_pointer = stack_top as u64;
        arch.kernel_stack_top = stack_top as u64;
    }

    unsafe fn copy_to_user(&self, destination: u64, source: &[u8]) -> Result<(), KeError> {
        let mut state = self.state();
        if state.fail_user_copies {
            return Err(KeError::AccessViolation);
        }
        for (address, byte) in (destination..).zip(source) {
            state.user_memory.insert(address, *byte);
        }
        Ok(())
    }
}

/// Raw pointer that may be moved into a switch hook
#[derive(Clone, Copy)]
pub struct SendPtr<T>(pub *mut T);

unsafe impl<T> Send for SendPtr<T> {}

fn noop(_context: usize) {}

/// A booted kernel on a [`SimHal`]
///
/// The test body runs as the `main` thread on processor 0; every other
/// processor sits in its idle thread.
pub struct TestSystem {
    pub hal: &'static SimHal,
    pub kernel: &'static Kernel,
    pub process: Arc<KProcess>,
    pub main_thread: *mut KThread,
    pub idle_threads: Vec<*mut KThread>,
}

impl TestSystem {
    /// Test configuration: 1ms quanta, 1ms timer
    pub fn config(processors: usize) -> KernelConfig {
        KernelConfig {
            processor_count: processors,
            quantum_cycles: 1_000_000,
            quantum_timer_us: 1_000,
            kernel_stack_size: 16384,
        }
    }

    pub fn new(processors: usize) -> Self {
        Self::with_config(Self::config(processors))
    }

    pub fn with_config(config: KernelConfig) -> Self {
        let processors = config.processor_count.max(1);
        let hal: &'static SimHal = Box::leak(Box::new(SimHal::new(processors)));
        let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new(hal, config)));
        let process = Arc::new(KProcess::new(1, 0x1000, PriorityClass::Normal));

        let main_thread = KThread::adopt_current(kernel, &process, "main", ThreadPriority::TimeCritical)
            .expect("main thread");

        let idle_threads: Vec<*mut KThread> = (0..processors)
            .map(|cpu| {
                let idle = KThread::create(kernel, &process, "idle", ThreadPriority::Idle, idle_thread_routine, 0)
                    .expect("idle thread");
                let initial = if cpu == 0 { main_thread } else { idle };
                hal.run_on(cpu, || unsafe { kernel.start_processor(cpu, idle, initial) });
                idle
            })
            .collect();

        Self {
            hal,
            kernel,
            process,
            main_thread,
            idle_threads,
        }
    }

    /// Create an Initialized thread in the test process
    pub fn spawn(&self, name: &'static str, priority: ThreadPriority) -> *mut KThread {
        self.spawn_with(name, priority, noop)
    }

    pub fn spawn_with(&self, name: &'static str, priority: ThreadPriority, routine: ThreadStartRoutine) -> *mut KThread {
        KThread::create(self.kernel, &self.process, name, priority, routine, 0).expect("spawn")
    }

    /// Create a thread and make it Ready
    pub fn spawn_ready(&self, name: &'static str, priority: ThreadPriority) -> *mut KThread {
        let thread = self.spawn(name, priority);
        self.kernel.ready_thread(thread);
        thread
    }

    /// Run `f` during the next context switch, then end the quantum of
    /// whatever was switched to
    pub fn on_next_switch(&self, f: impl FnOnce() + Send + 'static) {
        let ke = self.kernel;
        self.hal.set_hook(Box::new(move || {
            // SAFETY: a switch just landed on this processor
            unsafe { ke.finish_switch() };
            f();
            let irql = unsafe { IrqlToken::<DispatchLevel>::assume() };
            unsafe { ke.handle_quantum_end(&irql) };
        }));
    }

    /// Threads switched to so far, oldest first
    pub fn switch_targets(&self) -> Vec<*mut KThread> {
        self.hal
            .switches()
            .into_iter()
            .map(|context| (context - offset_of!(KThread, context)) as *mut KThread)
            .collect()
    }

    pub fn software_interrupts(&self) -> Vec<(usize, Kirql)> {
        self.hal.software_interrupts()
    }
}
