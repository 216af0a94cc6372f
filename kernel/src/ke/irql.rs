//! IRQL (Interrupt Request Level) management
//!
//! Every processor carries an IRQL that gates which interrupt sources and
//! which deferred work may run on it:
//!
//! - PASSIVE_LEVEL (0): normal thread execution
//! - APC_LEVEL (1): kernel APC delivery masked
//! - DISPATCH_LEVEL (2): the scheduler and DPCs; no thread preemption
//! - Device levels (3-12): hardware interrupts
//! - CLOCK_LEVEL (13), IPI_LEVEL (14)
//! - HIGH_LEVEL (15): everything masked
//!
//! The numbering is the x64 one, so the level can be written straight into
//! CR8.
//!
//! The one rule everything else relies on: lowering from DISPATCH_LEVEL or
//! above to below it first drains the processor's DPC queue and performs any
//! pending quantum-end or preemption switch, and only then unmasks. Nothing at
//! or above DISPATCH_LEVEL is ever preempted.
//!
//! Typed raises hand back an [`IrqlToken`] that the matching lower consumes.
//! The token's level parameter is what spin locks demand before they can be
//! taken without raising.

use core::marker::PhantomData;
use super::bugcheck::{codes, ke_bugcheck_ex};
use super::kernel::Kernel;

/// Interrupt Request Level type
pub type Kirql = u8;

/// IRQL levels
pub mod levels {
    use super::Kirql;

    /// Passive level - normal thread execution, all interrupts enabled
    pub const PASSIVE_LEVEL: Kirql = 0;
    /// APC level - kernel APC delivery masked
    pub const APC_LEVEL: Kirql = 1;
    /// Dispatch level - thread preemption disabled, DPCs run here
    pub const DISPATCH_LEVEL: Kirql = 2;
    /// Lowest device interrupt level
    pub const DEVICE_LEVEL_BASE: Kirql = 3;
    /// Highest device interrupt level
    pub const DEVICE_LEVEL_MAX: Kirql = 12;
    /// Clock interrupt level
    pub const CLOCK_LEVEL: Kirql = 13;
    /// Inter-processor interrupt level
    pub const IPI_LEVEL: Kirql = 14;
    /// Highest level - all interrupts masked
    pub const HIGH_LEVEL: Kirql = 15;

    /// Synchronization level used by the dispatcher database
    pub const SYNCH_LEVEL: Kirql = DISPATCH_LEVEL;
}

use levels::*;

/// A statically known IRQL
pub trait IrqlClass {
    const LEVEL: Kirql;
}

/// Marker for levels at which preemption is off and spin locks may be held
pub trait SynchLevel: IrqlClass {}

/// APC_LEVEL marker
pub enum ApcLevel {}
/// DISPATCH_LEVEL marker
pub enum DispatchLevel {}
/// CLOCK_LEVEL marker
pub enum ClockLevel {}
/// HIGH_LEVEL marker
pub enum HighLevel {}

impl IrqlClass for ApcLevel {
    const LEVEL: Kirql = APC_LEVEL;
}

impl IrqlClass for DispatchLevel {
    const LEVEL: Kirql = DISPATCH_LEVEL;
}

impl IrqlClass for ClockLevel {
    const LEVEL: Kirql = CLOCK_LEVEL;
}

impl IrqlClass for HighLevel {
    const LEVEL: Kirql = HIGH_LEVEL;
}

impl SynchLevel for DispatchLevel {}
impl SynchLevel for ClockLevel {}
impl SynchLevel for HighLevel {}

/// Proof that the processor was raised to at least `L`
///
/// Returned by [`Kernel::raise_irql`] and consumed by [`Kernel::lower_irql`].
/// Not `Send`: it describes the processor that produced it.
#[must_use = "an IRQL raise must be paired with lower_irql"]
pub struct IrqlToken<L: IrqlClass> {
    previous: Kirql,
    _marker: PhantomData<(L, *const ())>,
}

impl<L: IrqlClass> IrqlToken<L> {
    /// The level that was current before the raise
    #[inline]
    pub fn previous(&self) -> Kirql {
        self.previous
    }

    /// Fabricate a token for code that is known to run at `L` already
    /// (DPC routines, the dispatch-interrupt path, the clock ISR)
    ///
    /// # Safety
    /// The current processor must really be at `L` or higher, and the token
    /// must not be passed to `lower_irql`.
    #[inline]
    pub unsafe fn assume() -> Self {
        Self {
            previous: L::LEVEL,
            _marker: PhantomData,
        }
    }
}

impl Kernel {
    /// Get the current processor's IRQL
    #[inline]
    pub fn current_irql(&self) -> Kirql {
        // SAFETY: a thread below DISPATCH_LEVEL carries its level with it
        unsafe { self.current_prcb_unchecked() }.irql()
    }

    /// Raise IRQL to a new level, returning the previous one
    ///
    /// Raising below the current level is a fatal contract violation.
    pub fn raise_irql_to(&self, new_irql: Kirql) -> Kirql {
        // SAFETY: IRQL bookkeeping of the executing processor
        let prcb = unsafe { self.current_prcb_unchecked() };
        let old_irql = prcb.irql();

        if new_irql < old_irql {
            ke_bugcheck_ex(
                codes::IRQL_NOT_GREATER_OR_EQUAL,
                old_irql as u64,
                new_irql as u64,
                0,
                0,
            );
        }

        if new_irql != old_irql {
            self.hal.set_irql(new_irql);
            prcb.set_irql(new_irql);
        }
        old_irql
    }

    /// Lower IRQL to a previous level
    ///
    /// Lowering above the current level is a fatal contract violation.
    /// Crossing below DISPATCH_LEVEL drains the DPC queue and runs any pending
    /// quantum-end or preemption switch before unmasking; dropping below
    /// APC_LEVEL delivers pending kernel APCs to the current thread.
    pub fn lower_irql_to(&self, new_irql: Kirql) {
        // SAFETY: IRQL bookkeeping of the executing processor
        let prcb = unsafe { self.current_prcb_unchecked() };
        let old_irql = prcb.irql();

        if new_irql > old_irql {
            ke_bugcheck_ex(
                codes::IRQL_NOT_LESS_OR_EQUAL,
                old_irql as u64,
                new_irql as u64,
                0,
                0,
            );
        }

        if old_irql >= DISPATCH_LEVEL && new_irql < DISPATCH_LEVEL {
            if old_irql > DISPATCH_LEVEL {
                self.hal.set_irql(DISPATCH_LEVEL);
                prcb.set_irql(DISPATCH_LEVEL);
            }
            // SAFETY: the processor sits at exactly DISPATCH_LEVEL here
            let at_dispatch = unsafe { IrqlToken::<DispatchLevel>::assume() };
            self.drain_dispatch_work(&at_dispatch);
        }

        // A switch inside the drain may have resumed us on another processor
        let prcb = unsafe { self.current_prcb_unchecked() };
        if prcb.irql() != new_irql {
            prcb.set_irql(new_irql);
            self.hal.set_irql(new_irql);
        }

        if new_irql < APC_LEVEL {
            self.check_kernel_apc_delivery();
        }
    }

    /// Raise IRQL to a statically known level
    #[inline]
    pub fn raise_irql<L: IrqlClass>(&self) -> IrqlToken<L> {
        IrqlToken {
            previous: self.raise_irql_to(L::LEVEL),
            _marker: PhantomData,
        }
    }

    /// Lower IRQL back to where the matching raise found it
    #[inline]
    pub fn lower_irql<L: IrqlClass>(&self, token: IrqlToken<L>) {
        self.lower_irql_to(token.previous);
    }

    /// Run everything that was deferred until the processor leaves
    /// DISPATCH_LEVEL: queued DPCs, quantum end, preemption
    fn drain_dispatch_work(&self, irql: &IrqlToken<DispatchLevel>) {
        loop {
            let prcb = self.current_prcb(irql);

            if prcb.dpc_pending() {
                self.retire_dpc_list(irql);
            } else if prcb.quantum_end() {
                unsafe { self.handle_quantum_end(irql) };
            } else if prcb.dispatch_pending() {
                unsafe { self.dispatch_ready_thread(irql) };
            } else {
                break;
            }
        }
    }

    // ========================================================================
    // Interrupt Management
    // ========================================================================

    /// Enter an interrupt handler at the vector's IRQL
    ///
    /// Returns the interrupted level, to be handed to [`Kernel::exit_interrupt`].
    #[inline]
    pub fn enter_interrupt(&self, vector_irql: Kirql) -> Kirql {
        // SAFETY: the processor took the interrupt with interrupts masked
        let prcb = unsafe { self.current_prcb_unchecked() };
        prcb.interrupt_entered();
        self.raise_irql_to(vector_irql)
    }

    /// Leave an interrupt handler, lowering back to the interrupted level
    ///
    /// This is the interrupt-return path that drains DPCs when the interrupted
    /// code was running below DISPATCH_LEVEL.
    #[inline]
    pub fn exit_interrupt(&self, saved_irql: Kirql) {
        // SAFETY: still at the vector's level
        unsafe { self.current_prcb_unchecked() }.interrupt_exited();
        self.lower_irql_to(saved_irql);
    }

    /// Clock interrupt entry point
    ///
    /// Runs quantum accounting at CLOCK_LEVEL; any rescheduling it asks for
    /// happens in the drain on the way back out.
    pub fn clock_interrupt(&self) {
        let saved = self.enter_interrupt(CLOCK_LEVEL);
        // SAFETY: enter_interrupt raised to CLOCK_LEVEL
        let clock = unsafe { IrqlToken::<ClockLevel>::assume() };
        self.on_timer(&clock);
        self.exit_interrupt(saved);
    }

    /// DISPATCH_LEVEL software interrupt entry point
    pub fn dispatch_interrupt(&self) {
        let irql = self.raise_irql::<DispatchLevel>();
        self.lower_irql(irql);
    }

    /// Check if currently in an interrupt context
    #[inline]
    pub fn is_executing_interrupt(&self) -> bool {
        // SAFETY: only meaningful in interrupt context, which cannot migrate
        unsafe { self.current_prcb_unchecked() }.interrupt_count() > 0
    }
}
