//! Time management
//!
//! Tick source consumed by the TCP timers and blocking deadlines.

use core::sync::atomic::{AtomicU64, Ordering};

/// Ticks desde o boot (incrementado pelo timer IRQ)
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Frequência do timer em Hz (100 = 10ms por tick)
pub const TIMER_HZ: u64 = 100;

/// Chamado pelo timer IRQ handler
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Retorna ticks desde o boot
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Converte milissegundos para ticks (arredondando para cima).
pub const fn ms_to_ticks(ms: u64) -> u64 {
    (ms * TIMER_HZ + 999) / 1000
}

/// Fonte de tempo usada pelos loops bloqueantes.
pub trait Clock {
    /// Monotonic tick counter at `TIMER_HZ`.
    fn ticks(&self) -> u64;

    /// Yield the CPU between polls.
    fn idle(&self) {
        core::hint::spin_loop();
    }
}

/// Clock backed by the timer IRQ counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelClock;

impl Clock for KernelClock {
    fn ticks(&self) -> u64 {
        ticks()
    }

    fn idle(&self) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        x86_64::instructions::hlt();
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        core::hint::spin_loop();
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn ticks(&self) -> u64 {
        (**self).ticks()
    }

    fn idle(&self) {
        (**self).idle()
    }
}
