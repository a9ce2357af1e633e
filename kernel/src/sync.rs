//! Synchronization primitives
//!
//! - `IrqSafeMutex`: Mutex que desabilita interrupções enquanto travado

use core::ops::{Deref, DerefMut};
use spin::{Mutex, MutexGuard};

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod irq {
    use x86_64::instructions::interrupts;

    pub fn disable() -> bool {
        let was_enabled = interrupts::are_enabled();
        if was_enabled {
            interrupts::disable();
        }
        was_enabled
    }

    pub fn restore(was_enabled: bool) {
        if was_enabled {
            interrupts::enable();
        }
    }
}

// Hosted builds (unit tests) have no interrupt flag to manage.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod irq {
    pub fn disable() -> bool {
        false
    }

    pub fn restore(_was_enabled: bool) {}
}

/// Mutex que desabilita interrupções enquanto travado, para evitar deadlocks
/// com o timer IRQ que também avança a pilha de rede.
pub struct IrqSafeMutex<T> {
    inner: Mutex<T>,
}

pub struct IrqSafeGuard<'a, T> {
    // Dropped before the interrupt flag is restored.
    guard: Option<MutexGuard<'a, T>>,
    irq_was_enabled: bool,
}

impl<T> IrqSafeMutex<T> {
    pub const fn new(value: T) -> Self {
        Self { inner: Mutex::new(value) }
    }

    pub fn lock(&self) -> IrqSafeGuard<'_, T> {
        let irq_was_enabled = irq::disable();
        let guard = self.inner.lock();
        IrqSafeGuard { guard: Some(guard), irq_was_enabled }
    }

    /// Tries to acquire the lock without blocking
    pub fn try_lock(&self) -> Option<IrqSafeGuard<'_, T>> {
        let irq_was_enabled = irq::disable();
        match self.inner.try_lock() {
            Some(guard) => Some(IrqSafeGuard { guard: Some(guard), irq_was_enabled }),
            None => {
                irq::restore(irq_was_enabled);
                None
            }
        }
    }
}

impl<T: Default> Default for IrqSafeMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<'a, T> Deref for IrqSafeGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        match &self.guard {
            Some(guard) => guard,
            None => unreachable!("guard released twice"),
        }
    }
}

impl<'a, T> DerefMut for IrqSafeGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.guard {
            Some(guard) => guard,
            None => unreachable!("guard released twice"),
        }
    }
}

impl<'a, T> Drop for IrqSafeGuard<'a, T> {
    fn drop(&mut self) {
        self.guard.take();
        irq::restore(self.irq_was_enabled);
    }
}
