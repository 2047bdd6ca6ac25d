pub mod gic;
pub mod timer;
pub mod uart;

use log::{debug, trace};

use gic::Gic;
use timer::Timer;
use uart::{InputSource, Uart};

// Physical device map (QEMU virt-style layout). The bases are ABI with the
// guest and must stay bit-exact.
pub const DEVICE_BASE: u64 = 0x0900_0000;
pub const DEVICE_WINDOW_SIZE: u64 = 0x10_0000;
pub const UART_BASE: u64 = DEVICE_BASE;
pub const TIMER_BASE: u64 = DEVICE_BASE + 0x1_0000;
pub const GIC_DIST_BASE: u64 = DEVICE_BASE + 0x2_0000;
pub const GIC_CPU_BASE: u64 = DEVICE_BASE + 0x3_0000;
pub const DEVICE_REGION_SIZE: u64 = 0x1000;

/// Interrupt lines wired to the device models.
pub const TIMER_IRQ: u32 = 30;
pub const UART_IRQ: u32 = 33;

/// One guest access to a device register, as decoded from the data-abort
/// syndrome. The write value travels in; the read value travels out through
/// `AccessResult` instead of a shared in/out slot.
#[derive(Debug, Clone, Copy)]
pub enum Access {
    Read,
    Write(u64),
}

impl Access {
    pub fn is_write(self) -> bool {
        matches!(self, Access::Write(_))
    }
}

/// Outcome of a device register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessResult {
    /// The device claimed the access; `Some` carries the value for reads.
    Handled(Option<u64>),
    /// No register at this offset/address. Not an error; the caller picks
    /// the policy (log-and-continue vs. fault injection).
    Ignored,
}

impl AccessResult {
    pub fn read_value(self) -> Option<u64> {
        match self {
            AccessResult::Handled(v) => v,
            AccessResult::Ignored => None,
        }
    }
}

/// The emulated machine: every device model, singly owned, no globals.
/// Cross-device effects flow only through the GIC line interface.
pub struct Machine {
    pub uart: Uart,
    pub timer: Timer,
    pub gic: Gic,
}

impl Machine {
    pub fn new(input: Box<dyn InputSource>, output: Box<dyn std::io::Write + Send>) -> Self {
        Machine {
            uart: Uart::new(input, output),
            timer: Timer::new(),
            gic: Gic::new(),
        }
    }

    /// Restore every model to its power-on state.
    pub fn reset(&mut self) {
        self.uart.reset();
        self.timer.reset();
        self.gic.reset();
    }

    /// Route one physical-address access to the owning device model.
    ///
    /// Each device owns a fixed 4 KiB window; addresses outside all windows
    /// are `Ignored`.
    pub fn handle_access(&mut self, addr: u64, size: u8, access: Access) -> AccessResult {
        trace!(
            "device access: addr=0x{:x} size={} write={}",
            addr,
            size,
            access.is_write()
        );

        if (UART_BASE..UART_BASE + DEVICE_REGION_SIZE).contains(&addr) {
            self.uart.handle_access(addr - UART_BASE, access)
        } else if (TIMER_BASE..TIMER_BASE + DEVICE_REGION_SIZE).contains(&addr) {
            self.timer.handle_access(addr - TIMER_BASE, access)
        } else if (GIC_DIST_BASE..GIC_DIST_BASE + DEVICE_REGION_SIZE).contains(&addr) {
            self.gic.handle_distributor_access(addr - GIC_DIST_BASE, access)
        } else if (GIC_CPU_BASE..GIC_CPU_BASE + DEVICE_REGION_SIZE).contains(&addr) {
            self.gic.handle_cpu_access(addr - GIC_CPU_BASE, access)
        } else {
            debug!("access to unmapped address 0x{addr:x}");
            AccessResult::Ignored
        }
    }

    /// Advance logical time by one tick.
    pub fn tick(&mut self) {
        self.timer.tick(&mut self.gic);
    }

    /// Fast-forward ticks until an interrupt becomes deliverable or the
    /// budget runs out. Backs the WFI handler; returns true if an interrupt
    /// is now pending-for-ack.
    pub fn wait_for_interrupt(&mut self, max_ticks: u64) -> bool {
        for _ in 0..max_ticks {
            if self.gic.pending_interrupt() != gic::SPURIOUS_IRQ {
                return true;
            }
            self.tick();
        }
        self.gic.pending_interrupt() != gic::SPURIOUS_IRQ
    }
}

#[cfg(test)]
mod tests {
    use super::uart::QueuedInput;
    use super::*;

    fn test_machine() -> Machine {
        Machine::new(Box::new(QueuedInput::new()), Box::new(std::io::sink()))
    }

    #[test]
    fn test_dispatch_windows() {
        let mut m = test_machine();

        // UART FR read lands in the UART window
        let r = m.handle_access(UART_BASE + 0x18, 4, Access::Read);
        assert!(matches!(r, AccessResult::Handled(Some(_))));

        // Timer control lands in the timer window
        let r = m.handle_access(TIMER_BASE, 4, Access::Write(1));
        assert_eq!(r, AccessResult::Handled(None));
        assert_eq!(m.timer.control, 1);

        // GIC distributor CTLR
        let r = m.handle_access(GIC_DIST_BASE, 4, Access::Write(1));
        assert_eq!(r, AccessResult::Handled(None));
        assert_eq!(m.gic.distributor_ctrl, 1);

        // GIC CPU interface CTLR
        let r = m.handle_access(GIC_CPU_BASE, 4, Access::Write(1));
        assert_eq!(r, AccessResult::Handled(None));
        assert_eq!(m.gic.cpu_ctrl, 1);
    }

    #[test]
    fn test_unmapped_address_ignored() {
        let mut m = test_machine();
        let r = m.handle_access(DEVICE_BASE + 0x5_0000, 4, Access::Read);
        assert_eq!(r, AccessResult::Ignored);
        let r = m.handle_access(0x4000_0000, 8, Access::Write(0xFF));
        assert_eq!(r, AccessResult::Ignored);
    }

    #[test]
    fn test_wait_for_interrupt_fast_forward() {
        let mut m = test_machine();
        // Program the timer for a match in 5 ticks, enable delivery end to end
        m.gic.distributor_ctrl = 1;
        m.gic.cpu_ctrl = 1;
        m.handle_access(GIC_DIST_BASE + 0x100, 4, Access::Write(1 << TIMER_IRQ));
        m.timer.control = 1;
        m.timer.compare_value = 5;

        assert!(m.wait_for_interrupt(100));
        assert_eq!(m.gic.pending_interrupt(), TIMER_IRQ);
        assert!(m.timer.counter >= 5);
    }

    #[test]
    fn test_wait_for_interrupt_budget_exhausted() {
        let mut m = test_machine();
        // Timer disabled, so nothing can become pending
        assert!(!m.wait_for_interrupt(10));
        assert_eq!(m.timer.counter, 0);
    }
}
