//! Logical tick timer.
//!
//! A free-running 64-bit counter with a compare threshold. `tick()` is driven
//! by the run loop between exits, not by wall-clock time; crossing the
//! threshold latches `interrupt_pending` and asserts GIC line 30.

use log::{debug, trace};

use super::gic::Gic;
use super::{Access, AccessResult, TIMER_IRQ};

// Register offsets
const TIMER_CTRL: u64 = 0x00;
const TIMER_COUNT_LO: u64 = 0x04;
const TIMER_COUNT_HI: u64 = 0x08;
const TIMER_CMP_LO: u64 = 0x0C;
const TIMER_CMP_HI: u64 = 0x10;
const TIMER_STATUS: u64 = 0x14;
const TIMER_INT_CLR: u64 = 0x18;

const CTRL_ENABLE: u32 = 0x1;

pub struct Timer {
    pub counter: u64,
    pub compare_value: u64,
    pub control: u32,
    pub interrupt_pending: bool,
}

impl Timer {
    pub fn new() -> Self {
        Timer {
            counter: 0,
            compare_value: u64::MAX,
            control: 0,
            interrupt_pending: false,
        }
    }

    /// Power-on state: disabled, counter 0, compare at "never".
    pub fn reset(&mut self) {
        self.counter = 0;
        self.compare_value = u64::MAX;
        self.control = 0;
        self.interrupt_pending = false;
    }

    pub fn handle_access(&mut self, offset: u64, access: Access) -> AccessResult {
        match offset {
            TIMER_CTRL => match access {
                Access::Write(v) => {
                    self.control = v as u32;
                    debug!(
                        "timer {}",
                        if self.control & CTRL_ENABLE != 0 {
                            "enabled"
                        } else {
                            "disabled"
                        }
                    );
                    AccessResult::Handled(None)
                }
                Access::Read => AccessResult::Handled(Some(self.control as u64)),
            },
            TIMER_COUNT_LO => match access {
                Access::Write(v) => {
                    self.counter = (self.counter & 0xFFFF_FFFF_0000_0000) | (v & 0xFFFF_FFFF);
                    AccessResult::Handled(None)
                }
                Access::Read => AccessResult::Handled(Some(self.counter & 0xFFFF_FFFF)),
            },
            TIMER_COUNT_HI => match access {
                Access::Write(v) => {
                    self.counter = (self.counter & 0xFFFF_FFFF) | ((v & 0xFFFF_FFFF) << 32);
                    AccessResult::Handled(None)
                }
                Access::Read => AccessResult::Handled(Some(self.counter >> 32)),
            },
            TIMER_CMP_LO => match access {
                Access::Write(v) => {
                    self.compare_value =
                        (self.compare_value & 0xFFFF_FFFF_0000_0000) | (v & 0xFFFF_FFFF);
                    AccessResult::Handled(None)
                }
                Access::Read => AccessResult::Handled(Some(self.compare_value & 0xFFFF_FFFF)),
            },
            TIMER_CMP_HI => match access {
                Access::Write(v) => {
                    self.compare_value = (self.compare_value & 0xFFFF_FFFF) | ((v & 0xFFFF_FFFF) << 32);
                    AccessResult::Handled(None)
                }
                Access::Read => AccessResult::Handled(Some(self.compare_value >> 32)),
            },
            TIMER_STATUS => match access {
                Access::Read => {
                    let status = if self.interrupt_pending { 0x1u64 } else { 0 };
                    AccessResult::Handled(Some(status))
                }
                Access::Write(_) => AccessResult::Handled(None),
            },
            TIMER_INT_CLR => match access {
                Access::Write(v) => {
                    if v & 0x1 != 0 {
                        self.interrupt_pending = false;
                        debug!("timer interrupt cleared");
                    }
                    AccessResult::Handled(None)
                }
                Access::Read => AccessResult::Handled(Some(0)),
            },
            _ => {
                debug!("timer: unimplemented register offset=0x{offset:x}");
                AccessResult::Ignored
            }
        }
    }

    /// Advance the counter by one logical tick; latch and assert line 30 on
    /// compare match. Disabled timers do not count.
    pub fn tick(&mut self, gic: &mut Gic) {
        if self.control & CTRL_ENABLE == 0 {
            return;
        }
        self.counter = self.counter.wrapping_add(1);

        if self.counter >= self.compare_value {
            self.interrupt_pending = true;
            trace!("timer interrupt triggered at counter=0x{:x}", self.counter);
            gic.set_interrupt(TIMER_IRQ, true);
        }
    }

    pub fn has_interrupt(&self) -> bool {
        self.interrupt_pending
    }

    /// Drop the latch and deassert line 30.
    pub fn clear_interrupt(&mut self, gic: &mut Gic) {
        self.interrupt_pending = false;
        gic.set_interrupt(TIMER_IRQ, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn irq_pending(gic: &Gic, irq: u32) -> bool {
        gic.pending_interrupts[(irq / 32) as usize] & (1 << (irq % 32)) != 0
    }

    #[test]
    fn test_compare_match() {
        let mut timer = Timer::new();
        let mut gic = Gic::new();
        timer.control = 1;
        timer.compare_value = 3;

        timer.tick(&mut gic);
        timer.tick(&mut gic);
        assert_eq!(timer.counter, 2);
        assert!(!timer.interrupt_pending);
        assert!(!irq_pending(&gic, TIMER_IRQ));

        timer.tick(&mut gic);
        assert_eq!(timer.counter, 3);
        assert!(timer.interrupt_pending);
        assert!(irq_pending(&gic, TIMER_IRQ));

        timer.clear_interrupt(&mut gic);
        assert!(!timer.interrupt_pending);
        assert!(!irq_pending(&gic, TIMER_IRQ));
    }

    #[test]
    fn test_disabled_timer_does_not_count() {
        let mut timer = Timer::new();
        let mut gic = Gic::new();
        timer.compare_value = 1;
        for _ in 0..10 {
            timer.tick(&mut gic);
        }
        assert_eq!(timer.counter, 0);
        assert!(!timer.interrupt_pending);
    }

    #[test]
    fn test_half_register_merge() {
        let mut timer = Timer::new();
        timer.handle_access(0x0C, Access::Write(0xAAAA_BBBB));
        timer.handle_access(0x10, Access::Write(0x1111_2222));
        assert_eq!(timer.compare_value, 0x1111_2222_AAAA_BBBB);

        assert_eq!(
            timer.handle_access(0x0C, Access::Read).read_value(),
            Some(0xAAAA_BBBB)
        );
        assert_eq!(
            timer.handle_access(0x10, Access::Read).read_value(),
            Some(0x1111_2222)
        );

        timer.handle_access(0x04, Access::Write(0xFFFF_FFFF));
        timer.handle_access(0x08, Access::Write(0x1));
        assert_eq!(timer.counter, 0x1_FFFF_FFFF);
    }

    #[test]
    fn test_status_and_clear_registers() {
        let mut timer = Timer::new();
        let mut gic = Gic::new();
        timer.control = 1;
        timer.compare_value = 1;
        timer.tick(&mut gic);

        assert_eq!(timer.handle_access(0x14, Access::Read).read_value(), Some(1));

        // Writes without bit 0 leave the latch alone
        timer.handle_access(0x18, Access::Write(0x2));
        assert!(timer.interrupt_pending);

        timer.handle_access(0x18, Access::Write(0x1));
        assert!(!timer.interrupt_pending);
        assert_eq!(timer.handle_access(0x14, Access::Read).read_value(), Some(0));
    }

    #[test]
    fn test_unmapped_offset_ignored() {
        let mut timer = Timer::new();
        assert_eq!(timer.handle_access(0x1C, Access::Write(1)), AccessResult::Ignored);
        assert_eq!(timer.handle_access(0x40, Access::Read), AccessResult::Ignored);
        assert_eq!(timer.counter, 0);
        assert_eq!(timer.control, 0);
    }
}
