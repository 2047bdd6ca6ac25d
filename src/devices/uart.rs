//! PL011 UART model.
//!
//! Register subset only: data, flags, baud divisors, line/control/interrupt
//! mask, interrupt clear. The FIFOs are modeled as two booleans; TX output
//! goes synchronously to the host sink and RX comes from a pluggable input
//! source so the console or a test harness can inject bytes.

use std::collections::VecDeque;
use std::io::Write;

use log::{debug, trace};

use super::{Access, AccessResult};

// PL011 register offsets
const UART_DR: u64 = 0x000;
const UART_FR: u64 = 0x018;
const UART_IBRD: u64 = 0x024;
const UART_FBRD: u64 = 0x028;
const UART_LCR_H: u64 = 0x02C;
const UART_CR: u64 = 0x030;
const UART_IMSC: u64 = 0x038;
const UART_ICR: u64 = 0x044;

// FR bits
const FR_TXFF: u32 = 0x20;
const FR_TXFE: u32 = 0x80;
const FR_RXFE: u32 = 0x10;
const FR_RXFF: u32 = 0x40;

/// Source of guest-visible RX bytes.
pub trait InputSource {
    fn read_char(&mut self) -> Option<u8>;
    fn has_pending(&self) -> bool;
}

/// Queue-backed input source. The host side pushes bytes (console input, a
/// scripted string), the guest drains them through DR reads.
pub struct QueuedInput {
    buf: VecDeque<u8>,
}

impl QueuedInput {
    pub fn new() -> Self {
        QueuedInput { buf: VecDeque::new() }
    }

    pub fn seeded(data: &[u8]) -> Self {
        QueuedInput {
            buf: data.iter().copied().collect(),
        }
    }

    pub fn push(&mut self, byte: u8) {
        self.buf.push_back(byte);
    }
}

impl InputSource for QueuedInput {
    fn read_char(&mut self) -> Option<u8> {
        self.buf.pop_front()
    }

    fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }
}

// A shared handle works as a source too, so the host side can keep pushing
// bytes after the UART takes ownership of its end.
impl InputSource for std::sync::Arc<std::sync::Mutex<QueuedInput>> {
    fn read_char(&mut self) -> Option<u8> {
        self.lock().unwrap().read_char()
    }

    fn has_pending(&self) -> bool {
        self.lock().unwrap().has_pending()
    }
}

pub struct Uart {
    pub control_reg: u32,
    pub line_control: u32,
    pub interrupt_mask: u32,
    pub tx_fifo_full: bool,
    pub rx_fifo_empty: bool,
    input: Box<dyn InputSource>,
    output: Box<dyn Write + Send>,
}

impl Uart {
    pub fn new(input: Box<dyn InputSource>, output: Box<dyn Write + Send>) -> Self {
        let mut uart = Uart {
            control_reg: 0,
            line_control: 0,
            interrupt_mask: 0,
            tx_fifo_full: false,
            rx_fifo_empty: true,
            input,
            output,
        };
        uart.reset();
        uart
    }

    /// Power-on register values: TX/RX enabled, 8-bit frames, FIFO on,
    /// both FIFOs at their empty state.
    pub fn reset(&mut self) {
        self.control_reg = 0x300;
        self.line_control = 0x70;
        self.interrupt_mask = 0;
        self.tx_fifo_full = false;
        self.rx_fifo_empty = true;
    }

    pub fn handle_access(&mut self, offset: u64, access: Access) -> AccessResult {
        match offset {
            UART_DR => match access {
                Access::Write(value) => {
                    self.write_char((value & 0xFF) as u8);
                    AccessResult::Handled(None)
                }
                Access::Read => {
                    let c = self.read_char();
                    trace!("UART RX: 0x{c:02x}");
                    AccessResult::Handled(Some(c as u64))
                }
            },
            UART_FR => match access {
                // Read-only; computed fresh from the two FIFO booleans.
                Access::Read => {
                    let mut flags = 0u32;
                    if self.tx_fifo_full {
                        flags |= FR_TXFF;
                    } else {
                        flags |= FR_TXFE;
                    }
                    if self.rx_fifo_empty {
                        flags |= FR_RXFE;
                    } else {
                        flags |= FR_RXFF;
                    }
                    AccessResult::Handled(Some(flags as u64))
                }
                Access::Write(_) => AccessResult::Handled(None),
            },
            // Baud divisors have no behavioral effect; reads return the
            // fixed power-on divisor.
            UART_IBRD => match access {
                Access::Write(v) => {
                    debug!("UART IBRD write: 0x{v:x} (ignored)");
                    AccessResult::Handled(None)
                }
                Access::Read => AccessResult::Handled(Some(1)),
            },
            UART_FBRD => match access {
                Access::Write(v) => {
                    debug!("UART FBRD write: 0x{v:x} (ignored)");
                    AccessResult::Handled(None)
                }
                Access::Read => AccessResult::Handled(Some(0)),
            },
            UART_LCR_H => match access {
                Access::Write(v) => {
                    self.line_control = v as u32;
                    AccessResult::Handled(None)
                }
                Access::Read => AccessResult::Handled(Some(self.line_control as u64)),
            },
            UART_CR => match access {
                Access::Write(v) => {
                    self.control_reg = v as u32;
                    AccessResult::Handled(None)
                }
                Access::Read => AccessResult::Handled(Some(self.control_reg as u64)),
            },
            UART_IMSC => match access {
                Access::Write(v) => {
                    self.interrupt_mask = v as u32;
                    AccessResult::Handled(None)
                }
                Access::Read => AccessResult::Handled(Some(self.interrupt_mask as u64)),
            },
            UART_ICR => match access {
                // Write-only; any write clears all interrupt state. No
                // per-source latches exist in this model, so there is
                // nothing to clear beyond accepting the write.
                Access::Write(v) => {
                    debug!("UART ICR write: 0x{v:x}");
                    AccessResult::Handled(None)
                }
                Access::Read => AccessResult::Ignored,
            },
            _ => {
                debug!("UART: unimplemented register offset=0x{offset:x}");
                AccessResult::Ignored
            }
        }
    }

    /// Emit one character to the host sink. The TX FIFO never fills in this
    /// model, so the guest can always transmit.
    pub fn write_char(&mut self, c: u8) {
        self.output.write_all(&[c]).ok();
        self.output.flush().ok();
        self.tx_fifo_full = false;
    }

    /// Pop the next RX byte, or 0 when the source has run dry.
    pub fn read_char(&mut self) -> u8 {
        let c = self.input.read_char().unwrap_or(0);
        self.rx_fifo_empty = !self.input.has_pending();
        c
    }

    /// Consulted by the IRQ path to decide whether line 33 should assert.
    pub fn has_pending_rx(&self) -> bool {
        !self.rx_fifo_empty
    }

    /// Refresh the RX FIFO state after the host injected input. Called by
    /// the run loop between exits.
    pub fn sync_rx(&mut self) {
        self.rx_fifo_empty = !self.input.has_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Sink that records written bytes for assertions.
    #[derive(Clone)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn uart_with_input(data: &[u8]) -> (Uart, Arc<Mutex<Vec<u8>>>) {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut uart = Uart::new(
            Box::new(QueuedInput::seeded(data)),
            Box::new(SharedSink(sink.clone())),
        );
        uart.sync_rx();
        (uart, sink)
    }

    #[test]
    fn test_dr_write_reaches_sink() {
        let (mut uart, sink) = uart_with_input(b"");
        let r = uart.handle_access(0x000, Access::Write(0x41));
        assert_eq!(r, AccessResult::Handled(None));
        assert_eq!(sink.lock().unwrap().as_slice(), b"A");

        // TXFE must be set after the write
        let fr = uart.handle_access(0x018, Access::Read).read_value().unwrap();
        assert_ne!(fr & 0x80, 0);
    }

    #[test]
    fn test_dr_read_drains_input() {
        let (mut uart, _) = uart_with_input(b"Hi");
        assert!(uart.has_pending_rx());

        let v = uart.handle_access(0x000, Access::Read).read_value().unwrap();
        assert_eq!(v, b'H' as u64);
        assert!(uart.has_pending_rx());

        let v = uart.handle_access(0x000, Access::Read).read_value().unwrap();
        assert_eq!(v, b'i' as u64);
        assert!(!uart.has_pending_rx());

        // Drained source reads as 0
        let v = uart.handle_access(0x000, Access::Read).read_value().unwrap();
        assert_eq!(v, 0);
    }

    #[test]
    fn test_flag_coherence() {
        // Exactly one of TXFF/TXFE and one of RXFE/RXFF for every state
        let (mut uart, _) = uart_with_input(b"");
        for (tx_full, rx_empty) in [(false, false), (false, true), (true, false), (true, true)] {
            uart.tx_fifo_full = tx_full;
            uart.rx_fifo_empty = rx_empty;
            let fr = uart.handle_access(0x018, Access::Read).read_value().unwrap() as u32;
            assert_eq!(fr & 0x20 != 0, tx_full);
            assert_eq!(fr & 0x80 != 0, !tx_full);
            assert_eq!(fr & 0x10 != 0, rx_empty);
            assert_eq!(fr & 0x40 != 0, !rx_empty);
        }
    }

    #[test]
    fn test_baud_divisors_fixed() {
        let (mut uart, _) = uart_with_input(b"");
        uart.handle_access(0x024, Access::Write(0x1234));
        uart.handle_access(0x028, Access::Write(0x5678));
        assert_eq!(uart.handle_access(0x024, Access::Read).read_value(), Some(1));
        assert_eq!(uart.handle_access(0x028, Access::Read).read_value(), Some(0));
    }

    #[test]
    fn test_register_round_trip() {
        let (mut uart, _) = uart_with_input(b"");
        for (offset, value) in [(0x02Cu64, 0x60u64), (0x030, 0x301), (0x038, 0x7FF)] {
            uart.handle_access(offset, Access::Write(value));
            assert_eq!(uart.handle_access(offset, Access::Read).read_value(), Some(value));
        }
    }

    #[test]
    fn test_icr_write_only() {
        let (mut uart, _) = uart_with_input(b"");
        uart.handle_access(0x038, Access::Write(0x50));
        // The write is claimed; the programmed mask is configuration, not
        // latched interrupt state, and survives.
        assert_eq!(
            uart.handle_access(0x044, Access::Write(0xFFFF)),
            AccessResult::Handled(None)
        );
        assert_eq!(uart.interrupt_mask, 0x50);
        assert_eq!(uart.handle_access(0x044, Access::Read), AccessResult::Ignored);
    }

    #[test]
    fn test_host_injected_input() {
        let shared = Arc::new(Mutex::new(QueuedInput::new()));
        let mut uart = Uart::new(Box::new(shared.clone()), Box::new(std::io::sink()));
        assert!(!uart.has_pending_rx());

        // Bytes arrive after construction; the run loop's sync step makes
        // them visible to the guest
        shared.lock().unwrap().push(b'k');
        assert!(!uart.has_pending_rx());
        uart.sync_rx();
        assert!(uart.has_pending_rx());

        let v = uart.handle_access(0x000, Access::Read).read_value().unwrap();
        assert_eq!(v, b'k' as u64);
        assert!(!uart.has_pending_rx());
    }

    #[test]
    fn test_unmapped_offset_ignored() {
        let (mut uart, _) = uart_with_input(b"x");
        let before = (uart.control_reg, uart.line_control, uart.interrupt_mask);
        assert_eq!(uart.handle_access(0x0FC, Access::Read), AccessResult::Ignored);
        assert_eq!(
            uart.handle_access(0x0FC, Access::Write(0xDEAD)),
            AccessResult::Ignored
        );
        assert_eq!(
            (uart.control_reg, uart.line_control, uart.interrupt_mask),
            before
        );
        assert!(uart.has_pending_rx());
    }
}
