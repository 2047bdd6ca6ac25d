//! Scripted vCPU backend.
//!
//! Stands in for a real virtualization substrate: a register file plus a
//! pre-built sequence of VM exits. The demo driver and the tests both speak
//! to the monitor through this backend, so the trap surface can be exercised
//! on hosts with no hypervisor platform at all.

use std::collections::VecDeque;

use anyhow::Result;

use crate::esr;
use crate::vcpu::{ExceptionType, ExitInfo, GuestCpu, Reg};

enum Step {
    SetReg(Reg, u64),
    Exit(ExitInfo),
}

pub struct ScriptedCpu {
    regs: [u64; 31],
    pc: u64,
    steps: VecDeque<Step>,
}

impl ScriptedCpu {
    pub fn new() -> Self {
        ScriptedCpu {
            regs: [0; 31],
            pc: 0,
            steps: VecDeque::new(),
        }
    }

    /// Queue a register load applied just before the next queued exit.
    pub fn load_reg(&mut self, index: u8, value: u64) {
        self.steps.push_back(Step::SetReg(Reg::X(index), value));
    }

    pub fn push_exit(&mut self, exit: ExitInfo) {
        self.steps.push_back(Step::Exit(exit));
    }
}

impl GuestCpu for ScriptedCpu {
    fn run(&mut self) -> Result<ExitInfo> {
        while let Some(step) = self.steps.pop_front() {
            match step {
                Step::SetReg(reg, value) => {
                    self.write_reg(reg, value)?;
                }
                Step::Exit(info) => {
                    self.pc = info.pc;
                    return Ok(info);
                }
            }
        }
        anyhow::bail!("guest script exhausted");
    }

    fn read_reg(&mut self, reg: Reg) -> Result<u64> {
        Ok(match reg {
            Reg::X(n) if (n as usize) < self.regs.len() => self.regs[n as usize],
            Reg::X(_) => 0, // xzr and anything past it
            Reg::Pc => self.pc,
        })
    }

    fn write_reg(&mut self, reg: Reg, value: u64) -> Result<()> {
        match reg {
            Reg::X(n) if (n as usize) < self.regs.len() => self.regs[n as usize] = value,
            Reg::X(_) => {} // writes to xzr are discarded
            Reg::Pc => self.pc = value,
        }
        Ok(())
    }
}

// ── Exit constructors ───────────────────────────────────────────────────
// Build the ExitInfo a real substrate would have produced for each trap.

pub fn hvc_exit(pc: u64, imm: u16) -> ExitInfo {
    ExitInfo {
        exception: ExceptionType::SyncLowerEl64,
        syndrome: (esr::EC_HVC64 << 26) | imm as u64,
        fault_address: 0,
        pc,
    }
}

fn data_abort_syndrome(is_write: bool, size: u8, rt: u8) -> u64 {
    let sas = match size {
        1 => 0u64,
        2 => 1,
        4 => 2,
        _ => 3,
    };
    let mut iss = (sas << 22) | ((rt as u64 & 0x1F) << 16);
    if is_write {
        iss |= 1 << 6;
    }
    (esr::EC_DATA_ABORT_LOWER << 26) | iss
}

pub fn mmio_write_exit(pc: u64, addr: u64, size: u8, rt: u8) -> ExitInfo {
    ExitInfo {
        exception: ExceptionType::SyncLowerEl64,
        syndrome: data_abort_syndrome(true, size, rt),
        fault_address: addr,
        pc,
    }
}

pub fn mmio_read_exit(pc: u64, addr: u64, size: u8, rt: u8) -> ExitInfo {
    ExitInfo {
        exception: ExceptionType::SyncLowerEl64,
        syndrome: data_abort_syndrome(false, size, rt),
        fault_address: addr,
        pc,
    }
}

pub fn wfi_exit(pc: u64) -> ExitInfo {
    ExitInfo {
        exception: ExceptionType::SyncLowerEl64,
        syndrome: esr::EC_WFI_WFE << 26,
        fault_address: 0,
        pc,
    }
}

pub fn irq_exit(pc: u64) -> ExitInfo {
    ExitInfo {
        exception: ExceptionType::IrqLowerEl64,
        syndrome: 0,
        fault_address: 0,
        pc,
    }
}

pub fn sysreg_exit(pc: u64, iss: u64) -> ExitInfo {
    ExitInfo {
        exception: ExceptionType::SyncLowerEl64,
        syndrome: (esr::EC_SYSREG_TRAP << 26) | (iss & 0x1FF_FFFF),
        fault_address: 0,
        pc,
    }
}

/// The demo guest: one pass over every trap class the monitor handles.
///
/// Greeting hypercall, UART traffic, GIC and timer bring-up, an
/// idle/interrupt/acknowledge cycle, then a shutdown hypercall.
pub fn demo_script() -> ScriptedCpu {
    use crate::devices::{GIC_CPU_BASE, GIC_DIST_BASE, TIMER_BASE, TIMER_IRQ, UART_BASE};

    let mut cpu = ScriptedCpu::new();
    let mut pc = 0x4000_1000u64;
    let mut next_pc = || {
        let p = pc;
        pc += 4;
        p
    };

    // Greeting hypercall
    cpu.push_exit(hvc_exit(next_pc(), 0));

    // UART: transmit 'H', check the flags, read one RX byte
    cpu.load_reg(0, b'H' as u64);
    cpu.push_exit(mmio_write_exit(next_pc(), UART_BASE, 1, 0));
    cpu.push_exit(mmio_read_exit(next_pc(), UART_BASE + 0x18, 4, 1));
    cpu.push_exit(mmio_read_exit(next_pc(), UART_BASE, 1, 2));

    // Interrupt controller bring-up: distributor + CPU interface on, timer
    // line unmasked
    cpu.load_reg(3, 1);
    cpu.push_exit(mmio_write_exit(next_pc(), GIC_DIST_BASE, 4, 3));
    cpu.push_exit(mmio_write_exit(next_pc(), GIC_CPU_BASE, 4, 3));
    cpu.load_reg(4, 1 << TIMER_IRQ);
    cpu.push_exit(mmio_write_exit(next_pc(), GIC_DIST_BASE + 0x100, 4, 4));

    // Timer: fire three ticks from now (both compare halves, then enable)
    cpu.load_reg(5, 3);
    cpu.push_exit(mmio_write_exit(next_pc(), TIMER_BASE + 0x0C, 4, 5));
    cpu.load_reg(6, 0);
    cpu.push_exit(mmio_write_exit(next_pc(), TIMER_BASE + 0x10, 4, 6));
    cpu.load_reg(6, 1);
    cpu.push_exit(mmio_write_exit(next_pc(), TIMER_BASE, 4, 6));

    // Idle until the compare match, take the interrupt, acknowledge it
    cpu.push_exit(wfi_exit(next_pc()));
    cpu.push_exit(irq_exit(next_pc()));
    cpu.push_exit(mmio_read_exit(next_pc(), GIC_CPU_BASE + 0x0C, 4, 7));
    cpu.load_reg(8, TIMER_IRQ as u64);
    cpu.push_exit(mmio_write_exit(next_pc(), GIC_CPU_BASE + 0x10, 4, 8));
    cpu.load_reg(9, 1);
    cpu.push_exit(mmio_write_exit(next_pc(), TIMER_BASE + 0x18, 4, 9));

    // A trapped MRS (decoded and zero-filled, diagnostics only)
    cpu.push_exit(sysreg_exit(
        next_pc(),
        (3 << 20) | (1 << 17) | (14 << 10) | (10 << 5) | 1,
    ));

    // Print one character through the hypercall path, then shut down
    cpu.load_reg(1, b'\n' as u64);
    cpu.push_exit(hvc_exit(next_pc(), 2));
    cpu.push_exit(hvc_exit(next_pc(), 1));

    cpu
}
