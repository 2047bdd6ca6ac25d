use crate::cli::Args;
use crate::devices::uart::QueuedInput;
use crate::devices::{
    Access, AccessResult, Machine, DEVICE_BASE, DEVICE_WINDOW_SIZE, TIMER_IRQ, UART_IRQ,
};
use crate::esr;
use crate::script;
use crate::vcpu::{ExceptionType, ExitInfo, GuestCpu, Reg};
use anyhow::Result;
use log::{debug, error, info, trace, warn};

/// Upper bound on timer fast-forwarding while the guest idles in WFI.
const WFI_TICK_BUDGET: u64 = 10_000;

/// Default RX seed when the CLI provides none.
const DEFAULT_UART_INPUT: &str = "Hello from UART!\n";

pub struct VmInstance {
    machine: Machine,
    running: bool,
    exits_handled: u64,
}

impl VmInstance {
    pub fn new(mut machine: Machine) -> Self {
        // Device power-on state before the first instruction runs
        machine.reset();
        VmInstance {
            machine,
            running: true,
            exits_handled: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Read a guest register by number (0-31). A failed substrate read
    /// degrades to 0 rather than aborting the episode.
    fn read_rt(cpu: &mut dyn GuestCpu, rt: u8) -> u64 {
        if rt == 31 {
            return 0; // xzr always reads 0
        }
        match cpu.read_reg(Reg::X(rt)) {
            Ok(v) => v,
            Err(e) => {
                warn!("register read x{rt} failed ({e}); substituting 0");
                0
            }
        }
    }

    /// Write a guest register by number (0-31); writes to xzr are discarded.
    fn write_rt(cpu: &mut dyn GuestCpu, rt: u8, value: u64) -> Result<()> {
        if rt == 31 {
            return Ok(());
        }
        cpu.write_reg(Reg::X(rt), value)
    }

    fn advance_pc(cpu: &mut dyn GuestCpu, pc: u64) -> Result<()> {
        // Fixed 4-byte instruction width; Thumb is not distinguished
        cpu.write_reg(Reg::Pc, pc + 4)
    }

    /// Classify one VM exit and apply its guest-visible effect.
    pub fn handle_exit(&mut self, cpu: &mut dyn GuestCpu, exit: &ExitInfo) -> Result<()> {
        self.exits_handled += 1;
        trace!(
            "#{}: PC=0x{:x} {:?} ESR=0x{:x} FAR=0x{:x}",
            self.exits_handled,
            exit.pc,
            exit.exception,
            exit.syndrome,
            exit.fault_address
        );

        match exit.exception {
            // Hypervisor-internal faults; diagnostics only, never guest-visible
            ExceptionType::SyncCurrentElSp0 | ExceptionType::SyncCurrentElSpx => {
                error!(
                    "sync exception in the monitor itself (ESR=0x{:x})",
                    exit.syndrome
                );
            }
            ExceptionType::SErrorCurrentElSp0 | ExceptionType::SErrorCurrentElSpx => {
                error!("SError in the monitor itself (ESR=0x{:x})", exit.syndrome);
            }
            ExceptionType::IrqCurrentElSp0
            | ExceptionType::IrqCurrentElSpx
            | ExceptionType::FiqCurrentElSp0
            | ExceptionType::FiqCurrentElSpx => {
                debug!("host interrupt while in the monitor");
            }

            ExceptionType::SyncLowerEl64 | ExceptionType::SyncLowerEl32 => {
                self.handle_sync_exception(cpu, exit)?;
            }
            // FIQ has no distinct priority channel here; both poll the
            // same device lines
            ExceptionType::IrqLowerEl64
            | ExceptionType::IrqLowerEl32
            | ExceptionType::FiqLowerEl64
            | ExceptionType::FiqLowerEl32 => {
                self.handle_irq();
            }
            ExceptionType::SErrorLowerEl64 | ExceptionType::SErrorLowerEl32 => {
                error!(
                    "guest SError: ESR=0x{:x} FAR=0x{:x}",
                    exit.syndrome, exit.fault_address
                );
                self.running = false;
            }
        }

        Ok(())
    }

    fn handle_sync_exception(&mut self, cpu: &mut dyn GuestCpu, exit: &ExitInfo) -> Result<()> {
        let ec = esr::exception_class(exit.syndrome);
        let iss = esr::iss(exit.syndrome);

        match ec {
            esr::EC_HVC64 => self.handle_hvc(cpu, iss, exit.pc),
            esr::EC_DATA_ABORT_LOWER => self.handle_data_abort(cpu, iss, exit),
            esr::EC_INSTR_ABORT_LOWER => {
                error!(
                    "guest instruction abort: FAR=0x{:x} ISS=0x{iss:x}",
                    exit.fault_address
                );
                self.inject_exception(esr::SYNDROME_INSTR_ABORT | iss, exit.fault_address);
                Ok(())
            }
            esr::EC_SYSREG_TRAP => self.handle_sysreg_trap(cpu, iss, exit.pc),
            esr::EC_WFI_WFE => self.handle_wfi_wfe(cpu, exit.pc),
            _ => {
                error!("unhandled exception class 0x{ec:x} at PC=0x{:x}", exit.pc);
                self.inject_exception(exit.syndrome, exit.fault_address);
                Ok(())
            }
        }
    }

    /// Hypervisor call: the principal guest-to-host request channel.
    fn handle_hvc(&mut self, cpu: &mut dyn GuestCpu, iss: u64, pc: u64) -> Result<()> {
        let num = esr::hvc_number(iss);
        let x0 = Self::read_rt(cpu, 0);
        let x1 = Self::read_rt(cpu, 1);
        debug!("guest HVC #{num} (x0=0x{x0:x}, x1=0x{x1:x})");

        match num {
            0 => {
                info!("guest says hello");
                for c in "Hello Hypervisor!\n".bytes() {
                    self.machine.uart.write_char(c);
                }
            }
            1 => {
                info!("guest requested shutdown");
                self.running = false;
            }
            2 => {
                self.machine.uart.write_char((x1 & 0xFF) as u8);
            }
            _ => {
                info!("unknown hypercall #{num}");
            }
        }

        Self::advance_pc(cpu, pc)
    }

    /// Data abort: MMIO emulation when the fault hits the device window,
    /// fault reflection otherwise.
    fn handle_data_abort(
        &mut self,
        cpu: &mut dyn GuestCpu,
        iss: u64,
        exit: &ExitInfo,
    ) -> Result<()> {
        let da = esr::decode_data_abort(iss);
        let far = exit.fault_address;
        debug!(
            "guest data abort: FAR=0x{far:x} write={} size={} rt={}",
            da.is_write, da.size, da.rt
        );

        if (DEVICE_BASE..DEVICE_BASE + DEVICE_WINDOW_SIZE).contains(&far) {
            let access = if da.is_write {
                Access::Write(Self::read_rt(cpu, da.rt))
            } else {
                Access::Read
            };

            match self.machine.handle_access(far, da.size, access) {
                AccessResult::Handled(value) => {
                    if let Some(value) = value {
                        Self::write_rt(cpu, da.rt, value)?;
                    }
                    return Self::advance_pc(cpu, exit.pc);
                }
                AccessResult::Ignored => {
                    debug!("device access at 0x{far:x} not claimed by any register");
                }
            }
        }

        error!("unhandled data abort: FAR=0x{far:x}");
        self.inject_exception(esr::SYNDROME_DATA_ABORT | iss, far);
        Ok(())
    }

    /// MSR/MRS trap. The operands are decoded for the log only; no system
    /// register is emulated. MRS destinations read as 0.
    fn handle_sysreg_trap(&mut self, cpu: &mut dyn GuestCpu, iss: u64, pc: u64) -> Result<()> {
        let tr = esr::decode_sysreg_trap(iss);
        debug!(
            "sysreg trap: op0={} op1={} crn={} crm={} op2={} rt={} {}",
            tr.op0,
            tr.op1,
            tr.crn,
            tr.crm,
            tr.op2,
            tr.rt,
            if tr.is_read { "read" } else { "write" }
        );

        if tr.is_read {
            Self::write_rt(cpu, tr.rt, 0)?;
        }

        Self::advance_pc(cpu, pc)
    }

    /// WFI/WFE: advance past the instruction, then let logical time run
    /// until an interrupt becomes deliverable instead of busy-resuming.
    fn handle_wfi_wfe(&mut self, cpu: &mut dyn GuestCpu, pc: u64) -> Result<()> {
        Self::advance_pc(cpu, pc)?;

        if self.machine.wait_for_interrupt(WFI_TICK_BUDGET) {
            debug!("WFI woke with a deliverable interrupt");
        } else {
            debug!("WFI budget elapsed with nothing pending");
        }
        Ok(())
    }

    /// IRQ/FIQ from the guest: re-assert the line of every device source
    /// that still holds an interrupt so a subsequent IAR read observes it.
    fn handle_irq(&mut self) {
        if self.machine.timer.has_interrupt() {
            debug!("timer interrupt pending for the guest");
            self.machine.gic.set_interrupt(TIMER_IRQ, true);
        }
        if self.machine.uart.has_pending_rx() {
            debug!("UART RX pending for the guest");
            self.machine.gic.set_interrupt(UART_IRQ, true);
        }
    }

    /// Reflect a fault at the guest. No nested-EL1 frame is built; an
    /// unhandled trap is terminal for the guest.
    fn inject_exception(&mut self, esr: u64, far: u64) {
        debug!("would inject exception: ESR=0x{esr:x} FAR=0x{far:x}");
        error!("unhandled trap - stopping guest");
        self.running = false;
    }

    /// Drive the guest until it shuts down or the exit budget runs out.
    pub fn run_loop(
        &mut self,
        cpu: &mut dyn GuestCpu,
        max_exits: u64,
        ticks_per_exit: u64,
    ) -> Result<()> {
        while self.running {
            if self.exits_handled >= max_exits {
                warn!("stopped after {} exits", self.exits_handled);
                break;
            }

            let exit = match cpu.run() {
                Ok(e) => e,
                Err(e) => {
                    error!("vcpu run failed: {e}");
                    return Err(e);
                }
            };

            self.handle_exit(cpu, &exit)?;

            // Advance logical time between exits and pick up any input the
            // host injected meanwhile
            for _ in 0..ticks_per_exit {
                self.machine.tick();
            }
            self.machine.uart.sync_rx();
        }

        debug!("run loop finished after {} exits", self.exits_handled);
        Ok(())
    }
}

pub fn run(args: Args) -> Result<()> {
    let input = args.input.as_deref().unwrap_or(DEFAULT_UART_INPUT);
    let machine = Machine::new(
        Box::new(QueuedInput::seeded(input.as_bytes())),
        Box::new(std::io::stdout()),
    );

    info!("starting demo guest ({} max exits)", args.max_exits);

    let mut vm = VmInstance::new(machine);
    let mut cpu = script::demo_script();
    vm.run_loop(&mut cpu, args.max_exits, args.ticks_per_exit)?;

    if vm.is_running() {
        warn!("guest stopped without requesting shutdown");
    } else {
        info!("guest execution finished");
    }

    Ok(())
}
