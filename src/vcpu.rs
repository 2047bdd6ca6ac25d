use anyhow::Result;

/// Guest register selector.
///
/// `X(31)` is the zero register; the helpers in `vm.rs` make it read as 0
/// and discard writes, so exit handlers can use the raw Rt field from the
/// syndrome without special-casing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    X(u8),
    Pc,
}

/// Top-level exception class, one per vector-table entry.
///
/// Current-EL entries are hypervisor-internal faults and never reach the
/// guest handlers; lower-EL entries are guest-origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionType {
    SyncCurrentElSp0,
    IrqCurrentElSp0,
    FiqCurrentElSp0,
    SErrorCurrentElSp0,
    SyncCurrentElSpx,
    IrqCurrentElSpx,
    FiqCurrentElSpx,
    SErrorCurrentElSpx,
    SyncLowerEl64,
    IrqLowerEl64,
    FiqLowerEl64,
    SErrorLowerEl64,
    SyncLowerEl32,
    IrqLowerEl32,
    FiqLowerEl32,
    SErrorLowerEl32,
}

/// Everything the substrate reports about one guest stop.
#[derive(Debug, Clone, Copy)]
pub struct ExitInfo {
    pub exception: ExceptionType,
    /// Raw ESR_EL2 value at the exit.
    pub syndrome: u64,
    /// Faulting guest physical address (data/instruction aborts).
    pub fault_address: u64,
    /// Saved return address; handlers advance this by the instruction width.
    pub pc: u64,
}

/// The host virtualization substrate as seen by the monitor.
///
/// Partition setup, guest memory mapping and actual execution live behind
/// this seam; the monitor only resumes the guest and moves register values.
pub trait GuestCpu {
    /// Resume the guest until the next VM exit.
    fn run(&mut self) -> Result<ExitInfo>;

    /// Read a guest register.
    fn read_reg(&mut self, reg: Reg) -> Result<u64>;

    /// Write a guest register.
    fn write_reg(&mut self, reg: Reg, value: u64) -> Result<()>;
}
