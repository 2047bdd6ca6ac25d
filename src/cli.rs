use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "husk",
    about = "Minimal hosted hypervisor monitor for ARM64 guests",
    long_about = "Classifies guest VM exits and emulates a small virt-style device set \
                  (PL011 UART, tick timer, GICv2) against a scripted demo guest"
)]
pub struct Args {
    /// Stop after this many VM exits
    #[arg(long = "max-exits", default_value = "1000")]
    pub max_exits: u64,

    /// Timer ticks advanced after each handled exit
    #[arg(long = "ticks-per-exit", default_value = "1")]
    pub ticks_per_exit: u64,

    /// Bytes fed to the guest UART RX path [default: "Hello from UART!\n"]
    #[arg(long = "input")]
    pub input: Option<String>,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}
