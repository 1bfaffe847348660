use batchflash::{
    Board, ScannerBackend, UsbSignature,
    boards::signatures_for_board,
    error::FlashResult,
    monitor::{DeviceMonitor, scanner_for_backend},
};
use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub(crate) struct ListOptions {
    /// Board type
    #[clap(short, long, value_enum, default_value_t = Board::Rk3566)]
    board: Board,

    /// Extra bootloader-mode USB id (VID:PID, hex), may be repeated
    #[clap(long = "usb-id")]
    usb_ids: Vec<UsbSignature>,

    #[clap(long, value_enum, default_value_t = ScannerBackend::Usb)]
    backend: ScannerBackend,
}

pub(crate) fn handle_listing(opts: ListOptions) -> FlashResult<()> {
    let mut signatures = signatures_for_board(opts.board);
    signatures.extend(opts.usb_ids);

    let monitor = DeviceMonitor::new(scanner_for_backend(opts.backend), signatures);
    let devices = monitor.matching_devices()?;

    if devices.is_empty() {
        println!("No devices in bootloader mode found");
        return Ok(());
    }

    println!(
        "{:>5}  {:<6} {:<6} {:>10}  {:<16} Serial",
        "DevNo", "Vid", "Pid", "LocationID", "Port"
    );
    for (i, d) in devices.iter().enumerate() {
        println!(
            "{:>5}  0x{:04x} 0x{:04x} {:>10}  {:<16} {}",
            i + 1,
            d.vid,
            d.pid,
            d.location_id(),
            d.id,
            d.serial.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}
