use nusb::MaybeFuture;

use super::UsbScanner;
use crate::device::DeviceInfo;
use crate::error::{FlashError, FlashResult};

/// Enumerates the host's USB devices through nusb
pub struct NusbScanner;

impl UsbScanner for NusbScanner {
    fn scan(&self) -> FlashResult<Vec<DeviceInfo>> {
        let devices = nusb::list_devices()
            .wait()
            .map_err(|e| FlashError::Enumeration(format!("{:?}", e)))?;

        Ok(devices.map(|d| device_info(&d)).collect())
    }
}

fn device_info(d: &nusb::DeviceInfo) -> DeviceInfo {
    let ports: Vec<String> = d.port_chain().iter().map(|p| p.to_string()).collect();
    // Root hubs have no port chain; fall back to the device address
    let id = if ports.is_empty() {
        format!("{}-a{}", d.bus_id(), d.device_address())
    } else {
        format!("{}-{}", d.bus_id(), ports.join("."))
    };

    DeviceInfo {
        id,
        vid: d.vendor_id(),
        pid: d.product_id(),
        bus: d.bus_id().parse().unwrap_or(0),
        address: d.device_address(),
        serial: d.serial_number().map(str::to_owned),
    }
}
