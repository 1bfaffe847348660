use serialport::SerialPortType;

use super::UsbScanner;
use crate::device::DeviceInfo;
use crate::error::{FlashError, FlashResult};

/// Lists USB serial ports; the port name doubles as the slot identity
pub struct SerialPortScanner;

impl UsbScanner for SerialPortScanner {
    fn scan(&self) -> FlashResult<Vec<DeviceInfo>> {
        let ports = serialport::available_ports().map_err(|e| {
            FlashError::Enumeration(format!("Could not get available ports. Err {:?}", e))
        })?;

        Ok(ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                SerialPortType::UsbPort(info) => Some(DeviceInfo {
                    id: port.port_name,
                    vid: info.vid,
                    pid: info.pid,
                    bus: 0,
                    address: 0,
                    serial: info.serial_number,
                }),
                _ => None,
            })
            .collect())
    }
}
