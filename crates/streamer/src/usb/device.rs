//! Device and endpoint resolution
//!
//! Finds the device under test, locates the requested endpoint among the
//! interfaces and alternate settings of its active configuration, and
//! claims the interface that carries it.

use crate::config::{TransferKind, validate_endpoint};
use crate::error::{EngineError, Result};
use rusb::{Context, DeviceHandle, UsbContext};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// VID:PID pair identifying the device under test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceFilter {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }

    /// Parse one hex ID ("0x04b4")
    fn parse_hex_id(id: &str, filter: &str) -> Result<u16> {
        let hex_part = id
            .strip_prefix("0x")
            .or_else(|| id.strip_prefix("0X"))
            .ok_or_else(|| EngineError::InvalidFilter(filter.to_string()))?;

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(EngineError::InvalidFilter(filter.to_string()));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| EngineError::InvalidFilter(filter.to_string()))
    }
}

impl FromStr for DeviceFilter {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (vid, pid) = s
            .split_once(':')
            .ok_or_else(|| EngineError::InvalidFilter(s.to_string()))?;
        if pid.contains(':') {
            return Err(EngineError::InvalidFilter(s.to_string()));
        }

        Ok(Self {
            vendor_id: Self::parse_hex_id(vid, s)?,
            product_id: Self::parse_hex_id(pid, s)?,
        })
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}:{:#06x}", self.vendor_id, self.product_id)
    }
}

/// Where an endpoint lives and how to stream on it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub interface: u8,
    pub alt_setting: u8,
    pub kind: TransferKind,
    /// Bytes per service interval, including high-bandwidth transactions
    pub packet_size: usize,
}

/// Payload of one service interval for a `wMaxPacketSize` value
///
/// Bits 0..=10 hold the packet size; bits 11..=12 the number of additional
/// transactions per micro-frame on high-speed periodic endpoints.
pub fn effective_packet_size(max_packet_size: u16) -> usize {
    let base = (max_packet_size & 0x07ff) as usize;
    let transactions = 1 + ((max_packet_size >> 11) & 0x3) as usize;
    base * transactions
}

/// Open the first device matching `filter`
pub fn open_device(context: &Context, filter: &DeviceFilter) -> Result<DeviceHandle<Context>> {
    for device in context.devices()?.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                debug!(
                    "Skipping device on bus {} address {}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                continue;
            }
        };

        if filter.matches(descriptor.vendor_id(), descriptor.product_id()) {
            info!(
                "Opening device {} on bus {:03} device {:03} ({:?} speed)",
                filter,
                device.bus_number(),
                device.address(),
                device.speed()
            );
            return Ok(device.open()?);
        }
    }

    Err(EngineError::DeviceNotFound(filter.to_string()))
}

/// Locate `address` in the active configuration of the device
pub fn find_endpoint(handle: &DeviceHandle<Context>, address: u8) -> Result<EndpointInfo> {
    validate_endpoint(address)?;

    let config = handle.device().active_config_descriptor()?;
    for interface in config.interfaces() {
        for setting in interface.descriptors() {
            for endpoint in setting.endpoint_descriptors() {
                if endpoint.address() != address {
                    continue;
                }

                let info = EndpointInfo {
                    address,
                    interface: setting.interface_number(),
                    alt_setting: setting.setting_number(),
                    kind: TransferKind::from_rusb(endpoint.transfer_type())?,
                    packet_size: effective_packet_size(endpoint.max_packet_size()),
                };
                info!(
                    "Found endpoint {:#04x} in interface {}, setting {}",
                    address, info.interface, info.alt_setting
                );
                return Ok(info);
            }
        }
    }

    Err(EngineError::EndpointNotFound(address))
}

/// Claim the interface carrying the endpoint and select its alternate setting
///
/// A kernel driver bound to the interface is detached first.
pub fn claim_endpoint(handle: &mut DeviceHandle<Context>, endpoint: &EndpointInfo) -> Result<()> {
    let interface = endpoint.interface;

    match handle.kernel_driver_active(interface) {
        Ok(true) => {
            debug!("Detaching kernel driver from interface {}", interface);
            if let Err(e) = handle.detach_kernel_driver(interface) {
                warn!(
                    "Failed to detach kernel driver from interface {}: {}",
                    interface, e
                );
            }
        }
        Ok(false) => {}
        Err(e) => {
            debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            );
        }
    }

    handle.claim_interface(interface)?;
    debug!("Claimed interface {}", interface);

    if endpoint.alt_setting != 0 {
        handle.set_alternate_setting(interface, endpoint.alt_setting)?;
        debug!(
            "Selected alternate setting {} on interface {}",
            endpoint.alt_setting, interface
        );
    }

    Ok(())
}
