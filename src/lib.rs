//! Host-side driver core for USB CDC NCM (Network Control Model).
//!
//! NCM tunnels Ethernet frames over USB bulk endpoints in framed
//! batches called network transfer blocks (NTB). This crate implements
//! the block encoder and decoder, the class-request negotiation and the
//! link-state bookkeeping; USB transfers and the network device itself
//! stay with the embedder and are reached through the traits in
//! [`device`].
//!
//! For the protocol see [NCM 1.0](https://www.usb.org/document-library/network-control-model-devices-specification-v10-and-errata-and-adopters-agreement).
//!
//! Only the 16-bit block format is spoken. Devices that also offer the
//! 32-bit format are switched to 16-bit during negotiation, and the
//! CRC-appended pointer-table variant is turned off.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

pub mod descriptors;
pub mod device;
pub mod params;
pub mod wire;

mod notif;
mod rxpath;
mod txpath;

pub use smoltcp::time::Duration;
pub use smoltcp::wire::EthernetAddress;

pub use self::device::{
	DeviceUnavailable, Direction, EndpointInfo, NcmDevice, NcmEndpoints, NetDevice, NetStats,
	TX_TIMER_INTERVAL, TransferError, TransferType, TxTimer, UsbBus, UsbControl,
};
pub use self::params::NtbConfig;
pub use self::rxpath::DecodeError;

pub const DRIVER_DESCRIPTION: &str = "CDC NCM";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const USB_CLASS_COMM: u8 = 0x02;
pub const USB_CDC_SUBCLASS_NCM: u8 = 0x0d;
pub const USB_CDC_PROTO_NONE: u8 = 0x00;

/// Whether an interface's class triple identifies an NCM communications
/// interface this driver can bind.
pub fn is_ncm_interface(class: u8, subclass: u8, protocol: u8) -> bool {
	class == USB_CLASS_COMM && subclass == USB_CDC_SUBCLASS_NCM && protocol == USB_CDC_PROTO_NONE
}
