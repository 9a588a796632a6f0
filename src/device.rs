//! Device lifecycle and the transport-facing driver entry points.
//!
//! [`NcmDevice`] holds everything negotiated at bind time plus the
//! encoder and decoder state. The USB transport and the network stack
//! stay outside the crate and are reached through the [`UsbBus`],
//! [`NetDevice`] and [`TxTimer`] traits.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use hermit_sync::TicketMutex;
use smoltcp::time::Duration;
use smoltcp::wire::EthernetAddress;
use thiserror::Error;

use crate::descriptors::{EthernetDescriptor, FunctionalDescriptors};
use crate::notif::LinkState;
use crate::params::{self, NtbConfig};
use crate::rxpath::{self, DecodeError};
use crate::txpath::TxState;
use crate::wire::NcmCapabilities;

/// Interval of the one-shot flush timer.
#[doc(alias = "CDC_NCM_TIMER_INTERVAL")]
pub const TX_TIMER_INTERVAL: Duration = Duration::from_micros(400);

/// A USB transfer did not complete. The cause stays with the transport.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("USB transfer failed")]
pub struct TransferError;

/// The device cannot be driven. This is the only error bind reports;
/// the specific cause is logged where it occurs.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("device unavailable")]
pub struct DeviceUnavailable;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
	In,
	Out,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferType {
	Control,
	Isochronous,
	Bulk,
	Interrupt,
}

/// The subset of an endpoint descriptor the driver cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointInfo {
	#[doc(alias = "bEndpointAddress")]
	pub address: u8,
	pub direction: Direction,
	pub transfer_type: TransferType,
	#[doc(alias = "wMaxPacketSize")]
	pub max_packet_size: u16,
}

/// The three endpoints an NCM function must provide.
#[derive(Clone, Copy, Debug)]
pub struct NcmEndpoints {
	pub bulk_in: EndpointInfo,
	pub bulk_out: EndpointInfo,
	pub status: EndpointInfo,
}

/// Class control transfers against the default pipe.
pub trait UsbControl {
	/// Class-specific IN request on the control interface. Returns the
	/// number of bytes the device answered with.
	fn control_in(
		&mut self,
		request: u8,
		value: u16,
		index: u16,
		buffer: &mut [u8],
	) -> Result<usize, TransferError>;

	/// Class-specific OUT request on the control interface.
	fn control_out(
		&mut self,
		request: u8,
		value: u16,
		index: u16,
		data: &[u8],
	) -> Result<(), TransferError>;
}

/// Everything the driver needs from the USB transport besides bulk and
/// interrupt I/O, which the transport performs on its own.
pub trait UsbBus: UsbControl {
	/// Class-specific descriptor bytes of an interface's current
	/// alternate setting.
	fn functional_descriptors(&self, interface: u8) -> &[u8];

	fn claim_interface(&mut self, interface: u8) -> Result<(), TransferError>;

	fn release_interface(&mut self, interface: u8);

	fn set_alt_setting(&mut self, interface: u8, alt_setting: u8) -> Result<(), TransferError>;

	/// Endpoints of an interface's current alternate setting.
	fn endpoints(&self, interface: u8) -> &[EndpointInfo];

	/// Reads the MAC address from the string descriptor with the given
	/// index.
	fn mac_address(&mut self, string_index: u8) -> Result<EthernetAddress, TransferError>;
}

/// The network stack side of the driver.
pub trait NetDevice {
	/// Hands one received Ethernet frame to the stack. The slice
	/// borrows from the received NTB.
	fn deliver(&mut self, datagram: &[u8]);

	fn set_mtu(&mut self, mtu: u32);

	fn set_mac_address(&mut self, address: EthernetAddress);

	fn carrier(&mut self, up: bool);

	/// Asks the stack to enter its transmit path, which drives the
	/// encoder to finalization via [`NcmDevice::tx_fixup`].
	fn kick_tx(&mut self);
}

/// One-shot monotonic timer handle. On expiry the embedder calls
/// [`NcmDevice::tx_timeout`].
pub trait TxTimer {
	fn start(&mut self, delay: Duration);

	fn cancel(&mut self);

	fn is_active(&self) -> bool;
}

/// Interface statistics, maintained by the driver and read by the
/// network device layer.
#[derive(Debug, Default)]
pub struct NetStats {
	tx_packets: AtomicU64,
	tx_dropped: AtomicU64,
	rx_packets: AtomicU64,
	rx_dropped: AtomicU64,
	rx_errors: AtomicU64,
}

impl NetStats {
	pub fn tx_packets(&self) -> u64 {
		self.tx_packets.load(Ordering::Relaxed)
	}

	pub fn tx_dropped(&self) -> u64 {
		self.tx_dropped.load(Ordering::Relaxed)
	}

	pub fn rx_packets(&self) -> u64 {
		self.rx_packets.load(Ordering::Relaxed)
	}

	/// Received blocks that were discarded without delivering a
	/// datagram.
	pub fn rx_dropped(&self) -> u64 {
		self.rx_dropped.load(Ordering::Relaxed)
	}

	pub fn rx_errors(&self) -> u64 {
		self.rx_errors.load(Ordering::Relaxed)
	}

	pub(crate) fn tx_packets_add(&self, count: u64) {
		self.tx_packets.fetch_add(count, Ordering::Relaxed);
	}

	pub(crate) fn tx_dropped_inc(&self) {
		self.tx_dropped.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn rx_packets_inc(&self) {
		self.rx_packets.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn rx_dropped_inc(&self) {
		self.rx_dropped.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn rx_errors_inc(&self) {
		self.rx_errors.fetch_add(1, Ordering::Relaxed);
	}
}

/// A bound NCM function.
pub struct NcmDevice {
	config: NtbConfig,
	endpoints: NcmEndpoints,
	control_interface: u8,
	data_interface: u8,
	mac_address: EthernetAddress,
	tx: TicketMutex<TxState>,
	rx_seq: TicketMutex<u16>,
	link: LinkState,
	stop: AtomicBool,
	unbound: bool,
	stats: NetStats,
}

impl NcmDevice {
	/// Creates a device from an externally negotiated configuration.
	///
	/// [`Self::bind`] is the usual entry point; this constructor serves
	/// embedders that run descriptor parsing and negotiation through
	/// their own enumeration machinery. Interface numbers default to
	/// control 0 / data 1 and the MAC address to all-zero.
	pub fn new(config: NtbConfig, endpoints: NcmEndpoints) -> Self {
		Self {
			config,
			endpoints,
			control_interface: 0,
			data_interface: 1,
			mac_address: EthernetAddress([0; 6]),
			tx: TicketMutex::new(TxState::default()),
			rx_seq: TicketMutex::new(0),
			link: LinkState::new(),
			stop: AtomicBool::new(false),
			unbound: false,
			stats: NetStats::default(),
		}
	}

	/// Binds the NCM function whose control interface is `interface`.
	///
	/// Locates the functional descriptors, claims the data interface,
	/// negotiates transfer-block parameters on the endpoint-less
	/// alternate setting, switches to the data alternate setting and
	/// wires up the network device. Every failure unwinds the claim.
	pub fn bind(
		bus: &mut impl UsbBus,
		net: &mut impl NetDevice,
		interface: u8,
	) -> Result<Self, DeviceUnavailable> {
		let found = FunctionalDescriptors::parse(bus.functional_descriptors(interface));
		let (Some(union_desc), Some(ethernet), Some(ncm)) = (found.union, found.ethernet, found.ncm)
		else {
			error!("missing UNION, ETHERNET or NCM functional descriptor");
			return Err(DeviceUnavailable);
		};

		if union_desc.master_interface != interface {
			error!(
				"interface {interface} is not the UNION master {}",
				union_desc.master_interface
			);
			return Err(DeviceUnavailable);
		}
		let data_interface = union_desc.slave_interface;

		if bus.claim_interface(data_interface).is_err() {
			error!("failed to claim data interface {data_interface}");
			return Err(DeviceUnavailable);
		}

		match Self::bind_claimed(
			bus,
			net,
			interface,
			data_interface,
			&ethernet,
			ncm.capabilities,
		) {
			Ok(device) => Ok(device),
			Err(err) => {
				bus.release_interface(data_interface);
				info!("bind() failure");
				Err(err)
			}
		}
	}

	fn bind_claimed(
		bus: &mut impl UsbBus,
		net: &mut impl NetDevice,
		control_interface: u8,
		data_interface: u8,
		ethernet: &EthernetDescriptor,
		capabilities: NcmCapabilities,
	) -> Result<Self, DeviceUnavailable> {
		// Negotiation runs without data endpoints.
		if bus.set_alt_setting(data_interface, 0).is_err() {
			error!("failed to reset data alternate setting");
			return Err(DeviceUnavailable);
		}

		let config = params::negotiate(bus, control_interface, ethernet, capabilities)?;

		if bus.set_alt_setting(data_interface, 1).is_err() {
			error!("failed to enable data alternate setting");
			return Err(DeviceUnavailable);
		}

		let endpoints =
			Self::find_endpoints(bus, data_interface, control_interface).ok_or_else(|| {
				error!("missing bulk or interrupt endpoint");
				DeviceUnavailable
			})?;

		let mac_address = bus.mac_address(ethernet.mac_address_index).map_err(|_err| {
			error!("failed to read MAC address");
			DeviceUnavailable
		})?;

		info!("MAC address: {mac_address}");

		net.set_mac_address(mac_address);
		net.set_mtu(config.mtu());
		net.carrier(false);

		let mut device = Self::new(config, endpoints);
		device.control_interface = control_interface;
		device.data_interface = data_interface;
		device.mac_address = mac_address;
		Ok(device)
	}

	/// Classifies the endpoints of the data and control interfaces.
	/// The first endpoint matching each role wins.
	fn find_endpoints(
		bus: &impl UsbBus,
		data_interface: u8,
		control_interface: u8,
	) -> Option<NcmEndpoints> {
		let mut bulk_in = None;
		let mut bulk_out = None;
		let mut status = None;

		let endpoints = bus
			.endpoints(data_interface)
			.iter()
			.chain(bus.endpoints(control_interface));
		for endpoint in endpoints {
			match (endpoint.transfer_type, endpoint.direction) {
				(TransferType::Bulk, Direction::In) => {
					bulk_in.get_or_insert(*endpoint);
				}
				(TransferType::Bulk, Direction::Out) => {
					bulk_out.get_or_insert(*endpoint);
				}
				(TransferType::Interrupt, Direction::In) => {
					status.get_or_insert(*endpoint);
				}
				_ => {}
			}
		}

		Some(NcmEndpoints {
			bulk_in: bulk_in?,
			bulk_out: bulk_out?,
			status: status?,
		})
	}

	/// Tears the device down. `interface` names the role being unbound;
	/// the opposite-role interface is released best-effort. The caller
	/// must stop invoking the data-path entry points afterwards and
	/// drain any deferred flush work before dropping the device.
	pub fn unbind(&mut self, bus: &mut impl UsbBus, timer: &mut impl TxTimer, interface: u8) {
		// Flag first so the timer cannot re-arm behind the cancel.
		self.stop.store(true, Ordering::Release);
		timer.cancel();

		if !self.unbound {
			if interface == self.control_interface {
				bus.release_interface(self.data_interface);
				self.unbound = true;
			} else if interface == self.data_interface {
				bus.release_interface(self.control_interface);
				self.unbound = true;
			}
		}

		self.tx.lock().clear();
	}

	/// Feeds an outgoing Ethernet frame into the encoder, or flushes
	/// with `None`. Returns a finalized NTB for the bulk OUT endpoint
	/// once one is ready.
	pub fn tx_fixup(
		&self,
		timer: &mut impl TxTimer,
		frame: Option<Vec<u8>>,
	) -> Option<Vec<u8>> {
		if self.stop.load(Ordering::Acquire) {
			drop(frame);
			return None;
		}

		let mut tx = self.tx.lock();
		let ntb = tx.fill(
			&self.config,
			self.endpoints.bulk_out.max_packet_size,
			&self.stats,
			frame,
		);

		if ntb.is_none() && tx.has_pending() {
			self.tx_timeout_start(timer);
		}

		ntb
	}

	/// Flush-timer expiry. Re-arms the timer while the debounce counter
	/// is running, then asks the stack to drive the encoder.
	pub fn tx_timeout(&self, timer: &mut impl TxTimer, net: &mut impl NetDevice) {
		if self.stop.load(Ordering::Acquire) {
			return;
		}

		let mut tx = self.tx.lock();
		if tx.timer_pending > 0 {
			tx.timer_pending -= 1;
		}

		if tx.timer_pending == 0 {
			// Never hold the encoder lock into the transmit path.
			drop(tx);
			net.kick_tx();
		} else {
			self.tx_timeout_start(timer);
		}
	}

	fn tx_timeout_start(&self, timer: &mut impl TxTimer) {
		if !(timer.is_active() || self.stop.load(Ordering::Acquire)) {
			timer.start(TX_TIMER_INTERVAL);
		}
	}

	/// Decodes one received NTB and delivers its datagrams to the
	/// network stack in table order, zero-copy.
	pub fn rx_fixup(&self, net: &mut impl NetDevice, buffer: &[u8]) -> Result<(), DecodeError> {
		let mut rx_seq = self.rx_seq.lock();
		let stats = &self.stats;

		let result = rxpath::decode(&self.config, &mut rx_seq, buffer, |datagram| {
			net.deliver(datagram);
			stats.rx_packets_inc();
		});

		// A malformed block is both an error and a discarded block.
		if result.is_err() {
			stats.rx_errors_inc();
			stats.rx_dropped_inc();
		}
		result
	}

	/// Handles one transfer from the interrupt endpoint.
	pub fn status(&self, net: &mut impl NetDevice, buffer: &[u8]) {
		self.link.status(net, buffer);
	}

	/// Whether the device reported the link as connected.
	pub fn check_connect(&self) -> bool {
		self.link.is_connected()
	}

	/// Current (downlink, uplink) rates in bits per second.
	pub fn link_speeds(&self) -> (u32, u32) {
		self.link.speeds()
	}

	pub fn config(&self) -> &NtbConfig {
		&self.config
	}

	pub fn endpoints(&self) -> &NcmEndpoints {
		&self.endpoints
	}

	pub fn mac_address(&self) -> EthernetAddress {
		self.mac_address
	}

	pub fn stats(&self) -> &NetStats {
		&self.stats
	}
}
