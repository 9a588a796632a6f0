//! Status endpoint notifications and link state.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::device::NetDevice;
use crate::wire::{NotificationHeader, NotificationKind, SpeedChange};

/// Link state fed by the notification path. Readers on other paths use
/// relaxed loads; nothing here is ordered against the data paths.
pub(crate) struct LinkState {
	connected: AtomicBool,
	rx_bps: AtomicU32,
	tx_bps: AtomicU32,
	/// A speed-change header arrived without its payload; the next
	/// interrupt transfer carries the payload alone.
	speed_split: AtomicBool,
}

impl LinkState {
	pub(crate) const fn new() -> Self {
		Self {
			connected: AtomicBool::new(false),
			rx_bps: AtomicU32::new(0),
			tx_bps: AtomicU32::new(0),
			speed_split: AtomicBool::new(false),
		}
	}

	pub(crate) fn is_connected(&self) -> bool {
		self.connected.load(Ordering::Relaxed)
	}

	/// Current (downlink, uplink) rates in bits per second.
	pub(crate) fn speeds(&self) -> (u32, u32) {
		(
			self.rx_bps.load(Ordering::Relaxed),
			self.tx_bps.load(Ordering::Relaxed),
		)
	}

	/// Handles one transfer from the interrupt endpoint.
	pub(crate) fn status(&self, net: &mut impl NetDevice, buffer: &[u8]) {
		if buffer.len() < NotificationHeader::SIZE {
			return;
		}

		if self.speed_split.swap(false, Ordering::AcqRel) {
			if let Some(speed) = SpeedChange::parse(buffer) {
				self.speed_change(speed);
			}
			return;
		}

		let Some(header) = NotificationHeader::parse(buffer) else {
			return;
		};

		match NotificationKind::try_from(header.notification_type) {
			Ok(NotificationKind::NetworkConnection) => {
				let connected = header.value != 0;
				self.connected.store(connected, Ordering::Relaxed);

				info!(
					"network connection: {}connected",
					if connected { "" } else { "dis" }
				);

				net.carrier(connected);
				if !connected {
					self.rx_bps.store(0, Ordering::Relaxed);
					self.tx_bps.store(0, Ordering::Relaxed);
				}
			}
			Ok(NotificationKind::SpeedChange) => {
				match SpeedChange::parse(&buffer[NotificationHeader::SIZE..]) {
					Some(speed) => self.speed_change(speed),
					// Payload split off into the next transfer.
					None => self.speed_split.store(true, Ordering::Release),
				}
			}
			Err(_) => {
				error!("unexpected notification {:#04x}", header.notification_type);
			}
		}
	}

	fn speed_change(&self, speed: SpeedChange) {
		let rx_bps = speed.downlink_bps;
		let tx_bps = speed.uplink_bps;

		if rx_bps == self.rx_bps.load(Ordering::Relaxed)
			&& tx_bps == self.tx_bps.load(Ordering::Relaxed)
		{
			return;
		}

		self.rx_bps.store(rx_bps, Ordering::Relaxed);
		self.tx_bps.store(tx_bps, Ordering::Relaxed);

		if rx_bps > 1_000_000 && tx_bps > 1_000_000 {
			info!(
				"link speed: {} Mbit/s downlink, {} Mbit/s uplink",
				rx_bps / 1_000_000,
				tx_bps / 1_000_000
			);
		} else {
			info!(
				"link speed: {} kbit/s downlink, {} kbit/s uplink",
				rx_bps / 1000,
				tx_bps / 1000
			);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use smoltcp::wire::EthernetAddress;

	#[derive(Default)]
	struct MockNet {
		carrier: Vec<bool>,
	}

	impl NetDevice for MockNet {
		fn deliver(&mut self, _datagram: &[u8]) {}

		fn set_mtu(&mut self, _mtu: u32) {}

		fn set_mac_address(&mut self, _address: EthernetAddress) {}

		fn carrier(&mut self, up: bool) {
			self.carrier.push(up);
		}

		fn kick_tx(&mut self) {}
	}

	fn connection(value: u16) -> [u8; 8] {
		let mut buffer = [0xa1, 0x00, 0, 0, 1, 0, 0, 0];
		buffer[2..4].copy_from_slice(&value.to_le_bytes());
		buffer
	}

	fn speed_notification(down: u32, up: u32) -> [u8; 16] {
		let mut buffer = [0; 16];
		buffer[..8].copy_from_slice(&[0xa1, 0x2a, 0, 0, 1, 0, 8, 0]);
		buffer[8..12].copy_from_slice(&down.to_le_bytes());
		buffer[12..16].copy_from_slice(&up.to_le_bytes());
		buffer
	}

	#[test]
	fn connection_controls_carrier() {
		let link = LinkState::new();
		let mut net = MockNet::default();

		link.status(&mut net, &connection(1));
		assert!(link.is_connected());
		assert_eq!(net.carrier, [true]);

		link.status(&mut net, &connection(0));
		assert!(!link.is_connected());
		assert_eq!(net.carrier, [true, false]);
	}

	#[test]
	fn disconnect_resets_speeds() {
		let link = LinkState::new();
		let mut net = MockNet::default();

		link.status(&mut net, &speed_notification(100_000_000, 50_000_000));
		assert_eq!(link.speeds(), (100_000_000, 50_000_000));

		link.status(&mut net, &connection(0));
		assert_eq!(link.speeds(), (0, 0));
	}

	#[test]
	fn inline_speed_change() {
		let link = LinkState::new();
		let mut net = MockNet::default();

		link.status(&mut net, &speed_notification(480_000_000, 480_000_000));
		assert_eq!(link.speeds(), (480_000_000, 480_000_000));
		// No carrier change from a speed notification.
		assert!(net.carrier.is_empty());
	}

	#[test]
	fn split_speed_change() {
		let link = LinkState::new();
		let mut net = MockNet::default();

		// Header without payload arms the continuation.
		link.status(&mut net, &[0xa1, 0x2a, 0, 0, 1, 0, 8, 0]);
		assert_eq!(link.speeds(), (0, 0));

		// The next transfer is the payload by itself.
		let mut payload = [0; 8];
		payload[0..4].copy_from_slice(&42_000_000u32.to_le_bytes());
		payload[4..8].copy_from_slice(&21_000_000u32.to_le_bytes());
		link.status(&mut net, &payload);
		assert_eq!(link.speeds(), (42_000_000, 21_000_000));

		// The continuation only applies once.
		link.status(&mut net, &connection(1));
		assert!(link.is_connected());
	}

	#[test]
	fn runt_transfer_is_ignored() {
		let link = LinkState::new();
		let mut net = MockNet::default();

		link.status(&mut net, &[0xa1, 0x00, 1]);
		assert!(!link.is_connected());
		assert!(net.carrier.is_empty());
	}

	#[test]
	fn unknown_notification_is_ignored() {
		let link = LinkState::new();
		let mut net = MockNet::default();

		link.status(&mut net, &[0xa1, 0x08, 0, 0, 1, 0, 0, 0]);
		assert!(!link.is_connected());
		assert!(net.carrier.is_empty());
		assert_eq!(link.speeds(), (0, 0));
	}
}
