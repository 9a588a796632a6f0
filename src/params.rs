//! NTB parameter negotiation.
//!
//! Runs once per bind, after the data interface has been switched to the
//! endpoint-less alternate setting and before it is switched to the data
//! alternate setting. The resulting [`NtbConfig`] is immutable for the
//! lifetime of the device.

use smoltcp::wire::ETHERNET_HEADER_LEN;

use crate::device::{DeviceUnavailable, UsbControl};
use crate::descriptors::EthernetDescriptor;
use crate::wire::{
	self, NcmCapabilities, NtbParameters, REQ_GET_MAX_DATAGRAM_SIZE, REQ_GET_NTB_PARAMETERS,
	REQ_SET_CRC_MODE, REQ_SET_MAX_DATAGRAM_SIZE, REQ_SET_NTB_FORMAT, REQ_SET_NTB_INPUT_SIZE,
};

pub(crate) const ETH_HLEN: u32 = ETHERNET_HEADER_LEN as u32;

/// Validated transfer-block parameters.
///
/// All clamping and defaulting has already been applied: the moduli are
/// powers of two of at least [`wire::NDP_ALIGN_MIN_SIZE`] and smaller
/// than `tx_max`, `tx_remainder` has been re-biased by the Ethernet
/// header length and is smaller than `tx_modulus`, and `tx_max_datagrams`
/// does not exceed [`wire::DPT_DATAGRAMS_MAX`].
#[derive(Clone, Copy, Debug)]
pub struct NtbConfig {
	/// Largest NTB accepted on the bulk IN endpoint.
	pub rx_max: u32,
	/// Largest NTB emitted on the bulk OUT endpoint.
	pub tx_max: u32,
	/// Effective payload remainder modulo `tx_modulus`, already reduced
	/// by the Ethernet header length so that datagram payloads (not
	/// their Ethernet headers) land where the device asked.
	pub tx_remainder: u16,
	#[doc(alias = "wNdpOutDivisor")]
	pub tx_modulus: u16,
	#[doc(alias = "wNdpOutAlignment")]
	pub tx_ndp_modulus: u16,
	#[doc(alias = "wNtbOutMaxDatagrams")]
	pub tx_max_datagrams: u16,
	/// Largest Ethernet frame carried in either direction.
	pub max_datagram_size: u32,
	/// Unclamped dwNtbOutMaxSize as the device advertised it. The
	/// short-packet rule compares against this, not against `tx_max`.
	pub out_max_raw: u32,
	pub capabilities: NcmCapabilities,
}

impl NtbConfig {
	/// The MTU the network device should be configured with.
	pub fn mtu(&self) -> u32 {
		self.max_datagram_size - ETH_HLEN
	}
}

fn valid_modulus(value: u16, tx_max: u32) -> bool {
	value >= wire::NDP_ALIGN_MIN_SIZE && value.is_power_of_two() && u32::from(value) < tx_max
}

/// Runs the class-request negotiation sequence against the control
/// interface and derives the driver's working parameters.
///
/// A failing GET_NTB_PARAMETERS aborts the bind; every later request is
/// advisory and falls back to a safe default on failure.
pub fn negotiate(
	bus: &mut impl UsbControl,
	control_interface: u8,
	ethernet: &EthernetDescriptor,
	capabilities: NcmCapabilities,
) -> Result<NtbConfig, DeviceUnavailable> {
	let index = u16::from(control_interface);

	let mut raw = [0; NtbParameters::SIZE];
	let len = bus
		.control_in(REQ_GET_NTB_PARAMETERS, 0, index, &mut raw)
		.map_err(|_err| {
			warn!("GET_NTB_PARAMETERS failed");
			DeviceUnavailable
		})?;
	let parm = NtbParameters::parse(&raw[..len]).ok_or_else(|| {
		warn!("short GET_NTB_PARAMETERS response ({len} bytes)");
		DeviceUnavailable
	})?;

	debug!(
		"NTB parameters: in_max_size={} out_max_size={} out_divisor={} out_payload_remainder={} out_alignment={} out_max_datagrams={} capabilities={capabilities:?}",
		parm.in_max_size,
		parm.out_max_size,
		parm.out_divisor,
		parm.out_payload_remainder,
		parm.out_alignment,
		parm.out_max_datagrams
	);

	let rx_max = parm.in_max_size.clamp(wire::NTB_MIN_IN_SIZE, wire::NTB_MAX_SIZE_RX);
	if rx_max != parm.in_max_size {
		debug!("using receive block length {rx_max}");

		// Inform the device of the reduced receive budget. The extended
		// form carries an additional datagram cap, which we leave
		// unlimited.
		let result = if capabilities.contains(NcmCapabilities::NTB_INPUT_SIZE) {
			let payload = wire::ntb_input_size_ext(rx_max, 0);
			bus.control_out(REQ_SET_NTB_INPUT_SIZE, 0, index, &payload)
		} else {
			let payload = wire::ntb_input_size(rx_max);
			bus.control_out(REQ_SET_NTB_INPUT_SIZE, 0, index, &payload)
		};
		if result.is_err() {
			debug!("setting NTB input size failed");
		}
	}

	let mut tx_max = parm.out_max_size;
	if tx_max < wire::MIN_HDR_SIZE + wire::MIN_DATAGRAM_SIZE || tx_max > wire::NTB_MAX_SIZE_TX {
		debug!("using default transmit block length {}", wire::NTB_MAX_SIZE_TX);
		tx_max = wire::NTB_MAX_SIZE_TX;
	}

	let mut tx_max_datagrams = parm.out_max_datagrams;
	if tx_max_datagrams == 0 || tx_max_datagrams > wire::DPT_DATAGRAMS_MAX {
		tx_max_datagrams = wire::DPT_DATAGRAMS_MAX;
	}

	let mut tx_ndp_modulus = parm.out_alignment;
	if !valid_modulus(tx_ndp_modulus, tx_max) {
		debug!("using default NDP alignment: 4 bytes");
		tx_ndp_modulus = wire::NDP_ALIGN_MIN_SIZE;
	}

	let mut tx_modulus = parm.out_divisor;
	if !valid_modulus(tx_modulus, tx_max) {
		debug!("using default transmit modulus: 4 bytes");
		tx_modulus = wire::NDP_ALIGN_MIN_SIZE;
	}

	let mut tx_remainder = parm.out_payload_remainder;
	if tx_remainder >= tx_modulus {
		debug!("using default transmit remainder: 0 bytes");
		tx_remainder = 0;
	}

	// Re-bias the remainder so the datagram payload, not the Ethernet
	// header, satisfies the device-requested congruence.
	tx_remainder =
		(tx_remainder + tx_modulus - (ETH_HLEN as u16 % tx_modulus)) % tx_modulus;

	if capabilities.contains(NcmCapabilities::CRC_MODE)
		&& bus
			.control_out(REQ_SET_CRC_MODE, wire::CRC_NOT_APPENDED, index, &[])
			.is_err()
	{
		debug!("setting CRC mode off failed");
	}

	if parm.formats_supported & wire::NTB16_SUPPORTED != 0
		&& parm.formats_supported & wire::NTB32_SUPPORTED != 0
		&& bus
			.control_out(REQ_SET_NTB_FORMAT, wire::NTB16_FORMAT, index, &[])
			.is_err()
	{
		debug!("setting NTB format to 16-bit failed");
	}

	let mut max_datagram_size = wire::MIN_DATAGRAM_SIZE;
	if capabilities.contains(NcmCapabilities::MAX_DATAGRAM_SIZE) {
		let mut raw = [0; 2];
		match bus.control_in(REQ_GET_MAX_DATAGRAM_SIZE, 0, index, &mut raw) {
			Ok(2..) => {
				let advertised = u32::from(u16::from_le_bytes(raw));
				let eth_max = u32::from(ethernet.max_segment_size);

				max_datagram_size = advertised;
				if max_datagram_size > eth_max {
					max_datagram_size = eth_max;
				}
				if max_datagram_size > wire::MAX_DATAGRAM_SIZE {
					max_datagram_size = wire::MAX_DATAGRAM_SIZE;
				}
				if max_datagram_size < wire::MIN_DATAGRAM_SIZE {
					max_datagram_size = wire::MIN_DATAGRAM_SIZE;
				}

				if max_datagram_size != advertised {
					let payload = (max_datagram_size as u16).to_le_bytes();
					if bus
						.control_out(REQ_SET_MAX_DATAGRAM_SIZE, 0, index, &payload)
						.is_err()
					{
						debug!("SET_MAX_DATAGRAM_SIZE failed");
					}
				}
			}
			_ => {
				debug!(
					"GET_MAX_DATAGRAM_SIZE failed, using size {}",
					wire::MIN_DATAGRAM_SIZE
				);
			}
		}
	}

	Ok(NtbConfig {
		rx_max,
		tx_max,
		tx_remainder,
		tx_modulus,
		tx_ndp_modulus,
		tx_max_datagrams,
		max_datagram_size,
		out_max_raw: parm.out_max_size,
		capabilities,
	})
}
