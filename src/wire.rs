//! Wire format definitions for the NCM block framing.
//!
//! All NCM transfer structures are little-endian and carry no implicit
//! padding, so they are modelled as views over byte slices with explicit
//! field offsets instead of `repr(C)` structs.

use num_enum::TryFromPrimitive;

/// NTH16 signature, "NCMH".
#[doc(alias = "USB_CDC_NCM_NTH16_SIGN")]
pub const NTH16_SIGN: u32 = 0x484d_434e;
/// NDP16 signature without appended CRC, "NCM0".
#[doc(alias = "USB_CDC_NCM_NDP16_NOCRC_SIGN")]
pub const NDP16_NOCRC_SIGN: u32 = 0x304d_434e;
/// NDP16 signature with appended CRC, "NCM1". Only ever rejected.
#[doc(alias = "USB_CDC_NCM_NDP16_CRC_SIGN")]
pub const NDP16_CRC_SIGN: u32 = 0x314d_434e;

pub const NTH16_SIZE: usize = 12;
pub const NDP16_SIZE: usize = 8;
pub const DPE16_SIZE: usize = 4;

/// Minimal wLength of an NDP16: the fixed part plus one datagram pointer
/// and the terminating sentinel.
#[doc(alias = "USB_CDC_NCM_NDP16_LENGTH_MIN")]
pub const NDP16_LENGTH_MIN: u16 = 0x10;

/// Hard cap on datagrams per NTB, matching the staged pointer table.
#[doc(alias = "CDC_NCM_DPT_DATAGRAMS_MAX")]
pub const DPT_DATAGRAMS_MAX: u16 = 40;

/// Reserved header region of an outgoing NTB before any alignment:
/// NTH16 + NDP16 + a full pointer table including the sentinel.
pub const MIN_HDR_SIZE: u32 =
	(NTH16_SIZE + NDP16_SIZE + (DPT_DATAGRAMS_MAX as usize + 1) * DPE16_SIZE) as u32;

#[doc(alias = "USB_CDC_NCM_NTB_MIN_IN_SIZE")]
pub const NTB_MIN_IN_SIZE: u32 = 2048;
pub const NTB_MAX_SIZE_RX: u32 = 32768;
pub const NTB_MAX_SIZE_TX: u32 = 32768;

#[doc(alias = "CDC_NCM_MIN_DATAGRAM_SIZE")]
pub const MIN_DATAGRAM_SIZE: u32 = 1514;
#[doc(alias = "CDC_NCM_MAX_DATAGRAM_SIZE")]
pub const MAX_DATAGRAM_SIZE: u32 = 8192;

/// Smallest NTB worth padding out to the full negotiated size.
#[doc(alias = "CDC_NCM_MIN_TX_PKT")]
pub const MIN_TX_PKT: u32 = 512;

/// Fallback for invalid device-requested alignment moduli.
#[doc(alias = "USB_CDC_NCM_NDP_ALIGN_MIN_SIZE")]
pub const NDP_ALIGN_MIN_SIZE: u16 = 4;

// Class-specific control requests.
pub const REQ_GET_NTB_PARAMETERS: u8 = 0x80;
pub const REQ_GET_MAX_DATAGRAM_SIZE: u8 = 0x82;
pub const REQ_SET_MAX_DATAGRAM_SIZE: u8 = 0x83;
pub const REQ_SET_NTB_FORMAT: u8 = 0x84;
pub const REQ_SET_NTB_INPUT_SIZE: u8 = 0x86;
pub const REQ_SET_CRC_MODE: u8 = 0x8a;

// wValue encodings for SET_CRC_MODE and SET_NTB_FORMAT.
pub const CRC_NOT_APPENDED: u16 = 0x0000;
pub const CRC_APPENDED: u16 = 0x0001;
pub const NTB16_FORMAT: u16 = 0x0000;
pub const NTB32_FORMAT: u16 = 0x0001;

// bmNtbFormatsSupported bits of the parameter block.
pub const NTB16_SUPPORTED: u16 = 1 << 0;
pub const NTB32_SUPPORTED: u16 = 1 << 1;

bitflags! {
	/// bmNetworkCapabilities of the NCM functional descriptor.
	#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
	pub struct NcmCapabilities: u8 {
		#[doc(alias = "USB_CDC_NCM_NCAP_ETH_FILTER")]
		const ETH_FILTER = 1 << 0;
		#[doc(alias = "USB_CDC_NCM_NCAP_NET_ADDRESS")]
		const NET_ADDRESS = 1 << 1;
		#[doc(alias = "USB_CDC_NCM_NCAP_ENCAP_COMMAND")]
		const ENCAP_COMMAND = 1 << 2;
		#[doc(alias = "USB_CDC_NCM_NCAP_MAX_DATAGRAM_SIZE")]
		const MAX_DATAGRAM_SIZE = 1 << 3;
		#[doc(alias = "USB_CDC_NCM_NCAP_CRC_MODE")]
		const CRC_MODE = 1 << 4;
		#[doc(alias = "USB_CDC_NCM_NCAP_NTB_INPUT_SIZE")]
		const NTB_INPUT_SIZE = 1 << 5;
	}
}

/// Notification codes delivered on the interrupt endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum NotificationKind {
	#[doc(alias = "USB_CDC_NOTIFY_NETWORK_CONNECTION")]
	NetworkConnection = 0x00,
	#[doc(alias = "USB_CDC_NOTIFY_SPEED_CHANGE")]
	SpeedChange = 0x2a,
}

mod field {
	use core::ops::Range;

	pub type Field = Range<usize>;

	pub const NTH_SIGNATURE: Field = 0..4;
	pub const NTH_HEADER_LENGTH: Field = 4..6;
	pub const NTH_SEQUENCE: Field = 6..8;
	pub const NTH_BLOCK_LENGTH: Field = 8..10;
	pub const NTH_NDP_INDEX: Field = 10..12;

	pub const NDP_SIGNATURE: Field = 0..4;
	pub const NDP_LENGTH: Field = 4..6;
	pub const NDP_NEXT_NDP_INDEX: Field = 6..8;

	pub const DPE_DATAGRAM_INDEX: Field = 0..2;
	pub const DPE_DATAGRAM_LENGTH: Field = 2..4;
}

fn read_u16(buffer: &[u8], field: field::Field) -> u16 {
	u16::from_le_bytes(buffer[field].try_into().unwrap())
}

fn read_u32(buffer: &[u8], field: field::Field) -> u32 {
	u32::from_le_bytes(buffer[field].try_into().unwrap())
}

fn write_u16(buffer: &mut [u8], field: field::Field, value: u16) {
	buffer[field].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(buffer: &mut [u8], field: field::Field, value: u32) {
	buffer[field].copy_from_slice(&value.to_le_bytes());
}

/// View of a 16-bit NTB header.
#[doc(alias = "usb_cdc_ncm_nth16")]
pub struct Nth16<T: AsRef<[u8]>> {
	buffer: T,
}

impl<T: AsRef<[u8]>> Nth16<T> {
	/// Wraps a buffer without checking its length. The first
	/// [`NTH16_SIZE`] bytes must be valid to index.
	pub const fn new_unchecked(buffer: T) -> Self {
		Self { buffer }
	}

	#[doc(alias = "dwSignature")]
	pub fn signature(&self) -> u32 {
		read_u32(self.buffer.as_ref(), field::NTH_SIGNATURE)
	}

	#[doc(alias = "wHeaderLength")]
	pub fn header_length(&self) -> u16 {
		read_u16(self.buffer.as_ref(), field::NTH_HEADER_LENGTH)
	}

	#[doc(alias = "wSequence")]
	pub fn sequence(&self) -> u16 {
		read_u16(self.buffer.as_ref(), field::NTH_SEQUENCE)
	}

	#[doc(alias = "wBlockLength")]
	pub fn block_length(&self) -> u16 {
		read_u16(self.buffer.as_ref(), field::NTH_BLOCK_LENGTH)
	}

	#[doc(alias = "wNdpIndex")]
	pub fn ndp_index(&self) -> u16 {
		read_u16(self.buffer.as_ref(), field::NTH_NDP_INDEX)
	}
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Nth16<T> {
	pub fn set_signature(&mut self, value: u32) {
		write_u32(self.buffer.as_mut(), field::NTH_SIGNATURE, value);
	}

	pub fn set_header_length(&mut self, value: u16) {
		write_u16(self.buffer.as_mut(), field::NTH_HEADER_LENGTH, value);
	}

	pub fn set_sequence(&mut self, value: u16) {
		write_u16(self.buffer.as_mut(), field::NTH_SEQUENCE, value);
	}

	pub fn set_block_length(&mut self, value: u16) {
		write_u16(self.buffer.as_mut(), field::NTH_BLOCK_LENGTH, value);
	}

	pub fn set_ndp_index(&mut self, value: u16) {
		write_u16(self.buffer.as_mut(), field::NTH_NDP_INDEX, value);
	}
}

/// View of the fixed part of a 16-bit datagram pointer table. The
/// pointer entries follow immediately after.
#[doc(alias = "usb_cdc_ncm_ndp16")]
pub struct Ndp16<T: AsRef<[u8]>> {
	buffer: T,
}

impl<T: AsRef<[u8]>> Ndp16<T> {
	/// Wraps a buffer without checking its length. The first
	/// [`NDP16_SIZE`] bytes must be valid to index.
	pub const fn new_unchecked(buffer: T) -> Self {
		Self { buffer }
	}

	#[doc(alias = "dwSignature")]
	pub fn signature(&self) -> u32 {
		read_u32(self.buffer.as_ref(), field::NDP_SIGNATURE)
	}

	#[doc(alias = "wLength")]
	pub fn length(&self) -> u16 {
		read_u16(self.buffer.as_ref(), field::NDP_LENGTH)
	}

	#[doc(alias = "wNextNdpIndex")]
	pub fn next_ndp_index(&self) -> u16 {
		read_u16(self.buffer.as_ref(), field::NDP_NEXT_NDP_INDEX)
	}
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Ndp16<T> {
	pub fn set_signature(&mut self, value: u32) {
		write_u32(self.buffer.as_mut(), field::NDP_SIGNATURE, value);
	}

	pub fn set_length(&mut self, value: u16) {
		write_u16(self.buffer.as_mut(), field::NDP_LENGTH, value);
	}

	pub fn set_next_ndp_index(&mut self, value: u16) {
		write_u16(self.buffer.as_mut(), field::NDP_NEXT_NDP_INDEX, value);
	}
}

/// View of a single datagram pointer entry. Index and length are byte
/// offsets from the start of the NTB.
#[doc(alias = "usb_cdc_ncm_dpe16")]
pub struct Dpe16<T: AsRef<[u8]>> {
	buffer: T,
}

impl<T: AsRef<[u8]>> Dpe16<T> {
	pub const fn new_unchecked(buffer: T) -> Self {
		Self { buffer }
	}

	#[doc(alias = "wDatagramIndex")]
	pub fn datagram_index(&self) -> u16 {
		read_u16(self.buffer.as_ref(), field::DPE_DATAGRAM_INDEX)
	}

	#[doc(alias = "wDatagramLength")]
	pub fn datagram_length(&self) -> u16 {
		read_u16(self.buffer.as_ref(), field::DPE_DATAGRAM_LENGTH)
	}
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Dpe16<T> {
	pub fn set_datagram_index(&mut self, value: u16) {
		write_u16(self.buffer.as_mut(), field::DPE_DATAGRAM_INDEX, value);
	}

	pub fn set_datagram_length(&mut self, value: u16) {
		write_u16(self.buffer.as_mut(), field::DPE_DATAGRAM_LENGTH, value);
	}
}

/// Decoded GET_NTB_PARAMETERS response.
#[doc(alias = "usb_cdc_ncm_ntb_parameters")]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NtbParameters {
	pub length: u16,
	pub formats_supported: u16,
	pub in_max_size: u32,
	pub in_divisor: u16,
	pub in_payload_remainder: u16,
	pub in_alignment: u16,
	pub out_max_size: u32,
	pub out_divisor: u16,
	pub out_payload_remainder: u16,
	pub out_alignment: u16,
	pub out_max_datagrams: u16,
}

impl NtbParameters {
	pub const SIZE: usize = 28;

	/// Decodes the 28-byte parameter block. Returns `None` if the
	/// control transfer delivered fewer bytes.
	pub fn parse(buffer: &[u8]) -> Option<Self> {
		if buffer.len() < Self::SIZE {
			return None;
		}

		Some(Self {
			length: read_u16(buffer, 0..2),
			formats_supported: read_u16(buffer, 2..4),
			in_max_size: read_u32(buffer, 4..8),
			in_divisor: read_u16(buffer, 8..10),
			in_payload_remainder: read_u16(buffer, 10..12),
			in_alignment: read_u16(buffer, 12..14),
			// 14..16 is wPadding1
			out_max_size: read_u32(buffer, 16..20),
			out_divisor: read_u16(buffer, 20..22),
			out_payload_remainder: read_u16(buffer, 22..24),
			out_alignment: read_u16(buffer, 24..26),
			out_max_datagrams: read_u16(buffer, 26..28),
		})
	}
}

/// Legacy 4-byte SET_NTB_INPUT_SIZE payload.
pub fn ntb_input_size(rx_max: u32) -> [u8; 4] {
	rx_max.to_le_bytes()
}

/// Extended 8-byte SET_NTB_INPUT_SIZE payload for devices advertising
/// [`NcmCapabilities::NTB_INPUT_SIZE`]. A datagram count of zero leaves
/// the per-NTB datagram count unlimited.
#[doc(alias = "usb_cdc_ncm_ndp_input_size")]
pub fn ntb_input_size_ext(rx_max: u32, max_datagrams: u16) -> [u8; 8] {
	let mut buffer = [0; 8];
	buffer[0..4].copy_from_slice(&rx_max.to_le_bytes());
	buffer[4..6].copy_from_slice(&max_datagrams.to_le_bytes());
	buffer
}

/// Decoded 8-byte CDC notification header.
#[doc(alias = "usb_cdc_notification")]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NotificationHeader {
	pub request_type: u8,
	pub notification_type: u8,
	pub value: u16,
	pub index: u16,
	pub payload_length: u16,
}

impl NotificationHeader {
	pub const SIZE: usize = 8;

	pub fn parse(buffer: &[u8]) -> Option<Self> {
		if buffer.len() < Self::SIZE {
			return None;
		}

		Some(Self {
			request_type: buffer[0],
			notification_type: buffer[1],
			value: read_u16(buffer, 2..4),
			index: read_u16(buffer, 4..6),
			payload_length: read_u16(buffer, 6..8),
		})
	}
}

/// Decoded SPEED_CHANGE payload: link rates in bits per second.
#[doc(alias = "usb_cdc_speed_change")]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpeedChange {
	#[doc(alias = "DLBitRRate")]
	pub downlink_bps: u32,
	#[doc(alias = "ULBitRate")]
	pub uplink_bps: u32,
}

impl SpeedChange {
	pub const SIZE: usize = 8;

	pub fn parse(buffer: &[u8]) -> Option<Self> {
		if buffer.len() < Self::SIZE {
			return None;
		}

		Some(Self {
			downlink_bps: read_u32(buffer, 0..4),
			uplink_bps: read_u32(buffer, 4..8),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn nth16_roundtrip() {
		let mut buffer = [0; NTH16_SIZE];
		let mut nth = Nth16::new_unchecked(&mut buffer[..]);
		nth.set_signature(NTH16_SIGN);
		nth.set_header_length(NTH16_SIZE as u16);
		nth.set_sequence(0x1234);
		nth.set_block_length(0x0800);
		nth.set_ndp_index(0x000c);

		assert_eq!(buffer, [0x4e, 0x43, 0x4d, 0x48, 12, 0, 0x34, 0x12, 0, 8, 12, 0]);

		let nth = Nth16::new_unchecked(&buffer[..]);
		assert_eq!(nth.signature(), NTH16_SIGN);
		assert_eq!(nth.header_length(), 12);
		assert_eq!(nth.sequence(), 0x1234);
		assert_eq!(nth.block_length(), 0x0800);
		assert_eq!(nth.ndp_index(), 12);
	}

	#[test]
	fn ndp16_roundtrip() {
		let mut buffer = [0; NDP16_SIZE];
		let mut ndp = Ndp16::new_unchecked(&mut buffer[..]);
		ndp.set_signature(NDP16_NOCRC_SIGN);
		ndp.set_length(0x18);
		ndp.set_next_ndp_index(0);

		assert_eq!(buffer, [0x4e, 0x43, 0x4d, 0x30, 0x18, 0, 0, 0]);

		let ndp = Ndp16::new_unchecked(&buffer[..]);
		assert_eq!(ndp.signature(), NDP16_NOCRC_SIGN);
		assert_eq!(ndp.length(), 0x18);
		assert_eq!(ndp.next_ndp_index(), 0);
	}

	#[test]
	fn dpe16_roundtrip() {
		let mut buffer = [0; DPE16_SIZE];
		let mut dpe = Dpe16::new_unchecked(&mut buffer[..]);
		dpe.set_datagram_index(0x00bc);
		dpe.set_datagram_length(0x05ea);

		let dpe = Dpe16::new_unchecked(&buffer[..]);
		assert_eq!(dpe.datagram_index(), 0x00bc);
		assert_eq!(dpe.datagram_length(), 0x05ea);
	}

	#[test]
	fn parameter_block() {
		#[rustfmt::skip]
		let raw = [
			28, 0, // wLength
			0x03, 0, // bmNtbFormatsSupported: NTB16 | NTB32
			0, 0x40, 0, 0, // dwNtbInMaxSize = 16384
			4, 0, // wNdpInDivisor
			0, 0, // wNdpInPayloadRemainder
			4, 0, // wNdpInAlignment
			0, 0, // wPadding1
			0, 0x20, 0, 0, // dwNtbOutMaxSize = 8192
			8, 0, // wNdpOutDivisor
			2, 0, // wNdpOutPayloadRemainder
			16, 0, // wNdpOutAlignment
			10, 0, // wNtbOutMaxDatagrams
		];

		let parm = NtbParameters::parse(&raw).unwrap();
		assert_eq!(parm.length, 28);
		assert_eq!(parm.formats_supported, NTB16_SUPPORTED | NTB32_SUPPORTED);
		assert_eq!(parm.in_max_size, 16384);
		assert_eq!(parm.in_divisor, 4);
		assert_eq!(parm.out_max_size, 8192);
		assert_eq!(parm.out_divisor, 8);
		assert_eq!(parm.out_payload_remainder, 2);
		assert_eq!(parm.out_alignment, 16);
		assert_eq!(parm.out_max_datagrams, 10);

		assert!(NtbParameters::parse(&raw[..27]).is_none());
	}

	#[test]
	fn input_size_payloads() {
		assert_eq!(ntb_input_size(0x4000), [0, 0x40, 0, 0]);
		assert_eq!(ntb_input_size_ext(0x4000, 0), [0, 0x40, 0, 0, 0, 0, 0, 0]);
	}

	#[test]
	fn notification_header() {
		let raw = [0xa1, 0x2a, 0, 0, 1, 0, 8, 0];
		let header = NotificationHeader::parse(&raw).unwrap();
		assert_eq!(header.request_type, 0xa1);
		assert_eq!(header.notification_type, 0x2a);
		assert_eq!(header.value, 0);
		assert_eq!(header.index, 1);
		assert_eq!(header.payload_length, 8);
		assert_eq!(
			NotificationKind::try_from(header.notification_type),
			Ok(NotificationKind::SpeedChange)
		);

		assert!(NotificationHeader::parse(&raw[..7]).is_none());
	}

	#[test]
	fn speed_change_payload() {
		let raw = [0x00, 0xe1, 0xf5, 0x05, 0x40, 0x42, 0x0f, 0x00];
		let speed = SpeedChange::parse(&raw).unwrap();
		assert_eq!(speed.downlink_bps, 100_000_000);
		assert_eq!(speed.uplink_bps, 1_000_000);
	}
}
