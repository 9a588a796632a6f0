//! Receive path: validation of incoming NTBs and datagram extraction.
//!
//! Every offset and length in the block is device-controlled and
//! checked against the buffer before use. Datagrams are handed to the
//! network stack as views into the received block.

use smoltcp::wire::ETHERNET_HEADER_LEN;
use thiserror::Error;

use crate::params::NtbConfig;
use crate::wire::{
	DPE16_SIZE, Dpe16, NDP16_LENGTH_MIN, NDP16_NOCRC_SIGN, NDP16_SIZE, NTH16_SIGN, NTH16_SIZE,
	Ndp16, Nth16,
};

/// Reasons for discarding a received NTB.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
	#[error("block too short")]
	TooShort,
	#[error("invalid NTH16 signature")]
	NthSignature,
	#[error("unsupported NTB block length")]
	BlockLength,
	#[error("datagram pointer table outside the block")]
	NdpIndex,
	#[error("invalid NDP16 signature")]
	NdpSignature,
	#[error("invalid NDP16 length")]
	NdpLength,
	#[error("malformed first datagram pointer")]
	Datagram,
}

/// Validates one received NTB and emits its datagrams in table order.
///
/// The emitted slices borrow from `buffer`; nothing is copied. Bounds
/// violations past the first datagram end extraction but keep what was
/// already delivered.
pub(crate) fn decode(
	config: &NtbConfig,
	rx_seq: &mut u16,
	buffer: &[u8],
	mut emit: impl FnMut(&[u8]),
) -> Result<(), DecodeError> {
	if buffer.len() < NTH16_SIZE + NDP16_SIZE {
		debug!("block too short ({} bytes)", buffer.len());
		return Err(DecodeError::TooShort);
	}

	let nth = Nth16::new_unchecked(buffer);

	if nth.signature() != NTH16_SIGN {
		debug!("invalid NTH16 signature {:#010x}", nth.signature());
		return Err(DecodeError::NthSignature);
	}

	// The block may legitimately be shorter than wBlockLength, but a
	// value beyond the negotiated receive budget is not trusted.
	if u32::from(nth.block_length()) > config.rx_max {
		debug!(
			"unsupported NTB block length {}/{}",
			nth.block_length(),
			config.rx_max
		);
		return Err(DecodeError::BlockLength);
	}

	// Advisory only. Wrap-around from 0xffff to 0 is contiguous, and a
	// fresh link starting at zero does not warn.
	let sequence = nth.sequence();
	if sequence != rx_seq.wrapping_add(1) && !(*rx_seq == 0 && sequence == 0) {
		debug!("sequence number glitch prev={rx_seq} curr={sequence}");
	}
	*rx_seq = sequence;

	let ndp_index = usize::from(nth.ndp_index());
	if ndp_index + NDP16_SIZE > buffer.len() {
		debug!("invalid DPT16 index {ndp_index}");
		return Err(DecodeError::NdpIndex);
	}

	let ndp = Ndp16::new_unchecked(&buffer[ndp_index..]);

	if ndp.signature() != NDP16_NOCRC_SIGN {
		// Also rejects the CRC-appended variant, which is switched off
		// during negotiation.
		debug!("invalid DPT16 signature {:#010x}", ndp.signature());
		return Err(DecodeError::NdpSignature);
	}

	if ndp.length() < NDP16_LENGTH_MIN {
		debug!("invalid DPT16 length {}", ndp.length());
		return Err(DecodeError::NdpLength);
	}

	// Entry count excluding the terminating sentinel.
	let nframes = (usize::from(ndp.length()) - NDP16_SIZE) / DPE16_SIZE - 1;

	let table = ndp_index + NDP16_SIZE;
	if table + nframes * DPE16_SIZE > buffer.len() {
		debug!("invalid number of datagrams {nframes}");
		return Err(DecodeError::NdpLength);
	}

	for x in 0..nframes {
		let dpe = Dpe16::new_unchecked(&buffer[table + x * DPE16_SIZE..]);
		let index = usize::from(dpe.datagram_index());
		let length = usize::from(dpe.datagram_length());

		if index == 0 || length == 0 {
			if x == 0 {
				debug!("malformed NTB: empty first datagram pointer");
				return Err(DecodeError::Datagram);
			}
			// Sentinel entry.
			break;
		}

		if index + length > buffer.len()
			|| length as u32 > config.rx_max
			|| length < ETHERNET_HEADER_LEN
		{
			debug!("invalid datagram pointer [{x}]: index={index} length={length}");
			if x == 0 {
				return Err(DecodeError::Datagram);
			}
			break;
		}

		emit(&buffer[index..index + length]);
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wire::{self, NcmCapabilities};

	fn config() -> NtbConfig {
		NtbConfig {
			rx_max: 4096,
			tx_max: 4096,
			tx_remainder: 0,
			tx_modulus: 4,
			tx_ndp_modulus: 4,
			tx_max_datagrams: wire::DPT_DATAGRAMS_MAX,
			max_datagram_size: wire::MIN_DATAGRAM_SIZE,
			out_max_raw: 4096,
			capabilities: NcmCapabilities::empty(),
		}
	}

	/// Builds a syntactically valid NTB with the NDP at offset 12 and
	/// the given pointer entries (a sentinel is appended). Datagram
	/// areas are filled with a recognizable per-entry pattern.
	fn ntb(total: usize, sequence: u16, dpe: &[(u16, u16)]) -> Vec<u8> {
		let mut buffer = vec![0u8; total];

		let mut nth = Nth16::new_unchecked(&mut buffer[..]);
		nth.set_signature(NTH16_SIGN);
		nth.set_header_length(NTH16_SIZE as u16);
		nth.set_sequence(sequence);
		nth.set_block_length(total as u16);
		nth.set_ndp_index(NTH16_SIZE as u16);

		let mut ndp = Ndp16::new_unchecked(&mut buffer[NTH16_SIZE..]);
		ndp.set_signature(NDP16_NOCRC_SIGN);
		ndp.set_length(((dpe.len() + 1) * DPE16_SIZE + NDP16_SIZE) as u16);
		ndp.set_next_ndp_index(0);

		let table = NTH16_SIZE + NDP16_SIZE;
		for (x, &(index, length)) in dpe.iter().enumerate() {
			let mut view = Dpe16::new_unchecked(&mut buffer[table + x * DPE16_SIZE..]);
			view.set_datagram_index(index);
			view.set_datagram_length(length);

			let start = usize::from(index);
			let end = start + usize::from(length);
			if end <= total {
				buffer[start..end].fill(x as u8 + 1);
			}
		}

		buffer
	}

	fn collect(buffer: &[u8]) -> (Result<(), DecodeError>, Vec<Vec<u8>>) {
		let mut rx_seq = 0;
		let mut datagrams = Vec::new();
		let result = decode(&config(), &mut rx_seq, buffer, |datagram| {
			datagrams.push(datagram.to_vec());
		});
		(result, datagrams)
	}

	#[test]
	fn delivers_datagrams_in_order() {
		let buffer = ntb(256, 1, &[(32, 20), (64, 60)]);
		let (result, datagrams) = collect(&buffer);

		assert_eq!(result, Ok(()));
		assert_eq!(datagrams.len(), 2);
		assert_eq!(datagrams[0], vec![1; 20]);
		assert_eq!(datagrams[1], vec![2; 60]);
	}

	#[test]
	fn short_block_is_discarded() {
		let (result, datagrams) = collect(&[0; NTH16_SIZE + NDP16_SIZE - 1]);
		assert_eq!(result, Err(DecodeError::TooShort));
		assert!(datagrams.is_empty());
	}

	#[test]
	fn bad_nth_signature_is_discarded() {
		let mut buffer = ntb(256, 1, &[(32, 20)]);
		buffer[0] ^= 0xff;
		let (result, datagrams) = collect(&buffer);
		assert_eq!(result, Err(DecodeError::NthSignature));
		assert!(datagrams.is_empty());
	}

	#[test]
	fn block_length_beyond_rx_max_is_discarded() {
		let mut buffer = ntb(256, 1, &[(32, 20)]);
		let mut nth = Nth16::new_unchecked(&mut buffer[..]);
		nth.set_block_length(8192);
		let (result, _) = collect(&buffer);
		assert_eq!(result, Err(DecodeError::BlockLength));
	}

	#[test]
	fn ndp_outside_block_is_discarded() {
		let mut buffer = ntb(256, 1, &[(32, 20)]);
		let mut nth = Nth16::new_unchecked(&mut buffer[..]);
		nth.set_ndp_index(250);
		let (result, _) = collect(&buffer);
		assert_eq!(result, Err(DecodeError::NdpIndex));
	}

	#[test]
	fn crc_mode_ndp_is_rejected() {
		let mut buffer = ntb(256, 1, &[(32, 20)]);
		let mut ndp = Ndp16::new_unchecked(&mut buffer[NTH16_SIZE..]);
		ndp.set_signature(wire::NDP16_CRC_SIGN);
		let (result, _) = collect(&buffer);
		assert_eq!(result, Err(DecodeError::NdpSignature));
	}

	#[test]
	fn undersized_ndp_is_discarded() {
		let mut buffer = ntb(256, 1, &[(32, 20)]);
		let mut ndp = Ndp16::new_unchecked(&mut buffer[NTH16_SIZE..]);
		ndp.set_length(NDP16_LENGTH_MIN - 1);
		let (result, _) = collect(&buffer);
		assert_eq!(result, Err(DecodeError::NdpLength));
	}

	#[test]
	fn pointer_table_overrun_is_discarded() {
		let mut buffer = ntb(64, 1, &[(32, 20)]);
		// Claim far more entries than the block can hold.
		let mut ndp = Ndp16::new_unchecked(&mut buffer[NTH16_SIZE..]);
		ndp.set_length(0x200);
		let (result, _) = collect(&buffer);
		assert_eq!(result, Err(DecodeError::NdpLength));
	}

	#[test]
	fn overflowing_first_datagram_discards_the_block() {
		let buffer = ntb(256, 1, &[(8, 0xffff)]);
		let (result, datagrams) = collect(&buffer);
		assert_eq!(result, Err(DecodeError::Datagram));
		assert!(datagrams.is_empty());
	}

	#[test]
	fn overflowing_later_datagram_keeps_earlier_ones() {
		let buffer = ntb(256, 1, &[(32, 20), (64, 0xffff)]);
		let (result, datagrams) = collect(&buffer);
		assert_eq!(result, Ok(()));
		assert_eq!(datagrams.len(), 1);
		assert_eq!(datagrams[0], vec![1; 20]);
	}

	#[test]
	fn empty_first_pointer_discards_the_block() {
		let buffer = ntb(256, 1, &[(0, 0)]);
		let (result, datagrams) = collect(&buffer);
		assert_eq!(result, Err(DecodeError::Datagram));
		assert!(datagrams.is_empty());
	}

	#[test]
	fn sentinel_stops_extraction() {
		// A valid-looking entry hides behind the sentinel.
		let buffer = ntb(256, 1, &[(32, 20), (0, 0), (64, 20)]);
		let (result, datagrams) = collect(&buffer);
		assert_eq!(result, Ok(()));
		assert_eq!(datagrams.len(), 1);
	}

	#[test]
	fn runt_datagram_stops_extraction() {
		let buffer = ntb(256, 1, &[(32, 20), (64, 8)]);
		let (result, datagrams) = collect(&buffer);
		assert_eq!(result, Ok(()));
		assert_eq!(datagrams.len(), 1);
	}

	#[test]
	fn sequence_is_tracked_across_blocks() {
		let mut rx_seq = 0xfffe;
		let config = config();

		for sequence in [0xffff, 0x0000, 0x0001] {
			let buffer = ntb(256, sequence, &[(32, 20)]);
			decode(&config, &mut rx_seq, &buffer, |_| {}).unwrap();
			assert_eq!(rx_seq, sequence);
		}
	}

	#[test]
	fn emitted_views_are_zero_copy() {
		let buffer = ntb(256, 1, &[(32, 20)]);
		let mut rx_seq = 0;
		decode(&config(), &mut rx_seq, &buffer, |datagram| {
			let base = buffer.as_ptr() as usize;
			let view = datagram.as_ptr() as usize;
			assert_eq!(view - base, 32);
		})
		.unwrap();
	}
}
