//! Transmit path: aggregation of outgoing Ethernet frames into NTBs.
//!
//! Frames are packed back to back under the device-requested alignment
//! until the block is full, the datagram cap is reached, or the flush
//! timer decides that no more frames are coming. At most one frame that
//! did not fit is held back for the next block.

use alloc::vec::Vec;

use align_address::Align;

use crate::device::NetStats;
use crate::params::NtbConfig;
use crate::wire::{
	DPE16_SIZE, DPT_DATAGRAMS_MAX, Dpe16, MIN_TX_PKT, NDP16_NOCRC_SIGN, NDP16_SIZE, NTH16_SIGN,
	NTH16_SIZE, Nth16, Ndp16,
};

/// Arm the timer again instead of transmitting while a partial block
/// holds fewer datagrams than this.
#[doc(alias = "CDC_NCM_RESTART_TIMER_DATAGRAM_CNT")]
const RESTART_TIMER_DATAGRAM_CNT: u16 = 3;
/// Number of timer periods to wait before a partial block is flushed.
#[doc(alias = "CDC_NCM_TIMER_PENDING_CNT")]
pub(crate) const TIMER_PENDING_CNT: u32 = 2;

const DPE_TABLE_SIZE: usize = DPT_DATAGRAMS_MAX as usize + 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Dpe {
	index: u16,
	length: u16,
}

/// A partially filled NTB. The header region stays zeroed until
/// finalization; `offset` is the next aligned payload position and
/// `last_offset` the end of the last datagram.
struct PendingNtb {
	buffer: Vec<u8>,
	offset: u32,
	last_offset: u32,
	frame_num: u16,
	dpe: [Dpe; DPE_TABLE_SIZE],
}

impl PendingNtb {
	fn new(config: &NtbConfig) -> Option<Self> {
		let size = config.tx_max as usize + 1;
		let mut buffer = Vec::new();
		if buffer.try_reserve_exact(size).is_err() {
			error!("failed to allocate transmit NTB");
			return None;
		}
		buffer.resize(size, 0);

		// Reserve room for the NTH, the NDP and a full pointer table,
		// then move to the first aligned payload position.
		let offset = (NTH16_SIZE as u32).align_up(u32::from(config.tx_ndp_modulus))
			+ NDP16_SIZE as u32
			+ (u32::from(config.tx_max_datagrams) + 1) * DPE16_SIZE as u32;
		let last_offset = offset;
		let offset =
			offset.align_up(u32::from(config.tx_modulus)) + u32::from(config.tx_remainder);

		Some(Self {
			buffer,
			offset,
			last_offset,
			frame_num: 0,
			dpe: [Dpe::default(); DPE_TABLE_SIZE],
		})
	}
}

/// Encoder state, guarded by the device's transmit lock.
#[derive(Default)]
pub(crate) struct TxState {
	pending: Option<PendingNtb>,
	remainder: Option<Vec<u8>>,
	seq: u16,
	pub(crate) timer_pending: u32,
}

impl TxState {
	pub(crate) fn has_pending(&self) -> bool {
		self.pending.is_some()
	}

	/// Drops any buffered state. Held frames are gone afterwards.
	pub(crate) fn clear(&mut self) {
		self.pending = None;
		self.remainder = None;
	}

	/// Feeds one frame into the current NTB, or, with `incoming` absent,
	/// asks for the current NTB to be emitted (flush-timer path).
	///
	/// Returns the finalized NTB once it is ready to hand to the bulk
	/// OUT transfer. The caller arms the flush timer whenever this
	/// returns `None` while [`Self::has_pending`] stays true.
	pub(crate) fn fill(
		&mut self,
		config: &NtbConfig,
		out_max_packet: u16,
		stats: &NetStats,
		incoming: Option<Vec<u8>>,
	) -> Option<Vec<u8>> {
		let mut frame = incoming;
		let mut ready_to_send = false;

		// Process a previously held-back frame first so that frames
		// leave in arrival order.
		if frame.is_some() {
			core::mem::swap(&mut frame, &mut self.remainder);
		} else {
			ready_to_send = true;
		}

		let mut ntb = match self.pending.take() {
			Some(ntb) => ntb,
			None => match PendingNtb::new(config) {
				Some(ntb) => ntb,
				None => {
					if frame.is_some() {
						stats.tx_dropped_inc();
					}
					return None;
				}
			},
		};

		let mut n = ntb.frame_num;
		while n < config.tx_max_datagrams {
			if ntb.offset >= config.tx_max {
				ready_to_send = true;
				break;
			}
			let room = config.tx_max - ntb.offset;

			let Some(datagram) = frame.take().or_else(|| self.remainder.take()) else {
				break;
			};

			let length = datagram.len() as u32;
			if length > room {
				if n == 0 {
					// Bigger than an empty NTB with these parameters.
					warn!("dropping {length} byte frame exceeding the transmit block");
					stats.tx_dropped_inc();
					break;
				}

				// Hold it back for the next NTB. A frame already
				// waiting there is superseded.
				if self.remainder.replace(datagram).is_some() {
					stats.tx_dropped_inc();
				}
				ready_to_send = true;
				break;
			}

			ntb.buffer[ntb.offset as usize..][..datagram.len()].copy_from_slice(&datagram);
			ntb.dpe[usize::from(n)] = Dpe {
				index: ntb.offset as u16,
				length: length as u16,
			};
			ntb.offset += length;
			ntb.last_offset = ntb.offset;
			ntb.offset =
				ntb.offset.align_up(u32::from(config.tx_modulus)) + u32::from(config.tx_remainder);
			n += 1;
		}

		if frame.take().is_some() {
			stats.tx_dropped_inc();
		}

		ntb.frame_num = n;

		if n == 0 {
			// Nothing packed yet, wait for more frames or the timer.
			self.pending = Some(ntb);
			return None;
		} else if n < config.tx_max_datagrams && !ready_to_send {
			// Room left and nothing forces emission, keep accumulating.
			if n < RESTART_TIMER_DATAGRAM_CNT {
				self.timer_pending = TIMER_PENDING_CNT;
			}
			self.pending = Some(ntb);
			return None;
		}

		Some(self.finalize(config, out_max_packet, stats, ntb))
	}

	fn finalize(
		&mut self,
		config: &NtbConfig,
		out_max_packet: u16,
		stats: &NetStats,
		mut ntb: PendingNtb,
	) -> Vec<u8> {
		let n = ntb.frame_num;
		let mut last_offset = ntb.last_offset.min(config.tx_max);

		// Blocks beyond the minimum transfer size are padded out to the
		// full negotiated length.
		if last_offset > MIN_TX_PKT {
			last_offset = config.tx_max;
		}

		// The device relies on a short packet to delimit blocks. If the
		// length would end on a packet boundary, a single zero byte is
		// appended, unless the block already spans the largest transfer
		// the device will ever see.
		let max_packet = u32::from(out_max_packet);
		if max_packet != 0
			&& ((last_offset < config.tx_max && last_offset % max_packet == 0)
				|| (last_offset == config.tx_max
					&& config.tx_max % max_packet == 0
					&& config.tx_max < config.out_max_raw))
		{
			ntb.buffer[last_offset as usize] = 0;
			last_offset += 1;
		}

		for dpe in &mut ntb.dpe[usize::from(n)..] {
			*dpe = Dpe::default();
		}

		let ndp_index = (NTH16_SIZE as u32).align_up(u32::from(config.tx_ndp_modulus));

		let mut nth = Nth16::new_unchecked(&mut ntb.buffer[..NTH16_SIZE]);
		nth.set_signature(NTH16_SIGN);
		nth.set_header_length(NTH16_SIZE as u16);
		nth.set_sequence(self.seq);
		nth.set_block_length(last_offset as u16);
		nth.set_ndp_index(ndp_index as u16);
		self.seq = self.seq.wrapping_add(1);

		let mut ndp =
			Ndp16::new_unchecked(&mut ntb.buffer[ndp_index as usize..][..NDP16_SIZE]);
		ndp.set_signature(NDP16_NOCRC_SIGN);
		ndp.set_length(((usize::from(n) + 1) * DPE16_SIZE + NDP16_SIZE) as u16);
		ndp.set_next_ndp_index(0);

		let mut entry = ndp_index as usize + NDP16_SIZE;
		for dpe in &ntb.dpe[..=usize::from(n)] {
			let mut view = Dpe16::new_unchecked(&mut ntb.buffer[entry..][..DPE16_SIZE]);
			view.set_datagram_index(dpe.index);
			view.set_datagram_length(dpe.length);
			entry += DPE16_SIZE;
		}

		let mut buffer = ntb.buffer;
		buffer.truncate(last_offset as usize);
		stats.tx_packets_add(u64::from(n));
		buffer
	}
}
