use super::header::RootBlock;
use super::packet::{
    decode_payload, Command, CMD_CHECKPOINT_DROP, CMD_CHECKPOINT_START, PACKET_HEADER_SIZE,
};
use crate::error::{Error, Result};
use crate::storage::{BlockHandle, BlockStorage};
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;

pub struct RecoveredSegment {
    pub handle: BlockHandle,
    /// Sequence of the first packet, `None` for a never-written segment.
    pub first_sequence: Option<i64>,
    /// Offset of the end-of-log marker, once replay found it.
    pub end_position: Option<u32>,
    /// Freed by a completed checkpoint and not reused since.
    pub dropped: bool,
}

impl RecoveredSegment {
    pub fn live(&self) -> bool {
        self.first_sequence.is_some() && !self.dropped
    }
}

pub struct RecoveredLog {
    pub root_handle: BlockHandle,
    pub segments: Vec<RecoveredSegment>,
    pub last_sequence: i64,
    /// Segment holding the newest packet, `None` on a log with no live data.
    pub current: Option<usize>,
}

/// Replays the whole log from its root block, feeding every decoded command
/// (checkpoint markers included) to the receiver in global sequence order.
///
/// Segments are ordered by their first packet's sequence, not by slot order.
/// A checkpointed-away segment whose bytes were never overwritten still
/// replays; its commands carry older sequences, so replay order makes the
/// duplication harmless for an idempotent receiver. Any magic, checksum or
/// sequence-order violation is corruption and aborts the whole recovery.
pub fn replay(
    storage: &dyn BlockStorage,
    root_addr: u64,
    receiver: &mut dyn FnMut(&Command) -> Result<()>,
) -> Result<RecoveredLog> {
    let root_handle = storage.open_existing(root_addr)?;
    let mut root_bytes = vec![0u8; root_handle.size as usize];
    storage.read_at(root_handle, 0, &mut root_bytes)?;
    let root = RootBlock::decode(&root_bytes)?;

    let mut segments = Vec::with_capacity(root.slots.len());
    for slot in &root.slots {
        let handle = storage.open_existing(slot.start as u64)?;
        if handle.size < slot.size as u64 {
            return Err(Error::Corruption(format!(
                "segment at {} is {} bytes, root block claims {}",
                slot.start, handle.size, slot.size
            )));
        }
        let first_sequence = first_packet_sequence(storage, handle)?;
        segments.push(RecoveredSegment {
            handle,
            first_sequence,
            end_position: None,
            dropped: false,
        });
    }

    // Replay order is defined by the data, not the slot table.
    let mut order: Vec<usize> = (0..segments.len())
        .filter(|idx| segments[*idx].first_sequence.is_some())
        .collect();
    order.sort_by_key(|idx| segments[*idx].first_sequence);

    let mut last_sequence = 0i64;
    // addr of a snapshotted segment -> sequence of the packet that dropped it
    let mut dropped_at: HashMap<u32, i64> = HashMap::new();
    let mut pending_drop: Vec<u32> = Vec::new();

    for idx in order {
        let end = replay_segment(
            storage,
            segments[idx].handle,
            &mut last_sequence,
            &mut pending_drop,
            &mut dropped_at,
            receiver,
        )?;
        segments[idx].end_position = Some(end);
    }

    // A segment is gone only if the drop happened after its data was written;
    // a later rotation onto the same slot revives it.
    for segment in &mut segments {
        if let Some(first) = segment.first_sequence {
            if let Some(drop_seq) = dropped_at.get(&(segment.handle.addr as u32)) {
                segment.dropped = first < *drop_seq;
            }
        }
    }

    let current = segments
        .iter()
        .enumerate()
        .filter(|(_, seg)| seg.live())
        .max_by_key(|(_, seg)| seg.first_sequence)
        .map(|(idx, _)| idx);

    tracing::debug!(
        segments = segments.len(),
        last_sequence,
        "log replay complete"
    );

    Ok(RecoveredLog {
        root_handle,
        segments,
        last_sequence,
        current,
    })
}

fn first_packet_sequence(
    storage: &dyn BlockStorage,
    handle: BlockHandle,
) -> Result<Option<i64>> {
    let mut buf = [0u8; PACKET_HEADER_SIZE];
    storage.read_at(handle, 0, &mut buf)?;
    match super::packet::PacketHeader::decode(&buf)? {
        None => Ok(None),
        Some(header) if header.is_end_marker() => Ok(None),
        Some(header) => Ok(Some(header.sequence)),
    }
}

fn replay_segment(
    storage: &dyn BlockStorage,
    handle: BlockHandle,
    last_sequence: &mut i64,
    pending_drop: &mut Vec<u32>,
    dropped_at: &mut HashMap<u32, i64>,
    receiver: &mut dyn FnMut(&Command) -> Result<()>,
) -> Result<u32> {
    let mut position: u32 = 0;
    loop {
        let mut header_buf = [0u8; PACKET_HEADER_SIZE];
        storage.read_at(handle, position as u64, &mut header_buf)?;
        let header = match super::packet::PacketHeader::decode(&header_buf)? {
            Some(header) => header,
            None => {
                return Err(Error::Corruption(format!(
                    "segment at {} has no end-of-log marker (offset {})",
                    handle.addr, position
                )));
            }
        };
        if header.is_end_marker() {
            return Ok(position);
        }

        let payload_end = position as u64 + PACKET_HEADER_SIZE as u64 + header.length as u64;
        if payload_end > handle.size {
            return Err(Error::Corruption(format!(
                "packet {} claims {} payload bytes past segment end",
                header.sequence, header.length
            )));
        }
        if header.sequence <= *last_sequence {
            return Err(Error::Corruption(format!(
                "packet sequence {} not after {}",
                header.sequence, *last_sequence
            )));
        }

        let mut payload = vec![0u8; header.length as usize];
        storage.read_at(handle, position as u64 + PACKET_HEADER_SIZE as u64, &mut payload)?;
        let commands = decode_payload(&header, &payload)?;

        for command in &commands {
            match command.kind {
                CMD_CHECKPOINT_START => {
                    pending_drop.clear();
                    let mut reader = command.bytes.as_slice();
                    let count = reader.read_u32::<LittleEndian>().map_err(|e| {
                        Error::Corruption(format!("truncated checkpoint payload: {}", e))
                    })?;
                    for _ in 0..count {
                        pending_drop.push(reader.read_u32::<LittleEndian>().map_err(|e| {
                            Error::Corruption(format!("truncated checkpoint payload: {}", e))
                        })?);
                    }
                }
                CMD_CHECKPOINT_DROP => {
                    for addr in pending_drop.drain(..) {
                        dropped_at.insert(addr, header.sequence);
                    }
                }
                _ => {}
            }
            receiver(command)?;
        }

        *last_sequence = header.sequence;
        position = payload_end as u32;
    }
}
