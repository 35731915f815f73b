use super::header::{RootBlock, SegmentSlot, MAX_SEGMENT_SLOTS, ROOT_FIXED_SIZE};
use super::packet::{
    encode_end_marker, encode_packet, Command, CMD_CHECKPOINT_DROP, CMD_CHECKPOINT_START,
    PACKET_HEADER_SIZE,
};
use super::recovery;
use crate::error::{Error, Result};
use crate::sequence::SequenceGenerator;
use crate::storage::{BlockHandle, BlockStorage};
use byteorder::{LittleEndian, WriteBytesExt};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_SEGMENT_COUNT: u32 = 5;
pub const DEFAULT_SEGMENT_SIZE: u32 = 2 * 1024 * 1024;

/// Room kept free at a segment's tail: the end-of-log marker plus a final
/// checkpoint packet must always fit without another rotation.
const TAIL_RESERVE: u32 = PACKET_HEADER_SIZE as u32 + 1024;

#[derive(Debug, Clone)]
pub struct WalOptions {
    pub segment_count: u32,
    pub segment_size: u32,
    /// Batch concurrently arriving flushes into one physical write.
    pub group_commit: bool,
    /// Bound on a group-commit wait; expiry is fatal.
    pub flush_timeout: Duration,
}

impl Default for WalOptions {
    fn default() -> Self {
        WalOptions {
            segment_count: DEFAULT_SEGMENT_COUNT,
            segment_size: DEFAULT_SEGMENT_SIZE,
            group_commit: false,
            flush_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Free for rotation to claim.
    Empty,
    /// Holds packets that have not been checkpointed away.
    Active,
    /// Snapshotted by CHECKPOINT_START, awaiting the drop.
    Reclaimable,
}

struct LogSegment {
    handle: BlockHandle,
    state: SegmentState,
    first_sequence: Option<i64>,
}

struct LogInner {
    segments: Vec<LogSegment>,
    /// Slot currently being written.
    current: usize,
    /// Offset of the end-of-log marker in the current segment; the next
    /// packet overwrites the marker in place.
    position: u32,
    pending: Vec<Command>,
    /// Slots snapshotted by the last CHECKPOINT_START.
    checkpoint: Vec<usize>,
    /// Set by CHECKPOINT_DROP: the flush that seals it moves the
    /// checkpointed slots to the empty pool.
    drop_armed: bool,
}

struct CommitState {
    writer_active: bool,
}

/// Durable, segmented, checksummed append log.
///
/// Append order determines sequence numbers and recovery replays in exactly
/// that order. Append and flush serialize under one lock per log instance.
pub struct WriteAheadLog {
    storage: Arc<dyn BlockStorage>,
    root: BlockHandle,
    sequences: Arc<SequenceGenerator>,
    options: WalOptions,
    inner: Mutex<LogInner>,
    commit: Mutex<CommitState>,
    committed: Condvar,
}

impl WriteAheadLog {
    /// Initializes a fresh log: root block plus `segment_count` empty
    /// segments, all allocated from the hosting storage.
    pub fn create(
        storage: Arc<dyn BlockStorage>,
        sequences: Arc<SequenceGenerator>,
        options: WalOptions,
    ) -> Result<Self> {
        let root = storage.allocate((ROOT_FIXED_SIZE + 8 * MAX_SEGMENT_SLOTS) as u64)?;

        let mut segments = Vec::with_capacity(options.segment_count as usize);
        let mut slots = Vec::with_capacity(options.segment_count as usize);
        for _ in 0..options.segment_count {
            let handle = allocate_segment(storage.as_ref(), options.segment_size)?;
            slots.push(SegmentSlot {
                start: handle.addr as u32,
                size: options.segment_size,
            });
            segments.push(LogSegment {
                handle,
                state: SegmentState::Empty,
                first_sequence: None,
            });
        }

        let block = RootBlock::new(slots);
        storage.write_at(root, 0, &block.encode())?;
        storage.sync()?;

        segments[0].state = SegmentState::Active;
        tracing::info!(
            segments = options.segment_count,
            segment_size = options.segment_size,
            root_addr = root.addr,
            "write-ahead log created"
        );

        Ok(WriteAheadLog {
            storage,
            root,
            sequences,
            options,
            inner: Mutex::new(LogInner {
                segments,
                current: 0,
                position: 0,
                pending: Vec::new(),
                checkpoint: Vec::new(),
                drop_armed: false,
            }),
            commit: Mutex::new(CommitState { writer_active: false }),
            committed: Condvar::new(),
        })
    }

    /// Resumes an existing log, replaying every surviving command into the
    /// receiver in sequence order. Any magic/checksum/order violation aborts
    /// startup; there is no partial recovery.
    pub fn open(
        storage: Arc<dyn BlockStorage>,
        root_addr: u64,
        sequences: Arc<SequenceGenerator>,
        options: WalOptions,
        receiver: &mut dyn FnMut(&Command) -> Result<()>,
    ) -> Result<Self> {
        let recovered = recovery::replay(storage.as_ref(), root_addr, receiver)?;
        sequences.advance_past(recovered.last_sequence);

        let mut segments: Vec<LogSegment> = recovered
            .segments
            .iter()
            .map(|seg| LogSegment {
                handle: seg.handle,
                state: if seg.live() {
                    SegmentState::Active
                } else {
                    SegmentState::Empty
                },
                first_sequence: if seg.live() { seg.first_sequence } else { None },
            })
            .collect();

        let (current, position) = match recovered.current {
            Some(idx) => {
                let end = recovered.segments[idx]
                    .end_position
                    .ok_or_else(|| Error::Corruption("current segment has no end marker".into()))?;
                (idx, end)
            }
            None => {
                segments[0].state = SegmentState::Active;
                (0, 0)
            }
        };

        tracing::info!(
            last_sequence = recovered.last_sequence,
            current_segment = current,
            position,
            "write-ahead log recovered"
        );

        Ok(WriteAheadLog {
            storage,
            root: recovered.root_handle,
            sequences,
            options,
            inner: Mutex::new(LogInner {
                segments,
                current,
                position,
                pending: Vec::new(),
                checkpoint: Vec::new(),
                drop_armed: false,
            }),
            commit: Mutex::new(CommitState { writer_active: false }),
            committed: Condvar::new(),
        })
    }

    /// Address of the root block, the only thing a host must remember to
    /// reopen the log.
    pub fn root_addr(&self) -> u64 {
        self.root.addr
    }

    /// Queues a command into the pending buffer. Nothing is durable until
    /// the buffer is flushed.
    pub fn append(&self, kind: u8, bytes: Vec<u8>) -> Result<()> {
        if kind >= CMD_CHECKPOINT_START {
            return Err(Error::InvalidState(format!(
                "command type {:#04x} is reserved for the log",
                kind
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.pending.push(Command::new(kind, bytes));
        Ok(())
    }

    /// Seals the pending buffer into one packet and makes it durable.
    pub fn flush(&self) -> Result<()> {
        if !self.options.group_commit {
            let mut inner = self.inner.lock().unwrap();
            return self.do_flush(&mut inner);
        }
        self.flush_grouped()
    }

    /// Group-commit flush: one leader performs the physical write for every
    /// command pending at seal time; woken waiters whose work was included
    /// return without writing.
    fn flush_grouped(&self) -> Result<()> {
        let deadline = Instant::now() + self.options.flush_timeout;
        let mut state = self.commit.lock().unwrap();
        loop {
            if !state.writer_active {
                state.writer_active = true;
                drop(state);

                let result = {
                    let mut inner = self.inner.lock().unwrap();
                    self.do_flush(&mut inner)
                };

                let mut state = self.commit.lock().unwrap();
                state.writer_active = false;
                drop(state);
                self.committed.notify_all();
                return result;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::ResourceExhausted(
                    "group-commit flush wait timed out".into(),
                ));
            }
            let (guard, _) = self
                .committed
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;

            // The leader may have already written our commands.
            if !state.writer_active {
                let inner = self.inner.lock().unwrap();
                if inner.pending.is_empty() && !inner.drop_armed {
                    return Ok(());
                }
            }
        }
    }

    fn do_flush(&self, inner: &mut LogInner) -> Result<()> {
        if inner.pending.is_empty() && !inner.drop_armed {
            return Ok(());
        }

        let commands = std::mem::take(&mut inner.pending);
        let sequence = self.sequences.next();
        let packet = encode_packet(sequence, &commands);
        let packet_len = packet.len() as u32;

        let fits = |segment: &LogSegment, position: u32| {
            position as u64 + packet_len as u64 + TAIL_RESERVE as u64 <= segment.handle.size
        };

        if !fits(&inner.segments[inner.current], inner.position) {
            self.rotate(inner)?;
            if !fits(&inner.segments[inner.current], 0) {
                return Err(Error::ResourceExhausted(format!(
                    "packet of {} bytes cannot fit in any log segment",
                    packet_len
                )));
            }
        }

        let segment = &inner.segments[inner.current];
        self.storage.write_at(segment.handle, inner.position as u64, &packet)?;
        self.storage.write_at(
            segment.handle,
            (inner.position + packet_len) as u64,
            &encode_end_marker(),
        )?;
        self.storage.sync()?;

        if inner.position == 0 {
            inner.segments[inner.current].first_sequence = Some(sequence);
        }
        // The cursor lands on the end marker so the next packet overwrites it.
        inner.position += packet_len;

        if inner.drop_armed {
            let reclaimed = std::mem::take(&mut inner.checkpoint);
            for idx in &reclaimed {
                inner.segments[*idx].state = SegmentState::Empty;
                inner.segments[*idx].first_sequence = None;
            }
            inner.drop_armed = false;
            tracing::info!(segments = ?reclaimed, "checkpointed segments returned to pool");
        }

        tracing::debug!(
            sequence,
            bytes = packet_len,
            segment = inner.current,
            commands = commands.len(),
            "wal packet flushed"
        );
        Ok(())
    }

    fn rotate(&self, inner: &mut LogInner) -> Result<()> {
        let next = inner
            .segments
            .iter()
            .position(|seg| seg.state == SegmentState::Empty);
        let idx = match next {
            Some(idx) => idx,
            None => self.extend(inner)?,
        };

        inner.segments[idx].state = SegmentState::Active;
        inner.segments[idx].first_sequence = None;
        inner.current = idx;
        inner.position = 0;
        tracing::info!(segment = idx, "wal rotated onto empty segment");
        Ok(())
    }

    /// No empty segment left: ask the hosting allocator for one more and
    /// rewrite the root block. Running out entirely is fatal.
    fn extend(&self, inner: &mut LogInner) -> Result<usize> {
        if inner.segments.len() >= MAX_SEGMENT_SLOTS {
            return Err(Error::ResourceExhausted(
                "write-ahead log segment table is full".into(),
            ));
        }
        let size = self.options.segment_size;
        let handle = allocate_segment(self.storage.as_ref(), size).map_err(|e| {
            Error::ResourceExhausted(format!("cannot extend write-ahead log: {}", e))
        })?;
        inner.segments.push(LogSegment {
            handle,
            state: SegmentState::Empty,
            first_sequence: None,
        });

        let slots = inner
            .segments
            .iter()
            .map(|seg| SegmentSlot {
                start: seg.handle.addr as u32,
                size: seg.handle.size as u32,
            })
            .collect();
        let block = RootBlock::new(slots);
        self.storage.write_at(self.root, 0, &block.encode())?;
        self.storage.sync()?;

        tracing::info!(segments = inner.segments.len(), "wal extended with a new segment");
        Ok(inner.segments.len() - 1)
    }

    /// Snapshots every active segment except the one being written as
    /// reclaimable, and logs the snapshot so recovery can replay the
    /// protocol.
    pub fn checkpoint_start(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.current;
        let snapshot: Vec<usize> = inner
            .segments
            .iter()
            .enumerate()
            .filter(|(idx, seg)| *idx != current && seg.state != SegmentState::Empty)
            .map(|(idx, _)| idx)
            .collect();

        let mut payload = Vec::with_capacity(4 + snapshot.len() * 4);
        payload
            .write_u32::<LittleEndian>(snapshot.len() as u32)
            .expect("vec write cannot fail");
        for idx in &snapshot {
            payload
                .write_u32::<LittleEndian>(inner.segments[*idx].handle.addr as u32)
                .expect("vec write cannot fail");
        }

        for idx in &snapshot {
            inner.segments[*idx].state = SegmentState::Reclaimable;
        }
        tracing::info!(segments = ?snapshot, "checkpoint start");
        inner.checkpoint = snapshot;
        inner
            .pending
            .push(Command::new(CMD_CHECKPOINT_START, payload));
        Ok(())
    }

    /// The caller has confirmed the snapshotted state is durable elsewhere:
    /// the flush that seals this command frees the snapshotted segments.
    pub fn checkpoint_drop(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .pending
            .push(Command::new(CMD_CHECKPOINT_DROP, Vec::new()));
        inner.drop_armed = true;
        tracing::info!("checkpoint drop armed");
        Ok(())
    }

    /// Number of segments currently in the empty pool. Used by tests and by
    /// hosts deciding when to checkpoint.
    pub fn empty_segments(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .segments
            .iter()
            .filter(|seg| seg.state == SegmentState::Empty)
            .count()
    }

    pub fn segment_count(&self) -> usize {
        self.inner.lock().unwrap().segments.len()
    }
}

fn allocate_segment(storage: &dyn BlockStorage, size: u32) -> Result<BlockHandle> {
    let handle = storage.allocate(size as u64)?;
    if handle.addr > u32::MAX as u64 {
        return Err(Error::ResourceExhausted(
            "segment address exceeds the root block's 32-bit slot format".into(),
        ));
    }
    Ok(handle)
}
