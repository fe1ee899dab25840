use std::collections::VecDeque;

use crate::scheduler::Scheduler;

#[cfg(feature = "serde_support")]
use serde::{Deserialize, Serialize};

/// SIO data-frame checksum: additive with carry wraparound.
pub fn sio_checksum(data: &[u8]) -> u8 {
    let mut checksum: u32 = 0;
    for &b in data {
        checksum += b as u32;
        checksum += checksum >> 8;
        checksum &= 0xFF;
    }
    checksum as u8
}

/// Decoded 5-byte command frame as handed over by the SIO manager, plus the
/// bit rate it was received at (for high-speed frame validation).
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub struct CommandFrame {
    pub device: u8,
    pub command: u8,
    pub aux1: u8,
    pub aux2: u8,
    pub cycles_per_bit: u32,
}

impl CommandFrame {
    pub fn aux(&self) -> u16 {
        self.aux1 as u16 | ((self.aux2 as u16) << 8)
    }
}

/// Reply to the SIO manager's begin-command offer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CmdResponse {
    /// Frame is not for this device (or undecodable at this rate).
    NotHandled,
    /// Device claims the command; transfers/fences will follow.
    Start,
}

/// Transport primitives the drive requests from the SIO manager. Every
/// operation is queued and completes asynchronously; fences mark points the
/// device wants a callback at.
pub trait SioTransport {
    fn delay(&mut self, cycles: u32);
    fn send_ack(&mut self);
    fn send_nak(&mut self);
    fn send_complete(&mut self);
    fn send_error(&mut self);
    /// Queue `data` for transmission, appending the frame checksum when
    /// `add_checksum` is set.
    fn send_data(&mut self, data: &[u8], add_checksum: bool);
    /// Ask the manager to collect `len` bytes from the host (plus a
    /// trailing checksum byte when expected) and deliver a
    /// receive-complete carrying `id`.
    fn receive_data(&mut self, id: u32, len: usize, expect_checksum: bool);
    fn insert_fence(&mut self, id: u32);
    fn end_command(&mut self);
    fn flush_queue(&mut self);
    fn set_transfer_rate(&mut self, cycles_per_bit: u32, cycles_per_byte: u32);
    fn transfer_rate_bit(&self) -> u32;
    /// Time the last byte of the command frame finished.
    fn command_frame_end_time(&self) -> u64;
    /// Time the command line was released.
    fn command_deassert_time(&self) -> u64;
}

/// Observable bus traffic, with completion timestamps. Tests and the
/// self-test binary assert against this.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum WireEvent {
    Ack,
    Nak,
    Complete,
    Error,
    Data(Vec<u8>),
}

/// Callback produced by the queue for the harness to route into the device.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum SioCallback {
    Fence(u32),
    ReceiveComplete {
        id: u32,
        data: Vec<u8>,
        checksum_ok: bool,
    },
}

enum SioOp {
    Delay(u32),
    SendCtl(WireEvent),
    SendData(Vec<u8>, bool),
    Fence(u32),
    Receive {
        id: u32,
        len: usize,
        expect_checksum: bool,
    },
    EndCommand,
}

/// Minimal SIO manager: an operation queue that charges wire time against
/// the scheduler at the device-selected transfer rate and yields callbacks
/// in order. Stands in for the full byte-level transport.
pub struct SioQueue {
    ops: VecDeque<SioOp>,
    cycles_per_bit: u32,
    cycles_per_byte: u32,
    cmd_frame_end: u64,
    cmd_deassert: u64,
    command_open: bool,
    host_frames: VecDeque<(Vec<u8>, bool)>,
    pub wire: Vec<(u64, WireEvent)>,
}

impl SioQueue {
    pub fn new() -> Self {
        SioQueue {
            ops: VecDeque::new(),
            cycles_per_bit: 94,
            cycles_per_byte: 949,
            cmd_frame_end: 0,
            cmd_deassert: 0,
            command_open: false,
            host_frames: VecDeque::new(),
            wire: Vec::new(),
        }
    }

    /// Record the command frame timestamps before offering the frame to the
    /// device (both deadlines feed the NAK timing rule).
    pub fn open_command(&mut self, frame_end: u64, deassert: u64) {
        self.cmd_frame_end = frame_end;
        self.cmd_deassert = deassert;
        self.command_open = true;
    }

    pub fn is_command_open(&self) -> bool {
        self.command_open
    }

    /// Stage a host-to-drive data frame for the next receive operation.
    pub fn push_host_frame(&mut self, data: Vec<u8>, checksum_ok: bool) {
        self.host_frames.push_back((data, checksum_ok));
    }

    pub fn pending_ops(&self) -> usize {
        self.ops.len()
    }

    /// Drain queued operations, advancing the scheduler clock by each
    /// operation's wire time, until a callback for the device is produced
    /// or the queue empties.
    pub fn step(&mut self, sched: &mut Scheduler) -> Option<SioCallback> {
        while let Some(op) = self.ops.pop_front() {
            match op {
                SioOp::Delay(c) => {
                    sched.advance(c as u64);
                }
                SioOp::SendCtl(ev) => {
                    sched.advance(self.cycles_per_byte as u64);
                    self.wire.push((sched.now(), ev));
                }
                SioOp::SendData(data, add_checksum) => {
                    let mut bytes = data;
                    if add_checksum {
                        bytes.push(sio_checksum(&bytes));
                    }
                    sched.advance(bytes.len() as u64 * self.cycles_per_byte as u64);
                    self.wire.push((sched.now(), WireEvent::Data(bytes)));
                }
                SioOp::Fence(id) => {
                    return Some(SioCallback::Fence(id));
                }
                SioOp::Receive {
                    id,
                    len,
                    expect_checksum,
                } => {
                    let n = len + expect_checksum as usize;
                    sched.advance(n as u64 * self.cycles_per_byte as u64);
                    let (data, checksum_ok) = self
                        .host_frames
                        .pop_front()
                        .unwrap_or((Vec::new(), false));
                    return Some(SioCallback::ReceiveComplete {
                        id,
                        data,
                        checksum_ok,
                    });
                }
                SioOp::EndCommand => {
                    self.command_open = false;
                }
            }
        }
        None
    }

    /// Wire events of a given shape, oldest first.
    pub fn control_bytes(&self) -> Vec<WireEvent> {
        self.wire
            .iter()
            .filter(|(_, e)| !matches!(e, WireEvent::Data(_)))
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn data_frames(&self) -> Vec<Vec<u8>> {
        self.wire
            .iter()
            .filter_map(|(_, e)| match e {
                WireEvent::Data(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Default for SioQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SioTransport for SioQueue {
    fn delay(&mut self, cycles: u32) {
        self.ops.push_back(SioOp::Delay(cycles));
    }

    fn send_ack(&mut self) {
        self.ops.push_back(SioOp::SendCtl(WireEvent::Ack));
    }

    fn send_nak(&mut self) {
        self.ops.push_back(SioOp::SendCtl(WireEvent::Nak));
    }

    fn send_complete(&mut self) {
        self.ops.push_back(SioOp::SendCtl(WireEvent::Complete));
    }

    fn send_error(&mut self) {
        self.ops.push_back(SioOp::SendCtl(WireEvent::Error));
    }

    fn send_data(&mut self, data: &[u8], add_checksum: bool) {
        self.ops
            .push_back(SioOp::SendData(data.to_vec(), add_checksum));
    }

    fn receive_data(&mut self, id: u32, len: usize, expect_checksum: bool) {
        self.ops.push_back(SioOp::Receive {
            id,
            len,
            expect_checksum,
        });
    }

    fn insert_fence(&mut self, id: u32) {
        self.ops.push_back(SioOp::Fence(id));
    }

    fn end_command(&mut self) {
        self.ops.push_back(SioOp::EndCommand);
    }

    fn flush_queue(&mut self) {
        self.ops.clear();
    }

    fn set_transfer_rate(&mut self, cycles_per_bit: u32, cycles_per_byte: u32) {
        self.cycles_per_bit = cycles_per_bit;
        self.cycles_per_byte = cycles_per_byte;
    }

    fn transfer_rate_bit(&self) -> u32 {
        self.cycles_per_bit
    }

    fn command_frame_end_time(&self) -> u64 {
        self.cmd_frame_end
    }

    fn command_deassert_time(&self) -> u64 {
        self.cmd_deassert
    }
}
