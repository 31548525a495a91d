use crate::config::Codec;
use crate::media::wire::FrameHeader;
use bytes::Bytes;
use std::collections::VecDeque;

/// A frame buffered for delivery, stamped on arrival.
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    pub header: FrameHeader,
    pub payload: Bytes,
    pub receiver_qpc: u64,
}

#[derive(Debug, Default)]
struct Slot {
    frame: Option<ReceivedFrame>,
    resend_requested: bool,
    grace_given: bool,
}

/// Where an arriving frame landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    /// Buffered at its window position
    Buffered,
    /// Its delivery tick already passed, or the slot was already filled
    Late,
    /// Beyond the window's forward edge; ignored
    Overflow,
}

/// What the delivery tick decided for the earliest position
#[derive(Debug)]
pub enum Delivery {
    /// The frame was present; the pointer advanced
    Delivered(ReceivedFrame),
    /// The frame never arrived; the pointer advanced
    Missing,
    /// The frame was granted one extra tick; no advance. Carries the
    /// sequence to request when the look-ahead never asked for it.
    Deferred { request: Option<u64> },
}

/// The client's sliding ordered-delivery window
///
/// Frames insert by sequence; a delivery clock advances one position per
/// tick. Under `ResendOnce`, missing frames within the look-ahead are
/// requested once, and a requested frame still missing at its tick gets
/// exactly one extra tick before it is dropped.
#[derive(Debug)]
pub struct DeliveryWindow {
    base: u64,
    slots: VecDeque<Slot>,
    capacity: usize,
    lookahead: usize,
    codec: Codec,
}

impl DeliveryWindow {
    /// `capacity` is `buffer_depth_seconds × frames_per_second`; the
    /// resend look-ahead is half of it.
    pub fn new(capacity: usize, codec: Codec) -> Self {
        assert!(capacity > 0, "delivery window cannot be empty");
        let mut slots = VecDeque::with_capacity(capacity);
        slots.resize_with(capacity, Slot::default);
        Self {
            base: 0,
            slots,
            capacity,
            lookahead: (capacity / 2).max(1),
            codec,
        }
    }

    /// Sequence of the next position to deliver.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Buffers a frame at its window position.
    pub fn insert(&mut self, frame: ReceivedFrame) -> Insert {
        let sequence = frame.header.sequence;
        if sequence < self.base {
            return Insert::Late;
        }
        let index = (sequence - self.base) as usize;
        if index >= self.capacity {
            return Insert::Overflow;
        }
        let slot = &mut self.slots[index];
        if slot.frame.is_some() {
            return Insert::Late;
        }
        slot.frame = Some(frame);
        Insert::Buffered
    }

    /// Missing, not-yet-requested sequences within the look-ahead,
    /// coalesced into inclusive ranges and marked requested.
    ///
    /// Always empty under `NoResends`.
    pub fn resend_ranges(&mut self, highest_seen: Option<u64>) -> Vec<(u64, u64)> {
        if self.codec != Codec::ResendOnce {
            return Vec::new();
        }
        // Only frames the server has already moved past can be missing;
        // asking for frames it has not sent yet would double-send them.
        let horizon = match highest_seen {
            Some(highest) => highest.min(self.base + self.lookahead as u64 - 1),
            None => return Vec::new(),
        };

        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for sequence in self.base..=horizon {
            let slot = &mut self.slots[(sequence - self.base) as usize];
            if slot.frame.is_some() || slot.resend_requested {
                continue;
            }
            slot.resend_requested = true;
            match ranges.last_mut() {
                Some((_, high)) if *high + 1 == sequence => *high = sequence,
                _ => ranges.push((sequence, sequence)),
            }
        }
        ranges
    }

    /// Advances the delivery clock by one tick.
    pub fn tick(&mut self) -> Delivery {
        let base = self.base;
        let front = &mut self.slots[0];
        if let Some(frame) = front.frame.take() {
            self.advance();
            return Delivery::Delivered(frame);
        }
        if self.codec == Codec::ResendOnce && !front.grace_given {
            front.grace_given = true;
            // A frame the look-ahead never reached is requested right
            // here, spending its one request and its one extra tick.
            let request = if front.resend_requested {
                None
            } else {
                front.resend_requested = true;
                Some(base)
            };
            return Delivery::Deferred { request };
        }
        self.advance();
        Delivery::Missing
    }

    fn advance(&mut self) {
        self.base += 1;
        self.slots.pop_front();
        self.slots.push_back(Slot::default());
    }
}
