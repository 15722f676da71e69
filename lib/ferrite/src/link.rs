//! Gateway protocol engine. `Master` drives discovery, typed sends with
//! ACK/NACK semantics and deadline-bounded polling; `Slave` answers with a
//! handler table keyed by message type. Both roles share one half-duplex
//! bus through the arbiter.

use crate::buffer::Buffer;
use crate::bus::{Arbiter, BusPort};
use crate::error::{ErrorKind, NackReason, ProtoError, ProtoResult};
use crate::frame::{self, flags, FrameView, Header, MessageType, OwnedFrame};
use crate::stats::{LinkEvent, LinkStats};
use flint::backoff::Backoff;
use flint::logging::{self, Logger};
use flint::time::{Clock, Deadline};
use hashbrown::HashMap;
use indexmap::IndexMap;
use std::collections::VecDeque;
use std::time::Duration;

const RX_BUF_SIZE: usize = 4 * frame::MAX_FRAME;

const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(50);
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Replay rule over the modulo-256 sequence space: an advance of 1..=127 is
/// fresh; the same value or a decrease of up to 128 is a replay; a decrease
/// of more than 128 reads as a wrap and is fresh.
#[inline]
fn is_replay(last: u8, next: u8) -> bool {
    let ahead = next.wrapping_sub(last);
    ahead == 0 || ahead >= 128
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeviceType {
    Gateway,
    VibrationSensor,
    AcousticSensor,
    CurrentSensor,
    TemperatureSensor,
    PressureSensor,
    DigitalIo,
    Unknown(u8),
}

impl DeviceType {
    #[inline]
    pub fn code(self) -> u8 {
        match self {
            DeviceType::Gateway => 0x01,
            DeviceType::VibrationSensor => 0x10,
            DeviceType::AcousticSensor => 0x11,
            DeviceType::CurrentSensor => 0x12,
            DeviceType::TemperatureSensor => 0x13,
            DeviceType::PressureSensor => 0x14,
            DeviceType::DigitalIo => 0x20,
            DeviceType::Unknown(code) => code,
        }
    }

    #[inline]
    pub fn from_code(code: u8) -> DeviceType {
        match code {
            0x01 => DeviceType::Gateway,
            0x10 => DeviceType::VibrationSensor,
            0x11 => DeviceType::AcousticSensor,
            0x12 => DeviceType::CurrentSensor,
            0x13 => DeviceType::TemperatureSensor,
            0x14 => DeviceType::PressureSensor,
            0x20 => DeviceType::DigitalIo,
            code => DeviceType::Unknown(code),
        }
    }
}

/// Identity a node announces during discovery.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DeviceInfo {
    pub address: u8,
    pub device_type: DeviceType,
    pub firmware: (u8, u8, u8),
    pub hardware_rev: u8,
}

impl DeviceInfo {
    pub const WIRE_SIZE: usize = 5;

    pub fn decode(address: u8, payload: &[u8]) -> ProtoResult<DeviceInfo> {
        if payload.len() < Self::WIRE_SIZE {
            return Err(ProtoError::Fatal(ErrorKind::Framing));
        }

        Ok(DeviceInfo {
            address,
            device_type: DeviceType::from_code(payload[0]),
            firmware: (payload[1], payload[2], payload[3]),
            hardware_rev: payload[4],
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.device_type.code());
        out.push(self.firmware.0);
        out.push(self.firmware.1);
        out.push(self.firmware.2);
        out.push(self.hardware_rev);
    }
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub address: u8,
    pub response_timeout: Duration,
    pub max_retries: u8,
    pub discovery_window: Duration,
}

impl Default for MasterConfig {
    fn default() -> MasterConfig {
        MasterConfig {
            address: 1,
            response_timeout: Duration::from_millis(200),
            max_retries: 3,
            discovery_window: Duration::from_secs(1),
        }
    }
}

/// Outcome of one in-flight request: `AwaitAck` resolves into one of these
/// and the send loop decides between `Idle` (done) and `Retry`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum AckState {
    Acked,
    Nacked(NackReason),
    TimedOut,
}

enum Screen {
    Take,
    Ignore,
    Replay,
}

/// Destination and replay screening shared by both roles. ACK/NACK frames
/// echo the request sequence, so they bypass the replay window.
fn screen(
    own_address: u8,
    recent: &mut HashMap<u8, u8>,
    stats: &mut LinkStats,
    header: &Header,
) -> Screen {
    if header.dest != own_address && !header.is_broadcast() {
        return Screen::Ignore;
    }

    if header.msg_type == MessageType::Ack.code() || header.msg_type == MessageType::Nack.code() {
        return Screen::Take;
    }

    match recent.get(&header.source) {
        Some(&last) if is_replay(last, header.sequence) => {
            stats.replays_dropped += 1;
            Screen::Replay
        }
        _ => {
            recent.insert(header.source, header.sequence);
            Screen::Take
        }
    }
}

/// Receive step shared by both roles: a buffer overrun drops the backlog
/// and is counted instead of killing the transaction.
fn pull<P: BusPort, C: Clock>(
    bus: &mut Arbiter<P, C>,
    rx: &mut Buffer,
    stats: &mut LinkStats,
    deadline: Deadline,
) -> ProtoResult<usize> {
    match bus.recv_into(rx, deadline) {
        Ok(received) => {
            stats.bytes_rx += received as u64;
            Ok(received)
        }
        Err(ProtoError::Wait) => Ok(0),
        Err(ProtoError::Fatal(ErrorKind::Overrun)) => {
            stats.overruns += 1;
            rx.clear();
            Ok(0)
        }
        Err(err) => Err(err),
    }
}

/// Master role: the gateway end of the sensor bus.
pub struct Master {
    config: MasterConfig,
    sequence: u8,
    rx: Buffer,
    tx: Vec<u8>,
    inbox: VecDeque<OwnedFrame>,
    recent: HashMap<u8, u8>,
    stats: LinkStats,
    events: Vec<LinkEvent>,
    log: Logger,
}

impl Master {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(config: MasterConfig, log: L) -> Master {
        Master {
            config,
            sequence: 0,
            rx: Buffer::new(RX_BUF_SIZE),
            tx: Vec::with_capacity(frame::MAX_FRAME),
            inbox: VecDeque::new(),
            recent: HashMap::new(),
            stats: LinkStats::default(),
            events: Vec::new(),
            log: logging::branch(log),
        }
    }

    #[inline]
    pub fn address(&self) -> u8 {
        self.config.address
    }

    #[inline]
    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Drains the terminal-state events accumulated since the last call.
    #[inline]
    pub fn events(&mut self) -> impl Iterator<Item = LinkEvent> + '_ {
        self.events.drain(..)
    }

    #[inline]
    fn next_sequence(&mut self) -> u8 {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        sequence
    }

    /// Broadcasts a discovery request and collects announcements over the
    /// configured window. First announcement wins per address; a second one
    /// carrying a different identity is counted as an address conflict.
    pub fn discover<P: BusPort, C: Clock>(
        &mut self,
        bus: &mut Arbiter<P, C>,
    ) -> ProtoResult<IndexMap<u8, DeviceInfo>> {
        let sequence = self.next_sequence();

        self.tx.clear();
        frame::build(
            &mut self.tx,
            self.config.address,
            frame::BROADCAST,
            MessageType::Discover.code(),
            sequence,
            0,
            &[],
        )?;

        bus.send(&self.tx)?;
        self.stats.frames_tx += 1;
        self.stats.bytes_tx += self.tx.len() as u64;

        logging::debug!(self.log, "discovery broadcast sent";
                        "context" => "discover", "sequence" => sequence);

        let deadline = Deadline::after(bus.now(), self.config.discovery_window);
        let mut found: IndexMap<u8, DeviceInfo> = IndexMap::new();

        loop {
            if deadline.expired(bus.now()) {
                break;
            }

            if pull(bus, &mut self.rx, &mut self.stats, deadline)? == 0 {
                continue;
            }

            self.drain_frames(None);
            self.collect_announcements(&mut found);
        }

        logging::info!(self.log, "discovery window closed";
                       "context" => "discover", "devices" => found.len());

        Ok(found)
    }

    /// Sends one typed message. With `ACK_REQUIRED` set, the in-flight state
    /// machine runs to a terminal state, retrying with exponential backoff
    /// and a preserved sequence number so the peer can detect duplicates.
    /// Broadcast sends never await acknowledgment.
    pub fn send<P: BusPort, C: Clock>(
        &mut self,
        bus: &mut Arbiter<P, C>,
        dest: u8,
        msg_type: MessageType,
        payload: &[u8],
        flag_bits: u8,
    ) -> ProtoResult<()> {
        let flag_bits = if dest == frame::BROADCAST {
            flag_bits & !flags::ACK_REQUIRED
        } else {
            flag_bits
        };

        let sequence = self.next_sequence();

        self.tx.clear();
        frame::build(
            &mut self.tx,
            self.config.address,
            dest,
            msg_type.code(),
            sequence,
            flag_bits,
            payload,
        )?;

        let mut backoff = Backoff::new(RETRY_BACKOFF_BASE, RETRY_BACKOFF_CAP);
        let mut attempt: u32 = 0;

        loop {
            bus.send(&self.tx)?;
            self.stats.frames_tx += 1;
            self.stats.bytes_tx += self.tx.len() as u64;

            if flag_bits & flags::ACK_REQUIRED == 0 {
                return Ok(());
            }

            let state = self.await_ack(bus, dest, sequence)?;

            match state {
                AckState::Acked => {
                    self.stats.acks_rx += 1;
                    self.events.push(LinkEvent::Delivered {
                        dest,
                        sequence,
                        attempts: attempt + 1,
                    });

                    logging::debug!(self.log, "message delivered";
                                    "context" => "send",
                                    "dest" => dest,
                                    "sequence" => sequence,
                                    "attempts" => attempt + 1);

                    return Ok(());
                }
                AckState::Nacked(reason) => {
                    self.stats.nacks_rx += 1;

                    if attempt >= u32::from(self.config.max_retries) {
                        let kind = ErrorKind::Nack(reason);
                        self.events.push(LinkEvent::SendFailed { dest, sequence, kind });
                        return Err(ProtoError::Fatal(kind));
                    }
                }
                AckState::TimedOut => {
                    self.stats.timeouts += 1;

                    if attempt >= u32::from(self.config.max_retries) {
                        self.events.push(LinkEvent::SendFailed {
                            dest,
                            sequence,
                            kind: ErrorKind::Timeout,
                        });
                        return Err(ProtoError::Fatal(ErrorKind::Timeout));
                    }
                }
            }

            attempt += 1;
            self.stats.retries += 1;
            bus.sleep(backoff.next_delay());

            logging::debug!(self.log, "retrying send";
                            "context" => "send",
                            "dest" => dest,
                            "sequence" => sequence,
                            "attempt" => attempt,
                            "state" => ?state);
        }
    }

    /// Deadline-bounded receive. Returns the next frame addressed to this
    /// node (or broadcast) that passed CRC and replay screening.
    pub fn poll<P: BusPort, C: Clock>(
        &mut self,
        bus: &mut Arbiter<P, C>,
        timeout: Duration,
    ) -> ProtoResult<Option<OwnedFrame>> {
        if let Some(queued) = self.inbox.pop_front() {
            return Ok(Some(queued));
        }

        let deadline = Deadline::after(bus.now(), timeout);

        loop {
            if deadline.expired(bus.now()) {
                return Ok(None);
            }

            if pull(bus, &mut self.rx, &mut self.stats, deadline)? == 0 {
                continue;
            }

            self.drain_frames(None);

            if let Some(queued) = self.inbox.pop_front() {
                return Ok(Some(queued));
            }
        }
    }

    fn await_ack<P: BusPort, C: Clock>(
        &mut self,
        bus: &mut Arbiter<P, C>,
        dest: u8,
        sequence: u8,
    ) -> ProtoResult<AckState> {
        let deadline = Deadline::after(bus.now(), self.config.response_timeout);

        loop {
            if deadline.expired(bus.now()) {
                return Ok(AckState::TimedOut);
            }

            if pull(bus, &mut self.rx, &mut self.stats, deadline)? == 0 {
                continue;
            }

            if let Some(state) = self.drain_frames(Some((dest, sequence))) {
                return Ok(state);
            }
        }
    }

    /// Parses everything buffered. Frames that survive screening land in
    /// the inbox, except the ACK/NACK matching `pending`, which resolves
    /// the in-flight state machine instead.
    fn drain_frames(&mut self, pending: Option<(u8, u8)>) -> Option<AckState> {
        let mut resolved = None;

        loop {
            let (consumed, state) = {
                match frame::parse(self.rx.read_slice()) {
                    frame::Step::Incomplete => (0, None),
                    frame::Step::Corrupt { consumed, kind, .. } => {
                        match kind {
                            ErrorKind::Crc => self.stats.crc_errors += 1,
                            _ => self.stats.framing_errors += 1,
                        }
                        (consumed, None)
                    }
                    frame::Step::Frame(parsed, size) => {
                        let state = match screen(
                            self.config.address,
                            &mut self.recent,
                            &mut self.stats,
                            &parsed.header,
                        ) {
                            Screen::Take => {
                                self.stats.frames_rx += 1;
                                Self::route(
                                    &mut self.inbox,
                                    &parsed,
                                    pending,
                                    resolved.is_some(),
                                )
                            }
                            Screen::Ignore | Screen::Replay => None,
                        };

                        (size, state)
                    }
                }
            };

            if consumed == 0 {
                break;
            }

            self.rx.consume(consumed);

            if state.is_some() {
                resolved = state;
            }
        }

        resolved
    }

    /// Decides where one accepted frame goes: resolve the pending request,
    /// or queue for `poll`. Stale ACK/NACK frames are dropped.
    fn route(
        inbox: &mut VecDeque<OwnedFrame>,
        parsed: &FrameView<'_>,
        pending: Option<(u8, u8)>,
        already_resolved: bool,
    ) -> Option<AckState> {
        let header = &parsed.header;
        let is_ack = header.msg_type == MessageType::Ack.code();
        let is_nack = header.msg_type == MessageType::Nack.code();

        if is_ack || is_nack {
            if let Some((dest, sequence)) = pending {
                if !already_resolved && header.source == dest && header.sequence == sequence {
                    return if is_ack {
                        Some(AckState::Acked)
                    } else {
                        let reason = parsed
                            .payload
                            .first()
                            .map(|&code| NackReason::from_code(code))
                            .unwrap_or(NackReason::Unknown(0));
                        Some(AckState::Nacked(reason))
                    };
                }
            }

            // Stale acknowledgment, nothing is waiting on it
            return None;
        }

        inbox.push_back(parsed.to_owned());
        None
    }

    fn collect_announcements(&mut self, found: &mut IndexMap<u8, DeviceInfo>) {
        let mut index = 0;

        while index < self.inbox.len() {
            if self.inbox[index].header.msg_type != MessageType::Announce.code() {
                index += 1;
                continue;
            }

            let announce = self.inbox.remove(index).expect("Index checked above");

            match DeviceInfo::decode(announce.header.source, &announce.payload) {
                Ok(info) => match found.get(&info.address) {
                    None => {
                        found.insert(info.address, info);
                    }
                    Some(existing) if *existing != info => {
                        self.stats.address_conflicts += 1;
                        self.events
                            .push(LinkEvent::AddressConflict { address: info.address });

                        logging::warn!(self.log, "conflicting discovery announcement";
                                       "context" => "discover", "address" => info.address);
                    }
                    // Identical re-announcement, a retransmission
                    Some(_) => (),
                },
                Err(_) => self.stats.framing_errors += 1,
            }
        }
    }
}

/// Handler capability for the slave role, one per message type.
pub trait MessageHandler {
    /// Handles a frame addressed to this node. Returns the ACK payload
    /// (empty for a bare ACK) or the NACK reason to refuse with.
    fn handle(&mut self, frame: &FrameView<'_>) -> Result<Vec<u8>, NackReason>;
}

#[derive(Debug, Clone)]
pub struct SlaveConfig {
    pub identity: DeviceInfo,
    /// Whether CRC failures on frames that still carried a decodable header
    /// are answered with a NACK. Framing errors are never answered.
    pub nack_on_crc: bool,
}

/// Slave role: a sensor module end of the bus.
pub struct Slave {
    config: SlaveConfig,
    handlers: HashMap<u8, Box<dyn MessageHandler>>,
    sequence: u8,
    rx: Buffer,
    tx: Vec<u8>,
    recent: HashMap<u8, u8>,
    stats: LinkStats,
    log: Logger,
}

impl Slave {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(config: SlaveConfig, log: L) -> Slave {
        Slave {
            config,
            handlers: HashMap::new(),
            sequence: 0,
            rx: Buffer::new(RX_BUF_SIZE),
            tx: Vec::with_capacity(frame::MAX_FRAME),
            recent: HashMap::new(),
            stats: LinkStats::default(),
            log: logging::branch(log),
        }
    }

    #[inline]
    pub fn address(&self) -> u8 {
        self.config.identity.address
    }

    #[inline]
    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Registers the handler for a message type, replacing any previous one.
    pub fn register(&mut self, msg_type: u8, handler: Box<dyn MessageHandler>) {
        self.handlers.insert(msg_type, handler);
    }

    /// Services the bus until the timeout elapses, answering every complete
    /// frame addressed to this node. Returns the number of frames handled.
    pub fn service<P: BusPort, C: Clock>(
        &mut self,
        bus: &mut Arbiter<P, C>,
        timeout: Duration,
    ) -> ProtoResult<usize> {
        let deadline = Deadline::after(bus.now(), timeout);
        let mut handled = 0;

        loop {
            if deadline.expired(bus.now()) {
                return Ok(handled);
            }

            if pull(bus, &mut self.rx, &mut self.stats, deadline)? == 0 {
                continue;
            }

            handled += self.dispatch_buffered(bus)?;
        }
    }

    fn dispatch_buffered<P: BusPort, C: Clock>(
        &mut self,
        bus: &mut Arbiter<P, C>,
    ) -> ProtoResult<usize> {
        let mut handled = 0;

        loop {
            // The reply is staged into the tx buffer inside the parse scope;
            // the borrow of the rx buffer must end before send and consume.
            let (consumed, respond) = {
                match frame::parse(self.rx.read_slice()) {
                    frame::Step::Incomplete => (0, false),
                    frame::Step::Corrupt {
                        consumed,
                        kind,
                        header,
                    } => {
                        let respond = match kind {
                            ErrorKind::Crc => {
                                self.stats.crc_errors += 1;
                                Self::stage_crc_nack(
                                    &self.config,
                                    &mut self.tx,
                                    &mut self.stats,
                                    header,
                                )
                            }
                            // No trustworthy address on a framing error
                            _ => {
                                self.stats.framing_errors += 1;
                                false
                            }
                        };

                        (consumed, respond)
                    }
                    frame::Step::Frame(parsed, size) => {
                        let respond = match screen(
                            self.config.identity.address,
                            &mut self.recent,
                            &mut self.stats,
                            &parsed.header,
                        ) {
                            Screen::Take => {
                                self.stats.frames_rx += 1;
                                handled += 1;

                                Self::stage_reply(
                                    &self.config,
                                    &mut self.handlers,
                                    &mut self.tx,
                                    &mut self.stats,
                                    &mut self.sequence,
                                    &self.log,
                                    &parsed,
                                )?
                            }
                            Screen::Ignore | Screen::Replay => false,
                        };

                        (size, respond)
                    }
                }
            };

            if consumed == 0 {
                return Ok(handled);
            }

            self.rx.consume(consumed);

            if respond {
                bus.send(&self.tx)?;
                self.stats.frames_tx += 1;
                self.stats.bytes_tx += self.tx.len() as u64;
            }
        }
    }

    /// Builds the reply for one accepted frame into `tx`. Returns whether
    /// there is anything to transmit; broadcast frames are processed but
    /// never answered.
    fn stage_reply(
        config: &SlaveConfig,
        handlers: &mut HashMap<u8, Box<dyn MessageHandler>>,
        tx: &mut Vec<u8>,
        stats: &mut LinkStats,
        sequence: &mut u8,
        log: &Logger,
        parsed: &FrameView<'_>,
    ) -> ProtoResult<bool> {
        let header = parsed.header;
        let own = config.identity.address;

        // Discovery is answered from the node identity, not the handler table
        if header.msg_type == MessageType::Discover.code() {
            let own_sequence = *sequence;
            *sequence = sequence.wrapping_add(1);

            let mut payload = Vec::with_capacity(DeviceInfo::WIRE_SIZE);
            config.identity.encode(&mut payload);

            tx.clear();
            frame::build(
                tx,
                own,
                header.source,
                MessageType::Announce.code(),
                own_sequence,
                0,
                &payload,
            )?;

            return Ok(true);
        }

        let outcome = match handlers.get_mut(&header.msg_type) {
            Some(handler) => handler.handle(parsed),
            None => {
                logging::debug!(log, "no handler for message type";
                                "context" => "dispatch",
                                "msg_type" => header.msg_type,
                                "source" => header.source);
                Err(NackReason::UnknownType)
            }
        };

        if header.is_broadcast() {
            return Ok(false);
        }

        match outcome {
            Ok(reply) => {
                if header.flags & flags::ACK_REQUIRED == 0 {
                    return Ok(false);
                }

                tx.clear();
                frame::build(
                    tx,
                    own,
                    header.source,
                    MessageType::Ack.code(),
                    header.sequence,
                    0,
                    &reply,
                )?;

                Ok(true)
            }
            Err(reason) => {
                stats.nacks_tx += 1;

                tx.clear();
                frame::build(
                    tx,
                    own,
                    header.source,
                    MessageType::Nack.code(),
                    header.sequence,
                    0,
                    &[reason.code()],
                )?;

                Ok(true)
            }
        }
    }

    fn stage_crc_nack(
        config: &SlaveConfig,
        tx: &mut Vec<u8>,
        stats: &mut LinkStats,
        header: Option<Header>,
    ) -> bool {
        let header = match header {
            Some(header) if config.nack_on_crc => header,
            _ => return false,
        };

        if header.dest != config.identity.address || header.source == frame::BROADCAST {
            return false;
        }

        tx.clear();

        let built = frame::build(
            tx,
            config.identity.address,
            header.source,
            MessageType::Nack.code(),
            header.sequence,
            0,
            &[NackReason::Crc.code()],
        );

        match built {
            Ok(()) => {
                stats.nacks_tx += 1;
                true
            }
            Err(_) => false,
        }
    }
}
