//! Fixed-layout payloads carried on the bus and over local process channels.
//!
//! Every payload is encoded little-endian with a fixed size so the estimation
//! process can read it as a plain C structure.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::ProtocolError;
use crate::envelope::TopicId;

/// A value that can be published on a bus topic.
pub trait Payload: Sized + Send + Sync + 'static {
    /// Name used in diagnostics.
    const KIND: &'static str;

    /// Append the encoded value to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Decode a value from its exact encoded bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the length or any enumerated field is invalid.
    fn decode(data: &[u8]) -> Result<Self, ProtocolError>;

    /// Encode into a fresh buffer.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

fn expect_len(kind: &'static str, data: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if data.len() == expected {
        Ok(())
    } else {
        Err(ProtocolError::PayloadLength {
            kind,
            expected,
            actual: data.len(),
        })
    }
}

/// Pose estimation sample produced by the local estimation process.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EstimationTelemetry {
    /// Estimated position in metres.
    pub position: [f32; 3],
    /// Estimated orientation as a rotation vector in radians.
    pub rotation: [f32; 3],
    /// Camera frame counter.
    pub frame_number: u32,
    /// Capture time, unix milliseconds truncated to 32 bits.
    pub frame_time_ms: u32,
    /// Whether the estimation converged.
    pub valid: bool,
    /// One bit per identified marker.
    pub marker_ids: u64,
    /// Number of image points used.
    pub point_count: u16,
}

impl EstimationTelemetry {
    /// Encoded size in bytes.
    pub const SIZE: usize = 43;

    /// Whether the marker with the given index was identified.
    #[must_use]
    pub fn has_marker(&self, index: u32) -> bool {
        index < 64 && self.marker_ids & (1 << index) != 0
    }
}

impl Payload for EstimationTelemetry {
    const KIND: &'static str = "telemetry";

    fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(Self::SIZE);
        for v in self.position.iter().chain(self.rotation.iter()) {
            buf.put_f32_le(*v);
        }
        buf.put_u32_le(self.frame_number);
        buf.put_u32_le(self.frame_time_ms);
        buf.put_u8(u8::from(self.valid));
        buf.put_u64_le(self.marker_ids);
        buf.put_u16_le(self.point_count);
    }

    fn decode(mut data: &[u8]) -> Result<Self, ProtocolError> {
        expect_len(Self::KIND, data, Self::SIZE)?;

        let mut position = [0f32; 3];
        let mut rotation = [0f32; 3];
        for v in position.iter_mut().chain(rotation.iter_mut()) {
            *v = data.get_f32_le();
        }

        Ok(Self {
            position,
            rotation,
            frame_number: data.get_u32_le(),
            frame_time_ms: data.get_u32_le(),
            valid: data.get_u8() != 0,
            marker_ids: data.get_u64_le(),
            point_count: data.get_u16_le(),
        })
    }
}

/// Command kinds understood by the estimation process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum CommandKind {
    #[default]
    None = 0,
    /// Launch the estimation process.
    Startup = 1,
    /// Stop the estimation process.
    Shutdown = 2,
    StartRecording = 3,
    StopRecording = 4,
    /// Argument is the exposure time in microseconds.
    SetExposure = 5,
}

impl From<CommandKind> for u32 {
    fn from(kind: CommandKind) -> u32 {
        kind as u32
    }
}

impl TryFrom<u32> for CommandKind {
    type Error = &'static str;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CommandKind::None),
            1 => Ok(CommandKind::Startup),
            2 => Ok(CommandKind::Shutdown),
            3 => Ok(CommandKind::StartRecording),
            4 => Ok(CommandKind::StopRecording),
            5 => Ok(CommandKind::SetExposure),
            _ => Err("Invalid command kind"),
        }
    }
}

/// A command for an estimation process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EstimationCommand {
    pub kind: CommandKind,
    pub argument: i32,
}

impl EstimationCommand {
    /// Encoded size in bytes.
    pub const SIZE: usize = 8;

    /// Create a command.
    #[must_use]
    pub fn new(kind: CommandKind, argument: i32) -> Self {
        Self { kind, argument }
    }
}

impl Payload for EstimationCommand {
    const KIND: &'static str = "command";

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.kind.into());
        buf.put_i32_le(self.argument);
    }

    fn decode(mut data: &[u8]) -> Result<Self, ProtocolError> {
        expect_len(Self::KIND, data, Self::SIZE)?;
        let kind = CommandKind::try_from(data.get_u32_le())
            .map_err(|e| ProtocolError::Invalid(e.to_string()))?;
        Ok(Self {
            kind,
            argument: data.get_i32_le(),
        })
    }
}

/// Operating mode reported by the estimation process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum StateMode {
    #[default]
    Idle = 0,
    Running = 1,
    Recording = 2,
    Stopped = 3,
    Error = 4,
}

impl From<StateMode> for u32 {
    fn from(mode: StateMode) -> u32 {
        mode as u32
    }
}

impl TryFrom<u32> for StateMode {
    type Error = &'static str;

    fn try_from(value: u32) -> Result<Self, <Self as TryFrom<u32>>::Error> {
        match value {
            0 => Ok(StateMode::Idle),
            1 => Ok(StateMode::Running),
            2 => Ok(StateMode::Recording),
            3 => Ok(StateMode::Stopped),
            4 => Ok(StateMode::Error),
            _ => Err("Invalid state mode"),
        }
    }
}

/// Estimation process state report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EstimationState {
    pub mode: StateMode,
    pub frame_number: u32,
    pub uptime_s: u32,
}

impl EstimationState {
    /// Encoded size in bytes.
    pub const SIZE: usize = 12;
}

impl Payload for EstimationState {
    const KIND: &'static str = "state";

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.mode.into());
        buf.put_u32_le(self.frame_number);
        buf.put_u32_le(self.uptime_s);
    }

    fn decode(mut data: &[u8]) -> Result<Self, ProtocolError> {
        expect_len(Self::KIND, data, Self::SIZE)?;
        let mode = StateMode::try_from(data.get_u32_le())
            .map_err(|e| ProtocolError::Invalid(e.to_string()))?;
        Ok(Self {
            mode,
            frame_number: data.get_u32_le(),
            uptime_s: data.get_u32_le(),
        })
    }
}

/// Liveness counter exchanged between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Heartbeat {
    pub counter: u32,
    pub node_id: u32,
}

impl Heartbeat {
    /// Encoded size in bytes.
    pub const SIZE: usize = 8;
}

impl Payload for Heartbeat {
    const KIND: &'static str = "heartbeat";

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.counter);
        buf.put_u32_le(self.node_id);
    }

    fn decode(mut data: &[u8]) -> Result<Self, ProtocolError> {
        expect_len(Self::KIND, data, Self::SIZE)?;
        Ok(Self {
            counter: data.get_u32_le(),
            node_id: data.get_u32_le(),
        })
    }
}

impl Payload for bool {
    const KIND: &'static str = "bool";

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(*self));
    }

    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        expect_len(Self::KIND, data, 1)?;
        match data[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::Invalid(format!("bool byte {other}"))),
        }
    }
}

/// Topic-discovery report: the topics a gateway wants to receive.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopicReport {
    pub topics: Vec<TopicId>,
}

impl TopicReport {
    /// Create a report.
    #[must_use]
    pub fn new(topics: Vec<TopicId>) -> Self {
        Self { topics }
    }
}

impl Payload for TopicReport {
    const KIND: &'static str = "topic report";

    fn encode(&self, buf: &mut BytesMut) {
        let count = self.topics.len().min(u16::MAX as usize);
        buf.reserve(2 + count * 4);
        buf.put_u16_le(count as u16);
        for id in &self.topics[..count] {
            buf.put_u32_le(*id);
        }
    }

    fn decode(mut data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < 2 {
            return Err(ProtocolError::PayloadLength {
                kind: Self::KIND,
                expected: 2,
                actual: data.len(),
            });
        }
        let count = data.get_u16_le() as usize;
        expect_len(Self::KIND, data, count * 4)?;

        let topics = (0..count).map(|_| data.get_u32_le()).collect();
        Ok(Self { topics })
    }
}
