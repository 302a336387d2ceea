//! Bit-exact wire layouts of the frames this core sends and receives
//!
//! All frames are packed little-endian structures. Ranging frames start with
//! an IEEE 802.15.4 style header using 16-bit addressing, followed by a
//! 16-bit [`RangingCode`] that identifies the exchange stage. The clock
//! calibration blink uses 64-bit source addressing and no PAN id.
//!
//! Frames are encoded and decoded with `ssmarshal`, which writes struct fields
//! in declaration order without padding or length prefixes. The field order in
//! this module must therefore never change: deployed nodes rely on it.
//!
//! [`RangingCode`]: enum.RangingCode.html

use core::convert::TryFrom;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{time::MASK40, Error};

/// Frame control bits of the IEEE 802.15.4 MAC header
pub mod fctrl {
    /// Data frame
    pub const FRAME_TYPE_DATA: u16 = 0x0001;
    /// Security enabled
    pub const SECURITY_ENABLED: u16 = 0x0008;
    /// More frames pending
    pub const FRAME_PENDING: u16 = 0x0010;
    /// Acknowledgement requested
    pub const ACK_REQUEST: u16 = 0x0020;
    /// Source PAN id omitted
    pub const PAN_ID_COMPRESS: u16 = 0x0040;
    /// 16-bit destination address
    pub const DEST_ADDR_16: u16 = 0x0800;
    /// 64-bit destination address
    pub const DEST_ADDR_64: u16 = 0x0C00;
    /// 16-bit source address
    pub const SRC_ADDR_16: u16 = 0x8000;
    /// 64-bit source address
    pub const SRC_ADDR_64: u16 = 0xC000;

    /// Ranging data frame, 16-bit addresses, PAN id compressed
    pub const IEEE_RANGE_16: u16 = FRAME_TYPE_DATA | PAN_ID_COMPRESS | DEST_ADDR_16 | SRC_ADDR_16;

    /// Blink carrying a clock calibration packet
    pub const IEEE_BLINK_CCP_64: u8 = 0xC5;
    /// Tag blink
    pub const IEEE_BLINK_TAG_64: u8 = 0x56;
    /// Anchor blink
    pub const IEEE_BLINK_ANC_64: u8 = 0x57;
}

/// Broadcast short address
pub const BROADCAST_ADDRESS: u16 = 0xffff;

/// Identifies the stage of a ranging exchange
///
/// The numeric values are part of the wire format.
#[derive(Clone, Copy, Debug, Eq, Hash, IntoPrimitive, PartialEq, TryFromPrimitive)]
#[repr(u16)]
pub enum RangingCode {
    /// Single-sided request
    SsTwr = 0x0110,
    /// Single-sided response
    SsTwrT1,
    /// Single-sided final report
    SsTwrFinal,
    /// Single-sided end
    SsTwrEnd,
    /// Single-sided request, extended frames
    SsTwrExt,
    /// Single-sided response, extended frames
    SsTwrExtT1,
    /// Single-sided final report, extended frames
    SsTwrExtFinal,
    /// Single-sided end, extended frames
    SsTwrExtEnd,
    /// Single-sided request, ack mode
    SsTwrAck,
    /// Single-sided response, ack mode
    SsTwrAckT1,
    /// Single-sided final report, ack mode
    SsTwrAckFinal,
    /// Single-sided end, ack mode
    SsTwrAckEnd,

    /// Double-sided request
    DsTwr = 0x0120,
    /// First double-sided response
    DsTwrT1,
    /// Second double-sided response
    DsTwrT2,
    /// Double-sided final report
    DsTwrFinal,
    /// Double-sided end
    DsTwrEnd,
    /// Double-sided request, extended frames
    DsTwrExt,
    /// First double-sided response, extended frames
    DsTwrExtT1,
    /// Second double-sided response, extended frames
    DsTwrExtT2,
    /// Double-sided final report, extended frames
    DsTwrExtFinal,
    /// Double-sided end, extended frames
    DsTwrExtEnd,

    /// Single-sided n-range request
    SsTwrNrng = 0x0130,
    /// Single-sided n-range response
    SsTwrNrngT1,
    /// Single-sided n-range final report
    SsTwrNrngFinal,
    /// Single-sided n-range end
    SsTwrNrngEnd,

    /// Double-sided n-range request
    DsTwrNrng = 0x0140,
    /// First double-sided n-range response
    DsTwrNrngT1,
    /// Second double-sided n-range response
    DsTwrNrngT2,
    /// Double-sided n-range final report
    DsTwrNrngFinal,
    /// Double-sided n-range end
    DsTwrNrngEnd,

    /// Invalid RTDoA code
    RtdoaInvalid = 0x0310,
    /// RTDoA request
    RtdoaRequest,
    /// RTDoA response
    RtdoaResponse,
}

/// The ranging algorithm a code belongs to
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TwrFamily {
    /// Single-sided two-way ranging
    SingleSided,
    /// Double-sided two-way ranging
    DoubleSided,
    /// Not a two-way ranging code
    Other,
}

impl RangingCode {
    /// Looks up a raw code from a received frame
    pub fn from_raw(code: u16) -> Result<Self, Error> {
        RangingCode::try_from(code).map_err(|_| Error::UnknownFrameCode(code))
    }

    /// Returns the raw 16-bit value
    pub fn raw(self) -> u16 {
        self.into()
    }

    /// Returns which ranging algorithm this code belongs to
    pub fn family(self) -> TwrFamily {
        match self.raw() & 0xfff0 {
            0x0110 | 0x0130 => TwrFamily::SingleSided,
            0x0120 | 0x0140 => TwrFamily::DoubleSided,
            _ => TwrFamily::Other,
        }
    }
}

/// Implemented by all fixed-layout frames
pub trait Frame: Sized + Serialize + DeserializeOwned {
    /// Encoded length in bytes
    const LEN: usize;

    /// Encodes the frame into the start of `buf`
    ///
    /// Returns the number of bytes written.
    fn encode(&self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.len() < Self::LEN {
            return Err(Error::BufferTooSmall {
                required_len: Self::LEN,
            });
        }
        let len = ssmarshal::serialize(buf, self)?;
        Ok(len)
    }

    /// Encodes the frame into a freshly allocated buffer
    fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0; Self::LEN];
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decodes a frame from the start of `buf`
    ///
    /// Trailing bytes are ignored, so a longer frame can be decoded as its
    /// prefix (e.g. a final frame as a response frame).
    fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::LEN {
            return Err(Error::BufferTooSmall {
                required_len: Self::LEN,
            });
        }
        let (frame, _) = ssmarshal::deserialize::<Self>(&buf[..Self::LEN])?;
        Ok(frame)
    }
}

/// Common header of all ranging frames
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FrameHeader {
    /// Frame control
    pub fctrl: u16,
    /// Sequence number, incremented for each new exchange
    pub seq_num: u8,
    /// PAN id
    pub pan_id: u16,
    /// Destination short address
    pub dst_address: u16,
    /// Source short address
    pub src_address: u16,
    /// Raw [`RangingCode`](enum.RangingCode.html)
    pub code: u16,
}

impl Frame for FrameHeader {
    const LEN: usize = 11;
}

impl FrameHeader {
    /// Reads the header of any ranging frame
    ///
    /// Returns `None` for frames too short to carry a header or with a frame
    /// control other than [`fctrl::IEEE_RANGE_16`].
    ///
    /// [`fctrl::IEEE_RANGE_16`]: fctrl/constant.IEEE_RANGE_16.html
    pub fn peek(buf: &[u8]) -> Option<Self> {
        let header = Self::decode(buf).ok()?;
        if header.fctrl == fctrl::IEEE_RANGE_16 {
            Some(header)
        } else {
            None
        }
    }
}

/// Ranging request, only the header
pub type RangeRequest = FrameHeader;

/// Ranging response
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RangeResponse {
    /// Frame header
    pub header: FrameHeader,
    /// When the responder received the request, lower 32 bits
    pub reception_timestamp: u32,
    /// When the responder sent this response, lower 32 bits
    pub transmission_timestamp: u32,
}

impl Frame for RangeResponse {
    const LEN: usize = FrameHeader::LEN + 8;
}

/// Final ranging report carrying all four timestamps of one round trip
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RangeFinal {
    /// Frame header
    pub header: FrameHeader,
    /// When the responder received the request, lower 32 bits
    pub reception_timestamp: u32,
    /// When the responder sent its response, lower 32 bits
    pub transmission_timestamp: u32,
    /// When the initiator sent the request, lower 32 bits
    pub request_timestamp: u32,
    /// When the initiator received the response, lower 32 bits
    pub response_timestamp: u32,
    /// Carrier integrator of the receiver
    pub carrier_integrator: i32,
}

impl Frame for RangeFinal {
    const LEN: usize = RangeResponse::LEN + 12;
}

/// Clock calibration blink
///
/// `transmission_interval` holds a 40-bit value but takes up 8 bytes on the
/// wire.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CcpBlink {
    /// Always [`fctrl::IEEE_BLINK_CCP_64`](fctrl/constant.IEEE_BLINK_CCP_64.html)
    pub fctrl: u8,
    /// Sequence number, incremented by the master every period
    pub seq_num: u8,
    /// EUID of the clock master
    pub euid: u64,
    /// Short address of the transmitter (master or relay)
    pub short_address: u16,
    /// Superframe period in DTU, reduced by relays by their repeat delay
    pub transmission_interval: u64,
    /// Master transmission timestamp, 40-bit epoch plus upper bits
    pub transmission_timestamp: u64,
    /// Number of relay hops this frame has taken
    pub rpt_count: u8,
    /// Maximum number of relay hops
    pub rpt_max: u8,
    /// How many UUS before the frame's RMARKER the epoch lies
    pub epoch_to_rm_us: u16,
}

impl Frame for CcpBlink {
    const LEN: usize = 32;
}

impl CcpBlink {
    /// Returns `true` if `buf` starts like a CCP blink
    pub fn matches(buf: &[u8]) -> bool {
        buf.len() >= Self::LEN && buf[0] == fctrl::IEEE_BLINK_CCP_64
    }

    /// The 40-bit transmission interval
    pub fn interval(&self) -> u64 {
        self.transmission_interval & MASK40
    }
}
