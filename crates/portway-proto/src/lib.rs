//! Wire protocol for the portway control channel.
//!
//! Every exchange between the cloud and an agent is a [`Frame`]: a fixed
//! ten-byte header (version, message type, tunnel id, payload length)
//! followed by a typed payload. Frames are self-delimiting, so any number
//! of them may be concatenated on the channel and parsed back losslessly.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, FrameCodec};
pub use messages::{Frame, Message, Proto, RuleSpec, MAX_PAYLOAD, PROTOCOL_VERSION};
