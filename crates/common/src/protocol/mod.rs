// Case stream wire protocol: frame types and the inbound codec.

pub mod codec;
pub mod frames;
