use crate::prelude::*;
use crate::lxp::packet::{FRAME_PREFIX, HEADER_LEN};

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

// a full 127-register reply is under 300 bytes
const MAX_FRAME_LEN: usize = 1024;

/// Splits the dongle's byte stream into whole frames. Validation is left to
/// `Parser`; this only finds frame boundaries and skips line noise.
pub struct PacketDecoder {
    byte_order: ByteOrder,
}

impl PacketDecoder {
    pub fn new(byte_order: ByteOrder) -> Self {
        Self { byte_order }
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new(ByteOrder::default())
    }
}

impl Decoder for PacketDecoder {
    type Item = Vec<u8>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match src.windows(2).position(|w| w == FRAME_PREFIX) {
                Some(0) => {}
                Some(skip) => {
                    debug!("discarding {} bytes before frame prefix", skip);
                    src.advance(skip);
                }
                None => {
                    // a trailing first prefix byte may be completed by the next read
                    let keep = usize::from(src.last() == Some(&FRAME_PREFIX[0]));
                    let skip = src.len() - keep;
                    if skip > 0 {
                        debug!("discarding {} bytes without frame prefix", skip);
                        src.advance(skip);
                    }
                    return Ok(None);
                }
            }

            if src.len() < 6 {
                return Ok(None);
            }

            let frame_len = self.byte_order.read(&src[..], 4) as usize + 6;
            if !(HEADER_LEN + 1..=MAX_FRAME_LEN).contains(&frame_len) {
                warn!("ignoring frame with implausible length {}", frame_len);
                src.advance(FRAME_PREFIX.len());
                continue;
            }

            if src.len() < frame_len {
                src.reserve(frame_len - src.len());
                return Ok(None);
            }

            return Ok(Some(src.split_to(frame_len).to_vec()));
        }
    }
}
