//! The innermost UDP payload: a fixed 16-byte `{ sequence, send_ts_ns }` record.

use crate::error::FormatError;

pub const PROBE_WIRE_LEN: usize = 16;

/// The wire payload carried back to the prober inside the final UDP datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Probe {
    pub sequence: u64,
    pub send_ts_ns: i64,
}

impl Probe {
    pub fn marshal(&self) -> [u8; PROBE_WIRE_LEN] {
        let mut buf = [0u8; PROBE_WIRE_LEN];
        buf[0..8].copy_from_slice(&self.sequence.to_be_bytes());
        buf[8..16].copy_from_slice(&self.send_ts_ns.to_be_bytes());
        buf
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < PROBE_WIRE_LEN {
            return Err(FormatError::Truncated {
                got: bytes.len(),
                need: PROBE_WIRE_LEN,
            });
        }

        let sequence = u64::from_be_bytes(bytes[0..8].try_into().expect("checked length above"));
        let send_ts_ns =
            i64::from_be_bytes(bytes[8..16].try_into().expect("checked length above"));

        Ok(Self {
            sequence,
            send_ts_ns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_the_wire_format() {
        let probe = Probe {
            sequence: 1,
            send_ts_ns: 123456789,
        };

        let bytes = probe.marshal();

        assert_eq!(bytes.len(), PROBE_WIRE_LEN);
        assert_eq!(Probe::unmarshal(&bytes).unwrap(), probe);
    }

    #[test]
    fn marshal_is_big_endian() {
        let probe = Probe {
            sequence: 1,
            send_ts_ns: 123456789,
        };

        assert_eq!(
            probe.marshal(),
            [0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0x07, 0x5b, 0xcd, 0x15]
        );
    }

    #[test]
    fn unmarshal_rejects_truncated_input() {
        let err = Probe::unmarshal(&[0u8; 15]).unwrap_err();

        assert_eq!(
            err,
            FormatError::Truncated {
                got: 15,
                need: PROBE_WIRE_LEN
            }
        );
    }

    #[test]
    fn sequence_wrap_does_not_panic() {
        let probe = Probe {
            sequence: u64::MAX,
            send_ts_ns: i64::MAX,
        };

        assert_eq!(Probe::unmarshal(&probe.marshal()).unwrap(), probe);
    }
}
