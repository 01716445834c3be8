use crate::framing::missing_count;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A frame did not start with the CADU magic word.
    #[error("cadu: invalid magic")]
    BadMagic,

    /// The CADU trailer CRC did not match the computed value. The frame
    /// body is still surfaced to the caller.
    #[error("invalid crc: want {want:#06x}, got {got:#06x}")]
    Crc { want: u16, got: u16 },

    /// A discontinuity in the 24-bit CADU sequence counter. `from` is the
    /// last counter seen before the gap, `to` the first one after it.
    #[error("{} missing cadus ({from} - {to})", missing_count(*from, *to))]
    Gap { from: u32, to: u32 },

    /// The declared HRDL length does not match the reassembled buffer.
    #[error("invalid length: want {want}, got {got}")]
    Length { want: usize, got: usize },

    /// The HRDL trailer checksum did not match the sum over the body.
    #[error("invalid checksum: want {want:#010x}, got {got:#010x}")]
    Checksum { want: u32, got: u32 },

    #[error("unexpected end of stream")]
    Eof,

    #[error("invalid address: {0}")]
    Addr(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for frame-level conditions the pipeline recovers from:
    /// bad magic, CRC mismatch, sequence gap.
    #[must_use]
    pub fn is_frame_error(&self) -> bool {
        matches!(self, Error::BadMagic | Error::Crc { .. } | Error::Gap { .. })
    }

    /// True for packet-level conditions: length or checksum mismatch.
    #[must_use]
    pub fn is_packet_error(&self) -> bool {
        matches!(self, Error::Length { .. } | Error::Checksum { .. })
    }

    #[must_use]
    pub fn is_eof(&self) -> bool {
        match self {
            Error::Eof => true,
            Error::Io(err) => err.kind() == std::io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }

    /// Number of frames lost to a sequence gap, `None` for other kinds.
    #[must_use]
    pub fn missing(&self) -> Option<u32> {
        match self {
            Error::Gap { from, to } => Some(missing_count(*from, *to)),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gap_reports_missing_count() {
        let err = Error::Gap { from: 101, to: 103 };
        assert_eq!(err.missing(), Some(1));
        assert_eq!(err.to_string(), "1 missing cadus (101 - 103)");
        assert!(err.is_frame_error());
        assert!(!err.is_packet_error());
    }

    #[test]
    fn gap_missing_count_wraps() {
        let err = Error::Gap {
            from: 0xff_fffe,
            to: 2,
        };
        assert_eq!(err.missing(), Some(3));
    }

    #[test]
    fn eof_detection_covers_io() {
        let err = Error::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        assert!(err.is_eof());
        assert!(Error::Eof.is_eof());
        assert!(!Error::BadMagic.is_eof());
    }
}
