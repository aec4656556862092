//! Media flow direction lattice.

const SEND: u8 = 0b01;
const RECV: u8 = 0b10;

/// The direction in which a session processes media.
///
/// Directions form a small lattice: `SendRecv` is the union of `SendOnly`
/// and `RecvOnly`, and `Inactive` is the empty set. [`MediaSession::start`]
/// unions a direction into the started state and [`MediaSession::stop`]
/// subtracts it, so starting `SendRecv` and stopping `SendOnly` leaves
/// `RecvOnly`.
///
/// # Example
///
/// ```
/// use conf_media::MediaDirection;
///
/// let d = MediaDirection::SendOnly.or(MediaDirection::RecvOnly);
/// assert_eq!(d, MediaDirection::SendRecv);
/// assert_eq!(d.subtract(MediaDirection::SendOnly), MediaDirection::RecvOnly);
/// ```
///
/// [`MediaSession::start`]: crate::MediaSession::start
/// [`MediaSession::stop`]: crate::MediaSession::stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MediaDirection {
    /// Neither sending nor receiving.
    #[default]
    Inactive,

    /// Capturing and sending only.
    SendOnly,

    /// Receiving and rendering only.
    RecvOnly,

    /// Both sending and receiving.
    SendRecv,
}

impl MediaDirection {
    fn bits(self) -> u8 {
        match self {
            Self::Inactive => 0,
            Self::SendOnly => SEND,
            Self::RecvOnly => RECV,
            Self::SendRecv => SEND | RECV,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::Inactive,
            SEND => Self::SendOnly,
            RECV => Self::RecvOnly,
            _ => Self::SendRecv,
        }
    }

    /// Returns the union of `self` and `other`.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self::from_bits(self.bits() | other.bits())
    }

    /// Returns the intersection of `self` and `other`.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self::from_bits(self.bits() & other.bits())
    }

    /// Returns `self` with the capabilities of `other` removed.
    #[must_use]
    pub fn subtract(self, other: Self) -> Self {
        Self::from_bits(self.bits() & !other.bits())
    }

    /// Returns `true` if this direction includes sending.
    pub fn allows_sending(self) -> bool {
        self.bits() & SEND != 0
    }

    /// Returns `true` if this direction includes receiving.
    pub fn allows_receiving(self) -> bool {
        self.bits() & RECV != 0
    }
}

impl std::fmt::Display for MediaDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Inactive => "inactive",
            Self::SendOnly => "sendonly",
            Self::RecvOnly => "recvonly",
            Self::SendRecv => "sendrecv",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_or_is_union() {
        assert_eq!(
            MediaDirection::SendOnly.or(MediaDirection::RecvOnly),
            MediaDirection::SendRecv
        );
        assert_eq!(
            MediaDirection::Inactive.or(MediaDirection::SendOnly),
            MediaDirection::SendOnly
        );
        assert_eq!(
            MediaDirection::SendRecv.or(MediaDirection::SendOnly),
            MediaDirection::SendRecv
        );
    }

    #[test]
    fn test_subtract_is_exact_inverse() {
        // start(SENDRECV) then stop(SENDONLY) yields RECVONLY
        assert_eq!(
            MediaDirection::SendRecv.subtract(MediaDirection::SendOnly),
            MediaDirection::RecvOnly
        );
        assert_eq!(
            MediaDirection::SendRecv.subtract(MediaDirection::RecvOnly),
            MediaDirection::SendOnly
        );
        assert_eq!(
            MediaDirection::SendRecv.subtract(MediaDirection::SendRecv),
            MediaDirection::Inactive
        );
        assert_eq!(
            MediaDirection::SendOnly.subtract(MediaDirection::RecvOnly),
            MediaDirection::SendOnly
        );
    }

    #[test]
    fn test_and_is_intersection() {
        assert_eq!(
            MediaDirection::SendRecv.and(MediaDirection::SendOnly),
            MediaDirection::SendOnly
        );
        assert_eq!(
            MediaDirection::SendOnly.and(MediaDirection::RecvOnly),
            MediaDirection::Inactive
        );
    }

    #[test]
    fn test_allows() {
        assert!(MediaDirection::SendRecv.allows_sending());
        assert!(MediaDirection::SendRecv.allows_receiving());
        assert!(MediaDirection::SendOnly.allows_sending());
        assert!(!MediaDirection::SendOnly.allows_receiving());
        assert!(!MediaDirection::Inactive.allows_sending());
        assert!(!MediaDirection::Inactive.allows_receiving());
    }

    #[test]
    fn test_display() {
        assert_eq!(MediaDirection::SendRecv.to_string(), "sendrecv");
        assert_eq!(MediaDirection::Inactive.to_string(), "inactive");
    }
}
