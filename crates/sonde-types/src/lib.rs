use facet::Facet;
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    ZeroId(&'static str),
    IdOutOfRange {
        field: &'static str,
        max: u64,
        got: u64,
    },
    EmptyRange {
        start: u64,
        end: u64,
    },
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroId(field) => write!(f, "{field} must be non-zero"),
            Self::IdOutOfRange { field, max, got } => {
                write!(f, "{field} must be <= {max}, got {got}")
            }
            Self::EmptyRange { start, end } => {
                write!(f, "address range 0x{start:x}..0x{end:x} is inverted")
            }
        }
    }
}

impl Error for InvariantError {}

/// Largest actor id the application runtime may hand out.
pub const MAX_ACTOR_ID: u64 = (1u64 << 48) - 1;

macro_rules! define_u64_id {
    (
        $(#[$meta:meta])*
        $name:ident,
        field = $field:literal
        , max = $max:expr
    ) => {
        #[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[facet(transparent)]
        $(#[$meta])*
        pub struct $name(u64);

        impl $name {
            pub fn new(value: u64) -> Result<Self, InvariantError> {
                if value == 0 {
                    return Err(InvariantError::ZeroId($field));
                }
                if value > $max {
                    return Err(InvariantError::IdOutOfRange {
                        field: $field,
                        max: $max,
                        got: value,
                    });
                }
                Ok(Self(value))
            }

            pub fn get(self) -> u64 {
                self.0
            }

            /// Successor id, used by monotonic counters.
            pub fn next(self) -> Result<Self, InvariantError> {
                Self::new(self.0.saturating_add(1))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_u64_id!(
    /// Process-wide identifier of one actor of the application. Actor 0 is the
    /// runtime's own scheduler and never appears here.
    ActorId,
    field = "actor_id",
    max = MAX_ACTOR_ID
);
define_u64_id!(
    /// Number of an exploration state (or liveness pair), starting at 1.
    StateNum,
    field = "state_num",
    max = u64::MAX
);

/// Exit status of a model-checking run. The numeric codes are part of the CLI contract.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExitStatus {
    Success,
    Safety,
    Deadlock,
    NonDeterminism,
    ProgramCrash,
    DataRace,
    Error,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Safety => 1,
            Self::Deadlock => 2,
            Self::NonDeterminism => 3,
            Self::ProgramCrash => 4,
            Self::DataRace => 5,
            Self::Error => 63,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        [
            Self::Success,
            Self::Safety,
            Self::Deadlock,
            Self::NonDeterminism,
            Self::ProgramCrash,
            Self::DataRace,
            Self::Error,
        ]
        .into_iter()
        .find(|status| status.code() == code)
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "SUCCESS",
            Self::Safety => "SAFETY",
            Self::Deadlock => "DEADLOCK",
            Self::NonDeterminism => "NON_DETERMINISM",
            Self::ProgramCrash => "PROGRAM_CRASH",
            Self::DataRace => "DATA_RACE",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Half-open range of addresses in the application's address space.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
}

impl AddressRange {
    pub fn new(start: u64, end: u64) -> Result<Self, InvariantError> {
        if end < start {
            return Err(InvariantError::EmptyRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn with_size(start: u64, size: u64) -> Self {
        Self {
            start,
            end: start.saturating_add(size),
        }
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }

    pub fn contains_range(&self, other: &AddressRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}-0x{:x}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_id_rejects_zero() {
        let err = ActorId::new(0).expect_err("zero id must fail");
        assert!(matches!(err, InvariantError::ZeroId("actor_id")));
    }

    #[test]
    fn actor_id_rejects_values_above_max() {
        let err = ActorId::new(MAX_ACTOR_ID + 1).expect_err("id must fit");
        assert!(matches!(
            err,
            InvariantError::IdOutOfRange {
                field: "actor_id",
                max: MAX_ACTOR_ID,
                got
            } if got == MAX_ACTOR_ID + 1
        ));
    }

    #[test]
    fn state_num_next_is_monotonic() {
        let first = StateNum::new(1).expect("one is valid");
        let second = first.next().expect("successor");
        assert!(second > first);
        assert_eq!(second.get(), 2);
    }

    #[test]
    fn exit_codes_match_cli_contract() {
        assert_eq!(ExitStatus::Success.code(), 0);
        assert_eq!(ExitStatus::Safety.code(), 1);
        assert_eq!(ExitStatus::Deadlock.code(), 2);
        assert_eq!(ExitStatus::NonDeterminism.code(), 3);
        assert_eq!(ExitStatus::ProgramCrash.code(), 4);
        assert_eq!(ExitStatus::DataRace.code(), 5);
        assert_eq!(ExitStatus::Error.code(), 63);
        assert_eq!(ExitStatus::from_code(2), Some(ExitStatus::Deadlock));
        assert_eq!(ExitStatus::from_code(7), None);
    }

    #[test]
    fn address_range_rejects_inverted_bounds() {
        assert!(AddressRange::new(10, 5).is_err());
        let range = AddressRange::new(0x1000, 0x2000).expect("valid range");
        assert!(range.contains(0x1000));
        assert!(!range.contains(0x2000));
        assert_eq!(range.size(), 0x1000);
    }

    #[test]
    fn address_range_overlap_is_half_open() {
        let a = AddressRange::with_size(0x1000, 0x100);
        let b = AddressRange::with_size(0x1100, 0x100);
        let c = AddressRange::with_size(0x10ff, 0x2);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
        assert!(a.contains_range(&AddressRange::with_size(0x1010, 0x10)));
    }
}
