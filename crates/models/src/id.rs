use rand::{rngs::SmallRng, Rng, SeedableRng};

// Crockford base32 alphabet, which excludes I, L, O and U.
const ENCODING: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

// Randomness occupies the low 80 bits of an Id; the millisecond
// timestamp occupies the 48 bits above it.
const RANDOM_BITS: u32 = 80;
const RANDOM_MASK: u128 = (1 << RANDOM_BITS) - 1;

/// Id is a ULID: a 48-bit millisecond timestamp followed by 80 bits of
/// randomness, rendered as 26 characters of Crockford base32. Ids sort
/// lexicographically in creation order, which the outbox relies on for
/// oldest-first dispatch.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u128);

impl Id {
    /// Constructs an `Id` from the given parts, or panics if a part is out of range.
    pub fn from_parts(timestamp_millis: u64, random: u128) -> Self {
        assert!(timestamp_millis < (1 << 48), "timestamp out of range");
        assert!(random <= RANDOM_MASK, "randomness out of range");
        Self(((timestamp_millis as u128) << RANDOM_BITS) | random)
    }

    /// Returns a tuple of (timestamp millis, randomness).
    pub fn into_parts(self) -> (u64, u128) {
        ((self.0 >> RANDOM_BITS) as u64, self.0 & RANDOM_MASK)
    }

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Generate a fresh `Id` from the process-wide generator.
    pub fn generate() -> Self {
        static GENERATOR: std::sync::LazyLock<std::sync::Mutex<IdGenerator>> =
            std::sync::LazyLock::new(|| std::sync::Mutex::new(IdGenerator::new()));

        GENERATOR.lock().unwrap().next()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseIdError {
    #[error("id must be 26 characters, not {0}")]
    InvalidLength(usize),
    #[error("invalid id character '{0}'")]
    InvalidChar(char),
    #[error("id timestamp overflows 128 bits")]
    Overflow,
}

impl std::str::FromStr for Id {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 26 {
            return Err(ParseIdError::InvalidLength(s.len()));
        }
        let mut v: u128 = 0;
        for (i, c) in s.chars().enumerate() {
            let d = decode_char(c).ok_or(ParseIdError::InvalidChar(c))?;
            // 26 base32 characters hold 130 bits; the two high bits must be zero.
            if i == 0 && d > 7 {
                return Err(ParseIdError::Overflow);
            }
            v = (v << 5) | d as u128;
        }
        Ok(Self(v))
    }
}

fn decode_char(c: char) -> Option<u8> {
    let c = c.to_ascii_uppercase();
    ENCODING.iter().position(|&e| e as char == c).map(|p| p as u8)
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = [0u8; 26];
        for (i, slot) in out.iter_mut().enumerate() {
            let shift = 5 * (25 - i);
            *slot = ENCODING[((self.0 >> shift) & 0x1f) as usize];
        }
        // The alphabet is pure ASCII.
        f.write_str(std::str::from_utf8(&out).unwrap())
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl serde::Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        format!("{self}").serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let str_val = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
        str_val
            .parse()
            .map_err(|err| D::Error::custom(format!("invalid id: {err}")))
    }
}

/// Generates Ids which are monotonic within this process: when two Ids are
/// drawn inside the same millisecond, the randomness of the second is the
/// increment of the first.
pub struct IdGenerator {
    rng: SmallRng,
    last_millis: u64,
    last_random: u128,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            rng: SmallRng::from_entropy(),
            last_millis: 0,
            last_random: 0,
        }
    }

    /// Generate and return the next unique id.
    pub fn next(&mut self) -> Id {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;

        if millis > self.last_millis {
            self.last_millis = millis;
            self.last_random = self.rng.gen::<u128>() & RANDOM_MASK;
        } else if self.last_random < RANDOM_MASK {
            self.last_random += 1;
        } else {
            // Randomness exhausted within this millisecond. Wildly unlikely,
            // but handling it keeps generation monotonic under test clocks.
            self.last_millis += 1;
            self.last_random = 0;
        }
        Id::from_parts(self.last_millis, self.last_random)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
