//! Macros for defining typed monotonic counters.

/// Macro to define a typed, monotonically increasing counter.
///
/// This generates a newtype wrapper around `u64` with:
/// - A `ZERO` constant and `new()` / `get()` accessors
/// - `next()` returning the successor (saturating)
/// - `Display` and `FromStr` implementations (plain decimal)
/// - Transparent `Serialize` and `Deserialize` implementations
/// - `Ord`, `Hash`, and other standard traits
///
/// # Example
///
/// ```ignore
/// define_counter!(Generation, "generation");
///
/// let g = Generation::ZERO.next();
/// assert_eq!(g.get(), 1);
/// ```
#[macro_export]
macro_rules! define_counter {
    ($name:ident, $label:literal) => {
        #[doc = concat!("A typed ", $label, " counter.")]
        #[derive(
            Debug,
            Clone,
            Copy,
            Default,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// The counter before any change has been recorded.
            pub const ZERO: Self = Self(0);

            /// Wraps a raw value.
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw value.
            #[must_use]
            pub const fn get(&self) -> u64 {
                self.0
            }

            /// Returns the next value, saturating at `u64::MAX`.
            #[must_use]
            pub const fn next(&self) -> Self {
                Self(self.0.saturating_add(1))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<u64>().map(Self)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}
