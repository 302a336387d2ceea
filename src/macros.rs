//! Contains macros that are used throughout this crate


/// Declares a section of named statistics counters
///
/// Every field becomes a public [`Counter`]. The generated struct implements
/// [`Stats`], so a reporting layer can list the counters by name without
/// knowing the concrete section type.
///
/// # Example
///
/// ``` rust
/// use uwb_core::{stats::Stats, stats_section};
///
/// stats_section! {
///     /// Counters of a toy protocol
///     pub struct ToyStats: "toy" {
///         sent,
///         received,
///     }
/// }
///
/// let mut stats = ToyStats::default();
/// stats.sent.inc();
/// stats.sent.inc();
///
/// assert_eq!(stats.get("sent"), Some(2));
/// assert_eq!(stats.get("nope"), None);
/// assert_eq!(stats.section(), "toy");
/// ```
///
/// [`Counter`]: stats/struct.Counter.html
/// [`Stats`]: stats/trait.Stats.html
#[macro_export]
macro_rules! stats_section {
    (
        $(#[$attr:meta])*
        pub struct $name:ident: $section:literal {
            $(
                $(#[$field_attr:meta])*
                $field:ident,
            )*
        }
    ) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
        pub struct $name {
            $(
                $(#[$field_attr])*
                pub $field: $crate::stats::Counter,
            )*
        }

        impl $name {
            /// Names of all counters, in declaration order
            pub const NAMES: &'static [&'static str] = &[$(stringify!($field)),*];

            /// Returns the counter with the given name
            pub fn get(&self, name: &str) -> Option<u32> {
                match name {
                    $(stringify!($field) => Some(self.$field.get()),)*
                    _ => None,
                }
            }

            /// Sets every counter back to zero
            pub fn clear(&mut self) {
                *self = Self::default();
            }
        }

        impl $crate::stats::Stats for $name {
            fn section(&self) -> &'static str {
                $section
            }

            fn counters(&self) -> Vec<(&'static str, u32)> {
                let values: Vec<u32> = vec![$(self.$field.get()),*];
                Self::NAMES.iter().copied().zip(values).collect()
            }
        }
    };
}
