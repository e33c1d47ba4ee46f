//! Macros for reducing status-enum boilerplate.

use thiserror::Error;

/// Returned when a stored or submitted string is not a known enum value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Declare a string-backed status enum.
///
/// The wire spelling is given once per variant and drives serde, `Display`,
/// `as_str()` and `FromStr`, so storage and JSON can never disagree.
///
/// # Example
///
/// ```ignore
/// status_enum! {
///     /// Processing state of a feed item.
///     pub enum FeedItemStatus {
///         Pending => "pending",
///         Processing => "processing",
///         Processed => "processed",
///     }
/// }
///
/// assert_eq!(FeedItemStatus::Pending.as_str(), "pending");
/// assert_eq!("processed".parse::<FeedItemStatus>()?, FeedItemStatus::Processed);
/// ```
macro_rules! status_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        $vis enum $name {
            $($(#[$vmeta])* #[serde(rename = $text)] $variant),+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::macros::UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err($crate::macros::UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    status_enum! {
        enum Light {
            Red => "red",
            AmberFlashing => "amber_flashing",
        }
    }

    #[test]
    fn test_wire_spelling_is_shared() {
        assert_eq!(Light::AmberFlashing.as_str(), "amber_flashing");
        assert_eq!(Light::AmberFlashing.to_string(), "amber_flashing");
        assert_eq!(
            serde_json::to_string(&Light::AmberFlashing).unwrap(),
            "\"amber_flashing\""
        );
        assert_eq!("red".parse::<Light>().unwrap(), Light::Red);
        assert_eq!(Light::ALL.len(), 2);
    }

    #[test]
    fn test_unknown_value_is_reported() {
        let err = "blue".parse::<Light>().unwrap_err();
        assert_eq!(err.kind, "Light");
        assert_eq!(err.value, "blue");
    }
}
