use std::fmt;

/// A value that was either successfully recognized as a known variant `T`,
/// or is an unrecognized raw value `Raw`.
///
/// Host scene graphs identify node, light and camera types by strings. Types
/// the exporter knows become `Known`; anything else keeps its raw identifier
/// so error messages and warnings can name it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Recognized<T, Raw = String> {
    Known(T),
    Unknown(Raw),
}

impl<T: Copy, Raw: Copy> Copy for Recognized<T, Raw> {}

impl<T, Raw> Recognized<T, Raw> {
    pub fn known(&self) -> Option<&T> {
        match self {
            Recognized::Known(t) => Some(t),
            Recognized::Unknown(_) => None,
        }
    }

    pub fn into_known(self) -> Option<T> {
        match self {
            Recognized::Known(t) => Some(t),
            Recognized::Unknown(_) => None,
        }
    }

    pub fn unknown(&self) -> Option<&Raw> {
        match self {
            Recognized::Known(_) => None,
            Recognized::Unknown(raw) => Some(raw),
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Recognized::Known(_))
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Recognized::Unknown(_))
    }

    pub fn unwrap_or(self, default: T) -> T {
        match self {
            Recognized::Known(t) => t,
            Recognized::Unknown(_) => default,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Recognized<U, Raw> {
        match self {
            Recognized::Known(t) => Recognized::Known(f(t)),
            Recognized::Unknown(raw) => Recognized::Unknown(raw),
        }
    }

    pub fn as_ref(&self) -> Recognized<&T, &Raw> {
        match self {
            Recognized::Known(t) => Recognized::Known(t),
            Recognized::Unknown(raw) => Recognized::Unknown(raw),
        }
    }
}

/// Types that can be looked up from a host identifier string.
pub trait FromIdentifier: Sized {
    fn from_identifier(id: &str) -> Option<Self>;
}

impl<T: FromIdentifier> Recognized<T, String> {
    /// Classify a host identifier, keeping the raw string when it is unknown.
    pub fn from_identifier(id: &str) -> Self {
        match T::from_identifier(id) {
            Some(known) => Recognized::Known(known),
            None => Recognized::Unknown(id.to_string()),
        }
    }
}

impl<T: PartialEq, Raw> Recognized<T, Raw> {
    pub fn is(&self, kind: &T) -> bool {
        self.known() == Some(kind)
    }
}

impl<T, Raw> From<T> for Recognized<T, Raw> {
    fn from(value: T) -> Self {
        Recognized::Known(value)
    }
}

impl<T: fmt::Display, Raw: fmt::Display> fmt::Display for Recognized<T, Raw> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recognized::Known(t) => t.fmt(f),
            Recognized::Unknown(raw) => raw.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Shape {
        Point,
        Spot,
    }

    impl FromIdentifier for Shape {
        fn from_identifier(id: &str) -> Option<Self> {
            match id {
                "POINT" => Some(Shape::Point),
                "SPOT" => Some(Shape::Spot),
                _ => None,
            }
        }
    }

    #[test]
    fn unknown_identifiers_are_preserved() {
        let spot = Recognized::<Shape>::from_identifier("SPOT");
        assert!(spot.is(&Shape::Spot));
        assert!(!spot.is(&Shape::Point));

        let area = Recognized::<Shape>::from_identifier("AREA");
        assert!(area.is_unknown());
        assert_eq!(area.unknown().map(String::as_str), Some("AREA"));
        assert_eq!(area.unwrap_or(Shape::Point), Shape::Point);
    }
}
