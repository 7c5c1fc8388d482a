// src/port.rs - Validated handle for a physical actuator slot
use crate::error::ServoError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of motor ports on the hub.
pub const NUM_PORTS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Port {
    A,
    B,
    C,
    D,
    E,
    F,
}

impl Port {
    pub const ALL: [Port; NUM_PORTS] = [Port::A, Port::B, Port::C, Port::D, Port::E, Port::F];

    /// Index into per-port tables. Always `< NUM_PORTS`.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn letter(self) -> char {
        (b'A' + self as u8) as char
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl TryFrom<char> for Port {
    type Error = ServoError;

    fn try_from(c: char) -> Result<Self, Self::Error> {
        let upper = c.to_ascii_uppercase();
        Port::ALL
            .into_iter()
            .find(|p| p.letter() == upper)
            .ok_or_else(|| ServoError::InvalidPort(c.to_string()))
    }
}

impl FromStr for Port {
    type Err = ServoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.trim().chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Port::try_from(c),
            _ => Err(ServoError::InvalidPort(s.to_string())),
        }
    }
}

impl TryFrom<String> for Port {
    type Error = ServoError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Port> for String {
    fn from(port: Port) -> Self {
        port.letter().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_parsing() {
        assert_eq!("a".parse::<Port>().unwrap(), Port::A);
        assert_eq!(Port::try_from('F').unwrap(), Port::F);
        assert!(matches!("G".parse::<Port>(), Err(ServoError::InvalidPort(_))));
        assert!(matches!("AB".parse::<Port>(), Err(ServoError::InvalidPort(_))));
    }

    #[test]
    fn test_port_index_is_dense() {
        for (i, port) in Port::ALL.iter().enumerate() {
            assert_eq!(port.index(), i);
        }
    }
}
