use crate::error::{Error, Result};

/// Instrument identity, as reported by `*IDN?`
#[derive(Clone, Debug)]
pub struct ModelInfo {
    /// Recognised manufacturer
    pub man_family: Manufacturer,
    /// Manufacturer string
    pub manufacturer: String,
    /// Model string
    pub model: String,
    /// Serial number
    pub serial: Option<String>,
    /// Firmware version
    pub firmware: Option<String>,
}
impl ModelInfo {
    pub fn from_idn(idn: &str) -> Result<Self> {
        let idn_sep: Vec<_> = idn.trim().split(',').map(|s| s.trim()).collect();
        if idn_sep.len() < 2 || idn_sep[0].is_empty() {
            return Err(Error::Decode(format!("Invalid *IDN? response: {idn}")));
        }

        Ok(Self {
            man_family: Manufacturer::from_idn(idn_sep[0]),
            manufacturer: idn_sep[0].to_string(),
            model: idn_sep[1].to_string(),
            serial: idn_sep
                .get(2)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string()),
            firmware: idn_sep
                .get(3)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string()),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Manufacturer {
    Unknown,
    /// Rohde & Schwarz
    RohdeSchwarz,
    /// Hameg, part of Rohde & Schwarz
    Hameg,
    /// Keysight, also includes Agilent and HP
    Keysight,
    Rigol,
    Siglent,
    Tektronix,
}
impl Manufacturer {
    fn from_idn(man: &str) -> Self {
        let man = man.to_lowercase();

        if man.contains("rohde") || man.starts_with("r&s") {
            Self::RohdeSchwarz
        } else if man.contains("hameg") {
            Self::Hameg
        } else if man.contains("keysight") || man.contains("agilent") || man.contains("hewlett") {
            Self::Keysight
        } else if man.contains("rigol") {
            Self::Rigol
        } else if man.contains("siglent") {
            Self::Siglent
        } else if man.contains("tektronix") {
            Self::Tektronix
        } else {
            Self::Unknown
        }
    }
}
