//! Repeated capabilities: the numeric suffixes that select a channel,
//! trace, window and so on in commands like `CALC2:DATA:TRAC3?`.
//!
//! A [`RepCaps`] value is immutable. Every `with_*` call returns a new
//! value, so the defaults used by one command never leak into another.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepCaps {
    indices: BTreeMap<String, u32>,
}
impl Default for RepCaps {
    /// Channel, trace and window all default to 1
    fn default() -> Self {
        Self::empty()
            .with("Channel", 1)
            .with("Trace", 1)
            .with("Window", 1)
    }
}
impl RepCaps {
    /// No indices at all
    pub fn empty() -> Self {
        Self {
            indices: BTreeMap::new(),
        }
    }

    /// New value with `name` set to `index`
    pub fn with(&self, name: &str, index: u32) -> Self {
        let mut indices = self.indices.clone();
        indices.insert(name.to_string(), index);
        Self { indices }
    }

    pub fn with_channel(&self, index: u32) -> Self {
        self.with("Channel", index)
    }

    pub fn with_trace(&self, index: u32) -> Self {
        self.with("Trace", index)
    }

    pub fn with_window(&self, index: u32) -> Self {
        self.with("Window", index)
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.indices.get(name).copied()
    }

    /// Substitute every `<Name>` placeholder in `template`, e.g.
    /// `CALC<Channel>:DATA:TRAC<Trace>?`. A placeholder without a value
    /// is an error rather than a silent default.
    pub fn apply(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find('<') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let Some(end) = after.find('>') else {
                return Err(Error::InvalidArgument(format!(
                    "Unterminated placeholder in `{template}`"
                )));
            };

            let name = &after[..end];
            let Some(index) = self.get(name) else {
                return Err(Error::InvalidArgument(format!(
                    "No value for <{name}> in `{template}`"
                )));
            };
            out.push_str(&index.to_string());
            rest = &after[end + 1..];
        }
        out.push_str(rest);

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_placeholders() {
        let caps = RepCaps::default().with_channel(2).with_trace(3);
        assert_eq!(
            caps.apply("CALC<Channel>:DATA:TRAC<Trace>? FDAT").unwrap(),
            "CALC2:DATA:TRAC3? FDAT"
        );
        assert_eq!(caps.apply("*IDN?").unwrap(), "*IDN?");
    }

    #[test]
    fn builder_does_not_mutate_original() {
        let base = RepCaps::default();
        let derived = base.with_window(4).with("Marker", 2);

        assert_eq!(base.get("Window"), Some(1));
        assert_eq!(base.get("Marker"), None);
        assert_eq!(derived.get("Window"), Some(4));
        assert_eq!(
            derived.apply("CALC<Window>:MARK<Marker>:X?").unwrap(),
            "CALC4:MARK2:X?"
        );
    }

    #[test]
    fn missing_or_broken_placeholders_fail() {
        let caps = RepCaps::empty();
        assert!(matches!(
            caps.apply("SENS<Channel>:FREQ?"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            RepCaps::default().apply("SENS<Channel:FREQ?"),
            Err(Error::InvalidArgument(_))
        ));
    }
}
