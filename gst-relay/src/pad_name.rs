//! Positional parser for the engine's dynamic pad names.
//!
//! rtpbin names its per-source pads `recv_rtp_src_<session>_<ssrc>_<pt>`.
//! Field positions are a contract with the engine, so the layout is versioned
//! and checked token by token: an engine upgrade that changes the scheme
//! fails here instead of being misread.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamName {
    pub session: u32,
    pub ssrc: u32,
    pub payload_type: u8,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PadNameError {
    #[error("pad {name:?}: expected {expected} tokens for layout v{version}, got {actual}")]
    TokenCount {
        name: String,
        version: u32,
        expected: usize,
        actual: usize,
    },
    #[error("pad {name:?}: prefix {actual:?} does not match {expected:?}")]
    Prefix {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("pad {name:?}: field {field} is not a number: {token:?}")]
    Field {
        name: String,
        field: &'static str,
        token: String,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PadNameVersion {
    #[default]
    V1,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PadNameLayout {
    pub version: u32,
    pub separator: char,
    pub tokens: usize,
    /// Tokens before the first field, matched literally.
    pub prefix: Vec<String>,
    pub session: usize,
    pub ssrc: usize,
    pub payload_type: usize,
}

impl PadNameLayout {
    pub fn v1() -> Self {
        Self {
            version: 1,
            separator: '_',
            tokens: 6,
            prefix: vec!["recv".into(), "rtp".into(), "src".into()],
            session: 3,
            ssrc: 4,
            payload_type: 5,
        }
    }

    pub fn for_version(version: PadNameVersion) -> Self {
        match version {
            PadNameVersion::V1 => Self::v1(),
        }
    }

    pub fn prefix_str(&self) -> String {
        self.prefix.join(&self.separator.to_string())
    }

    /// Renders a pad name; the inverse of [`parse`](Self::parse).
    pub fn format(&self, stream: &StreamName) -> String {
        let mut tokens = vec![String::new(); self.tokens];
        for (i, p) in self.prefix.iter().enumerate() {
            tokens[i] = p.clone();
        }
        tokens[self.session] = stream.session.to_string();
        tokens[self.ssrc] = stream.ssrc.to_string();
        tokens[self.payload_type] = stream.payload_type.to_string();
        tokens.join(&self.separator.to_string())
    }

    pub fn parse(&self, name: &str) -> Result<StreamName, PadNameError> {
        let tokens: Vec<&str> = name.split(self.separator).collect();
        if tokens.len() != self.tokens {
            return Err(PadNameError::TokenCount {
                name: name.to_string(),
                version: self.version,
                expected: self.tokens,
                actual: tokens.len(),
            });
        }

        let actual_prefix = &tokens[..self.prefix.len()];
        if actual_prefix
            .iter()
            .zip(self.prefix.iter())
            .any(|(a, e)| a != e)
        {
            return Err(PadNameError::Prefix {
                name: name.to_string(),
                expected: self.prefix_str(),
                actual: actual_prefix.join(&self.separator.to_string()),
            });
        }

        Ok(StreamName {
            session: field(name, "session", tokens[self.session])?,
            ssrc: field(name, "ssrc", tokens[self.ssrc])?,
            payload_type: field(name, "payload_type", tokens[self.payload_type])?,
        })
    }
}

impl Default for PadNameLayout {
    fn default() -> Self {
        Self::v1()
    }
}

fn field<T: std::str::FromStr>(
    name: &str,
    field: &'static str,
    token: &str,
) -> Result<T, PadNameError> {
    token.parse::<T>().map_err(|_| PadNameError::Field {
        name: name.to_string(),
        field,
        token: token.to_string(),
    })
}
