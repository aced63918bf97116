#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Authorization rules and naming shared by the vkcc operator and sidecars.

pub mod aws;
pub mod backoff;
pub mod gcp;
mod key;
pub mod pattern;
mod rules;

pub use self::{
    key::{IdentityRef, InvalidPrefix, KeyCodec},
    pattern::PatternError,
    rules::{Rule, Rules},
};

/// An annotation's payload could not be parsed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid ARN {arn:?}: {reason}")]
    Arn { arn: String, reason: &'static str },

    #[error("invalid bindings: {0}")]
    Bindings(String),
}

/// A resource could not be evaluated against a set of rules.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Pattern(#[from] PatternError),
}
