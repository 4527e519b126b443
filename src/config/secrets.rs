//! Secret types used by [`super::Config`]; import `ExposeSecret` from here
//! to read a secret at its point of use.

pub use secrecy::{ExposeSecret, SecretString};
