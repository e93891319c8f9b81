//! typed lookups of environment variables
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
use std::{env, fmt::Display, str::FromStr};

use thiserror::Error;

/// Failure reading an environment variable
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvError {
    /// the variable is set but is not unicode
    #[error("env var {name} is not valid unicode")]
    NotUnicode {
        /// variable name
        name: String,
    },
    /// the variable is set but does not parse
    #[error("error parsing env var {name}={value}: {reason}")]
    Invalid {
        /// variable name
        name: String,
        /// raw value
        value: String,
        /// parser message
        reason: String,
    },
}

/// Parse the variable `name`, `None` if it is unset.
pub fn var_opt<T>(name: &str) -> Result<Option<T>, EnvError>
where
    T: FromStr,
    T::Err: Display,
{
    let value = match env::var(name) {
        Ok(value) => value,
        Err(env::VarError::NotPresent) => return Ok(None),
        Err(env::VarError::NotUnicode(_)) => {
            return Err(EnvError::NotUnicode {
                name: name.to_owned(),
            });
        }
    };
    value
        .parse::<T>()
        .map(Some)
        .map_err(|err| EnvError::Invalid {
            name: name.to_owned(),
            value,
            reason: err.to_string(),
        })
}

/// Parse the variable `name`, `default` if it is unset. A set but invalid
/// value is an error, never silently replaced by the default.
pub fn var_or<T>(name: &str, default: T) -> Result<T, EnvError>
where
    T: FromStr,
    T::Err: Display,
{
    Ok(var_opt(name)?.unwrap_or(default))
}

/// Whether the variable `name` is set
pub fn is_set(name: &str) -> bool {
    env::var_os(name).is_some()
}
