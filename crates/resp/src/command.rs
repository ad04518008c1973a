//! Command decoding
//!
//! Turns parsed frame arguments into typed commands

use crate::{RespError, MIN_HEARTBEAT_SECS};

/// Arguments of a `sub` command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    /// Subscriber key
    pub key: String,
    /// Heartbeat interval requested by the client (seconds)
    pub heartbeat: u64,
    /// Protocol version, empty for legacy clients
    pub version: String,
}

impl Subscribe {
    /// Validate raw `key`/`heartbeat`/`version` values
    ///
    /// Shared by the TCP command form and the websocket query form.
    pub fn new(key: &str, heartbeat: &str, version: &str) -> Result<Self, RespError> {
        if key.is_empty() {
            return Err(RespError::Parameter("empty key".to_string()));
        }
        let heartbeat: u64 = heartbeat.parse().map_err(|_| {
            RespError::Parameter(format!("heartbeat {:?} is not a number", heartbeat))
        })?;
        if heartbeat < MIN_HEARTBEAT_SECS {
            return Err(RespError::Parameter(format!(
                "heartbeat {} less than {}",
                heartbeat, MIN_HEARTBEAT_SECS
            )));
        }
        Ok(Self {
            key: key.to_string(),
            heartbeat,
            version: version.to_string(),
        })
    }
}

/// Client command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// sub key heartbeat [version]
    Subscribe(Subscribe),
    /// Anything we do not serve
    Unknown(String),
}

impl Command {
    /// Build a command from parsed frame arguments
    pub fn from_args(args: &[String]) -> Result<Self, RespError> {
        let (name, rest) = args
            .split_first()
            .ok_or_else(|| RespError::Protocol("empty command".to_string()))?;

        match name.as_str() {
            "sub" => {
                if rest.len() < 2 {
                    return Err(RespError::Parameter(
                        "subscriber missing argument".to_string(),
                    ));
                }
                let version = rest.get(2).map(String::as_str).unwrap_or("");
                Ok(Command::Subscribe(Subscribe::new(&rest[0], &rest[1], version)?))
            }
            other => Ok(Command::Unknown(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_sub_with_version() {
        let cmd = Command::from_args(&args(&["sub", "alice", "30", "1.0"])).unwrap();
        assert_eq!(
            cmd,
            Command::Subscribe(Subscribe {
                key: "alice".to_string(),
                heartbeat: 30,
                version: "1.0".to_string(),
            })
        );
    }

    #[test]
    fn test_sub_legacy_has_empty_version() {
        match Command::from_args(&args(&["sub", "bob", "60"])).unwrap() {
            Command::Subscribe(sub) => assert!(sub.version.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sub_parameter_errors() {
        assert!(Command::from_args(&args(&["sub", "bob"]))
            .unwrap_err()
            .is_parameter());
        assert!(Command::from_args(&args(&["sub", "", "30"]))
            .unwrap_err()
            .is_parameter());
        assert!(Command::from_args(&args(&["sub", "bob", "abc"]))
            .unwrap_err()
            .is_parameter());
        assert!(Command::from_args(&args(&["sub", "bob", "29"]))
            .unwrap_err()
            .is_parameter());
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(
            Command::from_args(&args(&["pub", "x"])).unwrap(),
            Command::Unknown("pub".to_string())
        );
    }
}
