use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Addresses one device of one account; the session lookup key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub uid: String,
    pub device_key: String,
}

impl DeviceAddress {
    pub fn new(uid: impl Into<String>, device_key: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            device_key: device_key.into(),
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.uid, self.device_key)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserStatus {
    Online,
    #[default]
    Offline,
    Away,
    Busy,
}

/// Account record owned by the presence layer. Only the address is used here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub uid: String,
    pub device_key: String,
    pub status: UserStatus,
    pub last_active: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn address(&self) -> DeviceAddress {
        DeviceAddress::new(self.uid.clone(), self.device_key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display() {
        assert_eq!(DeviceAddress::new("alice", "phone").to_string(), "alice.phone");
    }

    #[test]
    fn user_address_ignores_presence() {
        let now = Utc::now();
        let user = User {
            uid: "u1".into(),
            device_key: "d1".into(),
            status: UserStatus::Busy,
            last_active: now,
            created_at: now,
        };
        assert_eq!(user.address(), DeviceAddress::new("u1", "d1"));
    }
}
