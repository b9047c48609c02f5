use sha2::{Digest, Sha256};

use crate::models::DeviceType;

/// Request-side facts about the caller's device.
#[derive(Debug, Clone, Default)]
pub struct DeviceContext {
    pub ip_address: String,
    pub user_agent: String,
    /// Client-supplied stable device identifier, when the client sends one.
    pub device_id: Option<String>,
}

impl DeviceContext {
    pub fn new(ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            user_agent: user_agent.into(),
            device_id: None,
        }
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn profile(&self) -> DeviceProfile {
        DeviceProfile::derive(self)
    }
}

/// Stable device facts persisted on a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    pub device_id: String,
    pub user_agent_hash: String,
    /// Hash of user agent and device id; what MFA challenges bind to.
    pub fingerprint: String,
    pub device_type: DeviceType,
}

impl DeviceProfile {
    pub fn derive(ctx: &DeviceContext) -> Self {
        let user_agent_hash = sha256_hex(&ctx.user_agent);
        let device_id = match ctx.device_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => user_agent_hash[..32].to_string(),
        };
        let fingerprint = sha256_hex(&format!("{}:{}", ctx.user_agent, device_id));

        Self {
            device_id,
            user_agent_hash,
            fingerprint,
            device_type: parse_device_type(&ctx.user_agent),
        }
    }
}

/// Coarse classification from the user agent string.
pub fn parse_device_type(user_agent: &str) -> DeviceType {
    let ua = user_agent.to_lowercase();
    if ua.is_empty() {
        DeviceType::Unknown
    } else if ua.contains("ipad") || ua.contains("tablet") || (ua.contains("android") && !ua.contains("mobile")) {
        DeviceType::Tablet
    } else if ua.contains("mobile") || ua.contains("iphone") || ua.contains("android") {
        DeviceType::Mobile
    } else if ua.contains("windows") || ua.contains("macintosh") || ua.contains("linux") || ua.contains("x11") {
        DeviceType::Desktop
    } else {
        DeviceType::Unknown
    }
}

fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Mobile/15E148";
    const IPAD: &str = "Mozilla/5.0 (iPad; CPU OS 17_0 like Mac OS X)";
    const ANDROID_TABLET: &str = "Mozilla/5.0 (Linux; Android 14; SM-X710)";
    const DESKTOP: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/126.0";

    #[test]
    fn test_parse_device_type() {
        assert_eq!(parse_device_type(IPHONE), DeviceType::Mobile);
        assert_eq!(parse_device_type(IPAD), DeviceType::Tablet);
        assert_eq!(parse_device_type(ANDROID_TABLET), DeviceType::Tablet);
        assert_eq!(parse_device_type(DESKTOP), DeviceType::Desktop);
        assert_eq!(parse_device_type(""), DeviceType::Unknown);
        assert_eq!(parse_device_type("curl/8.0"), DeviceType::Unknown);
    }

    #[test]
    fn test_device_id_falls_back_to_user_agent_hash() {
        let a = DeviceContext::new("1.1.1.1", DESKTOP).profile();
        let b = DeviceContext::new("2.2.2.2", DESKTOP).profile();

        assert_eq!(a.device_id, b.device_id);
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.device_id.len(), 32);
    }

    #[test]
    fn test_client_device_id_changes_fingerprint() {
        let plain = DeviceContext::new("1.1.1.1", DESKTOP).profile();
        let named = DeviceContext::new("1.1.1.1", DESKTOP)
            .with_device_id("laptop-7")
            .profile();

        assert_eq!(named.device_id, "laptop-7");
        assert_eq!(named.user_agent_hash, plain.user_agent_hash);
        assert_ne!(named.fingerprint, plain.fingerprint);
    }
}
