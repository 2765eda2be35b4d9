//! IP → geo resolution, abstracted behind a trait so the pipeline can be
//! tested without a live geolocation provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeoResolution {
    pub country_code: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub timezone: Option<String>,
    pub is_private_ip: bool,
}

impl GeoResolution {
    pub fn private(ip_address: &str) -> Self {
        let _ = ip_address;
        Self {
            country_code: None,
            country: None,
            region: None,
            city: None,
            lat: None,
            lng: None,
            timezone: None,
            is_private_ip: true,
        }
    }
}

fn is_private(ip: &str) -> bool {
    std::net::IpAddr::from_str_lenient(ip)
        .map(|addr| match addr {
            std::net::IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
            std::net::IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
        })
        .unwrap_or(false)
}

trait IpAddrLenient {
    fn from_str_lenient(s: &str) -> Option<std::net::IpAddr>;
}

impl IpAddrLenient for std::net::IpAddr {
    fn from_str_lenient(s: &str) -> Option<std::net::IpAddr> {
        s.parse().ok()
    }
}

#[async_trait]
pub trait IpResolver: Send + Sync {
    async fn resolve(&self, ip_address: &str) -> anyhow::Result<GeoResolution>;
}

/// Production resolver backed by a MaxMind-style HTTP geolocation API.
pub struct HttpIpResolver {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpIpResolver {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
        })
    }
}

#[derive(Deserialize)]
struct GeoApiResponse {
    country_code: Option<String>,
    country_name: Option<String>,
    region_name: Option<String>,
    city: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    time_zone: Option<String>,
}

#[async_trait]
impl IpResolver for HttpIpResolver {
    async fn resolve(&self, ip_address: &str) -> anyhow::Result<GeoResolution> {
        if is_private(ip_address) {
            return Ok(GeoResolution::private(ip_address));
        }

        let mut request = self.client.get(format!("{}/{}", self.base_url, ip_address));
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key)]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!("geo lookup failed with status {}", response.status());
        }

        let parsed: GeoApiResponse = response.json().await?;
        Ok(GeoResolution {
            country_code: parsed.country_code,
            country: parsed.country_name,
            region: parsed.region_name,
            city: parsed.city,
            lat: parsed.latitude,
            lng: parsed.longitude,
            timezone: parsed.time_zone,
            is_private_ip: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ipv4_ranges_detected() {
        assert!(is_private("10.0.0.5"));
        assert!(is_private("192.168.1.1"));
        assert!(is_private("127.0.0.1"));
    }

    #[test]
    fn public_ipv4_is_not_private() {
        assert!(!is_private("8.8.8.8"));
    }

    #[test]
    fn unparseable_ip_defaults_to_not_private() {
        assert!(!is_private("unknown"));
    }
}
