//! VLESS connection URIs
//!
//! `vless://<uuid>@<host>:<port>?security=reality&encryption=none&pbk=<key>&fp=chrome&type=tcp&flow=xtls-rprx-vision&sni=<sni>&sid=<shortId>#<name>`

use crate::config::{ConfigError, RealityParams};
use reqwest::Url;

/// Builds connection URIs for one endpoint server
#[derive(Debug, Clone)]
pub struct LinkBuilder {
    base: Url,
    public_key: String,
    sni: String,
}

impl LinkBuilder {
    pub fn new(params: &RealityParams) -> Result<Self, ConfigError> {
        if params.host.is_empty() {
            return Err(ConfigError::Missing("SERVER_IP"));
        }
        let raw = format!("vless://client@{}:{}", params.host, params.port);
        let base = Url::parse(&raw).map_err(|_| ConfigError::Invalid {
            name: "SERVER_IP",
            value: params.host.clone(),
        })?;

        Ok(Self {
            base,
            public_key: params.public_key.clone(),
            sni: params.sni.clone(),
        })
    }

    /// Query values are form-urlencoded, the display name percent-encoded
    pub fn build(&self, client_id: &str, short_id: &str, display_name: &str) -> String {
        let mut url = self.base.clone();
        // Cannot fail: the base always has a host
        let _ = url.set_username(client_id);
        url.query_pairs_mut()
            .append_pair("security", "reality")
            .append_pair("encryption", "none")
            .append_pair("pbk", &self.public_key)
            .append_pair("fp", "chrome")
            .append_pair("type", "tcp")
            .append_pair("flow", "xtls-rprx-vision")
            .append_pair("sni", &self.sni)
            .append_pair("sid", short_id);
        url.set_fragment(Some(display_name));
        url.to_string()
    }
}
