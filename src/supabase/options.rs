use crate::types::{DEFAULT_TIMEOUT, HEARTBEAT_INTERVAL, RealtimeError, Result, VSN};
use std::time::Duration;
use url::Url;

pub const ENV_URL: &str = "SUPABASE_URL";
pub const ENV_API_KEY: &str = "SUPABASE_API_KEY";
pub const ENV_ACCESS_TOKEN: &str = "SUPABASE_ACCESS_TOKEN";

/// Connection settings for a Supabase project.
#[derive(Debug, Clone, Default)]
pub struct SupabaseOptions {
    /// e.g. `https://abc.supabase.co`
    pub project_url: String,
    pub api_key: String,
    /// User JWT. Falls back to the API key when absent.
    pub access_token: Option<String>,
    /// Socket heartbeat interval in milliseconds
    pub heartbeat_interval: Option<u64>,
    /// REST request timeout in milliseconds
    pub timeout: Option<u64>,
}

impl SupabaseOptions {
    pub fn new(project_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            project_url: project_url.into(),
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    /// Reads `SUPABASE_URL`, `SUPABASE_API_KEY` and the optional
    /// `SUPABASE_ACCESS_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let required = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| RealtimeError::Auth(format!("{} is not set", name)))
        };
        Ok(Self {
            project_url: required(ENV_URL)?,
            api_key: required(ENV_API_KEY)?,
            access_token: std::env::var(ENV_ACCESS_TOKEN).ok().filter(|t| !t.is_empty()),
            ..Default::default()
        })
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval.unwrap_or(HEARTBEAT_INTERVAL))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout.unwrap_or(DEFAULT_TIMEOUT))
    }

    /// Token sent as the bearer credential.
    pub fn bearer(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.api_key)
    }

    /// WebSocket endpoint of the realtime service, with query parameters.
    pub fn realtime_url(&self) -> Result<Url> {
        let mut url = self.base_url()?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| RealtimeError::Connection(format!("Cannot use {} for realtime", scheme)))?;
        url.set_path("/realtime/v1/websocket");
        url.query_pairs_mut()
            .append_pair("apikey", &self.api_key)
            .append_pair("vsn", VSN);
        Ok(url)
    }

    /// PostgREST base endpoint, without a trailing slash.
    pub fn rest_endpoint(&self) -> Result<String> {
        let mut url = self.base_url()?;
        url.set_path("/rest/v1");
        url.set_query(None);
        Ok(url.to_string().trim_end_matches('/').to_string())
    }

    fn base_url(&self) -> Result<Url> {
        if self.api_key.is_empty() {
            return Err(RealtimeError::Auth("API key is required".to_string()));
        }
        Ok(Url::parse(self.project_url.trim_end_matches('/'))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realtime_url_from_https_project() {
        let options = SupabaseOptions::new("https://abc.supabase.co/", "anon");
        let url = options.realtime_url().unwrap();
        assert_eq!(
            url.as_str(),
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
    }

    #[test]
    fn test_local_project_uses_plain_ws() {
        let options = SupabaseOptions::new("http://localhost:54321", "anon");
        assert_eq!(options.realtime_url().unwrap().scheme(), "ws");
        assert_eq!(
            options.rest_endpoint().unwrap(),
            "http://localhost:54321/rest/v1"
        );
    }

    #[test]
    fn test_missing_api_key_is_an_auth_error() {
        let options = SupabaseOptions::new("https://abc.supabase.co", "");
        assert!(matches!(options.realtime_url(), Err(RealtimeError::Auth(_))));
    }

    #[test]
    fn test_bearer_prefers_access_token() {
        let options = SupabaseOptions::new("https://abc.supabase.co", "anon");
        assert_eq!(options.bearer(), "anon");
        assert_eq!(options.with_access_token("jwt").bearer(), "jwt");
    }

    #[test]
    fn test_malformed_project_url() {
        let options = SupabaseOptions::new("not a url", "anon");
        assert!(matches!(options.rest_endpoint(), Err(RealtimeError::UrlParse(_))));
    }
}
