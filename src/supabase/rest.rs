use super::options::SupabaseOptions;
use crate::types::{RealtimeError, Result};
use reqwest::{RequestBuilder, Response};
use serde_json::Value;

/// PostgREST calls: table writes and RPC.
#[derive(Clone)]
pub struct RestClient {
    base_endpoint: String,
    api_key: String,
    bearer: String,
    http: reqwest::Client,
}

impl RestClient {
    pub fn new(options: &SupabaseOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(options.timeout())
            .build()?;
        Ok(Self {
            base_endpoint: options.rest_endpoint()?,
            api_key: options.api_key.clone(),
            bearer: options.bearer().to_string(),
            http,
        })
    }

    /// Insert one row and return it as stored.
    pub async fn insert(&self, table: &str, row: Value) -> Result<Value> {
        let url = format!("{}/{}", self.base_endpoint, table);
        let response = self
            .post(&url)
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await?;
        let response = Self::check(response, "insert", table).await?;
        let body: Value = response.json().await?;
        tracing::debug!("Inserted row into {}", table);
        Ok(first_row(body))
    }

    /// Insert or merge on `on_conflict` columns.
    pub async fn upsert(&self, table: &str, row: Value, on_conflict: &str) -> Result<()> {
        let url = format!("{}/{}", self.base_endpoint, table);
        let response = self
            .post(&url)
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&row)
            .send()
            .await?;
        Self::check(response, "upsert", table).await?;
        Ok(())
    }

    pub async fn rpc(&self, function: &str, params: Value) -> Result<Value> {
        let url = format!("{}/rpc/{}", self.base_endpoint, function);
        let response = self.post(&url).json(&params).send().await?;
        let response = Self::check(response, "rpc", function).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    fn post(&self, url: &str) -> RequestBuilder {
        self.http
            .post(url)
            .header("Content-Type", "application/json")
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.bearer))
    }

    async fn check(response: Response, operation: &str, target: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = response.text().await.unwrap_or_default();
        Err(RealtimeError::Delivery(format!(
            "{} on '{}' failed with status {}: {}",
            operation, target, status, detail
        )))
    }
}

/// `return=representation` answers with an array of the written rows.
fn first_row(body: Value) -> Value {
    match body {
        Value::Array(mut rows) if !rows.is_empty() => rows.swap_remove(0),
        Value::Array(_) => Value::Null,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_first_row_of_representation() {
        assert_eq!(
            first_row(json!([{"id": "srv_1"}, {"id": "srv_2"}])),
            json!({"id": "srv_1"})
        );
        assert_eq!(first_row(json!([])), Value::Null);
        assert_eq!(first_row(json!({"id": "srv_3"})), json!({"id": "srv_3"}));
    }

    #[test]
    fn test_client_targets_rest_endpoint() {
        let options = SupabaseOptions::new("https://abc.supabase.co", "anon");
        let client = RestClient::new(&options).unwrap();
        assert_eq!(client.base_endpoint, "https://abc.supabase.co/rest/v1");
        assert_eq!(client.bearer, "anon");
    }
}
