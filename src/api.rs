use crate::config::ClientConfig;
use crate::protocol::{CreateSessionRequest, SaveResultRequest, SessionCreateResponse};
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::error::Error;
use tracing::debug;

type ClientResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// REST side of the optimization API: creates sessions and stores results.
/// Streaming goes through [`crate::session::OptimizeSession`].
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    token: Option<String>,
    http: HttpClient,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> ClientResult<Self> {
        let http = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            base_url: config.api_base.clone(),
            token: config.token.clone(),
            http,
        })
    }

    pub async fn create_session(&self, request: &CreateSessionRequest) -> ClientResult<String> {
        let response = self
            .authorize(
                self.http
                    .post(format!("{}/api/optimize/sessions", self.base_url)),
            )
            .json(request)
            .send()
            .await?;

        let response = check_status(response, "Failed to create session").await?;
        let body: SessionCreateResponse = response.json().await?;
        debug!("Created optimization session {}", body.session_id);
        Ok(body.session_id)
    }

    pub async fn save_result(&self, session_id: &str, result: &Value) -> ClientResult<()> {
        let request = SaveResultRequest {
            result: result.clone(),
        };
        let response = self
            .authorize(self.http.post(self.result_url(session_id)))
            .json(&request)
            .send()
            .await?;

        check_status(response, "Failed to save result").await?;
        Ok(())
    }

    /// `None` when nothing has been saved for the session.
    pub async fn fetch_result(&self, session_id: &str) -> ClientResult<Option<Value>> {
        let response = self
            .authorize(self.http.get(self.result_url(session_id)))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = check_status(response, "Failed to fetch result").await?;
        let body: SaveResultRequest = response.json().await?;
        Ok(Some(body.result))
    }

    fn result_url(&self, session_id: &str) -> String {
        format!(
            "{}/api/optimize/sessions/{}/result",
            self.base_url, session_id
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn check_status(response: Response, context: &str) -> ClientResult<Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(format!("{}: {} - {}", context, status, body).into())
}
