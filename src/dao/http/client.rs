use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::{Client, Method};
use serde::{Serialize, de::DeserializeOwned};

use crate::dao::{
    api::{ApiResult, AssessmentApi},
    models::{
        AttemptStatusEntity, SaveAnswerRequest, StartedAttemptEntity, SubmitRequest,
        SubmitResultEntity,
    },
};

use super::{
    config::ApiConfig,
    error::{HttpApiError, HttpResult},
};

/// [`AssessmentApi`] implementation speaking JSON over HTTP.
#[derive(Clone)]
pub struct HttpAssessmentApi {
    client: Client,
    base_url: Arc<str>,
    token: Option<Arc<str>>,
}

impl HttpAssessmentApi {
    /// Build a client for the configured server. No request is sent until the first call.
    pub fn connect(config: ApiConfig) -> HttpResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|source| HttpApiError::ClientBuilder { source })?;

        Ok(Self {
            client,
            base_url: Arc::<str>::from(config.base_url.trim_end_matches('/')),
            token: config.token.map(Arc::<str>::from),
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url, path);
        let builder = self.client.request(method, url);
        if let Some(ref token) = self.token {
            builder.bearer_auth(token.as_ref())
        } else {
            builder
        }
    }

    async fn send_json<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> HttpResult<T>
    where
        B: ?Sized + Serialize,
        T: DeserializeOwned,
    {
        let response = self.send(method, path, body).await?;
        response
            .json::<T>()
            .await
            .map_err(|source| HttpApiError::DecodeResponse {
                path: path.to_string(),
                source,
            })
    }

    async fn send<B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> HttpResult<reqwest::Response>
    where
        B: ?Sized + Serialize,
    {
        let mut builder = self.request(method, path);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|source| HttpApiError::RequestSend {
                path: path.to_string(),
                source,
            })?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(HttpApiError::RequestStatus {
                path: path.to_string(),
                status: response.status(),
            })
        }
    }
}

impl AssessmentApi for HttpAssessmentApi {
    fn start_attempt(
        &self,
        assessment_id: &str,
    ) -> BoxFuture<'static, ApiResult<StartedAttemptEntity>> {
        let api = self.clone();
        let path = format!("assessments/{assessment_id}/attempts");
        Box::pin(async move {
            api.send_json::<(), _>(Method::POST, &path, None)
                .await
                .map_err(Into::into)
        })
    }

    fn save_answer(
        &self,
        attempt_id: &str,
        answer: SaveAnswerRequest,
    ) -> BoxFuture<'static, ApiResult<()>> {
        let api = self.clone();
        let path = format!("attempts/{attempt_id}/answers/{}", answer.question_id);
        Box::pin(async move {
            api.send(Method::PUT, &path, Some(&answer))
                .await
                .map(|_| ())
                .map_err(Into::into)
        })
    }

    fn get_attempt_status(
        &self,
        attempt_id: &str,
    ) -> BoxFuture<'static, ApiResult<AttemptStatusEntity>> {
        let api = self.clone();
        let path = format!("attempts/{attempt_id}");
        Box::pin(async move {
            api.send_json::<(), _>(Method::GET, &path, None)
                .await
                .map_err(Into::into)
        })
    }

    fn submit_attempt(
        &self,
        attempt_id: &str,
        auto_submit: bool,
    ) -> BoxFuture<'static, ApiResult<SubmitResultEntity>> {
        let api = self.clone();
        let path = format!("attempts/{attempt_id}/submit");
        Box::pin(async move {
            api.send_json(Method::POST, &path, Some(&SubmitRequest { auto_submit }))
                .await
                .map_err(Into::into)
        })
    }
}
