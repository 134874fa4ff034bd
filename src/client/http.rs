use std::path::Path;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;

use crate::api::{
    AvatarStatus, AvatarsResponse, ErrorResponse, HealthResponse, StartRequest, StartResponse,
    StopRequest, StopResponse, TrainRequest, TrainResponse, UploadResponse,
};
use crate::avatar::UploadKind;

use super::error::ClientError;

pub const DEFAULT_SERVER: &str = "http://127.0.0.1:8000";

/// Typed client for the control API.
pub struct SupervisorClient {
    client: Client,
    base_url: String,
}

impl SupervisorClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            // Serving starts wait out the startup grace before answering.
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        let response = self.client.get(self.url("/health")).send().await?;
        parse(response).await
    }

    pub async fn avatars(&self) -> Result<AvatarsResponse, ClientError> {
        let response = self.client.get(self.url("/avatars")).send().await?;
        parse(response).await
    }

    pub async fn start(&self, req: &StartRequest) -> Result<StartResponse, ClientError> {
        let response = self.client.post(self.url("/start")).json(req).send().await?;
        parse(response).await
    }

    pub async fn stop(&self, name: &str) -> Result<StopResponse, ClientError> {
        let req = StopRequest {
            name: name.to_string(),
        };
        let response = self.client.post(self.url("/stop")).json(&req).send().await?;
        parse(response).await
    }

    pub async fn train(&self, req: &TrainRequest) -> Result<TrainResponse, ClientError> {
        let response = self.client.post(self.url("/train")).json(req).send().await?;
        parse(response).await
    }

    pub async fn status(&self, name: &str) -> Result<AvatarStatus, ClientError> {
        let response = self
            .client
            .get(self.url(&format!("/status/{name}")))
            .send()
            .await?;
        parse(response).await
    }

    pub async fn remove_job(&self, name: &str) -> Result<(), ClientError> {
        let response = self
            .client
            .delete(self.url(&format!("/jobs/{name}")))
            .send()
            .await?;
        check(response).await.map(|_| ())
    }

    pub async fn upload(&self, kind: UploadKind, file: &Path) -> Result<UploadResponse, ClientError> {
        let bytes = tokio::fs::read(file).await?;
        let filename = file
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        let form = Form::new().part("file", Part::bytes(bytes).file_name(filename));
        let response = self
            .client
            .post(self.url(&format!("/upload/{kind}")))
            .multipart(form)
            .send()
            .await?;
        parse(response).await
    }
}

async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|err| err.error)
        .unwrap_or(body);
    Err(ClientError::Api {
        status: status.as_u16(),
        message,
    })
}

async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    Ok(check(response).await?.json::<T>().await?)
}
