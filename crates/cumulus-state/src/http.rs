//! REST-backed repository talking to the resource API.
//!
//! Resources are exchanged as JSON using the wire shape of [`crate::types`].
//! Filtering on query predicates happens client-side after listing the
//! scoped collection.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::repository::{ComputeQuery, ComputeScope, ExperimentQuery, ResourceRepository};
use crate::types::*;

/// Resource API client using basic authentication.
#[derive(Clone)]
pub struct HttpRepository {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpRepository {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> StateResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| StateError::Http(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .basic_auth(&self.username, Some(&self.password))
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn send(&self, builder: RequestBuilder) -> StateResult<Response> {
        self.authed(builder)
            .send()
            .await
            .map_err(|e| StateError::Http(e.to_string()))
    }

    /// GET a resource; a 404 reads as `None`.
    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> StateResult<Option<T>> {
        debug!(path, "GET");
        let response = self.send(self.client.get(self.url(path))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(response).await.map(Some)
    }

    async fn get_required<T: DeserializeOwned>(&self, path: &str) -> StateResult<T> {
        self.get_optional(path)
            .await?
            .ok_or_else(|| StateError::NotFound(path.to_string()))
    }

    async fn get_list<T: DeserializeOwned>(&self, path: &str) -> StateResult<Vec<T>> {
        Ok(self.get_optional(path).await?.unwrap_or_default())
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> StateResult<T> {
        debug!(path, "POST");
        let response = self.send(self.client.post(self.url(path)).json(body)).await?;
        decode(response).await
    }

    async fn put<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> StateResult<T> {
        debug!(path, "PUT");
        let response = self.send(self.client.put(self.url(path)).json(body)).await?;
        decode(response).await
    }

    /// DELETE a resource; a 404 reads as `false`.
    async fn delete(&self, path: &str) -> StateResult<bool> {
        debug!(path, "DELETE");
        let response = self.send(self.client.delete(self.url(path))).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(api_error(status, response).await),
        }
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> StateResult<T> {
    let status = response.status();
    if !status.is_success() {
        return Err(api_error(status, response).await);
    }
    response
        .json()
        .await
        .map_err(|e| StateError::Deserialize(e.to_string()))
}

async fn api_error(status: StatusCode, response: Response) -> StateError {
    let message = response.text().await.unwrap_or_default();
    StateError::Api {
        status: status.as_u16(),
        message,
    }
}

#[derive(Serialize)]
struct StatusUpdate {
    status: ExperimentStatus,
}

#[async_trait]
impl ResourceRepository for HttpRepository {
    async fn find_experiments(&self, query: &ExperimentQuery) -> StateResult<Vec<Experiment>> {
        let all: Vec<Experiment> = self.get_list("/experiments").await?;
        Ok(all.into_iter().filter(|e| query.matches(e)).collect())
    }

    async fn submit_experiment(&self, spec: &ExperimentSpec) -> StateResult<Experiment> {
        self.post("/experiments", spec).await
    }

    async fn reload_experiment(&self, id: &str) -> StateResult<Experiment> {
        self.get_required(&format!("/experiments/{id}")).await
    }

    async fn update_experiment_status(
        &self,
        id: &str,
        status: ExperimentStatus,
    ) -> StateResult<Experiment> {
        self.put(&format!("/experiments/{id}"), &StatusUpdate { status })
            .await
    }

    async fn delete_experiment(&self, id: &str) -> StateResult<bool> {
        self.delete(&format!("/experiments/{id}")).await
    }

    async fn find_location(&self, name: &str) -> StateResult<Option<Location>> {
        self.get_optional(&format!("/locations/{name}")).await
    }

    async fn storages(&self, location: &str) -> StateResult<Vec<Storage>> {
        self.get_list(&format!("/locations/{location}/storages"))
            .await
    }

    async fn networks(&self, location: &str) -> StateResult<Vec<Network>> {
        self.get_list(&format!("/locations/{location}/networks"))
            .await
    }

    async fn experiment_networks(&self, experiment: &str) -> StateResult<Vec<Network>> {
        self.get_list(&format!("/experiments/{experiment}/networks"))
            .await
    }

    async fn submit_network(&self, experiment: &str, spec: &NetworkSpec) -> StateResult<Network> {
        self.post(&format!("/experiments/{experiment}/networks"), spec)
            .await
    }

    async fn find_computes(&self, query: &ComputeQuery) -> StateResult<Vec<ComputeResource>> {
        let path = match &query.scope {
            ComputeScope::Experiment(id) => format!("/experiments/{id}/computes"),
            ComputeScope::Location(id) => format!("/locations/{id}/computes"),
        };
        let all: Vec<ComputeResource> = self.get_list(&path).await?;
        Ok(all.into_iter().filter(|c| query.matches(c)).collect())
    }

    async fn submit_compute(
        &self,
        experiment: &str,
        spec: &ComputeSpec,
    ) -> StateResult<ComputeResource> {
        self.post(&format!("/experiments/{experiment}/computes"), spec)
            .await
    }

    async fn reload_compute(&self, compute: &ComputeResource) -> StateResult<ComputeResource> {
        self.get_required(&compute_path(compute)).await
    }

    async fn delete_compute(&self, compute: &ComputeResource) -> StateResult<bool> {
        self.delete(&compute_path(compute)).await
    }
}

fn compute_path(compute: &ComputeResource) -> String {
    format!("/locations/{}/computes/{}", compute.location, compute.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let repo = HttpRepository::new("https://api.example.org/", "alice", "secret").unwrap();
        assert_eq!(repo.base_url(), "https://api.example.org");
        assert_eq!(repo.url("/experiments"), "https://api.example.org/experiments");
    }

    #[test]
    fn compute_paths_are_location_scoped() {
        let compute = ComputeResource {
            id: "42".to_string(),
            name: "server-experiment7".to_string(),
            state: ComputeState::Active,
            nic: Vec::new(),
            disk: Vec::new(),
            location: "de-hlrs".to_string(),
            experiment: "7".to_string(),
            instance_type: "small".to_string(),
            context: BTreeMap::new(),
        };
        assert_eq!(compute_path(&compute), "/locations/de-hlrs/computes/42");
    }

    #[test]
    fn status_update_body() {
        let body = serde_json::to_string(&StatusUpdate {
            status: ExperimentStatus::Running,
        })
        .unwrap();
        assert_eq!(body, r#"{"status":"running"}"#);
    }
}
